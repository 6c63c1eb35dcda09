//! # unionfs-kernel
//!
//! Core of a union filesystem: several backing directory trees presented
//! as one merged namespace.
//!
//! - Directories merge: a listing is the union, by name, of every
//!   backend's listing
//! - Anything that is not a directory comes from the highest-priority
//!   backend that has the name, handed to the client as a passthrough
//! - Backends can be added and removed while clients are active; a
//!   background coordinator rebuilds the root between operations
//!
//! Layers, leaf to root: [`Chain`] (ordered backends), [`Tree`] (naming
//! tree), [`NodeCache`] (materialized directories), [`merge`]
//! (listings), [`Union`] with its lookup operations, and the
//! [`Coordinator`].

pub mod access;
pub mod cache;
pub mod chain;
pub mod config;
pub mod coordinator;
pub mod dirent;
pub mod lookup;
pub mod merge;
pub mod mountee;
pub mod node;
pub mod opener;
pub mod pattern;
pub mod resolve;
pub mod stow;
pub mod tree;
pub mod union;
pub mod vfs;

pub use access::{Access, Credentials};
pub use cache::{DEFAULT_CACHE_SIZE, NodeCache, NodeId};
pub use chain::{Backing, Chain, DEFAULT_PRIORITY};
pub use config::{ConfigError, UnionConfig};
pub use coordinator::{Coordinator, CoordinatorHandle, SuppressGuard};
pub use dirent::DirentPage;
pub use lookup::{Lookup, Passthrough};
pub use merge::{MergedEntry, merge};
pub use mountee::{Mountee, MounteeSpec, start_mountee};
pub use node::{Handle, NodeRef};
pub use opener::{BackendOpener, BackendRegistry, LocalOpener};
pub use pattern::PatternList;
pub use resolve::resolve;
pub use stow::{StowDir, StowWatcher, StowWatcherHandle};
pub use tree::{LightId, Tree};
pub use union::{Union, UnionOptions};
pub use vfs::{
    DirEntry, FileAttr, FileId, FileType, OpenFlags, SetAttr, VfsError, VfsOps, VfsResult,
    backends::{LocalBackend, MemoryBackend},
};

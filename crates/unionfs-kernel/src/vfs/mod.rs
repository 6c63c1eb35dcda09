//! Virtual Filesystem abstraction for backing filesystems.
//!
//! - [`VfsOps`] - Core trait every backing filesystem implements
//! - [`MemoryBackend`] - In-memory filesystem (scratch layers, testing)
//! - [`LocalBackend`] - Local directory tree (with path security)
//!
//! ## Design Decisions
//!
//! - **Path-based**: Operations take backend-relative paths, so a union
//!   slot is just a backend plus a path.
//! - **Identity in attributes**: [`FileAttr`] carries `(dev, ino)` so a
//!   resolution that lands on the union's own root can be detected.
//! - **Explicit offset/size**: Read/write take offset and size, so a
//!   passthrough handle needs no open-file state.

pub mod backends;
mod error;
mod ops;
mod types;

pub use backends::{LocalBackend, MemoryBackend};
pub use error::{VfsError, VfsResult};
pub use ops::VfsOps;
pub use types::{DirEntry, FileAttr, FileId, FileType, OpenFlags, SetAttr};

//! Materialized nodes.
//!
//! A materialized node is the live view of one directory across every
//! backing filesystem: one [`Slot`] per backend holding the resolved
//! handle, or nothing where the directory does not exist. Nodes are
//! owned by the [`NodeCache`](crate::cache::NodeCache); clients hold them
//! through counted [`NodeRef`]s.

use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::{NodeCache, NodeId};
use crate::resolve::resolve;
use crate::tree::LightId;
use crate::vfs::{FileAttr, FileId, OpenFlags, VfsOps, VfsResult};

/// A resolved object on one backend: the backend plus a path relative
/// to its root, with the attributes seen at resolution time.
#[derive(Clone)]
pub struct Handle {
    fs: Arc<dyn VfsOps>,
    path: PathBuf,
    attr: FileAttr,
}

impl Handle {
    pub fn new(fs: Arc<dyn VfsOps>, path: impl Into<PathBuf>, attr: FileAttr) -> Self {
        Self {
            fs,
            path: path.into(),
            attr,
        }
    }

    pub fn fs(&self) -> &Arc<dyn VfsOps> {
        &self.fs
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Attributes captured when the handle was resolved.
    pub fn attr(&self) -> &FileAttr {
        &self.attr
    }

    pub fn is_dir(&self) -> bool {
        self.attr.is_dir()
    }

    /// Path of `name` beneath this handle.
    pub fn child(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Fetch current attributes from the backend.
    pub async fn stat(&self) -> VfsResult<FileAttr> {
        self.fs.getattr(&self.path).await
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("path", &self.path)
            .field("id", &self.attr.id())
            .field("kind", &self.attr.kind)
            .finish()
    }
}

/// One backend's view of a node.
#[derive(Debug, Clone, Default)]
pub struct Slot {
    pub handle: Option<Handle>,
    /// Fixed slots are never recomputed by an update (root slots).
    pub fixed: bool,
}

impl Slot {
    pub fn fixed(handle: Handle) -> Self {
        Self {
            handle: Some(handle),
            fixed: true,
        }
    }
}

/// Mutable per-node state, guarded by the node's own lock.
#[derive(Debug)]
pub struct NodeState {
    pub(crate) slots: Vec<Slot>,
    /// Stat as of the last validation.
    pub(crate) attr: Option<FileAttr>,
    pub(crate) up_to_date: bool,
    /// Layout generation the slot array was sized for.
    pub(crate) generation: u64,
}

impl NodeState {
    pub(crate) fn new(slot_count: usize, generation: u64) -> Self {
        Self {
            slots: vec![Slot::default(); slot_count],
            attr: None,
            up_to_date: false,
            generation,
        }
    }

    /// Resize for a new backend layout, dropping every handle.
    pub(crate) fn reset_layout(&mut self, slot_count: usize, generation: u64) {
        self.slots = vec![Slot::default(); slot_count];
        self.attr = None;
        self.up_to_date = false;
        self.generation = generation;
    }

    /// Handles of valid slots, highest priority first.
    pub(crate) fn valid_handles(&self) -> Vec<Handle> {
        self.slots.iter().filter_map(|s| s.handle.clone()).collect()
    }
}

/// A counted reference to a materialized node.
///
/// Cloning adds a reference; dropping releases one. When the last
/// reference goes away the node is destroyed and its light node
/// released.
pub struct NodeRef {
    id: NodeId,
    light: LightId,
    state: Arc<Mutex<NodeState>>,
    cache: Arc<NodeCache>,
}

impl NodeRef {
    /// Wrap a reference the caller has already counted.
    pub(crate) fn from_counted(
        id: NodeId,
        light: LightId,
        state: Arc<Mutex<NodeState>>,
        cache: Arc<NodeCache>,
    ) -> Self {
        Self {
            id,
            light,
            state,
            cache,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn light(&self) -> LightId {
        self.light
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock()
    }

    pub fn slot_count(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn is_up_to_date(&self) -> bool {
        self.state.lock().up_to_date
    }

    /// Handles of valid slots, highest priority first.
    pub fn handles(&self) -> Vec<Handle> {
        self.state.lock().valid_handles()
    }

    /// Stat from the last validation, if still current.
    pub fn cached_attr(&self) -> Option<FileAttr> {
        let state = self.state.lock();
        if state.up_to_date { state.attr.clone() } else { None }
    }

    /// Force the next access to recompute the slots.
    pub fn invalidate(&self) {
        self.state.lock().up_to_date = false;
    }

    /// Bring the slot array in line with the current layout.
    pub(crate) fn ensure_layout(&self, slot_count: usize, generation: u64) {
        let mut state = self.state.lock();
        if state.generation != generation {
            tracing::debug!(
                node = %self.id,
                from = state.generation,
                to = generation,
                slots = slot_count,
                "node layout is stale, resizing"
            );
            state.reset_layout(slot_count, generation);
        }
    }

    /// Recompute every non-fixed slot by resolving `path` under each root
    /// handle. Individual failures leave the slot empty. A resolution that
    /// lands on `self_id` is a loop; it is logged and the slot is left
    /// empty so traversal cannot recurse into the union itself.
    pub(crate) async fn update(
        &self,
        path: &Path,
        roots: &[Option<Handle>],
        self_id: Option<FileId>,
    ) -> VfsResult<()> {
        let (generation, todo) = {
            let state = self.state.lock();
            if state.up_to_date {
                return Ok(());
            }
            let todo: Vec<usize> = state
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| !s.fixed)
                .map(|(i, _)| i)
                .collect();
            (state.generation, todo)
        };

        // Backend calls happen with no lock held.
        let mut resolved = Vec::with_capacity(todo.len());
        for i in todo {
            let handle = match roots.get(i) {
                Some(Some(root)) => {
                    let found = resolve(
                        root.fs(),
                        Some(root.path()),
                        path,
                        OpenFlags::read(),
                        OpenFlags::empty(),
                        0,
                    )
                    .await;
                    match found {
                        Ok(h) if Some(h.attr().id()) == self_id => {
                            tracing::warn!(
                                path = %path.display(),
                                slot = i,
                                "backend path leads back to the union root, ignoring"
                            );
                            None
                        }
                        Ok(h) => Some(h),
                        Err(e) => {
                            tracing::trace!(path = %path.display(), slot = i, error = %e, "no match");
                            None
                        }
                    }
                }
                _ => None,
            };
            resolved.push((i, handle));
        }

        let mut state = self.state.lock();
        if state.generation != generation {
            // A reinitialization replaced the layout meanwhile; the next
            // access updates against the new roots.
            return Ok(());
        }
        for (i, handle) in resolved {
            if let Some(slot) = state.slots.get_mut(i) {
                slot.handle = handle;
            }
        }
        state.up_to_date = true;
        Ok(())
    }

    /// Install root slots for a new layout.
    pub(crate) fn install_root_slots(&self, slots: Vec<Slot>, generation: u64) {
        let mut state = self.state.lock();
        state.slots = slots;
        state.generation = generation;
        state.attr = None;
        state.up_to_date = true;
    }

    pub(crate) fn set_attr(&self, attr: FileAttr) {
        self.state.lock().attr = Some(attr);
    }
}

impl Clone for NodeRef {
    fn clone(&self) -> Self {
        self.cache.ref_add(self.id);
        Self {
            id: self.id,
            light: self.light,
            state: Arc::clone(&self.state),
            cache: Arc::clone(&self.cache),
        }
    }
}

impl Drop for NodeRef {
    fn drop(&mut self) {
        self.cache.release(self.id);
    }
}

impl PartialEq for NodeRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeRef {}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRef")
            .field("id", &self.id)
            .field("light", &self.light)
            .finish()
    }
}

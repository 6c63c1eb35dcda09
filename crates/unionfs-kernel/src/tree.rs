//! Naming tree of light nodes.
//!
//! A light node stands for one directory name in the merged namespace,
//! independent of any backing filesystem. Light nodes live in an arena
//! keyed by [`LightId`] and are owned through explicit reference counts:
//!
//! - its parent holds nothing on it; each installed child holds one
//!   structural reference on its *parent*
//! - its materialized node, if any, holds one reference
//! - anyone in the middle of a lookup holds one reference
//!
//! A node is destroyed exactly when its count reaches zero. Destruction
//! detaches it from its parent and drops the structural reference it held
//! there, which may destroy the parent in turn. That cascade runs as a
//! loop over the parent chain.

use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use crate::cache::NodeId;
use crate::vfs::{VfsError, VfsResult};

/// Stable handle of a light node. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LightId(u64);

impl fmt::Display for LightId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "l{}", self.0)
    }
}

#[derive(Debug)]
struct LightNode {
    name: String,
    refs: u32,
    parent: Option<LightId>,
    children: Vec<LightId>,
    /// Weak link to the materialized node; its reference is counted in
    /// `refs`, not here.
    node: Option<NodeId>,
}

/// Arena state, only reachable with the tree lock held.
#[derive(Debug)]
pub(crate) struct TreeInner {
    nodes: HashMap<LightId, LightNode>,
    next_id: u64,
    root: LightId,
}

impl TreeInner {
    fn entry(&self, id: LightId) -> &LightNode {
        match self.nodes.get(&id) {
            Some(node) => node,
            None => panic!("light node {id} used after destruction"),
        }
    }

    fn entry_mut(&mut self, id: LightId) -> &mut LightNode {
        match self.nodes.get_mut(&id) {
            Some(node) => node,
            None => panic!("light node {id} used after destruction"),
        }
    }

    fn create(&mut self, name: &str) -> LightId {
        let id = LightId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(
            id,
            LightNode {
                name: name.to_string(),
                refs: 1,
                parent: None,
                children: Vec::new(),
                node: None,
            },
        );
        id
    }

    fn install(&mut self, parent: LightId, child: LightId) {
        assert!(
            self.entry(child).parent.is_none(),
            "light node {child} installed twice"
        );
        let dir = self.entry_mut(parent);
        dir.refs += 1;
        dir.children.push(child);
        self.entry_mut(child).parent = Some(parent);
    }

    /// Unlink `child` from its parent. Returns the parent, whose
    /// structural reference the caller must drop.
    fn detach(&mut self, child: LightId) -> Option<LightId> {
        let parent = self.entry_mut(child).parent.take()?;
        let dir = self.entry_mut(parent);
        dir.children.retain(|c| *c != child);
        Some(parent)
    }

    fn find(&self, parent: LightId, name: &str) -> Option<LightId> {
        self.entry(parent)
            .children
            .iter()
            .copied()
            .find(|c| self.entry(*c).name == name)
    }

    pub(crate) fn ref_add(&mut self, id: LightId) {
        self.entry_mut(id).refs += 1;
    }

    /// Drop one reference, destroying every node whose count reaches
    /// zero. Returns the destroyed ids, innermost first.
    pub(crate) fn ref_remove(&mut self, id: LightId) -> Vec<LightId> {
        let mut destroyed = Vec::new();
        let mut pending = Some(id);

        while let Some(id) = pending.take() {
            let node = self.entry_mut(id);
            assert!(node.refs > 0, "light node {id} over-released");
            node.refs -= 1;
            if node.refs > 0 {
                break;
            }
            if id == self.root {
                panic!("root light node released");
            }

            pending = self.detach(id);
            if let Some(node) = self.nodes.remove(&id) {
                debug_assert!(node.children.is_empty());
                debug_assert!(node.node.is_none());
                tracing::trace!(light = %id, name = %node.name, "destroyed light node");
            }
            destroyed.push(id);
        }
        destroyed
    }

    pub(crate) fn node(&self, id: LightId) -> Option<NodeId> {
        self.entry(id).node
    }

    pub(crate) fn set_node(&mut self, id: LightId, node: Option<NodeId>) {
        self.entry_mut(id).node = node;
    }

    fn path_construct(&self, id: LightId) -> PathBuf {
        let mut names = Vec::new();
        let mut current = self.entry(id);
        while let Some(parent) = current.parent {
            names.push(current.name.as_str());
            current = self.entry(parent);
        }
        names.iter().rev().collect()
    }
}

/// The naming tree. One lock guards the whole arena.
#[derive(Debug)]
pub struct Tree {
    inner: Mutex<TreeInner>,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    /// Create a tree holding only the root, which the tree itself keeps
    /// one reference on for its whole life.
    pub fn new() -> Self {
        let mut inner = TreeInner {
            nodes: HashMap::new(),
            next_id: 1,
            root: LightId(0),
        };
        inner.root = inner.create("");
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Lock the arena. Lock order: tree before node state before cache.
    pub(crate) fn lock(&self) -> MutexGuard<'_, TreeInner> {
        self.inner.lock()
    }

    pub fn root(&self) -> LightId {
        self.inner.lock().root
    }

    /// Allocate an unattached light node holding one reference for the
    /// caller.
    pub fn create(&self, name: &str) -> LightId {
        self.inner.lock().create(name)
    }

    /// Link `child` under `parent`, adding a structural reference to the
    /// parent.
    pub fn install(&self, parent: LightId, child: LightId) {
        self.inner.lock().install(parent, child);
    }

    /// Reverse of [`install`](Self::install). Dropping the parent's
    /// structural reference may destroy it.
    pub fn uninstall(&self, child: LightId) -> Vec<LightId> {
        let mut inner = self.inner.lock();
        match inner.detach(child) {
            Some(parent) => inner.ref_remove(parent),
            None => Vec::new(),
        }
    }

    pub fn ref_add(&self, id: LightId) {
        self.inner.lock().ref_add(id);
    }

    /// Drop a reference. Returns every light node destroyed as a result.
    pub fn ref_remove(&self, id: LightId) -> Vec<LightId> {
        self.inner.lock().ref_remove(id)
    }

    /// Find the child called `name`, adding a reference to it.
    pub fn get(&self, parent: LightId, name: &str) -> VfsResult<LightId> {
        let mut inner = self.inner.lock();
        let child = inner
            .find(parent, name)
            .ok_or_else(|| VfsError::not_found(name))?;
        inner.ref_add(child);
        Ok(child)
    }

    /// [`get`](Self::get), or create and install the child if it does not
    /// exist yet. Either way the caller owns one reference.
    pub fn get_or_install(&self, parent: LightId, name: &str) -> LightId {
        let mut inner = self.inner.lock();
        if let Some(child) = inner.find(parent, name) {
            inner.ref_add(child);
            return child;
        }
        let child = inner.create(name);
        inner.install(parent, child);
        child
    }

    /// Find a child without taking a reference.
    pub fn lookup_child(&self, parent: LightId, name: &str) -> Option<LightId> {
        self.inner.lock().find(parent, name)
    }

    /// Slash-joined path from the root. The root contributes nothing, so
    /// it maps to the empty path.
    pub fn path_construct(&self, id: LightId) -> PathBuf {
        self.inner.lock().path_construct(id)
    }

    pub fn parent(&self, id: LightId) -> Option<LightId> {
        self.inner.lock().entry(id).parent
    }

    /// Name of a live node.
    pub fn name(&self, id: LightId) -> Option<String> {
        self.inner.lock().nodes.get(&id).map(|n| n.name.clone())
    }

    /// Reference count, or `None` once destroyed.
    pub fn refs(&self, id: LightId) -> Option<u32> {
        self.inner.lock().nodes.get(&id).map(|n| n.refs)
    }

    pub fn contains(&self, id: LightId) -> bool {
        self.inner.lock().nodes.contains_key(&id)
    }

    /// Materialized node linked to `id`, if any.
    pub fn node(&self, id: LightId) -> Option<NodeId> {
        self.inner.lock().node(id)
    }

    /// Number of live light nodes, root included.
    pub fn len(&self) -> usize {
        self.inner.lock().nodes.len()
    }
}

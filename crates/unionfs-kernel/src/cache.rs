//! Bounded LRU cache of materialized nodes.
//!
//! The cache owns the node table: every live materialized node has an
//! entry here with its reference count, whether or not it is currently
//! a member of the LRU chain. Membership of the chain holds exactly one
//! counted reference, so eviction rather than a client release is what
//! usually destroys a node.
//!
//! Lock order: tree, then node state, then cache. The cache lock is never
//! held while calling into the tree; releases collect their work under
//! the cache lock and finish after dropping it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::node::{NodeRef, NodeState};
use crate::tree::{LightId, Tree};

/// Default maximum number of cached nodes.
pub const DEFAULT_CACHE_SIZE: usize = 256;

/// Stable handle of a materialized node. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Debug)]
struct NodeEntry {
    light: LightId,
    refs: u32,
    state: Arc<Mutex<NodeState>>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    prev: Option<NodeId>,
    next: Option<NodeId>,
}

/// Doubly linked MRU→LRU chain, linked by node id.
#[derive(Debug, Default)]
struct Lru {
    links: HashMap<NodeId, Link>,
    head: Option<NodeId>,
    tail: Option<NodeId>,
}

impl Lru {
    fn contains(&self, id: NodeId) -> bool {
        self.links.contains_key(&id)
    }

    fn len(&self) -> usize {
        self.links.len()
    }

    fn unlink(&mut self, id: NodeId) -> bool {
        let Some(link) = self.links.remove(&id) else {
            return false;
        };
        match link.prev {
            Some(prev) => {
                if let Some(l) = self.links.get_mut(&prev) {
                    l.next = link.next;
                }
            }
            None => self.head = link.next,
        }
        match link.next {
            Some(next) => {
                if let Some(l) = self.links.get_mut(&next) {
                    l.prev = link.prev;
                }
            }
            None => self.tail = link.prev,
        }
        true
    }

    fn push_front(&mut self, id: NodeId) {
        let link = Link {
            prev: None,
            next: self.head,
        };
        if let Some(old) = self.head {
            if let Some(l) = self.links.get_mut(&old) {
                l.prev = Some(id);
            }
        }
        self.head = Some(id);
        if self.tail.is_none() {
            self.tail = Some(id);
        }
        self.links.insert(id, link);
    }

    fn pop_back(&mut self) -> Option<NodeId> {
        let tail = self.tail?;
        self.unlink(tail);
        Some(tail)
    }

    fn order(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while let Some(id) = cursor {
            out.push(id);
            cursor = self.links.get(&id).and_then(|l| l.next);
        }
        out
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    nodes: HashMap<NodeId, NodeEntry>,
    lru: Lru,
    next_id: u64,
}

/// Node table plus LRU chain.
#[derive(Debug)]
pub struct NodeCache {
    tree: Arc<Tree>,
    max: AtomicUsize,
    inner: Mutex<CacheInner>,
}

impl NodeCache {
    pub fn new(tree: Arc<Tree>, max: usize) -> Self {
        Self {
            tree,
            max: AtomicUsize::new(max),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    /// Materialized node for `light`, creating it if there is none.
    ///
    /// A new node gets `slot_count` empty slots sized for `generation`
    /// and takes a reference on its light node. Either way the returned
    /// reference is counted.
    pub fn lookup(self: &Arc<Self>, light: LightId, slot_count: usize, generation: u64) -> NodeRef {
        let mut tree = self.tree.lock();
        let mut inner = self.inner.lock();

        if let Some(id) = tree.node(light) {
            // The entry may be gone if its last release is between
            // dropping the cache lock and clearing the link.
            if let Some(entry) = inner.nodes.get_mut(&id) {
                entry.refs += 1;
                let state = Arc::clone(&entry.state);
                return NodeRef::from_counted(id, light, state, Arc::clone(self));
            }
        }

        let id = NodeId(inner.next_id);
        inner.next_id += 1;
        let state = Arc::new(Mutex::new(NodeState::new(slot_count, generation)));
        inner.nodes.insert(
            id,
            NodeEntry {
                light,
                refs: 1,
                state: Arc::clone(&state),
            },
        );
        tree.set_node(light, Some(id));
        tree.ref_add(light);
        tracing::debug!(node = %id, light = %light, slots = slot_count, "materialized node");

        NodeRef::from_counted(id, light, state, Arc::clone(self))
    }

    /// Move `node` to the front of the LRU chain, taking a cache
    /// reference if it was not a member, then evict from the tail while
    /// over the bound.
    pub fn add(&self, node: &NodeRef) {
        let id = node.id();
        let max = self.max.load(Ordering::Relaxed);
        let evicted = {
            let mut inner = self.inner.lock();
            if !inner.lru.unlink(id) {
                match inner.nodes.get_mut(&id) {
                    Some(entry) => entry.refs += 1,
                    None => panic!("node {id} cached after destruction"),
                }
            }
            inner.lru.push_front(id);

            let mut evicted = Vec::new();
            while inner.lru.len() > max {
                match inner.lru.pop_back() {
                    Some(tail) => evicted.push(tail),
                    None => break,
                }
            }
            evicted
        };

        for id in evicted {
            tracing::trace!(node = %id, "evicted node");
            self.release(id);
        }
    }

    /// Evict every member. Returns how many were evicted.
    pub fn reset(&self) -> usize {
        let members = {
            let mut inner = self.inner.lock();
            let mut members = Vec::with_capacity(inner.lru.len());
            while let Some(id) = inner.lru.pop_back() {
                members.push(id);
            }
            members
        };
        let count = members.len();
        for id in members {
            self.release(id);
        }
        count
    }

    pub(crate) fn ref_add(&self, id: NodeId) {
        match self.inner.lock().nodes.get_mut(&id) {
            Some(entry) => entry.refs += 1,
            None => panic!("node {id} referenced after destruction"),
        }
    }

    /// Drop one reference. At zero the node is destroyed, its light-node
    /// link cleared and the light node released.
    ///
    /// Destroying a node that is still linked in the LRU chain means the
    /// counts are corrupt, and panics.
    pub(crate) fn release(&self, id: NodeId) {
        let light = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.nodes.get_mut(&id) else {
                panic!("node {id} released after destruction");
            };
            entry.refs -= 1;
            if entry.refs > 0 {
                return;
            }
            if inner.lru.contains(id) {
                panic!("node {id} destroyed while still in the cache chain");
            }
            match inner.nodes.remove(&id) {
                Some(entry) => entry.light,
                None => return,
            }
        };

        let mut tree = self.tree.lock();
        if tree.node(light) == Some(id) {
            tree.set_node(light, None);
        }
        tree.ref_remove(light);
        tracing::debug!(node = %id, light = %light, "destroyed node");
    }

    /// Mark a live node stale so its next access recomputes the slots.
    pub fn invalidate(&self, id: NodeId) {
        let state = self.inner.lock().nodes.get(&id).map(|e| Arc::clone(&e.state));
        if let Some(state) = state {
            state.lock().up_to_date = false;
        }
    }

    /// Live reference count of a node, `None` once destroyed.
    pub fn refs(&self, id: NodeId) -> Option<u32> {
        self.inner.lock().nodes.get(&id).map(|e| e.refs)
    }

    pub fn is_cached(&self, id: NodeId) -> bool {
        self.inner.lock().lru.contains(id)
    }

    /// Number of nodes in the LRU chain.
    pub fn resident(&self) -> usize {
        self.inner.lock().lru.len()
    }

    /// Number of live materialized nodes, cached or not.
    pub fn live(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    /// Node ids from most to least recently used.
    pub fn order(&self) -> Vec<NodeId> {
        self.inner.lock().lru.order()
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::Relaxed)
    }
}

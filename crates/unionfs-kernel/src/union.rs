//! The union: root node, layout generations and the reader/writer gate.
//!
//! Every client operation holds the gate for reading for its whole
//! duration. A reinitialization pass holds it for writing, so it never
//! observes a half-finished lookup and lookups never observe a
//! half-built root.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use crate::access::{self, Access, Credentials};
use crate::cache::{DEFAULT_CACHE_SIZE, NodeCache};
use crate::chain::{Backing, Chain};
use crate::dirent::{self, DirentPage};
use crate::merge::{MergedEntry, merge};
use crate::node::{Handle, NodeRef, Slot};
use crate::opener::{BackendOpener, LocalOpener};
use crate::tree::Tree;
use crate::vfs::{FileAttr, FileId, FileType, VfsError, VfsOps, VfsResult};

/// Inode number reported for the union root.
pub const ROOT_INO: u64 = 1;

/// Bound on prune-and-retry rounds in one reinitialization pass.
const MAX_INIT_ATTEMPTS: usize = 8;

/// Construction options for a [`Union`].
#[derive(Clone)]
pub struct UnionOptions {
    pub cache_size: usize,
    /// Identity of the union's own root, for loop detection. Defaults to
    /// the root of the underlying source.
    pub self_id: Option<FileId>,
    /// The translator's own underlying source, used by chain entries
    /// without a path.
    pub underlying: Option<Arc<dyn VfsOps>>,
    pub opener: Arc<dyn BackendOpener>,
    pub debug: bool,
}

impl Default for UnionOptions {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_CACHE_SIZE,
            self_id: None,
            underlying: None,
            opener: Arc::new(LocalOpener),
            debug: false,
        }
    }
}

impl UnionOptions {
    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    pub fn with_underlying(mut self, fs: Arc<dyn VfsOps>) -> Self {
        self.underlying = Some(fs);
        self
    }

    pub fn with_opener(mut self, opener: Arc<dyn BackendOpener>) -> Self {
        self.opener = opener;
        self
    }

    pub fn with_self_id(mut self, id: FileId) -> Self {
        self.self_id = Some(id);
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

impl std::fmt::Debug for UnionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnionOptions")
            .field("cache_size", &self.cache_size)
            .field("self_id", &self.self_id)
            .field("underlying", &self.underlying.is_some())
            .field("debug", &self.debug)
            .finish()
    }
}

/// A merged view over the chain of backing filesystems.
pub struct Union {
    pub(crate) chain: Arc<Chain>,
    pub(crate) tree: Arc<Tree>,
    pub(crate) cache: Arc<NodeCache>,
    pub(crate) root: NodeRef,
    pub(crate) gate: RwLock<()>,
    generation: AtomicU64,
    pub(crate) self_id: Option<FileId>,
    underlying: Option<Arc<dyn VfsOps>>,
    opener: Arc<dyn BackendOpener>,
    debug: bool,
}

impl Union {
    /// Build a union over `chain` and open every registered backend.
    ///
    /// Startup is strict: a backend that cannot be opened is an error
    /// here, while later reinitialization passes prune it instead.
    pub async fn new(chain: Arc<Chain>, options: UnionOptions) -> VfsResult<Arc<Self>> {
        let self_id = match (options.self_id, &options.underlying) {
            (Some(id), _) => Some(id),
            (None, Some(fs)) => Some(fs.getattr(Path::new("")).await?.id()),
            (None, None) => None,
        };

        let tree = Arc::new(Tree::new());
        let cache = Arc::new(NodeCache::new(Arc::clone(&tree), options.cache_size));
        let root = cache.lookup(tree.root(), 0, 0);

        let union = Arc::new(Self {
            chain,
            tree,
            cache,
            root,
            gate: RwLock::new(()),
            generation: AtomicU64::new(0),
            self_id,
            underlying: options.underlying,
            opener: options.opener,
            debug: options.debug,
        });

        union.init_root().await?;
        tracing::info!(
            backends = union.root.slot_count(),
            cache_size = options.cache_size,
            "union initialized"
        );
        Ok(union)
    }

    pub fn chain(&self) -> &Arc<Chain> {
        &self.chain
    }

    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    pub fn cache(&self) -> &Arc<NodeCache> {
        &self.cache
    }

    /// The root node. It is never cached or evicted.
    pub fn root(&self) -> NodeRef {
        self.root.clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn self_id(&self) -> Option<FileId> {
        self.self_id
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    async fn open_backing(&self, backing: &Backing) -> VfsResult<Arc<dyn VfsOps>> {
        match backing.path() {
            Some(path) => self.opener.open(path).await,
            None => self
                .underlying
                .clone()
                .ok_or_else(|| VfsError::not_found("<underlying>")),
        }
    }

    /// Open a chain entry and stat its root, which must be a directory.
    async fn open_root(&self, backing: &Backing) -> VfsResult<Handle> {
        let fs = self.open_backing(backing).await?;
        let attr = fs.getattr(Path::new("")).await?;
        if !attr.is_dir() {
            return Err(VfsError::not_a_directory(backing.to_string()));
        }
        Ok(Handle::new(fs, "", attr))
    }

    /// Open every chain entry and install them as the root's fixed slots
    /// under a new generation.
    async fn init_root(&self) -> VfsResult<()> {
        let entries = self.chain.entries();
        let mut slots = Vec::with_capacity(entries.len());
        for backing in &entries {
            slots.push(Slot::fixed(self.open_root(backing).await?));
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.root.install_root_slots(slots, generation);
        tracing::debug!(generation, backends = entries.len(), "root slots installed");
        Ok(())
    }

    /// Drop chain entries whose backend can no longer be opened or whose
    /// root is no longer a usable directory.
    async fn prune(&self) -> usize {
        let mut pruned = 0;
        for backing in self.chain.entries() {
            if let Err(e) = self.open_root(&backing).await {
                tracing::warn!(backend = %backing, error = %e, "backing filesystem unreachable, removing");
                if self.chain.remove_seq(backing.seq()).is_some() {
                    pruned += 1;
                }
            }
        }
        pruned
    }

    /// Rebuild the root from the current chain and flush the cache.
    ///
    /// Takes the gate for writing, waiting for in-flight operations.
    pub async fn reinitialize(&self) -> VfsResult<()> {
        let _gate = self.gate.write().await;

        let mut attempts = 0;
        let result = loop {
            attempts += 1;
            self.prune().await;
            match self.init_root().await {
                Err(e) if attempts < MAX_INIT_ATTEMPTS => {
                    tracing::debug!(error = %e, attempts, "backend failed during reinitialization, retrying");
                }
                other => break other,
            }
        };

        if let Err(e) = &result {
            tracing::error!(error = %e, "reinitialization failed");
        }

        let evicted = self.cache.reset();
        tracing::info!(
            generation = self.generation(),
            backends = self.root.slot_count(),
            evicted,
            "reinitialized union root"
        );
        result
    }

    /// Slot count and generation every node must match.
    pub(crate) fn layout(&self) -> (usize, u64) {
        let state = self.root.state();
        (state.slots.len(), state.generation)
    }

    /// Root handles by slot index.
    pub(crate) fn root_handles(&self) -> Vec<Option<Handle>> {
        self.root.state().slots.iter().map(|s| s.handle.clone()).collect()
    }

    /// Bring a node up to date with the current layout and stat it.
    pub(crate) async fn validate_stat(&self, node: &NodeRef) -> VfsResult<FileAttr> {
        if *node == self.root {
            let attr = self.root_stat().await?;
            node.set_attr(attr.clone());
            return Ok(attr);
        }

        let (slot_count, generation) = self.layout();
        node.ensure_layout(slot_count, generation);
        let path = self.tree.path_construct(node.light());
        if !node.is_up_to_date() {
            node.update(&path, &self.root_handles(), self.self_id).await?;
        }

        let handles = node.handles();
        let Some(first) = handles.first() else {
            return Err(VfsError::not_found(path.display().to_string()));
        };
        let attr = first.stat().await?;
        node.set_attr(attr.clone());
        Ok(attr)
    }

    async fn root_stat(&self) -> VfsResult<FileAttr> {
        let handles = self.root.handles();
        let mut attr = match &self.underlying {
            Some(fs) => fs.getattr(Path::new("")).await?,
            None => match handles.first() {
                Some(h) => h.attr().clone(),
                None => FileAttr::directory(0o755),
            },
        };
        let entries = merge(&handles).await?;
        attr.ino = ROOT_INO;
        attr.kind = FileType::Directory;
        attr.size = dirent::listing_size(&entries);
        Ok(attr)
    }

    /// Cached stat if the node is current, otherwise a fresh validation.
    pub(crate) async fn dir_attr(&self, node: &NodeRef) -> VfsResult<FileAttr> {
        let (_, generation) = self.layout();
        if node.generation() == generation {
            if let Some(attr) = node.cached_attr() {
                return Ok(attr);
            }
        }
        self.validate_stat(node).await
    }

    /// Current attributes of a node.
    pub async fn stat(&self, node: &NodeRef) -> VfsResult<FileAttr> {
        let _gate = self.gate.read().await;
        self.validate_stat(node).await
    }

    /// Which access modes `cred` holds on a node.
    pub async fn report_access(&self, node: &NodeRef, cred: &Credentials) -> VfsResult<Access> {
        let _gate = self.gate.read().await;
        let attr = self.validate_stat(node).await?;
        Ok(access::report_access(&attr, cred))
    }

    pub(crate) async fn entries_locked(&self, node: &NodeRef) -> VfsResult<Vec<MergedEntry>> {
        if *node != self.root {
            self.validate_stat(node).await?;
        }
        merge(&node.handles()).await
    }

    /// Merged listing of a directory node, unordered.
    pub async fn readdir(&self, node: &NodeRef) -> VfsResult<Vec<MergedEntry>> {
        let _gate = self.gate.read().await;
        self.entries_locked(node).await
    }

    /// A page of packed directory records. See [`dirent::encode`].
    pub async fn get_dirents(
        &self,
        node: &NodeRef,
        first_entry: usize,
        num_entries: Option<usize>,
        max_bytes: usize,
    ) -> VfsResult<DirentPage> {
        let _gate = self.gate.read().await;
        let entries = self.entries_locked(node).await?;
        Ok(dirent::encode(&entries, first_entry, num_entries, max_bytes))
    }

    /// Render the current configuration as command-line options.
    ///
    /// Entries come out lowest priority first, so registering them again
    /// in order reproduces the chain, equal-priority ties included.
    pub fn append_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.debug {
            args.push("--debug".to_string());
        }
        if self.cache.max() != DEFAULT_CACHE_SIZE {
            args.push(format!("--cache-size={}", self.cache.max()));
        }
        for backing in self.chain.entries_rev() {
            if backing.writable() {
                args.push("--writable".to_string());
            }
            if backing.priority() != crate::chain::DEFAULT_PRIORITY {
                args.push(format!("--priority={}", backing.priority()));
            }
            match backing.path() {
                Some(path) => args.push(path.display().to_string()),
                None => args.push("--underlying".to_string()),
            }
        }
        args
    }
}

impl std::fmt::Debug for Union {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Union")
            .field("backends", &self.chain.len())
            .field("generation", &self.generation())
            .field("self_id", &self.self_id)
            .finish()
    }
}

//! End-to-end tests for the union over in-memory backends.
//!
//! # Coverage
//!
//! - **Lookup:** name resolution across backends, directory materialization
//! - **Cache:** bounded residency and node reconstruction after eviction
//! - **Mutation:** creation falling through a read-only backend,
//!   multi-backend removal with a failing backend
//! - **Reinitialization:** pruning a backend whose root went stale
//! - **Merge:** the duplicate-name policy
//! - **Concurrency:** reinitialization racing lookups

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use unionfs_kernel::vfs::{DirEntry, FileAttr, SetAttr};
use unionfs_kernel::{
    BackendRegistry, Chain, Credentials, FileType, Lookup, MemoryBackend, OpenFlags, Union,
    UnionOptions, VfsError, VfsOps, VfsResult,
};

// ============================================================================
// Shared test setup
// ============================================================================

/// Build a union over named in-memory backends, registered in order.
async fn union_over(
    layers: &[(&str, Arc<dyn VfsOps>, i32)],
    cache_size: usize,
) -> Arc<Union> {
    let registry = Arc::new(BackendRegistry::new());
    let chain = Arc::new(Chain::new());
    for (name, fs, priority) in layers {
        registry.insert(name, Arc::clone(fs));
        chain.register(Some((*name).into()), false, *priority);
    }
    let options = UnionOptions::default()
        .with_opener(registry)
        .with_cache_size(cache_size);
    Union::new(chain, options).await.unwrap()
}

fn cred() -> Credentials {
    Credentials::root()
}

/// Delegates to a memory backend but refuses every `rmdir`.
struct FaultyBackend {
    inner: MemoryBackend,
}

#[async_trait]
impl VfsOps for FaultyBackend {
    async fn getattr(&self, path: &Path) -> VfsResult<FileAttr> {
        self.inner.getattr(path).await
    }

    async fn readdir(&self, path: &Path) -> VfsResult<Vec<DirEntry>> {
        self.inner.readdir(path).await
    }

    async fn read(&self, path: &Path, offset: u64, size: u32) -> VfsResult<Vec<u8>> {
        self.inner.read(path, offset, size).await
    }

    async fn write(&self, path: &Path, offset: u64, data: &[u8]) -> VfsResult<u32> {
        self.inner.write(path, offset, data).await
    }

    async fn create(&self, path: &Path, mode: u32) -> VfsResult<FileAttr> {
        self.inner.create(path, mode).await
    }

    async fn mkdir(&self, path: &Path, mode: u32) -> VfsResult<FileAttr> {
        self.inner.mkdir(path, mode).await
    }

    async fn unlink(&self, path: &Path) -> VfsResult<()> {
        self.inner.unlink(path).await
    }

    async fn rmdir(&self, path: &Path) -> VfsResult<()> {
        Err(VfsError::permission_denied(path.display().to_string()))
    }

    async fn setattr(&self, path: &Path, attr: SetAttr) -> VfsResult<FileAttr> {
        self.inner.setattr(path, attr).await
    }

    fn read_only(&self) -> bool {
        false
    }
}

/// Opens fine but every operation reports a stale handle.
struct StaleRoot;

#[async_trait]
impl VfsOps for StaleRoot {
    async fn getattr(&self, path: &Path) -> VfsResult<FileAttr> {
        Err(VfsError::StaleHandle(path.display().to_string()))
    }

    async fn readdir(&self, path: &Path) -> VfsResult<Vec<DirEntry>> {
        Err(VfsError::StaleHandle(path.display().to_string()))
    }

    async fn read(&self, path: &Path, _offset: u64, _size: u32) -> VfsResult<Vec<u8>> {
        Err(VfsError::StaleHandle(path.display().to_string()))
    }

    async fn write(&self, path: &Path, _offset: u64, _data: &[u8]) -> VfsResult<u32> {
        Err(VfsError::StaleHandle(path.display().to_string()))
    }

    async fn create(&self, path: &Path, _mode: u32) -> VfsResult<FileAttr> {
        Err(VfsError::StaleHandle(path.display().to_string()))
    }

    async fn mkdir(&self, path: &Path, _mode: u32) -> VfsResult<FileAttr> {
        Err(VfsError::StaleHandle(path.display().to_string()))
    }

    async fn unlink(&self, path: &Path) -> VfsResult<()> {
        Err(VfsError::StaleHandle(path.display().to_string()))
    }

    async fn rmdir(&self, path: &Path) -> VfsResult<()> {
        Err(VfsError::StaleHandle(path.display().to_string()))
    }

    async fn setattr(&self, path: &Path, _attr: SetAttr) -> VfsResult<FileAttr> {
        Err(VfsError::StaleHandle(path.display().to_string()))
    }

    fn read_only(&self) -> bool {
        true
    }
}

// ============================================================================
// Lookup
// ============================================================================

#[tokio::test]
async fn test_lookup_finds_entry_only_in_later_registration() {
    let x = Arc::new(MemoryBackend::new());
    x.add_dir("shared");
    let y = Arc::new(MemoryBackend::new());
    y.add_dir("shared/only-in-b");
    y.add_file("shared/file-in-b", b"from y");

    let union = union_over(&[("x", x.clone(), 0), ("y", y.clone(), 0)], 16).await;
    let root = union.root();

    let found = union
        .lookup(&root, "shared/only-in-b", OpenFlags::read(), 0, &cred())
        .await
        .unwrap();
    let Lookup::Directory(node) = found else {
        panic!("expected a directory");
    };
    let handles = node.handles();
    assert_eq!(handles.len(), 1);
    let y_root = y.getattr(Path::new("shared/only-in-b")).await.unwrap();
    assert_eq!(handles[0].attr().id(), y_root.id());

    let file = union
        .lookup(&root, "shared/file-in-b", OpenFlags::read(), 0, &cred())
        .await
        .unwrap()
        .into_file()
        .unwrap();
    assert_eq!(file.read(0, 64).await.unwrap(), b"from y");
}

#[tokio::test]
async fn test_higher_priority_file_wins() {
    let low = Arc::new(MemoryBackend::new());
    low.add_file("etc/conf", b"low");
    let high = Arc::new(MemoryBackend::new());
    high.add_file("etc/conf", b"high");

    // Registered high first: priority, not order, decides.
    let union = union_over(&[("high", high, 10), ("low", low, 1)], 16).await;
    let file = union
        .lookup(&union.root(), "etc/conf", OpenFlags::read(), 0, &cred())
        .await
        .unwrap()
        .into_file()
        .unwrap();
    assert_eq!(file.read(0, 64).await.unwrap(), b"high");
}

// ============================================================================
// Cache
// ============================================================================

#[tokio::test]
async fn test_evicted_directory_is_rebuilt() {
    let fs = Arc::new(MemoryBackend::new());
    for dir in ["d1", "d2", "d3"] {
        fs.add_dir(dir);
    }
    let union = union_over(&[("fs", fs, 0)], 2).await;
    let root = union.root();

    let mut ids = Vec::new();
    for dir in ["d1", "d2", "d3"] {
        let node = union
            .lookup(&root, dir, OpenFlags::read(), 0, &cred())
            .await
            .unwrap()
            .into_dir()
            .unwrap();
        ids.push(node.id());
    }

    let cache = union.cache();
    assert_eq!(cache.resident(), 2);
    assert!(!cache.is_cached(ids[0]));
    assert_eq!(cache.refs(ids[0]), None, "unreferenced node must die on eviction");

    let again = union
        .lookup(&root, "d1", OpenFlags::read(), 0, &cred())
        .await
        .unwrap()
        .into_dir()
        .unwrap();
    assert_ne!(again.id(), ids[0]);
    assert_eq!(union.tree().path_construct(again.light()), Path::new("d1"));
}

#[tokio::test]
async fn test_retained_node_survives_eviction() {
    let fs = Arc::new(MemoryBackend::new());
    for dir in ["a", "b", "c"] {
        fs.add_dir(dir);
    }
    let union = union_over(&[("fs", fs, 0)], 1).await;
    let root = union.root();

    let kept = union
        .lookup(&root, "a", OpenFlags::read(), 0, &cred())
        .await
        .unwrap()
        .into_dir()
        .unwrap();
    for dir in ["b", "c"] {
        union.lookup(&root, dir, OpenFlags::read(), 0, &cred()).await.unwrap();
    }
    assert!(!union.cache().is_cached(kept.id()));
    assert_eq!(union.cache().refs(kept.id()), Some(1));

    let again = union
        .lookup(&root, "a", OpenFlags::read(), 0, &cred())
        .await
        .unwrap()
        .into_dir()
        .unwrap();
    assert_eq!(again, kept);
}

// ============================================================================
// Mutation
// ============================================================================

#[tokio::test]
async fn test_rmdir_surfaces_failure_without_rollback() {
    let high = Arc::new(MemoryBackend::new());
    high.add_dir("victim");
    let mid = MemoryBackend::new();
    mid.add_dir("victim");
    let mid: Arc<dyn VfsOps> = Arc::new(FaultyBackend { inner: mid });
    let low = Arc::new(MemoryBackend::new());
    low.add_dir("victim");

    let union = union_over(
        &[("high", high.clone(), 10), ("mid", Arc::clone(&mid), 5), ("low", low.clone(), 0)],
        16,
    )
    .await;
    let err = union.rmdir(&union.root(), "victim", &cred()).await.unwrap_err();
    assert!(matches!(err, VfsError::PermissionDenied(_)));

    // The lowest backend went first and stays removed; nothing above the
    // failing backend is touched.
    assert!(low.getattr(Path::new("victim")).await.unwrap_err().is_not_found());
    assert!(mid.getattr(Path::new("victim")).await.unwrap().is_dir());
    assert!(high.getattr(Path::new("victim")).await.unwrap().is_dir());
}

#[tokio::test]
async fn test_create_falls_through_read_only_backend() {
    let top = MemoryBackend::new_read_only();
    top.add_dir("etc");
    let bottom = Arc::new(MemoryBackend::new());
    bottom.add_dir("etc");

    let union = union_over(&[("top", Arc::new(top), 10), ("bottom", bottom.clone(), 0)], 16).await;
    let root = union.root();
    let etc = union
        .lookup(&root, "etc", OpenFlags::read(), 0, &cred())
        .await
        .unwrap()
        .into_dir()
        .unwrap();

    union.create(&etc, "new.conf", 0o640, &cred()).await.unwrap();
    let attr = bottom.getattr(Path::new("etc/new.conf")).await.unwrap();
    assert!(attr.is_file());
    assert_eq!(attr.perm, 0o640);
}

#[tokio::test]
async fn test_mkdir_falls_through_read_only_backend() {
    let top = Arc::new(MemoryBackend::new_read_only());
    let bottom = Arc::new(MemoryBackend::new());

    let union = union_over(&[("top", top.clone(), 10), ("bottom", bottom.clone(), 0)], 16).await;
    let root = union.root();
    union.mkdir(&root, "spool", 0o700, &cred()).await.unwrap();

    assert!(top.getattr(Path::new("spool")).await.unwrap_err().is_not_found());
    assert_eq!(bottom.getattr(Path::new("spool")).await.unwrap().perm, 0o700);
    let found = union.lookup(&root, "spool", OpenFlags::read(), 0, &cred()).await.unwrap();
    assert!(found.into_dir().is_some());
}

#[tokio::test]
async fn test_unlink_partial_success() {
    let high = MemoryBackend::new_read_only();
    high.add_file("both", b"");
    let low = Arc::new(MemoryBackend::new());
    low.add_file("both", b"");

    let union = union_over(&[("high", Arc::new(high), 10), ("low", low.clone(), 0)], 16).await;
    union.unlink(&union.root(), "both", &cred()).await.unwrap();
    assert!(low.getattr(Path::new("both")).await.is_err());
}

#[tokio::test]
async fn test_mkdir_then_listing() {
    let top = Arc::new(MemoryBackend::new());
    let bottom = Arc::new(MemoryBackend::new());
    bottom.add_dir("base");
    let union = union_over(&[("bottom", bottom, 0), ("top", top.clone(), 5)], 16).await;
    let root = union.root();

    union.mkdir(&root, "fresh", 0o750, &cred()).await.unwrap();
    assert_eq!(top.getattr(Path::new("fresh")).await.unwrap().perm, 0o750);

    let mut names: Vec<_> = union.readdir(&root).await.unwrap().into_iter().map(|e| e.name).collect();
    names.sort();
    assert_eq!(names, vec!["base", "fresh"]);
}

// ============================================================================
// Reinitialization
// ============================================================================

#[tokio::test]
async fn test_stale_backend_is_pruned() {
    let registry = Arc::new(BackendRegistry::new());
    let chain = Arc::new(Chain::new());
    let good = MemoryBackend::new();
    good.add_file("seen", b"");
    registry.insert("good", Arc::new(good));
    chain.register(Some("good".into()), false, 0);
    let union = Union::new(Arc::clone(&chain), UnionOptions::default().with_opener(registry.clone()))
        .await
        .unwrap();

    registry.insert("stale", Arc::new(StaleRoot));
    chain.register(Some("stale".into()), false, 5);
    union.reinitialize().await.unwrap();
    assert_eq!(chain.len(), 1);
    assert!(chain.get_by_path(Some(Path::new("stale"))).is_none());
    assert_eq!(union.root().slot_count(), 1);

    let newer = MemoryBackend::new();
    newer.add_file("added-later", b"");
    registry.insert("newer", Arc::new(newer));
    chain.register(Some("newer".into()), false, 1);
    union.reinitialize().await.unwrap();
    assert_eq!(chain.len(), 2);
    assert_eq!(union.root().slot_count(), 2);

    let mut names: Vec<_> = union.readdir(&union.root()).await.unwrap().into_iter().map(|e| e.name).collect();
    names.sort();
    assert_eq!(names, vec!["added-later", "seen"]);
}

// ============================================================================
// Merge policy
// ============================================================================

#[tokio::test]
async fn test_duplicate_name_takes_last_scanned_type() {
    let a = Arc::new(MemoryBackend::new());
    a.add_file("x", b"file");
    let b = Arc::new(MemoryBackend::new());
    b.add_dir("x");

    let union = union_over(&[("a", a, 10), ("b", b, 5)], 16).await;
    let entries = union.readdir(&union.root()).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "x");
    assert_eq!(entries[0].kind, FileType::Directory);
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reinitialize_racing_lookups() {
    let registry = Arc::new(BackendRegistry::new());
    let chain = Arc::new(Chain::new());
    for i in 0..6 {
        let fs = MemoryBackend::new();
        fs.add_dir(format!("common/layer{i}"));
        fs.add_file(format!("common/file{i}"), b"x");
        registry.insert(format!("l{i}"), Arc::new(fs));
    }
    chain.register(Some("l0".into()), false, 0);
    let union = Union::new(Arc::clone(&chain), UnionOptions::default().with_opener(registry).with_cache_size(4))
        .await
        .unwrap();

    let churn = {
        let union = Arc::clone(&union);
        tokio::spawn(async move {
            for i in 1..6 {
                union.chain().register(Some(format!("l{i}").into()), false, i);
                union.reinitialize().await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    let mut lookups = Vec::new();
    for _ in 0..4 {
        let union = Arc::clone(&union);
        lookups.push(tokio::spawn(async move {
            let mut held = Vec::new();
            for _ in 0..50 {
                if let Ok(Lookup::Directory(node)) = union
                    .lookup(&union.root(), "common", OpenFlags::read(), 0, &Credentials::root())
                    .await
                {
                    held.push(node);
                }
                tokio::task::yield_now().await;
            }
            held
        }));
    }

    churn.await.unwrap();
    let mut held = Vec::new();
    for task in lookups {
        held.extend(task.await.unwrap());
    }

    let backends = union.chain().len();
    assert_eq!(backends, 6);
    assert_eq!(union.root().slot_count(), backends);
    for node in &held {
        union.stat(node).await.unwrap();
        assert_eq!(node.slot_count(), backends);
        assert_eq!(node.handles().len(), backends);
    }
}

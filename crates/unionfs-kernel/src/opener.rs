//! Turning registered backend paths into live filesystems.

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::vfs::{LocalBackend, VfsError, VfsOps, VfsResult};

/// Opens the root of a backing filesystem named by a chain entry.
#[async_trait]
pub trait BackendOpener: Send + Sync {
    /// Open the filesystem rooted at `path`. Fails with `NotFound` when the
    /// backend is gone, which makes the reinitialization pass prune it.
    async fn open(&self, path: &Path) -> VfsResult<Arc<dyn VfsOps>>;
}

/// Opens local directories.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalOpener;

#[async_trait]
impl BackendOpener for LocalOpener {
    async fn open(&self, path: &Path) -> VfsResult<Arc<dyn VfsOps>> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => Ok(Arc::new(LocalBackend::new(path))),
            Ok(_) => Err(VfsError::not_a_directory(path.display().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(VfsError::not_found(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Pre-built backends by path, falling back to local directories.
///
/// In-memory layers and attached external backends are registered here
/// under the path their chain entry names.
#[derive(Default)]
pub struct BackendRegistry {
    backends: DashMap<PathBuf, Arc<dyn VfsOps>>,
    fallback: LocalOpener,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `fs` under `path`, replacing any previous backend there.
    pub fn insert(&self, path: impl AsRef<Path>, fs: Arc<dyn VfsOps>) {
        let key = normalize(path.as_ref());
        tracing::debug!(path = %key.display(), "registered backend instance");
        self.backends.insert(key, fs);
    }

    pub fn remove(&self, path: impl AsRef<Path>) -> Option<Arc<dyn VfsOps>> {
        self.backends.remove(&normalize(path.as_ref())).map(|(_, fs)| fs)
    }

    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.backends.contains_key(&normalize(path.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.backends.len())
            .finish()
    }
}

#[async_trait]
impl BackendOpener for BackendRegistry {
    async fn open(&self, path: &Path) -> VfsResult<Arc<dyn VfsOps>> {
        let registered = self.backends.get(&normalize(path)).map(|fs| Arc::clone(fs.value()));
        match registered {
            Some(fs) => Ok(fs),
            None => self.fallback.open(path).await,
        }
    }
}

/// Drop trailing separators and `.` components so "pkg/" and "pkg" agree.
fn normalize(path: &Path) -> PathBuf {
    path.components().collect()
}

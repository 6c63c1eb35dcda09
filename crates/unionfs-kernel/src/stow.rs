//! Stow directories: bulk registration of package trees.
//!
//! Every subdirectory of a stow directory is a backend. With a pattern
//! list, each package's matching subdirectories are the backends
//! instead (`stow/pkg/bin`, `stow/pkg/lib`, ...). A [`StowWatcher`]
//! keeps the chain in step with the directory as packages come and go.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::coordinator::Coordinator;
use crate::pattern::PatternList;
use crate::vfs::{VfsError, VfsResult};

/// Delay after a change before rescanning, so a burst of events costs one
/// rescan.
const SETTLE: Duration = Duration::from_millis(100);

/// A stow directory and how its packages are registered.
#[derive(Debug, Clone)]
pub struct StowDir {
    pub dir: PathBuf,
    pub patterns: PatternList,
    pub writable: bool,
    pub priority: i32,
}

impl StowDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            patterns: PatternList::new(),
            writable: false,
            priority: crate::chain::DEFAULT_PRIORITY,
        }
    }

    pub fn with_patterns(mut self, patterns: PatternList) -> Self {
        self.patterns = patterns;
        self
    }

    pub fn with_writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Names of the subdirectories of `dir`, symlinks followed.
async fn subdirs(dir: &Path) -> VfsResult<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let Ok(name) = entry.file_name().into_string() else {
            tracing::debug!(path = %entry.path().display(), "skipping non-UTF-8 name");
            continue;
        };
        if name == "." || name == ".." {
            continue;
        }
        match tokio::fs::metadata(entry.path()).await {
            Ok(meta) if meta.is_dir() => names.push(name),
            _ => {}
        }
    }
    names.sort();
    Ok(names)
}

/// Backend paths a stow directory currently provides.
pub async fn scan(stow: &StowDir) -> VfsResult<BTreeSet<PathBuf>> {
    let mut found = BTreeSet::new();
    for package in subdirs(&stow.dir).await? {
        let package_dir = stow.dir.join(&package);
        if stow.patterns.is_empty() {
            found.insert(package_dir);
            continue;
        }
        let inner = match subdirs(&package_dir).await {
            Ok(inner) => inner,
            Err(e) => {
                // The package may vanish between the two listings.
                tracing::debug!(package = %package_dir.display(), error = %e, "skipping package");
                continue;
            }
        };
        for name in inner {
            if stow.patterns.matches(&name) {
                found.insert(package_dir.join(name));
            }
        }
    }
    Ok(found)
}

/// What one synchronization changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StowDiff {
    pub added: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

impl StowDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Keeps a stow directory's packages registered.
pub struct StowWatcher {
    coordinator: Arc<Coordinator>,
    stow: StowDir,
    registered: Mutex<BTreeSet<PathBuf>>,
}

impl StowWatcher {
    pub fn new(coordinator: Arc<Coordinator>, stow: StowDir) -> Arc<Self> {
        Arc::new(Self {
            coordinator,
            stow,
            registered: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn stow(&self) -> &StowDir {
        &self.stow
    }

    /// Backend paths this watcher has registered.
    pub fn registered(&self) -> BTreeSet<PathBuf> {
        self.registered.lock().clone()
    }

    /// Rescan and bring the chain in line. All changes share one pass.
    pub async fn sync(&self) -> VfsResult<StowDiff> {
        let found = scan(&self.stow).await?;
        let _suppress = self.coordinator.suppress();

        let mut registered = self.registered.lock();
        let mut diff = StowDiff::default();
        for path in registered.difference(&found) {
            match self.coordinator.unregister(Some(path)) {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            diff.removed.push(path.clone());
        }
        for path in found.difference(&registered) {
            self.coordinator
                .register(Some(path.clone()), self.stow.writable, self.stow.priority);
            diff.added.push(path.clone());
        }
        *registered = found;

        if !diff.is_empty() {
            tracing::info!(
                stow = %self.stow.dir.display(),
                added = diff.added.len(),
                removed = diff.removed.len(),
                "stow directory changed"
            );
        }
        Ok(diff)
    }

    /// Watch the stow directory and resync on every change.
    pub fn start(self: &Arc<Self>) -> VfsResult<StowWatcherHandle> {
        let (tx, mut rx) = mpsc::channel::<()>(1);

        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| {
                if let Ok(event) = result {
                    if matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(_)
                    ) {
                        // A full channel already has a rescan queued.
                        let _ = tx.try_send(());
                    }
                }
            },
            notify::Config::default().with_poll_interval(Duration::from_millis(500)),
        )
        .map_err(|e| VfsError::Io(std::io::Error::other(e)))?;

        // Patterns select entries one level down, so watch that level too.
        let mode = if self.stow.patterns.is_empty() {
            RecursiveMode::NonRecursive
        } else {
            RecursiveMode::Recursive
        };
        watcher
            .watch(&self.stow.dir, mode)
            .map_err(|e| VfsError::Io(std::io::Error::other(e)))?;

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let stow = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        tracing::info!(stow = %stow.stow.dir.display(), "stow watcher shutting down");
                        break;
                    }
                    Some(()) = rx.recv() => {
                        tokio::time::sleep(SETTLE).await;
                        while rx.try_recv().is_ok() {}
                        if let Err(e) = stow.sync().await {
                            tracing::warn!(stow = %stow.stow.dir.display(), error = %e, "stow rescan failed");
                        }
                    }
                }
            }
        });

        tracing::info!(stow = %self.stow.dir.display(), "stow watcher started");
        Ok(StowWatcherHandle {
            _watcher: watcher,
            shutdown_tx,
        })
    }
}

/// Handle to a running stow watcher.
pub struct StowWatcherHandle {
    /// Kept alive to keep watching.
    _watcher: RecommendedWatcher,
    shutdown_tx: oneshot::Sender<()>,
}

impl StowWatcherHandle {
    pub fn stop(self) {
        let _ = self.shutdown_tx.send(());
    }
}

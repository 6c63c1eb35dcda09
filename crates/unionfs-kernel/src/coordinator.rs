//! Background reinitialization of the union root.
//!
//! ```text
//!   register/unregister ──► schedule() ──► Notify ──► coordinator task
//!                                                       │
//!                              gate.write() ◄───────────┘
//!                              prune + rebuild root + reset cache
//!                              passes += 1 ──► watch subscribers
//! ```
//!
//! `schedule` only signals; requests that arrive while the task is idle
//! collapse into one pass. A [`SuppressGuard`] defers every schedule
//! issued while it is alive and fires a single one when the last guard
//! drops, so bulk changes cost one pass.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Notify, oneshot, watch};
use tokio::task::JoinHandle;

use crate::chain::Backing;
use crate::union::Union;
use crate::vfs::VfsResult;

#[derive(Debug, Default)]
struct Suppression {
    depth: usize,
    pending: bool,
}

/// Owns the reinitialization task for one union.
pub struct Coordinator {
    union: Arc<Union>,
    wake: Notify,
    suppression: Mutex<Suppression>,
    passes: watch::Sender<u64>,
}

impl Coordinator {
    pub fn new(union: Arc<Union>) -> Arc<Self> {
        let (passes, _) = watch::channel(0);
        Arc::new(Self {
            union,
            wake: Notify::new(),
            suppression: Mutex::new(Suppression::default()),
            passes,
        })
    }

    pub fn union(&self) -> &Arc<Union> {
        &self.union
    }

    /// Request a reinitialization pass.
    pub fn schedule(&self) {
        {
            let mut suppression = self.suppression.lock();
            if suppression.depth > 0 {
                suppression.pending = true;
                return;
            }
        }
        self.wake.notify_one();
    }

    /// Defer scheduling until the returned guard (and any other live
    /// guard) is dropped.
    pub fn suppress(self: &Arc<Self>) -> SuppressGuard {
        self.suppression.lock().depth += 1;
        SuppressGuard {
            coordinator: Arc::clone(self),
        }
    }

    /// Add a backend to the chain and schedule a pass.
    pub fn register(&self, path: Option<PathBuf>, writable: bool, priority: i32) -> Backing {
        let backing = self.union.chain().register(path, writable, priority);
        self.schedule();
        backing
    }

    /// Remove a backend from the chain and schedule a pass.
    pub fn unregister(&self, path: Option<&Path>) -> VfsResult<Backing> {
        let backing = self.union.chain().unregister(path)?;
        self.schedule();
        Ok(backing)
    }

    /// Number of completed passes.
    pub fn pass_count(&self) -> u64 {
        *self.passes.borrow()
    }

    /// Receiver that changes after every completed pass.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.passes.subscribe()
    }

    /// Run one pass on the caller's task.
    pub async fn run_pass(&self) -> VfsResult<()> {
        let result = self.union.reinitialize().await;
        self.passes.send_modify(|n| *n += 1);
        result
    }

    /// Spawn the coordinator task.
    pub fn start(self: &Arc<Self>) -> CoordinatorHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let coordinator = Arc::clone(self);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        tracing::info!("coordinator shutting down");
                        break;
                    }
                    _ = coordinator.wake.notified() => {
                        // Failures are logged by the pass itself; the
                        // task keeps serving later requests.
                        let _ = coordinator.run_pass().await;
                    }
                }
            }
        });

        tracing::info!("coordinator started");
        CoordinatorHandle { task, shutdown_tx }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("passes", &self.pass_count())
            .finish()
    }
}

/// Defers schedules while alive. See [`Coordinator::suppress`].
pub struct SuppressGuard {
    coordinator: Arc<Coordinator>,
}

impl Drop for SuppressGuard {
    fn drop(&mut self) {
        let fire = {
            let mut suppression = self.coordinator.suppression.lock();
            suppression.depth -= 1;
            if suppression.depth == 0 && suppression.pending {
                suppression.pending = false;
                true
            } else {
                false
            }
        };
        if fire {
            self.coordinator.wake.notify_one();
        }
    }
}

/// Handle to a running coordinator task.
pub struct CoordinatorHandle {
    task: JoinHandle<()>,
    shutdown_tx: oneshot::Sender<()>,
}

impl CoordinatorHandle {
    /// Signal the task to stop without waiting for it.
    pub fn stop(self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Signal the task to stop and wait until it has. A pass in progress
    /// is finished first.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Chain;
    use crate::opener::BackendRegistry;
    use crate::union::UnionOptions;
    use crate::vfs::MemoryBackend;
    use std::time::Duration;

    async fn coordinator() -> (Arc<Coordinator>, Arc<BackendRegistry>) {
        let registry = Arc::new(BackendRegistry::new());
        for name in ["a", "b", "c"] {
            registry.insert(name, Arc::new(MemoryBackend::new()));
        }
        let chain = Arc::new(Chain::new());
        let union = Union::new(chain, UnionOptions::default().with_opener(registry.clone()))
            .await
            .unwrap();
        (Coordinator::new(union), registry)
    }

    #[tokio::test]
    async fn test_registration_visible_after_pass() {
        let (coord, _) = coordinator().await;
        let handle = coord.start();
        let mut passes = coord.subscribe();

        coord.register(Some("a".into()), false, 0);
        assert_eq!(coord.union().root().slot_count(), 0);

        passes.changed().await.unwrap();
        assert_eq!(coord.union().root().slot_count(), 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_suppressed_schedules_collapse() {
        let (coord, _) = coordinator().await;
        let handle = coord.start();
        let mut passes = coord.subscribe();

        {
            let _outer = coord.suppress();
            let _inner = coord.suppress();
            coord.register(Some("a".into()), false, 0);
            coord.register(Some("b".into()), false, 0);
            coord.register(Some("c".into()), true, 1);
        }

        passes.changed().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(coord.pass_count(), 1);
        assert_eq!(coord.union().root().slot_count(), 3);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_guard_without_schedule_is_quiet() {
        let (coord, _) = coordinator().await;
        let handle = coord.start();
        drop(coord.suppress());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(coord.pass_count(), 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_unregister_missing() {
        let (coord, _) = coordinator().await;
        assert!(coord.unregister(Some(Path::new("nope"))).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_run_pass_prunes() {
        let (coord, registry) = coordinator().await;
        coord.union().chain().register(Some("a".into()), false, 0);
        coord.union().chain().register(Some("b".into()), false, 0);
        registry.remove("b");

        coord.run_pass().await.unwrap();
        assert_eq!(coord.pass_count(), 1);
        assert_eq!(coord.union().chain().len(), 1);
        assert_eq!(coord.union().root().slot_count(), 1);
    }
}

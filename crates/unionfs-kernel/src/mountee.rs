//! External backends published by a child process.
//!
//! The child is told where to publish through [`MOUNTEE_DIR_ENV`]. Once
//! that directory appears it is registered as a backend; when the child
//! exits the death channel fires, which the server treats as an orderly
//! shutdown request.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;

use crate::chain::Backing;
use crate::coordinator::Coordinator;
use crate::opener::BackendRegistry;
use crate::vfs::{LocalBackend, VfsError, VfsResult};

/// Environment variable naming the directory the child must publish.
pub const MOUNTEE_DIR_ENV: &str = "UNIONFS_MOUNTEE_DIR";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How to start an external backend.
#[derive(Debug, Clone)]
pub struct MounteeSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Directory the child publishes its tree at.
    pub dir: PathBuf,
    pub writable: bool,
    pub priority: i32,
    /// Merge the published tree into the union. When false the child
    /// still runs but its tree is left out of the chain.
    pub merged: bool,
    pub ready_timeout: Duration,
}

impl MounteeSpec {
    /// Parse a whitespace-separated command line.
    pub fn parse(command_line: &str, dir: impl Into<PathBuf>) -> VfsResult<Self> {
        let mut words = command_line.split_whitespace().map(str::to_string);
        let program = words
            .next()
            .ok_or_else(|| VfsError::invalid_path("empty mount command"))?;
        Ok(Self {
            program,
            args: words.collect(),
            dir: dir.into(),
            writable: false,
            priority: crate::chain::DEFAULT_PRIORITY,
            merged: true,
            ready_timeout: Duration::from_secs(10),
        })
    }

    pub fn with_writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_merged(mut self, merged: bool) -> Self {
        self.merged = merged;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// The command line, for logging and argument rendering.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A running external backend.
pub struct Mountee {
    pid: Option<u32>,
    dir: PathBuf,
    backing: Option<Backing>,
    death: Option<oneshot::Receiver<ExitStatus>>,
    kill: Option<oneshot::Sender<()>>,
}

impl Mountee {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The chain entry the published tree was registered as, if merged.
    pub fn backing(&self) -> Option<&Backing> {
        self.backing.as_ref()
    }

    /// Take the death channel. It yields the exit status once the child
    /// is gone; it can be taken only once.
    pub fn take_death(&mut self) -> Option<oneshot::Receiver<ExitStatus>> {
        self.death.take()
    }

    /// Ask the death listener to kill the child.
    pub fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

impl std::fmt::Debug for Mountee {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mountee")
            .field("pid", &self.pid)
            .field("dir", &self.dir)
            .finish()
    }
}

/// Start the child, wait for its tree, and register it if
/// `spec.merged` is set.
pub async fn start_mountee(
    spec: &MounteeSpec,
    registry: &BackendRegistry,
    coordinator: &Arc<Coordinator>,
) -> VfsResult<Mountee> {
    let mut child = Command::new(&spec.program)
        .args(&spec.args)
        .env(MOUNTEE_DIR_ENV, &spec.dir)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;
    let pid = child.id();
    tracing::info!(command = %spec.command_line(), pid, dir = %spec.dir.display(), "started mountee");

    wait_published(&mut child, spec).await?;

    let backing = if spec.merged {
        registry.insert(&spec.dir, Arc::new(LocalBackend::new(&spec.dir)));
        Some(coordinator.register(Some(spec.dir.clone()), spec.writable, spec.priority))
    } else {
        tracing::info!(dir = %spec.dir.display(), "mountee tree not merged");
        None
    };

    let (death_tx, death_rx) = oneshot::channel();
    let (kill_tx, kill_rx) = oneshot::channel();
    tokio::spawn(listen_for_death(child, death_tx, kill_rx));

    Ok(Mountee {
        pid,
        dir: spec.dir.clone(),
        backing,
        death: Some(death_rx),
        kill: Some(kill_tx),
    })
}

async fn wait_published(child: &mut Child, spec: &MounteeSpec) -> VfsResult<()> {
    let deadline = tokio::time::Instant::now() + spec.ready_timeout;
    loop {
        if let Ok(meta) = tokio::fs::metadata(&spec.dir).await {
            if meta.is_dir() {
                return Ok(());
            }
        }
        if let Some(status) = child.try_wait()? {
            return Err(VfsError::other(format!(
                "mountee `{}` exited with {status} before publishing {}",
                spec.command_line(),
                spec.dir.display()
            )));
        }
        if tokio::time::Instant::now() >= deadline {
            let _ = child.start_kill();
            return Err(VfsError::other(format!(
                "mountee `{}` did not publish {} in time",
                spec.command_line(),
                spec.dir.display()
            )));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn listen_for_death(
    mut child: Child,
    death: oneshot::Sender<ExitStatus>,
    mut kill: oneshot::Receiver<()>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = &mut kill => {
            tracing::info!(pid = child.id(), "killing mountee");
            if let Err(e) = child.start_kill() {
                tracing::warn!(error = %e, "could not kill mountee");
            }
            child.wait().await
        }
    };
    match status {
        Ok(status) => {
            tracing::info!(%status, "mountee exited");
            let _ = death.send(status);
        }
        Err(e) => tracing::error!(error = %e, "lost track of mountee"),
    }
}

//! A running union assembled from configuration and command-line layers.
//!
//! Client operations take slash-separated paths relative to the union
//! root and map them onto the kernel's lookup operations.

use anyhow::{Context, Result, anyhow, bail};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use tokio::sync::oneshot;

use unionfs_kernel::dirent::{self, DirentPage};
use unionfs_kernel::{
    BackendRegistry, Chain, Coordinator, Credentials, FileAttr, LocalBackend, Lookup,
    MergedEntry, Mountee, MounteeSpec, NodeRef, OpenFlags, StowWatcher, Union, UnionConfig,
    UnionOptions, VfsOps, start_mountee,
};

use crate::cli::LayerArg;
use crate::constants::{MOUNTEE_READY_TIMEOUT, READ_CHUNK, default_mountee_dir};

/// Apply command-line layers to the chain, in order.
///
/// Removing a filesystem the chain does not have is not an error.
pub fn apply_layers(chain: &Chain, layers: &[LayerArg]) {
    for layer in layers {
        match layer {
            LayerArg::Add {
                path,
                writable,
                priority,
            } => {
                chain.register(path.clone(), *writable, *priority);
            }
            LayerArg::Remove { path } => {
                if let Err(e) = chain.unregister(path.as_deref()) {
                    tracing::debug!(error = %e, "nothing to remove");
                }
            }
        }
    }
}

/// Split `a/b/c` into `("a/b", "c")`.
fn split_parent(path: &str) -> Result<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    let (parent, name) = trimmed.rsplit_once('/').unwrap_or(("", trimmed));
    if name.is_empty() || name == "." || name == ".." {
        bail!("`{path}` does not name an entry");
    }
    Ok((parent, name))
}

pub struct Session {
    config: UnionConfig,
    registry: Arc<BackendRegistry>,
    coordinator: Arc<Coordinator>,
    stows: Vec<Arc<StowWatcher>>,
    cred: Credentials,
}

impl Session {
    /// Build the union: static backends first, then the command-line
    /// layers, then one synchronization of every stow directory.
    pub async fn open(config: UnionConfig, layers: &[LayerArg]) -> Result<Self> {
        let chain = Arc::new(Chain::new());
        config.register_backends(&chain);
        apply_layers(&chain, layers);

        let registry = Arc::new(BackendRegistry::new());
        let mut options = UnionOptions::default()
            .with_cache_size(config.cache_size)
            .with_debug(config.debug)
            .with_opener(Arc::clone(&registry) as _);

        let uses_underlying = chain.get_by_path(None).is_some();
        if uses_underlying {
            let dir = match &config.underlying_dir {
                Some(dir) => dir.clone(),
                None => std::env::current_dir().context("no working directory")?,
            };
            let underlying: Arc<dyn VfsOps> = Arc::new(LocalBackend::new(dir));
            options = options.with_underlying(underlying);
        }

        let union = Union::new(chain, options)
            .await
            .context("failed to open the backing filesystems")?;
        let coordinator = Coordinator::new(union);

        let mut stows = Vec::new();
        for stow in config.stow_dirs()? {
            let dir = stow.dir.clone();
            let watcher = StowWatcher::new(Arc::clone(&coordinator), stow);
            watcher
                .sync()
                .await
                .with_context(|| format!("failed to scan stow directory {}", dir.display()))?;
            stows.push(watcher);
        }
        if !stows.is_empty() {
            coordinator.run_pass().await?;
        }

        Ok(Self {
            config,
            registry,
            coordinator,
            stows,
            cred: Credentials::current(),
        })
    }

    pub fn union(&self) -> &Arc<Union> {
        self.coordinator.union()
    }

    pub fn config(&self) -> &UnionConfig {
        &self.config
    }

    /// Act as `cred` instead of the calling process.
    pub fn with_credentials(mut self, cred: Credentials) -> Self {
        self.cred = cred;
        self
    }

    async fn lookup(&self, path: &str, flags: OpenFlags) -> Result<Lookup> {
        let union = self.union();
        union
            .lookup(&union.root(), path, flags, 0, &self.cred)
            .await
            .with_context(|| format!("cannot access `{path}`"))
    }

    async fn dir(&self, path: &str) -> Result<NodeRef> {
        self.lookup(path, OpenFlags::read())
            .await?
            .into_dir()
            .ok_or_else(|| anyhow!("`{path}` is not a directory"))
    }

    /// Merged listing, sorted by name.
    pub async fn list(&self, path: &str) -> Result<Vec<MergedEntry>> {
        let dir = self.dir(path).await?;
        let mut entries = self.union().readdir(&dir).await?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// The whole listing as packed records, "." and ".." included.
    pub async fn list_raw(&self, path: &str) -> Result<DirentPage> {
        let dir = self.dir(path).await?;
        Ok(self.union().get_dirents(&dir, 0, None, 0).await?)
    }

    pub async fn stat(&self, path: &str) -> Result<FileAttr> {
        match self.lookup(path, OpenFlags::empty()).await? {
            Lookup::Directory(node) => Ok(self.union().stat(&node).await?),
            Lookup::File(file) => Ok(file.attr().clone()),
        }
    }

    pub async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let file = self
            .lookup(path, OpenFlags::read())
            .await?
            .into_file()
            .ok_or_else(|| anyhow!("`{path}` is a directory"))?;
        let mut data = Vec::new();
        loop {
            let chunk = file.read(data.len() as u64, READ_CHUNK).await?;
            if chunk.is_empty() {
                break;
            }
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }

    pub async fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        let (parent, name) = split_parent(path)?;
        let dir = self.dir(parent).await?;
        self.union()
            .mkdir(&dir, name, mode, &self.cred)
            .await
            .with_context(|| format!("cannot create directory `{path}`"))
    }

    pub async fn rmdir(&self, path: &str) -> Result<()> {
        let (parent, name) = split_parent(path)?;
        let dir = self.dir(parent).await?;
        self.union()
            .rmdir(&dir, name, &self.cred)
            .await
            .with_context(|| format!("cannot remove directory `{path}`"))
    }

    pub async fn unlink(&self, path: &str) -> Result<()> {
        let (parent, name) = split_parent(path)?;
        let dir = self.dir(parent).await?;
        self.union()
            .unlink(&dir, name, &self.cred)
            .await
            .with_context(|| format!("cannot remove `{path}`"))
    }

    /// Create `path` as an empty file unless it exists already.
    pub async fn touch(&self, path: &str, mode: u32) -> Result<FileAttr> {
        split_parent(path)?;
        let union = self.union();
        let file = union
            .lookup(&union.root(), path, OpenFlags::create(), mode, &self.cred)
            .await
            .with_context(|| format!("cannot create `{path}`"))?
            .into_file()
            .ok_or_else(|| anyhow!("`{path}` is a directory"))?;
        Ok(file.attr().clone())
    }

    /// Options that reproduce the current filesystem set.
    pub fn args(&self) -> Vec<String> {
        self.union().append_args()
    }

    async fn start_mountee(&self) -> Result<Option<Mountee>> {
        let Some(mount) = &self.config.mount else {
            return Ok(None);
        };
        let dir: PathBuf = mount.dir.clone().unwrap_or_else(default_mountee_dir);
        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
        let spec = MounteeSpec::parse(&mount.command, dir)?
            .with_writable(mount.writable)
            .with_priority(mount.priority)
            .with_merged(mount.merge)
            .with_ready_timeout(MOUNTEE_READY_TIMEOUT);
        let mountee = start_mountee(&spec, &self.registry, &self.coordinator)
            .await
            .with_context(|| format!("failed to start `{}`", spec.command_line()))?;
        Ok(Some(mountee))
    }

    /// Run until interrupted or until the mounted command exits.
    ///
    /// Stow directories are tracked and the coordinator applies every
    /// change in the background.
    pub async fn serve(self) -> Result<()> {
        let coordinator = self.coordinator.start();

        let mut watchers = Vec::with_capacity(self.stows.len());
        for stow in &self.stows {
            let handle = stow
                .start()
                .with_context(|| format!("cannot watch {}", stow.stow().dir.display()))?;
            watchers.push(handle);
        }

        let mut mountee = self.start_mountee().await?;
        let death = mountee.as_mut().and_then(Mountee::take_death);

        tracing::info!(
            args = %self.args().join(" "),
            stows = self.stows.len(),
            "union ready"
        );

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("cannot listen for interrupts")?;
                tracing::info!("interrupted, shutting down");
            }
            status = wait_for_death(death) => {
                match status {
                    Some(status) => tracing::info!(%status, "mounted command exited, shutting down"),
                    None => tracing::warn!("lost track of the mounted command, shutting down"),
                }
            }
        }

        for watcher in watchers {
            watcher.stop();
        }
        if let Some(mountee) = &mut mountee {
            mountee.kill();
        }
        coordinator.shutdown().await;
        Ok(())
    }
}

async fn wait_for_death(death: Option<oneshot::Receiver<ExitStatus>>) -> Option<ExitStatus> {
    match death {
        Some(death) => death.await.ok(),
        None => std::future::pending().await,
    }
}

/// One line per record: file number, type tag and name.
pub fn format_records(page: &DirentPage) -> Vec<String> {
    dirent::decode(&page.data)
        .map(|(fileno, kind, name)| format!("{fileno:>10} {kind:>2} {name}"))
        .collect()
}

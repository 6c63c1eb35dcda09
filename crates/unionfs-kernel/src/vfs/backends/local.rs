//! Local filesystem backend.
//!
//! Provides access to a real directory tree, with path security to
//! prevent escaping the root directory.

use async_trait::async_trait;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use tokio::fs;

use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::ops::VfsOps;
use crate::vfs::types::{DirEntry, FileAttr, FileType, SetAttr};

/// Local filesystem backend.
///
/// All operations are relative to `root`. If `root` is `/srv/layers/base`,
/// then `getattr("etc/motd")` stats `/srv/layers/base/etc/motd`.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
    read_only: bool,
}

impl LocalBackend {
    /// Create a new local filesystem rooted at the given path.
    ///
    /// The root is canonicalized at construction time so that escape
    /// checks compare like with like.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        let root = dunce::canonicalize(&root).unwrap_or(root);
        Self {
            root,
            read_only: false,
        }
    }

    /// Create a read-only local filesystem.
    pub fn read_only(root: impl Into<PathBuf>) -> Self {
        Self {
            read_only: true,
            ..Self::new(root)
        }
    }

    /// Get the root path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a backend-relative path onto the host.
    ///
    /// The final component is never followed, so a symlink is reported as
    /// itself. Any `..` that would climb above the root is rejected.
    fn resolve(&self, path: &Path) -> VfsResult<PathBuf> {
        let mut depth = 0usize;
        let mut full = self.root.clone();
        for component in path.components() {
            match component {
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(VfsError::path_escapes_root(path.display().to_string()));
                    }
                    depth -= 1;
                    full.pop();
                }
                Component::Normal(s) => {
                    depth += 1;
                    full.push(s);
                }
            }
        }

        // Intermediate symlinks may still point outside; check the parent.
        if let Some(parent) = full.parent() {
            if parent.starts_with(&self.root) && parent != self.root {
                if let Ok(real_parent) = dunce::canonicalize(parent) {
                    if !real_parent.starts_with(&self.root) {
                        return Err(VfsError::path_escapes_root(format!(
                            "{} is not under {}",
                            real_parent.display(),
                            self.root.display()
                        )));
                    }
                }
            }
        }

        Ok(full)
    }

    /// Check if write operations are allowed.
    fn check_writable(&self) -> VfsResult<()> {
        if self.read_only {
            Err(VfsError::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// Convert std::fs::Metadata to FileAttr.
    fn metadata_to_attr(meta: &std::fs::Metadata) -> FileAttr {
        let kind = if meta.is_dir() {
            FileType::Directory
        } else if meta.file_type().is_symlink() {
            FileType::Symlink
        } else {
            FileType::File
        };

        FileAttr {
            dev: meta.dev(),
            ino: meta.ino(),
            size: meta.len(),
            kind,
            perm: meta.permissions().mode() & 0o7777,
            mtime: meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH),
            nlink: meta.nlink() as u32,
            uid: Some(meta.uid()),
            gid: Some(meta.gid()),
        }
    }
}

#[async_trait]
impl VfsOps for LocalBackend {
    async fn getattr(&self, path: &Path) -> VfsResult<FileAttr> {
        let full_path = self.resolve(path)?;
        let meta = fs::symlink_metadata(&full_path).await?;
        Ok(Self::metadata_to_attr(&meta))
    }

    async fn readdir(&self, path: &Path) -> VfsResult<Vec<DirEntry>> {
        let full_path = self.resolve(path)?;
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&full_path).await?;

        while let Some(entry) = dir.next_entry().await? {
            let file_type = entry.file_type().await?;
            let kind = if file_type.is_dir() {
                FileType::Directory
            } else if file_type.is_symlink() {
                FileType::Symlink
            } else {
                FileType::File
            };

            entries.push(DirEntry::new(
                entry.file_name().to_string_lossy().into_owned(),
                kind,
                entry.ino(),
            ));
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn read(&self, path: &Path, offset: u64, size: u32) -> VfsResult<Vec<u8>> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};

        let full_path = self.resolve(path)?;
        let mut file = fs::File::open(&full_path).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        let mut buffer = vec![0u8; size as usize];
        let bytes_read = file.read(&mut buffer).await?;
        buffer.truncate(bytes_read);
        Ok(buffer)
    }

    async fn write(&self, path: &Path, offset: u64, data: &[u8]) -> VfsResult<u32> {
        use tokio::io::{AsyncSeekExt, AsyncWriteExt};

        self.check_writable()?;
        let full_path = self.resolve(path)?;
        let mut file = fs::OpenOptions::new().write(true).open(&full_path).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        Ok(data.len() as u32)
    }

    async fn create(&self, path: &Path, mode: u32) -> VfsResult<FileAttr> {
        self.check_writable()?;
        let full_path = self.resolve(path)?;

        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(&full_path)
            .await?;
        let meta = file.metadata().await?;
        Ok(Self::metadata_to_attr(&meta))
    }

    async fn mkdir(&self, path: &Path, mode: u32) -> VfsResult<FileAttr> {
        self.check_writable()?;
        let full_path = self.resolve(path)?;

        fs::DirBuilder::new().mode(mode).create(&full_path).await?;
        let meta = fs::symlink_metadata(&full_path).await?;
        Ok(Self::metadata_to_attr(&meta))
    }

    async fn unlink(&self, path: &Path) -> VfsResult<()> {
        self.check_writable()?;
        let full_path = self.resolve(path)?;
        Ok(fs::remove_file(&full_path).await?)
    }

    async fn rmdir(&self, path: &Path) -> VfsResult<()> {
        self.check_writable()?;
        let full_path = self.resolve(path)?;
        if full_path == self.root {
            return Err(VfsError::permission_denied("cannot remove root"));
        }
        Ok(fs::remove_dir(&full_path).await?)
    }

    async fn setattr(&self, path: &Path, attr: SetAttr) -> VfsResult<FileAttr> {
        self.check_writable()?;
        let full_path = self.resolve(path)?;

        if let Some(perm) = attr.perm {
            fs::set_permissions(&full_path, std::fs::Permissions::from_mode(perm)).await?;
        }

        if attr.uid.is_some() || attr.gid.is_some() {
            // Only a no-op chown is allowed for unprivileged users; skip it.
            let current = self.getattr(path).await?;
            if attr.uid != current.uid || attr.gid != current.gid {
                let target = full_path.clone();
                let (uid, gid) = (attr.uid, attr.gid);
                tokio::task::spawn_blocking(move || std::os::unix::fs::lchown(target, uid, gid))
                    .await
                    .map_err(|e| VfsError::other(e.to_string()))??;
            }
        }

        self.getattr(path).await
    }

    fn read_only(&self) -> bool {
        self.read_only
    }
}

//! In-memory filesystem backend.
//!
//! Used for scratch layers and testing. All data is ephemeral. Each
//! instance gets its own device number so identities never collide
//! across backends.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::ops::VfsOps;
use crate::vfs::types::{DirEntry, FileAttr, FileType, SetAttr};

/// Device numbers handed out to memory backends. Starts high so it does
/// not look like a real block device.
static NEXT_DEV: AtomicU64 = AtomicU64::new(0x1_0000_0000);

/// Inode number of every memory backend's root.
const ROOT_INO: u64 = 1;

#[derive(Debug, Clone)]
enum Entry {
    File { data: Vec<u8>, attr: FileAttr },
    Directory { attr: FileAttr },
}

impl Entry {
    fn attr(&self) -> &FileAttr {
        match self {
            Entry::File { attr, .. } => attr,
            Entry::Directory { attr } => attr,
        }
    }

    fn attr_mut(&mut self) -> &mut FileAttr {
        match self {
            Entry::File { attr, .. } => attr,
            Entry::Directory { attr } => attr,
        }
    }
}

#[derive(Debug)]
struct Inner {
    entries: HashMap<PathBuf, Entry>,
    next_ino: u64,
}

impl Inner {
    fn alloc_ino(&mut self) -> u64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        ino
    }

    /// The parent of `path` must exist and be a directory.
    fn check_parent(&self, path: &Path) -> VfsResult<()> {
        let parent = path.parent().unwrap_or(Path::new(""));
        match self.entries.get(parent) {
            Some(Entry::Directory { .. }) => Ok(()),
            Some(_) => Err(VfsError::not_a_directory(path_str(parent))),
            None => Err(VfsError::not_found(path_str(parent))),
        }
    }
}

/// In-memory filesystem backend.
///
/// Thread-safe via an internal `RwLock`. All data is lost when dropped.
#[derive(Debug)]
pub struct MemoryBackend {
    dev: u64,
    read_only: bool,
    inner: RwLock<Inner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create a new empty in-memory filesystem.
    pub fn new() -> Self {
        let dev = NEXT_DEV.fetch_add(1, Ordering::Relaxed);
        let mut entries = HashMap::new();
        // Root directory always exists
        entries.insert(
            PathBuf::new(),
            Entry::Directory {
                attr: FileAttr::directory(0o755).with_id(dev, ROOT_INO),
            },
        );
        Self {
            dev,
            read_only: false,
            inner: RwLock::new(Inner {
                entries,
                next_ino: ROOT_INO + 1,
            }),
        }
    }

    /// Create a read-only in-memory filesystem. Use the `add_*` helpers to
    /// populate it.
    pub fn new_read_only() -> Self {
        Self {
            read_only: true,
            ..Self::new()
        }
    }

    /// Device number of this instance.
    pub fn dev(&self) -> u64 {
        self.dev
    }

    /// Add a directory, creating missing parents. Existing directories are
    /// left alone.
    pub fn add_dir(&self, path: impl AsRef<Path>) -> FileAttr {
        let normalized = normalize(path.as_ref());
        let mut inner = self.inner.write();
        self.ensure_parents(&mut inner, &normalized);
        if let Some(existing) = inner.entries.get(&normalized) {
            return existing.attr().clone();
        }
        let attr = FileAttr::directory(0o755).with_id(self.dev, inner.alloc_ino());
        inner
            .entries
            .insert(normalized, Entry::Directory { attr: attr.clone() });
        attr
    }

    /// Add a file with the given contents, creating missing parents.
    /// Replaces anything already at `path`.
    pub fn add_file(&self, path: impl AsRef<Path>, data: &[u8]) -> FileAttr {
        let normalized = normalize(path.as_ref());
        let mut inner = self.inner.write();
        self.ensure_parents(&mut inner, &normalized);
        let attr = FileAttr::file(data.len() as u64, 0o644).with_id(self.dev, inner.alloc_ino());
        inner.entries.insert(
            normalized,
            Entry::File {
                data: data.to_vec(),
                attr: attr.clone(),
            },
        );
        attr
    }

    /// Ensure all parent directories exist.
    fn ensure_parents(&self, inner: &mut Inner, path: &Path) {
        let mut current = PathBuf::new();
        for component in path.parent().into_iter().flat_map(|p| p.components()) {
            if let Component::Normal(s) = component {
                current.push(s);
                if !inner.entries.contains_key(&current) {
                    let attr = FileAttr::directory(0o755).with_id(self.dev, inner.alloc_ino());
                    inner.entries.insert(current.clone(), Entry::Directory { attr });
                }
            }
        }
    }

    fn check_writable(&self) -> VfsResult<()> {
        if self.read_only {
            Err(VfsError::ReadOnly)
        } else {
            Ok(())
        }
    }
}

/// Normalize a path: remove leading `/`, resolve `.` and `..`.
fn normalize(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                result.pop();
            }
            Component::Normal(s) => result.push(s),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    result
}

fn path_str(path: &Path) -> String {
    path.display().to_string()
}

#[async_trait]
impl VfsOps for MemoryBackend {
    async fn getattr(&self, path: &Path) -> VfsResult<FileAttr> {
        let normalized = normalize(path);
        self.inner
            .read()
            .entries
            .get(&normalized)
            .map(|e| e.attr().clone())
            .ok_or_else(|| VfsError::not_found(path_str(&normalized)))
    }

    async fn readdir(&self, path: &Path) -> VfsResult<Vec<DirEntry>> {
        let normalized = normalize(path);
        let inner = self.inner.read();

        match inner.entries.get(&normalized) {
            Some(Entry::Directory { .. }) => {}
            Some(_) => return Err(VfsError::not_a_directory(path_str(&normalized))),
            None => return Err(VfsError::not_found(path_str(&normalized))),
        }

        let mut result: Vec<DirEntry> = inner
            .entries
            .iter()
            .filter(|(p, _)| p.parent() == Some(normalized.as_path()) && **p != normalized)
            .filter_map(|(p, entry)| {
                let name = p.file_name()?.to_string_lossy().into_owned();
                Some(DirEntry::new(name, entry.attr().kind, entry.attr().ino))
            })
            .collect();

        // Sort for consistent ordering
        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    async fn read(&self, path: &Path, offset: u64, size: u32) -> VfsResult<Vec<u8>> {
        let normalized = normalize(path);
        match self.inner.read().entries.get(&normalized) {
            Some(Entry::File { data, .. }) => {
                let start = (offset as usize).min(data.len());
                let end = (start + size as usize).min(data.len());
                Ok(data[start..end].to_vec())
            }
            Some(Entry::Directory { .. }) => Err(VfsError::is_a_directory(path_str(&normalized))),
            None => Err(VfsError::not_found(path_str(&normalized))),
        }
    }

    async fn write(&self, path: &Path, offset: u64, data: &[u8]) -> VfsResult<u32> {
        self.check_writable()?;
        let normalized = normalize(path);
        let mut inner = self.inner.write();

        match inner.entries.get_mut(&normalized) {
            Some(Entry::File {
                data: file_data,
                attr,
            }) => {
                let offset = offset as usize;
                if offset + data.len() > file_data.len() {
                    file_data.resize(offset + data.len(), 0);
                }
                file_data[offset..offset + data.len()].copy_from_slice(data);
                attr.size = file_data.len() as u64;
                attr.mtime = SystemTime::now();
                Ok(data.len() as u32)
            }
            Some(Entry::Directory { .. }) => Err(VfsError::is_a_directory(path_str(&normalized))),
            None => Err(VfsError::not_found(path_str(&normalized))),
        }
    }

    async fn create(&self, path: &Path, mode: u32) -> VfsResult<FileAttr> {
        self.check_writable()?;
        let normalized = normalize(path);
        let mut inner = self.inner.write();

        inner.check_parent(&normalized)?;
        if inner.entries.contains_key(&normalized) {
            return Err(VfsError::already_exists(path_str(&normalized)));
        }

        let attr = FileAttr::file(0, mode).with_id(self.dev, inner.alloc_ino());
        inner.entries.insert(
            normalized,
            Entry::File {
                data: Vec::new(),
                attr: attr.clone(),
            },
        );
        Ok(attr)
    }

    async fn mkdir(&self, path: &Path, mode: u32) -> VfsResult<FileAttr> {
        self.check_writable()?;
        let normalized = normalize(path);
        let mut inner = self.inner.write();

        inner.check_parent(&normalized)?;
        if inner.entries.contains_key(&normalized) {
            return Err(VfsError::already_exists(path_str(&normalized)));
        }

        let attr = FileAttr::directory(mode).with_id(self.dev, inner.alloc_ino());
        inner
            .entries
            .insert(normalized, Entry::Directory { attr: attr.clone() });
        Ok(attr)
    }

    async fn unlink(&self, path: &Path) -> VfsResult<()> {
        self.check_writable()?;
        let normalized = normalize(path);
        let mut inner = self.inner.write();

        match inner.entries.get(&normalized) {
            Some(Entry::Directory { .. }) => Err(VfsError::is_a_directory(path_str(&normalized))),
            Some(_) => {
                inner.entries.remove(&normalized);
                Ok(())
            }
            None => Err(VfsError::not_found(path_str(&normalized))),
        }
    }

    async fn rmdir(&self, path: &Path) -> VfsResult<()> {
        self.check_writable()?;
        let normalized = normalize(path);
        if normalized.as_os_str().is_empty() {
            return Err(VfsError::permission_denied("cannot remove root"));
        }
        let mut inner = self.inner.write();

        match inner.entries.get(&normalized) {
            Some(Entry::Directory { .. }) => {}
            Some(_) => return Err(VfsError::not_a_directory(path_str(&normalized))),
            None => return Err(VfsError::not_found(path_str(&normalized))),
        }

        let has_children = inner
            .entries
            .keys()
            .any(|k| k.parent() == Some(normalized.as_path()));
        if has_children {
            return Err(VfsError::directory_not_empty(path_str(&normalized)));
        }

        inner.entries.remove(&normalized);
        Ok(())
    }

    async fn setattr(&self, path: &Path, set: SetAttr) -> VfsResult<FileAttr> {
        self.check_writable()?;
        let normalized = normalize(path);
        let mut inner = self.inner.write();

        let entry = inner
            .entries
            .get_mut(&normalized)
            .ok_or_else(|| VfsError::not_found(path_str(&normalized)))?;

        let attr = entry.attr_mut();
        if let Some(perm) = set.perm {
            attr.perm = perm;
        }
        if let Some(uid) = set.uid {
            attr.uid = Some(uid);
        }
        if let Some(gid) = set.gid {
            attr.gid = Some(gid);
        }
        Ok(attr.clone())
    }

    fn read_only(&self) -> bool {
        self.read_only
    }
}

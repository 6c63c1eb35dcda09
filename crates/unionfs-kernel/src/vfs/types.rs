//! Core VFS types.
//!
//! Attributes carry a `(dev, ino)` identity so the union can tell when a
//! backend path resolves back onto the union's own root.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// File type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
}

impl FileType {
    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::File)
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }

    /// Returns true if this is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        matches!(self, FileType::Symlink)
    }
}

/// Identity of an object: device plus inode number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId {
    pub dev: u64,
    pub ino: u64,
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dev, self.ino)
    }
}

/// File attributes (metadata).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAttr {
    /// Device the object lives on.
    pub dev: u64,
    /// Inode number, unique within `dev`.
    pub ino: u64,
    /// Size in bytes.
    pub size: u64,
    /// File type.
    pub kind: FileType,
    /// Unix permissions (e.g., 0o644), possibly with the sticky bit.
    pub perm: u32,
    /// Last modification time.
    pub mtime: SystemTime,
    /// Number of hard links.
    pub nlink: u32,
    /// User ID (None when the backend has no notion of ownership).
    pub uid: Option<u32>,
    /// Group ID.
    pub gid: Option<u32>,
}

impl FileAttr {
    /// Create attributes for a new file.
    pub fn file(size: u64, perm: u32) -> Self {
        Self {
            dev: 0,
            ino: 0,
            size,
            kind: FileType::File,
            perm,
            mtime: SystemTime::now(),
            nlink: 1,
            uid: None,
            gid: None,
        }
    }

    /// Create attributes for a new directory.
    pub fn directory(perm: u32) -> Self {
        Self {
            dev: 0,
            ino: 0,
            size: 0,
            kind: FileType::Directory,
            perm,
            mtime: SystemTime::now(),
            nlink: 2, // . and ..
            uid: None,
            gid: None,
        }
    }

    /// Attach an identity.
    pub fn with_id(mut self, dev: u64, ino: u64) -> Self {
        self.dev = dev;
        self.ino = ino;
        self
    }

    /// Attach an owner.
    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }

    /// The `(dev, ino)` identity.
    pub fn id(&self) -> FileId {
        FileId {
            dev: self.dev,
            ino: self.ino,
        }
    }

    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// Returns true if this is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        self.kind.is_symlink()
    }
}

/// Directory entry, as listed by a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name (not full path).
    pub name: String,
    /// Entry type.
    pub kind: FileType,
    /// Inode number on the listing backend (0 if unknown).
    pub ino: u64,
}

impl DirEntry {
    /// Create a new directory entry.
    pub fn new(name: impl Into<String>, kind: FileType, ino: u64) -> Self {
        Self {
            name: name.into(),
            kind,
            ino,
        }
    }

    /// Create a file entry.
    pub fn file(name: impl Into<String>, ino: u64) -> Self {
        Self::new(name, FileType::File, ino)
    }

    /// Create a directory entry.
    pub fn directory(name: impl Into<String>, ino: u64) -> Self {
        Self::new(name, FileType::Directory, ino)
    }
}

/// Attributes to set (for setattr operation).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetAttr {
    /// New permissions.
    pub perm: Option<u32>,
    /// New user ID.
    pub uid: Option<u32>,
    /// New group ID.
    pub gid: Option<u32>,
}

impl SetAttr {
    /// Create a new empty SetAttr.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set permissions.
    pub fn with_perm(mut self, perm: u32) -> Self {
        self.perm = Some(perm);
        self
    }

    /// Set owner and group.
    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }

    /// True if nothing would change.
    pub fn is_empty(&self) -> bool {
        self.perm.is_none() && self.uid.is_none() && self.gid.is_none()
    }
}

/// Open file flags.
///
/// During resolution these describe the access a caller wants; a lookup
/// tries the requested set first and an empty set as fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    /// Read access requested.
    pub read: bool,
    /// Write access requested.
    pub write: bool,
    /// Execute access requested.
    pub exec: bool,
    /// Create if not exists.
    pub create: bool,
    /// Exclusive create (fail if exists).
    pub exclusive: bool,
    /// The result must be a directory.
    pub directory: bool,
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self {
            read: true,
            write: false,
            exec: false,
            create: false,
            exclusive: false,
            directory: false,
        }
    }
}

impl OpenFlags {
    /// No access at all; only checks existence.
    pub fn empty() -> Self {
        Self {
            read: false,
            ..Default::default()
        }
    }

    /// Read-only access.
    pub fn read() -> Self {
        Self::default()
    }

    /// Write access (also enables read).
    pub fn write() -> Self {
        Self {
            read: true,
            write: true,
            ..Default::default()
        }
    }

    /// Create with write access.
    pub fn create() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
            ..Default::default()
        }
    }

    /// Create exclusively (fail if exists).
    pub fn create_exclusive() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
            exclusive: true,
            ..Default::default()
        }
    }

    /// Same access, without any creation request.
    pub fn without_create(self) -> Self {
        Self {
            create: false,
            exclusive: false,
            ..self
        }
    }
}

//! Permission checks against cached attributes.
//!
//! Backends with no notion of ownership report `uid: None`; every caller is
//! treated as the owner of such objects.

use crate::vfs::{FileAttr, OpenFlags, VfsError, VfsResult};

const S_ISVTX: u32 = 0o1000;

/// Identity of the client on whose behalf an operation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gids: Vec<u32>,
}

impl Credentials {
    pub fn new(uid: u32, gids: Vec<u32>) -> Self {
        Self { uid, gids }
    }

    /// The superuser. Bypasses every permission check.
    pub fn root() -> Self {
        Self::new(0, vec![0])
    }

    /// Credentials of the running process.
    #[cfg(unix)]
    pub fn current() -> Self {
        let uid = rustix::process::getuid().as_raw();
        let gid = rustix::process::getgid().as_raw();
        Self::new(uid, vec![gid])
    }

    #[cfg(not(unix))]
    pub fn current() -> Self {
        Self::root()
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }

    /// Primary group, used when fixing up ownership of new objects.
    pub fn gid(&self) -> u32 {
        self.gids.first().copied().unwrap_or(0)
    }

    fn in_group(&self, gid: u32) -> bool {
        self.gids.contains(&gid)
    }
}

/// A set of requested or granted access modes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Access {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
}

impl Access {
    pub const EXEC: Access = Access {
        read: false,
        write: false,
        exec: true,
    };

    pub const WRITE: Access = Access {
        read: false,
        write: true,
        exec: false,
    };

    pub fn from_flags(flags: OpenFlags) -> Self {
        Self {
            read: flags.read,
            write: flags.write,
            exec: flags.exec,
        }
    }

    fn bits(self) -> u32 {
        (self.read as u32) << 2 | (self.write as u32) << 1 | self.exec as u32
    }
}

/// The permission triplet (`rwx`, as the low three bits) that applies to
/// `cred` for `attr`.
fn applicable_bits(attr: &FileAttr, cred: &Credentials) -> u32 {
    let owner = match attr.uid {
        None => true,
        Some(uid) => uid == cred.uid,
    };
    if owner {
        (attr.perm >> 6) & 0o7
    } else if attr.gid.is_some_and(|gid| cred.in_group(gid)) {
        (attr.perm >> 3) & 0o7
    } else {
        attr.perm & 0o7
    }
}

/// Which of read/write/exec `cred` holds on an object.
pub fn report_access(attr: &FileAttr, cred: &Credentials) -> Access {
    if cred.is_root() {
        // Root may execute only if someone can.
        return Access {
            read: true,
            write: true,
            exec: attr.is_dir() || attr.perm & 0o111 != 0,
        };
    }
    let bits = applicable_bits(attr, cred);
    Access {
        read: bits & 0o4 != 0,
        write: bits & 0o2 != 0,
        exec: bits & 0o1 != 0,
    }
}

/// Fail with `PermissionDenied` unless `cred` holds every mode in `want`.
pub fn check_access(attr: &FileAttr, cred: &Credentials, want: Access, what: &str) -> VfsResult<()> {
    let have = report_access(attr, cred).bits();
    if have & want.bits() == want.bits() {
        Ok(())
    } else {
        Err(VfsError::permission_denied(what))
    }
}

/// May `cred` add or remove entries in `dir`?
///
/// Requires write and search permission on the directory. With the sticky
/// bit set, removing `target` additionally requires owning either the
/// target or the directory.
pub fn check_dir_mod(
    dir: &FileAttr,
    target: Option<&FileAttr>,
    cred: &Credentials,
    what: &str,
) -> VfsResult<()> {
    if cred.is_root() {
        return Ok(());
    }
    let want = Access {
        read: false,
        write: true,
        exec: true,
    };
    check_access(dir, cred, want, what)?;

    let Some(target) = target else {
        return Ok(());
    };
    if dir.perm & S_ISVTX != 0 {
        let owns = |attr: &FileAttr| attr.uid.is_none_or(|uid| uid == cred.uid);
        if !owns(target) && !owns(dir) {
            return Err(VfsError::permission_denied(what));
        }
    }
    Ok(())
}

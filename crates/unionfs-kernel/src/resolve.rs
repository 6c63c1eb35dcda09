//! Name resolution on a single backend.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::node::Handle;
use crate::vfs::{OpenFlags, VfsError, VfsOps, VfsResult};

/// Resolve `name` beneath `dir` on `fs`.
///
/// The primary flag set is tried first; on any failure the fallback set
/// is tried and its outcome returned. A lookup that only needs to know
/// what is there passes [`OpenFlags::empty`] as fallback, so a refused
/// access mode still yields a handle whose attributes the caller can
/// check against the client's credentials.
pub async fn resolve(
    fs: &Arc<dyn VfsOps>,
    dir: Option<&Path>,
    name: &Path,
    primary: OpenFlags,
    fallback: OpenFlags,
    mode: u32,
) -> VfsResult<Handle> {
    let path = match dir {
        Some(dir) => dir.join(name),
        None => name.to_path_buf(),
    };

    match open(fs, &path, primary, mode).await {
        Ok(handle) => Ok(handle),
        Err(primary_err) if primary == fallback => Err(primary_err),
        Err(_) => open(fs, &path, fallback, mode).await,
    }
}

async fn open(fs: &Arc<dyn VfsOps>, path: &PathBuf, flags: OpenFlags, mode: u32) -> VfsResult<Handle> {
    if flags.create {
        match fs.create(path, mode).await {
            Ok(_) => {}
            Err(e) if e.is_already_exists() && !flags.exclusive => {}
            Err(e) => return Err(e),
        }
    }

    let attr = fs.getattr(path).await?;
    if flags.directory && !attr.is_dir() {
        return Err(VfsError::not_a_directory(path.display().to_string()));
    }
    if flags.write {
        if attr.is_dir() {
            return Err(VfsError::is_a_directory(path.display().to_string()));
        }
        if fs.read_only() {
            return Err(VfsError::ReadOnly);
        }
    }
    Ok(Handle::new(Arc::clone(fs), path.clone(), attr))
}

//! Path lookup and the namespace mutations built on it.
//!
//! Directories found during a lookup are materialized as nodes and
//! cached. Anything else is handed back as a [`Passthrough`] straight to
//! the backend that holds it, without creating any node.

use std::path::Path;

use crate::access::{Access, Credentials, check_access, check_dir_mod};
use crate::node::{Handle, NodeRef};
use crate::resolve::resolve;
use crate::union::Union;
use crate::vfs::{FileAttr, OpenFlags, SetAttr, VfsError, VfsResult};

/// Result of a lookup.
#[derive(Debug)]
pub enum Lookup {
    /// A merged directory.
    Directory(NodeRef),
    /// A non-directory, served directly by the backend that holds it.
    File(Passthrough),
}

impl Lookup {
    pub fn is_dir(&self) -> bool {
        matches!(self, Lookup::Directory(_))
    }

    pub fn into_dir(self) -> Option<NodeRef> {
        match self {
            Lookup::Directory(node) => Some(node),
            Lookup::File(_) => None,
        }
    }

    pub fn into_file(self) -> Option<Passthrough> {
        match self {
            Lookup::File(file) => Some(file),
            Lookup::Directory(_) => None,
        }
    }
}

/// A direct handle on a backend object, opened with `flags`.
#[derive(Debug, Clone)]
pub struct Passthrough {
    handle: Handle,
    flags: OpenFlags,
}

impl Passthrough {
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn attr(&self) -> &FileAttr {
        self.handle.attr()
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub async fn read(&self, offset: u64, size: u32) -> VfsResult<Vec<u8>> {
        if !self.flags.read {
            return Err(VfsError::permission_denied(self.handle.path().display().to_string()));
        }
        self.handle.fs().read(self.handle.path(), offset, size).await
    }

    pub async fn write(&self, offset: u64, data: &[u8]) -> VfsResult<u32> {
        if !self.flags.write {
            return Err(VfsError::permission_denied(self.handle.path().display().to_string()));
        }
        self.handle.fs().write(self.handle.path(), offset, data).await
    }
}

/// One name resolved under a directory node.
enum Found {
    Dir(NodeRef),
    Other(Handle),
}

fn is_dot(name: &str) -> bool {
    name.is_empty() || name == "."
}

/// Single path component, rejecting separators.
fn component(name: &str) -> VfsResult<&str> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(VfsError::invalid_path(name));
    }
    Ok(name)
}

impl Union {
    /// Resolve `path` relative to `dir`.
    ///
    /// A trailing slash requires the result to be a directory and turns
    /// off creation. With `flags.create`, a missing last component is
    /// created with `mode` on the first backend that accepts it.
    pub async fn lookup(
        &self,
        dir: &NodeRef,
        path: &str,
        flags: OpenFlags,
        mode: u32,
        cred: &Credentials,
    ) -> VfsResult<Lookup> {
        let _gate = self.gate.read().await;
        self.lookup_locked(dir, path, flags, mode, cred).await
    }

    async fn lookup_locked(
        &self,
        dir: &NodeRef,
        path: &str,
        flags: OpenFlags,
        mode: u32,
        cred: &Credentials,
    ) -> VfsResult<Lookup> {
        let must_be_dir = path.ends_with('/');
        let flags = if must_be_dir { flags.without_create() } else { flags };
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();

        let mut current = dir.clone();
        for (i, name) in components.iter().copied().enumerate() {
            let last = i + 1 == components.len();

            let dir_attr = self.dir_attr(&current).await?;
            check_access(&dir_attr, cred, Access::EXEC, name)?;

            if is_dot(name) {
                continue;
            }
            if name == ".." {
                current = self.parent_of(&current);
                continue;
            }

            let primary = if last { flags.without_create() } else { OpenFlags::read() };
            let found = match self.lookup_name(&current, name, primary).await {
                Ok(handle) => {
                    if last && flags.create && flags.exclusive {
                        return Err(VfsError::already_exists(name));
                    }
                    self.materialize(&current, name, handle).await?
                }
                Err(e) if e.is_not_found() && last && flags.create => {
                    self.create_locked(&current, &dir_attr, name, mode, flags, cred).await?;
                    let handle = self.lookup_name(&current, name, primary).await?;
                    self.materialize(&current, name, handle).await?
                }
                Err(e) => return Err(e),
            };

            match found {
                Found::Dir(node) => current = node,
                Found::Other(handle) => {
                    if !last || must_be_dir {
                        return Err(VfsError::not_a_directory(name));
                    }
                    check_access(handle.attr(), cred, Access::from_flags(flags), name)?;
                    return Ok(Lookup::File(Passthrough { handle, flags }));
                }
            }
        }

        let attr = self.validate_stat(&current).await?;
        if flags.write {
            return Err(VfsError::is_a_directory(path));
        }
        let want = Access {
            read: flags.read,
            ..Access::default()
        };
        check_access(&attr, cred, want, path)?;
        Ok(Lookup::Directory(current))
    }

    /// First backend, in priority order, that has `name` under `dir`.
    ///
    /// Missing entries move on to the next backend; any other failure
    /// ends the search. Landing on the union's own root is a loop.
    async fn lookup_name(&self, dir: &NodeRef, name: &str, primary: OpenFlags) -> VfsResult<Handle> {
        for handle in dir.handles() {
            if !handle.is_dir() {
                continue;
            }
            let found = resolve(
                handle.fs(),
                Some(handle.path()),
                Path::new(name),
                primary,
                OpenFlags::empty(),
                0,
            )
            .await;
            match found {
                Ok(found) if Some(found.attr().id()) == self.self_id => {
                    tracing::warn!(name, "lookup leads back to the union root");
                    return Err(VfsError::loop_detected(name));
                }
                Ok(found) => return Ok(found),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(VfsError::not_found(name))
    }

    /// Turn a resolved directory into a cached node; pass anything else
    /// through.
    async fn materialize(&self, dir: &NodeRef, name: &str, handle: Handle) -> VfsResult<Found> {
        if !handle.is_dir() {
            return Ok(Found::Other(handle));
        }

        let light = self.tree.get_or_install(dir.light(), name);
        let (slot_count, generation) = self.layout();
        let node = self.cache.lookup(light, slot_count, generation);
        // The node holds its own reference on the light node.
        self.tree.ref_remove(light);
        self.cache.add(&node);
        self.validate_stat(&node).await?;
        Ok(Found::Dir(node))
    }

    fn parent_of(&self, node: &NodeRef) -> NodeRef {
        if *node == self.root {
            return self.root.clone();
        }
        match self.tree.parent(node.light()) {
            Some(parent) if parent != self.tree.root() => {
                let (slot_count, generation) = self.layout();
                let parent = self.cache.lookup(parent, slot_count, generation);
                self.cache.add(&parent);
                parent
            }
            _ => self.root.clone(),
        }
    }

    /// Mark the node for `dir/name`, if one exists, as stale.
    fn invalidate_child(&self, dir: &NodeRef, name: &str) {
        if let Some(light) = self.tree.lookup_child(dir.light(), name) {
            if let Some(id) = self.tree.node(light) {
                self.cache.invalidate(id);
            }
        }
    }

    /// Create a regular file under `dir` on the first backend, in priority
    /// order, that accepts it.
    async fn create_locked(
        &self,
        dir: &NodeRef,
        dir_attr: &FileAttr,
        name: &str,
        mode: u32,
        flags: OpenFlags,
        cred: &Credentials,
    ) -> VfsResult<()> {
        check_dir_mod(dir_attr, None, cred, name)?;

        let mut last_err = VfsError::NoBackends;
        for handle in dir.handles() {
            if !handle.is_dir() {
                continue;
            }
            let path = handle.child(name);
            match handle.fs().create(&path, mode).await {
                Ok(attr) => {
                    tracing::debug!(path = %path.display(), "created file");
                    let fixup = SetAttr::new().with_perm(mode & 0o7777);
                    let fixup = match attr.uid {
                        Some(_) => fixup.with_owner(cred.uid, cred.gid()),
                        None => fixup,
                    };
                    if let Err(e) = handle.fs().setattr(&path, fixup).await {
                        if let Err(undo) = handle.fs().unlink(&path).await {
                            tracing::warn!(path = %path.display(), error = %undo, "could not remove file after failed fix-up");
                        }
                        return Err(e);
                    }
                    return Ok(());
                }
                Err(e) if e.is_already_exists() => {
                    if flags.exclusive {
                        return Err(e);
                    }
                    return Ok(());
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    /// Create the directory `dir/name`.
    pub async fn mkdir(&self, dir: &NodeRef, name: &str, mode: u32, cred: &Credentials) -> VfsResult<()> {
        let name = component(name)?;
        let _gate = self.gate.read().await;

        let dir_attr = self.dir_attr(dir).await?;
        check_dir_mod(&dir_attr, None, cred, name)?;

        let mut last_err = VfsError::NoBackends;
        for handle in dir.handles() {
            if !handle.is_dir() {
                continue;
            }
            let path = handle.child(name);
            match handle.fs().mkdir(&path, mode).await {
                Ok(attr) => {
                    let owned = attr.uid.is_none_or(|uid| uid == cred.uid) && attr.gid.is_none_or(|gid| gid == cred.gid());
                    if !owned {
                        let chown = SetAttr::new().with_owner(cred.uid, cred.gid());
                        if let Err(e) = handle.fs().setattr(&path, chown).await {
                            if let Err(undo) = handle.fs().rmdir(&path).await {
                                tracing::warn!(path = %path.display(), error = %undo, "could not remove directory after failed chown");
                            }
                            return Err(e);
                        }
                    }
                    tracing::debug!(path = %path.display(), "created directory");
                    self.invalidate_child(dir, name);
                    return Ok(());
                }
                Err(e) if e.is_already_exists() || e.is_not_a_directory() => return Err(e),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    /// Remove the directory `dir/name` from every backend that has it.
    ///
    /// Backends are visited lowest priority first. A backend without the
    /// directory is skipped. The first other failure stops the walk and is
    /// returned; removals that already succeeded stay done.
    pub async fn rmdir(&self, dir: &NodeRef, name: &str, cred: &Credentials) -> VfsResult<()> {
        let name = component(name)?;
        let _gate = self.gate.read().await;

        let dir_attr = self.dir_attr(dir).await?;
        let target = self.lookup_name(dir, name, OpenFlags::empty()).await?;
        if !target.is_dir() {
            return Err(VfsError::not_a_directory(name));
        }
        check_dir_mod(&dir_attr, Some(target.attr()), cred, name)?;

        for handle in dir.handles().into_iter().rev() {
            if !handle.is_dir() {
                continue;
            }
            match handle.fs().rmdir(&handle.child(name)).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    tracing::debug!(path = %handle.child(name).display(), error = %e, "rmdir failed");
                    self.invalidate_child(dir, name);
                    return Err(e);
                }
            }
        }
        self.invalidate_child(dir, name);
        Ok(())
    }

    /// Remove the non-directory `dir/name` from every backend that has it.
    ///
    /// Succeeds if at least one backend removed it.
    pub async fn unlink(&self, dir: &NodeRef, name: &str, cred: &Credentials) -> VfsResult<()> {
        let name = component(name)?;
        let _gate = self.gate.read().await;

        let dir_attr = self.dir_attr(dir).await?;
        let target = self.lookup_name(dir, name, OpenFlags::empty()).await?;
        if target.is_dir() {
            return Err(VfsError::is_a_directory(name));
        }
        check_dir_mod(&dir_attr, Some(target.attr()), cred, name)?;

        let mut removed = false;
        let mut first_err = None;
        for handle in dir.handles().into_iter().rev() {
            if !handle.is_dir() {
                continue;
            }
            match handle.fs().unlink(&handle.child(name)).await {
                Ok(()) => removed = true,
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }

        match (removed, first_err) {
            (true, _) => Ok(()),
            (false, Some(e)) => Err(e),
            (false, None) => Err(VfsError::not_found(name)),
        }
    }

    /// Create a regular file `dir/name`, failing if it exists.
    pub async fn create(
        &self,
        dir: &NodeRef,
        name: &str,
        mode: u32,
        cred: &Credentials,
    ) -> VfsResult<Passthrough> {
        let name = component(name)?;
        let found = self.lookup(dir, name, OpenFlags::create_exclusive(), mode, cred).await?;
        found
            .into_file()
            .ok_or_else(|| VfsError::is_a_directory(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Chain;
    use crate::opener::BackendRegistry;
    use crate::union::UnionOptions;
    use crate::vfs::{MemoryBackend, VfsOps};
    use std::sync::Arc;

    struct Fixture {
        union: Arc<Union>,
        top: Arc<MemoryBackend>,
        bottom: Arc<MemoryBackend>,
    }

    async fn fixture() -> Fixture {
        let top = Arc::new(MemoryBackend::new());
        let bottom = Arc::new(MemoryBackend::new());
        let registry = Arc::new(BackendRegistry::new());
        registry.insert("top", top.clone());
        registry.insert("bottom", bottom.clone());

        let chain = Arc::new(Chain::new());
        chain.register(Some("bottom".into()), false, 0);
        chain.register(Some("top".into()), true, 0);
        let union = Union::new(chain, UnionOptions::default().with_opener(registry))
            .await
            .unwrap();
        Fixture { union, top, bottom }
    }

    fn root() -> Credentials {
        Credentials::root()
    }

    #[tokio::test]
    async fn test_file_passthrough_prefers_top() {
        let f = fixture().await;
        f.top.add_file("etc/motd", b"top");
        f.bottom.add_file("etc/motd", b"bottom");

        let found = f.union.lookup(&f.union.root(), "etc/motd", OpenFlags::read(), 0, &root()).await.unwrap();
        let file = found.into_file().unwrap();
        assert_eq!(file.read(0, 16).await.unwrap(), b"top");

        // The directory got a light node; the file did not.
        let tree = f.union.tree();
        let etc = tree.lookup_child(tree.root(), "etc").unwrap();
        assert!(tree.lookup_child(etc, "motd").is_none());
    }

    #[tokio::test]
    async fn test_directory_is_cached() {
        let f = fixture().await;
        f.bottom.add_dir("usr/lib");

        let node = f.union.lookup(&f.union.root(), "usr/lib", OpenFlags::read(), 0, &root()).await.unwrap();
        let node = node.into_dir().unwrap();
        assert!(f.union.cache().is_cached(node.id()));
        assert_eq!(f.union.tree().path_construct(node.light()), Path::new("usr/lib"));
        assert_eq!(f.union.cache().resident(), 2);
    }

    #[tokio::test]
    async fn test_dot_and_dotdot() {
        let f = fixture().await;
        f.top.add_dir("a/b");
        let root_node = f.union.root();

        let up = f.union.lookup(&root_node, "a/b/..", OpenFlags::read(), 0, &root()).await.unwrap();
        let a = f.union.lookup(&root_node, "a/./", OpenFlags::read(), 0, &root()).await.unwrap();
        assert_eq!(up.into_dir().unwrap(), a.into_dir().unwrap());

        let above = f.union.lookup(&root_node, "../..", OpenFlags::read(), 0, &root()).await.unwrap();
        assert_eq!(above.into_dir().unwrap(), root_node);
    }

    #[tokio::test]
    async fn test_not_a_directory() {
        let f = fixture().await;
        f.top.add_file("file", b"");
        let err = f.union.lookup(&f.union.root(), "file/x", OpenFlags::read(), 0, &root()).await.unwrap_err();
        assert!(err.is_not_a_directory());
        let err = f.union.lookup(&f.union.root(), "file/", OpenFlags::read(), 0, &root()).await.unwrap_err();
        assert!(err.is_not_a_directory());
    }

    #[tokio::test]
    async fn test_write_on_directory() {
        let f = fixture().await;
        f.top.add_dir("d");
        let err = f.union.lookup(&f.union.root(), "d", OpenFlags::write(), 0, &root()).await.unwrap_err();
        assert!(matches!(err, VfsError::IsADirectory(_)));
    }

    #[tokio::test]
    async fn test_create_goes_to_first_backend() {
        let f = fixture().await;
        f.top.add_dir("dir");
        f.bottom.add_dir("dir");

        let found = f.union.lookup(&f.union.root(), "dir/new", OpenFlags::create(), 0o640, &root()).await.unwrap();
        let file = found.into_file().unwrap();
        assert_eq!(file.write(0, b"hi").await.unwrap(), 2);
        assert_eq!(f.top.getattr(Path::new("dir/new")).await.unwrap().perm, 0o640);
        assert!(f.bottom.getattr(Path::new("dir/new")).await.is_err());

        let err = f.union.create(&f.union.root(), "dir", 0o644, &root()).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_trailing_slash_disables_create() {
        let f = fixture().await;
        let err = f.union.lookup(&f.union.root(), "missing/", OpenFlags::create(), 0o644, &root()).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(f.top.getattr(Path::new("missing")).await.is_err());
    }

    #[tokio::test]
    async fn test_exec_permission_on_traversal() {
        let f = fixture().await;
        f.top.add_file("locked/secret", b"");
        f.top
            .setattr(Path::new("locked"), SetAttr::new().with_perm(0o700).with_owner(0, 0))
            .await
            .unwrap();

        let user = Credentials::new(1000, vec![1000]);
        let err = f.union.lookup(&f.union.root(), "locked/secret", OpenFlags::read(), 0, &user).await.unwrap_err();
        assert!(matches!(err, VfsError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_mkdir_rmdir_unlink() {
        let f = fixture().await;
        let root_node = f.union.root();
        f.union.mkdir(&root_node, "made", 0o755, &root()).await.unwrap();
        assert!(f.top.getattr(Path::new("made")).await.unwrap().is_dir());
        assert!(f.union.mkdir(&root_node, "made", 0o755, &root()).await.unwrap_err().is_already_exists());

        f.bottom.add_dir("made");
        f.union.rmdir(&root_node, "made", &root()).await.unwrap();
        assert!(f.top.getattr(Path::new("made")).await.is_err());
        assert!(f.bottom.getattr(Path::new("made")).await.is_err());

        f.bottom.add_file("gone", b"");
        f.union.unlink(&root_node, "gone", &root()).await.unwrap();
        assert!(f.union.unlink(&root_node, "gone", &root()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_loop_is_reported() {
        let top = MemoryBackend::new();
        let looped = top.add_dir("self");
        let registry = Arc::new(BackendRegistry::new());
        registry.insert("top", Arc::new(top) as Arc<dyn VfsOps>);
        let chain = Arc::new(Chain::new());
        chain.register(Some("top".into()), false, 0);
        let options = UnionOptions::default().with_opener(registry).with_self_id(looped.id());
        let union = Union::new(chain, options).await.unwrap();

        let err = union.lookup(&union.root(), "self", OpenFlags::read(), 0, &root()).await.unwrap_err();
        assert!(matches!(err, VfsError::Loop(_)));
    }
}

//! Client operations through a session over real directories.
//!
//! Each test builds its backing trees in a tempdir and drives the same
//! code paths the `unionfs` subcommands use.

use std::path::Path;

use tempfile::TempDir;
use unionfs_kernel::config::BackendConfig;
use unionfs_kernel::{Credentials, FileType, UnionConfig};
use unionfs_server::{Cli, LayerArg, Session};

// ============================================================================
// Shared test setup
// ============================================================================

struct Layers {
    _root: TempDir,
    low: std::path::PathBuf,
    high: std::path::PathBuf,
}

/// `low` has etc/motd and etc/base.conf; `high` overrides etc/motd and
/// adds bin/tool.
fn layers() -> Layers {
    let root = tempfile::tempdir().unwrap();
    let low = root.path().join("low");
    let high = root.path().join("high");
    write(&low, "etc/motd", "low motd\n");
    write(&low, "etc/base.conf", "base\n");
    write(&high, "etc/motd", "high motd\n");
    write(&high, "bin/tool", "#!/bin/sh\n");
    Layers {
        _root: root,
        low,
        high,
    }
}

fn write(dir: &Path, rel: &str, contents: &str) {
    let path = dir.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

fn parse(args: &[&str]) -> Vec<LayerArg> {
    let argv = std::iter::once("unionfs").chain(args.iter().copied());
    Cli::parse_with_layers(argv).unwrap().1
}

async fn open(fs: &Layers) -> Session {
    let layers = parse(&[
        fs.low.to_str().unwrap(),
        "--writable",
        "--priority",
        "10",
        fs.high.to_str().unwrap(),
    ]);
    Session::open(UnionConfig::default(), &layers).await.unwrap()
}

// ============================================================================
// Reading
// ============================================================================

#[tokio::test]
async fn test_listing_merges_both_layers() {
    let fs = layers();
    let session = open(&fs).await;

    let root: Vec<_> = session.list("").await.unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(root, vec!["bin", "etc"]);

    let etc = session.list("etc").await.unwrap();
    let names: Vec<_> = etc.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["base.conf", "motd"]);
    assert!(etc.iter().all(|e| e.kind == FileType::File));

    let page = session.list_raw("etc").await.unwrap();
    assert_eq!(page.count, 4);
}

#[tokio::test]
async fn test_higher_priority_file_wins() {
    let fs = layers();
    let session = open(&fs).await;
    assert_eq!(session.read("etc/motd").await.unwrap(), b"high motd\n");
    assert_eq!(session.read("etc/base.conf").await.unwrap(), b"base\n");
    assert!(session.read("etc").await.is_err());
    assert!(session.read("etc/missing").await.is_err());
}

#[tokio::test]
async fn test_stat() {
    let fs = layers();
    let session = open(&fs).await;

    let root = session.stat("").await.unwrap();
    assert_eq!(root.ino, 1);
    assert_eq!(root.kind, FileType::Directory);

    let motd = session.stat("etc/motd").await.unwrap();
    assert_eq!(motd.size, "high motd\n".len() as u64);
}

// ============================================================================
// Mutation
// ============================================================================

#[tokio::test]
async fn test_mkdir_and_touch_land_on_first_backend() {
    let fs = layers();
    let session = open(&fs).await;

    session.mkdir("etc/new.d", 0o755).await.unwrap();
    assert!(fs.high.join("etc/new.d").is_dir());
    assert!(!fs.low.join("etc/new.d").exists());

    session.touch("etc/new.d/file", 0o600).await.unwrap();
    assert!(fs.high.join("etc/new.d/file").is_file());
}

#[tokio::test]
async fn test_touch_keeps_existing_file() {
    let fs = layers();
    let session = open(&fs).await;

    let attr = session.touch("etc/base.conf", 0o600).await.unwrap();
    assert_eq!(attr.size, "base\n".len() as u64);
    assert_eq!(session.read("etc/base.conf").await.unwrap(), b"base\n");
    assert!(!fs.high.join("etc/base.conf").exists());

    assert!(session.touch("etc", 0o600).await.is_err());
}

#[tokio::test]
async fn test_removal_reaches_every_backend() {
    let fs = layers();
    let session = open(&fs).await;

    session.unlink("etc/motd").await.unwrap();
    assert!(!fs.low.join("etc/motd").exists());
    assert!(!fs.high.join("etc/motd").exists());

    std::fs::create_dir_all(fs.low.join("tmp")).unwrap();
    std::fs::create_dir_all(fs.high.join("tmp")).unwrap();
    session.rmdir("tmp").await.unwrap();
    assert!(!fs.low.join("tmp").exists());
    assert!(!fs.high.join("tmp").exists());

    assert!(session.rmdir("etc/base.conf").await.is_err());
}

#[cfg(unix)]
#[tokio::test]
async fn test_credentials_gate_mutation() {
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    let fs = layers();
    for dir in [&fs.low, &fs.high] {
        std::fs::set_permissions(dir.join("etc"), std::fs::Permissions::from_mode(0o700)).unwrap();
    }
    let owner = std::fs::metadata(fs.high.join("etc")).unwrap().uid();
    let stranger = owner.wrapping_add(4242);
    let session = open(&fs)
        .await
        .with_credentials(Credentials::new(stranger, vec![stranger]));

    assert!(session.mkdir("etc/denied", 0o755).await.is_err());
    assert!(!fs.high.join("etc/denied").exists());
    assert!(session.unlink("etc/motd").await.is_err());
    assert!(fs.high.join("etc/motd").exists());
}

// ============================================================================
// Configuration
// ============================================================================

#[tokio::test]
async fn test_args_reproduce_the_chain() {
    let fs = layers();
    let mut config = UnionConfig::default();
    config.cache_size = 32;
    config.backends.push(BackendConfig {
        path: fs.low.clone(),
        writable: false,
        priority: 0,
    });
    let extra = fs.low.join("etc");
    let layers = parse(&[
        "--writable",
        "--priority=10",
        fs.high.to_str().unwrap(),
        extra.to_str().unwrap(),
    ]);
    let session = Session::open(config, &layers).await.unwrap();

    let args = session.args();
    assert_eq!(args[0], "--cache-size=32");

    let reparsed = parse(&args[1..].iter().map(String::as_str).collect::<Vec<_>>());
    let again = Session::open(UnionConfig::default(), &reparsed).await.unwrap();
    assert_eq!(again.args()[..], args[1..]);
}

#[tokio::test]
async fn test_remove_drops_configured_backend() {
    let fs = layers();
    let mut config = UnionConfig::default();
    config.backends.push(BackendConfig {
        path: fs.high.clone(),
        writable: false,
        priority: 0,
    });
    let layers = parse(&["--remove", fs.high.to_str().unwrap(), fs.low.to_str().unwrap()]);
    let session = Session::open(config, &layers).await.unwrap();
    assert_eq!(session.read("etc/motd").await.unwrap(), b"low motd\n");
    assert_eq!(session.union().chain().len(), 1);
}

#[tokio::test]
async fn test_stow_directory_is_merged_at_open() {
    let fs = layers();
    let stow = tempfile::tempdir().unwrap();
    write(stow.path(), "pkg-a/bin/a", "a");
    write(stow.path(), "pkg-b/bin/b", "b");
    write(stow.path(), "pkg-b/share/doc", "doc");

    let config = UnionConfig::from_toml(
        &format!(
            "[[stow]]\ndir = {:?}\nmatch = [\"bin\"]\n",
            stow.path().display().to_string()
        ),
        "inline",
    )
    .unwrap();
    let layers = parse(&[fs.low.to_str().unwrap()]);
    let session = Session::open(config, &layers).await.unwrap();

    let bin: Vec<_> = session.list("").await.unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(bin, vec!["a", "b", "etc"]);
}

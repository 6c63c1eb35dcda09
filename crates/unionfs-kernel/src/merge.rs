//! Directory merging.
//!
//! The merged listing of a directory is the union, by name, of the raw
//! listings of every backend that has the directory.

use indexmap::IndexMap;

use crate::node::Handle;
use crate::vfs::{FileType, VfsResult};

/// One name in a merged listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedEntry {
    pub name: String,
    pub ino: u64,
    pub kind: FileType,
}

/// Merge the listings under `handles`, highest priority first.
///
/// A name seen in several backends appears once. Its identity and type
/// come from the last backend scanned that has it, i.e. the lowest
/// priority one. Handles that are not directories are skipped; a listing
/// failure aborts the merge.
pub async fn merge(handles: &[Handle]) -> VfsResult<Vec<MergedEntry>> {
    let mut merged: IndexMap<String, MergedEntry> = IndexMap::new();

    for handle in handles {
        if !handle.is_dir() {
            tracing::trace!(path = %handle.path().display(), "skipping non-directory slot");
            continue;
        }
        let entries = handle.fs().readdir(handle.path()).await?;
        for entry in entries {
            if entry.name == "." || entry.name == ".." {
                continue;
            }
            match merged.get_mut(&entry.name) {
                Some(existing) => {
                    existing.ino = entry.ino;
                    existing.kind = entry.kind;
                }
                None => {
                    let name = entry.name.clone();
                    merged.insert(
                        name,
                        MergedEntry {
                            name: entry.name,
                            ino: entry.ino,
                            kind: entry.kind,
                        },
                    );
                }
            }
        }
    }

    Ok(merged.into_values().collect())
}

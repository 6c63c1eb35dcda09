//! Ordered chain of backing filesystems.
//!
//! The chain is sorted by non-increasing priority. Among equal priorities
//! the most recently registered entry comes first. Forward iteration is
//! the lookup/creation order; reverse iteration is the removal order.
//!
//! The chain only records membership. Opening the backends and rebuilding
//! the root slots happens in the reinitialization pass, so a registration
//! becomes visible to clients only after the next pass.

use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::vfs::{VfsError, VfsResult};

/// Default priority for a registered backend.
pub const DEFAULT_PRIORITY: i32 = 0;

/// One registered backing filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backing {
    path: Option<PathBuf>,
    writable: bool,
    priority: i32,
    seq: u64,
}

impl Backing {
    /// Root path, or `None` for the union's own underlying source.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Registration sequence number, unique per chain.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn is_underlying(&self) -> bool {
        self.path.is_none()
    }
}

impl fmt::Display for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{}", path.display())?,
            None => f.write_str("<underlying>")?,
        }
        write!(f, " (priority {}", self.priority)?;
        if self.writable {
            f.write_str(", writable")?;
        }
        f.write_str(")")
    }
}

#[derive(Debug, Default)]
struct ChainInner {
    entries: Vec<Backing>,
    next_seq: u64,
}

/// The backing filesystem chain. All mutation is serialized by one lock.
#[derive(Debug, Default)]
pub struct Chain {
    inner: Mutex<ChainInner>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend, keeping the chain sorted.
    ///
    /// The entry is placed before the first entry whose priority is not
    /// greater, so ties resolve last-in-first-out. Duplicate paths are
    /// allowed.
    pub fn register(&self, path: Option<PathBuf>, writable: bool, priority: i32) -> Backing {
        let mut inner = self.inner.lock();
        let backing = Backing {
            path,
            writable,
            priority,
            seq: inner.next_seq,
        };
        inner.next_seq += 1;

        let pos = inner
            .entries
            .iter()
            .position(|b| b.priority <= priority)
            .unwrap_or(inner.entries.len());
        inner.entries.insert(pos, backing.clone());

        tracing::info!(backend = %backing, index = pos, "registered backing filesystem");
        backing
    }

    /// Remove the first entry whose path matches exactly.
    pub fn unregister(&self, path: Option<&Path>) -> VfsResult<Backing> {
        let mut inner = self.inner.lock();
        let pos = inner
            .entries
            .iter()
            .position(|b| b.path.as_deref() == path)
            .ok_or_else(|| {
                VfsError::not_found(
                    path.map(|p| p.display().to_string())
                        .unwrap_or_else(|| "<underlying>".to_string()),
                )
            })?;
        let removed = inner.entries.remove(pos);
        tracing::info!(backend = %removed, "unregistered backing filesystem");
        Ok(removed)
    }

    /// Remove the entry with the given registration sequence number.
    pub fn remove_seq(&self, seq: u64) -> Option<Backing> {
        let mut inner = self.inner.lock();
        let pos = inner.entries.iter().position(|b| b.seq == seq)?;
        Some(inner.entries.remove(pos))
    }

    pub fn get_by_index(&self, index: usize) -> Option<Backing> {
        self.inner.lock().entries.get(index).cloned()
    }

    /// First entry with a matching path, with its index.
    pub fn get_by_path(&self, path: Option<&Path>) -> Option<(usize, Backing)> {
        self.inner
            .lock()
            .entries
            .iter()
            .enumerate()
            .find(|(_, b)| b.path.as_deref() == path)
            .map(|(i, b)| (i, b.clone()))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Snapshot, highest priority first.
    pub fn entries(&self) -> Vec<Backing> {
        self.inner.lock().entries.clone()
    }

    /// Snapshot, lowest priority first.
    pub fn entries_rev(&self) -> Vec<Backing> {
        let mut entries = self.entries();
        entries.reverse();
        entries
    }

    /// Run `f` with the lock held. The slice is highest priority first;
    /// use `.iter().rev()` for removal order.
    ///
    /// `f` must not call back into the chain.
    pub fn with_entries<R>(&self, f: impl FnOnce(&[Backing]) -> R) -> R {
        let inner = self.inner.lock();
        f(&inner.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(chain: &Chain) -> Vec<String> {
        chain
            .entries()
            .iter()
            .map(|b| b.path().map(|p| p.display().to_string()).unwrap_or_default())
            .collect()
    }

    fn assert_sorted(chain: &Chain) {
        chain.with_entries(|entries| {
            for pair in entries.windows(2) {
                assert!(
                    pair[0].priority() >= pair[1].priority(),
                    "chain out of order: {} before {}",
                    pair[0],
                    pair[1]
                );
            }
        });
    }

    #[test]
    fn test_equal_priority_is_lifo() {
        let chain = Chain::new();
        chain.register(Some("x".into()), false, 0);
        chain.register(Some("y".into()), false, 0);
        assert_eq!(paths(&chain), vec!["y", "x"]);
    }

    #[test]
    fn test_priority_order() {
        let chain = Chain::new();
        chain.register(Some("low".into()), false, -5);
        chain.register(Some("high".into()), true, 10);
        chain.register(Some("mid".into()), false, 0);
        assert_eq!(paths(&chain), vec!["high", "mid", "low"]);

        let rev: Vec<_> = chain.entries_rev().iter().map(|b| b.priority()).collect();
        assert_eq!(rev, vec![-5, 0, 10]);
        assert!(chain.get_by_index(0).unwrap().writable());
    }

    #[test]
    fn test_unregister_first_exact_match() {
        let chain = Chain::new();
        let first = chain.register(Some("dup".into()), false, 0);
        let second = chain.register(Some("dup".into()), false, 0);
        chain.register(None, false, 0);

        let removed = chain.unregister(Some(Path::new("dup"))).unwrap();
        assert_eq!(removed.seq(), second.seq());
        let (_, left) = chain.get_by_path(Some(Path::new("dup"))).unwrap();
        assert_eq!(left.seq(), first.seq());

        assert!(chain.unregister(None).unwrap().is_underlying());
        assert!(chain.unregister(Some(Path::new("missing"))).unwrap_err().is_not_found());
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_trailing_slash_is_same_path() {
        let chain = Chain::new();
        chain.register(Some("stow/pkg/".into()), false, 0);
        assert!(chain.unregister(Some(Path::new("stow/pkg"))).is_ok());
        assert!(chain.is_empty());
    }

    #[test]
    fn test_stays_sorted_under_churn() {
        let chain = Chain::new();
        // Small LCG so the sequence is deterministic.
        let mut state: u64 = 0x2545_f491;
        let mut next = || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) as i64
        };

        for round in 0..500 {
            let name = format!("fs{}", next() % 20);
            if next() % 3 == 0 {
                let _ = chain.unregister(Some(Path::new(&name)));
            } else {
                let priority = (next() % 11 - 5) as i32;
                chain.register(Some(name.into()), round % 2 == 0, priority);
            }
            assert_sorted(&chain);
        }
    }

    #[test]
    fn test_remove_seq() {
        let chain = Chain::new();
        let a = chain.register(Some("a".into()), false, 0);
        chain.register(Some("b".into()), false, 0);
        assert_eq!(chain.remove_seq(a.seq()).unwrap(), a);
        assert!(chain.remove_seq(a.seq()).is_none());
        assert_eq!(paths(&chain), vec!["b"]);
    }
}

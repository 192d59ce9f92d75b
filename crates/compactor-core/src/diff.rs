//! Diff and fingerprint helpers used to detect new compaction work.
//!
//! All three functions are pure. [`ordered_diff`] expects both inputs sorted
//! ascending by the same ordering; [`fingerprint`] expects an already sorted
//! path list and hashes the paths, never the payload bytes behind them.

use std::collections::HashSet;
use std::hash::Hash;

use sha1::{Digest, Sha1};

/// Elements present on one side only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff<T> {
    /// Present in the new side, absent from the old side.
    pub added: Vec<T>,
    /// Present in the old side, absent from the new side.
    pub removed: Vec<T>,
}

impl<T> Diff<T> {
    /// `true` when both sides hold the same elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl<T> Default for Diff<T> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            removed: Vec::new(),
        }
    }
}

/// Linear merge-scan diff of two ascending sequences.
///
/// Equal heads advance both cursors; a smaller `old` head is emitted as
/// removed; otherwise the `new` head is emitted as added. Remaining tails are
/// all removed (`old`) or all added (`new`). Output follows scan order.
pub fn ordered_diff<T: Ord + Clone>(old: &[T], new: &[T]) -> Diff<T> {
    let mut diff = Diff::default();
    let (mut i, mut j) = (0, 0);

    while i < old.len() && j < new.len() {
        match old[i].cmp(&new[j]) {
            std::cmp::Ordering::Equal => {
                i += 1;
                j += 1;
            }
            std::cmp::Ordering::Less => {
                diff.removed.push(old[i].clone());
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                diff.added.push(new[j].clone());
                j += 1;
            }
        }
    }

    diff.removed.extend_from_slice(&old[i..]);
    diff.added.extend_from_slice(&new[j..]);
    diff
}

/// Unordered diff: `added = new \ old`, `removed = old \ new`.
///
/// Output order follows the iteration order of the input sets.
pub fn set_diff<T: Eq + Hash + Clone>(old: &HashSet<T>, new: &HashSet<T>) -> Diff<T> {
    Diff {
        added: new.difference(old).cloned().collect(),
        removed: old.difference(new).cloned().collect(),
    }
}

/// SHA-1 hex digest over `path + "\n"` for each path, in the given order.
pub fn fingerprint<S: AsRef<str>>(sorted_paths: &[S]) -> String {
    let mut hasher = Sha1::new();
    for path in sorted_paths {
        hasher.update(path.as_ref().as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

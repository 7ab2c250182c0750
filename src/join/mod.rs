//! Key-Based Reconciliation
//!
//! Joins a left stream of `<id>:<key>` records against a right stream of `<key>:<value>`
//! records.
//!
//! ## Strategy
//!
//! 1. **Build Index**: read the whole right stream into a case-folded key map
//! 2. **Match**: stream the left side through the index, classifying each record
//! 3. **Reverse Sweep** (optional): report index entries no left record asked for
//!
//! Step 1 always completes before step 2 starts; the two sides are never streamed together.

pub mod index;
pub mod matcher;

use std::path::{Path, PathBuf};

pub use index::{canonical_key, normalize_key, IndexLayout, KeyIndex, KeyIndexBuilder};
pub use matcher::{JoinMatcher, JoinOutputs, MatchResult, MatchSink};

/// Output file locations for one join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinPaths {
    pub dir: PathBuf,
    pub matched: PathBuf,
    pub unmatched_left: PathBuf,
    pub unmatched_right: PathBuf,
    pub errors: PathBuf,
}

impl JoinPaths {
    /// `matched.txt`, `unmatched_left.txt`, `unmatched_right.txt`, `errors.txt` in `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::named(dir, "")
    }

    /// Same names with `<prefix>_` in front, for several joins sharing one directory.
    pub fn with_prefix(dir: &Path, prefix: &str) -> Self {
        Self::named(dir, &format!("{}_", prefix))
    }

    fn named(dir: &Path, lead: &str) -> Self {
        let file = |name: &str| dir.join(format!("{}{}.txt", lead, name));
        Self {
            dir: dir.to_path_buf(),
            matched: file("matched"),
            unmatched_left: file("unmatched_left"),
            unmatched_right: file("unmatched_right"),
            errors: file("errors"),
        }
    }
}

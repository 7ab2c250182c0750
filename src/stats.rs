//! Run counters
//!
//! One [`Stats`] value is owned by the coordinator for each job, passed by `&mut` to the
//! components that count, and handed back on success or inside [`crate::Aborted`].

use serde::Serialize;

use crate::sort_merge::BucketCounts;

/// Furthest stage a job reached.
///
/// Join jobs move `Idle → BuildingIndex → Matching → [ReverseSweep] → Done`; sort jobs move
/// `Idle → Partitioning → Sorting → Merging → Done`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Idle,
    BuildingIndex,
    Matching,
    ReverseSweep,
    Partitioning,
    Sorting,
    Merging,
    Done,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub stage: Stage,
    /// Lines read from the primary stream (join left side, or the sort input).
    pub processed: u64,
    pub matched: u64,
    pub unmatched_left: u64,
    pub unmatched_right: u64,
    /// Primary-stream lines diverted to the error sink.
    pub errored: u64,
    /// Right-side lines read while building the index.
    pub index_lines: u64,
    /// Distinct keys held by the index.
    pub index_entries: u64,
    /// Right-side lines diverted to the error sink.
    pub index_errored: u64,
    /// Records written to the merged sort output.
    pub written: u64,
    pub buckets: BucketCounts,
}

impl Stats {
    /// Sum counters from another job into this one. The stage is left untouched.
    pub fn absorb(&mut self, other: &Stats) {
        self.processed += other.processed;
        self.matched += other.matched;
        self.unmatched_left += other.unmatched_left;
        self.unmatched_right += other.unmatched_right;
        self.errored += other.errored;
        self.index_lines += other.index_lines;
        self.index_entries += other.index_entries;
        self.index_errored += other.index_errored;
        self.written += other.written;
        self.buckets.absorb(&other.buckets);
    }

    /// Every processed left record was classified exactly once.
    pub fn left_balanced(&self) -> bool {
        self.matched + self.unmatched_left + self.errored == self.processed
    }
}

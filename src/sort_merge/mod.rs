//! Bucketed External Sort
//!
//! Produces one globally ordered file from an input too large to sort in a single pass.
//!
//! ## Strategy
//!
//! 1. **Partition**: stream every line into one of nine key bands (or the error bucket)
//! 2. **Sort Buckets**: load each band fully, sort by (key desc, secondary asc), in parallel
//! 3. **Merge**: concatenate the sorted bands in a declared order into the output
//!
//! ## Memory Usage
//!
//! Partition and merge are streaming. Sorting holds one whole band per worker, each bounded
//! by the configured bucket budget; an oversized band is a hard failure, not a slowdown.

pub mod bucket_sort;
pub mod merge;
pub mod partition;

pub use bucket_sort::{sort_spills, BucketSorter, SortedBucket, SpillFile};
pub use merge::Merger;
pub use partition::{Bucket, BucketCounts, Partitioner, SortKey, SortRecord, BUCKET_COUNT};

//! kvrecon - reconcile and order large colon-delimited text datasets
//!
//! Two jobs, both streaming over files far larger than memory:
//!
//! - **Join** ([`pipeline::run_join`]): index a `key:value` file, stream an `id:key` file
//!   against it and split the records into matched, unmatched-left and unmatched-right
//!   outputs.
//! - **Sort** ([`pipeline::run_sort`]): order `integer:secondary` records by key descending
//!   and secondary ascending through fixed key bands, sorted in parallel and concatenated.
//!
//! Lines that cannot be used never stop a job; they are diverted to an errors file with
//! their origin, line number and reason. Jobs either commit every output or none.

pub mod config;
pub mod error;
pub mod join;
pub mod logging;
pub mod pipeline;
pub mod sort_merge;
pub mod stats;
pub mod stream;

pub use config::Config;
pub use error::{Aborted, ReconError, RecordError, Result};
pub use pipeline::{run_join, run_join_dir, run_join_pair, run_sort, BatchReport};
pub use stats::{Stage, Stats};

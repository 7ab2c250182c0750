//! Job configuration
//!
//! Everything tunable lives in [`Config`]. The CLI fills it from flags and `KVRECON_*`
//! environment variables; library callers start from [`Config::default`].

use serde::Serialize;

use crate::error::{ReconError, Result};
use crate::join::IndexLayout;
use crate::sort_merge::merge::validate_order;
use crate::sort_merge::Bucket;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

pub const DEFAULT_BUCKET_BUDGET: u64 = 2 * GIB;
pub const DEFAULT_INDEX_BUDGET: u64 = 4 * GIB;
pub const DEFAULT_BUFFER_SIZE: usize = 8 * MIB as usize;
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Config {
    /// Largest estimated in-memory footprint of one band during sorting.
    pub bucket_budget: u64,
    /// Largest estimated in-memory footprint of one join index.
    pub index_budget: u64,
    /// Capacity of every buffered reader and writer.
    pub buffer_size: usize,
    /// Worker threads for bucket sorting and batch joins. 0 means one per CPU.
    pub threads: usize,
    /// Lines between progress log events. 0 disables them.
    pub progress_interval: u64,
    /// Order in which sorted bands are concatenated.
    pub bucket_order: Vec<Bucket>,
    /// Emit never-matched index entries after matching.
    pub reverse_sweep: bool,
    /// Field layout of the right-hand (indexed) join input.
    pub index_layout: IndexLayout,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bucket_budget: DEFAULT_BUCKET_BUDGET,
            index_budget: DEFAULT_INDEX_BUDGET,
            buffer_size: DEFAULT_BUFFER_SIZE,
            threads: 0,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            bucket_order: Bucket::BANDS.to_vec(),
            reverse_sweep: true,
            index_layout: IndexLayout::KeyValue,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.bucket_budget == 0 {
            return Err(ReconError::usage("bucket budget must be greater than zero"));
        }
        if self.index_budget == 0 {
            return Err(ReconError::usage("index budget must be greater than zero"));
        }
        if self.buffer_size == 0 {
            return Err(ReconError::usage("buffer size must be greater than zero"));
        }
        validate_order(&self.bucket_order)
    }

    pub fn worker_threads(&self) -> usize {
        match self.threads {
            0 => num_cpus::get(),
            n => n,
        }
    }
}

/// Parse a byte size such as `512`, `64K`, `8M`, `2G` or `2GiB`. Suffixes are binary.
pub fn parse_size(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim();
    let digits = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (number, unit) = s.split_at(digits);
    let number: u64 = number
        .parse()
        .map_err(|_| format!("invalid size {:?}", s))?;
    let multiplier = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => KIB,
        "M" | "MB" | "MIB" => MIB,
        "G" | "GB" | "GIB" => GIB,
        other => return Err(format!("unknown size unit {:?}", other)),
    };
    number
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size {:?} overflows", s))
}

/// Parse a comma-separated bucket order, e.g. `1,2,3,4,5,6,7,8,9` or bucket names.
pub fn parse_bucket_order(s: &str) -> std::result::Result<Vec<Bucket>, String> {
    s.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(str::parse)
        .collect()
}

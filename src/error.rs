//! Error taxonomy
//!
//! Two tiers:
//! - [`RecordError`]: one line could not be used. Always recovered by diverting the line
//!   to an error sink and counting it.
//! - [`ReconError`]: the job cannot continue. Aborts that job only; other jobs running
//!   concurrently keep going.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::stats::Stats;

/// Why a single line was diverted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("invalid utf-8 after byte {valid_up_to}")]
    Decode { valid_up_to: usize },
    #[error("expected at least {expected} ':'-separated fields, found {found}")]
    FieldCount { expected: usize, found: usize },
    #[error("empty key")]
    EmptyKey,
    #[error("unparsable key {0:?}")]
    BadKey(String),
    #[error("key {0} outside every band")]
    KeyOutOfRange(String),
}

impl RecordError {
    /// Decode failures versus format failures, for reporting.
    pub fn is_decode(&self) -> bool {
        matches!(self, RecordError::Decode { .. })
    }
}

/// Job-level failure.
#[derive(Debug, Error)]
pub enum ReconError {
    /// Bad arguments or configuration. Nothing has been written.
    #[error("{0}")]
    Usage(String),

    #[error("failed to {op} {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A bucket or index would exceed its memory budget.
    #[error("{what} needs ~{needed} bytes in memory, budget is {budget} bytes")]
    Resource {
        what: String,
        needed: u64,
        budget: u64,
    },

    #[error("failed to start worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

impl ReconError {
    pub fn usage(msg: impl Into<String>) -> Self {
        ReconError::Usage(msg.into())
    }

    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        ReconError::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// Process exit code for this failure: 1 for usage, 2 for I/O and resource errors.
    pub fn exit_code(&self) -> i32 {
        match self {
            ReconError::Usage(_) => 1,
            _ => 2,
        }
    }
}

pub type Result<T, E = ReconError> = std::result::Result<T, E>;

/// Attach the failing operation and path to an `io::Error`.
pub trait IoContext<T> {
    fn at(self, op: &'static str, path: &Path) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at(self, op: &'static str, path: &Path) -> Result<T> {
        self.map_err(|source| ReconError::io(op, path, source))
    }
}

/// A job that stopped early, with the counters it had reached.
///
/// Outputs of an aborted job are never committed.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct Aborted {
    pub stats: Stats,
    #[source]
    pub error: ReconError,
}

impl Aborted {
    pub fn exit_code(&self) -> i32 {
        self.error.exit_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ReconError::usage("bad").exit_code(), 1);
        let io = ReconError::io(
            "open",
            "/nope",
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(io.exit_code(), 2);
        let resource = ReconError::Resource {
            what: "bucket 01_gte_1000".into(),
            needed: 10,
            budget: 5,
        };
        assert_eq!(resource.exit_code(), 2);
    }

    #[test]
    fn test_io_context_names_path() {
        let err: Result<()> = Err(io::Error::new(io::ErrorKind::NotFound, "gone"))
            .at("open", Path::new("/data/left.txt"));
        let msg = err.unwrap_err().to_string();
        assert!(msg.contains("open"));
        assert!(msg.contains("/data/left.txt"));
    }
}

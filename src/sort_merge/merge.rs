//! Step 3: Concatenate sorted bands into the final output
//!
//! The merger walks an explicitly declared bucket order and streams each band's sorted file
//! into the output with a bounded copy buffer. Nothing about the order comes from the
//! filesystem.
//!
//! ## Order
//!
//! The declared order must be a permutation of the nine bands. The default,
//! [`Bucket::BANDS`], is bucket-id order; ids were assigned from the highest band down, so
//! bucket-id order and descending key-band order are the same sequence and the default output
//! is globally sorted. Any other permutation produces band-wise sorted output in the order
//! given. The error bucket can never be merged.

use std::io::{self, Read, Write};

use tracing::debug;

use super::partition::Bucket;
use crate::error::{ReconError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Merger {
    order: Vec<Bucket>,
}

impl Default for Merger {
    fn default() -> Self {
        Self {
            order: Bucket::BANDS.to_vec(),
        }
    }
}

impl Merger {
    pub fn new(order: &[Bucket]) -> Result<Self> {
        validate_order(order)?;
        Ok(Self {
            order: order.to_vec(),
        })
    }

    pub fn order(&self) -> &[Bucket] {
        &self.order
    }

    /// Stream each band in declared order into `out`. `open` returns `None` for a band with
    /// no records. Returns bytes copied.
    pub fn merge<R, W, F>(&self, mut open: F, out: &mut W) -> io::Result<u64>
    where
        R: Read,
        W: Write,
        F: FnMut(Bucket) -> io::Result<Option<R>>,
    {
        let mut copied = 0;
        for &bucket in &self.order {
            if let Some(mut source) = open(bucket)? {
                let n = io::copy(&mut source, out)?;
                debug!(bucket = bucket.name(), bytes = n, "merged");
                copied += n;
            }
        }
        out.flush()?;
        Ok(copied)
    }
}

/// A merge order must name each of the nine bands exactly once.
pub fn validate_order(order: &[Bucket]) -> Result<()> {
    if order.contains(&Bucket::Error) {
        return Err(ReconError::usage("the error bucket cannot be merged"));
    }
    for band in Bucket::BANDS {
        match order.iter().filter(|&&b| b == band).count() {
            1 => {}
            0 => return Err(ReconError::usage(format!("bucket order is missing {}", band))),
            _ => return Err(ReconError::usage(format!("bucket order repeats {}", band))),
        }
    }
    Ok(())
}

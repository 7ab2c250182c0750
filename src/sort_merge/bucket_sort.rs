//! Step 2: Sort each band in memory
//!
//! A band is read back from its spill file in full, sorted by (key desc, secondary asc) and
//! written to its own sorted file. Bands are independent, so [`sort_spills`] sorts them on a
//! rayon pool; each worker owns exactly one output file.
//!
//! Memory is bounded per band: a band whose estimated footprint exceeds the budget fails
//! with [`ReconError::Resource`] before any of it is loaded.

use std::fs::File;
use std::io::{BufRead, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Instant;

use rayon::prelude::*;
use tracing::{debug, info};

use super::partition::{Bucket, SortRecord};
use crate::error::{IoContext, ReconError, Result};
use crate::stream::{LineReader, LineSink};

/// A band after sorting, ready for the merger.
#[derive(Debug)]
pub struct SortedBucket {
    pub bucket: Bucket,
    pub records: Vec<SortRecord>,
}

/// In-memory sorter with a per-band memory budget.
#[derive(Debug, Clone, Copy)]
pub struct BucketSorter {
    budget: u64,
}

impl BucketSorter {
    pub fn new(budget: u64) -> Self {
        Self { budget }
    }

    /// Fail fast when a band's estimated footprint is over budget.
    pub fn check(&self, bucket: Bucket, footprint: u64) -> Result<()> {
        if footprint > self.budget {
            return Err(ReconError::Resource {
                what: format!("bucket {}", bucket),
                needed: footprint,
                budget: self.budget,
            });
        }
        Ok(())
    }

    /// Read a whole spill into memory, re-checking the budget as records accumulate.
    pub fn load<R: BufRead>(
        &self,
        bucket: Bucket,
        mut reader: LineReader<R>,
        source: &Path,
    ) -> Result<Vec<SortRecord>> {
        let mut records = Vec::new();
        let mut footprint = 0u64;
        while let Some(line) = reader.next_line().at("read", source)? {
            // Spills only ever contain lines the partitioner already parsed.
            let record = line
                .text()
                .ok()
                .and_then(|text| SortRecord::parse(text.to_string()).ok())
                .ok_or_else(|| {
                    ReconError::io(
                        "parse spill",
                        source,
                        std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            format!("line {} is not a sort record", line.number),
                        ),
                    )
                })?;
            footprint += record.footprint();
            self.check(bucket, footprint)?;
            records.push(record);
        }
        Ok(records)
    }

    /// Stable sort of one band held in memory.
    pub fn sort(&self, bucket: Bucket, mut records: Vec<SortRecord>) -> Result<SortedBucket> {
        let footprint = records.iter().map(SortRecord::footprint).sum();
        self.check(bucket, footprint)?;
        records.sort_by(SortRecord::sort_cmp);
        Ok(SortedBucket { bucket, records })
    }
}

/// Where one band lives on disk before and after sorting.
#[derive(Debug, Clone)]
pub struct SpillFile {
    pub bucket: Bucket,
    pub spill: PathBuf,
    pub sorted: PathBuf,
    /// Estimated in-memory footprint recorded by the partitioner.
    pub footprint: u64,
}

/// Load, sort and write one band. Returns the number of records written.
pub fn sort_spill(sorter: &BucketSorter, spill: &SpillFile, capacity: usize) -> Result<u64> {
    sorter.check(spill.bucket, spill.footprint)?;
    let start = Instant::now();

    let reader = LineReader::open(&spill.spill, capacity)?;
    let records = sorter.load(spill.bucket, reader, &spill.spill)?;
    let sorted = sorter.sort(spill.bucket, records)?;

    let file = File::create(&spill.sorted).at("create", &spill.sorted)?;
    let mut sink = LineSink::new(BufWriter::with_capacity(capacity, file));
    for record in &sorted.records {
        sink.write_line(record.line().as_bytes())
            .at("write", &spill.sorted)?;
    }
    let written = sink.lines();
    sink.into_inner().at("flush", &spill.sorted)?;

    // The unsorted spill is no longer needed once its sorted copy exists.
    std::fs::remove_file(&spill.spill).at("remove", &spill.spill)?;

    debug!(
        bucket = spill.bucket.name(),
        records = written,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "bucket sorted"
    );
    Ok(written)
}

/// Sort every band concurrently. All budgets are checked up front so an oversized band
/// fails the job before any sorting work starts.
pub fn sort_spills(
    sorter: &BucketSorter,
    spills: &[SpillFile],
    capacity: usize,
    pool: &rayon::ThreadPool,
) -> Result<u64> {
    for spill in spills {
        sorter.check(spill.bucket, spill.footprint)?;
    }
    info!(
        buckets = spills.len(),
        threads = pool.current_num_threads(),
        "sorting buckets"
    );

    let results: Vec<Result<u64>> = pool.install(|| {
        spills
            .par_iter()
            .map(|spill| sort_spill(sorter, spill, capacity))
            .collect()
    });

    // First failure in bucket order, so the reported error does not depend on scheduling.
    let mut total = 0;
    for result in results {
        total += result?;
    }
    Ok(total)
}

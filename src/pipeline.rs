//! Job coordinator
//!
//! Wires the sort and join stages together, owns each job's [`Stats`] and decides what gets
//! committed. Every job is all-or-nothing: outputs are staged next to their targets and only
//! renamed into place once the last stage has finished, so an aborted job leaves no partial
//! results behind.
//!
//! Inputs are opened before anything is created on disk, so a missing input fails without
//! touching the output location.

use std::collections::btree_map::{BTreeMap, Entry};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Instant;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Aborted, IoContext, Result};
use crate::join::{JoinMatcher, JoinOutputs, JoinPaths, KeyIndexBuilder};
use crate::sort_merge::partition::PartitionOutcome;
use crate::sort_merge::{sort_spills, Bucket, BucketSorter, Merger, Partitioner, SpillFile};
use crate::stats::{Stage, Stats};
use crate::stream::{commit_all, parent_dir, ErrorSink, LineReader, StagedFile};

/// Where a sort job writes the lines it could not place: `<output>.errors`.
pub fn sort_error_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(".errors");
    PathBuf::from(name)
}

fn worker_pool(config: &Config) -> Result<rayon::ThreadPool> {
    Ok(rayon::ThreadPoolBuilder::new()
        .num_threads(config.worker_threads())
        .thread_name(|i| format!("kvrecon-{}", i))
        .build()?)
}

fn finish(
    job: &'static str,
    source: &Path,
    mut stats: Stats,
    outcome: Result<()>,
) -> std::result::Result<Stats, Aborted> {
    match outcome {
        Ok(()) => {
            stats.stage = Stage::Done;
            Ok(stats)
        }
        Err(error) => {
            warn!(
                job,
                source = %source.display(),
                stage = ?stats.stage,
                %error,
                "job aborted, nothing committed"
            );
            Err(Aborted { stats, error })
        }
    }
}

// ---------------------------------------------------------------------------
// Sort
// ---------------------------------------------------------------------------

/// Partition `input` into key bands, sort each band and merge them into `output`.
pub fn run_sort(
    input: &Path,
    output: &Path,
    config: &Config,
) -> std::result::Result<Stats, Aborted> {
    let mut stats = Stats::default();
    let outcome = sort_job(input, output, config, &mut stats);
    finish("sort", input, stats, outcome)
}

fn sort_job(input: &Path, output: &Path, config: &Config, stats: &mut Stats) -> Result<()> {
    config.validate()?;
    let merger = Merger::new(&config.bucket_order)?;
    let start = Instant::now();
    let capacity = config.buffer_size;

    let mut reader = LineReader::open(input, capacity)?;
    let parent = parent_dir(output);
    let work = tempfile::Builder::new()
        .prefix(".kvrecon-sort-")
        .tempdir_in(parent)
        .at("create work dir in", parent)?;
    let spill_path = |bucket: Bucket| work.path().join(format!("{}.spill", bucket.name()));
    let sorted_path = |bucket: Bucket| work.path().join(format!("{}.sorted", bucket.name()));

    let errors_path = sort_error_path(output);
    let errors = StagedFile::create(&errors_path, capacity)?;

    // Step 1: partition
    stats.stage = Stage::Partitioning;
    let mut partitioner = Partitioner::with_sinks(
        |bucket| File::create(spill_path(bucket)).map(|f| BufWriter::with_capacity(capacity, f)),
        errors,
    )
    .at("create spill files in", work.path())?;

    while let Some(line) = reader.next_line().at("read", input)? {
        let bucket = partitioner
            .route(line)
            .at("write partitions in", work.path())?;
        stats.processed += 1;
        stats.buckets.record(bucket);
        if bucket.is_error() {
            stats.errored += 1;
        }
        if config.progress_interval > 0 && stats.processed % config.progress_interval == 0 {
            info!(
                processed = stats.processed,
                errored = stats.errored,
                "partitioning"
            );
        }
    }

    let PartitionOutcome {
        counts,
        footprints,
        bands,
        errors,
    } = partitioner
        .finish()
        .at("flush partitions in", work.path())?;
    // Close the spill writers before they are read back.
    drop(bands);

    let spills: Vec<SpillFile> = Bucket::BANDS
        .iter()
        .filter(|&&bucket| counts.get(bucket) > 0)
        .map(|&bucket| SpillFile {
            bucket,
            spill: spill_path(bucket),
            sorted: sorted_path(bucket),
            footprint: footprints[bucket.index()],
        })
        .collect();

    // Step 2: sort bands
    stats.stage = Stage::Sorting;
    let pool = worker_pool(config)?;
    let sorter = BucketSorter::new(config.bucket_budget);
    sort_spills(&sorter, &spills, capacity, &pool)?;

    // Step 3: merge
    stats.stage = Stage::Merging;
    let mut out = StagedFile::create(output, capacity)?;
    let bytes = merger
        .merge(
            |bucket| {
                if counts.get(bucket) == 0 {
                    return Ok(None);
                }
                File::open(sorted_path(bucket))
                    .map(|f| Some(BufReader::with_capacity(capacity, f)))
            },
            &mut out,
        )
        .at("merge into", output)?;
    stats.written = counts.banded();

    commit_all(vec![out, errors])?;

    info!(
        input = %input.display(),
        output = %output.display(),
        processed = stats.processed,
        written = stats.written,
        errored = stats.errored,
        bytes,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "sort complete"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Join
// ---------------------------------------------------------------------------

/// Join `left` against `right`, writing the standard result files into `out_dir`.
pub fn run_join(
    left: &Path,
    right: &Path,
    out_dir: &Path,
    config: &Config,
) -> std::result::Result<Stats, Aborted> {
    run_join_pair(left, right, &JoinPaths::in_dir(out_dir), config)
}

/// Join `left` against `right`, writing to explicit output paths.
pub fn run_join_pair(
    left: &Path,
    right: &Path,
    paths: &JoinPaths,
    config: &Config,
) -> std::result::Result<Stats, Aborted> {
    let mut stats = Stats::default();
    let outcome = join_job(left, right, paths, config, &mut stats);
    finish("join", left, stats, outcome)
}

fn join_job(
    left: &Path,
    right: &Path,
    paths: &JoinPaths,
    config: &Config,
    stats: &mut Stats,
) -> Result<()> {
    config.validate()?;
    let start = Instant::now();
    let capacity = config.buffer_size;

    let right_reader = LineReader::open(right, capacity)?;
    let left_reader = LineReader::open(left, capacity)?;
    fs::create_dir_all(&paths.dir).at("create", &paths.dir)?;
    let mut errors =
        ErrorSink::new(StagedFile::create(&paths.errors, capacity)?).with_path(&paths.errors);

    // Step 1: the whole right side goes into the index before any left line is read.
    stats.stage = Stage::BuildingIndex;
    let index = KeyIndexBuilder::new(config.index_budget)
        .layout(config.index_layout)
        .progress_every(config.progress_interval)
        .build(right_reader, right, stats, &mut errors)?;

    // Step 2: stream the left side.
    stats.stage = Stage::Matching;
    let mut outputs = JoinOutputs::create(paths, capacity, config.reverse_sweep)?;
    let mut matcher = JoinMatcher::new(index).progress_every(config.progress_interval);
    matcher.match_stream(left_reader, left, stats, &mut outputs, &mut errors)?;

    // Step 3: leftovers from the right side.
    if config.reverse_sweep {
        stats.stage = Stage::ReverseSweep;
        matcher.reverse_sweep(stats, &mut outputs)?;
    }

    let (diverted, undecodable) = (errors.diverted(), errors.decode_errors());
    let mut staged = outputs.into_staged()?;
    staged.push(errors.into_inner().at("flush", &paths.errors)?);
    commit_all(staged)?;

    info!(
        left = %left.display(),
        right = %right.display(),
        matched = stats.matched,
        unmatched_left = stats.unmatched_left,
        unmatched_right = stats.unmatched_right,
        diverted,
        undecodable,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "join complete"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Batch join
// ---------------------------------------------------------------------------

/// Two input files sharing a name prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilePair {
    pub prefix: String,
    pub left: PathBuf,
    pub right: PathBuf,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Pairing {
    /// Sorted by prefix.
    pub pairs: Vec<FilePair>,
    pub unpaired_left: Vec<PathBuf>,
    pub unpaired_right: Vec<PathBuf>,
}

/// Pairing prefix of a file: its name up to the first `_`, or the whole stem when there is
/// no `_`.
pub fn file_prefix(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let prefix = match name.split_once('_') {
        Some((prefix, _)) => prefix,
        None => path.file_stem()?.to_str()?,
    };
    (!prefix.is_empty()).then(|| prefix.to_string())
}

fn prefixed_files(dir: &Path) -> Result<BTreeMap<String, PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).at("list", dir)? {
        let path = entry.at("list", dir)?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "txt") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut files = BTreeMap::new();
    for path in paths {
        let Some(prefix) = file_prefix(&path) else {
            debug!(file = %path.display(), "no usable prefix, skipped");
            continue;
        };
        match files.entry(prefix) {
            Entry::Vacant(slot) => {
                slot.insert(path);
            }
            Entry::Occupied(kept) => warn!(
                prefix = %kept.key(),
                kept = %kept.get().display(),
                skipped = %path.display(),
                "duplicate prefix"
            ),
        }
    }
    Ok(files)
}

/// Match `.txt` files in two directories by prefix.
pub fn pair_files(left_dir: &Path, right_dir: &Path) -> Result<Pairing> {
    let left = prefixed_files(left_dir)?;
    let mut right = prefixed_files(right_dir)?;

    let mut pairing = Pairing::default();
    for (prefix, left) in left {
        match right.remove(&prefix) {
            Some(right) => pairing.pairs.push(FilePair {
                prefix,
                left,
                right,
            }),
            None => pairing.unpaired_left.push(left),
        }
    }
    pairing.unpaired_right = right.into_values().collect();
    Ok(pairing)
}

/// Outcome of one pair in a batch.
#[derive(Debug)]
pub struct PairReport {
    pub pair: FilePair,
    pub result: std::result::Result<Stats, Aborted>,
}

impl PairReport {
    pub fn stats(&self) -> &Stats {
        match &self.result {
            Ok(stats) => stats,
            Err(aborted) => &aborted.stats,
        }
    }
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub pairs: Vec<PairReport>,
    pub unpaired_left: Vec<PathBuf>,
    pub unpaired_right: Vec<PathBuf>,
}

impl BatchReport {
    /// Counters summed over every pair, including aborted ones.
    pub fn totals(&self) -> Stats {
        let mut totals = Stats::default();
        for report in &self.pairs {
            totals.absorb(report.stats());
        }
        totals
    }

    pub fn failures(&self) -> impl Iterator<Item = (&FilePair, &Aborted)> + '_ {
        self.pairs.iter().filter_map(|report| match &report.result {
            Ok(_) => None,
            Err(aborted) => Some((&report.pair, aborted)),
        })
    }

    /// Worst exit code among the pairs, 0 when all of them finished.
    pub fn exit_code(&self) -> i32 {
        self.failures()
            .map(|(_, aborted)| aborted.exit_code())
            .max()
            .unwrap_or(0)
    }

    pub fn summary(&self) -> BatchSummary<'_> {
        BatchSummary {
            totals: self.totals(),
            jobs: self
                .pairs
                .iter()
                .map(|report| JobSummary {
                    pair: &report.pair,
                    stats: report.stats(),
                    error: report.result.as_ref().err().map(|a| a.error.to_string()),
                })
                .collect(),
            unpaired_left: &self.unpaired_left,
            unpaired_right: &self.unpaired_right,
        }
    }
}

/// Serializable view of a [`BatchReport`].
#[derive(Debug, Serialize)]
pub struct BatchSummary<'a> {
    pub totals: Stats,
    pub jobs: Vec<JobSummary<'a>>,
    pub unpaired_left: &'a [PathBuf],
    pub unpaired_right: &'a [PathBuf],
}

#[derive(Debug, Serialize)]
pub struct JobSummary<'a> {
    #[serde(flatten)]
    pub pair: &'a FilePair,
    pub stats: &'a Stats,
    pub error: Option<String>,
}

/// Join every prefix pair from two directories, each as an independent job.
///
/// A failing pair is reported in the [`BatchReport`] and does not stop the others. Only
/// problems with the directories themselves fail the whole batch.
pub fn run_join_dir(
    left_dir: &Path,
    right_dir: &Path,
    out_dir: &Path,
    config: &Config,
) -> Result<BatchReport> {
    config.validate()?;
    let pairing = pair_files(left_dir, right_dir)?;
    for path in &pairing.unpaired_left {
        warn!(file = %path.display(), "no matching right file, skipped");
    }
    for path in &pairing.unpaired_right {
        debug!(file = %path.display(), "right file without left partner");
    }
    fs::create_dir_all(out_dir).at("create", out_dir)?;

    let pool = worker_pool(config)?;
    info!(
        pairs = pairing.pairs.len(),
        threads = pool.current_num_threads(),
        "batch join"
    );
    let pairs: Vec<PairReport> = pool.install(|| {
        pairing
            .pairs
            .into_par_iter()
            .map(|pair| {
                let paths = JoinPaths::with_prefix(out_dir, &pair.prefix);
                let result = run_join_pair(&pair.left, &pair.right, &paths, config);
                PairReport { pair, result }
            })
            .collect()
    });

    Ok(BatchReport {
        pairs,
        unpaired_left: pairing.unpaired_left,
        unpaired_right: pairing.unpaired_right,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_error_path() {
        assert_eq!(
            sort_error_path(Path::new("out/sorted.txt")),
            Path::new("out/sorted.txt.errors")
        );
    }

    #[test]
    fn test_file_prefix() {
        assert_eq!(file_prefix(Path::new("d/07_left.txt")), Some("07".into()));
        assert_eq!(file_prefix(Path::new("d/a_b_c.txt")), Some("a".into()));
        assert_eq!(file_prefix(Path::new("d/plain.txt")), Some("plain".into()));
        assert_eq!(file_prefix(Path::new("d/_x.txt")), None);
    }

    #[test]
    fn test_pair_files() {
        let left = tempfile::tempdir().unwrap();
        let right = tempfile::tempdir().unwrap();
        for name in ["01_a.txt", "02_a.txt", "03_a.txt", "notes.md", "01_b.txt"] {
            fs::write(left.path().join(name), "").unwrap();
        }
        for name in ["01_x.txt", "03_x.txt", "04_x.txt"] {
            fs::write(right.path().join(name), "").unwrap();
        }

        let pairing = pair_files(left.path(), right.path()).unwrap();

        let prefixes: Vec<&str> = pairing.pairs.iter().map(|p| p.prefix.as_str()).collect();
        assert_eq!(prefixes, vec!["01", "03"]);
        // First file by name wins a duplicate prefix.
        assert_eq!(pairing.pairs[0].left, left.path().join("01_a.txt"));
        assert_eq!(pairing.pairs[0].right, right.path().join("01_x.txt"));
        assert_eq!(pairing.unpaired_left, vec![left.path().join("02_a.txt")]);
        assert_eq!(pairing.unpaired_right, vec![right.path().join("04_x.txt")]);
    }

    #[test]
    fn test_pair_files_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let err = pair_files(&dir.path().join("nope"), dir.path()).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}

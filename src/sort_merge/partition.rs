//! Step 1: Partition records into fixed key bands
//!
//! Each sort-input line is `<integer-key>:<secondary>[:...]`. The key picks exactly one of
//! nine half-open bands (lower bound inclusive) or the catch-all error bucket:
//!
//! | id | bucket | keys |
//! |----|--------|------|
//! | 01 | `Gte1000` | `>= 1000` |
//! | 02 | `Gte500`  | `[500, 1000)` |
//! | 03 | `Gte50`   | `[50, 500)` |
//! | 04 | `Gte25`   | `[25, 50)` |
//! | 05 | `Gte10`   | `[10, 25)` |
//! | 06 | `Gte5`    | `[5, 10)` |
//! | 07 | `Gte3`    | `[3, 5)` |
//! | 08 | `Eq2`     | `2` |
//! | 09 | `Eq1`     | `1` |
//! | –  | `Error`   | everything else, unparsable keys, undecodable lines |
//!
//! Keys are integers of any size. Values outside `i64` are kept as their digits: positive
//! ones fall in `Gte1000`, negative ones in `Error`.

use std::cmp::Ordering;
use std::fmt;
use std::io::{self, Write};
use std::mem;
use std::ops::Range;
use std::str::FromStr;

use memchr::memchr;
use serde::ser::{Serialize, SerializeMap, Serializer};
use tracing::info;

use crate::error::RecordError;
use crate::stream::{ErrorSink, Line, LineSink};

pub const BUCKET_COUNT: usize = 10;

/// Partition identity. Declaration order is bucket-id order, which is also descending key
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Bucket {
    Gte1000,
    Gte500,
    Gte50,
    Gte25,
    Gte10,
    Gte5,
    Gte3,
    Eq2,
    Eq1,
    Error,
}

impl Bucket {
    /// The nine key bands in bucket-id order.
    pub const BANDS: [Bucket; 9] = [
        Bucket::Gte1000,
        Bucket::Gte500,
        Bucket::Gte50,
        Bucket::Gte25,
        Bucket::Gte10,
        Bucket::Gte5,
        Bucket::Gte3,
        Bucket::Eq2,
        Bucket::Eq1,
    ];

    pub const ALL: [Bucket; BUCKET_COUNT] = [
        Bucket::Gte1000,
        Bucket::Gte500,
        Bucket::Gte50,
        Bucket::Gte25,
        Bucket::Gte10,
        Bucket::Gte5,
        Bucket::Gte3,
        Bucket::Eq2,
        Bucket::Eq1,
        Bucket::Error,
    ];

    /// Band for a key that fits `i64`. Keys below 1 land in `Error`.
    pub fn for_key(key: i64) -> Bucket {
        match key {
            k if k >= 1000 => Bucket::Gte1000,
            500..=999 => Bucket::Gte500,
            50..=499 => Bucket::Gte50,
            25..=49 => Bucket::Gte25,
            10..=24 => Bucket::Gte10,
            5..=9 => Bucket::Gte5,
            3..=4 => Bucket::Gte3,
            2 => Bucket::Eq2,
            1 => Bucket::Eq1,
            _ => Bucket::Error,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// 1-based bucket id; the error bucket has none.
    pub fn id(self) -> Option<usize> {
        (!self.is_error()).then(|| self.index() + 1)
    }

    pub fn is_error(self) -> bool {
        self == Bucket::Error
    }

    /// Stable name, also used for spill files.
    pub fn name(self) -> &'static str {
        match self {
            Bucket::Gte1000 => "01_gte_1000",
            Bucket::Gte500 => "02_gte_500_lt_1000",
            Bucket::Gte50 => "03_gte_50_lt_500",
            Bucket::Gte25 => "04_gte_25_lt_50",
            Bucket::Gte10 => "05_gte_10_lt_25",
            Bucket::Gte5 => "06_gte_5_lt_10",
            Bucket::Gte3 => "07_gte_3_lt_5",
            Bucket::Eq2 => "08_equals_2",
            Bucket::Eq1 => "09_equals_1",
            Bucket::Error => "error",
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for Bucket {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl FromStr for Bucket {
    type Err = String;

    /// Accepts a full name (`03_gte_50_lt_500`), a 1-based id (`3`, `03`) or `error`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(bucket) = Bucket::ALL.iter().find(|b| b.name() == s) {
            return Ok(*bucket);
        }
        match s.parse::<usize>() {
            Ok(id @ 1..=9) => Ok(Bucket::BANDS[id - 1]),
            _ => Err(format!("unknown bucket {:?}", s)),
        }
    }
}

/// Per-bucket counters indexed by [`Bucket::index`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketCounts([u64; BUCKET_COUNT]);

impl BucketCounts {
    pub fn get(&self, bucket: Bucket) -> u64 {
        self.0[bucket.index()]
    }

    pub fn record(&mut self, bucket: Bucket) {
        self.0[bucket.index()] += 1;
    }

    pub fn total(&self) -> u64 {
        self.0.iter().sum()
    }

    /// Records in the nine bands, excluding the error bucket.
    pub fn banded(&self) -> u64 {
        self.total() - self.get(Bucket::Error)
    }

    pub fn absorb(&mut self, other: &BucketCounts) {
        for (mine, theirs) in self.0.iter_mut().zip(other.0.iter()) {
            *mine += theirs;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Bucket, u64)> + '_ {
        Bucket::ALL.iter().map(move |&b| (b, self.get(b)))
    }
}

impl Serialize for BucketCounts {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(BUCKET_COUNT))?;
        for (bucket, count) in self.iter() {
            map.serialize_entry(bucket.name(), &count)?;
        }
        map.end()
    }
}

/// Integer sort key of unbounded size.
///
/// Variant order is numeric order: every `Below` is less than every `Int`, which is less than
/// every `Above`. Out-of-range keys hold their magnitude digits without sign or leading zeros.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortKey {
    /// Less than `i64::MIN`.
    Below(String),
    Int(i64),
    /// Greater than `i64::MAX`.
    Above(String),
}

impl SortKey {
    pub fn parse(text: &str) -> Option<SortKey> {
        let text = text.trim_ascii();
        if let Ok(key) = text.parse::<i64>() {
            return Some(SortKey::Int(key));
        }
        let (negative, digits) = match text.as_bytes().first()? {
            b'-' => (true, &text[1..]),
            b'+' => (false, &text[1..]),
            _ => (false, text),
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let magnitude = digits.trim_start_matches('0').to_string();
        Some(if negative {
            SortKey::Below(magnitude)
        } else {
            SortKey::Above(magnitude)
        })
    }

    pub fn bucket(&self) -> Bucket {
        match self {
            SortKey::Int(key) => Bucket::for_key(*key),
            SortKey::Above(_) => Bucket::Gte1000,
            SortKey::Below(_) => Bucket::Error,
        }
    }
}

fn magnitude_cmp(a: &str, b: &str) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        use SortKey::*;
        match (self, other) {
            (Int(a), Int(b)) => a.cmp(b),
            (Above(a), Above(b)) => magnitude_cmp(a, b),
            (Below(a), Below(b)) => magnitude_cmp(b, a),
            (Below(_), _) | (_, Above(_)) => Ordering::Less,
            (Above(_), _) | (_, Below(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<i64> for SortKey {
    fn from(key: i64) -> Self {
        SortKey::Int(key)
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortKey::Int(key) => write!(f, "{}", key),
            SortKey::Above(digits) => f.write_str(digits),
            SortKey::Below(digits) => write!(f, "-{}", digits),
        }
    }
}

/// A decoded sort-input line with its parsed key.
///
/// The original line is kept intact; the secondary field is a range into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortRecord {
    pub key: SortKey,
    line: String,
    secondary: Range<usize>,
}

impl SortRecord {
    pub fn parse(line: String) -> Result<Self, (String, RecordError)> {
        let Some(colon) = memchr(b':', line.as_bytes()) else {
            return Err((line, RecordError::FieldCount { expected: 2, found: 1 }));
        };
        let Some(key) = SortKey::parse(&line[..colon]) else {
            let raw = line[..colon].to_string();
            return Err((line, RecordError::BadKey(raw)));
        };
        let start = colon + 1;
        let end = memchr(b':', &line.as_bytes()[start..]).map_or(line.len(), |i| start + i);
        Ok(Self {
            key,
            line,
            secondary: start..end,
        })
    }

    pub fn line(&self) -> &str {
        &self.line
    }

    pub fn secondary(&self) -> &str {
        &self.line[self.secondary.clone()]
    }

    /// Estimated heap + inline bytes while held in a bucket.
    pub fn footprint(&self) -> u64 {
        let digits = match &self.key {
            SortKey::Int(_) => 0,
            SortKey::Above(d) | SortKey::Below(d) => d.len(),
        };
        footprint_of(self.line.len() + digits)
    }

    /// Key descending, then secondary field ascending by bytes.
    pub fn sort_cmp(&self, other: &Self) -> Ordering {
        other
            .key
            .cmp(&self.key)
            .then_with(|| self.secondary().as_bytes().cmp(other.secondary().as_bytes()))
    }
}

/// In-memory cost of a record whose line is `line_len` bytes long.
pub fn footprint_of(line_len: usize) -> u64 {
    (mem::size_of::<SortRecord>() + line_len) as u64
}

/// Decide the bucket for one raw line. Returns the decoded record for band buckets.
pub fn classify(line: &Line) -> Result<(Bucket, SortRecord), RecordError> {
    let text = line.text()?;
    let record = SortRecord::parse(text.to_string()).map_err(|(_, e)| e)?;
    match record.key.bucket() {
        Bucket::Error => Err(RecordError::KeyOutOfRange(record.key.to_string())),
        bucket => Ok((bucket, record)),
    }
}

/// Result of a finished partition pass.
pub struct PartitionOutcome<W: Write, E: Write> {
    pub counts: BucketCounts,
    /// Estimated in-memory footprint of each band, indexed by [`Bucket::index`].
    pub footprints: [u64; BUCKET_COUNT],
    pub bands: Vec<(Bucket, W)>,
    pub errors: E,
}

/// Streams lines into one writer per band plus an error sink.
pub struct Partitioner<W: Write, E: Write> {
    bands: Vec<LineSink<W>>,
    errors: ErrorSink<E>,
    counts: BucketCounts,
    footprints: [u64; BUCKET_COUNT],
}

impl<W: Write, E: Write> Partitioner<W, E> {
    /// `open` is called once per band, in [`Bucket::BANDS`] order.
    pub fn with_sinks<F>(mut open: F, errors: E) -> io::Result<Self>
    where
        F: FnMut(Bucket) -> io::Result<W>,
    {
        let bands = Bucket::BANDS
            .iter()
            .map(|&b| open(b).map(LineSink::new))
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Self {
            bands,
            errors: ErrorSink::new(errors),
            counts: BucketCounts::default(),
            footprints: [0; BUCKET_COUNT],
        })
    }

    /// Route one line. Malformed lines go to the error bucket; only write failures are errors.
    pub fn route(&mut self, line: Line) -> io::Result<Bucket> {
        let bucket = match classify(&line) {
            Ok((bucket, record)) => {
                self.bands[bucket.index()].write_line(record.line().as_bytes())?;
                self.footprints[bucket.index()] += record.footprint();
                bucket
            }
            Err(reason) => {
                self.errors.divert("input", &line, &reason)?;
                Bucket::Error
            }
        };
        self.counts.record(bucket);
        Ok(bucket)
    }

    /// Flush every sink and log per-bucket counts.
    pub fn finish(self) -> io::Result<PartitionOutcome<W, E>> {
        for (bucket, count) in self.counts.iter() {
            info!(bucket = bucket.name(), records = count, "partitioned");
        }
        let bands = Bucket::BANDS
            .iter()
            .copied()
            .zip(self.bands)
            .map(|(b, sink)| sink.into_inner().map(|w| (b, w)))
            .collect::<io::Result<Vec<_>>>()?;
        Ok(PartitionOutcome {
            counts: self.counts,
            footprints: self.footprints,
            bands,
            errors: self.errors.into_inner()?,
        })
    }
}

//! Step 2: Stream the left-hand input against the index
//!
//! Every left line becomes exactly one [`MatchResult`] or one error-sink entry. An optional
//! reverse sweep afterwards reports index entries no left line asked for, which turns the
//! left filter into a full symmetric difference.

use std::io::{BufRead, Write};
use std::path::Path;

use tracing::info;

use super::index::{canonical_key, normalize_key, KeyIndex};
use super::JoinPaths;
use crate::error::{IoContext, RecordError, Result};
use crate::stats::Stats;
use crate::stream::{ErrorSink, Line, LineReader, LineSink, StagedFile};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchResult {
    /// `<id>:<KEY>:<value>`
    Matched { id: String, key: String, value: String },
    /// `<id>:<KEY>`
    UnmatchedLeft { id: String, key: String },
    /// `<KEY>:<value>`
    UnmatchedRight { key: String, value: String },
}

impl MatchResult {
    /// Output fields in write order.
    pub fn fields(&self) -> Vec<&str> {
        match self {
            MatchResult::Matched { id, key, value } => vec![id.as_str(), key.as_str(), value.as_str()],
            MatchResult::UnmatchedLeft { id, key } => vec![id.as_str(), key.as_str()],
            MatchResult::UnmatchedRight { key, value } => vec![key.as_str(), value.as_str()],
        }
    }

    pub fn key(&self) -> &str {
        match self {
            MatchResult::Matched { key, .. }
            | MatchResult::UnmatchedLeft { key, .. }
            | MatchResult::UnmatchedRight { key, .. } => key,
        }
    }
}

/// Destination for classified records.
pub trait MatchSink {
    fn accept(&mut self, result: MatchResult) -> Result<()>;
}

impl MatchSink for Vec<MatchResult> {
    fn accept(&mut self, result: MatchResult) -> Result<()> {
        self.push(result);
        Ok(())
    }
}

/// Split a left line into (id, key) on its first ':'.
pub fn parse_left(line: &Line) -> std::result::Result<(&str, &str), RecordError> {
    let text = line.text()?;
    let (id, key) = text.split_once(':').ok_or(RecordError::FieldCount {
        expected: 2,
        found: 1,
    })?;
    if key.trim().is_empty() {
        return Err(RecordError::EmptyKey);
    }
    Ok((id, key))
}

/// Matches left records against a finished index.
///
/// Only constructible from a [`KeyIndex`], so matching cannot begin before the index build
/// has consumed its whole stream.
pub struct JoinMatcher {
    index: KeyIndex,
    progress_every: u64,
}

impl JoinMatcher {
    pub fn new(index: KeyIndex) -> Self {
        Self {
            index,
            progress_every: 0,
        }
    }

    pub fn progress_every(mut self, lines: u64) -> Self {
        self.progress_every = lines;
        self
    }

    pub fn match_line<S: MatchSink, E: Write>(
        &mut self,
        line: &Line,
        stats: &mut Stats,
        sink: &mut S,
        errors: &mut ErrorSink<E>,
    ) -> Result<()> {
        stats.processed += 1;
        let (id, key) = match parse_left(line) {
            Ok(fields) => fields,
            Err(reason) => {
                stats.errored += 1;
                return errors
                    .divert("left", line, &reason)
                    .at("write", errors.path());
            }
        };

        let result = match self.index.visit(&normalize_key(key)) {
            Some(value) => {
                stats.matched += 1;
                MatchResult::Matched {
                    id: id.to_string(),
                    key: canonical_key(key),
                    value: value.to_string(),
                }
            }
            None => {
                stats.unmatched_left += 1;
                MatchResult::UnmatchedLeft {
                    id: id.to_string(),
                    key: canonical_key(key),
                }
            }
        };
        sink.accept(result)
    }

    pub fn match_stream<R: BufRead, S: MatchSink, E: Write>(
        &mut self,
        mut reader: LineReader<R>,
        source: &Path,
        stats: &mut Stats,
        sink: &mut S,
        errors: &mut ErrorSink<E>,
    ) -> Result<()> {
        while let Some(line) = reader.next_line().at("read", source)? {
            self.match_line(&line, stats, sink, errors)?;
            if self.progress_every > 0 && stats.processed % self.progress_every == 0 {
                info!(
                    processed = stats.processed,
                    matched = stats.matched,
                    unmatched = stats.unmatched_left,
                    "matching"
                );
            }
        }
        info!(
            source = %source.display(),
            processed = stats.processed,
            matched = stats.matched,
            unmatched_left = stats.unmatched_left,
            errored = stats.errored,
            "left stream done"
        );
        Ok(())
    }

    /// Emit every index entry no left record looked up, in right-stream order.
    pub fn reverse_sweep<S: MatchSink>(self, stats: &mut Stats, sink: &mut S) -> Result<()> {
        for (key, value) in self.index.into_unvisited() {
            stats.unmatched_right += 1;
            sink.accept(MatchResult::UnmatchedRight {
                key: canonical_key(&key),
                value,
            })?;
        }
        info!(unmatched_right = stats.unmatched_right, "reverse sweep done");
        Ok(())
    }
}

/// The join's result files. Without a reverse sweep no unmatched-right file is created.
pub struct JoinOutputs {
    matched: LineSink<StagedFile>,
    unmatched_left: LineSink<StagedFile>,
    unmatched_right: Option<LineSink<StagedFile>>,
}

impl JoinOutputs {
    pub fn create(paths: &JoinPaths, capacity: usize, reverse_sweep: bool) -> Result<Self> {
        let unmatched_right = if reverse_sweep {
            Some(LineSink::new(StagedFile::create(
                &paths.unmatched_right,
                capacity,
            )?))
        } else {
            None
        };
        Ok(Self {
            matched: LineSink::new(StagedFile::create(&paths.matched, capacity)?),
            unmatched_left: LineSink::new(StagedFile::create(&paths.unmatched_left, capacity)?),
            unmatched_right,
        })
    }

    /// Hand back the staged files, ready for [`commit_all`](crate::stream::commit_all).
    pub fn into_staged(self) -> Result<Vec<StagedFile>> {
        let sinks = [Some(self.matched), Some(self.unmatched_left), self.unmatched_right];
        sinks
            .into_iter()
            .flatten()
            .map(|sink| {
                let target = sink.get_ref().target().to_path_buf();
                sink.into_inner().at("flush", &target)
            })
            .collect()
    }
}

impl MatchSink for JoinOutputs {
    fn accept(&mut self, result: MatchResult) -> Result<()> {
        let sink = match result {
            MatchResult::Matched { .. } => &mut self.matched,
            MatchResult::UnmatchedLeft { .. } => &mut self.unmatched_left,
            MatchResult::UnmatchedRight { .. } => match self.unmatched_right.as_mut() {
                Some(sink) => sink,
                None => return Ok(()),
            },
        };
        sink.write_fields(&result.fields())
            .at("write", sink.get_ref().target())
    }
}

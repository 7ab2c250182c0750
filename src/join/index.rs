//! Step 1: Build the key index from the right-hand stream
//!
//! The whole right-hand dataset is held in memory, keyed by the normalized key. This is the
//! job's memory contract: the index is bounded by a budget and building fails with
//! [`ReconError::Resource`] rather than growing past it.
//!
//! Case folding is ASCII-only: `é` and `É` are different keys, and non-ASCII bytes pass
//! through to the output unchanged.

use std::io::{BufRead, Write};
use std::mem;
use std::path::Path;

use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::info;

use crate::error::{IoContext, ReconError, RecordError, Result};
use crate::stats::Stats;
use crate::stream::{ErrorSink, Line, LineReader};

/// Lookup form of a key: surrounding whitespace removed, ASCII case folded.
pub fn normalize_key(key: &str) -> String {
    key.trim().to_ascii_lowercase()
}

/// Output form of a key.
pub fn canonical_key(key: &str) -> String {
    key.trim().to_ascii_uppercase()
}

/// Field layout of the indexed stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IndexLayout {
    /// `<key>:<value>`, indexed as key → value.
    #[default]
    KeyValue,
    /// `<id>:<key>`, indexed as key → id.
    IdKey,
}

impl IndexLayout {
    /// Split a line on its first ':' into (key, value) for this layout.
    pub fn split<'a>(self, line: &'a Line) -> std::result::Result<(&'a str, &'a str), RecordError> {
        let text = line.text()?;
        let (first, second) = text.split_once(':').ok_or(RecordError::FieldCount {
            expected: 2,
            found: 1,
        })?;
        let (key, value) = match self {
            IndexLayout::KeyValue => (first, second),
            IndexLayout::IdKey => (second, first),
        };
        if key.trim().is_empty() {
            return Err(RecordError::EmptyKey);
        }
        Ok((key, value))
    }
}

impl std::str::FromStr for IndexLayout {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "key-value" | "kv" => Ok(IndexLayout::KeyValue),
            "id-key" => Ok(IndexLayout::IdKey),
            other => Err(format!("unknown index layout {:?} (key-value, id-key)", other)),
        }
    }
}

#[derive(Debug)]
struct Slot {
    value: String,
    /// Position of the key's first insertion.
    order: u64,
    looked_up: bool,
}

/// Per-entry bookkeeping beyond the key and value bytes.
const SLOT_OVERHEAD: u64 = (mem::size_of::<String>() + mem::size_of::<Slot>() + 8) as u64;

fn entry_footprint(key_len: usize, value_len: usize) -> u64 {
    SLOT_OVERHEAD + key_len as u64 + value_len as u64
}

/// Normalized key → value, populated once by [`KeyIndexBuilder`].
#[derive(Debug, Default)]
pub struct KeyIndex {
    map: FxHashMap<String, Slot>,
    footprint: u64,
}

impl KeyIndex {
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Estimated in-memory bytes.
    pub fn footprint(&self) -> u64 {
        self.footprint
    }

    /// Read-only lookup by raw key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(&normalize_key(key)).map(|s| s.value.as_str())
    }

    /// Lookup by normalized key, remembering that the key was asked for.
    pub(crate) fn visit(&mut self, normalized: &str) -> Option<&str> {
        self.map.get_mut(normalized).map(|slot| {
            slot.looked_up = true;
            slot.value.as_str()
        })
    }

    /// Entries never visited, in first-insertion order.
    pub(crate) fn into_unvisited(self) -> Vec<(String, String)> {
        let mut rest: Vec<(u64, String, String)> = self
            .map
            .into_iter()
            .filter(|(_, slot)| !slot.looked_up)
            .map(|(key, slot)| (slot.order, key, slot.value))
            .collect();
        rest.sort_unstable_by_key(|(order, _, _)| *order);
        rest.into_iter().map(|(_, key, value)| (key, value)).collect()
    }
}

pub struct KeyIndexBuilder {
    index: KeyIndex,
    budget: u64,
    layout: IndexLayout,
    progress_every: u64,
    inserted: u64,
}

impl KeyIndexBuilder {
    pub fn new(budget: u64) -> Self {
        Self {
            index: KeyIndex::default(),
            budget,
            layout: IndexLayout::default(),
            progress_every: 0,
            inserted: 0,
        }
    }

    pub fn layout(mut self, layout: IndexLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn progress_every(mut self, lines: u64) -> Self {
        self.progress_every = lines;
        self
    }

    /// Insert one pair. A repeated key keeps its original position but takes the new value.
    pub fn insert(&mut self, key: &str, value: &str) -> Result<()> {
        let key = normalize_key(key);
        let budget = self.budget;
        let index = &mut self.index;

        let needed = match index.map.get(&key) {
            Some(slot) => index.footprint - slot.value.len() as u64 + value.len() as u64,
            None => index.footprint + entry_footprint(key.len(), value.len()),
        };
        if needed > budget {
            return Err(ReconError::Resource {
                what: "key index".to_string(),
                needed,
                budget,
            });
        }
        index.footprint = needed;
        self.inserted += 1;

        let order = index.map.len() as u64;
        index
            .map
            .entry(key)
            .and_modify(|slot| value.clone_into(&mut slot.value))
            .or_insert_with(|| Slot {
                value: value.to_string(),
                order,
                looked_up: false,
            });
        Ok(())
    }

    /// Index one raw line, diverting it if it cannot be used.
    pub fn push_line<E: Write>(
        &mut self,
        line: &Line,
        stats: &mut Stats,
        errors: &mut ErrorSink<E>,
    ) -> Result<()> {
        stats.index_lines += 1;
        match self.layout.split(line) {
            Ok((key, value)) => self.insert(key, value)?,
            Err(reason) => {
                stats.index_errored += 1;
                errors
                    .divert("right", line, &reason)
                    .at("write", errors.path())?;
            }
        }
        stats.index_entries = self.index.len() as u64;
        Ok(())
    }

    /// Consume the whole stream. Matching may only start on the returned index.
    pub fn build<R: BufRead, E: Write>(
        mut self,
        mut reader: LineReader<R>,
        source: &Path,
        stats: &mut Stats,
        errors: &mut ErrorSink<E>,
    ) -> Result<KeyIndex> {
        while let Some(line) = reader.next_line().at("read", source)? {
            self.push_line(&line, stats, errors)?;
            if self.progress_every > 0 && stats.index_lines % self.progress_every == 0 {
                info!(
                    lines = stats.index_lines,
                    entries = self.index.len(),
                    "indexing"
                );
            }
        }
        info!(
            source = %source.display(),
            lines = stats.index_lines,
            entries = self.index.len(),
            overwritten = self.inserted - self.index.len() as u64,
            errored = stats.index_errored,
            footprint = self.index.footprint(),
            "index built"
        );
        Ok(self.finish())
    }

    pub fn finish(self) -> KeyIndex {
        self.index
    }
}

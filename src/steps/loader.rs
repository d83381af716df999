//! Source loader.
//!
//! K_i: Records leave the loader in input order, none dropped or added.
//! K_i: Renaming only changes keys; values and key positions are kept.

use crate::models::{PipelineError, Record, Result, default_rename};
use indexmap::IndexMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, info};

/// In-memory source of records with an output rename table.
#[derive(Debug, Clone)]
pub struct SourceLoader {
    records: Vec<Record>,
    rename: IndexMap<String, String>,
}

impl SourceLoader {
    /// Loader over an in-memory list of records, with the default rename table.
    pub fn from_records(records: Vec<Record>) -> Self {
        Self {
            records,
            rename: default_rename(),
        }
    }

    /// Load records from a JSONL file (one JSON object per line).
    ///
    /// B_i(file exists) → Result
    pub fn from_jsonl(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| PipelineError::io(format!("opening {}", path.display()), e))?;
        let records = read_jsonl(BufReader::new(file))?;
        info!(path = %path.display(), records = records.len(), "Loaded source records");
        Ok(Self::from_records(records))
    }

    /// Replace the rename table.
    pub fn with_rename(mut self, rename: IndexMap<String, String>) -> Self {
        self.rename = rename;
        self
    }

    pub fn rename(&self) -> &IndexMap<String, String> {
        &self.rename
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records as loaded, before renaming.
    pub fn records_mut(&mut self) -> &mut [Record] {
        &mut self.records
    }

    /// Columns present in every record, before renaming.
    pub fn raw_columns(&self) -> Vec<String> {
        common_columns(&self.records)
    }

    /// Columns present in every record, after renaming.
    pub fn columns(&self) -> Vec<String> {
        self.renamed(self.raw_columns())
    }

    /// Apply the rename table to a list of column names.
    pub fn renamed(&self, columns: Vec<String>) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(columns.len());
        for column in columns {
            let column = self.rename.get(&column).cloned().unwrap_or(column);
            if !out.contains(&column) {
                out.push(column);
            }
        }
        out
    }

    /// Records with the rename table applied.
    pub fn load(self) -> Vec<Record> {
        let Self { records, rename } = self;
        debug!(renames = rename.len(), "Applying output renames");
        records
            .into_iter()
            .map(|mut record| {
                record.rename_fields(rename.iter().map(|(k, v)| (k.as_str(), v.as_str())));
                record
            })
            .collect()
    }

    /// Renamed records split into ordered batches of at most `batch_size`.
    pub fn batches(self, batch_size: usize) -> Result<Vec<Vec<Record>>> {
        if batch_size == 0 {
            return Err(PipelineError::InvalidInput(
                "batch_size must be at least 1".to_string(),
            ));
        }
        let mut records = self.load().into_iter().peekable();
        let mut batches = Vec::new();
        while records.peek().is_some() {
            batches.push(records.by_ref().take(batch_size).collect());
        }
        Ok(batches)
    }
}

/// Columns present in every record, in first-record order.
pub fn common_columns(records: &[Record]) -> Vec<String> {
    let Some((first, rest)) = records.split_first() else {
        return Vec::new();
    };
    let mut columns: Vec<String> = first.keys().map(str::to_string).collect();
    for record in rest {
        columns.retain(|c| record.contains(c));
    }
    columns
}

/// Parse JSONL from a reader. Blank lines are skipped.
pub fn read_jsonl<R: BufRead>(reader: R) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line_no = i + 1;
        let line = line.map_err(|e| PipelineError::io(format!("reading line {line_no}"), e))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: Record = serde_json::from_str(&line)
            .map_err(|e| PipelineError::ParseError(format!("line {line_no}: {e}")))?;
        records.push(record);
    }
    Ok(records)
}

//! Output collection of a pipeline run.
//!
//! Epistemic foundation:
//! - K_i: A distiset maps each leaf step name to its dataset, or to named splits
//! - K_i: On disk every dataset is `<name>[/<split>]/data.jsonl`
//! - K_i: Files are written to a temp path and renamed into place

mod card;

pub use card::*;

use crate::models::{PipelineError, Record, Result};
use crate::steps::read_jsonl;
use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File name of each dataset's records.
pub const DATA_FILE: &str = "data.jsonl";
/// Directory holding run configuration copies.
pub const CONFIGS_DIR: &str = "distiset_configs";
/// Configuration file name inside [`CONFIGS_DIR`].
pub const PIPELINE_CONFIG_FILE: &str = "pipeline.toml";
/// Run log file name inside [`CONFIGS_DIR`].
pub const PIPELINE_LOG_FILE: &str = "pipeline.log";
/// Dataset card file name.
pub const CARD_FILE: &str = "README.md";

/// A dataset, or a dataset split into named parts.
#[derive(Debug, Clone, PartialEq)]
pub enum DatasetEntry {
    Single(Vec<Record>),
    Split(IndexMap<String, Vec<Record>>),
}

impl DatasetEntry {
    /// Total rows across all splits.
    pub fn num_rows(&self) -> usize {
        match self {
            DatasetEntry::Single(records) => records.len(),
            DatasetEntry::Split(splits) => splits.values().map(Vec::len).sum(),
        }
    }

    /// Rows per split; a single dataset reports as `train`.
    pub fn split_rows(&self) -> Vec<(&str, usize)> {
        match self {
            DatasetEntry::Single(records) => vec![("train", records.len())],
            DatasetEntry::Split(splits) => splits
                .iter()
                .map(|(name, records)| (name.as_str(), records.len()))
                .collect(),
        }
    }
}

/// Options for [`Distiset::save_to_disk`].
#[derive(Debug, Clone, Copy)]
pub struct SaveOptions {
    pub save_card: bool,
    pub save_pipeline_config: bool,
    pub save_pipeline_log: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            save_card: true,
            save_pipeline_config: true,
            save_pipeline_log: true,
        }
    }
}

/// Named collection of output datasets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Distiset {
    datasets: IndexMap<String, DatasetEntry>,
    pipeline_config: Option<String>,
    pipeline_config_path: Option<PathBuf>,
    pipeline_log: Option<String>,
    pipeline_log_path: Option<PathBuf>,
}

impl Distiset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a dataset.
    pub fn insert(&mut self, name: impl Into<String>, records: Vec<Record>) {
        self.datasets
            .insert(name.into(), DatasetEntry::Single(records));
    }

    /// Attach the serialized run configuration.
    pub fn with_pipeline_config(mut self, config: String) -> Self {
        self.pipeline_config = Some(config);
        self
    }

    /// Attach the log text of the run that produced this distiset.
    pub fn with_pipeline_log(mut self, log: String) -> Self {
        self.pipeline_log = Some(log);
        self
    }

    pub fn get(&self, name: &str) -> Option<&DatasetEntry> {
        self.datasets.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DatasetEntry)> {
        self.datasets.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    pub fn pipeline_config(&self) -> Option<&str> {
        self.pipeline_config.as_deref()
    }

    /// Where the configuration was read from, after [`Distiset::load_from_disk`].
    pub fn pipeline_config_path(&self) -> Option<&Path> {
        self.pipeline_config_path.as_deref()
    }

    pub fn pipeline_log(&self) -> Option<&str> {
        self.pipeline_log.as_deref()
    }

    /// Where the run log was read from, after [`Distiset::load_from_disk`].
    pub fn pipeline_log_path(&self) -> Option<&Path> {
        self.pipeline_log_path.as_deref()
    }

    /// Split every dataset into shuffled `train` and `test` parts.
    ///
    /// `train_size` is the train fraction, strictly between 0 and 1.
    pub fn train_test_split(self, train_size: f64, seed: Option<u64>) -> Result<Self> {
        if !(train_size > 0.0 && train_size < 1.0) {
            return Err(PipelineError::InvalidInput(format!(
                "train_size must be in (0, 1), got {train_size}"
            )));
        }
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let Self {
            datasets: entries,
            pipeline_config,
            pipeline_config_path,
            pipeline_log,
            pipeline_log_path,
        } = self;

        let mut datasets = IndexMap::with_capacity(entries.len());
        for (name, entry) in entries {
            let DatasetEntry::Single(mut records) = entry else {
                return Err(PipelineError::InvalidInput(format!(
                    "dataset '{name}' is already split"
                )));
            };
            records.shuffle(&mut rng);
            let n_train = (records.len() as f64 * train_size).floor() as usize;
            let test = records.split_off(n_train);
            debug!(dataset = %name, train = records.len(), test = test.len(), "Split dataset");
            datasets.insert(
                name,
                DatasetEntry::Split(IndexMap::from([
                    ("train".to_string(), records),
                    ("test".to_string(), test),
                ])),
            );
        }

        Ok(Self {
            datasets,
            pipeline_config,
            pipeline_config_path,
            pipeline_log,
            pipeline_log_path,
        })
    }

    /// Write every dataset (and optionally the card and config) under `dir`.
    pub fn save_to_disk(&self, dir: &Path, options: SaveOptions) -> Result<()> {
        fs::create_dir_all(dir)
            .map_err(|e| PipelineError::io(format!("creating {}", dir.display()), e))?;

        for (name, entry) in &self.datasets {
            match entry {
                DatasetEntry::Single(records) => {
                    write_jsonl_atomic(&dir.join(name).join(DATA_FILE), records)?;
                }
                DatasetEntry::Split(splits) => {
                    for (split, records) in splits {
                        write_jsonl_atomic(&dir.join(name).join(split).join(DATA_FILE), records)?;
                    }
                }
            }
        }

        if let Some(config) = self.pipeline_config.as_ref().filter(|_| options.save_pipeline_config) {
            write_atomic(&dir.join(CONFIGS_DIR).join(PIPELINE_CONFIG_FILE), config.as_bytes())?;
        }
        if let Some(log) = self.pipeline_log.as_ref().filter(|_| options.save_pipeline_log) {
            write_atomic(&dir.join(CONFIGS_DIR).join(PIPELINE_LOG_FILE), log.as_bytes())?;
        }

        if options.save_card {
            let card = render_card(self, options.save_pipeline_config);
            write_atomic(&dir.join(CARD_FILE), card.as_bytes())?;
        }

        info!(dir = %dir.display(), datasets = self.datasets.len(), "Distiset saved");
        Ok(())
    }

    /// Read a distiset written by [`Distiset::save_to_disk`].
    pub fn load_from_disk(dir: &Path) -> Result<Self> {
        let mut distiset = Self::new();

        for name in sorted_subdirs(dir)? {
            if name == CONFIGS_DIR {
                continue;
            }
            let base = dir.join(&name);
            let data = base.join(DATA_FILE);
            if data.is_file() {
                distiset
                    .datasets
                    .insert(name, DatasetEntry::Single(read_jsonl_file(&data)?));
                continue;
            }

            let mut split_names = sorted_subdirs(&base)?;
            // train first, then test, then anything else
            split_names.sort_by_key(|s| match s.as_str() {
                "train" => 0,
                "test" => 1,
                _ => 2,
            });
            let mut splits = IndexMap::new();
            for split in split_names {
                let data = base.join(&split).join(DATA_FILE);
                if data.is_file() {
                    splits.insert(split, read_jsonl_file(&data)?);
                }
            }
            if !splits.is_empty() {
                distiset.datasets.insert(name, DatasetEntry::Split(splits));
            }
        }

        let config_path = dir.join(CONFIGS_DIR).join(PIPELINE_CONFIG_FILE);
        if config_path.is_file() {
            let config = fs::read_to_string(&config_path)
                .map_err(|e| PipelineError::io("reading pipeline config", e))?;
            distiset.pipeline_config = Some(config);
            distiset.pipeline_config_path = Some(config_path);
        }

        let log_path = dir.join(CONFIGS_DIR).join(PIPELINE_LOG_FILE);
        if log_path.is_file() {
            let log = fs::read_to_string(&log_path)
                .map_err(|e| PipelineError::io("reading pipeline log", e))?;
            distiset.pipeline_log = Some(log);
            distiset.pipeline_log_path = Some(log_path);
        }

        debug!(dir = %dir.display(), datasets = distiset.len(), "Distiset loaded");
        Ok(distiset)
    }
}

/// Names of the subdirectories of `dir`, sorted.
fn sorted_subdirs(dir: &Path) -> Result<Vec<String>> {
    let entries = fs::read_dir(dir)
        .map_err(|e| PipelineError::io(format!("reading {}", dir.display()), e))?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| PipelineError::io("reading directory entry", e))?;
        if entry.path().is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

fn read_jsonl_file(path: &Path) -> Result<Vec<Record>> {
    let file = File::open(path)
        .map_err(|e| PipelineError::io(format!("opening {}", path.display()), e))?;
    read_jsonl(BufReader::new(file))
}

/// Write `records` as JSONL via a temp file and rename.
pub fn write_jsonl_atomic(path: &Path, records: &[Record]) -> Result<()> {
    let mut buf = Vec::new();
    for record in records {
        serde_json::to_writer(&mut buf, record)
            .map_err(|e| PipelineError::Internal(format!("serializing record: {e}")))?;
        buf.push(b'\n');
    }
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| PipelineError::io(format!("creating {}", parent.display()), e))?;
    }
    let temp_path = path.with_extension("tmp");
    {
        let file = File::create(&temp_path)
            .map_err(|e| PipelineError::io(format!("creating {}", temp_path.display()), e))?;
        let mut writer = BufWriter::new(file);
        writer
            .write_all(contents)
            .and_then(|_| writer.flush())
            .map_err(|e| PipelineError::io(format!("writing {}", temp_path.display()), e))?;
    }
    fs::rename(&temp_path, path)
        .map_err(|e| PipelineError::io(format!("renaming into {}", path.display()), e))
}

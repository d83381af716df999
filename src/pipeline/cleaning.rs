//! Preference-pair cleaning pipeline.
//!
//! Pipeline flow:
//! Pairs → Shuffle → Load/Rename → Score → [custom steps] → Prune → [Argilla] → JSONL + Distiset
//!
//! Epistemic foundation:
//! - K_i: Stages run one batch at a time; a batch finishes a stage before the next starts
//! - K_i: Record order is preserved end to end
//! - B_i: Step column contracts are checked before any record is processed

use crate::client::TextGenerator;
use crate::distiset::Distiset;
use crate::models::{Config, PipelineError, Result, RunStats};
use crate::steps::{
    ArgillaSink, KeepColumns, PairShuffler, SourceLoader, Step, UltraFeedbackScorer,
    missing_inputs,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Result of a pipeline run.
#[derive(Debug)]
pub struct RunOutput {
    pub distiset: Distiset,
    pub stats: RunStats,
}

/// Cleaning pipeline over preference pairs.
pub struct CleaningPipeline {
    shuffler: Option<PairShuffler>,
    batch_size: usize,
    scorer: UltraFeedbackScorer,
    custom_steps: Vec<Box<dyn Step>>,
    pruner: KeepColumns,
    sink: Option<ArgillaSink>,
    pipeline_config: Option<String>,
    show_progress: bool,
}

impl CleaningPipeline {
    /// Create a pipeline without a sink.
    pub fn new(
        scorer: UltraFeedbackScorer,
        pruner: KeepColumns,
        shuffler: Option<PairShuffler>,
        batch_size: usize,
    ) -> Self {
        Self {
            shuffler,
            batch_size,
            scorer,
            custom_steps: Vec::new(),
            pruner,
            sink: None,
            pipeline_config: None,
            show_progress: true,
        }
    }

    /// Build the pipeline described by `config`.
    ///
    /// B_i(sink key resolvable) → Result
    pub fn from_config(config: &Config, generator: Arc<dyn TextGenerator>) -> Result<Self> {
        let shuffler = config
            .loader
            .shuffle
            .then(|| PairShuffler::with_seed(config.loader.seed));
        let sink = config
            .sink
            .as_ref()
            .map(ArgillaSink::from_config)
            .transpose()?;

        let mut pipeline = Self::new(
            UltraFeedbackScorer::from_config(generator, &config.scorer),
            KeepColumns::new(config.pruner.columns.clone()),
            shuffler,
            config.loader.batch_size,
        );
        pipeline.sink = sink;
        pipeline.pipeline_config = Some(config.redacted().to_toml()?);
        Ok(pipeline)
    }

    /// Open the configured source file with the configured renames.
    pub fn load_source(config: &Config) -> Result<SourceLoader> {
        Ok(SourceLoader::from_jsonl(&config.loader.path)?.with_rename(config.loader.rename.clone()))
    }

    pub fn with_sink(mut self, sink: ArgillaSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Add a step that runs after scoring and before pruning.
    pub fn with_step(mut self, step: Box<dyn Step>) -> Self {
        self.custom_steps.push(step);
        self
    }

    /// Attach the serialized configuration saved with the distiset.
    pub fn with_pipeline_config(mut self, config: String) -> Self {
        self.pipeline_config = Some(config);
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Name the output dataset is stored under.
    pub fn leaf_name(&self) -> &str {
        self.pruner.name()
    }

    /// Batch stages in execution order.
    fn stages(&self) -> Vec<&dyn Step> {
        let mut stages: Vec<&dyn Step> = Vec::with_capacity(self.custom_steps.len() + 3);
        stages.push(&self.scorer);
        stages.extend(self.custom_steps.iter().map(|s| &**s));
        stages.push(&self.pruner);
        if let Some(sink) = &self.sink {
            stages.push(sink);
        }
        stages
    }

    /// Check every step's required columns against what earlier steps provide.
    pub fn validate(&self, source: &SourceLoader) -> Result<()> {
        let mut available = source.raw_columns();

        if let Some(shuffler) = &self.shuffler {
            check(shuffler, &available)?;
            extend_unique(&mut available, shuffler.outputs());
        }
        let mut available = source.renamed(available);

        for stage in self.stages() {
            check(stage, &available)?;
            extend_unique(&mut available, stage.outputs());
            if stage.name() == self.pruner.name() {
                available.retain(|c| self.pruner.columns().contains(c));
            }
        }
        Ok(())
    }

    /// Run the pipeline over `source`, writing pruned records to `output_path`.
    pub async fn run(&self, mut source: SourceLoader, output_path: &Path) -> Result<RunOutput> {
        let start = Instant::now();
        let total = source.len();

        let mut stats = RunStats {
            total_records: total,
            ..RunStats::default()
        };

        info!(
            total_records = total,
            batch_size = self.batch_size,
            shuffle = self.shuffler.is_some(),
            aspect = self.scorer.aspect().as_str(),
            model = %self.scorer.model().id,
            sink = self.sink.is_some(),
            "Starting cleaning pipeline"
        );

        if !source.is_empty() {
            self.validate(&source)?;
        }
        if let Some(shuffler) = &self.shuffler {
            shuffler.shuffle_records(source.records_mut(), 0)?;
            debug!(records = total, "Shuffled pairs");
        }
        let batches = source.batches(self.batch_size)?;

        let output_file =
            File::create(output_path).map_err(|e| PipelineError::io("creating output file", e))?;
        let mut writer = BufWriter::new(output_file);

        let pb = self.progress_bar(total as u64);
        let mut kept = Vec::with_capacity(total);
        let mut offset = 0;

        for (batch_index, mut batch) in batches.into_iter().enumerate() {
            let batch_len = batch.len();

            for stage in self.stages() {
                batch = stage.process(batch, offset).await?;
                if batch.len() != batch_len {
                    return Err(PipelineError::Internal(format!(
                        "step '{}' returned {} records for a batch of {batch_len}",
                        stage.name(),
                        batch.len()
                    )));
                }
                debug!(batch = batch_index, step = stage.name(), "Stage complete");
            }

            for record in &batch {
                let json = serde_json::to_string(record).map_err(|e| {
                    PipelineError::Internal(format!("Failed to serialize record: {e}"))
                })?;
                writeln!(writer, "{json}").map_err(|e| PipelineError::io("writing output", e))?;
            }
            writer
                .flush()
                .map_err(|e| PipelineError::io("flushing output", e))?;

            offset += batch_len;
            stats.total_batches += 1;
            stats.total_written += batch_len;
            kept.extend(batch);

            let scorer = self.scorer.stats();
            pb.set_position(offset as u64);
            pb.set_message(format!(
                "scored: {}, failed: {}",
                scorer.scored, scorer.failures
            ));
        }

        let scorer = self.scorer.stats();
        stats.total_scored = scorer.scored;
        stats.scoring_failures = scorer.failures;
        stats.tokens_in = scorer.tokens_in;
        stats.tokens_out = scorer.tokens_out;
        stats.scoring_cost_usd = scorer.cost_usd;
        stats.total_forwarded = self.sink.as_ref().map_or(0, ArgillaSink::forwarded);
        stats.runtime_secs = start.elapsed().as_secs_f64();
        stats.finalize();

        pb.finish_with_message(format!(
            "Done! {} written, {} scoring failures",
            stats.total_written, stats.scoring_failures
        ));

        info!(
            written = stats.total_written,
            scored = stats.total_scored,
            failures = stats.scoring_failures,
            forwarded = stats.total_forwarded,
            success_rate = format!("{:.1}%", stats.scoring_success_rate * 100.0),
            throughput = format!("{:.0}/hr", stats.throughput_per_hour),
            cost = format!("${:.4}", stats.scoring_cost_usd),
            "Cleaning pipeline complete"
        );

        let mut distiset = Distiset::new();
        distiset.insert(self.leaf_name(), kept);
        if let Some(config) = &self.pipeline_config {
            distiset = distiset.with_pipeline_config(config.clone());
        }

        Ok(RunOutput { distiset, stats })
    }

    fn progress_bar(&self, len: u64) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len);
        let style = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");
        pb.set_style(style);
        pb
    }
}

fn check(step: &dyn Step, available: &[String]) -> Result<()> {
    let missing = missing_inputs(step, available);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::MissingColumns {
            step: step.name().to_string(),
            columns: missing,
        })
    }
}

fn extend_unique(columns: &mut Vec<String>, new: Vec<String>) {
    for column in new {
        if !columns.contains(&column) {
            columns.push(column);
        }
    }
}

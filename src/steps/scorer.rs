//! Quality scorer.
//!
//! Epistemic foundation:
//! - K_i: Every scored record carries `ratings` and `rationales` with one entry
//!   per generation, plus `model_name`
//! - B_i: Each remote call may fail → failure fills nulls, the record survives
//! - I^R: Aspect, model and concurrency are configurable

use crate::client::{CompletionResponse, Message, TextGenerator};
use crate::models::{Aspect, ModelSpec, PipelineError, Record, Result, ScorerConfig, fields};
use crate::steps::{Annotation, Step, build_messages, parse_annotations};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Running totals across all batches.
#[derive(Debug, Default)]
struct ScorerCounters {
    scored: AtomicUsize,
    failures: AtomicUsize,
    tokens_in: AtomicU64,
    tokens_out: AtomicU64,
    /// Cost in micro-dollars
    cost_micros: AtomicU64,
}

/// Snapshot of scorer totals.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScorerStats {
    pub scored: usize,
    pub failures: usize,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
}

/// Rates each generation of a record with an UltraFeedback rubric.
pub struct UltraFeedbackScorer {
    generator: Arc<dyn TextGenerator>,
    model: Arc<ModelSpec>,
    aspect: Aspect,
    semaphore: Arc<Semaphore>,
    counters: ScorerCounters,
}

impl UltraFeedbackScorer {
    /// Create a scorer. `concurrency` is clamped to at least 1.
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        model: ModelSpec,
        aspect: Aspect,
        concurrency: usize,
    ) -> Self {
        Self {
            generator,
            model: Arc::new(model),
            aspect,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            counters: ScorerCounters::default(),
        }
    }

    pub fn from_config(generator: Arc<dyn TextGenerator>, config: &ScorerConfig) -> Self {
        Self::new(
            generator,
            config.model.clone(),
            config.aspect,
            config.concurrency,
        )
    }

    pub fn aspect(&self) -> Aspect {
        self.aspect
    }

    pub fn model(&self) -> &ModelSpec {
        &self.model
    }

    pub fn stats(&self) -> ScorerStats {
        ScorerStats {
            scored: self.counters.scored.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            tokens_in: self.counters.tokens_in.load(Ordering::Relaxed),
            tokens_out: self.counters.tokens_out.load(Ordering::Relaxed),
            cost_usd: self.counters.cost_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }

    /// Build the prompt for a record, checking its input fields.
    fn prompt_for(&self, index: usize, record: &Record) -> Result<(Vec<Message>, usize)> {
        let invalid = |reason: &str| PipelineError::InvalidRecord {
            index,
            reason: reason.to_string(),
        };
        let instruction = record
            .get_str(fields::INSTRUCTION)
            .ok_or_else(|| invalid("'instruction' must be a string"))?;
        let generations = record
            .get_str_array(fields::GENERATIONS)
            .ok_or_else(|| invalid("'generations' must be a list of strings"))?;

        Ok((
            build_messages(self.aspect, instruction, &generations),
            generations.len(),
        ))
    }

    fn record_usage(&self, response: &CompletionResponse) {
        self.counters.scored.fetch_add(1, Ordering::Relaxed);
        self.counters
            .tokens_in
            .fetch_add(response.input_tokens as u64, Ordering::Relaxed);
        self.counters
            .tokens_out
            .fetch_add(response.output_tokens as u64, Ordering::Relaxed);
        self.counters
            .cost_micros
            .fetch_add((response.cost_usd * 1_000_000.0).round() as u64, Ordering::Relaxed);
    }
}

/// Append `ratings`, `rationales` and `model_name` to a record.
pub fn annotate(record: &mut Record, annotations: &[Annotation], model_name: &str) {
    let ratings: Vec<Value> = annotations
        .iter()
        .map(|a| a.rating.map_or(Value::Null, Value::from))
        .collect();
    let rationales: Vec<Value> = annotations
        .iter()
        .map(|a| a.rationale.clone().map_or(Value::Null, Value::from))
        .collect();

    record.insert(fields::RATINGS, ratings);
    record.insert(fields::RATIONALES, rationales);
    record.insert(fields::MODEL_NAME, model_name);
}

#[async_trait]
impl Step for UltraFeedbackScorer {
    fn name(&self) -> &str {
        "ultrafeedback"
    }

    fn inputs(&self) -> Vec<String> {
        vec![
            fields::INSTRUCTION.to_string(),
            fields::GENERATIONS.to_string(),
        ]
    }

    fn outputs(&self) -> Vec<String> {
        vec![
            fields::RATINGS.to_string(),
            fields::RATIONALES.to_string(),
            fields::MODEL_NAME.to_string(),
        ]
    }

    async fn process(&self, mut batch: Vec<Record>, offset: usize) -> Result<Vec<Record>> {
        let prompts = batch
            .iter()
            .enumerate()
            .map(|(i, record)| self.prompt_for(offset + i, record))
            .collect::<Result<Vec<_>>>()?;

        let mut handles = Vec::with_capacity(prompts.len());
        for (messages, n) in prompts {
            let generator = Arc::clone(&self.generator);
            let model = Arc::clone(&self.model);
            let semaphore = Arc::clone(&self.semaphore);

            let handle = tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| PipelineError::Internal("Semaphore closed".to_string()))?;
                generator.generate(&model, &messages).await
            });
            handles.push((handle, n));
        }

        // Awaited in spawn order, so results line up with the batch.
        for (i, (record, (handle, n))) in batch.iter_mut().zip(handles).enumerate() {
            let index = offset + i;
            let annotations = match handle.await {
                Ok(Ok(response)) => {
                    self.record_usage(&response);
                    let parsed = parse_annotations(&response.content, n);
                    debug!(
                        index,
                        ratings = ?parsed.iter().map(|a| a.rating).collect::<Vec<_>>(),
                        "Record scored"
                    );
                    parsed
                }
                Ok(Err(e)) => {
                    warn!(index, model = %self.model.id, error = %e, "Scoring failed");
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    vec![Annotation::default(); n]
                }
                Err(e) => {
                    warn!(index, error = %e, "Scoring task panicked");
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    vec![Annotation::default(); n]
                }
            };
            annotate(record, &annotations, &self.model.id);
        }

        Ok(batch)
    }
}

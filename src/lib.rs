//! prefclean - Preference-dataset cleaning with an LLM judge.
//!
//! ## Architecture
//!
//! Records flow through a fixed sequence of steps, one batch at a time:
//! - **Shuffle**: Places each chosen/rejected pair into `generations` in random order
//! - **Load**: Reads pairs and renames `question` to `instruction`
//! - **Score**: Rates every generation with an UltraFeedback rubric via a remote model
//! - **Prune**: Keeps only the training columns
//! - **Curate** (optional): Forwards records to an Argilla workspace
//!
//! The run's output is a [`Distiset`], which can be split and saved with a dataset card.
//!
//! ## Epistemic Design
//!
//! - K_i (Knowledge): Compile-time enforced invariants (types, enums)
//! - B_i (Beliefs): Runtime fallible operations (Result, Option)
//! - I^R (Resolvable): User-configurable parameters
//! - I^B (Bounded): Network/API uncertainties (retry, backoff)

pub mod ci;
pub mod client;
pub mod distiset;
pub mod models;
pub mod pipeline;
pub mod steps;

#[cfg(test)]
mod test_server;

// Re-exports for convenience
pub use ci::{PreviewDocs, preview_version};
pub use client::{HealthStatus, LlmClient, RateLimiter, TextGenerator};
pub use distiset::{DatasetEntry, Distiset, SaveOptions};
pub use models::{Config, PipelineError, Record, Result, RunStats};
pub use pipeline::{CleaningPipeline, RunOutput};
pub use steps::{
    ArgillaSink, KeepColumns, PairShuffler, SourceLoader, Step, UltraFeedbackScorer,
};

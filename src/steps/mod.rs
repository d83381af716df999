//! Pipeline steps.
//!
//! A step declares the columns it needs and the columns it adds, and turns a
//! batch of records into a batch of records. The pipeline checks the declared
//! contracts before any data flows.

mod loader;
mod pruner;
mod scorer;
mod shuffle;
mod sink;
mod ultrafeedback;

pub use loader::*;
pub use pruner::*;
pub use scorer::*;
pub use shuffle::*;
pub use sink::*;
pub use ultrafeedback::*;

use crate::models::{Record, Result};
use async_trait::async_trait;

/// A unit of work over batches of records.
#[async_trait]
pub trait Step: Send + Sync {
    /// Step name, used in logs, errors and as the distiset key for leaf steps.
    fn name(&self) -> &str;

    /// Columns every incoming record must carry.
    fn inputs(&self) -> Vec<String>;

    /// Columns this step appends to each record.
    fn outputs(&self) -> Vec<String>;

    /// Process one batch. Output order must match input order.
    ///
    /// `offset` is the stream index of the batch's first record; record
    /// indices in errors and logs are stream indices.
    async fn process(&self, batch: Vec<Record>, offset: usize) -> Result<Vec<Record>>;
}

/// Columns a step needs that are not in `available`, in declaration order.
pub fn missing_inputs(step: &dyn Step, available: &[String]) -> Vec<String> {
    step.inputs()
        .into_iter()
        .filter(|c| !available.contains(c))
        .collect()
}

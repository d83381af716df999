//! Column pruner.

use crate::models::{Record, Result, default_columns};
use crate::steps::Step;
use async_trait::async_trait;

/// Keeps only allow-listed columns, in allow-list order.
#[derive(Debug, Clone)]
pub struct KeepColumns {
    columns: Vec<String>,
}

impl KeepColumns {
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// New record with exactly the allow-listed fields present in `record`.
    pub fn prune(&self, record: &Record) -> Record {
        self.columns
            .iter()
            .filter_map(|c| record.get(c).map(|v| (c.clone(), v.clone())))
            .collect()
    }
}

impl Default for KeepColumns {
    fn default() -> Self {
        Self::new(default_columns())
    }
}

#[async_trait]
impl Step for KeepColumns {
    fn name(&self) -> &str {
        "keep_columns"
    }

    // Pruning tolerates absent columns.
    fn inputs(&self) -> Vec<String> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<String> {
        Vec::new()
    }

    async fn process(&self, batch: Vec<Record>, _offset: usize) -> Result<Vec<Record>> {
        Ok(batch.iter().map(|r| self.prune(r)).collect())
    }
}

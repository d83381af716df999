//! Run statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Statistics for a cleaning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStats {
    /// When the run started
    pub started_at: DateTime<Utc>,

    /// Total records loaded
    pub total_records: usize,

    /// Batches processed
    pub total_batches: usize,

    /// Records the scorer rated successfully
    pub total_scored: usize,

    /// Records whose remote scoring call failed
    pub scoring_failures: usize,

    /// Records written after pruning
    pub total_written: usize,

    /// Records forwarded to the curation workspace
    pub total_forwarded: usize,

    /// Prompt tokens sent to the scoring model
    pub tokens_in: u64,

    /// Completion tokens received from the scoring model
    pub tokens_out: u64,

    /// Scoring cost (USD)
    pub scoring_cost_usd: f64,

    /// Total runtime in seconds
    pub runtime_secs: f64,

    /// Records per hour throughput
    pub throughput_per_hour: f64,

    /// Scoring success rate (0.0 - 1.0)
    pub scoring_success_rate: f64,
}

impl Default for RunStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            total_records: 0,
            total_batches: 0,
            total_scored: 0,
            scoring_failures: 0,
            total_written: 0,
            total_forwarded: 0,
            tokens_in: 0,
            tokens_out: 0,
            scoring_cost_usd: 0.0,
            runtime_secs: 0.0,
            throughput_per_hour: 0.0,
            scoring_success_rate: 0.0,
        }
    }
}

impl RunStats {
    /// Calculate derived stats.
    pub fn finalize(&mut self) {
        let attempted = self.total_scored + self.scoring_failures;
        if attempted > 0 {
            self.scoring_success_rate = self.total_scored as f64 / attempted as f64;
        }
        if self.runtime_secs > 0.0 {
            self.throughput_per_hour = self.total_written as f64 / self.runtime_secs * 3600.0;
        }
    }
}

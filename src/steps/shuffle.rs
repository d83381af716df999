//! Pair shuffler.
//!
//! K_i: Each record's chosen/rejected pair lands in `generations` in one of the
//! two orderings with equal probability; `order` records which role sits where.
//! B_i: Reproducible only when seeded.

use crate::models::{PipelineError, Record, Result, Role, fields};
use crate::steps::Step;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use std::sync::Mutex;

/// Result of shuffling a single pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShuffledPair {
    pub generations: [String; 2],
    pub order: [Role; 2],
}

/// Place `chosen` and `rejected` in a uniformly random order.
pub fn shuffle_pair<R: Rng + ?Sized>(chosen: &str, rejected: &str, rng: &mut R) -> ShuffledPair {
    if rng.random_bool(0.5) {
        ShuffledPair {
            generations: [chosen.to_string(), rejected.to_string()],
            order: [Role::Chosen, Role::Rejected],
        }
    } else {
        ShuffledPair {
            generations: [rejected.to_string(), chosen.to_string()],
            order: [Role::Rejected, Role::Chosen],
        }
    }
}

/// Step that adds `generations` and `order` from `chosen` and `rejected`.
pub struct PairShuffler {
    rng: Mutex<StdRng>,
}

impl PairShuffler {
    /// Shuffler seeded from the OS.
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Deterministic shuffler.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Shuffler from an optional seed.
    pub fn with_seed(seed: Option<u64>) -> Self {
        seed.map_or_else(Self::new, Self::seeded)
    }

    /// Shuffle every record in place. `offset` is the index of the first
    /// record in the overall stream, used in error reports.
    pub fn shuffle_records(&self, records: &mut [Record], offset: usize) -> Result<()> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| PipelineError::Internal("shuffler rng lock poisoned".to_string()))?;

        for (i, record) in records.iter_mut().enumerate() {
            let text = |key: &str| -> Result<String> {
                record.get_str(key).map(str::to_string).ok_or_else(|| {
                    PipelineError::InvalidRecord {
                        index: offset + i,
                        reason: format!("'{key}' must be a string"),
                    }
                })
            };
            let chosen = text(fields::CHOSEN)?;
            let rejected = text(fields::REJECTED)?;

            let pair = shuffle_pair(&chosen, &rejected, &mut *rng);
            record.insert(
                fields::GENERATIONS,
                Value::from(pair.generations.to_vec()),
            );
            record.insert(
                fields::ORDER,
                Value::from(pair.order.iter().map(Role::as_str).collect::<Vec<_>>()),
            );
        }
        Ok(())
    }
}

impl Default for PairShuffler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Step for PairShuffler {
    fn name(&self) -> &str {
        "shuffle"
    }

    fn inputs(&self) -> Vec<String> {
        vec![fields::CHOSEN.to_string(), fields::REJECTED.to_string()]
    }

    fn outputs(&self) -> Vec<String> {
        vec![fields::GENERATIONS.to_string(), fields::ORDER.to_string()]
    }

    async fn process(&self, mut batch: Vec<Record>, offset: usize) -> Result<Vec<Record>> {
        self.shuffle_records(&mut batch, offset)?;
        Ok(batch)
    }
}

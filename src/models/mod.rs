//! Core data models for prefclean.
//!
//! Epistemic mapping:
//! - K_i (Knowledge): Concrete types with compile-time guarantees
//! - B_i (Beliefs): Wrapped in Result/Option
//! - I^R (Resolvable): Config parameters
//! - I^B (Bounded): Error variants for remote failures

mod config;
mod error;
mod record;
mod stats;

pub use config::*;
pub use error::*;
pub use record::*;
pub use stats::*;

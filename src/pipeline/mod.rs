//! Pipeline module - preference-pair cleaning pipeline.

mod cleaning;

pub use cleaning::*;

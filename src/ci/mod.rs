//! Repository automation.

mod preview_docs;

pub use preview_docs::*;

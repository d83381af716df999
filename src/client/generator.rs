//! Text generation seam between pipeline steps and remote models.

use crate::client::{CompletionResponse, Message};
use crate::models::{ModelSpec, Result};
use async_trait::async_trait;

/// Anything that can turn a chat transcript into a completion.
///
/// Implementations must be thread-safe (Send + Sync) so a single
/// generator can be shared across concurrent scoring tasks.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generate a completion for `messages` with the given model parameters.
    async fn generate(&self, model: &ModelSpec, messages: &[Message]) -> Result<CompletionResponse>;
}

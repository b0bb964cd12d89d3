//! Model hub abstraction
//!
//! The hub is the upstream source of base models and the optional
//! destination of trained checkpoints. Its failures are fatal to the stage
//! calling it.

use std::path::Path;
use async_trait::async_trait;

use common::error::Result;

/// Upstream model provider
#[async_trait]
pub trait ModelHub: Send + Sync {
    /// Downloads `model_id` into `destination`, which exists and is empty
    async fn pull(&self, model_id: &str, destination: &Path) -> Result<()>;

    /// Uploads the tree under `source` to the hub repository `model_id`
    async fn push(&self, model_id: &str, source: &Path) -> Result<()>;
}

//! Model hub clients and fine-tuning routines for LoRA Flow
//!
//! This crate provides the two external collaborators of the workflow: the
//! hub base models are pulled from (and checkpoints pushed to), and the LoRA
//! fine-tuning routine.

pub mod hub;
pub mod huggingface;
pub mod mirror;
pub mod finetune;

use std::sync::Arc;

use common::error::Result;
use config::HubSettings;

// Re-export commonly used types
pub use hub::ModelHub;
pub use huggingface::HuggingFaceHub;
pub use mirror::DirectoryHub;
pub use finetune::{CommandFineTuner, FineTuner};

/// Builds the hub selected by settings: the local mirror when configured,
/// else the HTTP hub
pub fn hub_from_settings(settings: &HubSettings) -> Result<Arc<dyn ModelHub>> {
    match &settings.mirror_dir {
        Some(dir) => Ok(Arc::new(DirectoryHub::new(dir))),
        None => Ok(Arc::new(HuggingFaceHub::new(settings)?)),
    }
}

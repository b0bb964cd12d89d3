//! Staged workflow for LoRA Flow
//!
//! This crate provides the Prepare → Train → Publish state machine that
//! drives the artifact stores, the model hub and the fine-tuning routine.

pub mod engine;
pub mod report;
pub mod resources;
pub mod state;

// Re-export commonly used types
pub use engine::{StagedWorkflow, WorkflowSettings};
pub use report::{StageOutcome, StageReport, WorkflowReport};
pub use resources::StageResources;
pub use state::WorkflowState;

//! Configuration management for LoRA Flow
//!
//! This crate loads the pipeline configuration from layered sources
//! (defaults, an optional TOML file, `LORA_FLOW__*` environment variables)
//! and validates it before any stage runs.

pub mod manager;
pub mod pipeline;
pub mod validation;

// Re-export commonly used types
pub use manager::ConfigManager;
pub use pipeline::{FineTuneSettings, HubSettings, LoggingSettings, PipelineConfig};
pub use validation::ConfigValidator;

//! Common utilities and types for LoRA Flow
//!
//! This crate provides shared functionality used across the pipeline crates,
//! including the error taxonomy, artifact/run identity types, and utility functions.

pub mod error;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;

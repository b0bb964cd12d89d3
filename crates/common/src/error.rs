//! Error types for the common crate
//!
//! This module defines the error taxonomy shared by every pipeline crate.
//! None of these errors are recovered locally: a failure aborts the
//! workflow instance and is surfaced together with the failing stage.

use thiserror::Error;

use crate::types::Stage;

/// Result type for LoRA Flow operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for LoRA Flow operations
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error (unset or invalid store root, model id, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Artifact key absent from the store it was requested from
    #[error("Not found: {0}")]
    NotFound(String),

    /// Network or storage I/O failure while moving an artifact tree
    #[error("Transfer failure: {0}")]
    Transfer(String),

    /// A state the workflow guarantees can never happen, e.g. the base model
    /// missing from the hub cache at Train
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Invalid argument error
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A stage was requested out of workflow order
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// External service error (hub, fine-tuning routine)
    #[error("External service error: {0}")]
    ExternalService(String),

    /// A stage aborted; wraps the underlying failure
    #[error("stage '{stage}' failed: {source}")]
    StageFailed {
        /// Stage that failed
        stage: Stage,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wraps an error with the stage it occurred in
    pub fn in_stage(self, stage: Stage) -> Self {
        match self {
            // Never double-wrap
            Error::StageFailed { .. } => self,
            other => Error::StageFailed {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// Returns the innermost error, looking through `StageFailed`
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::StageFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Returns the failing stage, if the error carries one
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::StageFailed { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Returns true if the error is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self.root_cause(), Error::NotFound(_))
    }

    /// Returns true if the error is an invariant violation
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self.root_cause(), Error::InvariantViolation(_))
    }

    /// Returns true if the error is a transfer failure
    pub fn is_transfer(&self) -> bool {
        matches!(self.root_cause(), Error::Transfer(_) | Error::Io(_))
    }

    /// Returns true if the error is a configuration error
    pub fn is_config(&self) -> bool {
        matches!(self.root_cause(), Error::Config(_))
    }
}

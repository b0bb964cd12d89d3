//! Workflow state
//!
//! Tracks which stages of one workflow instance have completed. Transitions
//! are strictly forward: a stage may only start once every earlier stage has
//! completed, and no stage is ever revisited.

use std::fmt;
use serde::{Deserialize, Serialize};

use common::error::{Error, Result};
use common::types::Stage;

/// Progress of one workflow instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowState {
    /// Stages completed so far, in order
    completed: Vec<Stage>,

    /// Stage currently running
    running: Option<Stage>,

    /// Stage that failed, with its error message
    failed: Option<(Stage, String)>,

    /// Run-scoped store root the trained model was uploaded to
    trained_model_root: Option<String>,
}

impl WorkflowState {
    /// Creates the state of a fresh instance, positioned at Prepare
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a state positioned at `stage`, with every earlier stage
    /// assumed complete
    ///
    /// Used when the execution backend launches each stage as its own task
    /// and has already sequenced the earlier ones.
    pub fn resume_at(stage: Stage) -> Self {
        Self {
            completed: Stage::ALL.iter().copied().take_while(|s| *s < stage).collect(),
            ..Self::default()
        }
    }

    /// Next stage allowed to run
    pub fn next_stage(&self) -> Option<Stage> {
        if self.failed.is_some() || self.running.is_some() {
            return None;
        }
        match self.completed.last() {
            Some(last) => last.next(),
            None => Some(Stage::Prepare),
        }
    }

    /// Stages completed so far
    pub fn completed(&self) -> &[Stage] {
        &self.completed
    }

    /// Stage currently running
    pub fn running(&self) -> Option<Stage> {
        self.running
    }

    /// Failed stage and its message
    pub fn failure(&self) -> Option<(Stage, &str)> {
        self.failed.as_ref().map(|(stage, msg)| (*stage, msg.as_str()))
    }

    /// Returns true once Publish has completed
    pub fn is_finished(&self) -> bool {
        self.completed.last() == Some(&Stage::Publish)
    }

    /// Returns true if a stage failed
    pub fn is_failed(&self) -> bool {
        self.failed.is_some()
    }

    /// Run-scoped root holding the trained model, once Train has completed
    pub fn trained_model_root(&self) -> Option<&str> {
        self.trained_model_root.as_deref()
    }

    /// Marks `stage` as running
    pub fn begin(&mut self, stage: Stage) -> Result<()> {
        if let Some((failed, _)) = &self.failed {
            return Err(Error::InvalidTransition(format!(
                "cannot start '{}': stage '{}' already failed",
                stage, failed
            )));
        }

        match self.next_stage() {
            Some(next) if next == stage => {
                self.running = Some(stage);
                Ok(())
            }
            Some(next) => Err(Error::InvalidTransition(format!(
                "cannot start '{}': next stage is '{}'",
                stage, next
            ))),
            None => Err(Error::InvalidTransition(format!(
                "cannot start '{}': {}",
                stage,
                match self.running {
                    Some(running) => format!("stage '{}' is still running", running),
                    None => "workflow already finished".to_string(),
                }
            ))),
        }
    }

    /// Marks the running stage as completed
    pub fn complete(&mut self, stage: Stage) {
        if self.running == Some(stage) {
            self.running = None;
            self.completed.push(stage);
        }
    }

    /// Marks the running stage as failed
    pub fn fail(&mut self, stage: Stage, message: impl Into<String>) {
        self.running = None;
        self.failed = Some((stage, message.into()));
    }

    /// Records where Train uploaded the trained model
    pub fn set_trained_model_root(&mut self, root: impl Into<String>) {
        self.trained_model_root = Some(root.into());
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some((stage, msg)) = &self.failed {
            return write!(f, "Failed in {}: {}", stage, msg);
        }
        if let Some(stage) = self.running {
            return write!(f, "Running {}", stage);
        }
        match self.next_stage() {
            Some(stage) => write!(f, "Ready for {}", stage),
            None => write!(f, "Finished"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        let mut state = WorkflowState::new();
        assert_eq!(state.next_stage(), Some(Stage::Prepare));

        for stage in Stage::ALL {
            state.begin(stage).unwrap();
            assert_eq!(state.running(), Some(stage));
            state.complete(stage);
        }

        assert!(state.is_finished());
        assert_eq!(state.next_stage(), None);
        assert_eq!(state.to_string(), "Finished");
    }

    #[test]
    fn test_out_of_order_is_rejected() {
        let mut state = WorkflowState::new();
        let err = state.begin(Stage::Train).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition(_)));

        state.begin(Stage::Prepare).unwrap();
        state.complete(Stage::Prepare);

        // No stage is revisited
        assert!(state.begin(Stage::Prepare).is_err());
    }

    #[test]
    fn test_failure_blocks_later_stages() {
        let mut state = WorkflowState::new();
        state.begin(Stage::Prepare).unwrap();
        state.fail(Stage::Prepare, "hub unreachable");

        assert!(state.is_failed());
        assert_eq!(state.failure(), Some((Stage::Prepare, "hub unreachable")));
        assert!(state.begin(Stage::Train).is_err());
    }

    #[test]
    fn test_resume_at() {
        let state = WorkflowState::resume_at(Stage::Publish);
        assert_eq!(state.completed(), &[Stage::Prepare, Stage::Train]);
        assert_eq!(state.next_stage(), Some(Stage::Publish));

        let fresh = WorkflowState::resume_at(Stage::Prepare);
        assert_eq!(fresh, WorkflowState::new());
    }
}

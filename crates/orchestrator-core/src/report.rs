//! Stage and workflow reports

use std::fmt;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use common::types::Stage;
use common::utils::format_duration;
use storage_adapter::ArtifactSummary;

/// How a stage ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    /// The stage did its work
    Completed,

    /// The stage had nothing to do (e.g. publishing disabled)
    Skipped,

    /// The artifact was already cached
    CacheHit,
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageOutcome::Completed => write!(f, "completed"),
            StageOutcome::Skipped => write!(f, "skipped"),
            StageOutcome::CacheHit => write!(f, "cache hit"),
        }
    }
}

/// Result of one successful stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    /// Stage that ran
    pub stage: Stage,

    /// How it ended
    pub outcome: StageOutcome,

    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,

    /// Store location the stage wrote to or read from
    pub location: Option<String>,

    /// Summary of the artifact tree moved by the stage
    pub summary: Option<ArtifactSummary>,
}

impl StageReport {
    /// Creates a report without artifact details
    pub fn new(stage: Stage, outcome: StageOutcome) -> Self {
        Self {
            stage,
            outcome,
            duration_ms: 0,
            location: None,
            summary: None,
        }
    }

    /// Sets the store location
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Sets the artifact summary
    pub fn with_summary(mut self, summary: ArtifactSummary) -> Self {
        self.summary = Some(summary);
        self
    }

    /// Sets the duration
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }

    /// Stage duration
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

impl fmt::Display for StageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} in {}", self.stage, self.outcome, format_duration(self.duration()))?;
        if let Some(location) = &self.location {
            write!(f, " ({})", location)?;
        }
        Ok(())
    }
}

/// Result of a complete workflow instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowReport {
    /// Stage reports in execution order
    pub stages: Vec<StageReport>,

    /// Run-scoped store root holding the trained model
    pub trained_model_root: Option<String>,
}

impl WorkflowReport {
    /// Report for a given stage
    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|report| report.stage == stage)
    }

    /// Total duration across stages
    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(StageReport::duration).sum()
    }
}

//! Common types for LoRA Flow
//!
//! This module defines the identity types shared by the store and the
//! workflow: artifact keys, store roots, the execution identity of a run and
//! the run scope derived from it.

use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Path segment under the base store root holding the shared hub cache
pub const HF_MODELS_SEGMENT: &str = "huggingface-models";

/// Path segment under the base store root holding run-scoped outputs
pub const TRAINED_MODELS_SEGMENT: &str = "trained-models";

/// Name identifying a logical model inside a store root
///
/// Keys are relative `/`-separated paths (`meta-llama/Llama-2-7b-hf`).
/// Segments starting with `.` are reserved for store bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactKey(String);

impl ArtifactKey {
    /// Creates a validated artifact key
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();

        if key.trim().is_empty() {
            return Err(Error::InvalidArgument("artifact key must not be empty".to_string()));
        }

        for segment in key.split('/') {
            if segment.is_empty() {
                return Err(Error::InvalidArgument(format!(
                    "artifact key '{}' contains an empty path segment",
                    key
                )));
            }
            if segment.starts_with('.') {
                return Err(Error::InvalidArgument(format!(
                    "artifact key '{}' contains a reserved segment '{}'",
                    key, segment
                )));
            }
            if segment.contains('\\') {
                return Err(Error::InvalidArgument(format!(
                    "artifact key '{}' contains a backslash",
                    key
                )));
            }
        }

        Ok(Self(key))
    }

    /// Returns the key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterates over the `/`-separated segments of the key
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ArtifactKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for ArtifactKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ArtifactKey> for String {
    fn from(key: ArtifactKey) -> Self {
        key.0
    }
}

/// URI prefix naming one artifact collection inside a durable namespace
///
/// A root is an opaque string such as `/mnt/models/huggingface-models`,
/// `file:///mnt/models`, `memory://tests` or `s3://bucket/prefix`.
/// Trailing slashes are dropped so that joins are stable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreRoot(String);

impl StoreRoot {
    /// Creates a store root from a URI
    pub fn new(uri: impl Into<String>) -> Result<Self> {
        let uri = uri.into();
        let trimmed = uri.trim();

        if trimmed.is_empty() {
            return Err(Error::Config("store root must not be empty".to_string()));
        }

        // Keep a bare "/" and "scheme://" intact
        let mut normalized = trimmed;
        while normalized.ends_with('/') && !normalized.ends_with("://") && normalized != "/" {
            normalized = &normalized[..normalized.len() - 1];
        }

        Ok(Self(normalized.to_string()))
    }

    /// Returns the URI scheme, if any (`file`, `memory`, `s3`, ...)
    pub fn scheme(&self) -> Option<&str> {
        self.0.find("://").map(|idx| &self.0[..idx])
    }

    /// Returns the root as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derives a child root by appending path segments
    pub fn join<I, S>(&self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut uri = self.0.clone();
        for segment in segments {
            let segment = segment.as_ref().trim_matches('/');
            if segment.is_empty() {
                continue;
            }
            if !uri.ends_with('/') {
                uri.push('/');
            }
            uri.push_str(segment);
        }
        Self(uri)
    }

    /// Root of the shared, read-mostly hub-model cache
    pub fn hf_models_cache(&self) -> Self {
        self.join([HF_MODELS_SEGMENT])
    }

    /// Full location of a key inside this root
    pub fn location_of(&self, key: &ArtifactKey) -> String {
        self.join(key.segments()).0
    }
}

impl fmt::Display for StoreRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Workflow stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Ensure the base model is in the hub cache
    Prepare,
    /// Fine-tune and persist under the run scope
    Train,
    /// Optionally republish the trained artifact
    Publish,
}

impl Stage {
    /// All stages in execution order
    pub const ALL: [Stage; 3] = [Stage::Prepare, Stage::Train, Stage::Publish];

    /// Stage name as used in run scopes and logs
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Prepare => "prepare",
            Stage::Train => "train",
            Stage::Publish => "publish",
        }
    }

    /// Returns the stage that follows this one, if any
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Prepare => Some(Stage::Train),
            Stage::Train => Some(Stage::Publish),
            Stage::Publish => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "prepare" | "start" => Ok(Stage::Prepare),
            "train" | "finetune" => Ok(Stage::Train),
            "publish" | "end" => Ok(Stage::Publish),
            _ => Err(Error::InvalidArgument(format!("Unknown stage: {}", s))),
        }
    }
}

/// Execution identity supplied by the execution backend
///
/// Threaded explicitly into the workflow; nothing reads it from globals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    /// Pipeline (flow) name
    pub pipeline_name: String,
    /// Identifier of this workflow execution
    pub run_id: String,
    /// Task identifier assigned by the backend to the Train stage
    pub task_id: String,
}

impl RunContext {
    /// Creates a run context, rejecting empty or path-unsafe components
    pub fn new(
        pipeline_name: impl Into<String>,
        run_id: impl Into<String>,
        task_id: impl Into<String>,
    ) -> Result<Self> {
        let context = Self {
            pipeline_name: pipeline_name.into(),
            run_id: run_id.into(),
            task_id: task_id.into(),
        };

        for (field, value) in [
            ("pipeline_name", &context.pipeline_name),
            ("run_id", &context.run_id),
            ("task_id", &context.task_id),
        ] {
            if value.is_empty() || value.contains('/') || value.starts_with('.') {
                return Err(Error::Config(format!(
                    "run context field {} has invalid value '{}'",
                    field, value
                )));
            }
        }

        Ok(context)
    }

    /// Creates a run context with a freshly generated run id
    pub fn generate(pipeline_name: impl Into<String>) -> Result<Self> {
        Self::new(pipeline_name, Uuid::new_v4().simple().to_string(), "1")
    }

    /// Derives the run scope for a stage of this run
    pub fn scope_for(&self, stage: Stage) -> RunScope {
        RunScope {
            pipeline_name: self.pipeline_name.clone(),
            run_id: self.run_id.clone(),
            stage_name: stage.name().to_string(),
            task_id: self.task_id.clone(),
        }
    }
}

/// `(pipeline-name, run-id, stage-name, task-id)` tuple identifying one
/// execution's outputs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunScope {
    /// Pipeline name
    pub pipeline_name: String,
    /// Run identifier
    pub run_id: String,
    /// Stage that produced the outputs
    pub stage_name: String,
    /// Task identifier
    pub task_id: String,
}

impl RunScope {
    /// Derives the run-scoped store root under a base store root
    ///
    /// `{base}/trained-models/{pipeline}/{run-id}/{stage}/{task-id}`
    pub fn store_root(&self, base: &StoreRoot) -> StoreRoot {
        base.join([
            TRAINED_MODELS_SEGMENT,
            self.pipeline_name.as_str(),
            self.run_id.as_str(),
            self.stage_name.as_str(),
            self.task_id.as_str(),
        ])
    }
}

impl fmt::Display for RunScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.pipeline_name, self.run_id, self.stage_name, self.task_id
        )
    }
}

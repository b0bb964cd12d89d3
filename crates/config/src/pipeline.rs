//! Pipeline configuration model
//!
//! Every field has a serde default so that partial sources merge cleanly;
//! required values are enforced by [`crate::ConfigValidator`].

use std::collections::HashMap;
use std::path::PathBuf;
use serde::{Deserialize, Serialize};

use common::error::{Error, Result};
use common::types::{ArtifactKey, RunContext, StoreRoot};

/// Default pipeline name, used as the first run-scope component
pub const DEFAULT_PIPELINE_NAME: &str = "LlamaInstructionTuning";

/// Default Hugging Face endpoint
pub const DEFAULT_HUB_ENDPOINT: &str = "https://huggingface.co";

/// Top-level pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Base store-root URI; hub cache and run-scoped roots live under it
    pub store_root: Option<String>,

    /// Datastore sysroot of the execution backend. When `store_root` is
    /// unset, its parent is used as the base store root.
    pub datastore_sysroot: Option<String>,

    /// Base model identifier, also the artifact key in both stores
    pub model_id: Option<String>,

    /// Whether Publish pushes the trained checkpoint to the hub
    pub push_checkpoints: bool,

    /// Hub repository receiving the checkpoint (defaults to `model_id`)
    pub push_repo: Option<String>,

    /// Pipeline name used in run scopes
    pub pipeline_name: String,

    /// Run identifier supplied by the backend (generated when unset)
    pub run_id: Option<String>,

    /// Train task identifier supplied by the backend
    pub task_id: Option<String>,

    /// Parent directory for staging directories (system temp dir when unset)
    pub staging_dir: Option<PathBuf>,

    /// Hub settings
    pub hub: HubSettings,

    /// Fine-tuning routine settings
    pub finetune: FineTuneSettings,

    /// Logging settings
    pub logging: LoggingSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            store_root: None,
            datastore_sysroot: None,
            model_id: None,
            push_checkpoints: false,
            push_repo: None,
            pipeline_name: DEFAULT_PIPELINE_NAME.to_string(),
            run_id: None,
            task_id: None,
            staging_dir: None,
            hub: HubSettings::default(),
            finetune: FineTuneSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

/// Model hub settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    /// Hub endpoint
    pub endpoint: String,

    /// Revision pulled for the base model
    pub revision: String,

    /// Access token; falls back to `HF_TOKEN` and `~/.huggingface/token`
    pub token: Option<String>,

    /// Use a local directory mirror instead of the HTTP hub
    pub mirror_dir: Option<PathBuf>,

    /// Create pushed repositories as private
    pub private: bool,

    /// HTTP timeout in seconds for a single file transfer
    pub timeout_secs: u64,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_HUB_ENDPOINT.to_string(),
            revision: "main".to_string(),
            token: None,
            mirror_dir: None,
            private: true,
            timeout_secs: 3600,
        }
    }
}

/// Fine-tuning routine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FineTuneSettings {
    /// Program implementing the LoRA routine
    pub program: String,

    /// Arguments passed before the injected paths
    pub args: Vec<String>,

    /// Output directory the routine writes the trained model to. Defaults to
    /// a `lora-output` sibling of the staged base model.
    pub output_dir: Option<PathBuf>,

    /// Extra environment for the routine
    pub env: HashMap<String, String>,
}

impl Default for FineTuneSettings {
    fn default() -> Self {
        Self {
            program: "python".to_string(),
            args: vec!["finetune.py".to_string()],
            output_dir: None,
            env: HashMap::new(),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl PipelineConfig {
    /// Resolves the base store root
    pub fn base_store_root(&self) -> Result<StoreRoot> {
        if let Some(root) = self.store_root.as_deref().filter(|r| !r.trim().is_empty()) {
            return StoreRoot::new(root);
        }

        match self.datastore_sysroot.as_deref().filter(|r| !r.trim().is_empty()) {
            Some(sysroot) => parent_uri(sysroot).and_then(StoreRoot::new),
            None => Err(Error::Config(
                "store_root is not set and no datastore_sysroot to derive it from".to_string(),
            )),
        }
    }

    /// Returns the base model key
    pub fn model_key(&self) -> Result<ArtifactKey> {
        let model_id = self
            .model_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| Error::Config("model_id is not set".to_string()))?;

        ArtifactKey::new(model_id)
            .map_err(|e| Error::Config(format!("model_id '{}' is invalid: {}", model_id, e)))
    }

    /// Hub repository the checkpoint is pushed to, if configured
    pub fn push_repo(&self) -> Option<String> {
        self.push_repo
            .as_deref()
            .map(str::trim)
            .filter(|repo| !repo.is_empty())
            .map(str::to_string)
    }

    /// Builds the run context, generating a run id when the backend gave none
    pub fn run_context(&self) -> Result<RunContext> {
        match &self.run_id {
            Some(run_id) => RunContext::new(
                self.pipeline_name.clone(),
                run_id.clone(),
                self.task_id.clone().unwrap_or_else(|| "1".to_string()),
            ),
            None => {
                let mut context = RunContext::generate(self.pipeline_name.clone())?;
                if let Some(task_id) = &self.task_id {
                    context = RunContext::new(context.pipeline_name, context.run_id, task_id.clone())?;
                }
                Ok(context)
            }
        }
    }
}

/// Parent of a URI or path, in the manner of a `dirname`
fn parent_uri(uri: &str) -> Result<String> {
    let trimmed = uri.trim().trim_end_matches('/');

    match trimmed.rsplit_once('/') {
        // "s3://bucket" has no parent inside the namespace
        Some((parent, _)) if parent.ends_with(':') || parent.ends_with(":/") => Err(Error::Config(
            format!("datastore_sysroot '{}' has no parent to use as store root", uri),
        )),
        Some(("", _)) => Ok("/".to_string()),
        Some((parent, _)) => Ok(parent.to_string()),
        None => Err(Error::Config(format!(
            "datastore_sysroot '{}' has no parent to use as store root",
            uri
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_root_from_sysroot() {
        let config = PipelineConfig {
            datastore_sysroot: Some("s3://bucket/metaflow/".to_string()),
            ..Default::default()
        };
        assert_eq!(config.base_store_root().unwrap().as_str(), "s3://bucket");

        let config = PipelineConfig {
            datastore_sysroot: Some("/data/metaflow".to_string()),
            ..Default::default()
        };
        assert_eq!(config.base_store_root().unwrap().as_str(), "/data");

        let config = PipelineConfig {
            datastore_sysroot: Some("s3://bucket".to_string()),
            ..Default::default()
        };
        assert!(config.base_store_root().unwrap_err().is_config());
    }

    #[test]
    fn test_explicit_store_root_wins() {
        let config = PipelineConfig {
            store_root: Some("/models".to_string()),
            datastore_sysroot: Some("s3://bucket/metaflow".to_string()),
            ..Default::default()
        };
        assert_eq!(config.base_store_root().unwrap().as_str(), "/models");
    }

    #[test]
    fn test_missing_model_id() {
        let config = PipelineConfig::default();
        assert!(config.model_key().unwrap_err().is_config());

        let config = PipelineConfig {
            model_id: Some("../etc".to_string()),
            ..Default::default()
        };
        assert!(config.model_key().unwrap_err().is_config());
    }

    #[test]
    fn test_push_repo_never_falls_back_to_model_id() {
        let mut config = PipelineConfig {
            model_id: Some("org/llama-base".to_string()),
            ..Default::default()
        };
        assert_eq!(config.push_repo(), None);

        config.push_repo = Some("  ".to_string());
        assert_eq!(config.push_repo(), None);

        config.push_repo = Some("me/llama-lora".to_string());
        assert_eq!(config.push_repo().as_deref(), Some("me/llama-lora"));
    }

    #[test]
    fn test_run_context() {
        let config = PipelineConfig {
            run_id: Some("1700".to_string()),
            task_id: Some("3".to_string()),
            ..Default::default()
        };
        let context = config.run_context().unwrap();
        assert_eq!(context.pipeline_name, DEFAULT_PIPELINE_NAME);
        assert_eq!(context.run_id, "1700");
        assert_eq!(context.task_id, "3");

        let generated = PipelineConfig::default().run_context().unwrap();
        assert_eq!(generated.task_id, "1");
        assert!(!generated.run_id.is_empty());
    }
}

//! Staged workflow engine
//!
//! Drives one workflow instance through Prepare, Train and Publish. The
//! engine decides which artifact store each stage talks to and owns the
//! lifetime of every staging directory. Each stage re-reads its inputs from
//! the durable stores; nothing is handed over through local disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use common::error::{Error, Result};
use common::types::{ArtifactKey, Stage};
use common::utils::{format_bytes, measure_execution_time_async};
use config::PipelineConfig;
use model_manager::{FineTuner, ModelHub};
use storage_adapter::{ArtifactStore, StagingDir};

use crate::report::{StageOutcome, StageReport, WorkflowReport};
use crate::state::WorkflowState;

/// Per-instance workflow settings
#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    /// Base model key, used in both stores
    pub model_key: ArtifactKey,

    /// Whether Publish pushes the trained model to the hub
    pub push_checkpoints: bool,

    /// Hub repository receiving the trained model; required when pushing
    pub push_repo: Option<String>,

    /// Parent directory for staging directories
    pub staging_parent: Option<PathBuf>,
}

impl WorkflowSettings {
    /// Creates settings with publishing disabled
    pub fn new(model_key: ArtifactKey) -> Self {
        Self {
            model_key,
            push_checkpoints: false,
            push_repo: None,
            staging_parent: None,
        }
    }

    /// Enables publishing to `repo`
    pub fn with_push_repo(mut self, repo: impl Into<String>) -> Self {
        self.push_checkpoints = true;
        self.push_repo = Some(repo.into());
        self
    }

    /// Repository Publish pushes to
    fn require_push_repo(&self) -> Result<&str> {
        self.push_repo
            .as_deref()
            .filter(|repo| !repo.trim().is_empty())
            .ok_or_else(|| Error::Config("push_checkpoints requires push_repo".to_string()))
    }

    /// Extracts settings from a pipeline configuration
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        Ok(Self {
            model_key: config.model_key()?,
            push_checkpoints: config.push_checkpoints,
            push_repo: config.push_repo(),
            staging_parent: config.staging_dir.clone(),
        })
    }
}

/// Three-stage workflow over a hub cache and a run-scoped store
pub struct StagedWorkflow {
    /// Store holding base models pulled from the hub
    hub_cache: Arc<dyn ArtifactStore>,

    /// Store holding this run's trained model
    trained_store: Arc<dyn ArtifactStore>,

    /// Model hub
    hub: Arc<dyn ModelHub>,

    /// Fine-tuning routine
    tuner: Arc<dyn FineTuner>,

    /// Instance settings
    settings: WorkflowSettings,
}

impl StagedWorkflow {
    /// Creates a workflow
    ///
    /// The two stores must be scoped to different roots.
    pub fn new(
        hub_cache: Arc<dyn ArtifactStore>,
        trained_store: Arc<dyn ArtifactStore>,
        hub: Arc<dyn ModelHub>,
        tuner: Arc<dyn FineTuner>,
        settings: WorkflowSettings,
    ) -> Result<Self> {
        if hub_cache.root() == trained_store.root() {
            return Err(Error::Config(format!(
                "hub cache and trained-model store share the root {}",
                hub_cache.root()
            )));
        }

        if settings.push_checkpoints {
            settings.require_push_repo()?;
        }

        Ok(Self {
            hub_cache,
            trained_store,
            hub,
            tuner,
            settings,
        })
    }

    /// Instance settings
    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    /// Store holding base models
    pub fn hub_cache(&self) -> &Arc<dyn ArtifactStore> {
        &self.hub_cache
    }

    /// Store holding this run's trained model
    pub fn trained_store(&self) -> &Arc<dyn ArtifactStore> {
        &self.trained_store
    }

    /// Runs every stage in order
    pub async fn run(&self) -> Result<WorkflowReport> {
        let mut state = WorkflowState::new();
        let mut report = WorkflowReport::default();

        info!(
            "Starting workflow for {} (trained models under {})",
            self.settings.model_key,
            self.trained_store.root()
        );

        for stage in Stage::ALL {
            let stage_report = self.run_stage(&mut state, stage).await?;
            report.stages.push(stage_report);
        }

        report.trained_model_root = state.trained_model_root().map(str::to_string);

        info!("Workflow for {} completed", self.settings.model_key);

        Ok(report)
    }

    /// Runs one stage, enforcing forward-only transitions
    pub async fn run_stage(&self, state: &mut WorkflowState, stage: Stage) -> Result<StageReport> {
        state.begin(stage)?;
        info!("Stage {} started", stage);

        let (result, elapsed) = measure_execution_time_async(async {
            match stage {
                Stage::Prepare => self.prepare().await,
                Stage::Train => self.train().await,
                Stage::Publish => self.publish().await,
            }
        })
        .await;

        match result {
            Ok(report) => {
                let report = report.with_duration(elapsed);
                if stage == Stage::Train {
                    state.set_trained_model_root(self.trained_store.root().to_string());
                }
                state.complete(stage);
                info!("Stage {}", report);
                Ok(report)
            }
            Err(e) => {
                error!("Stage {} failed: {}", stage, e);
                state.fail(stage, e.to_string());
                Err(e.in_stage(stage))
            }
        }
    }

    /// Ensures the base model is in the hub cache
    pub async fn prepare(&self) -> Result<StageReport> {
        let key = &self.settings.model_key;
        let location = self.hub_cache.root().location_of(key);

        if self.hub_cache.exists(key).await? {
            info!("Base model {} already cached at {}", key, location);
            return Ok(StageReport::new(Stage::Prepare, StageOutcome::CacheHit).with_location(location));
        }

        info!("Base model {} not cached, pulling from hub", key);

        let staging = self.acquire_staging(Stage::Prepare)?;
        let model_dir = staging.join("model");
        tokio::fs::create_dir_all(&model_dir).await?;

        self.hub.pull(key.as_str(), &model_dir).await?;
        let summary = self.hub_cache.upload(&model_dir, key).await?;

        release_staging(staging);

        info!(
            "Cached base model {} at {} ({} files, {})",
            key,
            location,
            summary.file_count,
            format_bytes(summary.total_bytes)
        );

        Ok(StageReport::new(Stage::Prepare, StageOutcome::Completed)
            .with_location(location)
            .with_summary(summary))
    }

    /// Fine-tunes the cached base model and stores the result under the run
    /// scope
    pub async fn train(&self) -> Result<StageReport> {
        let key = &self.settings.model_key;

        // Prepare guarantees the cache entry; never re-fetch here
        if !self.hub_cache.exists(key).await? {
            return Err(Error::InvariantViolation(format!(
                "base model {} is missing from the hub cache {}",
                key,
                self.hub_cache.root()
            )));
        }

        let staging = self.acquire_staging(Stage::Train)?;
        let base_dir = staging.join("base-model");

        let base = self.hub_cache.download(key, &base_dir).await?;
        debug!("Staged base model {} ({} files)", key, base.file_count);

        let output_dir = self.tuner.run(&base_dir).await?;
        ensure_directory(&output_dir)?;

        let summary = self.trained_store.upload(&output_dir, key).await?;
        let location = self.trained_store.root().location_of(key);

        release_staging(staging);

        info!(
            "Stored trained model at {} ({} files, {})",
            location,
            summary.file_count,
            format_bytes(summary.total_bytes)
        );

        Ok(StageReport::new(Stage::Train, StageOutcome::Completed)
            .with_location(location)
            .with_summary(summary))
    }

    /// Pushes the trained model to the hub when enabled
    pub async fn publish(&self) -> Result<StageReport> {
        if !self.settings.push_checkpoints {
            info!("Publishing disabled, nothing to push");
            return Ok(StageReport::new(Stage::Publish, StageOutcome::Skipped));
        }

        let key = &self.settings.model_key;
        let repo = self.settings.require_push_repo()?;
        let staging = self.acquire_staging(Stage::Publish)?;
        let checkpoint_dir = staging.join("checkpoint");

        let summary = self.trained_store.download(key, &checkpoint_dir).await?;
        self.hub.push(repo, &checkpoint_dir).await?;

        release_staging(staging);

        info!("Pushed trained model to {}", repo);

        Ok(StageReport::new(Stage::Publish, StageOutcome::Completed)
            .with_location(repo.to_string())
            .with_summary(summary))
    }

    fn acquire_staging(&self, stage: Stage) -> Result<StagingDir> {
        StagingDir::acquire(self.settings.staging_parent.as_deref(), stage.name())
    }
}

/// Removes a staging directory; failures are logged, not fatal
fn release_staging(staging: StagingDir) {
    let path = staging.path().to_path_buf();
    if let Err(e) = staging.release() {
        warn!("Leaving staging directory {:?} behind: {}", path, e);
    }
}

fn ensure_directory(path: &Path) -> Result<()> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(Error::ExternalService(format!(
            "fine-tuning routine reported output {} which is not a directory",
            path.display()
        )))
    }
}

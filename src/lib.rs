//! LoRA Flow
//!
//! Fine-tunes a base model with LoRA in three stages (Prepare, Train,
//! Publish), caching the base model and the trained checkpoint in a durable
//! artifact store. [`LoraFlow`] wires a validated [`PipelineConfig`] into
//! stores, a model hub, a fine-tuning routine and the staged workflow.

use std::sync::Arc;
use tracing::info;

use common::error::Result;
use common::types::{RunContext, Stage, StoreRoot};
use config::{ConfigValidator, LoggingSettings, PipelineConfig};
use logging::LogOptions;
use model_manager::{CommandFineTuner, FineTuner, ModelHub};
use orchestrator_core::{StageReport, StagedWorkflow, WorkflowReport, WorkflowSettings, WorkflowState};
use storage_adapter::{ArtifactStore, StoreResolver};

/// Pipeline entry point
#[derive(Debug)]
pub struct LoraFlow {
    /// Validated configuration
    config: PipelineConfig,

    /// Execution identity of this instance
    run: RunContext,

    /// Base store root
    base_root: StoreRoot,

    /// Store backend resolver
    resolver: StoreResolver,
}

impl LoraFlow {
    /// Creates a pipeline from configuration
    ///
    /// Validates the configuration and resolves the store roots before any
    /// stage runs.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        ConfigValidator::validate(&config)?;

        let base_root = config.base_store_root()?;
        StoreResolver::check(&base_root)?;
        let run = config.run_context()?;

        Ok(Self {
            config,
            run,
            base_root,
            resolver: StoreResolver::new(),
        })
    }

    /// Replaces the store resolver (e.g. to share a memory namespace)
    pub fn with_resolver(mut self, resolver: StoreResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Configuration in use
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Execution identity
    pub fn run_context(&self) -> &RunContext {
        &self.run
    }

    /// Root of the hub model cache
    pub fn hub_cache_root(&self) -> StoreRoot {
        self.base_root.hf_models_cache()
    }

    /// Run-scoped root for the trained model
    ///
    /// Derived from the Train stage identity, so a Publish launched as its
    /// own task with the same run and task ids finds the same root.
    pub fn trained_model_root(&self) -> StoreRoot {
        self.run.scope_for(Stage::Train).store_root(&self.base_root)
    }

    /// Opens the hub model cache
    pub fn open_hub_cache(&self) -> Result<Arc<dyn ArtifactStore>> {
        self.resolver.open(&self.hub_cache_root())
    }

    /// Opens the run-scoped trained-model store
    pub fn open_trained_store(&self) -> Result<Arc<dyn ArtifactStore>> {
        self.resolver.open(&self.trained_model_root())
    }

    /// Builds the workflow with the configured hub and fine-tuning routine
    pub fn workflow(&self) -> Result<StagedWorkflow> {
        let hub = model_manager::hub_from_settings(&self.config.hub)?;
        let tuner = Arc::new(CommandFineTuner::new(self.config.finetune.clone()));
        self.workflow_with(hub, tuner)
    }

    /// Builds the workflow with a given hub and fine-tuning routine
    pub fn workflow_with(
        &self,
        hub: Arc<dyn ModelHub>,
        tuner: Arc<dyn FineTuner>,
    ) -> Result<StagedWorkflow> {
        StagedWorkflow::new(
            self.open_hub_cache()?,
            self.open_trained_store()?,
            hub,
            tuner,
            WorkflowSettings::from_config(&self.config)?,
        )
    }

    /// Runs every stage
    pub async fn run(&self) -> Result<WorkflowReport> {
        info!(
            "Run {} of {} (task {})",
            self.run.run_id, self.run.pipeline_name, self.run.task_id
        );
        self.workflow()?.run().await
    }

    /// Runs one stage as its own task, assuming earlier stages completed
    pub async fn run_stage(&self, stage: Stage) -> Result<StageReport> {
        let mut state = WorkflowState::resume_at(stage);
        self.workflow()?.run_stage(&mut state, stage).await
    }
}

/// Installs the subscriber described by logging settings
pub fn init_logging(settings: &LoggingSettings) -> Result<()> {
    logging::init_logging(&LogOptions {
        default_level: settings.level.clone(),
        json: settings.json,
        ..LogOptions::default()
    })
}

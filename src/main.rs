//! `lora-flow` command-line entry point
//!
//! Usage: lora-flow [--config lora-flow.toml] run [--push --push-repo <repo>]
//!        lora-flow stage <prepare|train|publish> --run-id <id> --task-id <id>
//!        lora-flow exists <key> [--root <uri> | --trained]
//!        lora-flow resources [stage] [--gpus N]
//!        lora-flow config show

use std::path::PathBuf;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use common::types::{ArtifactKey, Stage, StoreRoot};
use config::{ConfigManager, PipelineConfig};
use lora_flow::LoraFlow;
use orchestrator_core::resources::DEFAULT_TRAIN_GPUS;
use orchestrator_core::StageResources;
use storage_adapter::StoreResolver;

#[derive(Debug, Parser)]
#[command(name = "lora-flow", version, about = "LoRA fine-tuning pipeline with a durable model cache")]
struct Cli {
    /// Configuration file (defaults to ./lora-flow.toml when present)
    #[arg(short, long, global = true, env = "LORA_FLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Ignore the per-user configuration file
    #[arg(long, global = true)]
    no_user_config: bool,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Command,
}

/// Settings that take precedence over every configuration source
#[derive(Debug, Args)]
struct Overrides {
    /// Base store-root URI
    #[arg(long, global = true)]
    store_root: Option<String>,

    /// Base model identifier
    #[arg(long, global = true)]
    model_id: Option<String>,

    /// Run identifier assigned by the execution backend
    #[arg(long, global = true)]
    run_id: Option<String>,

    /// Task identifier of the Train stage
    #[arg(long, global = true)]
    task_id: Option<String>,

    /// Push the trained checkpoint to the hub
    #[arg(long, global = true)]
    push: bool,

    /// Hub repository receiving the trained checkpoint
    #[arg(long, global = true)]
    push_repo: Option<String>,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    json_logs: bool,
}

impl Overrides {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(root) = &self.store_root {
            config.store_root = Some(root.clone());
        }
        if let Some(model_id) = &self.model_id {
            config.model_id = Some(model_id.clone());
        }
        if let Some(run_id) = &self.run_id {
            config.run_id = Some(run_id.clone());
        }
        if let Some(task_id) = &self.task_id {
            config.task_id = Some(task_id.clone());
        }
        if self.push {
            config.push_checkpoints = true;
        }
        if let Some(repo) = &self.push_repo {
            config.push_repo = Some(repo.clone());
        }
        if self.json_logs {
            config.logging.json = true;
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run Prepare, Train and Publish in order
    Run,

    /// Run a single stage as its own task
    Stage {
        /// Stage to run
        stage: Stage,
    },

    /// Check whether an artifact exists in a store
    Exists {
        /// Artifact key
        key: ArtifactKey,

        /// Store root to look in (defaults to the hub model cache)
        #[arg(long, conflicts_with = "trained")]
        root: Option<String>,

        /// Look in this run's trained-model store
        #[arg(long)]
        trained: bool,
    },

    /// Print the resources each stage requests from the backend
    Resources {
        /// Only this stage
        stage: Option<Stage>,

        /// GPUs for the Train stage
        #[arg(long, default_value_t = DEFAULT_TRAIN_GPUS)]
        gpus: u32,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Resources need no configuration at all
    if let Command::Resources { stage, gpus } = &cli.command {
        let resources = match stage {
            Some(stage) => vec![StageResources::for_stage_with_gpus(*stage, *gpus)],
            None => StageResources::all(*gpus),
        };
        println!("{}", serde_json::to_string_pretty(&resources)?);
        return Ok(());
    }

    let mut manager = ConfigManager::new(cli.config.clone());
    if cli.no_user_config {
        manager = manager.without_user_config();
    }
    let mut pipeline_config = manager.load().context("failed to load configuration")?;
    cli.overrides.apply(&mut pipeline_config);

    lora_flow::init_logging(&pipeline_config.logging)?;

    match cli.command {
        Command::Run => {
            let flow = LoraFlow::new(pipeline_config)?;
            let report = flow.run().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Stage { stage } => {
            let flow = LoraFlow::new(pipeline_config)?;
            info!(
                "Running stage {} for run {} (trained models under {})",
                stage,
                flow.run_context().run_id,
                flow.trained_model_root()
            );
            let report = flow.run_stage(stage).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Exists { key, root, trained } => {
            let resolver = StoreResolver::new();
            let store = match root {
                Some(root) => resolver.open(&StoreRoot::new(root)?)?,
                None => {
                    let base = pipeline_config.base_store_root()?;
                    if trained {
                        if pipeline_config.run_id.is_none() {
                            anyhow::bail!("--trained needs the run id (--run-id or LORA_FLOW__RUN_ID)");
                        }
                        let run = pipeline_config.run_context()?;
                        resolver.open(&run.scope_for(Stage::Train).store_root(&base))?
                    } else {
                        resolver.open(&base.hf_models_cache())?
                    }
                }
            };

            let exists = store.exists(&key).await?;
            println!("{}", exists);
            if !exists {
                std::process::exit(1);
            }
        }
        Command::Config { action: ConfigAction::Show } => {
            print!("{}", ConfigManager::render(&pipeline_config)?);
        }
        Command::Resources { .. } => {}
    }

    Ok(())
}

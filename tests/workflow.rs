//! End-to-end workflow scenarios

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use async_trait::async_trait;

use common::error::Result;
use common::types::{ArtifactKey, Stage};
use config::{FineTuneSettings, PipelineConfig};
use lora_flow::LoraFlow;
use model_manager::{CommandFineTuner, DirectoryHub, FineTuner, ModelHub};
use orchestrator_core::StageOutcome;
use storage_adapter::tree::{self, digest_tree};
use storage_adapter::{MemoryNamespace, StoreResolver};

/// Hub that serves a fixed two-file model and records every call
#[derive(Default)]
struct RecordingHub {
    pulls: Mutex<Vec<String>>,
    pushes: Mutex<Vec<(String, Vec<String>)>>,
}

#[async_trait]
impl ModelHub for RecordingHub {
    async fn pull(&self, model_id: &str, destination: &Path) -> Result<()> {
        self.pulls.lock().unwrap().push(model_id.to_string());
        tree::write_tree(
            destination,
            [
                ("config.json", b"{\"hidden_size\":4096}".as_slice()),
                ("model-00001.safetensors", b"\x00\x01\x02\x03".as_slice()),
            ],
        )
    }

    async fn push(&self, model_id: &str, source: &Path) -> Result<()> {
        let files = tree::list_files(source)?
            .into_iter()
            .map(|entry| entry.relative)
            .collect();
        self.pushes.lock().unwrap().push((model_id.to_string(), files));
        Ok(())
    }
}

/// Routine that writes a fixed adapter next to the staged base model
#[derive(Default)]
struct RecordingTuner {
    invocations: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl FineTuner for RecordingTuner {
    async fn run(&self, base_model_path: &Path) -> Result<PathBuf> {
        self.invocations.lock().unwrap().push(base_model_path.to_path_buf());
        let output = base_model_path.with_file_name("lora-output");
        tree::write_tree(
            &output,
            [
                ("adapter_config.json", b"{\"r\":8}".as_slice()),
                ("adapter_model.bin", b"trained".as_slice()),
            ],
        )?;
        Ok(output)
    }
}

fn pipeline_config(store_root: &str, run_id: &str, push: bool) -> PipelineConfig {
    PipelineConfig {
        store_root: Some(store_root.to_string()),
        model_id: Some("llama-base".to_string()),
        push_checkpoints: push,
        push_repo: push.then(|| "me/llama-lora".to_string()),
        run_id: Some(run_id.to_string()),
        task_id: Some("1".to_string()),
        ..PipelineConfig::default()
    }
}

fn memory_flow(namespace: &MemoryNamespace, run_id: &str, push: bool) -> LoraFlow {
    LoraFlow::new(pipeline_config("memory://models", run_id, push))
        .unwrap()
        .with_resolver(StoreResolver::with_memory(namespace.clone()))
}

#[tokio::test]
async fn prepare_fetches_missing_base_model() {
    let namespace = MemoryNamespace::new();
    let flow = memory_flow(&namespace, "1", false);
    let hub = Arc::new(RecordingHub::default());
    let workflow = flow.workflow_with(hub.clone(), Arc::new(RecordingTuner::default())).unwrap();

    let key = ArtifactKey::new("llama-base").unwrap();
    assert!(!workflow.hub_cache().exists(&key).await.unwrap());

    let report = workflow.prepare().await.unwrap();

    assert_eq!(report.outcome, StageOutcome::Completed);
    assert_eq!(report.summary.unwrap().file_count, 2);
    assert!(workflow.hub_cache().exists(&key).await.unwrap());
    assert_eq!(*hub.pulls.lock().unwrap(), vec!["llama-base".to_string()]);
}

#[tokio::test]
async fn repeated_prepare_uploads_at_most_once() {
    let namespace = MemoryNamespace::new();
    let hub = Arc::new(RecordingHub::default());

    for run_id in ["1", "2"] {
        let flow = memory_flow(&namespace, run_id, false);
        let workflow = flow
            .workflow_with(hub.clone(), Arc::new(RecordingTuner::default()))
            .unwrap();
        workflow.prepare().await.unwrap();
    }

    assert_eq!(hub.pulls.lock().unwrap().len(), 1);
    assert_eq!(
        namespace.upload_count("memory://models/huggingface-models/llama-base"),
        1
    );
}

#[tokio::test]
async fn train_stores_routine_output_under_run_scope() {
    let namespace = MemoryNamespace::new();
    let flow = memory_flow(&namespace, "run-a", false);
    let tuner = Arc::new(RecordingTuner::default());
    let workflow = flow
        .workflow_with(Arc::new(RecordingHub::default()), tuner.clone())
        .unwrap();

    let report = workflow.run().await.unwrap();

    let location = "memory://models/trained-models/LlamaInstructionTuning/run-a/train/1/llama-base";
    assert_eq!(report.stage(Stage::Train).unwrap().location.as_deref(), Some(location));

    let stored = namespace.tree(location).unwrap();
    let files: Vec<_> = stored.keys().cloned().collect();
    assert_eq!(files, vec!["adapter_config.json", "adapter_model.bin"]);
    assert_eq!(&stored["adapter_model.bin"][..], b"trained");

    // The routine saw the staged base model, and staging is gone afterwards
    let invocations = tuner.invocations.lock().unwrap();
    assert_eq!(invocations.len(), 1);
    assert!(!invocations[0].exists());
}

#[tokio::test]
async fn runs_never_share_trained_paths() {
    let namespace = MemoryNamespace::new();
    let hub = Arc::new(RecordingHub::default());

    for run_id in ["first", "second"] {
        let flow = memory_flow(&namespace, run_id, false);
        flow.workflow_with(hub.clone(), Arc::new(RecordingTuner::default()))
            .unwrap()
            .run()
            .await
            .unwrap();
    }

    let trained: Vec<_> = namespace
        .locations()
        .into_iter()
        .filter(|location| location.contains("/trained-models/"))
        .collect();
    assert_eq!(trained.len(), 2);
    assert_ne!(trained[0], trained[1]);
}

#[tokio::test]
async fn publish_disabled_makes_no_hub_push() {
    let namespace = MemoryNamespace::new();
    let flow = memory_flow(&namespace, "1", false);
    let hub = Arc::new(RecordingHub::default());
    let workflow = flow
        .workflow_with(hub.clone(), Arc::new(RecordingTuner::default()))
        .unwrap();

    let report = workflow.run().await.unwrap();

    assert_eq!(report.stage(Stage::Publish).unwrap().outcome, StageOutcome::Skipped);
    assert!(hub.pushes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn publish_enabled_pushes_trained_tree() {
    let namespace = MemoryNamespace::new();
    let flow = memory_flow(&namespace, "1", true);
    let hub = Arc::new(RecordingHub::default());
    let workflow = flow
        .workflow_with(hub.clone(), Arc::new(RecordingTuner::default()))
        .unwrap();

    workflow.run().await.unwrap();

    let pushes = hub.pushes.lock().unwrap();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].0, "me/llama-lora");
    assert_eq!(pushes[0].1, vec!["adapter_config.json", "adapter_model.bin"]);
}

#[tokio::test]
async fn train_without_cached_base_is_invariant_violation() {
    let namespace = MemoryNamespace::new();
    let flow = memory_flow(&namespace, "1", false);
    let hub = Arc::new(RecordingHub::default());
    let tuner = Arc::new(RecordingTuner::default());
    let workflow = flow.workflow_with(hub.clone(), tuner.clone()).unwrap();

    let mut state = orchestrator_core::WorkflowState::resume_at(Stage::Train);
    let err = workflow.run_stage(&mut state, Stage::Train).await.unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Train));
    assert!(err.is_invariant_violation());
    assert!(tuner.invocations.lock().unwrap().is_empty());
    assert!(hub.pulls.lock().unwrap().is_empty());
    assert!(namespace.locations().is_empty());
}

#[tokio::test]
async fn stages_as_separate_tasks_share_the_run_scope() {
    let namespace = MemoryNamespace::new();
    let hub = Arc::new(RecordingHub::default());

    // Each stage gets a fresh pipeline instance, as on a remote backend
    for stage in Stage::ALL {
        let flow = memory_flow(&namespace, "remote-7", true);
        let workflow = flow
            .workflow_with(hub.clone(), Arc::new(RecordingTuner::default()))
            .unwrap();
        let mut state = orchestrator_core::WorkflowState::resume_at(stage);
        workflow.run_stage(&mut state, stage).await.unwrap();
    }

    assert_eq!(hub.pushes.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn filesystem_store_with_mirror_and_command_routine() {
    let scratch = tempfile::tempdir().unwrap();
    let mirror = scratch.path().join("mirror");
    let store = scratch.path().join("store");
    let staging = scratch.path().join("staging");

    tree::write_tree(
        &mirror.join("llama-base"),
        [
            ("config.json", b"{}".as_slice()),
            ("weights/model.bin", b"base weights".as_slice()),
        ],
    )
    .unwrap();

    let mut config = pipeline_config(&format!("file://{}", store.display()), "fs-1", true);
    config.staging_dir = Some(staging.clone());
    config.finetune = FineTuneSettings {
        program: "sh".to_string(),
        args: vec![
            "-c".to_string(),
            "cp \"$1/config.json\" \"$2/\" && printf lora > \"$2/adapter.bin\"".to_string(),
            "finetune".to_string(),
            "{base_model_path}".to_string(),
            "{output_dir}".to_string(),
        ],
        ..FineTuneSettings::default()
    };

    let flow = LoraFlow::new(config.clone()).unwrap();
    let workflow = flow
        .workflow_with(
            Arc::new(DirectoryHub::new(&mirror)),
            Arc::new(CommandFineTuner::new(config.finetune.clone())),
        )
        .unwrap();

    let report = workflow.run().await.unwrap();
    assert_eq!(report.stages.len(), 3);

    // Cached base model is byte-identical to the mirror copy
    assert_eq!(
        digest_tree(&store.join("huggingface-models/llama-base/.tree")).unwrap(),
        digest_tree(&mirror.join("llama-base")).unwrap()
    );

    let trained = store.join("trained-models/LlamaInstructionTuning/fs-1/train/1/llama-base/.tree");
    assert_eq!(std::fs::read(trained.join("adapter.bin")).unwrap(), b"lora");
    assert!(mirror.join("me/llama-lora/adapter.bin").is_file());

    // Every staging directory was released
    assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);
}

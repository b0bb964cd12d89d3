//! Fine-tuning routine adapters
//!
//! The LoRA routine itself is external. [`CommandFineTuner`] runs it as a
//! child process, handing over the staged base model path and the output
//! directory both as argument placeholders and as environment variables.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use common::error::{Error, Result};
use common::utils::{format_bytes, format_duration, measure_execution_time_async};
use config::FineTuneSettings;
use storage_adapter::tree;

/// Placeholder replaced with the base model path in routine arguments
pub const BASE_MODEL_PLACEHOLDER: &str = "{base_model_path}";

/// Placeholder replaced with the output directory in routine arguments
pub const OUTPUT_DIR_PLACEHOLDER: &str = "{output_dir}";

/// Directory name used when no output directory is configured
pub const DEFAULT_OUTPUT_DIR_NAME: &str = "lora-output";

/// LoRA fine-tuning routine
#[async_trait]
pub trait FineTuner: Send + Sync {
    /// Trains on the base model at `base_model_path` and returns the
    /// directory holding the trained artifacts
    async fn run(&self, base_model_path: &Path) -> Result<PathBuf>;
}

/// Runs the routine as an external command
#[derive(Debug, Clone)]
pub struct CommandFineTuner {
    /// Routine settings
    settings: FineTuneSettings,
}

impl CommandFineTuner {
    /// Creates a runner from settings
    pub fn new(settings: FineTuneSettings) -> Self {
        Self { settings }
    }

    /// Output directory for a given base model path
    pub fn output_dir_for(&self, base_model_path: &Path) -> PathBuf {
        match &self.settings.output_dir {
            Some(dir) => dir.clone(),
            None => base_model_path.with_file_name(DEFAULT_OUTPUT_DIR_NAME),
        }
    }

    /// Arguments with placeholders substituted
    pub fn render_args(&self, base_model_path: &Path, output_dir: &Path) -> Vec<String> {
        let base = base_model_path.to_string_lossy();
        let output = output_dir.to_string_lossy();

        self.settings
            .args
            .iter()
            .map(|arg| {
                arg.replace(BASE_MODEL_PLACEHOLDER, &base)
                    .replace(OUTPUT_DIR_PLACEHOLDER, &output)
            })
            .collect()
    }
}

#[async_trait]
impl FineTuner for CommandFineTuner {
    async fn run(&self, base_model_path: &Path) -> Result<PathBuf> {
        let output_dir = self.output_dir_for(base_model_path);
        ensure_empty_dir(&output_dir)?;

        let args = self.render_args(base_model_path, &output_dir);
        info!(
            "Running fine-tuning routine: {} {}",
            self.settings.program,
            args.join(" ")
        );

        let mut command = Command::new(&self.settings.program);
        command
            .args(&args)
            .env("BASE_MODEL_PATH", base_model_path)
            .env("OUTPUT_DIR", &output_dir)
            .envs(&self.settings.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let (status, elapsed) = measure_execution_time_async(command.status()).await;
        let status = status.map_err(|e| {
            Error::ExternalService(format!(
                "failed to start fine-tuning routine '{}': {}",
                self.settings.program, e
            ))
        })?;

        if !status.success() {
            return Err(Error::ExternalService(format!(
                "fine-tuning routine exited with {} after {}",
                status,
                format_duration(elapsed)
            )));
        }

        // The routine must have produced something
        let root = output_dir.clone();
        let summary = tokio::task::spawn_blocking(move || tree::digest_tree(&root))
            .await
            .map_err(|e| Error::ExternalService(format!("inspecting routine output failed: {}", e)))??;

        if summary.file_count == 0 {
            return Err(Error::ExternalService(format!(
                "fine-tuning routine produced no files in {}",
                output_dir.display()
            )));
        }

        info!(
            "Fine-tuning finished in {}: {} files, {}",
            format_duration(elapsed),
            summary.file_count,
            format_bytes(summary.total_bytes)
        );

        Ok(output_dir)
    }
}

/// Creates `dir` if absent; an existing directory must be empty
fn ensure_empty_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        let occupied = !dir.is_dir() || std::fs::read_dir(dir)?.next().is_some();
        if occupied {
            return Err(Error::InvalidArgument(format!(
                "fine-tuning output directory {} already exists and is not empty",
                dir.display()
            )));
        }
    } else {
        std::fs::create_dir_all(dir)?;
    }

    debug!("Fine-tuning output directory {:?}", dir);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn shell(script: &str) -> FineTuneSettings {
        FineTuneSettings {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            output_dir: None,
            env: HashMap::new(),
        }
    }

    fn staged_base() -> (tempfile::TempDir, PathBuf) {
        let staging = tempfile::tempdir().unwrap();
        let base = staging.path().join("base");
        tree::write_tree(&base, [("config.json", b"{}".as_slice())]).unwrap();
        (staging, base)
    }

    #[test]
    fn test_placeholders_are_substituted() {
        let tuner = CommandFineTuner::new(FineTuneSettings {
            args: vec![
                "train.py".to_string(),
                "--model={base_model_path}".to_string(),
                "--out".to_string(),
                "{output_dir}".to_string(),
            ],
            ..FineTuneSettings::default()
        });

        let base = Path::new("/stage/base");
        let output = tuner.output_dir_for(base);
        assert_eq!(output, PathBuf::from("/stage/lora-output"));
        assert_eq!(
            tuner.render_args(base, &output),
            vec!["train.py", "--model=/stage/base", "--out", "/stage/lora-output"]
        );
    }

    #[tokio::test]
    async fn test_routine_output_is_returned() {
        let (_staging, base) = staged_base();
        let mut settings = shell(
            "test -f \"$BASE_MODEL_PATH/config.json\" && echo \"$RANK\" > \"$OUTPUT_DIR/adapter_model.bin\"",
        );
        settings.env.insert("RANK".to_string(), "8".to_string());

        let output = CommandFineTuner::new(settings).run(&base).await.unwrap();

        assert_eq!(output, base.with_file_name("lora-output"));
        assert_eq!(
            std::fs::read_to_string(output.join("adapter_model.bin")).unwrap(),
            "8\n"
        );
    }

    #[tokio::test]
    async fn test_failing_routine_is_external_error() {
        let (_staging, base) = staged_base();
        let err = CommandFineTuner::new(shell("exit 3")).run(&base).await.unwrap_err();
        assert!(matches!(err, Error::ExternalService(_)));
    }

    #[tokio::test]
    async fn test_empty_output_is_rejected() {
        let (_staging, base) = staged_base();
        let err = CommandFineTuner::new(shell("true")).run(&base).await.unwrap_err();
        assert!(err.to_string().contains("produced no files"));
    }

    #[tokio::test]
    async fn test_occupied_output_dir_is_rejected() {
        let (staging, base) = staged_base();
        let occupied = staging.path().join("occupied");
        tree::write_tree(&occupied, [("stale.bin", b"old".as_slice())]).unwrap();

        let mut settings = shell("true");
        settings.output_dir = Some(occupied);

        let err = CommandFineTuner::new(settings).run(&base).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}

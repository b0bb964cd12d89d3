//! Configuration validation
//!
//! Runs before the first stage so that an unset store root or model id is
//! reported at startup instead of halfway through a run.

use tracing::warn;

use common::error::{Error, Result};

use crate::pipeline::PipelineConfig;

/// Validates a [`PipelineConfig`]
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates the configuration, reporting every problem at once
    pub fn validate(config: &PipelineConfig) -> Result<()> {
        let mut problems = Vec::new();

        if let Err(e) = config.base_store_root() {
            problems.push(describe(e));
        }

        if let Err(e) = config.model_key() {
            problems.push(describe(e));
        }

        if config.pipeline_name.trim().is_empty() {
            problems.push("pipeline_name must not be empty".to_string());
        }

        if let Err(e) = config.run_context() {
            problems.push(describe(e));
        }

        if config.finetune.program.trim().is_empty() {
            problems.push("finetune.program must not be empty".to_string());
        }

        if config.push_checkpoints {
            if config.hub.mirror_dir.is_none() && config.hub.endpoint.trim().is_empty() {
                problems.push("push_checkpoints requires hub.endpoint or hub.mirror_dir".to_string());
            }
            if config.push_repo().is_none() {
                problems.push("push_checkpoints requires push_repo".to_string());
            }
        }

        if config.hub.timeout_secs == 0 {
            problems.push("hub.timeout_secs must be greater than zero".to_string());
        }

        if !problems.is_empty() {
            return Err(Error::Config(problems.join("; ")));
        }

        if let Some(output_dir) = config.finetune.output_dir.as_ref().filter(|d| d.is_relative()) {
            warn!(
                "finetune.output_dir {:?} is relative and resolves against the working directory",
                output_dir
            );
        }

        Ok(())
    }
}

/// Strips the variant prefix so joined messages read cleanly
fn describe(error: Error) -> String {
    match error {
        Error::Config(msg) | Error::InvalidArgument(msg) => msg,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> PipelineConfig {
        PipelineConfig {
            store_root: Some("/srv/models".to_string()),
            model_id: Some("llama-base".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(ConfigValidator::validate(&valid()).is_ok());
    }

    #[test]
    fn test_reports_all_problems() {
        let config = PipelineConfig {
            pipeline_name: " ".to_string(),
            ..Default::default()
        };

        let err = ConfigValidator::validate(&config).unwrap_err();
        assert!(err.is_config());

        let msg = err.to_string();
        assert!(msg.contains("store_root"));
        assert!(msg.contains("model_id"));
        assert!(msg.contains("pipeline_name"));
    }

    #[test]
    fn test_push_requires_explicit_repo() {
        let mut config = valid();
        config.push_checkpoints = true;

        let err = ConfigValidator::validate(&config).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("push_repo"));

        config.push_repo = Some(" ".to_string());
        assert!(ConfigValidator::validate(&config).is_err());

        config.push_repo = Some("me/llama-lora".to_string());
        assert!(ConfigValidator::validate(&config).is_ok());

        // Without pushing, no repository is needed
        config.push_checkpoints = false;
        config.push_repo = None;
        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let mut config = valid();
        config.hub.timeout_secs = 0;
        assert!(ConfigValidator::validate(&config).is_err());
    }
}

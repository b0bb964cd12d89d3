//! Configuration manager
//!
//! Layers configuration sources in increasing priority:
//! built-in defaults, the user config file, the working-directory (or
//! explicitly given) config file, then `LORA_FLOW__*` environment variables.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use common::error::{Error, Result};

use crate::pipeline::PipelineConfig;
use crate::validation::ConfigValidator;

/// File name looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "lora-flow.toml";

/// Environment variable prefix (`LORA_FLOW__MODEL_ID`, `LORA_FLOW__HUB__TOKEN`, ...)
pub const ENV_PREFIX: &str = "LORA_FLOW";

/// Loads and validates pipeline configuration
pub struct ConfigManager {
    /// Explicit config file, overriding the working-directory lookup
    config_file: Option<PathBuf>,

    /// Whether the per-user config file is consulted
    include_user_config: bool,

    /// Variables read instead of the process environment
    environment: Option<HashMap<String, String>>,
}

impl ConfigManager {
    /// Creates a configuration manager
    pub fn new(config_file: Option<PathBuf>) -> Self {
        Self {
            config_file,
            include_user_config: true,
            environment: None,
        }
    }

    /// Skips the per-user config file (useful for hermetic runs)
    pub fn without_user_config(mut self) -> Self {
        self.include_user_config = false;
        self
    }

    /// Reads `LORA_FLOW__*` variables from `variables` instead of the process environment
    pub fn with_environment(mut self, variables: HashMap<String, String>) -> Self {
        self.environment = Some(variables);
        self
    }

    /// Per-user config file location (`~/.config/lora-flow/config.toml` on Linux)
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("lora-flow").join("config.toml"))
    }

    /// Loads the layered configuration without validating it
    pub fn load(&self) -> Result<PipelineConfig> {
        let mut builder = config_rs::Config::builder();

        if self.include_user_config {
            if let Some(user_config) = Self::user_config_path() {
                debug!("Consulting user config file {:?}", user_config);
                builder = builder.add_source(config_rs::File::from(user_config).required(false));
            }
        }

        builder = match &self.config_file {
            Some(path) => {
                if !path.exists() {
                    return Err(Error::Config(format!(
                        "config file {} does not exist",
                        path.display()
                    )));
                }
                debug!("Loading config file {:?}", path);
                builder.add_source(config_rs::File::from(path.as_path()).required(true))
            }
            None => builder.add_source(
                config_rs::File::from(Path::new(DEFAULT_CONFIG_FILE)).required(false),
            ),
        };

        // Values stay strings so ids like `007` keep their leading zeros;
        // typed fields are converted when deserializing
        builder = builder.add_source(
            config_rs::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .source(self.environment.clone()),
        );

        let config = builder
            .build()
            .map_err(|e| Error::Config(format!("failed to load configuration: {}", e)))?;

        config
            .try_deserialize::<PipelineConfig>()
            .map_err(|e| Error::Config(format!("invalid configuration: {}", e)))
    }

    /// Loads the configuration and validates it
    pub fn load_validated(&self) -> Result<PipelineConfig> {
        let config = self.load()?;
        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    /// Renders a configuration as TOML
    pub fn render(config: &PipelineConfig) -> Result<String> {
        toml::to_string_pretty(config)
            .map_err(|e| Error::Config(format!("failed to render configuration: {}", e)))
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new(None)
    }
}

//! Configuration Loader
//!
//! Environment-aware configuration loading built on the `config` crate.
//! Sources are layered in order: defaults, an optional TOML file, then
//! `AGENTFLOW__SECTION__KEY` environment variables.

use super::error::{ConfigResult, ConfigurationError};
use super::AgentflowConfig;
use config::{Config, Environment, File, FileFormat};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const ENV_PREFIX: &str = "AGENTFLOW";
const ENV_SEPARATOR: &str = "__";

/// Loaded, validated configuration plus where it came from
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: AgentflowConfig,
    environment: String,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Load using `AGENTFLOW_CONFIG_PATH` when set, otherwise defaults plus
    /// environment overrides
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        let path = env::var("AGENTFLOW_CONFIG_PATH").ok().map(PathBuf::from);
        Self::load_layered(path.as_deref(), None)
    }

    /// Load from a TOML file plus process environment overrides
    pub fn load_from_file(path: impl AsRef<Path>) -> ConfigResult<Arc<ConfigManager>> {
        Self::load_layered(Some(path.as_ref()), None)
    }

    /// Load from a TOML file with an explicit override map instead of the
    /// process environment. Keys use the `AGENTFLOW__SECTION__KEY` form.
    pub fn load_with_overrides(
        path: Option<&Path>,
        overrides: HashMap<String, String>,
    ) -> ConfigResult<Arc<ConfigManager>> {
        Self::load_layered(path, Some(overrides))
    }

    /// Wrap an already-built configuration after validating it
    pub fn from_config(config: AgentflowConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: Self::detect_environment(),
            config_path: None,
        }))
    }

    fn load_layered(
        path: Option<&Path>,
        overrides: Option<HashMap<String, String>>,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        let mut builder = Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigurationError::ConfigFileNotFound {
                    path: path.to_path_buf(),
                });
            }
            debug!(
                environment = %environment,
                path = %path.display(),
                "Loading configuration file"
            );
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true)
                .source(overrides),
        );

        let source_name = path
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "environment".to_string());

        let config: AgentflowConfig = builder
            .build()
            .and_then(|built| built.try_deserialize())
            .map_err(|e| ConfigurationError::load_error(&source_name, e))?;

        config.validate()?;

        info!(
            environment = %environment,
            source = %source_name,
            stages = config.stages.len(),
            phases = config.phases.len(),
            failure_threshold = config.circuit_breaker.failure_threshold,
            stage_timeout_ms = config.execution.stage_timeout_ms,
            "🔧 Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment,
            config_path: path.map(Path::to_path_buf),
        }))
    }

    pub fn config(&self) -> &AgentflowConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Detect the runtime environment from `AGENTFLOW_ENV`, then `APP_ENV`
    pub fn detect_environment() -> String {
        crate::logging::get_environment()
    }
}

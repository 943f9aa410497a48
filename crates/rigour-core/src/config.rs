//! Configuration for a Rigour run.
//!
//! Loaded from an optional `rigour.yml`. Every section and every field has a
//! default, so an empty document (or no file at all) is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rigour_proto::IssueType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating configuration.
///
/// These are fatal at startup: no scene runs under an invalid configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigourConfig {
    pub pipeline: PipelineConfig,
    pub executor: ExecutorConfig,
    pub healing: HealingConfig,
    pub backend: BackendConfig,
}

impl RigourConfig {
    pub fn parse_yaml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_yaml(&content)
    }

    /// Checks cross-field constraints. Run once before any scene begins.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.executor.command.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "executor.command must not be empty".to_string(),
            ));
        }
        if self.executor.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "executor.timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.executor.artifact_extension.contains(['/', '\\', '.']) {
            return Err(ConfigError::Invalid(format!(
                "executor.artifact_extension '{}' must be a bare extension",
                self.executor.artifact_extension
            )));
        }
        if !self.healing.timeout_factor.is_finite() || self.healing.timeout_factor < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "healing.timeout_factor must be at least 1.0, got {}",
                self.healing.timeout_factor
            )));
        }
        if self.healing.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "healing.timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.backend.command.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "backend.command must not be empty".to_string(),
            ));
        }
        if self.backend.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "backend.timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Phase switches for the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub enable_healing: bool,
    pub enable_exploration: bool,
    pub max_edge_cases_per_scene: usize,
    /// Run scenes concurrently instead of one at a time.
    pub parallel: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enable_healing: true,
            enable_exploration: true,
            max_edge_cases_per_scene: 8,
            parallel: false,
        }
    }
}

/// The external test runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub command: String,
    /// `{file}` is replaced with the artifact path. When absent the path is
    /// appended as the last argument.
    pub args: Vec<String>,
    pub timeout_secs: u64,
    /// Shared temporary-storage root. Defaults to the system temp dir.
    pub work_root: Option<PathBuf>,
    pub artifact_extension: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: "python3".to_string(),
            args: ["-m", "pytest", "{file}", "-v", "--tb=short"]
                .into_iter()
                .map(String::from)
                .collect(),
            timeout_secs: 60,
            work_root: None,
            artifact_extension: "py".to_string(),
        }
    }
}

impl ExecutorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn work_root(&self) -> PathBuf {
        self.work_root.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealingConfig {
    /// Ceiling for one whole heal attempt (diagnose plus repair).
    pub timeout_secs: u64,
    /// Multiplier the timeout strategy applies to declared timeouts.
    pub timeout_factor: f64,
    /// Settle delay the timeout strategy inserts before requests.
    pub settle_ms: u64,
    /// Issue types the coordinator will attempt to repair.
    pub repairable: Vec<IssueType>,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            timeout_factor: 2.0,
            settle_ms: 500,
            repairable: vec![
                IssueType::AssertionMismatch,
                IssueType::Timeout,
                IssueType::LogicError,
            ],
        }
    }
}

impl HealingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// How a prompt reaches the agent CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptMode {
    /// Passed as a command-line argument (after `prompt_flag` if set).
    #[default]
    Arg,
    /// Written to the process's stdin.
    Stdin,
}

/// The agent CLI backing the capability ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub command: String,
    pub args: Vec<String>,
    pub prompt_mode: PromptMode,
    pub prompt_flag: Option<String>,
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec![],
            prompt_mode: PromptMode::Arg,
            prompt_flag: Some("-p".to_string()),
            timeout_secs: 300,
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_default() {
        let config = RigourConfig::parse_yaml("").unwrap();
        assert_eq!(config, RigourConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.pipeline.max_edge_cases_per_scene, 8);
        assert_eq!(config.executor.args[0], "-m");
    }

    #[test]
    fn test_partial_sections_fill_defaults() {
        let yaml = r#"
pipeline:
  parallel: true
  max_edge_cases_per_scene: 3
healing:
  repairable: [timeout]
backend:
  command: gemini
  prompt_mode: stdin
"#;
        let config = RigourConfig::parse_yaml(yaml).unwrap();
        assert!(config.pipeline.parallel);
        assert!(config.pipeline.enable_healing);
        assert_eq!(config.pipeline.max_edge_cases_per_scene, 3);
        assert_eq!(config.healing.repairable, vec![IssueType::Timeout]);
        assert_eq!(config.healing.timeout_factor, 2.0);
        assert_eq!(config.backend.prompt_mode, PromptMode::Stdin);
        assert_eq!(config.executor.timeout_secs, 60);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = RigourConfig::default();
        config.healing.timeout_factor = 0.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = RigourConfig::default();
        config.executor.timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = RigourConfig::default();
        config.executor.artifact_extension = ".py".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_reports_path() {
        let err = RigourConfig::from_file(Path::new("/nonexistent/rigour.yml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/rigour.yml"));
    }

    #[test]
    fn test_unknown_issue_type_is_parse_error() {
        let yaml = "healing:\n  repairable: [gremlins]\n";
        assert!(matches!(
            RigourConfig::parse_yaml(yaml),
            Err(ConfigError::Parse(_))
        ));
    }
}

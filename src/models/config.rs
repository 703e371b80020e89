//! Configuration models for peruse.
//!
//! Everything a run can be tuned with lives here and is loaded from a TOML
//! file. Components receive the sections they need at construction.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for peruse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Chat-completions endpoint
    #[serde(default)]
    pub api: ApiConfig,

    /// Analyzer and reviewer models
    pub models: ModelsConfig,

    /// Pipeline shape
    #[serde(default)]
    pub workflow: WorkflowConfig,

    /// Output and checkpoint locations
    #[serde(default)]
    pub output: OutputConfig,

    /// Snapshot retention (absent block means nothing is ever deleted)
    #[serde(default)]
    pub retention: Option<RetentionPolicy>,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// OpenAI-compatible API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API key (can also be set via the `api_key_env` variable)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable name for API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Base URL for the API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Maximum attempts per request
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_timeout() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    3
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

/// The two model roles of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Strong model: structure analysis and answers
    pub analyzer: ModelSpec,
    /// Fast model: question selection, verification, integration
    pub reviewer: ModelSpec,
}

/// Specification for a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Model ID as understood by the endpoint
    pub id: String,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Maximum completion tokens
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_temperature() -> f64 {
    0.3
}

fn default_max_tokens() -> u32 {
    4096
}

/// Which model role writes the final report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationModel {
    /// Quick integration with the reviewer model
    #[default]
    Reviewer,
    /// Deeper integration with the analyzer model
    Analyzer,
}

/// Pipeline shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Number of questions to select and answer
    #[serde(default = "default_num_questions")]
    pub num_questions: usize,

    /// Re-answer attempts a verification may request per question
    #[serde(default)]
    pub max_followups: usize,

    /// Role used for the final report
    #[serde(default)]
    pub integration_model: IntegrationModel,
}

fn default_num_questions() -> usize {
    3
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            num_questions: default_num_questions(),
            max_followups: 0,
            integration_model: IntegrationModel::default(),
        }
    }
}

/// Output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory for final reports
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Root of the snapshot store
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,

    /// Persist a snapshot after every stage
    #[serde(default = "default_true")]
    pub enable_checkpoints: bool,

    /// Write the Markdown mirror next to each snapshot
    #[serde(default = "default_true")]
    pub readable_mirror: bool,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

fn default_true() -> bool {
    true
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            checkpoint_dir: default_checkpoint_dir(),
            enable_checkpoints: true,
            readable_mirror: true,
        }
    }
}

/// Rules bounding the snapshot store.
///
/// Every bound is optional; an unset bound is simply not applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Master switch: nothing is deleted unless this is set
    #[serde(default)]
    pub auto_cleanup: bool,

    /// Delete snapshots older than this many days
    #[serde(default)]
    pub max_age_days: Option<f64>,

    /// Keep at most this many snapshots per subject
    #[serde(default)]
    pub keep_per_subject: Option<usize>,

    /// Keep at most this many snapshots in the whole store
    #[serde(default)]
    pub max_files: Option<usize>,

    /// Keep the whole store under this many MiB
    #[serde(default)]
    pub max_size_mb: Option<f64>,

    /// Never delete snapshots that carry a final report
    #[serde(default = "default_true")]
    pub protect_completed: bool,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            auto_cleanup: false,
            max_age_days: None,
            keep_per_subject: None,
            max_files: None,
            max_size_mb: None,
            protect_completed: true,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Optional log file; logs go to stderr when unset
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Reproducibility-relevant subset of the configuration.
///
/// Recorded in every snapshot and compared on resume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigSnapshot {
    pub models: Option<ModelsConfig>,
    pub workflow: Option<WorkflowConfig>,
    pub api: ApiSnapshot,
}

/// Endpoint part of [`ConfigSnapshot`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSnapshot {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_owned(),
                source,
            },
            other => other,
        })
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workflow.num_questions == 0 {
            return Err(ConfigError::Invalid(
                "workflow.num_questions must be at least 1".to_string(),
            ));
        }
        if self.models.analyzer.id.trim().is_empty() || self.models.reviewer.id.trim().is_empty()
        {
            return Err(ConfigError::Invalid(
                "models.analyzer.id and models.reviewer.id must be set".to_string(),
            ));
        }
        if self.api.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "api.max_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve API key from config or environment.
    pub fn resolve_api_key(&self) -> Result<String, ConfigError> {
        if let Some(key) = &self.api.api_key {
            return Ok(expand_env_vars(key));
        }

        std::env::var(&self.api.api_key_env).map_err(|_| ConfigError::MissingApiKey {
            env_var: self.api.api_key_env.clone(),
        })
    }

    /// The subset of this configuration recorded in snapshots.
    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            models: Some(self.models.clone()),
            workflow: Some(self.workflow.clone()),
            api: ApiSnapshot {
                base_url: self.api.base_url.clone(),
                timeout_secs: self.api.timeout_secs,
            },
        }
    }

    /// Retention policy that is actually in force for this run.
    pub fn active_retention(&self) -> Option<&RetentionPolicy> {
        self.retention.as_ref().filter(|p| p.auto_cleanup)
    }
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let Ok(re) = regex::Regex::new(r"\$\{([^}]+)\}") else {
        return s.to_string();
    };

    re.replace_all(s, |cap: &regex::Captures<'_>| {
        std::env::var(&cap[1]).unwrap_or_else(|_| cap[0].to_string())
    })
    .into_owned()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Missing API key: set {env_var} env var or api.api_key in config")]
    MissingApiKey { env_var: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const MINIMAL: &str = r#"
[models]
analyzer = { id = "gpt-4o" }
reviewer = { id = "gpt-4o-mini", temperature = 0.1 }
"#;

    pub(crate) fn minimal() -> Config {
        Config::from_toml(MINIMAL).unwrap()
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let config = minimal();
        assert_eq!(config.workflow.num_questions, 3);
        assert_eq!(config.workflow.max_followups, 0);
        assert_eq!(config.workflow.integration_model, IntegrationModel::Reviewer);
        assert_eq!(config.output.checkpoint_dir, PathBuf::from("checkpoints"));
        assert!(config.output.enable_checkpoints);
        assert!(config.retention.is_none());
        assert!(config.active_retention().is_none());
        assert_eq!(config.models.analyzer.temperature, 0.3);
        assert_eq!(config.models.reviewer.temperature, 0.1);
    }

    #[test]
    fn retention_block_parses() {
        let text = format!(
            "{MINIMAL}\n[retention]\nauto_cleanup = true\nmax_size_mb = 5\nkeep_per_subject = 4\n"
        );
        let config = Config::from_toml(&text).unwrap();
        let policy = config.active_retention().unwrap();
        assert_eq!(policy.max_size_mb, Some(5.0));
        assert_eq!(policy.keep_per_subject, Some(4));
        assert_eq!(policy.max_files, None);
        assert!(policy.protect_completed);
    }

    #[test]
    fn zero_questions_rejected() {
        let text = format!("{MINIMAL}\n[workflow]\nnum_questions = 0\n");
        let err = Config::from_toml(&text).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn snapshot_captures_reproducibility_subset() {
        let config = minimal();
        let snap = config.snapshot();
        assert_eq!(snap.models.as_ref().unwrap().analyzer.id, "gpt-4o");
        assert_eq!(snap.workflow.as_ref().unwrap().num_questions, 3);
        assert_eq!(snap.api.base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn unset_env_placeholder_is_kept() {
        let out = expand_env_vars("Bearer ${PERUSE_SURELY_UNSET_VAR_123}");
        assert_eq!(out, "Bearer ${PERUSE_SURELY_UNSET_VAR_123}");
    }
}

//! Runtime configuration

use cadence_types::ActorId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Top-level runtime settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub documents: DocumentLayout,

    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Start an inbox pump per actor
    #[serde(default = "default_true")]
    pub auto: bool,

    /// Upper bound on messages dispatched by a single pass
    #[serde(default)]
    pub max_batch: Option<usize>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            auto: true,
            max_batch: None,
        }
    }
}

/// Naming of the per-actor logs and documents in the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentLayout {
    #[serde(default = "default_watermark_key")]
    pub watermark_key: String,

    #[serde(default = "default_config_prefix")]
    pub config_prefix: String,

    #[serde(default = "default_context_prefix")]
    pub context_prefix: String,

    #[serde(default = "default_inbox_prefix")]
    pub inbox_prefix: String,
}

impl Default for DocumentLayout {
    fn default() -> Self {
        Self {
            watermark_key: default_watermark_key(),
            config_prefix: default_config_prefix(),
            context_prefix: default_context_prefix(),
            inbox_prefix: default_inbox_prefix(),
        }
    }
}

impl DocumentLayout {
    pub fn inbox(&self, actor: &ActorId) -> String {
        format!("{}{}", self.inbox_prefix, actor)
    }

    pub fn config(&self, actor: &ActorId) -> String {
        format!("{}{}", self.config_prefix, actor)
    }

    pub fn context(&self, actor: &ActorId) -> String {
        format!("{}{}", self.context_prefix, actor)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub tick: TickMode,
}

/// How rerender flushes are scheduled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TickMode {
    /// A spawned task on the ambient tokio runtime
    #[default]
    Tokio,
    /// Queued until `ManualTick::run_pending` is called
    Manual,
}

fn default_true() -> bool {
    true
}

fn default_watermark_key() -> String {
    String::from("watermark")
}

fn default_config_prefix() -> String {
    String::from("config/")
}

fn default_context_prefix() -> String {
    String::from("context/")
}

fn default_inbox_prefix() -> String {
    String::from("inbox/")
}

impl RuntimeConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch.max_batch == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "dispatch.max_batch".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.documents.watermark_key.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "documents.watermark_key".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::from_yaml_str("{}").unwrap();
        assert!(config.dispatch.auto);
        assert_eq!(config.dispatch.max_batch, None);
        assert_eq!(config.documents.watermark_key, "watermark");
        assert_eq!(config.scheduler.tick, TickMode::Tokio);
        assert_eq!(config.documents.inbox(&ActorId::new("a")), "inbox/a");
        assert_eq!(config.documents.config(&ActorId::new("a")), "config/a");
        assert_eq!(config.documents.context(&ActorId::new("a")), "context/a");
    }

    #[test]
    fn test_partial_override() {
        let yaml = r#"
dispatch:
  auto: false
  max_batch: 10
scheduler:
  tick: manual
documents:
  inbox_prefix: "queue:"
"#;
        let config = RuntimeConfig::from_yaml_str(yaml).unwrap();
        assert!(!config.dispatch.auto);
        assert_eq!(config.dispatch.max_batch, Some(10));
        assert_eq!(config.scheduler.tick, TickMode::Manual);
        assert_eq!(config.documents.inbox(&ActorId::new("b")), "queue:b");
        assert_eq!(config.documents.config_prefix, "config/");
    }

    #[test]
    fn test_zero_batch_rejected() {
        let err = RuntimeConfig::from_yaml_str("dispatch:\n  max_batch: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "scheduler:\n  tick: manual").unwrap();
        let config = RuntimeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.scheduler.tick, TickMode::Manual);
    }
}

//! Builder configuration
//!
//! Defaults match the native engine idioms; a JSON file and a couple of
//! environment variables can override them.

use std::path::Path;

use serde::Deserialize;

use crate::error::{PipelineError, Result};
use crate::logging::{self, LogLevel};

pub const FOREIGN_FIELD_ENV_VAR: &str = "STAGECRAFT_FOREIGN_FIELD";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Foreign key used by joins synthesized from referenced-field filters
    pub foreign_field: String,
    /// `preserveNullAndEmptyArrays` for the unwind following such a join
    pub preserve_null_on_join: bool,
    pub log_level: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            foreign_field: "_id".to_string(),
            preserve_null_on_join: true,
            log_level: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: PipelineConfig = serde_json::from_str(raw)
            .map_err(|e| PipelineError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    /// Overlay `STAGECRAFT_FOREIGN_FIELD` and `STAGECRAFT_LOG`
    pub fn with_env(mut self) -> Result<Self> {
        if let Ok(field) = std::env::var(FOREIGN_FIELD_ENV_VAR) {
            self.foreign_field = field;
        }
        if let Ok(level) = std::env::var(logging::LOG_ENV_VAR) {
            self.log_level = Some(level);
        }
        self.validate()?;
        Ok(self)
    }

    /// Push `log_level` into the global logger, if present
    pub fn apply_logging(&self) -> Result<()> {
        if let Some(level) = &self.log_level {
            logging::set_log_level(level.parse::<LogLevel>()?);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.foreign_field.trim().is_empty() {
            return Err(PipelineError::Config(
                "foreign_field must not be empty".to_string(),
            ));
        }
        if let Some(level) = &self.log_level {
            level.parse::<LogLevel>()?;
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
        let config = PipelineConfig::default();
        assert_eq!(config.foreign_field, "_id");
        assert!(config.preserve_null_on_join);
        assert_eq!(config.log_level, None);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = PipelineConfig::from_json_str(r#"{"preserve_null_on_join": false}"#).unwrap();
        assert_eq!(config.foreign_field, "_id");
        assert!(!config.preserve_null_on_join);
    }

    #[test]
    fn test_rejects_unknown_keys_and_bad_values() {
        assert!(matches!(
            PipelineConfig::from_json_str(r#"{"foreign": "x"}"#),
            Err(PipelineError::Config(_))
        ));
        assert!(matches!(
            PipelineConfig::from_json_str(r#"{"foreign_field": "  "}"#),
            Err(PipelineError::Config(_))
        ));
        assert!(matches!(
            PipelineConfig::from_json_str(r#"{"log_level": "chatty"}"#),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"foreign_field": "uuid", "log_level": "debug"}}"#).unwrap();

        let config = PipelineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.foreign_field, "uuid");
        assert_eq!(config.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = PipelineConfig::from_file(dir.path().join("absent.json"));
        assert!(matches!(result, Err(PipelineError::Io(_))));
    }
}

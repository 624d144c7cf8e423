use std::path::{Path, PathBuf};

use crate::config::schema::{Config, MAX_DURATION_SECS};
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../schema/config-v1.json");

/// Environment variable consulted when no config path is passed explicitly.
pub const CONFIG_ENV_VAR: &str = "MEDIAFORGE_CONFIG";

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

/// Picks the config file: explicit argument, then `MEDIAFORGE_CONFIG`, then
/// `~/.mediaforge/config.json`.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    if let Some(path) = std::env::var_os(CONFIG_ENV_VAR).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    dirs::home_dir()
        .map(|home| home.join(".mediaforge").join("config.json"))
        .ok_or(ConfigError::NoConfigPath)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.storage_root.as_os_str().is_empty() {
        return Err(ConfigError::Validation {
            message: "storageRoot must not be empty".to_string(),
        });
    }

    if config.workers.concurrency == 0 {
        return Err(ConfigError::Validation {
            message: "workers.concurrency must be at least 1".to_string(),
        });
    }

    if config.workers.thumbnail_multiplier == 0 {
        return Err(ConfigError::Validation {
            message: "workers.thumbnailMultiplier must be at least 1".to_string(),
        });
    }

    if config.workers.progress_step == 0 || config.workers.progress_step > 100 {
        return Err(ConfigError::Validation {
            message: format!(
                "workers.progressStep must be within 1..=100, got {}",
                config.workers.progress_step
            ),
        });
    }

    if config.recovery.max_attempts == 0 {
        return Err(ConfigError::Validation {
            message: "recovery.maxAttempts must be at least 1".to_string(),
        });
    }

    let timeouts = [
        ("timeouts.transcodeSecs", config.timeouts.transcode_secs),
        ("timeouts.thumbnailSecs", config.timeouts.thumbnail_secs),
        ("timeouts.documentSecs", config.timeouts.document_secs),
        ("timeouts.probeSecs", config.timeouts.probe_secs),
        ("recovery.staleAfterSecs", config.recovery.stale_after_secs),
        ("recovery.sweepIntervalSecs", config.recovery.sweep_interval_secs),
        ("workers.heartbeatSecs", config.workers.heartbeat_secs),
    ];
    for (name, value) in timeouts {
        if value == 0 {
            return Err(ConfigError::Validation {
                message: format!("{} must be greater than zero", name),
            });
        }
        if value > MAX_DURATION_SECS {
            return Err(ConfigError::Validation {
                message: format!("{} must be at most {}, got {}", name, MAX_DURATION_SECS, value),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogFormat;
    use crate::job::TranscodeQuality;
    use serial_test::serial;

    #[test]
    fn test_load_valid_config() {
        let config_json = r#"
        {
            "version": "1.0",
            "storageRoot": "/srv/media",
            "logFormat": "json",
            "workers": {
                "concurrency": 4,
                "thumbnailMultiplier": 3
            },
            "recovery": {
                "maxAttempts": 5
            },
            "transcode": {
                "defaultQuality": "high"
            }
        }
        "#;

        let config = load_config_from_str(config_json).unwrap();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.storage_root, PathBuf::from("/srv/media"));
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.workers.concurrency, 4);
        assert_eq!(config.workers.thumbnail_multiplier, 3);
        assert_eq!(config.recovery.max_attempts, 5);
        assert_eq!(config.transcode.default_quality, TranscodeQuality::High);
    }

    #[test]
    fn test_missing_storage_root_fails_schema() {
        let result = load_config_from_str(r#"{"version": "1.0"}"#);
        assert!(matches!(result, Err(ConfigError::SchemaValidation { .. })));
    }

    #[test]
    fn test_wrong_version_rejected() {
        let result = load_config_from_str(r#"{"version": "2.0", "storageRoot": "/srv"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let result = load_config_from_str(
            r#"{"version": "1.0", "storageRoot": "/srv", "workerz": {"concurrency": 2}}"#,
        );
        assert!(matches!(result, Err(ConfigError::SchemaValidation { .. })));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let result = load_config_from_str(
            r#"{"version": "1.0", "storageRoot": "/srv", "workers": {"concurrency": 0}}"#,
        );
        assert!(matches!(result, Err(ConfigError::SchemaValidation { .. })));
    }

    #[test]
    fn test_unbounded_timeout_rejected() {
        let result = load_config_from_str(
            r#"{"version": "1.0", "storageRoot": "/srv", "timeouts": {"transcodeSecs": 18446744073709551615}}"#,
        );
        assert!(result.is_err());

        let result = load_config_from_str(
            r#"{"version": "1.0", "storageRoot": "/srv", "workers": {"heartbeatSecs": 2592001}}"#,
        );
        assert!(matches!(result, Err(ConfigError::SchemaValidation { .. })));
    }

    #[test]
    fn test_bad_quality_rejected() {
        let result = load_config_from_str(
            r#"{"version": "1.0", "storageRoot": "/srv", "transcode": {"defaultQuality": "ultra"}}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_json() {
        let result = load_config_from_str("{ not json");
        assert!(matches!(result, Err(ConfigError::ParseJson(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"version": "1.0", "storageRoot": "/srv/media"}"#).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.storage_root, PathBuf::from("/srv/media"));

        let missing = load_config(dir.path().join("nope.json"));
        assert!(matches!(missing, Err(ConfigError::ReadFile { .. })));
    }

    #[test]
    #[serial]
    fn test_resolve_config_path_precedence() {
        std::env::set_var(CONFIG_ENV_VAR, "/etc/mediaforge/config.json");
        assert_eq!(
            resolve_config_path(Some(PathBuf::from("/tmp/explicit.json"))).unwrap(),
            PathBuf::from("/tmp/explicit.json")
        );
        assert_eq!(
            resolve_config_path(None).unwrap(),
            PathBuf::from("/etc/mediaforge/config.json")
        );

        std::env::remove_var(CONFIG_ENV_VAR);
        let fallback = resolve_config_path(None).unwrap();
        assert!(fallback.ends_with(".mediaforge/config.json"));
    }
}

//! Configuration loading.
//!
//! The config lives at `~/.caseflow/config.json`. A missing file is not an
//! error (defaults apply); a malformed one is.

use std::fs;
use std::path::{Path, PathBuf};

use crate::types::Config;

/// Environment override for the provisional confidence threshold.
pub const CONFIDENCE_THRESHOLD_ENV: &str = "CASEFLOW_CONFIDENCE_THRESHOLD";

/// Directory holding config and the default database.
pub fn get_state_dir() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or("Could not find home directory")?;
    Ok(home.join(".caseflow"))
}

/// Load the configuration from the default location.
pub fn load_config() -> Result<Config, String> {
    let config_path = get_state_dir()?.join("config.json");
    load_config_from(&config_path)
}

/// Load configuration from an explicit path, applying env overrides.
pub fn load_config_from(config_path: &Path) -> Result<Config, String> {
    let mut config = if config_path.exists() {
        let content = fs::read_to_string(config_path)
            .map_err(|e| format!("Failed to read config: {}", e))?;
        serde_json::from_str::<Config>(&content)
            .map_err(|e| format!("Failed to parse config: {}", e))?
    } else {
        log::debug!(
            "Config file not found at {}, using defaults",
            config_path.display()
        );
        Config::default()
    };

    if let Ok(raw) = std::env::var(CONFIDENCE_THRESHOLD_ENV) {
        config.confidence_threshold = raw
            .trim()
            .parse::<f64>()
            .map_err(|e| format!("Invalid {}: {}", CONFIDENCE_THRESHOLD_ENV, e))?;
    }

    validate_config(&config)?;
    Ok(config)
}

/// Reject configurations the engine cannot honor.
pub fn validate_config(config: &Config) -> Result<(), String> {
    if !(0.0..=1.0).contains(&config.confidence_threshold) {
        return Err(format!(
            "confidenceThreshold must be within 0..1, got {}",
            config.confidence_threshold
        ));
    }
    if config.dedup_window_hours == 0 {
        return Err("dedupWindowHours must be greater than zero".to_string());
    }
    if config.default_first_response_sla_hours == 0
        || config.first_response_sla_hours.values().any(|h| *h == 0)
    {
        return Err("First-response SLA hours must be greater than zero".to_string());
    }
    config.tz()?;
    Ok(())
}

/// Resolve the database path: explicit config value or `~/.caseflow/caseflow.db`.
pub fn database_path(config: &Config) -> Result<PathBuf, String> {
    match config.database_path.as_deref() {
        Some(path) if !path.trim().is_empty() => Ok(PathBuf::from(path)),
        _ => Ok(get_state_dir()?.join("caseflow.db")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_config_from(&dir.path().join("absent.json")).expect("defaults");
        assert_eq!(config.dedup_window_hours, 24);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = load_config_from(&path).unwrap_err();
        assert!(err.contains("Failed to parse config"));
    }

    #[test]
    fn test_validate_rejects_out_of_range_threshold() {
        let config = Config {
            confidence_threshold: 1.5,
            ..Config::default()
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_timezone() {
        let config = Config {
            timezone: "Mars/Olympus".to_string(),
            ..Config::default()
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_database_path_prefers_explicit_value() {
        let config = Config {
            database_path: Some("/tmp/cases.db".to_string()),
            ..Config::default()
        };
        assert_eq!(database_path(&config).unwrap(), PathBuf::from("/tmp/cases.db"));
    }
}

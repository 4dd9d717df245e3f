//! Configuration module for persistent settings.
//!
//! This module handles loading, saving, and validating daemon configuration.
//! The file lives at `~/.config/energy-monitor/config.json` unless overridden
//! with the `ENERGY_MONITOR_CONFIG` environment variable.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Directory name used under the platform config and data directories.
pub const APP_DIR: &str = "energy-monitor";

/// Upper bound for the auto-export interval (one week).
pub const MAX_EXPORT_INTERVAL_HOURS: u32 = 168;

/// Account used to open a session with the remote power API.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub subdomain: String,
    pub captcha_model_path: String,
}

impl Credentials {
    /// Username and password are the minimum needed to log in.
    pub fn is_complete(&self) -> bool {
        !self.username.trim().is_empty() && !self.password.is_empty()
    }
}

/// How the daemon reaches the remote power API.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RemoteSettings {
    /// Helper program that speaks the vendor protocol.
    pub command: String,
    /// Extra arguments placed before the action verb.
    pub args: Vec<String>,
    /// Host used for the cheap reachability probe.
    pub probe_host: String,
    pub probe_port: u16,
    pub connect_timeout_secs: u64,
    /// Upper bound for any single remote call.
    pub request_timeout_secs: u64,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            command: "fusion-solar-cmd".to_string(),
            args: Vec::new(),
            probe_host: "www.google.com".to_string(),
            probe_port: 80,
            connect_timeout_secs: 2,
            request_timeout_secs: 30,
        }
    }
}

/// Output format of the periodic export.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Csv,
    Json,
}

/// Periodic export settings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ExportSettings {
    pub auto_enabled: bool,
    pub interval_hours: u32,
    pub folder: PathBuf,
    pub format: ExportFormat,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            auto_enabled: false,
            interval_hours: 24,
            folder: data_dir(),
            format: ExportFormat::Csv,
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Seconds between acquisition ticks.
    pub time_interval: u64,
    /// Gates the zero-production alarm only.
    pub alarm_enabled: bool,
    pub data_retention_days: u32,
    pub data_file: PathBuf,
    pub control_socket: PathBuf,
    pub credentials: Credentials,
    pub remote: RemoteSettings,
    pub export: ExportSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            time_interval: 5,
            alarm_enabled: true,
            data_retention_days: 30,
            data_file: data_dir().join("energy_data.json"),
            control_socket: PathBuf::from("/tmp/energy-monitor.sock"),
            credentials: Credentials::default(),
            remote: RemoteSettings::default(),
            export: ExportSettings::default(),
        }
    }
}

impl Config {
    /// Validate configuration values.
    /// Returns Ok(()) if valid, Err with descriptive message if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.time_interval < 1 {
            return Err(ConfigError::ValidationError(format!(
                "time_interval ({}) must be at least 1 second",
                self.time_interval
            )));
        }

        if self.data_retention_days < 1 {
            return Err(ConfigError::ValidationError(format!(
                "data_retention_days ({}) must be at least 1 day",
                self.data_retention_days
            )));
        }

        if self.export.interval_hours < 1 || self.export.interval_hours > MAX_EXPORT_INTERVAL_HOURS {
            return Err(ConfigError::ValidationError(format!(
                "export.interval_hours ({}) must be between 1 and {}",
                self.export.interval_hours, MAX_EXPORT_INTERVAL_HOURS
            )));
        }

        if self.remote.request_timeout_secs < 1 || self.remote.connect_timeout_secs < 1 {
            return Err(ConfigError::ValidationError(
                "remote timeouts must be at least 1 second".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration manager with file I/O.
pub struct ConfigManager {
    config: RwLock<Config>,
    path: PathBuf,
}

impl ConfigManager {
    /// Load configuration from file or use defaults.
    /// If the file doesn't exist, returns a manager with default config.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let contents = fs::read_to_string(path).map_err(|e| {
                ConfigError::ParseError(format!("Failed to read config file: {}", e))
            })?;

            let config: Config = serde_json::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(format!("Invalid JSON: {}", e)))?;

            config.validate()?;
            config
        } else {
            Config::default()
        };

        Ok(Self {
            config: RwLock::new(config),
            path: path.to_path_buf(),
        })
    }

    /// Save configuration to file using atomic write.
    pub fn save(&self) -> Result<(), ConfigError> {
        let config = self.config.read().map_err(|_| {
            ConfigError::ValidationError("Failed to acquire read lock".to_string())
        })?;

        // Ensure config directory exists
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Atomic write: write to temp file, then rename
        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&*config)
            .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {}", e)))?;

        {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(json.as_bytes())?;
            // Flush to disk before the rename makes it visible
            file.sync_all()?;
        }

        fs::rename(&temp_path, &self.path)?;

        Ok(())
    }

    /// Get current configuration.
    pub fn get(&self) -> Config {
        self.config
            .read()
            .map(|c| c.clone())
            .unwrap_or_else(|_| Config::default())
    }

    /// Update configuration with validation.
    pub fn update(&self, config: Config) -> Result<(), ConfigError> {
        config.validate()?;

        let mut current = self.config.write().map_err(|_| {
            ConfigError::ValidationError("Failed to acquire write lock".to_string())
        })?;

        *current = config;

        // Release lock before saving
        drop(current);

        self.save()
    }

    /// Apply a change to a copy of the current configuration, then validate and persist it.
    pub fn modify<F>(&self, change: F) -> Result<Config, ConfigError>
    where
        F: FnOnce(&mut Config),
    {
        let mut config = self.get();
        change(&mut config);
        self.update(config.clone())?;
        Ok(config)
    }

    /// TIME_INTERVAL, in seconds.
    pub fn time_interval(&self) -> u64 {
        self.get().time_interval
    }

    /// ALARM_ENABLED.
    pub fn alarm_enabled(&self) -> bool {
        self.get().alarm_enabled
    }

    /// DATA_RETENTION_DAYS.
    pub fn retention_days(&self) -> u32 {
        self.get().data_retention_days
    }

    pub fn credentials(&self) -> Credentials {
        self.get().credentials
    }

    /// Get the config file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the default config path (`ENERGY_MONITOR_CONFIG` or ~/.config/energy-monitor/config.json).
    pub fn default_path() -> PathBuf {
        if let Some(path) = std::env::var_os("ENERGY_MONITOR_CONFIG") {
            return PathBuf::from(path);
        }
        config_dir().join("config.json")
    }
}

/// Get the config directory path.
fn config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from("/tmp").join(APP_DIR))
}

/// Get the local data directory path (energy data, exports, logs).
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from("/tmp").join(APP_DIR))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.time_interval, 5);
        assert!(config.alarm_enabled);
        assert_eq!(config.data_retention_days, 30);
        assert_eq!(config.export.interval_hours, 24);
        assert_eq!(config.export.format, ExportFormat::Csv);
        assert!(!config.export.auto_enabled);
        assert!(!config.credentials.is_complete());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_manager_load_nonexistent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nonexistent.json");

        let manager = ConfigManager::load_or_default(&path).unwrap();
        assert_eq!(manager.get(), Config::default());
    }

    #[test]
    fn test_config_manager_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let manager = ConfigManager::load_or_default(&path).unwrap();
        manager
            .modify(|config| {
                config.time_interval = 10;
                config.alarm_enabled = false;
                config.data_retention_days = 7;
                config.credentials.username = "operator".to_string();
                config.credentials.password = "secret".to_string();
            })
            .unwrap();

        let manager2 = ConfigManager::load_or_default(&path).unwrap();
        assert_eq!(manager2.time_interval(), 10);
        assert!(!manager2.alarm_enabled());
        assert_eq!(manager2.retention_days(), 7);
        assert!(manager2.credentials().is_complete());
    }

    #[test]
    fn test_partial_file_uses_defaults_for_missing_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"time_interval": 60}"#).unwrap();

        let manager = ConfigManager::load_or_default(&path).unwrap();
        let config = manager.get();
        assert_eq!(config.time_interval, 60);
        assert_eq!(config.data_retention_days, 30);
        assert_eq!(config.remote.probe_port, 80);
    }

    #[test]
    fn test_invalid_json_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let result = ConfigManager::load_or_default(&path);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_modify_rejects_invalid_change_and_keeps_old_value() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let manager = ConfigManager::load_or_default(&path).unwrap();

        let result = manager.modify(|config| config.data_retention_days = 0);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
        assert_eq!(manager.retention_days(), 30);
    }

    #[test]
    fn test_export_format_serialization() {
        let json = serde_json::to_string(&ExportFormat::Json).unwrap();
        assert_eq!(json, "\"json\"");
        let parsed: ExportFormat = serde_json::from_str("\"csv\"").unwrap();
        assert_eq!(parsed, ExportFormat::Csv);
        assert!(serde_json::from_str::<ExportFormat>("\"xlsx\"").is_err());
    }

    #[test]
    fn test_credentials_completeness() {
        let mut creds = Credentials::default();
        assert!(!creds.is_complete());
        creds.username = "  ".to_string();
        creds.password = "pw".to_string();
        assert!(!creds.is_complete());
        creds.username = "user".to_string();
        assert!(creds.is_complete());
    }

    // Strategy to generate valid Config values
    fn valid_config_strategy() -> impl Strategy<Value = Config> {
        (1u64..=3600, any::<bool>(), 1u32..=3650, 1u32..=168, any::<bool>()).prop_map(
            |(interval, alarm, retention, export_hours, auto_export)| {
                let mut config = Config::default();
                config.time_interval = interval;
                config.alarm_enabled = alarm;
                config.data_retention_days = retention;
                config.export.interval_hours = export_hours;
                config.export.auto_enabled = auto_export;
                config
            },
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_config_file_round_trip(config in valid_config_strategy()) {
            let dir = tempdir().unwrap();
            let path = dir.path().join("config.json");

            let manager = ConfigManager::load_or_default(&path).unwrap();
            manager.update(config.clone()).unwrap();

            let loaded = ConfigManager::load_or_default(&path).unwrap().get();
            prop_assert_eq!(config, loaded);
        }

        #[test]
        fn prop_export_interval_out_of_range_rejected(hours in prop_oneof![Just(0u32), 169u32..=1000]) {
            let mut config = Config::default();
            config.export.interval_hours = hours;

            let result = config.validate();
            prop_assert!(matches!(result, Err(ConfigError::ValidationError(_))));
        }

        #[test]
        fn prop_valid_configs_pass_validation(config in valid_config_strategy()) {
            prop_assert!(config.validate().is_ok(), "Valid config should pass validation: {:?}", config);
        }
    }
}

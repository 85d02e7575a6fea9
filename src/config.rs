//! Configuration loading and persistence.
//!
//! Connection settings live in `config.json` in the idlewire config
//! directory. The password is never written to disk; supply it through
//! `IDLEWIRE_PASSWORD` or the command line.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::wire::DEFAULT_MAX_LINE_LENGTH;

/// Config file name inside the config directory.
pub const CONFIG_FILE: &str = "config.json";

/// Session settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Server host name or address.
    pub host: String,
    /// Server TCP port.
    pub port: u16,
    /// Shared secret sent with `password` after connecting. NOT serialized.
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Park the connection in `idle` even when no task waits for events.
    pub idle_when_unobserved: bool,
    /// Longest accepted reply line in bytes.
    pub max_line_length: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6600,
            password: None,
            idle_when_unobserved: true,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

impl SessionConfig {
    /// Returns the configuration directory path.
    ///
    /// `IDLEWIRE_CONFIG_DIR` overrides the platform config directory.
    ///
    /// # Errors
    ///
    /// Fails if the platform has no config directory.
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("IDLEWIRE_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("idlewire"))
    }

    /// Loads configuration from the config directory, falling back to
    /// defaults, then applies environment overrides.
    ///
    /// # Errors
    ///
    /// Fails if the config file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let mut config = match Self::config_dir() {
            Ok(dir) => Self::load_from(&dir)?,
            Err(e) => {
                log::debug!("[Config] {e}, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads `config.json` from `dir`; defaults if the file is absent.
    ///
    /// # Errors
    ///
    /// Fails if the file exists but cannot be read or parsed.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    /// Persists the configuration to `dir`, creating it if necessary.
    /// Note: the password is NOT saved.
    ///
    /// # Errors
    ///
    /// Fails on any filesystem error.
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(CONFIG_FILE);
        fs::write(&path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Apply `IDLEWIRE_HOST`, `IDLEWIRE_PORT` and `IDLEWIRE_PASSWORD`.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("IDLEWIRE_HOST") {
            self.host = host;
        }

        if let Some(port) = lookup("IDLEWIRE_PORT") {
            match port.parse::<u16>() {
                Ok(port) => self.port = port,
                Err(_) => log::warn!("[Config] Ignoring invalid IDLEWIRE_PORT {port:?}"),
            }
        }

        if let Some(password) = lookup("IDLEWIRE_PASSWORD") {
            self.password = Some(password).filter(|p| !p.is_empty());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 6600);
        assert_eq!(config.password, None);
        assert!(config.idle_when_unobserved);
        assert_eq!(config.max_line_length, DEFAULT_MAX_LINE_LENGTH);
    }

    #[test]
    fn test_config_serialization_excludes_password() {
        let config = SessionConfig {
            password: Some("hunter2".to_string()),
            ..SessionConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(!json.contains("password"));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig {
            host: "music.lan".to_string(),
            port: 6601,
            password: Some("secret".to_string()),
            idle_when_unobserved: false,
            max_line_length: 4096,
        };
        config.save_to(dir.path()).unwrap();

        let loaded = SessionConfig::load_from(dir.path()).unwrap();
        assert_eq!(loaded.host, "music.lan");
        assert_eq!(loaded.port, 6601);
        assert_eq!(loaded.password, None);
        assert!(!loaded.idle_when_unobserved);
        assert_eq!(loaded.max_line_length, 4096);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            SessionConfig::load_from(dir.path()).unwrap(),
            SessionConfig::default()
        );
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), r#"{"port": 7000}"#).unwrap();
        let loaded = SessionConfig::load_from(dir.path()).unwrap();
        assert_eq!(loaded.port, 7000);
        assert_eq!(loaded.host, "localhost");
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "{not json").unwrap();
        assert!(SessionConfig::load_from(dir.path()).is_err());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("IDLEWIRE_HOST", "10.0.0.2"),
            ("IDLEWIRE_PORT", "6700"),
            ("IDLEWIRE_PASSWORD", "pw"),
        ]
        .into_iter()
        .collect();
        let mut config = SessionConfig::default();
        config.apply_overrides(|key| vars.get(key).map(ToString::to_string));
        assert_eq!(config.host, "10.0.0.2");
        assert_eq!(config.port, 6700);
        assert_eq!(config.password.as_deref(), Some("pw"));
    }

    #[test]
    fn test_invalid_port_override_ignored() {
        let mut config = SessionConfig::default();
        config.apply_overrides(|key| (key == "IDLEWIRE_PORT").then(|| "lots".to_string()));
        assert_eq!(config.port, 6600);
    }
}

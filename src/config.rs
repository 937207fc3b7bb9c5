//! Configuration loading and persistence.
//!
//! Settings come from `config.json` in the config directory, then
//! environment variables override individual fields:
//!
//! | Variable                          | Field                    |
//! |-----------------------------------|--------------------------|
//! | `SOCKMUX_ORIGIN`                  | `origin`                 |
//! | `SOCKMUX_WS_URL`                  | `realtime_url`           |
//! | `SOCKMUX_MAX_RECONNECT_ATTEMPTS`  | `max_reconnect_attempts` |
//! | `SOCKMUX_RECONNECT_DELAY_MS`      | `reconnect_delay_ms`     |
//! | `SOCKMUX_MAX_RECONNECT_DELAY_MS`  | `max_reconnect_delay_ms` |
//! | `SOCKMUX_BACKOFF`                 | `backoff`                |
//!
//! Values that fail to parse are ignored.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backoff::{Backoff, BackoffKind, RetryPolicy};
use crate::constants::{
    DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_MAX_RECONNECT_DELAY, DEFAULT_ORIGIN,
    DEFAULT_RECONNECT_DELAY,
};
use crate::resolver::EndpointResolver;

/// File name inside the config directory.
const CONFIG_FILE: &str = "config.json";

/// Runtime configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Application origin the WebSocket base is derived from.
    pub origin: String,
    /// Explicit WebSocket base, overriding `origin`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realtime_url: Option<String>,
    /// Reconnect attempts after an unclean close.
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnect, in milliseconds.
    pub reconnect_delay_ms: u64,
    /// Ceiling for exponential backoff, in milliseconds.
    pub max_reconnect_delay_ms: u64,
    /// Delay schedule.
    pub backoff: BackoffKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            origin: DEFAULT_ORIGIN.to_string(),
            realtime_url: None,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_delay_ms: duration_ms(DEFAULT_RECONNECT_DELAY),
            max_reconnect_delay_ms: duration_ms(DEFAULT_MAX_RECONNECT_DELAY),
            backoff: BackoffKind::default(),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `SOCKMUX_CONFIG_DIR` overrides the platform config dir
    /// (macOS: ~/Library/Application Support/sockmux).
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("SOCKMUX_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("sockmux")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Could not create config directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    ///
    /// A missing or unreadable file falls back to defaults.
    pub fn load() -> Result<Self> {
        let dir = Self::config_dir()?;
        let mut config = match Self::load_from(&dir.join(CONFIG_FILE)) {
            Ok(config) => config,
            Err(e) => {
                log::debug!("Using default config: {:#}", e);
                Self::default()
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Read a config file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Config file not readable: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Config file is not valid JSON: {}", path.display()))
    }

    /// Apply overrides from `lookup` (the environment, in production).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(origin) = lookup("SOCKMUX_ORIGIN") {
            self.origin = origin;
        }

        if let Some(url) = lookup("SOCKMUX_WS_URL") {
            self.realtime_url = Some(url).filter(|u| !u.trim().is_empty());
        }

        if let Some(value) = lookup("SOCKMUX_MAX_RECONNECT_ATTEMPTS") {
            if let Ok(attempts) = value.trim().parse::<u32>() {
                self.max_reconnect_attempts = attempts;
            }
        }

        if let Some(value) = lookup("SOCKMUX_RECONNECT_DELAY_MS") {
            if let Ok(ms) = value.trim().parse::<u64>() {
                self.reconnect_delay_ms = ms;
            }
        }

        if let Some(value) = lookup("SOCKMUX_MAX_RECONNECT_DELAY_MS") {
            if let Ok(ms) = value.trim().parse::<u64>() {
                self.max_reconnect_delay_ms = ms;
            }
        }

        if let Some(value) = lookup("SOCKMUX_BACKOFF") {
            if let Ok(kind) = value.parse::<BackoffKind>() {
                self.backoff = kind;
            }
        }
    }

    /// Persists the current configuration to the config directory.
    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::config_dir()?.join(CONFIG_FILE);
        self.save_to(&path)?;
        Ok(path)
    }

    /// Persists the current configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Could not write {}", path.display()))
    }

    /// Endpoint resolver for these settings.
    #[must_use]
    pub fn resolver(&self) -> EndpointResolver {
        EndpointResolver::new(&self.origin, self.realtime_url.as_deref())
    }

    /// Retry policy for these settings.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        let initial = Duration::from_millis(self.reconnect_delay_ms);
        let backoff = match self.backoff {
            BackoffKind::Fixed => Backoff::Fixed(initial),
            BackoffKind::Exponential => Backoff::Exponential {
                initial,
                max: Duration::from_millis(self.max_reconnect_delay_ms).max(initial),
            },
        };
        RetryPolicy {
            max_attempts: self.max_reconnect_attempts,
            backoff,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.origin, "http://localhost:8000");
        assert_eq!(config.realtime_url, None);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.reconnect_delay_ms, 1000);
        assert_eq!(config.max_reconnect_delay_ms, 30_000);
        assert_eq!(config.backoff, BackoffKind::Exponential);
    }

    #[test]
    fn test_overrides_apply() {
        let mut config = Config::default();
        config.apply_overrides(lookup_from(&[
            ("SOCKMUX_ORIGIN", "https://jobs.example.com"),
            ("SOCKMUX_WS_URL", "wss://rt.example.com"),
            ("SOCKMUX_MAX_RECONNECT_ATTEMPTS", "9"),
            ("SOCKMUX_RECONNECT_DELAY_MS", " 250 "),
            ("SOCKMUX_MAX_RECONNECT_DELAY_MS", "4000"),
            ("SOCKMUX_BACKOFF", "fixed"),
        ]));

        assert_eq!(config.origin, "https://jobs.example.com");
        assert_eq!(config.realtime_url.as_deref(), Some("wss://rt.example.com"));
        assert_eq!(config.max_reconnect_attempts, 9);
        assert_eq!(config.reconnect_delay_ms, 250);
        assert_eq!(config.max_reconnect_delay_ms, 4000);
        assert_eq!(config.backoff, BackoffKind::Fixed);
    }

    #[test]
    fn test_unparseable_overrides_are_ignored() {
        let mut config = Config::default();
        config.apply_overrides(lookup_from(&[
            ("SOCKMUX_MAX_RECONNECT_ATTEMPTS", "lots"),
            ("SOCKMUX_RECONNECT_DELAY_MS", "-1"),
            ("SOCKMUX_BACKOFF", "linear"),
            ("SOCKMUX_WS_URL", ""),
        ]));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"origin":"https://a.example","backoff":"fixed"}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.origin, "https://a.example");
        assert_eq!(config.backoff, BackoffKind::Fixed);
        assert_eq!(config.max_reconnect_attempts, 5);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = Config {
            realtime_url: Some("ws://127.0.0.1:9000".to_string()),
            max_reconnect_attempts: 2,
            ..Config::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{").unwrap();
        assert!(Config::load_from(&path).is_err());
        assert!(Config::load_from(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_resolver_from_config() {
        let config = Config {
            origin: "https://jobs.example.com/dashboard".to_string(),
            ..Config::default()
        };
        assert_eq!(
            config.resolver().resolve("/ws/jobs"),
            "wss://jobs.example.com/ws/jobs"
        );
    }

    #[test]
    fn test_retry_policy_from_config() {
        let fixed = Config {
            backoff: BackoffKind::Fixed,
            reconnect_delay_ms: 3000,
            max_reconnect_attempts: 5,
            ..Config::default()
        };
        assert_eq!(
            fixed.retry_policy(),
            RetryPolicy::fixed(5, Duration::from_secs(3))
        );

        let exponential = Config {
            reconnect_delay_ms: 500,
            max_reconnect_delay_ms: 100,
            ..Config::default()
        };
        // Ceiling never drops below the initial delay.
        assert_eq!(
            exponential.retry_policy().backoff,
            Backoff::Exponential {
                initial: Duration::from_millis(500),
                max: Duration::from_millis(500),
            }
        );
    }
}

//! Client configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/seapig/client.toml)
//! 3. Environment variables (SEAPIG_* prefix)
//!
//! Environment variables take precedence over config file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Environment variable prefix
const ENV_PREFIX: &str = "SEAPIG";

/// Connection settings for a Seapig client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// WebSocket URL of the Seapig server
    #[serde(default)]
    pub url: String,

    /// How often to check for a stale connection
    #[serde(default = "default_liveness_interval_ms")]
    pub liveness_interval_ms: u64,

    /// Silence after which the connection is considered dead
    #[serde(default = "default_liveness_timeout_ms")]
    pub liveness_timeout_ms: u64,

    /// Delay before reconnecting after the connection dropped
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Option set sent with `client-options-set` on every connection
    #[serde(default = "default_options")]
    pub options: Value,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            liveness_interval_ms: default_liveness_interval_ms(),
            liveness_timeout_ms: default_liveness_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            options: default_options(),
        }
    }
}

impl ClientConfig {
    /// Create a configuration for a server URL with default timings
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (SEAPIG_URL, SEAPIG_LIVENESS_INTERVAL_MS, ...)
    /// 2. Config file (~/.config/seapig/client.toml or SEAPIG_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: ClientConfig =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // SEAPIG_URL
        if let Ok(val) = std::env::var(format!("{}_URL", ENV_PREFIX)) {
            self.url = val;
        }

        let millis = |name: &str| {
            std::env::var(format!("{}_{}", ENV_PREFIX, name))
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
        };
        if let Some(ms) = millis("LIVENESS_INTERVAL_MS") {
            self.liveness_interval_ms = ms;
        }
        if let Some(ms) = millis("LIVENESS_TIMEOUT_MS") {
            self.liveness_timeout_ms = ms;
        }
        if let Some(ms) = millis("RECONNECT_DELAY_MS") {
            self.reconnect_delay_ms = ms;
        }
    }

    /// Check that the configuration can drive a connection
    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            bail!("No Seapig server URL configured. Set `url` or SEAPIG_URL.");
        }
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            bail!("Seapig server URL must start with ws:// or wss://, got '{}'", self.url);
        }
        if self.liveness_interval_ms == 0 {
            bail!("liveness_interval_ms must be greater than zero");
        }
        if self.liveness_timeout_ms <= self.liveness_interval_ms {
            bail!(
                "liveness_timeout_ms ({}) must exceed liveness_interval_ms ({})",
                self.liveness_timeout_ms,
                self.liveness_interval_ms
            );
        }
        Ok(())
    }

    /// Save configuration to a file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with SEAPIG_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("seapig")
            .join("client.toml")
    }

    /// Liveness check period, never zero
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms.max(1))
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

fn default_options() -> Value {
    Value::Object(Map::new())
}

fn default_liveness_interval_ms() -> u64 {
    10_000
}

fn default_liveness_timeout_ms() -> u64 {
    20_000
}

fn default_reconnect_delay_ms() -> u64 {
    1_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::env;
    use std::sync::Mutex;
    use tempfile::TempDir;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "SEAPIG_URL",
        "SEAPIG_LIVENESS_INTERVAL_MS",
        "SEAPIG_LIVENESS_TIMEOUT_MS",
        "SEAPIG_RECONNECT_DELAY_MS",
    ];

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert!(config.url.is_empty());
        assert_eq!(config.options, json!({}));
        assert_eq!(config.liveness_interval(), Duration::from_secs(10));
        assert_eq!(config.liveness_timeout(), Duration::from_secs(20));
        assert_eq!(config.reconnect_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_env_override_url() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = ClientConfig::default();
        env::set_var("SEAPIG_URL", "ws://localhost:3001");
        config.apply_env_overrides();

        assert_eq!(config.url, "ws://localhost:3001");
    }

    #[test]
    fn test_env_override_timings() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = ClientConfig::default();
        env::set_var("SEAPIG_LIVENESS_INTERVAL_MS", "500");
        env::set_var("SEAPIG_LIVENESS_TIMEOUT_MS", "1500");
        env::set_var("SEAPIG_RECONNECT_DELAY_MS", "not a number");
        config.apply_env_overrides();

        assert_eq!(config.liveness_interval(), Duration::from_millis(500));
        assert_eq!(config.liveness_timeout(), Duration::from_millis(1500));
        // Unparseable values are ignored
        assert_eq!(config.reconnect_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            url = "wss://seapig.example.com/ws"
            reconnect_delay_ms = 250

            [options]
            name = "dashboard"
            tags = ["a", "b"]
        "#;

        let config = ClientConfig::load_from_str(toml).unwrap();
        assert_eq!(config.url, "wss://seapig.example.com/ws");
        assert_eq!(config.reconnect_delay(), Duration::from_millis(250));
        assert_eq!(config.liveness_timeout(), Duration::from_secs(20));
        assert_eq!(config.options, json!({"name": "dashboard", "tags": ["a", "b"]}));
    }

    #[test]
    fn test_save_and_load_file() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("client.toml");

        let mut config = ClientConfig::new("ws://127.0.0.1:3001");
        config.options = json!({"role": "worker"});
        config.save_to(&path).unwrap();

        let loaded = ClientConfig::load_from_path(&path).unwrap();
        assert_eq!(loaded.url, config.url);
        assert_eq!(loaded.options, config.options);
        assert_eq!(loaded.liveness_interval_ms, config.liveness_interval_ms);
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);

        let path = PathBuf::from("/nonexistent/seapig/client.toml");
        let config = ClientConfig::load_from_path(&path).unwrap();
        assert!(config.url.is_empty());
    }

    #[test]
    fn test_validate() {
        assert!(ClientConfig::default().validate().is_err());
        assert!(ClientConfig::new("http://example.com").validate().is_err());
        assert!(ClientConfig::new("ws://example.com").validate().is_ok());

        let mut config = ClientConfig::new("ws://example.com");
        config.liveness_timeout_ms = config.liveness_interval_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_liveness_interval() {
        let _guard = EnvGuard::new(ENV_VARS);
        env::set_var("SEAPIG_LIVENESS_INTERVAL_MS", "0");

        let config = ClientConfig::load_from_str(r#"url = "ws://example.com""#).unwrap();
        assert_eq!(config.liveness_interval_ms, 0);
        assert!(config.validate().is_err());
        assert_eq!(config.liveness_interval(), Duration::from_millis(1));
    }
}

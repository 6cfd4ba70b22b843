use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::manager::TaskSettings;
use crate::poller::PollingSettings;
use crate::provider::transport::RetryPolicy;
use crate::provider::ProviderSettings;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "GENVID_DATA_DIR";
const ENV_API_BASE_URL: &str = "GENVID_API_BASE_URL";
const ENV_API_KEY: &str = "GENVID_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub provider: ProviderConfig,
    pub polling: PollingConfig,
    pub retry: RetryConfig,
    pub tasks: TasksConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub request_timeout_secs: u64,
    /// Accept plain `http://` base URLs. Intended for local stubs only.
    pub allow_insecure_http: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_secs: u64,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TasksConfig {
    pub max_concurrent: usize,
    /// Terminal records older than this are evicted. `0` keeps them forever.
    pub retention_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            provider: ProviderConfig::default(),
            polling: PollingConfig::default(),
            retry: RetryConfig::default(),
            tasks: TasksConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            host: "0.0.0.0".to_string(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            request_timeout_secs: 60,
            allow_insecure_http: false,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            max_attempts: 360,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_factor: 2.0,
        }
    }
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            retention_secs: 24 * 60 * 60,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Overlay provider endpoint and credentials from the environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(
            env::var(ENV_API_BASE_URL).ok(),
            env::var(ENV_API_KEY).ok(),
        );
    }

    fn apply_overrides(&mut self, base_url: Option<String>, api_key: Option<String>) {
        if let Some(base_url) = base_url.filter(|value| !value.trim().is_empty()) {
            self.provider.base_url = base_url;
        }
        if let Some(api_key) = api_key.filter(|value| !value.trim().is_empty()) {
            self.provider.api_key = api_key;
        }
    }

    pub fn provider_settings(&self) -> ProviderSettings {
        ProviderSettings {
            base_url: self.provider.base_url.clone(),
            api_key: self.provider.api_key.clone(),
            request_timeout: Duration::from_secs(self.provider.request_timeout_secs.max(1)),
            allow_insecure_http: self.provider.allow_insecure_http,
            retry: self.retry_policy(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            backoff_factor: self.retry.backoff_factor.max(0.0),
        }
    }

    pub fn task_settings(&self) -> TaskSettings {
        TaskSettings {
            max_concurrent: self.tasks.max_concurrent.max(1),
            polling: PollingSettings {
                interval: Duration::from_secs(self.polling.interval_secs),
                max_attempts: self.polling.max_attempts,
                max_retries: self.retry.max_retries,
            },
        }
    }

    pub fn retention(&self) -> Option<Duration> {
        (self.tasks.retention_secs > 0).then(|| Duration::from_secs(self.tasks.retention_secs))
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. GENVID_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and write a default config.toml on first run.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

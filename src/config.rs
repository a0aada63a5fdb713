//! Configuration file handling.
//!
//! This module provides loading and saving of vulnflow configuration
//! from a TOML file, with a handful of environment overrides for
//! deployment secrets and endpoints.
//!
//! # Configuration Location
//!
//! The configuration file is stored at:
//! - Linux: `~/.config/vulnflow/config.toml`
//! - macOS: `~/Library/Application Support/vulnflow/config.toml`
//! - Windows: `%APPDATA%\vulnflow\config.toml`
//!
//! # Environment Overrides
//!
//! | Variable | Field |
//! |----------|-------|
//! | `VULNFLOW_REDIS_URL` | `redis_url` |
//! | `VULNFLOW_DATA_DIR` | `store.data_dir` |
//! | `VULNFLOW_AGENT_API_KEY` | `sources.api_key` |
//! | `VULNFLOW_ENRICHMENT_URL` | `sources.enrichment_url` |
//! | `VULNFLOW_SYNTHESIS_URL` | `sources.synthesis_url` |
//!
//! # Example Configuration
//!
//! ```toml
//! redis_url = "redis://127.0.0.1:6379/0"
//! queue_key = "analysis_tasks"
//! dead_letter_key = "analysis_tasks:dead"
//! default_format = "table"
//!
//! [cache]
//! ttl_secs = 3600
//!
//! [gateway]
//! poll_interval_secs = 2
//! max_wait_secs = 120
//!
//! [sources]
//! enrichment_url = "https://agents.internal/enrich"
//! max_attempts = 3
//! ```

use crate::agent::AgentSettings;
use crate::gateway::GatewayConfig;
use crate::source::{RetryPolicy, DEFAULT_EPSS_URL, DEFAULT_NVD_URL, DEFAULT_OSV_URL};
use crate::worker::WorkerConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

const ENV_PREFIX: &str = "VULNFLOW_";

/// Application configuration.
///
/// Every field has a default, so a partial file (or no file at all) is a
/// valid configuration.
///
/// # Example
///
/// ```no_run
/// use vulnflow::Config;
///
/// let config = Config::load().unwrap();
///
/// println!("Queue: {}", config.queue_key);
/// println!("Max wait: {}s", config.gateway.max_wait_secs);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Redis instance backing the cache and the job queue.
    ///
    /// Default: `redis://127.0.0.1:6379/0`
    pub redis_url: String,

    /// List that jobs are pushed onto.
    pub queue_key: String,

    /// List that failed jobs are moved to.
    pub dead_letter_key: String,

    /// Default output format when no `--format` flag is provided.
    ///
    /// Valid values: "table", "json"
    pub default_format: String,

    pub cache: CacheSettings,
    pub gateway: GatewaySettings,
    pub worker: WorkerSettings,
    pub sources: SourceSettings,
    pub store: StoreSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// TTL for cached stage results, in seconds.
    pub ttl_secs: u64,
    /// Bound on a single cache read or write. A slower backend is treated
    /// as unavailable and caching is switched off.
    pub io_timeout_ms: u64,
    pub enabled: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            io_timeout_ms: 500,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub poll_interval_secs: u64,
    pub max_wait_secs: u64,
    pub response_cache_ttl_secs: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 2,
            max_wait_secs: 120,
            response_cache_ttl_secs: 300,
        }
    }
}

impl GatewaySettings {
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            max_wait: Duration::from_secs(self.max_wait_secs),
            response_cache_ttl: Duration::from_secs(self.response_cache_ttl_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub block_timeout_secs: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            block_timeout_secs: 2,
            reconnect_initial_ms: 500,
            reconnect_max_secs: 30,
        }
    }
}

impl WorkerSettings {
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            block_timeout: Duration::from_secs(self.block_timeout_secs.max(1)),
            reconnect_initial: Duration::from_millis(self.reconnect_initial_ms.max(1)),
            reconnect_max: Duration::from_secs(self.reconnect_max_secs.max(1)),
        }
    }
}

/// External source endpoints and their shared HTTP tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    pub osv_url: String,
    pub epss_url: String,
    pub nvd_url: String,
    /// Empty disables the live enrichment stage (it always falls back).
    pub enrichment_url: String,
    /// Empty disables the live synthesis stage (it always falls back).
    pub synthesis_url: String,
    /// Bearer key sent to the agent endpoints.
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub score_concurrency: usize,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            osv_url: DEFAULT_OSV_URL.to_string(),
            epss_url: DEFAULT_EPSS_URL.to_string(),
            nvd_url: DEFAULT_NVD_URL.to_string(),
            enrichment_url: String::new(),
            synthesis_url: String::new(),
            api_key: None,
            request_timeout_secs: 20,
            max_attempts: 3,
            backoff_initial_ms: 1000,
            backoff_max_ms: 4000,
            score_concurrency: 8,
        }
    }
}

impl SourceSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.backoff_initial_ms),
            max_backoff: Duration::from_millis(self.backoff_max_ms),
        }
    }

    /// Upper bound on one stage call: every attempt timing out, plus the
    /// backoff between attempts.
    pub fn stage_timeout(&self) -> Duration {
        let retry = self.retry_policy();
        let attempts = retry.max_attempts;
        let backoff: Duration = (1..attempts).map(|a| retry.backoff_for(a)).sum();
        self.request_timeout().saturating_mul(attempts) + backoff
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Root of the file store. Defaults to the platform data directory.
    pub data_dir: Option<PathBuf>,
}

impl StoreSettings {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("vulnflow")
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            queue_key: "analysis_tasks".to_string(),
            dead_letter_key: "analysis_tasks:dead".to_string(),
            default_format: "table".to_string(),
            cache: CacheSettings::default(),
            gateway: GatewaySettings::default(),
            worker: WorkerSettings::default(),
            sources: SourceSettings::default(),
            store: StoreSettings::default(),
        }
    }
}

impl Config {
    /// Loads configuration from the config file, then applies environment
    /// overrides.
    ///
    /// If the config file doesn't exist, the defaults are used.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or parsed.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use vulnflow::Config;
    ///
    /// let config = Config::load()?;
    /// # Ok::<(), anyhow::Error>(())
    /// ```
    pub fn load() -> Result<Self> {
        let path = Self::config_path();

        let mut config = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Applies `VULNFLOW_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |suffix: &str| lookup(&format!("{}{}", ENV_PREFIX, suffix));

        if let Some(url) = var("REDIS_URL") {
            self.redis_url = url;
        }
        if let Some(dir) = var("DATA_DIR") {
            self.store.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(key) = var("AGENT_API_KEY") {
            self.sources.api_key = Some(key).filter(|k| !k.is_empty());
        }
        if let Some(url) = var("ENRICHMENT_URL") {
            self.sources.enrichment_url = url;
        }
        if let Some(url) = var("SYNTHESIS_URL") {
            self.sources.synthesis_url = url;
        }
    }

    /// Saves the configuration to the config file.
    ///
    /// Creates the parent directory if it doesn't exist.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;
        Ok(())
    }

    /// Returns the path to the configuration file.
    ///
    /// # Example
    ///
    /// ```
    /// use vulnflow::Config;
    ///
    /// let path = Config::config_path();
    /// println!("Config file: {}", path.display());
    /// ```
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vulnflow")
            .join("config.toml")
    }

    /// Generates a string containing the default configuration.
    pub fn generate_default_config() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }

    pub fn agent_settings(&self) -> AgentSettings {
        AgentSettings {
            cache_ttl: Duration::from_secs(self.cache.ttl_secs),
            call_timeout: self.sources.stage_timeout(),
            concurrency: self.sources.score_concurrency.max(1),
        }
    }

    pub fn cache_io_timeout(&self) -> Duration {
        Duration::from_millis(self.cache.io_timeout_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_config_default() {
        let config = Config::default();

        assert_eq!(config.queue_key, "analysis_tasks");
        assert_eq!(config.dead_letter_key, "analysis_tasks:dead");
        assert_eq!(config.cache.ttl_secs, 3600);
        assert_eq!(config.gateway.poll_interval_secs, 2);
        assert_eq!(config.gateway.max_wait_secs, 120);
        assert_eq!(config.worker.block_timeout_secs, 2);
        assert_eq!(config.sources.max_attempts, 3);
        assert!(config.sources.enrichment_url.is_empty());
        assert!(config.store.data_dir.is_none());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            queue_key = "jobs"

            [gateway]
            max_wait_secs = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.queue_key, "jobs");
        assert_eq!(config.gateway.max_wait_secs, 30);
        assert_eq!(config.gateway.poll_interval_secs, 2);
        assert_eq!(config.cache, CacheSettings::default());
    }

    #[test]
    fn test_generated_default_round_trips() {
        let text = Config::generate_default_config();
        assert!(text.contains("redis_url"));
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, Config::default());
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("VULNFLOW_REDIS_URL", "redis://cache:6379/2"),
            ("VULNFLOW_DATA_DIR", "/var/lib/vulnflow"),
            ("VULNFLOW_AGENT_API_KEY", "secret"),
            ("VULNFLOW_SYNTHESIS_URL", "http://agents/synthesize"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.redis_url, "redis://cache:6379/2");
        assert_eq!(
            config.store.data_dir,
            Some(PathBuf::from("/var/lib/vulnflow"))
        );
        assert_eq!(config.sources.api_key.as_deref(), Some("secret"));
        assert_eq!(config.sources.synthesis_url, "http://agents/synthesize");
        assert!(config.sources.enrichment_url.is_empty());
    }

    #[test]
    fn test_empty_api_key_override_clears_key() {
        let mut config = Config::default();
        config.sources.api_key = Some("old".into());
        config.apply_overrides(|name| (name == "VULNFLOW_AGENT_API_KEY").then(String::new));
        assert_eq!(config.sources.api_key, None);
    }

    #[test]
    fn test_derived_runtime_settings() {
        let config = Config::default();

        let retry = config.sources.retry_policy();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.initial_backoff, Duration::from_secs(1));

        // 3 x 20s attempts + 1s + 2s backoff
        assert_eq!(config.sources.stage_timeout(), Duration::from_secs(63));

        let agent = config.agent_settings();
        assert_eq!(agent.cache_ttl, Duration::from_secs(3600));
        assert_eq!(agent.concurrency, 8);

        assert_eq!(
            config.gateway.gateway_config().max_wait,
            Duration::from_secs(120)
        );
        assert_eq!(
            config.worker.worker_config().reconnect_initial,
            Duration::from_millis(500)
        );
    }
}

//! Configuration file model: the channel list, model associations, retry
//! policy defaults, listen address, and HTTP client pool settings loaded
//! at startup.
//!
//! Shape and loading idiom (a `ConfigFile` deserialized straight from disk,
//! wrapped in an `Arc`-shared `Config` alongside a prebuilt `reqwest::Client`)
//! is carried over from the provider/tier config this crate used to load;
//! the fields themselves are rebuilt around `model::{Channel, RouterModel}`.

use crate::balance::LoadBalancer;
use crate::model::{Channel, RouterModel};
use crate::orchestrator::{LoadBalancerStrategy, RetryPolicy};
use crate::policy::{AccessProfile, ApiKeyModelMapper};
use crate::registry::ChannelRegistry;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7601
}

fn default_api_timeout_ms() -> u64 {
    600_000
}

fn default_sse_buffer_size() -> usize {
    64
}

fn default_pool_max_idle_per_host() -> usize {
    32
}

fn default_true() -> bool {
    true
}

fn default_max_channel_retries() -> usize {
    2
}

fn default_max_single_channel_retries() -> usize {
    0
}

fn default_retry_delay_ms() -> u64 {
    250
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    pub enabled: bool,
    pub max_channel_retries: usize,
    pub max_single_channel_retries: usize,
    pub retry_delay_ms: u64,
    pub load_balancer_strategy: LoadBalancerStrategy,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_channel_retries: default_max_channel_retries(),
            max_single_channel_retries: default_max_single_channel_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            load_balancer_strategy: LoadBalancerStrategy::default(),
        }
    }
}

impl RetryPolicyConfig {
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            enabled: self.enabled,
            max_channel_retries: self.max_channel_retries,
            max_single_channel_retries: self.max_single_channel_retries,
            retry_delay_ms: self.retry_delay_ms,
            load_balancer_strategy: self.load_balancer_strategy,
        }
    }

    pub fn balancer(&self) -> LoadBalancer {
        match self.load_balancer_strategy {
            LoadBalancerStrategy::Adaptive => LoadBalancer::adaptive(),
            LoadBalancerStrategy::Weighted => LoadBalancer::weighted(),
        }
    }
}

/// On-disk configuration file: channels, virtual models, retry policy, and
/// listen/pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub models: Vec<RouterModel>,
    #[serde(default)]
    pub retry_policy: RetryPolicyConfig,
    #[serde(default)]
    pub fallback_to_channels_on_model_not_found: bool,
    #[serde(default = "default_api_timeout_ms")]
    pub api_timeout_ms: u64,
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
    #[serde(default)]
    pub pool_idle_timeout_ms: Option<u64>,
    #[serde(default = "default_sse_buffer_size")]
    pub sse_buffer_size: usize,
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
    #[serde(default)]
    pub access_profiles: HashMap<String, AccessProfile>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            channels: Vec::new(),
            models: Vec::new(),
            retry_policy: RetryPolicyConfig::default(),
            fallback_to_channels_on_model_not_found: false,
            api_timeout_ms: default_api_timeout_ms(),
            proxy_url: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_ms: None,
            sse_buffer_size: default_sse_buffer_size(),
            metrics_enabled: true,
            access_profiles: HashMap::new(),
        }
    }
}

struct ConfigInner {
    file: ConfigFile,
    http_client: reqwest::Client,
}

/// Shared, read-only handle to the loaded configuration plus the single
/// `reqwest::Client` every `HttpExecutor` dispatch reuses.
#[derive(Clone)]
pub struct Config {
    inner: Arc<ConfigInner>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let file: ConfigFile = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Self::from_config_file(file)
    }

    pub fn from_config_file(file: ConfigFile) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(file.pool_max_idle_per_host)
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .timeout(Duration::from_millis(file.api_timeout_ms));
        if let Some(idle_ms) = file.pool_idle_timeout_ms {
            builder = builder.pool_idle_timeout(Some(Duration::from_millis(idle_ms)));
        }
        if let Some(proxy_url) = &file.proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(proxy_url).context("invalid proxy_url")?);
        }
        let http_client = builder.build().context("building shared http client")?;
        Ok(Self {
            inner: Arc::new(ConfigInner { file, http_client }),
        })
    }

    pub fn file(&self) -> &ConfigFile {
        &self.inner.file
    }

    pub fn http_client(&self) -> reqwest::Client {
        self.inner.http_client.clone()
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.inner.file.host, self.inner.file.port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.inner.file.retry_policy.to_retry_policy()
    }

    /// Materializes the in-process `ChannelRegistry` this config describes.
    /// The one integration point `registry::ChannelRegistry`'s doc comment
    /// references: swapping to a database-backed registry later means
    /// replacing this method's body, not any of its callers.
    pub fn build_registry(&self) -> ChannelRegistry {
        ChannelRegistry::new(self.inner.file.channels.clone(), self.inner.file.models.clone())
    }

    /// Materializes the per-API-key access profile mapper from
    /// `access_profiles`. Empty by default, in which case every key and
    /// every model passes through unrestricted.
    pub fn build_model_mapper(&self) -> Arc<ApiKeyModelMapper> {
        Arc::new(ApiKeyModelMapper::new(self.inner.file.access_profiles.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_file_has_sane_listen_address() {
        let file = ConfigFile::default();
        assert_eq!(file.host, "0.0.0.0");
        assert_eq!(file.port, 7601);
    }

    #[test]
    fn parses_minimal_json_with_one_channel() {
        let json = serde_json::json!({
            "channels": [{
                "id": 1,
                "name": "openai-main",
                "type": "open_ai",
                "base_url": "https://api.openai.com/v1",
                "api_key": "sk-test",
                "models": ["gpt-4o"],
                "enabled": true,
            }],
            "models": [{
                "model_id": "default",
                "enabled": true,
                "associations": [
                    { "type": "channel_model", "priority": 0, "channel_id": 1, "model_id": "gpt-4o" }
                ],
            }],
        });
        let file: ConfigFile = serde_json::from_value(json).unwrap();
        assert_eq!(file.channels.len(), 1);
        assert_eq!(file.models.len(), 1);
        assert_eq!(file.port, default_port());
    }

    #[test]
    fn config_builds_registry_and_http_client() {
        let config = Config::from_config_file(ConfigFile {
            channels: vec![],
            models: vec![],
            ..ConfigFile::default()
        })
        .unwrap();
        let registry = config.build_registry();
        assert!(registry.enabled_channels().is_empty());
        assert_eq!(config.listen_addr(), "0.0.0.0:7601");
    }

    #[test]
    fn retry_policy_config_round_trips_to_retry_policy() {
        let cfg = RetryPolicyConfig {
            enabled: true,
            max_channel_retries: 3,
            max_single_channel_retries: 1,
            retry_delay_ms: 500,
            load_balancer_strategy: LoadBalancerStrategy::Weighted,
        };
        let policy = cfg.to_retry_policy();
        assert_eq!(policy.max_channel_retries, 3);
        assert_eq!(policy.retry_delay_ms, 500);
    }
}

use serde::{Deserialize, Serialize};

use mgate_common::Provider;

/// Per-provider runtime configuration served by the account source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRuntimeConfig {
    /// Worker tasks draining this provider's queue.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Capacity of the provider's bounded queue.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    /// Wire protocol spoken by a custom provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_provider: Option<Provider>,
    #[serde(default)]
    pub send_back_raw_response: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_backoff_initial_ms")]
    pub retry_backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
}

fn default_concurrency() -> usize {
    10
}

fn default_buffer_size() -> usize {
    50
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_backoff_initial_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    5_000
}

impl Default for ProviderRuntimeConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            buffer_size: default_buffer_size(),
            network: NetworkConfig::default(),
            proxy_url: None,
            base_provider: None,
            send_back_raw_response: false,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: 0,
            retry_backoff_initial_ms: default_backoff_initial_ms(),
            retry_backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl ProviderRuntimeConfig {
    /// The protocol family key selection reasons about: the provider itself,
    /// unless a custom provider declares a base type.
    pub fn base_provider_for(&self, provider: &Provider) -> Provider {
        match (provider, &self.base_provider) {
            (Provider::Custom(_), Some(base)) => base.clone(),
            _ => provider.clone(),
        }
    }
}

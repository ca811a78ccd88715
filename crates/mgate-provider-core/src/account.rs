use std::sync::Arc;

use async_trait::async_trait;

use mgate_common::{GatewayResult, Provider};

use crate::config::ProviderRuntimeConfig;
use crate::credential::Credential;
use crate::selector::KeySelector;

/// The configuration surface the engine consumes.
///
/// Loading and persistence live behind this trait; the core only reads.
#[async_trait]
pub trait AccountSource: Send + Sync {
    async fn configured_providers(&self) -> GatewayResult<Vec<Provider>>;

    async fn provider_config(&self, provider: &Provider) -> GatewayResult<ProviderRuntimeConfig>;

    async fn keys_for_provider(&self, provider: &Provider) -> GatewayResult<Vec<Credential>>;

    /// Optional override of the default weighted-random selector.
    fn key_selector(&self) -> Option<Arc<dyn KeySelector>> {
        None
    }
}

use async_trait::async_trait;

use crate::error::ProviderError;

/// What a provider returns for any successful operation: the provider-side
/// identity of the resource and its observed attribute state.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub identity: String,
    pub state: serde_json::Value,
}

/// The injected collaborator that actually talks to the cloud.
///
/// The engine never constructs provider clients itself; it drives whatever
/// implementation it is handed through this uniform contract. Property trees
/// passed in are fully resolved: no references, and secure parameters
/// already replaced by secret reference markers the provider is expected to
/// dereference natively.
///
/// Implementations classify their failures: [`ProviderError::Transient`]
/// (timeouts, throttling, conflict-in-progress) is retried by the engine
/// with bounded backoff, [`ProviderError::Terminal`] fails the node at once.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Create a resource. `name` is the logical name, usable by providers
    /// that derive display names from it.
    async fn create(
        &self,
        resource_type: &str,
        name: &str,
        properties: &serde_json::Value,
    ) -> Result<ProviderResponse, ProviderError>;

    /// Read current state. `reference` is a provider identity for resources
    /// this engine created earlier, or a logical/external name for
    /// `existing` resources. An absent existing resource is a terminal
    /// failure.
    async fn read(
        &self,
        resource_type: &str,
        reference: &str,
    ) -> Result<ProviderResponse, ProviderError>;

    /// Update a resource in place to match the given properties.
    async fn update(
        &self,
        resource_type: &str,
        identity: &str,
        properties: &serde_json::Value,
    ) -> Result<ProviderResponse, ProviderError>;
}

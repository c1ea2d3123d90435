use async_trait::async_trait;

use crate::error::Result;

use super::models::ResourceRecord;

/// Pluggable deployment-state store.
///
/// The engine treats persisted state as an injected dependency, not an
/// owned database: it only ever reads a record by logical name to decide
/// create vs. update vs. no-op, and writes back the record for nodes it
/// converged. Every node writes its own key only, so implementations need
/// nothing finer than replace-by-key semantics.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Fetch the last-known record for a logical resource name.
    async fn get(&self, deployment_id: &str, name: &str) -> Result<Option<ResourceRecord>>;

    /// Insert or replace the record for a logical resource name.
    async fn put(&self, deployment_id: &str, record: &ResourceRecord) -> Result<()>;

    /// Remove the record for a logical resource name.
    async fn delete(&self, deployment_id: &str, name: &str) -> Result<()>;

    /// List all records for a deployment.
    async fn list(&self, deployment_id: &str) -> Result<Vec<ResourceRecord>>;
}

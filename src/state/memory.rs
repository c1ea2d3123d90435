use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;

use super::backend::StateStore;
use super::models::ResourceRecord;

/// In-memory state store, keyed by (deployment, logical name).
///
/// The default for tests and single-shot library use; durable stores plug
/// in through the same trait.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: DashMap<(String, String), ResourceRecord>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, deployment_id: &str, name: &str) -> Result<Option<ResourceRecord>> {
        Ok(self
            .entries
            .get(&(deployment_id.to_string(), name.to_string()))
            .map(|r| r.clone()))
    }

    async fn put(&self, deployment_id: &str, record: &ResourceRecord) -> Result<()> {
        self.entries.insert(
            (deployment_id.to_string(), record.name.clone()),
            record.clone(),
        );
        Ok(())
    }

    async fn delete(&self, deployment_id: &str, name: &str) -> Result<()> {
        self.entries
            .remove(&(deployment_id.to_string(), name.to_string()));
        Ok(())
    }

    async fn list(&self, deployment_id: &str) -> Result<Vec<ResourceRecord>> {
        let mut records: Vec<ResourceRecord> = self
            .entries
            .iter()
            .filter(|entry| entry.key().0 == deployment_id)
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }
}

use serde::{Deserialize, Serialize};

/// Last-known state of a logical resource: provider identity plus the hash
/// of the property tree last applied to it. The hash is what makes re-apply
/// cheap: unchanged inputs hash identically and turn the node into a
/// no-op without any mutating provider call.
///
/// Property values themselves are deliberately not persisted here; secure
/// parameter markers aside, the provider remains the source of truth for
/// observed attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: String,
    pub name: String,
    pub resource_type: String,
    pub identity: String,
    pub property_hash: String,
    pub updated_at: String,
}

impl ResourceRecord {
    pub fn new(
        name: &str,
        resource_type: &str,
        identity: &str,
        property_hash: &str,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            resource_type: resource_type.to_string(),
            identity: identity.to_string(),
            property_hash: property_hash.to_string(),
            updated_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Provenance and bookkeeping attached to a normalized resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceMetadata {
    /// Resource schema or API version, when the provider reports one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Creation timestamp as reported by the provider
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Path of the state file this resource was parsed from, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_file: Option<String>,
    /// Format version of the source state file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_version: Option<String>,
    /// Collector-specific extras that don't fit the common shape
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extras: HashMap<String, serde_json::Value>,
}

/// A normalized infrastructure resource inside a snapshot.
///
/// `id` is unique within its snapshot. Equality between two resources is
/// structural over `configuration` and `tags`; the comparator decides which
/// differences count as drift.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Resource {
    /// Unique identifier within a snapshot
    pub id: String,
    /// Provider resource type, e.g. `aws_instance` or `deployment`
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Human-facing resource name
    pub name: String,
    /// Originating provider, e.g. `aws`, `kubernetes`, `terraform`
    pub provider: String,
    /// Region or location; empty when the provider has no such notion
    #[serde(default)]
    pub region: String,
    /// Namespace for namespaced providers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Full configuration as reported by the collector
    #[serde(default)]
    pub configuration: HashMap<String, serde_json::Value>,
    /// Provider tags / labels
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub metadata: ResourceMetadata,
}

impl Resource {
    /// Create a resource with the identifying fields set
    pub fn new(
        id: impl Into<String>,
        resource_type: impl Into<String>,
        name: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            resource_type: resource_type.into(),
            name: name.into(),
            provider: provider.into(),
            ..Default::default()
        }
    }

    /// Set a single configuration entry
    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.configuration.insert(key.into(), value);
        self
    }

    /// Set a single tag
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Clear every field back to the zero value.
    ///
    /// Pooled resources are reset on check-out so no state leaks between
    /// owners.
    pub fn reset(&mut self) {
        self.id.clear();
        self.resource_type.clear();
        self.name.clear();
        self.provider.clear();
        self.region.clear();
        self.namespace = None;
        self.configuration.clear();
        self.tags.clear();
        self.metadata = ResourceMetadata::default();
    }
}

/// Raw collector output before normalization.
///
/// Provider-specific collectors produce these; a caller-supplied normalizer
/// maps them into [`Resource`] values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawResource {
    pub id: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub provider: String,
    /// Untyped provider payload
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
    /// Collector metadata (API versions, pagination cursors, ...)
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl RawResource {
    pub fn new(
        id: impl Into<String>,
        resource_type: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            resource_type: resource_type.into(),
            provider: provider.into(),
            data: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_clears_all_fields() {
        let mut resource = Resource::new("i-123", "aws_instance", "web", "aws")
            .with_config("instance_type", serde_json::json!("t3.micro"))
            .with_tag("env", "prod");
        resource.metadata.state_file = Some("prod.tfstate".to_string());

        resource.reset();

        assert!(resource.id.is_empty());
        assert!(resource.configuration.is_empty());
        assert!(resource.tags.is_empty());
        assert!(resource.metadata.state_file.is_none());
        assert_eq!(resource, Resource::default());
    }

    #[test]
    fn test_serde_round_trip_uses_type_key() {
        let resource = Resource::new("db-1", "gcp_sql", "orders", "gcp");
        let json = serde_json::to_value(&resource).unwrap();
        assert_eq!(json["type"], "gcp_sql");

        let back: Resource = serde_json::from_value(json).unwrap();
        assert_eq!(back, resource);
    }
}

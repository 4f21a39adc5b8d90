use crate::resource::Resource;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Metadata describing how a snapshot was captured.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SnapshotMetadata {
    /// Version of the collector that produced the snapshot
    #[serde(default)]
    pub collector_version: String,
    /// Resource count at capture time; kept in sync by [`Snapshot::finalize`]
    #[serde(default)]
    pub resource_count: usize,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

/// A timestamped collection of resources captured from a provider or a
/// state file.
///
/// Insertion order of `resources` carries no meaning; lookups go through
/// [`Snapshot::index_by_id`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub metadata: SnapshotMetadata,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            id: String::new(),
            timestamp: Utc::now(),
            provider: String::new(),
            resources: Vec::new(),
            metadata: SnapshotMetadata::default(),
        }
    }
}

impl Snapshot {
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            ..Default::default()
        }
    }

    pub fn with_resources(mut self, resources: Vec<Resource>) -> Self {
        self.resources = resources;
        self.metadata.resource_count = self.resources.len();
        self
    }

    /// Update derived metadata after resource mutation
    pub fn finalize(&mut self) {
        self.metadata.resource_count = self.resources.len();
    }

    /// Build an id-keyed index over the resources.
    ///
    /// Later duplicates win; ids are unique within a well-formed snapshot so
    /// this only matters for malformed input.
    pub fn index_by_id(&self) -> HashMap<&str, &Resource> {
        self.resources
            .iter()
            .map(|r| (r.id.as_str(), r))
            .collect()
    }

    pub fn resource_ids(&self) -> impl Iterator<Item = &str> {
        self.resources.iter().map(|r| r.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Clear every field back to the zero value; pooled snapshots are reset
    /// on check-out.
    pub fn reset(&mut self) {
        self.id.clear();
        self.provider.clear();
        self.resources.clear();
        self.metadata = SnapshotMetadata::default();
        self.timestamp = Utc::now();
    }
}

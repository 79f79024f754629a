//! Translation configuration.
//!
//! `SyncConfig` is the raw `[sync]` section as deserialized from
//! `graphsync.toml` / `GRAPHSYNC__SYNC__*` variables. It is validated once
//! at startup into `SyncSettings`, the form the router and projector read.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;

use crate::error::CoreError;

/// Raw `[sync]` configuration section.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Logical database scope; namespaces outside `<database>.` are ignored.
    #[serde(default)]
    pub database: String,

    /// Collections whose documents become vertices.
    #[serde(default)]
    pub vertex_collections: Vec<String>,

    /// Collections whose documents become edges.
    #[serde(default)]
    pub edge_collections: Vec<String>,

    /// Per-collection field allow-lists.
    #[serde(default)]
    pub field_masks: HashMap<String, Vec<String>>,

    /// Per-collection type tag (vertex type or edge label).
    #[serde(default)]
    pub type_tags: HashMap<String, String>,

    /// Edge document field holding the source vertex reference.
    #[serde(default = "default_source_field")]
    pub edge_source_field: String,

    /// Edge document field holding the target vertex reference.
    #[serde(default = "default_target_field")]
    pub edge_target_field: String,

    /// Edge document field holding the label when no type tag is configured.
    #[serde(default = "default_label_field")]
    pub edge_label_field: String,
}

fn default_source_field() -> String {
    "src".to_string()
}

fn default_target_field() -> String {
    "dest".to_string()
}

fn default_label_field() -> String {
    "type".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database: String::new(),
            vertex_collections: Vec::new(),
            edge_collections: Vec::new(),
            field_masks: HashMap::new(),
            type_tags: HashMap::new(),
            edge_source_field: default_source_field(),
            edge_target_field: default_target_field(),
            edge_label_field: default_label_field(),
        }
    }
}

impl SyncConfig {
    /// Check run-level invariants and build the lookup form.
    ///
    /// A collection routed both as vertex and edge is fatal here, before any
    /// event is processed.
    pub fn validate(self) -> Result<SyncSettings, CoreError> {
        if self.database.trim().is_empty() {
            return Err(CoreError::Config("sync.database must be set".to_string()));
        }

        let vertex: HashSet<String> = self.vertex_collections.into_iter().collect();
        let edge: HashSet<String> = self.edge_collections.into_iter().collect();

        let mut overlap: Vec<&String> = vertex.intersection(&edge).collect();
        if !overlap.is_empty() {
            overlap.sort();
            return Err(CoreError::Config(format!(
                "collections routed as both vertex and edge: {overlap:?}"
            )));
        }

        for (name, field) in [
            ("edge_source_field", &self.edge_source_field),
            ("edge_target_field", &self.edge_target_field),
            ("edge_label_field", &self.edge_label_field),
        ] {
            if field.is_empty() {
                return Err(CoreError::Config(format!("sync.{name} must not be empty")));
            }
        }
        if self.edge_source_field == self.edge_target_field {
            return Err(CoreError::Config(
                "sync.edge_source_field and sync.edge_target_field must differ".to_string(),
            ));
        }

        for collection in self.field_masks.keys().chain(self.type_tags.keys()) {
            if !vertex.contains(collection) && !edge.contains(collection) {
                tracing::warn!(
                    collection = %collection,
                    "Mask or type tag configured for a collection that is not routed"
                );
            }
        }

        let masks = self
            .field_masks
            .into_iter()
            .map(|(c, fields)| (c, fields.into_iter().collect()))
            .collect();

        Ok(SyncSettings {
            database: self.database,
            vertex,
            edge,
            masks,
            tags: self.type_tags,
            edge_source_field: self.edge_source_field,
            edge_target_field: self.edge_target_field,
            edge_label_field: self.edge_label_field,
        })
    }
}

/// Validated translation settings. Vertex and edge sets are disjoint.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    database: String,
    vertex: HashSet<String>,
    edge: HashSet<String>,
    masks: HashMap<String, HashSet<String>>,
    tags: HashMap<String, String>,
    edge_source_field: String,
    edge_target_field: String,
    edge_label_field: String,
}

impl SyncSettings {
    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn is_vertex_collection(&self, collection: &str) -> bool {
        self.vertex.contains(collection)
    }

    pub fn is_edge_collection(&self, collection: &str) -> bool {
        self.edge.contains(collection)
    }

    pub fn field_mask(&self, collection: &str) -> Option<&HashSet<String>> {
        self.masks.get(collection)
    }

    pub fn type_tag(&self, collection: &str) -> Option<&str> {
        self.tags.get(collection).map(String::as_str)
    }

    pub fn edge_source_field(&self) -> &str {
        &self.edge_source_field
    }

    pub fn edge_target_field(&self) -> &str {
        &self.edge_target_field
    }

    pub fn edge_label_field(&self) -> &str {
        &self.edge_label_field
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> SyncConfig {
        SyncConfig {
            database: "app".to_string(),
            vertex_collections: vec!["users".to_string()],
            edge_collections: vec!["follows".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.edge_source_field, "src");
        assert_eq!(config.edge_target_field, "dest");
        assert_eq!(config.edge_label_field, "type");
    }

    #[test]
    fn validate_builds_lookup_sets() {
        let settings = base().validate().unwrap();
        assert_eq!(settings.database(), "app");
        assert!(settings.is_vertex_collection("users"));
        assert!(settings.is_edge_collection("follows"));
        assert!(!settings.is_vertex_collection("follows"));
    }

    #[test]
    fn overlapping_collections_are_rejected() {
        let mut config = base();
        config.edge_collections.push("users".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("users"));
    }

    #[test]
    fn empty_database_is_rejected() {
        let mut config = base();
        config.database = " ".to_string();
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));
    }

    #[test]
    fn identical_endpoint_fields_are_rejected() {
        let mut config = base();
        config.edge_target_field = "src".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn deserializes_from_json_with_defaults() {
        let config: SyncConfig = serde_json::from_str(
            r#"{"database":"app","vertex_collections":["users"],"field_masks":{"users":["name"]}}"#,
        )
        .unwrap();
        let settings = config.validate().unwrap();
        assert!(settings.field_mask("users").unwrap().contains("name"));
        assert_eq!(settings.edge_source_field(), "src");
        assert_eq!(settings.type_tag("users"), None);
    }
}

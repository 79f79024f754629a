//! Core value types shared by the translator and the graph executors.
//!
//! These types are the vocabulary of the sync boundary: what a source
//! document is called, what its graph entity is called, and which values
//! a graph property may hold.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Reserved property keys ────────────────────────────────────────

/// Source-side identifier field of every document.
pub const SOURCE_ID_FIELD: &str = "_id";

/// Graph property holding the entity identity of a vertex or edge.
pub const IDENTITY_KEY: &str = "uid";

/// Graph property holding a vertex's configured type tag.
pub const VERTEX_TYPE_KEY: &str = "type";

/// Graph property holding an edge's label.
pub const EDGE_TYPE_KEY: &str = "edgeType";

// ── Identity ──────────────────────────────────────────────────────

/// A source document identifier in one of the shapes the oplog carries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceId {
    String(String),
    /// 24-character hex ObjectId.
    ObjectId(String),
    Int(i64),
    Uuid(Uuid),
    /// An embedded document used as `_id`. Field order is significant.
    Compound(Vec<(String, SourceId)>),
}

/// Stable graph-side identifier, stored under the reserved `uid` property.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityIdentity(pub String);

impl EntityIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityIdentity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ── Properties ────────────────────────────────────────────────────

/// A scalar graph property value.
///
/// `Null` means "clear this property" when merged into an existing entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for PropertyValue {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<f64> for PropertyValue {
    fn from(n: f64) -> Self {
        Self::Float(n)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Property set of a vertex or edge, ordered by name.
pub type Properties = BTreeMap<String, PropertyValue>;

// ── Feed position ─────────────────────────────────────────────────

/// Ordering key of an oplog entry: a BSON `Timestamp(seconds, increment)`.
///
/// Ordered by seconds, then increment.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct FeedPosition {
    #[serde(rename = "t")]
    pub seconds: u32,
    #[serde(rename = "i")]
    pub increment: u32,
}

impl FeedPosition {
    pub fn new(seconds: u32, increment: u32) -> Self {
        Self { seconds, increment }
    }
}

impl fmt::Display for FeedPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}, {})", self.seconds, self.increment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_position_orders_by_seconds_then_increment() {
        assert!(FeedPosition::new(5, 0) > FeedPosition::new(4, 99));
        assert!(FeedPosition::new(5, 2) > FeedPosition::new(5, 1));
        assert_eq!(FeedPosition::new(3, 3), FeedPosition::new(3, 3));
    }

    #[test]
    fn feed_position_serializes_as_bson_timestamp_fields() {
        let json = serde_json::to_string(&FeedPosition::new(1700000000, 7)).unwrap();
        assert_eq!(json, r#"{"t":1700000000,"i":7}"#);
    }

    #[test]
    fn property_value_serializes_untagged() {
        let mut props = Properties::new();
        props.insert("name".to_string(), "ada".into());
        props.insert("age".to_string(), 36i64.into());
        props.insert("gone".to_string(), PropertyValue::Null);

        let json = serde_json::to_string(&props).unwrap();
        assert_eq!(json, r#"{"age":36,"gone":null,"name":"ada"}"#);

        let back: Properties = serde_json::from_str(&json).unwrap();
        assert_eq!(back, props);
    }
}

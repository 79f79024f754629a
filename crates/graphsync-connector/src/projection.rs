//! Field projection: raw document fields to graph properties.
//!
//! A collection's mask restricts which fields survive, its type tag is
//! injected under a reserved key, and every surviving value must be a
//! scalar. Extended JSON wrappers for numbers, dates and ObjectIds are
//! unwrapped so the graph sees plain values.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{Map, Value};

use graphsync_core::types::{EDGE_TYPE_KEY, IDENTITY_KEY, SOURCE_ID_FIELD, VERTEX_TYPE_KEY};
use graphsync_core::{EntityIdentity, Properties, PropertyValue, SyncSettings};

use crate::error::ProjectionError;
use crate::identity::IdentityMapper;

/// Applies per-collection masks and type tags.
#[derive(Debug, Clone, Copy)]
pub struct FieldProjector<'a> {
    settings: &'a SyncSettings,
    mapper: IdentityMapper,
}

impl<'a> FieldProjector<'a> {
    pub fn new(settings: &'a SyncSettings, mapper: IdentityMapper) -> Self {
        Self { settings, mapper }
    }

    /// Properties of a vertex: `uid`, the collection's type tag under `type`
    /// when one is configured, then the projected fields.
    pub fn project_vertex(
        &self,
        collection: &str,
        identity: &EntityIdentity,
        raw: &Map<String, Value>,
    ) -> Result<Properties, ProjectionError> {
        let mut reserved = Properties::new();
        reserved.insert(IDENTITY_KEY.to_string(), identity.as_str().into());
        if let Some(tag) = self.settings.type_tag(collection) {
            reserved.insert(VERTEX_TYPE_KEY.to_string(), tag.into());
        }
        self.project(collection, raw, &[], reserved)
    }

    /// Properties of an edge: `uid`, the label under `edgeType` when known,
    /// then the projected fields. `consumed` names fields already used for
    /// endpoints or the label; they never become properties.
    pub fn project_edge(
        &self,
        collection: &str,
        identity: &EntityIdentity,
        label: Option<&str>,
        raw: &Map<String, Value>,
        consumed: &[&str],
    ) -> Result<Properties, ProjectionError> {
        let mut reserved = Properties::new();
        reserved.insert(IDENTITY_KEY.to_string(), identity.as_str().into());
        if let Some(label) = label {
            reserved.insert(EDGE_TYPE_KEY.to_string(), label.into());
        }
        // An edge's label is never set from a raw field, even on updates
        // that don't restate it.
        let mut consumed = consumed.to_vec();
        consumed.push(EDGE_TYPE_KEY);
        self.project(collection, raw, &consumed, reserved)
    }

    fn project(
        &self,
        collection: &str,
        raw: &Map<String, Value>,
        consumed: &[&str],
        mut properties: Properties,
    ) -> Result<Properties, ProjectionError> {
        let mask = self.settings.field_mask(collection);

        for (field, value) in raw {
            if field == SOURCE_ID_FIELD || consumed.contains(&field.as_str()) {
                continue;
            }

            let top = field.split('.').next().unwrap_or(field);
            if mask.is_some_and(|m| !m.contains(top)) {
                continue;
            }

            if properties.contains_key(field) {
                tracing::warn!(
                    collection,
                    field = %field,
                    "Dropping field that collides with a reserved property"
                );
                continue;
            }

            if field.contains('.') {
                return Err(ProjectionError::InvalidValue {
                    collection: collection.to_string(),
                    field: field.clone(),
                    reason: "dotted path writes into a nested document".to_string(),
                });
            }

            let value = self.scalar(collection, field, value)?;
            properties.insert(field.clone(), value);
        }

        Ok(properties)
    }

    fn scalar(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<PropertyValue, ProjectionError> {
        let invalid = |reason: &str| ProjectionError::InvalidValue {
            collection: collection.to_string(),
            field: field.to_string(),
            reason: reason.to_string(),
        };
        let non_scalar = |shape: &'static str| ProjectionError::NonScalar {
            collection: collection.to_string(),
            field: field.to_string(),
            shape,
        };

        match value {
            Value::Null => Ok(PropertyValue::Null),
            Value::Bool(b) => Ok(PropertyValue::Bool(*b)),
            Value::String(s) => Ok(PropertyValue::String(s.clone())),
            Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => Ok(PropertyValue::Int(i)),
                (None, _) if n.is_u64() => Err(invalid("integer out of range")),
                (None, Some(f)) => Ok(PropertyValue::Float(f)),
                (None, None) => Err(invalid("unrepresentable number")),
            },
            Value::Array(_) => Err(non_scalar("array")),
            Value::Object(map) => {
                let Some((key, inner)) = single_entry(map) else {
                    return Err(non_scalar("embedded document"));
                };
                match key.as_str() {
                    "$numberInt" | "$numberLong" => inner
                        .as_str()
                        .and_then(|s| s.parse().ok())
                        .map(PropertyValue::Int)
                        .ok_or_else(|| invalid("malformed integer")),
                    "$numberDouble" => {
                        let f: f64 = inner
                            .as_str()
                            .and_then(|s| s.parse().ok())
                            .ok_or_else(|| invalid("malformed double"))?;
                        if f.is_finite() {
                            Ok(PropertyValue::Float(f))
                        } else {
                            Err(invalid("non-finite double"))
                        }
                    }
                    "$date" => parse_date(inner)
                        .map(|d| {
                            PropertyValue::String(d.to_rfc3339_opts(SecondsFormat::Millis, true))
                        })
                        .ok_or_else(|| invalid("malformed date")),
                    "$oid" => self
                        .mapper
                        .map_value(value)
                        .map(|id| PropertyValue::String(id.0))
                        .map_err(|e| invalid(&e.to_string())),
                    k if k.starts_with('$') => Err(non_scalar("extended JSON type")),
                    _ => Err(non_scalar("embedded document")),
                }
            }
        }
    }
}

fn single_entry(map: &Map<String, Value>) -> Option<(&String, &Value)> {
    if map.len() == 1 {
        map.iter().next()
    } else {
        None
    }
}

/// `$date` comes as an RFC 3339 string (relaxed), `{"$numberLong": ms}`
/// (canonical) or bare milliseconds (legacy).
fn parse_date(inner: &Value) -> Option<DateTime<Utc>> {
    let millis = match inner {
        Value::String(s) => {
            return DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|d| d.with_timezone(&Utc))
        }
        Value::Number(n) => n.as_i64()?,
        Value::Object(map) => map.get("$numberLong")?.as_str()?.parse().ok()?,
        _ => return None,
    };
    Utc.timestamp_millis_opt(millis).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphsync_core::SyncConfig;
    use serde_json::json;

    fn settings() -> SyncSettings {
        let mut config = SyncConfig {
            database: "app".to_string(),
            vertex_collections: vec!["users".to_string(), "posts".to_string()],
            edge_collections: vec!["follows".to_string()],
            ..Default::default()
        };
        config
            .field_masks
            .insert("users".to_string(), vec!["name".to_string()]);
        config
            .type_tags
            .insert("users".to_string(), "User".to_string());
        config.validate().unwrap()
    }

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn mask_keeps_only_listed_fields_and_reserved_keys() {
        let settings = settings();
        let projector = FieldProjector::new(&settings, IdentityMapper::new());
        let props = projector
            .project_vertex(
                "users",
                &"u1".into(),
                &obj(json!({"_id": "u1", "name": "ada", "secret": "x"})),
            )
            .unwrap();

        assert_eq!(props.get("uid"), Some(&"u1".into()));
        assert_eq!(props.get("type"), Some(&"User".into()));
        assert_eq!(props.get("name"), Some(&"ada".into()));
        assert!(!props.contains_key("secret"));
        assert!(!props.contains_key("_id"));
    }

    #[test]
    fn unmasked_collection_keeps_every_field() {
        let settings = settings();
        let projector = FieldProjector::new(&settings, IdentityMapper::new());
        let props = projector
            .project_vertex("posts", &"p1".into(), &obj(json!({"title": "t", "n": 3})))
            .unwrap();
        assert_eq!(props.len(), 3);
        assert!(!props.contains_key("type"));
    }

    #[test]
    fn reserved_collisions_are_dropped() {
        let settings = settings();
        let projector = FieldProjector::new(&settings, IdentityMapper::new());
        let props = projector
            .project_vertex(
                "posts",
                &"p1".into(),
                &obj(json!({"uid": "spoof", "type": "draft", "title": "t"})),
            )
            .unwrap();
        assert_eq!(props.get("uid"), Some(&"p1".into()));
        assert_eq!(props.get("title"), Some(&"t".into()));
        // Without a type tag `type` is an ordinary field.
        assert_eq!(props.get("type"), Some(&"draft".into()));
    }

    #[test]
    fn extended_json_scalars_are_unwrapped() {
        let settings = settings();
        let projector = FieldProjector::new(&settings, IdentityMapper::new());
        let props = projector
            .project_vertex(
                "posts",
                &"p1".into(),
                &obj(json!({
                    "views": {"$numberLong": "9000000000"},
                    "score": {"$numberDouble": "1.5"},
                    "at": {"$date": {"$numberLong": "0"}},
                    "edited": {"$date": "2024-01-02T03:04:05+01:00"},
                    "author": {"$oid": "65a1f0c2e4b0a1b2c3d4e5f6"},
                    "draft": null
                })),
            )
            .unwrap();

        assert_eq!(props.get("views"), Some(&PropertyValue::Int(9_000_000_000)));
        assert_eq!(props.get("score"), Some(&PropertyValue::Float(1.5)));
        assert_eq!(props.get("at"), Some(&"1970-01-01T00:00:00.000Z".into()));
        assert_eq!(props.get("edited"), Some(&"2024-01-02T02:04:05.000Z".into()));
        assert_eq!(
            props.get("author"),
            Some(&"#oid:65a1f0c2e4b0a1b2c3d4e5f6".into())
        );
        assert_eq!(props.get("draft"), Some(&PropertyValue::Null));
    }

    #[test]
    fn nested_values_are_rejected() {
        let settings = settings();
        let projector = FieldProjector::new(&settings, IdentityMapper::new());
        for raw in [
            json!({"profile": {"age": 3}}),
            json!({"tags": ["a"]}),
            json!({"bin": {"$binary": {"base64": "", "subType": "00"}}}),
        ] {
            let err = projector
                .project_vertex("posts", &"p1".into(), &obj(raw))
                .unwrap_err();
            assert!(matches!(err, ProjectionError::NonScalar { .. }));
        }

        let err = projector
            .project_vertex("posts", &"p1".into(), &obj(json!({"x": {"$numberDouble": "NaN"}})))
            .unwrap_err();
        assert!(matches!(err, ProjectionError::InvalidValue { .. }));
    }

    #[test]
    fn dotted_paths_are_rejected_unless_masked_out() {
        let settings = settings();
        let projector = FieldProjector::new(&settings, IdentityMapper::new());
        let err = projector
            .project_vertex("posts", &"p1".into(), &obj(json!({"a.b": 1})))
            .unwrap_err();
        assert!(matches!(err, ProjectionError::InvalidValue { .. }));

        let props = projector
            .project_vertex("users", &"u1".into(), &obj(json!({"secret.x": 1})))
            .unwrap();
        assert!(!props.contains_key("secret.x"));
    }

    #[test]
    fn edge_projection_skips_consumed_fields() {
        let settings = settings();
        let projector = FieldProjector::new(&settings, IdentityMapper::new());
        let props = projector
            .project_edge(
                "follows",
                &"e1".into(),
                Some("FOLLOWS"),
                &obj(json!({"_id": "e1", "src": "u1", "dest": "u2", "since": 2020})),
                &["src", "dest"],
            )
            .unwrap();
        assert_eq!(props.get("uid"), Some(&"e1".into()));
        assert_eq!(props.get("edgeType"), Some(&"FOLLOWS".into()));
        assert_eq!(props.get("since"), Some(&PropertyValue::Int(2020)));
        assert_eq!(props.len(), 3);
    }

    #[test]
    fn edge_update_without_label_never_sets_edge_type() {
        let settings = settings();
        let projector = FieldProjector::new(&settings, IdentityMapper::new());
        let props = projector
            .project_edge(
                "follows",
                &"e1".into(),
                None,
                &obj(json!({"edgeType": "HACK", "weight": 2})),
                &[],
            )
            .unwrap();
        assert!(!props.contains_key("edgeType"));
        assert_eq!(props.get("weight"), Some(&PropertyValue::Int(2)));
    }
}

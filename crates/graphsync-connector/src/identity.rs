//! Identity mapping: source `_id` values to graph entity identities.
//!
//! The encoding is a lossless string rendering, so equal source ids give
//! equal identities and distinct source ids never collide:
//!
//! | source id | identity |
//! |---|---|
//! | `"e1"` | `e1` |
//! | `"#tag"` | `##tag` |
//! | `{"$oid": "65a1…"}` | `#oid:65a1…` |
//! | `42`, `{"$numberLong": "42"}` | `#int:42` |
//! | `{"$uuid": "…"}` | `#uuid:…` |
//! | `{"a": 1, "b": "x"}` | `#doc:[["a","#int:1"],["b","x"]]` |
//!
//! Plain strings render as themselves. Every other shape starts with `#`
//! followed by a letter, and strings that themselves start with `#` gain a
//! second `#`, so the two families cannot overlap.

use serde_json::{Map, Value};
use uuid::Uuid;

use graphsync_core::types::SOURCE_ID_FIELD;
use graphsync_core::{ChangeEvent, ChangeOp, EntityIdentity, SourceId};

use crate::error::IdentityError;

/// Pure mapping from source identifiers to entity identities.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityMapper;

impl IdentityMapper {
    pub fn new() -> Self {
        Self
    }

    pub fn map(&self, id: &SourceId) -> EntityIdentity {
        EntityIdentity(render(id))
    }

    /// Parse an Extended JSON identifier and map it.
    pub fn map_value(&self, value: &Value) -> Result<EntityIdentity, IdentityError> {
        Ok(self.map(&parse_source_id(value)?))
    }

    /// Map the `_id` field of a document.
    pub fn document_identity(
        &self,
        document: &Map<String, Value>,
    ) -> Result<EntityIdentity, IdentityError> {
        let id = document
            .get(SOURCE_ID_FIELD)
            .ok_or_else(|| IdentityError::Missing {
                field: SOURCE_ID_FIELD.to_string(),
            })?;
        self.map_value(id)
    }

    /// Best-effort identity of the entity an event is about, for reporting.
    /// Inserts use the document's `_id`; updates and deletes prefer the
    /// previous identifier.
    pub fn event_identity(&self, event: &ChangeEvent) -> Option<EntityIdentity> {
        let id = match event.op {
            ChangeOp::Insert => event.document.get(SOURCE_ID_FIELD),
            ChangeOp::Update | ChangeOp::Delete => event
                .previous_identity
                .as_ref()
                .or_else(|| event.document.get(SOURCE_ID_FIELD)),
        }?;
        self.map_value(id).ok()
    }
}

/// Interpret an Extended JSON value as a source identifier.
pub fn parse_source_id(value: &Value) -> Result<SourceId, IdentityError> {
    match value {
        Value::String(s) => Ok(SourceId::String(s.clone())),
        Value::Number(n) => n
            .as_i64()
            .map(SourceId::Int)
            .ok_or(IdentityError::Unsupported {
                shape: "non-integer number",
            }),
        Value::Object(map) => parse_object_id(map),
        Value::Null => Err(IdentityError::Unsupported { shape: "null" }),
        Value::Bool(_) => Err(IdentityError::Unsupported { shape: "boolean" }),
        Value::Array(_) => Err(IdentityError::Unsupported { shape: "array" }),
    }
}

fn parse_object_id(map: &Map<String, Value>) -> Result<SourceId, IdentityError> {
    if let Some((key, inner)) = single_entry(map).filter(|(k, _)| k.starts_with('$')) {
        let text = inner.as_str();
        return match (key.as_str(), text) {
            ("$oid", Some(hex)) if is_object_id(hex) => {
                Ok(SourceId::ObjectId(hex.to_ascii_lowercase()))
            }
            ("$oid", _) => Err(IdentityError::Unsupported {
                shape: "malformed ObjectId",
            }),
            ("$numberInt" | "$numberLong", Some(n)) => {
                n.parse().map(SourceId::Int).map_err(|_| IdentityError::Unsupported {
                    shape: "malformed integer",
                })
            }
            ("$uuid", Some(u)) => Uuid::parse_str(u)
                .map(SourceId::Uuid)
                .map_err(|_| IdentityError::Unsupported {
                    shape: "malformed UUID",
                }),
            _ => Err(IdentityError::Unsupported {
                shape: "extended JSON type",
            }),
        };
    }

    if map.is_empty() {
        return Err(IdentityError::Unsupported {
            shape: "empty document",
        });
    }

    map.iter()
        .map(|(k, v)| Ok((k.clone(), parse_source_id(v)?)))
        .collect::<Result<Vec<_>, IdentityError>>()
        .map(SourceId::Compound)
}

fn single_entry(map: &Map<String, Value>) -> Option<(&String, &Value)> {
    if map.len() == 1 {
        map.iter().next()
    } else {
        None
    }
}

fn is_object_id(hex: &str) -> bool {
    hex.len() == 24 && hex.chars().all(|c| c.is_ascii_hexdigit())
}

fn render(id: &SourceId) -> String {
    match id {
        SourceId::String(s) if s.starts_with('#') => format!("#{s}"),
        SourceId::String(s) => s.clone(),
        SourceId::ObjectId(hex) => format!("#oid:{hex}"),
        SourceId::Int(n) => format!("#int:{n}"),
        SourceId::Uuid(u) => format!("#uuid:{}", u.hyphenated()),
        SourceId::Compound(fields) => {
            let pairs = fields
                .iter()
                .map(|(k, v)| {
                    Value::Array(vec![Value::String(k.clone()), Value::String(render(v))])
                })
                .collect();
            format!("#doc:{}", Value::Array(pairs))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn map(v: Value) -> String {
        IdentityMapper::new().map_value(&v).unwrap().0
    }

    #[test]
    fn plain_strings_map_to_themselves() {
        assert_eq!(map(json!("e1")), "e1");
        assert_eq!(map(json!("u1")), "u1");
    }

    #[test]
    fn object_ids_are_normalized_and_tagged() {
        assert_eq!(
            map(json!({"$oid": "65A1F0C2E4B0A1B2C3D4E5F6"})),
            "#oid:65a1f0c2e4b0a1b2c3d4e5f6"
        );
    }

    #[test]
    fn integer_spellings_agree() {
        assert_eq!(map(json!(42)), "#int:42");
        assert_eq!(map(json!({"$numberLong": "42"})), "#int:42");
        assert_eq!(map(json!({"$numberInt": "42"})), "#int:42");
    }

    #[test]
    fn compound_ids_keep_field_order() {
        let ab = map(json!({"a": 1, "b": "x"}));
        assert_eq!(ab, r##"#doc:[["a","#int:1"],["b","x"]]"##);
    }

    #[test]
    fn identity_is_stable_across_calls() {
        let id = json!({"$oid": "65a1f0c2e4b0a1b2c3d4e5f6"});
        assert_eq!(map(id.clone()), map(id));
    }

    #[test]
    fn distinct_ids_never_collide() {
        let ids = [
            json!("5"),
            json!(5),
            json!("#int:5"),
            json!("#oid:65a1f0c2e4b0a1b2c3d4e5f6"),
            json!({"$oid": "65a1f0c2e4b0a1b2c3d4e5f6"}),
            json!("65a1f0c2e4b0a1b2c3d4e5f6"),
            json!({"$uuid": "123e4567-e89b-12d3-a456-426614174000"}),
            json!("#uuid:123e4567-e89b-12d3-a456-426614174000"),
            json!({"a": "5"}),
            json!({"a": 5}),
            json!("#doc:[[\"a\",\"5\"]]"),
            json!("#"),
            json!("##"),
            json!(""),
        ];

        let rendered: HashSet<String> = ids.iter().map(|v| map(v.clone())).collect();
        assert_eq!(rendered.len(), ids.len());
    }

    #[test]
    fn unsupported_shapes_are_rejected() {
        let mapper = IdentityMapper::new();
        let rejected = [
            json!(null),
            json!(true),
            json!(1.5),
            json!([1]),
            json!({}),
            json!({"$oid": "nothex"}),
            json!({"$date": 0}),
        ];
        for v in rejected {
            assert!(
                matches!(mapper.map_value(&v), Err(IdentityError::Unsupported { .. })),
                "{v} should be rejected"
            );
        }
    }

    #[test]
    fn missing_id_field_is_reported() {
        let doc = json!({"name": "ada"});
        let err = IdentityMapper::new()
            .document_identity(doc.as_object().unwrap())
            .unwrap_err();
        assert_eq!(
            err,
            IdentityError::Missing {
                field: "_id".to_string()
            }
        );
    }

    #[test]
    fn event_identity_resolves_what_it_can() {
        use graphsync_core::FeedPosition;

        let mapper = IdentityMapper::new();
        let at = FeedPosition::new(1, 0);
        let insert = ChangeEvent::insert(
            "app.follows",
            at,
            json!({"_id": "e1", "src": "u1"}).as_object().unwrap().clone(),
        );
        assert_eq!(mapper.event_identity(&insert), Some("e1".into()));

        let delete = ChangeEvent::delete("app.users", at, json!({"$numberLong": "7"}));
        assert_eq!(mapper.event_identity(&delete), Some("#int:7".into()));

        let anonymous = ChangeEvent::insert("app.users", at, Map::new());
        assert_eq!(mapper.event_identity(&anonymous), None);
    }
}

//! Change events and their decoding from MongoDB oplog entries.
//!
//! An oplog entry arrives as Extended JSON:
//!
//! ```json
//! {"ts":{"$timestamp":{"t":1700000000,"i":1}},"op":"u","ns":"app.users",
//!  "o2":{"_id":{"$oid":"65a1..."}},"o":{"$set":{"name":"ada"}}}
//! ```
//!
//! Update payloads come in three shapes depending on the server version:
//! `$set`/`$unset` modifiers, `$v: 2` diffs, or a full replacement document.
//! All of them decode to a flat "set these fields" map where unset fields
//! carry `null`. Replacements are flagged so the whole property set can be
//! swapped instead of merged. A nested `$v: 2` sub-diff decodes to its raw
//! document under the field it modifies.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::types::{FeedPosition, SOURCE_ID_FIELD};

/// The kind of row-level change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl ChangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// One record from the upstream change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub op: ChangeOp,
    /// Qualified `<database>.<collection>` name.
    pub namespace: String,
    pub timestamp: FeedPosition,
    /// Full document for inserts, changed fields for updates, the deleted
    /// document's key for deletes.
    pub document: Map<String, Value>,
    /// Source identifier of the affected document (updates and deletes).
    pub previous_identity: Option<Value>,
    /// The update carries the whole new document rather than changed fields.
    pub replacement: bool,
}

impl ChangeEvent {
    pub fn insert(namespace: &str, timestamp: FeedPosition, document: Map<String, Value>) -> Self {
        Self {
            op: ChangeOp::Insert,
            namespace: namespace.to_string(),
            timestamp,
            document,
            previous_identity: None,
            replacement: false,
        }
    }

    pub fn update(
        namespace: &str,
        timestamp: FeedPosition,
        previous_identity: Value,
        fields: Map<String, Value>,
    ) -> Self {
        Self {
            op: ChangeOp::Update,
            namespace: namespace.to_string(),
            timestamp,
            document: fields,
            previous_identity: Some(previous_identity),
            replacement: false,
        }
    }

    /// An update that replaces the whole document.
    pub fn replace(
        namespace: &str,
        timestamp: FeedPosition,
        previous_identity: Value,
        document: Map<String, Value>,
    ) -> Self {
        Self {
            replacement: true,
            ..Self::update(namespace, timestamp, previous_identity, document)
        }
    }

    pub fn delete(namespace: &str, timestamp: FeedPosition, previous_identity: Value) -> Self {
        let mut document = Map::new();
        document.insert(SOURCE_ID_FIELD.to_string(), previous_identity.clone());
        Self {
            op: ChangeOp::Delete,
            namespace: namespace.to_string(),
            timestamp,
            document,
            previous_identity: Some(previous_identity),
            replacement: false,
        }
    }

    /// Collection name if the namespace lies inside `database`.
    pub fn collection_in(&self, database: &str) -> Option<&str> {
        self.namespace
            .strip_prefix(database)
            .and_then(|rest| rest.strip_prefix('.'))
            .filter(|c| !c.is_empty())
    }

    /// Decode one oplog line. Returns `Ok(None)` for entries that carry no
    /// document change (no-ops and commands).
    pub fn from_oplog_json(line: &str) -> Result<Option<Self>, CoreError> {
        let entry: OplogEntry = serde_json::from_str(line)?;
        Self::from_oplog(entry)
    }

    /// Convert a raw oplog entry into a change event.
    pub fn from_oplog(entry: OplogEntry) -> Result<Option<Self>, CoreError> {
        let timestamp = parse_timestamp(&entry.ts)
            .ok_or_else(|| CoreError::Decode(format!("unreadable ts: {}", entry.ts)))?;

        let event = match entry.op.as_str() {
            "i" => Self::insert(&entry.ns, timestamp, entry.o),
            "u" => {
                let previous = entry
                    .o2
                    .as_ref()
                    .and_then(|o2| o2.get(SOURCE_ID_FIELD))
                    .cloned()
                    .ok_or_else(|| {
                        CoreError::Decode(format!("update on {} without o2._id", entry.ns))
                    })?;
                if entry.o.keys().any(|k| k.starts_with('$')) {
                    let fields = update_fields(entry.o)?;
                    Self::update(&entry.ns, timestamp, previous, fields)
                } else {
                    let mut document = entry.o;
                    document.remove(SOURCE_ID_FIELD);
                    Self::replace(&entry.ns, timestamp, previous, document)
                }
            }
            "d" => {
                let previous = entry.o.get(SOURCE_ID_FIELD).cloned().ok_or_else(|| {
                    CoreError::Decode(format!("delete on {} without o._id", entry.ns))
                })?;
                Self::delete(&entry.ns, timestamp, previous)
            }
            "n" | "c" => return Ok(None),
            other => return Err(CoreError::Decode(format!("unknown op {other:?}"))),
        };

        Ok(Some(event))
    }
}

/// Raw oplog entry as written by `mongod`.
#[derive(Debug, Deserialize)]
pub struct OplogEntry {
    pub ts: Value,
    pub op: String,
    pub ns: String,
    #[serde(default)]
    pub o: Map<String, Value>,
    #[serde(default)]
    pub o2: Option<Map<String, Value>>,
}

/// Accepts `{"$timestamp":{"t":..,"i":..}}` and the bare `{"t":..,"i":..}`.
fn parse_timestamp(ts: &Value) -> Option<FeedPosition> {
    let inner = ts.get("$timestamp").unwrap_or(ts);
    let seconds = u32::try_from(inner.get("t")?.as_u64()?).ok()?;
    let increment = u32::try_from(inner.get("i")?.as_u64()?).ok()?;
    Some(FeedPosition::new(seconds, increment))
}

/// Flatten a modifier or diff payload into the fields it sets. Unset fields
/// map to null.
fn update_fields(o: Map<String, Value>) -> Result<Map<String, Value>, CoreError> {
    let mut fields = Map::new();

    if let Some(diff) = o.get("diff").filter(|_| o.contains_key("$v")) {
        let diff = diff
            .as_object()
            .ok_or_else(|| CoreError::Decode("$v:2 diff is not a document".to_string()))?;
        for (section, body) in diff {
            match section.as_str() {
                "u" | "i" => fields.extend(section_object(section, body)?.clone()),
                "d" => {
                    for key in section_object(section, body)?.keys() {
                        fields.insert(key.clone(), Value::Null);
                    }
                }
                // `s<field>` holds a sub-diff of a nested document. It stays
                // raw so projection can reject or mask the field per event.
                nested => match nested.strip_prefix('s').filter(|f| !f.is_empty()) {
                    Some(field) => {
                        fields.insert(field.to_string(), body.clone());
                    }
                    None => {
                        return Err(CoreError::Decode(format!(
                            "diff section {nested:?} is not supported"
                        )))
                    }
                },
            }
        }
    } else {
        for (modifier, body) in &o {
            match modifier.as_str() {
                "$set" => fields.extend(section_object(modifier, body)?.clone()),
                "$unset" => {
                    for key in section_object(modifier, body)?.keys() {
                        fields.insert(key.clone(), Value::Null);
                    }
                }
                "$v" => {}
                other => {
                    return Err(CoreError::Decode(format!(
                        "update modifier {other:?} is not supported"
                    )))
                }
            }
        }
    }

    fields.remove(SOURCE_ID_FIELD);
    Ok(fields)
}

fn section_object<'a>(name: &str, body: &'a Value) -> Result<&'a Map<String, Value>, CoreError> {
    body.as_object()
        .ok_or_else(|| CoreError::Decode(format!("{name} is not a document")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_insert_with_canonical_timestamp() {
        let line = r#"{"ts":{"$timestamp":{"t":1700000000,"i":3}},"op":"i","ns":"app.users","o":{"_id":{"$oid":"65a1f0c2e4b0a1b2c3d4e5f6"},"name":"ada"}}"#;
        let event = ChangeEvent::from_oplog_json(line).unwrap().unwrap();

        assert_eq!(event.op, ChangeOp::Insert);
        assert_eq!(event.namespace, "app.users");
        assert_eq!(event.timestamp, FeedPosition::new(1700000000, 3));
        assert_eq!(event.document["name"], json!("ada"));
        assert!(event.previous_identity.is_none());
    }

    #[test]
    fn decodes_set_and_unset_update() {
        let line = r#"{"ts":{"t":10,"i":1},"op":"u","ns":"app.users","o2":{"_id":"u1"},"o":{"$v":1,"$set":{"b":3},"$unset":{"c":true}}}"#;
        let event = ChangeEvent::from_oplog_json(line).unwrap().unwrap();

        assert_eq!(event.op, ChangeOp::Update);
        assert_eq!(event.previous_identity, Some(json!("u1")));
        assert_eq!(event.document.get("b"), Some(&json!(3)));
        assert_eq!(event.document.get("c"), Some(&Value::Null));
        assert_eq!(event.document.len(), 2);
    }

    #[test]
    fn decodes_v2_diff_update() {
        let line = r#"{"ts":{"t":10,"i":2},"op":"u","ns":"app.users","o2":{"_id":"u1"},"o":{"$v":2,"diff":{"u":{"b":3},"i":{"d":4},"d":{"c":false}}}}"#;
        let event = ChangeEvent::from_oplog_json(line).unwrap().unwrap();

        assert_eq!(event.document.get("b"), Some(&json!(3)));
        assert_eq!(event.document.get("d"), Some(&json!(4)));
        assert_eq!(event.document.get("c"), Some(&Value::Null));
    }

    #[test]
    fn replacement_update_is_flagged_and_drops_id() {
        let line = r#"{"ts":{"t":10,"i":2},"op":"u","ns":"app.users","o2":{"_id":"u1"},"o":{"_id":"u1","name":"grace"}}"#;
        let event = ChangeEvent::from_oplog_json(line).unwrap().unwrap();

        assert_eq!(event.op, ChangeOp::Update);
        assert!(event.replacement);
        assert!(!event.document.contains_key("_id"));
        assert_eq!(event.document.get("name"), Some(&json!("grace")));
    }

    #[test]
    fn modifier_updates_are_not_replacements() {
        let line = r#"{"ts":{"t":10,"i":1},"op":"u","ns":"app.users","o2":{"_id":"u1"},"o":{"$set":{"b":3}}}"#;
        let event = ChangeEvent::from_oplog_json(line).unwrap().unwrap();
        assert!(!event.replacement);
    }

    #[test]
    fn nested_diff_section_keeps_the_raw_sub_diff() {
        let line = r#"{"ts":{"t":10,"i":3},"op":"u","ns":"app.users","o2":{"_id":"u1"},"o":{"$v":2,"diff":{"u":{"b":3},"saddr":{"u":{"zip":"x"}}}}}"#;
        let event = ChangeEvent::from_oplog_json(line).unwrap().unwrap();

        assert_eq!(event.document.get("b"), Some(&json!(3)));
        assert_eq!(event.document.get("addr"), Some(&json!({"u": {"zip": "x"}})));
        assert!(!event.replacement);
    }

    #[test]
    fn unknown_diff_section_is_a_decode_error() {
        let line = r#"{"ts":{"t":10,"i":4},"op":"u","ns":"app.users","o2":{"_id":"u1"},"o":{"$v":2,"diff":{"x":{}}}}"#;
        assert!(matches!(
            ChangeEvent::from_oplog_json(line),
            Err(CoreError::Decode(_))
        ));
    }

    #[test]
    fn decodes_delete_identity_from_o() {
        let line = r#"{"ts":{"t":11,"i":0},"op":"d","ns":"app.users","o":{"_id":"u1"}}"#;
        let event = ChangeEvent::from_oplog_json(line).unwrap().unwrap();

        assert_eq!(event.op, ChangeOp::Delete);
        assert_eq!(event.previous_identity, Some(json!("u1")));
    }

    #[test]
    fn noop_and_command_entries_are_skipped() {
        let noop = r#"{"ts":{"t":1,"i":1},"op":"n","ns":"","o":{"msg":"periodic noop"}}"#;
        let cmd = r#"{"ts":{"t":1,"i":2},"op":"c","ns":"app.$cmd","o":{"create":"users"}}"#;
        assert!(ChangeEvent::from_oplog_json(noop).unwrap().is_none());
        assert!(ChangeEvent::from_oplog_json(cmd).unwrap().is_none());
    }

    #[test]
    fn update_without_o2_is_a_decode_error() {
        let line = r#"{"ts":{"t":1,"i":1},"op":"u","ns":"app.users","o":{"$set":{"a":1}}}"#;
        assert!(matches!(
            ChangeEvent::from_oplog_json(line),
            Err(CoreError::Decode(_))
        ));
    }

    #[test]
    fn collection_in_strips_database_prefix() {
        let event = ChangeEvent::delete("app.users", FeedPosition::default(), json!("u1"));
        assert_eq!(event.collection_in("app"), Some("users"));
        assert_eq!(event.collection_in("other"), None);
        assert_eq!(event.collection_in("ap"), None);
    }
}

//! Change records and their decoding.
//!
//! One line of a `_changes?feed=continuous&include_docs=true` body looks like
//!
//! ```text
//! {"seq":12,"id":"doc-1","changes":[{"rev":"2-ab"}],"doc":{"_id":"doc-1","_rev":"2-ab","name":"x"}}
//! ```
//!
//! and the feed closes a batch with a summary line such as
//! `{"last_seq":12,"pending":0}`.

use crate::checkpoint::{json_kind, Checkpoint};
use crate::error::{RecordError, RecordResult};
use serde::Serialize;
use serde_json::{json, Map, Value};

const ID_FIELD: &str = "_id";
const REV_FIELD: &str = "_rev";
const DELETED_FIELD: &str = "_deleted";

/// What the downstream store should do with the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Insert or overwrite the document, keyed by its identifier.
    Update,
    /// Remove the document.
    Delete,
}

impl Action {
    /// Returns the lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

/// Extra output fields attached to every event when decoration is enabled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decoration {
    /// Value of the `type` field, if any.
    pub event_type: Option<String>,
    /// Values of the `tags` field.
    pub tags: Vec<String>,
    /// Additional top-level fields. Existing fields are never overwritten.
    pub fields: Map<String, Value>,
}

impl Decoration {
    /// Returns true if applying this decoration would change nothing.
    pub fn is_empty(&self) -> bool {
        self.event_type.is_none() && self.tags.is_empty() && self.fields.is_empty()
    }
}

/// Options controlling how records become events.
#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    /// Keep the `_rev` field in update bodies.
    pub keep_revision: bool,
    /// Decoration applied at construction, or `None` to emit bare events.
    pub decoration: Option<Decoration>,
}

/// A feed summary line (`last_seq`). Never forwarded and never checkpointed.
#[derive(Debug, Clone, PartialEq)]
pub struct EndOfBatchMarker {
    /// The `last_seq` value reported by the server.
    pub last_seq: Value,
    /// Number of changes the server still had queued, if reported.
    pub pending: Option<u64>,
}

/// The result of decoding one framed record.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedRecord {
    /// A batch summary to be skipped.
    EndOfBatch(EndOfBatchMarker),
    /// A document change to be delivered.
    Change(ChangeEvent),
}

/// A normalized document change.
///
/// Update bodies never contain `_id` (it is promoted to metadata) and only
/// contain `_rev` when revision keeping was requested. Deletes carry no body.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    id: String,
    action: Action,
    seq: Value,
    checkpoint: Checkpoint,
    body: Option<Map<String, Value>>,
    keep_revision: bool,
    decoration: Option<Decoration>,
}

impl ChangeEvent {
    /// Creates an update (upsert) event. `_id` is removed from the body, and
    /// `_rev` too unless `keep_revision` is set.
    pub fn update(
        id: impl Into<String>,
        seq: Value,
        mut body: Map<String, Value>,
        keep_revision: bool,
    ) -> RecordResult<Self> {
        let checkpoint = Checkpoint::from_seq(&seq)?;
        body.remove(ID_FIELD);
        if !keep_revision {
            body.remove(REV_FIELD);
        }
        Ok(Self {
            id: id.into(),
            action: Action::Update,
            seq,
            checkpoint,
            body: Some(body),
            keep_revision,
            decoration: None,
        })
    }

    /// Creates a delete event.
    pub fn delete(id: impl Into<String>, seq: Value) -> RecordResult<Self> {
        let checkpoint = Checkpoint::from_seq(&seq)?;
        Ok(Self {
            id: id.into(),
            action: Action::Delete,
            seq,
            checkpoint,
            body: None,
            keep_revision: false,
            decoration: None,
        })
    }

    /// Attaches a decoration. Empty decorations are dropped.
    pub fn with_decoration(mut self, decoration: Option<Decoration>) -> Self {
        self.decoration = decoration.filter(|d| !d.is_empty());
        self
    }

    /// Document identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Update or delete.
    pub fn action(&self) -> Action {
        self.action
    }

    /// Sequence token exactly as received.
    pub fn seq(&self) -> &Value {
        &self.seq
    }

    /// Checkpoint to persist once this event has been delivered.
    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// Document body; `None` for deletes.
    pub fn body(&self) -> Option<&Map<String, Value>> {
        self.body.as_ref()
    }

    /// Whether the body may carry `_rev`.
    pub fn keep_revision(&self) -> bool {
        self.keep_revision
    }

    /// Whether the event should be applied as an upsert.
    pub fn doc_as_upsert(&self) -> bool {
        self.action == Action::Update
    }

    /// Decoration attached at construction, if any.
    pub fn decoration(&self) -> Option<&Decoration> {
        self.decoration.as_ref()
    }

    /// Renders the event as a single JSON object.
    ///
    /// ```text
    /// {"@metadata":{"_id":"a","action":"update","seq":3},"doc":{...},"doc_as_upsert":true}
    /// ```
    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        out.insert(
            "@metadata".into(),
            json!({
                "_id": self.id,
                "action": self.action,
                "seq": self.seq,
            }),
        );
        if let Some(body) = &self.body {
            out.insert("doc".into(), Value::Object(body.clone()));
            out.insert("doc_as_upsert".into(), Value::Bool(true));
        }
        if let Some(decoration) = &self.decoration {
            if let Some(event_type) = &decoration.event_type {
                out.entry("type")
                    .or_insert_with(|| Value::String(event_type.clone()));
            }
            if !decoration.tags.is_empty() {
                out.insert("tags".into(), json!(decoration.tags));
            }
            for (key, value) in &decoration.fields {
                out.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        Value::Object(out)
    }
}

/// Decodes one framed record.
///
/// # Errors
///
/// Returns a [`RecordError`] if the record is not JSON, not an object, or
/// lacks `seq`, `doc` or `doc._id`.
pub fn parse_record(record: &[u8], options: &ParseOptions) -> RecordResult<ParsedRecord> {
    let value: Value =
        serde_json::from_slice(record).map_err(|e| RecordError::InvalidJson(e.to_string()))?;
    let Value::Object(mut object) = value else {
        return Err(RecordError::NotAnObject);
    };

    if let Some(last_seq) = object.remove("last_seq") {
        return Ok(ParsedRecord::EndOfBatch(EndOfBatchMarker {
            last_seq,
            pending: object.get("pending").and_then(Value::as_u64),
        }));
    }

    let seq = object
        .remove("seq")
        .ok_or(RecordError::MissingField { field: "seq" })?;

    let mut doc = match object.remove("doc") {
        Some(Value::Object(doc)) => doc,
        Some(other) => {
            return Err(RecordError::InvalidField {
                field: "doc",
                reason: format!("expected object, got {}", json_kind(&other)),
            })
        }
        None => return Err(RecordError::MissingField { field: "doc" }),
    };

    let id = match doc.remove(ID_FIELD) {
        Some(Value::String(id)) => id,
        Some(other) => {
            return Err(RecordError::InvalidField {
                field: "doc._id",
                reason: format!("expected string, got {}", json_kind(&other)),
            })
        }
        None => return Err(RecordError::MissingField { field: "doc._id" }),
    };

    let deleted = doc.get(DELETED_FIELD) == Some(&Value::Bool(true))
        || object.get("deleted") == Some(&Value::Bool(true));

    let event = if deleted {
        ChangeEvent::delete(id, seq)?
    } else {
        ChangeEvent::update(id, seq, doc, options.keep_revision)?
    };

    Ok(ParsedRecord::Change(
        event.with_decoration(options.decoration.clone()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn change(line: &str, options: &ParseOptions) -> ChangeEvent {
        match parse_record(line.as_bytes(), options).unwrap() {
            ParsedRecord::Change(event) => event,
            other => panic!("expected change, got {other:?}"),
        }
    }

    #[test]
    fn update_promotes_id_and_strips_revision() {
        let line = r#"{"seq":3,"id":"a","changes":[{"rev":"1-x"}],"doc":{"_id":"a","_rev":"1-x","name":"Peter Parker"}}"#;
        let event = change(line, &ParseOptions::default());

        assert_eq!(event.id(), "a");
        assert_eq!(event.action(), Action::Update);
        assert_eq!(event.seq(), &json!(3));
        assert_eq!(event.checkpoint(), &Checkpoint::from(3));
        assert!(event.doc_as_upsert());

        let body = event.body().unwrap();
        assert!(!body.contains_key("_id"));
        assert!(!body.contains_key("_rev"));
        assert_eq!(body.get("name"), Some(&json!("Peter Parker")));
    }

    #[test]
    fn keep_revision_preserves_rev() {
        let line = r#"{"seq":"4-g1AA","id":"a","doc":{"_id":"a","_rev":"2-y"}}"#;
        let options = ParseOptions {
            keep_revision: true,
            ..ParseOptions::default()
        };
        let event = change(line, &options);
        assert!(event.keep_revision());
        assert_eq!(event.body().unwrap().get("_rev"), Some(&json!("2-y")));
        assert_eq!(event.seq(), &json!("4-g1AA"));
        assert_eq!(event.checkpoint().as_str(), "4-g1AA");
    }

    #[test]
    fn action_serializes_as_wire_name() {
        for action in [Action::Update, Action::Delete] {
            assert_eq!(serde_json::to_value(action).unwrap(), json!(action.as_str()));
        }
    }

    #[test]
    fn deleted_doc_becomes_delete_without_body() {
        let line = r#"{"seq":9,"id":"b","deleted":true,"doc":{"_id":"b","_rev":"3-z","_deleted":true}}"#;
        let event = change(line, &ParseOptions::default());
        assert_eq!(event.action(), Action::Delete);
        assert!(event.body().is_none());
        assert!(!event.doc_as_upsert());

        let json = event.to_json();
        assert_eq!(json["@metadata"]["action"], "delete");
        assert!(json.get("doc").is_none());
        assert!(json.get("doc_as_upsert").is_none());
    }

    #[test]
    fn top_level_deleted_flag_is_honored() {
        let line = r#"{"seq":10,"id":"c","deleted":true,"doc":{"_id":"c"}}"#;
        assert_eq!(change(line, &ParseOptions::default()).action(), Action::Delete);
    }

    #[test]
    fn last_seq_is_end_of_batch() {
        let parsed = parse_record(br#"{"last_seq":42,"pending":0}"#, &ParseOptions::default()).unwrap();
        assert_eq!(
            parsed,
            ParsedRecord::EndOfBatch(EndOfBatchMarker {
                last_seq: json!(42),
                pending: Some(0),
            })
        );
    }

    #[test]
    fn malformed_records_are_classified() {
        let options = ParseOptions::default();
        assert!(matches!(
            parse_record(b"not json", &options),
            Err(RecordError::InvalidJson(_))
        ));
        assert!(matches!(
            parse_record(b"[1,2]", &options),
            Err(RecordError::NotAnObject)
        ));
        assert_eq!(
            parse_record(br#"{"id":"a","doc":{"_id":"a"}}"#, &options),
            Err(RecordError::MissingField { field: "seq" })
        );
        assert_eq!(
            parse_record(br#"{"seq":1,"id":"a"}"#, &options),
            Err(RecordError::MissingField { field: "doc" })
        );
        assert_eq!(
            parse_record(br#"{"seq":1,"doc":{"name":"x"}}"#, &options),
            Err(RecordError::MissingField { field: "doc._id" })
        );
        assert!(matches!(
            parse_record(br#"{"seq":1,"doc":"a"}"#, &options),
            Err(RecordError::InvalidField { field: "doc", .. })
        ));
        assert!(matches!(
            parse_record(br#"{"seq":1,"doc":{"_id":7}}"#, &options),
            Err(RecordError::InvalidField { field: "doc._id", .. })
        ));
        assert!(matches!(
            parse_record(br#"{"seq":true,"doc":{"_id":"a"}}"#, &options),
            Err(RecordError::InvalidField { field: "seq", .. })
        ));
    }

    #[test]
    fn to_json_shape_for_update() {
        let line = r#"{"seq":1,"doc":{"_id":"1","name":"Stan Lee"}}"#;
        let event = change(line, &ParseOptions::default());
        assert_eq!(
            event.to_json(),
            json!({
                "@metadata": {"_id": "1", "action": "update", "seq": 1},
                "doc": {"name": "Stan Lee"},
                "doc_as_upsert": true
            })
        );
    }

    #[test]
    fn decoration_is_applied_without_overwriting() {
        let mut fields = Map::new();
        fields.insert("source".into(), json!("couchdb"));
        fields.insert("doc".into(), json!("must not win"));
        let options = ParseOptions {
            keep_revision: false,
            decoration: Some(Decoration {
                event_type: Some("couchdb_changes".into()),
                tags: vec!["replicated".into()],
                fields,
            }),
        };
        let event = change(r#"{"seq":2,"doc":{"_id":"2","n":1}}"#, &options);
        let json = event.to_json();
        assert_eq!(json["type"], "couchdb_changes");
        assert_eq!(json["tags"], json!(["replicated"]));
        assert_eq!(json["source"], "couchdb");
        assert_eq!(json["doc"], json!({"n": 1}));
    }

    #[test]
    fn empty_decoration_is_dropped() {
        let options = ParseOptions {
            keep_revision: false,
            decoration: Some(Decoration::default()),
        };
        let event = change(r#"{"seq":2,"doc":{"_id":"2"}}"#, &options);
        assert!(event.decoration().is_none());
    }

    proptest! {
        #[test]
        fn update_body_invariants(
            keys in prop::collection::btree_set("[a-z_]{1,8}", 0..6),
            keep_revision in any::<bool>(),
            seq in 0u64..1_000_000,
        ) {
            let mut doc = Map::new();
            for key in keys {
                doc.insert(key, json!(1));
            }
            doc.insert("_id".into(), json!("doc"));
            doc.insert("_rev".into(), json!("1-abc"));
            doc.remove("_deleted");
            let line = json!({"seq": seq, "id": "doc", "doc": doc}).to_string();
            let options = ParseOptions { keep_revision, decoration: None };

            let ParsedRecord::Change(event) = parse_record(line.as_bytes(), &options).unwrap() else {
                panic!("expected change");
            };
            let body = event.body().unwrap();
            prop_assert!(!body.contains_key("_id"));
            prop_assert_eq!(body.contains_key("_rev"), keep_revision);
            prop_assert_eq!(event.checkpoint(), &Checkpoint::from(seq));
        }
    }
}

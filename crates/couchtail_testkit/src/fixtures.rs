//! Change-line fixtures and checkpoint helpers.
//!
//! Lines are built the way CouchDB writes them in a continuous feed: one
//! JSON object per line, terminated by `\n`.

use couchtail_protocol::Checkpoint;
use serde_json::{json, Map, Value};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// An update line for `id` at numeric sequence `seq`.
///
/// `body` must be a JSON object; `_id` and a `_rev` are added to it.
pub fn update_line(seq: u64, id: &str, body: Value) -> String {
    let mut doc = match body {
        Value::Object(map) => map,
        other => panic!("document body must be an object, got {other}"),
    };
    doc.insert("_id".into(), json!(id));
    doc.insert("_rev".into(), json!(format!("1-{seq:032x}")));
    line(json!({
        "seq": seq,
        "id": id,
        "changes": [{ "rev": format!("1-{seq:032x}") }],
        "doc": Value::Object(doc),
    }))
}

/// A deletion line for `id` at numeric sequence `seq`.
pub fn delete_line(seq: u64, id: &str) -> String {
    line(json!({
        "seq": seq,
        "id": id,
        "changes": [{ "rev": format!("2-{seq:032x}") }],
        "deleted": true,
        "doc": { "_id": id, "_rev": format!("2-{seq:032x}"), "_deleted": true },
    }))
}

/// An update line with an opaque string sequence, as CouchDB 2.x and later send.
pub fn opaque_update_line(seq: &str, id: &str) -> String {
    line(json!({
        "seq": seq,
        "id": id,
        "changes": [{ "rev": "1-a" }],
        "doc": { "_id": id, "_rev": "1-a" },
    }))
}

/// An end-of-batch line.
pub fn last_seq_line(seq: u64) -> String {
    line(json!({ "last_seq": seq, "pending": 0 }))
}

/// A heartbeat: the empty line the server sends while idle.
pub fn heartbeat_line() -> String {
    "\n".to_string()
}

/// Lines for sequences in `seqs`, one document `doc-<seq>` each. Sequences
/// listed in `deletes` become deletions.
pub fn numbered_feed(seqs: RangeInclusive<u64>, deletes: &[u64]) -> Vec<String> {
    seqs.map(|seq| {
        let id = format!("doc-{seq}");
        if deletes.contains(&seq) {
            delete_line(seq, &id)
        } else {
            update_line(seq, &id, json!({ "n": seq }))
        }
    })
    .collect()
}

/// Concatenates lines into a response body.
pub fn feed_body(lines: &[String]) -> String {
    lines.concat()
}

fn line(value: Value) -> String {
    let mut text = value.to_string();
    text.push('\n');
    text
}

/// A document body with a few fields of each JSON kind.
pub fn sample_body() -> Map<String, Value> {
    json!({
        "name": "Peter Parker",
        "age": 28,
        "active": true,
        "address": { "city": "New York" },
        "tags": ["hero", "photographer"],
    })
    .as_object()
    .cloned()
    .unwrap_or_default()
}

/// A checkpoint location in a temporary directory that is removed on drop.
pub struct TempCheckpoint {
    dir: TempDir,
    path: PathBuf,
}

impl TempCheckpoint {
    /// Creates a fresh location with no checkpoint file.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let path = dir.path().join("couchdb_seq");
        Self { dir, path }
    }

    /// Returns the checkpoint file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the temporary directory.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Writes `checkpoint` directly, like an operator editing the file.
    pub fn write(&self, checkpoint: &Checkpoint) {
        std::fs::write(&self.path, checkpoint.as_str()).expect("Failed to write checkpoint");
    }

    /// Reads the raw file content, or `None` if the file does not exist.
    pub fn read_raw(&self) -> Option<String> {
        std::fs::read_to_string(&self.path).ok()
    }
}

impl Default for TempCheckpoint {
    fn default() -> Self {
        Self::new()
    }
}

//! Resume checkpoints.

use crate::error::{RecordError, RecordResult};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// The last sequence token that was fully processed.
///
/// CouchDB 1.x emits numeric sequences, 2.x and later emit strings of the
/// form `"<n>-<opaque>"`. The token is kept in its textual form exactly as
/// the server sent it, so it can be handed back in `since=` unmodified.
///
/// Ordering compares the leading decimal prefix numerically, then falls
/// back to the full text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Checkpoint(String);

impl Checkpoint {
    /// Textual form of the origin checkpoint.
    pub const ORIGIN: &'static str = "0";

    /// The checkpoint that requests the feed from the beginning.
    pub fn origin() -> Self {
        Self(Self::ORIGIN.to_string())
    }

    /// Returns true if this is the origin checkpoint.
    pub fn is_origin(&self) -> bool {
        self.0 == Self::ORIGIN
    }

    /// Parses the persisted textual form.
    ///
    /// Surrounding whitespace is ignored. Returns `None` for empty text or
    /// text that is not a single printable token.
    pub fn parse(text: &str) -> Option<Self> {
        let token = text.trim();
        if token.is_empty() || token.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return None;
        }
        Some(Self(token.to_string()))
    }

    /// Builds a checkpoint from the `seq` value of a change record.
    pub fn from_seq(seq: &Value) -> RecordResult<Self> {
        match seq {
            Value::Number(n) => n.as_u64().map(Self::from).ok_or_else(|| RecordError::InvalidField {
                field: "seq",
                reason: format!("numeric sequence must be a non-negative integer, got {n}"),
            }),
            Value::String(s) => Self::parse(s).ok_or_else(|| RecordError::InvalidField {
                field: "seq",
                reason: "sequence string must be a single non-empty token".into(),
            }),
            other => Err(RecordError::InvalidField {
                field: "seq",
                reason: format!("expected number or string, got {}", json_kind(other)),
            }),
        }
    }

    /// Returns the textual form sent as the `since` parameter.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading decimal digits, up to the first `-` of a 2.x sequence.
    fn numeric_prefix(&self) -> Option<u64> {
        let digits = self.0.split('-').next().unwrap_or_default();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::origin()
    }
}

impl From<u64> for Checkpoint {
    fn from(seq: u64) -> Self {
        Self(seq.to_string())
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Ord for Checkpoint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.numeric_prefix()
            .cmp(&other.numeric_prefix())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for Checkpoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

//! Error types for record decoding.

use thiserror::Error;

/// Result type for record decoding.
pub type RecordResult<T> = Result<T, RecordError>;

/// A single changes-feed record could not be turned into an event.
///
/// Every variant is recoverable: the caller skips the record and keeps
/// reading the stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// The record is not valid JSON (or not valid UTF-8).
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// The record decoded, but is not a JSON object.
    #[error("record is not a JSON object")]
    NotAnObject,

    /// A required field is absent.
    #[error("missing field `{field}`")]
    MissingField {
        /// Dotted path of the field.
        field: &'static str,
    },

    /// A field is present but has the wrong shape.
    #[error("invalid field `{field}`: {reason}")]
    InvalidField {
        /// Dotted path of the field.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// The record exceeded the configured size limit and was dropped.
    #[error("record of {len} bytes exceeds the limit of {limit} bytes")]
    Oversized {
        /// Bytes discarded.
        len: usize,
        /// Configured limit.
        limit: usize,
    },
}

impl RecordError {
    /// Returns true if the text could not be decoded at all, as opposed to
    /// decoding into a value that lacks the expected fields.
    pub fn is_undecodable(&self) -> bool {
        matches!(self, RecordError::InvalidJson(_) | RecordError::Oversized { .. })
    }
}

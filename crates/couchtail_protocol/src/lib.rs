//! # couchtail protocol
//!
//! Wire-level types for consuming a CouchDB continuous changes feed.
//!
//! This crate provides:
//! - `LineFramer` for splitting an unframed byte stream into records
//! - `Checkpoint` for the opaque, comparable resume token
//! - `parse_record` for decoding one record into a `ParsedRecord`
//! - `ChangeEvent` with upsert/delete semantics and its JSON output form
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checkpoint;
mod error;
mod framer;
mod record;

pub use checkpoint::Checkpoint;
pub use error::{RecordError, RecordResult};
pub use framer::{Frame, LineFramer};
pub use record::{
    parse_record, Action, ChangeEvent, Decoration, EndOfBatchMarker, ParseOptions, ParsedRecord,
};

//! # couchtail engine
//!
//! Resumable tailing of a CouchDB continuous `_changes` feed.
//!
//! This crate provides:
//! - Session state machine (idle → connecting → streaming → closed)
//! - Reconnect loop with fixed or exponential delay
//! - Durable checkpoint storage
//! - HTTP transport and a scripted mock transport
//! - Event sinks for handing changes downstream
//!
//! ## Architecture
//!
//! A [`Tailer`] runs one session at a time:
//! 1. Read the resume checkpoint
//! 2. Open `GET /{db}/_changes?feed=continuous&include_docs=true&since=...`
//! 3. Frame the body into lines and decode each into a change
//! 4. Deliver the change to the [`EventSink`]
//! 5. Persist its sequence to the [`CheckpointStore`]
//!
//! ## Key Invariants
//!
//! - A checkpoint is persisted only after the sink accepted its event
//! - Checkpoints advance in delivery order
//! - End-of-batch lines are never delivered or checkpointed
//! - A malformed line is skipped without ending the session

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checkpoint_store;
mod config;
mod error;
mod http;
mod session;
mod sink;
mod state;
mod tailer;
mod transport;

pub use checkpoint_store::{
    read_checkpoint_file, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore,
};
pub use config::{
    Credentials, ReconnectPolicy, TailerConfig, DEFAULT_CHECKPOINT_FILE, DEFAULT_PORT,
    LIVENESS_MARGIN,
};
pub use error::{EngineError, EngineResult};
pub use http::HttpTransport;
pub use session::SessionOutcome;
pub use sink::{ChannelSink, EventSink, MemorySink};
pub use state::{SessionState, TailerStats};
pub use tailer::{Tailer, TailerExit};
pub use transport::{
    ChangesRequest, ChangesTransport, ChunkStream, Liveness, MockConnection, MockFailure,
    MockStep, MockTransport,
};

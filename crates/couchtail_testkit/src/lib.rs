//! # couchtail testkit
//!
//! Test utilities for couchtail.
//!
//! This crate provides:
//! - Change-line fixtures and checkpoint helpers
//! - Property-based test generators using proptest
//! - A scripted `_changes` HTTP server for end-to-end tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use couchtail_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn tails_a_feed() {
//!     let server = FeedServer::start(vec![
//!         ScriptedResponse::ok().chunk(feed_body(&numbered_feed(1..=3, &[]))),
//!     ])
//!     .await
//!     .unwrap();
//!     // point a tailer at server.host() / server.port()
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod feed_server;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::feed_server::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use feed_server::*;
pub use fixtures::*;
pub use generators::*;

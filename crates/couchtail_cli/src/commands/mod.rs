//! CLI command implementations.

pub mod checkpoint;
pub mod tail;

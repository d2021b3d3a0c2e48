//! Tailer state and statistics.

use couchtail_protocol::{Action, Checkpoint};
use parking_lot::RwLock;
use std::time::Instant;

/// The current state of the tailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not started yet.
    Idle,
    /// Opening the feed connection.
    Connecting,
    /// Reading the feed body.
    Streaming,
    /// The last session ended and the next one has not started.
    Closed,
    /// Waiting before reconnecting.
    RetryWait,
    /// The tailer has returned from `run` and will not restart.
    Stopped,
}

impl SessionState {
    /// Returns true while a session holds an open or opening connection.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Streaming)
    }

    /// Returns true once the tailer can no longer make progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped)
    }
}

/// Statistics about the tailer's sessions.
#[derive(Debug, Clone, Default)]
pub struct TailerStats {
    /// Sessions started.
    pub sessions: u64,
    /// Update events delivered.
    pub updates: u64,
    /// Delete events delivered.
    pub deletes: u64,
    /// End-of-batch lines skipped.
    pub end_of_batch_skipped: u64,
    /// Malformed or oversized records skipped.
    pub malformed_skipped: u64,
    /// Reconnects after a failed or ended session.
    pub reconnects: u64,
    /// Last checkpoint persisted by this tailer.
    pub last_checkpoint: Option<Checkpoint>,
    /// Time of the last delivered event.
    pub last_delivery_time: Option<Instant>,
    /// Last session error message.
    pub last_error: Option<String>,
}

impl TailerStats {
    /// Total events delivered.
    pub fn delivered(&self) -> u64 {
        self.updates + self.deletes
    }
}

/// State and statistics shared between the tailer and its running session.
#[derive(Debug)]
pub(crate) struct Status {
    state: RwLock<SessionState>,
    stats: RwLock<TailerStats>,
}

impl Status {
    pub(crate) fn new() -> Self {
        Self {
            state: RwLock::new(SessionState::Idle),
            stats: RwLock::new(TailerStats::default()),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        *self.state.write() = state;
    }

    pub(crate) fn stats(&self) -> TailerStats {
        self.stats.read().clone()
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut TailerStats)) {
        f(&mut self.stats.write());
    }

    pub(crate) fn record_delivery(&self, action: Action, checkpoint: Checkpoint) {
        let mut stats = self.stats.write();
        match action {
            Action::Update => stats.updates += 1,
            Action::Delete => stats.deletes += 1,
        }
        stats.last_checkpoint = Some(checkpoint);
        stats.last_delivery_time = Some(Instant::now());
    }
}

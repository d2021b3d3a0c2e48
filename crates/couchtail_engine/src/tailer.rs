//! The reconnecting tailer.

use crate::checkpoint_store::{CheckpointStore, FileCheckpointStore};
use crate::config::TailerConfig;
use crate::error::{EngineError, EngineResult};
use crate::http::HttpTransport;
use crate::session::{SessionOutcome, StreamSession};
use crate::sink::EventSink;
use crate::state::{SessionState, Status, TailerStats};
use crate::transport::ChangesTransport;
use couchtail_protocol::Checkpoint;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

/// Why [`Tailer::run`] returned without an error.
#[derive(Debug)]
pub enum TailerExit {
    /// The server ended the feed and reconnecting is disabled.
    StreamEnded,
    /// A session failed with a transient error and reconnecting is disabled.
    ReconnectDisabled {
        /// The error that ended the last session.
        error: EngineError,
    },
}

/// Follows a changes feed across connection failures.
///
/// Runs one feed session at a time. Transient failures are retried after
/// the policy delay when `always_reconnect` is set, fatal ones are returned
/// immediately. Each new session resumes from the
/// persisted checkpoint, so external edits of the store are honored.
pub struct Tailer<T, S, C> {
    config: TailerConfig,
    transport: T,
    sink: S,
    store: C,
    status: Status,
    cancel: CancellationToken,
}

impl<T, S, C> Tailer<T, S, C>
where
    T: ChangesTransport,
    S: EventSink,
    C: CheckpointStore,
{
    /// Creates a tailer from its collaborators.
    pub fn new(config: TailerConfig, transport: T, sink: S, store: C) -> Self {
        Self {
            config,
            transport,
            sink,
            store,
            status: Status::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &TailerConfig {
        &self.config
    }

    /// Returns the sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Returns the checkpoint store.
    pub fn store(&self) -> &C {
        &self.store
    }

    /// Gets the current state.
    pub fn state(&self) -> SessionState {
        self.status.state()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> TailerStats {
        self.status.stats()
    }

    /// Returns a token that stops the tailer when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Requests a stop. A running session stops at its next read; a pending
    /// reconnect delay is cut short.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Checkpoint the next session starts from.
    ///
    /// The configured initial checkpoint wins until this tailer has persisted
    /// one of its own; after that the store is read again every time.
    pub fn resume_point(&self) -> EngineResult<Checkpoint> {
        match &self.config.initial_checkpoint {
            Some(initial) if self.status.stats().last_checkpoint.is_none() => Ok(initial.clone()),
            _ => self.store.read(),
        }
    }

    /// Runs a single session from the resume point until the feed ends or
    /// fails.
    pub async fn run_session(&self) -> EngineResult<SessionOutcome> {
        self.run_one().await.0
    }

    async fn run_one(&self) -> (EngineResult<SessionOutcome>, u64) {
        let since = match self.resume_point() {
            Ok(since) => since,
            Err(e) => return (Err(e), 0),
        };
        self.status.update(|stats| stats.sessions += 1);

        let mut session = StreamSession::new(
            &self.config,
            &self.transport,
            &self.sink,
            &self.store,
            &self.cancel,
            &self.status,
        );
        let span = info_span!("session", since = %since);
        let result = session.run(since).instrument(span).await;
        self.status.set_state(SessionState::Closed);

        if let Err(e) = &result {
            self.status.update(|stats| stats.last_error = Some(e.to_string()));
        }
        (result, session.delivered())
    }

    /// Runs sessions until the feed is finished, a fatal error occurs, or
    /// the tailer is cancelled.
    ///
    /// # Errors
    ///
    /// Returns fatal errors unchanged, including `Cancelled`.
    pub async fn run(&self) -> EngineResult<TailerExit> {
        let span = info_span!("tailer", database = %self.config.database);
        let result = self.run_loop().instrument(span).await;
        self.status.set_state(SessionState::Stopped);
        result
    }

    async fn run_loop(&self) -> EngineResult<TailerExit> {
        self.config.validate()?;
        let policy = &self.config.reconnect;
        let mut failures: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let (result, delivered) = self.run_one().await;
            if delivered > 0 {
                failures = 0;
            }

            match result {
                Ok(outcome) => {
                    if !policy.always_reconnect {
                        info!("feed ended");
                        return Ok(TailerExit::StreamEnded);
                    }
                    if outcome.is_empty() {
                        failures = failures.saturating_add(1);
                        let delay = policy.delay_for_attempt(failures);
                        warn!(
                            attempt = failures,
                            delay_ms = millis(delay),
                            "feed ended without data, reconnecting"
                        );
                        self.wait_before_reconnect(delay).await?;
                    } else {
                        info!("feed ended, reconnecting");
                    }
                }
                Err(e) if !e.is_retryable() => {
                    if !matches!(e, EngineError::Cancelled) {
                        error!(error = %e, "tailer stopped on fatal error");
                    }
                    return Err(e);
                }
                Err(e) => {
                    if !policy.always_reconnect {
                        warn!(error = %e, "session failed and reconnect is disabled");
                        return Ok(TailerExit::ReconnectDisabled { error: e });
                    }

                    failures = failures.saturating_add(1);
                    let delay = policy.delay_for_attempt(failures);
                    warn!(
                        error = %e,
                        attempt = failures,
                        delay_ms = millis(delay),
                        "session failed, reconnecting"
                    );
                    self.wait_before_reconnect(delay).await?;
                }
            }

            self.status.update(|stats| stats.reconnects += 1);
        }
    }

    async fn wait_before_reconnect(&self, delay: Duration) -> EngineResult<()> {
        if delay.is_zero() {
            return Ok(());
        }
        self.status.set_state(SessionState::RetryWait);
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(EngineError::Cancelled),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

fn millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

impl<S: EventSink> Tailer<HttpTransport, S, FileCheckpointStore> {
    /// Builds a tailer that reads over HTTP and keeps its checkpoint in a
    /// file. Without a configured checkpoint path the file lives in `$HOME`.
    ///
    /// # Errors
    ///
    /// Returns `Config` for invalid settings and `CheckpointStoreUnavailable`
    /// if no usable checkpoint location exists.
    pub fn from_config(config: TailerConfig, sink: S) -> EngineResult<Self> {
        config.validate()?;
        let home = std::env::var_os("HOME").map(PathBuf::from);
        let path = config.resolve_checkpoint_path(home.as_deref())?;
        let store = FileCheckpointStore::open(path)?;
        let transport = HttpTransport::from_config(&config)?;
        Ok(Self::new(config, transport, sink, store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint_store::MemoryCheckpointStore;
    use crate::config::ReconnectPolicy;
    use crate::sink::MemorySink;
    use crate::transport::{MockFailure, MockStep, MockTransport};
    use std::sync::Arc;

    type MockTailer = Tailer<Arc<MockTransport>, Arc<MemorySink>, Arc<MemoryCheckpointStore>>;

    fn tailer(config: TailerConfig) -> (MockTailer, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        let tailer = Tailer::new(
            config,
            Arc::clone(&transport),
            Arc::new(MemorySink::new()),
            Arc::new(MemoryCheckpointStore::new()),
        );
        (tailer, transport)
    }

    fn line(seq: u64) -> MockStep {
        MockStep::chunk(format!(
            "{{\"seq\":{seq},\"doc\":{{\"_id\":\"d{seq}\"}}}}\n"
        ))
    }

    #[tokio::test]
    async fn initial_checkpoint_then_store() {
        let config = TailerConfig::new("db")
            .with_initial_checkpoint(Checkpoint::from(40))
            .with_reconnect(ReconnectPolicy::new(Duration::ZERO));
        let (tailer, transport) = tailer(config);
        tailer.store().set(Checkpoint::from(3));

        assert_eq!(tailer.resume_point().unwrap(), Checkpoint::from(40));
        transport.push_stream(vec![line(41)]);
        tailer.run_session().await.unwrap();
        assert_eq!(tailer.resume_point().unwrap(), Checkpoint::from(41));

        tailer.store().set(Checkpoint::from(100));
        assert_eq!(tailer.resume_point().unwrap(), Checkpoint::from(100));
    }

    #[tokio::test]
    async fn stream_end_without_reconnect() {
        let config = TailerConfig::new("db").with_reconnect(ReconnectPolicy::never());
        let (tailer, transport) = tailer(config);
        transport.push_stream(vec![line(1), line(2)]);

        let exit = tailer.run().await.unwrap();
        assert!(matches!(exit, TailerExit::StreamEnded));
        assert_eq!(tailer.state(), SessionState::Stopped);
        assert_eq!(tailer.stats().delivered(), 2);
        assert_eq!(tailer.stats().reconnects, 0);
    }

    #[tokio::test]
    async fn transient_failure_without_reconnect() {
        let config = TailerConfig::new("db").with_reconnect(ReconnectPolicy::never());
        let (tailer, transport) = tailer(config);
        transport.push_refusal(MockFailure::Refused);

        let exit = tailer.run().await.unwrap();
        assert!(matches!(
            exit,
            TailerExit::ReconnectDisabled {
                error: EngineError::ConnectFailed { .. }
            }
        ));
        assert_eq!(transport.remaining(), 0);
        assert!(tailer.stats().last_error.is_some());
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let config =
            TailerConfig::new("db").with_reconnect(ReconnectPolicy::new(Duration::ZERO));
        let (tailer, transport) = tailer(config);
        transport.push_refusal(MockFailure::Fatal);
        transport.push_stream(vec![line(1)]);

        assert!(tailer.run().await.is_err());
        assert_eq!(transport.remaining(), 1);
    }

    #[tokio::test]
    async fn invalid_config_fails_before_connecting() {
        let (tailer, transport) = tailer(TailerConfig::new("db").with_port(0));
        assert!(matches!(tailer.run().await, Err(EngineError::Config(_))));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_and_resets_after_progress() {
        let policy = ReconnectPolicy::new(Duration::from_secs(1))
            .with_backoff_multiplier(2.0)
            .with_max_delay(Duration::from_secs(60));
        let (tailer, transport) = tailer(TailerConfig::new("db").with_reconnect(policy));
        transport.push_refusal(MockFailure::Refused);
        transport.push_refusal(MockFailure::Timeout);
        transport.push_stream(vec![line(1), MockStep::Fail(MockFailure::Reset)]);

        let start = tokio::time::Instant::now();
        let result = tailer.run().await;
        // 1s + 2s of backoff, then reset to 1s after the session delivered.
        assert!(start.elapsed() >= Duration::from_secs(4));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(matches!(
            result,
            Err(EngineError::ConnectFailed {
                retryable: false,
                ..
            })
        ));
        assert_eq!(tailer.stats().reconnects, 3);
        assert_eq!(tailer.stats().sessions, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_feed_under_long_server_timeout_ends_normally() {
        let config = TailerConfig::new("db")
            .with_timeout(Duration::from_secs(120))
            .with_reconnect(ReconnectPolicy::never());
        let (tailer, transport) = tailer(config);
        transport.push_stream(vec![
            MockStep::Delay(Duration::from_secs(120)),
            MockStep::chunk("{\"last_seq\":7,\"pending\":0}\n"),
        ]);

        let exit = tailer.run().await.unwrap();
        assert!(matches!(exit, TailerExit::StreamEnded));
        assert!(tailer.stats().last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_bodies_are_throttled() {
        let policy = ReconnectPolicy::new(Duration::from_secs(10));
        let (tailer, transport) = tailer(TailerConfig::new("db").with_reconnect(policy));
        for _ in 0..5 {
            transport.push_stream(vec![]);
        }

        let start = tokio::time::Instant::now();
        let result = tailer.run().await;
        assert!(matches!(result, Err(EngineError::ConnectFailed { .. })));
        assert_eq!(transport.requests().len(), 6);
        assert!(start.elapsed() >= Duration::from_secs(50));
        assert!(start.elapsed() < Duration::from_secs(51));
    }

    #[tokio::test(start_paused = true)]
    async fn productive_end_reconnects_at_once() {
        let policy = ReconnectPolicy::new(Duration::from_secs(10));
        let (tailer, transport) = tailer(TailerConfig::new("db").with_reconnect(policy));
        transport.push_stream(vec![line(1)]);
        transport.push_stream(vec![MockStep::chunk("{\"last_seq\":1}\n")]);

        let start = tokio::time::Instant::now();
        assert!(tailer.run().await.is_err());
        assert_eq!(transport.requests().len(), 3);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(tailer.stats().reconnects, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_retry_wait() {
        let config = TailerConfig::new("db")
            .with_reconnect(ReconnectPolicy::new(Duration::from_secs(3600)));
        let (tailer, transport) = tailer(config);
        transport.push_refusal(MockFailure::Refused);
        let token = tailer.cancellation_token();

        let (result, ()) = tokio::join!(tailer.run(), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            assert_eq!(tailer.state(), SessionState::RetryWait);
            token.cancel();
        });
        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert_eq!(tailer.state(), SessionState::Stopped);
    }
}

//! Configuration for the tailer.

use crate::error::{EngineError, EngineResult};
use couchtail_protocol::{Checkpoint, Decoration, ParseOptions};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name used for the checkpoint when no path is configured.
pub const DEFAULT_CHECKPOINT_FILE: &str = ".couchdb_seq";

/// Default CouchDB port.
pub const DEFAULT_PORT: u16 = 5984;

/// Slack added to the server heartbeat or timeout before the client gives up
/// on a silent connection.
pub const LIVENESS_MARGIN: Duration = Duration::from_secs(30);

/// Basic-auth credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// User name.
    pub username: String,
    /// Password.
    pub password: String,
}

impl Credentials {
    /// Creates credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Builds credentials from optional parts. Both or neither must be given.
    pub fn from_parts(
        username: Option<String>,
        password: Option<String>,
    ) -> EngineResult<Option<Self>> {
        match (username, password) {
            (Some(username), Some(password)) => Ok(Some(Self::new(username, password))),
            (None, None) => Ok(None),
            (Some(_), None) => Err(EngineError::Config(
                "username given without password".into(),
            )),
            (None, Some(_)) => Err(EngineError::Config(
                "password given without username".into(),
            )),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Configuration for one tailer instance. Immutable once the tailer starts.
#[derive(Debug, Clone)]
pub struct TailerConfig {
    /// CouchDB host name or address.
    pub host: String,
    /// CouchDB port.
    pub port: u16,
    /// Database to follow.
    pub database: String,
    /// Connect over https.
    pub secure: bool,
    /// PEM file with an extra trust anchor for https.
    pub ca_file: Option<PathBuf>,
    /// Basic-auth credentials.
    pub credentials: Option<Credentials>,
    /// Server heartbeat interval, sent as `heartbeat=`.
    pub heartbeat: Duration,
    /// Server inactivity timeout, sent as `timeout=`. Disables the heartbeat.
    pub timeout: Option<Duration>,
    /// Checkpoint file. Defaults to `$HOME/.couchdb_seq`.
    pub checkpoint_path: Option<PathBuf>,
    /// Resume point overriding the persisted checkpoint for the first session.
    pub initial_checkpoint: Option<Checkpoint>,
    /// Keep `_rev` in update bodies.
    pub keep_revision: bool,
    /// Attach `decoration` to events.
    pub decorate: bool,
    /// Decoration applied when `decorate` is set.
    pub decoration: Decoration,
    /// Reconnect behavior.
    pub reconnect: ReconnectPolicy,
    /// Longest wait for the next chunk before the session is abandoned.
    /// Raised to the server liveness interval plus [`LIVENESS_MARGIN`] when
    /// that is longer, see [`TailerConfig::effective_idle_timeout`].
    pub idle_timeout: Duration,
    /// Records longer than this are dropped.
    pub max_record_bytes: usize,
}

impl TailerConfig {
    /// Creates a configuration for `database` with default settings.
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            host: "localhost".into(),
            port: DEFAULT_PORT,
            database: database.into(),
            secure: false,
            ca_file: None,
            credentials: None,
            heartbeat: Duration::from_millis(1000),
            timeout: None,
            checkpoint_path: None,
            initial_checkpoint: None,
            keep_revision: false,
            decorate: true,
            decoration: Decoration::default(),
            reconnect: ReconnectPolicy::default(),
            idle_timeout: Duration::from_secs(60),
            max_record_bytes: 16 * 1024 * 1024,
        }
    }

    /// Sets the host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Enables or disables https.
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Sets the trust anchor file.
    pub fn with_ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    /// Sets basic-auth credentials.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Sets the server inactivity timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the checkpoint file.
    pub fn with_checkpoint_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint_path = Some(path.into());
        self
    }

    /// Overrides the resume point of the first session.
    pub fn with_initial_checkpoint(mut self, checkpoint: Checkpoint) -> Self {
        self.initial_checkpoint = Some(checkpoint);
        self
    }

    /// Keeps `_rev` in update bodies.
    pub fn with_keep_revision(mut self, keep: bool) -> Self {
        self.keep_revision = keep;
        self
    }

    /// Enables or disables decoration.
    pub fn with_decorate(mut self, decorate: bool) -> Self {
        self.decorate = decorate;
        self
    }

    /// Sets the decoration.
    pub fn with_decoration(mut self, decoration: Decoration) -> Self {
        self.decoration = decoration;
        self
    }

    /// Sets the reconnect policy.
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Sets the client-side idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the maximum record size.
    pub fn with_max_record_bytes(mut self, max: usize) -> Self {
        self.max_record_bytes = max;
        self
    }

    /// URL scheme derived from `secure`.
    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }

    /// Checks the configuration for values that can never work.
    pub fn validate(&self) -> EngineResult<()> {
        if self.database.trim().is_empty() {
            return Err(EngineError::Config("database name is required".into()));
        }
        if self.host.trim().is_empty() {
            return Err(EngineError::Config("host is required".into()));
        }
        if self.port == 0 {
            return Err(EngineError::Config("port must be non-zero".into()));
        }
        if self.timeout.is_none() && self.heartbeat.is_zero() {
            return Err(EngineError::Config(
                "heartbeat must be non-zero when no timeout is set".into(),
            ));
        }
        if self.idle_timeout.is_zero() {
            return Err(EngineError::Config("idle timeout must be non-zero".into()));
        }
        if self.max_record_bytes == 0 {
            return Err(EngineError::Config("max record size must be non-zero".into()));
        }
        if self.ca_file.is_some() && !self.secure {
            tracing::warn!("ca_file is set but secure is disabled; the file is ignored");
        }
        Ok(())
    }

    /// Returns the checkpoint path, falling back to `<home>/.couchdb_seq`.
    ///
    /// # Errors
    ///
    /// Returns `CheckpointStoreUnavailable` when no path is configured and
    /// no home directory is known.
    pub fn resolve_checkpoint_path(&self, home: Option<&Path>) -> EngineResult<PathBuf> {
        if let Some(path) = &self.checkpoint_path {
            return Ok(path.clone());
        }
        match home {
            Some(home) => {
                let path = home.join(DEFAULT_CHECKPOINT_FILE);
                tracing::info!(path = %path.display(), "no checkpoint path set, using default");
                Ok(path)
            }
            None => Err(EngineError::store_unavailable(
                None,
                "no HOME directory is set; configure a checkpoint path",
            )),
        }
    }

    /// Interval within which the server promises to send something: the
    /// `timeout` when set, the heartbeat otherwise.
    pub fn liveness_interval(&self) -> Duration {
        self.timeout.unwrap_or(self.heartbeat)
    }

    /// Wait for the next chunk actually applied by a session.
    ///
    /// Never shorter than the liveness interval plus [`LIVENESS_MARGIN`], so
    /// a quiet feed under a long server `timeout` is not cut off early.
    pub fn effective_idle_timeout(&self) -> Duration {
        self.idle_timeout
            .max(self.liveness_interval().saturating_add(LIVENESS_MARGIN))
    }

    /// Record decoding options derived from this configuration.
    pub fn parse_options(&self) -> ParseOptions {
        ParseOptions {
            keep_revision: self.keep_revision,
            decoration: self.decorate.then(|| self.decoration.clone()),
        }
    }
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self::new("")
    }
}

/// Configuration for reconnect behavior.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Start a new session after a transient failure.
    pub always_reconnect: bool,
    /// Delay before the first reconnect.
    pub delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// Multiplier applied per consecutive failure. `1.0` keeps the delay fixed.
    pub backoff_multiplier: f64,
}

impl ReconnectPolicy {
    /// Reconnects forever with a fixed delay.
    pub fn new(delay: Duration) -> Self {
        Self {
            always_reconnect: true,
            delay,
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 1.0,
        }
    }

    /// Stops after the first failure.
    pub fn never() -> Self {
        Self {
            always_reconnect: false,
            delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculates the delay before reconnect number `attempt` (1-indexed
    /// count of consecutive failures).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.delay.is_zero() {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let delay_secs = self.delay.as_secs_f64() * self.backoff_multiplier.max(1.0).powi(exponent);
        let capped = delay_secs.min(self.max_delay.max(self.delay).as_secs_f64());
        Duration::from_secs_f64(capped)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

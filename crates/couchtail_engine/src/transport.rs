//! Transport layer abstraction for the changes feed.

use crate::config::TailerConfig;
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use bytes::Bytes;
use couchtail_protocol::Checkpoint;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Raw body chunks of an open `_changes` response.
pub type ChunkStream = BoxStream<'static, EngineResult<Bytes>>;

/// How the server keeps an idle continuous feed alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Send an empty line every interval (`heartbeat=`).
    Heartbeat(Duration),
    /// Close the feed after this much inactivity (`timeout=`).
    Timeout(Duration),
}

/// Parameters of one `GET /{database}/_changes` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangesRequest {
    /// Database name.
    pub database: String,
    /// Resume point sent as `since=`.
    pub since: Checkpoint,
    /// Heartbeat or inactivity timeout, never both.
    pub liveness: Liveness,
}

impl ChangesRequest {
    /// Feed mode requested from the server.
    pub const FEED: &'static str = "continuous";

    /// Builds the request for `since` from the tailer configuration.
    /// A configured timeout takes precedence over the heartbeat.
    pub fn from_config(config: &TailerConfig, since: Checkpoint) -> Self {
        let liveness = match config.timeout {
            Some(timeout) => Liveness::Timeout(timeout),
            None => Liveness::Heartbeat(config.heartbeat),
        };
        Self {
            database: config.database.clone(),
            since,
            liveness,
        }
    }

    /// Query parameters in request order.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let liveness = match self.liveness {
            Liveness::Heartbeat(interval) => ("heartbeat", interval.as_millis().to_string()),
            Liveness::Timeout(timeout) => ("timeout", timeout.as_millis().to_string()),
        };
        vec![
            ("feed", Self::FEED.to_string()),
            ("include_docs", "true".to_string()),
            ("since", self.since.to_string()),
            liveness,
        ]
    }
}

/// A changes transport opens the long-lived feed connection.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (HTTP, scripted mock for testing, etc.).
#[async_trait]
pub trait ChangesTransport: Send + Sync {
    /// Opens the feed and returns its body as a chunk stream.
    ///
    /// # Errors
    ///
    /// `NotFound` if the database does not exist, `ConnectFailed` for
    /// network failures, `Http` for other unexpected statuses.
    async fn open(&self, request: &ChangesRequest) -> EngineResult<ChunkStream>;
}

#[async_trait]
impl<T: ChangesTransport + ?Sized> ChangesTransport for Arc<T> {
    async fn open(&self, request: &ChangesRequest) -> EngineResult<ChunkStream> {
        (**self).open(request).await
    }
}

/// A failure a [`MockTransport`] can inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// Connection refused.
    Refused,
    /// Connection reset mid-stream.
    Reset,
    /// Database missing.
    NotFound,
    /// Read timed out.
    Timeout,
    /// Non-retryable transport failure.
    Fatal,
}

impl MockFailure {
    fn into_error(self, database: &str) -> EngineError {
        match self {
            MockFailure::Refused => EngineError::connect_retryable("connection refused"),
            MockFailure::Reset => EngineError::Stream("connection reset by peer".into()),
            MockFailure::NotFound => EngineError::NotFound {
                database: database.to_string(),
            },
            MockFailure::Timeout => EngineError::Timeout,
            MockFailure::Fatal => EngineError::connect_fatal("injected fatal failure"),
        }
    }
}

/// One step of a scripted response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockStep {
    /// Deliver these bytes.
    Chunk(Bytes),
    /// Fail the stream.
    Fail(MockFailure),
    /// Wait before the next step.
    Delay(Duration),
    /// Never produce another chunk.
    Stall,
}

impl MockStep {
    /// A chunk step from anything byte-like.
    pub fn chunk(bytes: impl Into<Bytes>) -> Self {
        MockStep::Chunk(bytes.into())
    }
}

/// One scripted connection attempt.
#[derive(Debug, Clone)]
pub enum MockConnection {
    /// The attempt fails before a body is available.
    Refuse(MockFailure),
    /// The attempt succeeds and the body follows the steps. The body ends
    /// normally after the last step unless a step fails or stalls.
    Stream(Vec<MockStep>),
}

/// A scripted transport for testing.
///
/// Each `open` consumes the next scripted connection. When the script is
/// exhausted, `open` fails with a non-retryable error so a reconnecting
/// tailer stops instead of spinning.
#[derive(Debug, Default)]
pub struct MockTransport {
    connections: Mutex<VecDeque<MockConnection>>,
    requests: Mutex<Vec<ChangesRequest>>,
}

impl MockTransport {
    /// Creates a transport with an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a connection that streams `steps`.
    pub fn push_stream(&self, steps: Vec<MockStep>) {
        self.connections
            .lock()
            .push_back(MockConnection::Stream(steps));
    }

    /// Appends a connection attempt that fails.
    pub fn push_refusal(&self, failure: MockFailure) {
        self.connections
            .lock()
            .push_back(MockConnection::Refuse(failure));
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<ChangesRequest> {
        self.requests.lock().clone()
    }

    /// Number of scripted connections not yet used.
    pub fn remaining(&self) -> usize {
        self.connections.lock().len()
    }
}

#[async_trait]
impl ChangesTransport for MockTransport {
    async fn open(&self, request: &ChangesRequest) -> EngineResult<ChunkStream> {
        self.requests.lock().push(request.clone());

        let Some(connection) = self.connections.lock().pop_front() else {
            return Err(EngineError::connect_fatal("mock transport script exhausted"));
        };

        let mut steps = match connection {
            MockConnection::Refuse(failure) => return Err(failure.into_error(&request.database)),
            MockConnection::Stream(steps) => steps,
        };

        if let Some(last) = steps
            .iter()
            .position(|step| matches!(step, MockStep::Fail(_) | MockStep::Stall))
        {
            steps.truncate(last + 1);
        }

        let database = request.database.clone();
        let body = stream::iter(steps).filter_map(move |step| {
            let database = database.clone();
            async move {
                match step {
                    MockStep::Chunk(bytes) => Some(Ok(bytes)),
                    MockStep::Fail(failure) => Some(Err(failure.into_error(&database))),
                    MockStep::Delay(delay) => {
                        tokio::time::sleep(delay).await;
                        None
                    }
                    MockStep::Stall => {
                        std::future::pending::<()>().await;
                        None
                    }
                }
            }
        });
        Ok(body.boxed())
    }
}

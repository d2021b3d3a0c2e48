//! A scripted in-process `_changes` server.
//!
//! Each request consumes the next [`ScriptedResponse`] and streams its body
//! chunk by chunk, so the client sees the body arrive piece by piece the way
//! a continuous feed does. Requests beyond the script get
//! `503 Service Unavailable`.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// One scripted HTTP response.
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    status: StatusCode,
    chunks: Vec<(Duration, Bytes)>,
    hold_open: bool,
}

impl ScriptedResponse {
    /// A `200 OK` response with an empty body.
    pub fn ok() -> Self {
        Self::status(200)
    }

    /// A response with the given status code and an empty body. Invalid
    /// codes become `500`.
    pub fn status(status: u16) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            chunks: Vec::new(),
            hold_open: false,
        }
    }

    /// A `404` with CouchDB's error body.
    pub fn not_found() -> Self {
        Self::status(404)
            .chunk(r#"{"error":"not_found","reason":"Database does not exist."}"#)
    }

    /// Appends a body chunk sent immediately.
    pub fn chunk(self, bytes: impl Into<Bytes>) -> Self {
        self.chunk_after(Duration::ZERO, bytes)
    }

    /// Appends a body chunk sent after `delay`.
    pub fn chunk_after(mut self, delay: Duration, bytes: impl Into<Bytes>) -> Self {
        self.chunks.push((delay, bytes.into()));
        self
    }

    /// Keeps the connection open after the last chunk instead of ending the
    /// body.
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }
}

impl IntoResponse for ScriptedResponse {
    fn into_response(self) -> Response {
        let chunks = stream::iter(self.chunks).filter_map(|(delay, bytes)| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            // An empty frame would end a chunked body early.
            (!bytes.is_empty()).then_some(Ok::<_, Infallible>(bytes))
        });
        let body = if self.hold_open {
            Body::from_stream(chunks.chain(stream::pending()))
        } else {
            Body::from_stream(chunks)
        };
        (
            self.status,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response()
    }
}

/// A request received by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    /// Request method.
    pub method: String,
    /// Path and query, as sent.
    pub target: String,
    /// Value of the `Authorization` header.
    pub authorization: Option<String>,
}

impl RecordedRequest {
    /// Returns the path without the query.
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or_default()
    }

    /// Returns the value of query parameter `name`, undecoded.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        let (_, query) = self.target.split_once('?')?;
        query.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key == name).then_some(value)
        })
    }
}

struct Shared {
    script: Mutex<VecDeque<ScriptedResponse>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// A local HTTP server replaying scripted responses.
///
/// The server task stops when the server is dropped.
pub struct FeedServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    server: JoinHandle<()>,
}

impl FeedServer {
    /// Binds to an ephemeral port on 127.0.0.1 and starts serving `script`.
    pub async fn start(script: Vec<ScriptedResponse>) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shared = Arc::new(Shared {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .fallback(replay)
            .with_state(Arc::clone(&shared));
        let server = tokio::spawn(async move {
            // Client disconnects are expected mid-body.
            let _ = axum::serve(listener, app).await;
        });

        Ok(Self {
            addr,
            shared,
            server,
        })
    }

    /// Returns the bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the host to connect to.
    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    /// Returns the bound port.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Appends a response to the script.
    pub fn push(&self, response: ScriptedResponse) {
        self.shared.script.lock().push_back(response);
    }

    /// Every request received, in arrival order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.shared.requests.lock().clone()
    }

    /// Number of scripted responses not yet served.
    pub fn remaining(&self) -> usize {
        self.shared.script.lock().len()
    }
}

impl Drop for FeedServer {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn replay(State(shared): State<Arc<Shared>>, request: Request) -> Response {
    let target = request
        .uri()
        .path_and_query()
        .map_or_else(|| request.uri().path().to_string(), |pq| pq.as_str().to_string());
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    shared.requests.lock().push(RecordedRequest {
        method: request.method().to_string(),
        target,
        authorization,
    });

    let response = shared
        .script
        .lock()
        .pop_front()
        .unwrap_or_else(|| ScriptedResponse::status(503).chunk("script exhausted"));
    response.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn get(server: &FeedServer, target: &str) -> reqwest::Response {
        reqwest::Client::new()
            .get(format!("http://{}{target}", server.addr()))
            .header(header::AUTHORIZATION, "Basic dTpw")
            .send()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn replays_script_and_records_requests() {
        let server = FeedServer::start(vec![ScriptedResponse::ok()
            .chunk("{\"a\":1}\n")
            .chunk_after(Duration::from_millis(20), "")
            .chunk("{\"b\":2}\n")])
        .await
        .unwrap();

        let response = get(&server, "/db/_changes?feed=continuous&since=4").await;
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "{\"a\":1}\n{\"b\":2}\n");

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, "GET");
        assert_eq!(requests[0].path(), "/db/_changes");
        assert_eq!(requests[0].query_param("since"), Some("4"));
        assert_eq!(requests[0].query_param("heartbeat"), None);
        assert_eq!(requests[0].authorization.as_deref(), Some("Basic dTpw"));
        assert_eq!(server.remaining(), 0);
    }

    #[tokio::test]
    async fn exhausted_script_is_unavailable() {
        let server = FeedServer::start(Vec::new()).await.unwrap();
        let response = get(&server, "/db/_changes").await;
        assert_eq!(response.status(), 503);
    }

    #[tokio::test]
    async fn not_found_carries_couchdb_error() {
        let server = FeedServer::start(vec![ScriptedResponse::not_found()])
            .await
            .unwrap();
        let response = get(&server, "/missing/_changes").await;
        assert_eq!(response.status(), 404);
        assert!(response.text().await.unwrap().contains("not_found"));
    }
}

//! HTTP transport implementation.
//!
//! Resolves scheme, host, port, credentials and trust anchor into a reqwest
//! client and streams the `_changes` body chunk by chunk.

use crate::config::{Credentials, TailerConfig};
use crate::error::{EngineError, EngineResult};
use crate::transport::{ChangesRequest, ChangesTransport, ChunkStream};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::{StatusCode, Url};
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const TCP_KEEPALIVE: Duration = Duration::from_secs(60);
const ERROR_BODY_EXCERPT: usize = 256;

/// HTTP-based changes transport.
///
/// A missing or unparseable CA file is a configuration error reported when
/// the transport is built. Certificate validation failures while connecting
/// surface as retryable `ConnectFailed` errors.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Url,
    credentials: Option<Credentials>,
}

impl HttpTransport {
    /// Builds a transport for the configured server.
    pub fn from_config(config: &TailerConfig) -> EngineResult<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .tcp_keepalive(TCP_KEEPALIVE);

        if config.secure {
            if let Some(ca_path) = &config.ca_file {
                let pem = std::fs::read(ca_path).map_err(|e| {
                    EngineError::Config(format!(
                        "failed to read CA certificate {}: {e}",
                        ca_path.display()
                    ))
                })?;
                let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                    EngineError::Config(format!(
                        "failed to parse CA certificate {}: {e}",
                        ca_path.display()
                    ))
                })?;
                builder = builder.add_root_certificate(cert);
            }
        }

        let client = builder
            .build()
            .map_err(|e| EngineError::Config(format!("failed to create HTTP client: {e}")))?;

        let host = if config.host.contains(':') && !config.host.starts_with('[') {
            format!("[{}]", config.host)
        } else {
            config.host.clone()
        };
        let base_url = Url::parse(&format!("{}://{}:{}/", config.scheme(), host, config.port))
            .map_err(|e| EngineError::Config(format!("invalid server address: {e}")))?;

        Ok(Self {
            client,
            base_url,
            credentials: config.credentials.clone(),
        })
    }

    /// Returns the server base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Builds the full feed URL for `request`. The database name is
    /// percent-encoded as a single path segment.
    pub fn request_url(&self, request: &ChangesRequest) -> EngineResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| EngineError::Config("server URL cannot carry a path".into()))?
            .pop_if_empty()
            .push(&request.database)
            .push("_changes");
        url.query_pairs_mut().extend_pairs(request.query_pairs());
        Ok(url)
    }
}

#[async_trait]
impl ChangesTransport for HttpTransport {
    async fn open(&self, request: &ChangesRequest) -> EngineResult<ChunkStream> {
        let url = self.request_url(request)?;
        tracing::debug!(%url, "opening changes feed");

        let mut builder = self.client.get(url);
        if let Some(credentials) = &self.credentials {
            builder = builder.basic_auth(&credentials.username, Some(&credentials.password));
        }

        let response = builder.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Err(EngineError::NotFound {
                database: request.database.clone(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Http {
                status: status.as_u16(),
                message: excerpt(&body),
            });
        }

        Ok(response
            .bytes_stream()
            .map_err(|e| EngineError::Stream(e.to_string()))
            .boxed())
    }
}

fn excerpt(body: &str) -> String {
    let body = body.trim();
    match body.char_indices().nth(ERROR_BODY_EXCERPT) {
        Some((end, _)) => format!("{}...", &body[..end]),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use couchtail_protocol::Checkpoint;

    fn transport(config: &TailerConfig) -> HttpTransport {
        HttpTransport::from_config(config).unwrap()
    }

    #[test]
    fn builds_feed_url() {
        let config = TailerConfig::new("db").with_host("127.0.0.1").with_port(5984);
        let request = ChangesRequest::from_config(&config, Checkpoint::from(17));
        let url = transport(&config).request_url(&request).unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:5984/db/_changes?feed=continuous&include_docs=true&since=17&heartbeat=1000"
        );
    }

    #[test]
    fn secure_scheme_and_timeout() {
        let config = TailerConfig::new("db")
            .with_host("couch.example.com")
            .with_port(6984)
            .with_secure(true)
            .with_timeout(Duration::from_millis(30000));
        let request = ChangesRequest::from_config(&config, Checkpoint::parse("3-g1AA").unwrap());
        let url = transport(&config).request_url(&request).unwrap();
        assert_eq!(url.scheme(), "https");
        assert!(url.as_str().ends_with("since=3-g1AA&timeout=30000"));
    }

    #[test]
    fn database_name_is_encoded() {
        let config = TailerConfig::new("team/orders");
        let request = ChangesRequest::from_config(&config, Checkpoint::origin());
        let url = transport(&config).request_url(&request).unwrap();
        assert_eq!(url.path(), "/team%2Forders/_changes");
    }

    #[test]
    fn ipv6_host_is_bracketed() {
        let config = TailerConfig::new("db").with_host("::1");
        assert_eq!(transport(&config).base_url().as_str(), "http://[::1]:5984/");
    }

    #[test]
    fn credentials_stay_out_of_url() {
        let config = TailerConfig::new("db").with_credentials(Credentials::new("admin", "pw"));
        let request = ChangesRequest::from_config(&config, Checkpoint::origin());
        let url = transport(&config).request_url(&request).unwrap();
        assert!(!url.as_str().contains("admin"));
        assert!(url.password().is_none());
    }

    #[test]
    fn missing_ca_file_is_config_error() {
        let config = TailerConfig::new("db")
            .with_secure(true)
            .with_ca_file("/nonexistent/ca.pem");
        let err = HttpTransport::from_config(&config).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn excerpt_truncates_long_bodies() {
        assert_eq!(excerpt("  short  "), "short");
        let long = "x".repeat(1000);
        assert_eq!(excerpt(&long).len(), ERROR_BODY_EXCERPT + 3);
    }
}

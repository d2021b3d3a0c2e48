//! Tail command implementation.

use async_trait::async_trait;
use clap::Args;
use couchtail_engine::{
    Credentials, EngineError, EngineResult, EventSink, ReconnectPolicy, Tailer, TailerConfig,
    TailerExit, DEFAULT_PORT,
};
use couchtail_protocol::{ChangeEvent, Checkpoint, Decoration};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::info;

/// Options of the `tail` command.
#[derive(Args, Debug)]
pub struct TailArgs {
    /// Database to follow
    #[arg(long)]
    pub db: String,

    /// CouchDB host
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// CouchDB port
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Connect over https
    #[arg(long)]
    pub secure: bool,

    /// PEM file with an extra trusted CA certificate
    #[arg(long)]
    pub ca_file: Option<PathBuf>,

    /// Basic-auth user name
    #[arg(long)]
    pub username: Option<String>,

    /// Basic-auth password
    #[arg(long)]
    pub password: Option<String>,

    /// Heartbeat interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub heartbeat: u64,

    /// Server inactivity timeout in milliseconds (replaces the heartbeat)
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Checkpoint file (default: $HOME/.couchdb_seq)
    #[arg(long)]
    pub checkpoint_path: Option<PathBuf>,

    /// Start from this sequence instead of the persisted checkpoint
    #[arg(long)]
    pub initial_sequence: Option<String>,

    /// Keep `_rev` in update bodies
    #[arg(long)]
    pub keep_revision: bool,

    /// Do not add type, tags or fields to events
    #[arg(long)]
    pub no_decorate: bool,

    /// Value of the `type` field added to every event
    #[arg(long = "type")]
    pub event_type: Option<String>,

    /// Tag added to every event (repeatable)
    #[arg(long = "tag")]
    pub tags: Vec<String>,

    /// Extra field added to every event as KEY=VALUE (repeatable)
    #[arg(long = "add-field", value_parser = parse_field)]
    pub fields: Vec<(String, String)>,

    /// Stop instead of reconnecting after a failure or end of feed
    #[arg(long)]
    pub no_reconnect: bool,

    /// Seconds to wait before reconnecting
    #[arg(long, default_value_t = 10)]
    pub reconnect_delay: u64,

    /// Seconds without data before the connection is abandoned (never less
    /// than the heartbeat or timeout plus 30 seconds)
    #[arg(long, default_value_t = 60)]
    pub idle_timeout: u64,
}

fn parse_field(text: &str) -> Result<(String, String), String> {
    match text.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {text:?}")),
    }
}

impl TailArgs {
    /// Builds the tailer configuration.
    pub fn to_config(&self) -> EngineResult<TailerConfig> {
        let mut config = TailerConfig::new(self.db.clone())
            .with_host(self.host.clone())
            .with_port(self.port)
            .with_secure(self.secure)
            .with_heartbeat(Duration::from_millis(self.heartbeat))
            .with_keep_revision(self.keep_revision)
            .with_decorate(!self.no_decorate)
            .with_decoration(self.decoration())
            .with_idle_timeout(Duration::from_secs(self.idle_timeout));

        config.reconnect = if self.no_reconnect {
            ReconnectPolicy::never()
        } else {
            ReconnectPolicy::new(Duration::from_secs(self.reconnect_delay))
        };
        config.credentials =
            Credentials::from_parts(self.username.clone(), self.password.clone())?;

        if let Some(ca_file) = &self.ca_file {
            config = config.with_ca_file(ca_file);
        }
        if let Some(timeout) = self.timeout {
            config = config.with_timeout(Duration::from_millis(timeout));
        }
        if let Some(path) = &self.checkpoint_path {
            config = config.with_checkpoint_path(path);
        }
        if let Some(seq) = &self.initial_sequence {
            let checkpoint = Checkpoint::parse(seq).ok_or_else(|| {
                EngineError::Config(format!("invalid initial sequence {seq:?}"))
            })?;
            config = config.with_initial_checkpoint(checkpoint);
        }

        config.validate()?;
        Ok(config)
    }

    fn decoration(&self) -> Decoration {
        let fields: Map<String, Value> = self
            .fields
            .iter()
            .map(|(key, value)| (key.clone(), Value::String(value.clone())))
            .collect();
        Decoration {
            event_type: self.event_type.clone(),
            tags: self.tags.clone(),
            fields,
        }
    }
}

/// Writes each event as one JSON line.
pub struct JsonLinesSink<W> {
    out: Mutex<W>,
}

impl<W> JsonLinesSink<W> {
    /// Wraps a writer.
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    /// Returns the writer.
    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> EventSink for JsonLinesSink<W> {
    async fn deliver(&self, event: ChangeEvent) -> EngineResult<()> {
        let mut line = serde_json::to_vec(&event.to_json())
            .map_err(|e| EngineError::Delivery(e.to_string()))?;
        line.push(b'\n');

        let mut out = self.out.lock().await;
        out.write_all(&line)
            .await
            .map_err(|e| EngineError::Delivery(format!("write failed: {e}")))?;
        out.flush()
            .await
            .map_err(|e| EngineError::Delivery(format!("flush failed: {e}")))
    }
}

/// Runs the tail command until the feed stops, a fatal error occurs, or
/// Ctrl-C is pressed.
pub fn run(args: TailArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.to_config()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(tail(config))
}

async fn tail(config: TailerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let tailer = Tailer::from_config(config, JsonLinesSink::new(tokio::io::stdout()))?;

    let token = tailer.cancellation_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping");
            token.cancel();
        }
    });

    let result = tailer.run().await;
    interrupt.abort();

    match result {
        Ok(TailerExit::StreamEnded) | Err(EngineError::Cancelled) => Ok(()),
        Ok(TailerExit::ReconnectDisabled { error }) => {
            Err(format!("feed stopped after failure: {error}").into())
        }
        Err(error) => Err(error.into()),
    }
}

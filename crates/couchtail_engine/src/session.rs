//! One connection lifetime of the changes feed.

use crate::checkpoint_store::CheckpointStore;
use crate::config::TailerConfig;
use crate::error::{EngineError, EngineResult};
use crate::sink::EventSink;
use crate::state::{SessionState, Status};
use crate::transport::{ChangesRequest, ChangesTransport};
use couchtail_protocol::{
    parse_record, ChangeEvent, Checkpoint, Frame, LineFramer, ParseOptions, ParsedRecord,
    RecordError,
};
use futures::StreamExt;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a session ended when no error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The server closed the body normally.
    Ended {
        /// Events delivered and checkpointed during the session.
        delivered: u64,
        /// The server sent an end-of-batch marker before closing.
        end_of_batch: bool,
    },
}

impl SessionOutcome {
    /// Returns true if the session saw neither a change nor an end-of-batch
    /// marker, as with an empty response body.
    pub fn is_empty(&self) -> bool {
        match self {
            SessionOutcome::Ended {
                delivered,
                end_of_batch,
            } => *delivered == 0 && !end_of_batch,
        }
    }
}

/// Reads one feed connection from open to close.
///
/// Every change is handed to the sink first and its checkpoint persisted
/// only after the sink accepted it. Cancellation is observed while
/// connecting and while waiting for the next chunk; a record whose delivery
/// has started always completes.
pub(crate) struct StreamSession<'a, T: ?Sized, S: ?Sized, C: ?Sized> {
    config: &'a TailerConfig,
    transport: &'a T,
    sink: &'a S,
    store: &'a C,
    cancel: &'a CancellationToken,
    status: &'a Status,
    options: ParseOptions,
    delivered: u64,
    end_of_batch: bool,
}

impl<'a, T, S, C> StreamSession<'a, T, S, C>
where
    T: ChangesTransport + ?Sized,
    S: EventSink + ?Sized,
    C: CheckpointStore + ?Sized,
{
    pub(crate) fn new(
        config: &'a TailerConfig,
        transport: &'a T,
        sink: &'a S,
        store: &'a C,
        cancel: &'a CancellationToken,
        status: &'a Status,
    ) -> Self {
        Self {
            config,
            transport,
            sink,
            store,
            cancel,
            status,
            options: config.parse_options(),
            delivered: 0,
            end_of_batch: false,
        }
    }

    /// Events delivered so far, including by a session that later failed.
    pub(crate) fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Runs the session from `since` until the body ends or an error occurs.
    pub(crate) async fn run(&mut self, since: Checkpoint) -> EngineResult<SessionOutcome> {
        let request = ChangesRequest::from_config(self.config, since);

        self.status.set_state(SessionState::Connecting);
        let mut body = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(EngineError::Cancelled),
            opened = self.transport.open(&request) => opened?,
        };

        self.status.set_state(SessionState::Streaming);
        info!("streaming changes");

        let idle_timeout = self.config.effective_idle_timeout();
        let mut framer = LineFramer::with_max_record_len(self.config.max_record_bytes);
        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(EngineError::Cancelled),
                next = tokio::time::timeout(idle_timeout, body.next()) => next,
            };

            let chunk = match next {
                Err(_) => return Err(EngineError::Timeout),
                Ok(None) => break,
                Ok(Some(chunk)) => chunk?,
            };

            for frame in framer.feed(&chunk) {
                self.handle_frame(frame).await?;
            }
        }

        if let Some(rest) = framer.take_remainder() {
            warn!(bytes = rest.len(), "discarding unterminated record at end of feed");
        }
        info!(delivered = self.delivered, "changes feed ended");
        Ok(SessionOutcome::Ended {
            delivered: self.delivered,
            end_of_batch: self.end_of_batch,
        })
    }

    async fn handle_frame(&mut self, frame: Frame) -> EngineResult<()> {
        let parsed = match frame {
            Frame::Record(record) => parse_record(&record, &self.options),
            Frame::Oversized { len } => Err(RecordError::Oversized {
                len,
                limit: self.config.max_record_bytes,
            }),
        };

        match parsed {
            Ok(ParsedRecord::Change(event)) => self.deliver(event).await,
            Ok(ParsedRecord::EndOfBatch(marker)) => {
                debug!(last_seq = %marker.last_seq, "end of batch");
                self.end_of_batch = true;
                self.status.update(|stats| stats.end_of_batch_skipped += 1);
                Ok(())
            }
            Err(error) => {
                if error.is_undecodable() {
                    warn!(%error, "skipping undecodable record");
                } else {
                    warn!(%error, "skipping incomplete change record");
                }
                self.status.update(|stats| stats.malformed_skipped += 1);
                Ok(())
            }
        }
    }

    async fn deliver(&mut self, event: ChangeEvent) -> EngineResult<()> {
        let checkpoint = event.checkpoint().clone();
        let action = event.action();
        debug!(id = event.id(), seq = %checkpoint, action = action.as_str(), "delivering change");

        self.sink.deliver(event).await?;
        self.persist(&checkpoint)?;

        self.delivered += 1;
        self.status.record_delivery(action, checkpoint);
        Ok(())
    }

    /// Writes the checkpoint. File stores fsync, so a multi-threaded runtime
    /// runs the write under `block_in_place`.
    fn persist(&self, checkpoint: &Checkpoint) -> EngineResult<()> {
        match Handle::try_current().map(|handle| handle.runtime_flavor()) {
            Ok(RuntimeFlavor::MultiThread) => {
                tokio::task::block_in_place(|| self.store.write(checkpoint))
            }
            _ => self.store.write(checkpoint),
        }
    }
}

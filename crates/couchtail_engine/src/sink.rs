//! Downstream hand-off of finished events.

use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use couchtail_protocol::ChangeEvent;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Receives change events from the tailer.
///
/// `deliver` may wait (for example on a full queue); the session reads no
/// further input and advances no checkpoint until it returns. An error
/// leaves the checkpoint untouched and the event is delivered again after
/// the reconnect.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Hands one event downstream.
    async fn deliver(&self, event: ChangeEvent) -> EngineResult<()>;
}

#[async_trait]
impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    async fn deliver(&self, event: ChangeEvent) -> EngineResult<()> {
        (**self).deliver(event).await
    }
}

/// Sends events into a bounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<ChangeEvent>,
}

impl ChannelSink {
    /// Wraps an existing sender.
    pub fn new(sender: mpsc::Sender<ChangeEvent>) -> Self {
        Self { sender }
    }

    /// Creates a sink and the receiving half of a channel of `capacity`.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ChangeEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self::new(sender), receiver)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn deliver(&self, event: ChangeEvent) -> EngineResult<()> {
        self.sender
            .send(event)
            .await
            .map_err(|_| EngineError::Delivery("event receiver was dropped".into()))
    }
}

/// An in-memory sink for testing.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: RwLock<Vec<ChangeEvent>>,
    failures_left: AtomicUsize,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects the next `count` deliveries.
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Every accepted event, in delivery order.
    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.read().clone()
    }

    /// Number of accepted events.
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing has been accepted.
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn deliver(&self, event: ChangeEvent) -> EngineResult<()> {
        let rejected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(EngineError::Delivery(format!(
                "injected failure for {}",
                event.id()
            )));
        }
        self.events.write().push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn event(seq: u64) -> ChangeEvent {
        ChangeEvent::update(format!("doc-{seq}"), json!(seq), Map::new(), false).unwrap()
    }

    #[tokio::test]
    async fn memory_sink_records_in_order() {
        let sink = MemorySink::new();
        sink.deliver(event(1)).await.unwrap();
        sink.deliver(event(2)).await.unwrap();
        let ids: Vec<_> = sink.events().iter().map(|e| e.id().to_string()).collect();
        assert_eq!(ids, vec!["doc-1", "doc-2"]);
    }

    #[tokio::test]
    async fn memory_sink_injected_failures() {
        let sink = MemorySink::new();
        sink.fail_next(1);
        assert!(matches!(
            sink.deliver(event(1)).await,
            Err(EngineError::Delivery(_))
        ));
        sink.deliver(event(1)).await.unwrap();
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn channel_sink_forwards_and_reports_closed_receiver() {
        let (sink, mut receiver) = ChannelSink::channel(4);
        sink.deliver(event(5)).await.unwrap();
        assert_eq!(receiver.recv().await.unwrap().id(), "doc-5");

        drop(receiver);
        let err = sink.deliver(event(6)).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn arc_sink_delegates() {
        let sink = Arc::new(MemorySink::new());
        let shared: Arc<MemorySink> = Arc::clone(&sink);
        shared.deliver(event(9)).await.unwrap();
        assert_eq!(sink.len(), 1);
    }
}

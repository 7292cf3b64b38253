//! Broadcast event bus for distributing `WorkflowEvent` to multiple subscribers.
//!
//! Built on `tokio::sync::broadcast`, the `EventBus` supports multiple
//! concurrent subscribers. Publishing with no active subscribers is a no-op.

use tokio::sync::{broadcast, mpsc};
use weaver_types::event::WorkflowEvent;

/// Multi-consumer event bus for workflow lifecycle events.
///
/// Wraps a `tokio::sync::broadcast` channel. Cloning the bus clones the
/// sender, allowing multiple producers and consumers.
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no subscribers, the event is silently dropped.
    pub fn publish(&self, event: WorkflowEvent) {
        let _ = self.sender.send(event);
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

/// Where a single execute/resume call sends its events.
///
/// Always publishes to the shared bus; streaming calls also get an ordered
/// per-call channel. A dropped stream receiver is ignored.
#[derive(Clone, Debug)]
pub struct EventSink {
    bus: EventBus,
    stream: Option<mpsc::UnboundedSender<WorkflowEvent>>,
}

impl EventSink {
    pub fn new(bus: EventBus) -> Self {
        Self { bus, stream: None }
    }

    pub fn with_stream(bus: EventBus, stream: mpsc::UnboundedSender<WorkflowEvent>) -> Self {
        Self {
            bus,
            stream: Some(stream),
        }
    }

    pub fn emit(&self, event: WorkflowEvent) {
        if let Some(stream) = &self.stream {
            let _ = stream.send(event.clone());
        }
        self.bus.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sample_event() -> WorkflowEvent {
        WorkflowEvent::Started {
            workflow_id: "wf".to_string(),
            run_id: Uuid::now_v7(),
        }
    }

    #[tokio::test]
    async fn publish_and_subscribe_delivers_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(sample_event());

        let received = rx.recv().await.unwrap();
        assert!(matches!(received, WorkflowEvent::Started { .. }));
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive_event() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(sample_event());

        assert!(rx1.recv().await.is_ok());
        assert!(rx2.recv().await.is_ok());
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        bus.publish(sample_event());
    }

    #[tokio::test]
    async fn sink_fans_out_to_stream_and_bus() {
        let bus = EventBus::new(16);
        let mut bus_rx = bus.subscribe();
        let (tx, mut stream_rx) = mpsc::unbounded_channel();
        let sink = EventSink::with_stream(bus, tx);

        sink.emit(sample_event());

        assert!(matches!(stream_rx.recv().await, Some(WorkflowEvent::Started { .. })));
        assert!(matches!(bus_rx.recv().await, Ok(WorkflowEvent::Started { .. })));
    }

    #[test]
    fn sink_ignores_closed_stream() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sink = EventSink::with_stream(EventBus::new(4), tx);
        sink.emit(sample_event());
    }

    #[test]
    fn debug_impl() {
        let bus = EventBus::new(16);
        let _rx = bus.subscribe();
        let debug = format!("{bus:?}");
        assert!(debug.contains("receiver_count"));
    }
}

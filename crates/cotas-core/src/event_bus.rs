use tokio::sync::broadcast;

use cotas_types::StepEvent;

/// Bounded capacity of the step-event channel. Slow consumers that fall
/// more than this many events behind start losing the oldest ones.
pub const EVENT_BUS_CAPACITY: usize = 256;

/// Fire-and-forget fan-out of [`StepEvent`]s. Publishing never blocks the
/// orchestrator and never fails it: with no subscribers the event is
/// simply dropped.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StepEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StepEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: StepEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cotas_types::EventKind;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(StepEvent::new(EventKind::Think, 1, "considering options"));
        let event = rx.recv().await.expect("event");
        assert_eq!(event.kind, EventKind::Think);
        assert_eq!(event.step, 1);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.publish(StepEvent::new(EventKind::Error, 1, "nobody listening"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn lagged_subscriber_loses_oldest_events_only() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        for i in 0..(EVENT_BUS_CAPACITY as u32 + 10) {
            bus.publish(StepEvent::new(EventKind::Think, i, format!("step {i}")));
        }
        // The first recv reports the lag, subsequent ones resume from the
        // oldest retained event.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(missed)) => assert!(missed >= 10),
            other => panic!("expected lag, got {other:?}"),
        }
        let event = rx.recv().await.expect("event after lag");
        assert!(event.step >= 10);
    }
}

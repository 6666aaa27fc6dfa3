//! Event bus routing helpers.

use crate::error::{EventBusError, EventBusResult};
use crate::payloads::{DEFAULT_REPLAY_CAPACITY, Event, EventEnvelope, EventId};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::sync::broadcast::Sender;
use tokio_stream::wrappers::BroadcastStream;

/// Stream wrapper used by subscribers.
pub type EventStream = BroadcastStream<EventEnvelope>;

/// Shared event bus built on top of `tokio::broadcast`.
///
/// Publishing never blocks; when the channel overflows the oldest events are
/// dropped for lagging subscribers, while the replay ring keeps the most
/// recent `replay_capacity` envelopes for late joiners.
#[derive(Clone)]
pub struct EventBus {
    sender: Sender<EventEnvelope>,
    replay: Arc<Mutex<VecDeque<EventEnvelope>>>,
    replay_capacity: usize,
    next_id: Arc<Mutex<EventId>>,
    closed: Arc<AtomicBool>,
}

impl EventBus {
    /// Construct a bus with a custom replay capacity.
    #[must_use]
    pub fn with_capacity(replay_capacity: usize) -> Self {
        let replay_capacity = replay_capacity.max(1);
        let (sender, _) = broadcast::channel(replay_capacity);
        Self {
            sender,
            replay: Arc::new(Mutex::new(VecDeque::with_capacity(replay_capacity))),
            replay_capacity,
            next_id: Arc::new(Mutex::new(1)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Construct a bus with the default replay capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CAPACITY)
    }

    /// Subscribe to the bus, returning a stream of events published from now on.
    ///
    /// A subscriber that lags behind receives a `Lagged` item and can fill
    /// the gap from [`EventBus::backlog_since`].
    #[must_use]
    pub fn subscribe(&self) -> EventStream {
        BroadcastStream::new(self.sender.subscribe())
    }

    /// Publish a new event to all subscribers.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SendFailed`] once the bus has been closed.
    pub fn publish(&self, event: Event) -> EventBusResult<EventId> {
        let mut next = self
            .next_id
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let id = *next;
        *next = next.saturating_add(1);
        drop(next);

        if self.closed.load(Ordering::Acquire) {
            return Err(EventBusError::SendFailed {
                event_id: id,
                event_kind: event.kind(),
            });
        }

        let envelope = EventEnvelope {
            id,
            timestamp: Utc::now(),
            event,
        };
        {
            let mut replay = self.lock_replay();
            if replay.len() == self.replay_capacity {
                let _ = replay.pop_front();
            }
            replay.push_back(envelope.clone());
        }
        // No receivers is not a failure; the replay ring still holds the event.
        let _ = self.sender.send(envelope);
        Ok(id)
    }

    /// Stop accepting new events.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Collect a backlog of events emitted after the specified id.
    #[must_use]
    pub fn backlog_since(&self, id: EventId) -> Vec<EventEnvelope> {
        let replay = self.lock_replay();
        replay.iter().filter(|env| env.id > id).cloned().collect()
    }

    fn lock_replay(&self) -> MutexGuard<'_, VecDeque<EventEnvelope>> {
        self.replay
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
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
    use crate::payloads::{Event, ScanStage};
    use tokio_stream::StreamExt;
    use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

    #[tokio::test]
    async fn publish_and_replay_from_id() -> EventBusResult<()> {
        let bus = EventBus::with_capacity(4);
        let first = bus.publish(Event::ScanDetected {
            source_path: "/scans/a".into(),
        })?;
        let second = bus.publish(Event::HealthChanged {
            degraded: vec!["store".into()],
        })?;

        let backlog = bus.backlog_since(first);
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].id, second);
        Ok(())
    }

    #[tokio::test]
    async fn replay_ring_is_bounded() -> EventBusResult<()> {
        let bus = EventBus::with_capacity(2);
        for idx in 0..5 {
            bus.publish(Event::ScanDetected {
                source_path: format!("/scans/{idx}"),
            })?;
        }
        let backlog = bus.backlog_since(0);
        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog[0].id, 4);
        Ok(())
    }

    #[tokio::test]
    async fn subscribe_streams_events() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe();
        let id = bus
            .publish(Event::StageChanged {
                source_path: "/scans/roll42".into(),
                stage: ScanStage::Stable,
            })
            .expect("publish");
        let envelope = stream
            .next()
            .await
            .expect("stream item")
            .expect("broadcast ok");
        assert_eq!(envelope.id, id);
        assert!(matches!(
            envelope.event,
            Event::StageChanged {
                stage: ScanStage::Stable,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn lagging_subscriber_recovers_from_the_backlog() -> EventBusResult<()> {
        let bus = EventBus::with_capacity(2);
        let mut stream = bus.subscribe();
        for idx in 0..4 {
            bus.publish(Event::ScanDetected {
                source_path: format!("/scans/{idx}"),
            })?;
        }
        let lagged = stream.next().await.expect("stream item");
        assert!(matches!(lagged, Err(BroadcastStreamRecvError::Lagged(2))));
        let recovered: Vec<EventId> = bus.backlog_since(0).iter().map(|env| env.id).collect();
        assert_eq!(recovered, vec![3, 4]);
        Ok(())
    }

    #[test]
    fn closed_bus_rejects_publish() {
        let bus = EventBus::new();
        bus.close();
        let err = bus
            .publish(Event::ScanStaged {
                source_path: "/scans/a".into(),
            })
            .expect_err("closed bus");
        assert_eq!(err.event_kind(), "scan_staged");
        assert_eq!(err.event_id(), 1);
    }
}

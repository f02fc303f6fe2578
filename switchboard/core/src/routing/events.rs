//! Router outcome events
//!
//! Structured events broadcast to any subscriber (alert monitor, log sinks,
//! the daemon). Publishing never fails a dispatch: with no subscribers the
//! event is simply dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::health::HealthTransition;
use crate::error::ErrorClass;
use crate::provider::ProviderId;

/// Default broadcast buffer
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Something the router did
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RouterEvent {
    /// Served from the response cache (stored or joined)
    CacheHit { request_id: String },

    /// An upstream attempt succeeded
    AttemptSucceeded {
        request_id: String,
        provider: ProviderId,
        latency_ms: u64,
    },

    /// An upstream attempt failed
    AttemptFailed {
        request_id: String,
        provider: ProviderId,
        class: ErrorClass,
        latency_ms: u64,
    },

    /// A candidate was dropped without calling upstream
    AttemptSkipped {
        request_id: String,
        provider: ProviderId,
        reason: String,
    },

    /// A provider changed health state
    HealthChanged(HealthTransition),

    /// A dispatch finished with an error
    DispatchFailed {
        request_id: String,
        class: ErrorClass,
        retryable: bool,
    },
}

/// Broadcast bus for [`RouterEvent`]s
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<RouterEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    /// Bus with the given buffer size
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish; dropped silently when nobody listens
    pub fn emit(&self, event: RouterEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Router event dropped, no subscribers");
        }
    }

    /// New receiver for events published from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.tx.subscribe()
    }

    /// Number of live receivers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers_is_harmless() {
        let bus = EventBus::default();
        bus.emit(RouterEvent::CacheHit {
            request_id: "r1".into(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(RouterEvent::AttemptFailed {
            request_id: "r2".into(),
            provider: ProviderId::Groq,
            class: ErrorClass::Timeout,
            latency_ms: 1500,
        });

        let event = rx.recv().await.unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "attempt_failed");
        assert_eq!(json["provider"], "groq");
        assert_eq!(json["class"], "timeout");
    }
}

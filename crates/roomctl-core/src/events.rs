//! C8 (event bus) and C9 (reactive stream bridge).
//!
//! A thin generic wrapper over [`tokio::sync::broadcast`]: any event type
//! that can name itself and serialize can be published here, subscribed
//! to by any number of listeners, and — on demand — mirrored onto a
//! second "reactive" stream as `{event, ...payload}` for UI frameworks
//! that want one multicast feed instead of many named callbacks.

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;

/// An event that can report its own stable name and JSON payload for the
/// reactive bridge. Kept as an explicit method rather than leaning on
/// `#[derive(Serialize)]` because enum variants with a single inner value
/// would otherwise serialize as `{"Variant": value}` instead of flattening
/// `value`'s own fields to the top level the way `{event, ...payload}`
/// requires.
pub trait NamedEvent: Clone + Send + Sync + 'static {
    fn event_name(&self) -> &'static str;
    fn to_payload(&self) -> Value;
}

const CHANNEL_CAPACITY: usize = 256;

/// Multi-listener pub/sub for one event type, with an optional reactive
/// mirror stream.
pub struct EventBus<E: NamedEvent> {
    tx: broadcast::Sender<E>,
    reactive: std::sync::Mutex<Option<broadcast::Sender<Value>>>,
}

impl<E: NamedEvent> EventBus<E> {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            reactive: std::sync::Mutex::new(None),
        }
    }

    /// Publish an event to every current subscriber. Ordered,
    /// synchronous delivery into each subscriber's queue.
    pub fn emit(&self, event: E) {
        trace!(event = event.event_name(), "emitting event");
        let _ = self.tx.send(event.clone());
        let reactive = self.reactive.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(reactive_tx) = reactive.as_ref() {
            let mut tagged = event.to_payload();
            if let Value::Object(map) = &mut tagged {
                map.insert("event".to_owned(), Value::String(event.event_name().to_owned()));
            } else {
                tagged = serde_json::json!({ "event": event.event_name(), "payload": tagged });
            }
            let _ = reactive_tx.send(tagged);
        }
    }

    /// Subscribe to every event published on this bus from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    /// Enable (idempotently) the reactive mirror and return a stream of
    /// tagged JSON values.
    pub fn reactive_stream(&self) -> impl futures_core::Stream<Item = Value> + Send + 'static {
        let mut reactive = self.reactive.lock().unwrap_or_else(|e| e.into_inner());
        let tx = reactive.get_or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        let rx = tx.subscribe();
        BroadcastStream::new(rx).filter_map(|item| async move { item.ok() })
    }

    /// Number of currently attached listeners. Used by [`crate::device`]
    /// to decide whether the last `STATE_CHANGED` listener was removed.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<E: NamedEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Debug, Clone, Serialize)]
    struct Ping {
        n: u32,
    }

    impl NamedEvent for Ping {
        fn event_name(&self) -> &'static str {
            "PING"
        }

        fn to_payload(&self) -> Value {
            serde_json::to_value(self).unwrap_or_default()
        }
    }

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(Ping { n: 1 });
        let received = rx.recv().await.unwrap();
        assert_eq!(received.n, 1);
    }

    #[tokio::test]
    async fn reactive_stream_tags_payload_with_event_name() {
        let bus = EventBus::new();
        let mut stream = std::pin::pin!(bus.reactive_stream());
        bus.emit(Ping { n: 7 });
        let value = stream.next().await.unwrap();
        assert_eq!(value["event"], "PING");
        assert_eq!(value["n"], 7);
    }

    #[tokio::test]
    async fn listener_count_reflects_subscriptions() {
        let bus: EventBus<Ping> = EventBus::new();
        assert_eq!(bus.listener_count(), 0);
        let _a = bus.subscribe();
        let _b = bus.subscribe();
        assert_eq!(bus.listener_count(), 2);
    }
}

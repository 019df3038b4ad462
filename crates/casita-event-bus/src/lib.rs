//! Event bus with typed pub/sub for casita
//!
//! The central message broker of the runtime. Entity platforms fire
//! events here; integrations subscribe to the event types they care
//! about, or to everything via the wildcard channel.

use dashmap::DashMap;
use casita_core::{Context, Event, EventData, EventType};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Default channel capacity for event subscriptions
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// The event bus for publishing and subscribing to events
///
/// One broadcast channel per event type, created lazily on first
/// subscription, plus a wildcard channel that sees every event. Slow
/// subscribers observe `Lagged` and keep receiving; they never block
/// the publisher.
pub struct EventBus {
    /// Broadcast senders keyed by event type
    listeners: DashMap<EventType, broadcast::Sender<Event<serde_json::Value>>>,
    /// Sender for wildcard subscribers
    match_all_sender: broadcast::Sender<Event<serde_json::Value>>,
    /// Channel capacity
    capacity: usize,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with a specific channel capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (match_all_sender, _) = broadcast::channel(capacity);
        Self {
            listeners: DashMap::new(),
            match_all_sender,
            capacity,
        }
    }

    /// Subscribe to events of a specific type
    pub fn subscribe(
        &self,
        event_type: impl Into<EventType>,
    ) -> broadcast::Receiver<Event<serde_json::Value>> {
        let event_type = event_type.into();
        trace!(event_type = %event_type, "Subscribing to event type");

        if event_type.is_match_all() {
            return self.match_all_sender.subscribe();
        }

        self.listeners
            .entry(event_type.clone())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(self.capacity);
                tx
            })
            .subscribe()
    }

    /// Subscribe to a typed event, receiving parsed payloads
    pub fn subscribe_typed<T: EventData + serde::de::DeserializeOwned>(
        &self,
    ) -> TypedEventReceiver<T> {
        let rx = self.subscribe(T::event_type());
        TypedEventReceiver::new(rx)
    }

    /// Subscribe to every event regardless of type
    pub fn subscribe_all(&self) -> broadcast::Receiver<Event<serde_json::Value>> {
        self.match_all_sender.subscribe()
    }

    /// Fire an event to all subscribers of its type and all wildcard subscribers
    pub fn fire(&self, event: Event<serde_json::Value>) {
        debug!(event_type = %event.event_type, "Firing event");

        if let Some(sender) = self.listeners.get(&event.event_type) {
            // Send errors only mean there are no active receivers
            let _ = sender.send(event.clone());
        }

        let _ = self.match_all_sender.send(event);
    }

    /// Fire a typed payload, serializing it onto the bus
    pub fn fire_typed<T: EventData + serde::Serialize>(&self, data: T, context: Context) {
        let json_data = serde_json::to_value(&data).unwrap_or_default();
        self.fire(Event::new(T::event_type(), json_data, context));
    }

    /// Number of event types with at least one subscription channel
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A receiver yielding events with deserialized payloads
///
/// Events of the right type whose payload fails to deserialize are
/// skipped rather than surfaced as errors.
pub struct TypedEventReceiver<T> {
    rx: broadcast::Receiver<Event<serde_json::Value>>,
    _phantom: std::marker::PhantomData<T>,
}

impl<T: EventData + serde::de::DeserializeOwned> TypedEventReceiver<T> {
    fn new(rx: broadcast::Receiver<Event<serde_json::Value>>) -> Self {
        Self {
            rx,
            _phantom: std::marker::PhantomData,
        }
    }

    /// Receive the next event with a parseable payload
    pub async fn recv(&mut self) -> Result<Event<T>, broadcast::error::RecvError> {
        loop {
            let event = self.rx.recv().await?;
            if let Ok(data) = serde_json::from_value::<T>(event.data.clone()) {
                return Ok(Event {
                    event_type: event.event_type,
                    data,
                    time_fired: event.time_fired,
                    context: event.context,
                });
            }
        }
    }
}

/// Thread-safe wrapper for EventBus
pub type SharedEventBus = Arc<EventBus>;

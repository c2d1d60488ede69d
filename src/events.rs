//! In-process event bus
//!
//! A thin wrapper around a Tokio broadcast channel. Every publisher shares one
//! sender; every subscriber gets its own receiver plus a filter on topic,
//! source and priority. Filtering happens on the receiving side, so a slow
//! subscriber only lags itself.
//!
//! ```text
//! MetricsCollector ──┐                         ┌──▶ AlertActor   (MetricCollected / Monitor)
//! AlertActor ────────┼──▶ broadcast::Sender ───┼──▶ hub logger   (SystemError)
//! PoolActor ─────────┘                         └──▶ ...
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::alerts::Alert;
use crate::metrics::MetricSample;

/// Default buffer size of the underlying broadcast channel
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    MetricCollected,
    AlertTriggered,
    AlertResolved,
    SystemError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// Monitoring components (metrics collector, alert manager)
    Monitor,
    /// Infrastructure services (connection pool, health checks)
    Service,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// Publisher-supplied metadata
#[derive(Debug, Clone, Copy)]
pub struct EventMeta {
    pub source: EventSource,
    pub priority: Priority,
}

impl EventMeta {
    pub fn new(source: EventSource, priority: Priority) -> Self {
        Self { source, priority }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    MetricCollected(MetricSample),
    AlertTriggered { alert: Alert, rule_name: String },
    AlertResolved { alert: Alert },
    SystemError {
        service: String,
        error: String,
        details: String,
    },
}

impl EventPayload {
    pub fn topic(&self) -> Topic {
        match self {
            EventPayload::MetricCollected(_) => Topic::MetricCollected,
            EventPayload::AlertTriggered { .. } => Topic::AlertTriggered,
            EventPayload::AlertResolved { .. } => Topic::AlertResolved,
            EventPayload::SystemError { .. } => Topic::SystemError,
        }
    }
}

/// An event as seen by subscribers
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub topic: Topic,
    pub payload: EventPayload,
    pub source: EventSource,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Uuid,
}

/// Subscription filter. `None` fields match anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventFilter {
    pub topic: Option<Topic>,
    pub source: Option<EventSource>,
    pub priority: Option<Priority>,
}

impl EventFilter {
    pub fn topic(topic: Topic) -> Self {
        Self {
            topic: Some(topic),
            ..Self::default()
        }
    }

    pub fn from_source(mut self, source: EventSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.topic.is_none_or(|topic| topic == event.topic)
            && self.source.is_none_or(|source| source == event.source)
            && self.priority.is_none_or(|priority| priority == event.priority)
    }
}

/// Cloneable publisher/subscriber registry
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to every current subscriber
    ///
    /// Publishing with no subscribers is not an error.
    pub fn publish(&self, payload: EventPayload, meta: EventMeta) {
        let event = Event {
            topic: payload.topic(),
            payload,
            source: meta.source,
            priority: meta.priority,
            timestamp: Utc::now(),
            correlation_id: Uuid::new_v4(),
        };

        match self.sender.send(event) {
            Ok(receivers) => trace!("published event to {receivers} receivers"),
            Err(_) => trace!("no receivers for event"),
        }
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            filter,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// A filtered view over the bus
pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
    filter: EventFilter,
}

impl Subscription {
    /// Wait for the next event that matches the filter
    ///
    /// `RecvError::Lagged` is passed through so callers can log skipped events.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }
}

//! One-way fan-out of engine events to subscribers.
//!
//! Events are broadcast as `{type, data, timestamp_iso}` over a tokio
//! broadcast channel.  Subscribers narrow what they receive with a
//! [`TopicFilter`]: an exact topic (`"relay:sent"`), a prefix
//! (`"relay:*"`), or everything (`"*"`).  Emission never blocks and never
//! fails; an event with no listeners is simply dropped.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::storage::now_ms;

const BUS_CAPACITY: usize = 256;

/// Topics emitted by the engine.  The string forms are the external
/// contract used by subscribers.
pub mod topic {
    pub const RELAY_SENT: &str = "relay:sent";
    pub const RELAY_FAILED: &str = "relay:failed";
    pub const RELAY_BUFFERED: &str = "relay:buffered";
    pub const BUFFER_RETRY: &str = "buffer:retry";
    pub const BUFFER_EXPIRED: &str = "buffer:expired";
    pub const STATS_UPDATE: &str = "stats:update";
    pub const ERROR: &str = "error";
}

/// One broadcast event.
#[derive(Debug, Clone, Serialize)]
pub struct RelayEvent {
    #[serde(rename = "type")]
    pub topic: String,
    pub data: Value,
    pub timestamp_iso: String,
}

impl RelayEvent {
    pub fn new(topic: &str, data: Value) -> Self {
        Self {
            topic: topic.to_string(),
            data,
            timestamp_iso: crate::logging::format_iso(now_ms()),
        }
    }
}

/// Subscription filter: exact topic, `prefix:*`, or `*`.
#[derive(Debug, Clone)]
pub enum TopicFilter {
    All,
    Prefix(String),
    Exact(String),
}

impl TopicFilter {
    /// Parse a filter pattern.  `"*"` matches everything, a trailing `:*`
    /// matches the prefix before it, anything else matches exactly.
    pub fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            TopicFilter::All
        } else if let Some(prefix) = pattern.strip_suffix(":*") {
            TopicFilter::Prefix(format!("{prefix}:"))
        } else {
            TopicFilter::Exact(pattern.to_string())
        }
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicFilter::All => true,
            TopicFilter::Prefix(prefix) => topic.starts_with(prefix.as_str()),
            TopicFilter::Exact(exact) => topic == exact,
        }
    }
}

/// A filtered receiver handle.
pub struct Subscription {
    rx: broadcast::Receiver<RelayEvent>,
    filter: TopicFilter,
}

impl Subscription {
    /// Receive the next event matching the filter.  Returns `None` once the
    /// bus is closed.  Lagged receivers skip ahead rather than erroring.
    pub async fn recv(&mut self) -> Option<RelayEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(&event.topic) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Shared broadcast bus.  Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RelayEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Broadcast an event.  Fire-and-forget: a bus with no subscribers
    /// silently drops the event.
    pub fn emit(&self, topic: &str, data: Value) {
        let _ = self.tx.send(RelayEvent::new(topic, data));
    }

    /// Subscribe with a filter pattern (`"relay:sent"`, `"buffer:*"`, `"*"`).
    pub fn subscribe(&self, pattern: &str) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            filter: TopicFilter::parse(pattern),
        }
    }
}

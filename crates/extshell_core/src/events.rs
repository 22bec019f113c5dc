//! Typed lifecycle event channel.
//!
//! # Responsibility
//! - Publish registry, loader and cache lifecycle events to any number of
//!   in-process subscribers.
//!
//! # Invariants
//! - Emitting never blocks and never fails; events sent while nobody is
//!   subscribed are dropped.
//! - Every event is mirrored to the `log` facade at debug level.

use log::debug;
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Default per-subscriber buffer before lagging receivers drop events.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Lifecycle event category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Registered,
    Updated,
    Removed,
    Loading,
    Loaded,
    Failed,
    Evicted,
    Invalidated,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Updated => "updated",
            Self::Removed => "removed",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Failed => "failed",
            Self::Evicted => "evicted",
            Self::Invalidated => "invalidated",
        }
    }
}

/// One structured lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShellEvent {
    pub id: Uuid,
    pub kind: EventKind,
    /// Extension tag or asset key the event is about.
    pub subject: String,
    pub timestamp_ms: i64,
    pub detail: Option<String>,
}

/// Broadcast publisher shared by registry, loader and cache.
///
/// Cloning is cheap; all clones publish into the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ShellEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribes to events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ShellEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn emit(&self, kind: EventKind, subject: &str, detail: Option<String>) {
        let event = ShellEvent {
            id: Uuid::new_v4(),
            kind,
            subject: subject.to_string(),
            timestamp_ms: now_epoch_ms(),
            detail,
        };
        debug!(
            "event=shell_event module=events kind={} subject={} detail={}",
            kind.as_str(),
            event.subject,
            event.detail.as_deref().unwrap_or("-")
        );
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

pub(crate) fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::{EventBus, EventKind};

    #[test]
    fn emit_without_subscribers_is_a_no_op() {
        let bus = EventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit(EventKind::Loaded, "ui.sidebar", None);
    }

    #[test]
    fn subscribers_receive_events_in_emit_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(EventKind::Loading, "ui.sidebar", None);
        bus.emit(EventKind::Failed, "ui.sidebar", Some("boom".to_string()));

        let first = rx.try_recv().expect("first event");
        let second = rx.try_recv().expect("second event");
        assert_eq!(first.kind, EventKind::Loading);
        assert_eq!(second.kind, EventKind::Failed);
        assert_eq!(second.detail.as_deref(), Some("boom"));
        assert_ne!(first.id, second.id);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(EventKind::Registered.as_str(), "registered");
        assert_eq!(EventKind::Invalidated.as_str(), "invalidated");
    }
}

//! Event system for status notifications
//!
//! This module provides the event bus the core writes human-readable status
//! to, plus the running log view fed from it.

pub mod types;

pub use types::{ChannelInfo, SessionEvent, StatusEvent};

use parking_lot::RwLock;
use std::collections::VecDeque;
use tokio::sync::broadcast;
use tracing::info;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lines kept by [`StatusLog`]
const STATUS_LOG_CAPACITY: usize = 1000;

/// Event bus for broadcasting status events
///
/// Events are delivered to all active subscribers. A subscriber that falls
/// too far behind receives a `Lagged` error and misses some events.
pub struct EventBus {
    tx: broadcast::Sender<StatusEvent>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// If there are no active subscribers, the event is silently dropped.
    pub fn publish(&self, event: StatusEvent) {
        let _ = self.tx.send(event);
    }

    /// Set the signaling connection label
    pub fn signal_status(&self, text: impl Into<String>) {
        let text = text.into();
        info!("{}", text);
        self.publish(StatusEvent::signal(text));
    }

    /// Append a line to the log view
    pub fn log(&self, line: impl Into<String>) {
        let line = line.into();
        info!("{}", line);
        self.publish(StatusEvent::line(line));
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Accumulated status for display: the signal label and the log text
#[derive(Default)]
pub struct StatusLog {
    signal: RwLock<String>,
    lines: RwLock<VecDeque<String>>,
}

impl StatusLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, event: &StatusEvent) {
        match event {
            StatusEvent::SignalStatus { text } => *self.signal.write() = text.clone(),
            StatusEvent::LogLine { line, .. } => {
                let mut lines = self.lines.write();
                if lines.len() >= STATUS_LOG_CAPACITY {
                    lines.pop_front();
                }
                lines.push_back(line.clone());
            }
        }
    }

    pub fn signal(&self) -> String {
        self.signal.read().clone()
    }

    /// Log text, one line per entry
    pub fn text(&self) -> String {
        let lines = self.lines.read();
        let mut text = String::new();
        for line in lines.iter() {
            text.push_str(line);
            text.push('\n');
        }
        text
    }

    pub fn len(&self) -> usize {
        self.lines.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.signal_status("Signaling Server: Connected");

        let event = rx.recv().await.unwrap();
        assert_eq!(event, StatusEvent::signal("Signaling Server: Connected"));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.subscriber_count(), 2);

        bus.log("Send channel open.");

        let event1 = rx1.recv().await.unwrap();
        let event2 = rx2.recv().await.unwrap();

        assert!(matches!(event1, StatusEvent::LogLine { .. }));
        assert!(matches!(event2, StatusEvent::LogLine { .. }));
    }

    #[test]
    fn test_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);

        // Should not panic when publishing with no subscribers
        bus.log("nobody listening");
    }

    #[test]
    fn test_status_log_accumulates() {
        let log = StatusLog::new();
        assert!(log.is_empty());

        log.apply(&StatusEvent::signal("Signaling Server: Disconnected"));
        log.apply(&StatusEvent::line("first"));
        log.apply(&StatusEvent::line("second"));

        assert_eq!(log.signal(), "Signaling Server: Disconnected");
        assert_eq!(log.len(), 2);
        assert_eq!(log.text(), "first\nsecond\n");
    }

    #[test]
    fn test_status_log_drops_oldest_when_full() {
        let log = StatusLog::new();
        for i in 0..STATUS_LOG_CAPACITY + 5 {
            log.apply(&StatusEvent::line(format!("line {}", i)));
        }

        assert_eq!(log.len(), STATUS_LOG_CAPACITY);
        let text = log.text();
        assert!(text.starts_with("line 5\n"));
        assert!(text.ends_with(&format!("line {}\n", STATUS_LOG_CAPACITY + 4)));
    }
}

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Local};
use tracing::{info, warn};

/// One processed-frame record drained from a session.
#[derive(Debug, Clone)]
pub struct RelayEvent {
    pub at: DateTime<Local>,
    pub session: String,
    pub detail: String,
}

impl RelayEvent {
    pub fn now(session: String, detail: String) -> Self {
        Self {
            at: Local::now(),
            session,
            detail,
        }
    }
}

/// Bounded multi-producer event queue with a single draining consumer.
///
/// Producers never block: on overflow the oldest entry is dropped and
/// the drop is counted, so a stalled consumer degrades observability
/// instead of the hot path.
pub struct EventSink {
    queue: Mutex<VecDeque<RelayEvent>>,
    dropped: AtomicU64,
    capacity: usize,
}

impl EventSink {
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            dropped: AtomicU64::new(0),
            capacity,
        }
    }

    pub fn push(&self, event: RelayEvent) {
        let mut queue = match self.queue.lock() {
            Ok(q) => q,
            Err(poisoned) => poisoned.into_inner(),
        };
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(event);
    }

    pub fn drain(&self) -> Vec<RelayEvent> {
        let mut queue = match self.queue.lock() {
            Ok(q) => q,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.drain(..).collect()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.swap(0, Ordering::Relaxed)
    }

    /// Periodically drain events into the tracing sink.
    pub fn spawn_drain(self: Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                for event in self.drain() {
                    info!(
                        target: "relay_events",
                        "[{}] session={} {}",
                        event.at.format("%H:%M:%S%.3f"),
                        event.session,
                        event.detail
                    );
                }
                let dropped = self.dropped_count();
                if dropped > 0 {
                    warn!(target: "relay_events", "event sink overflow: {} dropped", dropped);
                }
            }
        })
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_drain_preserve_order() {
        let sink = EventSink::new(8);
        sink.push(RelayEvent::now("s1".into(), "first".into()));
        sink.push(RelayEvent::now("s1".into(), "second".into()));

        let events = sink.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].detail, "first");
        assert_eq!(events[1].detail, "second");
        assert!(sink.drain().is_empty());
    }

    #[test]
    fn test_overflow_drops_oldest_and_counts() {
        let sink = EventSink::new(2);
        for i in 0..5 {
            sink.push(RelayEvent::now("s".into(), format!("e{i}")));
        }
        let events = sink.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].detail, "e3");
        assert_eq!(events[1].detail, "e4");
        assert_eq!(sink.dropped_count(), 3);
        // Counter resets after the read.
        assert_eq!(sink.dropped_count(), 0);
    }
}

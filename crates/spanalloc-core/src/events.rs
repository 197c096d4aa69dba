//! Structured lifecycle events.
//!
//! The allocator records its decisions into a capped in-memory ring rather
//! than a log sink: callers drain the ring and forward records wherever
//! they want (tests assert on them, harnesses serialize them). Capacity 0
//! disables recording entirely.

use std::collections::VecDeque;

use serde::Serialize;

/// Severity of a lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventLevel {
    Trace,
    Info,
    Warn,
}

/// One allocator decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocatorEvent {
    /// Monotonic sequence number, never reused even when the ring wraps.
    pub seq: u64,
    pub level: EventLevel,
    /// Operation (`"allocate"`, `"reallocate"`, `"free"`).
    pub op: &'static str,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    /// Block address involved, when one exists.
    pub addr: Option<usize>,
    /// User-requested size involved.
    pub size: Option<usize>,
    /// Size-class index (`None` for large or non-classified events).
    pub class: Option<usize>,
}

/// Capped ring of lifecycle events.
#[derive(Debug)]
pub struct EventLog {
    events: VecDeque<AllocatorEvent>,
    capacity: usize,
    next_seq: u64,
}

impl EventLog {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
            next_seq: 1,
        }
    }

    pub fn record(
        &mut self,
        level: EventLevel,
        op: &'static str,
        outcome: &'static str,
        addr: Option<usize>,
        size: Option<usize>,
        class: Option<usize>,
    ) {
        if self.capacity == 0 {
            return;
        }
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.events.push_back(AllocatorEvent {
            seq,
            level,
            op,
            outcome,
            addr,
            size,
            class,
        });
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AllocatorEvent> {
        self.events.iter()
    }

    /// Remove and return all buffered events.
    pub fn drain(&mut self) -> Vec<AllocatorEvent> {
        self.events.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_drops_oldest_at_capacity() {
        let mut log = EventLog::new(2);
        log.record(EventLevel::Trace, "allocate", "success", Some(0x10), Some(16), Some(0));
        log.record(EventLevel::Trace, "allocate", "success", Some(0x20), Some(16), Some(0));
        log.record(EventLevel::Warn, "free", "double_free", Some(0x10), None, None);
        let events = log.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq, 2);
        assert_eq!(events[1].outcome, "double_free");
        assert!(log.is_empty());
    }

    #[test]
    fn capacity_zero_disables_recording() {
        let mut log = EventLog::new(0);
        log.record(EventLevel::Trace, "allocate", "success", None, None, None);
        assert!(log.is_empty());
    }

    #[test]
    fn events_serialize_to_json() {
        let mut log = EventLog::new(4);
        log.record(EventLevel::Warn, "free", "foreign_free", Some(0xBEEF), None, None);
        let events = log.drain();
        let json = serde_json::to_value(&events).unwrap();
        assert_eq!(json[0]["outcome"], "foreign_free");
        assert_eq!(json[0]["level"], "Warn");
    }
}

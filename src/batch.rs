//! Event batcher: coalesces locally originated mutations within one
//! scheduling tick into a single outbound message.
//!
//! Continuous dragging produces a mutation per pointer sample; batching
//! bounds the message rate to one frame per tick. The batcher itself is
//! synchronous — the role actor owns the actual timer and flushes when it
//! fires.
//!
//! ```text
//! move intent ──► record() ──┐ first event arms a flush tick (~1ms)
//! move intent ──► record() ──┤
//!                            ▼
//!                  flush() ──► apply locally + role.send(batch, None)
//! ```

use std::time::Duration;

use crate::protocol::Event;

/// Debounce window between the first recorded event and its flush: the
/// shortest delay the timer wheel will schedule.
pub const FLUSH_TICK: Duration = Duration::from_millis(1);

/// Ordered accumulator for locally originated events.
#[derive(Debug, Default)]
pub struct EventBatcher {
    pending: Vec<Event>,
}

impl EventBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event to the pending batch.
    ///
    /// Returns `true` when the batch was empty before this call — exactly
    /// one flush must then be scheduled for the next tick. Later records
    /// ride along on the already-armed flush.
    pub fn record(&mut self, event: Event) -> bool {
        let was_empty = self.pending.is_empty();
        self.pending.push(event);
        was_empty
    }

    /// Take ownership of the pending batch, leaving it empty.
    ///
    /// Safe to call with nothing pending (returns an empty vec).
    pub fn flush(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.pending)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn move_event(object: u32, x: f32) -> Event {
        Event::Move {
            object,
            x,
            y: 0.0,
            state: 0,
            owner: None,
        }
    }

    #[test]
    fn test_first_record_requests_flush() {
        let mut batcher = EventBatcher::new();

        assert!(batcher.record(move_event(1, 0.0)));
        // Batch non-empty now — no second schedule.
        assert!(!batcher.record(move_event(1, 1.0)));
        assert!(!batcher.record(move_event(2, 2.0)));
        assert_eq!(batcher.len(), 3);
    }

    #[test]
    fn test_flush_preserves_recording_order() {
        let mut batcher = EventBatcher::new();

        batcher.record(move_event(1, 0.0));
        batcher.record(move_event(2, 1.0));
        batcher.record(move_event(1, 2.0));

        let batch = batcher.flush();
        assert_eq!(
            batch,
            vec![move_event(1, 0.0), move_event(2, 1.0), move_event(1, 2.0)]
        );
    }

    #[test]
    fn test_flush_resets_batch() {
        let mut batcher = EventBatcher::new();

        batcher.record(move_event(1, 0.0));
        let _ = batcher.flush();

        assert!(batcher.is_empty());
        // The boundary passed; the next record starts a new batch and
        // must request a fresh flush.
        assert!(batcher.record(move_event(1, 1.0)));
        assert_eq!(batcher.flush(), vec![move_event(1, 1.0)]);
    }

    #[test]
    fn test_empty_flush_is_noop() {
        let mut batcher = EventBatcher::new();
        assert!(batcher.flush().is_empty());
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_membership_events_batch_too() {
        let mut batcher = EventBatcher::new();
        let peer = uuid::Uuid::new_v4();

        batcher.record(Event::User {
            peer,
            name: "Alice".into(),
        });
        batcher.record(move_event(1, 0.0));
        batcher.record(Event::Gone { peer });

        let batch = batcher.flush();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].subject(), Some(peer));
        assert_eq!(batch[2], Event::Gone { peer });
    }
}

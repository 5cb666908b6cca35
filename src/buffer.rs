//! Buffer module for holding log events until they are delivered.
//!
//! The buffer is a bounded FIFO shared between producers (which enqueue
//! synchronously) and the uploader (which snapshots batches and acknowledges
//! them once the service has accepted them). Every event is tagged with a
//! monotonically increasing position so an acknowledgement removes exactly the
//! events that were sent, even when more arrived while the send was in flight.

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, warn};

use crate::event::LogEvent;

/// Default maximum number of events held in the buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 10_000;

/// Maximum number of events in a single `PutLogEvents` call.
pub const MAX_BATCH_EVENTS: usize = 10_000;

/// Maximum billed size of a single `PutLogEvents` call.
pub const MAX_BATCH_BYTES: usize = 1_048_576;

/// What to do with a new event when the buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the oldest queued event to make room
    #[default]
    DropOldest,

    /// Refuse the new event
    Reject,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop-oldest" | "drop_oldest" => Ok(OverflowPolicy::DropOldest),
            "reject" => Ok(OverflowPolicy::Reject),
            other => Err(format!("unknown overflow policy '{}'", other)),
        }
    }
}

impl std::fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverflowPolicy::DropOldest => write!(f, "drop-oldest"),
            OverflowPolicy::Reject => write!(f, "reject"),
        }
    }
}

/// Configuration for the log buffer.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Maximum number of events to hold in the buffer
    pub max_capacity: usize,

    /// Overflow behaviour once `max_capacity` is reached
    pub overflow_policy: OverflowPolicy,

    /// Maximum number of events taken into one batch
    pub max_batch_events: usize,

    /// Maximum billed bytes taken into one batch
    pub max_batch_bytes: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_capacity: DEFAULT_BUFFER_CAPACITY,
            overflow_policy: OverflowPolicy::default(),
            max_batch_events: MAX_BATCH_EVENTS,
            max_batch_bytes: MAX_BATCH_BYTES,
        }
    }
}

impl BufferConfig {
    /// Create a buffer config with the given capacity and overflow policy.
    pub fn new(max_capacity: usize, overflow_policy: OverflowPolicy) -> Self {
        Self {
            max_capacity,
            overflow_policy,
            ..Self::default()
        }
    }
}

/// Statistics about buffer operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Total number of events accepted into the buffer
    pub events_received: u64,

    /// Total number of events removed after the service accepted them
    pub events_delivered: u64,

    /// Total number of events evicted by the drop-oldest policy
    pub events_dropped: u64,

    /// Total number of events refused by the reject policy
    pub events_refused: u64,

    /// Number of batches kept for resend after a partial rejection
    pub batches_retained: u64,
}

/// Errors that can occur during buffer operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    /// The buffer is at capacity and the policy refuses new events
    #[error("Buffer is full ({capacity} events)")]
    Full { capacity: usize },
}

/// A batch cut from the front of the buffer.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Events in insertion order
    pub events: Vec<LogEvent>,

    /// Buffer position of the last event in the batch
    last_position: u64,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Bounded, insertion-ordered queue of pending log events.
#[derive(Debug)]
pub struct LogBuffer {
    events: VecDeque<(u64, LogEvent)>,
    next_position: u64,
    config: BufferConfig,
    stats: BufferStats,
}

/// Buffer handle shared between producers and the uploader.
pub type SharedBuffer = Arc<Mutex<LogBuffer>>;

/// Lock a shared buffer, recovering the contents if a holder panicked.
pub fn lock(buffer: &SharedBuffer) -> MutexGuard<'_, LogBuffer> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LogBuffer {
    /// Create a new log buffer with the given configuration.
    pub fn new(config: BufferConfig) -> Self {
        Self {
            events: VecDeque::new(),
            next_position: 0,
            config,
            stats: BufferStats::default(),
        }
    }

    /// Create a new log buffer with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(BufferConfig::default())
    }

    /// Wrap this buffer for sharing across tasks.
    pub fn shared(self) -> SharedBuffer {
        Arc::new(Mutex::new(self))
    }

    /// Append an event, applying the overflow policy when full.
    pub fn enqueue(&mut self, event: LogEvent) -> Result<(), BufferError> {
        if self.events.len() >= self.config.max_capacity {
            match self.config.overflow_policy {
                OverflowPolicy::Reject => {
                    self.stats.events_refused += 1;
                    return Err(BufferError::Full {
                        capacity: self.config.max_capacity,
                    });
                }
                OverflowPolicy::DropOldest => {
                    self.events.pop_front();
                    self.stats.events_dropped += 1;
                    if self.stats.events_dropped == 1 || self.stats.events_dropped % 1_000 == 0 {
                        warn!(
                            max_capacity = self.config.max_capacity,
                            events_dropped = self.stats.events_dropped,
                            "Buffer overflow: dropping oldest events"
                        );
                    }
                }
            }
        }

        self.events.push_back((self.next_position, event));
        self.next_position += 1;
        self.stats.events_received += 1;
        Ok(())
    }

    /// Current contents in insertion order, without mutating the buffer.
    pub fn snapshot(&self) -> Vec<LogEvent> {
        self.events.iter().map(|(_, event)| event.clone()).collect()
    }

    /// Cut the next batch from the front of the buffer without removing it.
    ///
    /// The batch holds as many leading events as fit the per-call quotas, and
    /// always at least one when the buffer is not empty.
    pub fn next_batch(&self) -> Option<Batch> {
        let mut events = Vec::new();
        let mut bytes = 0usize;
        let mut last_position = None;

        for (position, event) in &self.events {
            let size = event.billed_size();
            if !events.is_empty()
                && (events.len() >= self.config.max_batch_events
                    || bytes + size > self.config.max_batch_bytes)
            {
                break;
            }
            bytes += size;
            events.push(event.clone());
            last_position = Some(*position);
        }

        let last_position = last_position?;
        if events.len() < self.events.len() {
            debug!(
                batch_size = events.len(),
                queued = self.events.len(),
                batch_bytes = bytes,
                "Batch capped by service quota"
            );
        }
        Some(Batch {
            events,
            last_position,
        })
    }

    /// Remove the events of a batch the service fully accepted.
    ///
    /// Events enqueued after the batch was cut remain queued. Returns the
    /// number of events removed.
    pub fn acknowledge(&mut self, batch: &Batch) -> usize {
        let mut removed = 0;
        while let Some((position, _)) = self.events.front() {
            if *position > batch.last_position {
                break;
            }
            self.events.pop_front();
            removed += 1;
        }
        self.stats.events_delivered += removed as u64;
        removed
    }

    /// Record that a batch was kept for resend after a partial rejection.
    pub fn retain(&mut self, batch: &Batch) {
        self.stats.batches_retained += 1;
        debug!(
            batch_size = batch.len(),
            queued = self.events.len(),
            "Batch retained for resend"
        );
    }

    /// Get the current number of events in the buffer.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Get current buffer statistics.
    pub fn stats(&self) -> &BufferStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(n: usize) -> LogEvent {
        LogEvent::at(n as i64, format!("message {}", n))
    }

    fn messages(events: &[LogEvent]) -> Vec<String> {
        events.iter().map(|e| e.message.clone()).collect()
    }

    #[test]
    fn test_buffer_config_default() {
        let config = BufferConfig::default();
        assert_eq!(config.max_capacity, DEFAULT_BUFFER_CAPACITY);
        assert_eq!(config.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(config.max_batch_events, MAX_BATCH_EVENTS);
        assert_eq!(config.max_batch_bytes, MAX_BATCH_BYTES);
    }

    #[test]
    fn test_overflow_policy_parse() {
        assert_eq!("drop-oldest".parse::<OverflowPolicy>(), Ok(OverflowPolicy::DropOldest));
        assert_eq!("REJECT".parse::<OverflowPolicy>(), Ok(OverflowPolicy::Reject));
        assert!("sometimes".parse::<OverflowPolicy>().is_err());
    }

    #[test]
    fn test_enqueue_preserves_order() {
        let mut buffer = LogBuffer::with_defaults();
        for i in 0..5 {
            buffer.enqueue(event(i)).unwrap();
        }

        assert_eq!(buffer.len(), 5);
        assert_eq!(
            messages(&buffer.snapshot()),
            vec!["message 0", "message 1", "message 2", "message 3", "message 4"]
        );
    }

    #[test]
    fn test_snapshot_does_not_mutate() {
        let mut buffer = LogBuffer::with_defaults();
        buffer.enqueue(event(1)).unwrap();

        let _ = buffer.snapshot();
        let _ = buffer.next_batch();
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_acknowledge_keeps_late_arrivals() {
        let mut buffer = LogBuffer::with_defaults();
        buffer.enqueue(event(0)).unwrap();
        buffer.enqueue(event(1)).unwrap();

        let batch = buffer.next_batch().unwrap();
        // Arrives while the batch is in flight
        buffer.enqueue(event(2)).unwrap();

        assert_eq!(buffer.acknowledge(&batch), 2);
        assert_eq!(messages(&buffer.snapshot()), vec!["message 2"]);
        assert_eq!(buffer.stats().events_delivered, 2);
    }

    #[test]
    fn test_acknowledge_after_eviction() {
        let mut buffer = LogBuffer::new(BufferConfig::new(2, OverflowPolicy::DropOldest));
        buffer.enqueue(event(0)).unwrap();
        buffer.enqueue(event(1)).unwrap();

        let batch = buffer.next_batch().unwrap();
        buffer.enqueue(event(2)).unwrap(); // evicts event 0

        assert_eq!(buffer.acknowledge(&batch), 1);
        assert_eq!(messages(&buffer.snapshot()), vec!["message 2"]);
    }

    #[test]
    fn test_drop_oldest_policy() {
        let mut buffer = LogBuffer::new(BufferConfig::new(3, OverflowPolicy::DropOldest));
        for i in 0..5 {
            buffer.enqueue(event(i)).unwrap();
        }

        assert_eq!(buffer.len(), 3);
        assert_eq!(
            messages(&buffer.snapshot()),
            vec!["message 2", "message 3", "message 4"]
        );
        assert_eq!(buffer.stats().events_dropped, 2);
        assert_eq!(buffer.stats().events_received, 5);
    }

    #[test]
    fn test_reject_policy() {
        let mut buffer = LogBuffer::new(BufferConfig::new(2, OverflowPolicy::Reject));
        buffer.enqueue(event(0)).unwrap();
        buffer.enqueue(event(1)).unwrap();

        let result = buffer.enqueue(event(2));
        assert_eq!(result, Err(BufferError::Full { capacity: 2 }));
        assert_eq!(messages(&buffer.snapshot()), vec!["message 0", "message 1"]);
        assert_eq!(buffer.stats().events_refused, 1);
    }

    #[test]
    fn test_batch_capped_by_event_count() {
        let config = BufferConfig {
            max_batch_events: 3,
            ..BufferConfig::default()
        };
        let mut buffer = LogBuffer::new(config);
        for i in 0..7 {
            buffer.enqueue(event(i)).unwrap();
        }

        let batch = buffer.next_batch().unwrap();
        assert_eq!(batch.len(), 3);
        buffer.acknowledge(&batch);

        let batch = buffer.next_batch().unwrap();
        assert_eq!(messages(&batch.events), vec!["message 3", "message 4", "message 5"]);
    }

    #[test]
    fn test_batch_capped_by_bytes() {
        let config = BufferConfig {
            max_batch_bytes: 2 * (9 + crate::event::EVENT_OVERHEAD_BYTES),
            ..BufferConfig::default()
        };
        let mut buffer = LogBuffer::new(config);
        for i in 0..4 {
            buffer.enqueue(event(i)).unwrap(); // "message N" is 9 bytes
        }

        assert_eq!(buffer.next_batch().unwrap().len(), 2);
    }

    #[test]
    fn test_oversized_event_still_batched() {
        let config = BufferConfig {
            max_batch_bytes: 10,
            ..BufferConfig::default()
        };
        let mut buffer = LogBuffer::new(config);
        buffer.enqueue(LogEvent::at(0, "x".repeat(100))).unwrap();

        assert_eq!(buffer.next_batch().unwrap().len(), 1);
    }

    #[test]
    fn test_empty_buffer_has_no_batch() {
        let buffer = LogBuffer::with_defaults();
        assert!(buffer.next_batch().is_none());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_retain_counts_batches() {
        let mut buffer = LogBuffer::with_defaults();
        buffer.enqueue(event(0)).unwrap();
        let batch = buffer.next_batch().unwrap();

        buffer.retain(&batch);
        assert_eq!(buffer.stats().batches_retained, 1);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_buffer_error_display() {
        assert_eq!(
            format!("{}", BufferError::Full { capacity: 10 }),
            "Buffer is full (10 events)"
        );
    }
}

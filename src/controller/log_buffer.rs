//! Bounded in-memory ring of log lines waiting to be shipped.
//!
//! When full, the oldest line is dropped and counted. The buffer is the only
//! state shared between the output readers and the flusher; the lock is held
//! only for a push or a drain.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::Utc;

use crate::messages::{proto, timestamp_from_datetime};

pub const DEFAULT_LOG_BUFFER_SIZE: usize = 10_000;

struct Ring {
    lines: VecDeque<proto::LogMessage>,
    dropped: u64,
}

pub struct LogBuffer {
    capacity: usize,
    inner: Mutex<Ring>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Ring {
                lines: VecDeque::with_capacity(capacity.min(DEFAULT_LOG_BUFFER_SIZE)),
                dropped: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append one line. Returns true if the oldest line was dropped to make room.
    pub fn push(&self, message: proto::LogMessage) -> bool {
        let mut ring = self.inner.lock().expect("log buffer poisoned");
        let dropped = if ring.lines.len() >= self.capacity {
            ring.lines.pop_front();
            ring.dropped += 1;
            true
        } else {
            false
        };
        ring.lines.push_back(message);
        dropped
    }

    /// Stamp and append a line.
    pub fn push_line(&self, source: &str, io_type: proto::IoType, text: impl Into<String>) -> bool {
        self.push(proto::LogMessage {
            source: source.to_string(),
            time: Some(timestamp_from_datetime(Utc::now())),
            text: text.into(),
            io_type: io_type as i32,
        })
    }

    /// Take every buffered line, oldest first.
    pub fn drain(&self) -> Vec<proto::LogMessage> {
        let mut ring = self.inner.lock().expect("log buffer poisoned");
        ring.lines.drain(..).collect()
    }

    /// Put an unsent batch back ahead of anything pushed since it was drained.
    ///
    /// If that overflows the ring, the oldest lines of the batch are dropped.
    pub fn push_front_batch(&self, batch: Vec<proto::LogMessage>) {
        let mut ring = self.inner.lock().expect("log buffer poisoned");
        let room = self.capacity.saturating_sub(ring.lines.len());
        let skip = batch.len().saturating_sub(room);
        ring.dropped += skip as u64;
        for message in batch.into_iter().skip(skip).rev() {
            ring.lines.push_front(message);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("log buffer poisoned").lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lines dropped because the ring was full.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().expect("log buffer poisoned").dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(lines: &[proto::LogMessage]) -> Vec<&str> {
        lines.iter().map(|line| line.text.as_str()).collect()
    }

    #[test]
    fn test_full_ring_drops_oldest() {
        let buffer = LogBuffer::new(3);
        for i in 0..5 {
            buffer.push_line("task", proto::IoType::Stdout, format!("line {i}"));
        }
        assert_eq!(buffer.dropped(), 2);
        assert_eq!(texts(&buffer.drain()), vec!["line 2", "line 3", "line 4"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_drain_preserves_order() {
        let buffer = LogBuffer::new(DEFAULT_LOG_BUFFER_SIZE);
        buffer.push_line("task", proto::IoType::Stdout, "a");
        buffer.push_line("task", proto::IoType::Stderr, "b");
        buffer.push_line("task", proto::IoType::OsmoCtrl, "c");
        assert_eq!(texts(&buffer.drain()), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_failed_batch_goes_back_to_front() {
        let buffer = LogBuffer::new(10);
        buffer.push_line("task", proto::IoType::Stdout, "a");
        buffer.push_line("task", proto::IoType::Stdout, "b");
        let batch = buffer.drain();
        buffer.push_line("task", proto::IoType::Stdout, "c");
        buffer.push_front_batch(batch);
        assert_eq!(texts(&buffer.drain()), vec!["a", "b", "c"]);
        assert_eq!(buffer.dropped(), 0);
    }

    #[test]
    fn test_requeue_overflow_drops_oldest_of_batch() {
        let buffer = LogBuffer::new(3);
        for text in ["a", "b", "c"] {
            buffer.push_line("task", proto::IoType::Stdout, text);
        }
        let batch = buffer.drain();
        buffer.push_line("task", proto::IoType::Stdout, "d");
        buffer.push_front_batch(batch);
        assert_eq!(texts(&buffer.drain()), vec!["b", "c", "d"]);
        assert_eq!(buffer.dropped(), 1);
    }
}

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// A single JPEG-encoded preview frame.
#[derive(Debug, Clone)]
pub struct PreviewFrame {
    pub data: Vec<u8>,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

/// Single-slot holder for the most recent preview frame.
///
/// Drop-old, keep-newest: a publish overwrites whatever is in the slot,
/// read or not. This is deliberately not a queue: the preview branch only
/// ever needs the latest frame and must never backpressure the pipeline.
pub struct PreviewSlot {
    frame: Mutex<Option<PreviewFrame>>,
    sequence: AtomicU64,
}

impl PreviewSlot {
    pub fn new() -> Self {
        Self {
            frame: Mutex::new(None),
            sequence: AtomicU64::new(0),
        }
    }

    /// Overwrite the slot with a new frame. Called from the pipeline's
    /// sample callback, so it must stay cheap and never block for long.
    pub fn publish(&self, data: Vec<u8>) {
        let frame = PreviewFrame {
            data,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
        };
        *self.frame.lock() = Some(frame);
    }

    /// Copy out the latest frame, or `None` before the first publish.
    pub fn latest(&self) -> Option<PreviewFrame> {
        self.frame.lock().clone()
    }
}

impl Default for PreviewSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_slot_returns_none() {
        let slot = PreviewSlot::new();
        assert!(slot.latest().is_none());
    }

    #[test]
    fn test_publish_overwrites_unread_frame() {
        let slot = PreviewSlot::new();
        slot.publish(vec![1]);
        slot.publish(vec![2]);
        slot.publish(vec![3]);

        let frame = slot.latest().unwrap();
        assert_eq!(frame.data, vec![3]);
        assert_eq!(frame.sequence, 2);
    }

    #[test]
    fn test_latest_is_non_destructive() {
        let slot = PreviewSlot::new();
        slot.publish(vec![7; 16]);
        assert!(slot.latest().is_some());
        assert!(slot.latest().is_some());
    }
}

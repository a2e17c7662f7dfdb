//! Producer-side flow control.
//!
//! Tracks the bytes a stream producer has sent but the peer has not yet
//! acknowledged. When outstanding bytes reach the configured cap the
//! producer pauses; acknowledgements that bring outstanding back under the
//! cap resume it.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

/// Flow-control state of a [`BufferLog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferLogState {
    /// Flow control is not in use (cap of zero).
    Disabled,
    /// Some space is available; n bytes can always be inserted even with
    /// only n-1 bytes spare.
    SpaceAvailable,
    /// Outstanding bytes have reached or passed the cap.
    Full,
}

#[derive(Debug, Default)]
struct BufferLogInner {
    max_bytes: usize,
    bytes_outstanding: usize,
    acked_bytes: usize,
}

impl BufferLogInner {
    fn is_enabled(&self) -> bool {
        self.max_bytes != 0
    }

    fn is_full(&self) -> bool {
        self.bytes_outstanding >= self.max_bytes
    }

    fn state(&self) -> BufferLogState {
        if !self.is_enabled() {
            BufferLogState::Disabled
        } else if self.is_full() {
            BufferLogState::Full
        } else {
            BufferLogState::SpaceAvailable
        }
    }
}

/// Per-connection outstanding-bytes tracker.
#[derive(Debug, Default)]
pub struct BufferLog {
    inner: Mutex<BufferLogInner>,
    paused: AtomicBool,
}

impl BufferLog {
    /// Create a disabled buffer log (no flow control).
    pub fn new() -> Self {
        BufferLog::default()
    }

    /// Change the cap. Zero disables flow control and clears the pause.
    pub fn set_buffer_size(&self, max_bytes: usize) {
        let mut inner = self.inner.lock();
        inner.max_bytes = max_bytes;
        inner.acked_bytes = 0;
        if !inner.is_enabled() || !inner.is_full() {
            self.paused.store(false, Ordering::Release);
        }
    }

    /// Insert `bytes` into the log.
    ///
    /// Returns `false` when the log is already full; the bytes are counted
    /// otherwise. A disabled log accepts everything without accounting.
    pub fn insert(&self, bytes: usize) -> bool {
        let mut inner = self.inner.lock();
        if !inner.is_enabled() {
            return true;
        }
        if inner.is_full() {
            return false;
        }
        inner.bytes_outstanding += bytes;
        true
    }

    /// Acknowledge `bytes` and resume the producer if space opened up.
    pub fn acknowledge(&self, bytes: usize) {
        let mut inner = self.inner.lock();
        inner.bytes_outstanding = inner.bytes_outstanding.saturating_sub(bytes);
        inner.acked_bytes = inner.acked_bytes.saturating_add(bytes);
        if !inner.is_enabled() || !inner.is_full() {
            self.paused.store(false, Ordering::Release);
        }
    }

    /// Pause the producer if the log is full.
    ///
    /// Returns `true` when the producer is now paused.
    pub fn pause_if_full(&self) -> bool {
        let inner = self.inner.lock();
        if inner.is_enabled() && inner.is_full() {
            self.paused.store(true, Ordering::Release);
            return true;
        }
        false
    }

    /// Resume the producer if there is space (or flow control is disabled).
    pub fn unpause_if_space_available(&self) {
        let inner = self.inner.lock();
        if !inner.is_enabled() || !inner.is_full() {
            self.paused.store(false, Ordering::Release);
        }
    }

    /// True while the producer is paused on a full log.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Current flow-control state.
    pub fn state(&self) -> BufferLogState {
        self.inner.lock().state()
    }

    /// Bytes sent but not yet acknowledged.
    pub fn bytes_outstanding(&self) -> usize {
        self.inner.lock().bytes_outstanding
    }

    /// Total bytes acknowledged since the cap was last changed.
    pub fn acked_bytes(&self) -> usize {
        self.inner.lock().acked_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_accepts_everything() {
        let log = BufferLog::new();
        assert_eq!(log.state(), BufferLogState::Disabled);
        assert!(log.insert(1 << 30));
        assert_eq!(log.bytes_outstanding(), 0);
        assert!(!log.pause_if_full());
    }

    #[test]
    fn test_fills_and_pauses() {
        let log = BufferLog::new();
        log.set_buffer_size(100);
        assert_eq!(log.state(), BufferLogState::SpaceAvailable);

        // n bytes fit even with n-1 spare.
        assert!(log.insert(60));
        assert!(log.insert(60));
        assert_eq!(log.state(), BufferLogState::Full);
        assert!(log.pause_if_full());
        assert!(log.is_paused());

        // Further inserts are refused while full.
        assert!(!log.insert(1));
        assert_eq!(log.bytes_outstanding(), 120);
    }

    #[test]
    fn test_acknowledge_resumes() {
        let log = BufferLog::new();
        log.set_buffer_size(100);
        log.insert(120);
        log.pause_if_full();

        log.acknowledge(30);
        assert_eq!(log.state(), BufferLogState::SpaceAvailable);
        assert!(!log.is_paused());
        assert_eq!(log.bytes_outstanding(), 90);
        assert_eq!(log.acked_bytes(), 30);
        assert!(log.insert(10));
    }

    #[test]
    fn test_ack_below_outstanding_keeps_full() {
        let log = BufferLog::new();
        log.set_buffer_size(100);
        log.insert(99);
        log.insert(99);
        log.pause_if_full();
        // Still at or over the cap after a small ack.
        log.acknowledge(50);
        assert_eq!(log.state(), BufferLogState::Full);
        assert!(log.is_paused());
    }

    #[test]
    fn test_resize_to_zero_disables() {
        let log = BufferLog::new();
        log.set_buffer_size(10);
        log.insert(20);
        log.pause_if_full();
        log.set_buffer_size(0);
        assert_eq!(log.state(), BufferLogState::Disabled);
        assert!(!log.is_paused());
        assert!(log.insert(1000));
    }

    #[test]
    fn test_acked_bytes_reset_on_resize() {
        let log = BufferLog::new();
        log.set_buffer_size(100);
        log.insert(50);
        log.acknowledge(50);
        assert_eq!(log.acked_bytes(), 50);
        log.set_buffer_size(200);
        assert_eq!(log.acked_bytes(), 0);
    }
}

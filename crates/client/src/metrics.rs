//! Client metrics
//!
//! Cheap atomic counters incremented on the hot paths, read through a
//! point-in-time snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one client instance
#[derive(Debug, Default)]
pub struct ClientMetrics {
    /// Data frames decoded
    pub frames_received: AtomicU64,

    /// Schema (handshake) frames decoded
    pub schema_frames: AtomicU64,

    /// Rows handed to subscription queues
    pub rows_delivered: AtomicU64,

    /// Streams that failed and were handed to the reconnect controller
    pub streams_failed: AtomicU64,

    /// Re-subscribe attempts made by the reconnect controller
    pub resub_attempts: AtomicU64,

    /// Re-subscribes that succeeded
    pub resub_successes: AtomicU64,
}

impl ClientMetrics {
    pub const fn new() -> Self {
        Self {
            frames_received: AtomicU64::new(0),
            schema_frames: AtomicU64::new(0),
            rows_delivered: AtomicU64::new(0),
            streams_failed: AtomicU64::new(0),
            resub_attempts: AtomicU64::new(0),
            resub_successes: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn frame(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn schema_frame(&self) {
        self.schema_frames.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn rows(&self, count: u64) {
        self.rows_delivered.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn stream_failed(&self) {
        self.streams_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn resub_attempt(&self) {
        self.resub_attempts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn resub_success(&self) {
        self.resub_successes.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time snapshot
    pub fn snapshot(&self) -> ClientMetricsSnapshot {
        ClientMetricsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            schema_frames: self.schema_frames.load(Ordering::Relaxed),
            rows_delivered: self.rows_delivered.load(Ordering::Relaxed),
            streams_failed: self.streams_failed.load(Ordering::Relaxed),
            resub_attempts: self.resub_attempts.load(Ordering::Relaxed),
            resub_successes: self.resub_successes.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`ClientMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientMetricsSnapshot {
    pub frames_received: u64,
    pub schema_frames: u64,
    pub rows_delivered: u64,
    pub streams_failed: u64,
    pub resub_attempts: u64,
    pub resub_successes: u64,
}

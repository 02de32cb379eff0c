//! Pipeline counters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Point-in-time stats view
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub frames_processed: u64,
    /// Frames dropped because the detection worker was busy
    pub frames_dropped: u64,
    /// Detections returned by the engine, before rule filtering
    pub detections_total: u64,
    pub messages_sent: u64,
    pub notify_failures: u64,
    /// Frames whose processing panicked
    pub frames_failed: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_detection: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub(crate) struct StatsCounters {
    frames_processed: AtomicU64,
    frames_dropped: AtomicU64,
    detections_total: AtomicU64,
    messages_sent: AtomicU64,
    notify_failures: AtomicU64,
    frames_failed: AtomicU64,
    started_at: Mutex<Option<DateTime<Utc>>>,
    last_detection: Mutex<Option<DateTime<Utc>>>,
}

impl StatsCounters {
    pub(crate) fn frame_processed(&self) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_dropped(&self) -> u64 {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn detections(&self, count: usize) {
        self.detections_total
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn message_sent(&self, at: DateTime<Utc>) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        *self
            .last_detection
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(at);
    }

    pub(crate) fn notify_failed(&self) {
        self.notify_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_failed(&self) -> u64 {
        self.frames_failed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn mark_started(&self, at: DateTime<Utc>) {
        *self.started_at.lock().unwrap_or_else(|p| p.into_inner()) = Some(at);
    }

    pub(crate) fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            detections_total: self.detections_total.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            notify_failures: self.notify_failures.load(Ordering::Relaxed),
            frames_failed: self.frames_failed.load(Ordering::Relaxed),
            started_at: *self.started_at.lock().unwrap_or_else(|p| p.into_inner()),
            last_detection: *self.last_detection.lock().unwrap_or_else(|p| p.into_inner()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let counters = StatsCounters::default();
        counters.frame_processed();
        counters.frame_processed();
        counters.detections(3);
        assert_eq!(counters.frame_dropped(), 1);
        counters.notify_failed();
        assert_eq!(counters.frame_failed(), 1);
        let now = Utc::now();
        counters.message_sent(now);

        let stats = counters.snapshot();
        assert_eq!(stats.frames_processed, 2);
        assert_eq!(stats.detections_total, 3);
        assert_eq!(stats.frames_dropped, 1);
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.notify_failures, 1);
        assert_eq!(stats.frames_failed, 1);
        assert_eq!(stats.last_detection, Some(now));
        assert!(stats.started_at.is_none());
    }
}

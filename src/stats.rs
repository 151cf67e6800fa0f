//! Session statistics shared between the capture thread and the consumer.
//!
//! Plain atomic counters: the capture thread increments, the consumer reads.
//! `training_complete` is a one-shot signal consumed with a swap so the
//! notification is delivered exactly once.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::pipeline::Severity;

pub type SharedStats = Arc<SessionStats>;

#[derive(Debug, Default)]
pub struct SessionStats {
    pub packets_total: AtomicU64,
    pub normal: AtomicU64,
    pub anomalies: AtomicU64,
    pub dangers: AtomicU64,
    /// Packets dropped by the target-IP allow-list before emission.
    pub filtered_out: AtomicU64,
    /// Frames that could not be fully parsed.
    pub malformed: AtomicU64,
    /// Feature vectors observed while the model was still training.
    pub training_observed: AtomicU64,
    training_complete: AtomicBool,
}

impl SessionStats {
    pub fn new() -> SharedStats {
        Arc::new(Self::default())
    }

    pub fn record(&self, severity: Severity) {
        self.packets_total.fetch_add(1, Ordering::Relaxed);
        match severity {
            Severity::Normal => self.normal.fetch_add(1, Ordering::Relaxed),
            Severity::Anomaly => self.anomalies.fetch_add(1, Ordering::Relaxed),
            Severity::Danger => self.dangers.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn signal_training_complete(&self) {
        self.training_complete.store(true, Ordering::Release);
    }

    /// True exactly once after training completes.
    pub fn take_training_complete(&self) -> bool {
        self.training_complete.swap(false, Ordering::AcqRel)
    }

    /// Formats the end-of-session totals.
    pub fn summary(&self) -> String {
        format!(
            "{} packets ({} normal, {} anomalies, {} dangers), {} filtered out, {} malformed, {} used for training",
            self.packets_total.load(Ordering::Relaxed),
            self.normal.load(Ordering::Relaxed),
            self.anomalies.load(Ordering::Relaxed),
            self.dangers.load(Ordering::Relaxed),
            self.filtered_out.load(Ordering::Relaxed),
            self.malformed.load(Ordering::Relaxed),
            self.training_observed.load(Ordering::Relaxed),
        )
    }
}

//! Monotone counters owned by the coordinator, read without a lock.
//!
//! Grounded on the teacher's `memory_pool::PerformanceMonitor`: an atomic
//! counter bundle behind a `get_*_stats` snapshot method, minus the
//! packet-pool/SIMD-specific fields that had no counterpart in the session
//! statistics this spec defines.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// `DetectionStatistics` per spec §3: atomic counters, no mutex. Readers may
/// observe a stale but internally consistent snapshot (relaxed ordering
/// throughout, per spec §5).
pub struct DetectionStatistics {
    packets_captured: AtomicU64,
    packets_dropped: AtomicU64,
    features_extracted: AtomicU64,
    predictions_made: AtomicU64,
    threats_detected: AtomicU64,
    processing_errors: AtomicU64,
    queue_high_watermark: AtomicU64,
    started_at: Instant,
}

/// Immutable point-in-time copy, the payload of `EventSink::StatisticsSnapshot`.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct StatisticsSnapshot {
    pub packets_captured: u64,
    pub packets_dropped: u64,
    pub features_extracted: u64,
    pub predictions_made: u64,
    pub threats_detected: u64,
    pub processing_errors: u64,
    pub queue_high_watermark: u64,
    pub runtime_seconds: f64,
}

impl Default for DetectionStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectionStatistics {
    pub fn new() -> Self {
        DetectionStatistics {
            packets_captured: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            features_extracted: AtomicU64::new(0),
            predictions_made: AtomicU64::new(0),
            threats_detected: AtomicU64::new(0),
            processing_errors: AtomicU64::new(0),
            queue_high_watermark: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn record_packet_captured(&self) {
        self.packets_captured.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_packet_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_feature_extracted(&self) {
        self.features_extracted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_prediction_made(&self) {
        self.predictions_made.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_threat_detected(&self) {
        self.threats_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processing_error(&self) {
        self.processing_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Bumps the high-watermark to `observed` if it exceeds the current value.
    pub fn observe_queue_depth(&self, observed: u64) {
        let mut current = self.queue_high_watermark.load(Ordering::Relaxed);
        while observed > current {
            match self.queue_high_watermark.compare_exchange_weak(
                current,
                observed,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn processing_error_rate(&self) -> f64 {
        let errors = self.processing_errors.load(Ordering::Relaxed) as f64;
        let extracted = self.features_extracted.load(Ordering::Relaxed) as f64;
        if extracted == 0.0 {
            0.0
        } else {
            errors / extracted
        }
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            packets_captured: self.packets_captured.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            features_extracted: self.features_extracted.load(Ordering::Relaxed),
            predictions_made: self.predictions_made.load(Ordering::Relaxed),
            threats_detected: self.threats_detected.load(Ordering::Relaxed),
            processing_errors: self.processing_errors.load(Ordering::Relaxed),
            queue_high_watermark: self.queue_high_watermark.load(Ordering::Relaxed),
            runtime_seconds: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

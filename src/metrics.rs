// src/metrics.rs
//
// Process-wide rolling counters and gauges. Writers use relaxed atomics on
// the hot path; any observer may take a copy-out snapshot at any time and
// tolerate a few cycles of staleness.

use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

// ============================================================================
// Atomic float helpers
// ============================================================================

/// f32 gauge stored as its bit pattern in an AtomicU32.
#[derive(Debug, Default)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// f64 gauge stored as its bit pattern in an AtomicU64.
#[derive(Debug, Default)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

// ============================================================================
// Engine metrics
// ============================================================================

/// Shared counter block updated by the lanes.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub frame_id: AtomicU64,
    pub crack_frames: AtomicU64,
    pub yolo_count: AtomicU64,
    pub uplink_count: AtomicU64,
    pub latency_violations: AtomicU64,
    pub dropped_frames: AtomicU64,
    pub sig_updates: AtomicU64,

    pub last_crack: AtomicF32,
    pub fused_crack: AtomicF32,
    pub sig_conf: AtomicF32,
    pub crack_probability: AtomicF32,
    pub yolo_hz: AtomicF32,
    pub spike_bitrate_mbps: AtomicF32,
    pub window_crack_ratio: AtomicF32,
    pub global_crack_ratio: AtomicF32,
    pub avg_yolo_conf: AtomicF32,
    pub avg_crack_score: AtomicF32,
    pub avg_agreement: AtomicF32,
    pub yolo_conf_thr: AtomicF32,
    pub crack_alert_thr: AtomicF32,
    pub px_to_mm_scale: AtomicF32,
    pub vis_crack_width_mm: AtomicF32,
    pub vis_crack_length_mm: AtomicF32,

    pub last_yolo_stamp_s: AtomicF64,
}

impl EngineMetrics {
    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Read-only copy of the engine state, safe to hand to any observer.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub frame_id: u64,
    pub fps: f32,
    pub last_crack: f32,
    pub fused_crack: f32,
    pub sig_conf: f32,
    pub crack_probability: f32,
    pub crack_frames: u64,
    pub yolo_count: u64,
    pub uplink_count: u64,
    pub dropped_frames: u64,
    pub latency_violations: u64,
    pub latency_p50_ms: f32,
    pub latency_p95_ms: f32,
    pub latency_p99_ms: f32,
    pub yolo_hz: f32,
    pub yolo_age_ms: f32,
    pub yolo_conf_thr: f32,
    pub window_crack_ratio: f32,
    pub global_crack_ratio: f32,
    pub crack_alert_thr: f32,
    pub spike_bitrate_mbps: f32,
    pub avg_yolo_conf: f32,
    pub avg_crack_score: f32,
    pub avg_agreement: f32,
    pub px_to_mm_scale: f32,
    pub vis_crack_width_mm: f32,
    pub vis_crack_length_mm: f32,
}

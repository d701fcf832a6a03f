// src/types.rs

use serde::{Deserialize, Serialize};

// ============================================================================
// Control Action (byte-exact labels consumed by downstream controllers)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Clear,
    Caution,
    Slow,
    Stop,
}

impl Action {
    /// Map a fused crack score to an action label. Thresholds are strict,
    /// so a score sitting exactly on a boundary takes the lower label.
    pub fn from_score(fused_crack: f32) -> Self {
        if fused_crack > 0.70 {
            Action::Stop
        } else if fused_crack > 0.40 {
            Action::Slow
        } else if fused_crack > 0.10 {
            Action::Caution
        } else {
            Action::Clear
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Clear => "CLEAR",
            Action::Caution => "CAUTION",
            Action::Slow => "SLOW",
            Action::Stop => "STOP",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Failsafe status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FailsafeStatus {
    Ok,
    Warning,
    Critical,
}

impl FailsafeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailsafeStatus::Ok => "OK",
            FailsafeStatus::Warning => "WARNING",
            FailsafeStatus::Critical => "CRITICAL",
        }
    }
}

impl Default for FailsafeStatus {
    fn default() -> Self {
        FailsafeStatus::Ok
    }
}

// ============================================================================
// Crack severity (deterministic width-based classification)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    None,
    Hairline,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::None => "None",
            Severity::Hairline => "Hairline",
            Severity::Warning => "Warning",
            Severity::Critical => "Critical",
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Severity::None
    }
}

// ============================================================================
// Inter-lane jobs
// ============================================================================

/// Frame handed from the producer to Lane 1, and (resized) from Lane 1 to
/// Lane 2. The buffer is contiguous BGR, row-major, 3 bytes per pixel.
#[derive(Debug, Clone)]
pub struct FrameJob {
    pub frame_id: u64,
    pub height: usize,
    pub width: usize,
    pub crack_score: f32,
    pub frame_bgr: Vec<u8>,
}

/// Full-resolution frame handed to Lane 3 when gating permits inference.
#[derive(Debug, Clone)]
pub struct SemanticJob {
    pub frame_id: u64,
    pub height: usize,
    pub width: usize,
    pub timestamp_s: f64,
    pub crack_score: f32,
    pub sparsity: f32,
    pub target_hz: f32,
    pub reason: crate::gating::GateReason,
    pub frame_bgr: Vec<u8>,
}

/// Downscaled frame handed to Lane 5 for overlay and encoding.
#[derive(Debug, Clone)]
pub struct VisJob {
    pub frame_id: u64,
    pub height: usize,
    pub width: usize,
    pub crack_score: f32,
    pub sparsity: f32,
    pub severity: Severity,
    pub on_count: u32,
    pub off_count: u32,
    pub frame_bgr: Vec<u8>,
}

// ============================================================================
// Sensing kernel output
// ============================================================================

/// Per-frame result of the sensing kernel. `frame_id` is -1 when the kernel
/// rejected the buffer (resolution contract violation); such frames produce
/// no fan-out.
#[derive(Debug, Clone, Copy)]
pub struct ControlOutput {
    pub frame_id: i64,
    pub crack_score: f32,
    pub fused_crack_score: f32,
    pub sparsity: f32,
    pub throttle: f32,
    pub steer: f32,
    pub on_spike_count: u32,
    pub off_spike_count: u32,
    pub semantic_active: bool,
    pub semantic_age_ms: f64,
    pub emergency_slow: bool,
    pub is_null_cycle: bool,
    pub inference_suppressed: bool,
    pub event_only_mode: bool,
    pub reference_frame_age: u32,
}

impl Default for ControlOutput {
    fn default() -> Self {
        Self {
            frame_id: -1,
            crack_score: 0.0,
            fused_crack_score: 0.0,
            sparsity: 1.0,
            throttle: 1.0,
            steer: 0.0,
            on_spike_count: 0,
            off_spike_count: 0,
            semantic_active: false,
            semantic_age_ms: 99999.0,
            emergency_slow: false,
            is_null_cycle: false,
            inference_suppressed: false,
            event_only_mode: true,
            reference_frame_age: 0,
        }
    }
}

// ============================================================================
// Cross-lane snapshots
// ============================================================================

/// Semantic risk summary published by Lane 3 and read lock-free by Lane 1.
/// The sequence id travels in the snapshot channel wrapper, not in the body.
#[derive(Debug, Clone, Copy, Default)]
pub struct SemanticSnapshot {
    pub valid: bool,
    pub timestamp_s: f64,
    pub front_risk: f32,
    pub left_risk: f32,
    pub right_risk: f32,
    pub crack_risk: f32,
    pub min_distance_m: f32,
    pub max_confidence: f32,
    pub num_detections: u32,
    pub priority_detections: u32,
    pub num_filtered_out: u32,
}

/// Lightweight marker published alongside the semantic snapshot for age
/// queries that do not need the full risk summary.
#[derive(Debug, Clone, Copy, Default)]
pub struct SemanticState {
    pub frame_id: u64,
    pub timestamp_ms: f64,
}

/// Signature lookup result published by Lane 2, read by Lane 1 and Lane 3.
#[derive(Debug, Clone, Copy)]
pub struct SignatureMatch {
    pub matched: bool,
    pub id: i64,
    pub distance: f32,
    pub structural_distance: f32,
    pub confidence: f32,
}

impl Default for SignatureMatch {
    fn default() -> Self {
        Self {
            matched: false,
            id: -1,
            distance: f32::INFINITY,
            structural_distance: 0.0,
            confidence: 0.0,
        }
    }
}

// ============================================================================
// Crack metrics attached to decisions
// ============================================================================

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CrackMetrics {
    pub score: f32,
    pub width_mm: f32,
    pub length_mm: f32,
    pub severity: Severity,
    pub confidence_percent: f32,
    pub is_critical: bool,
    pub is_warning: bool,
}

// ============================================================================
// User-facing records
// ============================================================================

/// The per-frame outcome delivered through the CONTROL callback.
#[derive(Debug, Clone, Serialize)]
pub struct ControlDecision {
    pub frame_id: i64,
    pub timestamp: f64,
    pub throttle: f32,
    pub steer: f32,
    pub action: Action,
    pub crack_score: f32,
    pub sparsity: f32,
    pub confidence: f32,
    pub semantic_active: bool,
    pub semantic_age_ms: f64,
    pub is_null_cycle: bool,
    pub inference_suppressed: bool,
    pub event_only_mode: bool,
    pub reference_frame_age: u32,
    pub control_latency_ms: f64,
    pub crack_width_mm: f32,
    pub crack_length_mm: f32,
    pub crack_severity: Severity,
    pub crack_confidence_percent: f32,
}

/// Telemetry record serialized by Lane 4 and delivered through the UPLINK
/// callback.
#[derive(Debug, Clone, Serialize)]
pub struct UplinkPayload {
    pub frame_id: i64,
    pub timestamp: f64,
    pub throttle: f32,
    pub steer: f32,
    pub crack_score: f32,
    pub sparsity: f32,
    pub action: Action,
    pub control_latency_ms: f64,
    pub crack_severity: Severity,
    pub crack_width_mm: f32,
    pub failsafe_status: FailsafeStatus,
    pub sig_conf: f32,
    pub yolo_count: u64,
    pub latency_violations: u64,
}

/// Merged queue element drained by the Lane 6 dispatcher.
#[derive(Debug, Clone)]
pub enum CallbackJob {
    Control(ControlDecision),
    Uplink(UplinkPayload),
}

// ============================================================================
// Benchmarking
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize)]
pub struct BenchmarkSample {
    pub lane: u8,
    pub frame_id: i64,
    pub latency_ms: f32,
    pub yolo_ran: bool,
}

/// Bounded per-lane latency log guarded by the engine's benchmark mutex.
/// Oldest samples are overwritten once the capacity is reached.
#[derive(Debug, Clone)]
pub struct BenchmarkSuite {
    samples: Vec<BenchmarkSample>,
    capacity: usize,
    next: usize,
}

impl BenchmarkSuite {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
            next: 0,
        }
    }

    pub fn add(&mut self, sample: BenchmarkSample) {
        if self.samples.len() < self.capacity {
            self.samples.push(sample);
        } else {
            self.samples[self.next] = sample;
        }
        self.next = (self.next + 1) % self.capacity;
    }

    pub fn samples(&self) -> &[BenchmarkSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl Default for BenchmarkSuite {
    fn default() -> Self {
        Self::new(16384)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_thresholds_are_strict() {
        assert_eq!(Action::from_score(0.0), Action::Clear);
        assert_eq!(Action::from_score(0.10), Action::Clear);
        assert_eq!(Action::from_score(0.101), Action::Caution);
        assert_eq!(Action::from_score(0.40), Action::Caution);
        assert_eq!(Action::from_score(0.401), Action::Slow);
        assert_eq!(Action::from_score(0.70), Action::Slow);
        assert_eq!(Action::from_score(0.701), Action::Stop);
        assert_eq!(Action::from_score(1.0), Action::Stop);
    }

    #[test]
    fn test_action_labels_byte_exact() {
        assert_eq!(Action::Clear.as_str(), "CLEAR");
        assert_eq!(Action::Caution.as_str(), "CAUTION");
        assert_eq!(Action::Slow.as_str(), "SLOW");
        assert_eq!(Action::Stop.as_str(), "STOP");
    }

    #[test]
    fn test_action_serializes_uppercase() {
        let json = serde_json::to_string(&Action::Slow).unwrap();
        assert_eq!(json, "\"SLOW\"");
    }

    #[test]
    fn test_benchmark_suite_wraps() {
        let mut suite = BenchmarkSuite::new(4);
        for i in 0..6 {
            suite.add(BenchmarkSample {
                lane: 1,
                frame_id: i,
                latency_ms: i as f32,
                yolo_ran: false,
            });
        }
        assert_eq!(suite.len(), 4);
        // Oldest two entries were overwritten by frames 4 and 5.
        let ids: Vec<i64> = suite.samples().iter().map(|s| s.frame_id).collect();
        assert!(ids.contains(&4));
        assert!(ids.contains(&5));
        assert!(!ids.contains(&0));
    }

    #[test]
    fn test_signature_match_default_is_unmatched() {
        let m = SignatureMatch::default();
        assert!(!m.matched);
        assert_eq!(m.id, -1);
        assert_eq!(m.confidence, 0.0);
    }
}

// src/gating.rs
//
// Detector scheduler. Decides, once per frame, whether the semantic lane
// should run inference. The runtime state is single-writer (the Lane 1
// thread owns the engine); tunables and statistics are atomics so any other
// thread can observe them without coordination.

use crate::metrics::AtomicF32;
use crate::types::SignatureMatch;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

// ============================================================================
// Decision reason
// ============================================================================

/// Why the gate opened or stayed closed. The cascade order below is a fixed
/// contract and must never be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateReason {
    ForcedInfer,
    CriticalCrack,
    MaxSkipFrames,
    MaxSkipTime,
    NovelScene,
    LowConfidence,
    HighConfidenceSkip,
}

impl GateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateReason::ForcedInfer => "forced_infer",
            GateReason::CriticalCrack => "critical_crack",
            GateReason::MaxSkipFrames => "max_skip_frames",
            GateReason::MaxSkipTime => "max_skip_time",
            GateReason::NovelScene => "novel_scene",
            GateReason::LowConfidence => "low_confidence",
            GateReason::HighConfidenceSkip => "high_confidence_skip",
        }
    }
}

// ============================================================================
// Shared tunables / stats
// ============================================================================

/// Gating tunables, atomically updatable from any thread.
#[derive(Debug)]
pub struct GatingConfig {
    pub confidence_threshold: AtomicF32,
    pub max_skip_frames: AtomicU32,
    pub max_skip_time_ms: AtomicF32,
    pub critical_crack_threshold: AtomicF32,
}

impl GatingConfig {
    pub fn new(
        confidence_threshold: f32,
        max_skip_frames: u32,
        max_skip_time_ms: f32,
        critical_crack_threshold: f32,
    ) -> Self {
        Self {
            confidence_threshold: AtomicF32::new(confidence_threshold),
            max_skip_frames: AtomicU32::new(max_skip_frames),
            max_skip_time_ms: AtomicF32::new(max_skip_time_ms),
            critical_crack_threshold: AtomicF32::new(critical_crack_threshold),
        }
    }
}

impl Default for GatingConfig {
    fn default() -> Self {
        Self::new(0.60, 30, 500.0, 0.60)
    }
}

/// Relaxed-atomic statistics snapshot. Concurrent readers may see slightly
/// stale counts but never torn fields.
#[derive(Debug, Default)]
pub struct GatingStats {
    pub total_decisions: AtomicU64,
    pub infer_count: AtomicU64,
    pub skip_count: AtomicU64,
    pub current_skip_streak: AtomicU32,
    pub max_skip_streak: AtomicU32,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct GatingStatsSnapshot {
    pub total_decisions: u64,
    pub infer_count: u64,
    pub skip_count: u64,
    pub suppression_rate: f32,
    pub avg_skip_streak: f32,
    pub current_skip_streak: u32,
    pub max_skip_streak: u32,
}

impl GatingStats {
    pub fn snapshot(&self) -> GatingStatsSnapshot {
        let total = self.total_decisions.load(Ordering::Relaxed);
        let infer = self.infer_count.load(Ordering::Relaxed);
        let skip = self.skip_count.load(Ordering::Relaxed);
        GatingStatsSnapshot {
            total_decisions: total,
            infer_count: infer,
            skip_count: skip,
            suppression_rate: if total > 0 {
                skip as f32 / total as f32
            } else {
                0.0
            },
            avg_skip_streak: if infer > 0 {
                skip as f32 / infer as f32
            } else {
                0.0
            },
            current_skip_streak: self.current_skip_streak.load(Ordering::Relaxed),
            max_skip_streak: self.max_skip_streak.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Decision
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct GateDecision {
    pub should_infer: bool,
    pub confidence: f32,
    pub reason: GateReason,
    pub signature_matched: bool,
    pub signature_confidence: f32,
    pub frames_since_last_infer: u32,
    pub time_since_last_infer_ms: f64,
}

// ============================================================================
// Engine
// ============================================================================

pub struct GatingEngine {
    config: Arc<GatingConfig>,
    stats: Arc<GatingStats>,

    // Single-writer runtime state.
    frames_since_last_infer: u32,
    last_infer_time_ms: f64,
    current_skip_streak: u32,
    max_skip_streak: u32,
}

impl GatingEngine {
    pub fn new(config: Arc<GatingConfig>) -> Self {
        Self {
            config,
            stats: Arc::new(GatingStats::default()),
            frames_since_last_infer: 0,
            last_infer_time_ms: 0.0,
            current_skip_streak: 0,
            max_skip_streak: 0,
        }
    }

    pub fn stats_handle(&self) -> Arc<GatingStats> {
        self.stats.clone()
    }

    pub fn config_handle(&self) -> Arc<GatingConfig> {
        self.config.clone()
    }

    /// Priority cascade, evaluated in contract order:
    /// forced > critical crack > max skipped frames > max skipped time >
    /// novel scene > low confidence > high-confidence skip.
    ///
    /// Before the first inference, the elapsed time is taken to exceed the
    /// time limit so the first cycle always runs.
    pub fn decide(
        &mut self,
        sig_match: &SignatureMatch,
        now_ms: f64,
        crack_score: f32,
        force_infer: bool,
    ) -> GateDecision {
        self.stats.total_decisions.fetch_add(1, Ordering::Relaxed);

        let conf_thr = self.config.confidence_threshold.load();
        let max_frames = self.config.max_skip_frames.load(Ordering::Relaxed);
        let max_time_ms = self.config.max_skip_time_ms.load() as f64;
        let critical_thr = self.config.critical_crack_threshold.load();

        let time_since_last_ms = if self.last_infer_time_ms <= 0.0 {
            max_time_ms + 1.0
        } else {
            (now_ms - self.last_infer_time_ms).max(0.0)
        };

        if force_infer {
            return self.finish(true, 1.0, GateReason::ForcedInfer, sig_match, time_since_last_ms, now_ms);
        }
        if crack_score >= critical_thr {
            return self.finish(true, 0.9, GateReason::CriticalCrack, sig_match, time_since_last_ms, now_ms);
        }
        if self.frames_since_last_infer >= max_frames {
            return self.finish(true, 1.0, GateReason::MaxSkipFrames, sig_match, time_since_last_ms, now_ms);
        }
        if time_since_last_ms >= max_time_ms {
            return self.finish(true, 1.0, GateReason::MaxSkipTime, sig_match, time_since_last_ms, now_ms);
        }
        if !sig_match.matched {
            return self.finish(true, 0.8, GateReason::NovelScene, sig_match, time_since_last_ms, now_ms);
        }
        if sig_match.confidence < conf_thr {
            return self.finish(true, 0.7, GateReason::LowConfidence, sig_match, time_since_last_ms, now_ms);
        }

        self.finish(
            false,
            sig_match.confidence,
            GateReason::HighConfidenceSkip,
            sig_match,
            time_since_last_ms,
            now_ms,
        )
    }

    fn finish(
        &mut self,
        should_infer: bool,
        confidence: f32,
        reason: GateReason,
        sig_match: &SignatureMatch,
        time_since_last_ms: f64,
        now_ms: f64,
    ) -> GateDecision {
        if should_infer {
            self.stats.infer_count.fetch_add(1, Ordering::Relaxed);
            self.frames_since_last_infer = 0;
            self.last_infer_time_ms = now_ms;
            self.current_skip_streak = 0;
        } else {
            self.stats.skip_count.fetch_add(1, Ordering::Relaxed);
            self.frames_since_last_infer += 1;
            self.current_skip_streak += 1;
            self.max_skip_streak = self.max_skip_streak.max(self.current_skip_streak);
        }

        self.stats
            .current_skip_streak
            .store(self.current_skip_streak, Ordering::Relaxed);
        self.stats
            .max_skip_streak
            .store(self.max_skip_streak, Ordering::Relaxed);

        GateDecision {
            should_infer,
            confidence,
            reason,
            signature_matched: sig_match.matched,
            signature_confidence: if sig_match.matched {
                sig_match.confidence
            } else {
                0.0
            },
            frames_since_last_infer: self.frames_since_last_infer,
            time_since_last_infer_ms: time_since_last_ms,
        }
    }

    /// Zero all runtime state and statistics; the next decision behaves like
    /// the first (time-overflow forces inference).
    pub fn reset(&mut self) {
        self.frames_since_last_infer = 0;
        self.last_infer_time_ms = 0.0;
        self.current_skip_streak = 0;
        self.max_skip_streak = 0;

        self.stats.total_decisions.store(0, Ordering::Relaxed);
        self.stats.infer_count.store(0, Ordering::Relaxed);
        self.stats.skip_count.store(0, Ordering::Relaxed);
        self.stats.current_skip_streak.store(0, Ordering::Relaxed);
        self.stats.max_skip_streak.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matched(confidence: f32) -> SignatureMatch {
        SignatureMatch {
            matched: true,
            id: 1,
            distance: 0.1,
            structural_distance: 0.05,
            confidence,
        }
    }

    #[test]
    fn test_first_cycle_forces_inference_via_time() {
        let mut gate = GatingEngine::new(Arc::new(GatingConfig::default()));
        let d = gate.decide(&matched(0.99), 1000.0, 0.0, false);
        assert!(d.should_infer);
        assert_eq!(d.reason, GateReason::MaxSkipTime);
    }

    #[test]
    fn test_forced_beats_critical() {
        let mut gate = GatingEngine::new(Arc::new(GatingConfig::default()));
        let d = gate.decide(&matched(0.99), 1000.0, 0.95, true);
        assert_eq!(d.reason, GateReason::ForcedInfer);
    }

    #[test]
    fn test_critical_crack_beats_counters() {
        let mut gate = GatingEngine::new(Arc::new(GatingConfig::default()));
        gate.decide(&matched(0.99), 1000.0, 0.0, false);
        // Threshold comparison is inclusive.
        let d = gate.decide(&matched(0.99), 1001.0, 0.60, false);
        assert!(d.should_infer);
        assert_eq!(d.reason, GateReason::CriticalCrack);
    }

    #[test]
    fn test_high_confidence_skips_until_frame_limit() {
        let cfg = Arc::new(GatingConfig::new(0.60, 5, 1_000_000.0, 0.60));
        let mut gate = GatingEngine::new(cfg);

        let first = gate.decide(&matched(0.95), 0.0, 0.0, false);
        assert!(first.should_infer);

        for i in 0..6 {
            let d = gate.decide(&matched(0.95), (i + 1) as f64, 0.0, false);
            if i < 5 {
                assert!(!d.should_infer, "skip expected on iteration {i}");
                assert_eq!(d.reason, GateReason::HighConfidenceSkip);
            } else {
                assert!(d.should_infer);
                assert_eq!(d.reason, GateReason::MaxSkipFrames);
            }
        }
    }

    #[test]
    fn test_time_limit_reopens_gate() {
        let cfg = Arc::new(GatingConfig::new(0.60, 1_000_000, 500.0, 0.60));
        let mut gate = GatingEngine::new(cfg);
        gate.decide(&matched(0.95), 0.0, 0.0, false);
        let skip = gate.decide(&matched(0.95), 100.0, 0.0, false);
        assert!(!skip.should_infer);
        let run = gate.decide(&matched(0.95), 600.0, 0.0, false);
        assert!(run.should_infer);
        assert_eq!(run.reason, GateReason::MaxSkipTime);
    }

    #[test]
    fn test_novel_scene_and_low_confidence() {
        let mut gate = GatingEngine::new(Arc::new(GatingConfig::default()));
        gate.decide(&matched(0.95), 0.0, 0.0, false);

        let novel = gate.decide(&SignatureMatch::default(), 1.0, 0.0, false);
        assert_eq!(novel.reason, GateReason::NovelScene);
        assert_eq!(novel.signature_confidence, 0.0);

        let low = gate.decide(&matched(0.2), 2.0, 0.0, false);
        assert_eq!(low.reason, GateReason::LowConfidence);
    }

    #[test]
    fn test_skip_streak_accounting() {
        let cfg = Arc::new(GatingConfig::new(0.60, 100, 1_000_000.0, 0.60));
        let mut gate = GatingEngine::new(cfg);
        let stats = gate.stats_handle();

        gate.decide(&matched(0.95), 0.0, 0.0, false);
        for i in 0..7 {
            gate.decide(&matched(0.95), (i + 1) as f64, 0.0, false);
        }
        let snap = stats.snapshot();
        assert_eq!(snap.total_decisions, 8);
        assert_eq!(snap.infer_count, 1);
        assert_eq!(snap.skip_count, 7);
        assert_eq!(snap.current_skip_streak, 7);
        assert_eq!(snap.max_skip_streak, 7);
        assert!((snap.suppression_rate - 7.0 / 8.0).abs() < 1e-6);
    }

    #[test]
    fn test_reset_zeroes_stats_and_reopens_gate() {
        let mut gate = GatingEngine::new(Arc::new(GatingConfig::default()));
        let stats = gate.stats_handle();
        gate.decide(&matched(0.95), 0.0, 0.0, false);
        gate.decide(&matched(0.95), 1.0, 0.0, false);

        gate.reset();
        let snap = stats.snapshot();
        assert_eq!(snap.total_decisions, 0);
        assert_eq!(snap.infer_count, 0);
        assert_eq!(snap.skip_count, 0);
        assert_eq!(snap.max_skip_streak, 0);

        let d = gate.decide(&matched(0.99), 5000.0, 0.0, false);
        assert!(d.should_infer);
        assert_eq!(d.reason, GateReason::MaxSkipTime);
    }
}

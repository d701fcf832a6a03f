// src/sensing/fusion.rs
//
// Lock-free fusion of the semantic risk summary into the per-frame crack
// score and control modifiers. Everything here runs inside the Lane 1 cycle
// and must stay well under the frame budget: one snapshot read, a handful of
// branches, no allocation.

use crate::transport::Snapshot;
use crate::types::SemanticSnapshot;
use serde::{Deserialize, Serialize};

/// Age sentinel reported when no usable semantic data exists.
pub const SEMANTIC_AGE_ABSENT_MS: f64 = 99999.0;

// ============================================================================
// Config
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Risk below this never counts as an obstacle signal.
    pub min_confidence_obstacle: f32,
    /// Risk below this never counts as a crack signal.
    pub min_confidence_crack: f32,

    /// Frames a channel must persist before it passes the temporal filter.
    pub min_consecutive_frames: u32,
    /// Frames a channel may miss before its streak resets.
    pub max_gap_frames: u32,

    /// Snapshot age at which linear confidence decay begins.
    pub stale_start_ms: f64,
    /// Snapshot age at and beyond which the snapshot is treated as absent.
    pub max_age_ms: f64,

    pub max_crack_amplification: f32,
    pub max_speed_reduction: f32,
    pub max_steer_bias: f32,
    pub min_safe_speed_scale: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            min_confidence_obstacle: 0.45,
            min_confidence_crack: 0.35,
            min_consecutive_frames: 2,
            max_gap_frames: 3,
            stale_start_ms: 100.0,
            max_age_ms: 200.0,
            max_crack_amplification: 2.5,
            max_speed_reduction: 0.70,
            max_steer_bias: 0.30,
            min_safe_speed_scale: 0.15,
        }
    }
}

// ============================================================================
// Temporal consistency filter
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
struct ChannelState {
    consecutive: u32,
    gap: u32,
}

impl ChannelState {
    fn update(&mut self, risk: f32, threshold: f32, max_gap: u32) {
        if risk >= threshold {
            self.consecutive += 1;
            self.gap = 0;
        } else {
            self.gap += 1;
            if self.gap > max_gap {
                self.consecutive = 0;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FilteredRisks {
    pub front_risk: f32,
    pub left_risk: f32,
    pub right_risk: f32,
    pub crack_risk: f32,
    pub temporal_stability: f32,
}

/// Anti-flicker filter: a channel contributes only after it has been seen on
/// enough consecutive publishes. A snapshot whose sequence id equals the
/// previously observed one is ignored entirely so re-reads of the same
/// publish cannot inflate the streaks.
#[derive(Debug, Default)]
pub struct TemporalConsistencyFilter {
    front: ChannelState,
    left: ChannelState,
    right: ChannelState,
    crack: ChannelState,
    last_sequence: u32,
}

impl TemporalConsistencyFilter {
    pub fn filter(&mut self, snap: &Snapshot<SemanticSnapshot>, cfg: &FusionConfig) -> FilteredRisks {
        if snap.sequence_id == self.last_sequence && self.last_sequence != 0 {
            return FilteredRisks::default();
        }
        self.last_sequence = snap.sequence_id;

        let s = &snap.value;
        self.front
            .update(s.front_risk, cfg.min_confidence_obstacle, cfg.max_gap_frames);
        self.left
            .update(s.left_risk, cfg.min_confidence_obstacle, cfg.max_gap_frames);
        self.right
            .update(s.right_risk, cfg.min_confidence_obstacle, cfg.max_gap_frames);
        self.crack
            .update(s.crack_risk, cfg.min_confidence_crack, cfg.max_gap_frames);

        let min_frames = cfg.min_consecutive_frames;
        let total = self.front.consecutive
            + self.left.consecutive
            + self.right.consecutive
            + self.crack.consecutive;

        FilteredRisks {
            front_risk: if self.front.consecutive >= min_frames {
                s.front_risk
            } else {
                0.0
            },
            left_risk: if self.left.consecutive >= min_frames {
                s.left_risk
            } else {
                0.0
            },
            right_risk: if self.right.consecutive >= min_frames {
                s.right_risk
            } else {
                0.0
            },
            crack_risk: if self.crack.consecutive >= min_frames {
                s.crack_risk
            } else {
                0.0
            },
            temporal_stability: (total as f32 / 20.0).min(1.0),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ============================================================================
// Age decay, crack fusion, control modifiers
// ============================================================================

/// Linear confidence decay: full weight up to `stale_start_ms`, zero at
/// `max_age_ms` and beyond.
pub fn age_decay(risk: f32, age_ms: f64, cfg: &FusionConfig) -> f32 {
    if age_ms <= cfg.stale_start_ms {
        return risk;
    }
    if age_ms >= cfg.max_age_ms {
        return 0.0;
    }
    let range = cfg.max_age_ms - cfg.stale_start_ms;
    let decay = 1.0 - (age_ms - cfg.stale_start_ms) / range;
    risk * decay as f32
}

/// Blend the event-based crack score with the semantic risks. Amplifies when
/// both agree, halves the score when both are quiet, passes through
/// otherwise.
pub fn fuse_crack(raw_crack: f32, crack_risk: f32, front_risk: f32, cfg: &FusionConfig) -> f32 {
    let semantic_risk = crack_risk.max(front_risk);

    if semantic_risk > 0.30 && raw_crack > 0.05 {
        let factor = 1.0 + (cfg.max_crack_amplification - 1.0) * semantic_risk;
        (raw_crack * factor).min(1.0)
    } else if semantic_risk < 0.10 && raw_crack < 0.10 {
        raw_crack * 0.5
    } else {
        raw_crack
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ControlModifiers {
    pub speed_scale: f32,
    pub steer_bias: f32,
    pub emergency_slow: bool,
}

impl Default for ControlModifiers {
    fn default() -> Self {
        Self {
            speed_scale: 1.0,
            steer_bias: 0.0,
            emergency_slow: false,
        }
    }
}

/// Speed and steering adjustments from the directional risks. Any priority
/// detection forces the throttle ceiling to 0.30.
pub fn control_modifiers(
    front_risk: f32,
    left_risk: f32,
    right_risk: f32,
    priority_detections: u32,
    cfg: &FusionConfig,
) -> ControlModifiers {
    let mut mods = ControlModifiers::default();

    if front_risk > 0.20 {
        let reduction = cfg.max_speed_reduction * front_risk.min(1.0);
        mods.speed_scale = (1.0 - reduction).max(cfg.min_safe_speed_scale);
    }

    if priority_detections > 0 {
        mods.speed_scale = mods.speed_scale.min(0.30);
        mods.emergency_slow = true;
    }

    let asymmetry = left_risk - right_risk;
    if asymmetry.abs() > 0.10 {
        mods.steer_bias =
            (cfg.max_steer_bias * asymmetry).clamp(-cfg.max_steer_bias, cfg.max_steer_bias);
    }

    mods
}

// ============================================================================
// Fusion entry point
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct FusionResult {
    pub fused_crack: f32,
    pub modifiers: ControlModifiers,
    pub semantic_active: bool,
    pub semantic_age_ms: f64,
    pub temporal_stability: f32,
    pub sequence_id: u32,
}

impl FusionResult {
    fn absent(raw_crack: f32) -> Self {
        Self {
            fused_crack: raw_crack,
            modifiers: ControlModifiers::default(),
            semantic_active: false,
            semantic_age_ms: SEMANTIC_AGE_ABSENT_MS,
            temporal_stability: 0.0,
            sequence_id: 0,
        }
    }
}

/// Stateful fusion stage owned by the Lane 1 thread.
pub struct SemanticFusion {
    cfg: FusionConfig,
    filter: TemporalConsistencyFilter,
}

impl SemanticFusion {
    pub fn new(cfg: FusionConfig) -> Self {
        Self {
            cfg,
            filter: TemporalConsistencyFilter::default(),
        }
    }

    /// Fuse one frame's raw crack score against the latest semantic
    /// snapshot. Invalid, stale (age >= max_age) and skewed (age < 0)
    /// snapshots are treated as absent: the raw score passes through
    /// untouched.
    pub fn fuse(
        &mut self,
        raw_crack: f32,
        now_s: f64,
        snap: &Snapshot<SemanticSnapshot>,
    ) -> FusionResult {
        if !snap.value.valid {
            return FusionResult::absent(raw_crack);
        }

        let age_ms = (now_s - snap.value.timestamp_s) * 1000.0;
        if age_ms < 0.0 || age_ms >= self.cfg.max_age_ms {
            return FusionResult::absent(raw_crack);
        }

        let filtered = self.filter.filter(snap, &self.cfg);

        let front = age_decay(filtered.front_risk, age_ms, &self.cfg);
        let left = age_decay(filtered.left_risk, age_ms, &self.cfg);
        let right = age_decay(filtered.right_risk, age_ms, &self.cfg);
        let crack = age_decay(filtered.crack_risk, age_ms, &self.cfg);

        let has_signal = front > 0.01
            || left > 0.01
            || right > 0.01
            || crack > 0.01
            || snap.value.priority_detections > 0;

        if !has_signal {
            let mut result = FusionResult::absent(raw_crack);
            result.semantic_age_ms = age_ms;
            result.sequence_id = snap.sequence_id;
            return result;
        }

        FusionResult {
            fused_crack: fuse_crack(raw_crack, crack, front, &self.cfg),
            modifiers: control_modifiers(
                front,
                left,
                right,
                snap.value.priority_detections,
                &self.cfg,
            ),
            semantic_active: true,
            semantic_age_ms: age_ms,
            temporal_stability: filtered.temporal_stability,
            sequence_id: snap.sequence_id,
        }
    }

    pub fn reset(&mut self) {
        self.filter.reset();
    }

    pub fn config(&self) -> &FusionConfig {
        &self.cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap_with(seq: u32, ts: f64, crack: f32, front: f32) -> Snapshot<SemanticSnapshot> {
        Snapshot {
            sequence_id: seq,
            value: SemanticSnapshot {
                valid: true,
                timestamp_s: ts,
                front_risk: front,
                crack_risk: crack,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_invalid_snapshot_passes_raw_through() {
        let mut fusion = SemanticFusion::new(FusionConfig::default());
        let snap = Snapshot::<SemanticSnapshot>::default();
        let out = fusion.fuse(0.42, 10.0, &snap);
        assert_eq!(out.fused_crack, 0.42);
        assert!(!out.semantic_active);
        assert_eq!(out.semantic_age_ms, SEMANTIC_AGE_ABSENT_MS);
    }

    #[test]
    fn test_stale_snapshot_is_absent() {
        // Published at t=0, read 300ms later with max_age 200ms.
        let mut fusion = SemanticFusion::new(FusionConfig::default());
        let snap = snap_with(1, 0.0, 0.9, 0.9);
        let out = fusion.fuse(0.25, 0.300, &snap);
        assert_eq!(out.fused_crack, 0.25);
        assert!(!out.semantic_active);
    }

    #[test]
    fn test_age_exactly_max_age_is_absent() {
        let mut fusion = SemanticFusion::new(FusionConfig::default());
        let snap = snap_with(1, 0.0, 0.9, 0.9);
        let out = fusion.fuse(0.25, 0.200, &snap);
        assert!(!out.semantic_active);
        assert_eq!(out.fused_crack, 0.25);
    }

    #[test]
    fn test_negative_age_is_absent() {
        let mut fusion = SemanticFusion::new(FusionConfig::default());
        let snap = snap_with(1, 5.0, 0.9, 0.9);
        let out = fusion.fuse(0.25, 4.9, &snap);
        assert!(!out.semantic_active);
    }

    #[test]
    fn test_agreement_amplifies_crack() {
        let cfg = FusionConfig {
            min_consecutive_frames: 1,
            ..Default::default()
        };
        let mut fusion = SemanticFusion::new(cfg);
        // Fresh snapshot, strong semantic crack, decent raw crack.
        let out = fusion.fuse(0.20, 0.010, &snap_with(1, 0.0, 0.80, 0.0));
        let expected = (0.20f32 * (1.0 + 1.5 * 0.80)).min(1.0);
        assert!((out.fused_crack - expected).abs() < 1e-6);
        assert!(out.semantic_active);
        assert!(out.semantic_age_ms > 0.0);
    }

    #[test]
    fn test_joint_quiet_suppresses() {
        let cfg = FusionConfig {
            min_consecutive_frames: 1,
            ..Default::default()
        };
        let mut fusion = SemanticFusion::new(cfg);
        // Semantic sees a pedestrian-free, crack-free scene but with one
        // priority detection keeping the snapshot "active".
        let mut snap = snap_with(1, 0.0, 0.05, 0.05);
        snap.value.priority_detections = 1;
        let out = fusion.fuse(0.06, 0.010, &snap);
        assert!((out.fused_crack - 0.03).abs() < 1e-6);
        assert!(out.modifiers.emergency_slow);
        assert!(out.modifiers.speed_scale <= 0.30);
    }

    #[test]
    fn test_steer_bias_follows_asymmetry() {
        let cfg = FusionConfig {
            min_consecutive_frames: 1,
            ..Default::default()
        };
        let mut fusion = SemanticFusion::new(cfg);
        let mut snap = snap_with(1, 0.0, 0.0, 0.0);
        snap.value.left_risk = 0.8;
        snap.value.right_risk = 0.1;
        let out = fusion.fuse(0.0, 0.010, &snap);
        // bias = clamp(0.30 * (0.8 - 0.1)) = 0.21
        assert!((out.modifiers.steer_bias - 0.21).abs() < 1e-6);
    }

    #[test]
    fn test_repeated_sequence_does_not_advance_filter() {
        let cfg = FusionConfig::default();
        let mut filter = TemporalConsistencyFilter::default();
        let snap = snap_with(7, 0.0, 0.9, 0.9);

        // First sight: streak 1, below min_consecutive_frames => zeroed.
        let first = filter.filter(&snap, &cfg);
        assert_eq!(first.crack_risk, 0.0);

        // Same sequence again: ignored, streaks unchanged.
        let again = filter.filter(&snap, &cfg);
        assert_eq!(again.crack_risk, 0.0);
        assert_eq!(again.temporal_stability, 0.0);

        // A genuinely new publish finally satisfies the streak.
        let second = filter.filter(&snap_with(8, 0.0, 0.9, 0.9), &cfg);
        assert_eq!(second.crack_risk, 0.9);
    }

    #[test]
    fn test_age_decay_is_linear() {
        let cfg = FusionConfig::default();
        assert_eq!(age_decay(1.0, 50.0, &cfg), 1.0);
        assert_eq!(age_decay(1.0, 100.0, &cfg), 1.0);
        assert!((age_decay(1.0, 150.0, &cfg) - 0.5).abs() < 1e-6);
        assert_eq!(age_decay(1.0, 200.0, &cfg), 0.0);
        assert_eq!(age_decay(1.0, 500.0, &cfg), 0.0);
    }
}

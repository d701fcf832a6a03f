// src/stats.rs
//
// Rolling statistics: the Lane 1 latency ring, the windowed crack tracker,
// the detection controller with adaptive thresholds, and the temporal crack
// probability estimator fed by Lane 2.

use crate::types::{CrackMetrics, Severity};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::debug;

// ============================================================================
// Latency ring
// ============================================================================

/// Fixed-depth ring of relaxed atomics written by the single Lane 1 thread
/// and read by any observer. Percentiles are computed on demand from a
/// snapshot copy; no lock is ever taken.
pub struct LatencyRing {
    slots: Vec<AtomicU32>,
    head: AtomicU64,
}

impl LatencyRing {
    pub fn new(depth: usize) -> Self {
        Self {
            slots: (0..depth.max(1)).map(|_| AtomicU32::new(0)).collect(),
            head: AtomicU64::new(0),
        }
    }

    pub fn record(&self, latency_ms: f32) {
        let head = self.head.fetch_add(1, Ordering::Relaxed);
        let idx = (head % self.slots.len() as u64) as usize;
        self.slots[idx].store(latency_ms.to_bits(), Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.head.load(Ordering::Relaxed)
    }

    /// (p50, p95, p99) over the retained window.
    pub fn percentiles(&self) -> (f32, f32, f32) {
        let count = self.count();
        if count == 0 {
            return (0.0, 0.0, 0.0);
        }
        let n = (count as usize).min(self.slots.len());
        let mut values: Vec<f32> = self.slots[..n]
            .iter()
            .map(|s| f32::from_bits(s.load(Ordering::Relaxed)))
            .collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let pick = |q: f64| values[((n as f64 * q) as usize).min(n - 1)];
        (pick(0.50), pick(0.95), pick(0.99))
    }
}

impl Default for LatencyRing {
    fn default() -> Self {
        Self::new(512)
    }
}

// ============================================================================
// Crack statistics tracker
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CrackStatsConfig {
    pub window_ms: f64,
    /// Fused score above which a frame counts as a crack detection.
    pub detect_threshold: f32,
    /// Linear score-to-width mapping, in millimetres at scale 1.0.
    pub width_scale_mm: f32,
    pub critical_width_mm: f32,
    pub warning_width_mm: f32,
    pub hairline_width_mm: f32,
}

impl Default for CrackStatsConfig {
    fn default() -> Self {
        Self {
            window_ms: 5000.0,
            detect_threshold: 0.05,
            width_scale_mm: 3.0,
            critical_width_mm: 3.0,
            warning_width_mm: 1.0,
            hairline_width_mm: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CrackSample {
    timestamp_ms: f64,
    fused_crack_score: f32,
}

/// Windowed crack tracker owned by the Lane 1 thread. Produces the
/// deterministic mm-domain metrics attached to every decision plus the
/// window/global detection ratios surfaced through the metrics block.
pub struct CrackTracker {
    cfg: CrackStatsConfig,
    history: VecDeque<CrackSample>,
    total_frames: u64,
    crack_frames: u64,
    consecutive_detections: u32,
}

impl CrackTracker {
    pub fn new(cfg: CrackStatsConfig) -> Self {
        Self {
            cfg,
            history: VecDeque::with_capacity(256),
            total_frames: 0,
            crack_frames: 0,
            consecutive_detections: 0,
        }
    }

    pub fn update(&mut self, timestamp_ms: f64, fused_crack_score: f32, px_to_mm: f32) -> CrackMetrics {
        self.total_frames += 1;
        self.history.push_back(CrackSample {
            timestamp_ms,
            fused_crack_score,
        });
        while let Some(front) = self.history.front() {
            if timestamp_ms - front.timestamp_ms > self.cfg.window_ms {
                self.history.pop_front();
            } else {
                break;
            }
        }

        if fused_crack_score > self.cfg.detect_threshold {
            self.crack_frames += 1;
            self.consecutive_detections += 1;
        } else {
            self.consecutive_detections = 0;
        }

        self.metrics_for(fused_crack_score, px_to_mm)
    }

    fn metrics_for(&self, fused_crack_score: f32, px_to_mm: f32) -> CrackMetrics {
        let width_mm = fused_crack_score * self.cfg.width_scale_mm * px_to_mm.max(0.001);
        let length_mm = width_mm * 3.0;

        let severity = if width_mm >= self.cfg.critical_width_mm {
            Severity::Critical
        } else if width_mm >= self.cfg.warning_width_mm {
            Severity::Warning
        } else if width_mm >= self.cfg.hairline_width_mm {
            Severity::Hairline
        } else {
            Severity::None
        };

        // Detection confidence grows with the score, measurement confidence
        // with temporal stability of the window.
        let detection_confidence = (fused_crack_score * 2.5).min(1.0);
        let measurement_confidence = if self.history.len() >= 3 {
            (-self.variance() * 10.0).exp()
        } else {
            0.5
        };
        let confidence_percent = detection_confidence * measurement_confidence * 100.0;

        CrackMetrics {
            score: fused_crack_score,
            width_mm,
            length_mm,
            severity,
            confidence_percent,
            is_critical: severity == Severity::Critical,
            is_warning: severity == Severity::Warning,
        }
    }

    pub fn window_crack_ratio(&self) -> f32 {
        if self.history.is_empty() {
            return 0.0;
        }
        let hits = self
            .history
            .iter()
            .filter(|s| s.fused_crack_score > self.cfg.detect_threshold)
            .count();
        hits as f32 / self.history.len() as f32
    }

    pub fn global_crack_ratio(&self) -> f32 {
        if self.total_frames == 0 {
            return 0.0;
        }
        self.crack_frames as f32 / self.total_frames as f32
    }

    /// Window trend via least-squares slope, normalized to [-1, 1].
    pub fn trend(&self) -> f32 {
        let n = self.history.len();
        if n < 3 {
            return 0.0;
        }
        let nf = n as f32;
        let mut sum_x = 0.0f32;
        let mut sum_y = 0.0f32;
        let mut sum_xy = 0.0f32;
        let mut sum_x2 = 0.0f32;
        for (i, s) in self.history.iter().enumerate() {
            let x = i as f32;
            sum_x += x;
            sum_y += s.fused_crack_score;
            sum_xy += x * s.fused_crack_score;
            sum_x2 += x * x;
        }
        let denom = nf * sum_x2 - sum_x * sum_x;
        if denom.abs() < 1e-6 {
            return 0.0;
        }
        let slope = (nf * sum_xy - sum_x * sum_y) / denom;
        (slope * 10.0).clamp(-1.0, 1.0)
    }

    /// Growth rate of the estimated width across the window, in mm/s.
    pub fn growth_rate_mm_per_s(&self, px_to_mm: f32) -> f32 {
        if self.history.len() < 5 {
            return 0.0;
        }
        let first = self.history.front().unwrap();
        let last = self.history.back().unwrap();
        let dt_s = ((last.timestamp_ms - first.timestamp_ms) / 1000.0) as f32;
        if dt_s < 0.1 {
            return 0.0;
        }
        let scale = self.cfg.width_scale_mm * px_to_mm.max(0.001);
        (last.fused_crack_score - first.fused_crack_score) * scale / dt_s
    }

    /// Change of the growth rate between the two window halves, in mm/s^2.
    pub fn growth_acceleration(&self, px_to_mm: f32) -> f32 {
        let n = self.history.len();
        if n < 10 {
            return 0.0;
        }
        let scale = self.cfg.width_scale_mm * px_to_mm.max(0.001);
        let first = self.history.front().unwrap();
        let mid = self.history[n / 2];
        let last = self.history.back().unwrap();

        let dt1 = (((mid.timestamp_ms - first.timestamp_ms) / 1000.0) as f32).max(0.01);
        let dt2 = (((last.timestamp_ms - mid.timestamp_ms) / 1000.0) as f32).max(0.01);

        let rate1 = (mid.fused_crack_score - first.fused_crack_score) * scale / dt1;
        let rate2 = (last.fused_crack_score - mid.fused_crack_score) * scale / dt2;
        (rate2 - rate1) / ((dt1 + dt2) / 2.0).max(0.01)
    }

    pub fn consecutive_detections(&self) -> u32 {
        self.consecutive_detections
    }

    fn variance(&self) -> f32 {
        if self.history.len() < 2 {
            return 0.0;
        }
        let n = self.history.len() as f32;
        let mean: f32 = self.history.iter().map(|s| s.fused_crack_score).sum::<f32>() / n;
        self.history
            .iter()
            .map(|s| {
                let d = s.fused_crack_score - mean;
                d * d
            })
            .sum::<f32>()
            / n
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.total_frames = 0;
        self.crack_frames = 0;
        self.consecutive_detections = 0;
    }
}

// ============================================================================
// Detection controller
// ============================================================================

/// Rolling window of (detector confidence, crack score) pairs with adaptive
/// thresholds. Owned by the Lane 3 thread; averages are pushed into the
/// shared metrics block after every update.
pub struct DetectionController {
    window_ms: f64,
    samples: VecDeque<(f64, f32)>,
    avg_yolo_conf: f32,
    avg_crack_score: f32,
    avg_agreement: f32,
    yolo_conf_threshold: f32,
    crack_threshold: f32,
}

impl DetectionController {
    pub fn new(window_ms: f64) -> Self {
        Self {
            window_ms,
            samples: VecDeque::with_capacity(128),
            avg_yolo_conf: 0.0,
            avg_crack_score: 0.0,
            avg_agreement: 0.0,
            yolo_conf_threshold: 0.40,
            crack_threshold: 0.50,
        }
    }

    pub fn add_detection(&mut self, timestamp_ms: f64, yolo_conf: f32, crack_score: f32) {
        let combined = (yolo_conf + crack_score) * 0.5;
        self.samples.push_back((timestamp_ms, combined));
        while let Some(&(ts, _)) = self.samples.front() {
            if timestamp_ms - ts > self.window_ms {
                self.samples.pop_front();
            } else {
                break;
            }
        }

        self.avg_yolo_conf = yolo_conf;
        self.avg_crack_score = crack_score;
        self.avg_agreement = 1.0 - (yolo_conf - crack_score).abs();
    }

    /// Nudge the thresholds toward the recent activity level: busy windows
    /// raise them (fewer false positives), quiet windows lower them (more
    /// sensitivity). Each step is clamped to a safe band.
    pub fn update_adaptive_thresholds(&mut self) {
        if self.avg_crack_score > 0.6 {
            self.crack_threshold = (self.crack_threshold + 0.02).min(0.70);
        } else if self.avg_crack_score < 0.3 {
            self.crack_threshold = (self.crack_threshold - 0.02).max(0.30);
        }

        if self.avg_yolo_conf > 0.6 {
            self.yolo_conf_threshold = (self.yolo_conf_threshold + 0.02).min(0.60);
        } else if self.avg_yolo_conf < 0.3 {
            self.yolo_conf_threshold = (self.yolo_conf_threshold - 0.02).max(0.25);
        }

        debug!(
            crack_thr = self.crack_threshold,
            conf_thr = self.yolo_conf_threshold,
            "adaptive thresholds updated"
        );
    }

    pub fn avg_yolo_conf(&self) -> f32 {
        self.avg_yolo_conf
    }

    pub fn avg_crack_score(&self) -> f32 {
        self.avg_crack_score
    }

    pub fn avg_agreement(&self) -> f32 {
        self.avg_agreement
    }

    pub fn yolo_conf_threshold(&self) -> f32 {
        self.yolo_conf_threshold
    }

    pub fn crack_threshold(&self) -> f32 {
        self.crack_threshold
    }
}

// ============================================================================
// Crack probability estimator
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct CrackInferenceOutput {
    pub fused_probability: f32,
    pub stability: f32,
    pub noise_index: f32,
}

/// Temporal crack probability model: EMA-smoothed score with variance
/// discount, noise suppression from sparsity vs luminance, motion
/// coherence, a persistence term and scene-stability damping. Fed by
/// Lane 2, surfaced as a metrics gauge.
pub struct CrackInferenceEstimator {
    ema: f32,
    variance: f32,
    persistence: f32,
    prev_sparsity: f32,
    scene_lum_ema: f32,
    initialized: bool,
}

impl CrackInferenceEstimator {
    pub fn new() -> Self {
        Self {
            ema: 0.0,
            variance: 0.0,
            persistence: 0.0,
            prev_sparsity: 0.0,
            scene_lum_ema: 0.0,
            initialized: false,
        }
    }

    pub fn update(
        &mut self,
        raw_crack: f32,
        sparsity: f32,
        luminance: f32,
        signature_conf: f32,
    ) -> CrackInferenceOutput {
        if !self.initialized {
            self.ema = raw_crack;
            self.scene_lum_ema = luminance;
            self.initialized = true;
        }

        const ALPHA: f32 = 0.15;
        self.ema = ALPHA * raw_crack + (1.0 - ALPHA) * self.ema;
        self.variance = 0.1 * (raw_crack - self.ema).abs() + 0.9 * self.variance;
        let stable_crack = (self.ema - 1.5 * self.variance).max(0.0);

        let noise_index = sparsity / luminance.max(0.01);
        let noise_suppression = (1.0 - noise_index).clamp(0.2, 1.0);

        let coherence = (1.0 - (sparsity - self.prev_sparsity).abs()).clamp(0.0, 1.0);
        self.prev_sparsity = sparsity;

        if stable_crack > 0.05 {
            self.persistence = (self.persistence + 0.1).min(1.0);
        } else {
            self.persistence *= 0.95;
        }

        self.scene_lum_ema = 0.05 * luminance + 0.95 * self.scene_lum_ema;
        let scene_change = (luminance - self.scene_lum_ema).abs();
        let scene_stability = (1.0 - scene_change * 2.0).clamp(0.0, 1.0);

        let mut fused = 0.40 * stable_crack
            + 0.20 * coherence
            + 0.20 * self.persistence
            + 0.20 * signature_conf;
        fused *= noise_suppression;
        fused *= scene_stability;

        CrackInferenceOutput {
            fused_probability: fused.clamp(0.0, 1.0),
            stability: self.persistence,
            noise_index,
        }
    }
}

impl Default for CrackInferenceEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_ring_percentiles() {
        let ring = LatencyRing::new(512);
        for i in 1..=100 {
            ring.record(i as f32);
        }
        let (p50, p95, p99) = ring.percentiles();
        assert_eq!(p50, 51.0);
        assert_eq!(p95, 96.0);
        assert_eq!(p99, 100.0);
        assert_eq!(ring.count(), 100);
    }

    #[test]
    fn test_latency_ring_overwrites_old_samples() {
        let ring = LatencyRing::new(8);
        for _ in 0..8 {
            ring.record(100.0);
        }
        for _ in 0..8 {
            ring.record(1.0);
        }
        let (p50, _, p99) = ring.percentiles();
        assert_eq!(p50, 1.0);
        assert_eq!(p99, 1.0);
    }

    #[test]
    fn test_crack_tracker_severity_bands() {
        let mut tracker = CrackTracker::new(CrackStatsConfig::default());
        // score 1.0 -> 3.0 mm -> Critical
        let critical = tracker.update(0.0, 1.0, 1.0);
        assert_eq!(critical.severity, Severity::Critical);
        assert!(critical.is_critical);

        // score 0.4 -> 1.2 mm -> Warning
        let warning = tracker.update(33.0, 0.4, 1.0);
        assert_eq!(warning.severity, Severity::Warning);

        // score 0.15 -> 0.45 mm -> Hairline
        let hairline = tracker.update(66.0, 0.15, 1.0);
        assert_eq!(hairline.severity, Severity::Hairline);

        // score 0.01 -> 0.03 mm -> None
        let none = tracker.update(99.0, 0.01, 1.0);
        assert_eq!(none.severity, Severity::None);
    }

    #[test]
    fn test_crack_tracker_ratios() {
        let mut tracker = CrackTracker::new(CrackStatsConfig::default());
        for i in 0..10 {
            let score = if i < 4 { 0.5 } else { 0.0 };
            tracker.update(i as f64 * 33.0, score, 1.0);
        }
        assert!((tracker.window_crack_ratio() - 0.4).abs() < 1e-6);
        assert!((tracker.global_crack_ratio() - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_crack_tracker_window_expiry() {
        let mut tracker = CrackTracker::new(CrackStatsConfig {
            window_ms: 100.0,
            ..Default::default()
        });
        tracker.update(0.0, 0.9, 1.0);
        tracker.update(500.0, 0.0, 1.0);
        // The old detection fell out of the window.
        assert_eq!(tracker.window_crack_ratio(), 0.0);
        assert!((tracker.global_crack_ratio() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_crack_trend_detects_growth() {
        let mut tracker = CrackTracker::new(CrackStatsConfig::default());
        for i in 0..20 {
            tracker.update(i as f64 * 33.0, i as f32 * 0.03, 1.0);
        }
        assert!(tracker.trend() > 0.0);
        assert!(tracker.growth_rate_mm_per_s(1.0) > 0.0);
    }

    #[test]
    fn test_detection_controller_thresholds_clamped() {
        let mut ctl = DetectionController::new(5000.0);
        for i in 0..100 {
            ctl.add_detection(i as f64 * 10.0, 0.9, 0.9);
            ctl.update_adaptive_thresholds();
        }
        assert!(ctl.crack_threshold() <= 0.70);
        assert!(ctl.yolo_conf_threshold() <= 0.60);

        for i in 100..300 {
            ctl.add_detection(i as f64 * 10.0, 0.1, 0.1);
            ctl.update_adaptive_thresholds();
        }
        assert!(ctl.crack_threshold() >= 0.30);
        assert!(ctl.yolo_conf_threshold() >= 0.25);
    }

    #[test]
    fn test_detection_controller_agreement() {
        let mut ctl = DetectionController::new(5000.0);
        ctl.add_detection(0.0, 0.8, 0.8);
        assert!((ctl.avg_agreement() - 1.0).abs() < 1e-6);
        ctl.add_detection(10.0, 0.9, 0.1);
        assert!((ctl.avg_agreement() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_crack_inference_estimator_bounded() {
        let mut est = CrackInferenceEstimator::new();
        for _ in 0..100 {
            let out = est.update(0.8, 0.2, 0.5, 0.9);
            assert!(out.fused_probability >= 0.0 && out.fused_probability <= 1.0);
        }
        // Persistent strong signal should push the probability well up.
        let out = est.update(0.8, 0.2, 0.5, 0.9);
        assert!(out.fused_probability > 0.3);
        assert!(out.stability > 0.9);
    }
}

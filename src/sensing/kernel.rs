// src/sensing/kernel.rs
//
// The deterministic sensing hot path. One call per frame, single-threaded,
// no heap allocation after construction. Fixed input resolution; a
// mismatched buffer is a contract violation answered with a sentinel
// frame_id of -1 and no other effect.

use crate::sensing::fusion::{FusionConfig, FusionResult, SemanticFusion};
use crate::transport::Snapshot;
use crate::types::{ControlOutput, SemanticSnapshot};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Sensing resolution. Input frames of any size are resized to this before
/// the kernel runs.
pub const TARGET_WIDTH: usize = 416;
pub const TARGET_HEIGHT: usize = 234;

pub fn target_width() -> usize {
    TARGET_WIDTH
}

pub fn target_height() -> usize {
    TARGET_HEIGHT
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Positive temporal delta above which an ON event fires.
    pub on_threshold: u8,
    /// Negative temporal delta below which an OFF event fires.
    pub off_threshold: u8,
    /// Horizontal gradient above which a ROI pixel contributes crack
    /// evidence.
    pub crack_gradient_threshold: u8,
    /// Lateral inhibition radius in both x and y.
    pub inhibition_radius: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            on_threshold: 8,
            off_threshold: 8,
            crack_gradient_threshold: 77,
            inhibition_radius: 3,
        }
    }
}

/// Per-frame sensing kernel: luminance conversion, temporal events with
/// causal lateral inhibition, bottom-third crack evidence, semantic fusion
/// and the control mapping, all in fixed-size preallocated buffers.
pub struct SensingKernel {
    width: usize,
    height: usize,
    cfg: KernelConfig,
    fusion: SemanticFusion,

    curr_luma: Vec<u8>,
    prev_luma: Vec<u8>,

    // Per-column row index of the most recent event of each polarity,
    // reset every frame. Drives the causal inhibition check.
    last_on_row: Vec<i32>,
    last_off_row: Vec<i32>,

    throttle_lut: [f32; 256],
    roi_start_row: usize,

    has_reference: bool,
}

impl SensingKernel {
    pub fn new(width: usize, height: usize, cfg: KernelConfig, fusion_cfg: FusionConfig) -> Self {
        let mut throttle_lut = [1.0f32; 256];
        for (i, slot) in throttle_lut.iter_mut().enumerate() {
            let fused = i as f32 / 255.0;
            *slot = if fused > 0.5 {
                0.3
            } else if fused > 0.2 {
                0.7
            } else {
                1.0
            };
        }

        Self {
            width,
            height,
            cfg,
            fusion: SemanticFusion::new(fusion_cfg),
            curr_luma: vec![0; width * height],
            prev_luma: vec![0; width * height],
            last_on_row: vec![i32::MIN / 2; width],
            last_off_row: vec![i32::MIN / 2; width],
            throttle_lut,
            roi_start_row: height - height / 3,
            has_reference: false,
        }
    }

    /// Drop the temporal reference so the next frame behaves like the first.
    pub fn reset(&mut self) {
        self.has_reference = false;
        self.fusion.reset();
    }

    /// Process one frame. `bgr` must be the sensing resolution exactly.
    pub fn process(
        &mut self,
        frame_id: u64,
        bgr: &[u8],
        height: usize,
        width: usize,
        now_s: f64,
        semantic: &Snapshot<SemanticSnapshot>,
    ) -> ControlOutput {
        if height != self.height || width != self.width || bgr.len() != width * height * 3 {
            warn!(
                expected_h = self.height,
                expected_w = self.width,
                got_h = height,
                got_w = width,
                "sensing kernel received wrong resolution, rejecting frame"
            );
            return ControlOutput::default();
        }

        // (a) BGR -> luminance, BT.709 in Q8 fixed point (54 + 183 + 19 = 256).
        for (pixel, luma) in bgr.chunks_exact(3).zip(self.curr_luma.iter_mut()) {
            let b = pixel[0] as u32;
            let g = pixel[1] as u32;
            let r = pixel[2] as u32;
            *luma = ((54 * r + 183 * g + 19 * b) >> 8) as u8;
        }

        let mut out = ControlOutput {
            frame_id: frame_id as i64,
            ..Default::default()
        };

        let mut on_count = 0u32;
        let mut off_count = 0u32;
        let mut crack_sum = 0.0f64;
        let mut roi_considered = 0u64;

        if self.has_reference {
            // (b) Temporal delta + events + crack evidence, single pass over
            // interior pixels.
            let t_on = self.cfg.on_threshold as i16;
            let t_off = self.cfg.off_threshold as i16;
            let t_crack = self.cfg.crack_gradient_threshold as i16;
            let r = self.cfg.inhibition_radius;

            for v in self.last_on_row.iter_mut() {
                *v = i32::MIN / 2;
            }
            for v in self.last_off_row.iter_mut() {
                *v = i32::MIN / 2;
            }

            for y in 1..self.height - 1 {
                let row = y * self.width;
                let in_roi = y >= self.roi_start_row;

                for x in 1..self.width - 1 {
                    let idx = row + x;
                    let curr = self.curr_luma[idx] as i16;
                    let delta = curr - self.prev_luma[idx] as i16;

                    if delta > t_on {
                        if !inhibited(&self.last_on_row, x, y as i32, r) {
                            self.last_on_row[x] = y as i32;
                            on_count += 1;
                        }
                    } else if delta < -t_off {
                        if !inhibited(&self.last_off_row, x, y as i32, r) {
                            self.last_off_row[x] = y as i32;
                            off_count += 1;
                        }
                    }

                    if in_roi {
                        roi_considered += 1;
                        let grad =
                            (self.curr_luma[idx + 1] as i16 - self.curr_luma[idx - 1] as i16).abs();
                        if grad > t_crack {
                            crack_sum += grad as f64 / 255.0;
                        }
                    }
                }
            }
            out.reference_frame_age = 1;
        } else {
            // First frame after reset: no temporal reference, null cycle.
            out.is_null_cycle = true;
        }

        // (c) Sparsity and raw crack evidence density.
        let total_pixels = (self.width * self.height) as f32;
        out.on_spike_count = on_count;
        out.off_spike_count = off_count;
        out.sparsity = (1.0 - (on_count + off_count) as f32 / total_pixels).clamp(0.0, 1.0);
        out.crack_score = if roi_considered > 0 {
            (crack_sum / roi_considered as f64) as f32
        } else {
            0.0
        };

        // (d) Semantic fusion against the last published snapshot.
        let fused: FusionResult = self.fusion.fuse(out.crack_score, now_s, semantic);
        out.fused_crack_score = fused.fused_crack;
        out.semantic_active = fused.semantic_active;
        out.semantic_age_ms = fused.semantic_age_ms;
        out.emergency_slow = fused.modifiers.emergency_slow;
        out.event_only_mode = !fused.semantic_active;

        // (e) Control mapping: LUT throttle scaled by the semantic speed
        // modifier, steer bias from the risk asymmetry.
        let lut_idx = (out.fused_crack_score * 255.0).clamp(0.0, 255.0) as usize;
        out.throttle = self.throttle_lut[lut_idx] * fused.modifiers.speed_scale;
        if fused.modifiers.emergency_slow {
            out.throttle = out.throttle.min(0.30);
        }
        out.steer = fused.modifiers.steer_bias;

        // (g) Current plane becomes the reference for the next frame.
        std::mem::swap(&mut self.curr_luma, &mut self.prev_luma);
        self.has_reference = true;

        out
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }
}

/// Causal inhibition check: an event at (x, y) is suppressed when any column
/// within +-radius already produced a same-polarity event in the last
/// `radius` rows, or earlier in the current row. Columns to the right of x
/// cannot yet hold a current-row entry, so a single row-recency comparison
/// covers the whole causal region.
#[inline]
fn inhibited(last_event_row: &[i32], x: usize, y: i32, radius: usize) -> bool {
    let lo = x.saturating_sub(radius);
    let hi = (x + radius).min(last_event_row.len() - 1);
    let cutoff = y - radius as i32;
    last_event_row[lo..=hi].iter().any(|&row| row >= cutoff)
}

/// Shared luminance helper for descriptor extraction (same Q8 BT.709
/// weights as the kernel).
pub fn bgr_to_luma(bgr: &[u8], out: &mut Vec<u8>) {
    out.clear();
    out.extend(bgr.chunks_exact(3).map(|p| {
        let b = p[0] as u32;
        let g = p[1] as u32;
        let r = p[2] as u32;
        ((54 * r + 183 * g + 19 * b) >> 8) as u8
    }));
}

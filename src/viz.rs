// src/viz.rs
//
// Lane 5 support: metric overlay drawn straight onto the BGR buffer, the
// encoder seam, and the rolling bitrate estimate. Codec failures never
// propagate past the lane boundary.

use crate::types::Severity;
use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

// BGR colors.
const RED: [u8; 3] = [0, 0, 255];
const GREEN: [u8; 3] = [0, 255, 0];
const YELLOW: [u8; 3] = [0, 255, 255];
const ORANGE: [u8; 3] = [0, 128, 255];
const WHITE: [u8; 3] = [255, 255, 255];

/// External frame encoder interface, invoked from Lane 5 only.
pub trait FrameEncoder: Send {
    fn encode(&mut self, bgr: &[u8], width: usize, height: usize) -> Result<Vec<u8>>;
}

/// Default JPEG encoder.
pub struct JpegFrameEncoder {
    quality: u8,
    rgb_scratch: Vec<u8>,
}

impl JpegFrameEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
            rgb_scratch: Vec::new(),
        }
    }
}

impl Default for JpegFrameEncoder {
    fn default() -> Self {
        Self::new(70)
    }
}

impl FrameEncoder for JpegFrameEncoder {
    fn encode(&mut self, bgr: &[u8], width: usize, height: usize) -> Result<Vec<u8>> {
        anyhow::ensure!(
            bgr.len() == width * height * 3,
            "encoder buffer size mismatch"
        );

        self.rgb_scratch.clear();
        self.rgb_scratch.reserve(bgr.len());
        for pixel in bgr.chunks_exact(3) {
            self.rgb_scratch.push(pixel[2]);
            self.rgb_scratch.push(pixel[1]);
            self.rgb_scratch.push(pixel[0]);
        }

        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, self.quality)
            .encode(
                &self.rgb_scratch,
                width as u32,
                height as u32,
                ExtendedColorType::Rgb8,
            )
            .context("jpeg encode failed")?;
        Ok(out)
    }
}

/// Draw the metric overlay in place: crack bar (red, top), sparsity bar
/// (green, below it), severity marker (bottom-left block) and spike-count
/// tick rows along the bottom edge.
pub fn render_overlay(
    bgr: &mut [u8],
    width: usize,
    height: usize,
    crack_score: f32,
    sparsity: f32,
    severity: Severity,
    on_count: u32,
    off_count: u32,
) {
    if bgr.len() != width * height * 3 || height < 32 || width < 32 {
        return;
    }

    let crack_w = (crack_score.clamp(0.0, 1.0) * width as f32) as usize;
    fill_rect(bgr, width, 0, 0, crack_w, 8, RED);

    let sparsity_w = (sparsity.clamp(0.0, 1.0) * width as f32) as usize;
    fill_rect(bgr, width, 0, 10, sparsity_w, 8, GREEN);

    let severity_color = match severity {
        Severity::Critical => RED,
        Severity::Warning => ORANGE,
        Severity::Hairline => YELLOW,
        Severity::None => GREEN,
    };
    fill_rect(bgr, width, 2, height - 14, 12, 12, severity_color);

    // One tick per 64 events, capped at the frame width.
    let on_ticks = ((on_count / 64) as usize).min(width.saturating_sub(20));
    fill_rect(bgr, width, 18, height - 6, on_ticks, 2, WHITE);
    let off_ticks = ((off_count / 64) as usize).min(width.saturating_sub(20));
    fill_rect(bgr, width, 18, height - 3, off_ticks, 2, WHITE);
}

fn fill_rect(
    bgr: &mut [u8],
    stride: usize,
    x0: usize,
    y0: usize,
    w: usize,
    h: usize,
    color: [u8; 3],
) {
    if w == 0 || h == 0 {
        return;
    }
    let rows = bgr.len() / (stride * 3);
    for y in y0..(y0 + h).min(rows) {
        let row = y * stride;
        for x in x0..(x0 + w).min(stride) {
            let idx = (row + x) * 3;
            bgr[idx..idx + 3].copy_from_slice(&color);
        }
    }
}

/// Exponentially smoothed output bitrate estimate for the encoded stream.
pub struct BitrateTracker {
    ema_mbps: f32,
    last_stamp_s: f64,
}

impl BitrateTracker {
    pub fn new() -> Self {
        Self {
            ema_mbps: 0.0,
            last_stamp_s: 0.0,
        }
    }

    pub fn update(&mut self, bytes: usize, now_s: f64) -> f32 {
        if self.last_stamp_s > 0.0 {
            let dt = (now_s - self.last_stamp_s).max(1e-3);
            let instant_mbps = (bytes as f64 * 8.0 / dt / 1_000_000.0) as f32;
            self.ema_mbps = if self.ema_mbps == 0.0 {
                instant_mbps
            } else {
                0.9 * self.ema_mbps + 0.1 * instant_mbps
            };
        }
        self.last_stamp_s = now_s;
        self.ema_mbps
    }

    pub fn mbps(&self) -> f32 {
        self.ema_mbps
    }
}

impl Default for BitrateTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jpeg_encoder_produces_jpeg() {
        let mut enc = JpegFrameEncoder::new(70);
        let frame = vec![90u8; 64 * 48 * 3];
        let jpeg = enc.encode(&frame, 64, 48).unwrap();
        assert!(!jpeg.is_empty());
        // JPEG SOI marker.
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_jpeg_encoder_rejects_bad_buffer() {
        let mut enc = JpegFrameEncoder::new(70);
        assert!(enc.encode(&[0u8; 10], 64, 48).is_err());
    }

    #[test]
    fn test_overlay_draws_bars() {
        let width = 64;
        let height = 48;
        let mut frame = vec![0u8; width * height * 3];
        render_overlay(&mut frame, width, height, 0.5, 1.0, Severity::None, 0, 0);

        // Crack bar: red in BGR is (0, 0, 255) at row 0.
        assert_eq!(&frame[0..3], &[0, 0, 255]);
        // Half-width bar: pixel past the midpoint is untouched.
        let past = (width / 2 + 1) * 3;
        assert_eq!(&frame[past..past + 3], &[0, 0, 0]);
        // Sparsity bar at row 10 spans the full width.
        let row10 = 10 * width * 3;
        assert_eq!(&frame[row10..row10 + 3], &[0, 255, 0]);
    }

    #[test]
    fn test_overlay_ignores_tiny_frames() {
        let mut frame = vec![7u8; 8 * 8 * 3];
        render_overlay(&mut frame, 8, 8, 1.0, 1.0, Severity::Critical, 10, 10);
        assert!(frame.iter().all(|&p| p == 7));
    }

    #[test]
    fn test_bitrate_tracker_smooths() {
        let mut tracker = BitrateTracker::new();
        assert_eq!(tracker.update(10_000, 1.0), 0.0);
        let first = tracker.update(10_000, 1.033);
        assert!(first > 0.0);
        for i in 2..50 {
            tracker.update(10_000, 1.0 + i as f64 * 0.033);
        }
        // ~10 kB per 33 ms is roughly 2.4 Mbps.
        assert!(tracker.mbps() > 1.0 && tracker.mbps() < 5.0);
    }
}

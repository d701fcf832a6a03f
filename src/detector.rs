// src/detector.rs
//
// Seam to the external object-detection model. The engine never links the
// model itself; Lane 3 drives whatever implementation is plugged in and
// consumes only the risk summary.

use anyhow::Result;

/// One inference pass over a full-resolution BGR frame, reduced to the risk
/// summary the sensing hot path fuses from. All risks are in [0, 1].
#[derive(Debug, Clone, Copy, Default)]
pub struct DetectionSummary {
    pub front_risk: f32,
    pub left_risk: f32,
    pub right_risk: f32,
    pub crack_risk: f32,
    pub min_distance_m: f32,
    pub max_confidence: f32,
    pub num_detections: u32,
    pub priority_detections: u32,
    pub num_filtered_out: u32,
    pub latency_ms: f32,
}

/// External detector interface, invoked from Lane 3 only.
pub trait SemanticDetector: Send {
    fn detect(&mut self, bgr: &[u8], width: usize, height: usize) -> Result<DetectionSummary>;
}

/// Detector stand-in that sees nothing. Used when no model is configured
/// and in tests; the engine then runs in event-only mode.
#[derive(Debug, Default)]
pub struct NoopDetector;

impl SemanticDetector for NoopDetector {
    fn detect(&mut self, _bgr: &[u8], _width: usize, _height: usize) -> Result<DetectionSummary> {
        Ok(DetectionSummary::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_detector_reports_nothing() {
        let mut det = NoopDetector;
        let summary = det.detect(&[0u8; 12], 2, 2).unwrap();
        assert_eq!(summary.num_detections, 0);
        assert_eq!(summary.front_risk, 0.0);
    }
}

// src/uplink.rs
//
// Lane 4 serialization. Uplink bytes are opaque to the core; JSON keeps the
// payload self-describing for whatever transport sits behind the sink.

use crate::metrics::MetricsSnapshot;
use crate::types::{ControlDecision, UplinkPayload};
use anyhow::Result;

/// Destination for serialized uplink records. External collaborator; the
/// engine logs and continues when it fails.
pub trait UplinkSink: Send {
    fn send(&mut self, bytes: &[u8]) -> Result<()>;
}

/// Default sink that discards everything (bench runs, tests).
#[derive(Debug, Default)]
pub struct NullSink;

impl UplinkSink for NullSink {
    fn send(&mut self, _bytes: &[u8]) -> Result<()> {
        Ok(())
    }
}

pub struct UplinkSerializer;

impl UplinkSerializer {
    pub fn payload_to_json(payload: &UplinkPayload) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(payload)?)
    }

    pub fn decision_to_json(decision: &ControlDecision) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(decision)?)
    }

    pub fn metrics_to_json(snapshot: &MetricsSnapshot) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(snapshot)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Action, FailsafeStatus, Severity};

    #[test]
    fn test_payload_json_fields() {
        let payload = UplinkPayload {
            frame_id: 42,
            timestamp: 1.5,
            throttle: 0.7,
            steer: -0.1,
            crack_score: 0.25,
            sparsity: 0.9,
            action: Action::Caution,
            control_latency_ms: 2.5,
            crack_severity: Severity::Hairline,
            crack_width_mm: 0.4,
            failsafe_status: FailsafeStatus::Ok,
            sig_conf: 0.8,
            yolo_count: 3,
            latency_violations: 0,
        };
        let bytes = UplinkSerializer::payload_to_json(&payload).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("\"frame_id\":42"));
        assert!(text.contains("\"action\":\"CAUTION\""));
        assert!(text.contains("\"failsafe_status\":\"OK\""));
        assert!(text.contains("\"crack_severity\":\"Hairline\""));
    }
}

// src/lib.rs
//
// Realtime crack-inspection engine: a six-lane fan-out pipeline that turns a
// camera stream into per-frame control decisions and periodic telemetry,
// with a deterministic event-based sensing hot path and adaptively gated
// semantic inference.

pub mod config;
pub mod detector;
pub mod engine;
pub mod failsafe;
pub mod gating;
pub mod metrics;
pub mod sensing;
pub mod signature;
pub mod stats;
pub mod transport;
pub mod types;
pub mod uplink;
pub mod viz;

pub use config::Config;
pub use detector::{DetectionSummary, NoopDetector, SemanticDetector};
pub use engine::{InspectionEngine, monotonic_s};
pub use gating::{GateDecision, GateReason, GatingEngine};
pub use metrics::MetricsSnapshot;
pub use sensing::kernel::{target_height, target_width};
pub use types::{Action, ControlDecision, FailsafeStatus, Severity, UplinkPayload};
pub use uplink::{NullSink, UplinkSink};
pub use viz::{FrameEncoder, JpegFrameEncoder};

// src/engine/lanes.rs
//
// The six lane loops. Each lane owns its endpoints outright; everything
// cross-lane goes through the rings, the snapshot channels or the shared
// atomics. Every loop observes the running flag at its head and returns,
// which is all stop() needs to join the engine.

use super::{monotonic_s, EngineShared};
use crate::config::EngineOptions;
use crate::gating::{GateReason, GatingEngine};
use crate::sensing::kernel::{SensingKernel, TARGET_HEIGHT, TARGET_WIDTH};
use crate::sensing::resize::resize_area_bgr;
use crate::signature::descriptors;
use crate::stats::{CrackInferenceEstimator, CrackTracker, DetectionController};
use crate::transport::{Consumer, Producer, SnapshotReader, SnapshotWriter};
use crate::types::{
    Action, CallbackJob, ControlDecision, ControlOutput, CrackMetrics, FrameJob, SemanticJob,
    SemanticSnapshot, SemanticState, SignatureMatch, UplinkPayload, VisJob,
};
use crate::uplink::{UplinkSerializer, UplinkSink};
use crate::viz::{render_overlay, BitrateTracker, FrameEncoder};

use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const LANE1_POP_TIMEOUT: Duration = Duration::from_millis(10);
const LANE2_POP_TIMEOUT: Duration = Duration::from_millis(50);
const LANE3_POP_TIMEOUT: Duration = Duration::from_millis(100);
const LANE4_POP_TIMEOUT: Duration = Duration::from_millis(50);
const LANE5_POP_TIMEOUT: Duration = Duration::from_millis(100);
const LANE6_POP_TIMEOUT: Duration = Duration::from_millis(10);

const UPLINK_BATCH: usize = 16;

// ============================================================================
// Lane 1: sensing hot path
// ============================================================================

pub(crate) struct Lane1 {
    pub shared: Arc<EngineShared>,
    pub camera_rx: Consumer<FrameJob>,
    pub sig_tx: Producer<FrameJob>,
    pub sem_tx: Producer<SemanticJob>,
    pub vis_tx: Producer<VisJob>,
    pub uplink_tx: Producer<UplinkPayload>,
    pub cb_tx: Arc<Mutex<Producer<CallbackJob>>>,
    pub semantic_rx: SnapshotReader<SemanticSnapshot>,
    pub sig_rx: SnapshotReader<SignatureMatch>,
    pub kernel: SensingKernel,
    pub gating: GatingEngine,
    pub tracker: CrackTracker,
    pub options: EngineOptions,
}

impl Lane1 {
    pub fn run(mut self) {
        let mut last_gate_skip = false;

        while self.shared.running.load(Ordering::Relaxed) {
            let job = match self.camera_rx.pop_wait(LANE1_POP_TIMEOUT) {
                Some(job) => job,
                None => continue,
            };

            let t0 = Instant::now();
            let now_s = monotonic_s();
            let now_ms = now_s * 1000.0;

            // Resize exactly once to the sensing resolution; the kernel
            // requires a contiguous buffer of that exact shape.
            let resized = if job.height != TARGET_HEIGHT || job.width != TARGET_WIDTH {
                resize_area_bgr(
                    &job.frame_bgr,
                    job.width,
                    job.height,
                    TARGET_WIDTH,
                    TARGET_HEIGHT,
                )
            } else {
                job.frame_bgr.clone()
            };

            let semantic_snap = self.semantic_rx.read();
            let mut out = self.kernel.process(
                job.frame_id,
                &resized,
                TARGET_HEIGHT,
                TARGET_WIDTH,
                now_s,
                &semantic_snap,
            );
            if out.frame_id < 0 {
                // Resolution contract violation: fatal to this frame only.
                continue;
            }
            out.inference_suppressed = last_gate_skip;

            let lane1_ms = t0.elapsed().as_secs_f64() * 1000.0;
            self.shared.latency.record(lane1_ms as f32);
            if lane1_ms > self.options.max_control_latency_ms {
                self.shared
                    .metrics
                    .latency_violations
                    .fetch_add(1, Ordering::Relaxed);
            }

            let metrics = &self.shared.metrics;
            metrics.last_crack.store(out.crack_score);
            metrics.fused_crack.store(out.fused_crack_score);
            if out.fused_crack_score > 0.1 {
                metrics.crack_frames.fetch_add(1, Ordering::Relaxed);
            }

            let px_to_mm = metrics.px_to_mm_scale.load();
            let crack_metrics = self.tracker.update(now_ms, out.fused_crack_score, px_to_mm);
            metrics
                .window_crack_ratio
                .store(self.tracker.window_crack_ratio());
            metrics
                .global_crack_ratio
                .store(self.tracker.global_crack_ratio());
            metrics.vis_crack_width_mm.store(crack_metrics.width_mm);
            metrics.vis_crack_length_mm.store(crack_metrics.length_mm);

            self.shared.failsafe.update(0, lane1_ms as f32, now_ms);
            self.shared.failsafe.evaluate(now_ms);

            // Signature confidence, refreshed against the live bank state
            // (shared lock only) with the crack growth context folded in.
            let sig_snap = self.sig_rx.read().value;
            let growth_risk = self.tracker.growth_rate_mm_per_s(px_to_mm).clamp(0.0, 1.0);
            let growth_accel = self.tracker.growth_acceleration(px_to_mm).clamp(0.0, 1.0);
            let sig_conf = self.shared.bank.compute_confidence(
                sig_snap.matched,
                sig_snap.id,
                sig_snap.distance,
                sig_snap.structural_distance,
                growth_risk,
                growth_accel,
            );
            let sig = SignatureMatch {
                confidence: sig_conf,
                ..sig_snap
            };

            let force = self.shared.force_infer.swap(false, Ordering::Relaxed);
            let gate = self
                .gating
                .decide(&sig, now_ms, out.fused_crack_score, force);
            last_gate_skip = !gate.should_infer;

            // --- Fan out: Lane 2 (signature) ---
            if self.options.enable_signature_lane {
                let _ = self.sig_tx.try_push(FrameJob {
                    frame_id: job.frame_id,
                    height: TARGET_HEIGHT,
                    width: TARGET_WIDTH,
                    crack_score: out.fused_crack_score,
                    frame_bgr: resized.clone(),
                });
            }

            // --- Fan out: Lane 3 (semantic, gated; full resolution) ---
            if gate.should_infer && self.options.enable_semantic_lane {
                let _ = self.sem_tx.try_push(SemanticJob {
                    frame_id: job.frame_id,
                    height: job.height,
                    width: job.width,
                    timestamp_s: now_s,
                    crack_score: out.fused_crack_score,
                    sparsity: out.sparsity,
                    target_hz: self.options.semantic_target_hz,
                    reason: gate.reason,
                    frame_bgr: job.frame_bgr.clone(),
                });
            }

            // --- Fan out: Lane 5 (visualization) ---
            if self.options.enable_viz_lane {
                let _ = self.vis_tx.try_push(VisJob {
                    frame_id: job.frame_id,
                    height: TARGET_HEIGHT,
                    width: TARGET_WIDTH,
                    crack_score: out.fused_crack_score,
                    sparsity: out.sparsity,
                    severity: crack_metrics.severity,
                    on_count: out.on_spike_count,
                    off_count: out.off_spike_count,
                    frame_bgr: resized,
                });
            }

            let decision = make_decision(&out, sig_conf, &crack_metrics, now_s, lane1_ms);

            // CONTROL goes to the dispatcher before the sibling uplink
            // record enters Lane 4, so a frame's CONTROL callback always
            // precedes its UPLINK callback.
            {
                let mut cb = self.cb_tx.lock();
                let _ = cb.try_push(CallbackJob::Control(decision.clone()));
            }

            if self.options.enable_uplink_lane {
                let payload = UplinkPayload {
                    frame_id: out.frame_id,
                    timestamp: now_s,
                    throttle: decision.throttle,
                    steer: decision.steer,
                    crack_score: out.fused_crack_score,
                    sparsity: out.sparsity,
                    action: decision.action,
                    control_latency_ms: lane1_ms,
                    crack_severity: crack_metrics.severity,
                    crack_width_mm: crack_metrics.width_mm,
                    failsafe_status: self.shared.failsafe.status(),
                    sig_conf,
                    yolo_count: metrics.yolo_count.load(Ordering::Relaxed),
                    latency_violations: metrics.latency_violations.load(Ordering::Relaxed),
                };
                let _ = self.uplink_tx.try_push(payload);
            }

            self.shared.record_benchmark(1, out.frame_id, lane1_ms as f32);
        }
    }
}

fn make_decision(
    out: &ControlOutput,
    sig_conf: f32,
    crack_metrics: &CrackMetrics,
    timestamp: f64,
    latency_ms: f64,
) -> ControlDecision {
    ControlDecision {
        frame_id: out.frame_id,
        timestamp,
        throttle: out.throttle,
        steer: out.steer,
        action: Action::from_score(out.fused_crack_score),
        crack_score: out.fused_crack_score,
        sparsity: out.sparsity,
        confidence: sig_conf,
        semantic_active: out.semantic_active,
        semantic_age_ms: out.semantic_age_ms,
        is_null_cycle: out.is_null_cycle,
        inference_suppressed: out.inference_suppressed,
        event_only_mode: out.event_only_mode,
        reference_frame_age: out.reference_frame_age,
        control_latency_ms: latency_ms,
        crack_width_mm: crack_metrics.width_mm,
        crack_length_mm: crack_metrics.length_mm,
        crack_severity: crack_metrics.severity,
        crack_confidence_percent: crack_metrics.confidence_percent,
    }
}

// ============================================================================
// Lane 2: signature matching
// ============================================================================

pub(crate) struct Lane2 {
    pub shared: Arc<EngineShared>,
    pub sig_rx: Consumer<FrameJob>,
    pub sig_match_tx: SnapshotWriter<SignatureMatch>,
    pub estimator: CrackInferenceEstimator,
}

impl Lane2 {
    pub fn run(mut self) {
        let mut luma = Vec::new();
        let mut prev_profile: Option<descriptors::RawProfile> = None;

        while self.shared.running.load(Ordering::Relaxed) {
            let job = match self.sig_rx.pop_wait(LANE2_POP_TIMEOUT) {
                Some(job) => job,
                None => continue,
            };
            if job.frame_bgr.is_empty() {
                continue;
            }

            let t0 = Instant::now();
            crate::sensing::kernel::bgr_to_luma(&job.frame_bgr, &mut luma);
            let (desc, profile) = descriptors::extract(
                &luma,
                job.width,
                job.height,
                job.crack_score,
                prev_profile.as_ref().map(|p| p.bands.as_slice()),
            );

            let now_s = monotonic_s();
            let result = self
                .shared
                .bank
                .find_match(&desc, profile.avg_luminance, now_s);

            // Unmatched scenes showing crack activity become new signatures.
            if !result.matched && job.crack_score > 0.05 {
                let id = self
                    .shared
                    .bank
                    .register(&desc, job.crack_score, profile.avg_luminance, now_s);
                debug!(id, crack = job.crack_score, "registered new signature");
            }

            let sig_match = self.shared.bank.to_signature_match(&result, 0.0, 0.0);
            self.sig_match_tx.publish(sig_match);

            self.shared.metrics.sig_conf.store(sig_match.confidence);
            self.shared
                .metrics
                .sig_updates
                .fetch_add(1, Ordering::Relaxed);

            let estimate = self.estimator.update(
                job.crack_score,
                1.0 - profile.avg_luminance,
                profile.avg_luminance,
                sig_match.confidence,
            );
            self.shared
                .metrics
                .crack_probability
                .store(estimate.fused_probability);

            prev_profile = Some(profile);

            self.shared.record_benchmark(
                2,
                job.frame_id as i64,
                t0.elapsed().as_secs_f64() as f32 * 1000.0,
            );
        }
    }
}

// ============================================================================
// Lane 3: gated semantic inference
// ============================================================================

pub(crate) struct Lane3 {
    pub shared: Arc<EngineShared>,
    pub sem_rx: Consumer<SemanticJob>,
    pub semantic_tx: SnapshotWriter<SemanticSnapshot>,
    pub state_tx: SnapshotWriter<SemanticState>,
    pub sig_rx: SnapshotReader<SignatureMatch>,
    pub detector: Box<dyn crate::detector::SemanticDetector>,
    pub controller: DetectionController,
}

impl Lane3 {
    pub fn run(mut self) {
        let mut yolo_hz = 0.0f32;
        let mut last_publish_s = 0.0f64;

        while self.shared.running.load(Ordering::Relaxed) {
            let job = match self.sem_rx.pop_wait(LANE3_POP_TIMEOUT) {
                Some(job) => job,
                None => continue,
            };

            let t0 = Instant::now();

            // Late skip: confidence may have recovered between enqueue and
            // pop. Forced and critical-crack jobs are never dropped.
            let bypass = matches!(
                job.reason,
                GateReason::ForcedInfer | GateReason::CriticalCrack
            );
            if !bypass {
                let sig = self.sig_rx.read().value;
                let conf_thr = self.shared.gating_config.confidence_threshold.load();
                if sig.matched && sig.confidence >= conf_thr {
                    debug!(frame = job.frame_id, "dropping stale semantic job");
                    continue;
                }
            }

            match self
                .detector
                .detect(&job.frame_bgr, job.width, job.height)
            {
                Ok(summary) => {
                    let now_s = monotonic_s();

                    self.semantic_tx.publish(SemanticSnapshot {
                        valid: true,
                        timestamp_s: now_s,
                        front_risk: summary.front_risk,
                        left_risk: summary.left_risk,
                        right_risk: summary.right_risk,
                        crack_risk: summary.crack_risk,
                        min_distance_m: summary.min_distance_m,
                        max_confidence: summary.max_confidence,
                        num_detections: summary.num_detections,
                        priority_detections: summary.priority_detections,
                        num_filtered_out: summary.num_filtered_out,
                    });
                    self.state_tx.publish(SemanticState {
                        frame_id: job.frame_id,
                        timestamp_ms: now_s * 1000.0,
                    });

                    let metrics = &self.shared.metrics;
                    metrics.yolo_count.fetch_add(1, Ordering::Relaxed);
                    metrics.last_yolo_stamp_s.store(now_s);

                    if last_publish_s > 0.0 {
                        let dt = now_s - last_publish_s;
                        if dt > 1e-4 {
                            let instant = (1.0 / dt) as f32;
                            yolo_hz = if yolo_hz == 0.0 {
                                instant
                            } else {
                                0.8 * yolo_hz + 0.2 * instant
                            };
                        }
                    }
                    last_publish_s = now_s;
                    metrics.yolo_hz.store(yolo_hz);

                    self.controller.add_detection(
                        now_s * 1000.0,
                        summary.max_confidence,
                        job.crack_score,
                    );
                    self.controller.update_adaptive_thresholds();
                    metrics.avg_yolo_conf.store(self.controller.avg_yolo_conf());
                    metrics
                        .avg_crack_score
                        .store(self.controller.avg_crack_score());
                    metrics.avg_agreement.store(self.controller.avg_agreement());
                    metrics
                        .yolo_conf_thr
                        .store(self.controller.yolo_conf_threshold());
                    metrics
                        .crack_alert_thr
                        .store(self.controller.crack_threshold());
                }
                Err(err) => {
                    // External collaborator failure: Lane 1 keeps reading
                    // the last valid snapshot.
                    warn!(frame = job.frame_id, "semantic detector failed: {err:#}");
                }
            }

            self.shared.record_benchmark(
                3,
                job.frame_id as i64,
                t0.elapsed().as_secs_f64() as f32 * 1000.0,
            );
        }
    }
}

// ============================================================================
// Lane 4: uplink serialization
// ============================================================================

pub(crate) struct Lane4 {
    pub shared: Arc<EngineShared>,
    pub uplink_rx: Consumer<UplinkPayload>,
    pub cb_tx: Arc<Mutex<Producer<CallbackJob>>>,
    pub sink: Box<dyn UplinkSink>,
}

impl Lane4 {
    pub fn run(mut self) {
        let mut batch: Vec<UplinkPayload> = Vec::with_capacity(UPLINK_BATCH);

        while self.shared.running.load(Ordering::Relaxed) {
            let first = match self.uplink_rx.pop_wait(LANE4_POP_TIMEOUT) {
                Some(payload) => payload,
                None => continue,
            };

            let t0 = Instant::now();
            batch.clear();
            batch.push(first);
            self.uplink_rx.try_pop_batch(&mut batch, UPLINK_BATCH - 1);

            let mut last_frame_id = 0i64;
            for payload in batch.drain(..) {
                last_frame_id = payload.frame_id;

                match UplinkSerializer::payload_to_json(&payload) {
                    Ok(bytes) => {
                        if let Err(err) = self.sink.send(&bytes) {
                            warn!(frame = payload.frame_id, "uplink sink failed: {err:#}");
                        }
                    }
                    Err(err) => {
                        warn!(frame = payload.frame_id, "uplink serialization failed: {err:#}");
                    }
                }

                self.shared
                    .metrics
                    .uplink_count
                    .fetch_add(1, Ordering::Relaxed);

                let mut cb = self.cb_tx.lock();
                let _ = cb.try_push(CallbackJob::Uplink(payload));
            }

            self.shared.record_benchmark(
                4,
                last_frame_id,
                t0.elapsed().as_secs_f64() as f32 * 1000.0,
            );
        }
    }
}

// ============================================================================
// Lane 5: visualization
// ============================================================================

pub(crate) struct Lane5 {
    pub shared: Arc<EngineShared>,
    pub vis_rx: Consumer<VisJob>,
    pub encoder: Box<dyn FrameEncoder>,
    pub bitrate: BitrateTracker,
}

impl Lane5 {
    pub fn run(mut self) {
        while self.shared.running.load(Ordering::Relaxed) {
            let mut job = match self.vis_rx.pop_wait(LANE5_POP_TIMEOUT) {
                Some(job) => job,
                None => continue,
            };
            if job.frame_bgr.is_empty() {
                continue;
            }

            let t0 = Instant::now();
            render_overlay(
                &mut job.frame_bgr,
                job.width,
                job.height,
                job.crack_score,
                job.sparsity,
                job.severity,
                job.on_count,
                job.off_count,
            );

            match self.encoder.encode(&job.frame_bgr, job.width, job.height) {
                Ok(encoded) => {
                    *self.shared.vis_jpeg.lock() = encoded;

                    // Rolling event-stream bitrate estimate: two bytes per
                    // spike (position byte + polarity byte).
                    let spike_bytes = ((job.on_count + job.off_count) * 2) as usize;
                    let mbps = self.bitrate.update(spike_bytes, monotonic_s());
                    self.shared.metrics.spike_bitrate_mbps.store(mbps);
                }
                Err(err) => {
                    warn!(frame = job.frame_id, "viz encode failed: {err:#}");
                }
            }

            self.shared.record_benchmark(
                5,
                job.frame_id as i64,
                t0.elapsed().as_secs_f64() as f32 * 1000.0,
            );
        }
    }
}

// ============================================================================
// Lane 6: callback dispatcher
// ============================================================================

pub(crate) struct Lane6 {
    pub shared: Arc<EngineShared>,
    pub cb_rx: Consumer<CallbackJob>,
    pub control_cb: super::ControlCallback,
    pub uplink_cb: super::UplinkCallback,
}

impl Lane6 {
    pub fn run(mut self) {
        while self.shared.running.load(Ordering::Relaxed) {
            let job = match self.cb_rx.pop_wait(LANE6_POP_TIMEOUT) {
                Some(job) => job,
                None => continue,
            };
            // User hooks may block; that only stalls this lane.
            match job {
                CallbackJob::Control(decision) => (self.control_cb)(&decision),
                CallbackJob::Uplink(payload) => (self.uplink_cb)(&payload),
            }
        }
    }
}

// src/engine/mod.rs
//
// The six-lane engine. Lane 1 owns the sensing hot path and fans frames out
// to the signature, semantic, uplink and visualization lanes over bounded
// SPSC rings; Lane 6 drains the merged callback queue so user hooks can
// block without touching the hot path.
//
//   L1 sensing     camera ring -> kernel -> gating -> fan-out
//   L2 signature   sig ring    -> descriptors -> bank -> match snapshot
//   L3 semantic    sem ring    -> detector -> semantic snapshot
//   L4 uplink      uplink ring -> serializer -> sink -> UPLINK callback
//   L5 viz         vis ring    -> overlay -> encoder -> latest-blob mutex
//   L6 dispatch    callback ring -> user hooks
//
// The callback ring is MPSC by construction (L1 and L4 both feed it), so
// its producer handle sits behind a dedicated mutex; dispatch stays a
// single lock-free consumer.

mod lanes;

use crate::config::Config;
use crate::detector::{NoopDetector, SemanticDetector};
use crate::failsafe::{control_latency_signal, FailsafeMonitor};
use crate::gating::{GatingConfig, GatingEngine, GatingStats, GatingStatsSnapshot};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::sensing::fusion::SEMANTIC_AGE_ABSENT_MS;
use crate::sensing::kernel::{SensingKernel, TARGET_HEIGHT, TARGET_WIDTH};
use crate::signature::SignatureBank;
use crate::stats::{CrackTracker, LatencyRing};
use crate::transport::{ring, snapshot_channel, Consumer, Producer, SnapshotReader, SnapshotWriter};
use crate::types::{
    Action, BenchmarkSample, BenchmarkSuite, CallbackJob, ControlDecision, FrameJob,
    SemanticSnapshot, SemanticState, SignatureMatch, UplinkPayload, VisJob,
};
use crate::uplink::{NullSink, UplinkSink};
use crate::viz::{FrameEncoder, JpegFrameEncoder};

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{info, warn};

pub const CAMERA_QUEUE_CAP: usize = 64;
pub const SIG_QUEUE_CAP: usize = 64;
pub const SEMANTIC_QUEUE_CAP: usize = 32;
pub const UPLINK_QUEUE_CAP: usize = 128;
pub const VIS_QUEUE_CAP: usize = 32;
pub const CALLBACK_QUEUE_CAP: usize = 64;

pub type ControlCallback = Arc<dyn Fn(&ControlDecision) + Send + Sync>;
pub type UplinkCallback = Arc<dyn Fn(&UplinkPayload) + Send + Sync>;

/// Monotonic seconds since process start. All engine timestamps live on
/// this clock.
pub fn monotonic_s() -> f64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// State shared by the lanes and the public accessors.
pub(crate) struct EngineShared {
    pub running: AtomicBool,
    pub force_infer: AtomicBool,
    pub metrics: EngineMetrics,
    pub latency: LatencyRing,
    pub bank: SignatureBank,
    pub gating_config: Arc<GatingConfig>,
    pub failsafe: FailsafeMonitor,
    pub vis_jpeg: Mutex<Vec<u8>>,
    pub benchmark: Mutex<BenchmarkSuite>,
}

impl EngineShared {
    pub(crate) fn record_benchmark(&self, lane: u8, frame_id: i64, latency_ms: f32) {
        let mut suite = self.benchmark.lock();
        suite.add(BenchmarkSample {
            lane,
            frame_id,
            latency_ms,
            yolo_ran: lane == 3,
        });
    }
}

/// Everything the lane threads take ownership of at start().
struct LaneEndpoints {
    camera_rx: Consumer<FrameJob>,
    sig_tx: Producer<FrameJob>,
    sig_rx: Consumer<FrameJob>,
    sem_tx: Producer<crate::types::SemanticJob>,
    sem_rx: Consumer<crate::types::SemanticJob>,
    uplink_tx: Producer<UplinkPayload>,
    uplink_rx: Consumer<UplinkPayload>,
    vis_tx: Producer<VisJob>,
    vis_rx: Consumer<VisJob>,
    cb_tx: Arc<Mutex<Producer<CallbackJob>>>,
    cb_rx: Consumer<CallbackJob>,
    semantic_tx: SnapshotWriter<SemanticSnapshot>,
    state_tx: SnapshotWriter<SemanticState>,
    sig_match_tx: SnapshotWriter<SignatureMatch>,
}

pub struct InspectionEngine {
    config: Config,
    shared: Arc<EngineShared>,
    gating_stats: Arc<GatingStats>,

    semantic_rx: SnapshotReader<SemanticSnapshot>,
    state_rx: SnapshotReader<SemanticState>,
    sig_rx: SnapshotReader<SignatureMatch>,

    camera_tx: Producer<FrameJob>,
    endpoints: Option<LaneEndpoints>,

    control_cb: ControlCallback,
    uplink_cb: UplinkCallback,
    detector: Option<Box<dyn SemanticDetector>>,
    encoder: Option<Box<dyn FrameEncoder>>,
    sink: Option<Box<dyn UplinkSink>>,

    threads: Vec<JoinHandle<()>>,
    next_frame_id: u64,
    start_time_s: f64,
}

impl InspectionEngine {
    pub fn new(
        config: Config,
        on_control: impl Fn(&ControlDecision) + Send + Sync + 'static,
        on_uplink: impl Fn(&UplinkPayload) + Send + Sync + 'static,
    ) -> Self {
        let (camera_tx, camera_rx) = ring::<FrameJob>(CAMERA_QUEUE_CAP);
        let (sig_tx, sig_rx_q) = ring::<FrameJob>(SIG_QUEUE_CAP);
        let (sem_tx, sem_rx_q) = ring::<crate::types::SemanticJob>(SEMANTIC_QUEUE_CAP);
        let (uplink_tx, uplink_rx_q) = ring::<UplinkPayload>(UPLINK_QUEUE_CAP);
        let (vis_tx, vis_rx_q) = ring::<VisJob>(VIS_QUEUE_CAP);
        let (cb_tx, cb_rx) = ring::<CallbackJob>(CALLBACK_QUEUE_CAP);

        let (semantic_tx, semantic_rx) = snapshot_channel::<SemanticSnapshot>();
        let (state_tx, state_rx) = snapshot_channel::<SemanticState>();
        let (sig_match_tx, sig_match_rx) = snapshot_channel::<SignatureMatch>();

        let gating_config = Arc::new(GatingConfig::new(
            config.gating.confidence_threshold,
            config.gating.max_skip_frames,
            config.gating.max_skip_time_ms,
            config.gating.critical_crack_threshold,
        ));

        let shared = Arc::new(EngineShared {
            running: AtomicBool::new(false),
            force_infer: AtomicBool::new(false),
            metrics: EngineMetrics::default(),
            latency: LatencyRing::new(512),
            bank: SignatureBank::new(config.signature_bank),
            gating_config: gating_config.clone(),
            failsafe: FailsafeMonitor::new(vec![control_latency_signal(
                config.engine.max_control_latency_ms,
            )]),
            vis_jpeg: Mutex::new(Vec::new()),
            benchmark: Mutex::new(BenchmarkSuite::default()),
        });
        shared
            .metrics
            .px_to_mm_scale
            .store(config.engine.px_to_mm_scale);

        Self {
            config,
            shared,
            gating_stats: Arc::new(GatingStats::default()),
            semantic_rx,
            state_rx,
            sig_rx: sig_match_rx,
            camera_tx,
            endpoints: Some(LaneEndpoints {
                camera_rx,
                sig_tx,
                sig_rx: sig_rx_q,
                sem_tx,
                sem_rx: sem_rx_q,
                uplink_tx,
                uplink_rx: uplink_rx_q,
                vis_tx,
                vis_rx: vis_rx_q,
                cb_tx: Arc::new(Mutex::new(cb_tx)),
                cb_rx,
                semantic_tx,
                state_tx,
                sig_match_tx,
            }),
            control_cb: Arc::new(on_control),
            uplink_cb: Arc::new(on_uplink),
            detector: None,
            encoder: None,
            sink: None,
            threads: Vec::new(),
            next_frame_id: 0,
            start_time_s: 0.0,
        }
    }

    /// Plug in the external detector. Must be called before start().
    pub fn set_detector(&mut self, detector: Box<dyn SemanticDetector>) {
        self.detector = Some(detector);
    }

    /// Plug in the visualization encoder. Must be called before start().
    pub fn set_frame_encoder(&mut self, encoder: Box<dyn FrameEncoder>) {
        self.encoder = Some(encoder);
    }

    /// Plug in the uplink sink. Must be called before start().
    pub fn set_uplink_sink(&mut self, sink: Box<dyn UplinkSink>) {
        self.sink = Some(sink);
    }

    /// Force the next gating decision to run the detector regardless of
    /// confidence. Consumed by Lane 1 on its next cycle.
    pub fn force_inference(&self) {
        self.shared.force_infer.store(true, Ordering::Relaxed);
    }

    pub fn set_px_to_mm(&self, px_to_mm: f32) {
        self.shared
            .metrics
            .px_to_mm_scale
            .store(px_to_mm.max(0.001));
    }

    /// Launch the lane threads. Idempotent: a second call is a no-op.
    pub fn start(&mut self) {
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let endpoints = match self.endpoints.take() {
            Some(endpoints) => endpoints,
            None => return,
        };

        self.start_time_s = monotonic_s();
        let opts = self.config.engine;

        info!(
            width = TARGET_WIDTH,
            height = TARGET_HEIGHT,
            semantic = opts.enable_semantic_lane,
            signature = opts.enable_signature_lane,
            "starting inspection engine"
        );

        // --- Lane 1: sensing hot path ---
        if opts.enable_sensing_lane {
            let kernel = SensingKernel::new(
                TARGET_WIDTH,
                TARGET_HEIGHT,
                self.config.sensing,
                self.config.fusion,
            );
            let gating = GatingEngine::new(self.shared.gating_config.clone());
            self.gating_stats = gating.stats_handle();

            let lane1 = lanes::Lane1 {
                shared: self.shared.clone(),
                camera_rx: endpoints.camera_rx,
                sig_tx: endpoints.sig_tx,
                sem_tx: endpoints.sem_tx,
                vis_tx: endpoints.vis_tx,
                uplink_tx: endpoints.uplink_tx,
                cb_tx: endpoints.cb_tx.clone(),
                semantic_rx: self.semantic_rx.clone(),
                sig_rx: self.sig_rx.clone(),
                kernel,
                gating,
                tracker: CrackTracker::new(self.config.crack_stats),
                options: opts,
            };
            self.spawn("lane1-sensing", move || lane1.run());
        }

        // --- Lane 2: signature matching ---
        if opts.enable_signature_lane {
            let lane2 = lanes::Lane2 {
                shared: self.shared.clone(),
                sig_rx: endpoints.sig_rx,
                sig_match_tx: endpoints.sig_match_tx,
                estimator: crate::stats::CrackInferenceEstimator::new(),
            };
            self.spawn("lane2-signature", move || lane2.run());
        }

        // --- Lane 3: gated semantic inference ---
        if opts.enable_semantic_lane {
            let lane3 = lanes::Lane3 {
                shared: self.shared.clone(),
                sem_rx: endpoints.sem_rx,
                semantic_tx: endpoints.semantic_tx,
                state_tx: endpoints.state_tx,
                sig_rx: self.sig_rx.clone(),
                detector: self
                    .detector
                    .take()
                    .unwrap_or_else(|| Box::new(NoopDetector)),
                controller: crate::stats::DetectionController::new(opts.stats_window_ms),
            };
            self.spawn("lane3-semantic", move || lane3.run());
        }

        // --- Lane 4: uplink serialization ---
        if opts.enable_uplink_lane {
            let lane4 = lanes::Lane4 {
                shared: self.shared.clone(),
                uplink_rx: endpoints.uplink_rx,
                cb_tx: endpoints.cb_tx.clone(),
                sink: self.sink.take().unwrap_or_else(|| Box::new(NullSink)),
            };
            self.spawn("lane4-uplink", move || lane4.run());
        }

        // --- Lane 5: visualization ---
        if opts.enable_viz_lane {
            let lane5 = lanes::Lane5 {
                shared: self.shared.clone(),
                vis_rx: endpoints.vis_rx,
                encoder: self
                    .encoder
                    .take()
                    .unwrap_or_else(|| Box::new(JpegFrameEncoder::new(opts.jpeg_quality))),
                bitrate: crate::viz::BitrateTracker::new(),
            };
            self.spawn("lane5-viz", move || lane5.run());
        }

        // --- Lane 6: callback dispatcher (always runs) ---
        let lane6 = lanes::Lane6 {
            shared: self.shared.clone(),
            cb_rx: endpoints.cb_rx,
            control_cb: self.control_cb.clone(),
            uplink_cb: self.uplink_cb.clone(),
        };
        self.spawn("lane6-dispatch", move || lane6.run());
    }

    fn spawn(&mut self, name: &str, body: impl FnOnce() + Send + 'static) {
        match std::thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
        {
            Ok(handle) => self.threads.push(handle),
            Err(err) => warn!(lane = name, "failed to spawn lane thread: {err}"),
        }
    }

    /// Clear the running flag and join every lane. Items still queued at
    /// shutdown are destroyed with their rings.
    pub fn stop(&mut self) {
        if self
            .shared
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        info!("inspection engine stopped");
    }

    /// Stop accepting work immediately and emit a synthetic throttle-zero
    /// decision straight to the control hook.
    pub fn emergency_stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);

        let decision = ControlDecision {
            frame_id: self.next_frame_id as i64,
            timestamp: monotonic_s(),
            throttle: 0.0,
            steer: 0.0,
            action: Action::Stop,
            crack_score: 0.0,
            sparsity: 1.0,
            confidence: 0.0,
            semantic_active: false,
            semantic_age_ms: SEMANTIC_AGE_ABSENT_MS,
            is_null_cycle: false,
            inference_suppressed: false,
            event_only_mode: true,
            reference_frame_age: 0,
            control_latency_ms: 0.0,
            crack_width_mm: 0.0,
            crack_length_mm: 0.0,
            crack_severity: crate::types::Severity::None,
            crack_confidence_percent: 0.0,
        };
        (self.control_cb)(&decision);

        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        warn!("emergency stop executed");
    }

    /// External entry point. The buffer is copied into a job; frame ids are
    /// assigned strictly monotonically, gap-free, whether or not the ring
    /// accepts the frame (a rejected frame is counted as dropped).
    pub fn push_frame(&mut self, bgr: &[u8], height: usize, width: usize) {
        debug_assert_eq!(bgr.len(), height * width * 3);

        let frame_id = self.next_frame_id;
        self.next_frame_id += 1;
        self.shared
            .metrics
            .frame_id
            .store(self.next_frame_id, Ordering::Relaxed);

        let job = FrameJob {
            frame_id,
            height,
            width,
            crack_score: 0.0,
            frame_bgr: bgr.to_vec(),
        };

        if self.camera_tx.try_push(job).is_err() {
            self.shared
                .metrics
                .dropped_frames
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    pub fn metrics(&self) -> MetricsSnapshot {
        let m = &self.shared.metrics;
        let now = monotonic_s();
        let frame_id = m.frame_id.load(Ordering::Relaxed);

        let elapsed = now - self.start_time_s;
        let fps = if self.start_time_s > 0.0 && elapsed > 0.1 {
            (frame_id as f64 / elapsed) as f32
        } else {
            0.0
        };

        let (p50, p95, p99) = self.shared.latency.percentiles();

        let last_yolo = m.last_yolo_stamp_s.load();
        let yolo_age_ms = if last_yolo > 0.0 {
            ((now - last_yolo) * 1000.0) as f32
        } else {
            SEMANTIC_AGE_ABSENT_MS as f32
        };

        MetricsSnapshot {
            frame_id,
            fps,
            last_crack: m.last_crack.load(),
            fused_crack: m.fused_crack.load(),
            sig_conf: m.sig_conf.load(),
            crack_probability: m.crack_probability.load(),
            crack_frames: m.crack_frames.load(Ordering::Relaxed),
            yolo_count: m.yolo_count.load(Ordering::Relaxed),
            uplink_count: m.uplink_count.load(Ordering::Relaxed),
            dropped_frames: m.dropped_frames.load(Ordering::Relaxed),
            latency_violations: m.latency_violations.load(Ordering::Relaxed),
            latency_p50_ms: p50,
            latency_p95_ms: p95,
            latency_p99_ms: p99,
            yolo_hz: m.yolo_hz.load(),
            yolo_age_ms,
            yolo_conf_thr: m.yolo_conf_thr.load(),
            window_crack_ratio: m.window_crack_ratio.load(),
            global_crack_ratio: m.global_crack_ratio.load(),
            crack_alert_thr: m.crack_alert_thr.load(),
            spike_bitrate_mbps: m.spike_bitrate_mbps.load(),
            avg_yolo_conf: m.avg_yolo_conf.load(),
            avg_crack_score: m.avg_crack_score.load(),
            avg_agreement: m.avg_agreement.load(),
            px_to_mm_scale: m.px_to_mm_scale.load(),
            vis_crack_width_mm: m.vis_crack_width_mm.load(),
            vis_crack_length_mm: m.vis_crack_length_mm.load(),
        }
    }

    pub fn gating_stats(&self) -> GatingStatsSnapshot {
        self.gating_stats.snapshot()
    }

    pub fn benchmark_suite(&self) -> BenchmarkSuite {
        self.shared.benchmark.lock().clone()
    }

    /// Latest encoded visualization frame (empty before Lane 5's first
    /// publish).
    pub fn spike_frame_jpeg(&self) -> Vec<u8> {
        self.shared.vis_jpeg.lock().clone()
    }

    pub fn signature_bank(&self) -> &SignatureBank {
        &self.shared.bank
    }

    /// Age of the latest semantic publish in ms, from the state marker.
    pub fn semantic_age_ms(&self) -> f64 {
        let state = self.state_rx.read();
        if state.sequence_id == 0 {
            return SEMANTIC_AGE_ABSENT_MS;
        }
        monotonic_s() * 1000.0 - state.value.timestamp_ms
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Drop for InspectionEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn uniform_frame(value: u8, width: usize, height: usize) -> Vec<u8> {
        vec![value; width * height * 3]
    }

    #[test]
    fn test_push_without_start_counts_drops() {
        let mut engine = InspectionEngine::new(Config::default(), |_| {}, |_| {});
        let frame = uniform_frame(100, 32, 32);
        for _ in 0..CAMERA_QUEUE_CAP + 10 {
            engine.push_frame(&frame, 32, 32);
        }
        let metrics = engine.metrics();
        assert_eq!(metrics.frame_id, (CAMERA_QUEUE_CAP + 10) as u64);
        assert_eq!(metrics.dropped_frames, 10);
    }

    #[test]
    fn test_engine_end_to_end_uniform_frames() {
        let decisions: Arc<StdMutex<Vec<ControlDecision>>> = Arc::new(StdMutex::new(Vec::new()));
        let uplinks: Arc<StdMutex<Vec<UplinkPayload>>> = Arc::new(StdMutex::new(Vec::new()));

        let d = decisions.clone();
        let u = uplinks.clone();
        let mut engine = InspectionEngine::new(
            Config::default(),
            move |decision| d.lock().unwrap().push(decision.clone()),
            move |payload| u.lock().unwrap().push(payload.clone()),
        );
        engine.start();

        let frame = uniform_frame(128, 64, 48);
        for _ in 0..20 {
            engine.push_frame(&frame, 48, 64);
            std::thread::sleep(Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_millis(300));
        engine.stop();

        let decisions = decisions.lock().unwrap();
        assert!(!decisions.is_empty(), "no control decisions delivered");
        // Uniform frames: every non-null cycle is event-free and CLEAR.
        for d in decisions.iter() {
            assert_eq!(d.action, Action::Clear);
            assert!(d.sparsity >= 0.0 && d.sparsity <= 1.0);
        }
        // Frame ids strictly increase across decisions.
        for pair in decisions.windows(2) {
            assert!(pair[1].frame_id > pair[0].frame_id);
        }

        let uplinks = uplinks.lock().unwrap();
        assert!(!uplinks.is_empty(), "no uplink payloads delivered");

        let metrics = engine.metrics();
        assert_eq!(metrics.frame_id, 20);
        assert!(metrics.yolo_count >= 1, "first cycle must run inference");
        assert!(metrics.uplink_count as usize >= uplinks.len());
    }

    #[test]
    fn test_engine_produces_viz_blob() {
        let mut engine = InspectionEngine::new(Config::default(), |_| {}, |_| {});
        engine.start();
        let frame = uniform_frame(200, 64, 48);
        for _ in 0..10 {
            engine.push_frame(&frame, 48, 64);
            std::thread::sleep(Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_millis(300));
        engine.stop();

        let jpeg = engine.spike_frame_jpeg();
        assert!(!jpeg.is_empty(), "no viz frame published");
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_disabled_lanes_do_not_run() {
        let mut config = Config::default();
        config.engine.enable_viz_lane = false;
        config.engine.enable_semantic_lane = false;

        let mut engine = InspectionEngine::new(config, |_| {}, |_| {});
        engine.start();
        let frame = uniform_frame(128, 64, 48);
        for _ in 0..5 {
            engine.push_frame(&frame, 48, 64);
            std::thread::sleep(Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_millis(200));
        engine.stop();

        assert!(engine.spike_frame_jpeg().is_empty());
        assert_eq!(engine.metrics().yolo_count, 0);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut engine = InspectionEngine::new(Config::default(), |_| {}, |_| {});
        engine.start();
        engine.stop();
        engine.stop();
    }

    #[test]
    fn test_emergency_stop_emits_throttle_zero() {
        let decisions: Arc<StdMutex<Vec<ControlDecision>>> = Arc::new(StdMutex::new(Vec::new()));
        let d = decisions.clone();
        let mut engine =
            InspectionEngine::new(Config::default(), move |dec| d.lock().unwrap().push(dec.clone()), |_| {});
        engine.start();
        engine.emergency_stop();

        let decisions = decisions.lock().unwrap();
        let last = decisions.last().expect("no emergency decision");
        assert_eq!(last.throttle, 0.0);
        assert_eq!(last.action, Action::Stop);
    }
}

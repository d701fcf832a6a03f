// src/main.rs
//
// Benchmark runner: drives the engine with a synthetic inspection sweep
// (moving texture plus an occasional dark crack band) and prints the
// metrics table at the end.

use anyhow::Result;
use crack_inspection::engine::InspectionEngine;
use crack_inspection::{target_height, target_width, Config};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

const FRAME_WIDTH: usize = 640;
const FRAME_HEIGHT: usize = 360;
const FRAME_COUNT: usize = 300;
const FRAME_INTERVAL: Duration = Duration::from_millis(33);

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crack_inspection=info,inspection_bench=info".into()),
        )
        .init();

    let config = if Path::new("config.yaml").exists() {
        info!("loading config.yaml");
        Config::load("config.yaml")?
    } else {
        Config::default()
    };

    info!(
        sensing_w = target_width(),
        sensing_h = target_height(),
        "starting benchmark run"
    );

    let control_count = Arc::new(AtomicU64::new(0));
    let uplink_count = Arc::new(AtomicU64::new(0));

    let controls = control_count.clone();
    let uplinks = uplink_count.clone();
    let mut engine = InspectionEngine::new(
        config,
        move |decision| {
            let n = controls.fetch_add(1, Ordering::Relaxed) + 1;
            if n % 60 == 0 {
                info!(
                    frame = decision.frame_id,
                    action = %decision.action,
                    throttle = decision.throttle,
                    crack = decision.crack_score,
                    latency_ms = decision.control_latency_ms,
                    "control"
                );
            }
        },
        move |_payload| {
            uplinks.fetch_add(1, Ordering::Relaxed);
        },
    );

    engine.start();

    let start = Instant::now();
    let mut frame = vec![0u8; FRAME_WIDTH * FRAME_HEIGHT * 3];
    for i in 0..FRAME_COUNT {
        synthesize_frame(&mut frame, i);
        engine.push_frame(&frame, FRAME_HEIGHT, FRAME_WIDTH);
        std::thread::sleep(FRAME_INTERVAL);
    }

    // Let the peripheral lanes drain.
    std::thread::sleep(Duration::from_millis(300));
    engine.stop();

    let metrics = engine.metrics();
    let gating = engine.gating_stats();
    let elapsed = start.elapsed().as_secs_f64();

    println!("=============================================================");
    println!("Inspection Engine Benchmark");
    println!("=============================================================");
    println!("Frames pushed:      {}", metrics.frame_id);
    println!("Elapsed:            {elapsed:.2} s");
    println!("FPS:                {:.1}", metrics.fps);
    println!("Control callbacks:  {}", control_count.load(Ordering::Relaxed));
    println!("Uplink callbacks:   {}", uplink_count.load(Ordering::Relaxed));
    println!("Dropped frames:     {}", metrics.dropped_frames);
    println!("Crack (last):       {:.4}", metrics.last_crack);
    println!("Crack (fused):      {:.4}", metrics.fused_crack);
    println!("Sig confidence:     {:.4}", metrics.sig_conf);
    println!("Detector runs:      {}", metrics.yolo_count);
    println!("Detector rate:      {:.2} Hz", metrics.yolo_hz);
    println!("Suppression rate:   {:.1} %", gating.suppression_rate * 100.0);
    println!("Latency P50:        {:.3} ms", metrics.latency_p50_ms);
    println!("Latency P95:        {:.3} ms", metrics.latency_p95_ms);
    println!("Latency P99:        {:.3} ms", metrics.latency_p99_ms);
    println!("Violations:         {}", metrics.latency_violations);
    println!("Window crack ratio: {:.2} %", metrics.window_crack_ratio * 100.0);
    println!("Global crack ratio: {:.2} %", metrics.global_crack_ratio * 100.0);
    println!("Spike bitrate:      {:.3} Mbps", metrics.spike_bitrate_mbps);
    println!("=============================================================");

    Ok(())
}

/// Synthetic inspection sweep: a drifting brightness gradient with a dark
/// crack-like band that appears for a stretch of frames.
fn synthesize_frame(frame: &mut [u8], index: usize) {
    let phase = (index * 3) % 256;
    for y in 0..FRAME_HEIGHT {
        for x in 0..FRAME_WIDTH {
            let value = (((x + phase) % 256) as f32 * 0.3 + (y % 256) as f32 * 0.2 + 80.0) as u8;
            let idx = (y * FRAME_WIDTH + x) * 3;
            frame[idx] = value;
            frame[idx + 1] = value;
            frame[idx + 2] = value;
        }
    }

    // A crack band sweeps through for a third of the run.
    if (100..200).contains(&index) {
        let band_x = 200 + (index - 100);
        for y in FRAME_HEIGHT / 2..FRAME_HEIGHT {
            for x in band_x..(band_x + 6).min(FRAME_WIDTH) {
                let idx = (y * FRAME_WIDTH + x) * 3;
                frame[idx] = 12;
                frame[idx + 1] = 12;
                frame[idx + 2] = 12;
            }
        }
    }
}

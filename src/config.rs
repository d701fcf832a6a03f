// src/config.rs

use crate::sensing::fusion::FusionConfig;
use crate::sensing::kernel::KernelConfig;
use crate::signature::SignatureBankConfig;
use crate::stats::CrackStatsConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Engine-level switches and budgets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Skip launching individual lanes; a disabled lane's input ring drains
    /// to nowhere. The callback dispatcher always runs.
    pub enable_sensing_lane: bool,
    pub enable_signature_lane: bool,
    pub enable_semantic_lane: bool,
    pub enable_uplink_lane: bool,
    pub enable_viz_lane: bool,

    /// Lane 1 budget: latencies above this count as violations.
    pub max_control_latency_ms: f64,
    /// Physical scale for crack metrics (mm per sensing pixel).
    pub px_to_mm_scale: f32,
    /// Publish rate hint carried in semantic jobs.
    pub semantic_target_hz: f32,
    pub jpeg_quality: u8,
    /// Statistics window shared by the crack tracker and the detection
    /// controller.
    pub stats_window_ms: f64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            enable_sensing_lane: true,
            enable_signature_lane: true,
            enable_semantic_lane: true,
            enable_uplink_lane: true,
            enable_viz_lane: true,
            max_control_latency_ms: 50.0,
            px_to_mm_scale: 1.0,
            semantic_target_hz: 5.0,
            jpeg_quality: 70,
            stats_window_ms: 5000.0,
        }
    }
}

/// Gating tunables as they appear in the config file; converted into the
/// atomic `GatingConfig` when the engine starts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct GatingOptions {
    pub confidence_threshold: f32,
    pub max_skip_frames: u32,
    pub max_skip_time_ms: f32,
    pub critical_crack_threshold: f32,
}

impl Default for GatingOptions {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.60,
            max_skip_frames: 30,
            max_skip_time_ms: 500.0,
            critical_crack_threshold: 0.60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineOptions,
    pub sensing: KernelConfig,
    pub fusion: FusionConfig,
    pub gating: GatingOptions,
    pub signature_bank: SignatureBankConfig,
    pub crack_stats: CrackStatsConfig,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }
}

// src/failsafe.rs
//
// Signal-based failsafe monitor. Lanes feed named signals (the engine wires
// control latency into signal 0); the worst per-signal verdict is the
// monitor status carried in every uplink payload. Value bands catch bad
// readings, timeout ages catch silent producers.

use crate::metrics::{AtomicF32, AtomicF64};
use crate::types::FailsafeStatus;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct SignalConfig {
    pub name: &'static str,
    pub warn_timeout_ms: f64,
    pub crit_timeout_ms: f64,
    pub warn_low: f32,
    pub warn_high: f32,
    pub crit_low: f32,
    pub crit_high: f32,
    pub value_checks: bool,
}

struct SignalState {
    last_update_ms: AtomicF64,
    last_value: AtomicF32,
}

pub struct FailsafeMonitor {
    configs: Vec<SignalConfig>,
    states: Vec<SignalState>,
    status: AtomicU8,
}

impl FailsafeMonitor {
    pub fn new(configs: Vec<SignalConfig>) -> Self {
        let states = configs
            .iter()
            .map(|_| SignalState {
                last_update_ms: AtomicF64::new(-1.0),
                last_value: AtomicF32::new(0.0),
            })
            .collect();
        Self {
            configs,
            states,
            status: AtomicU8::new(FailsafeStatus::Ok as u8),
        }
    }

    /// Monitor with no signals; evaluates to OK forever.
    pub fn disabled() -> Self {
        Self::new(Vec::new())
    }

    pub fn update(&self, idx: usize, value: f32, now_ms: f64) {
        if let Some(state) = self.states.get(idx) {
            state.last_value.store(value);
            state.last_update_ms.store(now_ms);
        }
    }

    pub fn evaluate_signal(&self, idx: usize, now_ms: f64) -> FailsafeStatus {
        let (cfg, state) = match (self.configs.get(idx), self.states.get(idx)) {
            (Some(cfg), Some(state)) => (cfg, state),
            _ => return FailsafeStatus::Ok,
        };

        let last_update = state.last_update_ms.load();
        if last_update < 0.0 {
            // Never updated: treat as a timeout-in-progress from t=0.
            return FailsafeStatus::Warning;
        }

        let age_ms = (now_ms - last_update).max(0.0);
        if age_ms > cfg.crit_timeout_ms {
            return FailsafeStatus::Critical;
        }
        if age_ms > cfg.warn_timeout_ms {
            return FailsafeStatus::Warning;
        }

        if cfg.value_checks {
            let value = state.last_value.load();
            if value < cfg.crit_low || value > cfg.crit_high {
                return FailsafeStatus::Critical;
            }
            if value < cfg.warn_low || value > cfg.warn_high {
                return FailsafeStatus::Warning;
            }
        }

        FailsafeStatus::Ok
    }

    /// Evaluate all signals, latch and return the worst verdict.
    pub fn evaluate(&self, now_ms: f64) -> FailsafeStatus {
        let mut worst = FailsafeStatus::Ok;
        for idx in 0..self.configs.len() {
            let status = self.evaluate_signal(idx, now_ms);
            if status == FailsafeStatus::Critical {
                worst = FailsafeStatus::Critical;
                break;
            }
            if status == FailsafeStatus::Warning {
                worst = FailsafeStatus::Warning;
            }
        }

        let previous = self.status.swap(worst as u8, Ordering::Relaxed);
        if previous != worst as u8 && worst != FailsafeStatus::Ok {
            warn!(status = worst.as_str(), "failsafe status changed");
        }
        worst
    }

    /// Last latched verdict without re-evaluation.
    pub fn status(&self) -> FailsafeStatus {
        match self.status.load(Ordering::Relaxed) {
            2 => FailsafeStatus::Critical,
            1 => FailsafeStatus::Warning,
            _ => FailsafeStatus::Ok,
        }
    }

    pub fn signal_count(&self) -> usize {
        self.configs.len()
    }

    pub fn signal_value(&self, idx: usize) -> Option<f32> {
        self.states.get(idx).map(|s| s.last_value.load())
    }
}

/// The engine's single built-in signal: Lane 1 control latency in ms.
pub fn control_latency_signal(max_latency_ms: f64) -> SignalConfig {
    SignalConfig {
        name: "control_latency_ms",
        warn_timeout_ms: 500.0,
        crit_timeout_ms: 2000.0,
        warn_low: 0.0,
        warn_high: max_latency_ms as f32,
        crit_low: 0.0,
        crit_high: (max_latency_ms * 4.0) as f32,
        value_checks: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> FailsafeMonitor {
        FailsafeMonitor::new(vec![control_latency_signal(50.0)])
    }

    #[test]
    fn test_healthy_signal_is_ok() {
        let m = monitor();
        m.update(0, 3.0, 1000.0);
        assert_eq!(m.evaluate(1001.0), FailsafeStatus::Ok);
        assert_eq!(m.status(), FailsafeStatus::Ok);
    }

    #[test]
    fn test_value_bands() {
        let m = monitor();
        m.update(0, 80.0, 1000.0);
        assert_eq!(m.evaluate(1001.0), FailsafeStatus::Warning);

        m.update(0, 500.0, 1002.0);
        assert_eq!(m.evaluate(1003.0), FailsafeStatus::Critical);
    }

    #[test]
    fn test_timeout_escalates() {
        let m = monitor();
        m.update(0, 3.0, 1000.0);
        assert_eq!(m.evaluate(1600.0), FailsafeStatus::Warning);
        assert_eq!(m.evaluate(4000.0), FailsafeStatus::Critical);
    }

    #[test]
    fn test_never_updated_is_warning() {
        let m = monitor();
        assert_eq!(m.evaluate(0.0), FailsafeStatus::Warning);
    }

    #[test]
    fn test_disabled_monitor_is_ok() {
        let m = FailsafeMonitor::disabled();
        assert_eq!(m.evaluate(123456.0), FailsafeStatus::Ok);
    }
}

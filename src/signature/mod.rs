// src/signature/mod.rs
//
// The signature bank: a flat store of previously seen scene signatures with
// multi-descriptor matching, online adaptation and value-based pruning.
//
// Threading model:
//   - Lane 2 is the single writer: find_match / register / feedback / clear.
//   - Lane 1 and observers are readers: compute_confidence, is_sufficient,
//     len and counters take the shared lock only.

pub mod descriptors;

use self::descriptors::{l2_distance, safe_unit_norm, DescriptorSet};

use crate::types::SignatureMatch;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Config
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SignatureBankConfig {
    pub max_signatures: usize,
    pub match_threshold: f32,
    /// Recency horizon used by the pruning value function, in seconds.
    pub forgetting_period_s: f64,
    /// Persistence trace exponential decay constant, in seconds.
    pub trace_tau_s: f32,
    pub trace_increment: f32,
    pub trace_cap: f32,
    /// Base EMA learning rate for descriptor adaptation; the effective rate
    /// is scaled by the raw match confidence.
    pub adapt_rate: f32,
    pub adapt_min_confidence: f32,
    pub w_structural: f32,
    pub w_semantic: f32,
    pub w_context: f32,
    pub w_motion: f32,
    pub refractory_s: f64,
}

impl Default for SignatureBankConfig {
    fn default() -> Self {
        Self {
            max_signatures: 1000,
            match_threshold: 0.30,
            forgetting_period_s: 3600.0,
            trace_tau_s: 4.0,
            trace_increment: 1.0,
            trace_cap: 10.0,
            adapt_rate: 0.05,
            adapt_min_confidence: 0.60,
            w_structural: 0.5,
            w_semantic: 0.3,
            w_context: 0.1,
            w_motion: 0.1,
            refractory_s: 0.0,
        }
    }
}

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone)]
pub struct Signature {
    pub id: u64,
    pub structural: Vec<f32>,
    pub semantic_profile: Vec<f32>,
    pub context: Vec<f32>,
    pub motion: Vec<f32>,
    pub first_seen: f64,
    pub last_seen: f64,
    pub occurrence_count: u32,
    pub persistence_trace: f32,
    pub last_match_time: f64,
    pub historical_risk: f32,
    pub false_alarm_rate: f32,
    pub refractory_until: f64,
    pub avg_luminance: f32,
}

/// Result of one bank lookup. `confidence` is the raw match confidence
/// `exp(-d / threshold)`; the full product-form confidence is computed
/// separately via `compute_confidence`.
#[derive(Debug, Clone, Copy)]
pub struct MatchResult {
    pub matched: bool,
    pub id: i64,
    pub distance: f32,
    pub structural_distance: f32,
    pub confidence: f32,
    pub avg_luminance: f32,
    pub match_time_ms: f32,
}

impl Default for MatchResult {
    fn default() -> Self {
        Self {
            matched: false,
            id: -1,
            distance: f32::INFINITY,
            structural_distance: 0.0,
            confidence: 0.0,
            avg_luminance: 0.0,
            match_time_ms: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackOutcome {
    Confirmed,
    FalseAlarm,
    Alerted,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BankStats {
    pub len: usize,
    pub total_matches: u64,
    pub total_registrations: u64,
    pub total_prunes: u64,
}

// ============================================================================
// Bank
// ============================================================================

struct BankInner {
    signatures: Vec<Signature>,
    next_id: u64,
}

pub struct SignatureBank {
    cfg: SignatureBankConfig,
    inner: RwLock<BankInner>,
    total_matches: AtomicU64,
    total_registrations: AtomicU64,
    total_prunes: AtomicU64,
}

impl SignatureBank {
    pub fn new(mut cfg: SignatureBankConfig) -> Self {
        // Normalize the descriptor weights so distances stay comparable no
        // matter what the config says.
        let wsum = cfg.w_structural + cfg.w_semantic + cfg.w_context + cfg.w_motion;
        if wsum > 1e-6 {
            cfg.w_structural /= wsum;
            cfg.w_semantic /= wsum;
            cfg.w_context /= wsum;
            cfg.w_motion /= wsum;
        }
        cfg.trace_tau_s = cfg.trace_tau_s.max(1e-3);
        cfg.adapt_rate = cfg.adapt_rate.clamp(0.0, 1.0);

        Self {
            cfg,
            inner: RwLock::new(BankInner {
                signatures: Vec::with_capacity(cfg.max_signatures.min(4096)),
                next_id: 0,
            }),
            total_matches: AtomicU64::new(0),
            total_registrations: AtomicU64::new(0),
            total_prunes: AtomicU64::new(0),
        }
    }

    // ------------------------------------------------------------------
    // Matching (Lane 2 writer)
    // ------------------------------------------------------------------

    /// Find the closest signature. On a match the signature's recency,
    /// occurrence count and persistence trace are refreshed, and its
    /// descriptors are EMA-adapted toward the query when the raw confidence
    /// clears the adaptation gate.
    pub fn find_match(&self, query: &DescriptorSet, avg_luminance: f32, now_s: f64) -> MatchResult {
        let t0 = std::time::Instant::now();
        let mut inner = self.inner.write();

        let mut result = MatchResult {
            avg_luminance,
            ..Default::default()
        };

        if inner.signatures.is_empty() {
            return result;
        }

        let mut best_index: Option<usize> = None;
        let mut best_dist = f32::INFINITY;
        let mut best_dstruct = 0.0f32;

        for (i, sig) in inner.signatures.iter().enumerate() {
            if now_s < sig.refractory_until {
                continue;
            }

            let d_struct = self.cfg.w_structural * l2_distance(&query.structural, &sig.structural)
                + self.cfg.w_semantic * l2_distance(&query.semantic_profile, &sig.semantic_profile);
            let d_context = self.cfg.w_context * l2_distance(&query.context, &sig.context)
                + self.cfg.w_motion * l2_distance(&query.motion, &sig.motion);
            let d = d_struct + d_context;

            if d < best_dist {
                best_dist = d;
                best_dstruct = d_struct;
                best_index = Some(i);
            }
        }

        if let Some(index) = best_index {
            if best_dist <= self.cfg.match_threshold {
                let cfg = self.cfg;
                let sig = &mut inner.signatures[index];

                sig.last_seen = now_s;
                sig.occurrence_count += 1;
                update_trace(sig, now_s, &cfg);

                let raw_conf = (-best_dist / cfg.match_threshold).exp();
                if raw_conf >= cfg.adapt_min_confidence && cfg.adapt_rate > 0.0 {
                    let lr = cfg.adapt_rate * raw_conf;
                    ema_update(&mut sig.structural, &query.structural, lr);
                    ema_update(&mut sig.semantic_profile, &query.semantic_profile, lr);
                    ema_update(&mut sig.context, &query.context, lr);
                    ema_update(&mut sig.motion, &query.motion, lr);
                }

                if cfg.refractory_s > 0.0 {
                    sig.refractory_until = now_s + cfg.refractory_s;
                }

                self.total_matches.fetch_add(1, Ordering::Relaxed);

                result.matched = true;
                result.id = sig.id as i64;
                result.distance = best_dist;
                result.structural_distance = best_dstruct;
                result.confidence = raw_conf;
            }
        }

        result.match_time_ms = t0.elapsed().as_secs_f32() * 1000.0;
        result
    }

    /// Register a new signature, pruning the lowest-value tenth first when
    /// the bank is at capacity. Returns the new id.
    pub fn register(
        &self,
        query: &DescriptorSet,
        initial_risk: f32,
        avg_luminance: f32,
        now_s: f64,
    ) -> u64 {
        let mut inner = self.inner.write();

        if inner.signatures.len() >= self.cfg.max_signatures {
            let pruned = prune(&mut inner.signatures, &self.cfg, now_s);
            self.total_prunes.fetch_add(pruned, Ordering::Relaxed);
        }

        let id = inner.next_id;
        inner.next_id += 1;

        let mut structural = query.structural.clone();
        let mut semantic_profile = query.semantic_profile.clone();
        let mut context = query.context.clone();
        let mut motion = query.motion.clone();
        safe_unit_norm(&mut structural);
        safe_unit_norm(&mut semantic_profile);
        safe_unit_norm(&mut context);
        safe_unit_norm(&mut motion);

        inner.signatures.push(Signature {
            id,
            structural,
            semantic_profile,
            context,
            motion,
            first_seen: now_s,
            last_seen: now_s,
            occurrence_count: 1,
            persistence_trace: 0.0,
            last_match_time: 0.0,
            historical_risk: initial_risk.clamp(0.0, 1.0),
            false_alarm_rate: 0.0,
            refractory_until: 0.0,
            avg_luminance,
        });
        self.total_registrations.fetch_add(1, Ordering::Relaxed);

        id
    }

    // ------------------------------------------------------------------
    // Confidence (readers)
    // ------------------------------------------------------------------

    /// Product-form confidence for a prior match:
    /// `f = 0.7 e^(-2 d_struct/th) + 0.3 e^(-d/th)`, scaled by the
    /// familiarity trace, the false-alarm quality term, the inverse
    /// historical risk and an optional growth factor.
    pub fn compute_confidence(
        &self,
        matched: bool,
        id: i64,
        distance: f32,
        structural_distance: f32,
        growth_risk: f32,
        growth_accel: f32,
    ) -> f32 {
        if !matched || id < 0 {
            return 0.0;
        }

        let inner = self.inner.read();
        let sig = match inner.signatures.iter().find(|s| s.id == id as u64) {
            Some(sig) => sig,
            None => return 0.0,
        };

        let th = self.cfg.match_threshold;
        let (f_struct, f_sim) = if th > 1e-6 {
            (
                (-2.0 * structural_distance / th).exp(),
                (-distance / th).exp(),
            )
        } else {
            (1.0, 1.0)
        };

        let f = 0.7 * f_struct + 0.3 * f_sim;
        let familiarity = (sig.persistence_trace / self.cfg.trace_cap).min(1.0);
        let quality = 1.0 - sig.false_alarm_rate;
        let risk = sig.historical_risk;
        let growth_factor = 1.0 + 0.5 * growth_risk + 0.3 * growth_accel.max(0.0);

        (f * familiarity * quality * (1.0 - risk) * growth_factor).clamp(0.0, 1.0)
    }

    /// Convert a match result to the published SignatureMatch record.
    pub fn to_signature_match(
        &self,
        m: &MatchResult,
        growth_risk: f32,
        growth_accel: f32,
    ) -> SignatureMatch {
        SignatureMatch {
            matched: m.matched,
            id: m.id,
            distance: m.distance,
            structural_distance: m.structural_distance,
            confidence: self.compute_confidence(
                m.matched,
                m.id,
                m.distance,
                m.structural_distance,
                growth_risk,
                growth_accel,
            ),
        }
    }

    /// Sufficiency gate: is this match trustworthy enough to skip further
    /// scrutiny? Familiar signatures earn a small bonus; a large luminance
    /// jump against the stored scene raises the bar.
    pub fn is_sufficient(&self, m: &MatchResult, confidence_threshold: f32) -> bool {
        const FAMILIARITY_BONUS: f32 = 0.08;
        const STABLE_TRACE_THRESHOLD: f32 = 3.0;
        const MAX_RISK_TO_IGNORE: f32 = 0.8;
        const MAX_LUMINANCE_JUMP: f32 = 0.15;
        const LUMINANCE_CONF_BOOST: f32 = 0.12;

        if !m.matched || m.id < 0 {
            return false;
        }

        let base_conf = self.compute_confidence(
            m.matched,
            m.id,
            m.distance,
            m.structural_distance,
            0.0,
            0.0,
        );

        let inner = self.inner.read();
        let sig = match inner.signatures.iter().find(|s| s.id == m.id as u64) {
            Some(sig) => sig,
            None => return false,
        };

        let familiarity = (sig.occurrence_count as f32 / 20.0).min(1.0);
        let adjusted = base_conf + familiarity * FAMILIARITY_BONUS;

        let mut effective_threshold = confidence_threshold;
        if (m.avg_luminance - sig.avg_luminance).abs() > MAX_LUMINANCE_JUMP {
            effective_threshold = (confidence_threshold + LUMINANCE_CONF_BOOST).min(1.0);
        }

        if sig.historical_risk > MAX_RISK_TO_IGNORE {
            return false;
        }
        if sig.persistence_trace < STABLE_TRACE_THRESHOLD {
            return false;
        }

        adjusted >= effective_threshold
    }

    // ------------------------------------------------------------------
    // Feedback (writer)
    // ------------------------------------------------------------------

    /// Online risk / false-alarm learning from downstream outcomes.
    pub fn feedback(&self, id: u64, outcome: FeedbackOutcome) {
        let mut inner = self.inner.write();
        if let Some(sig) = inner.signatures.iter_mut().find(|s| s.id == id) {
            match outcome {
                FeedbackOutcome::Confirmed => {
                    sig.historical_risk = (sig.historical_risk + 0.1).min(1.0);
                }
                FeedbackOutcome::FalseAlarm => {
                    sig.false_alarm_rate = (sig.false_alarm_rate + 0.1).min(1.0);
                    sig.historical_risk = (sig.historical_risk - 0.05).max(0.0);
                }
                FeedbackOutcome::Alerted => {
                    sig.historical_risk = (sig.historical_risk + 0.02).min(1.0);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Utilities
    // ------------------------------------------------------------------

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.signatures.clear();
        inner.next_id = 0;
        self.total_matches.store(0, Ordering::Relaxed);
        self.total_registrations.store(0, Ordering::Relaxed);
        self.total_prunes.store(0, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.inner.read().signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> BankStats {
        BankStats {
            len: self.len(),
            total_matches: self.total_matches.load(Ordering::Relaxed),
            total_registrations: self.total_registrations.load(Ordering::Relaxed),
            total_prunes: self.total_prunes.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &SignatureBankConfig {
        &self.cfg
    }
}

// ============================================================================
// Internal helpers
// ============================================================================

fn decay_trace(sig: &mut Signature, now_s: f64, cfg: &SignatureBankConfig) {
    if sig.last_match_time <= 0.0 {
        return;
    }
    let dt = (now_s - sig.last_match_time).max(0.0) as f32;
    sig.persistence_trace *= (-dt / cfg.trace_tau_s).exp();
}

fn update_trace(sig: &mut Signature, now_s: f64, cfg: &SignatureBankConfig) {
    decay_trace(sig, now_s, cfg);
    sig.persistence_trace = (sig.persistence_trace + cfg.trace_increment).min(cfg.trace_cap);
    sig.last_match_time = now_s;
}

fn ema_update(stored: &mut [f32], query: &[f32], lr: f32) {
    for (s, q) in stored.iter_mut().zip(query.iter()) {
        *s = (1.0 - lr) * *s + lr * q;
    }
    safe_unit_norm(stored);
}

/// Remove the lowest-value tenth of the bank. Value favors recently seen,
/// familiar, risky signatures. Returns the number removed.
fn prune(signatures: &mut Vec<Signature>, cfg: &SignatureBankConfig, now_s: f64) -> u64 {
    if signatures.is_empty() {
        return 0;
    }

    let mut scored: Vec<(f32, usize)> = signatures
        .iter()
        .enumerate()
        .map(|(i, sig)| {
            let recency =
                (-((now_s - sig.last_seen) as f32) / cfg.forgetting_period_s as f32).exp();
            let familiarity = (sig.occurrence_count as f32 / 10.0).min(1.0);
            (recency * familiarity * (sig.historical_risk + 0.1), i)
        })
        .collect();

    scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let remove_n = (scored.len() / 10).max(1);
    let mut indices: Vec<usize> = scored[..remove_n].iter().map(|&(_, i)| i).collect();
    indices.sort_unstable_by(|a, b| b.cmp(a));
    for idx in indices {
        signatures.remove(idx);
    }
    remove_n as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::descriptors::{CONTEXT_DIM, MOTION_DIM, SEMANTIC_PROFILE_DIM, STRUCTURAL_DIM};

    fn basis_descriptors(axis: usize) -> DescriptorSet {
        let one_hot = |dim: usize| {
            let mut v = vec![0.0f32; dim];
            v[axis % dim] = 1.0;
            v
        };
        DescriptorSet {
            structural: one_hot(STRUCTURAL_DIM),
            semantic_profile: one_hot(SEMANTIC_PROFILE_DIM),
            context: one_hot(CONTEXT_DIM),
            motion: one_hot(MOTION_DIM),
        }
    }

    #[test]
    fn test_empty_bank_never_matches() {
        let bank = SignatureBank::new(SignatureBankConfig::default());
        let m = bank.find_match(&basis_descriptors(0), 0.5, 10.0);
        assert!(!m.matched);
        assert_eq!(m.confidence, 0.0);
    }

    #[test]
    fn test_identical_query_matches_with_full_confidence() {
        let bank = SignatureBank::new(SignatureBankConfig::default());
        let desc = basis_descriptors(0);
        bank.register(&desc, 0.1, 0.5, 10.0);

        let m = bank.find_match(&desc, 0.5, 11.0);
        assert!(m.matched);
        assert!(m.distance < 1e-5);
        // Raw confidence exp(-d/threshold) of an exact match.
        assert!(m.confidence > 0.99 && m.confidence <= 1.0);
    }

    #[test]
    fn test_orthogonal_query_does_not_match() {
        let bank = SignatureBank::new(SignatureBankConfig::default());
        bank.register(&basis_descriptors(0), 0.1, 0.5, 10.0);

        let m = bank.find_match(&basis_descriptors(1), 0.5, 11.0);
        assert!(!m.matched);
        assert_eq!(m.confidence, 0.0);
        // Unit vectors on different axes sit sqrt(2) apart in every space.
        assert!(m.distance > SignatureBankConfig::default().match_threshold);
    }

    #[test]
    fn test_product_confidence_stays_in_unit_interval() {
        let bank = SignatureBank::new(SignatureBankConfig::default());
        let desc = basis_descriptors(0);
        bank.register(&desc, 0.1, 0.5, 10.0);

        // Build up the persistence trace with repeated matches.
        for i in 0..20 {
            bank.find_match(&desc, 0.5, 10.0 + i as f64 * 0.1);
        }
        let m = bank.find_match(&desc, 0.5, 13.0);
        let conf = bank.compute_confidence(m.matched, m.id, m.distance, m.structural_distance, 0.0, 0.0);
        assert!(conf > 0.0 && conf <= 1.0);

        // Growth terms may only raise it, still clamped to 1.
        let boosted =
            bank.compute_confidence(m.matched, m.id, m.distance, m.structural_distance, 1.0, 1.0);
        assert!(boosted >= conf);
        assert!(boosted <= 1.0);
    }

    #[test]
    fn test_match_refreshes_trace_and_occurrence() {
        let bank = SignatureBank::new(SignatureBankConfig::default());
        let desc = basis_descriptors(0);
        bank.register(&desc, 0.1, 0.5, 10.0);
        bank.find_match(&desc, 0.5, 11.0);
        bank.find_match(&desc, 0.5, 12.0);

        let stats = bank.stats();
        assert_eq!(stats.total_matches, 2);
        assert_eq!(stats.total_registrations, 1);
        assert_eq!(stats.len, 1);
    }

    #[test]
    fn test_capacity_prunes_lowest_value() {
        let cfg = SignatureBankConfig {
            max_signatures: 20,
            ..Default::default()
        };
        let bank = SignatureBank::new(cfg);
        for i in 0..25 {
            // Spread registrations across axes so nothing matches.
            bank.register(&basis_descriptors(i), 0.1, 0.5, 10.0 + i as f64);
        }
        assert!(bank.len() <= 20);
        assert!(bank.stats().total_prunes > 0);
    }

    #[test]
    fn test_feedback_adjusts_risk() {
        let bank = SignatureBank::new(SignatureBankConfig::default());
        let desc = basis_descriptors(0);
        let id = bank.register(&desc, 0.5, 0.5, 10.0);

        bank.feedback(id, FeedbackOutcome::FalseAlarm);
        let m = bank.find_match(&desc, 0.5, 11.0);
        let conf_after_false_alarm =
            bank.compute_confidence(m.matched, m.id, m.distance, m.structural_distance, 0.0, 0.0);

        bank.feedback(id, FeedbackOutcome::Confirmed);
        let conf_after_confirm =
            bank.compute_confidence(m.matched, m.id, m.distance, m.structural_distance, 0.0, 0.0);

        // Confirmation raises historical risk, which lowers the (1 - R) term.
        assert!(conf_after_confirm <= conf_after_false_alarm);
    }

    #[test]
    fn test_sufficiency_requires_stable_trace() {
        let bank = SignatureBank::new(SignatureBankConfig::default());
        let desc = basis_descriptors(0);
        bank.register(&desc, 0.1, 0.5, 10.0);

        let fresh = bank.find_match(&desc, 0.5, 10.5);
        assert!(!bank.is_sufficient(&fresh, 0.5));

        // Repeated sightings in quick succession saturate the trace.
        let mut last = fresh;
        for i in 0..10 {
            last = bank.find_match(&desc, 0.5, 10.5 + i as f64 * 0.05);
        }
        assert!(bank.is_sufficient(&last, 0.05));
    }

    #[test]
    fn test_clear_resets_everything() {
        let bank = SignatureBank::new(SignatureBankConfig::default());
        bank.register(&basis_descriptors(0), 0.1, 0.5, 10.0);
        bank.clear();
        assert!(bank.is_empty());
        assert_eq!(bank.stats().total_registrations, 0);
    }
}

//! Adaptive tier routing.
//!
//! Each mutation request is scored and routed to one of the three tiers.
//! Boundary positions drift toward tiers that keep succeeding and away
//! from tiers that keep getting rejected, inside hard floors and
//! ceilings; a tier with sustained failure additionally picks up a
//! decaying penalty that raises its effective threshold.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use alpha_core::config::MutationConfig;
use alpha_graph::Strategy;

use crate::ops::{MutationRecord, Tier};

/// Market conditions relevant to mutation risk. Supplied by the caller
/// once per generation.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarketContext {
    /// Recent realized volatility, normalized to [0, 1].
    pub recent_volatility: f64,
}

/// Current routing boundaries. `tier1_boundary` separates Tier1 from
/// Tier2, `tier2_boundary` separates Tier2 from Tier3.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierThresholds {
    pub tier1_boundary: f64,
    pub tier2_boundary: f64,
}

/// Rolling success window per tier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SuccessWindow {
    outcomes: VecDeque<bool>,
}

impl SuccessWindow {
    fn push(&mut self, success: bool, cap: usize) {
        if self.outcomes.len() >= cap.max(1) {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(success);
    }

    fn attempts(&self) -> usize {
        self.outcomes.len()
    }

    fn rate(&self) -> Option<f64> {
        if self.outcomes.is_empty() {
            return None;
        }
        let hits = self.outcomes.iter().filter(|b| **b).count();
        Some(hits as f64 / self.outcomes.len() as f64)
    }
}

/// Serializable learner state, owned by the population manager and
/// updated in a single batch per generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveLearnerState {
    pub thresholds: TierThresholds,
    windows: [SuccessWindow; 3],
    penalties: [f64; 3],
    strategy_failures: HashMap<String, SuccessWindow>,
}

impl AdaptiveLearnerState {
    fn new(cfg: &MutationConfig) -> Self {
        Self {
            thresholds: TierThresholds {
                tier1_boundary: cfg.tier1_boundary,
                tier2_boundary: cfg.tier2_boundary,
            },
            windows: Default::default(),
            penalties: [0.0; 3],
            strategy_failures: HashMap::new(),
        }
    }
}

pub struct TierSelector {
    cfg: MutationConfig,
    state: AdaptiveLearnerState,
}

impl TierSelector {
    pub fn new(cfg: MutationConfig) -> Self {
        let state = AdaptiveLearnerState::new(&cfg);
        Self { cfg, state }
    }

    pub fn thresholds(&self) -> TierThresholds {
        self.state.thresholds
    }

    pub fn success_rate(&self, tier: Tier) -> Option<f64> {
        self.state.windows[tier.index()].rate()
    }

    pub fn penalty(&self, tier: Tier) -> f64 {
        self.state.penalties[tier.index()]
    }

    /// Mutation headroom in [0, 1]. Simple strategies in calm markets with
    /// a clean mutation history score high and may be routed to the more
    /// aggressive tiers; complexity, volatility, and recent failures all
    /// pull the score down toward the safe configuration tier.
    pub fn risk_score(&self, strategy: &Strategy, ctx: &MarketContext) -> f64 {
        let max_factors = self.cfg.max_factors.max(1) as f64;
        let complexity = (strategy.factor_count() as f64 / max_factors).clamp(0.0, 1.0);
        let volatility = ctx.recent_volatility.clamp(0.0, 1.0);
        let failure_rate = self
            .state
            .strategy_failures
            .get(&strategy.id)
            .and_then(|w| w.rate())
            .map(|success| 1.0 - success)
            .unwrap_or(0.0);
        let burden = 0.4 * complexity + 0.3 * volatility + 0.3 * failure_rate;
        (1.0 - burden).clamp(0.0, 1.0)
    }

    /// Routes a score through the current effective boundaries. A tier's
    /// failure penalty raises the boundary guarding it, degrading routing
    /// toward safer tiers without any operator intervention.
    pub fn route(&self, risk: f64) -> Tier {
        let t = &self.state.thresholds;
        let tier3_gate = (t.tier2_boundary + self.state.penalties[Tier::Tier3.index()]).min(0.99);
        let tier2_gate = (t.tier1_boundary + self.state.penalties[Tier::Tier2.index()]).min(0.99);
        if risk >= tier3_gate {
            Tier::Tier3
        } else if risk >= tier2_gate {
            Tier::Tier2
        } else {
            Tier::Tier1
        }
    }

    /// Per-mutation-request selection.
    pub fn select(&self, strategy: &Strategy, ctx: &MarketContext) -> Tier {
        self.route(self.risk_score(strategy, ctx))
    }

    /// Batch update applied once per generation from the collected
    /// mutation records. Never called from worker threads.
    pub fn apply_generation(&mut self, records: &[MutationRecord]) {
        let mut batch_attempts = [0usize; 3];
        for record in records {
            let idx = record.tier.index();
            batch_attempts[idx] += 1;
            self.state.windows[idx].push(record.success, self.cfg.success_window);
            self.state
                .strategy_failures
                .entry(record.strategy_id.clone())
                .or_default()
                .push(record.success, self.cfg.success_window.min(16));
        }

        // Keep the per-strategy map from growing without bound; only the
        // most recently touched lineages matter for routing.
        if self.state.strategy_failures.len() > 4096 {
            self.state.strategy_failures.clear();
        }

        self.adjust_boundaries();
        self.adjust_penalties(&batch_attempts);

        debug!(
            "tier boundaries now {:.3}/{:.3}, penalties {:?}",
            self.state.thresholds.tier1_boundary,
            self.state.thresholds.tier2_boundary,
            self.state.penalties
        );
    }

    fn adjust_boundaries(&mut self) {
        let min_n = self.cfg.min_samples_for_adjustment;
        let step = self.cfg.boundary_step;
        let rate = |w: &SuccessWindow| {
            if w.attempts() >= min_n {
                w.rate()
            } else {
                None
            }
        };
        let r1 = rate(&self.state.windows[0]);
        let r2 = rate(&self.state.windows[1]);
        let r3 = rate(&self.state.windows[2]);

        // Widen the band of the better-performing neighbor, one bounded
        // step per adjustment window.
        if let (Some(r1), Some(r2)) = (r1, r2) {
            let t = &mut self.state.thresholds.tier1_boundary;
            if r2 > r1 + 0.05 {
                *t -= step;
            } else if r1 > r2 + 0.05 {
                *t += step;
            }
            *t = t.clamp(self.cfg.tier1_boundary_floor, self.cfg.tier1_boundary_ceiling);
        }
        if let (Some(r2), Some(r3)) = (r2, r3) {
            let t = &mut self.state.thresholds.tier2_boundary;
            if r3 > r2 + 0.05 {
                *t -= step;
            } else if r2 > r3 + 0.05 {
                *t += step;
            }
            *t = t.clamp(self.cfg.tier2_boundary_floor, self.cfg.tier2_boundary_ceiling);
        }

        // The boundaries must keep a usable Tier2 band between them.
        if self.state.thresholds.tier1_boundary + 0.05 > self.state.thresholds.tier2_boundary {
            self.state.thresholds.tier1_boundary = self.state.thresholds.tier2_boundary - 0.05;
        }
    }

    fn adjust_penalties(&mut self, batch_attempts: &[usize; 3]) {
        for tier in Tier::ALL {
            let idx = tier.index();
            let window = &self.state.windows[idx];
            // "Sustained" means the tier kept failing while it was still
            // being exercised; a quiet tier decays back toward neutral.
            let sustained_failure = batch_attempts[idx] > 0
                && window.attempts() >= self.cfg.min_samples_for_adjustment
                && window.rate().unwrap_or(1.0) < self.cfg.failure_rate_floor;
            let penalty = &mut self.state.penalties[idx];
            if sustained_failure {
                *penalty = (*penalty + self.cfg.failure_penalty_step).min(0.3);
            } else {
                *penalty *= self.cfg.failure_penalty_decay;
                if *penalty < 1e-3 {
                    *penalty = 0.0;
                }
            }
        }
    }

    /// Serialized learner state for checkpoints.
    pub fn to_state(&self) -> AdaptiveLearnerState {
        self.state.clone()
    }

    pub fn restore(cfg: MutationConfig, state: AdaptiveLearnerState) -> Self {
        Self { cfg, state }
    }
}

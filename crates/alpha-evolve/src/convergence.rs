//! Convergence detection. Declared only when diversity has stayed below
//! the floor for a full window AND best fitness has been flat for a full
//! window; either signal alone is not enough.

use serde::{Deserialize, Serialize};

use alpha_core::config::EvolutionConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConvergenceTracker {
    low_diversity_streak: usize,
    stagnation_streak: usize,
    best_seen: Option<f64>,
}

impl ConvergenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one generation's diversity and best fitness; returns whether
    /// both convergence conditions now hold.
    pub fn observe(&mut self, diversity: f64, best: f64, cfg: &EvolutionConfig) -> bool {
        if diversity < cfg.diversity_floor {
            self.low_diversity_streak += 1;
        } else {
            self.low_diversity_streak = 0;
        }

        match self.best_seen {
            None => {
                self.best_seen = Some(best);
                self.stagnation_streak = 0;
            }
            Some(prev) if best > prev + cfg.stagnation_epsilon => {
                self.best_seen = Some(best);
                self.stagnation_streak = 0;
            }
            Some(_) => {
                self.stagnation_streak += 1;
            }
        }

        self.low_diversity_streak >= cfg.diversity_window
            && self.stagnation_streak >= cfg.stagnation_window
    }

    /// Called on restart: counters reset, the best-seen mark survives
    /// because the champion does.
    pub fn reset_streaks(&mut self) {
        self.low_diversity_streak = 0;
        self.stagnation_streak = 0;
    }

    pub fn low_diversity_streak(&self) -> usize {
        self.low_diversity_streak
    }

    pub fn stagnation_streak(&self) -> usize {
        self.stagnation_streak
    }
}

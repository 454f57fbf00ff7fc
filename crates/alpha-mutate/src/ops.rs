use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use statrs::distribution::Normal;
use uuid::Uuid;

use alpha_graph::{ParamRange, ParamValue};

/// Abstraction level a mutation operates at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Tier1,
    Tier2,
    Tier3,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Tier1, Tier::Tier2, Tier::Tier3];

    pub fn index(&self) -> usize {
        match self {
            Tier::Tier1 => 0,
            Tier::Tier2 => 1,
            Tier::Tier3 => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Tier1 => "tier1",
            Tier::Tier2 => "tier2",
            Tier::Tier3 => "tier3",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of mutation operations across all tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOp {
    AddFactor,
    RemoveFactor,
    ReplaceFactor,
    MutateParameters,
    ToggleComparison,
    PerturbThreshold,
    SwapCombine,
    InjectAdaptiveParam,
}

impl MutationOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationOp::AddFactor => "add_factor",
            MutationOp::RemoveFactor => "remove_factor",
            MutationOp::ReplaceFactor => "replace_factor",
            MutationOp::MutateParameters => "mutate_parameters",
            MutationOp::ToggleComparison => "toggle_comparison",
            MutationOp::PerturbThreshold => "perturb_threshold",
            MutationOp::SwapCombine => "swap_combine",
            MutationOp::InjectAdaptiveParam => "inject_adaptive_param",
        }
    }
}

impl std::fmt::Display for MutationOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an added factor attaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertionPoint {
    /// Upstream insert; rejected unless an existing factor already
    /// consumes the new outputs.
    Root,
    /// Terminal insert; the new outputs join the declared final outputs.
    Leaf,
    /// Search for a compatible consumer, fall back to leaf for
    /// signal-producing factors.
    Smart,
}

/// Parameter noise used by `mutate_parameters`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseModel {
    /// Gaussian centered on the current value, sigma expressed as a
    /// fraction of the declared range width.
    Gaussian { sigma: f64 },
    /// Uniform jitter, spread expressed as a fraction of the range width.
    Uniform { spread: f64 },
}

impl NoiseModel {
    pub fn sample(&self, current: &ParamValue, range: &ParamRange, rng: &mut impl Rng) -> ParamValue {
        let width = (range.max - range.min).max(1e-12);
        let raw = match self {
            NoiseModel::Gaussian { sigma } => {
                let dist = Normal::new(current.as_f64(), sigma.abs().max(1e-12) * width)
                    .unwrap_or_else(|_| Normal::new(current.as_f64(), 1e-6).unwrap());
                rng.sample(dist)
            }
            NoiseModel::Uniform { spread } => {
                let half = spread.abs() * width / 2.0;
                current.as_f64() + rng.gen_range(-half..=half)
            }
        };
        range.clamp(raw)
    }
}

/// Telemetry for one mutation attempt; feeds the adaptive learner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationRecord {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub tier: Tier,
    pub op: MutationOp,
    pub success: bool,
    pub strategy_id: String,
    pub result_strategy_id: Option<String>,
    pub failure: Option<String>,
}

impl MutationRecord {
    pub fn success(tier: Tier, op: MutationOp, strategy_id: &str, result_id: &str) -> Self {
        Self {
            event_id: Uuid::new_v4().simple().to_string()[..16].to_string(),
            timestamp: Utc::now(),
            tier,
            op,
            success: true,
            strategy_id: strategy_id.to_string(),
            result_strategy_id: Some(result_id.to_string()),
            failure: None,
        }
    }

    pub fn failure(tier: Tier, op: MutationOp, strategy_id: &str, reason: &str) -> Self {
        Self {
            event_id: Uuid::new_v4().simple().to_string()[..16].to_string(),
            timestamp: Utc::now(),
            tier,
            op,
            success: false,
            strategy_id: strategy_id.to_string(),
            result_strategy_id: None,
            failure: Some(reason.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn gaussian_noise_stays_in_range() {
        let range = ParamRange::float(0.0, 1.0);
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..200 {
            let v = NoiseModel::Gaussian { sigma: 0.5 }.sample(
                &ParamValue::Float(0.5),
                &range,
                &mut rng,
            );
            let f = v.as_f64();
            assert!((0.0..=1.0).contains(&f));
        }
    }

    #[test]
    fn integer_noise_yields_integers() {
        let range = ParamRange::int(2, 64);
        let mut rng = StdRng::seed_from_u64(2);
        for _ in 0..100 {
            let v = NoiseModel::Uniform { spread: 0.4 }.sample(
                &ParamValue::Int(14),
                &range,
                &mut rng,
            );
            assert!(matches!(v, ParamValue::Int(n) if (2..=64).contains(&n)));
        }
    }

    #[test]
    fn record_constructors() {
        let ok = MutationRecord::success(Tier::Tier1, MutationOp::AddFactor, "a", "b");
        assert!(ok.success);
        assert_eq!(ok.result_strategy_id.as_deref(), Some("b"));
        let bad = MutationRecord::failure(Tier::Tier3, MutationOp::SwapCombine, "a", "orphan");
        assert!(!bad.success);
        assert_eq!(bad.failure.as_deref(), Some("orphan"));
    }
}

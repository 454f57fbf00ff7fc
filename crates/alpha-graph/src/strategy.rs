use std::collections::{BTreeMap, BTreeSet, VecDeque};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::factor::{Factor, FactorCategory, FactorId, ParamValue};
use crate::library::base_channel_set;
use crate::logic::{CompiledLogic, LogicArena};

/// Opaque evaluation outcome attached to a strategy by the external
/// fitness evaluator. Objectives are maximized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fitness {
    pub objectives: Vec<f64>,
    pub metrics: BTreeMap<String, f64>,
    pub statistically_significant: bool,
    pub failed: bool,
}

/// Sentinel assigned when evaluation fails or times out; large enough to
/// lose every tournament yet finite so crowding math stays well-defined.
pub const WORST_OBJECTIVE: f64 = -1.0e9;

impl Fitness {
    pub fn worst(objective_count: usize) -> Self {
        Self {
            objectives: vec![WORST_OBJECTIVE; objective_count.max(1)],
            metrics: BTreeMap::new(),
            statistically_significant: false,
            failed: true,
        }
    }

    /// Primary objective, used for champion tracking and stagnation checks.
    pub fn primary(&self) -> f64 {
        self.objectives.first().copied().unwrap_or(WORST_OBJECTIVE)
    }
}

/// A DAG of factors representing one tradeable decision rule.
///
/// Dependencies are derived from channel names: factor A depends on factor
/// B iff one of A's inputs matches one of B's outputs (self-matches are
/// ignored). Several factors may produce the same channel; during
/// execution the producer latest in topological order wins.
#[derive(Debug, Clone, PartialEq)]
pub struct Strategy {
    pub id: String,
    pub generation: usize,
    pub parent_ids: Vec<String>,
    pub factors: BTreeMap<FactorId, Factor>,
    pub final_outputs: BTreeSet<String>,
    pub fitness: Option<Fitness>,
}

impl Strategy {
    pub fn new(id: impl Into<String>, generation: usize, parent_ids: Vec<String>) -> Self {
        Self {
            id: id.into(),
            generation,
            parent_ids,
            factors: BTreeMap::new(),
            final_outputs: ["signal", "position"].iter().map(|s| s.to_string()).collect(),
            fitness: None,
        }
    }

    pub fn next_factor_id(&self) -> FactorId {
        FactorId(self.factors.keys().map(|k| k.0 + 1).max().unwrap_or(0))
    }

    pub fn insert_factor(&mut self, factor: Factor) {
        self.factors.insert(factor.id, factor);
    }

    pub fn factor_count(&self) -> usize {
        self.factors.len()
    }

    pub fn categories(&self) -> BTreeSet<FactorCategory> {
        self.factors.values().map(|f| f.category).collect()
    }

    /// Factors producing `channel`.
    pub fn producers(&self, channel: &str) -> Vec<FactorId> {
        self.factors
            .values()
            .filter(|f| f.outputs.contains(channel))
            .map(|f| f.id)
            .collect()
    }

    /// Derived dependency map: id -> set of factors it depends on.
    pub fn dependency_edges(&self) -> BTreeMap<FactorId, BTreeSet<FactorId>> {
        let mut edges: BTreeMap<FactorId, BTreeSet<FactorId>> = BTreeMap::new();
        for consumer in self.factors.values() {
            let deps = edges.entry(consumer.id).or_default();
            for input in &consumer.inputs {
                for producer in self.factors.values() {
                    if producer.id != consumer.id && producer.outputs.contains(input) {
                        deps.insert(producer.id);
                    }
                }
            }
        }
        edges
    }

    /// Factors that directly consume any output of `id`.
    pub fn dependents_of(&self, id: FactorId) -> BTreeSet<FactorId> {
        let Some(target) = self.factors.get(&id) else {
            return BTreeSet::new();
        };
        self.factors
            .values()
            .filter(|f| f.id != id && f.inputs.iter().any(|i| target.outputs.contains(i)))
            .map(|f| f.id)
            .collect()
    }

    /// Full transitive dependent set of `id`, excluding `id` itself.
    pub fn transitive_dependents(&self, id: FactorId) -> BTreeSet<FactorId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<FactorId> = self.dependents_of(id).into_iter().collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next) {
                queue.extend(self.dependents_of(next));
            }
        }
        seen
    }

    /// Kahn's algorithm with ascending-id tie-break, so the order is unique
    /// up to genuine ties and stable across runs.
    pub fn topological_order(&self) -> Result<Vec<FactorId>, ValidationError> {
        let edges = self.dependency_edges();
        let mut remaining: BTreeMap<FactorId, BTreeSet<FactorId>> = edges.clone();
        let mut ready: BTreeSet<FactorId> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.factors.len());
        while let Some(&next) = ready.iter().next() {
            ready.remove(&next);
            remaining.remove(&next);
            order.push(next);
            for (id, deps) in remaining.iter_mut() {
                if deps.remove(&next) && deps.is_empty() {
                    ready.insert(*id);
                }
            }
        }
        if let Some((&stuck, _)) = remaining.iter().next() {
            return Err(ValidationError::CycleDetected(stuck));
        }
        Ok(order)
    }

    /// Runs structural invariants 1-5. Strategies are treated as immutable
    /// once this passes.
    pub fn validate(&self) -> Result<(), ValidationError> {
        // 1 + 5: acyclic with a well-defined order.
        self.topological_order()?;

        // 2: every input is fed by the base dataset or another factor.
        let base = base_channel_set();
        for factor in self.factors.values() {
            for input in &factor.inputs {
                let produced = self
                    .factors
                    .values()
                    .any(|other| other.id != factor.id && other.outputs.contains(input));
                if !base.contains(input) && !produced {
                    return Err(ValidationError::MissingDependency {
                        factor: factor.id,
                        input: input.clone(),
                    });
                }
            }
        }

        // 3: no orphaned factor.
        for factor in self.factors.values() {
            let terminal = factor.outputs.iter().any(|o| self.final_outputs.contains(o));
            let consumed = self
                .factors
                .values()
                .any(|other| {
                    other.id != factor.id && other.inputs.iter().any(|i| factor.outputs.contains(i))
                });
            if !terminal && !consumed {
                return Err(ValidationError::OrphanedFactor { factor: factor.id });
            }
        }

        // 4: at least one trading-decision producer.
        if !self.factors.values().any(|f| f.produces_signal()) {
            return Err(ValidationError::NoSignalProducer);
        }

        Ok(())
    }

    /// Signal-producing factors, used by the remove-factor guard.
    pub fn signal_producers(&self) -> Vec<FactorId> {
        self.factors
            .values()
            .filter(|f| f.produces_signal())
            .map(|f| f.id)
            .collect()
    }

    /// Structural identity ignores ids, fitness, and lineage: same factor
    /// kinds with the same parameters and the same final outputs.
    pub fn structurally_identical(&self, other: &Strategy) -> bool {
        if self.final_outputs != other.final_outputs {
            return false;
        }
        let key = |s: &Strategy| {
            let mut entries: Vec<(String, Vec<(String, ParamValue)>)> = s
                .factors
                .values()
                .map(|f| {
                    (
                        f.name.clone(),
                        f.parameters
                            .iter()
                            .map(|(k, v)| (k.clone(), *v))
                            .collect(),
                    )
                })
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            entries
        };
        let (a, b) = (key(self), key(other));
        a.len() == b.len()
            && a.iter().zip(b.iter()).all(|(x, y)| {
                x.0 == y.0
                    && x.1.len() == y.1.len()
                    && x.1
                        .iter()
                        .zip(y.1.iter())
                        .all(|(p, q)| p.0 == q.0 && param_eq(p.1, q.1))
            })
    }

    pub fn to_snapshot(&self, arena: &LogicArena) -> StrategySnapshot {
        StrategySnapshot {
            id: self.id.clone(),
            generation: self.generation,
            parent_ids: self.parent_ids.clone(),
            final_outputs: self.final_outputs.clone(),
            fitness: self.fitness.clone(),
            factors: self
                .factors
                .values()
                .map(|f| FactorSnapshot {
                    id: f.id,
                    name: f.name.clone(),
                    category: f.category,
                    parameters: f.parameters.clone(),
                    inputs: f.inputs.clone(),
                    outputs: f.outputs.clone(),
                    logic_body: arena.get(f.logic),
                })
                .collect(),
        }
    }
}

fn param_eq(a: ParamValue, b: ParamValue) -> bool {
    (a.as_f64() - b.as_f64()).abs() < 1e-12
}

/// Serializable image of a strategy, carrying logic bodies so a checkpoint
/// can be restored into a fresh arena.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySnapshot {
    pub id: String,
    pub generation: usize,
    pub parent_ids: Vec<String>,
    pub final_outputs: BTreeSet<String>,
    pub fitness: Option<Fitness>,
    pub factors: Vec<FactorSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorSnapshot {
    pub id: FactorId,
    pub name: String,
    pub category: FactorCategory,
    pub parameters: BTreeMap<String, ParamValue>,
    pub inputs: BTreeSet<String>,
    pub outputs: BTreeSet<String>,
    pub logic_body: Option<CompiledLogic>,
}

impl StrategySnapshot {
    /// Re-registers every carried logic body and rebuilds the strategy.
    pub fn restore(&self, arena: &LogicArena) -> anyhow::Result<Strategy> {
        let mut strategy = Strategy::new(self.id.clone(), self.generation, self.parent_ids.clone());
        strategy.final_outputs = self.final_outputs.clone();
        strategy.fitness = self.fitness.clone();
        for snap in &self.factors {
            let body = snap
                .logic_body
                .clone()
                .ok_or_else(|| anyhow::anyhow!("snapshot factor '{}' carries no logic body", snap.name))?;
            let logic = arena.insert(body);
            strategy.insert_factor(Factor {
                id: snap.id,
                name: snap.name.clone(),
                category: snap.category,
                parameters: snap.parameters.clone(),
                inputs: snap.inputs.clone(),
                outputs: snap.outputs.clone(),
                logic,
            });
        }
        Ok(strategy)
    }
}

/// Strategy ids follow the same shape across initialization, mutation, and
/// crossover so lineage reads uniformly in logs and checkpoints.
pub fn mint_strategy_id(rng: &mut impl Rng, generation: usize) -> String {
    format!("strat_{:06x}_{}", rng.gen_range(0..0xff_ffffu32), generation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factor::FactorId;
    use crate::library::{BuiltinLibrary, FactorLibrary};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn lib() -> BuiltinLibrary {
        BuiltinLibrary::new()
    }

    /// close -> rsi -> momentum_rank -> signal_momentum
    fn momentum_chain(lib: &BuiltinLibrary, id: &str) -> Strategy {
        let mut s = Strategy::new(id, 0, vec![]);
        let empty = BTreeMap::new();
        s.insert_factor(lib.instantiate("rsi", FactorId(0), &empty).unwrap());
        s.insert_factor(lib.instantiate("momentum_rank", FactorId(1), &empty).unwrap());
        s.insert_factor(lib.instantiate("signal_momentum", FactorId(2), &empty).unwrap());
        s
    }

    #[test]
    fn valid_chain_passes() {
        let lib = lib();
        let s = momentum_chain(&lib, "s1");
        assert!(s.validate().is_ok());
        let order = s.topological_order().unwrap();
        assert_eq!(order, vec![FactorId(0), FactorId(1), FactorId(2)]);
    }

    #[test]
    fn missing_dependency_detected() {
        let lib = lib();
        let mut s = Strategy::new("s2", 0, vec![]);
        let empty = BTreeMap::new();
        // momentum_rank needs "rsi" which nothing produces.
        s.insert_factor(lib.instantiate("momentum_rank", FactorId(0), &empty).unwrap());
        s.insert_factor(lib.instantiate("signal_momentum", FactorId(1), &empty).unwrap());
        let err = s.validate().unwrap_err();
        assert!(matches!(err, ValidationError::MissingDependency { input, .. } if input == "rsi"));
    }

    #[test]
    fn orphan_detected() {
        let lib = lib();
        let mut s = momentum_chain(&lib, "s3");
        // atr feeds nothing and is not a final output.
        let empty = BTreeMap::new();
        s.insert_factor(lib.instantiate("atr", FactorId(3), &empty).unwrap());
        let err = s.validate().unwrap_err();
        assert_eq!(err, ValidationError::OrphanedFactor { factor: FactorId(3) });
    }

    #[test]
    fn no_signal_producer_detected() {
        let lib = lib();
        let mut s = Strategy::new("s4", 0, vec![]);
        let empty = BTreeMap::new();
        s.insert_factor(lib.instantiate("rsi", FactorId(0), &empty).unwrap());
        s.insert_factor(lib.instantiate("momentum_rank", FactorId(1), &empty).unwrap());
        s.final_outputs.insert("momentum_score".to_string());
        let err = s.validate().unwrap_err();
        assert_eq!(err, ValidationError::NoSignalProducer);
    }

    #[test]
    fn cycle_detected() {
        use crate::logic::{CompiledLogic, SignalExpr};
        let lib = lib();
        let mut s = Strategy::new("s5", 0, vec![]);
        let a = lib.arena().insert(CompiledLogic::single("x", SignalExpr::channel("y")));
        let b = lib.arena().insert(CompiledLogic::single("y", SignalExpr::channel("x")));
        s.insert_factor(Factor {
            id: FactorId(0),
            name: "cyc_a".to_string(),
            category: FactorCategory::Signal,
            parameters: BTreeMap::new(),
            inputs: ["y".to_string()].into_iter().collect(),
            outputs: ["x".to_string(), "signal".to_string()].into_iter().collect(),
            logic: a,
        });
        s.insert_factor(Factor {
            id: FactorId(1),
            name: "cyc_b".to_string(),
            category: FactorCategory::Signal,
            parameters: BTreeMap::new(),
            inputs: ["x".to_string()].into_iter().collect(),
            outputs: ["y".to_string()].into_iter().collect(),
            logic: b,
        });
        let err = s.validate().unwrap_err();
        assert!(matches!(err, ValidationError::CycleDetected(_)));
    }

    #[test]
    fn transitive_dependents_walk_the_chain() {
        let lib = lib();
        let s = momentum_chain(&lib, "s6");
        let deps = s.transitive_dependents(FactorId(0));
        assert_eq!(deps, [FactorId(1), FactorId(2)].into_iter().collect());
        assert!(s.transitive_dependents(FactorId(2)).is_empty());
    }

    #[test]
    fn structural_identity_ignores_ids_and_lineage() {
        let lib = lib();
        let a = momentum_chain(&lib, "a");
        let mut b = momentum_chain(&lib, "b");
        b.parent_ids = vec!["a".to_string()];
        assert!(a.structurally_identical(&b));
        let mut c = momentum_chain(&lib, "c");
        let factor = c.factors.get_mut(&FactorId(0)).unwrap();
        factor.parameters.insert("period".to_string(), ParamValue::Int(30));
        assert!(!a.structurally_identical(&c));
    }

    #[test]
    fn snapshot_roundtrip() {
        let lib = lib();
        let s = momentum_chain(&lib, "snap");
        let snapshot = s.to_snapshot(lib.arena());
        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: StrategySnapshot = serde_json::from_str(&json).unwrap();
        let fresh_arena = LogicArena::new();
        let restored = parsed.restore(&fresh_arena).unwrap();
        assert!(restored.structurally_identical(&s));
        assert!(restored.validate().is_ok());
    }

    #[test]
    fn minted_ids_are_deterministic_for_a_seed() {
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        assert_eq!(mint_strategy_id(&mut a, 3), mint_strategy_id(&mut b, 3));
    }
}

//! Configuration-level mutation.
//!
//! The safest tier never touches the graph directly: it edits a
//! declarative strategy document and re-materializes the whole strategy
//! through a schema-validated interpreter. Only factors on the library's
//! core allow-list are reachable from here.

use std::collections::{BTreeMap, BTreeSet};

use rand::Rng;
use serde::{Deserialize, Serialize};

use alpha_graph::{
    mint_strategy_id, BuiltinLibrary, FactorId, FactorLibrary, ParamValue, Strategy,
    ValidationError,
};

use crate::error::MutationError;
use crate::ops::{InsertionPoint, MutationOp, NoiseModel, Tier};

/// Declarative strategy document consumed by the interpreter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfigSpec {
    pub factors: Vec<FactorEntry>,
    pub final_outputs: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorEntry {
    pub name: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParamValue>,
}

impl StrategyConfigSpec {
    /// Document form of an existing strategy, entries in topological
    /// order. The parallel id vector maps entries back to the source
    /// factors.
    pub fn from_strategy(strategy: &Strategy) -> (Self, Vec<FactorId>) {
        let order = strategy
            .topological_order()
            .unwrap_or_else(|_| strategy.factors.keys().copied().collect());
        let factors = order
            .iter()
            .filter_map(|id| strategy.factors.get(id))
            .map(|f| FactorEntry {
                name: f.name.clone(),
                parameters: f.parameters.clone(),
            })
            .collect();
        (
            Self {
                factors,
                final_outputs: strategy.final_outputs.clone(),
            },
            order,
        )
    }

    /// Schema-validated interpreter: every entry must name an allow-listed
    /// factor with in-range parameters, and the materialized strategy must
    /// pass full validation before it is returned.
    pub fn materialize(
        &self,
        library: &BuiltinLibrary,
        op: MutationOp,
        id: String,
        generation: usize,
        parent_ids: Vec<String>,
    ) -> Result<Strategy, MutationError> {
        let mut strategy = Strategy::new(id, generation, parent_ids);
        strategy.final_outputs = self.final_outputs.clone();
        for (idx, entry) in self.factors.iter().enumerate() {
            if !library.is_core(&entry.name) {
                return Err(MutationError::Schema {
                    tier: Tier::Tier1,
                    op,
                    reason: format!("factor '{}' is outside the configuration schema", entry.name),
                });
            }
            let factor = library
                .instantiate(&entry.name, FactorId(idx as u32), &entry.parameters)
                .map_err(|source| MutationError::Library {
                    tier: Tier::Tier1,
                    op,
                    source,
                })?;
            strategy.insert_factor(factor);
        }
        strategy.validate().map_err(|source| MutationError::Invalid {
            tier: Tier::Tier1,
            op,
            source,
        })?;
        Ok(strategy)
    }
}

pub fn add_factor(
    library: &BuiltinLibrary,
    strategy: &Strategy,
    factor_name: &str,
    parameters: &BTreeMap<String, ParamValue>,
    insertion: InsertionPoint,
    generation: usize,
    rng: &mut impl Rng,
) -> Result<Strategy, MutationError> {
    let op = MutationOp::AddFactor;
    let spec = library
        .lookup(factor_name)
        .ok_or_else(|| MutationError::Schema {
            tier: Tier::Tier1,
            op,
            reason: format!("unknown factor '{}'", factor_name),
        })?;
    let new_outputs = spec.outputs.clone();

    let (mut doc, _) = StrategyConfigSpec::from_strategy(strategy);
    let entry = FactorEntry {
        name: factor_name.to_string(),
        parameters: parameters.clone(),
    };

    match insertion {
        InsertionPoint::Root => {
            // Must already be consumed downstream; validation rejects the
            // orphan otherwise.
            doc.factors.insert(0, entry);
        }
        InsertionPoint::Leaf => {
            doc.factors.push(entry);
            doc.final_outputs.extend(new_outputs.iter().cloned());
        }
        InsertionPoint::Smart => {
            let consumed = strategy
                .factors
                .values()
                .any(|f| f.inputs.iter().any(|i| new_outputs.contains(i)));
            let terminal = new_outputs.iter().any(|o| doc.final_outputs.contains(o));
            if consumed {
                doc.factors.push(entry);
            } else if terminal {
                doc.factors.push(entry);
            } else {
                return Err(MutationError::NotApplicable {
                    tier: Tier::Tier1,
                    op,
                    reason: format!("no compatible consumer for '{}'", factor_name),
                });
            }
        }
    }

    doc.materialize(
        library,
        op,
        mint_strategy_id(rng, generation),
        generation,
        vec![strategy.id.clone()],
    )
}

pub fn remove_factor(
    library: &BuiltinLibrary,
    strategy: &Strategy,
    factor_id: FactorId,
    cascade: bool,
    generation: usize,
    rng: &mut impl Rng,
) -> Result<Strategy, MutationError> {
    let op = MutationOp::RemoveFactor;
    let target = strategy
        .factors
        .get(&factor_id)
        .ok_or_else(|| MutationError::NotApplicable {
            tier: Tier::Tier1,
            op,
            reason: format!("strategy has no factor {}", factor_id),
        })?;

    // Never remove the last trading-decision producer, cascade or not.
    if target.produces_signal() && strategy.signal_producers().len() == 1 {
        return Err(MutationError::Invalid {
            tier: Tier::Tier1,
            op,
            source: ValidationError::NoSignalProducer,
        });
    }

    let (doc, ids) = StrategyConfigSpec::from_strategy(strategy);
    let mut removed: BTreeSet<FactorId> = BTreeSet::new();
    removed.insert(factor_id);
    if cascade {
        removed.extend(strategy.transitive_dependents(factor_id));
    }

    let factors = doc
        .factors
        .into_iter()
        .zip(ids.iter())
        .filter(|(_, id)| !removed.contains(id))
        .map(|(entry, _)| entry)
        .collect();

    // With cascade off, dependents keep their input names; they re-wire to
    // any remaining producer of the same channel, and the interpreter
    // rejects the document when none exists.
    let doc = StrategyConfigSpec {
        factors,
        final_outputs: doc.final_outputs,
    };
    doc.materialize(
        library,
        op,
        mint_strategy_id(rng, generation),
        generation,
        vec![strategy.id.clone()],
    )
}

pub fn replace_factor(
    library: &BuiltinLibrary,
    strategy: &Strategy,
    old_id: FactorId,
    new_factor_name: &str,
    parameters: &BTreeMap<String, ParamValue>,
    generation: usize,
    rng: &mut impl Rng,
) -> Result<Strategy, MutationError> {
    let op = MutationOp::ReplaceFactor;
    let old = strategy
        .factors
        .get(&old_id)
        .ok_or_else(|| MutationError::NotApplicable {
            tier: Tier::Tier1,
            op,
            reason: format!("strategy has no factor {}", old_id),
        })?;
    let new_spec = library
        .lookup(new_factor_name)
        .ok_or_else(|| MutationError::Schema {
            tier: Tier::Tier1,
            op,
            reason: format!("unknown factor '{}'", new_factor_name),
        })?;

    // The replacement must cover every channel any dependent takes from
    // the old factor.
    for dependent_id in strategy.dependents_of(old_id) {
        let dependent = &strategy.factors[&dependent_id];
        for input in dependent.inputs.intersection(&old.outputs) {
            if !new_spec.outputs.contains(input) {
                return Err(MutationError::Invalid {
                    tier: Tier::Tier1,
                    op,
                    source: ValidationError::OutputIncompatible {
                        dependent: dependent_id,
                        missing: input.clone(),
                    },
                });
            }
        }
    }

    let (mut doc, ids) = StrategyConfigSpec::from_strategy(strategy);
    let position = ids
        .iter()
        .position(|id| *id == old_id)
        .expect("factor id present in document order");
    doc.factors[position] = FactorEntry {
        name: new_factor_name.to_string(),
        parameters: parameters.clone(),
    };

    doc.materialize(
        library,
        op,
        mint_strategy_id(rng, generation),
        generation,
        vec![strategy.id.clone()],
    )
}

pub fn mutate_parameters(
    library: &BuiltinLibrary,
    strategy: &Strategy,
    factor_id: FactorId,
    noise: NoiseModel,
    generation: usize,
    rng: &mut impl Rng,
) -> Result<Strategy, MutationError> {
    let op = MutationOp::MutateParameters;
    let target = strategy
        .factors
        .get(&factor_id)
        .ok_or_else(|| MutationError::NotApplicable {
            tier: Tier::Tier1,
            op,
            reason: format!("strategy has no factor {}", factor_id),
        })?;
    let spec = library
        .lookup(&target.name)
        .ok_or_else(|| MutationError::Schema {
            tier: Tier::Tier1,
            op,
            reason: format!("unknown factor '{}'", target.name),
        })?;

    let mut parameters = target.parameters.clone();
    for (name, value) in parameters.iter_mut() {
        if let Some(param_spec) = spec.params.get(name) {
            *value = noise.sample(value, &param_spec.range, rng);
        }
    }

    let (mut doc, ids) = StrategyConfigSpec::from_strategy(strategy);
    let position = ids
        .iter()
        .position(|id| *id == factor_id)
        .expect("factor id present in document order");
    doc.factors[position].parameters = parameters;

    doc.materialize(
        library,
        op,
        mint_strategy_id(rng, generation),
        generation,
        vec![strategy.id.clone()],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn chain(lib: &BuiltinLibrary, id: &str) -> Strategy {
        let empty = BTreeMap::new();
        let mut s = Strategy::new(id, 0, vec![]);
        s.insert_factor(lib.instantiate("rsi", FactorId(0), &empty).unwrap());
        s.insert_factor(lib.instantiate("momentum_rank", FactorId(1), &empty).unwrap());
        s.insert_factor(lib.instantiate("signal_momentum", FactorId(2), &empty).unwrap());
        s
    }

    #[test]
    fn leaf_add_accepts_new_category() {
        let lib = BuiltinLibrary::new();
        let s = chain(&lib, "base");
        let mut rng = StdRng::seed_from_u64(1);
        let child = add_factor(
            &lib,
            &s,
            "atr",
            &BTreeMap::new(),
            InsertionPoint::Leaf,
            1,
            &mut rng,
        )
        .unwrap();
        assert_eq!(child.factor_count(), 4);
        assert!(child.final_outputs.contains("atr"));
        assert!(child.validate().is_ok());
        assert_eq!(child.parent_ids, vec!["base".to_string()]);
    }

    #[test]
    fn root_add_without_consumer_is_rejected_as_orphan() {
        let lib = BuiltinLibrary::new();
        let s = chain(&lib, "base");
        let mut rng = StdRng::seed_from_u64(2);
        let err = add_factor(
            &lib,
            &s,
            "atr",
            &BTreeMap::new(),
            InsertionPoint::Root,
            1,
            &mut rng,
        )
        .unwrap_err();
        assert!(matches!(
            err.validation(),
            Some(ValidationError::OrphanedFactor { .. })
        ));
    }

    #[test]
    fn root_add_with_existing_consumer_succeeds() {
        let lib = BuiltinLibrary::new();
        let mut s = chain(&lib, "base");
        // vol_stop consumes atr; adding atr at root is then legitimate.
        let empty = BTreeMap::new();
        s.insert_factor(lib.instantiate("atr", FactorId(3), &empty).unwrap());
        s.insert_factor(lib.instantiate("vol_stop", FactorId(4), &empty).unwrap());
        s.validate().unwrap();
        let removed = remove_factor(&lib, &s, FactorId(3), false, 1, &mut StdRng::seed_from_u64(3));
        // atr is vol_stop's only producer of that channel, so plain removal
        // must be rejected.
        assert!(removed.is_err());

        let mut rng = StdRng::seed_from_u64(4);
        let child = add_factor(
            &lib,
            &s,
            "atr",
            &BTreeMap::new(),
            InsertionPoint::Root,
            1,
            &mut rng,
        )
        .unwrap();
        assert!(child.validate().is_ok());
    }

    #[test]
    fn smart_add_finds_consumer_or_rejects() {
        let lib = BuiltinLibrary::new();
        let s = chain(&lib, "base");
        let mut rng = StdRng::seed_from_u64(5);
        // ema_gap has no consumer in a momentum-only chain and is not a
        // declared final output.
        let err = add_factor(
            &lib,
            &s,
            "ema_gap",
            &BTreeMap::new(),
            InsertionPoint::Smart,
            1,
            &mut rng,
        )
        .unwrap_err();
        assert!(matches!(err, MutationError::NotApplicable { .. }));

        // rsi is consumed by momentum_rank, so smart insertion works.
        let child = add_factor(
            &lib,
            &s,
            "rsi",
            &BTreeMap::new(),
            InsertionPoint::Smart,
            1,
            &mut rng,
        )
        .unwrap();
        assert!(child.validate().is_ok());
    }

    #[test]
    fn non_core_factor_is_outside_the_schema() {
        let lib = BuiltinLibrary::new();
        let s = chain(&lib, "base");
        let mut rng = StdRng::seed_from_u64(6);
        let err = add_factor(
            &lib,
            &s,
            "signal_vote",
            &BTreeMap::new(),
            InsertionPoint::Smart,
            1,
            &mut rng,
        )
        .unwrap_err();
        assert!(matches!(err, MutationError::Schema { .. }));
    }

    #[test]
    fn remove_last_signal_producer_is_always_rejected() {
        let lib = BuiltinLibrary::new();
        let s = chain(&lib, "base");
        for cascade in [false, true] {
            let mut rng = StdRng::seed_from_u64(7);
            let err = remove_factor(&lib, &s, FactorId(2), cascade, 1, &mut rng).unwrap_err();
            assert!(matches!(
                err.validation(),
                Some(ValidationError::NoSignalProducer)
            ));
        }
    }

    #[test]
    fn cascade_remove_takes_dependents_with_it() {
        let lib = BuiltinLibrary::new();
        let mut s = chain(&lib, "base");
        let empty = BTreeMap::new();
        // Second, independent signal chain so removal can succeed.
        s.insert_factor(lib.instantiate("ema_gap", FactorId(3), &empty).unwrap());
        s.insert_factor(lib.instantiate("trend_rank", FactorId(4), &empty).unwrap());
        s.insert_factor(lib.instantiate("signal_trend", FactorId(5), &empty).unwrap());
        s.validate().unwrap();

        let mut rng = StdRng::seed_from_u64(8);
        let child = remove_factor(&lib, &s, FactorId(0), true, 1, &mut rng).unwrap();
        // rsi, momentum_rank, signal_momentum all gone.
        assert_eq!(child.factor_count(), 3);
        assert!(child.validate().is_ok());
        assert!(child.factors.values().all(|f| f.name != "rsi"));
    }

    #[test]
    fn mutate_parameters_keeps_values_in_range() {
        let lib = BuiltinLibrary::new();
        let s = chain(&lib, "base");
        let mut rng = StdRng::seed_from_u64(9);
        let child = mutate_parameters(
            &lib,
            &s,
            FactorId(0),
            NoiseModel::Gaussian { sigma: 0.5 },
            1,
            &mut rng,
        )
        .unwrap();
        let period = child
            .factors
            .values()
            .find(|f| f.name == "rsi")
            .unwrap()
            .parameters["period"];
        assert!(matches!(period, ParamValue::Int(p) if (2..=64).contains(&p)));
    }

    #[test]
    fn operators_never_touch_the_original() {
        let lib = BuiltinLibrary::new();
        let s = chain(&lib, "base");
        let before = s.clone();
        let mut rng = StdRng::seed_from_u64(10);
        let _ = add_factor(&lib, &s, "atr", &BTreeMap::new(), InsertionPoint::Leaf, 1, &mut rng);
        let _ = remove_factor(&lib, &s, FactorId(0), true, 1, &mut rng);
        let _ = replace_factor(&lib, &s, FactorId(0), "roc", &BTreeMap::new(), 1, &mut rng);
        let _ = mutate_parameters(
            &lib,
            &s,
            FactorId(1),
            NoiseModel::Uniform { spread: 0.2 },
            1,
            &mut rng,
        );
        assert_eq!(s, before);
    }
}

//! Factor-library-level mutation.
//!
//! Same operator surface as the configuration tier, but the operators
//! work on the factor graph directly and may draw from the full library,
//! which enables category-aware smart insertion.

use std::collections::BTreeMap;

use rand::Rng;

use alpha_graph::{
    mint_strategy_id, Factor, FactorCategory, FactorId, FactorLibrary, ParamValue, Strategy,
    ValidationError,
};

use crate::error::MutationError;
use crate::ops::{InsertionPoint, MutationOp, NoiseModel, Tier};

fn child_of(strategy: &Strategy, generation: usize, rng: &mut impl Rng) -> Strategy {
    let mut child = strategy.clone();
    child.id = mint_strategy_id(rng, generation);
    child.generation = generation;
    child.parent_ids = vec![strategy.id.clone()];
    child.fitness = None;
    child
}

fn validated(strategy: Strategy, op: MutationOp) -> Result<Strategy, MutationError> {
    strategy
        .validate()
        .map_err(|source| MutationError::Invalid {
            tier: Tier::Tier2,
            op,
            source,
        })?;
    Ok(strategy)
}

pub fn add_factor(
    library: &dyn FactorLibrary,
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
        .ok_or_else(|| MutationError::NotApplicable {
            tier: Tier::Tier2,
            op,
            reason: format!("unknown factor '{}'", factor_name),
        })?;
    let category = spec.category;
    let outputs = spec.outputs.clone();

    let mut child = child_of(strategy, generation, rng);
    let factor = library
        .instantiate(factor_name, child.next_factor_id(), parameters)
        .map_err(|source| MutationError::Library {
            tier: Tier::Tier2,
            op,
            source,
        })?;

    match insertion {
        InsertionPoint::Root => {
            child.insert_factor(factor);
        }
        InsertionPoint::Leaf => {
            child.final_outputs.extend(outputs.iter().cloned());
            child.insert_factor(factor);
        }
        InsertionPoint::Smart => {
            let consumed = strategy
                .factors
                .values()
                .any(|f| f.inputs.iter().any(|i| outputs.contains(i)));
            let terminal = outputs.iter().any(|o| strategy.final_outputs.contains(o));
            // Exit overlays belong at the end of the pipeline; treat them
            // as terminal even when nothing consumes their outputs yet.
            if consumed {
                child.insert_factor(factor);
            } else if terminal || matches!(category, FactorCategory::Exit) {
                child.final_outputs.extend(outputs.iter().cloned());
                child.insert_factor(factor);
            } else {
                return Err(MutationError::NotApplicable {
                    tier: Tier::Tier2,
                    op,
                    reason: format!("no compatible consumer for '{}'", factor_name),
                });
            }
        }
    }

    validated(child, op)
}

pub fn remove_factor(
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
            tier: Tier::Tier2,
            op,
            reason: format!("strategy has no factor {}", factor_id),
        })?;

    if target.produces_signal() && strategy.signal_producers().len() == 1 {
        return Err(MutationError::Invalid {
            tier: Tier::Tier2,
            op,
            source: ValidationError::NoSignalProducer,
        });
    }

    let mut child = child_of(strategy, generation, rng);

    if cascade {
        // Remove dependents before the factor they depend on, so the graph
        // never holds a factor whose producer is already gone.
        let mut doomed = strategy.transitive_dependents(factor_id);
        doomed.insert(factor_id);
        let order = strategy
            .topological_order()
            .map_err(|source| MutationError::Invalid {
                tier: Tier::Tier2,
                op,
                source,
            })?;
        for id in order.iter().rev() {
            if doomed.contains(id) {
                child.factors.remove(id);
            }
        }
    } else {
        // Dependents re-wire by channel name to any surviving producer;
        // validation rejects the removal when no alternative exists.
        child.factors.remove(&factor_id);
    }

    validated(child, op)
}

pub fn replace_factor(
    library: &dyn FactorLibrary,
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
            tier: Tier::Tier2,
            op,
            reason: format!("strategy has no factor {}", old_id),
        })?;
    let new_spec = library
        .lookup(new_factor_name)
        .ok_or_else(|| MutationError::NotApplicable {
            tier: Tier::Tier2,
            op,
            reason: format!("unknown factor '{}'", new_factor_name),
        })?;

    // Every channel a dependent takes from the old factor must be covered
    // by the replacement.
    for dependent_id in strategy.dependents_of(old_id) {
        let dependent = &strategy.factors[&dependent_id];
        for input in dependent.inputs.intersection(&old.outputs) {
            if !new_spec.outputs.contains(input) {
                return Err(MutationError::Invalid {
                    tier: Tier::Tier2,
                    op,
                    source: ValidationError::OutputIncompatible {
                        dependent: dependent_id,
                        missing: input.clone(),
                    },
                });
            }
        }
    }

    // The transitive dependent set moves as a unit: snapshot it in forward
    // topological order, detach it in reverse order, swap the target, then
    // re-attach the snapshot in forward order. Detaching dependents one at
    // a time breaks as soon as a dependent has sub-dependents.
    let order = strategy
        .topological_order()
        .map_err(|source| MutationError::Invalid {
            tier: Tier::Tier2,
            op,
            source,
        })?;
    let dependents = strategy.transitive_dependents(old_id);
    let snapshot: Vec<Factor> = order
        .iter()
        .filter(|id| dependents.contains(id))
        .map(|id| strategy.factors[id].clone())
        .collect();

    let mut child = child_of(strategy, generation, rng);
    for id in order.iter().rev() {
        if dependents.contains(id) {
            child.factors.remove(id);
        }
    }
    child.factors.remove(&old_id);

    let replacement = library
        .instantiate(new_factor_name, old_id, parameters)
        .map_err(|source| MutationError::Library {
            tier: Tier::Tier2,
            op,
            source,
        })?;
    child.insert_factor(replacement);

    // Forward re-attach; channel wiring reconnects each dependent to the
    // replacement's outputs.
    for factor in snapshot {
        child.insert_factor(factor);
    }

    validated(child, op)
}

pub fn mutate_parameters(
    library: &dyn FactorLibrary,
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
            tier: Tier::Tier2,
            op,
            reason: format!("strategy has no factor {}", factor_id),
        })?;
    let spec = library
        .lookup(&target.name)
        .ok_or_else(|| MutationError::NotApplicable {
            tier: Tier::Tier2,
            op,
            reason: format!("unknown factor '{}'", target.name),
        })?;

    let mut factor = target.clone();
    for (name, value) in factor.parameters.iter_mut() {
        if let Some(param_spec) = spec.params.get(name) {
            *value = noise.sample(value, &param_spec.range, rng);
        }
    }

    let mut child = child_of(strategy, generation, rng);
    child.insert_factor(factor);
    validated(child, op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alpha_graph::BuiltinLibrary;
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
    fn full_library_is_reachable() {
        let lib = BuiltinLibrary::new();
        let empty = BTreeMap::new();
        let mut s = Strategy::new("base", 0, vec![]);
        s.insert_factor(lib.instantiate("rsi", FactorId(0), &empty).unwrap());
        s.insert_factor(lib.instantiate("momentum_rank", FactorId(1), &empty).unwrap());
        s.insert_factor(lib.instantiate("ema_gap", FactorId(2), &empty).unwrap());
        s.insert_factor(lib.instantiate("trend_rank", FactorId(3), &empty).unwrap());
        s.insert_factor(lib.instantiate("signal_blend", FactorId(4), &empty).unwrap());
        s.validate().unwrap();

        // signal_vote is outside the tier-1 schema but fine here.
        let mut rng = StdRng::seed_from_u64(1);
        let child = replace_factor(&lib, &s, FactorId(4), "signal_vote", &empty, 1, &mut rng).unwrap();
        assert!(child.factors.values().any(|f| f.name == "signal_vote"));
        assert!(child.validate().is_ok());
    }

    #[test]
    fn smart_insertion_prefers_exit_at_leaf() {
        let lib = BuiltinLibrary::new();
        let mut s = chain(&lib, "base");
        let empty = BTreeMap::new();
        s.insert_factor(lib.instantiate("atr", FactorId(3), &empty).unwrap());
        s.insert_factor(lib.instantiate("vol_stop", FactorId(4), &empty).unwrap());
        s.validate().unwrap();

        let mut rng = StdRng::seed_from_u64(2);
        let child = add_factor(
            &lib,
            &s,
            "trail_exit",
            &empty,
            InsertionPoint::Smart,
            1,
            &mut rng,
        )
        .unwrap();
        assert!(child.final_outputs.contains("position"));
        assert!(child.factors.values().any(|f| f.name == "trail_exit"));
    }

    #[test]
    fn replace_keeps_transitive_wiring_intact() {
        let lib = BuiltinLibrary::new();
        // rsi -> momentum_rank -> signal_momentum: replace the root with a
        // second rsi-producing factor and the chain must survive.
        let s = chain(&lib, "base");
        let mut rng = StdRng::seed_from_u64(3);
        let child = replace_factor(
            &lib,
            &s,
            FactorId(0),
            "rsi",
            &BTreeMap::new(),
            1,
            &mut rng,
        )
        .unwrap();
        assert_eq!(child.factor_count(), 3);
        assert!(child.validate().is_ok());
        let deps = child.transitive_dependents(FactorId(0));
        assert_eq!(deps.len(), 2);
    }

    #[test]
    fn replace_with_incompatible_outputs_is_rejected() {
        let lib = BuiltinLibrary::new();
        let s = chain(&lib, "base");
        let before = s.clone();
        let mut rng = StdRng::seed_from_u64(4);
        let err = replace_factor(
            &lib,
            &s,
            FactorId(0),
            "atr",
            &BTreeMap::new(),
            1,
            &mut rng,
        )
        .unwrap_err();
        assert!(matches!(
            err.validation(),
            Some(ValidationError::OutputIncompatible { missing, .. }) if missing == "rsi"
        ));
        // Original retrievable unchanged.
        assert_eq!(s, before);
    }

    #[test]
    fn cascade_remove_never_leaves_dangling_dependents() {
        let lib = BuiltinLibrary::new();
        let mut s = chain(&lib, "base");
        let empty = BTreeMap::new();
        s.insert_factor(lib.instantiate("ema_gap", FactorId(3), &empty).unwrap());
        s.insert_factor(lib.instantiate("trend_rank", FactorId(4), &empty).unwrap());
        s.insert_factor(lib.instantiate("signal_trend", FactorId(5), &empty).unwrap());
        s.validate().unwrap();

        let mut rng = StdRng::seed_from_u64(5);
        let child = remove_factor(&s, FactorId(3), true, 1, &mut rng).unwrap();
        assert_eq!(child.factor_count(), 3);
        assert!(child.validate().is_ok());
    }

    #[test]
    fn signal_guard_holds_for_both_cascade_flags() {
        let lib = BuiltinLibrary::new();
        let s = chain(&lib, "base");
        for cascade in [false, true] {
            let mut rng = StdRng::seed_from_u64(6);
            let err = remove_factor(&s, FactorId(2), cascade, 1, &mut rng).unwrap_err();
            assert!(matches!(
                err.validation(),
                Some(ValidationError::NoSignalProducer)
            ));
        }
    }

    #[test]
    fn mutate_parameters_resamples_within_ranges() {
        let lib = BuiltinLibrary::new();
        let s = chain(&lib, "base");
        let mut rng = StdRng::seed_from_u64(7);
        let child = mutate_parameters(
            &lib,
            &s,
            FactorId(2),
            NoiseModel::Gaussian { sigma: 0.3 },
            1,
            &mut rng,
        )
        .unwrap();
        let threshold = child.factors[&FactorId(2)].parameters["threshold"].as_f64();
        assert!((0.05..=0.95).contains(&threshold));
        assert!(child.validate().is_ok());
    }
}

//! Operator dispatch: picks a concrete operator for a routed tier and
//! applies it. Rejections are returned, never panicked on; the caller
//! turns them into mutation records for the adaptive learner.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;

use alpha_core::config::MutationConfig;
use alpha_graph::{BuiltinLibrary, FactorId, FactorLibrary, Strategy};

use crate::error::MutationError;
use crate::ops::{InsertionPoint, MutationOp, NoiseModel, Tier};
use crate::tier3::CodeEdit;
use crate::{tier1, tier2, tier3};

pub struct Mutator {
    library: Arc<BuiltinLibrary>,
    cfg: MutationConfig,
}

impl Mutator {
    pub fn new(library: Arc<BuiltinLibrary>, cfg: MutationConfig) -> Self {
        Self { library, cfg }
    }

    pub fn library(&self) -> &BuiltinLibrary {
        &self.library
    }

    /// Applies one randomly chosen operator at the routed tier. Returns
    /// the operator alongside the outcome so telemetry can name it even
    /// when target selection already failed.
    pub fn mutate(
        &self,
        strategy: &Strategy,
        tier: Tier,
        generation: usize,
        rng: &mut impl Rng,
    ) -> (MutationOp, Result<Strategy, MutationError>) {
        match tier {
            Tier::Tier1 => self.mutate_structural(strategy, Tier::Tier1, generation, rng),
            Tier::Tier2 => self.mutate_structural(strategy, Tier::Tier2, generation, rng),
            Tier::Tier3 => self.mutate_code(strategy, generation, rng),
        }
    }

    fn pick_op(&self, rng: &mut impl Rng) -> MutationOp {
        let roll: f64 = rng.gen();
        if roll < 0.45 {
            MutationOp::MutateParameters
        } else if roll < 0.75 {
            MutationOp::AddFactor
        } else if roll < 0.9 {
            MutationOp::ReplaceFactor
        } else {
            MutationOp::RemoveFactor
        }
    }

    fn pick_factor(&self, strategy: &Strategy, rng: &mut impl Rng) -> Option<FactorId> {
        let ids: Vec<FactorId> = strategy.factors.keys().copied().collect();
        ids.choose(rng).copied()
    }

    fn candidate_names(&self, tier: Tier) -> Vec<String> {
        match tier {
            Tier::Tier1 => self.library.core_names().to_vec(),
            _ => self.library.names().into_iter().map(String::from).collect(),
        }
    }

    fn mutate_structural(
        &self,
        strategy: &Strategy,
        tier: Tier,
        generation: usize,
        rng: &mut impl Rng,
    ) -> (MutationOp, Result<Strategy, MutationError>) {
        let op = self.pick_op(rng);
        let no_params = BTreeMap::new();
        let noise = NoiseModel::Gaussian {
            sigma: self.cfg.param_noise_sigma,
        };

        let result = match op {
            MutationOp::MutateParameters => match self.pick_factor(strategy, rng) {
                Some(id) => match tier {
                    Tier::Tier1 => {
                        tier1::mutate_parameters(&self.library, strategy, id, noise, generation, rng)
                    }
                    _ => tier2::mutate_parameters(
                        self.library.as_ref(),
                        strategy,
                        id,
                        noise,
                        generation,
                        rng,
                    ),
                },
                None => Err(empty_strategy(tier, op)),
            },
            MutationOp::AddFactor => {
                let names = self.candidate_names(tier);
                let name = names.choose(rng).cloned().unwrap_or_default();
                let insertion = if rng.gen_bool(0.5) {
                    InsertionPoint::Leaf
                } else {
                    InsertionPoint::Smart
                };
                if strategy.factor_count() >= self.cfg.max_factors {
                    Err(MutationError::NotApplicable {
                        tier,
                        op,
                        reason: "strategy is at the factor budget".to_string(),
                    })
                } else {
                    match tier {
                        Tier::Tier1 => tier1::add_factor(
                            &self.library,
                            strategy,
                            &name,
                            &no_params,
                            insertion,
                            generation,
                            rng,
                        ),
                        _ => tier2::add_factor(
                            self.library.as_ref(),
                            strategy,
                            &name,
                            &no_params,
                            insertion,
                            generation,
                            rng,
                        ),
                    }
                }
            }
            MutationOp::ReplaceFactor => match self.pick_factor(strategy, rng) {
                Some(id) => {
                    // Same-category replacements are the ones with a real
                    // chance of passing the output-superset check.
                    let category = strategy.factors[&id].category;
                    let names = self.candidate_names(tier);
                    let candidates: Vec<&String> = names
                        .iter()
                        .filter(|n| {
                            self.library.lookup(n.as_str()).map(|s| s.category) == Some(category)
                        })
                        .collect();
                    match candidates.choose(rng).map(|n| n.as_str()) {
                        Some(name) => match tier {
                            Tier::Tier1 => tier1::replace_factor(
                                &self.library,
                                strategy,
                                id,
                                name,
                                &no_params,
                                generation,
                                rng,
                            ),
                            _ => tier2::replace_factor(
                                self.library.as_ref(),
                                strategy,
                                id,
                                name,
                                &no_params,
                                generation,
                                rng,
                            ),
                        },
                        None => Err(MutationError::NotApplicable {
                            tier,
                            op,
                            reason: "no replacement candidates in category".to_string(),
                        }),
                    }
                }
                None => Err(empty_strategy(tier, op)),
            },
            MutationOp::RemoveFactor => match self.pick_factor(strategy, rng) {
                Some(id) => {
                    let cascade = rng.gen_bool(0.5);
                    match tier {
                        Tier::Tier1 => {
                            tier1::remove_factor(&self.library, strategy, id, cascade, generation, rng)
                        }
                        _ => tier2::remove_factor(strategy, id, cascade, generation, rng),
                    }
                }
                None => Err(empty_strategy(tier, op)),
            },
            // Code-level ops are never picked for the structural tiers.
            other => Err(MutationError::NotApplicable {
                tier,
                op: other,
                reason: "operator not available at this tier".to_string(),
            }),
        };

        (op, result)
    }

    fn mutate_code(
        &self,
        strategy: &Strategy,
        generation: usize,
        rng: &mut impl Rng,
    ) -> (MutationOp, Result<Strategy, MutationError>) {
        let edit = *CodeEdit::ALL.choose(rng).expect("non-empty edit set");
        let op = edit.op();
        let result = match self.pick_factor(strategy, rng) {
            Some(id) => tier3::mutate_code(
                self.library.arena(),
                strategy,
                id,
                edit,
                generation,
                rng,
            ),
            None => Err(empty_strategy(Tier::Tier3, op)),
        };
        (op, result)
    }
}

fn empty_strategy(tier: Tier, op: MutationOp) -> MutationError {
    MutationError::NotApplicable {
        tier,
        op,
        reason: "strategy has no factors".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn chain(lib: &BuiltinLibrary) -> Strategy {
        let empty = BTreeMap::new();
        let mut s = Strategy::new("base", 0, vec![]);
        s.insert_factor(lib.instantiate("rsi", FactorId(0), &empty).unwrap());
        s.insert_factor(lib.instantiate("momentum_rank", FactorId(1), &empty).unwrap());
        s.insert_factor(lib.instantiate("signal_momentum", FactorId(2), &empty).unwrap());
        s
    }

    #[test]
    fn every_accepted_mutation_validates() {
        let library = Arc::new(BuiltinLibrary::new());
        let mutator = Mutator::new(library.clone(), MutationConfig::default());
        let mut rng = StdRng::seed_from_u64(11);
        let mut current = chain(&library);
        let mut accepted = 0;
        for i in 0..120 {
            let tier = Tier::ALL[i % 3];
            let (_, outcome) = mutator.mutate(&current, tier, 1, &mut rng);
            if let Ok(child) = outcome {
                child.validate().expect("accepted mutation must validate");
                accepted += 1;
                current = child;
            }
        }
        assert!(accepted > 0, "at least some mutations should be accepted");
    }

    #[test]
    fn mutation_never_modifies_the_input() {
        let library = Arc::new(BuiltinLibrary::new());
        let mutator = Mutator::new(library.clone(), MutationConfig::default());
        let mut rng = StdRng::seed_from_u64(12);
        let s = chain(&library);
        let before = s.clone();
        for i in 0..60 {
            let tier = Tier::ALL[i % 3];
            let _ = mutator.mutate(&s, tier, 1, &mut rng);
            assert_eq!(s, before);
        }
    }
}

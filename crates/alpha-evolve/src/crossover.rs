//! Subgraph crossover: offspring inherit whole category-subgraphs from
//! either parent, with channel wiring reconnecting the pieces.

use std::collections::BTreeSet;

use rand::Rng;
use tracing::trace;

use alpha_graph::{mint_strategy_id, FactorCategory, FactorId, Strategy};

/// Merges two parents into one offspring. Returns `None` when the parents
/// are structurally identical (crossover would only produce a clone) or
/// when no category split yields a valid child; the caller falls back to
/// mutation-only variation.
pub fn crossover(
    a: &Strategy,
    b: &Strategy,
    generation: usize,
    rng: &mut impl Rng,
) -> Option<Strategy> {
    if a.structurally_identical(b) {
        return None;
    }

    let categories: BTreeSet<FactorCategory> =
        a.categories().union(&b.categories()).copied().collect();

    // A few independent splits; the first valid child wins.
    for _ in 0..4 {
        let mut child = Strategy::new(
            mint_strategy_id(rng, generation),
            generation,
            vec![a.id.clone(), b.id.clone()],
        );
        child.final_outputs = a.final_outputs.union(&b.final_outputs).cloned().collect();

        let mut next_id = 0u32;
        for category in &categories {
            let from_a = a.factors.values().any(|f| f.category == *category);
            let from_b = b.factors.values().any(|f| f.category == *category);
            let donor = match (from_a, from_b) {
                (true, true) => {
                    if rng.gen_bool(0.5) {
                        a
                    } else {
                        b
                    }
                }
                (true, false) => a,
                (false, true) => b,
                (false, false) => continue,
            };
            let order = donor
                .topological_order()
                .unwrap_or_else(|_| donor.factors.keys().copied().collect());
            for id in order {
                let factor = &donor.factors[&id];
                if factor.category != *category {
                    continue;
                }
                let mut inherited = factor.clone();
                inherited.id = FactorId(next_id);
                next_id += 1;
                child.insert_factor(inherited);
            }
        }

        if child.validate().is_ok() {
            trace!(
                "crossover of {} x {} produced {} ({} factors)",
                a.id,
                b.id,
                child.id,
                child.factor_count()
            );
            return Some(child);
        }
    }
    None
}

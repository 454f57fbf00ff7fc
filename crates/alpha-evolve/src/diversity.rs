//! Structural diversity over a population.

use std::collections::BTreeSet;

use alpha_graph::Strategy;

/// Distance in [0, 1] between two strategies: Jaccard distance over the
/// factor-kind sets, blended with the mean relative parameter gap of the
/// factor kinds they share.
pub fn structural_distance(a: &Strategy, b: &Strategy) -> f64 {
    let names_a: BTreeSet<&str> = a.factors.values().map(|f| f.name.as_str()).collect();
    let names_b: BTreeSet<&str> = b.factors.values().map(|f| f.name.as_str()).collect();
    if names_a.is_empty() && names_b.is_empty() {
        return 0.0;
    }
    let intersection = names_a.intersection(&names_b).count() as f64;
    let union = names_a.union(&names_b).count() as f64;
    let jaccard_distance = 1.0 - intersection / union.max(1.0);

    let mut param_gap = 0.0;
    let mut param_count = 0usize;
    for name in names_a.intersection(&names_b) {
        let fa = a.factors.values().find(|f| f.name == *name);
        let fb = b.factors.values().find(|f| f.name == *name);
        if let (Some(fa), Some(fb)) = (fa, fb) {
            for (key, va) in &fa.parameters {
                if let Some(vb) = fb.parameters.get(key) {
                    let x = va.as_f64();
                    let y = vb.as_f64();
                    param_gap += (x - y).abs() / (x.abs() + y.abs() + 1e-9);
                    param_count += 1;
                }
            }
        }
    }
    let param_distance = if param_count == 0 {
        0.0
    } else {
        (param_gap / param_count as f64).clamp(0.0, 1.0)
    };

    0.7 * jaccard_distance + 0.3 * param_distance
}

/// Mean pairwise structural distance; 0.0 for degenerate populations.
pub fn population_diversity(strategies: &[Strategy]) -> f64 {
    let n = strategies.len();
    if n < 2 {
        return 0.0;
    }
    let mut total = 0.0;
    let mut pairs = 0usize;
    for i in 0..n {
        for j in (i + 1)..n {
            total += structural_distance(&strategies[i], &strategies[j]);
            pairs += 1;
        }
    }
    total / pairs as f64
}

/// Novelty of one individual: mean distance to the rest of the
/// population. Used as the third ranking objective.
pub fn novelty(index: usize, strategies: &[Strategy]) -> f64 {
    if strategies.len() < 2 {
        return 0.0;
    }
    let mut total = 0.0;
    for (j, other) in strategies.iter().enumerate() {
        if j != index {
            total += structural_distance(&strategies[index], other);
        }
    }
    total / (strategies.len() - 1) as f64
}

//! Code-level mutation.
//!
//! Operates on the compiled logic body of a single factor: comparison
//! toggles, threshold perturbation, combination-logic swaps, and
//! adaptive-parameter injection. Every edited body is serialized and
//! pushed back through the security-validating compile step before a new
//! arena handle is issued, so an edited body can never bypass the gate
//! that external bodies face.

use rand::Rng;

use alpha_graph::{
    compile_source, mint_strategy_id, CombineMode, FactorId, LogicArena, ParamValue, SignalExpr,
    Strategy,
};

use crate::error::MutationError;
use crate::ops::{MutationOp, Tier};

/// Code-level edit kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeEdit {
    ToggleComparison,
    PerturbThreshold,
    SwapCombine,
    InjectAdaptiveParam,
}

impl CodeEdit {
    pub const ALL: [CodeEdit; 4] = [
        CodeEdit::ToggleComparison,
        CodeEdit::PerturbThreshold,
        CodeEdit::SwapCombine,
        CodeEdit::InjectAdaptiveParam,
    ];

    pub fn op(&self) -> MutationOp {
        match self {
            CodeEdit::ToggleComparison => MutationOp::ToggleComparison,
            CodeEdit::PerturbThreshold => MutationOp::PerturbThreshold,
            CodeEdit::SwapCombine => MutationOp::SwapCombine,
            CodeEdit::InjectAdaptiveParam => MutationOp::InjectAdaptiveParam,
        }
    }
}

fn for_each_expr(expr: &SignalExpr, f: &mut impl FnMut(&SignalExpr)) {
    f(expr);
    match expr {
        SignalExpr::Channel(_) | SignalExpr::Const(_) | SignalExpr::Param(_) => {}
        SignalExpr::Neg(e) | SignalExpr::Abs(e) | SignalExpr::Clamp { expr: e, .. } => {
            for_each_expr(e, f)
        }
        SignalExpr::Bin { lhs, rhs, .. } | SignalExpr::Cmp { lhs, rhs, .. } => {
            for_each_expr(lhs, f);
            for_each_expr(rhs, f);
        }
        SignalExpr::Combine { terms, .. } => {
            for (_, term) in terms {
                for_each_expr(term, f);
            }
        }
        SignalExpr::Rolling { window, expr } => {
            for_each_expr(window, f);
            for_each_expr(expr, f);
        }
    }
}

fn for_each_expr_mut(expr: &mut SignalExpr, f: &mut impl FnMut(&mut SignalExpr)) {
    f(expr);
    match expr {
        SignalExpr::Channel(_) | SignalExpr::Const(_) | SignalExpr::Param(_) => {}
        SignalExpr::Neg(e) | SignalExpr::Abs(e) | SignalExpr::Clamp { expr: e, .. } => {
            for_each_expr_mut(e, f)
        }
        SignalExpr::Bin { lhs, rhs, .. } | SignalExpr::Cmp { lhs, rhs, .. } => {
            for_each_expr_mut(lhs, f);
            for_each_expr_mut(rhs, f);
        }
        SignalExpr::Combine { terms, .. } => {
            for (_, term) in terms {
                for_each_expr_mut(term, f);
            }
        }
        SignalExpr::Rolling { window, expr } => {
            for_each_expr_mut(window, f);
            for_each_expr_mut(expr, f);
        }
    }
}

fn count_matching(expr: &SignalExpr, pred: &impl Fn(&SignalExpr) -> bool) -> usize {
    let mut count = 0;
    for_each_expr(expr, &mut |e| {
        if pred(e) {
            count += 1;
        }
    });
    count
}

fn mutate_nth(
    expr: &mut SignalExpr,
    pred: &impl Fn(&SignalExpr) -> bool,
    target: usize,
    edit: &mut impl FnMut(&mut SignalExpr),
) {
    let mut seen = 0usize;
    for_each_expr_mut(expr, &mut |e| {
        if pred(e) {
            if seen == target {
                edit(e);
            }
            seen += 1;
        }
    });
}

/// Applies one code-level edit to the logic body of `factor_id` and
/// returns a new strategy pointing at the re-compiled body.
pub fn mutate_code(
    arena: &LogicArena,
    strategy: &Strategy,
    factor_id: FactorId,
    edit: CodeEdit,
    generation: usize,
    rng: &mut impl Rng,
) -> Result<Strategy, MutationError> {
    let op = edit.op();
    let target = strategy
        .factors
        .get(&factor_id)
        .ok_or_else(|| MutationError::NotApplicable {
            tier: Tier::Tier3,
            op,
            reason: format!("strategy has no factor {}", factor_id),
        })?;
    let mut body = arena
        .get(target.logic)
        .ok_or_else(|| MutationError::NotApplicable {
            tier: Tier::Tier3,
            op,
            reason: format!("factor {} has no compiled logic", factor_id),
        })?;

    let mut injected_param: Option<(String, f64)> = None;

    match edit {
        CodeEdit::ToggleComparison => {
            let pred = |e: &SignalExpr| matches!(e, SignalExpr::Cmp { .. });
            let total: usize = body.outputs.values().map(|e| count_matching(e, &pred)).sum();
            if total == 0 {
                return Err(MutationError::NotApplicable {
                    tier: Tier::Tier3,
                    op,
                    reason: "body has no comparison operators".to_string(),
                });
            }
            let mut pick = rng.gen_range(0..total);
            for expr in body.outputs.values_mut() {
                let here = count_matching(expr, &pred);
                if pick < here {
                    mutate_nth(expr, &pred, pick, &mut |e| {
                        if let SignalExpr::Cmp { op, .. } = e {
                            *op = op.toggled();
                        }
                    });
                    break;
                }
                pick -= here;
            }
        }
        CodeEdit::PerturbThreshold => {
            let pred = |e: &SignalExpr| matches!(e, SignalExpr::Const(_));
            let total: usize = body.outputs.values().map(|e| count_matching(e, &pred)).sum();
            if total == 0 {
                return Err(MutationError::NotApplicable {
                    tier: Tier::Tier3,
                    op,
                    reason: "body has no constants to perturb".to_string(),
                });
            }
            let mut pick = rng.gen_range(0..total);
            let jitter = 1.0 + rng.gen_range(-0.1..0.1);
            for expr in body.outputs.values_mut() {
                let here = count_matching(expr, &pred);
                if pick < here {
                    mutate_nth(expr, &pred, pick, &mut |e| {
                        if let SignalExpr::Const(v) = e {
                            *v *= jitter;
                        }
                    });
                    break;
                }
                pick -= here;
            }
        }
        CodeEdit::SwapCombine => {
            let pred = |e: &SignalExpr| matches!(e, SignalExpr::Combine { .. });
            let total: usize = body.outputs.values().map(|e| count_matching(e, &pred)).sum();
            if total == 0 {
                return Err(MutationError::NotApplicable {
                    tier: Tier::Tier3,
                    op,
                    reason: "body has no combination nodes".to_string(),
                });
            }
            let mut pick = rng.gen_range(0..total);
            for expr in body.outputs.values_mut() {
                let here = count_matching(expr, &pred);
                if pick < here {
                    mutate_nth(expr, &pred, pick, &mut |e| {
                        if let SignalExpr::Combine { mode, .. } = e {
                            *mode = match mode {
                                CombineMode::And => CombineMode::Or,
                                CombineMode::Or => CombineMode::Weighted,
                                CombineMode::Weighted => CombineMode::And,
                            };
                        }
                    });
                    break;
                }
                pick -= here;
            }
        }
        CodeEdit::InjectAdaptiveParam => {
            let pred = |e: &SignalExpr| matches!(e, SignalExpr::Const(_));
            let total: usize = body.outputs.values().map(|e| count_matching(e, &pred)).sum();
            if total == 0 {
                return Err(MutationError::NotApplicable {
                    tier: Tier::Tier3,
                    op,
                    reason: "body has no constant to promote".to_string(),
                });
            }
            let name = next_adaptive_name(target.parameters.keys());
            let mut pick = rng.gen_range(0..total);
            for expr in body.outputs.values_mut() {
                let here = count_matching(expr, &pred);
                if pick < here {
                    mutate_nth(expr, &pred, pick, &mut |e| {
                        if let SignalExpr::Const(v) = e {
                            injected_param = Some((name.clone(), *v));
                            *e = SignalExpr::Param(name.clone());
                        }
                    });
                    break;
                }
                pick -= here;
            }
        }
    }

    // Round-trip through the same gate external bodies face.
    let source = serde_json::to_string(&body.outputs).map_err(|e| MutationError::NotApplicable {
        tier: Tier::Tier3,
        op,
        reason: format!("body serialization failed: {e}"),
    })?;
    let compiled = compile_source(&source).map_err(|source| MutationError::Security { op, source })?;
    let logic = arena.insert(compiled);

    let mut factor = target.clone();
    factor.logic = logic;
    if let Some((name, value)) = injected_param {
        factor.parameters.insert(name, ParamValue::Float(value));
    }

    let mut child = strategy.clone();
    child.id = mint_strategy_id(rng, generation);
    child.generation = generation;
    child.parent_ids = vec![strategy.id.clone()];
    child.fitness = None;
    child.insert_factor(factor);

    child.validate().map_err(|source| MutationError::Invalid {
        tier: Tier::Tier3,
        op,
        source,
    })?;
    Ok(child)
}

/// Installs an externally supplied body (for instance from an innovation
/// source) behind the security gate. The body must cover every channel
/// the factor declares.
pub fn replace_logic_from_source(
    arena: &LogicArena,
    strategy: &Strategy,
    factor_id: FactorId,
    source: &str,
    generation: usize,
    rng: &mut impl Rng,
) -> Result<Strategy, MutationError> {
    let op = MutationOp::ReplaceFactor;
    let target = strategy
        .factors
        .get(&factor_id)
        .ok_or_else(|| MutationError::NotApplicable {
            tier: Tier::Tier3,
            op,
            reason: format!("strategy has no factor {}", factor_id),
        })?;

    let compiled = compile_source(source).map_err(|source| MutationError::Security { op, source })?;
    for declared in &target.outputs {
        if !compiled.outputs.contains_key(declared) {
            return Err(MutationError::NotApplicable {
                tier: Tier::Tier3,
                op,
                reason: format!("body does not produce declared output '{}'", declared),
            });
        }
    }

    let logic = arena.insert(compiled);
    let mut factor = target.clone();
    factor.logic = logic;

    let mut child = strategy.clone();
    child.id = mint_strategy_id(rng, generation);
    child.generation = generation;
    child.parent_ids = vec![strategy.id.clone()];
    child.fitness = None;
    child.insert_factor(factor);

    child.validate().map_err(|source| MutationError::Invalid {
        tier: Tier::Tier3,
        op,
        source,
    })?;
    Ok(child)
}

fn next_adaptive_name<'a>(existing: impl Iterator<Item = &'a String>) -> String {
    let taken: Vec<&String> = existing.filter(|k| k.starts_with("adaptive_")).collect();
    for i in 0.. {
        let candidate = format!("adaptive_{}", i);
        if !taken.iter().any(|k| **k == candidate) {
            return candidate;
        }
    }
    unreachable!()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alpha_graph::{BuiltinLibrary, CmpOp, FactorLibrary};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeMap;

    fn chain(lib: &BuiltinLibrary) -> Strategy {
        let empty = BTreeMap::new();
        let mut s = Strategy::new("base", 0, vec![]);
        s.insert_factor(lib.instantiate("rsi", FactorId(0), &empty).unwrap());
        s.insert_factor(lib.instantiate("momentum_rank", FactorId(1), &empty).unwrap());
        s.insert_factor(lib.instantiate("signal_momentum", FactorId(2), &empty).unwrap());
        s
    }

    fn cmp_ops(arena: &LogicArena, strategy: &Strategy, id: FactorId) -> Vec<CmpOp> {
        let body = arena.get(strategy.factors[&id].logic).unwrap();
        let mut ops = Vec::new();
        for expr in body.outputs.values() {
            for_each_expr(expr, &mut |e| {
                if let SignalExpr::Cmp { op, .. } = e {
                    ops.push(*op);
                }
            });
        }
        ops
    }

    #[test]
    fn toggle_comparison_flips_exactly_one_op() {
        let lib = BuiltinLibrary::new();
        let s = chain(&lib);
        let before = cmp_ops(lib.arena(), &s, FactorId(2));
        let mut rng = StdRng::seed_from_u64(1);
        let child = mutate_code(
            lib.arena(),
            &s,
            FactorId(2),
            CodeEdit::ToggleComparison,
            1,
            &mut rng,
        )
        .unwrap();
        let after = cmp_ops(lib.arena(), &child, FactorId(2));
        assert_eq!(before.len(), after.len());
        let flipped = before
            .iter()
            .zip(after.iter())
            .filter(|(a, b)| a != b)
            .count();
        assert_eq!(flipped, 1);
        // The shared template body is untouched.
        assert_eq!(cmp_ops(lib.arena(), &s, FactorId(2)), before);
    }

    #[test]
    fn perturb_threshold_requires_constants() {
        let lib = BuiltinLibrary::new();
        let s = chain(&lib);
        let mut rng = StdRng::seed_from_u64(2);
        // signal_momentum thresholds are parameters, not constants; the
        // rsi body has no constants either, so momentum_rank is the only
        // viable target here... which also has none.
        let err = mutate_code(
            lib.arena(),
            &s,
            FactorId(2),
            CodeEdit::PerturbThreshold,
            1,
            &mut rng,
        );
        // Either applies to a constant if present or rejects cleanly.
        if let Err(e) = err {
            assert!(matches!(e, MutationError::NotApplicable { .. }));
        }
    }

    #[test]
    fn inject_adaptive_param_promotes_a_constant() {
        let lib = BuiltinLibrary::new();
        let empty = BTreeMap::new();
        let mut s = Strategy::new("b", 0, vec![]);
        s.insert_factor(lib.instantiate("roc", FactorId(0), &empty).unwrap());
        s.insert_factor(lib.instantiate("signal_momentum", FactorId(1), &empty).unwrap());
        s.validate().unwrap();

        let mut rng = StdRng::seed_from_u64(3);
        let child = mutate_code(
            lib.arena(),
            &s,
            FactorId(0),
            CodeEdit::InjectAdaptiveParam,
            1,
            &mut rng,
        )
        .unwrap();
        let factor = &child.factors[&FactorId(0)];
        assert!(factor.parameters.keys().any(|k| k.starts_with("adaptive_")));
        assert!(child.validate().is_ok());
    }

    #[test]
    fn swap_combine_requires_combination_nodes() {
        let lib = BuiltinLibrary::new();
        let s = chain(&lib);
        let mut rng = StdRng::seed_from_u64(4);
        let err = mutate_code(
            lib.arena(),
            &s,
            FactorId(0),
            CodeEdit::SwapCombine,
            1,
            &mut rng,
        )
        .unwrap_err();
        assert!(matches!(err, MutationError::NotApplicable { .. }));
    }

    #[test]
    fn external_body_passes_the_security_gate() {
        let lib = BuiltinLibrary::new();
        let s = chain(&lib);
        let mut rng = StdRng::seed_from_u64(5);

        let hostile = r#"{"signal": {"channel": "std::fs::read"}}"#;
        let err = replace_logic_from_source(lib.arena(), &s, FactorId(2), hostile, 1, &mut rng)
            .unwrap_err();
        assert!(matches!(err, MutationError::Security { .. }));

        let benign = serde_json::to_string(
            &lib.arena().get(s.factors[&FactorId(2)].logic).unwrap().outputs,
        )
        .unwrap();
        let child =
            replace_logic_from_source(lib.arena(), &s, FactorId(2), &benign, 1, &mut rng).unwrap();
        assert!(child.validate().is_ok());
    }

    #[test]
    fn code_mutation_is_pure() {
        let lib = BuiltinLibrary::new();
        let s = chain(&lib);
        let before = s.clone();
        let mut rng = StdRng::seed_from_u64(6);
        let _ = mutate_code(
            lib.arena(),
            &s,
            FactorId(2),
            CodeEdit::ToggleComparison,
            1,
            &mut rng,
        );
        assert_eq!(s, before);
    }
}

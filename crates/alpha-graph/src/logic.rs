//! Opaque computation bodies.
//!
//! Factor math is expressed as small expression trees over named channels
//! and factor parameters. Bodies live in a [`LogicArena`] and strategies
//! only ever hold integer [`LogicRef`] handles; textual bodies must pass an
//! explicit security-validating compile step before a handle is issued.

use std::collections::BTreeMap;
use std::sync::RwLock;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Handle into the logic arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicRef(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Gt,
    Ge,
    Lt,
    Le,
}

impl CmpOp {
    /// Strict/inclusive twin of the operator, used by code-level mutation.
    pub fn toggled(self) -> Self {
        match self {
            CmpOp::Gt => CmpOp::Ge,
            CmpOp::Ge => CmpOp::Gt,
            CmpOp::Lt => CmpOp::Le,
            CmpOp::Le => CmpOp::Lt,
        }
    }

    fn apply(self, a: f64, b: f64) -> bool {
        match self {
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineMode {
    And,
    Or,
    Weighted,
}

/// Expression tree evaluated elementwise over the row axis.
///
/// Comparisons yield 1.0/0.0 so boolean and numeric terms compose freely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalExpr {
    Channel(String),
    Const(f64),
    Param(String),
    Neg(Box<SignalExpr>),
    Abs(Box<SignalExpr>),
    Bin {
        op: BinOp,
        lhs: Box<SignalExpr>,
        rhs: Box<SignalExpr>,
    },
    Cmp {
        op: CmpOp,
        lhs: Box<SignalExpr>,
        rhs: Box<SignalExpr>,
    },
    Combine {
        mode: CombineMode,
        terms: Vec<(f64, SignalExpr)>,
    },
    /// Trailing mean over `window` rows of the inner expression. A `Param`
    /// window resolves against the owning factor's parameters.
    Rolling {
        window: Box<SignalExpr>,
        expr: Box<SignalExpr>,
    },
    Clamp {
        lo: f64,
        hi: f64,
        expr: Box<SignalExpr>,
    },
}

impl SignalExpr {
    pub fn channel(name: &str) -> Self {
        SignalExpr::Channel(name.to_string())
    }

    pub fn param(name: &str) -> Self {
        SignalExpr::Param(name.to_string())
    }

    pub fn cmp(op: CmpOp, lhs: SignalExpr, rhs: SignalExpr) -> Self {
        SignalExpr::Cmp {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn bin(op: BinOp, lhs: SignalExpr, rhs: SignalExpr) -> Self {
        SignalExpr::Bin {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn rolling(window: SignalExpr, expr: SignalExpr) -> Self {
        SignalExpr::Rolling {
            window: Box::new(window),
            expr: Box::new(expr),
        }
    }

    /// Channels this expression reads.
    pub fn referenced_channels(&self, out: &mut Vec<String>) {
        match self {
            SignalExpr::Channel(name) => out.push(name.clone()),
            SignalExpr::Const(_) | SignalExpr::Param(_) => {}
            SignalExpr::Neg(e) | SignalExpr::Abs(e) | SignalExpr::Clamp { expr: e, .. } => {
                e.referenced_channels(out)
            }
            SignalExpr::Bin { lhs, rhs, .. } | SignalExpr::Cmp { lhs, rhs, .. } => {
                lhs.referenced_channels(out);
                rhs.referenced_channels(out);
            }
            SignalExpr::Combine { terms, .. } => {
                for (_, term) in terms {
                    term.referenced_channels(out);
                }
            }
            SignalExpr::Rolling { window, expr } => {
                window.referenced_channels(out);
                expr.referenced_channels(out);
            }
        }
    }

    /// Number of nodes, used as a complexity proxy by risk scoring.
    pub fn node_count(&self) -> usize {
        match self {
            SignalExpr::Channel(_) | SignalExpr::Const(_) | SignalExpr::Param(_) => 1,
            SignalExpr::Neg(e) | SignalExpr::Abs(e) | SignalExpr::Clamp { expr: e, .. } => {
                1 + e.node_count()
            }
            SignalExpr::Bin { lhs, rhs, .. } | SignalExpr::Cmp { lhs, rhs, .. } => {
                1 + lhs.node_count() + rhs.node_count()
            }
            SignalExpr::Combine { terms, .. } => {
                1 + terms.iter().map(|(_, t)| t.node_count()).sum::<usize>()
            }
            SignalExpr::Rolling { window, expr } => 1 + window.node_count() + expr.node_count(),
        }
    }

    /// Evaluate over `rows` rows. `channels` supplies upstream data,
    /// `params` the owning factor's parameters.
    pub fn eval(
        &self,
        rows: usize,
        channels: &BTreeMap<String, Vec<f64>>,
        params: &BTreeMap<String, f64>,
    ) -> Result<Vec<f64>> {
        match self {
            SignalExpr::Channel(name) => channels
                .get(name)
                .cloned()
                .with_context(|| format!("channel '{}' not available at execution", name)),
            SignalExpr::Const(v) => Ok(vec![*v; rows]),
            SignalExpr::Param(name) => {
                let v = params
                    .get(name)
                    .with_context(|| format!("parameter '{}' missing", name))?;
                Ok(vec![*v; rows])
            }
            SignalExpr::Neg(e) => {
                let mut v = e.eval(rows, channels, params)?;
                v.iter_mut().for_each(|x| *x = -*x);
                Ok(v)
            }
            SignalExpr::Abs(e) => {
                let mut v = e.eval(rows, channels, params)?;
                v.iter_mut().for_each(|x| *x = x.abs());
                Ok(v)
            }
            SignalExpr::Bin { op, lhs, rhs } => {
                let a = lhs.eval(rows, channels, params)?;
                let b = rhs.eval(rows, channels, params)?;
                let out = a
                    .iter()
                    .zip(b.iter())
                    .map(|(x, y)| match op {
                        BinOp::Add => x + y,
                        BinOp::Sub => x - y,
                        BinOp::Mul => x * y,
                        BinOp::Div => {
                            if y.abs() < 1e-12 {
                                0.0
                            } else {
                                x / y
                            }
                        }
                    })
                    .collect();
                Ok(out)
            }
            SignalExpr::Cmp { op, lhs, rhs } => {
                let a = lhs.eval(rows, channels, params)?;
                let b = rhs.eval(rows, channels, params)?;
                Ok(a.iter()
                    .zip(b.iter())
                    .map(|(x, y)| if op.apply(*x, *y) { 1.0 } else { 0.0 })
                    .collect())
            }
            SignalExpr::Combine { mode, terms } => {
                if terms.is_empty() {
                    bail!("combine with no terms");
                }
                let mut series = Vec::with_capacity(terms.len());
                for (weight, term) in terms {
                    series.push((*weight, term.eval(rows, channels, params)?));
                }
                let mut out = vec![0.0; rows];
                match mode {
                    CombineMode::And => {
                        for i in 0..rows {
                            out[i] = if series.iter().all(|(_, s)| s[i] > 0.0) {
                                1.0
                            } else {
                                0.0
                            };
                        }
                    }
                    CombineMode::Or => {
                        for i in 0..rows {
                            out[i] = if series.iter().any(|(_, s)| s[i] > 0.0) {
                                1.0
                            } else {
                                0.0
                            };
                        }
                    }
                    CombineMode::Weighted => {
                        let total: f64 = series.iter().map(|(w, _)| w.abs()).sum();
                        let norm = if total < 1e-12 { 1.0 } else { total };
                        for i in 0..rows {
                            out[i] =
                                series.iter().map(|(w, s)| w * s[i]).sum::<f64>() / norm;
                        }
                    }
                }
                Ok(out)
            }
            SignalExpr::Rolling { window, expr } => {
                let w = window.eval(rows.max(1), channels, params)?;
                let window = (w.first().copied().unwrap_or(1.0).round() as usize).max(1);
                let inner = expr.eval(rows, channels, params)?;
                let mut out = vec![0.0; rows];
                let mut acc = 0.0;
                for i in 0..rows {
                    acc += inner[i];
                    if i >= window {
                        acc -= inner[i - window];
                    }
                    let n = (i + 1).min(window) as f64;
                    out[i] = acc / n;
                }
                Ok(out)
            }
            SignalExpr::Clamp { lo, hi, expr } => {
                let mut v = expr.eval(rows, channels, params)?;
                v.iter_mut().for_each(|x| *x = x.clamp(*lo, *hi));
                Ok(v)
            }
        }
    }
}

/// One output expression per produced channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledLogic {
    pub outputs: BTreeMap<String, SignalExpr>,
}

impl CompiledLogic {
    pub fn single(output: &str, expr: SignalExpr) -> Self {
        let mut outputs = BTreeMap::new();
        outputs.insert(output.to_string(), expr);
        Self { outputs }
    }

    pub fn node_count(&self) -> usize {
        self.outputs.values().map(|e| e.node_count()).sum()
    }
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("disallowed construct '{0}' in logic source")]
    Disallowed(String),
    #[error("logic source did not parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("logic body produces no outputs")]
    Empty,
}

/// Tokens that mark a body as attempting file I/O, network access, process
/// spawning, or dynamic code evaluation. Matched case-insensitively; a hit
/// rejects the body outright.
const FORBIDDEN_TOKENS: &[&str] = &[
    "std::fs", "file::", "open(", "read_to_string", "write(", "remove_file", "tcpstream",
    "udpsocket", "socket", "connect(", "http://", "https://", "reqwest", "curl", "eval(",
    "exec(", "command::", "process::", "spawn(", "system(", "include!", "import ",
    "__import__", "subprocess",
];

/// Security-validating compile step for textual logic bodies (immigrants
/// and code-level mutation sources). Never executes unvalidated text.
pub fn compile_source(source: &str) -> Result<CompiledLogic, CompileError> {
    let lowered = source.to_lowercase();
    for token in FORBIDDEN_TOKENS {
        if lowered.contains(token) {
            return Err(CompileError::Disallowed(token.to_string()));
        }
    }
    let outputs: BTreeMap<String, SignalExpr> = serde_json::from_str(source)?;
    if outputs.is_empty() {
        return Err(CompileError::Empty);
    }
    Ok(CompiledLogic { outputs })
}

/// Arena of compiled bodies. Handles are append-only so a `LogicRef` stays
/// valid for the life of the run.
#[derive(Debug, Default)]
pub struct LogicArena {
    bodies: RwLock<Vec<CompiledLogic>>,
}

impl LogicArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, body: CompiledLogic) -> LogicRef {
        let mut bodies = self.bodies.write().expect("logic arena poisoned");
        bodies.push(body);
        LogicRef(bodies.len() - 1)
    }

    pub fn get(&self, handle: LogicRef) -> Option<CompiledLogic> {
        self.bodies
            .read()
            .expect("logic arena poisoned")
            .get(handle.0)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.bodies.read().expect("logic arena poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> BTreeMap<String, Vec<f64>> {
        let mut channels = BTreeMap::new();
        channels.insert("close".to_string(), vec![1.0, 2.0, 3.0, 4.0]);
        channels
    }

    #[test]
    fn cmp_yields_indicator_series() {
        let expr = SignalExpr::cmp(
            CmpOp::Ge,
            SignalExpr::channel("close"),
            SignalExpr::Const(2.0),
        );
        let out = expr.eval(4, &ctx(), &BTreeMap::new()).unwrap();
        assert_eq!(out, vec![0.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn rolling_mean_warms_up() {
        let expr = SignalExpr::rolling(SignalExpr::Const(2.0), SignalExpr::channel("close"));
        let out = expr.eval(4, &ctx(), &BTreeMap::new()).unwrap();
        assert_eq!(out, vec![1.0, 1.5, 2.5, 3.5]);
    }

    #[test]
    fn param_window_resolves() {
        let expr = SignalExpr::rolling(SignalExpr::param("period"), SignalExpr::channel("close"));
        let mut params = BTreeMap::new();
        params.insert("period".to_string(), 4.0);
        let out = expr.eval(4, &ctx(), &params).unwrap();
        assert!((out[3] - 2.5).abs() < 1e-12);
    }

    #[test]
    fn missing_channel_is_an_error() {
        let expr = SignalExpr::channel("rsi");
        assert!(expr.eval(4, &ctx(), &BTreeMap::new()).is_err());
    }

    #[test]
    fn compile_rejects_forbidden_constructs() {
        let err = compile_source(r#"{"signal": {"channel": "std::fs"}}"#).unwrap_err();
        assert!(matches!(err, CompileError::Disallowed(_)));
        assert!(compile_source(r#"{"sig": {"const": "exec(rm)"}}"#).is_err());
    }

    #[test]
    fn compile_roundtrips_valid_body() {
        let body = CompiledLogic::single(
            "signal",
            SignalExpr::cmp(
                CmpOp::Gt,
                SignalExpr::channel("momentum_score"),
                SignalExpr::param("threshold"),
            ),
        );
        let text = serde_json::to_string(&body.outputs).unwrap();
        let compiled = compile_source(&text).unwrap();
        assert_eq!(compiled, body);
    }

    #[test]
    fn arena_handles_are_stable() {
        let arena = LogicArena::new();
        let a = arena.insert(CompiledLogic::single("x", SignalExpr::Const(1.0)));
        let b = arena.insert(CompiledLogic::single("y", SignalExpr::Const(2.0)));
        assert_ne!(a, b);
        assert_eq!(arena.get(a).unwrap().outputs["x"], SignalExpr::Const(1.0));
        assert_eq!(arena.get(b).unwrap().outputs["y"], SignalExpr::Const(2.0));
    }
}

//! Factor library: named factor specifications with declared channels,
//! parameter ranges, and compiled logic templates. The engine never
//! computes factor math itself; it only wires instances together.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::factor::{Factor, FactorCategory, FactorId, ParamRange, ParamValue};
use crate::logic::{BinOp, CmpOp, CombineMode, CompiledLogic, LogicArena, LogicRef, SignalExpr};

/// Channels every base dataset provides.
pub const BASE_CHANNELS: [&str; 5] = ["open", "high", "low", "close", "volume"];

pub fn base_channel_set() -> BTreeSet<String> {
    BASE_CHANNELS.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub range: ParamRange,
    pub default: ParamValue,
}

impl ParamSpec {
    pub fn int(min: i64, max: i64, default: i64) -> Self {
        Self {
            range: ParamRange::int(min, max),
            default: ParamValue::Int(default),
        }
    }

    pub fn float(min: f64, max: f64, default: f64) -> Self {
        Self {
            range: ParamRange::float(min, max),
            default: ParamValue::Float(default),
        }
    }
}

/// Library-declared description of one factor kind.
#[derive(Debug, Clone)]
pub struct FactorSpec {
    pub name: String,
    pub category: FactorCategory,
    pub inputs: BTreeSet<String>,
    pub outputs: BTreeSet<String>,
    pub params: BTreeMap<String, ParamSpec>,
    pub logic: LogicRef,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LibraryError {
    #[error("unknown factor '{0}'")]
    UnknownFactor(String),
    #[error("factor '{factor}' has no parameter '{param}'")]
    UnknownParam { factor: String, param: String },
    #[error("factor '{factor}' parameter '{param}' out of declared range")]
    ParamOutOfRange { factor: String, param: String },
}

pub trait FactorLibrary: Send + Sync {
    fn lookup(&self, name: &str) -> Option<&FactorSpec>;
    fn names(&self) -> Vec<&str>;
    fn arena(&self) -> &LogicArena;

    fn list_by_category(&self, category: FactorCategory) -> Vec<&str> {
        self.names()
            .into_iter()
            .filter(|n| self.lookup(n).map(|s| s.category) == Some(category))
            .collect()
    }

    /// Build a Factor from a spec, overlaying `params` on the declared
    /// defaults. Values outside the declared range are rejected, never
    /// silently clamped; clamping belongs to the parameter noise model.
    fn instantiate(
        &self,
        name: &str,
        id: FactorId,
        params: &BTreeMap<String, ParamValue>,
    ) -> Result<Factor, LibraryError> {
        let spec = self
            .lookup(name)
            .ok_or_else(|| LibraryError::UnknownFactor(name.to_string()))?;
        let mut resolved: BTreeMap<String, ParamValue> = spec
            .params
            .iter()
            .map(|(k, p)| (k.clone(), p.default))
            .collect();
        for (key, value) in params {
            let param_spec = spec.params.get(key).ok_or_else(|| LibraryError::UnknownParam {
                factor: name.to_string(),
                param: key.clone(),
            })?;
            if !param_spec.range.contains(value) {
                return Err(LibraryError::ParamOutOfRange {
                    factor: name.to_string(),
                    param: key.clone(),
                });
            }
            resolved.insert(key.clone(), *value);
        }
        Ok(Factor {
            id,
            name: spec.name.clone(),
            category: spec.category,
            parameters: resolved,
            inputs: spec.inputs.clone(),
            outputs: spec.outputs.clone(),
            logic: spec.logic,
        })
    }
}

/// In-memory registry of the built-in factor set.
pub struct BuiltinLibrary {
    arena: LogicArena,
    specs: BTreeMap<String, FactorSpec>,
    core_names: Vec<String>,
}

impl BuiltinLibrary {
    pub fn new() -> Self {
        let arena = LogicArena::new();
        let mut specs = BTreeMap::new();

        let mut add = |name: &str,
                       category: FactorCategory,
                       inputs: &[&str],
                       outputs: &[&str],
                       params: Vec<(&str, ParamSpec)>,
                       body: CompiledLogic,
                       arena: &LogicArena| {
            let logic = arena.insert(body);
            specs.insert(
                name.to_string(),
                FactorSpec {
                    name: name.to_string(),
                    category,
                    inputs: inputs.iter().map(|s| s.to_string()).collect(),
                    outputs: outputs.iter().map(|s| s.to_string()).collect(),
                    params: params
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), v))
                        .collect(),
                    logic,
                },
            );
        };

        let close = || SignalExpr::channel("close");
        let period = || SignalExpr::param("period");

        // Momentum: fraction of the window closing above its trailing mean.
        add(
            "rsi",
            FactorCategory::Momentum,
            &["close"],
            &["rsi"],
            vec![("period", ParamSpec::int(2, 64, 14))],
            CompiledLogic::single(
                "rsi",
                SignalExpr::rolling(
                    period(),
                    SignalExpr::cmp(
                        CmpOp::Gt,
                        close(),
                        SignalExpr::rolling(period(), close()),
                    ),
                ),
            ),
            &arena,
        );

        add(
            "momentum_rank",
            FactorCategory::Momentum,
            &["rsi"],
            &["momentum_score"],
            vec![
                ("center", ParamSpec::float(0.2, 0.8, 0.5)),
                ("gain", ParamSpec::float(0.5, 4.0, 2.0)),
            ],
            CompiledLogic::single(
                "momentum_score",
                SignalExpr::Clamp {
                    lo: -1.0,
                    hi: 1.0,
                    expr: Box::new(SignalExpr::bin(
                        BinOp::Mul,
                        SignalExpr::bin(
                            BinOp::Sub,
                            SignalExpr::channel("rsi"),
                            SignalExpr::param("center"),
                        ),
                        SignalExpr::param("gain"),
                    )),
                },
            ),
            &arena,
        );

        add(
            "roc",
            FactorCategory::Momentum,
            &["close"],
            &["momentum_score"],
            vec![
                ("period", ParamSpec::int(2, 64, 10)),
                ("gain", ParamSpec::float(0.1, 10.0, 4.0)),
            ],
            CompiledLogic::single(
                "momentum_score",
                SignalExpr::Clamp {
                    lo: -1.0,
                    hi: 1.0,
                    expr: Box::new(SignalExpr::bin(
                        BinOp::Mul,
                        SignalExpr::bin(
                            BinOp::Sub,
                            SignalExpr::bin(
                                BinOp::Div,
                                close(),
                                SignalExpr::rolling(period(), close()),
                            ),
                            SignalExpr::Const(1.0),
                        ),
                        SignalExpr::param("gain"),
                    )),
                },
            ),
            &arena,
        );

        add(
            "ema_gap",
            FactorCategory::Trend,
            &["close"],
            &["ema_gap"],
            vec![("period", ParamSpec::int(2, 128, 20))],
            CompiledLogic::single(
                "ema_gap",
                SignalExpr::bin(
                    BinOp::Sub,
                    SignalExpr::bin(BinOp::Div, close(), SignalExpr::rolling(period(), close())),
                    SignalExpr::Const(1.0),
                ),
            ),
            &arena,
        );

        add(
            "trend_rank",
            FactorCategory::Trend,
            &["ema_gap"],
            &["trend_score"],
            vec![("gain", ParamSpec::float(1.0, 200.0, 50.0))],
            CompiledLogic::single(
                "trend_score",
                SignalExpr::Clamp {
                    lo: -1.0,
                    hi: 1.0,
                    expr: Box::new(SignalExpr::bin(
                        BinOp::Mul,
                        SignalExpr::channel("ema_gap"),
                        SignalExpr::param("gain"),
                    )),
                },
            ),
            &arena,
        );

        add(
            "atr",
            FactorCategory::Volatility,
            &["high", "low"],
            &["atr"],
            vec![("period", ParamSpec::int(2, 64, 14))],
            CompiledLogic::single(
                "atr",
                SignalExpr::rolling(
                    period(),
                    SignalExpr::bin(
                        BinOp::Sub,
                        SignalExpr::channel("high"),
                        SignalExpr::channel("low"),
                    ),
                ),
            ),
            &arena,
        );

        add(
            "vol_rank",
            FactorCategory::Volatility,
            &["atr", "close"],
            &["volatility_score"],
            vec![("gain", ParamSpec::float(1.0, 500.0, 100.0))],
            CompiledLogic::single(
                "volatility_score",
                SignalExpr::Clamp {
                    lo: 0.0,
                    hi: 1.0,
                    expr: Box::new(SignalExpr::bin(
                        BinOp::Mul,
                        SignalExpr::bin(BinOp::Div, SignalExpr::channel("atr"), close()),
                        SignalExpr::param("gain"),
                    )),
                },
            ),
            &arena,
        );

        add(
            "volume_surge",
            FactorCategory::Catalyst,
            &["volume"],
            &["catalyst_score"],
            vec![
                ("period", ParamSpec::int(2, 64, 20)),
                ("ratio", ParamSpec::float(1.0, 5.0, 1.5)),
            ],
            CompiledLogic::single(
                "catalyst_score",
                SignalExpr::cmp(
                    CmpOp::Gt,
                    SignalExpr::channel("volume"),
                    SignalExpr::bin(
                        BinOp::Mul,
                        SignalExpr::rolling(period(), SignalExpr::channel("volume")),
                        SignalExpr::param("ratio"),
                    ),
                ),
            ),
            &arena,
        );

        // Long when the score clears +threshold, short below -threshold.
        let thresholded = |score: &str| {
            SignalExpr::bin(
                BinOp::Sub,
                SignalExpr::cmp(
                    CmpOp::Ge,
                    SignalExpr::channel(score),
                    SignalExpr::param("threshold"),
                ),
                SignalExpr::cmp(
                    CmpOp::Le,
                    SignalExpr::channel(score),
                    SignalExpr::Neg(Box::new(SignalExpr::param("threshold"))),
                ),
            )
        };

        add(
            "signal_momentum",
            FactorCategory::Signal,
            &["momentum_score"],
            &["signal"],
            vec![("threshold", ParamSpec::float(0.05, 0.95, 0.35))],
            CompiledLogic::single("signal", thresholded("momentum_score")),
            &arena,
        );

        add(
            "signal_trend",
            FactorCategory::Signal,
            &["trend_score"],
            &["signal"],
            vec![("threshold", ParamSpec::float(0.05, 0.95, 0.3))],
            CompiledLogic::single("signal", thresholded("trend_score")),
            &arena,
        );

        add(
            "signal_blend",
            FactorCategory::Signal,
            &["momentum_score", "trend_score"],
            &["signal"],
            vec![
                ("threshold", ParamSpec::float(0.05, 0.95, 0.25)),
                ("w_momentum", ParamSpec::float(0.0, 1.0, 0.6)),
                ("w_trend", ParamSpec::float(0.0, 1.0, 0.4)),
            ],
            {
                let blended = SignalExpr::bin(
                    BinOp::Add,
                    SignalExpr::bin(
                        BinOp::Mul,
                        SignalExpr::channel("momentum_score"),
                        SignalExpr::param("w_momentum"),
                    ),
                    SignalExpr::bin(
                        BinOp::Mul,
                        SignalExpr::channel("trend_score"),
                        SignalExpr::param("w_trend"),
                    ),
                );
                CompiledLogic::single(
                    "signal",
                    SignalExpr::bin(
                        BinOp::Sub,
                        SignalExpr::cmp(
                            CmpOp::Ge,
                            blended.clone(),
                            SignalExpr::param("threshold"),
                        ),
                        SignalExpr::cmp(
                            CmpOp::Le,
                            blended,
                            SignalExpr::Neg(Box::new(SignalExpr::param("threshold"))),
                        ),
                    ),
                )
            },
            &arena,
        );

        // Both scores must agree before a position opens.
        add(
            "signal_vote",
            FactorCategory::Signal,
            &["momentum_score", "trend_score"],
            &["signal"],
            vec![("threshold", ParamSpec::float(0.05, 0.95, 0.2))],
            CompiledLogic::single(
                "signal",
                SignalExpr::bin(
                    BinOp::Sub,
                    SignalExpr::Combine {
                        mode: CombineMode::And,
                        terms: vec![
                            (
                                1.0,
                                SignalExpr::cmp(
                                    CmpOp::Ge,
                                    SignalExpr::channel("momentum_score"),
                                    SignalExpr::param("threshold"),
                                ),
                            ),
                            (
                                1.0,
                                SignalExpr::cmp(
                                    CmpOp::Ge,
                                    SignalExpr::channel("trend_score"),
                                    SignalExpr::param("threshold"),
                                ),
                            ),
                        ],
                    },
                    SignalExpr::Combine {
                        mode: CombineMode::And,
                        terms: vec![
                            (
                                1.0,
                                SignalExpr::cmp(
                                    CmpOp::Le,
                                    SignalExpr::channel("momentum_score"),
                                    SignalExpr::Neg(Box::new(SignalExpr::param("threshold"))),
                                ),
                            ),
                            (
                                1.0,
                                SignalExpr::cmp(
                                    CmpOp::Le,
                                    SignalExpr::channel("trend_score"),
                                    SignalExpr::Neg(Box::new(SignalExpr::param("threshold"))),
                                ),
                            ),
                        ],
                    },
                ),
            ),
            &arena,
        );

        // Flat when the range expands past the cap.
        add(
            "vol_stop",
            FactorCategory::Exit,
            &["signal", "atr"],
            &["position"],
            vec![("max_atr", ParamSpec::float(0.0001, 10.0, 2.0))],
            CompiledLogic::single(
                "position",
                SignalExpr::bin(
                    BinOp::Mul,
                    SignalExpr::channel("signal"),
                    SignalExpr::cmp(
                        CmpOp::Le,
                        SignalExpr::channel("atr"),
                        SignalExpr::param("max_atr"),
                    ),
                ),
            ),
            &arena,
        );

        add(
            "trail_exit",
            FactorCategory::Exit,
            &["signal", "close"],
            &["position"],
            vec![("lookback", ParamSpec::int(2, 64, 10))],
            CompiledLogic::single(
                "position",
                SignalExpr::bin(
                    BinOp::Mul,
                    SignalExpr::channel("signal"),
                    SignalExpr::cmp(
                        CmpOp::Ge,
                        close(),
                        SignalExpr::rolling(SignalExpr::param("lookback"), close()),
                    ),
                ),
            ),
            &arena,
        );

        // The configuration schema exposes a restricted subset; the full
        // set is only reachable from factor-library-level mutation.
        let core_names = vec![
            "rsi",
            "momentum_rank",
            "roc",
            "ema_gap",
            "trend_rank",
            "atr",
            "vol_rank",
            "signal_momentum",
            "signal_trend",
            "signal_blend",
            "vol_stop",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        Self {
            arena,
            specs,
            core_names,
        }
    }

    /// Factor names reachable from the Tier-1 configuration schema.
    pub fn core_names(&self) -> &[String] {
        &self.core_names
    }

    pub fn is_core(&self, name: &str) -> bool {
        self.core_names.iter().any(|n| n == name)
    }
}

impl Default for BuiltinLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl FactorLibrary for BuiltinLibrary {
    fn lookup(&self, name: &str) -> Option<&FactorSpec> {
        self.specs.get(name)
    }

    fn names(&self) -> Vec<&str> {
        self.specs.keys().map(|s| s.as_str()).collect()
    }

    fn arena(&self) -> &LogicArena {
        &self.arena
    }
}

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::logic::LogicRef;

/// Arena index of a factor inside one strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FactorId(pub u32);

impl std::fmt::Display for FactorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "f{}", self.0)
    }
}

/// Closed set of factor roles. Adding a variant is a compile-time-checked
/// change for every match in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorCategory {
    Momentum,
    Trend,
    Volatility,
    Catalyst,
    Exit,
    Signal,
}

impl FactorCategory {
    pub const ALL: [FactorCategory; 6] = [
        FactorCategory::Momentum,
        FactorCategory::Trend,
        FactorCategory::Volatility,
        FactorCategory::Catalyst,
        FactorCategory::Exit,
        FactorCategory::Signal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FactorCategory::Momentum => "momentum",
            FactorCategory::Trend => "trend",
            FactorCategory::Volatility => "volatility",
            FactorCategory::Catalyst => "catalyst",
            FactorCategory::Exit => "exit",
            FactorCategory::Signal => "signal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "momentum" => Some(FactorCategory::Momentum),
            "trend" => Some(FactorCategory::Trend),
            "volatility" => Some(FactorCategory::Volatility),
            "catalyst" => Some(FactorCategory::Catalyst),
            "exit" => Some(FactorCategory::Exit),
            "signal" => Some(FactorCategory::Signal),
            _ => None,
        }
    }
}

impl std::fmt::Display for FactorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
}

impl ParamValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            ParamValue::Int(v) => *v as f64,
            ParamValue::Float(v) => *v,
        }
    }
}

/// Valid range declared by the factor library for one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamRange {
    pub min: f64,
    pub max: f64,
    pub integer: bool,
}

impl ParamRange {
    pub fn int(min: i64, max: i64) -> Self {
        Self {
            min: min as f64,
            max: max as f64,
            integer: true,
        }
    }

    pub fn float(min: f64, max: f64) -> Self {
        Self {
            min,
            max,
            integer: false,
        }
    }

    pub fn contains(&self, value: &ParamValue) -> bool {
        let v = value.as_f64();
        if self.integer && !matches!(value, ParamValue::Int(_)) {
            return false;
        }
        v >= self.min && v <= self.max
    }

    /// Integer parameters round before clamping.
    pub fn clamp(&self, raw: f64) -> ParamValue {
        if self.integer {
            let rounded = raw.round();
            let clamped = rounded.clamp(self.min, self.max);
            ParamValue::Int(clamped as i64)
        } else {
            ParamValue::Float(raw.clamp(self.min, self.max))
        }
    }
}

/// One computation node in a strategy. Immutable once constructed; mutation
/// always builds a new Factor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Factor {
    pub id: FactorId,
    pub name: String,
    pub category: FactorCategory,
    pub parameters: BTreeMap<String, ParamValue>,
    pub inputs: BTreeSet<String>,
    pub outputs: BTreeSet<String>,
    pub logic: LogicRef,
}

impl Factor {
    /// True when this factor emits a trading-decision channel.
    pub fn produces_signal(&self) -> bool {
        self.outputs.iter().any(|o| is_signal_channel(o))
    }
}

/// Channels that count as a trading decision for invariant purposes.
pub fn is_signal_channel(name: &str) -> bool {
    name == "signal" || name == "position"
}

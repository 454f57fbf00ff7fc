//! Dataset frames and strategy execution.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::factor::is_signal_channel;
use crate::library::BASE_CHANNELS;
use crate::logic::LogicArena;
use crate::strategy::Strategy;

/// Named channels over a shared row axis.
#[derive(Debug, Clone)]
pub struct ChannelFrame {
    pub names: Vec<String>,
    pub data: Array2<f64>,
    pub timestamps: Vec<i64>,
}

impl ChannelFrame {
    pub fn rows(&self) -> usize {
        self.data.nrows()
    }

    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let idx = self.names.iter().position(|n| n == name)?;
        Some(self.data.column(idx).to_vec())
    }

    /// Deterministic random-walk OHLCV frame for tests and the demo
    /// landscape. Same seed, same frame.
    pub fn synthetic(rows: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut data = Array2::zeros((rows, BASE_CHANNELS.len()));
        let mut price = 100.0_f64;
        let mut timestamps = Vec::with_capacity(rows);
        for i in 0..rows {
            let drift: f64 = rng.gen_range(-0.5..0.5);
            let open = price;
            let close = (price + drift).max(1.0);
            let high = open.max(close) + rng.gen_range(0.0..0.3);
            let low = open.min(close) - rng.gen_range(0.0..0.3);
            let volume = rng.gen_range(500.0..1500.0);
            data[[i, 0]] = open;
            data[[i, 1]] = high;
            data[[i, 2]] = low;
            data[[i, 3]] = close;
            data[[i, 4]] = volume;
            price = close;
            timestamps.push(i as i64 * 60_000);
        }
        Self {
            names: BASE_CHANNELS.iter().map(|s| s.to_string()).collect(),
            data,
            timestamps,
        }
    }
}

/// Final-output channels produced by one execution pass.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub rows: usize,
    pub outputs: BTreeMap<String, Vec<f64>>,
}

impl ExecutionResult {
    /// The decision series: `position` when an exit overlay produced one,
    /// otherwise `signal`.
    pub fn decision(&self) -> Option<&Vec<f64>> {
        self.outputs.get("position").or_else(|| self.outputs.get("signal"))
    }
}

impl Strategy {
    /// Threads the base dataset through the DAG in topological order.
    /// Factor computation is resolved through the logic arena; a factor
    /// whose handle is unknown to the arena is an execution error, not a
    /// validation error.
    pub fn execute(&self, frame: &ChannelFrame, arena: &LogicArena) -> Result<ExecutionResult> {
        let order = self
            .topological_order()
            .map_err(|e| anyhow::anyhow!("invalid strategy at execution: {e}"))?;
        let rows = frame.rows();

        let mut channels: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for name in &frame.names {
            if let Some(col) = frame.column(name) {
                channels.insert(name.clone(), col);
            }
        }

        for id in order {
            let factor = self
                .factors
                .get(&id)
                .with_context(|| format!("factor {id} missing from arena map"))?;
            let body = arena
                .get(factor.logic)
                .with_context(|| format!("factor {id} ('{}') has no compiled logic", factor.name))?;
            let params: BTreeMap<String, f64> = factor
                .parameters
                .iter()
                .map(|(k, v)| (k.clone(), v.as_f64()))
                .collect();
            for (out_name, expr) in &body.outputs {
                let series = expr
                    .eval(rows, &channels, &params)
                    .with_context(|| format!("factor {id} ('{}') output '{out_name}'", factor.name))?;
                channels.insert(out_name.clone(), series);
            }
        }

        tracing::trace!(
            "executed {} factors of {} over {} rows",
            self.factors.len(),
            self.id,
            rows
        );

        let mut outputs = BTreeMap::new();
        for name in &self.final_outputs {
            if let Some(series) = channels.get(name) {
                outputs.insert(name.clone(), series.clone());
            }
        }
        if !outputs.keys().any(|k| is_signal_channel(k)) {
            bail!("execution produced no signal or position channel");
        }
        Ok(ExecutionResult { rows, outputs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factor::FactorId;
    use crate::library::{BuiltinLibrary, FactorLibrary};

    fn chain(lib: &BuiltinLibrary) -> Strategy {
        let empty = BTreeMap::new();
        let mut s = Strategy::new("exec", 0, vec![]);
        s.insert_factor(lib.instantiate("rsi", FactorId(0), &empty).unwrap());
        s.insert_factor(lib.instantiate("momentum_rank", FactorId(1), &empty).unwrap());
        s.insert_factor(lib.instantiate("signal_momentum", FactorId(2), &empty).unwrap());
        s
    }

    #[test]
    fn synthetic_frame_is_deterministic() {
        let a = ChannelFrame::synthetic(64, 9);
        let b = ChannelFrame::synthetic(64, 9);
        assert_eq!(a.data, b.data);
        assert_eq!(a.rows(), 64);
        assert!(a.column("close").is_some());
        assert!(a.column("bogus").is_none());
    }

    #[test]
    fn execute_produces_bounded_signal() {
        let lib = BuiltinLibrary::new();
        let s = chain(&lib);
        s.validate().unwrap();
        let frame = ChannelFrame::synthetic(128, 3);
        let result = s.execute(&frame, lib.arena()).unwrap();
        let decision = result.decision().expect("signal series");
        assert_eq!(decision.len(), 128);
        assert!(decision.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn exit_overlay_produces_position() {
        let lib = BuiltinLibrary::new();
        let mut s = chain(&lib);
        let empty = BTreeMap::new();
        s.insert_factor(lib.instantiate("atr", FactorId(3), &empty).unwrap());
        s.insert_factor(lib.instantiate("vol_stop", FactorId(4), &empty).unwrap());
        s.validate().unwrap();
        let frame = ChannelFrame::synthetic(64, 5);
        let result = s.execute(&frame, lib.arena()).unwrap();
        assert!(result.outputs.contains_key("position"));
        assert!(result.outputs.contains_key("signal"));
    }
}

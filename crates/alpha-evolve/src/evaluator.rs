//! The fitness oracle boundary.
//!
//! Evaluators are opaque, possibly slow, possibly failing. The engine
//! hands out read-only strategy copies, enforces a hard per-evaluation
//! timeout, and keys results by strategy id so completion order never
//! matters.

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rayon::prelude::*;
use thiserror::Error;
use tracing::warn;

use alpha_graph::{BuiltinLibrary, ChannelFrame, FactorCategory, Strategy};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvaluationError {
    #[error("evaluation timed out")]
    Timeout,
    #[error("sandbox violation: {0}")]
    SandboxViolation(String),
    #[error("external evaluator failure: {0}")]
    ExternalFailure(String),
}

/// Metrics bundle returned by an evaluator. Objective extraction happens
/// engine-side so evaluators stay decoupled from ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationResult {
    pub metrics: BTreeMap<String, f64>,
    pub statistically_significant: bool,
}

impl EvaluationResult {
    pub fn metric(&self, name: &str) -> f64 {
        self.metrics.get(name).copied().unwrap_or(0.0)
    }
}

pub trait FitnessEvaluator: Send + Sync {
    fn evaluate(
        &self,
        strategy: &Strategy,
        dataset: &ChannelFrame,
        timeout: Duration,
    ) -> Result<EvaluationResult, EvaluationError>;
}

/// Runs one evaluation on a watchdog thread. On expiry the worker is
/// abandoned and the strategy gets a timeout error; the rest of the
/// generation is never blocked.
pub fn evaluate_with_timeout(
    evaluator: Arc<dyn FitnessEvaluator>,
    strategy: Strategy,
    dataset: Arc<ChannelFrame>,
    timeout: Duration,
) -> Result<EvaluationResult, EvaluationError> {
    let (tx, rx) = mpsc::channel();
    let id = strategy.id.clone();
    thread::spawn(move || {
        let result = evaluator.evaluate(&strategy, &dataset, timeout);
        let _ = tx.send(result);
    });
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(_) => {
            warn!("evaluation of {} exceeded {:?}", id, timeout);
            Err(EvaluationError::Timeout)
        }
    }
}

/// Fans one generation out across the rayon pool. Within-generation order
/// is irrelevant; results are keyed by strategy id.
pub fn evaluate_population(
    evaluator: &Arc<dyn FitnessEvaluator>,
    strategies: &[Strategy],
    dataset: &Arc<ChannelFrame>,
    timeout: Duration,
) -> Vec<(String, Result<EvaluationResult, EvaluationError>)> {
    strategies
        .par_iter()
        .map(|strategy| {
            let outcome = evaluate_with_timeout(
                Arc::clone(evaluator),
                strategy.clone(),
                Arc::clone(dataset),
                timeout,
            );
            (strategy.id.clone(), outcome)
        })
        .collect()
}

/// Deterministic synthetic landscape used by tests and the demo run:
/// fitness grows with the number of distinct factor categories among
/// momentum, trend, volatility, and exit. The optimum (1.0) is a handful
/// of category additions away from any single-chain seed.
#[derive(Debug, Clone, Default)]
pub struct CategoryLandscapeEvaluator;

impl CategoryLandscapeEvaluator {
    const REWARDED: [FactorCategory; 4] = [
        FactorCategory::Momentum,
        FactorCategory::Trend,
        FactorCategory::Volatility,
        FactorCategory::Exit,
    ];

    pub fn optimum() -> f64 {
        1.0
    }
}

impl FitnessEvaluator for CategoryLandscapeEvaluator {
    fn evaluate(
        &self,
        strategy: &Strategy,
        _dataset: &ChannelFrame,
        _timeout: Duration,
    ) -> Result<EvaluationResult, EvaluationError> {
        let categories = strategy.categories();
        let covered = Self::REWARDED
            .iter()
            .filter(|c| categories.contains(c))
            .count();
        let score = covered as f64 * 0.25;
        let mut metrics = BTreeMap::new();
        metrics.insert("return".to_string(), score);
        metrics.insert("sharpe".to_string(), score * 2.0);
        metrics.insert("max_drawdown".to_string(), 0.5 / (1.0 + covered as f64));
        Ok(EvaluationResult {
            metrics,
            statistically_significant: covered >= 2,
        })
    }
}

/// Reference backtest proxy: executes the strategy over the frame and
/// scores the decision series against next-bar close moves. A stand-in
/// for the real external backtester with the same interface.
pub struct ExecutionBacktestEvaluator {
    library: Arc<BuiltinLibrary>,
}

impl ExecutionBacktestEvaluator {
    pub fn new(library: Arc<BuiltinLibrary>) -> Self {
        Self { library }
    }
}

impl FitnessEvaluator for ExecutionBacktestEvaluator {
    fn evaluate(
        &self,
        strategy: &Strategy,
        dataset: &ChannelFrame,
        _timeout: Duration,
    ) -> Result<EvaluationResult, EvaluationError> {
        use alpha_graph::FactorLibrary;

        let result = strategy
            .execute(dataset, self.library.arena())
            .map_err(|e| EvaluationError::ExternalFailure(e.to_string()))?;
        let decision = result
            .decision()
            .ok_or_else(|| EvaluationError::ExternalFailure("no decision series".to_string()))?;
        let close = dataset
            .column("close")
            .ok_or_else(|| EvaluationError::ExternalFailure("no close channel".to_string()))?;

        let mut pnl = Vec::with_capacity(close.len().saturating_sub(1));
        for i in 0..close.len().saturating_sub(1) {
            let ret = (close[i + 1] - close[i]) / close[i].max(1e-9);
            pnl.push(decision[i] * ret);
        }

        let total: f64 = pnl.iter().sum();
        let mean = if pnl.is_empty() { 0.0 } else { total / pnl.len() as f64 };
        let var = if pnl.len() < 2 {
            0.0
        } else {
            pnl.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / (pnl.len() - 1) as f64
        };
        let sharpe = if var > 1e-18 { mean / var.sqrt() } else { 0.0 };

        let mut equity = 0.0_f64;
        let mut peak = 0.0_f64;
        let mut max_dd = 0.0_f64;
        for p in &pnl {
            equity += p;
            peak = peak.max(equity);
            max_dd = max_dd.max(peak - equity);
        }

        let trades = pnl.iter().filter(|p| p.abs() > 1e-15).count();
        let mut metrics = BTreeMap::new();
        metrics.insert("return".to_string(), total);
        metrics.insert("sharpe".to_string(), sharpe);
        metrics.insert("max_drawdown".to_string(), max_dd);
        metrics.insert("trades".to_string(), trades as f64);
        Ok(EvaluationResult {
            metrics,
            statistically_significant: trades >= 30,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alpha_graph::{FactorId, FactorLibrary};
    use std::collections::BTreeMap as Map;

    struct SleepyEvaluator(Duration);

    impl FitnessEvaluator for SleepyEvaluator {
        fn evaluate(
            &self,
            _strategy: &Strategy,
            _dataset: &ChannelFrame,
            _timeout: Duration,
        ) -> Result<EvaluationResult, EvaluationError> {
            thread::sleep(self.0);
            Ok(EvaluationResult {
                metrics: BTreeMap::new(),
                statistically_significant: false,
            })
        }
    }

    fn chain(lib: &BuiltinLibrary) -> Strategy {
        let empty = Map::new();
        let mut s = Strategy::new("eval", 0, vec![]);
        s.insert_factor(lib.instantiate("rsi", FactorId(0), &empty).unwrap());
        s.insert_factor(lib.instantiate("momentum_rank", FactorId(1), &empty).unwrap());
        s.insert_factor(lib.instantiate("signal_momentum", FactorId(2), &empty).unwrap());
        s
    }

    #[test]
    fn timeout_is_enforced() {
        let lib = BuiltinLibrary::new();
        let evaluator: Arc<dyn FitnessEvaluator> =
            Arc::new(SleepyEvaluator(Duration::from_secs(5)));
        let dataset = Arc::new(ChannelFrame::synthetic(16, 1));
        let outcome = evaluate_with_timeout(
            evaluator,
            chain(&lib),
            dataset,
            Duration::from_millis(50),
        );
        assert_eq!(outcome.unwrap_err(), EvaluationError::Timeout);
    }

    #[test]
    fn category_landscape_scores_coverage() {
        let lib = BuiltinLibrary::new();
        let evaluator = CategoryLandscapeEvaluator;
        let dataset = ChannelFrame::synthetic(16, 1);
        let s = chain(&lib);
        let result = evaluator
            .evaluate(&s, &dataset, Duration::from_secs(1))
            .unwrap();
        // Momentum only.
        assert!((result.metric("return") - 0.25).abs() < 1e-12);

        let empty = Map::new();
        let mut full = chain(&lib);
        full.insert_factor(lib.instantiate("ema_gap", FactorId(3), &empty).unwrap());
        full.insert_factor(lib.instantiate("trend_rank", FactorId(4), &empty).unwrap());
        full.insert_factor(lib.instantiate("signal_trend", FactorId(5), &empty).unwrap());
        full.insert_factor(lib.instantiate("atr", FactorId(6), &empty).unwrap());
        full.insert_factor(lib.instantiate("vol_stop", FactorId(7), &empty).unwrap());
        let result = evaluator
            .evaluate(&full, &dataset, Duration::from_secs(1))
            .unwrap();
        assert!((result.metric("return") - CategoryLandscapeEvaluator::optimum()).abs() < 1e-12);
    }

    #[test]
    fn fan_out_keys_results_by_id() {
        let lib = Arc::new(BuiltinLibrary::new());
        let evaluator: Arc<dyn FitnessEvaluator> =
            Arc::new(ExecutionBacktestEvaluator::new(Arc::clone(&lib)));
        let dataset = Arc::new(ChannelFrame::synthetic(256, 2));
        let mut a = chain(&lib);
        a.id = "a".to_string();
        let mut b = chain(&lib);
        b.id = "b".to_string();
        let results = evaluate_population(
            &evaluator,
            &[a, b],
            &dataset,
            Duration::from_secs(5),
        );
        let mut ids: Vec<&str> = results.iter().map(|(id, _)| id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
    }
}

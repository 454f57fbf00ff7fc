//! Population manager: owns a generation of strategies and drives the
//! Initialize -> Evaluate -> Select -> Vary -> Elitism-Merge ->
//! Convergence-Check -> (Advance | Restart) loop.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use alpha_core::config::Settings;
use alpha_core::events::EventLog;
use alpha_core::storage::RunLedger;
use alpha_graph::{
    mint_strategy_id, BuiltinLibrary, ChannelFrame, FactorId, FactorLibrary, Fitness, Strategy,
    StrategySnapshot,
};
use alpha_mutate::selector::{AdaptiveLearnerState, MarketContext, TierSelector};
use alpha_mutate::{MutationRecord, Mutator};

use crate::convergence::ConvergenceTracker;
use crate::crossover::crossover;
use crate::diversity::{novelty, population_diversity};
use crate::evaluator::{evaluate_population, EvaluationError, FitnessEvaluator};
use crate::ranking::rank_indices;

/// One generation of strategies.
#[derive(Debug, Clone, Default)]
pub struct Population {
    pub generation_number: usize,
    pub individuals: Vec<Strategy>,
    pub elite_ids: Vec<String>,
    pub diversity_score: f64,
}

/// Serializable image of a population for checkpointing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopulationSnapshot {
    pub generation_number: usize,
    pub individuals: Vec<StrategySnapshot>,
    pub elite_ids: Vec<String>,
    pub diversity_score: f64,
}

/// Learner and loop state persisted alongside the population.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LoopState {
    selector: AdaptiveLearnerState,
    tracker: ConvergenceTracker,
    restarts_used: usize,
}

/// External source of whole candidate strategies injected in place of
/// some mutation-derived offspring. Immigrants face the same validation
/// gate as every other individual.
pub trait ImmigrantSource: Send {
    fn next_immigrant(&mut self, generation: usize, rng: &mut StdRng) -> Option<Strategy>;
}

#[derive(Debug, Clone)]
pub struct GenerationReport {
    pub generation: usize,
    pub best_primary: f64,
    pub diversity: f64,
    pub converged: bool,
    pub restarted: bool,
    /// Set when convergence was declared with no restart budget left.
    pub halted: bool,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub generations_run: usize,
    pub best_primary: f64,
    pub best_id: Option<String>,
    pub restarts_used: usize,
    pub final_diversity: f64,
    pub halted_on_convergence: bool,
}

pub struct PopulationManager {
    settings: Settings,
    library: Arc<BuiltinLibrary>,
    evaluator: Arc<dyn FitnessEvaluator>,
    dataset: Arc<ChannelFrame>,
    rng: StdRng,
    selector: TierSelector,
    mutator: Mutator,
    market: MarketContext,
    pub population: Population,
    champion: Option<Strategy>,
    tracker: ConvergenceTracker,
    restarts_used: usize,
    records: Vec<MutationRecord>,
    ledger: Option<RunLedger>,
    pub events: EventLog,
    immigrants: Option<Box<dyn ImmigrantSource>>,
}

impl PopulationManager {
    pub fn new(
        settings: Settings,
        library: Arc<BuiltinLibrary>,
        evaluator: Arc<dyn FitnessEvaluator>,
        dataset: Arc<ChannelFrame>,
    ) -> Result<Self> {
        settings.validate().context("invalid configuration")?;

        let ledger = if settings.system.checkpoint_enabled {
            Some(RunLedger::new(
                &settings.system.checkpoint_db_path,
                Some(&settings.system.run_name),
            )?)
        } else {
            None
        };

        let market = MarketContext {
            recent_volatility: realized_volatility(&dataset),
        };
        let rng = StdRng::seed_from_u64(settings.evolution.seed);
        let selector = TierSelector::new(settings.mutation.clone());
        let mutator = Mutator::new(Arc::clone(&library), settings.mutation.clone());
        let events = EventLog::new(settings.system.event_log_max_entries);

        Ok(Self {
            settings,
            library,
            evaluator,
            dataset,
            rng,
            selector,
            mutator,
            market,
            population: Population::default(),
            champion: None,
            tracker: ConvergenceTracker::new(),
            restarts_used: 0,
            records: Vec::new(),
            ledger,
            events,
            immigrants: None,
        })
    }

    pub fn with_immigrant_source(mut self, source: Box<dyn ImmigrantSource>) -> Self {
        self.immigrants = Some(source);
        self
    }

    pub fn champion(&self) -> Option<&Strategy> {
        self.champion.as_ref()
    }

    pub fn restarts_used(&self) -> usize {
        self.restarts_used
    }

    pub fn selector(&self) -> &TierSelector {
        &self.selector
    }

    /// Parameter-grid sampling of the configuration space. Invalid samples
    /// are discarded and resampled, never patched up with defaults.
    pub fn initialize(&mut self) -> Result<()> {
        let target = self.settings.evolution.population_size;
        let mut individuals = Vec::with_capacity(target);
        let mut attempts = 0usize;
        while individuals.len() < target {
            attempts += 1;
            if attempts > target * 200 {
                bail!("population initialization failed after {} attempts", attempts);
            }
            let candidate = self.sample_strategy(0);
            if candidate.validate().is_ok() {
                individuals.push(candidate);
            }
        }
        let diversity = population_diversity(&individuals);
        self.population = Population {
            generation_number: 0,
            individuals,
            elite_ids: Vec::new(),
            diversity_score: diversity,
        };
        info!(
            "initialized population of {} (diversity {:.3})",
            target, diversity
        );
        Ok(())
    }

    fn sample_strategy(&mut self, generation: usize) -> Strategy {
        const TEMPLATES: [&[&str]; 3] = [
            &["rsi", "momentum_rank", "signal_momentum"],
            &["ema_gap", "trend_rank", "signal_trend"],
            &["rsi", "momentum_rank", "ema_gap", "trend_rank", "signal_blend"],
        ];
        let template = TEMPLATES[self.rng.gen_range(0..TEMPLATES.len())];
        let with_exit = self.rng.gen_bool(0.3);

        let mut strategy = Strategy::new(mint_strategy_id(&mut self.rng, generation), generation, vec![]);
        let mut names: Vec<&str> = template.to_vec();
        if with_exit {
            names.push("atr");
            names.push("vol_stop");
        }
        for (idx, name) in names.iter().enumerate() {
            let Some(spec) = self.library.lookup(name) else {
                continue;
            };
            // Five grid points per declared range.
            let mut params = BTreeMap::new();
            let grid: Vec<(String, alpha_graph::ParamValue)> = spec
                .params
                .iter()
                .map(|(key, p)| {
                    let point = self.rng.gen_range(0..5) as f64;
                    let raw = p.range.min + point * (p.range.max - p.range.min) / 4.0;
                    (key.clone(), p.range.clamp(raw))
                })
                .collect();
            for (key, value) in grid {
                params.insert(key, value);
            }
            if let Ok(factor) = self.library.instantiate(name, FactorId(idx as u32), &params) {
                strategy.insert_factor(factor);
            }
        }
        strategy
    }

    /// Evaluates every individual that does not yet carry fitness.
    /// Failures become worst-case fitness; nothing is retried within the
    /// generation.
    fn evaluate_into(&mut self, individuals: &mut [Strategy]) {
        let timeout = Duration::from_secs(self.settings.evaluation.timeout_seconds.max(1));
        let pending: Vec<Strategy> = individuals
            .iter()
            .filter(|s| s.fitness.is_none())
            .cloned()
            .collect();
        if !pending.is_empty() {
            let results = evaluate_population(&self.evaluator, &pending, &self.dataset, timeout);
            let by_id: BTreeMap<String, Result<crate::evaluator::EvaluationResult, EvaluationError>> =
                results.into_iter().collect();
            for individual in individuals.iter_mut() {
                if individual.fitness.is_some() {
                    continue;
                }
                match by_id.get(&individual.id) {
                    Some(Ok(result)) => {
                        let objectives = vec![
                            result.metric("return"),
                            -result.metric("max_drawdown"),
                            0.0, // novelty, filled below
                        ];
                        individual.fitness = Some(Fitness {
                            objectives,
                            metrics: result.metrics.clone(),
                            statistically_significant: result.statistically_significant,
                            failed: false,
                        });
                    }
                    Some(Err(err)) => {
                        self.events.record(
                            "evaluation",
                            &format!("{}: {}", individual.id, err),
                            "warning",
                            None,
                        );
                        individual.fitness = Some(Fitness::worst(3));
                    }
                    None => {
                        individual.fitness = Some(Fitness::worst(3));
                    }
                }
            }
        }

        // Novelty is population-relative and refreshed every generation.
        for i in 0..individuals.len() {
            let score = novelty(i, individuals);
            if let Some(fitness) = individuals[i].fitness.as_mut() {
                if !fitness.failed && fitness.objectives.len() >= 3 {
                    fitness.objectives[2] = score;
                }
            }
        }
    }

    fn update_champion(&mut self, individuals: &[Strategy]) {
        for individual in individuals {
            let Some(fitness) = &individual.fitness else {
                continue;
            };
            if fitness.failed {
                continue;
            }
            let better = match &self.champion {
                None => true,
                Some(champ) => {
                    fitness.primary()
                        > champ.fitness.as_ref().map(|f| f.primary()).unwrap_or(f64::MIN)
                }
            };
            if better {
                self.champion = Some(individual.clone());
            }
        }
    }

    fn tournament_pick<'a>(
        &mut self,
        individuals: &'a [Strategy],
        rank_of: &BTreeMap<usize, usize>,
    ) -> &'a Strategy {
        let size = self.settings.evolution.tournament_size.max(1);
        let mut best: Option<usize> = None;
        for _ in 0..size {
            let idx = self.rng.gen_range(0..individuals.len());
            best = Some(match best {
                None => idx,
                Some(current) => {
                    if rank_of[&idx] < rank_of[&current] {
                        idx
                    } else {
                        current
                    }
                }
            });
        }
        &individuals[best.expect("tournament over non-empty population")]
    }

    fn clone_as_child(&mut self, parent: &Strategy, generation: usize) -> Strategy {
        let mut child = parent.clone();
        child.id = mint_strategy_id(&mut self.rng, generation);
        child.generation = generation;
        child.parent_ids = vec![parent.id.clone()];
        child.fitness = None;
        child
    }

    /// Runs one full generation. The shared population is owned by this
    /// manager for the whole step; workers only ever see read-only copies
    /// and all learner updates land in one batch at the end.
    pub fn step(&mut self) -> Result<GenerationReport> {
        let generation = self.population.generation_number;
        let next_generation = generation + 1;
        let cfg = self.settings.evolution.clone();

        // Evaluate.
        let mut individuals = std::mem::take(&mut self.population.individuals);
        self.evaluate_into(&mut individuals);
        self.update_champion(&individuals);

        // Select: NSGA-II order over the evaluated generation.
        let objectives: Vec<Vec<f64>> = individuals
            .iter()
            .map(|s| s.fitness.as_ref().expect("evaluated").objectives.clone())
            .collect();
        let order = rank_indices(&objectives);
        let mut rank_of = BTreeMap::new();
        for (position, idx) in order.iter().enumerate() {
            rank_of.insert(*idx, position);
        }

        // Vary.
        let offspring_target = cfg.population_size - cfg.elite_size;
        let immigrant_quota =
            (cfg.immigrant_fraction * offspring_target as f64).floor() as usize;
        let mut offspring: Vec<Strategy> = Vec::with_capacity(offspring_target);

        while offspring.len() < offspring_target {
            if offspring.len() < immigrant_quota {
                if let Some(source) = self.immigrants.as_mut() {
                    if let Some(candidate) = source.next_immigrant(next_generation, &mut self.rng) {
                        if candidate.validate().is_ok() {
                            offspring.push(candidate);
                            continue;
                        }
                        self.events.record(
                            "immigrant",
                            "rejected invalid immigrant",
                            "warning",
                            None,
                        );
                    }
                }
            }

            let parent_a = self.tournament_pick(&individuals, &rank_of).clone();
            let parent_b = self.tournament_pick(&individuals, &rank_of).clone();

            let crossed = if self.rng.gen_bool(cfg.crossover_rate) {
                crossover(&parent_a, &parent_b, next_generation, &mut self.rng)
            } else {
                None
            };
            let mut child = match crossed {
                Some(c) => c,
                None => self.clone_as_child(&parent_a, next_generation),
            };

            // Per-request tier routing, then one operator application.
            let tier = self.selector.select(&child, &self.market);
            let (op, outcome) = self
                .mutator
                .mutate(&child, tier, next_generation, &mut self.rng);
            match outcome {
                Ok(mutated) => {
                    self.records
                        .push(MutationRecord::success(tier, op, &child.id, &mutated.id));
                    child = mutated;
                }
                Err(err) => {
                    debug!("mutation rejected: {err}");
                    self.records
                        .push(MutationRecord::failure(tier, op, &child.id, &err.to_string()));
                }
            }
            offspring.push(child);
        }

        // Offspring must be evaluated before they can be merged.
        self.evaluate_into(&mut offspring);
        self.update_champion(&offspring);

        // Elitism-Merge.
        let (mut next_individuals, elite_ids) =
            elitism_merge(&individuals, offspring, cfg.elite_size, cfg.population_size)?;

        // Convergence-Check.
        let diversity = population_diversity(&next_individuals);
        let best_primary = self
            .champion
            .as_ref()
            .and_then(|c| c.fitness.as_ref())
            .map(|f| f.primary())
            .unwrap_or(f64::MIN);
        let converged = self.tracker.observe(diversity, best_primary, &cfg);

        let mut restarted = false;
        let mut halted = false;
        if converged {
            if self.restarts_used < cfg.max_restarts {
                next_individuals = self.restart_population(next_generation)?;
                restarted = true;
            } else {
                halted = true;
                self.events.record(
                    "convergence",
                    "converged with no restart budget left",
                    "info",
                    None,
                );
            }
        }

        let diversity = if restarted {
            population_diversity(&next_individuals)
        } else {
            diversity
        };
        let elite_ids = if restarted {
            self.champion.iter().map(|c| c.id.clone()).collect()
        } else {
            elite_ids
        };

        self.population = Population {
            generation_number: next_generation,
            individuals: next_individuals,
            elite_ids,
            diversity_score: diversity,
        };

        // Single-batch learner update; never touched by worker threads.
        let records = std::mem::take(&mut self.records);
        self.selector.apply_generation(&records);

        self.save_checkpoint()?;

        info!(
            "generation {} -> {}: best {:.4}, diversity {:.3}{}",
            generation,
            next_generation,
            best_primary,
            diversity,
            if restarted { " (restarted)" } else { "" }
        );

        Ok(GenerationReport {
            generation: next_generation,
            best_primary,
            diversity,
            converged,
            restarted,
            halted,
        })
    }

    /// Fresh random samples with the reigning champion seeded into one
    /// slot, so the best-known solution survives every restart.
    fn restart_population(&mut self, generation: usize) -> Result<Vec<Strategy>> {
        let target = self.settings.evolution.population_size;
        self.restarts_used += 1;
        self.tracker.reset_streaks();
        self.events.record(
            "restart",
            &format!(
                "restart {}/{} at generation {}",
                self.restarts_used, self.settings.evolution.max_restarts, generation
            ),
            "info",
            None,
        );

        let mut individuals = Vec::with_capacity(target);
        if let Some(champion) = self.champion.clone() {
            individuals.push(champion);
        }
        let mut attempts = 0usize;
        while individuals.len() < target {
            attempts += 1;
            if attempts > target * 200 {
                bail!("restart sampling failed after {} attempts", attempts);
            }
            let candidate = self.sample_strategy(generation);
            if candidate.validate().is_ok() {
                individuals.push(candidate);
            }
        }
        Ok(individuals)
    }

    /// Runs up to `generations` steps, stopping early only when the
    /// restart budget is exhausted after a convergence.
    pub fn run(&mut self, generations: usize) -> Result<RunSummary> {
        if self.population.individuals.is_empty() {
            self.initialize()?;
        }
        let mut generations_run = 0;
        let mut halted = false;
        for _ in 0..generations {
            let report = self.step()?;
            generations_run += 1;
            if report.halted {
                halted = true;
                break;
            }
        }
        Ok(RunSummary {
            generations_run,
            best_primary: self
                .champion
                .as_ref()
                .and_then(|c| c.fitness.as_ref())
                .map(|f| f.primary())
                .unwrap_or(f64::MIN),
            best_id: self.champion.as_ref().map(|c| c.id.clone()),
            restarts_used: self.restarts_used,
            final_diversity: self.population.diversity_score,
            halted_on_convergence: halted,
        })
    }

    fn save_checkpoint(&self) -> Result<()> {
        let Some(ledger) = &self.ledger else {
            return Ok(());
        };
        let snapshot = PopulationSnapshot {
            generation_number: self.population.generation_number,
            individuals: self
                .population
                .individuals
                .iter()
                .map(|s| s.to_snapshot(self.library.arena()))
                .collect(),
            elite_ids: self.population.elite_ids.clone(),
            diversity_score: self.population.diversity_score,
        };
        let state = LoopState {
            selector: self.selector.to_state(),
            tracker: self.tracker.clone(),
            restarts_used: self.restarts_used,
        };
        ledger.save_checkpoint(
            self.population.generation_number as u64,
            &serde_json::to_string(&snapshot)?,
            self.population.diversity_score,
            &serde_json::to_string(&state)?,
            self.restarts_used as u64,
        )?;
        Ok(())
    }

    /// Rebuilds a manager from the latest checkpoint, re-registering the
    /// persisted logic bodies; already-scored individuals keep their
    /// fitness and are not re-evaluated.
    pub fn resume(
        settings: Settings,
        library: Arc<BuiltinLibrary>,
        evaluator: Arc<dyn FitnessEvaluator>,
        dataset: Arc<ChannelFrame>,
    ) -> Result<Option<Self>> {
        let ledger = RunLedger::new(
            &settings.system.checkpoint_db_path,
            Some(&settings.system.run_name),
        )?;
        let Some(row) = ledger.load_latest_checkpoint()? else {
            return Ok(None);
        };

        let snapshot: PopulationSnapshot = serde_json::from_str(&row.population_json)
            .context("corrupt population checkpoint")?;
        let state: LoopState =
            serde_json::from_str(&row.thresholds_json).context("corrupt loop state checkpoint")?;

        let mut manager = Self::new(settings, Arc::clone(&library), evaluator, dataset)?;
        let mut individuals = Vec::with_capacity(snapshot.individuals.len());
        for snap in &snapshot.individuals {
            individuals.push(snap.restore(library.arena())?);
        }
        manager.update_champion(&individuals);
        manager.population = Population {
            generation_number: snapshot.generation_number,
            individuals,
            elite_ids: snapshot.elite_ids,
            diversity_score: snapshot.diversity_score,
        };
        manager.selector = TierSelector::restore(
            manager.settings.mutation.clone(),
            state.selector,
        );
        manager.tracker = state.tracker;
        manager.restarts_used = state.restarts_used;
        info!(
            "resumed run at generation {} ({} individuals)",
            manager.population.generation_number,
            manager.population.individuals.len()
        );
        Ok(Some(manager))
    }
}

/// Next generation = top `elite_size` of the current, already-evaluated
/// population plus the best of the newly evaluated offspring. Ranking an
/// individual without fitness is a programming error and is rejected, so
/// evaluated and unevaluated individuals are never compared.
pub fn elitism_merge(
    current: &[Strategy],
    offspring: Vec<Strategy>,
    elite_size: usize,
    population_size: usize,
) -> Result<(Vec<Strategy>, Vec<String>)> {
    for s in current.iter().chain(offspring.iter()) {
        if s.fitness.is_none() {
            bail!("elitism merge saw unevaluated individual '{}'", s.id);
        }
    }

    let current_objectives: Vec<Vec<f64>> = current
        .iter()
        .map(|s| s.fitness.as_ref().unwrap().objectives.clone())
        .collect();
    let elite_order = rank_indices(&current_objectives);
    let elites: Vec<Strategy> = elite_order
        .iter()
        .take(elite_size)
        .map(|&i| current[i].clone())
        .collect();
    let elite_ids: Vec<String> = elites.iter().map(|s| s.id.clone()).collect();

    let offspring_objectives: Vec<Vec<f64>> = offspring
        .iter()
        .map(|s| s.fitness.as_ref().unwrap().objectives.clone())
        .collect();
    let offspring_order = rank_indices(&offspring_objectives);

    let mut next = elites;
    for &i in offspring_order.iter() {
        if next.len() >= population_size {
            break;
        }
        next.push(offspring[i].clone());
    }

    // Top up from the current generation when offspring fell short.
    if next.len() < population_size {
        for &i in elite_order.iter().skip(elite_size) {
            if next.len() >= population_size {
                break;
            }
            next.push(current[i].clone());
        }
    }

    if next.len() != population_size {
        warn!(
            "merged population has {} individuals, expected {}",
            next.len(),
            population_size
        );
    }

    Ok((next, elite_ids))
}

fn realized_volatility(frame: &ChannelFrame) -> f64 {
    let Some(close) = frame.column("close") else {
        return 0.5;
    };
    if close.len() < 3 {
        return 0.5;
    }
    let returns: Vec<f64> = close
        .windows(2)
        .map(|w| (w[1] - w[0]) / w[0].max(1e-9))
        .collect();
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    (var.sqrt() * 100.0).clamp(0.0, 1.0)
}

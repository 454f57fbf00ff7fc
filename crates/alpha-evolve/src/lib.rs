pub mod convergence;
pub mod crossover;
pub mod diversity;
pub mod evaluator;
pub mod population;
pub mod ranking;

pub use convergence::ConvergenceTracker;
pub use crossover::crossover;
pub use diversity::{novelty, population_diversity, structural_distance};
pub use evaluator::{
    evaluate_population, evaluate_with_timeout, CategoryLandscapeEvaluator, EvaluationError,
    EvaluationResult, ExecutionBacktestEvaluator, FitnessEvaluator,
};
pub use population::{
    elitism_merge, GenerationReport, ImmigrantSource, Population, PopulationManager,
    PopulationSnapshot, RunSummary,
};
pub use ranking::{crowding_distance, fast_non_dominated_sort, rank_indices};

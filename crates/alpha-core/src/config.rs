//! Core configuration structures for the evolution engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// System-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub run_name: String,
    pub data_dir: PathBuf,
    pub checkpoint_db_path: PathBuf,
    pub checkpoint_enabled: bool,
    pub event_log_max_entries: usize,
    pub n_jobs: usize,
}

impl Default for SystemConfig {
    fn default() -> Self {
        let n_jobs = std::thread::available_parallelism()
            .map(|n| (n.get() - 1).max(1))
            .unwrap_or(1);

        Self {
            run_name: "alpha-run".to_string(),
            data_dir: PathBuf::from("data"),
            checkpoint_db_path: PathBuf::from("checkpoints.sqlite"),
            checkpoint_enabled: true,
            event_log_max_entries: 1000,
            n_jobs,
        }
    }
}

/// Evolutionary loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionConfig {
    pub population_size: usize,
    pub elite_size: usize,
    pub tournament_size: usize,
    pub generations: usize,
    pub seed: u64,
    pub crossover_rate: f64,
    pub immigrant_fraction: f64,
    pub diversity_floor: f64,
    pub diversity_window: usize,
    pub stagnation_window: usize,
    pub stagnation_epsilon: f64,
    pub max_restarts: usize,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            population_size: 50,
            elite_size: 4,
            // Size 2 keeps selection pressure low enough that diversity
            // survives; size 3 collapses it too quickly.
            tournament_size: 2,
            generations: 100,
            seed: 42,
            crossover_rate: 0.7,
            immigrant_fraction: 0.0,
            diversity_floor: 0.05,
            diversity_window: 10,
            stagnation_window: 20,
            stagnation_epsilon: 1e-9,
            max_restarts: 3,
        }
    }
}

/// Mutation and tier-routing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationConfig {
    pub tier1_boundary: f64,
    pub tier2_boundary: f64,
    pub boundary_step: f64,
    pub tier1_boundary_floor: f64,
    pub tier1_boundary_ceiling: f64,
    pub tier2_boundary_floor: f64,
    pub tier2_boundary_ceiling: f64,
    pub success_window: usize,
    pub min_samples_for_adjustment: usize,
    pub failure_rate_floor: f64,
    pub failure_penalty_step: f64,
    pub failure_penalty_decay: f64,
    pub param_noise_sigma: f64,
    pub max_factors: usize,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            tier1_boundary: 0.3,
            tier2_boundary: 0.7,
            boundary_step: 0.05,
            tier1_boundary_floor: 0.15,
            tier1_boundary_ceiling: 0.45,
            tier2_boundary_floor: 0.55,
            tier2_boundary_ceiling: 0.85,
            success_window: 64,
            min_samples_for_adjustment: 8,
            failure_rate_floor: 0.2,
            failure_penalty_step: 0.1,
            failure_penalty_decay: 0.5,
            param_noise_sigma: 0.15,
            max_factors: 16,
        }
    }
}

/// Evaluation fan-out configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    pub timeout_seconds: u64,
    pub dataset_rows: usize,
    pub dataset_seed: u64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            dataset_rows: 2048,
            dataset_seed: 7,
        }
    }
}

/// Main settings structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub system: SystemConfig,
    pub evolution: EvolutionConfig,
    pub mutation: MutationConfig,
    pub evaluation: EvaluationConfig,
}

impl Settings {
    /// Load settings from YAML config file
    pub fn from_yaml(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = serde_yaml_ng::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from environment variable CONFIG_FILE or default config.yaml
    pub fn load() -> anyhow::Result<Self> {
        let config_file =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.yaml".to_string());
        Self::from_yaml(&config_file)
    }

    /// Load settings with environment variable overrides
    pub fn load_with_env() -> anyhow::Result<Self> {
        let mut settings = Self::load()?;

        if let Ok(seed) = std::env::var("ALPHA_SEED") {
            settings.evolution.seed = seed.parse()?;
        }
        if let Ok(jobs) = std::env::var("ALPHA_N_JOBS") {
            settings.system.n_jobs = jobs.parse()?;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Save settings to YAML file
    pub fn save(&self, path: impl AsRef<std::path::Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml_ng::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Startup-time sanity check. There is no safe default to fall back
    /// to for these, so violations abort the run.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.evolution.population_size < 2 {
            anyhow::bail!("population_size must be at least 2");
        }
        if self.evolution.elite_size >= self.evolution.population_size {
            anyhow::bail!("elite_size must be smaller than population_size");
        }
        if self.evolution.tournament_size == 0 {
            anyhow::bail!("tournament_size must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.evolution.crossover_rate) {
            anyhow::bail!("crossover_rate must lie in [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.evolution.immigrant_fraction) {
            anyhow::bail!("immigrant_fraction must lie in [0, 1]");
        }
        if self.mutation.tier1_boundary >= self.mutation.tier2_boundary {
            anyhow::bail!("tier1_boundary must be below tier2_boundary");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.evolution.tournament_size, 2);
        assert_eq!(settings.evolution.diversity_window, 10);
        assert_eq!(settings.evolution.stagnation_window, 20);
        assert_eq!(settings.evolution.max_restarts, 3);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_serialize_deserialize() {
        let settings = Settings::default();
        let yaml = serde_yaml_ng::to_string(&settings).unwrap();
        let deserialized: Settings = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(deserialized.evolution.seed, settings.evolution.seed);
        assert_eq!(deserialized.mutation.tier1_boundary, settings.mutation.tier1_boundary);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "evolution:\n  population_size: 20\n  elite_size: 2\n";
        let settings: Settings = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(settings.evolution.population_size, 20);
        assert_eq!(settings.evolution.tournament_size, 2);
        assert_eq!(settings.mutation.tier2_boundary, 0.7);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mut settings = Settings::default();
        settings.evolution.elite_size = settings.evolution.population_size;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.mutation.tier1_boundary = 0.8;
        assert!(settings.validate().is_err());
    }
}

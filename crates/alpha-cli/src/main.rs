use std::sync::Arc;

use anyhow::{bail, Result};

use alpha_core::config::Settings;
use alpha_core::logging::setup_minimal_logging;
use alpha_evolve::{
    CategoryLandscapeEvaluator, ExecutionBacktestEvaluator, FitnessEvaluator, PopulationManager,
};
use alpha_graph::{BuiltinLibrary, ChannelFrame, FactorCategory, FactorLibrary, StrategySnapshot};

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_help();
        return Ok(());
    }
    match args[1].as_str() {
        "run" => cmd_run(&args[2..]),
        "resume" => cmd_resume(&args[2..]),
        "library" => cmd_library(&args[2..]),
        "validate" => cmd_validate(&args[2..]),
        "init-config" => cmd_init_config(&args[2..]),
        _ => {
            print_help();
            Ok(())
        }
    }
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == flag {
            return iter.next().map(|s| s.to_string());
        }
    }
    None
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn load_settings(args: &[String]) -> Result<Settings> {
    match parse_flag(args, "--config") {
        Some(path) => Settings::from_yaml(path),
        None => {
            let settings = Settings::default();
            settings.validate()?;
            Ok(settings)
        }
    }
}

fn build_evaluator(
    args: &[String],
    library: &Arc<BuiltinLibrary>,
) -> Arc<dyn FitnessEvaluator> {
    if has_flag(args, "--backtest") {
        Arc::new(ExecutionBacktestEvaluator::new(Arc::clone(library)))
    } else {
        Arc::new(CategoryLandscapeEvaluator)
    }
}

fn cmd_run(args: &[String]) -> Result<()> {
    setup_minimal_logging(has_flag(args, "--verbose"))?;

    let mut settings = load_settings(args)?;
    if let Some(generations) = parse_flag(args, "--generations") {
        settings.evolution.generations = generations.parse()?;
    }
    if let Some(seed) = parse_flag(args, "--seed") {
        settings.evolution.seed = seed.parse()?;
    }
    if let Some(rows) = parse_flag(args, "--rows") {
        settings.evaluation.dataset_rows = rows.parse()?;
    }

    let library = Arc::new(BuiltinLibrary::new());
    let evaluator = build_evaluator(args, &library);
    let dataset = Arc::new(ChannelFrame::synthetic(
        settings.evaluation.dataset_rows,
        settings.evaluation.dataset_seed,
    ));

    let generations = settings.evolution.generations;
    let mut manager = PopulationManager::new(settings, Arc::clone(&library), evaluator, dataset)?;
    manager.initialize()?;
    let summary = manager.run(generations)?;

    println!("Generations run: {}", summary.generations_run);
    println!("Restarts used:   {}", summary.restarts_used);
    println!("Final diversity: {:.4}", summary.final_diversity);
    println!("Best fitness:    {:.6}", summary.best_primary);
    let thresholds = manager.selector().thresholds();
    println!(
        "Tier boundaries: {:.3} / {:.3}",
        thresholds.tier1_boundary, thresholds.tier2_boundary
    );
    if let Some(champion) = manager.champion() {
        println!("Best strategy:   {} ({} factors)", champion.id, champion.factor_count());
        if let Some(out) = parse_flag(args, "--out") {
            let snapshot = champion.to_snapshot(library.arena());
            std::fs::write(&out, serde_json::to_string_pretty(&snapshot)?)?;
            println!("Champion written to {}", out);
        }
    }
    Ok(())
}

fn cmd_resume(args: &[String]) -> Result<()> {
    setup_minimal_logging(has_flag(args, "--verbose"))?;

    let settings = load_settings(args)?;
    let library = Arc::new(BuiltinLibrary::new());
    let evaluator = build_evaluator(args, &library);
    let dataset = Arc::new(ChannelFrame::synthetic(
        settings.evaluation.dataset_rows,
        settings.evaluation.dataset_seed,
    ));

    let generations = match parse_flag(args, "--generations") {
        Some(g) => g.parse()?,
        None => settings.evolution.generations,
    };

    let Some(mut manager) =
        PopulationManager::resume(settings, Arc::clone(&library), evaluator, dataset)?
    else {
        bail!("no checkpoint found; run `alpha-cli run` first");
    };
    let summary = manager.run(generations)?;
    println!(
        "Resumed run complete: best {:.6} after {} generations",
        summary.best_primary, summary.generations_run
    );
    Ok(())
}

fn cmd_library(args: &[String]) -> Result<()> {
    let library = BuiltinLibrary::new();
    let filter = parse_flag(args, "--category")
        .map(|c| FactorCategory::parse(&c).ok_or_else(|| anyhow::anyhow!("unknown category: {c}")))
        .transpose()?;

    let mut names = library.names();
    names.sort();
    for name in names {
        let spec = library.lookup(name).expect("listed factor");
        if let Some(category) = filter {
            if spec.category != category {
                continue;
            }
        }
        let inputs: Vec<&str> = spec.inputs.iter().map(|s| s.as_str()).collect();
        let outputs: Vec<&str> = spec.outputs.iter().map(|s| s.as_str()).collect();
        println!(
            "{:16} {:10} in: {:30} out: {:20} params: {}",
            name,
            spec.category.to_string(),
            inputs.join(","),
            outputs.join(","),
            spec.params.len()
        );
    }
    Ok(())
}

fn cmd_validate(args: &[String]) -> Result<()> {
    let Some(path) = parse_flag(args, "--file") else {
        bail!("usage: alpha-cli validate --file <strategy.json>");
    };
    let content = std::fs::read_to_string(&path)?;
    let snapshot: StrategySnapshot = serde_json::from_str(&content)?;

    let library = BuiltinLibrary::new();
    let strategy = snapshot.restore(library.arena())?;
    match strategy.validate() {
        Ok(()) => {
            let order = strategy.topological_order()?;
            println!("{} is valid ({} factors)", strategy.id, strategy.factor_count());
            println!("execution order:");
            for id in order {
                let factor = &strategy.factors[&id];
                println!("  {} {} [{}]", id, factor.name, factor.category);
            }
            Ok(())
        }
        Err(err) => {
            println!("{} is INVALID: {}", strategy.id, err);
            Ok(())
        }
    }
}

fn cmd_init_config(args: &[String]) -> Result<()> {
    let out = parse_flag(args, "--out").unwrap_or_else(|| "config.yaml".to_string());
    Settings::default().save(&out)?;
    println!("Wrote default configuration to {}", out);
    Ok(())
}

fn print_help() {
    println!("alpha-cli - factor-graph strategy evolution");
    println!();
    println!("USAGE:");
    println!("  alpha-cli run [--config FILE] [--generations N] [--seed N] [--rows N] [--backtest] [--out FILE] [--verbose]");
    println!("  alpha-cli resume [--config FILE] [--generations N] [--backtest] [--verbose]");
    println!("  alpha-cli library [--category NAME]");
    println!("  alpha-cli validate --file strategy.json");
    println!("  alpha-cli init-config [--out FILE]");
}

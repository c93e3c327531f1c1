use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sdm_runner::config::{DEFAULT_CONTRIBUTION_MARKER, DEFAULT_RESULTS_FILE, DEFAULT_TOP_K};
use sdm_runner::{
    discover_completed_trials, ContributionAggregator, Pipeline, RankedPredictor, RunConfig,
    RunReport, TrialResults,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sdm", version = "0.3.0", about = "Species distribution model trial runner")]
struct Cli {
    /// Default log filter when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan, fit, rank and run the final fit.
    Run {
        config: PathBuf,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        max_in_flight: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Show the covariate subsets a run would fit.
    Plan {
        config: PathBuf,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        json: bool,
    },
    /// Rank covariates from the completed trials of an earlier run.
    Rank {
        #[arg(long)]
        trials_dir: PathBuf,
        #[arg(long, default_value_t = DEFAULT_TOP_K)]
        top_k: usize,
        #[arg(long, default_value = DEFAULT_RESULTS_FILE)]
        results_file: String,
        #[arg(long, default_value = DEFAULT_CONTRIBUTION_MARKER)]
        marker: String,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            config,
            seed,
            max_in_flight,
            json,
        } => {
            let mut run_config = RunConfig::load(&config)
                .with_context(|| format!("loading run config {}", config.display()))?;
            tracing::debug!(config = %config.display(), "loaded run config");
            if seed.is_some() {
                run_config.seed = seed;
            }
            if max_in_flight.is_some() {
                run_config.max_in_flight = max_in_flight;
            }
            let report = Pipeline::new(run_config).run()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "report": serde_json::to_value(&report)?
                })));
            }
            print_report(&report);
        }
        Commands::Plan { config, seed, json } => {
            let mut run_config = RunConfig::load(&config)
                .with_context(|| format!("loading run config {}", config.display()))?;
            if seed.is_some() {
                run_config.seed = seed;
            }
            let (seed, planned) = Pipeline::new(run_config).preview_plan()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "plan",
                    "seed": seed,
                    "trials": serde_json::to_value(&planned)?
                })));
            }
            println!("seed: {}", seed);
            for trial in &planned {
                println!("{}: {}", trial.trial_id, trial.covariates.join(", "));
            }
        }
        Commands::Rank {
            trials_dir,
            top_k,
            results_file,
            marker,
            json,
        } => {
            let completed = discover_completed_trials(&trials_dir)
                .with_context(|| format!("scanning {}", trials_dir.display()))?;
            let results: Vec<TrialResults> = completed
                .iter()
                .map(|(id, dir)| TrialResults::new(id.clone(), dir.clone()))
                .collect();
            let ranked = ContributionAggregator::new(results_file, marker, top_k).aggregate(&results)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "rank",
                    "trials_dir": trials_dir.display().to_string(),
                    "trials": results.len(),
                    "ranked": serde_json::to_value(&ranked)?
                })));
            }
            println!("trials: {}", results.len());
            print_ranked(&ranked);
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } | Commands::Plan { json, .. } | Commands::Rank { json, .. } => {
            *json
        }
    }
}

fn print_report(report: &RunReport) {
    println!("run_id: {}", report.run_id);
    println!("workflow: {}", report.workflow.as_str());
    println!("species: {}", report.species);
    println!("seed: {}", report.seed);
    println!("trials: {} attempted, {} succeeded", report.attempted, report.succeeded);
    for failed in &report.failed {
        println!("failed: {} ({})", failed.trial_id, failed.reason);
    }
    print_ranked(&report.ranked);
    match (&report.final_trial_dir, &report.final_outcome) {
        (Some(dir), Some(outcome)) => {
            println!("final_dir: {}", dir.display());
            match outcome.failure_reason() {
                None => println!("final: success"),
                Some(reason) => println!("final: failure ({})", reason),
            }
        }
        _ => println!("final: skipped"),
    }
    println!("report: {}", report.report_path.display());
}

fn print_ranked(ranked: &[RankedPredictor]) {
    for (i, p) in ranked.iter().enumerate() {
        println!(
            "{:>2}. {} {:.4} (n={})",
            i + 1,
            p.name,
            p.mean_contribution,
            p.samples
        );
    }
}

//! WhoFi Simulator CLI
//!
//! Runs the deterministic end-to-end scenarios against the positioning engine.

use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;
use whofi_sim::scenarios::ScenarioId;
use whofi_sim::{ScenarioResult, ScenarioRunner};

/// WhoFi deterministic simulation CLI
#[derive(Parser, Debug)]
#[command(name = "whofi-sim")]
#[command(about = "Run deterministic positioning scenarios for WhoFi", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Scenario to run (static_triangle, walking, node_dropout, outlier_spike,
    /// stale_flood, recalibration, crowd, collinear, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Nominal simulation duration in seconds
    #[arg(short, long, default_value = "10")]
    duration: f64,

    /// Simulation steps per second
    #[arg(long, default_value = "10")]
    tick_rate: u32,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export frames of a single scenario to a JSON file
    #[arg(long)]
    export: Option<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {e}");
        return ExitCode::FAILURE;
    }

    if !args.json {
        info!("WhoFi Simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        match args.scenario.parse() {
            Ok(s) => vec![s],
            Err(e) => {
                eprintln!("Error: {e}");
                let names: Vec<&str> = ScenarioId::all().iter().map(|s| s.name()).collect();
                eprintln!("Available scenarios: {}, all", names.join(", "));
                return ExitCode::FAILURE;
            }
        }
    };

    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    } else {
        args.seed
    };

    if let Some(path) = &args.export {
        if scenarios.len() > 1 {
            eprintln!("Error: --export only supports a single scenario, not 'all'");
            return ExitCode::FAILURE;
        }
        return run_with_export(base_seed, &args, scenarios[0], path);
    }

    let mut all_results: Vec<ScenarioResult> = Vec::new();
    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);
        let runner = ScenarioRunner::new(seed)
            .with_duration(args.duration)
            .with_tick_rate(args.tick_rate);

        for scenario in &scenarios {
            let result = runner.run(*scenario);
            if !args.json {
                report(&result);
            }
            all_results.push(result);
        }
    }

    let total = all_results.len();
    let failed: Vec<&ScenarioResult> = all_results.iter().filter(|r| !r.passed).collect();

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": total - failed.len(),
            "failed": failed.len(),
            "results": all_results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "ticks": r.total_ticks,
                    "time_secs": r.final_time_secs,
                    "failure_reason": r.failure_reason,
                    "metrics": r.metrics,
                })
            }).collect::<Vec<_>>(),
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{text}"),
            Err(e) => {
                eprintln!("Failed to encode summary: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        if failed.is_empty() {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed.len(), total);
            for result in &failed {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    if failed.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn report(result: &ScenarioResult) {
    if result.passed {
        info!(
            "✓ {} (seed={}) PASSED | rms={:.2}m solves={} rejected={}",
            result.scenario.name(),
            result.seed,
            result.metrics.rms_error_m,
            result.metrics.solves,
            result.metrics.rejected
        );
    } else {
        error!(
            "✗ {} (seed={}) FAILED: {}",
            result.scenario.name(),
            result.seed,
            result.failure_reason.as_deref().unwrap_or("unknown")
        );
    }
}

/// Runs one scenario with frame capture and writes the export.
fn run_with_export(seed: u64, args: &Args, scenario: ScenarioId, path: &str) -> ExitCode {
    info!("Running with export to: {}", path);

    let result = ScenarioRunner::new(seed)
        .with_duration(args.duration)
        .with_tick_rate(args.tick_rate)
        .with_export(true)
        .run(scenario);
    report(&result);

    if let Some(export) = &result.export {
        match export.write_to_file(path) {
            Ok(()) => info!("Exported {} frames to {}", export.frames.len(), path),
            Err(e) => {
                error!("Failed to write export: {:?}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    if result.passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

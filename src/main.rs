//! seed-reconciler - CLI Entry Point
//!
//! Loads seed bundles and runs reconciliation against the configured store.

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use seed_reconciler::calendar::parse_date;
use seed_reconciler::seed::Scope;
use seed_reconciler::{
    create_store, Config, GenerateRequest, Reconciler, RunStatus, SeedBundle, SeedLoader,
};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "seed-reconciler", about = "Seed-driven task reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load a seed bundle (JSON or YAML) into the seed store
    Load(LoadArgs),
    /// Reconcile one cycle against the current seed
    Generate(GenerateArgs),
    /// List recent generation runs
    Runs(RunsArgs),
    /// Show the full report of one run
    Report(ReportArgs),
}

#[derive(Debug, Args)]
struct LoadArgs {
    #[arg(value_name = "BUNDLE")]
    bundle: PathBuf,
}

#[derive(Debug, Args)]
struct GenerateArgs {
    /// Cycle code, e.g. MONTH_END_CLOSE
    cycle_code: String,
    /// Period, e.g. 2025-12
    period: String,
    /// Anchor date (defaults to the last day of a YYYY-MM period)
    #[arg(long)]
    anchor: Option<String>,
    /// all, category:<name> or template:<code>
    #[arg(long, default_value = "all")]
    scope: Scope,
    #[arg(long, value_parser = parse_date_arg)]
    from: Option<NaiveDate>,
    #[arg(long, value_parser = parse_date_arg)]
    to: Option<NaiveDate>,
    #[arg(long)]
    dry_run: bool,
    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct RunsArgs {
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[derive(Debug, Args)]
struct ReportArgs {
    run_id: Uuid,
}

fn parse_date_arg(value: &str) -> Result<NaiveDate, String> {
    parse_date(value).map_err(|e| e.to_string())
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "seed_reconciler=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    info!(
        "Loaded configuration: store={:?}, data_dir={}",
        config.store_type,
        config.data_dir.display()
    );

    let backend = create_store(config.store_type, config.data_dir.clone())
        .with_context(|| format!("opening store in {}", config.data_dir.display()))?;

    match cli.command {
        Command::Load(args) => {
            let bundle = SeedBundle::from_path(&args.bundle)?;
            let summary = SeedLoader::new(backend.seeds()).load(&bundle)?;
            println!(
                "Loaded seed {}: {} inserted, {} updated, {} steps, {} rejected",
                bundle.seed_id,
                summary.inserted,
                summary.updated,
                summary.steps_written,
                summary.rejected
            );
        }
        Command::Generate(args) => {
            let options = config.engine_options()?;
            let directory = config.role_directory()?;
            let request = GenerateRequest::new(args.cycle_code, args.period)
                .scope(args.scope)
                .between(args.from, args.to)
                .dry_run(args.dry_run || config.dry_run);
            let request = match args.anchor {
                Some(anchor) => request.anchor(anchor),
                None => request,
            };

            let run = Reconciler::new(backend.as_ref(), &directory, options).generate(&request)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&run)?);
            } else {
                print!("{}", run.summary());
            }
            if run.status() == RunStatus::Fail {
                std::process::exit(1);
            }
        }
        Command::Runs(args) => {
            for run in backend.runs().list_runs(args.limit)? {
                println!(
                    "{}  {:<7} {}  {}{}",
                    run.id(),
                    run.status().as_str(),
                    run.started_at().format("%Y-%m-%d %H:%M:%S"),
                    run.cycle_key(),
                    if run.dry_run() { " [dry run]" } else { "" }
                );
            }
        }
        Command::Report(args) => {
            let run = backend
                .runs()
                .get_run(args.run_id)?
                .with_context(|| format!("run {} not found", args.run_id))?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
    }

    Ok(())
}

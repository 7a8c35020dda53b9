use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use cspf_collect::{BatchConfig, BatchRunner, FixtureCollector};
use cspf_core::Carrier;
use cspf_recon::{price_all, reconcile, report_recent, split_records, write_run_report};
use cspf_recon::{RebateBook, ResolutionTable};
use cspf_storage::CheckpointStore;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "cspf")]
#[command(about = "Carrier subsidy price finder")]
struct Cli {
    /// Root directory for fixtures, checkpoints, tables and reports
    #[arg(long, global = true, default_value = "data")]
    data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect support and price pages for one carrier, or "all"
    Run {
        /// Carrier code (SK, KT, LG) or "all"
        carrier: String,

        /// Concurrent collection workers
        #[arg(long, default_value_t = 3)]
        workers: usize,

        /// Resume from the task checkpoint instead of starting fresh
        #[arg(long)]
        resume: bool,

        /// Per-unit timeout in seconds
        #[arg(long, default_value_t = 90)]
        unit_timeout_secs: u64,
    },

    /// Join collected support and price records into offers and write a run report
    Reconcile {
        /// Resolution table path (defaults to <data-dir>/resolution_table.yaml)
        #[arg(long)]
        table: Option<PathBuf>,

        /// Rebate book path (defaults to <data-dir>/rebates.yaml)
        #[arg(long)]
        rebates: Option<PathBuf>,

        /// Reports directory (defaults to <data-dir>/reports)
        #[arg(long)]
        reports: Option<PathBuf>,
    },

    /// Print a digest of the most recent reconciliation runs
    Report {
        #[arg(long, default_value_t = 3)]
        runs: usize,

        /// Reports directory (defaults to <data-dir>/reports)
        #[arg(long)]
        reports: Option<PathBuf>,
    },
}

fn parse_carriers(arg: &str) -> Result<Vec<Carrier>> {
    if arg.eq_ignore_ascii_case("all") {
        return Ok(Carrier::ALL.to_vec());
    }
    let carrier = arg
        .parse::<Carrier>()
        .with_context(|| format!("unknown carrier {arg:?} (expected SK, KT, LG or all)"))?;
    Ok(vec![carrier])
}

fn task_id(carrier: Carrier) -> String {
    carrier.code().to_ascii_lowercase()
}

async fn cmd_run(
    data_dir: &PathBuf,
    carriers: Vec<Carrier>,
    config: BatchConfig,
) -> Result<ExitCode> {
    let store = CheckpointStore::new(data_dir.join("checkpoints"));
    let fixtures = data_dir.join("fixtures");
    let mut failed_units = 0usize;

    for carrier in carriers {
        let collector = FixtureCollector::new(&fixtures, carrier);
        let units = collector.enumerate_units()?;
        if units.is_empty() {
            warn!(carrier = %carrier, "no collection units found, skipping");
            continue;
        }
        let task = task_id(carrier);
        let runner = BatchRunner::new(store.clone(), config.clone());

        let summary = tokio::select! {
            result = runner.run(&task, &units, Arc::new(collector)) => result?,
            _ = tokio::signal::ctrl_c() => {
                // The checkpoint is saved after every unit, so whatever
                // finished before the signal survives for --resume.
                warn!(task_id = %task, "interrupted, progress kept in checkpoint");
                return Ok(ExitCode::from(130));
            }
        };

        info!(
            task_id = %summary.task_id,
            run_id = %summary.run_id,
            executed = summary.executed,
            skipped = summary.skipped,
            completed = summary.completed,
            failed = summary.failed,
            records = summary.records,
            "collection run finished"
        );
        println!(
            "{}: executed={} skipped={} completed={} failed={} records={}",
            summary.task_id,
            summary.executed,
            summary.skipped,
            summary.completed,
            summary.failed,
            summary.records
        );
        failed_units += summary.failed;
    }

    if failed_units > 0 {
        eprintln!("{failed_units} unit(s) failed; rerun with --resume to retry them");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_reconcile(
    data_dir: &PathBuf,
    table_path: Option<PathBuf>,
    rebates_path: Option<PathBuf>,
    reports_dir: Option<PathBuf>,
) -> Result<ExitCode> {
    let store = CheckpointStore::new(data_dir.join("checkpoints"));
    let mut records = Vec::new();
    for carrier in Carrier::ALL {
        match store.load(&task_id(carrier)).await? {
            Some(entry) => {
                info!(
                    carrier = %carrier,
                    records = entry.data.len(),
                    "loaded collected records"
                );
                records.extend(entry.data);
            }
            None => warn!(carrier = %carrier, "no checkpoint found, carrier excluded"),
        }
    }
    if records.is_empty() {
        bail!("no collected records under {}; run `cspf run all` first", data_dir.display());
    }

    let table_path = table_path.unwrap_or_else(|| data_dir.join("resolution_table.yaml"));
    let table = ResolutionTable::load(&table_path).await?;

    let rebates_path = rebates_path.unwrap_or_else(|| data_dir.join("rebates.yaml"));
    let book = if rebates_path.exists() {
        RebateBook::load(&rebates_path).await?
    } else {
        info!(path = %rebates_path.display(), "no rebate book, pricing without rebates");
        RebateBook::empty()
    };

    let (supports, prices) = split_records(records);
    let outcome = reconcile(supports, prices, &table);
    let computed = price_all(&outcome.offers, &book);

    let reports_dir = reports_dir.unwrap_or_else(|| data_dir.join("reports"));
    let run_id = Uuid::new_v4();
    let summary = write_run_report(&reports_dir, run_id, &outcome, &computed).await?;
    println!(
        "reconcile complete: run_id={} offers={} unresolved={} clamped={} reports={}",
        summary.run_id, summary.offers, summary.unresolved, summary.clamped, summary.reports_dir
    );
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Run {
            carrier,
            workers,
            resume,
            unit_timeout_secs,
        } => {
            let carriers = parse_carriers(&carrier)?;
            let config = BatchConfig {
                max_workers: workers.max(1),
                unit_timeout: Duration::from_secs(unit_timeout_secs),
                resume,
            };
            cmd_run(&cli.data_dir, carriers, config).await
        }
        Commands::Reconcile {
            table,
            rebates,
            reports,
        } => cmd_reconcile(&cli.data_dir, table, rebates, reports).await,
        Commands::Report { runs, reports } => {
            let reports = reports.unwrap_or_else(|| cli.data_dir.join("reports"));
            let digest = report_recent(&reports, runs)?;
            println!("{digest}");
            Ok(ExitCode::SUCCESS)
        }
    }
}

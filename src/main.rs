use chrono::{DateTime, Utc};
use clap::Parser;
use cycle_engine::application::orchestrator::CycleEngine;
use cycle_engine::application::webhooks::WebhookHandler;
use cycle_engine::config::EngineConfig;
use cycle_engine::domain::contribution::ContributionReceived;
use cycle_engine::domain::ledger::RunReport;
use cycle_engine::domain::ports::{CycleStore, DatastoreBox, PaymentAdapterBox};
use cycle_engine::error::EngineError;
use cycle_engine::infrastructure::in_memory::InMemoryDatastore;
use cycle_engine::infrastructure::simulated::{
    RecordingAlertSink, RecordingNotifier, RecordingScoreService, SimulatedPaymentAdapter,
};
use cycle_engine::interfaces::csv::contribution_reader::ContributionReader;
use cycle_engine::interfaces::csv::cycle_writer::CycleWriter;
use cycle_engine::interfaces::seed::SeedState;
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Runs the cycle progression engine over a seeded set of circles.
///
/// For every `--at` instant, in order, contributions received by then are
/// delivered through the webhook and one engine run is executed. The final
/// state of every seeded cycle is written to stdout as CSV.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Seed JSON with circles, members, payout orders and cycles
    seed: PathBuf,

    /// Contributions CSV (cycle_id, user_id, amount, transaction_id, received_at)
    #[arg(long)]
    contributions: Option<PathBuf>,

    /// Engine configuration TOML
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Run instants (RFC 3339). Defaults to the current time.
    #[arg(long = "at")]
    at: Vec<DateTime<Utc>>,

    /// Write the run reports as JSON to this file
    #[arg(long)]
    report: Option<PathBuf>,

    /// Make the simulated payment provider reject every payout
    #[arg(long)]
    fail_payouts: bool,
}

fn open_store(db_path: Option<PathBuf>) -> Result<DatastoreBox> {
    match db_path {
        #[cfg(feature = "storage-rocksdb")]
        Some(path) => {
            let store = cycle_engine::infrastructure::rocksdb::RocksDBStore::open(path)
                .into_diagnostic()?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "storage-rocksdb"))]
        Some(_) => miette::bail!("--db-path requires the storage-rocksdb feature"),
        None => Ok(Arc::new(InMemoryDatastore::new())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cycle_engine=info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path).into_diagnostic()?,
        None => EngineConfig::default(),
    };

    let store = open_store(cli.db_path)?;
    let seed = SeedState::load(&cli.seed).into_diagnostic()?;
    let circle_ids: Vec<_> = seed.circles.iter().map(|c| c.id).collect();
    seed.apply(store.as_ref()).await.into_diagnostic()?;

    let payments: PaymentAdapterBox = if cli.fail_payouts {
        Arc::new(SimulatedPaymentAdapter::always_failing())
    } else {
        Arc::new(SimulatedPaymentAdapter::settling())
    };
    let engine = CycleEngine::new(
        store.clone(),
        payments,
        Arc::new(RecordingNotifier::new()),
        Arc::new(RecordingScoreService::new()),
        Arc::new(RecordingAlertSink::new()),
        config,
    );

    let mut pending: Vec<ContributionReceived> = Vec::new();
    if let Some(path) = cli.contributions {
        let file = File::open(path).into_diagnostic()?;
        for payload in ContributionReader::new(file).contributions() {
            match payload {
                Ok(payload) => pending.push(payload),
                Err(e) => tracing::error!(error = %e, "skipping unreadable contribution"),
            }
        }
        pending.sort_by_key(|p| p.received_at);
    }

    let mut instants = cli.at;
    if instants.is_empty() {
        instants.push(Utc::now());
    }
    instants.sort();

    let mut reports: Vec<RunReport> = Vec::new();
    for at in instants {
        let due = pending.partition_point(|p| p.received_at <= at);
        let webhook = WebhookHandler::new(engine.context());
        // Payloads for cycles that have not started yet wait for a later run.
        let mut deferred = Vec::new();
        for payload in pending.drain(..due).collect::<Vec<_>>() {
            let transaction_id = payload.transaction_id.clone();
            match webhook.process_contribution_received(payload.clone(), at).await {
                Ok(_) => {}
                Err(EngineError::NotFound { .. }) => deferred.push(payload),
                Err(e) => tracing::error!(%transaction_id, error = %e, "contribution rejected"),
            }
        }
        pending.splice(0..0, deferred);
        reports.push(engine.run_at(at).await.into_diagnostic()?);
    }
    for payload in &pending {
        tracing::warn!(transaction_id = %payload.transaction_id, "contribution never delivered");
    }

    if let Some(path) = cli.report {
        let file = File::create(path).into_diagnostic()?;
        serde_json::to_writer_pretty(file, &reports).into_diagnostic()?;
    }

    let mut cycles = Vec::new();
    for circle_id in circle_ids {
        cycles.extend(store.cycles_for_circle(circle_id).await.into_diagnostic()?);
    }
    let stdout = io::stdout();
    let mut writer = CycleWriter::new(stdout.lock());
    writer.write_cycles(&cycles).into_diagnostic()?;

    Ok(())
}

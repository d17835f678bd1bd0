//! resmon-store - persistence and maintenance for resmon metric stores.
//!
//! `ingest` reads the JSON-lines bus from stdin into the store, `prune` runs
//! one compaction pass, `query` prints stored records as JSON lines.

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use resmon_core::bus::{MetricReader, MetricWriter};
use resmon_core::retention::{PruneReport, RetentionConfig, RetentionEngine};
use resmon_core::storage::{DiskStore, MetricKind, MetricStore, StoreError};
use resmon_core::util::{format_millis, now_millis, parse_millis};

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "resmon-store", about = "Persist and maintain resmon metric stores", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Store directory.
    #[arg(long, global = true, default_value = "./data")]
    data_dir: PathBuf,

    /// Hours a record stays at full resolution.
    #[arg(long, global = true, default_value = "12")]
    raw_hours: u32,

    /// Hours of one-minute resolution before records fold into hourly ones.
    #[arg(long, global = true, default_value = "12")]
    minute_hours: u32,

    /// Do not prune when the store is opened.
    #[arg(long, global = true)]
    no_auto_prune: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read JSON-lines records from stdin and persist them.
    Ingest,

    /// Run one prune pass now.
    Prune {
        /// Output the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print stored records of one kind as JSON lines.
    Query {
        /// Metric kind (cpu, cpu_core, memory, network, processes, system_metrics,
        /// system_constants).
        #[arg(long)]
        kind: MetricKind,

        /// Range start: epoch ms, -1h, 2026-02-07T17:00:00 or 2026-02-07:17:00.
        #[arg(long, default_value = "-1h", allow_hyphen_values = true)]
        from: String,

        /// Range end (exclusive), same formats as --from. Defaults to now.
        #[arg(long, allow_hyphen_values = true)]
        to: Option<String>,
    },
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["resmon_store", "resmon_core"] {
        if let Ok(directive) = format!("{target}={level}").parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    // prune runs its own pass and reports it
    let auto_prune = !cli.no_auto_prune && !matches!(cli.command, Command::Prune { .. });
    let config = RetentionConfig::new(cli.raw_hours, cli.minute_hours, auto_prune);

    let store = match DiskStore::open(&cli.data_dir) {
        Ok(s) => s,
        Err(e) => {
            error!("Cannot open store at {}: {}", cli.data_dir.display(), e);
            std::process::exit(1);
        }
    };
    let mut engine = RetentionEngine::new(store, config);

    let result = match &cli.command {
        Command::Ingest => ingest(&mut engine, io::stdin().lock()).map(|stats| {
            info!(
                "Ingested {} records ({} rejected, {} undecodable lines)",
                stats.persisted, stats.rejected, stats.skipped
            );
        }),
        Command::Prune { json } => {
            let report = engine.prune();
            print_report(&report, *json);
            Ok(())
        }
        Command::Query { kind, from, to } => {
            let now = now_millis();
            match query_range(from, to.as_deref(), now) {
                Ok((earliest, latest)) => {
                    query(&engine, *kind, earliest, latest, io::stdout().lock())
                }
                Err(e) => {
                    error!("{}", e);
                    std::process::exit(2);
                }
            }
        }
    };

    if let Err(e) = result {
        error!("{}", e);
    }

    let mut store = engine.into_store();
    if let Err(e) = store.flush() {
        error!("Failed to flush store: {}", e);
    }
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Bus(#[from] resmon_core::bus::BusError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

// ── ingest ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default, PartialEq)]
struct IngestStats {
    persisted: u64,
    rejected: u64,
    skipped: u64,
}

fn ingest<S: MetricStore>(
    engine: &mut RetentionEngine<S>,
    input: impl BufRead,
) -> Result<IngestStats, CliError> {
    let mut reader = MetricReader::new(input);
    let mut stats = IngestStats::default();

    for item in reader.by_ref() {
        let metric = item?;
        if engine.persist(&metric) {
            stats.persisted += 1;
        } else {
            stats.rejected += 1;
        }
    }

    stats.skipped = reader.skipped();
    Ok(stats)
}

// ── prune ────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct WindowJson {
    kind: String,
    tier: String,
    earliest: String,
    latest: String,
    rows_read: usize,
    rows_written: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct PruneJson {
    now: String,
    rows_read: usize,
    rows_written: usize,
    failures: usize,
    windows: Vec<WindowJson>,
}

fn report_to_json(report: &PruneReport) -> PruneJson {
    PruneJson {
        now: format_millis(report.now),
        rows_read: report.rows_read(),
        rows_written: report.rows_written(),
        failures: report.failures(),
        windows: report
            .windows
            .iter()
            .map(|w| WindowJson {
                kind: w.kind.to_string(),
                tier: w.tier.to_string(),
                earliest: format_millis(w.earliest),
                latest: format_millis(w.latest),
                rows_read: w.rows_read,
                rows_written: w.rows_written,
                error: w.error.clone(),
            })
            .collect(),
    }
}

fn print_report(report: &PruneReport, json: bool) {
    if json {
        match serde_json::to_string_pretty(&report_to_json(report)) {
            Ok(s) => println!("{s}"),
            Err(e) => error!("Failed to render report: {}", e),
        }
        return;
    }

    println!("Prune at {}", format_millis(report.now));
    for w in &report.windows {
        let status = match &w.error {
            Some(e) => format!("FAILED: {e}"),
            None => "ok".to_string(),
        };
        println!(
            "  {:<16} {:<8} {} .. {}  {} -> {} rows  {}",
            w.kind.as_str(),
            w.tier.to_string(),
            format_millis(w.earliest),
            format_millis(w.latest),
            w.rows_read,
            w.rows_written,
            status
        );
    }
    println!(
        "  Total: {} rows read, {} written, {} failed windows",
        report.rows_read(),
        report.rows_written(),
        report.failures()
    );
    if report.failures() > 0 {
        warn!("{} windows rolled back, they are retried on the next prune", report.failures());
    }
}

// ── query ────────────────────────────────────────────────────────────────────

/// Resolves `--from`/`--to` into a half-open range.
fn query_range(from: &str, to: Option<&str>, now: i64) -> Result<(i64, i64), String> {
    let earliest = parse_millis(from, now).map_err(|e| e.to_string())?;
    let latest = match to {
        Some(t) => parse_millis(t, now).map_err(|e| e.to_string())?,
        None => now,
    };
    if earliest >= latest {
        return Err(format!(
            "empty range: {} is not before {}",
            format_millis(earliest),
            format_millis(latest)
        ));
    }
    Ok((earliest, latest))
}

fn query<S: MetricStore>(
    engine: &RetentionEngine<S>,
    kind: MetricKind,
    earliest: i64,
    latest: i64,
    output: impl Write,
) -> Result<(), CliError> {
    let metrics = engine.metrics_in_range(kind, earliest, latest)?;
    let mut writer = MetricWriter::new(output);
    writer.write_all(&metrics)?;
    writer.flush()?;
    info!(
        "{} {} records between {} and {}",
        metrics.len(),
        kind,
        format_millis(earliest),
        format_millis(latest)
    );
    Ok(())
}

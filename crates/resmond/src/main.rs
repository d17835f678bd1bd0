//! resmond - host resource metrics collector daemon.
//!
//! Samples /proc and /sys on a schedule and persists the records into
//! a self-compacting store, or streams them as JSON lines on stdout.

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Releases unused memory back to the operating system.
/// Uses jemalloc's arena purge to reduce RSS after a prune rewrote segments.
fn release_memory_to_os() {
    // SAFETY: We're calling jemalloc's mallctl with valid arguments.
    // arena.0.purge tells jemalloc to return unused pages to the OS.
    unsafe {
        tikv_jemalloc_sys::mallctl(
            c"arena.0.purge".as_ptr().cast(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            0,
        );
    }
}

use std::collections::BTreeMap;
use std::io::{self, Stdout};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use resmon_core::bus::MetricWriter;
use resmon_core::collector::{Collector, CollectorConfig, RealFs};
use resmon_core::retention::{RetentionConfig, RetentionEngine};
use resmon_core::scheduler::Scheduler;
use resmon_core::storage::{DiskStore, Metric, MetricKind};
use resmon_core::util::{format_millis, now_millis};

/// Host resource metrics collector daemon.
#[derive(Parser, Debug)]
#[command(name = "resmond", about = "Host resource metrics collector daemon", version)]
struct Args {
    /// Collection interval in seconds.
    #[arg(short, long, default_value = "10", value_parser = clap::value_parser!(u64).range(1..))]
    interval: u64,

    /// Delay the first sample by this many extra seconds.
    #[arg(long, default_value = "0")]
    start_delay: u32,

    /// Output directory for storing metrics.
    #[arg(short, long, default_value = "./data")]
    output_dir: String,

    /// Path to /proc filesystem (for testing/mocking).
    #[arg(long, default_value = "/proc")]
    proc_path: String,

    /// Path to /sys filesystem.
    #[arg(long, default_value = "/sys")]
    sys_path: String,

    /// Write records as JSON lines to stdout instead of persisting them.
    #[arg(long)]
    stdout: bool,

    /// Report physical cores when every core runs two hyperthreads.
    #[arg(long)]
    physical_cores: bool,

    /// Hours a record stays at full resolution.
    #[arg(long, default_value = "12")]
    raw_hours: u32,

    /// Hours of one-minute resolution before records fold into hourly ones.
    #[arg(long, default_value = "12")]
    minute_hours: u32,

    /// Do not prune when the store is opened.
    #[arg(long)]
    no_auto_prune: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
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
    for target in ["resmond", "resmon_core"] {
        if let Ok(directive) = format!("{target}={level}").parse() {
            filter = filter.add_directive(directive);
        }
    }

    // Logs go to stderr so --stdout output stays clean
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

/// Describes the contents of a poll batch for logging.
fn describe_batch(metrics: &[Metric]) -> String {
    let mut counts: BTreeMap<MetricKind, usize> = BTreeMap::new();
    for metric in metrics {
        *counts.entry(metric.kind()).or_default() += 1;
    }

    counts
        .into_iter()
        .map(|(kind, n)| format!("{n} {kind}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Where polled records go.
enum Sink {
    Stdout(MetricWriter<Stdout>),
    Store(RetentionEngine<DiskStore>),
}

impl Sink {
    /// Hands a batch over; returns how many records were accepted.
    fn accept(&mut self, metrics: &[Metric]) -> usize {
        match self {
            Sink::Stdout(writer) => {
                let result = writer.write_all(metrics).and_then(|()| writer.flush());
                match result {
                    Ok(()) => metrics.len(),
                    Err(e) => {
                        error!(error = %e, "failed to write records to stdout");
                        0
                    }
                }
            }
            Sink::Store(engine) => {
                let before = engine.next_prune_time();
                let accepted = metrics.iter().filter(|m| engine.persist(m)).count();
                if engine.next_prune_time() != before {
                    release_memory_to_os();
                    debug!("Memory released after prune");
                }
                accepted
            }
        }
    }

    fn close(self) {
        match self {
            Sink::Stdout(mut writer) => {
                if let Err(e) = writer.flush() {
                    error!(error = %e, "failed to flush stdout");
                }
            }
            Sink::Store(engine) => {
                let mut store = engine.into_store();
                match store.flush() {
                    Ok(()) => info!("Store flushed successfully"),
                    Err(e) => error!(error = %e, "failed to flush store on shutdown"),
                }
            }
        }
    }
}

fn open_sink(args: &Args) -> Result<Sink, String> {
    if args.stdout {
        return Ok(Sink::Stdout(MetricWriter::new(io::stdout())));
    }

    let store = DiskStore::open(&args.output_dir)
        .map_err(|e| format!("cannot open store at {}: {}", args.output_dir, e))?;
    info!("Storage initialized at {}", args.output_dir);

    let config = RetentionConfig::new(args.raw_hours, args.minute_hours, !args.no_auto_prune);
    Ok(Sink::Store(RetentionEngine::new(store, config)))
}

/// Sleeps until the scheduler says a sample is due, waking early when
/// `running` is cleared. A suspended schedule keeps waiting.
fn wait_until_due(scheduler: &Scheduler, running: &AtomicBool) {
    let sleep_interval = Duration::from_millis(100);
    while running.load(Ordering::SeqCst) {
        let sleep_time = match scheduler.remaining_at(now_millis()) {
            Some(left) if left.is_zero() => return,
            Some(left) => left.min(sleep_interval),
            None => sleep_interval,
        };
        std::thread::sleep(sleep_time);
    }
}

fn main() {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    info!("resmond {} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Config: interval={}s, output={}, proc={}, sys={}",
        args.interval,
        if args.stdout { "stdout" } else { args.output_dir.as_str() },
        args.proc_path,
        args.sys_path
    );
    if !args.stdout {
        info!(
            "Retention policy: raw={}h, minute={}h, auto_prune={}",
            args.raw_hours, args.minute_hours, !args.no_auto_prune
        );
    }

    let config = CollectorConfig {
        proc_path: args.proc_path.clone().into(),
        sys_path: args.sys_path.clone().into(),
        physical_cores: args.physical_cores,
    };
    let mut collector = match Collector::new(RealFs::new(), config) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to read system constants: {}", e);
            std::process::exit(1);
        }
    };

    let mut sink = match open_sink(&args) {
        Ok(s) => s,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let constants = Metric::SystemConstants(collector.constants().clone());
    if sink.accept(std::slice::from_ref(&constants)) == 0 {
        warn!("System constants were not recorded");
    }

    let scheduler = Scheduler::new(args.interval);
    scheduler.start();
    if args.start_delay > 0 {
        scheduler.pause(i64::from(args.start_delay));
    }

    // Setup graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    let mut poll_count: u64 = 0;
    info!("Starting collection loop");

    loop {
        wait_until_due(&scheduler, &running);
        if !running.load(Ordering::SeqCst) {
            break;
        }

        scheduler.mark_produced();
        let metrics = collector.poll();
        poll_count += 1;
        let accepted = sink.accept(&metrics);

        info!(
            "Poll #{}: {} ({} of {} records accepted)",
            poll_count,
            describe_batch(&metrics),
            accepted,
            metrics.len()
        );

        if let Sink::Store(engine) = &sink
            && poll_count.is_multiple_of(60)
        {
            info!(
                "Next prune at {}",
                format_millis(engine.next_prune_time())
            );
        }
    }

    // Graceful shutdown
    info!("Shutting down...");
    sink.close();
    info!("Shutdown complete");
}

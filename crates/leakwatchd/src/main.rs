//! leakwatchd - heap growth observer daemon.
//!
//! Runs the memory monitor inside this process, logs per-cycle samples and
//! periodic leak reports, and exits on Ctrl-C or when the monitor closes.

use leakwatch_core::runtime::CountingAlloc;
use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: CountingAlloc<Jemalloc> = CountingAlloc::new(Jemalloc);

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use crossbeam::channel::{self, Receiver};
use crossbeam::select;
use tracing::{Dispatch, Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use leakwatch_core::fmt::format_bytes;
use leakwatch_core::runtime::SweepRuntime;
use leakwatch_core::{ClassifierConfig, LeakReport, MonitorBuilder, MonitorConfig, ReportCadence};

/// Heap growth observer daemon.
#[derive(Parser)]
#[command(name = "leakwatchd", about = "Heap growth observer daemon", version)]
struct Args {
    /// Time between collection cycles in milliseconds.
    #[arg(long, env = "LEAKWATCH_SWEEP_MS", default_value = "1000")]
    sweep_interval_ms: u64,

    /// Number of snapshots retained for leak classification.
    #[arg(long, env = "LEAKWATCH_HISTORY", default_value = "120")]
    history_size: usize,

    /// Emit a leak report every N collection cycles.
    #[arg(long, env = "LEAKWATCH_REPORT_EVERY", default_value = "10")]
    report_every: u32,

    /// Emit a leak report every N seconds instead of every N cycles.
    #[arg(long, env = "LEAKWATCH_REPORT_SECS", conflicts_with = "report_every")]
    report_interval: Option<u64>,

    /// Hourly growth at which a leak is suspected (e.g., "10M", "512K").
    #[arg(long, env = "LEAKWATCH_LEAK_THRESHOLD", default_value = "10M", value_parser = parse_size)]
    leak_threshold: u64,

    /// Hourly growth tolerated as stable (e.g., "64K").
    #[arg(long, env = "LEAKWATCH_TOLERANCE", default_value = "64K", value_parser = parse_size)]
    stable_tolerance: u64,

    /// Collections a window must span before a leak can be suspected.
    #[arg(long, env = "LEAKWATCH_MIN_COLLECTIONS", default_value = "10")]
    min_collections: u32,

    /// Housekeeping tick interval in seconds.
    #[arg(long, default_value = "1")]
    tick: u64,

    /// Allocate and retain memory on every tick to exercise leak detection.
    #[arg(long)]
    demo_leak: bool,

    /// Print every leak report to stdout as JSON.
    #[arg(long)]
    json_reports: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn monitor_config(&self) -> MonitorConfig {
        let report_cadence = match self.report_interval {
            Some(secs) => ReportCadence::Every(Duration::from_secs(secs)),
            None => ReportCadence::EveryCycles(self.report_every),
        };

        MonitorConfig {
            history_size: self.history_size,
            report_cadence,
            classifier: ClassifierConfig {
                leak_threshold_per_hour: self.leak_threshold as f64,
                min_collections: self.min_collections,
                stable_tolerance_per_hour: self.stable_tolerance as f64,
                ..ClassifierConfig::default()
            },
            ..MonitorConfig::default()
        }
    }
}

/// Parses a human-readable size string (e.g., "1G", "500M", "1024K") into bytes.
fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }

    let (num_str, multiplier) = if let Some(num) = s.strip_suffix('G') {
        (num, 1024 * 1024 * 1024)
    } else if let Some(num) = s.strip_suffix('M') {
        (num, 1024 * 1024)
    } else if let Some(num) = s.strip_suffix('K') {
        (num, 1024)
    } else {
        (s, 1)
    };

    num_str
        .trim()
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| format!("invalid size '{}'", s))
}

/// Builds the logging sink. Default level is INFO; -q shows errors only.
fn build_dispatch(verbose: u8, quiet: bool) -> Result<Dispatch, String> {
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
    for target in ["leakwatchd", "leakwatch_core"] {
        let directive = format!("{}={}", target, level)
            .parse()
            .map_err(|e| format!("invalid log directive: {}", e))?;
        filter = filter.add_directive(directive);
    }

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    Ok(Dispatch::new(subscriber))
}

/// Forwards Ctrl-C into a channel usable with `select!`.
fn interrupt_channel() -> Receiver<()> {
    let (tx, rx) = channel::bounded(1);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = tx.try_send(());
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }
    rx
}

fn print_report(report: &LeakReport) {
    match serde_json::to_string(report) {
        Ok(json) => println!("{}", json),
        Err(e) => error!("Failed to serialize leak report: {}", e),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let dispatch = match build_dispatch(args.verbose, args.quiet) {
        Ok(dispatch) => dispatch,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    if tracing::dispatcher::set_global_default(dispatch.clone()).is_err() {
        eprintln!("logging already initialized");
    }

    info!("leakwatchd {} starting", env!("CARGO_PKG_VERSION"));
    let config = args.monitor_config();
    info!(
        "Config: sweep={}ms, history={}, cadence={:?}, threshold={}/h, tolerance={}/h",
        args.sweep_interval_ms,
        config.history_size,
        config.report_cadence,
        format_bytes(args.leak_threshold),
        format_bytes(args.stable_tolerance),
    );

    let interval = Duration::from_millis(args.sweep_interval_ms.max(1));
    let runtime = match SweepRuntime::start(&GLOBAL, interval) {
        Ok(runtime) => Arc::new(runtime),
        Err(e) => {
            error!("Failed to start sweeper: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let (report_tx, report_rx) = channel::bounded::<LeakReport>(16);
    let monitor = match MonitorBuilder::new(runtime)
        .with_config(config)
        .with_dispatch(dispatch)
        .with_reports(report_tx)
        .spawn()
    {
        Ok(monitor) => monitor,
        Err(e) => {
            error!("Failed to start monitor: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let interrupt = interrupt_channel();
    let ticker = channel::tick(Duration::from_secs(args.tick.max(1)));
    let closed = monitor.closed();
    let mut junk: Vec<Vec<u8>> = Vec::new();
    let mut retained: u64 = 0;

    let code = loop {
        select! {
            recv(interrupt) -> _ => {
                info!("Received shutdown signal");
                break ExitCode::SUCCESS;
            }
            recv(closed.receiver()) -> _ => {
                warn!("Monitor closed unexpectedly");
                break ExitCode::FAILURE;
            }
            recv(report_rx) -> report => {
                if let Ok(report) = report
                    && args.json_reports
                {
                    print_report(&report);
                }
            }
            recv(ticker) -> _ => {
                if args.demo_leak {
                    junk.push(vec![1u8; 64 * 1024]);
                    retained += 64 * 1024;
                }
                debug!("tick, retained {}", format_bytes(retained));
            }
        }
    };

    info!("Shutting down...");
    monitor.close();
    if !closed.wait_timeout(Duration::from_secs(2)) {
        warn!("Monitor did not close in time");
    }
    info!("Shutdown complete");
    code
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_accepts_suffixes() {
        assert_eq!(parse_size("1G"), Ok(1024 * 1024 * 1024));
        assert_eq!(parse_size("10M"), Ok(10 * 1024 * 1024));
        assert_eq!(parse_size(" 64K "), Ok(64 * 1024));
        assert_eq!(parse_size("4096"), Ok(4096));
    }

    #[test]
    fn parse_size_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("tenM").is_err());
        assert!(parse_size("99999999999999G").is_err());
    }

    #[test]
    fn monitor_config_from_args() {
        let args = Args::parse_from([
            "leakwatchd",
            "--history-size",
            "30",
            "--report-interval",
            "60",
            "--leak-threshold",
            "1M",
            "--min-collections",
            "3",
        ]);
        let config = args.monitor_config();

        assert_eq!(config.history_size, 30);
        assert_eq!(
            config.report_cadence,
            ReportCadence::Every(Duration::from_secs(60))
        );
        assert_eq!(config.classifier.leak_threshold_per_hour, 1024.0 * 1024.0);
        assert_eq!(config.classifier.min_collections, 3);
        assert_eq!(config.classifier.stable_tolerance_per_hour, 64.0 * 1024.0);
    }

    #[test]
    fn monitor_config_defaults_to_cycle_cadence() {
        let args = Args::parse_from(["leakwatchd"]);
        assert_eq!(
            args.monitor_config().report_cadence,
            ReportCadence::EveryCycles(10)
        );
    }
}

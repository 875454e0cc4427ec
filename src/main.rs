//! hits CLI - transfer bandwidth benchmark
//!
//! Launches any number of concurrent transfers and prints the bandwidth of
//! each one.
//!
//! # Examples
//!
//! ```text
//! hits --htod 0 --dtoh 1
//! hits --dtod 0,1 --iter 50 --size 268435456
//! hits --simulate 4 --htod 0 --htod 1 --dtod 2,3
//! hits --htod 0 -v --log-json --log-file hits.jsonl
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser};
use hits::backend::simulated::SimulatedRuntime;
use hits::backend::{detect_runtime, DeviceId, DeviceRuntime};
use hits::config::{
    parse_device_pair, LoggingConfig, RunConfig, TransferRequest, DEFAULT_ITERATIONS,
    DEFAULT_TRANSFER_SIZE,
};
use hits::logging::{self, LogLevel};
use hits::{Bench, Result};

/// hits - Host and device Interconnect Transfer Speed
///
/// Transfers given on the command line run concurrently, in the order they
/// are given, each on its own stream.
#[derive(Parser, Debug)]
#[command(name = "hits")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Device to host transfer with the given device (repeatable)
    #[arg(long, value_name = "ID")]
    dtoh: Vec<u32>,

    /// Host to device transfer with the given device (repeatable)
    #[arg(long, value_name = "ID")]
    htod: Vec<u32>,

    /// Peer transfer from the second device into the first (repeatable)
    #[arg(long, value_name = "DST,SRC", value_parser = parse_pair)]
    dtod: Vec<(DeviceId, DeviceId)>,

    /// Iterations per transfer
    #[arg(long = "iter", value_name = "N", default_value_t = DEFAULT_ITERATIONS)]
    iterations: u64,

    /// Bytes per copy (at most 1 GiB)
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_TRANSFER_SIZE)]
    size: usize,

    /// Do not place host buffers on the device's NUMA node
    #[arg(long)]
    disable_numa_affinity: bool,

    /// Use pageable instead of pinned host memory
    #[arg(long)]
    disable_pinned_memory: bool,

    /// Run on a simulated machine with this many fully connected devices
    #[arg(long, value_name = "DEVICES")]
    simulate: Option<u32>,

    /// Log setup and timing details to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Also append diagnostics to this file
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Write diagnostics as one JSON object per line
    #[arg(long)]
    log_json: bool,
}

fn parse_pair(text: &str) -> std::result::Result<(DeviceId, DeviceId), String> {
    parse_device_pair(text).map_err(|e| e.to_string())
}

/// Transfers in command-line order across all three flags.
fn ordered_transfers(cli: &Cli, matches: &ArgMatches) -> Vec<TransferRequest> {
    let mut indexed: Vec<(usize, TransferRequest)> = Vec::new();

    if let Some(indices) = matches.indices_of("dtoh") {
        indexed.extend(
            indices.zip(cli.dtoh.iter().map(|&d| TransferRequest::device_to_host(d))),
        );
    }
    if let Some(indices) = matches.indices_of("htod") {
        indexed.extend(
            indices.zip(cli.htod.iter().map(|&d| TransferRequest::host_to_device(d))),
        );
    }
    if let Some(indices) = matches.indices_of("dtod") {
        indexed.extend(
            indices.zip(
                cli.dtod
                    .iter()
                    .map(|&(dst, src)| TransferRequest::device_to_device(dst, src)),
            ),
        );
    }

    indexed.sort_by_key(|(index, _)| *index);
    indexed.into_iter().map(|(_, request)| request).collect()
}

fn build_config(cli: &Cli, matches: &ArgMatches) -> Result<RunConfig> {
    let mut builder = RunConfig::builder()
        .iterations(cli.iterations)
        .transfer_size(cli.size)
        .numa_aware(!cli.disable_numa_affinity)
        .pinned(!cli.disable_pinned_memory)
        .logging(LoggingConfig {
            enabled: true,
            level: if cli.verbose {
                LogLevel::Debug
            } else {
                LogLevel::Warn
            },
            log_file: cli.log_file.clone(),
            json_format: cli.log_json,
        });

    for request in ordered_transfers(cli, matches) {
        builder = builder.transfer(request);
    }
    builder.build()
}

async fn run(cli: Cli, matches: &ArgMatches) -> Result<()> {
    let config = build_config(&cli, matches)?;
    let logger = logging::configure(&config.logging);

    let runtime: Arc<dyn DeviceRuntime> = match cli.simulate {
        Some(devices) => Arc::new(SimulatedRuntime::fully_connected(devices)),
        None => Arc::from(detect_runtime()?),
    };

    let report = Bench::new(runtime).run(&config).await?;

    if cli.verbose {
        if let Ok(logger) = logger.lock() {
            if let Ok(metrics) = logger.metrics() {
                eprint!("{}", metrics.generate_report());
            }
            logger.flush();
        }
    }

    hits::log_info!(
        "main",
        "{} heartbeats, aggregate {:.3} GB/s",
        report.heartbeats,
        report.aggregate_gbps()
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    let matches = Cli::command().get_matches();
    let cli = match Cli::from_arg_matches(&matches) {
        Ok(cli) => cli,
        Err(e) => e.exit(),
    };

    if let Err(e) = run(cli, &matches).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hits::TransferKind;

    fn parse(args: &[&str]) -> (Cli, ArgMatches) {
        let matches = Cli::command().try_get_matches_from(args).unwrap();
        let cli = Cli::from_arg_matches(&matches).unwrap();
        (cli, matches)
    }

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn order_is_preserved_across_flags() {
        let (cli, matches) = parse(&[
            "hits", "--htod", "0", "--dtod", "1,0", "--dtoh", "2", "--htod", "3",
        ]);
        let kinds: Vec<_> = ordered_transfers(&cli, &matches)
            .iter()
            .map(|r| (r.kind, r.device.0))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (TransferKind::HostToDevice, 0),
                (TransferKind::DeviceToDevice, 1),
                (TransferKind::DeviceToHost, 2),
                (TransferKind::HostToDevice, 3),
            ]
        );
    }

    #[test]
    fn defaults() {
        let (cli, matches) = parse(&["hits", "--dtoh", "0"]);
        let config = build_config(&cli, &matches).unwrap();
        assert_eq!(config.iterations, 100);
        assert_eq!(config.transfer_size, 1 << 30);
        assert!(config.alloc.numa_aware && config.alloc.pinned);
    }

    #[test]
    fn flags_disable_placement() {
        let (cli, matches) = parse(&[
            "hits",
            "--htod",
            "0",
            "--disable-numa-affinity",
            "--disable-pinned-memory",
            "--iter",
            "5",
            "--size",
            "4096",
        ]);
        let config = build_config(&cli, &matches).unwrap();
        assert!(!config.alloc.numa_aware);
        assert!(!config.alloc.pinned);
        assert_eq!(config.iterations, 5);
        assert_eq!(config.transfer_size, 4096);
    }

    #[test]
    fn logging_flags() {
        let (cli, matches) = parse(&["hits", "--htod", "0"]);
        let logging = build_config(&cli, &matches).unwrap().logging;
        assert_eq!(logging.level, LogLevel::Warn);
        assert!(!logging.json_format);
        assert!(logging.log_file.is_none());

        let (cli, matches) = parse(&[
            "hits",
            "--htod",
            "0",
            "-v",
            "--log-json",
            "--log-file",
            "/tmp/hits.log",
        ]);
        let logging = build_config(&cli, &matches).unwrap().logging;
        assert_eq!(logging.level, LogLevel::Debug);
        assert!(logging.json_format);
        assert_eq!(logging.log_file, Some(PathBuf::from("/tmp/hits.log")));
    }

    #[test]
    fn no_transfer_is_an_error() {
        let (cli, matches) = parse(&["hits"]);
        assert!(build_config(&cli, &matches).is_err());
    }

    #[test]
    fn oversized_transfer_is_an_error() {
        let (cli, matches) = parse(&["hits", "--htod", "0", "--size", "1073741825"]);
        assert!(build_config(&cli, &matches).is_err());
    }

    #[test]
    fn malformed_pair_is_rejected_by_the_parser() {
        assert!(Cli::command()
            .try_get_matches_from(["hits", "--dtod", "0,1,2"])
            .is_err());
        assert!(Cli::command()
            .try_get_matches_from(["hits", "--htod", "-1"])
            .is_err());
    }
}

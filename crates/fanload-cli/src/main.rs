//! fanload: concurrent batch-ingestion load against an embedded database.
//!
//! Fans a fixed number of batch-insert tasks out over a small worker pool,
//! each on its own duplicated connection, then verifies the final row count
//! and key range through the root connection.

use std::ffi::OsString;
use std::io::{self, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use fanload_engine::EngineConfig;
use fanload_error::HarnessError;
use fanload_harness::run::default_engine_threads;
use fanload_harness::{RunConfig, RunContext, RunReport};
use tracing_subscriber::EnvFilter;

fn main() {
    let exit_code = run_cli(std::env::args_os());
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}

/// A fully parsed command line.
#[derive(Debug)]
enum Command {
    Help,
    Run(CliOptions),
}

#[derive(Debug)]
struct CliOptions {
    config: RunConfig,
    json: bool,
    verbose: bool,
}

fn run_cli<I>(os_args: I) -> i32
where
    I: IntoIterator<Item = OsString>,
{
    let raw: Vec<String> = os_args
        .into_iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    let tail = if raw.len() > 1 { &raw[1..] } else { &[] };

    match parse_args(tail) {
        Ok(Command::Help) => {
            print_help();
            0
        }
        Ok(Command::Run(options)) => cmd_run(options),
        Err(message) => {
            eprintln!("error: {message}");
            eprintln!("run `fanload --help` for usage");
            2
        }
    }
}

// ── Argument parsing ───────────────────────────────────────────────────

fn parse_args(argv: &[String]) -> Result<Command, String> {
    let mut config = RunConfig::default();
    let mut json = false;
    let mut verbose = false;

    let mut i = 0;
    while i < argv.len() {
        let flag = argv[i].as_str();
        match flag {
            "-h" | "--help" => return Ok(Command::Help),
            "--connection-threads" => {
                config.connection_threads = positive(flag, value(argv, &mut i, flag)?)?;
            }
            "--db-threads" => {
                let threads: u32 = positive(flag, value(argv, &mut i, flag)?)?;
                config.engine.threads = Some(threads);
            }
            "--batches" => config.num_batches = positive(flag, value(argv, &mut i, flag)?)?,
            "--batch-size" => config.batch_size = positive(flag, value(argv, &mut i, flag)?)?,
            "--max-connections" => {
                config.engine.max_connections = positive(flag, value(argv, &mut i, flag)?)?;
            }
            "--deadline-secs" => {
                let secs: u64 = positive(flag, value(argv, &mut i, flag)?)?;
                config.deadline = Some(Duration::from_secs(secs));
            }
            "--progress-interval" => {
                let raw = value(argv, &mut i, flag)?;
                config.progress_interval = raw
                    .parse::<i64>()
                    .ok()
                    .filter(|n| *n >= 0)
                    .ok_or_else(|| format!("invalid non-negative integer for {flag}: `{raw}`"))?;
            }
            "--db" => config.db_path = PathBuf::from(value(argv, &mut i, flag)?),
            "--table" => config.table = value(argv, &mut i, flag)?.to_owned(),
            "--option" => {
                let raw = value(argv, &mut i, flag)?;
                let (key, val) = raw
                    .split_once('=')
                    .ok_or_else(|| format!("{flag} expects KEY=VALUE, got `{raw}`"))?;
                config.engine = apply_engine_option(config.engine, key, val)?;
            }
            "--keep-existing" => config.fresh_database = false,
            "--json" => json = true,
            "-v" | "--verbose" => verbose = true,
            other => return Err(format!("unknown option `{other}`")),
        }
        i += 1;
    }

    Ok(Command::Run(CliOptions {
        config,
        json,
        verbose,
    }))
}

/// Advance past `flag` and return its argument.
fn value<'a>(argv: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, String> {
    *i += 1;
    argv.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{flag} requires an argument"))
}

fn positive<T>(flag: &str, raw: &str) -> Result<T, String>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    raw.parse::<T>()
        .ok()
        .filter(|n| *n > T::default())
        .ok_or_else(|| format!("invalid positive integer for {flag}: `{raw}`"))
}

fn apply_engine_option(engine: EngineConfig, key: &str, val: &str) -> Result<EngineConfig, String> {
    engine.with_option(key, val).map_err(|e| e.to_string())
}

// ── Run ────────────────────────────────────────────────────────────────

fn cmd_run(options: CliOptions) -> i32 {
    init_tracing(options.verbose);
    let CliOptions { config, json, .. } = options;

    if !json {
        print_banner(&config);
    }
    tracing::debug!(?config, "resolved run configuration");

    let context = match RunContext::new(config) {
        Ok(context) => context,
        Err(e) => {
            eprintln!("error: {e}");
            return 2;
        }
    };
    let report = match context.run() {
        Ok(report) => report,
        Err(e) => {
            eprintln!("error: run aborted: {e}");
            return 1;
        }
    };

    if json {
        match serde_json::to_string_pretty(&report) {
            Ok(text) => println!("{text}"),
            Err(e) => {
                eprintln!("error: failed to serialize report: {e}");
                return 1;
            }
        }
    } else {
        print_summary(&report);
    }

    match report.into_result() {
        Ok(_) => 0,
        Err(e @ HarnessError::TasksFailed { .. }) => {
            eprintln!("error: {e}; failed tasks: {:?}", e.failed_tasks());
            1
        }
        Err(e) => {
            eprintln!("error: {e}");
            1
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    // A subscriber may already be installed when driven from tests.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()),
        )
        .with_writer(io::stderr)
        .try_init();
}

fn print_banner(config: &RunConfig) {
    let cores = thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    let engine_threads = config.engine.threads.unwrap_or_else(default_engine_threads);
    println!("CPU cores: {cores}");
    println!("Connection threads: {}", config.connection_threads);
    println!("DB worker threads: {engine_threads}");
    println!("Batches count: {}", config.num_batches);
    println!("Batch size: {}", config.batch_size);
}

fn print_summary(report: &RunReport) {
    for failure in report.failures() {
        eprintln!("  {failure}");
    }
    if report.deadline_exceeded {
        eprintln!("run deadline elapsed; tasks not yet started were refused");
    }
    println!("Records inserted: {}", report.rows_visible());
}

fn print_help() {
    let text = "\
fanload: concurrent batch-ingestion load against an embedded database

USAGE:
    fanload [OPTIONS]

OPTIONS:
    --connection-threads <N>  Worker pool size (default: 2)
    --db-threads <N>          Engine-internal threads (default: half the CPU cores)
    --batches <N>             Number of batches, one task each (default: 256)
    --batch-size <N>          Rows per batch (default: 1024)
    --db <PATH>               Database file (default: test.db)
    --table <NAME>            Target table (default: tab1)
    --max-connections <N>     Engine connection limit, root included (default: 64)
    --deadline-secs <N>       Stop handing out connections after N seconds
    --progress-interval <N>   Log every N-th key; 0 disables (default: 10000)
    --option <KEY=VALUE>      Engine option: threads, busy_timeout_ms,
                              max_connections, journal_mode, synchronous
    --keep-existing           Reuse an existing database file
    --json                    Print the run report as JSON
    -v, --verbose             Debug logging (RUST_LOG overrides)
    -h, --help                Show this help message

EXIT STATUS:
    0  every batch committed and the table verified
    1  a task failed, verification mismatched, or the run aborted
    2  invalid arguments
";
    let _ = io::stdout().write_all(text.as_bytes());
}

// ── Tests ───────────────────────────────────────────────────────────────

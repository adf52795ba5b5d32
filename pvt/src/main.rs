//! Property Verification Toolkit - suite runner
//!
//! Runs verification suites against an instrumented control-system server
//! and inspects their configuration.

#![forbid(unsafe_code)]

mod output;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use pvt_common::{
    ClientCommand, HarnessResult, LogConfig, PollPolicy, PropertyAccess, PropertyAddress,
    PropertyMutator, ResolvedConfig, SuiteRunner, await_eventual_value, init_logging, plan,
};
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "pvt")]
#[command(author, version, about = "Property verification suite runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print machine-readable JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    /// Suite configuration file (TOML)
    #[arg(short, long, env = "PVT_CONFIG", global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the suite: start the server, exercise every scenario, tear down
    Run {
        /// Write the JSONL run journal into this directory
        #[arg(long)]
        journal_dir: Option<PathBuf>,
    },

    /// Print the expected counters for each scenario without running it
    Plan,

    /// Poll a property until it reaches a value
    Poll {
        /// Property address (FACILITY/DEVICE/LOCATION/PROPERTY)
        #[arg(short = 'c', long)]
        address: PropertyAddress,

        /// Value to wait for
        #[arg(short, long)]
        expected: String,

        /// Write this property first
        #[arg(long, requires = "value")]
        write: Option<PropertyAddress>,

        /// Value to write
        #[arg(long)]
        value: Option<String>,

        /// Maximum number of reads before the final one
        #[arg(long)]
        attempts: Option<u32>,

        /// Delay between reads in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,
    },

    /// Show the effective configuration and where each value came from
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let logging_guards = init_logging(&log_config)?;

    if let Err(e) = dispatch(cli) {
        // process::exit skips destructors; flush buffered events first.
        drop(logging_guards);
        eprintln!("{}", output::render_error(&e));
        std::process::exit(e.exit_code());
    }
    Ok(())
}

fn dispatch(cli: Cli) -> HarnessResult<()> {
    match cli.command {
        Commands::Run { journal_dir } => run_suite(cli.config, journal_dir, cli.json),
        Commands::Plan => show_plan(cli.config, cli.json),
        Commands::Poll {
            address,
            expected,
            write,
            value,
            attempts,
            interval_ms,
        } => poll(
            cli.config,
            PollRequest {
                address,
                expected,
                write: write.zip(value),
                attempts,
                interval: interval_ms.map(Duration::from_millis),
            },
            cli.json,
        ),
        Commands::Config => show_config(cli.config, cli.json),
    }
}

fn run_suite(
    config: Option<PathBuf>,
    journal_dir: Option<PathBuf>,
    json: bool,
) -> HarnessResult<()> {
    let resolved = ResolvedConfig::resolve(config.as_deref())?;
    let mut suite = resolved.suite;
    if journal_dir.is_some() {
        suite.journal_dir = journal_dir;
    }
    info!(
        scenarios = suite.scenarios.len(),
        server = %suite.server.executable.display(),
        "Running suite"
    );

    let (report, result) = SuiteRunner::new(suite).run();
    if json {
        println!("{}", output::to_json(&report)?);
    } else {
        print!("{}", output::render_report(&report));
    }
    result
}

fn show_plan(config: Option<PathBuf>, json: bool) -> HarnessResult<()> {
    let resolved = ResolvedConfig::resolve(config.as_deref())?;
    let expectations = plan(&resolved.suite.scenarios)?;
    if json {
        println!("{}", output::to_json(&expectations)?);
    } else {
        print!("{}", output::render_plan(&expectations));
    }
    Ok(())
}

struct PollRequest {
    address: PropertyAddress,
    expected: String,
    write: Option<(PropertyAddress, String)>,
    attempts: Option<u32>,
    interval: Option<Duration>,
}

fn poll(config: Option<PathBuf>, request: PollRequest, json: bool) -> HarnessResult<()> {
    let resolved = ResolvedConfig::resolve(config.as_deref())?;
    let client = &resolved.suite.client;
    let mutator = PropertyMutator::new(
        ClientCommand::from_argv(&client.put)?,
        ClientCommand::from_argv(&client.get)?,
    )
    .with_timeout(client.timeout);

    let defaults = resolved.suite.poll.policy();
    let policy = PollPolicy {
        max_attempts: request.attempts.unwrap_or(defaults.max_attempts),
        interval: request.interval.unwrap_or(defaults.interval),
    };

    if let Some((target, value)) = &request.write {
        let echoed = mutator.set(target, value)?;
        debug!(%target, %echoed, "Wrote property before polling");
    }
    let outcome = await_eventual_value(&mutator, &request.address, &request.expected, policy)?;
    if json {
        println!("{}", output::to_json(&outcome)?);
    } else {
        println!(
            "{} = {} after {} reads ({} ms)",
            outcome.address, outcome.value, outcome.reads, outcome.elapsed_ms
        );
    }
    Ok(())
}

fn show_config(config: Option<PathBuf>, json: bool) -> HarnessResult<()> {
    let resolved = ResolvedConfig::resolve(config.as_deref())?;
    if json {
        println!("{}", output::to_json(&resolved)?);
    } else {
        print!("{}", output::render_provenance(&resolved.provenance()));
        println!();
        print!("{}", resolved.suite.to_toml_string()?);
    }
    Ok(())
}

//! Stage-Harvest main entry point
//!
//! This is the command-line interface for the Stage-Harvest staged harvester.

use anyhow::Context;
use clap::Parser;
use stage_harvest::config::{load_config_with_hash, validate, Config};
use stage_harvest::output::{format_plan, load_statistics, print_run_report, print_statistics};
use stage_harvest::pipeline::{JOURNAL_FILE, RunOutcome};
use stage_harvest::storage::SqliteJournal;
use stage_harvest::{HarvestError, Pipeline, RunOptions, Shutdown};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Stage-Harvest: a resumable, polite, staged web harvester
///
/// Runs the customers → details → careers → jobs pipeline, honouring
/// robots.txt and a global rate limit, and resumes from the last checkpoint
/// unless told otherwise.
#[derive(Parser, Debug)]
#[command(name = "stage-harvest")]
#[command(version = "1.0.0")]
#[command(about = "A resumable, polite, staged web harvester", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Resume an interrupted run (default behavior)
    #[arg(long, conflicts_with = "fresh")]
    resume: bool,

    /// Start from the first stage, ignoring the checkpoint
    #[arg(long, conflicts_with = "resume")]
    fresh: bool,

    /// Re-process items already in the visited ledgers
    #[arg(long)]
    force: bool,

    /// Re-process items whose last outcome was a failure
    #[arg(long)]
    retry_failed: bool,

    /// Trust the existing output of this stage instead of running it (repeatable)
    #[arg(long, value_name = "STAGE")]
    skip: Vec<String>,

    /// Concurrent workers per stage
    #[arg(long)]
    workers: Option<usize>,

    /// Minimum seconds between any two requests
    #[arg(long, value_name = "SECONDS")]
    rate_limit: Option<f64>,

    /// Process at most this many items per stage
    #[arg(long, value_name = "N")]
    limit: Option<usize>,

    /// Fail the run when the seed stage yields fewer items than this
    #[arg(long, value_name = "N")]
    min_expected: Option<usize>,

    /// Directory for stage outputs, ledgers, checkpoint and journal
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Directory for per-run log files
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// JSON file with additional seed URLs
    #[arg(long)]
    seed_file: Option<PathBuf>,

    /// Validate config and show what would run without fetching anything
    #[arg(long, conflicts_with = "stats")]
    dry_run: bool,

    /// Show the latest run's results from the journal and exit
    #[arg(long, conflicts_with = "dry_run")]
    stats: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Load and validate configuration before logging so the log dir override applies
    let (config, config_hash) = match load_config(&cli) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = setup_logging(cli.verbose, cli.quiet, Path::new(&config.storage.log_dir)) {
        eprintln!("Error: {:#}", e);
        return ExitCode::FAILURE;
    }
    tracing::info!("Configuration loaded from {} (hash: {})", cli.config.display(), config_hash);

    let result = if cli.dry_run {
        handle_dry_run(&cli, &config, &config_hash)
    } else if cli.stats {
        handle_stats(&config)
    } else {
        handle_run(&cli, &config, &config_hash).await
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Loads the config file and applies command-line overrides
fn load_config(cli: &Cli) -> anyhow::Result<(Config, String)> {
    let (mut config, hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    if let Some(workers) = cli.workers {
        config.crawler.workers = workers;
    }
    if let Some(seconds) = cli.rate_limit {
        config.crawler.rate_limit_seconds = seconds;
    }
    if cli.limit.is_some() {
        config.crawler.item_limit = cli.limit;
    }
    if let Some(min) = cli.min_expected {
        config.crawler.min_expected = min;
    }
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = dir.display().to_string();
    }
    if let Some(dir) = &cli.log_dir {
        config.storage.log_dir = dir.display().to_string();
    }
    if let Some(file) = &cli.seed_file {
        config.storage.seed_file = Some(file.display().to_string());
    }

    validate(&config).context("invalid configuration")?;
    Ok((config, hash))
}

fn run_options(cli: &Cli, config: &Config) -> RunOptions {
    let mut options = RunOptions::from_config(config);
    options.resume = cli.resume || !cli.fresh;
    options.force = cli.force;
    options.retry_failed = cli.retry_failed;
    options.skip.extend(cli.skip.iter().cloned());
    options
}

/// Sets up the tracing subscriber: stdout plus `harvest_<timestamp>.log`
fn setup_logging(verbose: u8, quiet: bool, log_dir: &Path) -> anyhow::Result<()> {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("stage_harvest=info,warn"),
            1 => EnvFilter::new("stage_harvest=debug,info"),
            2 => EnvFilter::new("stage_harvest=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log dir {}", log_dir.display()))?;
    let log_path = log_dir.join(format!(
        "harvest_{}.log",
        chrono::Local::now().format("%Y%m%d_%H%M%S")
    ));
    let log_file = File::create(&log_path)
        .with_context(|| format!("failed to create {}", log_path.display()))?;

    let stdout_layer = fmt::layer().with_target(false);
    let file_layer = fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_writer(Mutex::new(log_file));

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .context("failed to install logger")?;
    Ok(())
}

/// Handles the --dry-run mode: prints the resolved plan
fn handle_dry_run(cli: &Cli, config: &Config, config_hash: &str) -> anyhow::Result<ExitCode> {
    let pipeline = Pipeline::for_planning(config, config_hash)
        .context("failed to build pipeline")?;
    let options = run_options(cli, config);
    let plan = pipeline.plan(&options)?;

    println!("=== Stage-Harvest Dry Run ===\n");
    println!("Crawler:");
    println!("  Rate limit: {}s", config.crawler.rate_limit_seconds);
    println!("  Workers: {}", config.crawler.workers);
    match config.crawler.item_limit {
        Some(limit) => println!("  Item limit: {} per stage", limit),
        None => println!("  Item limit: none"),
    }
    println!("  Max attempts: {}", config.crawler.max_attempts);
    println!("  Min expected: {}", options.min_expected);

    println!("\nUser Agent: {}", config.user_agent.header_value());
    println!("Data dir: {}", config.storage.data_dir);
    println!(
        "Mode: {}{}{}",
        if options.resume { "resume" } else { "fresh" },
        if options.force { ", force" } else { "" },
        if options.retry_failed { ", retry failed" } else { "" }
    );
    println!();
    print!("{}", format_plan(&plan));

    println!("\n✓ Configuration is valid");
    Ok(ExitCode::SUCCESS)
}

/// Handles the --stats mode: shows the latest run from the journal
fn handle_stats(config: &Config) -> anyhow::Result<ExitCode> {
    let path = Path::new(&config.storage.data_dir).join(JOURNAL_FILE);
    if !path.exists() {
        println!("No journal at {}", path.display());
        return Ok(ExitCode::SUCCESS);
    }
    println!("Journal: {}\n", path.display());

    let journal = SqliteJournal::new(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    match load_statistics(&journal)? {
        Some(stats) => print_statistics(&stats),
        None => println!("No runs recorded yet"),
    }
    Ok(ExitCode::SUCCESS)
}

/// Handles the main harvest run
async fn handle_run(cli: &Cli, config: &Config, config_hash: &str) -> anyhow::Result<ExitCode> {
    let shutdown = Shutdown::new();
    shutdown.listen_for_signals();

    let options = run_options(cli, config);
    if options.resume {
        tracing::info!("Starting harvest (resumes from the checkpoint if one exists)");
    } else {
        tracing::info!("Starting fresh harvest (ignoring the checkpoint)");
    }

    let mut pipeline = Pipeline::from_config(config, config_hash, shutdown)
        .context("failed to build pipeline")?;
    tracing::info!(
        "Stages: {}; seeds: {}",
        pipeline.stage_names().join(" -> "),
        pipeline.seeds().len()
    );

    match pipeline.execute(&options).await {
        Ok(report) => {
            print_run_report(&report);
            if report.outcome == RunOutcome::Interrupted {
                tracing::info!("Run interrupted cleanly; progress is saved");
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e @ HarvestError::SanityCheck { .. }) => {
            tracing::error!("{}; later stages were not run", e);
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e).context("harvest failed"),
    }
}

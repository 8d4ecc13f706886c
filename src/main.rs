//! gtrun CLI - Parallel GoogleTest campaign runner.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gtrun::config::{self, Config};
use gtrun::import::import_trace_file;
use gtrun::listing::{is_disabled, list_tests};
use gtrun::orchestrator::Orchestrator;
use gtrun::planner;
use gtrun::report::{self, ConsoleReporter};
use gtrun::results::{Provenance, ResultLog, Verdict};

const DEFAULT_CONFIG: &str = "gtrun.toml";

#[derive(Parser)]
#[command(name = "gtrun")]
#[command(about = "Parallel GoogleTest campaign runner", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path [default: gtrun.toml if present]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a test campaign
    Run {
        /// Test executable, overrides the configured one
        executable: Option<PathBuf>,

        /// Number of worker processes
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Workers running the unfiltered suite in the background
        #[arg(long)]
        background_jobs: Option<usize>,

        /// Number of repetitions
        #[arg(short, long)]
        repetitions: Option<u32>,

        /// GoogleTest filter expression
        #[arg(short, long)]
        filter: Option<String>,

        /// Stop after this many failures
        #[arg(long)]
        max_failures: Option<u64>,

        /// Shuffle test order within each worker
        #[arg(long)]
        shuffle: bool,

        /// Keep the trace output of passed tests
        #[arg(long)]
        keep_passed: bool,

        /// Print the trace of every failed test in the summary
        #[arg(long)]
        show_traces: bool,

        /// Write all results as JSON to this file
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// Show the partition plan for a campaign
    Plan {
        /// Number of test cases
        #[arg(short, long)]
        tests: usize,

        /// Number of repetitions
        #[arg(short, long, default_value_t = 1)]
        repetitions: u32,

        /// Number of worker processes
        #[arg(short, long)]
        jobs: usize,

        /// Workers running the unfiltered suite in the background
        #[arg(long, default_value_t = 0)]
        background_jobs: usize,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the test cases of an executable
    List {
        /// Test executable, overrides the configured one
        executable: Option<PathBuf>,

        /// GoogleTest filter expression
        #[arg(short, long)]
        filter: Option<String>,

        /// Print the list as JSON
        #[arg(long)]
        json: bool,
    },

    /// Import results from trace files
    Import {
        /// Trace files
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Print the results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove trace files without failed results
    Clean {
        /// Remove all trace and core files
        #[arg(long)]
        all: bool,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Test executable to put into the configuration
        #[arg(short, long)]
        executable: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Run {
            executable,
            jobs,
            background_jobs,
            repetitions,
            filter,
            max_failures,
            shuffle,
            keep_passed,
            show_traces,
            json,
        } => {
            let mut config = load_settings(config_path)?;
            let campaign = &mut config.campaign;
            campaign.executable = executable.or(campaign.executable.take());
            campaign.jobs = jobs.unwrap_or(campaign.jobs);
            campaign.background_jobs = background_jobs.unwrap_or(campaign.background_jobs);
            campaign.repetitions = repetitions.unwrap_or(campaign.repetitions);
            campaign.filter = filter.unwrap_or(std::mem::take(&mut campaign.filter));
            campaign.max_failures = max_failures.unwrap_or(campaign.max_failures);
            campaign.shuffle |= shuffle;
            campaign.clean_trace &= !keep_passed;

            let code = run_campaign(config, cli.verbose, show_traces, json).await?;
            std::process::exit(code);
        }
        Commands::Plan {
            tests,
            repetitions,
            jobs,
            background_jobs,
            json,
        } => show_plan(tests, repetitions, jobs, background_jobs, json),
        Commands::List {
            executable,
            filter,
            json,
        } => {
            let config = load_settings(config_path)?;
            let executable = executable.or(config.campaign.executable.clone());
            let filter = filter.unwrap_or(config.campaign.filter.clone());
            list_test_cases(executable, &filter, json).await
        }
        Commands::Import { files, json } => {
            let config = load_settings(config_path)?;
            import_files(&config, &files, json)
        }
        Commands::Clean { all } => {
            let config = load_settings(config_path)?;
            clean_traces(&config, all)
        }
        Commands::Validate => validate_config(config_path.unwrap_or(Path::new(DEFAULT_CONFIG))),
        Commands::Init { executable } => init_config(
            config_path.unwrap_or(Path::new(DEFAULT_CONFIG)),
            executable.as_deref(),
        ),
    }
}

/// Loads the given configuration, or `gtrun.toml` if present, or defaults.
fn load_settings(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => config::load_config(path),
        None if Path::new(DEFAULT_CONFIG).exists() => {
            config::load_config(Path::new(DEFAULT_CONFIG))
        }
        None => Ok(Config::default()),
    }
}

async fn run_campaign(
    config: Config,
    verbose: bool,
    show_traces: bool,
    json: Option<PathBuf>,
) -> Result<i32> {
    let executable = config
        .campaign
        .executable
        .clone()
        .context("No test executable given on the command line or in the configuration")?;

    let mut tests = list_tests(&executable, &config.campaign.filter).await?;
    if !config.campaign.run_disabled {
        tests.retain(|name| !is_disabled(name));
    }
    if tests.is_empty() {
        bail!("No test cases match filter \"{}\"", config.campaign.filter);
    }
    info!("Running {} test cases of {}", tests.len(), executable.display());

    let options = config.campaign_options(&executable, tests.len())?;
    let clean_trace = options.clean_passed;
    let settings = config.runner_settings()?;
    let drain_interval = settings.drain_interval;

    let mut db = ResultLog::new();
    db.register_test_cases(tests.iter().cloned());
    let reporter = ConsoleReporter::new(0, verbose);
    db.subscribe(reporter.listener());

    let mut orchestrator = Orchestrator::new(db, config.artifact_manager()?, settings);
    let started = Instant::now();
    let launched = orchestrator.start(options)?;
    for failure in &launched.spawn_failures {
        warn!("{}", failure);
    }

    let (interrupt_tx, mut interrupt_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if interrupt_tx.send(()).is_err() {
                break;
            }
        }
    });

    let mut interrupts = 0;
    let mut interval = tokio::time::interval(drain_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if !orchestrator.drain() {
                    break;
                }
            }
            Some(()) = interrupt_rx.recv() => {
                interrupts += 1;
                if interrupts == 1 {
                    reporter.println("Stopping workers, press Ctrl-C again to kill them");
                    orchestrator.stop(false);
                } else {
                    orchestrator.stop(true);
                }
            }
        }
    }
    reporter.finish();

    if clean_trace {
        let cleanup = config.artifact_manager()?;
        let cleaned = cleanup.clean_trace_files(orchestrator.db_mut().results_mut(), false);
        for path in &cleaned.compacted {
            info!("Dropped passed test output from {}", path.display());
        }
    }

    let results = orchestrator.db().results();
    report::print_summary(orchestrator.counters(), results, started.elapsed(), show_traces);

    if let Some(path) = json {
        let file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(file, results)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }

    let failed = orchestrator.counters().has_failures();
    Ok(if failed || interrupts > 0 { 1 } else { 0 })
}

fn show_plan(
    tests: usize,
    repetitions: u32,
    jobs: usize,
    background_jobs: usize,
    json: bool,
) -> Result<()> {
    let plan = planner::plan(tests, repetitions, jobs, background_jobs);
    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    report::print_plan(&plan, tests);
    let worst = plan
        .iter()
        .map(|entry| entry.expected_results(tests))
        .max()
        .unwrap_or(0);
    println!();
    println!("Longest worker runs {} tests", worst);
    Ok(())
}

async fn list_test_cases(executable: Option<PathBuf>, filter: &str, json: bool) -> Result<()> {
    let executable =
        executable.context("No test executable given on the command line or in the configuration")?;
    let tests = list_tests(&executable, filter).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tests)?);
    } else {
        for test in &tests {
            println!("{}", test);
        }
    }
    Ok(())
}

fn import_files(config: &Config, files: &[PathBuf], json: bool) -> Result<()> {
    let seed = config.seed_pattern()?;
    let prefix = config.tool_core_prefix();

    let mut db = ResultLog::new();
    for file in files {
        let records = import_trace_file(file, Provenance::ManualImport, &prefix, seed.as_ref())?;
        db.import_results(records);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(db.results())?);
        return Ok(());
    }

    for record in db.results() {
        println!("{}", report::result_line(record));
    }
    let failed = db
        .results()
        .iter()
        .filter(|r| r.verdict.is_failure())
        .count();
    println!();
    println!(
        "Imported {} results, {} failed",
        db.results().len(),
        failed
    );
    Ok(())
}

fn clean_traces(config: &Config, all: bool) -> Result<()> {
    let artifacts = config.artifact_manager()?;
    let seed = config.seed_pattern()?;

    let mut keep = HashSet::new();
    if !all {
        for trace in artifacts.search_trace_files()? {
            let records = import_trace_file(
                &trace,
                Provenance::AutoImport,
                artifacts.tool_core_prefix(),
                seed.as_ref(),
            )?;
            for record in records.iter().filter(|r| r.verdict >= Verdict::Fail) {
                keep.extend(record.trace_file.iter().cloned());
                keep.extend(record.core_file.iter().cloned());
            }
        }
    }

    let removed = artifacts.remove_orphans(&keep, &HashSet::new())?;
    for path in &removed {
        info!("Removed {}", path.display());
    }
    println!("Removed {} files", removed.len());
    Ok(())
}

fn validate_config(path: &Path) -> Result<()> {
    match config::load_config(path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            match &config.campaign.executable {
                Some(exe) => println!("  Executable: {}", exe.display()),
                None => println!("  Executable: (command line)"),
            }
            println!("  Jobs: {}", config.campaign.jobs);
            println!("  Background jobs: {}", config.campaign.background_jobs);
            println!("  Repetitions: {}", config.campaign.repetitions);
            if !config.campaign.filter.is_empty() {
                println!("  Filter: {}", config.campaign.filter);
            }
            match config.tool_command() {
                Ok((words, _)) if words.is_empty() => println!("  Tool: none"),
                Ok((words, code)) => {
                    let code = code.map_or_else(|| "off".to_string(), |c| c.to_string());
                    println!("  Tool: {} (error exit code {})", shell_words::join(&words), code);
                }
                Err(e) => {
                    eprintln!("Configuration error: {:#}", e);
                    std::process::exit(1);
                }
            }
            if let Err(e) = config.seed_pattern().and(config.runner_settings()) {
                eprintln!("Configuration error: {:#}", e);
                std::process::exit(1);
            }
            println!("  Trace directory: {}", config.artifacts.trace_dir);

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_config(path: &Path, executable: Option<&Path>) -> Result<()> {
    if path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
        std::process::exit(1);
    }

    let executable = match executable {
        Some(exe) => format!("executable = {}", toml::Value::from(&*exe.to_string_lossy())),
        None => "# executable = \"build/unit_test\"".to_string(),
    };
    let jobs = std::thread::available_parallelism().map_or(1, |n| n.get());

    let content = format!(
        r#"# gtrun configuration file

[campaign]
{}
jobs = {}
background_jobs = 0
repetitions = 1
filter = ""
max_failures = 0
clean_trace = true
clean_core = false
# seed_regexp = "random seed: (\\d+)"

# [tool]
# command = "valgrind --leak-check=full"
# error_exit_code = 125
# core_prefix = "vgcore"

[artifacts]
trace_dir = "."
core_dir = "."
copy_executable = true
"#,
        executable, jobs
    );

    std::fs::write(path, content)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Created {}", path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  gtrun run");

    Ok(())
}

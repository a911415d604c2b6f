//! jobmatrix CLI - run one test suite across a matrix of environments.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use jobmatrix::cache::{self, CacheKeyResolver, fs::FsCacheStore};
use jobmatrix::config::{self, Config};
use jobmatrix::orchestrator::Orchestrator;
use jobmatrix::provision::local::LocalProvisioner;
use jobmatrix::report::{ConsoleReporter, JUnitReporter, JsonReporter, MultiReporter};
use jobmatrix::runner::shell::ShellRunner;
use jobmatrix::runner::{OutputCallback, OutputLine};
use jobmatrix::trigger::{TriggerEvent, TriggerKind};
use jobmatrix::workspace::local::LocalWorkspaceProvider;

#[derive(Parser)]
#[command(name = "jobmatrix")]
#[command(about = "Run a test suite across a timezone/profile matrix", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "jobmatrix.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every job of the matrix
    Run {
        /// Override maximum parallel jobs
        #[arg(short, long)]
        parallel: Option<usize>,

        /// JUnit XML output path
        #[arg(long)]
        junit: Option<PathBuf>,

        /// JSON report output path
        #[arg(long)]
        json: Option<PathBuf>,

        /// Disable the dependency cache for this run
        #[arg(long)]
        no_cache: bool,

        /// Trigger event kind
        #[arg(long, value_enum, default_value_t = TriggerKind::Manual)]
        event: TriggerKind,

        /// Repository reference for the trigger
        #[arg(long, default_value = "")]
        repository: String,

        /// Git ref under test
        #[arg(long = "ref")]
        git_ref: Option<String>,

        /// Read the trigger from a JSON event file (overrides --event)
        #[arg(long)]
        event_file: Option<PathBuf>,
    },

    /// Print the jobs the matrix expands to
    Expand {
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Print the dependency cache key for the source directory
    CacheKey,

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Json,
}

struct RunArgs {
    parallel: Option<usize>,
    junit: Option<PathBuf>,
    json: Option<PathBuf>,
    no_cache: bool,
    trigger: TriggerEvent,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            parallel,
            junit,
            json,
            no_cache,
            event,
            repository,
            git_ref,
            event_file,
        } => {
            let trigger = match event_file {
                Some(path) => TriggerEvent::load(&path)?,
                None => TriggerEvent::new(event, repository, git_ref),
            };
            let args = RunArgs {
                parallel,
                junit,
                json,
                no_cache,
                trigger,
            };
            run_matrix(&cli.config, args, cli.verbose).await
        }
        Commands::Expand { format } => expand_matrix(&cli.config, format),
        Commands::CacheKey => print_cache_key(&cli.config),
        Commands::Validate => validate_config(&cli.config),
        Commands::Init { force } => init_config(&cli.config, force),
    }
}

fn load(config_path: &Path) -> Result<Config> {
    config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))
}

async fn run_matrix(config_path: &Path, args: RunArgs, verbose: bool) -> Result<()> {
    let mut config = load(config_path)?;

    // Apply overrides
    if let Some(parallel) = args.parallel {
        config.matrix.max_parallel = Some(parallel);
    }
    if args.no_cache {
        config.cache.enabled = false;
    }

    config.validate().context("Invalid configuration")?;
    info!("Loaded configuration from {}", config_path.display());

    // Clear output directory to avoid stale results
    let output_dir = &config.report.output_dir;
    if output_dir.exists() {
        std::fs::remove_dir_all(output_dir).ok();
    }
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;

    let workspace = LocalWorkspaceProvider::new(config.workspace.clone());
    let provisioner = LocalProvisioner::new(config.provisioner.clone());

    let mut runner = ShellRunner::new(config.runner.clone(), Some(config.report.logs_dir()));
    if config.matrix.stream_output {
        let callback: OutputCallback = Arc::new(|job_id, line| match line {
            OutputLine::Stdout(s) => println!("[{}] {}", job_id, s),
            OutputLine::Stderr(s) => eprintln!("[{}] {}", job_id, s),
        });
        runner = runner.with_output_callback(callback);
    }

    let reporter = create_reporter(&config, args.junit, args.json, verbose);
    let store = Arc::new(FsCacheStore::new(config.cache.dir_path()));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling remaining jobs");
            on_signal.cancel();
        }
    });

    let orchestrator = Orchestrator::new(config, workspace, provisioner, runner, reporter)
        .with_cache_store(store);
    let report = orchestrator.run(args.trigger, &cancel).await?;

    std::process::exit(report.exit_code());
}

fn expand_matrix(config_path: &Path, format: Format) -> Result<()> {
    let config = load(config_path)?;
    let jobs = config.validate().context("Invalid configuration")?;

    match format {
        Format::Json => {
            let json = serde_json::to_string_pretty(&jobs)?;
            println!("{}", json);
        }
        Format::Text => {
            println!("Matrix expands to {} jobs:", jobs.len());
            for job in &jobs {
                let profile = job.profile().unwrap_or("-");
                println!("  #{} {}  (profile: {})", job.index(), job, profile);
            }
        }
    }

    Ok(())
}

fn print_cache_key(config_path: &Path) -> Result<()> {
    let config = load(config_path)?;
    config.validate().context("Invalid configuration")?;
    if config.cache.descriptors.is_empty() {
        anyhow::bail!("No cache descriptors configured");
    }

    let descriptors: Vec<PathBuf> = config
        .cache
        .descriptors
        .iter()
        .map(|d| config.workspace.source_dir.join(d))
        .collect();
    let key = CacheKeyResolver::new(config.cache.namespace.clone())
        .resolve(&descriptors)
        .context("Failed to resolve cache key")?;

    let store = FsCacheStore::new(config.cache.dir_path());
    let outcome = cache::lookup(&store, &key).outcome();

    println!("Key:    {}", key);
    println!("Prefix: {}", key.prefix());
    println!("Store:  {} ({})", store.root().display(), outcome);

    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    let config = match load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };

    match config.validate() {
        Ok(jobs) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Command: {}", config.matrix.command);
            println!("  Jobs: {}", jobs.len());
            println!("  Max parallel: {}", config.effective_parallelism(jobs.len()));
            println!("  Job timeout: {}s", config.matrix.job_timeout_secs);
            println!("  Runtime version: {}", config.matrix.runtime_version);
            let axes: Vec<_> = config.axes.iter().map(|a| a.name.as_str()).collect();
            println!("  Axes: {}", axes.join(", "));
            let cache = if config.cache.is_active() {
                format!("{} ({})", config.cache.namespace, config.cache.dir)
            } else {
                "disabled".to_string()
            };
            println!("  Cache: {}", cache);

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

const CONFIG_TEMPLATE: &str = r#"# jobmatrix configuration file

[matrix]
command = "mvn -B test"
runtime_version = "17"
job_timeout_secs = 3600

# Drop combinations that should not run
[[matrix.exclude]]
timezone = "Europe/Amsterdam"
profile = "spark-3.5"

[[axis]]
name = "timezone"
values = ["UTC", "Europe/Amsterdam"]

[[axis]]
name = "profile"
values = ["default", "spark-3.5"]

[workspace]
source_dir = "."
mode = "copy"
exclude = [".git", "target"]

[runner]
shell = "/bin/sh"
profile_arg = "-P{profile}"

[runner.env]
MAVEN_OPTS = "-Dmaven.repo.local=.m2/repository"

[cache]
dir = "~/.cache/jobmatrix"
namespace = "maven"
descriptors = ["pom.xml"]
paths = [".m2/repository"]

[report]
output_dir = "matrix-results"
junit = true
junit_file = "junit.xml"
json = true
json_file = "report.json"
"#;

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        eprintln!(
            "{} already exists. Remove it first or pass --force.",
            path.display()
        );
        std::process::exit(1);
    }

    std::fs::write(path, CONFIG_TEMPLATE)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Created {}", path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  jobmatrix run");

    Ok(())
}

fn create_reporter(
    config: &Config,
    junit_override: Option<PathBuf>,
    json_override: Option<PathBuf>,
    verbose: bool,
) -> MultiReporter {
    let mut multi = MultiReporter::new();

    // Add console reporter
    multi = multi.with_reporter(ConsoleReporter::new(verbose));

    // Add JUnit reporter if enabled
    if config.report.junit || junit_override.is_some() {
        let junit_path = junit_override
            .unwrap_or_else(|| config.report.output_dir.join(&config.report.junit_file));
        multi = multi.with_reporter(JUnitReporter::new(junit_path));
    }

    if config.report.json || json_override.is_some() {
        let json_path = json_override
            .unwrap_or_else(|| config.report.output_dir.join(&config.report.json_file));
        multi = multi.with_reporter(JsonReporter::new(json_path));
    }

    multi
}

//! Matrix run orchestration.
//!
//! The orchestrator expands the configured matrix and runs every job
//! concurrently, up to the configured limit, feeding outcomes into a
//! [`ResultAggregator`] and the reporter.
//!
//! # Architecture
//!
//! ```text
//!   Config ── validate() ──► Vec<JobSpec>
//!                                 │
//!                                 │ one scoped task per job,
//!                                 │ gated by a semaphore
//!                                 ▼
//!                            JobRunner ──► WorkspaceProvider (acquire)
//!                                 │   ──► Provisioner (timezone, runtime)
//!                                 │   ──► CacheStore (restore)
//!                                 │   ──► TestRunner (command + profile)
//!                                 │   ──► CacheStore (save)
//!                                 │   ──► WorkspaceProvider (release)
//!                                 ▼
//!                             JobResult ──► Reporter
//!                                 │
//!                                 ▼
//!                         ResultAggregator ──► RunReport
//! ```
//!
//! # Cancellation
//!
//! When the [`CancellationToken`] fires, no further jobs start, in-flight
//! jobs stop their test command and release their working tree, and every
//! job without a result is reported as `Cancelled`.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use jobmatrix::cache::fs::FsCacheStore;
//! use jobmatrix::config::load_config;
//! use jobmatrix::orchestrator::Orchestrator;
//! use jobmatrix::provision::local::LocalProvisioner;
//! use jobmatrix::report::ConsoleReporter;
//! use jobmatrix::runner::shell::ShellRunner;
//! use jobmatrix::trigger::TriggerEvent;
//! use jobmatrix::workspace::local::LocalWorkspaceProvider;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("jobmatrix.toml"))?;
//!
//!     let workspace = LocalWorkspaceProvider::new(config.workspace.clone());
//!     let provisioner = LocalProvisioner::new(config.provisioner.clone());
//!     let runner = ShellRunner::new(config.runner.clone(), Some(config.report.logs_dir()));
//!     let store = Arc::new(FsCacheStore::new(config.cache.dir_path()));
//!     let reporter = ConsoleReporter::new(false);
//!
//!     let orchestrator = Orchestrator::new(config, workspace, provisioner, runner, reporter)
//!         .with_cache_store(store);
//!     let report = orchestrator
//!         .run(TriggerEvent::manual(), &CancellationToken::new())
//!         .await?;
//!
//!     std::process::exit(report.exit_code());
//! }
//! ```

pub mod job;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheKeyResolver, CacheStore};
use crate::config::Config;
use crate::matrix::ConfigurationError;
use crate::provision::Provisioner;
use crate::report::Reporter;
use crate::result::{ResultAggregator, RunReport};
use crate::runner::TestRunner;
use crate::trigger::TriggerEvent;
use crate::workspace::WorkspaceProvider;

pub use job::{CacheContext, JobRunner, JobSettings};

/// Runs a whole matrix.
///
/// # Type Parameters
///
/// - `W`: The workspace provider type
/// - `P`: The provisioner type
/// - `T`: The test runner type
/// - `R`: The reporter type
pub struct Orchestrator<W, P, T, R> {
    config: Config,
    workspace: W,
    provisioner: P,
    runner: T,
    reporter: R,
    cache_store: Option<Arc<dyn CacheStore>>,
}

impl<W, P, T, R> Orchestrator<W, P, T, R>
where
    W: WorkspaceProvider,
    P: Provisioner,
    T: TestRunner,
    R: Reporter,
{
    /// Creates a new orchestrator with the given components.
    ///
    /// Caching stays off until a store is attached with
    /// [`with_cache_store`](Self::with_cache_store).
    pub fn new(config: Config, workspace: W, provisioner: P, runner: T, reporter: R) -> Self {
        Self {
            config,
            workspace,
            provisioner,
            runner,
            reporter,
            cache_store: None,
        }
    }

    /// Attaches the shared cache store.
    pub fn with_cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache_store = Some(store);
        self
    }

    /// The reporter, e.g. to inspect what it collected.
    pub fn reporter(&self) -> &R {
        &self.reporter
    }

    /// Runs every job of the matrix and returns the report.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError`] if the configuration is invalid, before
    /// any job starts. Job failures never surface here; they are part of
    /// the report.
    pub async fn run(
        &self,
        trigger: TriggerEvent,
        cancel: &CancellationToken,
    ) -> Result<RunReport, ConfigurationError> {
        let jobs = self.config.validate()?;
        let parallelism = self.config.effective_parallelism(jobs.len());

        info!(
            "Expanded matrix into {} jobs (parallelism {}, trigger: {})",
            jobs.len(),
            parallelism,
            trigger
        );
        self.reporter.on_matrix_expanded(&jobs).await;

        let mut env = trigger.env_vars();
        let mut extra: Vec<_> = self.config.matrix.env.iter().collect();
        extra.sort();
        env.extend(extra.into_iter().map(|(k, v)| (k.clone(), v.clone())));

        let settings = JobSettings {
            command: self.config.matrix.command.clone(),
            runtime_version: self.config.matrix.runtime_version.clone(),
            default_timezone: self.config.matrix.default_timezone.clone(),
            timeout: Duration::from_secs(self.config.matrix.job_timeout_secs),
            env,
        };

        let mut job_runner =
            JobRunner::new(&self.workspace, &self.provisioner, &self.runner, settings);
        match (&self.cache_store, self.config.cache.is_active()) {
            (Some(store), true) => {
                job_runner = job_runner.with_cache(CacheContext {
                    resolver: CacheKeyResolver::new(self.config.cache.namespace.clone()),
                    store: store.clone(),
                    descriptors: self.config.cache.descriptors.clone(),
                    paths: self.config.cache.paths.clone(),
                });
            }
            (None, true) => warn!("Cache is configured but no store is attached"),
            _ => debug!("Dependency cache disabled"),
        }

        let aggregator = Mutex::new(ResultAggregator::new(&jobs, trigger));
        let semaphore = Semaphore::new(parallelism);

        // Execute jobs concurrently using scoped spawns (no 'static required)
        tokio_scoped::scope(|scope| {
            for job in &jobs {
                let job_runner = &job_runner;
                let reporter = &self.reporter;
                let aggregator = &aggregator;
                let semaphore = &semaphore;

                scope.spawn(async move {
                    let permit = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        permit = semaphore.acquire() => match permit {
                            Ok(permit) => permit,
                            Err(_) => return,
                        },
                    };
                    if cancel.is_cancelled() {
                        return;
                    }

                    reporter.on_job_start(job).await;
                    let result = job_runner.run(job, cancel).await;
                    drop(permit);

                    reporter.on_job_complete(&result).await;
                    aggregator.lock().await.record(result);
                });
            }
        });

        let aggregator = aggregator.into_inner();
        if cancel.is_cancelled() {
            warn!(
                "Run cancelled: {} of {} jobs reported",
                aggregator.completed(),
                jobs.len()
            );
        }

        let report = aggregator.finish();
        info!(
            "Run {} finished in {:?}: {} passed, {} failed, {} errored, {} cancelled",
            report.run_id,
            report.duration,
            report.passed(),
            report.failed(),
            report.errored(),
            report.cancelled()
        );

        self.reporter.on_run_complete(&report).await;

        Ok(report)
    }
}

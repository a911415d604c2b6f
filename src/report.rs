//! Run reporting and output generation.
//!
//! Reporters receive events while a matrix runs. The console reporter
//! draws progress and a summary; the file reporters write JUnit XML and a
//! JSON run report once the run completes.

pub mod json;
pub mod junit;

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::matrix::JobSpec;
use crate::result::{JobResult, JobStatus, RunReport};

pub use json::JsonReporter;
pub use junit::JUnitReporter;

/// A reporter receives events during a matrix run.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once the matrix is expanded, before any job starts.
    async fn on_matrix_expanded(&self, jobs: &[JobSpec]);

    /// Called when a job starts running.
    async fn on_job_start(&self, job: &JobSpec);

    /// Called when a job completes, in completion order.
    async fn on_job_complete(&self, result: &JobResult);

    /// Called when the run has completed.
    async fn on_run_complete(&self, report: &RunReport);
}

/// A reporter that does nothing (for testing or when output is not needed).
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_matrix_expanded(&self, _jobs: &[JobSpec]) {}
    async fn on_job_start(&self, _job: &JobSpec) {}
    async fn on_job_complete(&self, _result: &JobResult) {}
    async fn on_run_complete(&self, _report: &RunReport) {}
}

/// A reporter that combines multiple reporters.
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    /// Create a new multi-reporter.
    pub fn new() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    /// Add a reporter to the multi-reporter.
    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

impl Default for MultiReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_matrix_expanded(&self, jobs: &[JobSpec]) {
        for reporter in &self.reporters {
            reporter.on_matrix_expanded(jobs).await;
        }
    }

    async fn on_job_start(&self, job: &JobSpec) {
        for reporter in &self.reporters {
            reporter.on_job_start(job).await;
        }
    }

    async fn on_job_complete(&self, result: &JobResult) {
        for reporter in &self.reporters {
            reporter.on_job_complete(result).await;
        }
    }

    async fn on_run_complete(&self, report: &RunReport) {
        for reporter in &self.reporters {
            reporter.on_run_complete(report).await;
        }
    }
}

/// Console reporter that shows progress in the terminal.
pub struct ConsoleReporter {
    progress: Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    /// Create a new console reporter.
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }

    fn with_progress(&self, f: impl FnOnce(&indicatif::ProgressBar)) {
        let guard = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pb) = guard.as_ref() {
            f(pb);
        }
    }
}

fn status_label(status: &JobStatus) -> console::StyledObject<&'static str> {
    match status {
        JobStatus::Passed => console::style("PASS").green(),
        JobStatus::Failed => console::style("FAIL").red(),
        JobStatus::Errored(_) => console::style("ERR ").red().bold(),
        JobStatus::Cancelled => console::style("CNCL").yellow(),
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_matrix_expanded(&self, jobs: &[JobSpec]) {
        println!("Expanded matrix into {} jobs", jobs.len());
        if self.verbose {
            for job in jobs {
                println!("  #{} {}", job.index(), job);
            }
        }

        let pb = indicatif::ProgressBar::new(jobs.len() as u64);
        if let Ok(style) = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        *self.progress.lock().unwrap_or_else(PoisonError::into_inner) = Some(pb);
    }

    async fn on_job_start(&self, job: &JobSpec) {
        if self.verbose {
            self.with_progress(|pb| pb.println(format!("Running: {}", job)));
        }
    }

    async fn on_job_complete(&self, result: &JobResult) {
        self.with_progress(|pb| {
            pb.inc(1);
            if self.verbose || !result.status.is_passed() {
                pb.println(format!(
                    "{} {} ({:.1}s)",
                    status_label(&result.status),
                    result.id(),
                    result.duration.as_secs_f64()
                ));
            }
        });
    }

    async fn on_run_complete(&self, report: &RunReport) {
        if let Some(pb) = self
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pb.finish_and_clear();
        }

        println!();
        println!("Matrix Results ({}):", report.trigger);
        for result in &report.results {
            println!(
                "  {} {:<50} {:>7.1}s  cache: {}",
                status_label(&result.status),
                result.id(),
                result.duration.as_secs_f64(),
                result.cache
            );
        }

        println!();
        println!("  Total:     {}", report.total());
        println!("  Passed:    {}", console::style(report.passed()).green());
        println!("  Failed:    {}", console::style(report.failed()).red());
        if report.errored() > 0 {
            println!("  Errored:   {}", console::style(report.errored()).red().bold());
        }
        if report.cancelled() > 0 {
            println!("  Cancelled: {}", console::style(report.cancelled()).yellow());
        }
        println!("  Duration:  {:?}", report.duration);

        if report.all_passed() {
            println!();
            println!("{}", console::style("All jobs passed!").green().bold());
            return;
        }

        println!();
        println!("{}", console::style("Some jobs did not pass.").red().bold());

        println!();
        println!("Failed jobs:");
        for result in report.results.iter().filter(|r| !r.status.is_passed()) {
            println!("  - {} [{}]", result.id(), result.status);
            if let Some(msg) = &result.message {
                println!("    {}", console::style(msg).dim());
            }
            if let Some(log) = &result.log_ref {
                println!("    {} {}", console::style("log:").dim(), log.display());
            }
            if !result.log_tail.is_empty() {
                println!();
                println!("    {}", console::style("output (tail):").dim());
                for line in &result.log_tail {
                    println!("      {}", line);
                }
            }
        }
    }
}

//! Job outcomes and the run report.
//!
//! Jobs finish in any order. The [`ResultAggregator`] collects their
//! [`JobResult`]s, puts them back in declared matrix order and fills in a
//! `Cancelled` result for any job that never reported. The resulting
//! [`RunReport`] decides the process exit code.

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use tracing::warn;

use crate::cache::CacheOutcome;
use crate::matrix::JobSpec;
use crate::trigger::TriggerEvent;

/// Why a job errored instead of producing a test verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Workspace,
    Provisioning,
    Runner,
    Timeout,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Workspace => "workspace",
            ErrorKind::Provisioning => "provisioning",
            ErrorKind::Runner => "runner",
            ErrorKind::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Final status of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "kind", rename_all = "snake_case")]
pub enum JobStatus {
    /// The test command exited with code 0.
    Passed,
    /// The test command exited non-zero.
    Failed,
    /// The job could not produce a verdict.
    Errored(ErrorKind),
    /// The run was cancelled before the job finished.
    Cancelled,
}

impl JobStatus {
    pub fn is_passed(&self) -> bool {
        matches!(self, JobStatus::Passed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Passed => f.write_str("passed"),
            JobStatus::Failed => f.write_str("failed"),
            JobStatus::Errored(kind) => write!(f, "errored ({})", kind),
            JobStatus::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Outcome of one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    /// The job this result belongs to.
    pub job: JobSpec,

    #[serde(flatten)]
    pub status: JobStatus,

    /// Exit code of the test command, if it ran to completion.
    pub exit_code: Option<i32>,

    /// Where the full log was written.
    pub log_ref: Option<PathBuf>,

    /// Last lines of output, for console summaries.
    #[serde(skip)]
    pub log_tail: Vec<String>,

    #[serde(serialize_with = "serialize_secs")]
    pub duration: Duration,

    /// What happened to the dependency cache.
    pub cache: CacheOutcome,

    /// Key the job resolved, if any.
    pub cache_key: Option<String>,

    /// Whether this job wrote a new cache entry.
    pub cache_saved: bool,

    /// Error or diagnostic message.
    pub message: Option<String>,
}

impl JobResult {
    /// A result with the given status and nothing else recorded yet.
    pub fn new(job: JobSpec, status: JobStatus) -> Self {
        Self {
            job,
            status,
            exit_code: None,
            log_ref: None,
            log_tail: Vec::new(),
            duration: Duration::ZERO,
            cache: CacheOutcome::default(),
            cache_key: None,
            cache_saved: false,
            message: None,
        }
    }

    /// A job that never ran because the run was cancelled.
    pub fn cancelled(job: JobSpec) -> Self {
        let mut result = Self::new(job, JobStatus::Cancelled);
        result.message = Some("cancelled before completion".to_string());
        result
    }

    /// A job that errored with `message`.
    pub fn errored(job: JobSpec, kind: ErrorKind, message: impl Into<String>) -> Self {
        let mut result = Self::new(job, JobStatus::Errored(kind));
        result.message = Some(message.into());
        result
    }

    /// Job id, e.g. `timezone=UTC,profile=default`.
    pub fn id(&self) -> &str {
        self.job.id()
    }
}

/// Overall verdict of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Passed,
    Failed,
}

/// All job results of one matrix run.
///
/// # Exit Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | Every job passed |
/// | 1 | At least one job failed, errored or was cancelled |
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Unique id of this run.
    pub run_id: String,

    /// The event that started the run.
    pub trigger: TriggerEvent,

    pub started_at: DateTime<Utc>,

    #[serde(serialize_with = "serialize_secs")]
    pub duration: Duration,

    /// Job results in declared matrix order.
    pub results: Vec<JobResult>,
}

impl RunReport {
    /// Returns `true` if every job passed.
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.status.is_passed())
    }

    pub fn status(&self) -> RunStatus {
        if self.all_passed() {
            RunStatus::Passed
        } else {
            RunStatus::Failed
        }
    }

    /// Returns an appropriate process exit code for this report.
    pub fn exit_code(&self) -> i32 {
        if self.all_passed() { 0 } else { 1 }
    }

    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn passed(&self) -> usize {
        self.count(|s| matches!(s, JobStatus::Passed))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, JobStatus::Failed))
    }

    pub fn errored(&self) -> usize {
        self.count(|s| matches!(s, JobStatus::Errored(_)))
    }

    pub fn cancelled(&self) -> usize {
        self.count(|s| matches!(s, JobStatus::Cancelled))
    }

    /// Looks up the result for a job id.
    pub fn get(&self, job_id: &str) -> Option<&JobResult> {
        self.results.iter().find(|r| r.id() == job_id)
    }

    fn count(&self, pred: impl Fn(&JobStatus) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.status)).count()
    }
}

/// Collects job results as they arrive.
pub struct ResultAggregator {
    run_id: String,
    trigger: TriggerEvent,
    started_at: DateTime<Utc>,
    start: Instant,
    jobs: Vec<JobSpec>,
    slots: Vec<Option<JobResult>>,
}

impl ResultAggregator {
    /// Starts collecting for `jobs`, which must be in declared order.
    pub fn new(jobs: &[JobSpec], trigger: TriggerEvent) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            trigger,
            started_at: Utc::now(),
            start: Instant::now(),
            jobs: jobs.to_vec(),
            slots: vec![None; jobs.len()],
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Records a result. A second result for the same job replaces the first.
    pub fn record(&mut self, result: JobResult) {
        let index = result.job.index();
        match self.slots.get_mut(index) {
            Some(slot) => {
                if slot.is_some() {
                    warn!("Job {} reported twice, keeping the latest result", result.id());
                }
                *slot = Some(result);
            }
            None => warn!(
                "Ignoring result for job {} with out-of-range index {}",
                result.id(),
                index
            ),
        }
    }

    /// Number of jobs that have reported.
    pub fn completed(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Builds the report; jobs that never reported become `Cancelled`.
    pub fn finish(self) -> RunReport {
        let results = self
            .slots
            .into_iter()
            .zip(self.jobs)
            .map(|(slot, job)| slot.unwrap_or_else(|| JobResult::cancelled(job)))
            .collect();

        RunReport {
            run_id: self.run_id,
            trigger: self.trigger,
            started_at: self.started_at,
            duration: self.start.elapsed(),
            results,
        }
    }
}

fn serialize_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{AxisDefinition, expand};

    fn jobs() -> Vec<JobSpec> {
        expand(
            &[
                AxisDefinition::new("timezone", ["UTC", "Europe/Amsterdam"]),
                AxisDefinition::new("profile", ["default", "spark-3.5"]),
            ],
            &[],
        )
        .unwrap()
    }

    #[test]
    fn test_results_sorted_by_declared_index() {
        let jobs = jobs();
        let mut agg = ResultAggregator::new(&jobs, TriggerEvent::manual());
        for job in jobs.iter().rev() {
            agg.record(JobResult::new(job.clone(), JobStatus::Passed));
        }
        assert_eq!(agg.completed(), 4);

        let report = agg.finish();
        let indices: Vec<_> = report.results.iter().map(|r| r.job.index()).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert!(report.all_passed());
        assert_eq!(report.status(), RunStatus::Passed);
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn test_missing_jobs_are_cancelled() {
        let jobs = jobs();
        let mut agg = ResultAggregator::new(&jobs, TriggerEvent::manual());
        agg.record(JobResult::new(jobs[0].clone(), JobStatus::Passed));

        let report = agg.finish();
        assert_eq!(report.total(), 4);
        assert_eq!(report.passed(), 1);
        assert_eq!(report.cancelled(), 3);
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_any_non_passed_fails_run() {
        let jobs = jobs();
        let mut agg = ResultAggregator::new(&jobs, TriggerEvent::manual());
        agg.record(JobResult::new(jobs[0].clone(), JobStatus::Passed));
        agg.record(JobResult::new(jobs[1].clone(), JobStatus::Failed));
        agg.record(JobResult::errored(
            jobs[2].clone(),
            ErrorKind::Provisioning,
            "unknown timezone",
        ));
        agg.record(JobResult::new(jobs[3].clone(), JobStatus::Passed));

        let report = agg.finish();
        assert_eq!(report.status(), RunStatus::Failed);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.errored(), 1);
        assert_eq!(
            report.get("timezone=Europe/Amsterdam,profile=default").unwrap().status,
            JobStatus::Errored(ErrorKind::Provisioning)
        );
    }

    #[test]
    fn test_json_shape() {
        let jobs = jobs();
        let mut agg = ResultAggregator::new(&jobs[..1], TriggerEvent::manual());
        agg.record(JobResult::errored(jobs[0].clone(), ErrorKind::Timeout, "timed out"));
        let report = agg.finish();

        let json = serde_json::to_value(&report).unwrap();
        let first = &json["results"][0];
        assert_eq!(first["status"], "errored");
        assert_eq!(first["kind"], "timeout");
        assert_eq!(first["cache"], "disabled");
        assert_eq!(json["trigger"]["kind"], "manual");
    }
}

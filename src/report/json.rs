//! JSON run report.
//!
//! Writes the serialized [`RunReport`] (run id, trigger, timings, per-job
//! status, exit code, log reference and cache outcome) for machine
//! consumption.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{error, info};

use super::Reporter;
use crate::matrix::JobSpec;
use crate::result::{JobResult, RunReport};

/// Reporter that writes the run report as pretty-printed JSON.
pub struct JsonReporter {
    output_path: PathBuf,
}

impl JsonReporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self { output_path }
    }
}

#[async_trait]
impl Reporter for JsonReporter {
    async fn on_matrix_expanded(&self, _jobs: &[JobSpec]) {}

    async fn on_job_start(&self, _job: &JobSpec) {}

    async fn on_job_complete(&self, _result: &JobResult) {}

    async fn on_run_complete(&self, report: &RunReport) {
        let json = match serde_json::to_string_pretty(report) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize run report: {}", e);
                return;
            }
        };

        if let Some(parent) = self.output_path.parent()
            && !parent.as_os_str().is_empty()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            error!("Failed to create output directory: {}", e);
            return;
        }

        match tokio::fs::write(&self.output_path, json).await {
            Ok(()) => info!("JSON report written to: {}", self.output_path.display()),
            Err(e) => error!("Failed to write JSON report: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheOutcome;
    use crate::matrix::{AxisDefinition, expand};
    use crate::result::{JobStatus, ResultAggregator};
    use crate::trigger::{TriggerEvent, TriggerKind};

    #[tokio::test]
    async fn test_writes_report() {
        let jobs = expand(&[AxisDefinition::new("timezone", ["UTC", "Europe/Amsterdam"])], &[])
            .unwrap();
        let trigger = TriggerEvent::new(
            TriggerKind::PullRequestOpened,
            "acme/pipeline",
            Some("refs/pull/7/head".to_string()),
        );
        let mut agg = ResultAggregator::new(&jobs, trigger);
        let mut passed = JobResult::new(jobs[0].clone(), JobStatus::Passed);
        passed.exit_code = Some(0);
        passed.cache = CacheOutcome::PrefixHit;
        agg.record(passed);
        let report = agg.finish();

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("report.json");
        JsonReporter::new(path.clone()).on_run_complete(&report).await;

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(value["run_id"], report.run_id.as_str());
        assert_eq!(value["trigger"]["kind"], "pull_request_opened");
        assert_eq!(value["trigger"]["ref"], "refs/pull/7/head");
        assert_eq!(value["results"][0]["status"], "passed");
        assert_eq!(value["results"][0]["cache"], "prefix_hit");
        assert_eq!(value["results"][0]["job"]["id"], "timezone=UTC");
        assert_eq!(value["results"][1]["status"], "cancelled");
    }
}

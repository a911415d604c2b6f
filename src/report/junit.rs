//! JUnit XML report generation.
//!
//! Each job becomes one `<testcase>`, so CI dashboards show the matrix
//! cells side by side. Failed jobs carry a `<failure>` with the tail of
//! their output, errored jobs an `<error>`, and cancelled jobs `<skipped>`.
//!
//! # Format
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites tests="2" failures="1" errors="0" skipped="0" time="61.204">
//!   <testsuite name="jobmatrix" tests="2" failures="1" errors="0" skipped="0" time="61.204">
//!     <testcase classname="jobmatrix.UTC" name="timezone=UTC,profile=default" time="30.100"/>
//!     <testcase classname="jobmatrix.UTC" name="timezone=UTC,profile=spark-3.5" time="31.104">
//!       <failure message="exit code 1" type="TestFailure">[ERROR] Tests run: 12, Failures: 1</failure>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```

use std::path::PathBuf;

use async_trait::async_trait;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::Reporter;
use crate::matrix::JobSpec;
use crate::result::{JobResult, JobStatus, RunReport};

/// Reporter that writes a JUnit XML file when the run completes.
///
/// Parent directories are created automatically if they don't exist.
///
/// # Example
///
/// ```
/// use jobmatrix::report::JUnitReporter;
///
/// let reporter = JUnitReporter::new("matrix-results/junit.xml".into())
///     .with_testsuite_name("pipeline-matrix");
/// ```
pub struct JUnitReporter {
    output_path: PathBuf,
    testsuite_name: String,
}

impl JUnitReporter {
    /// Creates a new JUnit reporter that writes to the given path.
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            output_path,
            testsuite_name: "jobmatrix".to_string(),
        }
    }

    /// Sets the test suite name in the XML output.
    pub fn with_testsuite_name(mut self, name: impl Into<String>) -> Self {
        self.testsuite_name = name.into();
        self
    }

    /// Generate JUnit XML content from a run report.
    pub fn generate_xml(&self, report: &RunReport) -> anyhow::Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let tests = report.total().to_string();
        let failures = report.failed().to_string();
        let errors = report.errored().to_string();
        let skipped = report.cancelled().to_string();
        let time = format!("{:.3}", report.duration.as_secs_f64());

        let mut testsuites = BytesStart::new("testsuites");
        testsuites.push_attribute(("tests", tests.as_str()));
        testsuites.push_attribute(("failures", failures.as_str()));
        testsuites.push_attribute(("errors", errors.as_str()));
        testsuites.push_attribute(("skipped", skipped.as_str()));
        testsuites.push_attribute(("time", time.as_str()));
        writer.write_event(Event::Start(testsuites))?;

        let mut testsuite = BytesStart::new("testsuite");
        testsuite.push_attribute(("name", self.testsuite_name.as_str()));
        testsuite.push_attribute(("tests", tests.as_str()));
        testsuite.push_attribute(("failures", failures.as_str()));
        testsuite.push_attribute(("errors", errors.as_str()));
        testsuite.push_attribute(("skipped", skipped.as_str()));
        testsuite.push_attribute(("time", time.as_str()));
        testsuite.push_attribute(("timestamp", report.started_at.to_rfc3339().as_str()));
        writer.write_event(Event::Start(testsuite))?;

        for result in &report.results {
            self.write_testcase(&mut writer, result)?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

        let xml = String::from_utf8(writer.into_inner())?;
        Ok(xml)
    }

    fn write_testcase<W: std::io::Write>(
        &self,
        writer: &mut Writer<W>,
        result: &JobResult,
    ) -> anyhow::Result<()> {
        let classname = match result.job.timezone() {
            Some(tz) => format!("{}.{}", self.testsuite_name, tz),
            None => self.testsuite_name.clone(),
        };

        let mut testcase = BytesStart::new("testcase");
        testcase.push_attribute(("classname", classname.as_str()));
        testcase.push_attribute(("name", result.id()));
        testcase.push_attribute((
            "time",
            format!("{:.3}", result.duration.as_secs_f64()).as_str(),
        ));

        let (tag, message, kind) = match result.status {
            JobStatus::Passed => {
                writer.write_event(Event::Empty(testcase))?;
                return Ok(());
            }
            JobStatus::Failed => {
                let message = match result.exit_code {
                    Some(code) => format!("exit code {}", code),
                    None => "test command failed".to_string(),
                };
                ("failure", message, "TestFailure".to_string())
            }
            JobStatus::Errored(kind) => (
                "error",
                result.message.clone().unwrap_or_default(),
                format!("{}Error", capitalize(&kind.to_string())),
            ),
            JobStatus::Cancelled => {
                writer.write_event(Event::Start(testcase))?;
                let mut skipped = BytesStart::new("skipped");
                if let Some(msg) = &result.message {
                    skipped.push_attribute(("message", sanitize(msg).as_str()));
                }
                writer.write_event(Event::Empty(skipped))?;
                writer.write_event(Event::End(BytesEnd::new("testcase")))?;
                return Ok(());
            }
        };

        writer.write_event(Event::Start(testcase))?;

        let mut element = BytesStart::new(tag);
        element.push_attribute(("message", sanitize(&message).as_str()));
        element.push_attribute(("type", kind.as_str()));
        writer.write_event(Event::Start(element))?;
        if !result.log_tail.is_empty() {
            let body = sanitize(&result.log_tail.join("\n"));
            writer.write_event(Event::Text(BytesText::new(&body)))?;
        }
        writer.write_event(Event::End(BytesEnd::new(tag)))?;

        if let Some(log) = &result.log_ref {
            writer.write_event(Event::Start(BytesStart::new("system-out")))?;
            let text = format!("log: {}", log.display());
            writer.write_event(Event::Text(BytesText::new(&sanitize(&text))))?;
            writer.write_event(Event::End(BytesEnd::new("system-out")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        Ok(())
    }
}

#[async_trait]
impl Reporter for JUnitReporter {
    async fn on_matrix_expanded(&self, _jobs: &[JobSpec]) {}

    async fn on_job_start(&self, _job: &JobSpec) {}

    async fn on_job_complete(&self, _result: &JobResult) {}

    async fn on_run_complete(&self, report: &RunReport) {
        match self.generate_xml(report) {
            Ok(xml) => {
                if let Some(parent) = self.output_path.parent()
                    && !parent.as_os_str().is_empty()
                    && let Err(e) = std::fs::create_dir_all(parent)
                {
                    tracing::error!("Failed to create output directory: {}", e);
                    return;
                }

                if let Err(e) = std::fs::write(&self.output_path, xml) {
                    tracing::error!("Failed to write JUnit XML: {}", e);
                } else {
                    tracing::info!("JUnit XML written to: {}", self.output_path.display());
                }
            }
            Err(e) => {
                tracing::error!("Failed to generate JUnit XML: {}", e);
            }
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Drops characters that are not allowed in XML 1.0.
fn sanitize(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{AxisDefinition, expand};
    use crate::result::{ErrorKind, ResultAggregator};
    use crate::trigger::TriggerEvent;

    fn report() -> RunReport {
        let jobs = expand(
            &[
                AxisDefinition::new("timezone", ["UTC", "Europe/Amsterdam"]),
                AxisDefinition::new("profile", ["default", "spark-3.5"]),
            ],
            &[],
        )
        .unwrap();

        let mut agg = ResultAggregator::new(&jobs, TriggerEvent::manual());
        agg.record(JobResult::new(jobs[0].clone(), JobStatus::Passed));
        let mut failed = JobResult::new(jobs[1].clone(), JobStatus::Failed);
        failed.exit_code = Some(1);
        failed.log_tail = vec!["Tests run: 3, Failures: 1 <Spark>".to_string()];
        agg.record(failed);
        agg.record(JobResult::errored(
            jobs[2].clone(),
            ErrorKind::Provisioning,
            "unknown timezone 'Europe/Amsterdam'",
        ));
        agg.finish()
    }

    #[test]
    fn test_generate_xml() {
        let xml = JUnitReporter::new("junit.xml".into())
            .generate_xml(&report())
            .unwrap();

        assert!(xml.contains(r#"<testsuite name="jobmatrix" tests="4" failures="1" errors="1" skipped="1""#));
        assert!(xml.contains(r#"name="timezone=UTC,profile=default""#));
        assert!(xml.contains(r#"<failure message="exit code 1" type="TestFailure">"#));
        assert!(xml.contains("Failures: 1 &lt;Spark&gt;"));
        assert!(xml.contains(r#"type="ProvisioningError""#));
        assert!(xml.contains("<skipped"));
        assert!(xml.contains(r#"classname="jobmatrix.Europe/Amsterdam""#));
    }

    #[tokio::test]
    async fn test_writes_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested/junit.xml");
        let reporter = JUnitReporter::new(path.clone());

        reporter.on_run_complete(&report()).await;
        let xml = std::fs::read_to_string(path).unwrap();
        assert!(xml.starts_with("<?xml"));
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("ok\u{0}\u{1b}[31m"), "ok[31m");
    }
}

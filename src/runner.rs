//! Build/test runner abstraction.
//!
//! A [`TestRunner`] executes the suite's test command for one job inside
//! that job's working tree and reports the exit code plus a reference to
//! the captured log. A non-zero exit code is a test failure, not an error:
//! [`RunnerError`] is reserved for "the command could not be run at all"
//! and for timeouts.
//!
//! # Built-in Runners
//!
//! | Runner | Module | Description |
//! |--------|--------|-------------|
//! | Shell | [`shell`] | Runs the command through a local shell |

pub mod shell;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

/// Errors that stop a test command from producing a verdict.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The command could not be started.
    #[error("failed to start test command: {0}")]
    Spawn(String),

    /// The command did not finish within its timeout.
    #[error("test command timed out after {0:?}")]
    Timeout(Duration),

    /// The command was killed by a signal.
    #[error("test command terminated by signal")]
    Killed,

    /// I/O error while capturing output.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single line of output from a running command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    /// A line from standard output.
    Stdout(String),
    /// A line from standard error.
    Stderr(String),
}

/// Callback for live output, called with the job id and each line.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use jobmatrix::runner::{OutputCallback, OutputLine};
///
/// let callback: OutputCallback = Arc::new(|job_id, line| match line {
///     OutputLine::Stdout(s) => println!("[{}] {}", job_id, s),
///     OutputLine::Stderr(s) => eprintln!("[{}] {}", job_id, s),
/// });
/// ```
pub type OutputCallback = Arc<dyn Fn(&str, &OutputLine) + Send + Sync>;

/// Everything a runner needs to execute one job's tests.
#[derive(Debug, Clone)]
pub struct RunRequest<'a> {
    /// Job identifier, for logs and output prefixes.
    pub job_id: &'a str,

    /// Filesystem-safe job name, for log file names.
    pub job_slug: &'a str,

    /// Base test command, e.g. `mvn -B test`.
    pub command: &'a str,

    /// Build profile; `None` runs the default command.
    pub profile: Option<&'a str>,

    /// The job's working tree.
    pub working_dir: &'a Path,

    /// Environment for the child process.
    pub env: &'a [(String, String)],

    /// Maximum time the command may run.
    pub timeout: Duration,
}

/// Result of a completed test command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    /// Exit code of the command.
    pub exit_code: i32,

    /// Where the full log was written, if anywhere.
    pub log_ref: Option<PathBuf>,

    /// Last lines of combined output, for summaries.
    pub log_tail: Vec<String>,
}

impl RunOutput {
    /// Returns `true` if the command exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Executes a job's test command.
#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Runs the test command described by `request`.
    ///
    /// Must honour `request.timeout`, returning [`RunnerError::Timeout`]
    /// when it elapses. Dropping the returned future must stop the command.
    async fn run(&self, request: &RunRequest<'_>) -> Result<RunOutput, RunnerError>;
}

/// Appends the rendered profile argument to a base command.
///
/// `profile_arg` is a template such as `-P{profile}`; the rendered argument
/// is shell-quoted.
///
/// ```
/// use jobmatrix::runner::command_line;
///
/// assert_eq!(command_line("mvn -B test", Some("spark-3.5"), "-P{profile}"), "mvn -B test -Pspark-3.5");
/// assert_eq!(command_line("mvn -B test", None, "-P{profile}"), "mvn -B test");
/// ```
pub fn command_line(command: &str, profile: Option<&str>, profile_arg: &str) -> String {
    match profile {
        Some(profile) => {
            let arg = profile_arg.replace("{profile}", profile);
            format!("{} {}", command, shell_words::quote(&arg))
        }
        None => command.to_string(),
    }
}

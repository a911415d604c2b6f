//! Configuration schema definitions for jobmatrix.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── MatrixConfig           - Test command, parallelism, timeouts, exclusions
//! ├── [AxisDefinition]       - Ordered `[[axis]]` tables
//! ├── WorkspaceConfig        - Where working trees come from
//! ├── LocalProvisionerConfig - Timezone/runtime provisioning
//! ├── ShellRunnerConfig      - How the test command is executed
//! ├── CacheConfig            - Dependency cache key and contents
//! └── ReportConfig           - Output and reporting settings
//! ```

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::matrix::{AxisDefinition, ConfigurationError, ExcludeRule, JobSpec, expand};

/// Root configuration structure for jobmatrix.
///
/// # TOML Structure
///
/// ```toml
/// [matrix]
/// command = "mvn -B test"
/// runtime_version = "17"
///
/// [[axis]]
/// name = "timezone"
/// values = ["UTC", "Europe/Amsterdam"]
///
/// [[axis]]
/// name = "profile"
/// values = ["default", "spark-3.5"]
///
/// [cache]
/// namespace = "maven"
/// descriptors = ["pom.xml"]
/// paths = [".m2/repository"]
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Test command and execution settings.
    pub matrix: MatrixConfig,

    /// Axes in expansion order.
    #[serde(default, rename = "axis")]
    pub axes: Vec<AxisDefinition>,

    /// Working tree settings (optional, has defaults).
    #[serde(default)]
    pub workspace: WorkspaceConfig,

    /// Provisioner settings (optional, has defaults).
    #[serde(default)]
    pub provisioner: LocalProvisionerConfig,

    /// Runner settings (optional, has defaults).
    #[serde(default)]
    pub runner: ShellRunnerConfig,

    /// Cache settings (optional, has defaults).
    #[serde(default)]
    pub cache: CacheConfig,

    /// Report configuration for output generation (optional, has defaults).
    #[serde(default)]
    pub report: ReportConfig,
}

impl Config {
    /// Expands the configured axes into job specs.
    pub fn expand(&self) -> Result<Vec<JobSpec>, ConfigurationError> {
        expand(&self.axes, &self.matrix.exclude)
    }

    /// Validates every section and returns the expanded jobs.
    ///
    /// All checks run before any job is dispatched; a failure here aborts
    /// the run.
    pub fn validate(&self) -> Result<Vec<JobSpec>, ConfigurationError> {
        let command = self.matrix.command.trim();
        if command.is_empty() {
            return Err(ConfigurationError::invalid("matrix.command", "must not be empty"));
        }
        shell_words::split(command)
            .map_err(|e| ConfigurationError::invalid("matrix.command", e.to_string()))?;

        if self.matrix.job_timeout_secs == 0 {
            return Err(ConfigurationError::invalid(
                "matrix.job_timeout_secs",
                "must be greater than zero",
            ));
        }
        if self.matrix.runtime_version.trim().is_empty() {
            return Err(ConfigurationError::invalid(
                "matrix.runtime_version",
                "must not be empty",
            ));
        }
        if !self.runner.profile_arg.contains("{profile}") {
            return Err(ConfigurationError::invalid(
                "runner.profile_arg",
                "must contain the {profile} placeholder",
            ));
        }

        // '-' separates the namespace from the hash in cache keys
        if self.cache.namespace.is_empty()
            || !self
                .cache
                .namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        {
            return Err(ConfigurationError::invalid(
                "cache.namespace",
                "must be non-empty and use only letters, digits, '_' or '.'",
            ));
        }
        for path in self.cache.descriptors.iter().chain(&self.cache.paths) {
            if !is_contained(path) {
                return Err(ConfigurationError::invalid(
                    "cache",
                    format!("{} must be relative to the working tree", path.display()),
                ));
            }
        }

        if self.workspace.mode == WorkspaceMode::InPlace
            && self.matrix.max_parallel.is_some_and(|n| n > 1)
        {
            return Err(ConfigurationError::invalid(
                "matrix.max_parallel",
                "in-place workspaces share one tree and need max_parallel = 1",
            ));
        }

        self.expand()
    }

    /// Concurrency limit for a run of `job_count` jobs.
    ///
    /// Unset or zero means every job may run at once. In-place workspaces
    /// always run one job at a time.
    pub fn effective_parallelism(&self, job_count: usize) -> usize {
        if self.workspace.mode == WorkspaceMode::InPlace {
            return 1;
        }
        match self.matrix.max_parallel {
            Some(n) if n > 0 => n.min(job_count.max(1)),
            _ => job_count.max(1),
        }
    }
}

/// Relative path that stays inside its root.
fn is_contained(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Test command and execution settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `max_parallel` | number of jobs |
/// | `job_timeout_secs` | 3600 (1 hour) |
/// | `runtime_version` | `"17"` |
/// | `default_timezone` | `"UTC"` |
/// | `stream_output` | false |
///
/// # Example
///
/// ```toml
/// [matrix]
/// command = "mvn -B test"
/// max_parallel = 2
/// job_timeout_secs = 1800
///
/// [[matrix.exclude]]
/// timezone = "Europe/Amsterdam"
/// profile = "spark-3.5"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MatrixConfig {
    /// Base test command, run through the runner's shell.
    pub command: String,

    /// Maximum number of jobs running at once.
    #[serde(default)]
    pub max_parallel: Option<usize>,

    /// Timeout for one job's test command in seconds.
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,

    /// Language runtime version handed to the provisioner.
    #[serde(default = "default_runtime_version")]
    pub runtime_version: String,

    /// Timezone for jobs when the matrix has no `timezone` axis.
    #[serde(default = "default_timezone")]
    pub default_timezone: String,

    /// Print test output live, prefixed with the job id.
    #[serde(default)]
    pub stream_output: bool,

    /// Combinations to drop from the matrix.
    #[serde(default)]
    pub exclude: Vec<ExcludeRule>,

    /// Extra environment variables for every job.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_job_timeout() -> u64 {
    3600
}

fn default_runtime_version() -> String {
    "17".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// How a job's working tree is produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkspaceMode {
    /// Copy the source directory into a private temp dir per job.
    #[default]
    Copy,
    /// Run every job directly in the source directory.
    InPlace,
}

/// Working tree configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkspaceConfig {
    /// Directory holding the checked-out sources.
    #[serde(default = "default_source_dir")]
    pub source_dir: PathBuf,

    /// Copy or in-place.
    #[serde(default)]
    pub mode: WorkspaceMode,

    /// Entry names not copied into working trees.
    #[serde(default = "default_workspace_exclude")]
    pub exclude: Vec<String>,

    /// Parent directory for temp working trees (system temp dir if unset).
    pub temp_dir: Option<PathBuf>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            source_dir: default_source_dir(),
            mode: WorkspaceMode::default(),
            exclude: default_workspace_exclude(),
            temp_dir: None,
        }
    }
}

fn default_source_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_workspace_exclude() -> Vec<String> {
    vec![".git".to_string()]
}

/// Configuration for the local provisioner.
///
/// `setup_command` and `env` values may use the `{timezone}` and
/// `{runtime_version}` placeholders.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalProvisionerConfig {
    /// If set, timezones must exist as files under this directory.
    pub zoneinfo_dir: Option<PathBuf>,

    /// Command run once per job before its tests.
    pub setup_command: Option<String>,

    /// Shell used for the setup command.
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Timeout for the setup command in seconds.
    #[serde(default = "default_setup_timeout")]
    pub setup_timeout_secs: u64,

    /// Extra variables exported to the job (templated).
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for LocalProvisionerConfig {
    fn default() -> Self {
        Self {
            zoneinfo_dir: None,
            setup_command: None,
            shell: default_shell(),
            setup_timeout_secs: default_setup_timeout(),
            env: HashMap::new(),
        }
    }
}

fn default_setup_timeout() -> u64 {
    600
}

/// Configuration for the shell runner.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShellRunnerConfig {
    /// Shell to use for running commands.
    ///
    /// Commands are executed via `{shell} -c "{command}"`.
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Environment variables set for every test command.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Argument appended to the command when a profile is selected.
    #[serde(default = "default_profile_arg")]
    pub profile_arg: String,

    /// Lines of output kept for summaries.
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,
}

impl Default for ShellRunnerConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            env: HashMap::new(),
            profile_arg: default_profile_arg(),
            log_tail_lines: default_log_tail_lines(),
        }
    }
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

fn default_profile_arg() -> String {
    "-P{profile}".to_string()
}

fn default_log_tail_lines() -> usize {
    40
}

/// Dependency cache configuration.
///
/// Caching is active when `enabled` is true and at least one descriptor
/// is listed. Descriptors and paths are relative to the working tree.
///
/// # Example
///
/// ```toml
/// [cache]
/// dir = "~/.cache/jobmatrix"
/// namespace = "maven"
/// descriptors = ["pom.xml"]
/// paths = [".m2/repository"]
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Store directory; `~` is expanded.
    #[serde(default = "default_cache_dir")]
    pub dir: String,

    /// Namespace part of the key, e.g. `maven`.
    #[serde(default = "default_cache_namespace")]
    pub namespace: String,

    /// Files whose contents determine the key.
    #[serde(default)]
    pub descriptors: Vec<PathBuf>,

    /// Paths packed into the cache entry.
    #[serde(default)]
    pub paths: Vec<PathBuf>,
}

impl CacheConfig {
    /// Whether jobs should use the cache.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.descriptors.is_empty()
    }

    /// Store directory with `~` expanded.
    pub fn dir_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.dir).into_owned())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_cache_dir(),
            namespace: default_cache_namespace(),
            descriptors: Vec::new(),
            paths: Vec::new(),
        }
    }
}

fn default_cache_dir() -> String {
    "~/.cache/jobmatrix".to_string()
}

fn default_cache_namespace() -> String {
    "deps".to_string()
}

/// Report output configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory for reports and job logs.
    #[serde(default = "default_report_dir")]
    pub output_dir: PathBuf,

    /// Write a JUnit XML report.
    #[serde(default = "default_true")]
    pub junit: bool,

    #[serde(default = "default_junit_file")]
    pub junit_file: String,

    /// Write a JSON run report.
    #[serde(default = "default_true")]
    pub json: bool,

    #[serde(default = "default_json_file")]
    pub json_file: String,
}

impl ReportConfig {
    /// Directory holding per-job logs.
    pub fn logs_dir(&self) -> PathBuf {
        self.output_dir.join("logs")
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_report_dir(),
            junit: true,
            junit_file: default_junit_file(),
            json: true,
            json_file: default_json_file(),
        }
    }
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("matrix-results")
}

fn default_true() -> bool {
    true
}

fn default_junit_file() -> String {
    "junit.xml".to_string()
}

fn default_json_file() -> String {
    "report.json".to_string()
}

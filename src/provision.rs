//! Environment provisioning for a single job.
//!
//! A [`Provisioner`] establishes the environment a job's tests run in: the
//! timezone and the language runtime. It never touches process-wide state.
//! Instead it returns a [`JobEnvironment`] that the job runner passes to
//! the test command explicitly, so concurrent jobs with different
//! timezones cannot leak into each other.
//!
//! ```text
//! JobSpec(timezone=Europe/Amsterdam) ──► provision("Europe/Amsterdam", "17")
//!                                              │
//!                                              ▼
//!                              JobEnvironment { TZ=Europe/Amsterdam,
//!                                               JAVA_HOME=/opt/jdk-17 }
//!                                              │
//!                                              ▼
//!                                     test command's child env
//! ```

pub mod local;

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

static TIMEZONE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9_+\-]*(/[A-Za-z0-9_+\-]+)*$")
        .expect("timezone pattern is valid")
});

static RUNTIME_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._+\-]*$").expect("version pattern is valid"));

/// Errors that prevent a job's environment from being established.
///
/// Fatal for the job that hit it, never for the run.
#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    /// The timezone is not a syntactically valid IANA name.
    #[error("invalid timezone '{0}'")]
    InvalidTimezone(String),

    /// The timezone is well-formed but not installed.
    #[error("unknown timezone '{timezone}' (not found under {zoneinfo})")]
    UnknownTimezone { timezone: String, zoneinfo: String },

    /// The runtime version string is malformed.
    #[error("invalid runtime version '{0}'")]
    InvalidRuntime(String),

    /// The setup command ran and failed.
    #[error("setup command failed with exit code {exit_code}: {stderr}")]
    SetupFailed { exit_code: i32, stderr: String },

    /// The setup command did not finish in time.
    #[error("setup command timed out after {0}s")]
    SetupTimeout(u64),

    /// I/O error while provisioning.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Environment variables established for one job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobEnvironment {
    vars: Vec<(String, String)>,
}

impl JobEnvironment {
    /// Creates an empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a variable, replacing an earlier value for the same name.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.vars.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.vars.push((key, value)),
        }
    }

    /// Looks up a variable.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All variables in insertion order.
    pub fn vars(&self) -> &[(String, String)] {
        &self.vars
    }
}

impl<K: Into<String>, V: Into<String>> Extend<(K, V)> for JobEnvironment {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (k, v) in iter {
            self.set(k, v);
        }
    }
}

/// Establishes the timezone and runtime for one job.
///
/// Implementations must be safe to call concurrently for different jobs
/// and must not mutate process-global settings.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Provisions the environment for a job.
    ///
    /// # Arguments
    ///
    /// * `timezone` - IANA timezone name, e.g. `Europe/Amsterdam`
    /// * `runtime_version` - Language runtime version, e.g. `17`
    async fn provision(
        &self,
        timezone: &str,
        runtime_version: &str,
    ) -> Result<JobEnvironment, ProvisioningError>;
}

/// Checks the timezone and runtime version are well-formed.
pub fn validate_request(timezone: &str, runtime_version: &str) -> Result<(), ProvisioningError> {
    if !TIMEZONE_NAME.is_match(timezone) {
        return Err(ProvisioningError::InvalidTimezone(timezone.to_string()));
    }
    if !RUNTIME_VERSION.is_match(runtime_version) {
        return Err(ProvisioningError::InvalidRuntime(runtime_version.to_string()));
    }
    Ok(())
}

/// Substitutes `{timezone}` and `{runtime_version}` in a template.
pub fn render_template(template: &str, timezone: &str, runtime_version: &str) -> String {
    template
        .replace("{timezone}", timezone)
        .replace("{runtime_version}", runtime_version)
}

//! Local provisioner.
//!
//! Validates the requested timezone, optionally checks it is installed
//! under a zoneinfo directory, optionally runs a setup command (e.g. to
//! install or select a JDK), and returns `TZ` plus any templated variables.
//!
//! # Example Configuration
//!
//! ```toml
//! [provisioner]
//! zoneinfo_dir = "/usr/share/zoneinfo"
//! setup_command = "sdk use java {runtime_version}-tem"
//!
//! [provisioner.env]
//! JAVA_HOME = "/opt/java/temurin-{runtime_version}"
//! ```

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{JobEnvironment, Provisioner, ProvisioningError, render_template, validate_request};
use crate::config::LocalProvisionerConfig;

/// Provisioner that prepares jobs on the local host.
pub struct LocalProvisioner {
    config: LocalProvisionerConfig,
}

impl LocalProvisioner {
    /// Creates a provisioner with the given configuration.
    pub fn new(config: LocalProvisionerConfig) -> Self {
        Self { config }
    }

    async fn run_setup(
        &self,
        command: &str,
        env: &JobEnvironment,
    ) -> Result<(), ProvisioningError> {
        debug!("Running setup command: {}", command);

        let mut process = tokio::process::Command::new(&self.config.shell);
        process
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env.vars() {
            process.env(key, value);
        }

        let timeout = Duration::from_secs(self.config.setup_timeout_secs);
        let output = tokio::time::timeout(timeout, process.output())
            .await
            .map_err(|_| ProvisioningError::SetupTimeout(self.config.setup_timeout_secs))??;

        if !output.status.success() {
            return Err(ProvisioningError::SetupFailed {
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl Provisioner for LocalProvisioner {
    async fn provision(
        &self,
        timezone: &str,
        runtime_version: &str,
    ) -> Result<JobEnvironment, ProvisioningError> {
        validate_request(timezone, runtime_version)?;

        if let Some(zoneinfo) = &self.config.zoneinfo_dir {
            let zone_file = zoneinfo.join(timezone);
            let is_zone = tokio::fs::metadata(&zone_file)
                .await
                .is_ok_and(|meta| meta.is_file());
            if !is_zone {
                return Err(ProvisioningError::UnknownTimezone {
                    timezone: timezone.to_string(),
                    zoneinfo: zoneinfo.display().to_string(),
                });
            }
        }

        let mut env = JobEnvironment::new();
        env.set("TZ", timezone);
        let mut extra: Vec<_> = self.config.env.iter().collect();
        extra.sort();
        for (key, template) in extra {
            env.set(key.clone(), render_template(template, timezone, runtime_version));
        }

        if let Some(template) = &self.config.setup_command {
            let command = render_template(template, timezone, runtime_version);
            self.run_setup(&command, &env).await?;
        }

        debug!("Provisioned timezone={} runtime={}", timezone, runtime_version);
        Ok(env)
    }
}

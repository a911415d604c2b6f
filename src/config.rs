//! Configuration loading and schema definitions for jobmatrix.
//!
//! This module provides types and functions for loading jobmatrix
//! configuration from TOML files or strings.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads jobmatrix configuration from a TOML file.
///
/// Only parsing happens here; call [`Config::validate`] to check the
/// matrix and settings before running.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use jobmatrix::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("jobmatrix.toml"))?;
/// println!("Command: {}", config.matrix.command);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads jobmatrix configuration from a TOML string.
///
/// # Example
///
/// ```
/// use jobmatrix::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [matrix]
///     command = "mvn -B test"
///     max_parallel = 2
///
///     [[axis]]
///     name = "timezone"
///     values = ["UTC", "Europe/Amsterdam"]
/// "#)?;
///
/// assert_eq!(config.matrix.max_parallel, Some(2));
/// assert_eq!(config.validate()?.len(), 2);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

//! jobmatrix: run one test suite across a matrix of environments.
//!
//! A matrix of axes (typically `timezone` × build `profile`) is expanded into
//! independent jobs. Each job gets its own working tree, a provisioned
//! timezone and runtime, a restored dependency cache, and one run of the
//! test command. Results are aggregated into a single pass/fail verdict.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Matrix**: Expand axis definitions into job specs
//! - **Cache**: Content-hashed keys with prefix fallback over a shared store
//! - **Workspace**: Per-job working trees
//! - **Provision**: Timezone and runtime setup per job
//! - **Runner**: Execute the test command with a profile and timeout
//! - **Orchestrator**: Concurrency, cancellation and the per-job sequence
//! - **Result**: Job results and the run report
//! - **Report**: Console, JUnit XML and JSON output
//!
//! # Example
//!
//! ```no_run
//! use jobmatrix::config::load_config;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("jobmatrix.toml"))?;
//!     for job in config.validate()? {
//!         println!("{}", job);
//!     }
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod matrix;
pub mod orchestrator;
pub mod provision;
pub mod report;
pub mod result;
pub mod runner;
pub mod trigger;
pub mod workspace;

// Re-export commonly used types
pub use cache::{CacheKey, CacheKeyResolver, CacheLookup, CacheOutcome, CacheStore};
pub use config::{Config, load_config};
pub use matrix::{AxisDefinition, ConfigurationError, JobSpec, expand};
pub use orchestrator::Orchestrator;
pub use provision::{JobEnvironment, Provisioner};
pub use report::Reporter;
pub use result::{ErrorKind, JobResult, JobStatus, ResultAggregator, RunReport};
pub use runner::TestRunner;
pub use trigger::{TriggerEvent, TriggerKind};
pub use workspace::WorkspaceProvider;

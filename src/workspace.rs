//! Working trees for jobs.
//!
//! Every job runs in a working tree it owns for its whole duration. A
//! [`WorkspaceProvider`] hands trees out and takes them back; the job runner
//! releases the tree on every exit path, including failures and
//! cancellation.

pub mod local;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::TempDir;

use crate::matrix::JobSpec;

/// Errors acquiring or releasing a working tree.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    /// The source directory does not exist.
    #[error("source directory not found: {0}")]
    SourceMissing(PathBuf),

    /// Copying the source into the working tree failed.
    #[error("failed to prepare working tree: {0}")]
    Prepare(String),

    /// Removing the working tree failed.
    #[error("failed to release working tree: {0}")]
    Release(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A working tree owned by one job.
///
/// Trees backed by a temporary directory are deleted when released, or
/// when dropped if release never happens.
#[derive(Debug)]
pub struct WorkingTree {
    job_id: String,
    path: PathBuf,
    temp: Option<TempDir>,
}

impl WorkingTree {
    /// A tree that lives in a temporary directory.
    pub fn temporary(job_id: impl Into<String>, temp: TempDir) -> Self {
        Self {
            job_id: job_id.into(),
            path: temp.path().to_path_buf(),
            temp: Some(temp),
        }
    }

    /// A tree that points at an existing directory and is never deleted.
    pub fn borrowed(job_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            job_id: job_id.into(),
            path: path.into(),
            temp: None,
        }
    }

    /// The job this tree belongs to.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Root directory of the tree.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the backing temp directory, if there is one.
    pub fn close(self) -> Result<(), WorkspaceError> {
        match self.temp {
            Some(temp) => temp
                .close()
                .map_err(|e| WorkspaceError::Release(e.to_string())),
            None => Ok(()),
        }
    }
}

/// Provides working trees to jobs.
#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    /// Makes a working tree available for `job`.
    async fn acquire(&self, job: &JobSpec) -> Result<WorkingTree, WorkspaceError>;

    /// Releases a tree obtained from [`acquire`](Self::acquire).
    async fn release(&self, tree: WorkingTree) -> Result<(), WorkspaceError> {
        tree.close()
    }
}

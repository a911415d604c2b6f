//! Local workspace provider.
//!
//! In `copy` mode each job gets a private copy of the source directory in
//! a temp dir, so jobs running side by side cannot see each other's build
//! output or restored caches. `in-place` mode runs every job directly in
//! the source directory and is only safe with `max_parallel = 1`.
//!
//! # Example Configuration
//!
//! ```toml
//! [workspace]
//! source_dir = "."
//! mode = "copy"
//! exclude = [".git", "target"]
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{WorkingTree, WorkspaceError, WorkspaceProvider};
use crate::config::{WorkspaceConfig, WorkspaceMode};
use crate::matrix::JobSpec;

/// Provides working trees from a local source directory.
pub struct LocalWorkspaceProvider {
    config: WorkspaceConfig,
}

impl LocalWorkspaceProvider {
    /// Creates a provider with the given configuration.
    pub fn new(config: WorkspaceConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl WorkspaceProvider for LocalWorkspaceProvider {
    async fn acquire(&self, job: &JobSpec) -> Result<WorkingTree, WorkspaceError> {
        let source = &self.config.source_dir;
        if !tokio::fs::try_exists(source).await.unwrap_or(false) {
            return Err(WorkspaceError::SourceMissing(source.clone()));
        }

        match self.config.mode {
            WorkspaceMode::InPlace => Ok(WorkingTree::borrowed(job.id(), source.clone())),
            WorkspaceMode::Copy => {
                let mut builder = tempfile::Builder::new();
                let prefix = format!("jobmatrix-{}-", job.slug());
                builder.prefix(&prefix);
                let temp = match &self.config.temp_dir {
                    Some(dir) => {
                        tokio::fs::create_dir_all(dir).await?;
                        builder.tempdir_in(dir)?
                    }
                    None => builder.tempdir()?,
                };

                copy_dir_all(source, temp.path(), &self.config.exclude)
                    .await
                    .map_err(|e| WorkspaceError::Prepare(e.to_string()))?;

                debug!("[{}] Working tree at {}", job, temp.path().display());
                Ok(WorkingTree::temporary(job.id(), temp))
            }
        }
    }
}

/// Recursively copy a directory, skipping entries whose name is excluded.
async fn copy_dir_all(src: &Path, dst: &Path, exclude: &[String]) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dst).await?;

    let mut entries = tokio::fs::read_dir(src).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if exclude.iter().any(|e| name.to_str() == Some(e.as_str())) {
            continue;
        }

        let ty = entry.file_type().await?;
        let src_path = entry.path();
        let dst_path: PathBuf = dst.join(&name);

        if ty.is_dir() {
            Box::pin(copy_dir_all(&src_path, &dst_path, exclude)).await?;
        } else if ty.is_symlink() {
            copy_symlink(&src_path, &dst_path).await?;
        } else {
            tokio::fs::copy(&src_path, &dst_path).await?;
        }
    }

    Ok(())
}

#[cfg(unix)]
async fn copy_symlink(src: &Path, dst: &Path) -> std::io::Result<()> {
    let target = tokio::fs::read_link(src).await?;
    tokio::fs::symlink(target, dst).await
}

#[cfg(not(unix))]
async fn copy_symlink(src: &Path, dst: &Path) -> std::io::Result<()> {
    tokio::fs::copy(src, dst).await.map(|_| ())
}

//! Runs one job from working tree to verdict.
//!
//! The [`JobRunner`] sequences the steps for a single [`JobSpec`]:
//!
//! 1. Acquire a working tree
//! 2. Provision the timezone and runtime
//! 3. Resolve the cache key and restore the cache into the tree
//! 4. Run the test command
//! 5. Save the cache after a passing run that did not get an exact hit
//! 6. Release the working tree
//!
//! Every error is contained in the returned [`JobResult`]; the working tree
//! is released on every path, including cancellation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{self, CacheError, CacheKey, CacheKeyResolver, CacheOutcome, CacheStore};
use crate::matrix::JobSpec;
use crate::provision::Provisioner;
use crate::result::{ErrorKind, JobResult, JobStatus};
use crate::runner::{RunRequest, RunnerError, TestRunner};
use crate::workspace::WorkspaceProvider;

/// Per-run settings shared by every job.
#[derive(Debug, Clone)]
pub struct JobSettings {
    /// Base test command.
    pub command: String,

    /// Runtime version handed to the provisioner.
    pub runtime_version: String,

    /// Timezone for jobs whose matrix has no timezone axis.
    pub default_timezone: String,

    /// Limit for the test command.
    pub timeout: Duration,

    /// Variables exported to every job before its own.
    pub env: Vec<(String, String)>,
}

/// Cache wiring for a run.
#[derive(Clone)]
pub struct CacheContext {
    pub resolver: CacheKeyResolver,
    pub store: Arc<dyn CacheStore>,

    /// Descriptor files, relative to the working tree.
    pub descriptors: Vec<PathBuf>,

    /// Paths packed into entries, relative to the working tree.
    pub paths: Vec<PathBuf>,
}

/// Executes single jobs against borrowed collaborators.
pub struct JobRunner<'a> {
    workspace: &'a dyn WorkspaceProvider,
    provisioner: &'a dyn Provisioner,
    runner: &'a dyn TestRunner,
    settings: JobSettings,
    cache: Option<CacheContext>,
}

impl<'a> JobRunner<'a> {
    pub fn new(
        workspace: &'a dyn WorkspaceProvider,
        provisioner: &'a dyn Provisioner,
        runner: &'a dyn TestRunner,
        settings: JobSettings,
    ) -> Self {
        Self {
            workspace,
            provisioner,
            runner,
            settings,
            cache: None,
        }
    }

    /// Enables cache restore and save.
    pub fn with_cache(mut self, cache: CacheContext) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Runs `job` to completion, or until `cancel` fires.
    pub async fn run(&self, job: &JobSpec, cancel: &CancellationToken) -> JobResult {
        let start = Instant::now();

        if cancel.is_cancelled() {
            return JobResult::cancelled(job.clone());
        }

        let tree = match self.workspace.acquire(job).await {
            Ok(tree) => tree,
            Err(e) => {
                error!("[{}] Failed to acquire working tree: {}", job, e);
                let mut result = JobResult::errored(job.clone(), ErrorKind::Workspace, e.to_string());
                result.duration = start.elapsed();
                return result;
            }
        };

        let mut result = self.run_in_tree(job, tree.path(), cancel).await;

        if let Err(e) = self.workspace.release(tree).await {
            warn!("[{}] Failed to release working tree: {}", job, e);
        }

        result.duration = start.elapsed();
        result
    }

    async fn run_in_tree(&self, job: &JobSpec, root: &Path, cancel: &CancellationToken) -> JobResult {
        let timezone = job.timezone().unwrap_or(&self.settings.default_timezone);

        let provisioned = tokio::select! {
            biased;
            _ = cancel.cancelled() => return JobResult::cancelled(job.clone()),
            r = self.provisioner.provision(timezone, &self.settings.runtime_version) => r,
        };
        let job_env = match provisioned {
            Ok(env) => env,
            Err(e) => {
                error!("[{}] Provisioning failed: {}", job, e);
                return JobResult::errored(job.clone(), ErrorKind::Provisioning, e.to_string());
            }
        };
        debug!("[{}] Provisioned timezone {}", job, timezone);

        let (cache_outcome, cache_key) = self.restore_cache(job, root).await;

        let mut result = JobResult::new(job.clone(), JobStatus::Cancelled);
        result.cache = cache_outcome;
        result.cache_key = cache_key.as_ref().map(|k| k.to_string());

        if cancel.is_cancelled() {
            result.message = Some("cancelled before completion".to_string());
            return result;
        }

        let mut env = self.settings.env.clone();
        env.extend(job.env_vars());
        env.extend(job_env.vars().iter().cloned());

        let slug = job.slug();
        let request = RunRequest {
            job_id: job.id(),
            job_slug: &slug,
            command: &self.settings.command,
            profile: job.profile(),
            working_dir: root,
            env: &env,
            timeout: self.settings.timeout,
        };

        info!("[{}] Running tests", job);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            r = tokio::time::timeout(self.settings.timeout, self.runner.run(&request)) => Some(r),
        };

        match outcome {
            None => {
                warn!("[{}] Cancelled while running", job);
                result.message = Some("cancelled while running".to_string());
                return result;
            }
            Some(Err(_)) | Some(Ok(Err(RunnerError::Timeout(_)))) => {
                error!("[{}] Timed out after {:?}", job, self.settings.timeout);
                result.status = JobStatus::Errored(ErrorKind::Timeout);
                result.message = Some(format!("timed out after {:?}", self.settings.timeout));
                return result;
            }
            Some(Ok(Err(e))) => {
                error!("[{}] Runner error: {}", job, e);
                result.status = JobStatus::Errored(ErrorKind::Runner);
                result.message = Some(e.to_string());
                return result;
            }
            Some(Ok(Ok(output))) => {
                result.status = if output.success() {
                    JobStatus::Passed
                } else {
                    JobStatus::Failed
                };
                result.exit_code = Some(output.exit_code);
                result.log_ref = output.log_ref;
                result.log_tail = output.log_tail;
                info!("[{}] {} (exit code {})", job, result.status, output.exit_code);
            }
        }

        if result.status.is_passed()
            && cache_outcome != CacheOutcome::ExactHit
            && let Some(key) = cache_key
        {
            result.cache_saved = self.save_cache(job, root, key).await;
        }

        result
    }

    /// Resolves the key and unpacks the best entry into the tree.
    async fn restore_cache(&self, job: &JobSpec, root: &Path) -> (CacheOutcome, Option<CacheKey>) {
        let Some(cache) = &self.cache else {
            return (CacheOutcome::Disabled, None);
        };

        let descriptors: Vec<PathBuf> = cache.descriptors.iter().map(|d| root.join(d)).collect();
        let key = match cache.resolver.resolve(&descriptors) {
            Ok(key) => key,
            Err(e) => {
                warn!("[{}] Cache disabled for this job: {}", job, e);
                return (CacheOutcome::Unavailable, None);
            }
        };

        let store = cache.store.clone();
        let lookup_key = key.clone();
        let dest = root.to_path_buf();
        let restored = tokio::task::spawn_blocking(move || {
            let found = cache::lookup(store.as_ref(), &lookup_key);
            if let Some(blob) = found.blob()
                && let Err(e) = cache::unpack(blob, &dest)
            {
                warn!("Failed to restore cache {}: {}", lookup_key, e);
                return CacheOutcome::Miss;
            }
            found.outcome()
        })
        .await;

        let outcome = restored.unwrap_or_else(|e| {
            warn!("[{}] Cache restore task failed: {}", job, e);
            CacheOutcome::Miss
        });
        info!("[{}] Cache {} for {}", job, outcome, key);
        (outcome, Some(key))
    }

    /// Packs the cache paths and stores them under `key`.
    async fn save_cache(&self, job: &JobSpec, root: &Path, key: CacheKey) -> bool {
        let Some(cache) = &self.cache else {
            return false;
        };

        let store = cache.store.clone();
        let paths = cache.paths.clone();
        let src = root.to_path_buf();
        let put_key = key.clone();
        let saved = tokio::task::spawn_blocking(move || -> Result<bool, CacheError> {
            match cache::pack(&src, &paths)? {
                Some(blob) => {
                    store.put(put_key.as_str(), &blob)?;
                    Ok(true)
                }
                None => Ok(false),
            }
        })
        .await;

        match saved {
            Ok(Ok(true)) => {
                info!("[{}] Saved cache {}", job, key);
                true
            }
            Ok(Ok(false)) => {
                debug!("[{}] No cache paths to save", job);
                false
            }
            Ok(Err(e)) => {
                warn!("[{}] Failed to save cache {}: {}", job, key, e);
                false
            }
            Err(e) => {
                warn!("[{}] Cache save task failed: {}", job, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryCacheStore;
    use crate::matrix::{AxisDefinition, expand};
    use crate::provision::{JobEnvironment, ProvisioningError};
    use crate::runner::RunOutput;
    use crate::workspace::{WorkingTree, WorkspaceError};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Hands out a fresh temp dir with a pom.xml per job.
    struct TempWorkspace {
        released: Mutex<Vec<String>>,
    }

    impl TempWorkspace {
        fn new() -> Self {
            Self {
                released: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl WorkspaceProvider for TempWorkspace {
        async fn acquire(&self, job: &JobSpec) -> Result<WorkingTree, WorkspaceError> {
            let dir = TempDir::new()?;
            std::fs::write(dir.path().join("pom.xml"), "<project/>")?;
            Ok(WorkingTree::temporary(job.id(), dir))
        }

        async fn release(&self, tree: WorkingTree) -> Result<(), WorkspaceError> {
            self.released.lock().unwrap().push(tree.job_id().to_string());
            tree.close()
        }
    }

    struct TzProvisioner;

    #[async_trait]
    impl Provisioner for TzProvisioner {
        async fn provision(
            &self,
            timezone: &str,
            _runtime_version: &str,
        ) -> Result<JobEnvironment, ProvisioningError> {
            if timezone == "Mars/Olympus" {
                return Err(ProvisioningError::UnknownTimezone {
                    timezone: timezone.to_string(),
                    zoneinfo: "/usr/share/zoneinfo".to_string(),
                });
            }
            let mut env = JobEnvironment::new();
            env.set("TZ", timezone);
            Ok(env)
        }
    }

    /// Writes the dependency dir and exits with a fixed code.
    struct FixedRunner {
        exit_code: i32,
        delay: Duration,
        seen_env: Mutex<Vec<(String, String)>>,
    }

    impl FixedRunner {
        fn new(exit_code: i32) -> Self {
            Self {
                exit_code,
                delay: Duration::ZERO,
                seen_env: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TestRunner for FixedRunner {
        async fn run(&self, request: &RunRequest<'_>) -> Result<RunOutput, RunnerError> {
            *self.seen_env.lock().unwrap() = request.env.to_vec();
            std::fs::create_dir_all(request.working_dir.join(".m2")).unwrap();
            std::fs::write(request.working_dir.join(".m2/dep.jar"), "jar").unwrap();
            tokio::time::sleep(self.delay).await;
            Ok(RunOutput {
                exit_code: self.exit_code,
                log_ref: None,
                log_tail: vec![],
            })
        }
    }

    fn job(tz: &str) -> JobSpec {
        expand(&[AxisDefinition::new("timezone", [tz])], &[])
            .unwrap()
            .remove(0)
    }

    fn settings() -> JobSettings {
        JobSettings {
            command: "mvn -B test".to_string(),
            runtime_version: "17".to_string(),
            default_timezone: "UTC".to_string(),
            timeout: Duration::from_secs(10),
            env: vec![("JOBMATRIX_TRIGGER".to_string(), "manual".to_string())],
        }
    }

    fn cache_ctx(store: Arc<MemoryCacheStore>) -> CacheContext {
        CacheContext {
            resolver: CacheKeyResolver::with_platform("linux-x86_64", "maven"),
            store,
            descriptors: vec![PathBuf::from("pom.xml")],
            paths: vec![PathBuf::from(".m2")],
        }
    }

    #[tokio::test]
    async fn test_passing_job_saves_cache_then_hits() {
        let workspace = TempWorkspace::new();
        let runner = FixedRunner::new(0);
        let store = Arc::new(MemoryCacheStore::new());
        let job_runner = JobRunner::new(&workspace, &TzProvisioner, &runner, settings())
            .with_cache(cache_ctx(store.clone()));
        let cancel = CancellationToken::new();

        let first = job_runner.run(&job("Europe/Amsterdam"), &cancel).await;
        assert_eq!(first.status, JobStatus::Passed);
        assert_eq!(first.cache, CacheOutcome::Miss);
        assert!(first.cache_saved);
        assert_eq!(store.len(), 1);

        let second = job_runner.run(&job("UTC"), &cancel).await;
        assert_eq!(second.cache, CacheOutcome::ExactHit);
        assert!(!second.cache_saved);
        assert_eq!(first.cache_key, second.cache_key);

        assert_eq!(workspace.released.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_env_carries_tz_and_matrix_vars() {
        let workspace = TempWorkspace::new();
        let runner = FixedRunner::new(0);
        let job_runner = JobRunner::new(&workspace, &TzProvisioner, &runner, settings());

        let result = job_runner
            .run(&job("Europe/Amsterdam"), &CancellationToken::new())
            .await;
        assert_eq!(result.cache, CacheOutcome::Disabled);

        let env = runner.seen_env.lock().unwrap().clone();
        assert!(env.contains(&("TZ".to_string(), "Europe/Amsterdam".to_string())));
        assert!(env.contains(&("MATRIX_TIMEZONE".to_string(), "Europe/Amsterdam".to_string())));
        assert!(env.contains(&("JOBMATRIX_TRIGGER".to_string(), "manual".to_string())));
    }

    #[tokio::test]
    async fn test_failing_job_does_not_save_cache() {
        let workspace = TempWorkspace::new();
        let runner = FixedRunner::new(1);
        let store = Arc::new(MemoryCacheStore::new());
        let job_runner = JobRunner::new(&workspace, &TzProvisioner, &runner, settings())
            .with_cache(cache_ctx(store.clone()));

        let result = job_runner.run(&job("UTC"), &CancellationToken::new()).await;
        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.exit_code, Some(1));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_provisioning_error_releases_tree() {
        let workspace = TempWorkspace::new();
        let runner = FixedRunner::new(0);
        let job_runner = JobRunner::new(&workspace, &TzProvisioner, &runner, settings());

        let result = job_runner
            .run(&job("Mars/Olympus"), &CancellationToken::new())
            .await;
        assert_eq!(result.status, JobStatus::Errored(ErrorKind::Provisioning));
        assert!(result.message.unwrap().contains("Mars/Olympus"));
        assert_eq!(workspace.released.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_runner_ignoring_timeout_is_stopped() {
        let workspace = TempWorkspace::new();
        let runner = FixedRunner {
            delay: Duration::from_secs(30),
            ..FixedRunner::new(0)
        };
        let job_runner = JobRunner::new(
            &workspace,
            &TzProvisioner,
            &runner,
            JobSettings {
                timeout: Duration::from_millis(100),
                ..settings()
            },
        );

        let result = job_runner.run(&job("UTC"), &CancellationToken::new()).await;
        assert_eq!(result.status, JobStatus::Errored(ErrorKind::Timeout));
        assert_eq!(workspace.released.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_while_running() {
        let workspace = TempWorkspace::new();
        let runner = FixedRunner {
            delay: Duration::from_secs(30),
            ..FixedRunner::new(0)
        };
        let job_runner = JobRunner::new(&workspace, &TzProvisioner, &runner, settings());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = job_runner.run(&job("UTC"), &cancel).await;
        assert_eq!(result.status, JobStatus::Cancelled);
        assert_eq!(workspace.released.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_descriptor_is_not_fatal() {
        let workspace = TempWorkspace::new();
        let runner = FixedRunner::new(0);
        let store = Arc::new(MemoryCacheStore::new());
        let mut ctx = cache_ctx(store.clone());
        ctx.descriptors = vec![PathBuf::from("build.gradle")];
        let job_runner =
            JobRunner::new(&workspace, &TzProvisioner, &runner, settings()).with_cache(ctx);

        let result = job_runner.run(&job("UTC"), &CancellationToken::new()).await;
        assert_eq!(result.status, JobStatus::Passed);
        assert_eq!(result.cache, CacheOutcome::Unavailable);
        assert!(store.is_empty());
    }
}

//! Shell runner implementation.
//!
//! Runs `{shell} -c "{command} {profile_arg}"` as a child process in the
//! job's working tree. Stdout and stderr are merged line by line into a
//! per-job log file, a bounded tail is kept for summaries, and lines can
//! be forwarded live through an [`OutputCallback`].
//!
//! # Example Configuration
//!
//! ```toml
//! [runner]
//! shell = "/bin/bash"
//! profile_arg = "-P{profile}"
//! log_tail_lines = 40
//!
//! [runner.env]
//! MAVEN_OPTS = "-Xmx2g"
//! ```

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, warn};

use super::{
    OutputCallback, OutputLine, RunOutput, RunRequest, RunnerError, TestRunner, command_line,
};
use crate::config::ShellRunnerConfig;

/// How long to keep reading output after the command has exited.
const OUTPUT_GRACE: Duration = Duration::from_millis(250);

/// Runner that executes the test command through a local shell.
pub struct ShellRunner {
    config: ShellRunnerConfig,
    log_dir: Option<PathBuf>,
    output_callback: Option<OutputCallback>,
}

impl ShellRunner {
    /// Creates a shell runner.
    ///
    /// # Arguments
    ///
    /// * `config` - Shell, extra environment and profile template
    /// * `log_dir` - Directory for per-job log files; `None` keeps only the tail
    pub fn new(config: ShellRunnerConfig, log_dir: Option<PathBuf>) -> Self {
        Self {
            config,
            log_dir,
            output_callback: None,
        }
    }

    /// Forwards every output line to `callback` as it arrives.
    pub fn with_output_callback(mut self, callback: OutputCallback) -> Self {
        self.output_callback = Some(callback);
        self
    }

    async fn record(
        &self,
        job_id: &str,
        capture: &mut Capture,
        line: OutputLine,
    ) -> std::io::Result<()> {
        if let Some(callback) = &self.output_callback {
            callback(job_id, &line);
        }
        capture.push(line).await
    }

    async fn open_log(&self, slug: &str) -> Option<(PathBuf, BufWriter<tokio::fs::File>)> {
        let dir = self.log_dir.as_ref()?;
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            warn!("Failed to create log directory {}: {}", dir.display(), e);
            return None;
        }

        let path = dir.join(format!("{}.log", slug));
        match tokio::fs::File::create(&path).await {
            Ok(file) => Some((path, BufWriter::new(file))),
            Err(e) => {
                warn!("Failed to create log file {}: {}", path.display(), e);
                None
            }
        }
    }
}

#[async_trait]
impl TestRunner for ShellRunner {
    async fn run(&self, request: &RunRequest<'_>) -> Result<RunOutput, RunnerError> {
        let shell_cmd = command_line(request.command, request.profile, &self.config.profile_arg);
        debug!("[{}] Running: {}", request.job_id, shell_cmd);

        let mut process = tokio::process::Command::new(&self.config.shell);
        process.arg("-c").arg(&shell_cmd);
        process.current_dir(request.working_dir);

        let mut base_env: Vec<_> = self.config.env.iter().collect();
        base_env.sort();
        for (key, value) in base_env {
            process.env(key, value);
        }
        for (key, value) in request.env {
            process.env(key, value);
        }

        process.stdin(Stdio::null());
        process.stdout(Stdio::piped());
        process.stderr(Stdio::piped());
        process.kill_on_drop(true);

        let mut child = process
            .spawn()
            .map_err(|e| RunnerError::Spawn(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::Spawn("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RunnerError::Spawn("stderr not captured".to_string()))?;

        let mut combined = stream::select(
            raw_lines(stdout).map(OutputLine::Stdout),
            raw_lines(stderr).map(OutputLine::Stderr),
        );

        let mut capture = Capture {
            log: self.open_log(request.job_slug).await,
            tail: VecDeque::with_capacity(self.config.log_tail_lines),
            tail_cap: self.config.log_tail_lines,
        };

        let drive = async {
            // Background processes may keep the pipes open after the
            // command exits, so the exit status ends the run, not EOF.
            let mut streams_open = true;
            let status = loop {
                tokio::select! {
                    line = combined.next(), if streams_open => match line {
                        Some(line) => self.record(request.job_id, &mut capture, line).await?,
                        None => streams_open = false,
                    },
                    status = child.wait() => break status?,
                }
            };

            if streams_open {
                let grace = tokio::time::sleep(OUTPUT_GRACE);
                tokio::pin!(grace);
                loop {
                    tokio::select! {
                        biased;
                        _ = &mut grace => {
                            debug!(
                                "[{}] Output still open after exit, detaching",
                                request.job_id
                            );
                            break;
                        }
                        line = combined.next() => match line {
                            Some(line) => self.record(request.job_id, &mut capture, line).await?,
                            None => break,
                        },
                    }
                }
            }

            Ok::<_, std::io::Error>(status)
        };

        let status = match tokio::time::timeout(request.timeout, drive).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(
                    "[{}] Test command timed out after {:?}, killing it",
                    request.job_id, request.timeout
                );
                if let Err(e) = child.start_kill() {
                    debug!("[{}] Kill after timeout failed: {}", request.job_id, e);
                }
                return Err(RunnerError::Timeout(request.timeout));
            }
        };
        drop(combined);

        let Capture { log, tail, .. } = capture;
        let log_ref = match log {
            Some((path, mut writer)) => {
                writer.flush().await?;
                Some(path)
            }
            None => None,
        };

        let exit_code = status.code().ok_or(RunnerError::Killed)?;
        debug!("[{}] Test command exited with {}", request.job_id, exit_code);

        Ok(RunOutput {
            exit_code,
            log_ref,
            log_tail: tail.into(),
        })
    }
}

/// Log file and bounded tail for one run.
struct Capture {
    log: Option<(PathBuf, BufWriter<tokio::fs::File>)>,
    tail: VecDeque<String>,
    tail_cap: usize,
}

impl Capture {
    async fn push(&mut self, line: OutputLine) -> std::io::Result<()> {
        let (OutputLine::Stdout(text) | OutputLine::Stderr(text)) = line;

        if let Some((_, writer)) = self.log.as_mut() {
            writer.write_all(text.as_bytes()).await?;
            writer.write_all(b"\n").await?;
        }

        if self.tail_cap > 0 {
            if self.tail.len() == self.tail_cap {
                self.tail.pop_front();
            }
            self.tail.push_back(text);
        }
        Ok(())
    }
}

/// Splits a pipe into lines, replacing invalid UTF-8 instead of dropping it.
fn raw_lines<R>(reader: R) -> BoxStream<'static, String>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    stream::unfold(BufReader::new(reader), |mut reader| async move {
        let mut buf = Vec::new();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => None,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                Some((String::from_utf8_lossy(&buf).into_owned(), reader))
            }
            Err(e) => {
                debug!("Stopped reading output: {}", e);
                None
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;
    use tempfile::TempDir;

    fn request<'a>(
        command: &'a str,
        profile: Option<&'a str>,
        dir: &'a std::path::Path,
        env: &'a [(String, String)],
        timeout: Duration,
    ) -> RunRequest<'a> {
        RunRequest {
            job_id: "timezone=UTC",
            job_slug: "000-timezone_UTC",
            command,
            profile,
            working_dir: dir,
            env,
            timeout,
        }
    }

    #[tokio::test]
    async fn test_passing_command_writes_log() {
        let work = TempDir::new().unwrap();
        let logs = TempDir::new().unwrap();
        let runner = ShellRunner::new(
            ShellRunnerConfig::default(),
            Some(logs.path().to_path_buf()),
        );

        let out = runner
            .run(&request("echo hello", None, work.path(), &[], Duration::from_secs(10)))
            .await
            .unwrap();

        assert!(out.success());
        assert_eq!(out.log_tail, vec!["hello".to_string()]);
        let log_path = out.log_ref.unwrap();
        assert_eq!(std::fs::read_to_string(log_path).unwrap(), "hello\n");
    }

    #[tokio::test]
    async fn test_failing_command_is_not_an_error() {
        let work = TempDir::new().unwrap();
        let runner = ShellRunner::new(ShellRunnerConfig::default(), None);

        let out = runner
            .run(&request("exit 4", None, work.path(), &[], Duration::from_secs(10)))
            .await
            .unwrap();

        assert_eq!(out.exit_code, 4);
        assert!(out.log_ref.is_none());
    }

    #[tokio::test]
    async fn test_profile_and_env_reach_command() {
        let work = TempDir::new().unwrap();
        let runner = ShellRunner::new(ShellRunnerConfig::default(), None);
        let env = vec![("TZ".to_string(), "Europe/Amsterdam".to_string())];

        let out = runner
            .run(&request(
                "echo \"$TZ\"",
                Some("spark-3.5"),
                work.path(),
                &env,
                Duration::from_secs(10),
            ))
            .await
            .unwrap();

        assert_eq!(out.log_tail, vec!["Europe/Amsterdam -Pspark-3.5".to_string()]);
    }

    #[tokio::test]
    async fn test_runs_in_working_dir() {
        let work = TempDir::new().unwrap();
        std::fs::write(work.path().join("marker"), "x").unwrap();
        let runner = ShellRunner::new(ShellRunnerConfig::default(), None);

        let out = runner
            .run(&request("test -f marker", None, work.path(), &[], Duration::from_secs(10)))
            .await
            .unwrap();
        assert!(out.success());
    }

    #[tokio::test]
    async fn test_timeout() {
        let work = TempDir::new().unwrap();
        let runner = ShellRunner::new(ShellRunnerConfig::default(), None);

        let err = runner
            .run(&request("sleep 5", None, work.path(), &[], Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_tail_is_bounded_and_callback_sees_lines() {
        let work = TempDir::new().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let runner = ShellRunner::new(
            ShellRunnerConfig {
                log_tail_lines: 2,
                ..ShellRunnerConfig::default()
            },
            None,
        )
        .with_output_callback(Arc::new(move |job_id, line| {
            seen_cb
                .lock()
                .unwrap()
                .push(format!("{}:{:?}", job_id, line));
        }));

        let out = runner
            .run(&request(
                "echo 1; echo 2; echo 3",
                None,
                work.path(),
                &[],
                Duration::from_secs(10),
            ))
            .await
            .unwrap();

        assert_eq!(out.log_tail, vec!["2".to_string(), "3".to_string()]);
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_background_process_does_not_hold_run_open() {
        let work = TempDir::new().unwrap();
        let runner = ShellRunner::new(ShellRunnerConfig::default(), None);

        let started = Instant::now();
        let out = runner
            .run(&request(
                "sleep 5 & echo started",
                None,
                work.path(),
                &[],
                Duration::from_secs(3),
            ))
            .await
            .unwrap();

        assert!(out.success());
        assert_eq!(out.log_tail, vec!["started".to_string()]);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_invalid_utf8_output_is_kept() {
        let work = TempDir::new().unwrap();
        let logs = TempDir::new().unwrap();
        let runner = ShellRunner::new(
            ShellRunnerConfig::default(),
            Some(logs.path().to_path_buf()),
        );

        let out = runner
            .run(&request(
                r"printf 'caf\351 FAILED testX\n'",
                None,
                work.path(),
                &[],
                Duration::from_secs(10),
            ))
            .await
            .unwrap();

        assert_eq!(out.log_tail, vec!["caf\u{FFFD} FAILED testX".to_string()]);
        let log = std::fs::read_to_string(out.log_ref.unwrap()).unwrap();
        assert_eq!(log, "caf\u{FFFD} FAILED testX\n");
    }
}

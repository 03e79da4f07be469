//! External command execution with per-attempt timeouts and retries.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::warn;

use crate::error::{Error, Result};
use crate::retry::with_retries;
use crate::signal::Signal;

/// Maximum time to wait for a signalled child to exit before giving up.
const WAIT_DELAY: Duration = Duration::from_secs(5);

/// Contract for running external commands on behalf of the engine.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, shutdown: &Signal, cfg: RunCommandConfig) -> Result<CommandOutput>;
}

/// Captured output of a successful command run.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Configuration for a single [`CommandRunner::run`] invocation.
#[derive(Debug, Clone)]
pub struct RunCommandConfig {
    /// Printable identification of the command for log lines.
    pub description: String,
    pub command: String,
    pub args: Vec<String>,

    pub attempts: u32,
    pub attempt_timeout: Duration,
    pub attempt_interval: Duration,

    /// Treat syntactically invalid JSON on stdout as a failed attempt.
    pub expect_json: bool,
    /// Log an "[attempt/total]" line after every failed attempt.
    pub print_errors: bool,
}

/// The principal [`CommandRunner`]: retries with per-attempt deadlines.
#[derive(Debug, Default)]
pub struct RetryCommandRunner;

impl RetryCommandRunner {
    pub fn new() -> Self {
        Self
    }

    async fn attempt(shutdown: &Signal, cfg: &RunCommandConfig) -> Result<CommandOutput> {
        let mut child = Command::new(&cfg.command)
            .args(&cfg.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| Error::io(format!("failure spawning command: {err}")))?;

        let stdout_pipe = child
            .stdout
            .take()
            .ok_or_else(|| Error::io("failure capturing command stdout"))?;
        let stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| Error::io("failure capturing command stderr"))?;

        let stdout_task = tokio::spawn(async move {
            let mut pipe = stdout_pipe;
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut pipe = stderr_pipe;
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf).await;
            buf
        });

        enum Outcome {
            Exited(std::process::ExitStatus),
            TimedOut,
            Cancelled,
        }

        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => Outcome::Exited(status),
                Err(err) => {
                    return Err(Error::io(format!("failure awaiting command: {err}")));
                }
            },
            _ = tokio::time::sleep(cfg.attempt_timeout) => Outcome::TimedOut,
            _ = shutdown.raised() => Outcome::Cancelled,
        };

        if !matches!(outcome, Outcome::Exited(_)) {
            Self::terminate(&mut child).await;
        }

        // The pipes close once the child is gone, so the readers finish.
        let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
        let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned();

        let execution_error = |source: Error| Error::Execution {
            stdout: stdout.clone(),
            stderr: stderr.clone(),
            source: Box::new(source),
        };

        match outcome {
            Outcome::Cancelled => Err(Error::Cancelled),
            Outcome::TimedOut => Err(execution_error(Error::io(format!(
                "command did not finish within {}",
                humantime::format_duration(cfg.attempt_timeout)
            )))),
            Outcome::Exited(status) if !status.success() => {
                Err(execution_error(Error::io(format!("command failed: {status}"))))
            }
            Outcome::Exited(_) => {
                if cfg.expect_json
                    && serde_json::from_str::<serde_json::Value>(&stdout).is_err()
                {
                    return Err(execution_error(Error::InvalidJson(
                        "command stdout is not valid JSON".into(),
                    )));
                }

                Ok(CommandOutput { stdout, stderr })
            }
        }
    }

    async fn terminate(child: &mut Child) {
        let _ = child.start_kill();
        let _ = tokio::time::timeout(WAIT_DELAY, child.wait()).await;
    }
}

#[async_trait]
impl CommandRunner for RetryCommandRunner {
    async fn run(&self, shutdown: &Signal, cfg: RunCommandConfig) -> Result<CommandOutput> {
        let (attempt, result) = with_retries(
            shutdown,
            || Self::attempt(shutdown, &cfg),
            |attempt, err| {
                if cfg.print_errors {
                    warn!(
                        "{}: [{}/{}] {}",
                        cfg.description, attempt, cfg.attempts, err
                    );
                }
            },
            cfg.attempts,
            cfg.attempt_interval,
        )
        .await;

        result.map_err(|err| Error::transient(attempt, cfg.attempts, err))
    }
}

//! HSM Command Module
//!
//! Runs an HSM transfer script as a child process with captured output, a hard
//! wall-clock timeout and cooperative cancellation. The script runs in its own
//! process group. A timed out or cancelled command has the whole group killed
//! before the call returns, and the deadline also bounds reading its output.

use crate::{PoolError, Result};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HsmCommandOutput {
    pub exit_code: i32,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct HsmCommand {
    command_line: String,
    max_lines: usize,
    timeout: Duration,
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Lines read from one output stream, shared with its reader task.
struct Capture {
    lines: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl Capture {
    fn spawn<R>(reader: Option<R>, max_lines: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&lines);
        let task = tokio::spawn(async move {
            let reader = match reader {
                Some(reader) => reader,
                None => return,
            };
            let mut stream = BufReader::new(reader).lines();
            // Keep draining past the limit so the child never blocks on a full pipe
            while let Ok(Some(line)) = stream.next_line().await {
                let mut buffer = captured.lock().unwrap();
                if buffer.len() < max_lines {
                    buffer.push(line);
                }
            }
        });
        Self { lines, task }
    }

    /// Stops reading and returns what was captured so far.
    fn finish(self) -> Vec<String> {
        self.task.abort();
        std::mem::take(&mut *self.lines.lock().unwrap())
    }
}

impl HsmCommand {
    pub fn new(command_line: impl Into<String>, max_lines: usize, timeout: Duration) -> Self {
        Self {
            command_line: command_line.into(),
            max_lines,
            timeout,
        }
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Runs the command to completion.
    ///
    /// Fails with `HsmCommandFailed` on a non-zero exit, `TimeoutError` when the
    /// timeout expires and `Unqueued` when `cancel` fires first. At most
    /// `max_lines` lines of each output stream are kept.
    ///
    /// Descendants still holding the output pipes when the script exits get
    /// until the deadline to finish; after that they are killed and the
    /// exit status of the script decides the result.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<HsmCommandOutput> {
        let mut parts = self.command_line.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| PoolError::HsmError("Empty HSM command".to_string()))?;

        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.timeout;

        let mut command = std::process::Command::new(program);
        command
            .args(parts)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let mut command = Command::from(command);
        command.kill_on_drop(true);
        let mut child = command
            .spawn()
            .map_err(|e| PoolError::HsmError(format!("Failed to start {}: {}", program, e)))?;
        let pid = child.id();

        let mut stdout = Capture::spawn(child.stdout.take(), self.max_lines);
        let mut stderr = Capture::spawn(child.stderr.take(), self.max_lines);

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = tokio::time::sleep_until(deadline) => Outcome::TimedOut,
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        let cancelled = matches!(outcome, Outcome::Cancelled);
        let status = match outcome {
            Outcome::Exited(status) => status,
            Outcome::TimedOut | Outcome::Cancelled => {
                kill_process_group(pid);
                let _ = child.kill().await;
                stdout.finish();
                stderr.finish();
                if cancelled {
                    debug!("HSM command cancelled: {}", self.command_line);
                    return Err(PoolError::Unqueued("HSM command was killed".to_string()));
                }
                warn!(
                    "HSM command killed after {:?}: {}",
                    self.timeout, self.command_line
                );
                return Err(PoolError::TimeoutError(format!(
                    "HSM command exceeded {:?}",
                    self.timeout
                )));
            }
        };

        // Output pipes close once every process holding them is gone
        let drained = tokio::select! {
            _ = async {
                let _ = (&mut stdout.task).await;
                let _ = (&mut stderr.task).await;
            } => true,
            _ = tokio::time::sleep_until(deadline) => false,
            _ = cancel.cancelled() => false,
        };
        if !drained {
            warn!(
                "HSM command left processes holding its output, killing them: {}",
                self.command_line
            );
            kill_process_group(pid);
        }

        let status = status.map_err(|e| {
            stdout.task.abort();
            stderr.task.abort();
            PoolError::IoError(format!("Failed to wait for {}: {}", program, e))
        })?;
        let output = HsmCommandOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: stdout.finish(),
            stderr: stderr.finish(),
        };
        debug!(
            "HSM command exited with {} after {:?}",
            output.exit_code,
            started.elapsed()
        );

        if output.exit_code != 0 {
            let message = if output.stderr.is_empty() {
                output.stdout.join("\n")
            } else {
                output.stderr.join("\n")
            };
            return Err(PoolError::HsmCommandFailed {
                code: output.exit_code,
                message,
            });
        }
        Ok(output)
    }
}

/// Kills every process in the group led by the script.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) {
        // The group may already be empty; ESRCH is fine
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn script(dir: &TempDir, body: &str) -> String {
        let path = dir.path().join("hsm.sh");
        std::fs::write(&path, body).unwrap();
        format!("sh {}", path.display())
    }

    #[tokio::test]
    async fn test_captures_output() {
        let dir = TempDir::new().unwrap();
        let command = HsmCommand::new(
            script(&dir, "echo one\necho two\necho oops >&2\n"),
            10,
            Duration::from_secs(10),
        );
        let output = command.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout, vec!["one", "two"]);
        assert_eq!(output.stderr, vec!["oops"]);
    }

    #[tokio::test]
    async fn test_output_is_bounded() {
        let dir = TempDir::new().unwrap();
        let command = HsmCommand::new(
            script(&dir, "i=0\nwhile [ $i -lt 50 ]; do echo line$i; i=$((i+1)); done\n"),
            5,
            Duration::from_secs(10),
        );
        let output = command.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(output.stdout.len(), 5);
        assert_eq!(output.stdout[0], "line0");
    }

    #[tokio::test]
    async fn test_non_zero_exit_code() {
        let dir = TempDir::new().unwrap();
        let command = HsmCommand::new(
            script(&dir, "echo 'tape not mounted' >&2\nexit 33\n"),
            10,
            Duration::from_secs(10),
        );
        match command.run(&CancellationToken::new()).await {
            Err(PoolError::HsmCommandFailed { code, message }) => {
                assert_eq!(code, 33);
                assert_eq!(message, "tape not mounted");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let dir = TempDir::new().unwrap();
        let command = HsmCommand::new(script(&dir, "sleep 30\n"), 10, Duration::from_millis(200));
        let started = Instant::now();
        let result = command.run(&CancellationToken::new()).await;
        assert!(matches!(result, Err(PoolError::TimeoutError(_))));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancellation_kills_command() {
        let dir = TempDir::new().unwrap();
        let command = HsmCommand::new(script(&dir, "sleep 30\n"), 10, Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let result = command.run(&cancel).await;
        assert!(matches!(result, Err(PoolError::Unqueued(_))));
    }

    #[tokio::test]
    async fn test_background_process_does_not_outlive_timeout() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("late");
        let command = HsmCommand::new(
            script(&dir, &format!("(sleep 2; touch {}) &\necho ok\n", marker.display())),
            10,
            Duration::from_millis(300),
        );
        let started = Instant::now();
        let output = command.run(&CancellationToken::new()).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(1500));
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout, vec!["ok"]);

        // The leftover subshell was killed with the process group
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_timeout_kills_process_group() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("late");
        let command = HsmCommand::new(
            script(&dir, &format!("(sleep 2; touch {}) &\nsleep 30\n", marker.display())),
            10,
            Duration::from_millis(200),
        );
        let started = Instant::now();
        let result = command.run(&CancellationToken::new()).await;
        assert!(matches!(result, Err(PoolError::TimeoutError(_))));
        assert!(started.elapsed() < Duration::from_millis(1500));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_missing_program() {
        let command = HsmCommand::new("/nonexistent/hsm-script get", 10, Duration::from_secs(1));
        let result = command.run(&CancellationToken::new()).await;
        assert!(matches!(result, Err(PoolError::HsmError(_))));
    }
}

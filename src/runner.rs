//! One-shot execution of workspace files with output capture and a hard
//! wall-clock timeout.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::warn;

use crate::error::GatewayError;

/// Exit code reported when a run is killed by the timeout.
pub const TIMEOUT_EXIT_CODE: i32 = -1;

/// Captured outcome of a single run job.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub stdout: String,
    pub stderr: String,
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
}

/// Spawns exactly one subprocess per call and races its exit against a
/// timeout timer. The working directory is the only confinement applied;
/// the process inherits the gateway's environment.
#[derive(Debug, Clone)]
pub struct Runner {
    interpreters: HashMap<String, String>,
    timeout: Duration,
}

impl Runner {
    /// Runner with the default interpreter table.
    pub fn new(timeout: Duration) -> Self {
        let interpreters = HashMap::from([
            ("javascript".to_string(), "node".to_string()),
            ("python".to_string(), "python3".to_string()),
            ("php".to_string(), "php".to_string()),
        ]);
        Self {
            interpreters,
            timeout,
        }
    }

    /// Add or override an interpreter mapping.
    pub fn register_interpreter(
        &mut self,
        language: impl Into<String>,
        command: impl Into<String>,
    ) {
        self.interpreters.insert(language.into(), command.into());
    }

    /// Run `target` with the interpreter configured for `language`.
    ///
    /// Output is captured incrementally per stream until the process exits
    /// or the timer fires, whichever comes first. On timeout the process is
    /// forcibly terminated and reaped, the result carries the sentinel exit
    /// code and the fixed timeout notice in `stderr`; `stdout` captured so
    /// far is preserved. On a normal exit the result carries the real exit
    /// code and `stderr` exactly as written.
    pub async fn run(
        &self,
        target: &Path,
        workdir: &Path,
        language: &str,
    ) -> Result<RunResult, GatewayError> {
        let interpreter = self
            .interpreters
            .get(language)
            .ok_or_else(|| GatewayError::UnsupportedLanguage(language.to_string()))?;
        if !target.is_file() {
            return Err(GatewayError::NotFound);
        }

        let mut child = Command::new(interpreter)
            .arg(target)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GatewayError::ExecutionError(format!("{interpreter}: {e}")))?;

        let stdout_pipe = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::ExecutionError("stdout pipe missing".into()))?;
        let stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| GatewayError::ExecutionError("stderr pipe missing".into()))?;

        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let stdout_task = tokio::spawn(capture_stream(stdout_pipe, stdout_buf.clone()));
        let stderr_task = tokio::spawn(capture_stream(stderr_pipe, stderr_buf.clone()));

        match wait_with_timeout(&mut child, self.timeout).await {
            Ok(status) => {
                // Drain both pipes to EOF so late writes are not lost.
                let _ = stdout_task.await;
                let _ = stderr_task.await;
                let stdout = std::mem::take(&mut *stdout_buf.lock());
                let stderr = std::mem::take(&mut *stderr_buf.lock());
                Ok(RunResult {
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                    exit_code: status.code().unwrap_or(0),
                })
            }
            Err(GatewayError::Timeout(secs)) => {
                warn!(target = %target.display(), secs, "run timed out, killing process");
                if let Err(e) = child.start_kill() {
                    warn!(error = %e, "failed to kill timed-out process");
                }
                let _ = child.wait().await;
                stdout_task.abort();
                stderr_task.abort();
                let stdout = std::mem::take(&mut *stdout_buf.lock());
                // Partial stderr is discarded; the fixed notice replaces it.
                Ok(RunResult {
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: timeout_notice(secs),
                    exit_code: TIMEOUT_EXIT_CODE,
                })
            }
            Err(e) => Err(e),
        }
    }
}

/// The fixed stderr notice for timed-out runs.
pub fn timeout_notice(secs: u64) -> String {
    format!("Process timeout ({secs} seconds)")
}

/// Wait for the child to exit, failing with `Timeout` if the timer fires
/// first. A single-shot race: exactly one of the two completion sources
/// decides the outcome, the other is discarded.
async fn wait_with_timeout(
    child: &mut Child,
    limit: Duration,
) -> Result<std::process::ExitStatus, GatewayError> {
    tokio::select! {
        status = child.wait() => {
            status.map_err(|e| GatewayError::ExecutionError(e.to_string()))
        }
        _ = tokio::time::sleep(limit) => Err(GatewayError::Timeout(limit.as_secs())),
    }
}

async fn capture_stream<R: AsyncRead + Unpin>(mut pipe: R, buf: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 4096];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.lock().extend_from_slice(&chunk[..n]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn shell_runner(timeout: Duration) -> Runner {
        let mut runner = Runner::new(timeout);
        runner.register_interpreter("shell", "sh");
        runner
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn captures_stdout_and_real_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "greet.sh", "echo hello\n");
        let runner = shell_runner(Duration::from_secs(10));

        let result = runner.run(&script, dir.path(), "shell").await.unwrap();
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.stderr, "");
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn surfaces_stderr_and_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "fail.sh", "echo oops >&2\nexit 3\n");
        let runner = shell_runner(Duration::from_secs(10));

        let result = runner.run(&script, dir.path(), "shell").await.unwrap();
        assert_eq!(result.stdout, "");
        assert_eq!(result.stderr, "oops\n");
        assert_eq!(result.exit_code, 3);
    }

    #[tokio::test]
    async fn runs_with_the_project_root_as_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
        let script = write_script(dir.path(), "ls.sh", "cat marker.txt\n");
        let runner = shell_runner(Duration::from_secs(10));

        let result = runner.run(&script, dir.path(), "shell").await.unwrap();
        assert_eq!(result.stdout, "here");
    }

    #[tokio::test]
    async fn timeout_kills_the_process_and_rewrites_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "slow.sh",
            "echo partial\necho noise >&2\nsleep 30\n",
        );
        let runner = shell_runner(Duration::from_secs(1));

        let started = Instant::now();
        let result = runner.run(&script, dir.path(), "shell").await.unwrap();
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "the call must return promptly after the timeout fires"
        );
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(result.stderr, "Process timeout (1 seconds)");
        assert_eq!(result.stdout, "partial\n", "stdout captured so far is preserved");
    }

    #[tokio::test]
    async fn unknown_language_is_rejected_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "x.cob", "");
        let runner = shell_runner(Duration::from_secs(10));

        let err = runner.run(&script, dir.path(), "cobol").await.unwrap_err();
        assert!(matches!(err, GatewayError::UnsupportedLanguage(ref l) if l == "cobol"));
    }

    #[tokio::test]
    async fn missing_target_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let runner = shell_runner(Duration::from_secs(10));

        let err = runner
            .run(&dir.path().join("ghost.sh"), dir.path(), "shell")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotFound));
    }

    #[tokio::test]
    async fn missing_interpreter_is_an_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "x.sh", "echo hi\n");
        let mut runner = Runner::new(Duration::from_secs(10));
        runner.register_interpreter("shell", "definitely-not-a-real-interpreter");

        let err = runner.run(&script, dir.path(), "shell").await.unwrap_err();
        assert!(matches!(err, GatewayError::ExecutionError(_)));
    }
}

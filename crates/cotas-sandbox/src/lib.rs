//! Child-process execution for model-generated code.
//!
//! The sandbox writes the code unit to a scratch script inside the
//! session's working directory, runs the configured interpreter with that
//! directory as cwd, and races completion against a wall-clock timeout.
//! Isolation is process-level: the child shares no mutable state with the
//! caller. Filesystem confinement beyond the working-directory convention
//! is a host concern (container/permission policy), not enforced here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use cotas_types::{ExecutionResult, FailureKind, MAX_OUTPUT_CHARS, TRUNCATION_MARKER};

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub interpreter: PathBuf,
    /// Arguments inserted before the script path.
    pub args: Vec<String>,
    pub timeout: Duration,
    pub script_suffix: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: PathBuf::from("python3"),
            args: Vec::new(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            script_suffix: ".py".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Sandbox {
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Run one code unit to completion. Infrastructure problems (script
    /// write, spawn) fold into `Failure` so the orchestrator can record
    /// them in the transcript instead of aborting the run.
    pub async fn execute(&self, code: &str, working_dir: &Path) -> ExecutionResult {
        self.execute_with_cancel(code, working_dir, CancellationToken::new())
            .await
    }

    /// As [`execute`](Self::execute), but aborts early when `cancel`
    /// fires. Cancellation kills the child through the same path as a
    /// timeout, so no orphaned process remains either way.
    pub async fn execute_with_cancel(
        &self,
        code: &str,
        working_dir: &Path,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let script_path = working_dir.join(format!(
            ".cotas-scratch-{}{}",
            Uuid::new_v4(),
            self.config.script_suffix
        ));
        if let Err(err) = tokio::fs::write(&script_path, code).await {
            return ExecutionResult::Failure {
                kind: FailureKind::Spawn,
                message: format!("could not stage script: {err}"),
            };
        }

        let result = self.run_script(&script_path, working_dir, cancel).await;

        if let Err(err) = tokio::fs::remove_file(&script_path).await {
            tracing::warn!(path = %script_path.display(), error = %err, "scratch script cleanup failed");
        }
        result
    }

    async fn run_script(
        &self,
        script_path: &Path,
        working_dir: &Path,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let mut command = Command::new(&self.config.interpreter);
        command
            .args(&self.config.args)
            .arg(script_path)
            .current_dir(working_dir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                return ExecutionResult::Failure {
                    kind: FailureKind::Spawn,
                    message: format!(
                        "could not start interpreter `{}`: {err}",
                        self.config.interpreter.display()
                    ),
                };
            }
        };

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return ExecutionResult::Timeout;
            }
            waited = tokio::time::timeout(self.config.timeout, child.wait()) => match waited {
                Err(_) => {
                    // Wall clock expired: kill and reap before returning.
                    let _ = child.kill().await;
                    return ExecutionResult::Timeout;
                }
                Ok(Err(err)) => {
                    return ExecutionResult::Failure {
                        kind: FailureKind::Spawn,
                        message: format!("wait on child failed: {err}"),
                    };
                }
                Ok(Ok(status)) => status,
            }
        };

        let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
        let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned();

        if status.success() {
            let mut combined = stdout;
            if !stderr.trim().is_empty() {
                if !combined.is_empty() {
                    combined.push('\n');
                }
                combined.push_str("[stderr]\n");
                combined.push_str(&stderr);
            }
            ExecutionResult::Success {
                stdout: truncate_output(&sanitize_output(&combined, working_dir, script_path)),
                value_repr: None,
            }
        } else {
            let raw = if stderr.trim().is_empty() {
                format!("process exited with {status}")
            } else {
                stderr
            };
            ExecutionResult::Failure {
                kind: FailureKind::NonZeroExit,
                message: truncate_output(&sanitize_output(&raw, working_dir, script_path)),
            }
        }
    }
}

/// Rewrite host paths so transcript entries and emitted frames never leak
/// the storage layout to the model or the consumer.
pub fn sanitize_output(raw: &str, working_dir: &Path, script_path: &Path) -> String {
    let mut out = raw.replace(&script_path.display().to_string(), "<script>");
    let dir = working_dir.display().to_string();
    if !dir.is_empty() && dir != "." {
        out = out.replace(&dir, ".");
    }
    if let Some(name) = script_path.file_name().and_then(|n| n.to_str()) {
        out = out.replace(name, "<script>");
    }
    out
}

/// Hard cap, not best-effort: the returned string never exceeds
/// [`MAX_OUTPUT_CHARS`] characters, and capped output always ends with
/// [`TRUNCATION_MARKER`].
pub fn truncate_output(raw: &str) -> String {
    if raw.chars().count() <= MAX_OUTPUT_CHARS {
        return raw.to_string();
    }
    let keep = MAX_OUTPUT_CHARS - TRUNCATION_MARKER.chars().count();
    let mut out: String = raw.chars().take(keep).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh_sandbox(timeout: Duration) -> Sandbox {
        Sandbox::new(SandboxConfig {
            interpreter: PathBuf::from("/bin/sh"),
            args: Vec::new(),
            timeout,
            script_suffix: ".sh".to_string(),
        })
    }

    #[test]
    fn truncate_output_enforces_hard_cap() {
        let raw = "x".repeat(MAX_OUTPUT_CHARS + 10_000);
        let capped = truncate_output(&raw);
        assert_eq!(capped.chars().count(), MAX_OUTPUT_CHARS);
        assert!(capped.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn truncate_output_leaves_short_output_alone() {
        let raw = "short output";
        assert_eq!(truncate_output(raw), raw);
    }

    #[test]
    fn sanitize_output_rewrites_host_paths() {
        let dir = PathBuf::from("/srv/storage/session-1");
        let script = dir.join(".cotas-scratch-abc.py");
        let raw = format!(
            "Traceback:\n  File \"{}\", line 1\nin {}",
            script.display(),
            dir.display()
        );
        let cleaned = sanitize_output(&raw, &dir, &script);
        assert!(!cleaned.contains("/srv/storage"));
        assert!(cleaned.contains("<script>"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_stdout_on_success() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sandbox = sh_sandbox(Duration::from_secs(5));
        let result = sandbox.execute("echo hello", dir.path()).await;
        match result {
            ExecutionResult::Success { stdout, .. } => assert_eq!(stdout.trim(), "hello"),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_reports_sanitized_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sandbox = sh_sandbox(Duration::from_secs(5));
        let result = sandbox
            .execute("echo boom >&2; exit 3", dir.path())
            .await;
        match result {
            ExecutionResult::Failure { kind, message } => {
                assert_eq!(kind, FailureKind::NonZeroExit);
                assert!(message.contains("boom"));
                assert!(!message.contains(&dir.path().display().to_string()));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn infinite_loop_times_out_within_bound() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sandbox = sh_sandbox(Duration::from_secs(2));
        let started = Instant::now();
        let result = sandbox.execute("while true; do :; done", dir.path()).await;
        assert_eq!(result, ExecutionResult::Timeout);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn scratch_script_is_removed_after_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sandbox = sh_sandbox(Duration::from_secs(5));
        let _ = sandbox.execute("true", dir.path()).await;
        let leftovers = std::fs::read_dir(dir.path())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with(".cotas-scratch-")
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sandbox = sh_sandbox(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });
        let started = Instant::now();
        let result = sandbox
            .execute_with_cancel("while true; do :; done", dir.path(), cancel)
            .await;
        assert_eq!(result, ExecutionResult::Timeout);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn missing_interpreter_is_a_spawn_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sandbox = Sandbox::new(SandboxConfig {
            interpreter: PathBuf::from("/nonexistent/interpreter"),
            ..SandboxConfig::default()
        });
        match sandbox.execute("print('hi')", dir.path()).await {
            ExecutionResult::Failure { kind, .. } => assert_eq!(kind, FailureKind::Spawn),
            other => panic!("expected spawn failure, got {other:?}"),
        }
    }
}

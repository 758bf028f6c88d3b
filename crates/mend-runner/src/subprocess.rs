use anyhow::{Context, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Output from a subprocess execution.
#[derive(Debug, Clone)]
pub struct SubprocessOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

impl SubprocessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// stdout followed by stderr, as a build log.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            return self.stdout.clone();
        }
        if self.stdout.is_empty() {
            return self.stderr.clone();
        }
        format!("{}\n{}", self.stdout.trim_end(), self.stderr)
    }
}

/// Run a shell command with a timeout.
pub async fn run_cmd(cmd: &str, cwd: &Path, timeout: Duration) -> Result<SubprocessOutput> {
    tracing::debug!(cmd, ?cwd, ?timeout, "spawning subprocess");
    let mut command = Command::new("sh");
    command.arg("-c").arg(cmd);
    run(command, cmd, cwd, timeout).await
}

/// Run a program with explicit arguments (no shell) and a timeout.
pub async fn run_program(
    program: &str,
    args: &[&str],
    cwd: &Path,
    timeout: Duration,
) -> Result<SubprocessOutput> {
    let label = format!("{program} {}", args.join(" "));
    tracing::debug!(cmd = %label, ?cwd, ?timeout, "spawning subprocess");
    let mut command = Command::new(program);
    command.args(args);
    run(command, &label, cwd, timeout).await
}

async fn run(
    mut command: Command,
    label: &str,
    cwd: &Path,
    timeout: Duration,
) -> Result<SubprocessOutput> {
    let child = command
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn: {label}"))?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let result = SubprocessOutput {
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                exit_code: output.status.code().unwrap_or(-1),
                timed_out: false,
            };
            tracing::debug!(
                exit_code = result.exit_code,
                stdout_len = result.stdout.len(),
                "subprocess completed"
            );
            Ok(result)
        }
        Ok(Err(e)) => Err(e).with_context(|| format!("subprocess failed: {label}")),
        Err(_) => {
            tracing::warn!(cmd = %label, ?timeout, "subprocess timed out");
            Ok(SubprocessOutput {
                stdout: String::new(),
                stderr: format!("Process timed out after {timeout:?}"),
                exit_code: -1,
                timed_out: true,
            })
        }
    }
}

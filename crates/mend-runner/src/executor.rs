//! Build executor that runs a shell command in the workspace.

use crate::collaborator::{BuildExecutor, BuildResult};
use crate::subprocess::run_cmd;
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

const DEFAULT_EXCERPT_LINES: usize = 40;

pub struct ShellBuildExecutor {
    command: String,
    timeout: Duration,
    excerpt_lines: usize,
}

impl ShellBuildExecutor {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
            excerpt_lines: DEFAULT_EXCERPT_LINES,
        }
    }

    pub fn with_excerpt_lines(mut self, lines: usize) -> Self {
        self.excerpt_lines = lines;
        self
    }
}

/// The last `lines` lines of a log.
pub fn log_tail(log: &str, lines: usize) -> String {
    let all: Vec<&str> = log.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

#[async_trait]
impl BuildExecutor for ShellBuildExecutor {
    async fn execute(
        &self,
        workspace: &Path,
        project_type: &str,
        working_dir: Option<&str>,
    ) -> Result<BuildResult> {
        let cwd = match working_dir.map(str::trim).filter(|d| !d.is_empty()) {
            Some(dir) => workspace.join(dir),
            None => workspace.to_path_buf(),
        };
        tracing::info!(cmd = %self.command, project_type, cwd = %cwd.display(), "running build");

        let started = tokio::time::Instant::now();
        let output = run_cmd(&self.command, &cwd, self.timeout).await?;
        let full_log = output.combined();
        Ok(BuildResult {
            exit_code: output.exit_code,
            log_excerpt: log_tail(&full_log, self.excerpt_lines),
            full_log,
            elapsed: started.elapsed(),
            error: output
                .timed_out
                .then(|| format!("build timed out after {:?}", self.timeout)),
        })
    }
}

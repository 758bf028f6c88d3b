//! In-memory collaborators for driving the orchestrator in tests.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use mend_core::bug::BugReport;
use mend_core::ci::{CiJob, CiObservation};
use mend_core::config::HealConfig;
use mend_core::escalation::EscalationReason;
use mend_core::fix::FixAttempt;
use mend_core::gate::PushStatus;
use mend_runner::collaborator::{
    BuildExecutor, BuildResult, CiStatusSource, FailureParser, FixGenerator, FixProposal,
    FixRequest, GitCollaborator,
};
use mend_runner::{Orchestrator, RunRequest};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const HEAD_SHA: &str = "0123456789abcdef0123456789abcdef01234567";
pub const BRANCH: &str = "ACME_ADA_AI_Fix";

pub const MAIN_PY: &str = "import os
import sys


def main()
    print(helper(1))


def helper(x):
    return x + 1
";

pub fn utils_py() -> String {
    (1..=25).map(|i| format!("value_{i} = {i}\n")).collect()
}

pub fn workspace(files: &[(&str, &str)]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (path, content) in files {
        let target = dir.path().join(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(target, content).unwrap();
    }
    dir
}

pub fn config() -> HealConfig {
    let mut config = HealConfig::default();
    config.team.team_name = "Acme".into();
    config.team.leader_name = "Ada".into();
    config
}

pub fn request(ws: &tempfile::TempDir, config: &HealConfig) -> RunRequest {
    RunRequest::from_config(ws.path(), "https://github.com/acme/app.git", "python", config)
}

pub fn orchestrator(
    config: HealConfig,
    build: ScriptedBuild,
    generator: impl FixGenerator + 'static,
    git: FakeGit,
) -> Orchestrator {
    Orchestrator::new(
        config,
        Box::new(build),
        Box::new(LineParser),
        Box::new(generator),
        Box::new(git),
    )
}

// --- build ---

#[derive(Debug, Clone)]
pub struct Step {
    exit_code: i32,
    log: String,
    delay: Duration,
}

impl Step {
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

pub fn bug_line(bug_type: &str, sub_type: &str, path: &str, line: u32) -> String {
    format!("BUG {bug_type} {sub_type} {path} {line}")
}

pub fn fails(lines: &[String]) -> Step {
    Step {
        exit_code: 1,
        log: lines.join("\n"),
        delay: Duration::ZERO,
    }
}

pub fn passes() -> Step {
    Step {
        exit_code: 0,
        log: "all tests passed".into(),
        delay: Duration::ZERO,
    }
}

/// Replays build results in order, repeating the last one.
pub struct ScriptedBuild {
    steps: Mutex<VecDeque<Step>>,
    last: Mutex<Option<Step>>,
    runs: Arc<AtomicU32>,
}

impl ScriptedBuild {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            last: Mutex::new(None),
            runs: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn runs(&self) -> Arc<AtomicU32> {
        self.runs.clone()
    }

    fn next(&self) -> Step {
        let next = self.steps.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(step) = next {
            *last = Some(step);
        }
        last.clone().unwrap_or_else(passes)
    }
}

#[async_trait]
impl BuildExecutor for ScriptedBuild {
    async fn execute(
        &self,
        _workspace: &Path,
        _project_type: &str,
        _working_dir: Option<&str>,
    ) -> Result<BuildResult> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let step = self.next();
        if !step.delay.is_zero() {
            tokio::time::sleep(step.delay).await;
        }
        Ok(BuildResult {
            exit_code: step.exit_code,
            full_log: step.log.clone(),
            log_excerpt: step.log,
            elapsed: step.delay,
            error: None,
        })
    }
}

// --- parser ---

/// Reads `BUG <TYPE> <sub_type> <path> <line>` lines.
pub struct LineParser;

impl FailureParser for LineParser {
    fn name(&self) -> &str {
        "line"
    }

    fn parse(&self, log: &str, _workspace: &Path) -> Result<Vec<BugReport>> {
        log.lines()
            .filter_map(|l| l.strip_prefix("BUG "))
            .map(|rest| {
                let parts: Vec<&str> = rest.split_whitespace().collect();
                anyhow::ensure!(parts.len() == 4, "malformed bug line: {rest}");
                BugReport::new(parts[0].parse()?, parts[1], parts[2], parts[3].parse()?)
            })
            .collect()
    }
}

// --- generator ---

/// Appends a marker to the failing line.
pub fn patch_line(content: &str, line: u32) -> String {
    let mut out: String = content
        .lines()
        .enumerate()
        .map(|(i, l)| {
            if i + 1 == line as usize {
                format!("{l}  # mend")
            } else {
                l.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    out.push('\n');
    out
}

pub fn patched(request: &FixRequest<'_>) -> FixProposal {
    FixProposal::Patched {
        patched_content: patch_line(request.file_content, request.bug.line_number()),
        confidence: 0.9,
        provider_used: "fake".into(),
    }
}

pub fn rejected(reason: EscalationReason) -> FixProposal {
    FixProposal::Rejected {
        reason,
        message: format!("scripted {reason}"),
        provider_used: "fake".into(),
    }
}

type Script = dyn Fn(&FixRequest<'_>) -> FixProposal + Send + Sync;

pub struct ScriptedGenerator {
    script: Box<Script>,
    calls: Arc<AtomicU32>,
}

impl ScriptedGenerator {
    pub fn new(script: impl Fn(&FixRequest<'_>) -> FixProposal + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Proposes a one-line patch for every bug.
    pub fn patching() -> Self {
        Self::new(patched)
    }

    pub fn calls(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }
}

#[async_trait]
impl FixGenerator for ScriptedGenerator {
    async fn generate(&self, request: FixRequest<'_>) -> Result<FixProposal> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok((self.script)(&request))
    }
}

pub struct FailingGenerator;

#[async_trait]
impl FixGenerator for FailingGenerator {
    async fn generate(&self, _request: FixRequest<'_>) -> Result<FixProposal> {
        anyhow::bail!("connection reset by peer")
    }
}

// --- git ---

#[derive(Clone, Default)]
pub struct GitLog(Arc<Mutex<Vec<String>>>);

impl GitLog {
    fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn pushes(&self) -> usize {
        self.entries()
            .iter()
            .filter(|e| e.starts_with("push"))
            .count()
    }
}

/// Records every call; never touches the filesystem.
pub struct FakeGit {
    log: GitLog,
    apply_fails: bool,
}

impl FakeGit {
    pub fn new() -> Self {
        Self {
            log: GitLog::default(),
            apply_fails: false,
        }
    }

    pub fn failing_apply() -> Self {
        Self {
            apply_fails: true,
            ..Self::new()
        }
    }

    pub fn log(&self) -> GitLog {
        self.log.clone()
    }
}

#[async_trait]
impl GitCollaborator for FakeGit {
    async fn apply(&self, fix: &FixAttempt, _message: &str, _workspace: &Path) -> Result<bool> {
        self.log.push(format!("apply {}", fix.bug_report.file_path()));
        if self.apply_fails {
            anyhow::bail!("index.lock exists");
        }
        Ok(true)
    }

    async fn push(&self, _workspace: &Path, branch: &str) -> Result<PushStatus> {
        self.log.push(format!("push {branch}"));
        Ok(PushStatus::Success)
    }

    async fn sync_with_remote(&self, _workspace: &Path, branch: &str) -> Result<()> {
        self.log.push(format!("sync {branch}"));
        Ok(())
    }

    async fn head_sha(&self, _workspace: &Path) -> Result<String> {
        Ok(HEAD_SHA.into())
    }
}

// --- CI ---

pub struct FixedCi {
    jobs: Vec<CiJob>,
}

impl FixedCi {
    pub fn new(jobs: Vec<CiJob>) -> Self {
        Self { jobs }
    }
}

#[async_trait]
impl CiStatusSource for FixedCi {
    async fn fetch(&self, repo: &str, commit_or_branch: &str) -> CiObservation {
        assert_eq!(repo, "acme/app");
        assert_eq!(commit_or_branch, HEAD_SHA);
        CiObservation::Jobs(self.jobs.clone())
    }
}

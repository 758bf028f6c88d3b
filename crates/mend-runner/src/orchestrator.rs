//! The healing loop.
//!
//! One [`Orchestrator`] drives one run: build, parse, fix each bug in
//! priority order through the acceptance pipeline, re-run the build, score
//! the fixes, gate the commit, push, and poll CI. Collaborator failures
//! degrade the current bug or iteration; only a broken invariant in the loop
//! itself ends the run with `error`.

use crate::ci::{CiPoller, repo_slug};
use crate::collaborator::{
    BuildExecutor, BuildResult, FailureParser, FixGenerator, FixProposal, FixRequest,
    GitCollaborator,
};
use crate::event_bus::EventBus;
use crate::git::resolve_in_workspace;
use crate::push::push_with_retry;
use anyhow::Result;
use mend_core::acceptance::Verdict;
use mend_core::bug::{BugReport, sort_by_priority};
use mend_core::ci::CiStatus;
use mend_core::config::HealConfig;
use mend_core::escalation::EscalationReason;
use mend_core::event::HealEventKind;
use mend_core::fingerprint::BugSignature;
use mend_core::fix::{ContextLevel, FixAttempt};
use mend_core::gate::{CommitLedger, GateDecision, PushStatus, commit_gate};
use mend_core::history::FixHistoryStore;
use mend_core::outcome::{
    Effectiveness, FailureSignatureSet, IterationOutcome, SignatureDelta, classify,
};
use mend_core::report::write_report;
use mend_core::run::{IterationSnapshot, RepositoryInfo, RunState, RunStatus};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;

/// What to heal.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub workspace: PathBuf,
    pub repository: RepositoryInfo,
    /// `owner/repo` for CI polling; CI is skipped when unset.
    pub ci_repo: Option<String>,
}

impl RunRequest {
    /// Build a request from the remote URL and the team settings in
    /// `config`. The CI slug is derived from the URL.
    pub fn from_config(
        workspace: impl Into<PathBuf>,
        url: &str,
        project_type: &str,
        config: &HealConfig,
    ) -> Self {
        Self {
            workspace: workspace.into(),
            repository: RepositoryInfo {
                url: url.to_string(),
                team: config.team.team_name.clone(),
                leader: config.team.leader_name.clone(),
                branch: config.team.branch(),
                project_type: project_type.to_string(),
            },
            ci_repo: repo_slug(url),
        }
    }
}

/// Run-scoped mutable state that is not part of the reported [`RunState`].
struct RunContext {
    started: Instant,
    history: FixHistoryStore,
    ledger: CommitLedger,
    attempts: HashMap<BugSignature, u32>,
}

impl RunContext {
    fn new(config: &HealConfig) -> Self {
        Self {
            started: Instant::now(),
            history: FixHistoryStore::new(
                config.history.per_bug_capacity,
                config.history.global_capacity,
            ),
            ledger: CommitLedger::new(&config.commit),
            attempts: HashMap::new(),
        }
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Post-fix build result.
struct Verification {
    bugs: Vec<BugReport>,
    passed: bool,
}

/// Per-iteration tallies of the fix cycle.
#[derive(Default)]
struct BatchTally {
    fixes: Vec<FixAttempt>,
    escalated: HashSet<BugSignature>,
    skipped: u32,
    applied: u32,
    aborted: bool,
}

pub struct Orchestrator {
    config: HealConfig,
    executor: Box<dyn BuildExecutor>,
    parser: Box<dyn FailureParser>,
    generator: Box<dyn FixGenerator>,
    git: Box<dyn GitCollaborator>,
    ci: Option<CiPoller>,
    bus: Option<EventBus>,
}

impl Orchestrator {
    /// The generator must be fresh: its provider health is part of this run.
    pub fn new(
        config: HealConfig,
        executor: Box<dyn BuildExecutor>,
        parser: Box<dyn FailureParser>,
        generator: Box<dyn FixGenerator>,
        git: Box<dyn GitCollaborator>,
    ) -> Self {
        Self {
            config,
            executor,
            parser,
            generator,
            git,
            ci: None,
            bus: None,
        }
    }

    pub fn with_ci(mut self, poller: CiPoller) -> Self {
        self.ci = Some(poller);
        self
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    fn emit(&self, kind: HealEventKind) {
        if let Some(bus) = &self.bus {
            bus.emit(kind);
        }
    }

    /// Run the loop to a terminal status and return the full record. Never
    /// fails: errors and the hard deadline both end in a terminal status.
    pub async fn run(self, request: RunRequest) -> RunState {
        let mut state = RunState::new(request.repository.clone());
        state.status = RunStatus::Running;
        let mut ctx = RunContext::new(&self.config);
        let deadline = self.config.run.hard_deadline();

        tracing::info!(
            repo = %request.repository.url,
            branch = %request.repository.branch,
            retry_limit = self.config.run.retry_limit,
            "healing run started"
        );
        self.emit(HealEventKind::RunStarted {
            repo: request.repository.url.clone(),
            branch: request.repository.branch.clone(),
        });

        let outcome =
            tokio::time::timeout(deadline, self.drive(&request, &mut state, &mut ctx)).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(error = %e, "healing run aborted");
                state.finish(RunStatus::Error, format!("Fatal error: {e:#}"));
            }
            Err(_) => {
                tracing::warn!(deadline_secs = deadline.as_secs(), "hard deadline reached");
                state.finish(
                    RunStatus::Timeout,
                    format!(
                        "Hard deadline reached after {}s; returning partial results.",
                        deadline.as_secs()
                    ),
                );
                self.push_leftovers(&request, &mut ctx).await;
            }
        }
        if !state.is_finished() {
            state.finish(
                RunStatus::Error,
                "Fatal error: loop ended without a terminal status",
            );
        }

        self.finalize(&mut state, &ctx).await;
        self.emit(HealEventKind::RunFinished {
            status: state.status,
            summary: state.execution_summary.clone(),
        });
        state
    }

    async fn drive(
        &self,
        request: &RunRequest,
        state: &mut RunState,
        ctx: &mut RunContext,
    ) -> Result<()> {
        let limit = self.config.run.retry_limit;
        for iteration in 1..=limit {
            if self.config.guardrail.should_abort(ctx.elapsed()) {
                tracing::warn!(iteration, "performance guardrail reached before iteration");
                state.finish(RunStatus::Exhausted, GUARDRAIL_SUMMARY);
                return Ok(());
            }
            state.iteration = iteration;
            self.iterate(request, state, ctx, iteration, iteration == limit)
                .await?;
            if state.is_finished() {
                return Ok(());
            }
        }
        state.finish(
            RunStatus::Exhausted,
            format!("Reached RUN_RETRY_LIMIT ({limit}) without full success."),
        );
        Ok(())
    }

    async fn iterate(
        &self,
        request: &RunRequest,
        state: &mut RunState,
        ctx: &mut RunContext,
        iteration: u32,
        last: bool,
    ) -> Result<()> {
        let iteration_started = Instant::now();
        let elapsed = ctx.elapsed();
        let hint = self.config.guardrail.hint(elapsed);
        state.performance_hint = hint;
        let mut snapshot = IterationSnapshot::new(iteration);
        snapshot.performance_hint = hint;
        tracing::info!(iteration, hint = ?hint, elapsed_secs = elapsed.as_secs(), "iteration started");
        self.emit(HealEventKind::IterationStarted { iteration, hint });

        let build = self.build(request).await;
        snapshot.build_exit_code = Some(build.exit_code);
        snapshot.build_log_snippet = build.log_excerpt.clone();

        if build.passed() {
            tracing::info!(iteration, "build passed");
            snapshot.execution_summary = "Build passed.".into();
            snapshot.iteration_outcome = IterationOutcome::Improved;
            snapshot.iteration_time_seconds = iteration_started.elapsed().as_secs_f64();
            record(state, snapshot)?;
            state.finish(
                RunStatus::Success,
                format!("Healing successful in {iteration} iteration(s)."),
            );
            return Ok(());
        }

        let bugs = self.parse(&build.full_log, &request.workspace);
        self.emit(HealEventKind::BuildFinished {
            iteration,
            exit_code: build.exit_code,
            bugs: bugs.len(),
        });
        let pre = FailureSignatureSet::from_bugs(&bugs);
        snapshot.previous_failure_signatures = pre.signatures();
        snapshot.bug_reports = bugs.clone();

        if bugs.is_empty() {
            tracing::warn!(iteration, exit_code = build.exit_code, "build failed but no bugs parsed");
            snapshot.execution_summary = "No bugs detected in logs.".into();
            snapshot.iteration_time_seconds = iteration_started.elapsed().as_secs_f64();
            record(state, snapshot)?;
            if last {
                state.finish(
                    RunStatus::Failure,
                    "Build failed but parser could not identify specific bugs.",
                );
            }
            return Ok(());
        }

        let batch = match self.config.guardrail.batch_limit(elapsed) {
            Some(limit) if limit < bugs.len() => {
                tracing::info!(iteration, limit, total = bugs.len(), "batch truncated by guardrail");
                &bugs[..limit]
            }
            _ => &bugs[..],
        };

        let mut tally = self.fix_batch(request, ctx, iteration, batch).await;
        if !tally.aborted && self.config.guardrail.should_abort(ctx.elapsed()) {
            tally.aborted = true;
        }

        if tally.aborted {
            tracing::warn!(iteration, "performance guardrail reached mid-iteration");
            snapshot.fixes_applied = tally.applied;
            snapshot.skipped_fix_count = tally.skipped;
            snapshot.fixes = tally.fixes;
            snapshot.current_failure_signatures = pre.signatures();
            snapshot.execution_summary = "Stopped by performance guardrail.".into();
            snapshot.iteration_time_seconds = iteration_started.elapsed().as_secs_f64();
            record(state, snapshot)?;
            state.finish(RunStatus::Exhausted, GUARDRAIL_SUMMARY);
            return Ok(());
        }

        let verification = if tally.applied > 0 {
            self.verify(request).await
        } else {
            None
        };
        let local_pass = verification.as_ref().is_some_and(|v| v.passed);
        let post = match &verification {
            Some(v) => FailureSignatureSet::from_bugs(&v.bugs),
            None => pre.clone(),
        };

        let mut effective = 0;
        if verification.is_some() {
            for fix in tally.fixes.iter_mut().filter(|f| f.patch_applied) {
                let score = Effectiveness::assess(&fix.bug_signature, &pre, &post);
                fix.set_effectiveness(score);
                if score.is_effective() {
                    effective += 1;
                }
            }
        }

        snapshot.iteration_outcome = classify(&pre, &post);
        snapshot.current_failure_signatures = post.signatures();
        snapshot.failure_delta = SignatureDelta::between(&pre, &post);
        snapshot.fixes_applied = tally.applied;
        snapshot.effective_fix_count = effective;
        snapshot.skipped_fix_count = tally.skipped;
        tracing::info!(
            iteration,
            applied = tally.applied,
            effective,
            skipped = tally.skipped,
            outcome = %snapshot.iteration_outcome,
            "fix cycle finished"
        );

        let decision = commit_gate(&tally.fixes, &post);
        let blocked = match decision {
            GateDecision::Open => None,
            GateDecision::Closed(block) => Some(block),
        };
        snapshot.commit_blocked = blocked;
        tracing::info!(iteration, blocked = ?blocked, "commit gate");
        self.emit(HealEventKind::CommitGate { iteration, blocked });

        let mut ci_success = false;
        if decision.is_open() {
            let push = self.push(request, ctx, iteration).await;
            snapshot.push_status = Some(push);

            if push == PushStatus::Success
                && !local_pass
                && let Some(status) = self.poll_ci(request, &mut snapshot, iteration).await
            {
                if matches!(status, CiStatus::Stalled | CiStatus::UnknownTimeout) {
                    state.ci_stalled = true;
                }
                ci_success = status == CiStatus::CompletedSuccess;
            }
            snapshot.execution_summary = format!(
                "Applied {} fix(es), effective {effective}, push: {push}, CI: {}.",
                tally.applied,
                snapshot
                    .ci_status
                    .map_or_else(|| "skipped".to_string(), |s| s.to_string())
            );
        } else if let Some(block) = blocked {
            snapshot.execution_summary = format!(
                "No commit ({block}); {} applied, {} escalated or skipped.",
                tally.applied, tally.skipped
            );
        }

        let all_escalated = tally.applied == 0 && tally.escalated.len() >= batch.len();
        snapshot.fixes = tally.fixes;
        snapshot.iteration_time_seconds = iteration_started.elapsed().as_secs_f64();
        record(state, snapshot)?;

        if local_pass {
            state.finish(
                RunStatus::Success,
                format!("Healing successful in {iteration} iteration(s)."),
            );
        } else if ci_success {
            state.finish(
                RunStatus::Success,
                format!("Healing successful via CI validation in iteration {iteration}."),
            );
        } else if all_escalated {
            state.finish(
                RunStatus::Failure,
                "All bugs escalated \u{2014} no effective fixes possible.",
            );
        }
        Ok(())
    }

    async fn build(&self, request: &RunRequest) -> BuildResult {
        let result = self
            .executor
            .execute(
                &request.workspace,
                &request.repository.project_type,
                self.config.acceptance.working_dir.as_deref(),
            )
            .await;
        match result {
            Ok(build) => {
                if let Some(err) = &build.error {
                    tracing::warn!(error = %err, "build did not run cleanly");
                }
                build
            }
            Err(e) => {
                tracing::warn!(error = %e, "build executor failed");
                BuildResult {
                    exit_code: -1,
                    error: Some(format!("{e:#}")),
                    ..BuildResult::default()
                }
            }
        }
    }

    /// Parsed bugs in priority order; a failing parser yields none.
    fn parse(&self, log: &str, workspace: &Path) -> Vec<BugReport> {
        let mut bugs = self.parser.parse(log, workspace).unwrap_or_else(|e| {
            tracing::warn!(parser = self.parser.name(), error = %e, "failure parser failed");
            Vec::new()
        });
        sort_by_priority(&mut bugs);
        bugs
    }

    async fn fix_batch(
        &self,
        request: &RunRequest,
        ctx: &mut RunContext,
        iteration: u32,
        batch: &[BugReport],
    ) -> BatchTally {
        let mut tally = BatchTally::default();
        let max_attempts = self.config.run.max_attempts_per_bug;

        for bug in batch {
            if self.config.guardrail.should_abort(ctx.elapsed()) {
                tally.aborted = true;
                break;
            }
            let signature = BugSignature::of(bug);
            if tally.escalated.contains(&signature) {
                tracing::debug!(%signature, "already escalated this iteration");
                tally.skipped += 1;
                continue;
            }
            let used = ctx.attempts.get(&signature).copied().unwrap_or(0);
            if used >= max_attempts {
                tracing::info!(file = bug.file_path(), line = bug.line_number(), used, "attempt limit reached");
                tally.escalated.insert(signature);
                tally.skipped += 1;
                continue;
            }
            let Some(original) = self.read_source(&request.workspace, bug).await else {
                tally.skipped += 1;
                continue;
            };

            let attempt = used + 1;
            ctx.attempts.insert(signature.clone(), attempt);
            let mut fix = FixAttempt::new(bug.clone(), attempt);
            self.fix_one(request, ctx, iteration, &original, &mut fix)
                .await;

            if fix.needs_escalation {
                let reason = fix
                    .escalation_reason
                    .unwrap_or(EscalationReason::InvalidResponse);
                tracing::info!(
                    file = bug.file_path(),
                    line = bug.line_number(),
                    reason = %reason,
                    detail = %fix.error_message,
                    "fix escalated"
                );
                self.emit(HealEventKind::FixEscalated {
                    iteration,
                    file_path: bug.file_path().to_string(),
                    line: bug.line_number(),
                    reason,
                });
                tally.escalated.insert(signature);
                tally.skipped += 1;
            } else if fix.patch_applied {
                tally.applied += 1;
            } else {
                tally.skipped += 1;
            }
            tally.fixes.push(fix);
        }
        tally
    }

    /// Generate, validate, record and apply one fix. Every rejection lands
    /// on `fix` as an escalation.
    async fn fix_one(
        &self,
        request: &RunRequest,
        ctx: &mut RunContext,
        iteration: u32,
        original: &str,
        fix: &mut FixAttempt,
    ) {
        let policy = &self.config.acceptance;
        let bug = fix.bug_report.clone();

        if let Some(rejection) = policy.precheck(&bug, original) {
            fix.escalate(rejection.reason, rejection.detail);
            return;
        }

        let request_fix = FixRequest {
            bug: &bug,
            file_content: original,
            attempt: fix.attempt,
            context: ContextLevel::for_attempt(fix.attempt),
        };
        let proposal = self.generator.generate(request_fix).await.unwrap_or_else(|e| {
            FixProposal::Rejected {
                reason: EscalationReason::LlmFailure,
                message: format!("{e:#}"),
                provider_used: String::new(),
            }
        });

        let patched = match proposal {
            FixProposal::Rejected {
                reason,
                message,
                provider_used,
            } => {
                fix.provider_used = provider_used;
                fix.escalate(reason, message);
                return;
            }
            FixProposal::Patched {
                patched_content,
                confidence,
                provider_used,
            } => {
                fix.confidence = confidence;
                fix.provider_used = provider_used;
                patched_content
            }
        };

        let verdict = match policy.evaluate(&bug, original, &patched, &ctx.history) {
            Ok(v) => v,
            Err(e) => {
                fix.escalate(EscalationReason::InvalidResponse, format!("diff failed: {e:#}"));
                return;
            }
        };
        fix.patched_content = patched;

        let accepted = match verdict {
            Verdict::Rejected(rejection) => {
                if let Some(diff) = rejection.diff {
                    fix.diff = diff.text;
                }
                fix.patch_fingerprint = rejection.fingerprint;
                fix.escalate(rejection.reason, rejection.detail);
                return;
            }
            Verdict::Accepted(accepted) => accepted,
        };

        ctx.history
            .record(fix.bug_signature.clone(), accepted.fingerprint.clone());
        let fingerprint = accepted.fingerprint.to_string();
        fix.accept(accepted.diff.text, accepted.fingerprint);

        if !ctx.ledger.can_commit() {
            tracing::warn!(
                max = ctx.ledger.max_commits,
                file = bug.file_path(),
                "commit budget exhausted, not applying"
            );
            fix.error_message = "commit budget exhausted".into();
            return;
        }

        let message = self.config.commit.commit_message(&bug);
        match self.git.apply(fix, &message, &request.workspace).await {
            Ok(true) => {
                fix.patch_applied = true;
                ctx.ledger.record_commit();
                fix.commit_sha = self.git.head_sha(&request.workspace).await.ok();
                tracing::info!(file = bug.file_path(), line = bug.line_number(), %fingerprint, "fix applied");
                self.emit(HealEventKind::FixApplied {
                    iteration,
                    file_path: bug.file_path().to_string(),
                    line: bug.line_number(),
                    fingerprint,
                });
            }
            Ok(false) => {
                tracing::info!(file = bug.file_path(), "fix accepted but nothing was committed");
                fix.error_message = "nothing to commit".into();
            }
            Err(e) => {
                tracing::warn!(file = bug.file_path(), error = %e, "applying fix failed");
                fix.error_message = format!("apply failed: {e:#}");
            }
        }
    }

    /// Current content of the bug's file. A missing file reads as empty; a
    /// path outside the workspace or an unreadable file skips the bug.
    async fn read_source(&self, workspace: &Path, bug: &BugReport) -> Option<String> {
        let Some(path) = resolve_in_workspace(workspace, bug.file_path()) else {
            tracing::warn!(file = bug.file_path(), "bug points outside the workspace");
            return None;
        };
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Some(String::new()),
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "failed to read source");
                None
            }
        }
    }

    /// Re-run the build after applying fixes. `None` when the re-run
    /// produced nothing usable.
    async fn verify(&self, request: &RunRequest) -> Option<Verification> {
        let result = self
            .executor
            .execute(
                &request.workspace,
                &request.repository.project_type,
                self.config.acceptance.working_dir.as_deref(),
            )
            .await;
        let build = match result {
            Ok(build) => build,
            Err(e) => {
                tracing::warn!(error = %e, "re-run failed");
                return None;
            }
        };
        if build.passed() {
            tracing::info!("build passes after fixes");
            return Some(Verification {
                bugs: Vec::new(),
                passed: true,
            });
        }
        if let Some(err) = &build.error {
            tracing::warn!(error = %err, "re-run did not complete");
            return None;
        }
        match self.parser.parse(&build.full_log, &request.workspace) {
            Ok(mut bugs) => {
                sort_by_priority(&mut bugs);
                Some(Verification {
                    bugs,
                    passed: false,
                })
            }
            Err(e) => {
                tracing::warn!(error = %e, "parsing re-run log failed");
                None
            }
        }
    }

    async fn push(&self, request: &RunRequest, ctx: &mut RunContext, iteration: u32) -> PushStatus {
        let status = push_with_retry(
            self.git.as_ref(),
            &self.config.commit,
            &request.workspace,
            &request.repository.branch,
        )
        .await;
        if status == PushStatus::Success {
            ctx.ledger.mark_pushed();
        }
        tracing::info!(iteration, branch = %request.repository.branch, status = %status, "push finished");
        self.emit(HealEventKind::PushFinished { iteration, status });
        status
    }

    /// Poll CI for the pushed HEAD. `None` when CI is not configured.
    async fn poll_ci(
        &self,
        request: &RunRequest,
        snapshot: &mut IterationSnapshot,
        iteration: u32,
    ) -> Option<CiStatus> {
        let poller = self.ci.as_ref()?;
        let repo = request.ci_repo.as_deref()?;
        let reference = match self.git.head_sha(&request.workspace).await {
            Ok(sha) => sha,
            Err(e) => {
                tracing::warn!(error = %e, "no HEAD sha, polling by branch");
                request.repository.branch.clone()
            }
        };
        let outcome = poller.poll(repo, &reference, iteration).await;
        snapshot.ci_status = Some(outcome.status);
        snapshot.ci_timeline = outcome.timeline;
        Some(outcome.status)
    }

    /// Push commits made before the hard deadline cut the loop short.
    async fn push_leftovers(&self, request: &RunRequest, ctx: &mut RunContext) {
        if ctx.ledger.unpushed == 0 {
            return;
        }
        tracing::info!(unpushed = ctx.ledger.unpushed, "pushing work left at deadline");
        let status = push_with_retry(
            self.git.as_ref(),
            &self.config.commit,
            &request.workspace,
            &request.repository.branch,
        )
        .await;
        if status == PushStatus::Success {
            ctx.ledger.mark_pushed();
        } else {
            tracing::warn!(status = %status, "could not push work left at deadline");
        }
    }

    async fn finalize(&self, state: &mut RunState, ctx: &RunContext) {
        state.total_time_seconds = ctx.elapsed().as_secs_f64();
        state.fix_history = ctx.history.to_entries();
        state.provider_usage = self.generator.provider_usage().await;
        state.commit_count = ctx.ledger.commits;
        state.commit_budget_risk = ctx.ledger.commit_budget_risk();
        state.efficiency_penalty_risk = ctx.ledger.efficiency_penalty_risk;

        if let Some(path) = &self.config.run.results_path
            && let Err(e) = write_report(state, path)
        {
            tracing::warn!(path = %path.display(), error = %e, "failed to write results");
        }
    }
}

const GUARDRAIL_SUMMARY: &str = "Stopped: 5-minute performance guardrail reached.";

/// Append a snapshot; iteration numbers must strictly increase.
fn record(state: &mut RunState, snapshot: IterationSnapshot) -> Result<()> {
    if let Some(last) = state.last_snapshot() {
        anyhow::ensure!(
            last.iteration < snapshot.iteration,
            "iteration {} recorded after iteration {}",
            snapshot.iteration,
            last.iteration
        );
    }
    state.record_iteration(snapshot);
    Ok(())
}

//! Run-level state: terminal status, the time guardrail, and the
//! append-only list of iteration snapshots.

use crate::bug::BugReport;
use crate::ci::{CiStatus, CiTimelineEvent};
use crate::fingerprint::BugSignature;
use crate::fix::FixAttempt;
use crate::gate::{GateBlock, PushStatus};
use crate::history::FixHistoryEntry;
use crate::outcome::{IterationOutcome, SignatureDelta};
use crate::provider::ProviderUsage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failure,
    Exhausted,
    Error,
    Timeout,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }

    pub fn label(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
            RunStatus::Exhausted => "exhausted",
            RunStatus::Error => "error",
            RunStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceHint {
    #[default]
    Normal,
    Reduced,
    Critical,
}

/// Self-imposed time budget, measured from run start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailConfig {
    pub reduced_secs: u64,
    pub critical_secs: u64,
    pub abort_secs: u64,
    pub reduced_batch: usize,
    pub critical_batch: usize,
    /// Batch drops to one bug when less than this remains before abort.
    pub low_remaining_secs: u64,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            reduced_secs: 180,
            critical_secs: 240,
            abort_secs: 290,
            reduced_batch: 3,
            critical_batch: 1,
            low_remaining_secs: 60,
        }
    }
}

impl GuardrailConfig {
    pub fn hint(&self, elapsed: Duration) -> PerformanceHint {
        let secs = elapsed.as_secs();
        if secs >= self.critical_secs {
            PerformanceHint::Critical
        } else if secs >= self.reduced_secs {
            PerformanceHint::Reduced
        } else {
            PerformanceHint::Normal
        }
    }

    pub fn should_abort(&self, elapsed: Duration) -> bool {
        elapsed.as_secs() >= self.abort_secs
    }

    /// Maximum bugs to attempt this iteration; `None` means no cap.
    pub fn batch_limit(&self, elapsed: Duration) -> Option<usize> {
        let remaining = self.abort_secs.saturating_sub(elapsed.as_secs());
        if remaining < self.low_remaining_secs {
            return Some(self.critical_batch);
        }
        match self.hint(elapsed) {
            PerformanceHint::Normal => None,
            PerformanceHint::Reduced => Some(self.reduced_batch),
            PerformanceHint::Critical => Some(self.critical_batch),
        }
    }
}

/// Repository metadata carried into the results document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryInfo {
    pub url: String,
    pub team: String,
    pub leader: String,
    pub branch: String,
    pub project_type: String,
}

/// Read-only audit record of one loop iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationSnapshot {
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
    pub bug_reports: Vec<BugReport>,
    pub fixes: Vec<FixAttempt>,
    pub build_exit_code: Option<i32>,
    pub build_log_snippet: String,
    pub ci_status: Option<CiStatus>,
    pub ci_timeline: Vec<CiTimelineEvent>,
    pub push_status: Option<PushStatus>,
    pub commit_blocked: Option<GateBlock>,
    pub execution_summary: String,
    pub iteration_outcome: IterationOutcome,
    pub previous_failure_signatures: Vec<BugSignature>,
    pub current_failure_signatures: Vec<BugSignature>,
    pub failure_delta: SignatureDelta,
    pub fixes_applied: u32,
    pub effective_fix_count: u32,
    pub skipped_fix_count: u32,
    pub performance_hint: PerformanceHint,
    pub iteration_time_seconds: f64,
}

impl IterationSnapshot {
    pub fn new(iteration: u32) -> Self {
        Self {
            iteration,
            timestamp: Utc::now(),
            bug_reports: Vec::new(),
            fixes: Vec::new(),
            build_exit_code: None,
            build_log_snippet: String::new(),
            ci_status: None,
            ci_timeline: Vec::new(),
            push_status: None,
            commit_blocked: None,
            execution_summary: String::new(),
            iteration_outcome: IterationOutcome::Unchanged,
            previous_failure_signatures: Vec::new(),
            current_failure_signatures: Vec::new(),
            failure_delta: SignatureDelta::default(),
            fixes_applied: 0,
            effective_fix_count: 0,
            skipped_fix_count: 0,
            performance_hint: PerformanceHint::Normal,
            iteration_time_seconds: 0.0,
        }
    }
}

/// Top-level record of one healing run. Mutated only by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub repository: RepositoryInfo,
    pub status: RunStatus,
    pub execution_summary: String,
    pub iteration: u32,
    pub total_bugs_found: u32,
    pub total_fixes_applied: u32,
    pub effective_fix_count: u32,
    pub skipped_fix_count: u32,
    pub commit_count: u32,
    pub commit_budget_risk: bool,
    pub efficiency_penalty_risk: bool,
    pub ci_stalled: bool,
    pub performance_hint: PerformanceHint,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_time_seconds: f64,
    pub iterations: Vec<IterationSnapshot>,
    pub fix_history: Vec<FixHistoryEntry>,
    pub provider_usage: Vec<ProviderUsage>,
}

impl RunState {
    pub fn new(repository: RepositoryInfo) -> Self {
        Self {
            repository,
            status: RunStatus::Pending,
            execution_summary: String::new(),
            iteration: 0,
            total_bugs_found: 0,
            total_fixes_applied: 0,
            effective_fix_count: 0,
            skipped_fix_count: 0,
            commit_count: 0,
            commit_budget_risk: false,
            efficiency_penalty_risk: false,
            ci_stalled: false,
            performance_hint: PerformanceHint::Normal,
            started_at: Utc::now(),
            finished_at: None,
            total_time_seconds: 0.0,
            iterations: Vec::new(),
            fix_history: Vec::new(),
            provider_usage: Vec::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Set the terminal status. Terminal states are sticky: returns `false`
    /// and changes nothing if the run already finished.
    pub fn finish(&mut self, status: RunStatus, summary: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        debug_assert!(status.is_terminal(), "finish() needs a terminal status");
        self.status = status;
        self.execution_summary = summary.into();
        self.finished_at = Some(Utc::now());
        tracing::info!(status = %status, summary = %self.execution_summary, "run finished");
        true
    }

    /// Append an iteration record and fold its counters into the totals.
    pub fn record_iteration(&mut self, snapshot: IterationSnapshot) {
        self.total_bugs_found += snapshot.bug_reports.len() as u32;
        self.total_fixes_applied += snapshot.fixes_applied;
        self.effective_fix_count += snapshot.effective_fix_count;
        self.skipped_fix_count += snapshot.skipped_fix_count;
        self.iterations.push(snapshot);
    }

    pub fn last_snapshot(&self) -> Option<&IterationSnapshot> {
        self.iterations.last()
    }
}

//! CI status types and the polling state machine.
//!
//! The machine is pure: it consumes observations (job lists or HTTP errors)
//! with the elapsed time, and answers with either a delay before the next
//! poll or a terminal status. The async loop that sleeps and fetches lives
//! in `mend-runner`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Job name fragments that never decide a build result.
const IGNORED_JOB_KEYWORDS: &[&str] = &["deploy", "publish", "release", "notify"];
/// Job name fragments that mark build/test-like jobs.
const FOCUS_JOB_KEYWORDS: &[&str] = &["build", "test", "lint", "check", "ci"];
/// Conclusions that count as a failed build.
const FAILING_CONCLUSIONS: &[&str] = &["failure", "timed_out", "action_required", "cancelled"];

const TIMELINE_JOB_NAMES: usize = 3;
const TIMELINE_NAME_CHARS: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiStatus {
    Queued,
    InProgress,
    CompletedSuccess,
    CompletedFailure,
    Stalled,
    CiError,
    UnknownTimeout,
}

impl CiStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, CiStatus::Queued | CiStatus::InProgress)
    }

    pub fn label(self) -> &'static str {
        match self {
            CiStatus::Queued => "queued",
            CiStatus::InProgress => "in_progress",
            CiStatus::CompletedSuccess => "completed_success",
            CiStatus::CompletedFailure => "completed_failure",
            CiStatus::Stalled => "stalled",
            CiStatus::CiError => "ci_error",
            CiStatus::UnknownTimeout => "unknown_timeout",
        }
    }
}

impl fmt::Display for CiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A job-like record from the CI API (check run or workflow run).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiJob {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub conclusion: Option<String>,
}

impl CiJob {
    pub fn new(name: &str, status: &str, conclusion: Option<&str>) -> Self {
        Self {
            name: name.into(),
            status: status.into(),
            conclusion: conclusion.map(Into::into),
        }
    }

    fn is_completed(&self) -> bool {
        self.status == "completed"
    }

    fn failed(&self) -> bool {
        self.conclusion
            .as_deref()
            .is_some_and(|c| FAILING_CONCLUSIONS.contains(&c))
    }
}

/// Keep build/test-like jobs, drop deploy/publish/release/notify jobs.
///
/// Falls back to every non-ignored job when none is build/test-like, and to
/// the full list when everything would be ignored.
pub fn filter_jobs(jobs: &[CiJob]) -> Vec<CiJob> {
    let kept: Vec<&CiJob> = jobs
        .iter()
        .filter(|j| {
            let name = j.name.to_lowercase();
            !IGNORED_JOB_KEYWORDS.iter().any(|k| name.contains(k))
        })
        .collect();
    let focused: Vec<&CiJob> = kept
        .iter()
        .copied()
        .filter(|j| {
            let name = j.name.to_lowercase();
            FOCUS_JOB_KEYWORDS.iter().any(|k| name.contains(k))
        })
        .collect();

    if !focused.is_empty() {
        focused.into_iter().cloned().collect()
    } else if !kept.is_empty() {
        kept.into_iter().cloned().collect()
    } else {
        jobs.to_vec()
    }
}

/// Aggregate status of an already filtered job list.
pub fn evaluate_jobs(jobs: &[CiJob]) -> CiStatus {
    if jobs.is_empty() {
        return CiStatus::Queued;
    }
    if !jobs.iter().all(CiJob::is_completed) {
        return CiStatus::InProgress;
    }
    if jobs.iter().any(CiJob::failed) {
        CiStatus::CompletedFailure
    } else {
        CiStatus::CompletedSuccess
    }
}

/// Polling schedule and endpoint settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CiPollConfig {
    pub api_base: String,
    /// API token; normally supplied through `GITHUB_TOKEN`.
    #[serde(skip_serializing)]
    pub token: Option<String>,
    pub initial_interval_secs: f64,
    pub max_interval_secs: f64,
    pub growth: f64,
    /// Growth once the status repeated `stuck_after` times in a row.
    pub stuck_growth: f64,
    pub stuck_after: u32,
    /// Consecutive identical in-progress polls before declaring a stall.
    pub stall_polls: u32,
    pub timeout_secs: u64,
    /// Delay after a transient (5xx / network) failure.
    pub transient_retry_secs: u64,
}

impl Default for CiPollConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".into(),
            token: None,
            initial_interval_secs: 5.0,
            max_interval_secs: 30.0,
            growth: 1.5,
            stuck_growth: 2.0,
            stuck_after: 2,
            stall_polls: 7,
            timeout_secs: 300,
            transient_retry_secs: 10,
        }
    }
}

impl CiPollConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// One status transition, kept for the iteration snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CiTimelineEvent {
    pub status: CiStatus,
    pub elapsed_secs: f64,
    pub stalled: bool,
    pub job_names: String,
}

/// What the poller learned from one request.
#[derive(Debug, Clone)]
pub enum CiObservation {
    Jobs(Vec<CiJob>),
    /// 4xx: permanent, abort.
    ClientError(u16),
    /// 5xx or transport failure: retry after a pause.
    TransientError(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PollStep {
    Wait(Duration),
    Done(CiStatus),
}

/// Adaptive-backoff polling state for one commit.
#[derive(Debug, Clone)]
pub struct CiPollMachine {
    config: CiPollConfig,
    interval_secs: f64,
    last_status: Option<CiStatus>,
    same_status_polls: u32,
    identical_in_progress: u32,
    last_job_states: Vec<(String, String)>,
    timeline: Vec<CiTimelineEvent>,
}

impl CiPollMachine {
    pub fn new(config: CiPollConfig) -> Self {
        let interval_secs = config.initial_interval_secs;
        Self {
            config,
            interval_secs,
            last_status: None,
            same_status_polls: 0,
            identical_in_progress: 0,
            last_job_states: Vec::new(),
            timeline: Vec::new(),
        }
    }

    pub fn timeline(&self) -> &[CiTimelineEvent] {
        &self.timeline
    }

    pub fn into_timeline(self) -> Vec<CiTimelineEvent> {
        self.timeline
    }

    pub fn last_status(&self) -> Option<CiStatus> {
        self.last_status
    }

    pub fn observe(&mut self, observation: CiObservation, elapsed: Duration) -> PollStep {
        match observation {
            CiObservation::ClientError(code) => {
                tracing::warn!(code, "CI API rejected request");
                self.transition(CiStatus::CiError, elapsed, &[]);
                PollStep::Done(CiStatus::CiError)
            }
            CiObservation::TransientError(err) => {
                tracing::debug!(error = %err, "transient CI API failure, retrying");
                PollStep::Wait(Duration::from_secs(self.config.transient_retry_secs))
            }
            CiObservation::Jobs(jobs) => self.observe_jobs(&jobs, elapsed),
        }
    }

    /// Record that the polling window ran out.
    pub fn time_out(&mut self, elapsed: Duration) -> CiStatus {
        self.transition(CiStatus::UnknownTimeout, elapsed, &[]);
        CiStatus::UnknownTimeout
    }

    fn observe_jobs(&mut self, jobs: &[CiJob], elapsed: Duration) -> PollStep {
        let jobs = filter_jobs(jobs);
        let status = evaluate_jobs(&jobs);

        if status.is_terminal() {
            self.transition(status, elapsed, &jobs);
            return PollStep::Done(status);
        }

        if status == CiStatus::InProgress {
            let states: Vec<(String, String)> = jobs
                .iter()
                .map(|j| (j.name.clone(), j.status.clone()))
                .collect();
            if self.last_status == Some(CiStatus::InProgress) && states == self.last_job_states {
                self.identical_in_progress += 1;
            } else {
                self.identical_in_progress = 1;
            }
            self.last_job_states = states;

            if self.identical_in_progress >= self.config.stall_polls {
                tracing::warn!(polls = self.identical_in_progress, "CI appears stalled");
                self.transition(CiStatus::Stalled, elapsed, &jobs);
                return PollStep::Done(CiStatus::Stalled);
            }
        } else {
            self.identical_in_progress = 0;
            self.last_job_states.clear();
        }

        if self.last_status == Some(status) {
            self.same_status_polls += 1;
        } else {
            self.same_status_polls = 0;
            self.transition(status, elapsed, &jobs);
        }

        let wait = Duration::from_secs_f64(self.interval_secs);
        let growth = if self.same_status_polls >= self.config.stuck_after {
            self.config.stuck_growth
        } else {
            self.config.growth
        };
        self.interval_secs = (self.interval_secs * growth).min(self.config.max_interval_secs);
        PollStep::Wait(wait)
    }

    fn transition(&mut self, status: CiStatus, elapsed: Duration, jobs: &[CiJob]) {
        let job_names = jobs
            .iter()
            .take(TIMELINE_JOB_NAMES)
            .map(|j| j.name.chars().take(TIMELINE_NAME_CHARS).collect::<String>())
            .collect::<Vec<_>>()
            .join(", ");
        tracing::info!(status = %status, elapsed_secs = elapsed.as_secs_f64(), jobs = %job_names, "CI status");
        self.timeline.push(CiTimelineEvent {
            status,
            elapsed_secs: elapsed.as_secs_f64(),
            stalled: status == CiStatus::Stalled,
            job_names,
        });
        self.last_status = Some(status);
    }
}

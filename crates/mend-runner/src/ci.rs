//! CI status over the GitHub REST API, and the async polling loop.
//!
//! `GithubChecks` turns one API request into a [`CiObservation`];
//! `CiPoller` drives the pure [`CiPollMachine`] with real (or paused) time.

use crate::collaborator::CiStatusSource;
use crate::event_bus::EventBus;
use anyhow::{Context, Result};
use async_trait::async_trait;
use mend_core::ci::{
    CiJob, CiObservation, CiPollConfig, CiPollMachine, CiStatus, CiTimelineEvent, PollStep,
};
use mend_core::event::HealEventKind;
use regex::Regex;
use std::sync::LazyLock;
use tokio::time::Instant;

const GITHUB_API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = concat!("mend/", env!("CARGO_PKG_VERSION"));

static GITHUB_SLUG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"github\.com[:/](.+?)(?:\.git)?/?$").expect("valid regex"));

/// `owner/repo` from an https or ssh GitHub remote URL.
pub fn repo_slug(url: &str) -> Option<String> {
    let caps = GITHUB_SLUG.captures(url.trim())?;
    let slug = caps.get(1)?.as_str();
    let mut parts = slug.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(repo), None) if !owner.is_empty() && !repo.is_empty() => {
            Some(format!("{owner}/{repo}"))
        }
        _ => None,
    }
}

fn is_commit_sha(reference: &str) -> bool {
    reference.len() == 40 && reference.chars().all(|c| c.is_ascii_hexdigit())
}

/// Job records under `key` (`check_runs` or `workflow_runs`).
pub fn parse_jobs(body: &serde_json::Value, key: &str) -> Result<Vec<CiJob>> {
    let items = body
        .get(key)
        .with_context(|| format!("CI response has no '{key}' field"))?
        .clone();
    serde_json::from_value(items).with_context(|| format!("malformed '{key}' entries"))
}

/// Check runs (for a commit) or workflow runs (for a branch) from GitHub.
pub struct GithubChecks {
    client: reqwest::Client,
    api_base: String,
    token: Option<String>,
}

impl GithubChecks {
    pub fn new(config: &CiPollConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        }
    }

    fn endpoint(&self, repo: &str, reference: &str) -> (String, &'static str) {
        if is_commit_sha(reference) {
            (
                format!("{}/repos/{repo}/commits/{reference}/check-runs", self.api_base),
                "check_runs",
            )
        } else {
            (
                format!("{}/repos/{repo}/actions/runs?branch={reference}", self.api_base),
                "workflow_runs",
            )
        }
    }
}

#[async_trait]
impl CiStatusSource for GithubChecks {
    async fn fetch(&self, repo: &str, commit_or_branch: &str) -> CiObservation {
        let (url, key) = self.endpoint(repo, commit_or_branch);
        tracing::debug!(%url, "polling CI status");

        let mut request = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => return CiObservation::TransientError(e.to_string()),
        };
        let status = response.status();
        if status.is_client_error() {
            return CiObservation::ClientError(status.as_u16());
        }
        if !status.is_success() {
            return CiObservation::TransientError(format!("HTTP {status}"));
        }

        let body: serde_json::Value = match response.json().await {
            Ok(b) => b,
            Err(e) => return CiObservation::TransientError(format!("unreadable body: {e}")),
        };
        match parse_jobs(&body, key) {
            Ok(jobs) => CiObservation::Jobs(jobs),
            Err(e) => CiObservation::TransientError(format!("{e:#}")),
        }
    }
}

/// Terminal status of one poll plus its transitions.
#[derive(Debug, Clone)]
pub struct CiPollOutcome {
    pub status: CiStatus,
    pub timeline: Vec<CiTimelineEvent>,
}

/// Polls one commit to a terminal status.
pub struct CiPoller {
    source: Box<dyn CiStatusSource>,
    config: CiPollConfig,
    bus: Option<EventBus>,
}

impl CiPoller {
    pub fn new(source: Box<dyn CiStatusSource>, config: CiPollConfig) -> Self {
        Self {
            source,
            config,
            bus: None,
        }
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn github(config: CiPollConfig) -> Self {
        Self::new(Box::new(GithubChecks::new(&config)), config)
    }

    pub async fn poll(&self, repo: &str, reference: &str, iteration: u32) -> CiPollOutcome {
        let started = Instant::now();
        let window = self.config.timeout();
        let mut machine = CiPollMachine::new(self.config.clone());
        let mut emitted = 0;

        let status = loop {
            let elapsed = started.elapsed();
            if elapsed >= window {
                break machine.time_out(elapsed);
            }
            let observation = self.source.fetch(repo, reference).await;
            let step = machine.observe(observation, started.elapsed());
            self.publish(machine.timeline(), &mut emitted, iteration);
            match step {
                PollStep::Done(status) => break status,
                PollStep::Wait(delay) => {
                    let remaining = window.saturating_sub(started.elapsed());
                    tokio::time::sleep(delay.min(remaining)).await;
                }
            }
        };
        self.publish(machine.timeline(), &mut emitted, iteration);

        tracing::info!(repo, reference, status = %status, "CI polling finished");
        CiPollOutcome {
            status,
            timeline: machine.into_timeline(),
        }
    }

    fn publish(&self, timeline: &[CiTimelineEvent], emitted: &mut usize, iteration: u32) {
        if let Some(bus) = &self.bus {
            for event in &timeline[*emitted..] {
                bus.emit(HealEventKind::CiTransition {
                    iteration,
                    event: event.clone(),
                });
            }
        }
        *emitted = timeline.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    /// Replays observations; repeats the last one once the script runs out.
    struct ScriptedSource {
        script: Mutex<VecDeque<CiObservation>>,
        last: Mutex<Option<CiObservation>>,
        calls: Arc<AtomicU32>,
    }

    impl ScriptedSource {
        fn new(script: Vec<CiObservation>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(None),
                calls: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    #[async_trait]
    impl CiStatusSource for ScriptedSource {
        async fn fetch(&self, _repo: &str, _reference: &str) -> CiObservation {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().await.pop_front();
            let mut last = self.last.lock().await;
            match next {
                Some(obs) => {
                    *last = Some(obs.clone());
                    obs
                }
                None => last.clone().unwrap_or(CiObservation::Jobs(vec![])),
            }
        }
    }

    fn jobs(status: &str, conclusion: Option<&str>) -> CiObservation {
        CiObservation::Jobs(vec![
            CiJob::new("build", status, conclusion),
            CiJob::new("deploy", "queued", None),
        ])
    }

    #[test]
    fn slug_from_remote_urls() {
        assert_eq!(
            repo_slug("https://github.com/acme/app.git").as_deref(),
            Some("acme/app")
        );
        assert_eq!(
            repo_slug("git@github.com:acme/app").as_deref(),
            Some("acme/app")
        );
        assert_eq!(
            repo_slug("https://github.com/acme/app/").as_deref(),
            Some("acme/app")
        );
        assert_eq!(repo_slug("https://gitlab.com/acme/app"), None);
        assert_eq!(repo_slug("https://github.com/acme"), None);
    }

    #[test]
    fn endpoint_depends_on_reference() {
        let checks = GithubChecks::new(&CiPollConfig::default());
        let sha = "a".repeat(40);
        let (url, key) = checks.endpoint("acme/app", &sha);
        assert_eq!(
            url,
            format!("https://api.github.com/repos/acme/app/commits/{sha}/check-runs")
        );
        assert_eq!(key, "check_runs");

        let (url, key) = checks.endpoint("acme/app", "ACME_ADA_AI_Fix");
        assert!(url.ends_with("/actions/runs?branch=ACME_ADA_AI_Fix"));
        assert_eq!(key, "workflow_runs");
    }

    #[test]
    fn parses_check_runs() {
        let body = serde_json::json!({
            "total_count": 2,
            "check_runs": [
                {"name": "test", "status": "completed", "conclusion": "success", "id": 1},
                {"name": "lint", "status": "in_progress", "conclusion": null}
            ]
        });
        let parsed = parse_jobs(&body, "check_runs").unwrap();
        assert_eq!(
            parsed,
            vec![
                CiJob::new("test", "completed", Some("success")),
                CiJob::new("lint", "in_progress", None),
            ]
        );
        assert!(parse_jobs(&body, "workflow_runs").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_success() {
        let source = ScriptedSource::new(vec![
            CiObservation::Jobs(vec![]),
            jobs("in_progress", None),
            jobs("completed", Some("success")),
        ]);
        let calls = source.calls.clone();
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let poller =
            CiPoller::new(Box::new(source), CiPollConfig::default()).with_event_bus(bus);

        let outcome = poller.poll("acme/app", &"b".repeat(40), 2).await;
        assert_eq!(outcome.status, CiStatus::CompletedSuccess);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.timeline.len(), 3);
        // The queued deploy job never holds back the build result.
        assert_eq!(outcome.timeline[2].job_names, "build");

        let mut transitions = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let HealEventKind::CiTransition { iteration, event } = event.kind {
                assert_eq!(iteration, 2);
                transitions.push(event.status);
            }
        }
        assert_eq!(
            transitions,
            vec![CiStatus::Queued, CiStatus::InProgress, CiStatus::CompletedSuccess]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn client_error_stops_immediately() {
        let source = ScriptedSource::new(vec![CiObservation::ClientError(404)]);
        let calls = source.calls.clone();
        let poller = CiPoller::new(Box::new(source), CiPollConfig::default());
        let outcome = poller.poll("acme/app", "branch", 1).await;
        assert_eq!(outcome.status, CiStatus::CiError);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let source = ScriptedSource::new(vec![
            CiObservation::TransientError("502".into()),
            CiObservation::TransientError("timeout".into()),
            jobs("completed", Some("failure")),
        ]);
        let poller = CiPoller::new(Box::new(source), CiPollConfig::default());
        let outcome = poller.poll("acme/app", "branch", 1).await;
        assert_eq!(outcome.status, CiStatus::CompletedFailure);
    }

    #[tokio::test(start_paused = true)]
    async fn stalls_on_identical_progress() {
        let source = ScriptedSource::new(vec![jobs("in_progress", None)]);
        let poller = CiPoller::new(Box::new(source), CiPollConfig::default());
        let outcome = poller.poll("acme/app", "branch", 1).await;
        assert_eq!(outcome.status, CiStatus::Stalled);
        assert!(outcome.timeline.last().unwrap().stalled);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_queued_forever() {
        let source = ScriptedSource::new(vec![CiObservation::Jobs(vec![])]);
        let config = CiPollConfig {
            timeout_secs: 60,
            ..CiPollConfig::default()
        };
        let poller = CiPoller::new(Box::new(source), config);
        let started = Instant::now();
        let outcome = poller.poll("acme/app", "branch", 1).await;
        assert_eq!(outcome.status, CiStatus::UnknownTimeout);
        assert!(started.elapsed() <= Duration::from_secs(61));
        assert_eq!(
            outcome.timeline.last().unwrap().status,
            CiStatus::UnknownTimeout
        );
    }
}

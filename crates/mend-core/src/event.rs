//! Healing-run events for external observers.
//!
//! Pure data; the broadcast bus lives in `mend-runner`.

use crate::ci::CiTimelineEvent;
use crate::escalation::EscalationReason;
use crate::gate::{GateBlock, PushStatus};
use crate::run::{PerformanceHint, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: HealEventKind,
}

impl HealEvent {
    pub fn new(kind: HealEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HealEventKind {
    RunStarted {
        repo: String,
        branch: String,
    },
    IterationStarted {
        iteration: u32,
        hint: PerformanceHint,
    },
    BuildFinished {
        iteration: u32,
        exit_code: i32,
        bugs: usize,
    },
    FixEscalated {
        iteration: u32,
        file_path: String,
        line: u32,
        reason: EscalationReason,
    },
    FixApplied {
        iteration: u32,
        file_path: String,
        line: u32,
        fingerprint: String,
    },
    CommitGate {
        iteration: u32,
        blocked: Option<GateBlock>,
    },
    PushFinished {
        iteration: u32,
        status: PushStatus,
    },
    CiTransition {
        iteration: u32,
        event: CiTimelineEvent,
    },
    RunFinished {
        status: RunStatus,
        summary: String,
    },
}

impl std::fmt::Display for HealEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealEventKind::RunStarted { repo, branch } => write!(f, "run started: {repo} ({branch})"),
            HealEventKind::IterationStarted { iteration, .. } => {
                write!(f, "iteration {iteration} started")
            }
            HealEventKind::BuildFinished {
                iteration,
                exit_code,
                bugs,
            } => write!(f, "iteration {iteration}: build exit {exit_code}, {bugs} bug(s)"),
            HealEventKind::FixEscalated {
                file_path,
                line,
                reason,
                ..
            } => write!(f, "escalated {file_path}:{line} ({reason})"),
            HealEventKind::FixApplied { file_path, line, .. } => {
                write!(f, "applied fix {file_path}:{line}")
            }
            HealEventKind::CommitGate { iteration, blocked } => match blocked {
                None => write!(f, "iteration {iteration}: commit gate open"),
                Some(block) => write!(f, "iteration {iteration}: commit gate closed ({block})"),
            },
            HealEventKind::PushFinished { iteration, status } => {
                write!(f, "iteration {iteration}: push {status}")
            }
            HealEventKind::CiTransition { iteration, event } => {
                write!(f, "iteration {iteration}: CI {}", event.status)
            }
            HealEventKind::RunFinished { status, summary } => write!(f, "run {status}: {summary}"),
        }
    }
}

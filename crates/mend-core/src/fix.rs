//! Fix attempts: one generation + validation cycle for one bug.

use crate::bug::BugReport;
use crate::escalation::EscalationReason;
use crate::fingerprint::{BugSignature, PatchFingerprint};
use crate::outcome::Effectiveness;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How much surrounding code the generator is given, by attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextLevel {
    Small,
    Medium,
    Large,
}

impl ContextLevel {
    pub fn for_attempt(attempt: u32) -> Self {
        match attempt {
            0 | 1 => ContextLevel::Small,
            2 => ContextLevel::Medium,
            _ => ContextLevel::Large,
        }
    }
}

impl fmt::Display for ContextLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextLevel::Small => write!(f, "small"),
            ContextLevel::Medium => write!(f, "medium"),
            ContextLevel::Large => write!(f, "large"),
        }
    }
}

/// Record of one fix cycle for one bug in one iteration.
///
/// Frozen once the iteration ends; only `effectiveness_score` is set after
/// the confidence-gate re-execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixAttempt {
    pub bug_report: BugReport,
    pub bug_signature: BugSignature,
    pub attempt: u32,
    pub context_level: ContextLevel,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub patched_content: String,
    #[serde(default)]
    pub diff: String,
    pub confidence: f64,
    #[serde(default)]
    pub provider_used: String,
    pub success: bool,
    pub patch_applied: bool,
    pub needs_escalation: bool,
    pub manual_required: bool,
    pub escalation_reason: Option<EscalationReason>,
    pub patch_fingerprint: Option<PatchFingerprint>,
    pub previous_attempt_detected: bool,
    pub error_severity_hint: String,
    pub effectiveness_score: f64,
    #[serde(default)]
    pub error_message: String,
    pub commit_sha: Option<String>,
}

impl FixAttempt {
    /// Start a record for `bug`; every flag starts cleared and unscored.
    pub fn new(bug: BugReport, attempt: u32) -> Self {
        let bug_signature = BugSignature::of(&bug);
        let error_severity_hint = bug.bug_type().severity_hint().to_string();
        Self {
            bug_report: bug,
            bug_signature,
            attempt,
            context_level: ContextLevel::for_attempt(attempt),
            patched_content: String::new(),
            diff: String::new(),
            confidence: 0.0,
            provider_used: String::new(),
            success: false,
            patch_applied: false,
            needs_escalation: false,
            manual_required: false,
            escalation_reason: None,
            patch_fingerprint: None,
            previous_attempt_detected: false,
            error_severity_hint,
            effectiveness_score: Effectiveness::Unscored.score(),
            error_message: String::new(),
            commit_sha: None,
        }
    }

    /// Mark this attempt rejected with exactly one reason.
    pub fn escalate(&mut self, reason: EscalationReason, message: impl Into<String>) {
        self.success = false;
        self.needs_escalation = true;
        self.manual_required = reason.needs_human();
        self.previous_attempt_detected = reason == EscalationReason::RepeatedFix;
        self.escalation_reason = Some(reason);
        self.error_message = message.into();
    }

    pub fn accept(&mut self, diff: String, fingerprint: PatchFingerprint) {
        self.success = true;
        self.needs_escalation = false;
        self.escalation_reason = None;
        self.diff = diff;
        self.patch_fingerprint = Some(fingerprint);
    }

    pub fn set_effectiveness(&mut self, effectiveness: Effectiveness) {
        self.effectiveness_score = effectiveness.score();
    }

    pub fn is_scored(&self) -> bool {
        self.effectiveness_score >= 0.0
    }

    pub fn is_effective(&self) -> bool {
        self.effectiveness_score > 0.0
    }
}

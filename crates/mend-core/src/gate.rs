//! Commit and push gating.
//!
//! The commit gate decides once per iteration whether the applied patches
//! are worth pushing. Push targets are validated before any network call,
//! and a per-run ledger enforces the commit budget.

use crate::bug::{BugReport, BugType};
use crate::fix::FixAttempt;
use crate::outcome::FailureSignatureSet;
use anyhow::Context;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

static DEFAULT_BRANCH_PATTERN: LazyLock<BranchPattern> = LazyLock::new(|| {
    BranchPattern(Regex::new("^[A-Z0-9_]+_AI_Fix$").expect("valid regex"))
});

/// Push-target naming rule, compiled once and serialized as its source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BranchPattern(Regex);

impl BranchPattern {
    pub fn new(pattern: &str) -> anyhow::Result<Self> {
        Regex::new(pattern)
            .map(Self)
            .with_context(|| format!("invalid branch pattern '{pattern}'"))
    }

    pub fn is_match(&self, branch: &str) -> bool {
        self.0.is_match(branch)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Default for BranchPattern {
    fn default() -> Self {
        DEFAULT_BRANCH_PATTERN.clone()
    }
}

impl PartialEq for BranchPattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl TryFrom<String> for BranchPattern {
    type Error = anyhow::Error;

    fn try_from(pattern: String) -> anyhow::Result<Self> {
        Self::new(&pattern)
    }
}

impl From<BranchPattern> for String {
    fn from(pattern: BranchPattern) -> Self {
        pattern.as_str().to_string()
    }
}

/// Commit conventions and push restrictions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitPolicy {
    pub message_prefix: String,
    pub max_commits_per_run: u32,
    /// Remaining-budget level at or below which the run is flagged at risk.
    pub budget_risk_margin: u32,
    pub protected_branches: Vec<String>,
    pub branch_pattern: BranchPattern,
}

impl Default for CommitPolicy {
    fn default() -> Self {
        Self {
            message_prefix: "[AI-AGENT] Fix:".into(),
            max_commits_per_run: 20,
            budget_risk_margin: 3,
            protected_branches: vec!["main".into(), "master".into()],
            branch_pattern: BranchPattern::default(),
        }
    }
}

impl CommitPolicy {
    /// `"{prefix} {BUG_TYPE}/{sub_type} in {file_path}"`
    pub fn commit_message(&self, bug: &BugReport) -> String {
        format!(
            "{} {}/{} in {}",
            self.message_prefix,
            bug.bug_type(),
            bug.sub_type(),
            bug.file_path()
        )
    }

    /// Check a push target. Runs before any network call.
    pub fn validate_branch(&self, branch: &str) -> Result<(), PushStatus> {
        let branch = branch.trim();
        if self
            .protected_branches
            .iter()
            .any(|p| p.eq_ignore_ascii_case(branch))
        {
            return Err(PushStatus::RejectedMain);
        }
        if !self.branch_pattern.is_match(branch) {
            return Err(PushStatus::InvalidBranchName);
        }
        Ok(())
    }
}

/// `"{TEAM}_{LEADER}_AI_Fix"`: uppercased, non-alphanumerics collapsed to `_`.
/// A part that cleans to nothing is left out.
pub fn branch_name(team: &str, leader: &str) -> String {
    fn clean(part: &str) -> String {
        let upper: String = part
            .trim()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        upper
            .split('_')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("_")
    }
    let mut parts: Vec<String> = [clean(team), clean(leader)]
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect();
    parts.push("AI_Fix".into());
    parts.join("_")
}

/// Result of a push request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushStatus {
    Success,
    /// Target is a protected branch; refused before any network call.
    RejectedMain,
    InvalidBranchName,
    /// Remote refused the push (non-fast-forward); retryable after rebase.
    Rejected,
    ConflictUnresolved,
    Error,
}

impl PushStatus {
    pub fn label(self) -> &'static str {
        match self {
            PushStatus::Success => "success",
            PushStatus::RejectedMain => "rejected_main",
            PushStatus::InvalidBranchName => "invalid_branch_name",
            PushStatus::Rejected => "rejected",
            PushStatus::ConflictUnresolved => "conflict_unresolved",
            PushStatus::Error => "error",
        }
    }
}

impl fmt::Display for PushStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why the commit gate stayed shut.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateBlock {
    NothingApplied,
    /// No applied patch measurably helped.
    NoEffectiveFix,
    /// A SYNTAX/IMPORT failure remains and no applied fix targeted one.
    RootFailureRemains,
}

impl fmt::Display for GateBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateBlock::NothingApplied => write!(f, "no patch applied"),
            GateBlock::NoEffectiveFix => write!(f, "no effective fix"),
            GateBlock::RootFailureRemains => write!(f, "root failure remains unaddressed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Open,
    Closed(GateBlock),
}

impl GateDecision {
    pub fn is_open(self) -> bool {
        matches!(self, GateDecision::Open)
    }
}

/// Decide whether this iteration's applied fixes should be committed and
/// pushed, given the post-fix failures.
pub fn commit_gate(fixes: &[FixAttempt], post: &FailureSignatureSet) -> GateDecision {
    let applied: Vec<&FixAttempt> = fixes.iter().filter(|f| f.patch_applied).collect();
    if applied.is_empty() {
        return GateDecision::Closed(GateBlock::NothingApplied);
    }
    if !applied.iter().any(|f| f.is_effective()) {
        return GateDecision::Closed(GateBlock::NoEffectiveFix);
    }
    let root_fix_applied = applied.iter().any(|f| f.bug_report.bug_type().is_root());
    if post.has_root() && !root_fix_applied {
        return GateDecision::Closed(GateBlock::RootFailureRemains);
    }
    GateDecision::Open
}

/// Sentinel tier for an empty bug list.
const NO_BUG_TIER: i32 = 99;

fn best_tier(types: &[BugType]) -> i32 {
    types
        .iter()
        .map(|t| i32::from(t.priority()))
        .min()
        .unwrap_or(NO_BUG_TIER)
}

/// `best(current) - best(previous)`; positive means the most severe
/// remaining tier got less severe.
pub fn priority_delta(previous: &[BugType], current: &[BugType]) -> i32 {
    best_tier(current) - best_tier(previous)
}

pub fn should_commit_by_priority(previous: &[BugType], current: &[BugType]) -> bool {
    priority_delta(previous, current) > 0
}

/// Per-run commit accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitLedger {
    pub max_commits: u32,
    pub risk_margin: u32,
    pub commits: u32,
    /// Commits made but not yet pushed.
    pub unpushed: u32,
    /// Set once an application was refused for lack of budget.
    pub efficiency_penalty_risk: bool,
}

impl CommitLedger {
    pub fn new(policy: &CommitPolicy) -> Self {
        Self {
            max_commits: policy.max_commits_per_run,
            risk_margin: policy.budget_risk_margin,
            ..Self::default()
        }
    }

    pub fn remaining(&self) -> u32 {
        self.max_commits.saturating_sub(self.commits)
    }

    pub fn commit_budget_risk(&self) -> bool {
        self.remaining() <= self.risk_margin
    }

    /// Whether another commit fits the budget. Flags the penalty risk when
    /// it does not.
    pub fn can_commit(&mut self) -> bool {
        if self.commits >= self.max_commits {
            self.efficiency_penalty_risk = true;
            return false;
        }
        true
    }

    pub fn record_commit(&mut self) {
        self.commits += 1;
        self.unpushed += 1;
    }

    pub fn mark_pushed(&mut self) {
        self.unpushed = 0;
    }
}

//! Failure signature sets and iteration-over-iteration outcome
//! classification.
//!
//! The classification is priority aware. Fixing a syntax error while
//! introducing a lint warning counts as improvement; the reverse counts as a
//! regression, whatever the raw bug counts say.

use crate::bug::{BugReport, BugType};
use crate::fingerprint::BugSignature;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Priority used for an empty set: worse than any real bug type.
const NO_BUGS_PRIORITY: u16 = 999;

/// Sorted signatures of one build's failures, each tagged with its type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSignatureSet {
    entries: Vec<(BugSignature, BugType)>,
}

impl FailureSignatureSet {
    pub fn from_bugs(bugs: &[BugReport]) -> Self {
        let mut entries: Vec<_> = bugs
            .iter()
            .map(|b| (BugSignature::of(b), b.bug_type()))
            .collect();
        entries.sort();
        entries.dedup_by(|a, b| a.0 == b.0);
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, signature: &BugSignature) -> bool {
        self.entries
            .binary_search_by(|(sig, _)| sig.cmp(signature))
            .is_ok()
    }

    pub fn signatures(&self) -> Vec<BugSignature> {
        self.entries.iter().map(|(sig, _)| sig.clone()).collect()
    }

    /// Numeric priority of the most severe bug present.
    pub fn best_priority(&self) -> u16 {
        self.entries
            .iter()
            .map(|(_, t)| u16::from(t.priority()))
            .min()
            .unwrap_or(NO_BUGS_PRIORITY)
    }

    pub fn count_at_priority(&self, priority: u16) -> usize {
        self.entries
            .iter()
            .filter(|(_, t)| u16::from(t.priority()) == priority)
            .count()
    }

    pub fn has_root(&self) -> bool {
        self.entries.iter().any(|(_, t)| t.is_root())
    }

    fn same_signatures(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .zip(&other.entries)
                .all(|(a, b)| a.0 == b.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationOutcome {
    Improved,
    Unchanged,
    Regressed,
}

impl fmt::Display for IterationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IterationOutcome::Improved => write!(f, "improved"),
            IterationOutcome::Unchanged => write!(f, "unchanged"),
            IterationOutcome::Regressed => write!(f, "regressed"),
        }
    }
}

/// Classify the move from `pre` to `post`.
pub fn classify(pre: &FailureSignatureSet, post: &FailureSignatureSet) -> IterationOutcome {
    if pre.same_signatures(post) {
        return IterationOutcome::Unchanged;
    }

    let pre_best = pre.best_priority();
    let post_best = post.best_priority();
    if post_best > pre_best {
        return IterationOutcome::Improved;
    }
    if post_best < pre_best {
        return IterationOutcome::Regressed;
    }

    let pre_count = pre.count_at_priority(pre_best);
    let post_count = post.count_at_priority(post_best);
    if post_count < pre_count {
        return IterationOutcome::Improved;
    }
    if post_count > pre_count {
        return IterationOutcome::Regressed;
    }

    if post.len() <= pre.len() {
        IterationOutcome::Improved
    } else {
        IterationOutcome::Regressed
    }
}

/// Counts of signatures resolved, introduced and carried over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureDelta {
    pub resolved: usize,
    pub introduced: usize,
    pub persisting: usize,
}

impl SignatureDelta {
    pub fn between(pre: &FailureSignatureSet, post: &FailureSignatureSet) -> Self {
        let pre: BTreeSet<_> = pre.entries.iter().map(|(s, _)| s).collect();
        let post: BTreeSet<_> = post.entries.iter().map(|(s, _)| s).collect();
        Self {
            resolved: pre.difference(&post).count(),
            introduced: post.difference(&pre).count(),
            persisting: pre.intersection(&post).count(),
        }
    }

    /// Net change in failure count; negative means fewer failures.
    pub fn net(&self) -> i64 {
        self.introduced as i64 - self.resolved as i64
    }
}

/// Per-fix effectiveness, derived from pre/post signature membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effectiveness {
    Unscored,
    /// Signature present before and after.
    Unchanged,
    /// Signature absent from both sets: its identity drifted.
    Partial,
    /// Signature present before, gone after.
    Resolved,
}

impl Effectiveness {
    pub fn score(self) -> f64 {
        match self {
            Effectiveness::Unscored => -1.0,
            Effectiveness::Unchanged => 0.0,
            Effectiveness::Partial => 0.5,
            Effectiveness::Resolved => 1.0,
        }
    }

    pub fn assess(
        signature: &BugSignature,
        pre: &FailureSignatureSet,
        post: &FailureSignatureSet,
    ) -> Self {
        match (pre.contains(signature), post.contains(signature)) {
            (true, false) => Effectiveness::Resolved,
            (true, true) => Effectiveness::Unchanged,
            _ => Effectiveness::Partial,
        }
    }

    pub fn is_effective(self) -> bool {
        self.score() > 0.0
    }
}

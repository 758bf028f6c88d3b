//! Patch acceptance pipeline.
//!
//! A proposed patch passes five checks in a fixed order, and the first
//! failing check decides the escalation reason:
//!
//! 1. merge conflict markers in the original file (needs a human)
//! 2. scope: the file lies under the configured working directory
//! 3. diff size: added + removed lines within `max_diff_lines`
//! 4. locality: every changed line within the window around the failing line
//! 5. repeat: the patch fingerprint is not already in the fix history
//!
//! Acceptance only makes a patch eligible for application; committing it is
//! decided later by the commit gate.

use crate::bug::{BugReport, normalize_path};
use crate::diff::FileDiff;
use crate::escalation::EscalationReason;
use crate::fingerprint::{BugSignature, PatchFingerprint};
use crate::history::FixHistoryStore;
use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static CONFLICT_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(?:<{7}|>{7})(?:\s|$)").expect("valid regex"));

/// Tunables for the acceptance checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceptancePolicy {
    /// Maximum added + removed lines.
    pub max_diff_lines: usize,
    /// Allowed radius around the failing line.
    pub locality_window: u32,
    /// Files shorter than this use `small_file_window` instead.
    pub small_file_lines: usize,
    pub small_file_window: u32,
    /// Repo-relative directory patches must stay under. `None` or empty
    /// means unrestricted.
    pub working_dir: Option<String>,
}

impl Default for AcceptancePolicy {
    fn default() -> Self {
        Self {
            max_diff_lines: 50,
            locality_window: 20,
            small_file_lines: 100,
            small_file_window: 100,
            working_dir: None,
        }
    }
}

/// A patch that passed every check.
#[derive(Debug, Clone)]
pub struct AcceptedPatch {
    pub diff: FileDiff,
    pub fingerprint: PatchFingerprint,
}

/// A patch stopped by one of the checks.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub reason: EscalationReason,
    pub detail: String,
    /// Present once the pipeline got far enough to compute a diff.
    pub diff: Option<FileDiff>,
    pub fingerprint: Option<PatchFingerprint>,
}

impl Rejection {
    fn new(reason: EscalationReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
            diff: None,
            fingerprint: None,
        }
    }

    fn with_diff(mut self, diff: FileDiff, fingerprint: PatchFingerprint) -> Self {
        self.diff = Some(diff);
        self.fingerprint = Some(fingerprint);
        self
    }

    pub fn manual_required(&self) -> bool {
        self.reason.needs_human()
    }
}

#[derive(Debug, Clone)]
pub enum Verdict {
    Accepted(AcceptedPatch),
    Rejected(Rejection),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted(_))
    }

    pub fn reason(&self) -> Option<EscalationReason> {
        match self {
            Verdict::Accepted(_) => None,
            Verdict::Rejected(r) => Some(r.reason),
        }
    }
}

/// True if the content holds unresolved `<<<<<<<` / `>>>>>>>` markers.
pub fn has_conflict_markers(content: &str) -> bool {
    CONFLICT_MARKER.is_match(content)
}

impl AcceptancePolicy {
    /// Checks that need only the original file: merge conflicts and scope.
    /// Run before asking a generator for a patch.
    pub fn precheck(&self, bug: &BugReport, original: &str) -> Option<Rejection> {
        if has_conflict_markers(original) {
            return Some(Rejection::new(
                EscalationReason::MergeConflict,
                format!("{} contains unresolved merge conflict markers", bug.file_path()),
            ));
        }
        if !self.in_scope(bug.file_path()) {
            return Some(Rejection::new(
                EscalationReason::OutOfScope,
                format!(
                    "{} is outside working directory {}",
                    bug.file_path(),
                    self.working_dir.as_deref().unwrap_or_default()
                ),
            ));
        }
        None
    }

    /// Run all five checks against a proposed patch.
    pub fn evaluate(
        &self,
        bug: &BugReport,
        original: &str,
        patched: &str,
        history: &FixHistoryStore,
    ) -> Result<Verdict> {
        if let Some(rejection) = self.precheck(bug, original) {
            return Ok(Verdict::Rejected(rejection));
        }

        let diff = FileDiff::compute(bug.file_path(), original, patched)?;
        let signature = BugSignature::of(bug);
        let fingerprint = PatchFingerprint::new(&signature, &diff.text);

        if diff.is_empty() {
            return Ok(Verdict::Rejected(
                Rejection::new(EscalationReason::InvalidResponse, "patch makes no changes")
                    .with_diff(diff, fingerprint),
            ));
        }

        let changed = diff.changed_line_count();
        if changed > self.max_diff_lines {
            return Ok(Verdict::Rejected(
                Rejection::new(
                    EscalationReason::DiffTooLarge,
                    format!("{changed} changed lines exceeds limit of {}", self.max_diff_lines),
                )
                .with_diff(diff, fingerprint),
            ));
        }

        let window = self.window_for(original);
        let low = bug.line_number().saturating_sub(window).max(1);
        let high = bug.line_number().saturating_add(window);
        let stray = diff.lines_outside(low, high).next().map(|c| c.line);
        if let Some(stray) = stray {
            let detail = format!(
                "line {stray} changed outside allowed range {low}-{high} around line {}",
                bug.line_number()
            );
            return Ok(Verdict::Rejected(
                Rejection::new(EscalationReason::LocalityViolation, detail)
                    .with_diff(diff, fingerprint),
            ));
        }

        if history.contains(&signature, &fingerprint) {
            return Ok(Verdict::Rejected(
                Rejection::new(
                    EscalationReason::RepeatedFix,
                    format!("patch {fingerprint} was already attempted for this bug"),
                )
                .with_diff(diff, fingerprint),
            ));
        }

        Ok(Verdict::Accepted(AcceptedPatch { diff, fingerprint }))
    }

    /// Locality radius for a file; small files get the wider window so a
    /// whole-file rewrite is not penalized.
    pub fn window_for(&self, original: &str) -> u32 {
        if original.lines().count() < self.small_file_lines {
            self.small_file_window.max(self.locality_window)
        } else {
            self.locality_window
        }
    }

    pub fn in_scope(&self, file_path: &str) -> bool {
        let Some(dir) = self.working_dir.as_deref() else {
            return true;
        };
        let dir = normalize_path(dir);
        let dir = dir.trim_matches('/');
        if dir.is_empty() || dir == "." {
            return true;
        }
        let path = normalize_path(file_path);
        let path = path.trim_matches('/');
        path == dir || path.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bug::BugType;

    fn numbered(n: usize) -> String {
        (1..=n).map(|i| format!("value_{i} = {i}\n")).collect()
    }

    fn replace_line(text: &str, line: usize, with: &str) -> String {
        text.lines()
            .enumerate()
            .map(|(i, l)| {
                if i + 1 == line {
                    format!("{with}\n")
                } else {
                    format!("{l}\n")
                }
            })
            .collect()
    }

    fn bug_at(line: u32) -> BugReport {
        BugReport::new(BugType::Logic, "off_by_one", "src/calc.py", line).unwrap()
    }

    #[test]
    fn accepts_change_at_failing_line() {
        let policy = AcceptancePolicy::default();
        let original = numbered(200);
        let patched = replace_line(&original, 100, "value_100 = 101");
        let verdict = policy
            .evaluate(&bug_at(100), &original, &patched, &FixHistoryStore::default())
            .unwrap();
        assert!(verdict.is_accepted());
    }

    #[test]
    fn locality_boundary() {
        let policy = AcceptancePolicy::default();
        let history = FixHistoryStore::default();
        let original = numbered(200);
        let bug = bug_at(100);

        for line in [80, 120] {
            let patched = replace_line(&original, line, "edited = 0");
            let verdict = policy.evaluate(&bug, &original, &patched, &history).unwrap();
            assert!(verdict.is_accepted(), "line {line} should be inside the window");
        }

        for line in [79, 121] {
            let patched = replace_line(&original, line, "edited = 0");
            let verdict = policy.evaluate(&bug, &original, &patched, &history).unwrap();
            assert_eq!(verdict.reason(), Some(EscalationReason::LocalityViolation));
        }
    }

    #[test]
    fn small_files_use_wide_window() {
        let policy = AcceptancePolicy::default();
        let original = numbered(60);
        let patched = replace_line(&original, 58, "edited = 0");
        let verdict = policy
            .evaluate(&bug_at(2), &original, &patched, &FixHistoryStore::default())
            .unwrap();
        assert!(verdict.is_accepted());
        assert_eq!(policy.window_for(&original), 100);
        assert_eq!(policy.window_for(&numbered(150)), 20);
    }

    #[test]
    fn window_lower_bound_clamps_at_one() {
        let policy = AcceptancePolicy::default();
        let original = numbered(150);
        let patched = replace_line(&original, 1, "edited = 0");
        let verdict = policy
            .evaluate(&bug_at(3), &original, &patched, &FixHistoryStore::default())
            .unwrap();
        assert!(verdict.is_accepted());
    }

    #[test]
    fn diff_too_large() {
        let policy = AcceptancePolicy {
            max_diff_lines: 4,
            ..AcceptancePolicy::default()
        };
        let original = numbered(150);
        let mut patched = original.clone();
        for line in 98..=100 {
            patched = replace_line(&patched, line, "edited = 0");
        }
        let verdict = policy
            .evaluate(&bug_at(99), &original, &patched, &FixHistoryStore::default())
            .unwrap();
        assert_eq!(verdict.reason(), Some(EscalationReason::DiffTooLarge));
    }

    #[test]
    fn size_check_runs_before_locality() {
        let policy = AcceptancePolicy {
            max_diff_lines: 1,
            ..AcceptancePolicy::default()
        };
        let original = numbered(300);
        let patched = replace_line(&original, 250, "far = 0");
        let verdict = policy
            .evaluate(&bug_at(10), &original, &patched, &FixHistoryStore::default())
            .unwrap();
        assert_eq!(verdict.reason(), Some(EscalationReason::DiffTooLarge));
    }

    #[test]
    fn merge_conflict_is_terminal_and_first() {
        let policy = AcceptancePolicy {
            working_dir: Some("elsewhere".into()),
            ..AcceptancePolicy::default()
        };
        let original = "a = 1\n<<<<<<< HEAD\nb = 2\n=======\nb = 3\n>>>>>>> feature\n";
        let Verdict::Rejected(rejection) = policy
            .evaluate(&bug_at(2), original, "a = 1\nb = 2\n", &FixHistoryStore::default())
            .unwrap()
        else {
            panic!("expected rejection");
        };
        assert_eq!(rejection.reason, EscalationReason::MergeConflict);
        assert!(rejection.manual_required());
        assert!(rejection.diff.is_none());
    }

    #[test]
    fn conflict_marker_must_start_line() {
        assert!(has_conflict_markers("<<<<<<< HEAD\n"));
        assert!(has_conflict_markers("x\n>>>>>>>\n"));
        assert!(!has_conflict_markers("text <<<<<<< inline\n"));
        assert!(!has_conflict_markers("=======\n"));
    }

    #[test]
    fn scope_restriction() {
        let policy = AcceptancePolicy {
            working_dir: Some("./src/".into()),
            ..AcceptancePolicy::default()
        };
        assert!(policy.in_scope("src/calc.py"));
        assert!(policy.in_scope("src\\nested\\calc.py"));
        assert!(!policy.in_scope("srcs/calc.py"));
        assert!(!policy.in_scope("tests/test_calc.py"));

        let out = BugReport::new(BugType::Logic, "off_by_one", "tests/t.py", 1).unwrap();
        assert_eq!(
            policy.precheck(&out, "x = 1\n").map(|r| r.reason),
            Some(EscalationReason::OutOfScope)
        );
    }

    #[test]
    fn empty_working_dir_is_unrestricted() {
        let policy = AcceptancePolicy {
            working_dir: Some(String::new()),
            ..AcceptancePolicy::default()
        };
        assert!(policy.in_scope("anything/at/all.py"));
    }

    #[test]
    fn unchanged_patch_is_invalid() {
        let policy = AcceptancePolicy::default();
        let original = numbered(10);
        let verdict = policy
            .evaluate(&bug_at(2), &original, &original, &FixHistoryStore::default())
            .unwrap();
        assert_eq!(verdict.reason(), Some(EscalationReason::InvalidResponse));
    }

    #[test]
    fn repeated_patch_detected() {
        let policy = AcceptancePolicy::default();
        let mut history = FixHistoryStore::default();
        let original = numbered(150);
        let patched = replace_line(&original, 50, "value_50 = 0");
        let bug = bug_at(50);

        let Verdict::Accepted(first) = policy.evaluate(&bug, &original, &patched, &history).unwrap()
        else {
            panic!("first proposal should be accepted");
        };
        history.record(BugSignature::of(&bug), first.fingerprint.clone());

        let second = policy.evaluate(&bug, &original, &patched, &history).unwrap();
        assert_eq!(second.reason(), Some(EscalationReason::RepeatedFix));
    }
}

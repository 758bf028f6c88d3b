//! Combines several failure detectors into one deterministic parser.

use crate::collaborator::FailureParser;
use anyhow::Result;
use mend_core::bug::{BugReport, sort_by_priority};
use mend_core::fingerprint::BugSignature;
use std::collections::HashSet;
use std::path::Path;

/// Upper bound on merged detectors (e.g. compiler, linter, test runner).
pub const MAX_DETECTORS: usize = 3;

pub struct MergedParser {
    detectors: Vec<Box<dyn FailureParser>>,
}

impl MergedParser {
    pub fn new() -> Self {
        Self {
            detectors: Vec::new(),
        }
    }

    pub fn with_detector(mut self, detector: Box<dyn FailureParser>) -> Result<Self> {
        if self.detectors.len() >= MAX_DETECTORS {
            anyhow::bail!(
                "at most {MAX_DETECTORS} detectors can be merged (adding '{}')",
                detector.name()
            );
        }
        self.detectors.push(detector);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }
}

impl Default for MergedParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FailureParser for MergedParser {
    fn name(&self) -> &str {
        "merged"
    }

    /// Union of all detectors, first report per signature wins, sorted into
    /// priority order. A failing detector is skipped.
    fn parse(&self, log: &str, workspace: &Path) -> Result<Vec<BugReport>> {
        let mut seen = HashSet::new();
        let mut merged = Vec::new();
        for detector in &self.detectors {
            match detector.parse(log, workspace) {
                Ok(bugs) => {
                    for bug in bugs {
                        if seen.insert(BugSignature::of(&bug)) {
                            merged.push(bug);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(detector = detector.name(), error = %e, "detector failed, skipping");
                }
            }
        }
        sort_by_priority(&mut merged);
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mend_core::bug::BugType;

    struct FixedDetector {
        name: &'static str,
        bugs: Vec<BugReport>,
    }

    impl FailureParser for FixedDetector {
        fn name(&self) -> &str {
            self.name
        }
        fn parse(&self, _log: &str, _workspace: &Path) -> Result<Vec<BugReport>> {
            Ok(self.bugs.clone())
        }
    }

    struct BrokenDetector;

    impl FailureParser for BrokenDetector {
        fn name(&self) -> &str {
            "broken"
        }
        fn parse(&self, _log: &str, _workspace: &Path) -> Result<Vec<BugReport>> {
            anyhow::bail!("cannot read log")
        }
    }

    fn bug(t: BugType, sub: &str, file: &str, line: u32) -> BugReport {
        BugReport::new(t, sub, file, line).unwrap()
    }

    #[test]
    fn merges_dedups_and_sorts() {
        let lint = bug(BugType::Linting, "unused_import", "a.py", 1);
        let syntax = bug(BugType::Syntax, "missing_colon", "b.py", 3);
        let parser = MergedParser::new()
            .with_detector(Box::new(FixedDetector {
                name: "linter",
                bugs: vec![lint.clone()],
            }))
            .unwrap()
            .with_detector(Box::new(FixedDetector {
                name: "compiler",
                bugs: vec![syntax.clone(), lint.clone().with_domain("dup")],
            }))
            .unwrap()
            .with_detector(Box::new(BrokenDetector))
            .unwrap();

        let bugs = parser.parse("log", Path::new(".")).unwrap();
        assert_eq!(bugs, vec![syntax, lint]);
    }

    #[test]
    fn rejects_fourth_detector() {
        let mut parser = MergedParser::new();
        for _ in 0..MAX_DETECTORS {
            parser = parser.with_detector(Box::new(BrokenDetector)).unwrap();
        }
        assert!(parser.with_detector(Box::new(BrokenDetector)).is_err());
    }

    #[test]
    fn deterministic_output() {
        let parser = MergedParser::new()
            .with_detector(Box::new(FixedDetector {
                name: "d",
                bugs: vec![
                    bug(BugType::Logic, "off_by_one", "z.py", 9),
                    bug(BugType::Import, "wrong_path", "y.py", 2),
                ],
            }))
            .unwrap();
        let first = parser.parse("log", Path::new(".")).unwrap();
        let second = parser.parse("log", Path::new(".")).unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0].bug_type(), BugType::Import);
    }
}

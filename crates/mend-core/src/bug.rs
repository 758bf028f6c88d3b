//! Bug model: the closed set of bug types, their allowed sub-types, and the
//! immutable `BugReport` value produced by the failure parser.
//!
//! Every `(bug_type, sub_type)` pair is checked against a static table when a
//! report is constructed (or deserialized), so downstream code can rely on
//! [`BugReport::fix_description`] always resolving.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Category of a detected defect.
///
/// Declaration order is priority order: `Syntax` is the most severe and is
/// always fixed first. The derived `Ord` follows that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BugType {
    Syntax,
    Import,
    TypeError,
    Indentation,
    Logic,
    Linting,
}

const LINTING_SUB_TYPES: &[(&str, &str)] = &[
    ("unused_import", "remove unused import statement"),
    ("unused_variable", "remove or utilise the unused variable"),
    ("line_too_long", "shorten line to comply with maximum line length"),
    ("missing_whitespace", "add required whitespace around operator"),
    ("trailing_whitespace", "remove trailing whitespace from line"),
    ("multiple_statements", "split multiple statements onto separate lines"),
];

const SYNTAX_SUB_TYPES: &[(&str, &str)] = &[
    ("missing_colon", "add missing colon at end of statement"),
    ("missing_bracket", "add missing closing bracket"),
    ("missing_parenthesis", "add missing closing parenthesis"),
    ("unexpected_indent", "remove unexpected indentation"),
    ("invalid_syntax", "correct invalid syntax on reported line"),
];

const LOGIC_SUB_TYPES: &[(&str, &str)] = &[
    ("wrong_operator", "replace operator with correct logical operator"),
    ("wrong_condition", "correct boolean condition to match intended logic"),
    ("off_by_one", "adjust loop or index boundary by one"),
    ("unreachable_code", "remove or reposition unreachable code block"),
    ("infinite_loop", "add correct termination condition to loop"),
];

const TYPE_ERROR_SUB_TYPES: &[(&str, &str)] = &[
    ("type_mismatch", "cast variable to the expected type"),
    ("none_reference", "add none check before accessing attribute"),
    ("wrong_return_type", "update return value to match declared type"),
    ("incompatible_types", "align variable types to resolve incompatibility"),
];

const IMPORT_SUB_TYPES: &[(&str, &str)] = &[
    ("missing_import", "add missing import statement at top of file"),
    ("wrong_path", "correct the import path to match module location"),
    ("circular_import", "refactor to remove circular import dependency"),
    ("relative_import", "convert to absolute import path"),
];

const INDENTATION_SUB_TYPES: &[(&str, &str)] = &[
    ("wrong_indent", "fix indentation to use consistent spaces"),
    ("mixed_indent", "convert mixed tabs and spaces to spaces only"),
    ("over_indent", "reduce indentation to match surrounding block level"),
    ("under_indent", "increase indentation to match surrounding block level"),
];

impl BugType {
    /// All bug types in priority order.
    pub const ALL: [BugType; 6] = [
        BugType::Syntax,
        BugType::Import,
        BugType::TypeError,
        BugType::Indentation,
        BugType::Logic,
        BugType::Linting,
    ];

    /// Numeric priority; lower is more severe.
    pub fn priority(self) -> u8 {
        match self {
            BugType::Syntax => 0,
            BugType::Import => 1,
            BugType::TypeError => 2,
            BugType::Indentation => 3,
            BugType::Logic => 4,
            BugType::Linting => 5,
        }
    }

    /// Root bugs break the build outright and gate commits of lesser fixes.
    pub fn is_root(self) -> bool {
        matches!(self, BugType::Syntax | BugType::Import)
    }

    pub fn label(self) -> &'static str {
        match self {
            BugType::Syntax => "SYNTAX",
            BugType::Import => "IMPORT",
            BugType::TypeError => "TYPE_ERROR",
            BugType::Indentation => "INDENTATION",
            BugType::Logic => "LOGIC",
            BugType::Linting => "LINTING",
        }
    }

    /// Coarse severity hint handed to the fix generator.
    pub fn severity_hint(self) -> &'static str {
        match self {
            BugType::Syntax | BugType::Indentation => "syntax",
            BugType::Import => "import",
            BugType::TypeError => "type",
            BugType::Logic => "logic",
            BugType::Linting => "lint",
        }
    }

    /// Allowed sub-types with their canonical fix descriptions.
    pub fn sub_types(self) -> &'static [(&'static str, &'static str)] {
        match self {
            BugType::Syntax => SYNTAX_SUB_TYPES,
            BugType::Import => IMPORT_SUB_TYPES,
            BugType::TypeError => TYPE_ERROR_SUB_TYPES,
            BugType::Indentation => INDENTATION_SUB_TYPES,
            BugType::Logic => LOGIC_SUB_TYPES,
            BugType::Linting => LINTING_SUB_TYPES,
        }
    }

    pub fn allows(self, sub_type: &str) -> bool {
        self.fix_description(sub_type).is_some()
    }

    pub fn fix_description(self, sub_type: &str) -> Option<&'static str> {
        self.sub_types()
            .iter()
            .find(|(key, _)| *key == sub_type)
            .map(|(_, desc)| *desc)
    }
}

impl fmt::Display for BugType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for BugType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        BugType::ALL
            .into_iter()
            .find(|t| t.label().eq_ignore_ascii_case(s))
            .with_context(|| format!("unknown bug type: {s}"))
    }
}

/// One detected defect. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawBugReport")]
pub struct BugReport {
    bug_type: BugType,
    sub_type: String,
    file_path: String,
    line_number: u32,
    domain: String,
    confidence: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    message: String,
}

#[derive(Deserialize)]
struct RawBugReport {
    bug_type: BugType,
    sub_type: String,
    file_path: String,
    line_number: u32,
    #[serde(default)]
    domain: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
    #[serde(default)]
    message: String,
}

fn default_confidence() -> f64 {
    1.0
}

impl TryFrom<RawBugReport> for BugReport {
    type Error = anyhow::Error;

    fn try_from(raw: RawBugReport) -> Result<Self> {
        Ok(BugReport::new(raw.bug_type, &raw.sub_type, &raw.file_path, raw.line_number)?
            .with_domain(raw.domain)
            .with_confidence(raw.confidence)?
            .with_message(raw.message))
    }
}

impl BugReport {
    /// Build a report, rejecting sub-types not allowed for `bug_type` and
    /// line numbers below 1. The file path is normalized to forward slashes.
    pub fn new(bug_type: BugType, sub_type: &str, file_path: &str, line_number: u32) -> Result<Self> {
        if !bug_type.allows(sub_type) {
            anyhow::bail!("sub-type '{sub_type}' is not valid for {bug_type}");
        }
        if line_number == 0 {
            anyhow::bail!("line numbers start at 1 ({file_path})");
        }
        let file_path = normalize_path(file_path);
        if file_path.is_empty() {
            anyhow::bail!("bug report has an empty file path");
        }
        Ok(Self {
            bug_type,
            sub_type: sub_type.to_string(),
            file_path,
            line_number,
            domain: String::new(),
            confidence: 1.0,
            message: String::new(),
        })
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&confidence) {
            anyhow::bail!("confidence {confidence} outside [0, 1]");
        }
        self.confidence = confidence;
        Ok(self)
    }

    /// Attach the raw parser message (compiler or linter output line).
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn bug_type(&self) -> BugType {
        self.bug_type
    }

    pub fn sub_type(&self) -> &str {
        &self.sub_type
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    pub fn line_number(&self) -> u32 {
        self.line_number
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn priority(&self) -> u8 {
        self.bug_type.priority()
    }

    pub fn fix_description(&self) -> &'static str {
        // Construction guarantees the pair is in the table.
        self.bug_type
            .fix_description(&self.sub_type)
            .unwrap_or("correct the reported defect")
    }

    /// Canonical, byte-exact description used in the results document.
    pub fn describe(&self) -> String {
        format!(
            "{} error in {} line {} \u{2192} Fix: {}",
            self.bug_type,
            self.file_path,
            self.line_number,
            self.fix_description()
        )
    }
}

/// Sort reports into processing order: bug type priority, then file path,
/// then line number.
pub fn sort_by_priority(bugs: &mut [BugReport]) {
    bugs.sort_by(|a, b| {
        a.bug_type
            .cmp(&b.bug_type)
            .then_with(|| a.file_path.cmp(&b.file_path))
            .then_with(|| a.line_number.cmp(&b.line_number))
    });
}

/// Normalize a repo-relative path: forward slashes, no leading `./`.
pub fn normalize_path(path: &str) -> String {
    let path = path.trim().replace('\\', "/");
    path.trim_start_matches("./").to_string()
}

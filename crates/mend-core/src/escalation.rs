//! Closed taxonomy of reasons a fix attempt was rejected.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a proposed fix was not accepted. Every rejection carries exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationReason {
    DiffTooLarge,
    LowConfidence,
    OutOfScope,
    LocalityViolation,
    InvalidResponse,
    RepeatedFix,
    MergeConflict,
    LlmFailure,
}

impl EscalationReason {
    pub fn label(self) -> &'static str {
        match self {
            EscalationReason::DiffTooLarge => "DIFF_TOO_LARGE",
            EscalationReason::LowConfidence => "LOW_CONFIDENCE",
            EscalationReason::OutOfScope => "OUT_OF_SCOPE",
            EscalationReason::LocalityViolation => "LOCALITY_VIOLATION",
            EscalationReason::InvalidResponse => "INVALID_RESPONSE",
            EscalationReason::RepeatedFix => "REPEATED_FIX",
            EscalationReason::MergeConflict => "MERGE_CONFLICT",
            EscalationReason::LlmFailure => "LLM_FAILURE",
        }
    }

    /// Rejections that no later iteration can resolve without a human.
    pub fn needs_human(self) -> bool {
        matches!(self, EscalationReason::MergeConflict)
    }
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

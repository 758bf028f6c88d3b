//! Stable identifiers for bugs and for proposed fixes.
//!
//! A [`BugSignature`] names a defect by location and classification, and
//! survives across iterations no matter which patch is proposed for it. A
//! [`PatchFingerprint`] names one specific patch for one specific bug; seeing
//! the same fingerprint twice means the generator repeated itself.

use crate::bug::BugReport;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Hex characters kept from each SHA-256 digest.
const HASH_LEN: usize = 16;

fn short_sha256(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let mut hex = hex::encode(hasher.finalize());
    hex.truncate(HASH_LEN);
    hex
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BugSignature(String);

impl BugSignature {
    pub fn of(bug: &BugReport) -> Self {
        Self::from_parts(bug.file_path(), bug.line_number(), bug.sub_type())
    }

    pub fn from_parts(file_path: &str, line_number: u32, sub_type: &str) -> Self {
        Self(short_sha256(&format!("{file_path}:{line_number}:{sub_type}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BugSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash of a unified diff. Blank diffs hash to the empty string.
pub fn patch_hash(diff: &str) -> String {
    if diff.trim().is_empty() {
        return String::new();
    }
    short_sha256(diff)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatchFingerprint(String);

impl PatchFingerprint {
    /// Combine a bug signature with the hash of the proposed diff.
    ///
    /// With no diff there is nothing to distinguish the attempt by, so the
    /// fingerprint collapses to the signature itself.
    pub fn new(signature: &BugSignature, diff: &str) -> Self {
        let hash = patch_hash(diff);
        if hash.is_empty() {
            return Self(signature.0.clone());
        }
        Self(short_sha256(&format!("{signature}:{hash}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PatchFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

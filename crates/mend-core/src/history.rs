//! Bounded, run-scoped memory of which patches were already proposed for
//! which bugs.
//!
//! Two FIFO bounds apply: each signature keeps at most `per_bug_capacity`
//! fingerprints, and at most `global_capacity` signatures are tracked. When
//! the global bound is hit the oldest signature is dropped together with all
//! of its fingerprints.

use crate::fingerprint::{BugSignature, PatchFingerprint};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

pub const DEFAULT_PER_BUG_CAPACITY: usize = 5;
pub const DEFAULT_GLOBAL_CAPACITY: usize = 200;

/// Serialized form of one signature's history, oldest fingerprint first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixHistoryEntry {
    pub signature: BugSignature,
    pub fingerprints: Vec<PatchFingerprint>,
}

#[derive(Debug, Clone)]
pub struct FixHistoryStore {
    per_bug_capacity: usize,
    global_capacity: usize,
    entries: HashMap<BugSignature, VecDeque<PatchFingerprint>>,
    /// Signatures in first-seen order; front is evicted first.
    order: VecDeque<BugSignature>,
}

impl FixHistoryStore {
    pub fn new(per_bug_capacity: usize, global_capacity: usize) -> Self {
        Self {
            per_bug_capacity: per_bug_capacity.max(1),
            global_capacity: global_capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn contains(&self, signature: &BugSignature, fingerprint: &PatchFingerprint) -> bool {
        self.entries
            .get(signature)
            .is_some_and(|fps| fps.contains(fingerprint))
    }

    /// Record a fingerprint. Re-recording a known fingerprint is a no-op.
    pub fn record(&mut self, signature: BugSignature, fingerprint: PatchFingerprint) {
        if !self.entries.contains_key(&signature) {
            while self.order.len() >= self.global_capacity {
                if let Some(oldest) = self.order.pop_front() {
                    tracing::debug!(signature = %oldest, "evicting oldest signature from fix history");
                    self.entries.remove(&oldest);
                }
            }
            self.order.push_back(signature.clone());
        }

        let fps = self.entries.entry(signature).or_default();
        if fps.contains(&fingerprint) {
            return;
        }
        fps.push_back(fingerprint);
        while fps.len() > self.per_bug_capacity {
            fps.pop_front();
        }
    }

    /// Fingerprints recorded for a signature, oldest first.
    pub fn fingerprints(&self, signature: &BugSignature) -> Vec<PatchFingerprint> {
        self.entries
            .get(signature)
            .map(|fps| fps.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn tracked_signatures(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Snapshot in signature insertion order.
    pub fn to_entries(&self) -> Vec<FixHistoryEntry> {
        self.order
            .iter()
            .map(|sig| FixHistoryEntry {
                signature: sig.clone(),
                fingerprints: self.fingerprints(sig),
            })
            .collect()
    }

    /// Rebuild a store from entries, re-applying both capacity bounds.
    pub fn from_entries(
        entries: impl IntoIterator<Item = FixHistoryEntry>,
        per_bug_capacity: usize,
        global_capacity: usize,
    ) -> Self {
        let mut store = Self::new(per_bug_capacity, global_capacity);
        for entry in entries {
            for fp in entry.fingerprints {
                store.record(entry.signature.clone(), fp);
            }
        }
        store
    }
}

impl Default for FixHistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_PER_BUG_CAPACITY, DEFAULT_GLOBAL_CAPACITY)
    }
}

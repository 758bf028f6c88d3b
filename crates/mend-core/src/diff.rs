//! Unified diffs between an original file and a proposed patch.
//!
//! Diffs are computed in-memory with libgit2 (no repository needed). Besides
//! the textual diff, each added/removed line is mapped to its absolute line
//! number in the old or new file, as reported by the hunk headers.

use anyhow::{Context, Result};
use std::path::Path;

/// Which side of the diff a changed line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Removed,
}

/// One added or removed line, numbered in its own file (new for added,
/// old for removed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangedLine {
    pub kind: ChangeKind,
    pub line: u32,
}

/// A computed diff between two versions of one file.
#[derive(Debug, Clone, Default)]
pub struct FileDiff {
    /// Unified diff text, empty when the contents are identical.
    pub text: String,
    pub changes: Vec<ChangedLine>,
}

impl FileDiff {
    /// Compute the diff of `original` → `patched` for `path`.
    pub fn compute(path: &str, original: &str, patched: &str) -> Result<Self> {
        let as_path = Path::new(path);
        let mut patch = git2::Patch::from_buffers(
            original.as_bytes(),
            Some(as_path),
            patched.as_bytes(),
            Some(as_path),
            None,
        )
        .with_context(|| format!("failed to diff {path}"))?;

        if patch.num_hunks() == 0 {
            return Ok(Self::default());
        }

        let mut changes = Vec::new();
        for hunk_idx in 0..patch.num_hunks() {
            let lines = patch.num_lines_in_hunk(hunk_idx)?;
            for line_idx in 0..lines {
                let line = patch.line_in_hunk(hunk_idx, line_idx)?;
                match line.origin() {
                    '+' => {
                        if let Some(n) = line.new_lineno() {
                            changes.push(ChangedLine {
                                kind: ChangeKind::Added,
                                line: n,
                            });
                        }
                    }
                    '-' => {
                        if let Some(n) = line.old_lineno() {
                            changes.push(ChangedLine {
                                kind: ChangeKind::Removed,
                                line: n,
                            });
                        }
                    }
                    _ => {}
                }
            }
        }

        let buf = patch.to_buf().context("failed to render diff")?;
        let text = buf
            .as_str()
            .context("diff is not valid UTF-8")?
            .to_string();

        Ok(Self { text, changes })
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Added plus removed lines, header lines excluded.
    pub fn changed_line_count(&self) -> usize {
        self.changes.len()
    }

    /// Changed lines falling outside `[low, high]`.
    pub fn lines_outside(&self, low: u32, high: u32) -> impl Iterator<Item = &ChangedLine> {
        self.changes
            .iter()
            .filter(move |c| c.line < low || c.line > high)
    }
}

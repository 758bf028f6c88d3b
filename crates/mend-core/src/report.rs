//! The per-run results document, written once when the run ends.

use crate::history::FixHistoryEntry;
use crate::provider::ProviderUsage;
use crate::run::{IterationSnapshot, RepositoryInfo, RunState, RunStatus};
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Serialize)]
pub struct RunReport<'a> {
    pub repository: &'a RepositoryInfo,
    pub iterations: Vec<IterationReport<'a>>,
    pub fix_history: &'a [FixHistoryEntry],
    pub provider_usage: &'a [ProviderUsage],
    pub final_results: FinalResults<'a>,
}

#[derive(Debug, Serialize)]
pub struct IterationReport<'a> {
    #[serde(flatten)]
    pub snapshot: &'a IterationSnapshot,
    /// Canonical one-line description per bug, in processing order.
    pub formatted_bugs: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct FinalResults<'a> {
    pub status: RunStatus,
    pub iterations_used: u32,
    pub total_bugs_found: u32,
    pub total_fixes_applied: u32,
    pub effective_fix_count: u32,
    pub skipped_fix_count: u32,
    pub commit_count: u32,
    pub commit_budget_risk: bool,
    pub efficiency_penalty_risk: bool,
    pub ci_stalled: bool,
    pub summary: &'a str,
    pub total_time_seconds: f64,
}

impl<'a> RunReport<'a> {
    pub fn from_state(state: &'a RunState) -> Self {
        let iterations = state
            .iterations
            .iter()
            .map(|snapshot| IterationReport {
                formatted_bugs: snapshot.bug_reports.iter().map(|b| b.describe()).collect(),
                snapshot,
            })
            .collect();
        Self {
            repository: &state.repository,
            iterations,
            fix_history: &state.fix_history,
            provider_usage: &state.provider_usage,
            final_results: FinalResults {
                status: state.status,
                iterations_used: state.iteration,
                total_bugs_found: state.total_bugs_found,
                total_fixes_applied: state.total_fixes_applied,
                effective_fix_count: state.effective_fix_count,
                skipped_fix_count: state.skipped_fix_count,
                commit_count: state.commit_count,
                commit_budget_risk: state.commit_budget_risk,
                efficiency_penalty_risk: state.efficiency_penalty_risk,
                ci_stalled: state.ci_stalled,
                summary: &state.execution_summary,
                total_time_seconds: state.total_time_seconds,
            },
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize run report")
    }
}

/// Write the results document for a finished run.
pub fn write_report(state: &RunState, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = RunReport::from_state(state).to_json()?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!(path = %path.display(), status = %state.status, "results written");
    Ok(())
}

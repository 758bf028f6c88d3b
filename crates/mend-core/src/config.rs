//! Healing run configuration, parsed from TOML with environment overrides.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration.

use crate::acceptance::AcceptancePolicy;
use crate::ci::CiPollConfig;
use crate::gate::{CommitPolicy, branch_name};
use crate::history::{DEFAULT_GLOBAL_CAPACITY, DEFAULT_PER_BUG_CAPACITY};
use crate::provider::ProviderConfig;
use crate::run::GuardrailConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealConfig {
    pub run: RunConfig,
    pub guardrail: GuardrailConfig,
    pub acceptance: AcceptancePolicy,
    pub history: HistoryConfig,
    pub commit: CommitPolicy,
    pub ci: CiPollConfig,
    pub providers: ProviderConfig,
    pub team: TeamConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Maximum loop iterations (`RUN_RETRY_LIMIT`).
    pub retry_limit: u32,
    /// Generation attempts allowed per bug signature across the run.
    pub max_attempts_per_bug: u32,
    /// External ceiling on the whole run; well above the guardrail abort.
    pub hard_deadline_secs: u64,
    /// Shell command used by the shell build executor.
    pub build_command: String,
    pub build_timeout_secs: u64,
    /// Where the results document is written, if anywhere.
    pub results_path: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            retry_limit: 5,
            max_attempts_per_bug: 3,
            hard_deadline_secs: 600,
            build_command: "make test".into(),
            build_timeout_secs: 120,
            results_path: None,
        }
    }
}

impl RunConfig {
    pub fn hard_deadline(&self) -> Duration {
        Duration::from_secs(self.hard_deadline_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub per_bug_capacity: usize,
    pub global_capacity: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            per_bug_capacity: DEFAULT_PER_BUG_CAPACITY,
            global_capacity: DEFAULT_GLOBAL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeamConfig {
    pub team_name: String,
    pub leader_name: String,
    /// Explicit push branch; derived from team and leader when unset.
    pub branch: Option<String>,
}

impl TeamConfig {
    pub fn branch(&self) -> String {
        self.branch
            .clone()
            .unwrap_or_else(|| branch_name(&self.team_name, &self.leader_name))
    }
}

impl HealConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup: `RUN_RETRY_LIMIT`,
    /// `GITHUB_TOKEN`, `MEND_TEAM_NAME`, `MEND_LEADER_NAME`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(limit) = lookup("RUN_RETRY_LIMIT") {
            self.run.retry_limit = limit
                .trim()
                .parse()
                .with_context(|| format!("RUN_RETRY_LIMIT must be a positive integer, got '{limit}'"))?;
        }
        if let Some(token) = lookup("GITHUB_TOKEN")
            && !token.trim().is_empty()
        {
            self.ci.token = Some(token.trim().to_string());
        }
        if let Some(team) = lookup("MEND_TEAM_NAME") {
            self.team.team_name = team;
        }
        if let Some(leader) = lookup("MEND_LEADER_NAME") {
            self.team.leader_name = leader;
        }
        self.validate()
    }

    /// Reject settings the loop cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.run.retry_limit == 0 {
            anyhow::bail!("run.retry_limit must be at least 1");
        }
        let g = &self.guardrail;
        if !(g.reduced_secs <= g.critical_secs && g.critical_secs <= g.abort_secs) {
            anyhow::bail!(
                "guardrail thresholds must be ordered: reduced ({}) <= critical ({}) <= abort ({})",
                g.reduced_secs,
                g.critical_secs,
                g.abort_secs
            );
        }
        if self.run.hard_deadline_secs <= g.abort_secs {
            tracing::warn!(
                hard_deadline_secs = self.run.hard_deadline_secs,
                abort_secs = g.abort_secs,
                "hard deadline does not leave room after the guardrail"
            );
        }
        if !(0.0..=1.0).contains(&self.providers.confidence_threshold) {
            anyhow::bail!("providers.confidence_threshold must be within [0, 1]");
        }
        Ok(())
    }
}

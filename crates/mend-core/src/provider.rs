//! Health tracking and selection for fix-generation providers.
//!
//! Providers are tried in a fixed priority order. A provider that fails
//! `failure_threshold` times in a row sits out the next
//! `cooldown_selections` selection requests, then comes back one failure
//! away from another cooldown.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider names, primary first.
    pub order: Vec<String>,
    pub failure_threshold: u32,
    pub cooldown_selections: u32,
    pub confidence_threshold: f64,
    /// Minimum `len(patched) / len(original)`; shorter patches are treated
    /// as truncated responses.
    pub truncation_ratio: f64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            order: vec!["gemini".into(), "groq".into()],
            failure_threshold: 3,
            cooldown_selections: 5,
            confidence_threshold: 0.6,
            truncation_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub name: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub cooldown_remaining: u32,
}

/// One selection decision, kept for the run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub provider_used: String,
    pub fallback_triggered: bool,
    pub cooldown_active: bool,
}

#[derive(Debug, Clone)]
pub struct ProviderHealthRouter {
    failure_threshold: u32,
    cooldown_selections: u32,
    providers: Vec<ProviderHealth>,
    usage: Vec<ProviderUsage>,
}

impl ProviderHealthRouter {
    pub fn new(config: &ProviderConfig) -> Self {
        let providers = config
            .order
            .iter()
            .map(|name| ProviderHealth {
                name: name.clone(),
                healthy: true,
                consecutive_failures: 0,
                cooldown_remaining: 0,
            })
            .collect();
        Self {
            failure_threshold: config.failure_threshold.max(1),
            cooldown_selections: config.cooldown_selections,
            providers,
            usage: Vec::new(),
        }
    }

    pub fn primary(&self) -> Option<&str> {
        self.providers.first().map(|p| p.name.as_str())
    }

    /// Pick a provider for the next request and advance cooldowns.
    ///
    /// Returns the first healthy provider in priority order, or the primary
    /// as a last resort when none is healthy.
    pub fn select(&mut self) -> Option<String> {
        let primary = self.primary()?.to_string();
        let healthy = self.providers.iter().find(|p| p.healthy).map(|p| p.name.clone());
        let cooldown_active = self.providers.iter().any(|p| !p.healthy);
        let chosen = healthy.unwrap_or_else(|| primary.clone());

        self.tick_cooldowns();

        self.usage.push(ProviderUsage {
            fallback_triggered: chosen != primary,
            provider_used: chosen.clone(),
            cooldown_active,
        });
        Some(chosen)
    }

    /// Next healthy provider after `current` in priority order, wrapping
    /// around to the front. Does not advance cooldowns.
    pub fn fallback_after(&self, current: &str) -> Option<String> {
        let start = self
            .providers
            .iter()
            .position(|p| p.name == current)
            .map_or(0, |i| i + 1);
        self.providers[start..]
            .iter()
            .chain(&self.providers[..start])
            .find(|p| p.healthy && p.name != current)
            .map(|p| p.name.clone())
    }

    pub fn record_success(&mut self, name: &str) {
        if let Some(p) = self.find_mut(name)
            && p.healthy
        {
            p.consecutive_failures = 0;
        }
    }

    pub fn record_failure(&mut self, name: &str) {
        let threshold = self.failure_threshold;
        let cooldown = self.cooldown_selections;
        if let Some(p) = self.find_mut(name) {
            p.consecutive_failures += 1;
            if p.healthy && p.consecutive_failures >= threshold {
                p.healthy = false;
                p.cooldown_remaining = cooldown;
                tracing::warn!(provider = %p.name, failures = p.consecutive_failures, "provider entering cooldown");
            }
        }
    }

    pub fn health(&self, name: &str) -> Option<&ProviderHealth> {
        self.providers.iter().find(|p| p.name == name)
    }

    pub fn is_healthy(&self, name: &str) -> bool {
        self.health(name).is_some_and(|p| p.healthy)
    }

    pub fn usage_log(&self) -> &[ProviderUsage] {
        &self.usage
    }

    /// Forget all health state and usage.
    pub fn reset(&mut self) {
        for p in &mut self.providers {
            p.healthy = true;
            p.consecutive_failures = 0;
            p.cooldown_remaining = 0;
        }
        self.usage.clear();
    }

    fn tick_cooldowns(&mut self) {
        let primed = self.failure_threshold.saturating_sub(1);
        for p in self.providers.iter_mut().filter(|p| !p.healthy) {
            p.cooldown_remaining = p.cooldown_remaining.saturating_sub(1);
            if p.cooldown_remaining == 0 {
                p.healthy = true;
                p.consecutive_failures = primed;
                tracing::info!(provider = %p.name, "provider re-enabled after cooldown");
            }
        }
    }

    fn find_mut(&mut self, name: &str) -> Option<&mut ProviderHealth> {
        self.providers.iter_mut().find(|p| p.name == name)
    }
}

//! Fix generation over a set of LLM providers with health-based routing.
//!
//! `RoutedFixGenerator` picks a provider through the
//! [`ProviderHealthRouter`], falls back once to the next healthy provider on
//! failure, and turns every unusable answer into a tagged rejection.

use crate::collaborator::{FixGenerator, FixProposal, FixRequest};
use anyhow::Result;
use async_trait::async_trait;
use mend_core::escalation::EscalationReason;
use mend_core::provider::{ProviderConfig, ProviderHealthRouter, ProviderUsage};
use tokio::sync::Mutex;

/// A provider's raw answer.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub patched_content: String,
    pub confidence: f64,
}

/// One external model endpoint able to propose a patched file.
#[async_trait]
pub trait FixProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn propose(&self, request: &FixRequest<'_>) -> Result<ProviderResponse>;
}

/// Fix generator for one run. Owns its router, so health state is never
/// shared between runs.
pub struct RoutedFixGenerator {
    providers: Vec<Box<dyn FixProvider>>,
    router: Mutex<ProviderHealthRouter>,
    confidence_threshold: f64,
    truncation_ratio: f64,
}

impl RoutedFixGenerator {
    /// Providers are routed in `config.order`; providers missing from the
    /// order are appended after it.
    pub fn new(config: &ProviderConfig, providers: Vec<Box<dyn FixProvider>>) -> Self {
        let mut order = config.order.clone();
        for p in &providers {
            if !order.iter().any(|o| o == p.name()) {
                order.push(p.name().to_string());
            }
        }
        let router_config = ProviderConfig {
            order,
            ..config.clone()
        };
        Self {
            providers,
            router: Mutex::new(ProviderHealthRouter::new(&router_config)),
            confidence_threshold: config.confidence_threshold,
            truncation_ratio: config.truncation_ratio,
        }
    }

    fn provider(&self, name: &str) -> Option<&dyn FixProvider> {
        self.providers
            .iter()
            .find(|p| p.name() == name)
            .map(|p| p.as_ref())
    }

    async fn call(&self, name: &str, request: &FixRequest<'_>) -> Result<ProviderResponse> {
        let provider = self
            .provider(name)
            .ok_or_else(|| anyhow::anyhow!("provider '{name}' is not registered"))?;
        provider.propose(request).await
    }

    fn judge(&self, response: ProviderResponse, original: &str, provider: String) -> FixProposal {
        let patched = response.patched_content;
        if patched.trim().is_empty() {
            return FixProposal::Rejected {
                reason: EscalationReason::InvalidResponse,
                message: "provider returned empty content".into(),
                provider_used: provider,
            };
        }
        if !(0.0..=1.0).contains(&response.confidence) {
            return FixProposal::Rejected {
                reason: EscalationReason::InvalidResponse,
                message: format!("confidence {} outside [0, 1]", response.confidence),
                provider_used: provider,
            };
        }
        if is_truncated(original, &patched, self.truncation_ratio) {
            return FixProposal::Rejected {
                reason: EscalationReason::InvalidResponse,
                message: format!(
                    "patched content looks truncated ({} of {} bytes)",
                    patched.len(),
                    original.len()
                ),
                provider_used: provider,
            };
        }
        if response.confidence < self.confidence_threshold {
            return FixProposal::Rejected {
                reason: EscalationReason::LowConfidence,
                message: format!(
                    "confidence {:.2} below threshold {:.2}",
                    response.confidence, self.confidence_threshold
                ),
                provider_used: provider,
            };
        }
        FixProposal::Patched {
            patched_content: patched,
            confidence: response.confidence,
            provider_used: provider,
        }
    }
}

/// `len(patched) / len(original) < ratio`. An empty original never counts.
pub fn is_truncated(original: &str, patched: &str, ratio: f64) -> bool {
    if original.is_empty() {
        return false;
    }
    (patched.len() as f64 / original.len() as f64) < ratio
}

#[async_trait]
impl FixGenerator for RoutedFixGenerator {
    async fn generate(&self, request: FixRequest<'_>) -> Result<FixProposal> {
        let Some(first) = self.router.lock().await.select() else {
            return Ok(FixProposal::Rejected {
                reason: EscalationReason::LlmFailure,
                message: "no providers configured".into(),
                provider_used: String::new(),
            });
        };

        let mut current = first;
        let mut fell_back = false;
        loop {
            match self.call(&current, &request).await {
                Ok(response) => {
                    self.router.lock().await.record_success(&current);
                    return Ok(self.judge(response, request.file_content, current));
                }
                Err(e) => {
                    tracing::warn!(provider = %current, error = %e, "fix provider failed");
                    let mut router = self.router.lock().await;
                    router.record_failure(&current);
                    let next = if fell_back {
                        None
                    } else {
                        router.fallback_after(&current)
                    };
                    drop(router);
                    match next {
                        Some(next) => {
                            tracing::info!(from = %current, to = %next, "falling back to next provider");
                            current = next;
                            fell_back = true;
                        }
                        None => {
                            return Ok(FixProposal::Rejected {
                                reason: EscalationReason::LlmFailure,
                                message: format!("{current}: {e:#}"),
                                provider_used: current,
                            });
                        }
                    }
                }
            }
        }
    }

    async fn provider_usage(&self) -> Vec<ProviderUsage> {
        self.router.lock().await.usage_log().to_vec()
    }
}

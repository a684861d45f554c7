//! Lead-time estimator — asks an inference service how many minutes ahead to remind.
//!
//! Advisory only: a single attempt under a hard deadline, and anything other
//! than a clean positive integer collapses to the per-kind default.

use std::sync::Arc;

use async_trait::async_trait;
use chime_core::config::EstimatorConfig;
use chime_core::traits::LeadTimeEstimator;
use chime_core::types::ItemKind;

use crate::openai_compatible::{CompletionParams, OpenAiCompatibleClient};

const SYSTEM_PROMPT: &str = "You estimate how many minutes before an item is due a reminder \
should be sent, based only on its description. Reply with a single positive integer \
number of minutes and nothing else. If the description gives no hint, reply 30.";

/// Estimator backed by an OpenAI-compatible chat endpoint.
pub struct ChatEstimator {
    client: OpenAiCompatibleClient,
    params: CompletionParams,
    config: EstimatorConfig,
}

impl ChatEstimator {
    pub fn new(client: OpenAiCompatibleClient, config: EstimatorConfig) -> Self {
        Self {
            params: CompletionParams::from_config(&config),
            client,
            config,
        }
    }
}

#[async_trait]
impl LeadTimeEstimator for ChatEstimator {
    fn name(&self) -> &str {
        self.client.name()
    }

    async fn estimate(&self, kind: ItemKind, description: Option<&str>) -> u32 {
        let fallback = self.config.default_minutes(kind);
        let Some(text) = description.map(str::trim).filter(|d| !d.is_empty()) else {
            return fallback;
        };

        let user = format!("{} description: {}", kind, text);
        let call = self.client.complete(SYSTEM_PROMPT, &user, &self.params);

        let reply = match tokio::time::timeout(self.config.timeout(), call).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                tracing::warn!("⚠️ Estimator degraded ({e}), using default {fallback}m");
                return fallback;
            }
            Err(_) => {
                tracing::warn!(
                    "⏱️ Estimator timed out after {}ms, using default {fallback}m",
                    self.config.timeout_ms
                );
                return fallback;
            }
        };

        match parse_minutes(&reply) {
            Some(minutes) => {
                let clamped = minutes.min(self.config.max_minutes);
                tracing::debug!("🧮 Estimated lead time for {kind}: {clamped}m (raw '{reply}')");
                clamped
            }
            None => {
                tracing::warn!(
                    "⚠️ Estimator reply '{reply}' is not a positive integer, using {fallback}m"
                );
                fallback
            }
        }
    }
}

/// Estimator that never calls out; used when estimation is disabled or unconfigured.
pub struct FixedEstimator {
    config: EstimatorConfig,
}

impl FixedEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl LeadTimeEstimator for FixedEstimator {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn estimate(&self, kind: ItemKind, _description: Option<&str>) -> u32 {
        self.config.default_minutes(kind)
    }
}

/// Strict parse: the whole reply must be a positive integer.
pub fn parse_minutes(reply: &str) -> Option<u32> {
    match reply.trim().parse::<i64>() {
        Ok(n) if n > 0 => Some(u32::try_from(n).unwrap_or(u32::MAX)),
        _ => None,
    }
}

/// Build the estimator described by config, degrading to [`FixedEstimator`]
/// when the remote one cannot be constructed.
pub fn create_estimator(config: &EstimatorConfig) -> Arc<dyn LeadTimeEstimator> {
    if !config.enabled {
        tracing::info!("🧮 Lead-time estimator disabled, using per-kind defaults");
        return Arc::new(FixedEstimator::new(config.clone()));
    }
    match OpenAiCompatibleClient::from_config(config) {
        Ok(client) => {
            tracing::info!(
                "🧮 Lead-time estimator: provider={}, model={}, timeout={}ms",
                client.name(),
                config.model,
                config.timeout_ms
            );
            Arc::new(ChatEstimator::new(client, config.clone()))
        }
        Err(e) => {
            tracing::warn!("⚠️ Lead-time estimator unavailable: {e}, using per-kind defaults");
            Arc::new(FixedEstimator::new(config.clone()))
        }
    }
}

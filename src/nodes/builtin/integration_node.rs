use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::engine::context::StepContext;
use crate::engine::types::StepOutcome;
use crate::error::EngineError;
use crate::graph::{Node, NodeType};
use crate::nodes::{NodeHandler, ValidationResult};

const RETRY_BASE_MS: u64 = 200;

#[derive(Debug, Deserialize)]
struct WebhookConfig {
    url: String,
    #[serde(default)]
    payload: Value,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
    #[serde(default = "default_retries")]
    retries: u32,
    /// Swallow delivery failures instead of failing the step.
    #[serde(default)]
    best_effort: bool,
}

#[derive(Debug, Deserialize)]
struct AnalyticsConfig {
    event_name: String,
    #[serde(default)]
    properties: Value,
    /// Optional collector endpoint; without one the event is only
    /// traced.
    #[serde(default)]
    url: Option<String>,
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_retries() -> u32 {
    2
}

/// Outbound integrations: webhook delivery with retry, and best-effort
/// analytics events.
pub struct IntegrationHandler {
    http: reqwest::Client,
}

impl IntegrationHandler {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    async fn deliver(
        &self,
        url: &str,
        payload: &Value,
        timeout_ms: u64,
        retries: u32,
    ) -> Result<u16> {
        let mut attempt = 0;
        loop {
            let result = self
                .http
                .post(url)
                .timeout(Duration::from_millis(timeout_ms))
                .json(payload)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    return Ok(response.status().as_u16());
                }
                Ok(response) if attempt < retries => {
                    debug!(url, status = %response.status(), attempt, "Webhook retry");
                }
                Ok(response) => {
                    anyhow::bail!("webhook returned status {}", response.status());
                }
                Err(e) if attempt < retries => {
                    debug!(url, error = %e, attempt, "Webhook retry");
                }
                Err(e) => return Err(e.into()),
            }

            attempt += 1;
            tokio::time::sleep(Duration::from_millis(RETRY_BASE_MS * (1 << attempt))).await;
        }
    }
}

impl Default for IntegrationHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeHandler for IntegrationHandler {
    fn name(&self) -> &str {
        "integration"
    }

    fn handles(&self, node_type: NodeType) -> bool {
        matches!(
            node_type,
            NodeType::IntegrationWebhook | NodeType::IntegrationAnalytics
        )
    }

    fn validate(&self, node: &Node) -> ValidationResult {
        match node.node_type {
            NodeType::IntegrationWebhook => {
                match serde_json::from_value::<WebhookConfig>(node.config.clone()) {
                    Ok(cfg)
                        if !cfg.url.starts_with("http://")
                            && !cfg.url.starts_with("https://")
                            && !cfg.url.starts_with("{{") =>
                    {
                        ValidationResult::error(format!(
                            "node '{}': webhook url must be http(s)",
                            node.id
                        ))
                    }
                    Ok(_) => ValidationResult::ok(),
                    Err(e) => ValidationResult::error(format!("node '{}': {}", node.id, e)),
                }
            }
            NodeType::IntegrationAnalytics => {
                match serde_json::from_value::<AnalyticsConfig>(node.config.clone()) {
                    Ok(cfg) if cfg.event_name.trim().is_empty() => ValidationResult::error(
                        format!("node '{}': event_name is empty", node.id),
                    ),
                    Ok(_) => ValidationResult::ok(),
                    Err(e) => ValidationResult::error(format!("node '{}': {}", node.id, e)),
                }
            }
            other => ValidationResult::error(format!(
                "integration handler cannot validate type {}",
                other
            )),
        }
    }

    async fn execute(&self, node: &Node, ctx: &mut StepContext) -> Result<StepOutcome> {
        match node.node_type {
            NodeType::IntegrationWebhook => {
                let cfg: WebhookConfig = serde_json::from_value(node.config.clone())
                    .map_err(|e| {
                        EngineError::Config(format!("node '{}' has invalid config: {}", node.id, e))
                    })?;
                let url = ctx.render(&cfg.url).await;
                let payload = ctx.render_json(&cfg.payload).await;

                match self
                    .deliver(&url, &payload, cfg.timeout_ms, cfg.retries)
                    .await
                {
                    Ok(status) => {
                        ctx.log(
                            &node.id,
                            node.node_type,
                            "info",
                            format!("webhook delivered with status {}", status),
                        )
                        .await;
                    }
                    Err(e) if cfg.best_effort => {
                        warn!(node = %node.id, error = %e, "Webhook delivery failed (best effort)");
                    }
                    Err(e) => {
                        return Err(EngineError::handler(
                            &node.id,
                            format!("webhook delivery failed: {}", e),
                        )
                        .into());
                    }
                }
                Ok(StepOutcome::Advance)
            }

            NodeType::IntegrationAnalytics => {
                let cfg: AnalyticsConfig = serde_json::from_value(node.config.clone())
                    .map_err(|e| {
                        EngineError::Config(format!("node '{}' has invalid config: {}", node.id, e))
                    })?;
                let properties = ctx.render_json(&cfg.properties).await;
                let event = json!({
                    "event": cfg.event_name,
                    "project_id": ctx.execution.project_id,
                    "chat_id": ctx.execution.chat_id,
                    "properties": properties,
                });

                info!(event_name = %cfg.event_name, "Analytics event");
                if let Some(url) = cfg.url {
                    let url = ctx.render(&url).await;
                    // Analytics never block or fail the conversation.
                    if let Err(e) = self.deliver(&url, &event, 5_000, 0).await {
                        warn!(node = %node.id, error = %e, "Analytics delivery failed");
                    }
                }
                Ok(StepOutcome::Advance)
            }

            other => Err(EngineError::handler(
                &node.id,
                format!("integration handler cannot execute type {}", other),
            )
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(node_type: &str, config: serde_json::Value) -> Node {
        serde_json::from_value(json!({ "id": "i1", "type": node_type, "config": config })).unwrap()
    }

    #[test]
    fn webhook_url_scheme_checked() {
        let handler = IntegrationHandler::new();
        assert!(
            !handler
                .validate(&node("integration.webhook", json!({ "url": "ftp://x" })))
                .is_valid()
        );
        assert!(
            handler
                .validate(&node(
                    "integration.webhook",
                    json!({ "url": "https://hooks.example.com/x" })
                ))
                .is_valid()
        );
    }

    #[test]
    fn analytics_requires_event_name() {
        let handler = IntegrationHandler::new();
        assert!(
            !handler
                .validate(&node("integration.analytics", json!({ "event_name": "" })))
                .is_valid()
        );
    }
}

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::clients::DataOp;
use crate::engine::context::StepContext;
use crate::engine::types::{StepOutcome, WaitKind, WaitState};
use crate::error::EngineError;
use crate::graph::{Node, NodeType};
use crate::nodes::{NodeHandler, ValidationResult};
use crate::vars::VarScope;

const HTTP_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD"];
const IDEMPOTENT_METHODS: &[&str] = &["GET", "HEAD", "PUT", "DELETE"];
const RETRY_BASE_MS: u64 = 200;

#[derive(Debug, Deserialize)]
struct SetVariableConfig {
    #[serde(default = "default_scope")]
    scope: VarScope,
    name: String,
    value: Value,
    #[serde(default)]
    ttl_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GetVariableConfig {
    /// Exact scope; when absent, scopes are searched session → user →
    /// project → global.
    #[serde(default)]
    scope: Option<VarScope>,
    name: String,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    default: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RequestContactConfig {
    text: String,
    #[serde(default = "default_share_label")]
    button_text: String,
}

#[derive(Debug, Deserialize)]
struct NotificationConfig {
    chat_id: String,
    text: String,
}

#[derive(Debug, Deserialize)]
struct ApiRequestConfig {
    #[serde(default = "default_method")]
    method: String,
    url: String,
    #[serde(default)]
    headers: std::collections::HashMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
    #[serde(default = "default_retries")]
    retries: u32,
    #[serde(default = "default_api_output")]
    output: String,
}

#[derive(Debug, Deserialize)]
struct QueryConfig {
    operation: String,
    #[serde(default)]
    params: Value,
    #[serde(default = "default_query_output")]
    output: String,
}

fn default_scope() -> VarScope {
    VarScope::Session
}

fn default_share_label() -> String {
    "Share contact".to_string()
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_retries() -> u32 {
    2
}

fn default_api_output() -> String {
    "api_response".to_string()
}

fn default_query_output() -> String {
    "query_result".to_string()
}

/// Side-effecting nodes: variable access, outbound HTTP, data-layer
/// operations, contact collection and operator notifications.
pub struct ActionHandler {
    http: reqwest::Client,
}

impl ActionHandler {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for ActionHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeHandler for ActionHandler {
    fn name(&self) -> &str {
        "action"
    }

    fn handles(&self, node_type: NodeType) -> bool {
        matches!(
            node_type,
            NodeType::ActionApiRequest
                | NodeType::ActionDatabaseQuery
                | NodeType::ActionSetVariable
                | NodeType::ActionGetVariable
                | NodeType::ActionRequestContact
                | NodeType::ActionSendNotification
                | NodeType::ActionCheckUserLinked
                | NodeType::ActionFindUserByContact
                | NodeType::ActionLinkAccount
                | NodeType::ActionGetBalance
        )
    }

    fn validate(&self, node: &Node) -> ValidationResult {
        match node.node_type {
            NodeType::ActionSetVariable => check::<SetVariableConfig>(node),
            NodeType::ActionGetVariable => check::<GetVariableConfig>(node),
            NodeType::ActionRequestContact => check::<RequestContactConfig>(node),
            NodeType::ActionSendNotification => check::<NotificationConfig>(node),
            NodeType::ActionApiRequest => {
                match serde_json::from_value::<ApiRequestConfig>(node.config.clone()) {
                    Ok(cfg) if !HTTP_METHODS.contains(&cfg.method.to_uppercase().as_str()) => {
                        ValidationResult::error(format!(
                            "node '{}': unsupported HTTP method '{}'",
                            node.id, cfg.method
                        ))
                    }
                    Ok(cfg)
                        if !cfg.url.starts_with("http://")
                            && !cfg.url.starts_with("https://")
                            && !cfg.url.starts_with("{{") =>
                    {
                        ValidationResult::error(format!(
                            "node '{}': url must be http(s)",
                            node.id
                        ))
                    }
                    Ok(_) => ValidationResult::ok(),
                    Err(e) => ValidationResult::error(format!("node '{}': {}", node.id, e)),
                }
            }
            NodeType::ActionDatabaseQuery => {
                match serde_json::from_value::<QueryConfig>(node.config.clone()) {
                    // Parameters may contain templates, so only the
                    // operation name is checked here; the full whitelist
                    // check happens at execution after rendering.
                    Ok(cfg) if DataOp::from_named(&cfg.operation, &json!({})).is_err()
                        && !known_op(&cfg.operation) =>
                    {
                        ValidationResult::error(format!(
                            "node '{}': unknown data operation '{}'",
                            node.id, cfg.operation
                        ))
                    }
                    Ok(_) => ValidationResult::ok(),
                    Err(e) => ValidationResult::error(format!("node '{}': {}", node.id, e)),
                }
            }
            NodeType::ActionCheckUserLinked
            | NodeType::ActionFindUserByContact
            | NodeType::ActionLinkAccount
            | NodeType::ActionGetBalance => ValidationResult::ok(),
            other => {
                ValidationResult::error(format!("action handler cannot validate type {}", other))
            }
        }
    }

    async fn execute(&self, node: &Node, ctx: &mut StepContext) -> Result<StepOutcome> {
        match node.node_type {
            NodeType::ActionSetVariable => {
                let cfg: SetVariableConfig = parse(node)?;
                let value = ctx.render_json(&cfg.value).await;
                let ttl = cfg.ttl_seconds.map(Duration::from_secs);
                ctx.set_var(cfg.scope, &cfg.name, value, ttl).await?;
                Ok(StepOutcome::Advance)
            }

            NodeType::ActionGetVariable => {
                let cfg: GetVariableConfig = parse(node)?;
                let found = match cfg.scope {
                    Some(scope) => ctx.get_var(scope, &cfg.name).await,
                    None => ctx.snapshot().await.lookup(&cfg.name),
                };
                let value = found.or(cfg.default).unwrap_or(Value::Null);
                let output = cfg.output.unwrap_or(cfg.name);
                ctx.set_var(VarScope::Session, &output, value, None).await?;
                Ok(StepOutcome::Advance)
            }

            NodeType::ActionRequestContact => {
                let cfg: RequestContactConfig = parse(node)?;
                let payload = json!({
                    "chat_id": ctx.execution.chat_id,
                    "text": ctx.render(&cfg.text).await,
                    "reply_markup": {
                        "keyboard": [[{ "text": cfg.button_text, "request_contact": true }]],
                        "one_time_keyboard": true,
                        "resize_keyboard": true,
                    },
                });
                let response = ctx.messenger.post("sendMessage", payload).await?;
                if !response.ok {
                    return Err(EngineError::handler(
                        &node.id,
                        format!(
                            "contact request failed: {}",
                            response.description.as_deref().unwrap_or("no description")
                        ),
                    )
                    .into());
                }
                ctx.sent_messages += 1;
                Ok(StepOutcome::Suspend(WaitState {
                    node_id: node.id.clone(),
                    kind: WaitKind::Contact,
                    payload: Value::Null,
                }))
            }

            NodeType::ActionSendNotification => {
                let cfg: NotificationConfig = parse(node)?;
                let payload = json!({
                    "chat_id": ctx.render(&cfg.chat_id).await,
                    "text": ctx.render(&cfg.text).await,
                });
                // Notifications are best-effort; delivery failure never
                // fails the conversation.
                match ctx.messenger.post("sendMessage", payload).await {
                    Ok(response) if !response.ok => {
                        warn!(node = %node.id, description = ?response.description, "Notification rejected")
                    }
                    Err(e) => warn!(node = %node.id, error = %e, "Notification failed"),
                    Ok(_) => {}
                }
                Ok(StepOutcome::Advance)
            }

            NodeType::ActionApiRequest => self.api_request(node, ctx).await,

            NodeType::ActionDatabaseQuery => {
                let cfg: QueryConfig = parse(node)?;
                let params = ctx.render_json(&cfg.params).await;
                let op = DataOp::from_named(&cfg.operation, &params)?;
                let result = ctx.gateway.execute(op).await?;
                ctx.set_var(VarScope::Session, &cfg.output, result, None)
                    .await?;
                Ok(StepOutcome::Advance)
            }

            NodeType::ActionCheckUserLinked => {
                let op = DataOp::CheckUserLinked {
                    chat_id: ctx.execution.chat_id.clone(),
                };
                let result = ctx.gateway.execute(op).await?;
                let output = output_name(node, "linked");
                ctx.set_var(VarScope::Session, &output, result, None).await?;
                Ok(StepOutcome::Advance)
            }

            NodeType::ActionFindUserByContact => {
                let phone = match node.config.get("phone").and_then(|v| v.as_str()) {
                    Some(template) => ctx.render(template).await,
                    None => ctx
                        .event
                        .contact
                        .as_ref()
                        .and_then(|c| c.get("phone"))
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                        .ok_or_else(|| {
                            EngineError::handler(&node.id, "no contact phone available")
                        })?,
                };
                let result = ctx
                    .gateway
                    .execute(DataOp::FindUserByContact { phone })
                    .await?;
                let output = output_name(node, "user");
                ctx.set_var(VarScope::Session, &output, result, None).await?;
                Ok(StepOutcome::Advance)
            }

            NodeType::ActionLinkAccount => {
                let user_id = rendered_field(node, ctx, "user_id").await?;
                let result = ctx
                    .gateway
                    .execute(DataOp::LinkAccount {
                        chat_id: ctx.execution.chat_id.clone(),
                        user_id,
                    })
                    .await?;
                let output = output_name(node, "link_result");
                ctx.set_var(VarScope::Session, &output, result, None).await?;
                Ok(StepOutcome::Advance)
            }

            NodeType::ActionGetBalance => {
                let user_id = rendered_field(node, ctx, "user_id").await?;
                let result = ctx.gateway.execute(DataOp::GetBalance { user_id }).await?;
                let output = output_name(node, "balance");
                ctx.set_var(VarScope::Session, &output, result, None).await?;
                Ok(StepOutcome::Advance)
            }

            other => Err(EngineError::handler(
                &node.id,
                format!("action handler cannot execute type {}", other),
            )
            .into()),
        }
    }
}

impl ActionHandler {
    async fn api_request(&self, node: &Node, ctx: &mut StepContext) -> Result<StepOutcome> {
        let cfg: ApiRequestConfig = parse(node)?;
        let method = cfg.method.to_uppercase();
        let url = ctx.render(&cfg.url).await;
        let body = match &cfg.body {
            Some(b) => Some(ctx.render_json(b).await),
            None => None,
        };

        let retries = if IDEMPOTENT_METHODS.contains(&method.as_str()) {
            cfg.retries
        } else {
            0
        };

        let mut attempt = 0;
        loop {
            let mut request = self
                .http
                .request(method.parse().map_err(|_| {
                    EngineError::Config(format!("invalid HTTP method '{}'", method))
                })?, &url)
                .timeout(Duration::from_millis(cfg.timeout_ms));
            for (name, value) in &cfg.headers {
                request = request.header(name, ctx.render(value).await);
            }
            if let Some(b) = &body {
                request = request.json(b);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let data: Value = response.json().await.unwrap_or(Value::Null);
                    ctx.set_var(
                        VarScope::Session,
                        &cfg.output,
                        json!({ "status": status, "body": data }),
                        None,
                    )
                    .await?;
                    return Ok(StepOutcome::Advance);
                }
                Err(e) if attempt < retries => {
                    attempt += 1;
                    let backoff = RETRY_BASE_MS * (1 << attempt);
                    debug!(node = %node.id, attempt, error = %e, "Retrying API request");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => {
                    return Err(EngineError::handler(
                        &node.id,
                        format!("API request failed after {} attempts: {}", attempt + 1, e),
                    )
                    .into());
                }
            }
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(node: &Node) -> Result<T> {
    serde_json::from_value(node.config.clone()).map_err(|e| {
        EngineError::Config(format!("node '{}' has invalid config: {}", node.id, e)).into()
    })
}

fn check<T: serde::de::DeserializeOwned>(node: &Node) -> ValidationResult {
    match serde_json::from_value::<T>(node.config.clone()) {
        Ok(_) => ValidationResult::ok(),
        Err(e) => ValidationResult::error(format!("node '{}': {}", node.id, e)),
    }
}

fn known_op(name: &str) -> bool {
    matches!(
        name,
        "find_user_by_contact" | "get_balance" | "add_bonus" | "check_user_linked" | "link_account"
    )
}

fn output_name(node: &Node, default: &str) -> String {
    node.config
        .get("output")
        .and_then(|v| v.as_str())
        .unwrap_or(default)
        .to_string()
}

async fn rendered_field(node: &Node, ctx: &StepContext, field: &str) -> Result<String> {
    let template = node
        .config
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| EngineError::Config(format!("node '{}' requires '{}'", node.id, field)))?;
    Ok(ctx.render(template).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(node_type: &str, config: serde_json::Value) -> Node {
        serde_json::from_value(json!({ "id": "a1", "type": node_type, "config": config })).unwrap()
    }

    #[test]
    fn api_request_rejects_bad_method() {
        let handler = ActionHandler::new();
        let n = node(
            "action.api_request",
            json!({ "method": "TRACE", "url": "https://api.example.com" }),
        );
        assert!(!handler.validate(&n).is_valid());
    }

    #[test]
    fn api_request_rejects_non_http_url() {
        let handler = ActionHandler::new();
        let n = node(
            "action.api_request",
            json!({ "url": "file:///etc/passwd" }),
        );
        assert!(!handler.validate(&n).is_valid());
    }

    #[test]
    fn database_query_rejects_unknown_operation() {
        let handler = ActionHandler::new();
        let n = node(
            "action.database_query",
            json!({ "operation": "drop_table", "params": {} }),
        );
        assert!(!handler.validate(&n).is_valid());

        let n = node(
            "action.database_query",
            json!({ "operation": "get_balance", "params": { "user_id": "{{user_id}}" } }),
        );
        assert!(handler.validate(&n).is_valid());
    }

    #[test]
    fn set_variable_defaults_to_session_scope() {
        let cfg: SetVariableConfig =
            serde_json::from_value(json!({ "name": "x", "value": 1 })).unwrap();
        assert_eq!(cfg.scope, VarScope::Session);
    }
}

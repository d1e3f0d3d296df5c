use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::engine::context::StepContext;
use crate::engine::types::{StepOutcome, WaitKind, WaitState};
use crate::error::EngineError;
use crate::graph::{Node, NodeType};
use crate::nodes::{NodeHandler, ValidationResult};

#[derive(Debug, Deserialize)]
struct TextConfig {
    text: String,
    #[serde(default)]
    parse_mode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InlineButton {
    text: String,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InlineKeyboardConfig {
    text: String,
    buttons: Vec<Vec<InlineButton>>,
    /// Suspend until a button is pressed. On by default; turn off for
    /// fire-and-forget menus handled by callback triggers.
    #[serde(default = "default_true")]
    wait_for_reply: bool,
}

#[derive(Debug, Deserialize)]
struct ReplyButton {
    text: String,
    #[serde(default)]
    request_contact: bool,
}

#[derive(Debug, Deserialize)]
struct ReplyKeyboardConfig {
    text: String,
    buttons: Vec<Vec<ReplyButton>>,
    #[serde(default = "default_true")]
    one_time: bool,
}

#[derive(Debug, Deserialize)]
struct MediaConfig {
    file: String,
    #[serde(default)]
    caption: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EditConfig {
    message_id: Value,
    text: String,
}

#[derive(Debug, Deserialize)]
struct DeleteConfig {
    message_id: Value,
}

fn default_true() -> bool {
    true
}

/// Outbound message family: plain text, keyboards, media, edit and
/// delete. Keyboard nodes are the main suspension points of a
/// conversation.
pub struct MessageHandler;

impl MessageHandler {
    async fn call(
        &self,
        ctx: &mut StepContext,
        node_id: &str,
        method: &str,
        payload: Value,
    ) -> Result<Value> {
        let response = ctx.messenger.post(method, payload).await?;
        if !response.ok {
            return Err(EngineError::handler(
                node_id,
                format!(
                    "messaging call '{}' failed: {}",
                    method,
                    response.description.as_deref().unwrap_or("no description")
                ),
            )
            .into());
        }
        Ok(response.data)
    }

    async fn send(
        &self,
        ctx: &mut StepContext,
        node_id: &str,
        method: &str,
        payload: Value,
    ) -> Result<Value> {
        let data = self.call(ctx, node_id, method, payload).await?;
        ctx.sent_messages += 1;
        Ok(data)
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

    fn media_method(node_type: NodeType) -> (&'static str, &'static str) {
        match node_type {
            NodeType::MessagePhoto => ("sendPhoto", "photo"),
            NodeType::MessageVideo => ("sendVideo", "video"),
            _ => ("sendDocument", "document"),
        }
    }
}

#[async_trait]
impl NodeHandler for MessageHandler {
    fn name(&self) -> &str {
        "message"
    }

    fn handles(&self, node_type: NodeType) -> bool {
        matches!(
            node_type,
            NodeType::Message
                | NodeType::MessageKeyboardInline
                | NodeType::MessageKeyboardReply
                | NodeType::MessagePhoto
                | NodeType::MessageVideo
                | NodeType::MessageDocument
                | NodeType::MessageEdit
                | NodeType::MessageDelete
        )
    }

    fn validate(&self, node: &Node) -> ValidationResult {
        match node.node_type {
            NodeType::Message => Self::check::<TextConfig>(node),
            NodeType::MessageKeyboardInline => {
                match serde_json::from_value::<InlineKeyboardConfig>(node.config.clone()) {
                    Ok(cfg) if cfg.buttons.iter().all(|row| row.is_empty()) => {
                        ValidationResult::error(format!(
                            "node '{}': inline keyboard has no buttons",
                            node.id
                        ))
                    }
                    Ok(cfg)
                        if cfg
                            .buttons
                            .iter()
                            .flatten()
                            .any(|b| b.data.is_none() && b.url.is_none()) =>
                    {
                        ValidationResult::error(format!(
                            "node '{}': every inline button needs 'data' or 'url'",
                            node.id
                        ))
                    }
                    Ok(_) => ValidationResult::ok(),
                    Err(e) => ValidationResult::error(format!("node '{}': {}", node.id, e)),
                }
            }
            NodeType::MessageKeyboardReply => Self::check::<ReplyKeyboardConfig>(node),
            NodeType::MessagePhoto | NodeType::MessageVideo | NodeType::MessageDocument => {
                Self::check::<MediaConfig>(node)
            }
            NodeType::MessageEdit => Self::check::<EditConfig>(node),
            NodeType::MessageDelete => Self::check::<DeleteConfig>(node),
            _ => ValidationResult::error(format!(
                "message handler cannot validate type {}",
                node.node_type
            )),
        }
    }

    async fn execute(&self, node: &Node, ctx: &mut StepContext) -> Result<StepOutcome> {
        let chat_id = ctx.execution.chat_id.clone();

        match node.node_type {
            NodeType::Message => {
                let cfg: TextConfig = Self::parse(node)?;
                let text = ctx.render(&cfg.text).await;
                let mut payload = json!({ "chat_id": chat_id, "text": text });
                if let Some(mode) = cfg.parse_mode {
                    payload["parse_mode"] = Value::String(mode);
                }
                self.send(ctx, &node.id, "sendMessage", payload).await?;
                Ok(StepOutcome::Advance)
            }

            NodeType::MessageKeyboardInline => {
                let cfg: InlineKeyboardConfig = Self::parse(node)?;
                let text = ctx.render(&cfg.text).await;

                let mut keyboard = Vec::new();
                for row in &cfg.buttons {
                    let mut out = Vec::new();
                    for button in row {
                        let mut b = json!({ "text": ctx.render(&button.text).await });
                        if let Some(data) = &button.data {
                            b["callback_data"] = Value::String(ctx.render(data).await);
                        } else if let Some(url) = &button.url {
                            b["url"] = Value::String(ctx.render(url).await);
                        }
                        out.push(b);
                    }
                    keyboard.push(Value::Array(out));
                }

                let payload = json!({
                    "chat_id": chat_id,
                    "text": text,
                    "reply_markup": { "inline_keyboard": keyboard },
                });
                self.send(ctx, &node.id, "sendMessage", payload).await?;

                if cfg.wait_for_reply {
                    Ok(StepOutcome::Suspend(WaitState {
                        node_id: node.id.clone(),
                        kind: WaitKind::Callback,
                        payload: Value::Null,
                    }))
                } else {
                    Ok(StepOutcome::Advance)
                }
            }

            NodeType::MessageKeyboardReply => {
                let cfg: ReplyKeyboardConfig = Self::parse(node)?;
                let text = ctx.render(&cfg.text).await;
                let wants_contact = cfg
                    .buttons
                    .iter()
                    .flatten()
                    .any(|b| b.request_contact);

                let mut keyboard = Vec::new();
                for row in &cfg.buttons {
                    let mut out = Vec::new();
                    for button in row {
                        let mut b = json!({ "text": ctx.render(&button.text).await });
                        if button.request_contact {
                            b["request_contact"] = Value::Bool(true);
                        }
                        out.push(b);
                    }
                    keyboard.push(Value::Array(out));
                }

                let payload = json!({
                    "chat_id": chat_id,
                    "text": text,
                    "reply_markup": {
                        "keyboard": keyboard,
                        "one_time_keyboard": cfg.one_time,
                        "resize_keyboard": true,
                    },
                });
                self.send(ctx, &node.id, "sendMessage", payload).await?;

                let kind = if wants_contact {
                    WaitKind::Contact
                } else {
                    WaitKind::Text
                };
                Ok(StepOutcome::Suspend(WaitState {
                    node_id: node.id.clone(),
                    kind,
                    payload: Value::Null,
                }))
            }

            NodeType::MessagePhoto | NodeType::MessageVideo | NodeType::MessageDocument => {
                let cfg: MediaConfig = Self::parse(node)?;
                let (method, field) = Self::media_method(node.node_type);
                let mut payload = json!({ "chat_id": chat_id });
                payload[field] = Value::String(ctx.render(&cfg.file).await);
                if let Some(caption) = cfg.caption {
                    payload["caption"] = Value::String(ctx.render(&caption).await);
                }
                self.send(ctx, &node.id, method, payload).await?;
                Ok(StepOutcome::Advance)
            }

            NodeType::MessageEdit => {
                let cfg: EditConfig = Self::parse(node)?;
                let payload = json!({
                    "chat_id": chat_id,
                    "message_id": ctx.render_json(&cfg.message_id).await,
                    "text": ctx.render(&cfg.text).await,
                });
                self.call(ctx, &node.id, "editMessageText", payload).await?;
                Ok(StepOutcome::Advance)
            }

            NodeType::MessageDelete => {
                let cfg: DeleteConfig = Self::parse(node)?;
                let payload = json!({
                    "chat_id": chat_id,
                    "message_id": ctx.render_json(&cfg.message_id).await,
                });
                self.call(ctx, &node.id, "deleteMessage", payload).await?;
                Ok(StepOutcome::Advance)
            }

            other => Err(EngineError::handler(
                &node.id,
                format!("message handler cannot execute type {}", other),
            )
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(node_type: &str, config: serde_json::Value) -> Node {
        serde_json::from_value(json!({ "id": "m1", "type": node_type, "config": config })).unwrap()
    }

    #[test]
    fn inline_keyboard_needs_data_or_url() {
        let handler = MessageHandler;
        let bad = node(
            "message.keyboard.inline",
            json!({ "text": "pick", "buttons": [[{ "text": "a" }]] }),
        );
        assert!(!handler.validate(&bad).is_valid());

        let good = node(
            "message.keyboard.inline",
            json!({ "text": "pick", "buttons": [[{ "text": "a", "data": "a" }]] }),
        );
        assert!(handler.validate(&good).is_valid());
    }

    #[test]
    fn plain_message_requires_text() {
        let handler = MessageHandler;
        assert!(!handler.validate(&node("message", json!({}))).is_valid());
        assert!(
            handler
                .validate(&node("message", json!({ "text": "hi" })))
                .is_valid()
        );
    }
}

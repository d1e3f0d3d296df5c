use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

/// The closed set of data-layer operations workflows may invoke.
///
/// This enum is a security boundary equivalent to the expression
/// sandbox: queries are named and parameterized here, never assembled
/// from user input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DataOp {
    FindUserByContact { phone: String },
    GetBalance { user_id: String },
    AddBonus { user_id: String, amount: f64 },
    CheckUserLinked { chat_id: String },
    LinkAccount { chat_id: String, user_id: String },
}

impl DataOp {
    /// Build an operation from a configured name plus parameters.
    /// Unknown names and malformed parameters are security errors, not
    /// pass-throughs.
    pub fn from_named(name: &str, params: &Value) -> Result<Self> {
        let mut tagged = params.as_object().cloned().unwrap_or_default();
        tagged.insert("op".to_string(), Value::String(name.to_string()));

        serde_json::from_value(Value::Object(tagged)).map_err(|e| {
            EngineError::Security(format!(
                "data operation '{}' is not in the whitelist or has invalid parameters: {}",
                name, e
            ))
            .into()
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataOp::FindUserByContact { .. } => "find_user_by_contact",
            DataOp::GetBalance { .. } => "get_balance",
            DataOp::AddBonus { .. } => "add_bonus",
            DataOp::CheckUserLinked { .. } => "check_user_linked",
            DataOp::LinkAccount { .. } => "link_account",
        }
    }
}

/// External data-layer collaborator executing whitelisted operations.
#[async_trait]
pub trait DataGateway: Send + Sync {
    async fn execute(&self, op: DataOp) -> Result<Value>;
}

/// Gateway backed by an HTTP data service: every operation is posted as
/// its tagged JSON form to `{base}/query`.
pub struct HttpDataGateway {
    base_url: String,
    client: reqwest::Client,
}

impl HttpDataGateway {
    pub fn new(base_url: impl Into<String>, timeout: std::time::Duration) -> Result<Self> {
        use anyhow::Context as _;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build data gateway HTTP client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl DataGateway for HttpDataGateway {
    async fn execute(&self, op: DataOp) -> Result<Value> {
        use anyhow::Context as _;

        let url = format!("{}/query", self.base_url);
        let name = op.name();

        let response = self
            .client
            .post(&url)
            .json(&op)
            .send()
            .await
            .with_context(|| format!("Data operation '{}' failed to send", name))?;

        if !response.status().is_success() {
            anyhow::bail!(
                "data operation '{}' returned status {}",
                name,
                response.status()
            );
        }

        response
            .json()
            .await
            .with_context(|| format!("Data operation '{}' returned a non-JSON body", name))
    }
}

/// Placeholder gateway for deployments without a data service. Variable
/// and messaging nodes still work; data operations fail the step.
pub struct NullDataGateway;

#[async_trait]
impl DataGateway for NullDataGateway {
    async fn execute(&self, op: DataOp) -> Result<Value> {
        anyhow::bail!("no data gateway configured; cannot run '{}'", op.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn named_op_parses_parameters() {
        let op = DataOp::from_named("get_balance", &json!({ "user_id": "u1" })).unwrap();
        assert_eq!(
            op,
            DataOp::GetBalance {
                user_id: "u1".to_string()
            }
        );
    }

    #[test]
    fn unknown_op_is_rejected() {
        let err = DataOp::from_named("drop_table", &json!({})).unwrap_err();
        let engine_err = err.downcast_ref::<EngineError>().unwrap();
        assert!(matches!(engine_err, EngineError::Security(_)));
    }

    #[test]
    fn missing_parameters_are_rejected() {
        assert!(DataOp::from_named("link_account", &json!({ "chat_id": "c" })).is_err());
    }
}

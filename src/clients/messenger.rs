use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

/// Response envelope of the messaging collaborator. A non-`ok` response
/// is a handler failure.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse {
    pub ok: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub description: Option<String>,
}

/// Outbound messaging collaborator: one generic HTTP call contract
/// (`POST {base}/{method}` with a JSON payload).
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn post(&self, method: &str, payload: Value) -> Result<ApiResponse>;
}

/// HTTP messenger bound to one bot credential endpoint.
pub struct HttpMessenger {
    base_url: String,
    client: reqwest::Client,
}

impl HttpMessenger {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build messaging HTTP client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

/// Messenger for local simulation: prints outbound calls instead of
/// delivering them and reports every call as successful.
pub struct ConsoleMessenger;

#[async_trait]
impl Messenger for ConsoleMessenger {
    async fn post(&self, method: &str, payload: Value) -> Result<ApiResponse> {
        match payload.get("text").and_then(|v| v.as_str()) {
            Some(text) => println!("[{}] {}", method, text),
            None => println!("[{}] {}", method, payload),
        }
        Ok(ApiResponse {
            ok: true,
            data: Value::Null,
            description: None,
        })
    }
}

#[async_trait]
impl Messenger for HttpMessenger {
    async fn post(&self, method: &str, payload: Value) -> Result<ApiResponse> {
        let url = format!("{}/{}", self.base_url, method);

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("Messaging call '{}' failed to send", method))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .with_context(|| format!("Messaging call '{}' returned a non-JSON body", method))?;

        let api: ApiResponse = serde_json::from_value(body.clone()).unwrap_or(ApiResponse {
            ok: status.is_success(),
            data: body,
            description: None,
        });

        Ok(api)
    }
}

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::clients::gateway::{DataGateway, DataOp};
use crate::clients::messenger::{ApiResponse, Messenger};

/// Recording messenger for tests and offline CLI runs. Every payload is
/// captured; responses are `ok` unless `fail_methods` matches.
pub struct MockMessenger {
    pub sent: Mutex<Vec<(String, Value)>>,
    pub fail_methods: Vec<String>,
}

impl Default for MockMessenger {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMessenger {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail_methods: Vec::new(),
        }
    }

    pub fn failing(methods: &[&str]) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail_methods: methods.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn sent_methods(&self) -> Vec<String> {
        self.sent
            .lock()
            .expect("mock messenger lock poisoned")
            .iter()
            .map(|(m, _)| m.clone())
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().expect("mock messenger lock poisoned").len()
    }
}

#[async_trait]
impl Messenger for MockMessenger {
    async fn post(&self, method: &str, payload: Value) -> Result<ApiResponse> {
        self.sent
            .lock()
            .expect("mock messenger lock poisoned")
            .push((method.to_string(), payload));

        if self.fail_methods.iter().any(|m| m == method) {
            return Ok(ApiResponse {
                ok: false,
                data: Value::Null,
                description: Some("mock failure".to_string()),
            });
        }

        Ok(ApiResponse {
            ok: true,
            data: serde_json::json!({ "message_id": self.sent_count() }),
            description: None,
        })
    }
}

/// Canned-response data gateway keyed by operation name.
pub struct MockDataGateway {
    pub responses: Mutex<HashMap<String, Value>>,
    pub calls: Mutex<Vec<DataOp>>,
}

impl Default for MockDataGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDataGateway {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn respond(self, op_name: &str, value: Value) -> Self {
        self.responses
            .lock()
            .expect("mock gateway lock poisoned")
            .insert(op_name.to_string(), value);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("mock gateway lock poisoned").len()
    }
}

#[async_trait]
impl DataGateway for MockDataGateway {
    async fn execute(&self, op: DataOp) -> Result<Value> {
        let name = op.name().to_string();
        self.calls
            .lock()
            .expect("mock gateway lock poisoned")
            .push(op);

        Ok(self
            .responses
            .lock()
            .expect("mock gateway lock poisoned")
            .get(&name)
            .cloned()
            .unwrap_or(Value::Null))
    }
}

pub mod builtin;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

use crate::engine::context::StepContext;
use crate::engine::types::StepOutcome;
use crate::graph::{Node, NodeType};

/// Result of publish-time config validation.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            errors: vec![message.into()],
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Trait every node handler implements.
///
/// `validate` runs at workflow-publish time; invalid configs must never
/// reach `execute`. Handlers signal control flow only through their
/// returned [`StepOutcome`], never by writing execution status.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// Handler family name, for logs and listings.
    fn name(&self) -> &str;

    /// Whether this handler can execute the given node type.
    fn handles(&self, node_type: NodeType) -> bool;

    fn validate(&self, node: &Node) -> ValidationResult;

    async fn execute(&self, node: &Node, ctx: &mut StepContext) -> Result<StepOutcome>;
}

/// Registry of node handlers, built once at startup by asking every
/// handler which types it can execute. Holds no execution state.
pub struct HandlerRegistry {
    handlers: HashMap<NodeType, Arc<dyn NodeHandler>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for every node type it claims. Re-registration
    /// overwrites with a warning (last registration wins), which is what
    /// test and plugin overrides rely on.
    pub fn register(&mut self, handler: Arc<dyn NodeHandler>) {
        for node_type in NodeType::all() {
            if handler.handles(*node_type) {
                if let Some(existing) = self.handlers.get(node_type) {
                    warn!(
                        node_type = %node_type,
                        old = existing.name(),
                        new = handler.name(),
                        "Overwriting handler registration"
                    );
                }
                self.handlers.insert(*node_type, handler.clone());
            }
        }
    }

    pub fn get(&self, node_type: &NodeType) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(node_type).cloned()
    }

    /// Registered (type, handler-family) pairs, sorted by type name.
    pub fn list(&self) -> Vec<(String, String)> {
        let mut entries: Vec<(String, String)> = self
            .handlers
            .iter()
            .map(|(t, h)| (t.to_string(), h.name().to_string()))
            .collect();
        entries.sort();
        entries
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

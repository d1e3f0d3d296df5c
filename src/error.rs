use thiserror::Error;

/// Engine error taxonomy. Most call sites wrap these in `anyhow::Error`
/// with context; the variant decides how a failure is reported.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid workflow or node configuration. Caught at publish time by
    /// `validate()`; reaching execution with one of these is a bug.
    #[error("configuration error: {0}")]
    Config(String),

    /// A handler failed while executing a node.
    #[error("handler error at node '{node}': {message}")]
    Handler { node: String, message: String },

    /// A security boundary was crossed: disallowed expression identifier,
    /// unknown data-gateway operation, unsafe pattern. Always fatal.
    #[error("security violation: {0}")]
    Security(String),

    /// A guard limit was exceeded: step budget, visit ceiling, loop
    /// iteration ceiling, maximum delay. Fatal, surfaces authoring bugs.
    #[error("guard limit exceeded: {0}")]
    Guard(String),

    /// The execution or variable store failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn handler(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            node: node.into(),
            message: message.into(),
        }
    }
}

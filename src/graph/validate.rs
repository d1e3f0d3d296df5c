use crate::graph::WorkflowVersion;
use crate::nodes::HandlerRegistry;

/// Publish-time validation. A version that passes here must never
/// produce a "config missing" error at run time.
pub fn validate_version(version: &WorkflowVersion, registry: &HandlerRegistry) -> Vec<String> {
    let mut errors = Vec::new();

    if version.nodes.is_empty() {
        errors.push("workflow has no nodes".to_string());
    }

    for (key, node) in &version.nodes {
        if key != &node.id {
            errors.push(format!(
                "node map key '{}' does not match node id '{}'",
                key, node.id
            ));
        }

        match registry.get(&node.node_type) {
            Some(handler) => {
                let result = handler.validate(node);
                for e in result.errors {
                    errors.push(format!("node '{}' ({}): {}", node.id, node.node_type, e));
                }
            }
            None => {
                errors.push(format!(
                    "node '{}': no handler registered for type {}",
                    node.id, node.node_type
                ));
            }
        }
    }

    for conn in &version.connections {
        if !version.nodes.contains_key(&conn.source) {
            errors.push(format!(
                "connection '{}' references unknown source node '{}'",
                conn.id, conn.source
            ));
        }
        if !version.nodes.contains_key(&conn.target) {
            errors.push(format!(
                "connection '{}' references unknown target node '{}'",
                conn.id, conn.target
            ));
        }
    }

    if let Some(entry) = &version.entry_node_id
        && !version.nodes.contains_key(entry)
    {
        errors.push(format!("entry node '{}' does not exist", entry));
    }

    errors
}

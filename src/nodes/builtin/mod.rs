pub mod action_node;
pub mod condition_node;
pub mod flow_node;
pub mod integration_node;
pub mod message_node;
pub mod sub_workflow;
pub mod switch_node;
pub mod trigger_node;

use std::sync::Arc;

use crate::graph::repo::WorkflowRepo;
use crate::nodes::HandlerRegistry;

pub use action_node::ActionHandler;
pub use condition_node::ConditionHandler;
pub use flow_node::FlowHandler;
pub use integration_node::IntegrationHandler;
pub use message_node::MessageHandler;
pub use sub_workflow::SubWorkflowHandler;
pub use switch_node::SwitchHandler;
pub use trigger_node::TriggerHandler;

/// Build a registry with every builtin handler registered. The
/// sub-workflow handler is bound back to the finished registry so it can
/// run child graphs through the same handler set.
pub fn build_registry(repo: Arc<WorkflowRepo>) -> Arc<HandlerRegistry> {
    let sub = Arc::new(SubWorkflowHandler::new(repo));

    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(TriggerHandler));
    registry.register(Arc::new(MessageHandler));
    registry.register(Arc::new(ConditionHandler));
    registry.register(Arc::new(SwitchHandler));
    registry.register(Arc::new(FlowHandler));
    registry.register(Arc::new(ActionHandler::new()));
    registry.register(Arc::new(IntegrationHandler::new()));
    registry.register(sub.clone());

    let registry = Arc::new(registry);
    sub.bind(Arc::downgrade(&registry));
    registry
}

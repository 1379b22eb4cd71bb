use shared::{domain::SubmitBehavior, protocol::VisitFailure};
use std::collections::BTreeMap;

use crate::{
    events::{Addon, EventManager},
    node::{split_form_errors, NodeFlag, NodeRef},
};

/// Reflects the submission lifecycle onto the submitting form node.
#[derive(Debug, Clone, Default)]
pub struct NodeBinding {
    error_key: Option<String>,
}

impl NodeBinding {
    pub fn new(error_key: Option<String>) -> Self {
        Self { error_key }
    }
}

impl Addon<NodeRef> for NodeBinding {
    fn register(&self, on: &EventManager<NodeRef>) {
        on.on_start(|_visit, node: &NodeRef| {
            node.set_flag(NodeFlag::Loading, true);
            if node.submit_behavior() != SubmitBehavior::Live {
                node.set_disabled(true);
            }
        });

        let error_key = self.error_key.clone();
        on.on_error(move |failure, node: &NodeRef| match failure {
            VisitFailure::Validation(errors) => {
                let key = error_key.as_deref().unwrap_or(node.name());
                let (local, fields) = split_form_errors(errors, key);
                node.set_errors(local, fields);
            }
            other => node.set_errors(vec![other.to_string()], BTreeMap::new()),
        });

        on.on_finish(|_visit, node: &NodeRef| {
            node.remove_flag(NodeFlag::Loading);
            if node.submit_behavior() != SubmitBehavior::Live {
                node.set_disabled(false);
            }
        });
    }
}

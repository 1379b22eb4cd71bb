//! Display-side sink for a form or one of its inputs.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, PoisonError},
};

use shared::{domain::SubmitBehavior, protocol::FieldErrors};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeFlag {
    Loading,
    Validating,
}

/// Write-only view of a UI node; the core never reads errors or flags back.
pub trait FormNode: Send + Sync {
    fn name(&self) -> &str;

    /// Replaces the node's own messages and the per-field messages below it.
    fn set_errors(&self, local: Vec<String>, fields: BTreeMap<String, String>);

    fn clear_errors(&self) {
        self.set_errors(Vec::new(), BTreeMap::new());
    }

    fn set_flag(&self, flag: NodeFlag, value: bool);

    fn remove_flag(&self, flag: NodeFlag);

    fn set_disabled(&self, disabled: bool);

    fn submit_behavior(&self) -> SubmitBehavior {
        SubmitBehavior::Disabled
    }
}

pub type NodeRef = Arc<dyn FormNode>;

/// Splits server messages into the node's own messages (under `key`) and the remaining
/// fields, first message each.
pub fn split_form_errors(errors: &FieldErrors, key: &str) -> (Vec<String>, BTreeMap<String, String>) {
    let mut rest = errors.clone();
    let local = rest.remove(key).unwrap_or_default();
    (local, rest.first_messages())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub errors: Vec<String>,
    pub field_errors: BTreeMap<String, String>,
    pub flags: BTreeSet<NodeFlag>,
    pub disabled: bool,
}

/// In-memory [`FormNode`] for headless use.
#[derive(Debug)]
pub struct MemoryNode {
    name: String,
    behavior: SubmitBehavior,
    state: Mutex<NodeSnapshot>,
}

impl MemoryNode {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_behavior(name, SubmitBehavior::Disabled)
    }

    pub fn with_behavior(name: impl Into<String>, behavior: SubmitBehavior) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            behavior,
            state: Mutex::new(NodeSnapshot::default()),
        })
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update(&self, f: impl FnOnce(&mut NodeSnapshot)) {
        f(&mut self.state.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

impl FormNode for MemoryNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_errors(&self, local: Vec<String>, fields: BTreeMap<String, String>) {
        self.update(|state| {
            state.errors = local;
            state.field_errors = fields;
        });
    }

    fn set_flag(&self, flag: NodeFlag, value: bool) {
        self.update(|state| {
            if value {
                state.flags.insert(flag);
            } else {
                state.flags.remove(&flag);
            }
        });
    }

    fn remove_flag(&self, flag: NodeFlag) {
        self.update(|state| {
            state.flags.remove(&flag);
        });
    }

    fn set_disabled(&self, disabled: bool) {
        self.update(|state| state.disabled = disabled);
    }

    fn submit_behavior(&self) -> SubmitBehavior {
        self.behavior
    }
}

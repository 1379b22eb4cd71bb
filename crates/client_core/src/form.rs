use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use shared::{
    domain::{InputKind, Method},
    protocol::{FieldValue, Payload, Visit},
};
use tokio::sync::{broadcast, watch};
use tracing::debug;
use url::Url;

use crate::{
    addons::{FormState, NodeBinding, StateAddon},
    cancel::CancellationController,
    config::ClientConfig,
    dispatch::{Dispatcher, ManagedHooks, VisitOutcome},
    events::{Addon, EventError, EventManager, Handler},
    node::NodeRef,
    precognition::{
        parse_precognitive_flag, PrecognitionError, ValidationDebouncer, ValidationEvent,
    },
    transport::PrecognitionTransport,
};

/// Submits a form node's values and runs the shared lifecycle handlers.
pub struct Form {
    node: NodeRef,
    events: Arc<EventManager<NodeRef>>,
    dispatcher: Arc<dyn Dispatcher>,
    cancellation: CancellationController,
    state: StateAddon,
    values: Mutex<Payload>,
}

impl Form {
    pub fn new(node: NodeRef, dispatcher: Arc<dyn Dispatcher>, config: &ClientConfig) -> Self {
        let events: Arc<EventManager<NodeRef>> = Arc::new(EventManager::new());
        let cancellation = CancellationController::new();
        let state = StateAddon::new(config.recently_successful());
        let binding = NodeBinding::new(config.form_error_key.clone());
        events.combine_all(&[&cancellation, &state, &binding]);

        Self {
            node,
            events,
            dispatcher,
            cancellation,
            state,
            values: Mutex::new(Payload::new()),
        }
    }

    pub fn with_initial_fields(self, fields: Payload) -> Self {
        *self.values.lock().unwrap_or_else(PoisonError::into_inner) = fields;
        self
    }

    pub fn node(&self) -> &NodeRef {
        &self.node
    }

    pub fn on(&self, handler: Handler<NodeRef>) {
        self.events.on(handler);
    }

    pub fn combine<A: Addon<NodeRef>>(&self, addon: A) {
        self.events.combine(addon);
    }

    pub fn events(&self) -> &EventManager<NodeRef> {
        &self.events
    }

    pub fn state(&self) -> watch::Receiver<FormState> {
        self.state.subscribe()
    }

    pub fn current_state(&self) -> FormState {
        self.state.current()
    }

    pub fn mirror_node_state(&self, dirty: Option<bool>, valid: Option<bool>, errors: Option<bool>) {
        self.state.mirror(dirty, valid, errors);
    }

    pub fn set_value(&self, field: impl Into<String>, value: impl Into<FieldValue>) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(field, value);
    }

    pub fn values(&self) -> Payload {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Cancels the in-flight submission, if any.
    pub fn cancel(&self) -> bool {
        self.cancellation.cancel()
    }

    pub async fn submit(
        &self,
        method: Method,
        url: Url,
        data: Payload,
    ) -> Result<VisitOutcome, EventError> {
        let visit = Visit::new(method, url, data);
        debug!(submission = %visit.id, form = self.node.name(), "submitting form");
        let hooks = ManagedHooks::new(Arc::clone(&self.events), Arc::clone(&self.node));
        self.dispatcher.dispatch(visit, &hooks).await
    }

    pub async fn get(&self, url: Url, data: Payload) -> Result<VisitOutcome, EventError> {
        self.submit(Method::Get, url, data).await
    }

    pub async fn post(&self, url: Url, data: Payload) -> Result<VisitOutcome, EventError> {
        self.submit(Method::Post, url, data).await
    }

    pub async fn put(&self, url: Url, data: Payload) -> Result<VisitOutcome, EventError> {
        self.submit(Method::Put, url, data).await
    }

    pub async fn patch(&self, url: Url, data: Payload) -> Result<VisitOutcome, EventError> {
        self.submit(Method::Patch, url, data).await
    }

    pub async fn delete(&self, url: Url, data: Payload) -> Result<VisitOutcome, EventError> {
        self.submit(Method::Delete, url, data).await
    }
}

/// A [`Form`] bound to one endpoint whose inputs may validate against it before submission.
pub struct PrecognitiveForm {
    method: Method,
    url: Url,
    form: Form,
    debouncer: Arc<ValidationDebouncer>,
}

impl PrecognitiveForm {
    pub fn new(
        method: Method,
        url: Url,
        node: NodeRef,
        dispatcher: Arc<dyn Dispatcher>,
        transport: Arc<dyn PrecognitionTransport>,
        config: ClientConfig,
    ) -> Self {
        let form = Form::new(node, dispatcher, &config);
        let debouncer = ValidationDebouncer::new(method, url.clone(), config, transport);
        Self {
            method,
            url,
            form,
            debouncer,
        }
    }

    pub fn form(&self) -> &Form {
        &self.form
    }

    pub fn debouncer(&self) -> &Arc<ValidationDebouncer> {
        &self.debouncer
    }

    pub fn validations(&self) -> broadcast::Receiver<ValidationEvent> {
        self.debouncer.subscribe()
    }

    /// Registers an input when its `precognitive` attribute enables it; returns whether it did.
    pub fn register_input(&self, node: NodeRef, kind: InputKind, precognitive: Option<&str>) -> bool {
        if !parse_precognitive_flag(precognitive) {
            return false;
        }
        let field = node.name().to_string();
        self.debouncer.register_input(field, kind, node);
        true
    }

    /// Records a committed value and schedules validation with the whole form value.
    pub fn commit(&self, field: &str, value: Value) -> Result<(), PrecognitionError> {
        self.form.set_value(field, value);
        self.debouncer.commit(field, self.form.values())
    }

    pub async fn submit(&self) -> Result<VisitOutcome, EventError> {
        self.form
            .submit(self.method, self.url.clone(), self.form.values())
            .await
    }

    pub fn cancel(&self) -> bool {
        self.form.cancel()
    }
}

#[cfg(test)]
#[path = "tests/form_tests.rs"]
mod tests;

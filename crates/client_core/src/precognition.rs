//! Debounced single-field validation against a Precognition-aware server.
//!
//! Each registered field moves through `Idle → Scheduled → InFlight → Idle`. A commit
//! (re)starts the field's debounce timer; when it fires, exactly one validation request is
//! sent with the field named in `Precognition-Validate-Only`. The response must echo
//! `precognition: true`, otherwise the server is not honoring the dry-run contract and the
//! request fails with [`PrecognitionError::MissingConfirmation`].
//!
//! Older in-flight requests are never cancelled. Every request carries a per-field
//! sequence number. By default every response is applied as it arrives, so a slow response
//! for an older request can overwrite a newer result. With `fence_stale_responses` enabled,
//! such a response is reported as [`ValidationOutcome::Superseded`] without touching errors.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use shared::{
    domain::{InputKind, Method, RequestId},
    error::FieldErrorsDecodeError,
    protocol::{
        FieldErrors, Payload, PayloadEncoding, PrecognitionRequest, PrecognitionResponse,
        UNPROCESSABLE_ENTITY,
    },
};
use thiserror::Error;
use tokio::{runtime::Handle, sync::broadcast, task::JoinHandle};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    config::ClientConfig,
    node::{split_form_errors, NodeFlag, NodeRef},
    transport::PrecognitionTransport,
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PrecognitionError {
    #[error("did not receive a Precognition response for field '{field}' (status {status}); ensure the Precognition middleware is in place for the route")]
    MissingConfirmation { field: String, status: u16 },
    #[error("field '{0}' is not registered for precognitive validation")]
    UnknownField(String),
    #[error("validation request for field '{field}' failed: {message}")]
    Transport { field: String, message: String },
    #[error("cannot schedule validation for field '{0}' outside an async runtime")]
    NoRuntime(String),
    #[error("invalid validation errors for field '{field}': {source}")]
    InvalidErrors {
        field: String,
        #[source]
        source: FieldErrorsDecodeError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// Any non-422 confirmed response; no errors applied.
    Passed { status: u16 },
    /// 422 response; errors were applied to the field.
    Failed(FieldErrors),
    /// A newer request for the same field was issued; the response was discarded.
    Superseded { latest: RequestId },
}

/// Published after every validation request settles.
#[derive(Debug, Clone)]
pub struct ValidationEvent {
    pub field: String,
    pub request_id: RequestId,
    pub result: Result<ValidationOutcome, PrecognitionError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPhase {
    Idle,
    Scheduled,
    InFlight,
}

/// Per-field debounce and request bookkeeping.
#[derive(Debug, Default)]
struct ValidationState {
    timer: Option<JoinHandle<()>>,
    /// Bumped on every commit; a timer only fires if its generation is still current.
    generation: u64,
    active_request_id: Option<RequestId>,
    latest_request_id: RequestId,
}

struct RegisteredInput {
    kind: InputKind,
    node: NodeRef,
}

#[derive(Default)]
struct DebouncerState {
    inputs: HashMap<String, RegisteredInput>,
    fields: HashMap<String, ValidationState>,
}

pub struct ValidationDebouncer {
    method: Method,
    url: Url,
    config: ClientConfig,
    transport: Arc<dyn PrecognitionTransport>,
    state: Mutex<DebouncerState>,
    events: broadcast::Sender<ValidationEvent>,
    /// Runtime current at construction; commits from non-runtime threads spawn onto it.
    runtime: Option<Handle>,
}

impl ValidationDebouncer {
    pub fn new(
        method: Method,
        url: Url,
        config: ClientConfig,
        transport: Arc<dyn PrecognitionTransport>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            method,
            url,
            config,
            transport,
            state: Mutex::new(DebouncerState::default()),
            events,
            runtime: Handle::try_current().ok(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ValidationEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DebouncerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers an input; file inputs switch every later request to multipart.
    pub fn register_input(&self, field: impl Into<String>, kind: InputKind, node: NodeRef) {
        let field = field.into();
        debug!(field = %field, ?kind, "registered precognitive input");
        self.lock()
            .inputs
            .insert(field, RegisteredInput { kind, node });
    }

    /// Drops a field's state and any pending timer.
    pub fn unregister_input(&self, field: &str) {
        let mut state = self.lock();
        state.inputs.remove(field);
        if let Some(timer) = state.fields.remove(field).and_then(|s| s.timer) {
            timer.abort();
        }
    }

    pub fn encoding(&self) -> PayloadEncoding {
        if self.lock().inputs.values().any(|input| input.kind.is_file()) {
            PayloadEncoding::Multipart
        } else {
            PayloadEncoding::Json
        }
    }

    pub fn phase(&self, field: &str) -> FieldPhase {
        let state = self.lock();
        match state.fields.get(field) {
            Some(field) if field.timer.is_some() => FieldPhase::Scheduled,
            Some(field) if field.active_request_id.is_some() => FieldPhase::InFlight,
            _ => FieldPhase::Idle,
        }
    }

    pub fn latest_request_id(&self, field: &str) -> Option<RequestId> {
        self.lock().fields.get(field).map(|s| s.latest_request_id)
    }

    fn runtime(&self) -> Option<Handle> {
        Handle::try_current().ok().or_else(|| self.runtime.clone())
    }

    /// Restarts the field's debounce timer with `payload` as the request body.
    pub fn commit(self: &Arc<Self>, field: &str, payload: Payload) -> Result<(), PrecognitionError> {
        let mut state = self.lock();
        if !state.inputs.contains_key(field) {
            return Err(PrecognitionError::UnknownField(field.to_string()));
        }
        let Some(runtime) = self.runtime() else {
            warn!(field, "no async runtime available; validation not scheduled");
            return Err(PrecognitionError::NoRuntime(field.to_string()));
        };

        let entry = state.fields.entry(field.to_string()).or_default();
        if let Some(previous) = entry.timer.take() {
            previous.abort();
        }
        entry.generation += 1;

        let generation = entry.generation;
        let delay = self.config.debounce();
        let debouncer = Arc::clone(self);
        let field_name = field.to_string();
        entry.timer = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            debouncer.fire(field_name, generation, payload);
        }));
        debug!(field, ?delay, "validation scheduled");
        Ok(())
    }

    /// Moves a scheduled field to in-flight; the request runs on its own task so a later
    /// commit cannot abort it.
    fn fire(self: &Arc<Self>, field: String, generation: u64, payload: Payload) {
        let request_id = {
            let mut state = self.lock();
            let Some(entry) = state.fields.get_mut(&field) else {
                return;
            };
            if entry.generation != generation {
                return;
            }
            entry.timer = None;
            entry.latest_request_id = entry.latest_request_id.next();
            entry.active_request_id = Some(entry.latest_request_id);
            entry.latest_request_id
        };

        let debouncer = Arc::clone(self);
        tokio::spawn(async move {
            let result = debouncer.run(&field, request_id, payload).await;
            let _ = debouncer.events.send(ValidationEvent {
                field,
                request_id,
                result,
            });
        });
    }

    /// Sends a validation request immediately, bypassing the debounce timer.
    pub async fn validate_now(
        &self,
        field: &str,
        payload: Payload,
    ) -> Result<ValidationOutcome, PrecognitionError> {
        let request_id = {
            let mut state = self.lock();
            if !state.inputs.contains_key(field) {
                return Err(PrecognitionError::UnknownField(field.to_string()));
            }
            let entry = state.fields.entry(field.to_string()).or_default();
            entry.latest_request_id = entry.latest_request_id.next();
            entry.active_request_id = Some(entry.latest_request_id);
            entry.latest_request_id
        };
        self.run(field, request_id, payload).await
    }

    async fn run(
        &self,
        field: &str,
        request_id: RequestId,
        payload: Payload,
    ) -> Result<ValidationOutcome, PrecognitionError> {
        let node = {
            let state = self.lock();
            match state.inputs.get(field) {
                Some(input) => input.node.clone(),
                None => return Err(PrecognitionError::UnknownField(field.to_string())),
            }
        };

        node.clear_errors();
        node.set_flag(NodeFlag::Validating, true);
        node.set_flag(NodeFlag::Loading, true);

        let request = PrecognitionRequest {
            method: self.method,
            url: self.url.clone(),
            field: field.to_string(),
            payload,
            encoding: self.encoding(),
            timeout: self.config.timeout(),
        };
        info!(field, request_id = %request_id, encoding = ?request.encoding, "sending validation request");
        let response = self.transport.send(request).await;

        node.remove_flag(NodeFlag::Validating);
        node.remove_flag(NodeFlag::Loading);

        let result = match response {
            Ok(response) => self.interpret(field, request_id, &node, response),
            Err(error) => {
                warn!(field, request_id = %request_id, %error, "validation request failed");
                Err(PrecognitionError::Transport {
                    field: field.to_string(),
                    message: error.to_string(),
                })
            }
        };
        self.settle(field, request_id);
        result
    }

    fn interpret(
        &self,
        field: &str,
        request_id: RequestId,
        node: &NodeRef,
        response: PrecognitionResponse,
    ) -> Result<ValidationOutcome, PrecognitionError> {
        if !response.confirmed {
            error!(
                field,
                status = response.status,
                "did not receive a Precognition response; ensure the Precognition middleware is in place for the route"
            );
            return Err(PrecognitionError::MissingConfirmation {
                field: field.to_string(),
                status: response.status,
            });
        }

        if self.config.fence_stale_responses {
            let latest = self.latest_request_id(field).unwrap_or(request_id);
            if latest != request_id {
                debug!(field, request_id = %request_id, latest = %latest, "discarding stale validation response");
                return Ok(ValidationOutcome::Superseded { latest });
            }
        }

        if response.status != UNPROCESSABLE_ENTITY {
            return Ok(ValidationOutcome::Passed {
                status: response.status,
            });
        }

        let errors = FieldErrors::decode(&response.body).map_err(|source| {
            PrecognitionError::InvalidErrors {
                field: field.to_string(),
                source,
            }
        })?;
        let (mut local, fields) = split_form_errors(&errors, self.config.error_key(field));
        local.truncate(1);
        node.set_errors(local, fields);
        Ok(ValidationOutcome::Failed(errors))
    }

    fn settle(&self, field: &str, request_id: RequestId) {
        let mut state = self.lock();
        if let Some(entry) = state.fields.get_mut(field) {
            if entry.active_request_id == Some(request_id) {
                entry.active_request_id = None;
            }
        }
    }
}

/// An input is precognitive when the attribute is present and not `"false"`.
pub fn parse_precognitive_flag(attribute: Option<&str>) -> bool {
    match attribute {
        None => false,
        Some(value) => !value.trim().eq_ignore_ascii_case("false"),
    }
}

#[cfg(test)]
#[path = "tests/precognition_tests.rs"]
mod tests;

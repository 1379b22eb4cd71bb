//! Form submission lifecycle and precognitive field validation.
//!
//! [`events::EventManager`] holds the lifecycle handlers that addons attach to,
//! [`dispatch::Dispatcher`] drives one submission through them, and
//! [`precognition::ValidationDebouncer`] validates single fields ahead of submission.

pub mod addons;
pub mod cancel;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod form;
pub mod node;
pub mod precognition;
pub mod transport;

pub use addons::{FormState, NodeBinding, StateAddon};
pub use cancel::{CancelToken, CancellationController};
pub use config::ClientConfig;
pub use dispatch::{Dispatcher, ManagedHooks, VisitHooks, VisitOutcome};
pub use events::{
    Addon, Effect, Event, EventError, EventManager, Execution, Handler, Settlement,
};
pub use form::{Form, PrecognitiveForm};
pub use node::{FormNode, MemoryNode, NodeFlag, NodeRef, NodeSnapshot};
pub use precognition::{
    parse_precognitive_flag, FieldPhase, PrecognitionError, ValidationDebouncer,
    ValidationEvent, ValidationOutcome,
};
pub use transport::{HttpTransport, PrecognitionTransport, TransportError};

//! Stock handler bundles for the submission lifecycle.

mod node;
mod state;

pub use node::NodeBinding;
pub use state::{FormState, StateAddon};

#[cfg(test)]
#[path = "../tests/addons_tests.rs"]
mod tests;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_DEBOUNCE_MS: u64 = 2_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_RECENTLY_SUCCESSFUL_MS: u64 = 2_000;

/// Timing and behavior knobs injected into forms, the debouncer and the HTTP transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub debounce_ms: u64,
    pub timeout_ms: u64,
    pub recently_successful_ms: u64,
    /// Discard validation responses that are not for the field's latest request. Off by
    /// default: a late response for an older request is still applied.
    pub fence_stale_responses: bool,
    /// Error key holding form-level messages; defaults to the node's own name.
    pub form_error_key: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            recently_successful_ms: DEFAULT_RECENTLY_SUCCESSFUL_MS,
            fence_stale_responses: false,
            form_error_key: None,
        }
    }
}

impl ClientConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn recently_successful(&self) -> Duration {
        Duration::from_millis(self.recently_successful_ms)
    }

    pub fn error_key<'a>(&'a self, node_name: &'a str) -> &'a str {
        self.form_error_key.as_deref().unwrap_or(node_name)
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce_ms = u64::try_from(debounce.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;

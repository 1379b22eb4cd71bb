use std::{fs, path::Path};

use client_core::ClientConfig;
use tracing::warn;

pub const CONFIG_FILE: &str = "formctl.toml";

/// Reads `path` (if present), then layers `FORMCTL_*` and `APP__*` variables on top.
pub fn load_settings(path: &Path) -> ClientConfig {
    load_settings_with(path, |key| std::env::var(key).ok())
}

pub fn load_settings_with(path: &Path, env: impl Fn(&str) -> Option<String>) -> ClientConfig {
    let mut settings = ClientConfig::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<ClientConfig>(&raw) {
            Ok(file_cfg) => settings = file_cfg,
            Err(error) => warn!(path = %path.display(), %error, "ignoring malformed config file"),
        }
    }

    for key in ["FORMCTL_DEBOUNCE_MS", "APP__DEBOUNCE_MS"] {
        if let Some(v) = env(key).and_then(|v| parse_millis(key, &v)) {
            settings.debounce_ms = v;
        }
    }

    for key in ["FORMCTL_TIMEOUT_MS", "APP__TIMEOUT_MS"] {
        if let Some(v) = env(key).and_then(|v| parse_millis(key, &v)) {
            settings.timeout_ms = v;
        }
    }

    for key in ["FORMCTL_RECENTLY_SUCCESSFUL_MS", "APP__RECENTLY_SUCCESSFUL_MS"] {
        if let Some(v) = env(key).and_then(|v| parse_millis(key, &v)) {
            settings.recently_successful_ms = v;
        }
    }

    for key in ["FORMCTL_FENCE_STALE_RESPONSES", "APP__FENCE_STALE_RESPONSES"] {
        if let Some(v) = env(key) {
            match v.trim().parse::<bool>() {
                Ok(parsed) => settings.fence_stale_responses = parsed,
                Err(_) => warn!(key, value = %v, "expected true or false"),
            }
        }
    }

    for key in ["FORMCTL_FORM_ERROR_KEY", "APP__FORM_ERROR_KEY"] {
        if let Some(v) = env(key) {
            settings.form_error_key = Some(v).filter(|v| !v.trim().is_empty());
        }
    }

    settings
}

fn parse_millis(key: &str, raw: &str) -> Option<u64> {
    match raw.trim().parse::<u64>() {
        Ok(parsed) => Some(parsed),
        Err(error) => {
            warn!(key, value = raw, %error, "ignoring non-numeric duration");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use client_core::ClientConfig;
use serde_json::Value;
use shared::domain::Method;
use url::Url;

use crate::config::CONFIG_FILE;

#[derive(Parser, Debug)]
#[command(name = "formctl", about = "Submit forms and run precognitive validation")]
pub struct Cli {
    #[arg(long, default_value = CONFIG_FILE)]
    pub config: PathBuf,
    #[arg(long)]
    pub debounce_ms: Option<u64>,
    #[arg(long)]
    pub timeout_ms: Option<u64>,
    /// Error key that holds form-level messages.
    #[arg(long)]
    pub error_key: Option<String>,
    /// Discard validation responses superseded by a newer request.
    #[arg(long)]
    pub fence: bool,
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Flags take precedence over file and environment settings.
    pub fn apply_overrides(&self, config: &mut ClientConfig) {
        if let Some(v) = self.debounce_ms {
            config.debounce_ms = v;
        }
        if let Some(v) = self.timeout_ms {
            config.timeout_ms = v;
        }
        if let Some(v) = &self.error_key {
            config.form_error_key = Some(v.clone());
        }
        if self.fence {
            config.fence_stale_responses = true;
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Submit the form and print every lifecycle event.
    Submit(FormArgs),
    /// Validate a single field with a Precognition request.
    Validate {
        #[command(flatten)]
        form: FormArgs,
        /// Field named in `Precognition-Validate-Only`.
        #[arg(long)]
        only: String,
    },
}

#[derive(Args, Debug)]
pub struct FormArgs {
    pub url: Url,
    #[arg(long, default_value = "post")]
    pub method: Method,
    /// Name of the submitting form node.
    #[arg(long, default_value = "form")]
    pub name: String,
    /// `name=value`; the value is parsed as JSON and falls back to a string.
    #[arg(long = "field", value_parser = parse_field)]
    pub fields: Vec<(String, Value)>,
    /// `name=path` of a file to upload.
    #[arg(long = "file", value_parser = parse_file)]
    pub files: Vec<(String, PathBuf)>,
}

pub fn parse_field(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = split_pair(raw)?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

pub fn parse_file(raw: &str) -> Result<(String, PathBuf), String> {
    let (name, path) = split_pair(raw)?;
    if path.is_empty() {
        return Err(format!("missing file path in '{raw}'"));
    }
    Ok((name.to_string(), PathBuf::from(path)))
}

fn split_pair(raw: &str) -> Result<(&str, &str), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing field name in '{raw}'"));
    }
    Ok((name, value))
}

#[cfg(test)]
#[path = "tests/cli_tests.rs"]
mod tests;

use std::{collections::BTreeMap, fmt, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::{
    domain::{Method, SubmissionId},
    error::FieldErrorsDecodeError,
};

/// Request header marking a dry-run request.
pub const PRECOGNITION_HEADER: &str = "Precognition";
/// Request header naming the single field the server should validate.
pub const PRECOGNITION_VALIDATE_ONLY_HEADER: &str = "Precognition-Validate-Only";
/// Response header a compliant server echoes back.
pub const PRECOGNITION_CONFIRMATION_HEADER: &str = "precognition";
pub const PRECOGNITION_CONFIRMATION_VALUE: &str = "true";
pub const UNPROCESSABLE_ENTITY: u16 = 422;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventName {
    Before,
    Start,
    Progress,
    Success,
    Error,
    CancelToken,
    Finish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    /// Handlers may abort the attempt by returning a decision.
    Veto,
    /// Handlers produce effects settled one after another.
    Settled,
    SideEffect,
}

impl EventName {
    pub const ALL: [EventName; 7] = [
        EventName::Before,
        EventName::Start,
        EventName::Progress,
        EventName::Success,
        EventName::Error,
        EventName::CancelToken,
        EventName::Finish,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventName::Before => "before",
            EventName::Start => "start",
            EventName::Progress => "progress",
            EventName::Success => "success",
            EventName::Error => "error",
            EventName::CancelToken => "cancelToken",
            EventName::Finish => "finish",
        }
    }

    /// Name of the dispatcher callback that carries this event.
    pub fn callback_name(self) -> &'static str {
        match self {
            EventName::Before => "onBefore",
            EventName::Start => "onStart",
            EventName::Progress => "onProgress",
            EventName::Success => "onSuccess",
            EventName::Error => "onError",
            EventName::CancelToken => "onCancelToken",
            EventName::Finish => "onFinish",
        }
    }

    pub fn class(self) -> EventClass {
        match self {
            EventName::Before => EventClass::Veto,
            EventName::Success | EventName::Finish => EventClass::Settled,
            EventName::Start | EventName::Progress | EventName::Error | EventName::CancelToken => {
                EventClass::SideEffect
            }
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Json(Value),
    File(FileUpload),
}

impl FieldValue {
    fn as_json(&self) -> Value {
        match self {
            FieldValue::Json(value) => value.clone(),
            FieldValue::File(file) => Value::String(file.file_name.clone()),
        }
    }
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        FieldValue::Json(value)
    }
}

/// Field values submitted with a visit or validation request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload(BTreeMap<String, FieldValue>);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        let mut payload = Self::new();
        payload.insert(field, value);
        payload
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<FieldValue>) {
        self.0.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.0.get(field)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }

    pub fn has_files(&self) -> bool {
        self.0.values().any(|v| matches!(v, FieldValue::File(_)))
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.as_json()))
                .collect::<Map<String, Value>>(),
        )
    }

    /// Flattens values into `key=value` pairs; strings are kept raw, the rest JSON-encoded.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.0
            .iter()
            .map(|(k, v)| (k.clone(), scalar_text(&v.as_json())))
            .collect()
    }
}

pub fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadEncoding {
    Json,
    Multipart,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Visit {
    pub id: SubmissionId,
    pub method: Method,
    pub url: Url,
    pub payload: Payload,
}

impl Visit {
    pub fn new(method: Method, url: Url, payload: Payload) -> Self {
        Self {
            id: SubmissionId::new(),
            method,
            url,
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub loaded: u64,
    pub total: Option<u64>,
}

impl Progress {
    pub fn percentage(&self) -> Option<u8> {
        let total = self.total.filter(|t| *t > 0)?;
        let pct = (self.loaded.min(total) * 100) / total;
        Some(pct as u8)
    }
}

/// A successful (2xx) submission response.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub status: u16,
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VisitFailure {
    /// 422 response carrying per-field messages.
    Validation(FieldErrors),
    /// Any other non-2xx response.
    Status { status: u16, body: Value },
    /// Network failure, timeout or a cancelled call.
    Transport(String),
}

impl VisitFailure {
    pub fn field_errors(&self) -> Option<&FieldErrors> {
        match self {
            VisitFailure::Validation(errors) => Some(errors),
            _ => None,
        }
    }
}

impl fmt::Display for VisitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VisitFailure::Validation(errors) => {
                write!(f, "validation failed for {} field(s)", errors.len())
            }
            VisitFailure::Status { status, .. } => write!(f, "server responded with {status}"),
            VisitFailure::Transport(message) => write!(f, "transport failure: {message}"),
        }
    }
}

/// Server validation messages keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldErrors(BTreeMap<String, Vec<String>>);

impl FieldErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes `{field: "message" | ["message", ...]}`.
    pub fn decode(body: &Value) -> Result<Self, FieldErrorsDecodeError> {
        let object = match body {
            Value::Object(object) => object,
            Value::Null => return Err(FieldErrorsDecodeError::NotAnObject("null")),
            Value::Bool(_) => return Err(FieldErrorsDecodeError::NotAnObject("boolean")),
            Value::Number(_) => return Err(FieldErrorsDecodeError::NotAnObject("number")),
            Value::String(_) => return Err(FieldErrorsDecodeError::NotAnObject("string")),
            Value::Array(_) => return Err(FieldErrorsDecodeError::NotAnObject("array")),
        };

        let mut errors = BTreeMap::new();
        for (field, value) in object {
            let messages = match value {
                Value::String(message) => vec![message.clone()],
                Value::Array(items) => items
                    .iter()
                    .map(|item| match item {
                        Value::String(message) => Ok(message.clone()),
                        _ => Err(FieldErrorsDecodeError::InvalidMessages {
                            field: field.clone(),
                        }),
                    })
                    .collect::<Result<Vec<_>, _>>()?,
                _ => {
                    return Err(FieldErrorsDecodeError::InvalidMessages {
                        field: field.clone(),
                    })
                }
            };
            errors.insert(field.clone(), messages);
        }
        Ok(Self(errors))
    }

    pub fn insert(&mut self, field: impl Into<String>, messages: Vec<String>) {
        self.0.insert(field.into(), messages);
    }

    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.0.get(field).map(Vec::as_slice)
    }

    pub fn remove(&mut self, field: &str) -> Option<Vec<String>> {
        self.0.remove(field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }

    /// First message per field; fields with no messages are dropped.
    pub fn first_messages(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .filter_map(|(field, messages)| {
                messages.first().map(|message| (field.clone(), message.clone()))
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrecognitionRequest {
    pub method: Method,
    pub url: Url,
    pub field: String,
    pub payload: Payload,
    pub encoding: PayloadEncoding,
    pub timeout: Duration,
}

impl PrecognitionRequest {
    pub fn headers(&self) -> [(&'static str, String); 2] {
        [
            (PRECOGNITION_HEADER, "true".to_string()),
            (PRECOGNITION_VALIDATE_ONLY_HEADER, self.field.clone()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrecognitionResponse {
    pub status: u16,
    /// Whether the response echoed `precognition: true`.
    pub confirmed: bool,
    pub body: Value,
}

impl PrecognitionResponse {
    pub fn is_confirmation(header_value: Option<&str>) -> bool {
        header_value.map(str::trim) == Some(PRECOGNITION_CONFIRMATION_VALUE)
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;

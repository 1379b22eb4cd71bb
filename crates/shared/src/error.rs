use thiserror::Error;

/// Raised when a 422 body does not follow the `{field: message | [messages]}` shape.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FieldErrorsDecodeError {
    #[error("validation error body must be a JSON object, got {0}")]
    NotAnObject(&'static str),
    #[error("validation messages for field '{field}' must be a string or a list of strings")]
    InvalidMessages { field: String },
}

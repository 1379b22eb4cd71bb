//! HTTP transport backed by `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{
    multipart::{Form as MultipartForm, Part},
    Client, RequestBuilder, StatusCode,
};
use serde_json::Value;
use shared::{
    domain::Method,
    protocol::{
        scalar_text, FieldErrors, FieldValue, Page, Payload, PayloadEncoding,
        PrecognitionRequest, PrecognitionResponse, Progress, Visit, VisitFailure,
        PRECOGNITION_CONFIRMATION_HEADER, UNPROCESSABLE_ENTITY,
    },
};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::{
    cancel::CancelToken,
    config::ClientConfig,
    dispatch::{Dispatcher, VisitHooks},
    events::EventError,
};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Request(error.to_string())
        }
    }
}

/// Sends a single-field validation request.
#[async_trait]
pub trait PrecognitionTransport: Send + Sync {
    async fn send(
        &self,
        request: PrecognitionRequest,
    ) -> Result<PrecognitionResponse, TransportError>;
}

#[derive(Clone)]
pub struct HttpTransport {
    http: Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Self {
        Self::with_client(Client::new(), config)
    }

    pub fn with_client(http: Client, config: &ClientConfig) -> Self {
        Self {
            http,
            timeout: config.timeout(),
        }
    }

    fn request(
        &self,
        method: Method,
        url: &Url,
        payload: &Payload,
        encoding: PayloadEncoding,
    ) -> Result<RequestBuilder, TransportError> {
        let builder = self.http.request(to_reqwest_method(method), url.clone());
        if method.uses_query_payload() {
            return Ok(builder.query(&payload.query_pairs()));
        }
        match encoding {
            PayloadEncoding::Json => Ok(builder.json(&payload.to_json())),
            PayloadEncoding::Multipart => Ok(builder.multipart(multipart_form(payload)?)),
        }
    }

    async fn send_visit(
        &self,
        visit: &Visit,
        hooks: &dyn VisitHooks,
    ) -> Result<Result<Page, VisitFailure>, EventError> {
        let encoding = if visit.payload.has_files() {
            PayloadEncoding::Multipart
        } else {
            PayloadEncoding::Json
        };
        let request = match self.request(visit.method, &visit.url, &visit.payload, encoding) {
            Ok(request) => request.timeout(self.timeout),
            Err(error) => return Ok(Err(VisitFailure::Transport(error.to_string()))),
        };

        let response = match request.send().await {
            Ok(response) => response,
            Err(error) => {
                return Ok(Err(VisitFailure::Transport(
                    TransportError::from(error).to_string(),
                )))
            }
        };

        let status = response.status();
        let total = response.content_length();
        let mut stream = response.bytes_stream();
        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => {
                    body.extend_from_slice(&chunk);
                    hooks.on_progress(Some(&Progress {
                        loaded: body.len() as u64,
                        total,
                    }))?;
                }
                Err(error) => {
                    return Ok(Err(VisitFailure::Transport(
                        TransportError::from(error).to_string(),
                    )))
                }
            }
        }

        Ok(classify(status, decode_body(&body)))
    }
}

fn classify(status: StatusCode, body: Value) -> Result<Page, VisitFailure> {
    if status.is_success() {
        return Ok(Page {
            status: status.as_u16(),
            body,
        });
    }
    if status.as_u16() == UNPROCESSABLE_ENTITY {
        match FieldErrors::decode(&body) {
            Ok(errors) => return Err(VisitFailure::Validation(errors)),
            Err(error) => warn!(%error, "could not decode validation errors"),
        }
    }
    Err(VisitFailure::Status {
        status: status.as_u16(),
        body,
    })
}

fn decode_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

fn multipart_form(payload: &Payload) -> Result<MultipartForm, TransportError> {
    let mut form = MultipartForm::new();
    for (field, value) in payload.iter() {
        form = match value {
            FieldValue::Json(value) => form.text(field.clone(), scalar_text(value)),
            FieldValue::File(file) => {
                let mut part = Part::bytes(file.bytes.clone()).file_name(file.file_name.clone());
                if let Some(content_type) = &file.content_type {
                    part = part
                        .mime_str(content_type)
                        .map_err(|e| TransportError::InvalidPayload(e.to_string()))?;
                }
                form.part(field.clone(), part)
            }
        };
    }
    Ok(form)
}

#[async_trait]
impl Dispatcher for HttpTransport {
    async fn perform(
        &self,
        visit: &Visit,
        token: &CancelToken,
        hooks: &dyn VisitHooks,
    ) -> Result<Result<Page, VisitFailure>, EventError> {
        debug!(submission = %visit.id, method = %visit.method, url = %visit.url, "sending submission");
        tokio::select! {
            _ = token.cancelled() => Ok(Err(VisitFailure::Transport("request cancelled".into()))),
            result = self.send_visit(visit, hooks) => result,
        }
    }
}

#[async_trait]
impl PrecognitionTransport for HttpTransport {
    async fn send(
        &self,
        request: PrecognitionRequest,
    ) -> Result<PrecognitionResponse, TransportError> {
        let mut builder = self
            .request(request.method, &request.url, &request.payload, request.encoding)?
            .timeout(request.timeout);
        for (name, value) in request.headers() {
            builder = builder.header(name, value);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let confirmed = PrecognitionResponse::is_confirmation(
            response
                .headers()
                .get(PRECOGNITION_CONFIRMATION_HEADER)
                .and_then(|v| v.to_str().ok()),
        );
        let bytes = response.bytes().await?;
        debug!(field = %request.field, status, confirmed, "precognition response received");

        Ok(PrecognitionResponse {
            status,
            confirmed,
            body: decode_body(&bytes),
        })
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;

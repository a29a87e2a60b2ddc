//! Wire Protocol
//!
//! Single responsibility: the JSON message schema exchanged with the object API.
//!
//! # Frames
//!
//! Every frame is a JSON text message. Outgoing frames are either a
//! [`Request`] (RPC connection) or a [`PushFilter`] (event connection).
//! Incoming frames are either:
//!
//! ```text
//! { "requestID": "...", "statusCode": 200, "total": 1, "payload": ... }   // Response
//! { "type": "create", "identity": "...", "entity": {...} }               // Event
//! ```
//!
//! A frame carrying `requestID` is always a response.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::DuplexError;

/// Operation requested on the remote object API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    Create,
    Retrieve,
    RetrieveMany,
    Update,
    Delete,
    Info,
}

/// A request frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub id: String,
    pub namespace: String,
    pub operation: Operation,
    /// Kind of object the operation targets
    pub identity: String,
    pub credential: String,
    #[serde(rename = "objectID", default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Request {
    /// Create a request with a fresh identifier.
    pub fn new(operation: Operation, identity: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            namespace: String::new(),
            operation,
            identity: identity.into(),
            credential: String::new(),
            object_id: None,
            payload: None,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = credential.into();
        self
    }

    pub fn with_object_id(mut self, object_id: impl Into<String>) -> Self {
        self.object_id = Some(object_id.into());
        self
    }

    /// Attach a JSON-encoded payload.
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self, DuplexError> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }
}

/// A response frame, correlated to a request by `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(rename = "requestID")]
    pub request_id: String,
    pub status_code: u16,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub payload: Value,
}

impl Response {
    /// Status codes 200 through 300 inclusive are a success.
    pub fn is_success(&self) -> bool {
        (200..=300).contains(&self.status_code)
    }

    /// Decode the payload into `T`.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, DuplexError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Kind of change an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Create,
    Update,
    Delete,
}

/// A push event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub identity: String,
    #[serde(default)]
    pub entity: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Selects which events the event connection delivers.
///
/// An identity mapped to an empty list receives every event type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushFilter {
    pub identities: BTreeMap<String, Vec<EventType>>,
}

impl PushFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an identity, restricted to `types` (empty = all).
    pub fn filter_identity(mut self, identity: impl Into<String>, types: &[EventType]) -> Self {
        self.identities.insert(identity.into(), types.to_vec());
        self
    }
}

/// An error entry in a non-success response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: u16,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ApiError {
    pub fn new(code: u16, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            code,
            title: title.into(),
            description: description.into(),
            subject: String::new(),
            data: None,
        }
    }
}

/// An inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Response(Response),
    Event(Event),
}

impl Frame {
    /// Decode an inbound text frame.
    pub fn decode(text: &str) -> Result<Self, DuplexError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| DuplexError::Protocol(format!("Frame is not JSON: {}", e)))?;

        if value.get("requestID").is_some() {
            let response = serde_json::from_value(value)
                .map_err(|e| DuplexError::Protocol(format!("Malformed response: {}", e)))?;
            return Ok(Frame::Response(response));
        }

        let event = serde_json::from_value(value)
            .map_err(|e| DuplexError::Protocol(format!("Malformed event: {}", e)))?;
        Ok(Frame::Event(event))
    }
}

/// Convert a non-success response into an application error.
///
/// The body is expected to be a list of [`ApiError`]; anything else is
/// reported as a single entry carrying the raw body.
pub fn decode_errors(response: &Response) -> DuplexError {
    let errors = match serde_json::from_value::<Vec<ApiError>>(response.payload.clone()) {
        Ok(errors) => errors,
        Err(_) => match serde_json::from_value::<ApiError>(response.payload.clone()) {
            Ok(error) => vec![error],
            Err(_) => vec![ApiError::new(
                response.status_code,
                "Unable to decode error",
                response.payload.to_string(),
            )],
        },
    };

    DuplexError::Application {
        status_code: response.status_code,
        errors,
    }
}

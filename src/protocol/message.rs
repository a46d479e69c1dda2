//! Wire message types and codec.
//!
//! Every frame is a JSON object with a `type` discriminator.
//!
//! # Format
//!
//! ```json
//! { "type": "connection_init", "payload": { "token": "..." } }
//! { "type": "subscribe", "id": "1", "payload": { "query": "{ value }" } }
//! { "type": "next", "id": "1", "payload": { "data": { "value": 1 } } }
//! { "type": "complete", "id": "1" }
//! ```
//!
//! [`parse_message`] rejects unknown types and malformed fields with
//! [`Error::BadMessage`]; [`stringify_message`] never fails for messages
//! built through the constructors on [`Message`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::identifiers::OperationId;

// ============================================================================
// Constants
// ============================================================================

/// Subprotocol name negotiated by WebSocket transports.
pub const GRAPHQL_TRANSPORT_WS_PROTOCOL: &str = "graphql-transport-ws";

/// JSON object used for optional message payloads.
pub type Payload = Map<String, Value>;

// ============================================================================
// SubscribePayload
// ============================================================================

/// Request carried by a `subscribe` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribePayload {
    /// GraphQL document.
    pub query: String,

    /// Name of the operation to run when the document holds several.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,

    /// Variable values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Payload>,

    /// Protocol extensions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Payload>,
}

impl SubscribePayload {
    /// Creates a payload with only a query document.
    #[inline]
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            operation_name: None,
            variables: None,
            extensions: None,
        }
    }

    /// Sets the operation name.
    #[inline]
    #[must_use]
    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    /// Sets the variables object.
    #[inline]
    #[must_use]
    pub fn with_variables(mut self, variables: Payload) -> Self {
        self.variables = Some(variables);
        self
    }

    /// Sets the extensions object.
    #[inline]
    #[must_use]
    pub fn with_extensions(mut self, extensions: Payload) -> Self {
        self.extensions = Some(extensions);
        self
    }
}

// ============================================================================
// MessageType
// ============================================================================

/// Discriminator of a wire message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// `connection_init`
    ConnectionInit,
    /// `connection_ack`
    ConnectionAck,
    /// `ping`
    Ping,
    /// `pong`
    Pong,
    /// `subscribe`
    Subscribe,
    /// `next`
    Next,
    /// `error`
    Error,
    /// `complete`
    Complete,
}

impl MessageType {
    /// Returns the wire name of this type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionInit => "connection_init",
            Self::ConnectionAck => "connection_ack",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Subscribe => "subscribe",
            Self::Next => "next",
            Self::Error => "error",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Message
// ============================================================================

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Client → server: start the handshake.
    ConnectionInit {
        /// Connection parameters.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Payload>,
    },

    /// Server → client: handshake accepted.
    ConnectionAck {
        /// Optional acknowledgement data.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Payload>,
    },

    /// Either direction: liveness probe.
    Ping {
        /// Optional data echoed by the pong.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Payload>,
    },

    /// Either direction: liveness response.
    Pong {
        /// Optional data.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Payload>,
    },

    /// Client → server: start an operation.
    Subscribe {
        /// Operation id.
        id: OperationId,
        /// Operation request.
        payload: SubscribePayload,
    },

    /// Server → client: one execution result.
    Next {
        /// Operation id.
        id: OperationId,
        /// Execution result object.
        payload: Value,
    },

    /// Server → client: the operation failed.
    Error {
        /// Operation id.
        id: OperationId,
        /// GraphQL error objects.
        payload: Vec<Value>,
    },

    /// Either direction: the operation is finished, or the client stops it.
    Complete {
        /// Operation id.
        id: OperationId,
    },
}

impl Message {
    /// Creates a `connection_init` message.
    #[inline]
    #[must_use]
    pub fn connection_init(payload: Option<Payload>) -> Self {
        Self::ConnectionInit { payload }
    }

    /// Creates a `connection_ack` message.
    #[inline]
    #[must_use]
    pub fn connection_ack(payload: Option<Payload>) -> Self {
        Self::ConnectionAck { payload }
    }

    /// Creates a `ping` message.
    #[inline]
    #[must_use]
    pub fn ping(payload: Option<Payload>) -> Self {
        Self::Ping { payload }
    }

    /// Creates a `pong` message.
    #[inline]
    #[must_use]
    pub fn pong(payload: Option<Payload>) -> Self {
        Self::Pong { payload }
    }

    /// Creates a `subscribe` message.
    #[inline]
    #[must_use]
    pub fn subscribe(id: OperationId, payload: SubscribePayload) -> Self {
        Self::Subscribe { id, payload }
    }

    /// Creates a `next` message.
    #[inline]
    #[must_use]
    pub fn next(id: OperationId, payload: Value) -> Self {
        Self::Next { id, payload }
    }

    /// Creates an `error` message.
    #[inline]
    #[must_use]
    pub fn error(id: OperationId, payload: Vec<Value>) -> Self {
        Self::Error { id, payload }
    }

    /// Creates a `complete` message.
    #[inline]
    #[must_use]
    pub fn complete(id: OperationId) -> Self {
        Self::Complete { id }
    }

    /// Returns the message discriminator.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::ConnectionInit { .. } => MessageType::ConnectionInit,
            Self::ConnectionAck { .. } => MessageType::ConnectionAck,
            Self::Ping { .. } => MessageType::Ping,
            Self::Pong { .. } => MessageType::Pong,
            Self::Subscribe { .. } => MessageType::Subscribe,
            Self::Next { .. } => MessageType::Next,
            Self::Error { .. } => MessageType::Error,
            Self::Complete { .. } => MessageType::Complete,
        }
    }

    /// Returns the operation id for operation-scoped messages.
    #[must_use]
    pub fn id(&self) -> Option<&OperationId> {
        match self {
            Self::Subscribe { id, .. }
            | Self::Next { id, .. }
            | Self::Error { id, .. }
            | Self::Complete { id } => Some(id),
            _ => None,
        }
    }

    /// Checks the constraints serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadMessage`] on an empty id, an empty query, a
    /// non-object `next` payload, or an empty or malformed error list.
    pub fn validate(&self) -> Result<()> {
        if let Some(id) = self.id()
            && id.as_str().is_empty()
        {
            return Err(Error::bad_message(format!(
                "\"{}\" message expects the 'id' property to be a non-empty string",
                self.message_type()
            )));
        }

        match self {
            Self::Subscribe { payload, .. } if payload.query.is_empty() => Err(
                Error::bad_message("\"subscribe\" message expects a non-empty 'query'"),
            ),
            Self::Next { payload, .. } if !payload.is_object() => Err(Error::bad_message(
                "\"next\" message expects the 'payload' property to be an object",
            )),
            Self::Error { payload, .. } if !are_graphql_errors(payload) => {
                Err(Error::bad_message(
                    "\"error\" message expects the 'payload' property to be a non-empty list of errors",
                ))
            }
            _ => Ok(()),
        }
    }
}

/// An error list is a non-empty array of objects with a string `message`.
fn are_graphql_errors(errors: &[Value]) -> bool {
    !errors.is_empty()
        && errors
            .iter()
            .all(|error| error.get("message").is_some_and(Value::is_string))
}

// ============================================================================
// Codec
// ============================================================================

/// Decodes and validates one text frame.
///
/// # Errors
///
/// Returns [`Error::BadMessage`] if the frame is not JSON, the `type` is
/// unknown, or a required field is missing or mistyped.
pub fn parse_message(text: &str) -> Result<Message> {
    let message: Message = serde_json::from_str(text)
        .map_err(|e| Error::bad_message(format!("Invalid message received: {e}")))?;
    message.validate()?;
    Ok(message)
}

/// Encodes one message as a text frame.
///
/// # Errors
///
/// Returns [`Error::BadMessage`] if the message fails validation, or
/// [`Error::Json`] if serialization fails.
pub fn stringify_message(message: &Message) -> Result<String> {
    message.validate()?;
    Ok(serde_json::to_string(message)?)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_parse_connection_init_without_payload() {
        let message = parse_message(r#"{"type":"connection_init"}"#).expect("parse");
        assert_eq!(message, Message::connection_init(None));
    }

    #[test]
    fn test_parse_null_payload_is_absent() {
        let message = parse_message(r#"{"type":"ping","payload":null}"#).expect("parse");
        assert_eq!(message, Message::ping(None));
    }

    #[test]
    fn test_parse_subscribe() {
        let text = r#"{
            "type": "subscribe",
            "id": "1",
            "payload": {
                "query": "subscription Ping($key: String!) { ping(key: $key) }",
                "operationName": "Ping",
                "variables": { "key": "1" },
                "extensions": null
            }
        }"#;

        let message = parse_message(text).expect("parse");
        let Message::Subscribe { id, payload } = message else {
            panic!("expected subscribe");
        };
        assert_eq!(id.as_str(), "1");
        assert_eq!(payload.operation_name.as_deref(), Some("Ping"));
        assert_eq!(payload.variables, json!({ "key": "1" }).as_object().cloned());
        assert_eq!(payload.extensions, None);
    }

    #[test]
    fn test_unknown_type_is_bad_message() {
        let err = parse_message(r#"{"type":"start","id":"1"}"#).unwrap_err();
        assert!(matches!(err, Error::BadMessage { .. }));
    }

    #[test]
    fn test_missing_id_is_bad_message() {
        let err = parse_message(r#"{"type":"complete"}"#).unwrap_err();
        assert!(matches!(err, Error::BadMessage { .. }));
    }

    #[test]
    fn test_empty_id_is_bad_message() {
        let err = parse_message(r#"{"type":"complete","id":""}"#).unwrap_err();
        assert!(matches!(err, Error::BadMessage { .. }));
    }

    #[test]
    fn test_mistyped_query_is_bad_message() {
        let err =
            parse_message(r#"{"type":"subscribe","id":"1","payload":{"query":42}}"#).unwrap_err();
        assert!(matches!(err, Error::BadMessage { .. }));
    }

    #[test]
    fn test_non_object_next_payload_is_bad_message() {
        let err = parse_message(r#"{"type":"next","id":"1","payload":"nope"}"#).unwrap_err();
        assert!(matches!(err, Error::BadMessage { .. }));
    }

    #[test]
    fn test_error_payload_must_hold_errors() {
        assert!(parse_message(r#"{"type":"error","id":"1","payload":[]}"#).is_err());
        assert!(parse_message(r#"{"type":"error","id":"1","payload":[{"msg":"x"}]}"#).is_err());
        assert!(
            parse_message(r#"{"type":"error","id":"1","payload":[{"message":"x"}]}"#).is_ok()
        );
    }

    #[test]
    fn test_invalid_json_is_bad_message() {
        let err = parse_message("{").unwrap_err();
        assert!(matches!(err, Error::BadMessage { .. }));
    }

    #[test]
    fn test_stringify_omits_absent_fields() {
        assert_eq!(
            stringify_message(&Message::pong(None)).expect("encode"),
            r#"{"type":"pong"}"#
        );

        let subscribe = Message::subscribe("1".into(), SubscribePayload::new("{ value }"));
        assert_eq!(
            stringify_message(&subscribe).expect("encode"),
            r#"{"type":"subscribe","id":"1","payload":{"query":"{ value }"}}"#
        );
    }

    #[test]
    fn test_stringify_rejects_invalid_state() {
        let err = stringify_message(&Message::error("1".into(), vec![])).unwrap_err();
        assert!(matches!(err, Error::BadMessage { .. }));
    }

    #[test]
    fn test_message_id_accessor() {
        assert_eq!(Message::complete("7".into()).id().map(OperationId::as_str), Some("7"));
        assert!(Message::ping(None).id().is_none());
        assert_eq!(Message::ping(None).message_type().as_str(), "ping");
    }
}

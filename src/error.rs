//! Error types for the protocol engine.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use graphql_packet::{Result, protocol::parse_message};
//!
//! fn decode(text: &str) -> Result<()> {
//!     let message = parse_message(text)?;
//!     println!("{}", message.message_type());
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Transport | [`Error::TransportClosed`], [`Error::Connection`] |
//! | Protocol | [`Error::BadMessage`] |
//! | Engine | [`Error::ChannelClosed`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`] |
//!
//! Subscriber sinks receive [`SubscriptionError`] instead, which is
//! `Clone` so one connection failure can be fanned out to every
//! registered subscriber.

// ============================================================================
// Imports
// ============================================================================

use std::any::Any;
use std::io::Error as IoError;
use std::result::Result as StdResult;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::protocol::CloseEvent;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when client or server options are invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Socket is not open.
    ///
    /// Returned by `send` when the socket's ready state is not `Open`.
    #[error("Transport closed")]
    TransportClosed,

    /// Socket connection failed.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Malformed or unknown wire message.
    ///
    /// Returned when a frame is not valid JSON, carries an unknown `type`,
    /// or misses a required field.
    #[error("Bad message: {message}")]
    BadMessage {
        /// Description of what is wrong with the message.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a bad message error.
    #[inline]
    pub fn bad_message(message: impl Into<String>) -> Self {
        Self::BadMessage {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::TransportClosed | Self::WebSocket(_) | Self::Io(_)
        )
    }
}

// ============================================================================
// Panics
// ============================================================================

/// Extracts the message of a caught panic.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_owned()
    }
}

// ============================================================================
// SubscriptionError
// ============================================================================

/// Failure delivered to a subscriber's sink.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SubscriptionError {
    /// The socket closed and the close was not retried.
    #[error("Socket closed: {0}")]
    Closed(CloseEvent),

    /// The server answered the operation with an `error` message.
    #[error("Operation failed with {} error(s)", .0.len())]
    Graphql(Vec<Value>),

    /// The socket reported a transport error and the problem was not retried.
    #[error("Connection error: {0}")]
    Connection(String),
}

impl SubscriptionError {
    /// Returns the close event when this failure came from a socket close.
    #[inline]
    #[must_use]
    pub fn close_event(&self) -> Option<&CloseEvent> {
        match self {
            Self::Closed(event) => Some(event),
            _ => None,
        }
    }

    /// Returns the close code when this failure came from a socket close.
    #[inline]
    #[must_use]
    pub fn close_code(&self) -> Option<u16> {
        self.close_event().map(|event| event.code)
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Wire protocol message types.
//!
//! This module defines the message format shared by the client and server
//! engines and the close codes they use to end a connection.
//!
//! # Protocol Overview
//!
//! | Message Type | Direction | Purpose |
//! |--------------|-----------|---------|
//! | `connection_init` | Client → Server | Start handshake |
//! | `connection_ack` | Server → Client | Handshake accepted |
//! | `ping` / `pong` | Either | Liveness probe / response |
//! | `subscribe` | Client → Server | Start operation |
//! | `next` | Server → Client | One result |
//! | `error` | Server → Client | Operation failed |
//! | `complete` | Either | Operation finished / cancelled |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `close` | Close codes, close events, reason limiting |
//! | `message` | Message enum and JSON codec |

// ============================================================================
// Submodules
// ============================================================================

/// Close codes and close events.
pub mod close;

/// Message types and codec.
pub mod message;

// ============================================================================
// Re-exports
// ============================================================================

pub use close::{
    CloseCode, CloseEvent, MAX_CLOSE_REASON_LEN, is_fatal_internal_close_code,
    is_terminal_protocol_close_code, limit_close_reason,
};
pub use message::{
    GRAPHQL_TRANSPORT_WS_PROTOCOL, Message, MessageType, Payload, SubscribePayload,
    parse_message, stringify_message,
};

//! Socket adapter layer.
//!
//! The engines never touch a concrete transport. They drive a socket through
//! one of two capability traits and observe it through an ordered stream of
//! [`SocketEvent`]s.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐   ClientSocket    ┌──────────────┐   ServerSocket    ┌─────────────────┐
//! │  Client engine  │──────────────────►│  transport   │◄──────────────────│  Server engine  │
//! │                 │◄──────────────────│ (ws/virtual) │──────────────────►│                 │
//! └─────────────────┘   SocketEvents    └──────────────┘   SocketEvents    └─────────────────┘
//! ```
//!
//! # Contract
//!
//! - Construction starts connecting; exactly one of `Opened` or `Error`
//!   is reported before any `Message`.
//! - `send` fails with [`Error::TransportClosed`](crate::Error::TransportClosed)
//!   unless the socket is open; delivery is asynchronous and ordered.
//! - `close` is idempotent and always ends with exactly one `Closed` event.
//! - A failed connect reports `Error` then a non-clean `Closed`, never
//!   `Opened`.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `listener` | TCP listener accepting WebSocket server sockets |
//! | `memory` | In-process socket pairs with network-like semantics |
//! | `websocket` | tokio-tungstenite client and server sockets |

// ============================================================================
// Submodules
// ============================================================================

/// WebSocket listener for the server engine.
pub mod listener;

/// In-process virtual transport.
pub mod memory;

/// tokio-tungstenite socket adapters.
pub mod websocket;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::{CloseEvent, GRAPHQL_TRANSPORT_WS_PROTOCOL};

// ============================================================================
// Re-exports
// ============================================================================

pub use listener::WsListener;
pub use memory::{VirtualClientSocket, VirtualServer, VirtualServerSocket};
pub use websocket::{WsClientSocket, WsServerSocket};

// ============================================================================
// ReadyState
// ============================================================================

/// Lifecycle state of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadyState {
    /// Connection is being established.
    Connecting,
    /// Frames can be sent.
    Open,
    /// Close has been requested but not yet completed.
    Closing,
    /// Terminal state.
    Closed,
}

impl ReadyState {
    /// Returns `true` once the socket can no longer send.
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

// ============================================================================
// SocketEvent
// ============================================================================

/// Lifecycle and data events reported by a socket, in transport order.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    /// The connection is open.
    Opened,
    /// A text frame arrived.
    Message(String),
    /// The connection closed. Always the last event.
    Closed(CloseEvent),
    /// The transport failed.
    Error(String),
    /// A transport-level ping arrived.
    Ping(Vec<u8>),
    /// A transport-level pong arrived.
    Pong(Vec<u8>),
}

/// Receiving half of a socket's event stream.
pub type SocketEvents = mpsc::UnboundedReceiver<SocketEvent>;

// ============================================================================
// Socket traits
// ============================================================================

/// Client side of a connection.
pub trait ClientSocket: Send + Sync {
    /// Returns the current ready state.
    fn ready_state(&self) -> ReadyState;

    /// Returns the negotiated subprotocol.
    fn protocol(&self) -> &str {
        GRAPHQL_TRANSPORT_WS_PROTOCOL
    }

    /// Enqueues a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransportClosed`](crate::Error::TransportClosed) if
    /// the socket is not open.
    fn send(&self, text: String) -> Result<()>;

    /// Starts an orderly close. Calling it again is a no-op.
    fn close(&self, code: u16, reason: &str);

    /// Sends a transport ping. No-op where unsupported.
    fn ping(&self, _payload: Vec<u8>) {}

    /// Sends a transport pong. No-op where unsupported.
    fn pong(&self, _payload: Vec<u8>) {}

    /// Drops the connection without a close handshake.
    fn terminate(&self);
}

/// Server side of an accepted connection.
pub trait ServerSocket: Send + Sync {
    /// Returns `true` while frames can be sent.
    fn is_open(&self) -> bool;

    /// Returns the negotiated subprotocol.
    fn protocol(&self) -> &str {
        GRAPHQL_TRANSPORT_WS_PROTOCOL
    }

    /// Enqueues a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransportClosed`](crate::Error::TransportClosed) if
    /// the socket is not open.
    fn send(&self, text: String) -> Result<()>;

    /// Starts a close. Calling it again is a no-op.
    ///
    /// Reserved codes that cannot appear on the wire (1005, 1006) drop the
    /// connection instead.
    fn close(&self, code: u16, reason: &str);

    /// Sends a transport ping. No-op where unsupported.
    fn ping(&self, _payload: Vec<u8>) {}
}

// ============================================================================
// Streams
// ============================================================================

/// A freshly created client socket and its event stream.
pub struct ClientStream {
    /// Socket handle.
    pub socket: Box<dyn ClientSocket>,
    /// Event stream.
    pub events: SocketEvents,
}

impl fmt::Debug for ClientStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientStream")
            .field("ready_state", &self.socket.ready_state())
            .finish_non_exhaustive()
    }
}

/// An accepted server socket and its event stream.
pub struct ServerStream {
    /// Socket handle.
    pub socket: Arc<dyn ServerSocket>,
    /// Event stream.
    pub events: SocketEvents,
}

impl fmt::Debug for ServerStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerStream")
            .field("open", &self.socket.is_open())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// SocketFactory
// ============================================================================

/// Creates client sockets for the client engine, one per connect attempt.
pub trait SocketFactory: Send + Sync {
    /// Creates a socket in the `Connecting` state.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot even be constructed; the engine
    /// treats this like a failed connect.
    fn create(&self) -> Result<ClientStream>;
}

impl<F> SocketFactory for F
where
    F: Fn() -> Result<ClientStream> + Send + Sync,
{
    fn create(&self) -> Result<ClientStream> {
        self()
    }
}

// ============================================================================
// Tests
// ============================================================================

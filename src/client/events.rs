//! Client lifecycle events and listener registry.

// ============================================================================
// Imports
// ============================================================================

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::error;

use crate::error::panic_message;
use crate::identifiers::ListenerId;
use crate::protocol::{CloseEvent, Message, Payload};

// ============================================================================
// ClientEvent
// ============================================================================

/// Events emitted by the client engine, in the order they happen.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A socket is being created.
    Connecting {
        /// Whether this connect follows a retry wait.
        is_retry: bool,
    },
    /// The socket opened; `connection_init` follows.
    Opened,
    /// The server acknowledged the connection.
    Connected {
        /// Payload of the `connection_ack`.
        payload: Option<Payload>,
        /// Whether the connection was reached through retrying.
        was_retry: bool,
    },
    /// A `ping` message was sent or received.
    Ping {
        /// `true` when received from the server.
        received: bool,
        /// Message payload.
        payload: Option<Payload>,
    },
    /// A `pong` message was sent or received.
    Pong {
        /// `true` when received from the server.
        received: bool,
        /// Message payload.
        payload: Option<Payload>,
    },
    /// A valid message arrived.
    Message(Message),
    /// The socket closed.
    Closed(CloseEvent),
    /// Something went wrong.
    Error(String),
}

impl ClientEvent {
    /// Returns the kind of this event.
    #[must_use]
    pub fn kind(&self) -> ClientEventKind {
        match self {
            Self::Connecting { .. } => ClientEventKind::Connecting,
            Self::Opened => ClientEventKind::Opened,
            Self::Connected { .. } => ClientEventKind::Connected,
            Self::Ping { .. } => ClientEventKind::Ping,
            Self::Pong { .. } => ClientEventKind::Pong,
            Self::Message(_) => ClientEventKind::Message,
            Self::Closed(_) => ClientEventKind::Closed,
            Self::Error(_) => ClientEventKind::Error,
        }
    }
}

/// Kinds of [`ClientEvent`] a listener can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientEventKind {
    /// [`ClientEvent::Connecting`]
    Connecting,
    /// [`ClientEvent::Opened`]
    Opened,
    /// [`ClientEvent::Connected`]
    Connected,
    /// [`ClientEvent::Ping`]
    Ping,
    /// [`ClientEvent::Pong`]
    Pong,
    /// [`ClientEvent::Message`]
    Message,
    /// [`ClientEvent::Closed`]
    Closed,
    /// [`ClientEvent::Error`]
    Error,
}

// ============================================================================
// Listeners
// ============================================================================

/// Event listener callback.
pub type Listener = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

/// Listener registry shared by the client handle and its engine.
#[derive(Default)]
pub(crate) struct Listeners {
    entries: RwLock<Vec<(ListenerId, ClientEventKind, Listener)>>,
}

impl Listeners {
    pub(crate) fn add(&self, kind: ClientEventKind, listener: Listener) -> ListenerId {
        let id = ListenerId::next();
        self.entries.write().push((id, kind, listener));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(entry, _, _)| *entry != id);
        entries.len() != before
    }

    /// Calls every listener of the event's kind, in registration order.
    ///
    /// Listeners are snapshotted first, so they may add or remove listeners.
    /// Returns the message of the first panic, if any listener panicked.
    pub(crate) fn emit(&self, event: &ClientEvent) -> Option<String> {
        let kind = event.kind();
        let snapshot: Vec<Listener> = self
            .entries
            .read()
            .iter()
            .filter(|(_, entry_kind, _)| *entry_kind == kind)
            .map(|(_, _, listener)| Arc::clone(listener))
            .collect();

        let mut failure = None;
        for listener in snapshot {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(event))) {
                let message = panic_message(panic.as_ref());
                error!(?kind, %message, "Listener panicked");
                failure.get_or_insert(message);
            }
        }
        failure
    }
}

// ============================================================================
// Tests
// ============================================================================

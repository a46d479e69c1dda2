//! In-process virtual transport.
//!
//! A [`VirtualServer`] hands out connected socket pairs that behave like a
//! network connection: events are delivered asynchronously through the
//! peer's event stream, the client starts in `Connecting` and opens on a
//! later tick, and a close moves through `Closing` before both sides observe
//! exactly one `Closed` event.
//!
//! # Example
//!
//! ```ignore
//! let server = VirtualServer::new();
//! let mut incoming = server.incoming().expect("first call");
//!
//! let client = server.create_stream();
//! let accepted = incoming.recv().await.expect("connection");
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::protocol::{CloseCode, CloseEvent};

use super::{
    ClientSocket, ClientStream, ReadyState, ServerSocket, ServerStream, SocketEvent,
};

// ============================================================================
// Types
// ============================================================================

/// Live server sockets by pair id.
type SocketRegistry = Mutex<FxHashMap<u64, Arc<VirtualServerSocket>>>;

// ============================================================================
// Pair
// ============================================================================

/// Mutable state shared by both ends of one virtual connection.
#[derive(Debug)]
struct PairState {
    /// Client-observed ready state.
    ready_state: ReadyState,
    /// Set by the first close or terminate from either side.
    closed: bool,
    /// Whether the client transport answers server pings.
    auto_pong: bool,
}

/// One virtual connection.
#[derive(Debug)]
struct Pair {
    id: u64,
    state: Mutex<PairState>,
    to_client: mpsc::UnboundedSender<SocketEvent>,
    to_server: mpsc::UnboundedSender<SocketEvent>,
    registry: Weak<SocketRegistry>,
}

impl Pair {
    /// Runs the close sequence once: `Closing` now, `Closed` on a later tick.
    fn close(self: &Arc<Self>, code: u16, reason: &str, was_clean: bool) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.ready_state = ReadyState::Closing;
        }

        let code = if code == 0 {
            CloseCode::NoStatus.code()
        } else {
            code
        };
        let event = CloseEvent {
            code,
            reason: reason.to_owned(),
            was_clean,
        };

        debug!(pair = self.id, code, reason, "Virtual socket closing");

        let pair = Arc::clone(self);
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            pair.state.lock().ready_state = ReadyState::Closed;
            let _ = pair.to_client.send(SocketEvent::Closed(event.clone()));
            let _ = pair.to_server.send(SocketEvent::Closed(event));
            if let Some(registry) = pair.registry.upgrade() {
                registry.lock().remove(&pair.id);
            }
        });
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

// ============================================================================
// VirtualClientSocket
// ============================================================================

/// Client end of a virtual connection.
#[derive(Debug, Clone)]
pub struct VirtualClientSocket {
    pair: Arc<Pair>,
}

impl ClientSocket for VirtualClientSocket {
    fn ready_state(&self) -> ReadyState {
        self.pair.state.lock().ready_state
    }

    fn send(&self, text: String) -> Result<()> {
        if self.ready_state() != ReadyState::Open {
            return Err(Error::TransportClosed);
        }
        trace!(pair = self.pair.id, %text, "Virtual client send");
        let _ = self.pair.to_server.send(SocketEvent::Message(text));
        Ok(())
    }

    fn close(&self, code: u16, reason: &str) {
        self.pair.close(code, reason, true);
    }

    fn ping(&self, payload: Vec<u8>) {
        if self.pair.is_closed() {
            return;
        }
        let _ = self.pair.to_server.send(SocketEvent::Ping(payload.clone()));
        // server transports always answer
        let _ = self.pair.to_client.send(SocketEvent::Pong(payload));
    }

    fn pong(&self, payload: Vec<u8>) {
        if self.pair.is_closed() {
            return;
        }
        let _ = self.pair.to_server.send(SocketEvent::Pong(payload));
    }

    fn terminate(&self) {
        self.pair.close(CloseCode::Abnormal.code(), "", false);
    }
}

// ============================================================================
// VirtualServerSocket
// ============================================================================

/// Server end of a virtual connection.
#[derive(Debug)]
pub struct VirtualServerSocket {
    pair: Arc<Pair>,
}

impl VirtualServerSocket {
    /// Returns the id of the connection, unique within its server.
    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.pair.id
    }

    /// Controls whether the client transport answers this socket's pings.
    ///
    /// Disabling it simulates a peer that stopped responding.
    pub fn set_auto_pong(&self, enabled: bool) {
        self.pair.state.lock().auto_pong = enabled;
    }
}

impl ServerSocket for VirtualServerSocket {
    fn is_open(&self) -> bool {
        !self.pair.is_closed()
    }

    fn send(&self, text: String) -> Result<()> {
        if self.pair.is_closed() {
            return Err(Error::TransportClosed);
        }
        trace!(pair = self.pair.id, %text, "Virtual server send");
        let _ = self.pair.to_client.send(SocketEvent::Message(text));
        Ok(())
    }

    fn close(&self, code: u16, reason: &str) {
        self.pair
            .close(code, reason, code != CloseCode::Abnormal.code());
    }

    fn ping(&self, payload: Vec<u8>) {
        let auto_pong = {
            let state = self.pair.state.lock();
            if state.closed {
                return;
            }
            state.auto_pong
        };
        let _ = self.pair.to_client.send(SocketEvent::Ping(payload.clone()));
        if auto_pong {
            let _ = self.pair.to_server.send(SocketEvent::Pong(payload));
        }
    }
}

// ============================================================================
// VirtualServer
// ============================================================================

/// Accept side of the virtual transport.
///
/// Every [`create_stream`](Self::create_stream) call produces a client
/// socket and pushes the matching server socket to the incoming queue.
#[derive(Debug)]
pub struct VirtualServer {
    sockets: Arc<SocketRegistry>,
    incoming_tx: mpsc::UnboundedSender<ServerStream>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<ServerStream>>>,
    next_id: AtomicU64,
}

impl Default for VirtualServer {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualServer {
    /// Creates a server with no connections.
    #[must_use]
    pub fn new() -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Self {
            sockets: Arc::new(Mutex::new(FxHashMap::default())),
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Takes the queue of accepted connections. Returns `None` after the
    /// first call.
    pub fn incoming(&self) -> Option<mpsc::UnboundedReceiver<ServerStream>> {
        self.incoming_rx.lock().take()
    }

    /// Opens a new connection and returns its client end.
    ///
    /// The client reports `Opened` on a later tick; the server end is
    /// queued immediately.
    pub fn create_stream(&self) -> ClientStream {
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let pair = Arc::new(Pair {
            id,
            state: Mutex::new(PairState {
                ready_state: ReadyState::Connecting,
                closed: false,
                auto_pong: true,
            }),
            to_client: client_tx,
            to_server: server_tx,
            registry: Arc::downgrade(&self.sockets),
        });

        let server_socket = Arc::new(VirtualServerSocket {
            pair: Arc::clone(&pair),
        });
        self.sockets.lock().insert(id, Arc::clone(&server_socket));

        let opening = Arc::clone(&pair);
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            let mut state = opening.state.lock();
            if state.closed {
                return;
            }
            state.ready_state = ReadyState::Open;
            let _ = opening.to_client.send(SocketEvent::Opened);
        });

        debug!(pair = id, "Virtual connection created");

        let _ = self.incoming_tx.send(ServerStream {
            socket: server_socket,
            events: server_rx,
        });

        ClientStream {
            socket: Box::new(VirtualClientSocket { pair }),
            events: client_rx,
        }
    }

    /// Returns the server ends of all connections that have not closed yet.
    #[must_use]
    pub fn sockets(&self) -> Vec<Arc<VirtualServerSocket>> {
        let mut sockets: Vec<_> = self.sockets.lock().values().cloned().collect();
        sockets.sort_by_key(|socket| socket.id());
        sockets
    }

    /// Returns the number of connections that have not closed yet.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.sockets.lock().len()
    }

    /// Closes every live connection without a status code.
    pub fn close(&self) {
        let sockets: Vec<_> = self.sockets.lock().drain().map(|(_, socket)| socket).collect();
        for socket in sockets {
            socket.close(CloseCode::NoStatus.code(), "");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

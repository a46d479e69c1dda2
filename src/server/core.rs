//! Server handle and accept loops.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::protocol::CloseCode;
use crate::transport::{ServerSocket, ServerStream, WsListener};

use super::connection::Connection;
use super::options::{ServerOptions, ServerSettings};

// ============================================================================
// Server
// ============================================================================

/// Protocol server.
///
/// Cheap to clone; all clones share the same connections.
///
/// # Example
///
/// ```ignore
/// let server = Server::new(ServerOptions::new().executor(executor))?;
///
/// // Any transport:
/// server.handle(stream);
///
/// // Or a WebSocket listener:
/// server.serve(WsListener::bind(ip, 0).await?).await?;
/// ```
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    settings: Arc<ServerSettings>,
    /// Live connections by id.
    connections: RwLock<FxHashMap<u64, Arc<dyn ServerSocket>>>,
    next_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("connections", &self.connection_count())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Server - Constructor
// ============================================================================

impl Server {
    /// Creates a server.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the options are invalid.
    pub fn new(options: ServerOptions) -> Result<Self> {
        let settings = options.build()?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(ServerInner {
                settings: Arc::new(settings),
                connections: RwLock::new(FxHashMap::default()),
                next_id: AtomicU64::new(1),
                shutdown_tx,
            }),
        })
    }
}

// ============================================================================
// Server - Public API
// ============================================================================

impl Server {
    /// Starts serving one accepted socket.
    ///
    /// The returned task finishes once the socket has closed and the
    /// disconnect hook has run.
    pub fn handle(&self, stream: ServerStream) -> JoinHandle<()> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let socket = Arc::clone(&stream.socket);

        if self.is_disposed() {
            socket.close(CloseCode::GoingAway.code(), CloseCode::GoingAway.reason());
        } else {
            self.inner.connections.write().insert(id, Arc::clone(&socket));
        }

        let connection = Connection::new(id, stream, Arc::clone(&self.inner.settings));
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            connection.run().await;
            inner.connections.write().remove(&id);
        })
    }

    /// Serves every connection arriving on `incoming` until the channel
    /// closes or the server is disposed.
    pub fn attach(&self, mut incoming: mpsc::UnboundedReceiver<ServerStream>) -> JoinHandle<()> {
        let server = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();

        tokio::spawn(async move {
            debug!("Attach loop started");
            loop {
                if *shutdown_rx.borrow_and_update() {
                    break;
                }
                tokio::select! {
                    stream = incoming.recv() => match stream {
                        Some(stream) => {
                            server.handle(stream);
                        }
                        None => break,
                    },
                    _ = shutdown_rx.changed() => {}
                }
            }
            debug!("Attach loop terminated");
        })
    }

    /// Accepts WebSocket connections until the server is disposed.
    ///
    /// Each upgrade runs on its own task, so a client stalling the
    /// handshake does not hold up the others. Failed upgrades are logged
    /// and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the listener itself fails.
    pub async fn serve(&self, listener: WsListener) -> Result<()> {
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        info!(url = %listener.ws_url(), "Server listening");

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }
            tokio::select! {
                accepted = listener.accept_tcp() => match accepted {
                    Ok((stream, addr)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            match WsListener::upgrade(stream, addr).await {
                                Ok(stream) => {
                                    server.handle(stream);
                                }
                                Err(e) => warn!(%addr, error = %e, "Connection upgrade failed"),
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        return Err(e);
                    }
                },
                _ = shutdown_rx.changed() => {}
            }
        }

        info!("Server stopped listening");
        Ok(())
    }

    /// Returns the number of live connections.
    #[inline]
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.connections.read().len()
    }

    /// Returns `true` once [`dispose`](Self::dispose) was called.
    #[inline]
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        *self.inner.shutdown_tx.borrow()
    }

    /// Stops accepting and closes every connection with `1001 Going away`.
    ///
    /// Calling it again is a no-op.
    pub fn dispose(&self) {
        if self.inner.shutdown_tx.send_replace(true) {
            return;
        }
        info!("Server shutting down");

        let sockets: Vec<_> = self.inner.connections.read().values().cloned().collect();
        for socket in sockets {
            socket.close(CloseCode::GoingAway.code(), CloseCode::GoingAway.reason());
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

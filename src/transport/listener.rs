//! WebSocket listener for the server engine.
//!
//! # Connection Flow
//!
//! 1. Bind a TCP listener (port 0 picks a random port)
//! 2. Accept a TCP connection
//! 3. Upgrade it, negotiating `graphql-transport-ws` (the server does this
//!    on a task of its own per connection)
//! 4. Hand the [`ServerStream`] to the server engine

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, SocketAddr};

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::error::Result;

use super::{ServerStream, WsServerSocket};

// ============================================================================
// WsListener
// ============================================================================

/// A bound WebSocket listener.
///
/// # Example
///
/// ```ignore
/// use std::net::{IpAddr, Ipv4Addr};
/// use graphql_packet::transport::WsListener;
///
/// let listener = WsListener::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).await?;
/// let url = listener.ws_url();
///
/// let stream = listener.accept().await?;
/// ```
#[derive(Debug)]
pub struct WsListener {
    /// TCP listener for incoming connections.
    listener: TcpListener,
    /// Address the listener is bound to.
    local_addr: SocketAddr,
}

impl WsListener {
    /// Binds to the given address and port.
    ///
    /// Use port 0 to let the OS assign a random available port.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if binding fails.
    pub async fn bind(ip: IpAddr, port: u16) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(ip, port)).await?;
        let local_addr = listener.local_addr()?;

        debug!(%local_addr, "WebSocket listener bound");

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the port the listener is bound to.
    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Returns the local socket address.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the WebSocket URL clients should connect to.
    ///
    /// Format: `ws://{ip}:{port}`
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Accepts the next connection and completes the upgrade.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`](crate::Error::Io) if accepting the TCP connection fails
    /// - [`Error::WebSocket`](crate::Error::WebSocket) if the upgrade fails
    pub async fn accept(&self) -> Result<ServerStream> {
        let (stream, addr) = self.accept_tcp().await?;
        Self::upgrade(stream, addr).await
    }

    /// Accepts the next TCP connection without upgrading it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if accepting fails.
    pub async fn accept_tcp(&self) -> Result<(TcpStream, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await?;
        debug!(%addr, "TCP connection accepted");
        Ok((stream, addr))
    }

    /// Upgrades a connection returned by [`accept_tcp`](Self::accept_tcp).
    ///
    /// # Errors
    ///
    /// Returns [`Error::WebSocket`](crate::Error::WebSocket) if the upgrade fails.
    pub async fn upgrade(stream: TcpStream, addr: SocketAddr) -> Result<ServerStream> {
        let stream = WsServerSocket::accept(stream).await?;
        info!(%addr, "WebSocket connection established");
        Ok(stream)
    }
}

// ============================================================================
// Tests
// ============================================================================

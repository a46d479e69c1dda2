//! GraphQL over WebSocket - `graphql-transport-ws` protocol engine.
//!
//! This library implements both ends of the `graphql-transport-ws`
//! subscription protocol on top of any socket-like transport.
//!
//! # Architecture
//!
//! The crate follows a client-server model:
//!
//! - **Client**: Connects lazily, multiplexes subscriptions, retries
//! - **Server**: Validates the handshake, runs operations, streams results
//!
//! Key design principles:
//!
//! - Each engine is one tokio task owning its socket, timers and state
//! - Public handles talk to the engine over channels
//! - Transports are traits; WebSocket and in-process sockets are built in
//! - Every failure ends in a close code the other side can classify
//!
//! # Quick Start
//!
//! ```no_run
//! use futures_util::StreamExt;
//! use graphql_packet::transport::WsListener;
//! use graphql_packet::{
//!     Client, ClientOptions, ResultStream, Result, Server, ServerOptions, SubscribePayload,
//! };
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let executor = |_payload: SubscribePayload| -> ResultStream {
//!         futures_util::stream::iter([Ok(json!({ "data": { "value": 1 } }))]).boxed()
//!     };
//!     let server = Server::new(ServerOptions::new().executor(executor))?;
//!
//!     let listener = WsListener::bind("127.0.0.1".parse().expect("ip"), 0).await?;
//!     let url = listener.ws_url();
//!     let acceptor = server.clone();
//!     tokio::spawn(async move { acceptor.serve(listener).await });
//!
//!     let client = Client::new(ClientOptions::url(url))?;
//!     let (_subscription, mut events) =
//!         client.subscribe_channel(SubscribePayload::new("{ value }"));
//!
//!     while let Some(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!
//!     client.dispose();
//!     server.dispose();
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | [`Client`] engine, options, events, subscriptions |
//! | [`server`] | [`Server`] engine, options, executor, hooks |
//! | [`protocol`] | Wire messages and close codes |
//! | [`transport`] | Socket traits, WebSocket and virtual transports |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |

// ============================================================================
// Modules
// ============================================================================

/// Client engine.
///
/// Use [`Client::new`] with [`ClientOptions`] to create a client.
pub mod client;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
pub mod identifiers;

/// Wire protocol messages and close codes.
pub mod protocol;

/// Server engine.
///
/// Use [`Server::new`] with [`ServerOptions`] to create a server.
pub mod server;

/// Socket adapters.
pub mod transport;

mod timer;

// ============================================================================
// Re-exports
// ============================================================================

// Client types
pub use client::{
    Client, ClientEvent, ClientEventKind, ClientOptions, Subscription, SubscriptionEvent,
    SubscriptionSink,
};

// Server types
pub use server::{
    ConnectionContext, Executor, HookError, OperationError, ResultStream, Server, ServerHooks,
    ServerOptions,
};

// Protocol types
pub use protocol::{CloseCode, CloseEvent, Message, MessageType, Payload, SubscribePayload};

// Error types
pub use error::{Error, Result, SubscriptionError};

// Identifier types
pub use identifiers::{ListenerId, OperationId};

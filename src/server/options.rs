//! Server configuration, executor and lifecycle hooks.
//!
//! # Example
//!
//! ```ignore
//! use graphql_packet::server::{Server, ServerOptions};
//!
//! let server = Server::new(
//!     ServerOptions::new()
//!         .executor(MyExecutor)
//!         .hooks(MyHooks)
//!         .keep_alive(Duration::from_secs(30)),
//! )?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::{Value, json};
use thiserror::Error;

use crate::error::{Error, Result};
use crate::identifiers::OperationId;
use crate::protocol::{CloseEvent, Payload, SubscribePayload};

// ============================================================================
// Constants
// ============================================================================

/// Default time a socket may stay open without sending `connection_init`.
pub const DEFAULT_CONNECTION_INIT_WAIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default interval between transport pings.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(12);

// ============================================================================
// Types
// ============================================================================

/// Results produced by an operation, each either a result object or a failure.
pub type ResultStream = BoxStream<'static, std::result::Result<Value, OperationError>>;

// ============================================================================
// Errors
// ============================================================================

/// Failure of a single operation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OperationError {
    /// GraphQL errors, reported to the client as an `error` message for the
    /// operation only.
    #[error("Operation failed with {} error(s)", .0.len())]
    Errors(Vec<Value>),

    /// Unexpected failure; closes the whole connection with `4500`.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OperationError {
    /// Creates a single GraphQL error with the given message.
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self::Errors(vec![json!({ "message": message })])
    }

    /// Creates an internal error.
    #[inline]
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

/// Failure of the connection init hook.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HookError {
    /// The handshake is refused; closes with `4403`.
    #[error("Connection rejected: {0}")]
    Rejected(String),

    /// The hook failed unexpectedly; closes with `4500`.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ============================================================================
// ConnectionContext
// ============================================================================

/// Per-connection data handed to the executor and hooks.
#[derive(Debug, Clone, Default)]
pub struct ConnectionContext {
    /// Id of the connection, unique within its server.
    pub connection_id: u64,
    /// Payload of the `connection_init` message.
    pub connection_params: Option<Payload>,
    /// Whether `connection_ack` was sent.
    pub acknowledged: bool,
}

impl ConnectionContext {
    /// Creates the context of a fresh connection.
    #[inline]
    #[must_use]
    pub fn new(connection_id: u64) -> Self {
        Self {
            connection_id,
            ..Self::default()
        }
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Runs operations.
///
/// The returned stream is polled on its own task; every item becomes a
/// `next` message, and the end of the stream a `complete`.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// Starts the operation `id`.
    ///
    /// # Errors
    ///
    /// Returns an [`OperationError`] if the operation cannot start.
    async fn execute(
        &self,
        context: &ConnectionContext,
        id: &OperationId,
        payload: SubscribePayload,
    ) -> std::result::Result<ResultStream, OperationError>;
}

#[async_trait]
impl<F> Executor for F
where
    F: Fn(SubscribePayload) -> ResultStream + Send + Sync + 'static,
{
    async fn execute(
        &self,
        _context: &ConnectionContext,
        _id: &OperationId,
        payload: SubscribePayload,
    ) -> std::result::Result<ResultStream, OperationError> {
        Ok(self(payload))
    }
}

// ============================================================================
// ServerHooks
// ============================================================================

/// Connection lifecycle hooks. Every method has a permissive default.
#[async_trait]
pub trait ServerHooks: Send + Sync + 'static {
    /// Decides whether to acknowledge a `connection_init`.
    ///
    /// `Ok(payload)` acknowledges, optionally with an ack payload.
    async fn on_connect(
        &self,
        _context: &ConnectionContext,
    ) -> std::result::Result<Option<Payload>, HookError> {
        Ok(None)
    }

    /// Called before an operation is executed.
    async fn on_operation(
        &self,
        _context: &ConnectionContext,
        _id: &OperationId,
        _payload: &SubscribePayload,
    ) -> std::result::Result<(), OperationError> {
        Ok(())
    }

    /// Called once an operation is finished, failed or cancelled.
    async fn on_complete(&self, _context: &ConnectionContext, _id: &OperationId) {}

    /// Called once when the socket has closed.
    async fn on_disconnect(&self, _context: &ConnectionContext, _event: &CloseEvent) {}
}

/// Hooks that accept everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl ServerHooks for DefaultHooks {}

// ============================================================================
// ServerOptions
// ============================================================================

/// Builder for [`Server`](super::Server) configuration.
#[derive(Clone)]
pub struct ServerOptions {
    executor: Option<Arc<dyn Executor>>,
    hooks: Arc<dyn ServerHooks>,
    connection_init_wait_timeout: Duration,
    keep_alive: Option<Duration>,
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("executor", &self.executor.is_some())
            .field("connection_init_wait_timeout", &self.connection_init_wait_timeout)
            .field("keep_alive", &self.keep_alive)
            .finish_non_exhaustive()
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            executor: None,
            hooks: Arc::new(DefaultHooks),
            connection_init_wait_timeout: DEFAULT_CONNECTION_INIT_WAIT_TIMEOUT,
            keep_alive: Some(DEFAULT_KEEP_ALIVE),
        }
    }
}

impl ServerOptions {
    /// Creates options with defaults and no executor.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the operation executor. Required.
    #[inline]
    #[must_use]
    pub fn executor(mut self, executor: impl Executor) -> Self {
        self.executor = Some(Arc::new(executor));
        self
    }

    /// Sets the lifecycle hooks.
    #[inline]
    #[must_use]
    pub fn hooks(mut self, hooks: impl ServerHooks) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Sets how long a socket may stay open before `connection_init`.
    #[inline]
    #[must_use]
    pub fn connection_init_wait_timeout(mut self, timeout: Duration) -> Self {
        self.connection_init_wait_timeout = timeout;
        self
    }

    /// Sets the transport ping interval, or disables pings with `None`.
    #[inline]
    #[must_use]
    pub fn keep_alive(mut self, interval: impl Into<Option<Duration>>) -> Self {
        self.keep_alive = interval.into();
        self
    }

    /// Validates the options.
    pub(crate) fn build(self) -> Result<ServerSettings> {
        let executor = self.executor.ok_or_else(|| {
            Error::config(
                "An executor is required. Use .executor() to set it.\n\
                 Example: ServerOptions::new().executor(my_executor)",
            )
        })?;

        if self.connection_init_wait_timeout.is_zero() {
            return Err(Error::config("connection_init_wait_timeout must be positive"));
        }

        if self.keep_alive.is_some_and(|interval| interval.is_zero()) {
            return Err(Error::config(
                "keep_alive must be positive. Use .keep_alive(None) to disable it.",
            ));
        }

        Ok(ServerSettings {
            executor,
            hooks: self.hooks,
            connection_init_wait_timeout: self.connection_init_wait_timeout,
            keep_alive: self.keep_alive,
        })
    }
}

/// Validated server configuration shared by all connections.
pub(crate) struct ServerSettings {
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) hooks: Arc<dyn ServerHooks>,
    pub(crate) connection_init_wait_timeout: Duration,
    pub(crate) keep_alive: Option<Duration>,
}

// ============================================================================
// Tests
// ============================================================================

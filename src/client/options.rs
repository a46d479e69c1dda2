//! Client configuration.
//!
//! # Example
//!
//! ```ignore
//! use graphql_packet::client::{Client, ClientOptions};
//!
//! let client = Client::new(
//!     ClientOptions::url("ws://localhost:4000/graphql")
//!         .retry_attempts(10)
//!         .keep_alive(Duration::from_secs(10))
//!         .connection_params(params),
//! )?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, ready};
use tracing::error;

use crate::error::{Error, Result, SubscriptionError};
use crate::identifiers::OperationId;
use crate::protocol::{Message, Payload, parse_message, stringify_message};
use crate::transport::{ClientStream, SocketFactory, WsClientSocket};

use super::events::{ClientEvent, ClientEventKind, Listener};
use super::retry::{default_retry_wait, default_should_retry};

// ============================================================================
// Constants
// ============================================================================

/// Default number of reconnect attempts before failing subscribers.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 5;

/// Default delay before closing an idle lazy connection.
pub const DEFAULT_LAZY_CLOSE_TIMEOUT: Duration = Duration::ZERO;

// ============================================================================
// Callback types
// ============================================================================

/// Waits before reconnect attempt `retries` (zero based).
pub type RetryWaitFn = Arc<dyn Fn(u32) -> BoxFuture<'static, ()> + Send + Sync>;

/// Decides whether a non-fatal problem is worth a reconnect.
pub type ShouldRetryFn = Arc<dyn Fn(&SubscriptionError) -> bool + Send + Sync>;

/// Produces the `connection_init` payload for each connect.
pub type ConnectionParamsFn =
    Arc<dyn Fn() -> BoxFuture<'static, std::result::Result<Option<Payload>, String>> + Send + Sync>;

/// Generates operation ids.
pub type GenerateIdFn = Arc<dyn Fn() -> OperationId + Send + Sync>;

/// Encodes outgoing messages.
pub type SerializerFn = Arc<dyn Fn(&Message) -> Result<String> + Send + Sync>;

/// Decodes incoming frames.
pub type DeserializerFn = Arc<dyn Fn(&str) -> Result<Message> + Send + Sync>;

/// Receives fatal problems of an eager client.
pub type NonLazyErrorFn = Arc<dyn Fn(&SubscriptionError) + Send + Sync>;

// ============================================================================
// ClientOptions
// ============================================================================

/// Builder for [`Client`](super::Client) configuration.
#[derive(Clone)]
pub struct ClientOptions {
    factory: Arc<dyn SocketFactory>,
    url: Option<String>,
    lazy: bool,
    lazy_close_timeout: Duration,
    retry_attempts: u32,
    retry_wait: RetryWaitFn,
    should_retry: ShouldRetryFn,
    keep_alive: Option<Duration>,
    disable_pong: bool,
    connection_params: Option<ConnectionParamsFn>,
    connection_ack_wait_timeout: Option<Duration>,
    generate_id: GenerateIdFn,
    serializer: SerializerFn,
    deserializer: DeserializerFn,
    on_non_lazy_error: NonLazyErrorFn,
    listeners: Vec<(ClientEventKind, Listener)>,
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("url", &self.url)
            .field("lazy", &self.lazy)
            .field("lazy_close_timeout", &self.lazy_close_timeout)
            .field("retry_attempts", &self.retry_attempts)
            .field("keep_alive", &self.keep_alive)
            .field("disable_pong", &self.disable_pong)
            .field("connection_ack_wait_timeout", &self.connection_ack_wait_timeout)
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

impl ClientOptions {
    /// Creates options that open sockets through `factory`.
    #[must_use]
    pub fn new(factory: impl SocketFactory + 'static) -> Self {
        Self {
            factory: Arc::new(factory),
            url: None,
            lazy: true,
            lazy_close_timeout: DEFAULT_LAZY_CLOSE_TIMEOUT,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_wait: Arc::new(default_retry_wait),
            should_retry: Arc::new(default_should_retry),
            keep_alive: None,
            disable_pong: false,
            connection_params: None,
            connection_ack_wait_timeout: None,
            generate_id: Arc::new(OperationId::generate),
            serializer: Arc::new(stringify_message),
            deserializer: Arc::new(parse_message),
            on_non_lazy_error: Arc::new(|problem: &SubscriptionError| {
                error!(error = %problem, "Connection failed");
            }),
            listeners: Vec::new(),
        }
    }

    /// Creates options that connect to a WebSocket URL.
    ///
    /// The URL is validated by [`Client::new`](super::Client::new).
    #[must_use]
    pub fn url(url: impl Into<String>) -> Self {
        let url = url.into();
        let target = url.clone();
        let mut options =
            Self::new(move || -> Result<ClientStream> { WsClientSocket::connect(&target) });
        options.url = Some(url);
        options
    }

    /// Connects on first subscribe and disconnects when idle (default), or
    /// connects immediately and stays connected.
    #[inline]
    #[must_use]
    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    /// Sets how long an idle lazy connection stays open.
    #[inline]
    #[must_use]
    pub fn lazy_close_timeout(mut self, timeout: Duration) -> Self {
        self.lazy_close_timeout = timeout;
        self
    }

    /// Sets how many consecutive reconnects are attempted. Zero disables
    /// retrying.
    #[inline]
    #[must_use]
    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Sets the wait before each reconnect.
    #[must_use]
    pub fn retry_wait<F, Fut>(mut self, wait: F) -> Self
    where
        F: Fn(u32) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.retry_wait = Arc::new(move |retries| wait(retries).boxed());
        self
    }

    /// Sets the predicate deciding whether a problem is retried.
    #[must_use]
    pub fn should_retry(
        mut self,
        predicate: impl Fn(&SubscriptionError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_retry = Arc::new(predicate);
        self
    }

    /// Sends a `ping` message this long after each `pong`.
    #[inline]
    #[must_use]
    pub fn keep_alive(mut self, interval: impl Into<Option<Duration>>) -> Self {
        self.keep_alive = interval.into();
        self
    }

    /// Stops answering server `ping` messages.
    #[inline]
    #[must_use]
    pub fn disable_pong(mut self, disable: bool) -> Self {
        self.disable_pong = disable;
        self
    }

    /// Sends a fixed `connection_init` payload.
    #[must_use]
    pub fn connection_params(mut self, params: Payload) -> Self {
        self.connection_params =
            Some(Arc::new(move || ready(Ok::<_, String>(Some(params.clone()))).boxed()));
        self
    }

    /// Computes the `connection_init` payload on every connect.
    ///
    /// An `Err` closes the socket with `4005`.
    #[must_use]
    pub fn connection_params_with<F, Fut>(mut self, params: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Option<Payload>, String>> + Send + 'static,
    {
        self.connection_params = Some(Arc::new(move || params().boxed()));
        self
    }

    /// Closes with `4504` if no `connection_ack` arrives in time.
    #[inline]
    #[must_use]
    pub fn connection_ack_wait_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.connection_ack_wait_timeout = timeout.into();
        self
    }

    /// Sets the operation id generator.
    #[must_use]
    pub fn generate_id(mut self, generate: impl Fn() -> OperationId + Send + Sync + 'static) -> Self {
        self.generate_id = Arc::new(generate);
        self
    }

    /// Sets the outgoing message encoder.
    #[must_use]
    pub fn serializer(
        mut self,
        serializer: impl Fn(&Message) -> Result<String> + Send + Sync + 'static,
    ) -> Self {
        self.serializer = Arc::new(serializer);
        self
    }

    /// Sets the incoming frame decoder.
    #[must_use]
    pub fn deserializer(
        mut self,
        deserializer: impl Fn(&str) -> Result<Message> + Send + Sync + 'static,
    ) -> Self {
        self.deserializer = Arc::new(deserializer);
        self
    }

    /// Sets the handler for fatal problems of an eager client.
    #[must_use]
    pub fn on_non_lazy_error(
        mut self,
        handler: impl Fn(&SubscriptionError) + Send + Sync + 'static,
    ) -> Self {
        self.on_non_lazy_error = Arc::new(handler);
        self
    }

    /// Registers a listener before the client starts.
    #[must_use]
    pub fn on(
        mut self,
        kind: ClientEventKind,
        listener: impl Fn(&ClientEvent) + Send + Sync + 'static,
    ) -> Self {
        self.listeners.push((kind, Arc::new(listener)));
        self
    }

    /// Validates the options.
    pub(crate) fn build(self) -> Result<(ClientSettings, Vec<(ClientEventKind, Listener)>)> {
        if let Some(url) = &self.url {
            let parsed = url::Url::parse(url)
                .map_err(|e| Error::config(format!("Invalid WebSocket URL '{url}': {e}")))?;
            if !matches!(parsed.scheme(), "ws" | "wss") {
                return Err(Error::config(format!(
                    "Unsupported URL scheme '{}', expected ws or wss",
                    parsed.scheme()
                )));
            }
        }

        if self.keep_alive.is_some_and(|interval| interval.is_zero()) {
            return Err(Error::config(
                "keep_alive must be positive. Use .keep_alive(None) to disable it.",
            ));
        }

        if self.connection_ack_wait_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(Error::config(
                "connection_ack_wait_timeout must be positive. Use None to wait forever.",
            ));
        }

        let settings = ClientSettings {
            factory: self.factory,
            lazy: self.lazy,
            lazy_close_timeout: self.lazy_close_timeout,
            retry_attempts: self.retry_attempts,
            retry_wait: self.retry_wait,
            should_retry: self.should_retry,
            keep_alive: self.keep_alive,
            disable_pong: self.disable_pong,
            connection_params: self.connection_params,
            connection_ack_wait_timeout: self.connection_ack_wait_timeout,
            generate_id: self.generate_id,
            serializer: self.serializer,
            deserializer: self.deserializer,
            on_non_lazy_error: self.on_non_lazy_error,
        };
        Ok((settings, self.listeners))
    }
}

/// Validated client configuration.
pub(crate) struct ClientSettings {
    pub(crate) factory: Arc<dyn SocketFactory>,
    pub(crate) lazy: bool,
    pub(crate) lazy_close_timeout: Duration,
    pub(crate) retry_attempts: u32,
    pub(crate) retry_wait: RetryWaitFn,
    pub(crate) should_retry: ShouldRetryFn,
    pub(crate) keep_alive: Option<Duration>,
    pub(crate) disable_pong: bool,
    pub(crate) connection_params: Option<ConnectionParamsFn>,
    pub(crate) connection_ack_wait_timeout: Option<Duration>,
    pub(crate) generate_id: GenerateIdFn,
    pub(crate) serializer: SerializerFn,
    pub(crate) deserializer: DeserializerFn,
    pub(crate) on_non_lazy_error: NonLazyErrorFn,
}

impl ClientSettings {
    /// Starts computing the `connection_init` payload.
    pub(crate) fn connection_params(
        &self,
    ) -> BoxFuture<'static, std::result::Result<Option<Payload>, String>> {
        match &self.connection_params {
            Some(params) => params(),
            None => ready(Ok(None)).boxed(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

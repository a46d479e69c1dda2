//! Client handle.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{Error, Result};
use crate::identifiers::ListenerId;
use crate::protocol::SubscribePayload;

use super::engine::{Command, Engine};
use super::events::{ClientEvent, ClientEventKind, Listeners};
use super::options::{ClientOptions, ClientSettings};
use super::subscriber::{Subscriber, Subscription, SubscriptionEvent, SubscriptionSink};

// ============================================================================
// Client
// ============================================================================

/// Protocol client.
///
/// Owns a background engine task that manages the connection. Cheap to
/// clone; clones share the engine. The engine stops after
/// [`dispose`](Self::dispose), or once every client and subscription handle
/// is dropped.
///
/// # Example
///
/// ```ignore
/// let client = Client::new(ClientOptions::url("ws://localhost:4000/graphql"))?;
///
/// let (subscription, mut events) =
///     client.subscribe_channel(SubscribePayload::new("subscription { greetings }"));
///
/// while let Some(event) = events.recv().await {
///     println!("{event:?}");
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    command_tx: mpsc::UnboundedSender<Command>,
    settings: Arc<ClientSettings>,
    listeners: Arc<Listeners>,
    disposed: Arc<AtomicBool>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Creates a client and starts its engine.
    ///
    /// An eager client (`lazy(false)`) starts connecting right away.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the options are invalid
    /// - [`Error::Config`] if called outside a tokio runtime
    pub fn new(options: ClientOptions) -> Result<Self> {
        let (settings, initial_listeners) = options.build()?;

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::config("Client must be created inside a tokio runtime"))?;

        let listeners = Arc::new(Listeners::default());
        for (kind, listener) in initial_listeners {
            listeners.add(kind, listener);
        }

        let settings = Arc::new(settings);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let engine = Engine::new(Arc::clone(&settings), Arc::clone(&listeners), command_rx);
        runtime.spawn(engine.run());

        debug!("Client created");

        Ok(Self {
            command_tx,
            settings,
            listeners,
            disposed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Starts a subscription delivering into `sink`.
    ///
    /// If the client is already disposed the sink is completed immediately.
    pub fn subscribe(
        &self,
        payload: SubscribePayload,
        sink: impl SubscriptionSink,
    ) -> Subscription {
        let id = (self.settings.generate_id)();
        let disposed = Arc::new(AtomicBool::new(false));

        let subscriber = Subscriber {
            id: id.clone(),
            payload,
            sink: Box::new(sink),
            disposed: Arc::clone(&disposed),
        };

        if let Err(mpsc::error::SendError(command)) =
            self.command_tx.send(Command::Subscribe(subscriber))
            && let Command::Subscribe(mut subscriber) = command
        {
            subscriber.finish();
            subscriber.sink.complete();
        }

        Subscription::new(id, disposed, self.command_tx.clone())
    }

    /// Starts a subscription delivering into a channel.
    pub fn subscribe_channel(
        &self,
        payload: SubscribePayload,
    ) -> (Subscription, mpsc::UnboundedReceiver<SubscriptionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.subscribe(payload, tx), rx)
    }

    /// Returns the number of live subscribers. Zero once the engine has
    /// stopped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelClosed`] if the engine stops while answering.
    pub async fn subscriber_count(&self) -> Result<usize> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.command_tx.send(Command::SubscriberCount(reply_tx)).is_err() {
            return Ok(0);
        }
        Ok(reply_rx.await?)
    }

    /// Registers a listener for one kind of event.
    pub fn on(
        &self,
        kind: ClientEventKind,
        listener: impl Fn(&ClientEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.listeners.add(kind, Arc::new(listener))
    }

    /// Removes a listener. Returns `false` if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Drops the socket without a close handshake.
    ///
    /// The close is reported as `4499 Terminated` and handled like any
    /// other unexpected close, including retries.
    pub fn terminate(&self) {
        let _ = self.command_tx.send(Command::Terminate);
    }

    /// Completes every subscription, closes the socket with `1000` and
    /// stops the engine. Calling it again is a no-op.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.command_tx.send(Command::Dispose);
    }

    /// Returns `true` once [`dispose`](Self::dispose) was called.
    #[inline]
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Client engine task.
//!
//! The engine owns the socket, the subscriber map and every timer. Public
//! handles reach it through [`Command`]s; everything else arrives as socket
//! events or timer expiries on the same `select!` loop.
//!
//! # States
//!
//! ```text
//! Idle ──subscribe──► Connecting ──opened──► Handshaking ──ack──► Ready
//!   ▲                     ▲                                         │
//!   │                     └──────────── Retrying ◄──── close ───────┤
//!   └──────────────────── lazy close / fatal ◄──────────────────────┘
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::future::pending;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::error::{SubscriptionError, panic_message};
use crate::identifiers::OperationId;
use crate::protocol::{CloseCode, CloseEvent, Message, Payload, limit_close_reason};
use crate::timer::TimerSlot;
use crate::transport::{ClientSocket, ReadyState, SocketEvent, SocketEvents};

use super::events::{ClientEvent, Listeners};
use super::options::ClientSettings;
use super::retry::{Decision, RetryPolicy};
use super::subscriber::Subscriber;

// ============================================================================
// Types
// ============================================================================

/// Pending `connection_init` payload computation.
type ParamsFuture = BoxFuture<'static, std::result::Result<Option<Payload>, String>>;

// ============================================================================
// Command
// ============================================================================

/// Requests from the public handles.
pub(crate) enum Command {
    /// Register a subscriber.
    Subscribe(Subscriber),
    /// Stop a subscriber.
    Unsubscribe(OperationId),
    /// Report the number of live subscribers.
    SubscriberCount(oneshot::Sender<usize>),
    /// Drop the socket and handle it like an abnormal close.
    Terminate,
    /// Complete everything and stop.
    Dispose,
}

// ============================================================================
// Engine
// ============================================================================

pub(crate) struct Engine {
    settings: Arc<ClientSettings>,
    listeners: Arc<Listeners>,
    policy: RetryPolicy,
    command_rx: mpsc::UnboundedReceiver<Command>,
    /// Every client and subscription handle is gone.
    handles_dropped: bool,

    socket: Option<Box<dyn ClientSocket>>,
    events: Option<SocketEvents>,
    acknowledged: bool,
    /// Incoming frames are ignored after a bad response.
    reading: bool,

    subscribers: IndexMap<OperationId, Subscriber>,
    retries: u32,
    retrying: bool,
    disposed: bool,

    params: Option<ParamsFuture>,
    retry_wait: Option<BoxFuture<'static, ()>>,
    ack_timer: TimerSlot,
    keep_alive_timer: TimerSlot,
    lazy_close_timer: TimerSlot,
}

impl Engine {
    pub(crate) fn new(
        settings: Arc<ClientSettings>,
        listeners: Arc<Listeners>,
        command_rx: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let policy = RetryPolicy {
            attempts: settings.retry_attempts,
            should_retry: Arc::clone(&settings.should_retry),
        };
        Self {
            settings,
            listeners,
            policy,
            command_rx,
            handles_dropped: false,
            socket: None,
            events: None,
            acknowledged: false,
            reading: true,
            subscribers: IndexMap::new(),
            retries: 0,
            retrying: false,
            disposed: false,
            params: None,
            retry_wait: None,
            ack_timer: TimerSlot::default(),
            keep_alive_timer: TimerSlot::default(),
            lazy_close_timer: TimerSlot::default(),
        }
    }

    /// Runs until disposed and the socket has closed.
    pub(crate) async fn run(mut self) {
        debug!(lazy = self.settings.lazy, "Client engine started");

        if !self.settings.lazy {
            self.connect();
        }

        loop {
            if self.disposed && self.socket.is_none() {
                break;
            }

            tokio::select! {
                command = self.command_rx.recv(), if !self.handles_dropped => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        self.handles_dropped = true;
                        self.dispose();
                    }
                },

                event = next_event(&mut self.events) => self.handle_socket_event(event),

                result = resolve(&mut self.params) => {
                    self.params = None;
                    self.send_init(result);
                }

                () = resolve(&mut self.retry_wait) => {
                    self.retry_wait = None;
                    self.after_retry_wait();
                }

                () = self.ack_timer.fired() => {
                    self.close_socket(CloseCode::ConnectionAcknowledgementTimeout, None);
                }

                () = self.keep_alive_timer.fired() => self.send_keep_alive(),

                () = self.lazy_close_timer.fired() => {
                    if self.locks() == 0 {
                        self.close_socket(CloseCode::NormalClosure, None);
                    }
                }
            }
        }

        debug!("Client engine stopped");
    }

    // ========================================================================
    // Commands
    // ========================================================================

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Subscribe(subscriber) => self.subscribe(subscriber),
            Command::Unsubscribe(id) => self.unsubscribe(&id),
            Command::SubscriberCount(reply) => {
                let _ = reply.send(self.subscribers.len());
            }
            Command::Terminate => self.terminate(),
            Command::Dispose => self.dispose(),
        }
    }

    fn subscribe(&mut self, mut subscriber: Subscriber) {
        if self.disposed {
            subscriber.finish();
            subscriber.sink.complete();
            return;
        }

        debug!(id = %subscriber.id, "Subscribing");
        self.lazy_close_timer.cancel();

        let message = Message::subscribe(subscriber.id.clone(), subscriber.payload.clone());
        self.subscribers.insert(subscriber.id.clone(), subscriber);

        if self.is_ready() {
            self.send(&message);
        } else {
            self.ensure_connecting();
        }
    }

    fn unsubscribe(&mut self, id: &OperationId) {
        let Some(mut subscriber) = self.subscribers.shift_remove(id) else {
            return;
        };
        debug!(%id, "Unsubscribing");

        if self.is_ready() {
            self.send(&Message::complete(id.clone()));
        }
        subscriber.finish();
        self.guard_sink(|| subscriber.sink.complete());
        self.release();
    }

    fn terminate(&mut self) {
        let Some(socket) = self.socket.take() else {
            return;
        };
        debug!("Terminating socket");
        socket.terminate();
        self.events = None;
        self.handle_closed(CloseEvent::terminated());
    }

    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        debug!(subscribers = self.subscribers.len(), "Disposing client");
        self.disposed = true;

        self.retry_wait = None;
        self.params = None;
        self.ack_timer.cancel();
        self.keep_alive_timer.cancel();
        self.lazy_close_timer.cancel();

        for (_, mut subscriber) in self.subscribers.drain(..) {
            subscriber.finish();
            let _ = catch_unwind(AssertUnwindSafe(|| subscriber.sink.complete()));
        }

        self.close_socket(CloseCode::NormalClosure, None);
    }

    // ========================================================================
    // Connection
    // ========================================================================

    /// Number of parties that need a connection.
    fn locks(&self) -> usize {
        self.subscribers.len() + usize::from(!self.settings.lazy)
    }

    fn is_ready(&self) -> bool {
        self.acknowledged
            && self
                .socket
                .as_ref()
                .is_some_and(|socket| socket.ready_state() == ReadyState::Open)
    }

    /// Starts connecting unless a socket or retry is already under way.
    ///
    /// A closing socket is left alone: its close is classified and the
    /// reconnect happens from there.
    fn ensure_connecting(&mut self) {
        if self.retry_wait.is_some() || self.socket.is_some() {
            return;
        }
        self.connect();
    }

    fn connect(&mut self) {
        let is_retry = self.retrying;
        debug!(is_retry, retries = self.retries, "Connecting");
        self.emit(&ClientEvent::Connecting { is_retry });

        match self.settings.factory.create() {
            Ok(stream) => {
                self.socket = Some(stream.socket);
                self.events = Some(stream.events);
                self.acknowledged = false;
                self.reading = true;
            }
            Err(e) => {
                warn!(error = %e, "Failed to create socket");
                self.emit(&ClientEvent::Error(e.to_string()));
                self.handle_problem(SubscriptionError::Connection(e.to_string()));
            }
        }
    }

    fn send_init(&mut self, result: std::result::Result<Option<Payload>, String>) {
        if !self
            .socket
            .as_ref()
            .is_some_and(|socket| socket.ready_state() == ReadyState::Open)
        {
            return;
        }

        match result {
            Ok(payload) => {
                self.send(&Message::connection_init(payload));
                if let Some(timeout) = self.settings.connection_ack_wait_timeout {
                    self.ack_timer.arm(timeout);
                }
            }
            Err(message) => {
                warn!(%message, "Connection params failed");
                self.emit(&ClientEvent::Error(message.clone()));
                self.close_socket(CloseCode::InternalClientError, Some(&message));
            }
        }
    }

    fn send_keep_alive(&mut self) {
        if !self.is_ready() {
            return;
        }
        self.send(&Message::ping(None));
        self.emit(&ClientEvent::Ping {
            received: false,
            payload: None,
        });
    }

    /// Starts the lazy close once nobody needs the connection.
    fn release(&mut self) {
        if self.locks() > 0 || self.socket.is_none() {
            return;
        }
        if self.settings.lazy_close_timeout.is_zero() {
            self.close_socket(CloseCode::NormalClosure, None);
        } else {
            self.lazy_close_timer.arm(self.settings.lazy_close_timeout);
        }
    }

    fn close_socket(&mut self, code: CloseCode, reason: Option<&str>) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        if socket.ready_state().is_terminal() {
            return;
        }
        let reason = match reason {
            Some(reason) => limit_close_reason(reason, code.reason()),
            None => code.reason().to_owned(),
        };
        debug!(code = code.code(), %reason, "Closing socket");
        socket.close(code.code(), &reason);
    }

    // ========================================================================
    // Socket events
    // ========================================================================

    fn handle_socket_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Opened => {
                debug!("Socket opened");
                self.emit(&ClientEvent::Opened);
                self.params = Some(self.settings.connection_params());
            }
            SocketEvent::Message(text) => {
                if self.reading {
                    self.handle_text(&text);
                }
            }
            SocketEvent::Error(message) => {
                warn!(%message, "Socket error");
                self.emit(&ClientEvent::Error(message));
            }
            SocketEvent::Closed(event) => {
                self.socket = None;
                self.events = None;
                self.handle_closed(event);
            }
            SocketEvent::Ping(_) | SocketEvent::Pong(_) => {}
        }
    }

    fn handle_text(&mut self, text: &str) {
        trace!(%text, "Message received");

        let message = match (self.settings.deserializer)(text) {
            Ok(message) => message,
            Err(e) => {
                self.bad_response(&e.to_string());
                return;
            }
        };

        if let Some(panic) = self.listeners.emit(&ClientEvent::Message(message.clone())) {
            self.internal_error(&panic);
            return;
        }

        match message {
            Message::Ping { payload } => {
                self.emit(&ClientEvent::Ping {
                    received: true,
                    payload: payload.clone(),
                });
                if !self.settings.disable_pong {
                    self.send(&Message::pong(payload.clone()));
                    self.emit(&ClientEvent::Pong {
                        received: false,
                        payload,
                    });
                }
            }
            Message::Pong { payload } => {
                self.emit(&ClientEvent::Pong {
                    received: true,
                    payload,
                });
                if let Some(interval) = self.settings.keep_alive
                    && self.acknowledged
                {
                    self.keep_alive_timer.arm(interval);
                }
            }
            Message::ConnectionAck { payload } if !self.acknowledged => self.handle_ack(payload),
            other if !self.acknowledged => {
                let reason = format!("First message cannot be of type {}", other.message_type());
                self.bad_response(&reason);
            }
            Message::Next { id, payload } => self.route_next(&id, payload),
            Message::Error { id, payload } => {
                self.finish_subscriber(&id, Some(SubscriptionError::Graphql(payload)));
            }
            Message::Complete { id } => self.finish_subscriber(&id, None),
            other => trace!(kind = %other.message_type(), "Ignoring message"),
        }
    }

    fn handle_ack(&mut self, payload: Option<Payload>) {
        self.ack_timer.cancel();
        self.acknowledged = true;

        let was_retry = self.retrying;
        self.retrying = false;
        self.retries = 0;
        debug!(was_retry, subscribers = self.subscribers.len(), "Connection acknowledged");

        self.emit(&ClientEvent::Connected { payload, was_retry });

        let messages: Vec<Message> = self
            .subscribers
            .values()
            .map(|subscriber| Message::subscribe(subscriber.id.clone(), subscriber.payload.clone()))
            .collect();
        for message in &messages {
            self.send(message);
        }

        if let Some(interval) = self.settings.keep_alive {
            self.keep_alive_timer.arm(interval);
        }
    }

    fn route_next(&mut self, id: &OperationId, value: Value) {
        let Some(subscriber) = self.subscribers.get_mut(id) else {
            trace!(%id, "Next for unknown subscriber");
            return;
        };
        let result = catch_unwind(AssertUnwindSafe(|| subscriber.sink.next(value)));
        if let Err(panic) = result {
            self.internal_error(&panic_message(panic.as_ref()));
        }
    }

    /// Removes a subscriber after the server finished it.
    fn finish_subscriber(&mut self, id: &OperationId, error: Option<SubscriptionError>) {
        let Some(mut subscriber) = self.subscribers.shift_remove(id) else {
            trace!(%id, "Result for unknown subscriber");
            return;
        };
        subscriber.finish();
        self.guard_sink(|| match error {
            Some(error) => subscriber.sink.error(error),
            None => subscriber.sink.complete(),
        });
        self.release();
    }

    // ========================================================================
    // Close handling
    // ========================================================================

    fn handle_closed(&mut self, event: CloseEvent) {
        debug!(%event, "Socket closed");
        self.acknowledged = false;
        self.params = None;
        self.ack_timer.cancel();
        self.keep_alive_timer.cancel();
        self.lazy_close_timer.cancel();

        self.emit(&ClientEvent::Closed(event.clone()));
        self.handle_problem(SubscriptionError::Closed(event));
    }

    fn handle_problem(&mut self, problem: SubscriptionError) {
        let locks = self.locks();
        if locks == 0 {
            trace!(%problem, "Connection problem with nobody waiting");
            return;
        }

        match self.policy.decide(&problem, self.disposed, self.retries, locks) {
            Decision::Fatal => self.fail_all(problem),
            Decision::Stop => {}
            Decision::Reconnect => self.connect(),
            Decision::Wait => {
                debug!(retries = self.retries, %problem, "Waiting to reconnect");
                self.retrying = true;
                self.retry_wait = Some((self.settings.retry_wait)(self.retries));
            }
        }
    }

    fn after_retry_wait(&mut self) {
        if self.locks() == 0 {
            debug!("Nobody left to reconnect for");
            self.retries = 0;
            self.retrying = false;
            return;
        }
        self.retries += 1;
        self.connect();
    }

    /// Reports a fatal problem to every subscriber.
    fn fail_all(&mut self, problem: SubscriptionError) {
        warn!(%problem, subscribers = self.subscribers.len(), "Connection failed");
        self.retries = 0;
        self.retrying = false;

        for (_, mut subscriber) in self.subscribers.drain(..) {
            subscriber.finish();
            let error = problem.clone();
            let _ = catch_unwind(AssertUnwindSafe(|| subscriber.sink.error(error)));
        }

        if !self.settings.lazy {
            (self.settings.on_non_lazy_error)(&problem);
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn send(&self, message: &Message) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        match (self.settings.serializer)(message) {
            Ok(text) => {
                trace!(%text, "Sending message");
                if let Err(e) = socket.send(text) {
                    debug!(error = %e, "Send failed");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode message"),
        }
    }

    fn emit(&mut self, event: &ClientEvent) {
        if let Some(panic) = self.listeners.emit(event) {
            debug!(%panic, "Listener panicked");
        }
    }

    /// Runs sink code, turning a panic into an internal error.
    fn guard_sink(&mut self, call: impl FnOnce()) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(call)) {
            self.internal_error(&panic_message(panic.as_ref()));
        }
    }

    fn bad_response(&mut self, reason: &str) {
        warn!(%reason, "Bad response from server");
        self.reading = false;
        self.emit(&ClientEvent::Error(reason.to_owned()));
        self.close_socket(CloseCode::BadResponse, Some(reason));
    }

    fn internal_error(&mut self, reason: &str) {
        warn!(%reason, "Internal client error");
        self.reading = false;
        self.emit(&ClientEvent::Error(reason.to_owned()));
        self.close_socket(CloseCode::InternalClientError, Some(reason));
    }
}

// ============================================================================
// Select helpers
// ============================================================================

/// Next event of the current socket; never resolves without one.
async fn next_event(events: &mut Option<SocketEvents>) -> SocketEvent {
    match events.as_mut() {
        Some(events) => events.recv().await.unwrap_or_else(|| {
            SocketEvent::Closed(CloseEvent::unclean(CloseCode::Abnormal.code(), ""))
        }),
        None => pending().await,
    }
}

/// Output of a pending future slot; never resolves while empty.
///
/// The caller must clear the slot once this resolves.
async fn resolve<T>(slot: &mut Option<BoxFuture<'static, T>>) -> T {
    match slot.as_mut() {
        Some(future) => future.await,
        None => pending().await,
    }
}

//! Per-connection event loop.
//!
//! One task per accepted socket owns the connection state and processes,
//! one at a time, socket events, operation results and timer expiries.
//!
//! # States
//!
//! ```text
//! AwaitingInit ──connection_init──► Acknowledged ──close──► Closed
//!      │                                                      ▲
//!      └──────────────── timeout / violation ─────────────────┘
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::{FutureExt, StreamExt};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, panic_message};
use crate::identifiers::OperationId;
use crate::protocol::{
    CloseCode, CloseEvent, Message, Payload, SubscribePayload, limit_close_reason,
    parse_message, stringify_message,
};
use crate::timer::TimerSlot;
use crate::transport::{ServerSocket, ServerStream, SocketEvent, SocketEvents};

use super::options::{
    ConnectionContext, Executor, HookError, OperationError, ServerHooks, ServerSettings,
};

// ============================================================================
// Operation
// ============================================================================

/// A running operation.
#[derive(Debug)]
struct Operation {
    /// Sequence number, distinguishes reused ids.
    seq: u64,
    /// Cancels the producer task.
    abort: AbortHandle,
}

/// Output of an operation's producer task.
#[derive(Debug)]
enum OperationOutput {
    Next(Value),
    Failed(OperationError),
    Complete,
}

/// Producer output tagged with its origin.
#[derive(Debug)]
struct OperationEvent {
    id: OperationId,
    seq: u64,
    output: OperationOutput,
}

// ============================================================================
// Connection
// ============================================================================

/// State of one server-side connection.
pub(crate) struct Connection {
    socket: Arc<dyn ServerSocket>,
    events: SocketEvents,
    settings: Arc<ServerSettings>,
    context: Arc<ConnectionContext>,

    init_received: bool,
    closing: bool,
    operations: FxHashMap<OperationId, Operation>,
    next_seq: u64,
    output_tx: mpsc::UnboundedSender<OperationEvent>,
    output_rx: mpsc::UnboundedReceiver<OperationEvent>,

    init_timer: TimerSlot,
    keep_alive_timer: TimerSlot,
    pong_timer: TimerSlot,
}

impl Connection {
    pub(crate) fn new(id: u64, stream: ServerStream, settings: Arc<ServerSettings>) -> Self {
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        Self {
            socket: stream.socket,
            events: stream.events,
            settings,
            context: Arc::new(ConnectionContext::new(id)),
            init_received: false,
            closing: false,
            operations: FxHashMap::default(),
            next_seq: 0,
            output_tx,
            output_rx,
            init_timer: TimerSlot::default(),
            keep_alive_timer: TimerSlot::default(),
            pong_timer: TimerSlot::default(),
        }
    }

    /// Runs until the socket reports `Closed`.
    pub(crate) async fn run(mut self) {
        let id = self.context.connection_id;
        debug!(connection = id, "Connection started");

        self.init_timer
            .arm(self.settings.connection_init_wait_timeout);

        let closed = loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(SocketEvent::Closed(event)) => break event,
                    Some(event) => self.handle_socket_event(event).await,
                    None => break CloseEvent::unclean(CloseCode::Abnormal.code(), ""),
                },

                Some(event) = self.output_rx.recv() => {
                    self.handle_operation_event(event).await;
                }

                () = self.init_timer.fired() => {
                    if !self.context.acknowledged {
                        self.close(CloseCode::ConnectionInitialisationTimeout, None);
                    }
                }

                () = self.keep_alive_timer.fired() => self.handle_keep_alive(),

                () = self.pong_timer.fired() => {
                    warn!(connection = id, "Pong not received in time");
                    self.close(CloseCode::Abnormal, None);
                }
            }
        };

        debug!(connection = id, event = %closed, "Connection closed");
        self.shutdown();
        let outcome = guarded(self.settings.hooks.on_disconnect(&self.context, &closed)).await;
        if let Err(message) = outcome {
            error!(connection = id, %message, "Disconnect hook panicked");
        }
    }

    // ========================================================================
    // Socket events
    // ========================================================================

    async fn handle_socket_event(&mut self, event: SocketEvent) {
        if self.closing {
            return;
        }
        match event {
            SocketEvent::Message(text) => self.handle_text(&text).await,
            SocketEvent::Pong(_) => self.pong_timer.cancel(),
            SocketEvent::Error(message) => {
                warn!(connection = self.context.connection_id, %message, "Socket error");
            }
            SocketEvent::Opened | SocketEvent::Ping(_) | SocketEvent::Closed(_) => {}
        }
    }

    async fn handle_text(&mut self, text: &str) {
        trace!(connection = self.context.connection_id, %text, "Message received");

        let message = match parse_message(text) {
            Ok(message) => message,
            Err(Error::BadMessage { message }) => {
                self.close(CloseCode::BadRequest, Some(&message));
                return;
            }
            Err(e) => {
                self.close(CloseCode::BadRequest, Some(&e.to_string()));
                return;
            }
        };

        match message {
            Message::ConnectionInit { payload } => self.handle_init(payload).await,
            Message::Ping { payload } => self.send(&Message::pong(payload)),
            Message::Pong { .. } => {}
            Message::Subscribe { id, payload } => self.handle_subscribe(id, payload),
            Message::Complete { id } => self.handle_complete(&id).await,
            other @ (Message::ConnectionAck { .. } | Message::Next { .. } | Message::Error { .. }) => {
                let reason = format!("Unexpected message of type {} received", other.message_type());
                self.close(CloseCode::BadRequest, Some(&reason));
            }
        }
    }

    async fn handle_init(&mut self, payload: Option<Payload>) {
        if self.init_received {
            self.close(CloseCode::TooManyInitialisationRequests, None);
            return;
        }
        self.init_received = true;

        let mut context = (*self.context).clone();
        context.connection_params = payload;
        self.context = Arc::new(context);

        let result = match guarded(self.settings.hooks.on_connect(&self.context)).await {
            Ok(result) => result,
            Err(message) => Err(HookError::Internal(message)),
        };
        if !self.socket.is_open() {
            return;
        }

        match result {
            Ok(ack_payload) => {
                let mut context = (*self.context).clone();
                context.acknowledged = true;
                self.context = Arc::new(context);

                self.init_timer.cancel();
                self.send(&Message::connection_ack(ack_payload));
                debug!(connection = self.context.connection_id, "Connection acknowledged");

                if let Some(interval) = self.settings.keep_alive {
                    self.keep_alive_timer.arm(interval);
                }
            }
            Err(HookError::Rejected(message)) => {
                debug!(connection = self.context.connection_id, %message, "Connection rejected");
                self.close(CloseCode::Forbidden, Some(&message));
            }
            Err(HookError::Internal(message)) => {
                warn!(connection = self.context.connection_id, %message, "Connection hook failed");
                self.close(CloseCode::InternalServerError, Some(&message));
            }
        }
    }

    fn handle_subscribe(&mut self, id: OperationId, payload: SubscribePayload) {
        if !self.context.acknowledged {
            self.close(CloseCode::Unauthorized, None);
            return;
        }
        if self.operations.contains_key(&id) {
            let reason = format!("Subscriber for {id} already exists");
            self.close(CloseCode::SubscriberAlreadyExists, Some(&reason));
            return;
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        let task = tokio::spawn(run_producer(
            Arc::clone(&self.settings.executor),
            Arc::clone(&self.settings.hooks),
            Arc::clone(&self.context),
            id.clone(),
            seq,
            payload,
            self.output_tx.clone(),
        ));

        debug!(connection = self.context.connection_id, %id, "Operation started");
        self.operations.insert(
            id,
            Operation {
                seq,
                abort: task.abort_handle(),
            },
        );
    }

    async fn handle_complete(&mut self, id: &OperationId) {
        let Some(operation) = self.operations.remove(id) else {
            trace!(connection = self.context.connection_id, %id, "Complete for unknown operation");
            return;
        };
        operation.abort.abort();
        debug!(connection = self.context.connection_id, %id, "Operation cancelled by client");
        self.completed(id).await;
    }

    /// Runs the completion hook; a panic closes the connection.
    async fn completed(&mut self, id: &OperationId) {
        let outcome = guarded(self.settings.hooks.on_complete(&self.context, id)).await;
        if let Err(message) = outcome {
            error!(connection = self.context.connection_id, %id, %message, "Complete hook panicked");
            self.close(CloseCode::InternalServerError, Some(&message));
        }
    }

    // ========================================================================
    // Operation events
    // ========================================================================

    async fn handle_operation_event(&mut self, event: OperationEvent) {
        if self.closing {
            return;
        }
        let live = self
            .operations
            .get(&event.id)
            .is_some_and(|operation| operation.seq == event.seq);
        if !live {
            trace!(id = %event.id, seq = event.seq, "Dropping stale operation output");
            return;
        }

        match event.output {
            OperationOutput::Next(result) => self.send(&Message::next(event.id, result)),
            OperationOutput::Failed(OperationError::Errors(errors)) => {
                self.operations.remove(&event.id);
                self.send(&Message::error(event.id.clone(), errors));
                self.completed(&event.id).await;
            }
            OperationOutput::Failed(OperationError::Internal(message)) => {
                warn!(id = %event.id, %message, "Operation failed internally");
                self.close(CloseCode::InternalServerError, Some(&message));
            }
            OperationOutput::Complete => {
                self.operations.remove(&event.id);
                self.send(&Message::complete(event.id.clone()));
                self.completed(&event.id).await;
            }
        }
    }

    // ========================================================================
    // Keep-alive
    // ========================================================================

    fn handle_keep_alive(&mut self) {
        let Some(interval) = self.settings.keep_alive else {
            return;
        };
        if !self.socket.is_open() {
            return;
        }
        if !self.pong_timer.is_armed() {
            self.pong_timer.arm(interval);
            self.socket.ping(Vec::new());
        }
        self.keep_alive_timer.arm(interval);
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn send(&self, message: &Message) {
        match stringify_message(message) {
            Ok(text) => {
                if let Err(e) = self.socket.send(text) {
                    debug!(connection = self.context.connection_id, error = %e, "Send failed");
                }
            }
            Err(e) => warn!(connection = self.context.connection_id, error = %e, "Failed to encode message"),
        }
    }

    /// Closes the socket and drops every operation without telling the peer.
    fn close(&mut self, code: CloseCode, reason: Option<&str>) {
        if self.closing {
            return;
        }
        let reason = match reason {
            Some(reason) => limit_close_reason(reason, code.reason()),
            None => code.reason().to_owned(),
        };
        debug!(connection = self.context.connection_id, code = code.code(), %reason, "Closing connection");
        self.closing = true;
        self.shutdown();
        self.socket.close(code.code(), &reason);
    }

    fn shutdown(&mut self) {
        self.init_timer.cancel();
        self.keep_alive_timer.cancel();
        self.pong_timer.cancel();
        for (_, operation) in self.operations.drain() {
            operation.abort.abort();
        }
    }
}

// ============================================================================
// Producer
// ============================================================================

/// Awaits hook or executor code, turning a panic into its message.
async fn guarded<T>(future: impl Future<Output = T>) -> std::result::Result<T, String> {
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .map_err(|panic| panic_message(panic.as_ref()))
}

/// Runs one operation and forwards its output to the connection loop.
///
/// A panic anywhere in the operation is reported as an internal failure.
async fn run_producer(
    executor: Arc<dyn Executor>,
    hooks: Arc<dyn ServerHooks>,
    context: Arc<ConnectionContext>,
    id: OperationId,
    seq: u64,
    payload: SubscribePayload,
    output_tx: mpsc::UnboundedSender<OperationEvent>,
) {
    let emit = |output| {
        let _ = output_tx.send(OperationEvent {
            id: id.clone(),
            seq,
            output,
        });
    };

    let produced = guarded(produce(&*executor, &*hooks, &context, &id, payload, &emit)).await;
    if let Err(message) = produced {
        warn!(connection = context.connection_id, %id, %message, "Operation panicked");
        emit(OperationOutput::Failed(OperationError::Internal(message)));
    }
}

async fn produce(
    executor: &dyn Executor,
    hooks: &dyn ServerHooks,
    context: &ConnectionContext,
    id: &OperationId,
    payload: SubscribePayload,
    emit: &(dyn Fn(OperationOutput) + Send + Sync),
) {
    if let Err(e) = hooks.on_operation(context, id, &payload).await {
        emit(OperationOutput::Failed(e));
        return;
    }

    let mut results = match executor.execute(context, id, payload).await {
        Ok(results) => results,
        Err(e) => {
            emit(OperationOutput::Failed(e));
            return;
        }
    };

    while let Some(result) = results.next().await {
        match result {
            Ok(value) => emit(OperationOutput::Next(value)),
            Err(e) => {
                emit(OperationOutput::Failed(e));
                return;
            }
        }
    }

    emit(OperationOutput::Complete);
}

//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream;
use graphql_packet::protocol::{parse_message, stringify_message};
use graphql_packet::transport::{ClientStream, ServerStream, SocketEvent, VirtualServer};
use graphql_packet::{
    ClientOptions, CloseEvent, Message, OperationError, Result, ResultStream, Server,
    ServerOptions, SubscribePayload, SubscriptionEvent,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;

/// Installs a test log subscriber once. Honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Executors
// ============================================================================

/// `{ value }` resolves to three results, then completes.
pub fn counting_executor(_payload: SubscribePayload) -> ResultStream {
    stream::iter((1..=3).map(|value| Ok(json!({ "data": { "value": value } })))).boxed()
}

/// Never yields and never completes.
pub fn pending_executor(_payload: SubscribePayload) -> ResultStream {
    stream::pending().boxed()
}

/// Fails every operation with one GraphQL error.
pub fn failing_executor(_payload: SubscribePayload) -> ResultStream {
    stream::iter([Err(OperationError::message("boom"))]).boxed()
}

/// Result object carrying `value`.
pub fn value(value: i64) -> Value {
    json!({ "data": { "value": value } })
}

// ============================================================================
// Servers
// ============================================================================

/// A protocol server attached to a fresh virtual transport.
pub fn start_server(options: ServerOptions) -> (Server, Arc<VirtualServer>) {
    init_tracing();
    let server = Server::new(options).expect("server options");
    let transport = Arc::new(VirtualServer::new());
    server.attach(transport.incoming().expect("incoming"));
    (server, transport)
}

/// Client options connecting through `transport`, counting connects.
pub fn virtual_client(transport: &Arc<VirtualServer>) -> (ClientOptions, Arc<AtomicUsize>) {
    let connects = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connects);
    let transport = Arc::clone(transport);
    let options = ClientOptions::new(move || -> Result<ClientStream> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(transport.create_stream())
    });
    (options, connects)
}

/// Instant reconnects.
pub fn no_wait(options: ClientOptions) -> ClientOptions {
    options.retry_wait(|_| async {})
}

// ============================================================================
// Raw peers
// ============================================================================

/// A protocol peer driven by hand from the client side.
pub struct RawClient {
    pub stream: ClientStream,
}

impl RawClient {
    /// Connects and waits until the socket is open.
    pub async fn open(transport: &VirtualServer) -> Self {
        let mut stream = transport.create_stream();
        assert_eq!(stream.events.recv().await, Some(SocketEvent::Opened));
        Self { stream }
    }

    /// Connects, sends `connection_init` and waits for the ack.
    pub async fn acknowledged(transport: &VirtualServer) -> Self {
        let mut client = Self::open(transport).await;
        client.send_message(&Message::connection_init(None));
        assert_eq!(client.recv().await, Message::connection_ack(None));
        client
    }

    pub fn send_text(&self, text: &str) {
        self.stream.socket.send(text.to_owned()).expect("socket open");
    }

    pub fn send_message(&self, message: &Message) {
        self.send_text(&stringify_message(message).expect("valid message"));
    }

    pub fn subscribe(&self, id: &str, query: &str) {
        self.send_message(&Message::subscribe(id.into(), SubscribePayload::new(query)));
    }

    /// Next protocol message, skipping transport pings.
    pub async fn recv(&mut self) -> Message {
        loop {
            match self.stream.events.recv().await {
                Some(SocketEvent::Message(text)) => {
                    return parse_message(&text).expect("valid message");
                }
                Some(SocketEvent::Ping(_) | SocketEvent::Pong(_)) => {}
                other => panic!("expected a message, got {other:?}"),
            }
        }
    }

    /// Waits for the close, skipping everything else.
    pub async fn closed(&mut self) -> CloseEvent {
        loop {
            match self.stream.events.recv().await {
                Some(SocketEvent::Closed(event)) => return event,
                Some(_) => {}
                None => panic!("event stream ended without a close"),
            }
        }
    }
}

/// A protocol peer driven by hand from the server side.
pub struct RawServer {
    pub stream: ServerStream,
}

impl RawServer {
    /// Waits for the next connection.
    pub async fn accept(incoming: &mut mpsc::UnboundedReceiver<ServerStream>) -> Self {
        let stream = incoming.recv().await.expect("connection");
        Self { stream }
    }

    /// Waits for the next connection and acknowledges its handshake.
    pub async fn handshake(incoming: &mut mpsc::UnboundedReceiver<ServerStream>) -> Self {
        let mut server = Self::accept(incoming).await;
        assert!(matches!(server.recv().await, Message::ConnectionInit { .. }));
        server.send_message(&Message::connection_ack(None));
        server
    }

    pub fn send_text(&self, text: &str) {
        self.stream.socket.send(text.to_owned()).expect("socket open");
    }

    pub fn send_message(&self, message: &Message) {
        self.send_text(&stringify_message(message).expect("valid message"));
    }

    /// Next protocol message, skipping transport frames.
    pub async fn recv(&mut self) -> Message {
        loop {
            match self.stream.events.recv().await {
                Some(SocketEvent::Message(text)) => {
                    return parse_message(&text).expect("valid message");
                }
                Some(SocketEvent::Ping(_) | SocketEvent::Pong(_) | SocketEvent::Opened) => {}
                other => panic!("expected a message, got {other:?}"),
            }
        }
    }

    /// Waits for the close, skipping everything else.
    pub async fn closed(&mut self) -> CloseEvent {
        loop {
            match self.stream.events.recv().await {
                Some(SocketEvent::Closed(event)) => return event,
                Some(_) => {}
                None => panic!("event stream ended without a close"),
            }
        }
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// Collects events until the terminal one.
pub async fn drain(events: &mut mpsc::UnboundedReceiver<SubscriptionEvent>) -> Vec<SubscriptionEvent> {
    let mut collected = Vec::new();
    while let Some(event) = events.recv().await {
        let terminal = !matches!(event, SubscriptionEvent::Next(_));
        collected.push(event);
        if terminal {
            break;
        }
    }
    collected
}

/// Lets spawned tasks and virtual sockets make progress.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

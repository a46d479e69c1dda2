//! Client engine against scripted and real servers.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::{
    RawServer, counting_executor, drain, no_wait, pending_executor, settle, start_server, value,
    virtual_client,
};
use graphql_packet::transport::{ClientStream, ServerStream, VirtualServer};
use graphql_packet::{
    Client, ClientEvent, ClientEventKind, ClientOptions, CloseEvent, Error, Message, OperationId,
    Payload, Result, ServerOptions, SubscribePayload, SubscriptionError, SubscriptionEvent,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;

fn refused() -> Result<ClientStream> {
    Err(Error::connection("refused"))
}

/// Records every event of `kind` into a channel.
fn watch(options: ClientOptions, kind: ClientEventKind) -> (ClientOptions, mpsc::UnboundedReceiver<ClientEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let options = options.on(kind, move |event: &ClientEvent| {
        let _ = tx.send(event.clone());
    });
    (options, rx)
}

fn sequential_ids(options: ClientOptions) -> ClientOptions {
    let next = AtomicUsize::new(1);
    options.generate_id(move || OperationId::new(next.fetch_add(1, Ordering::SeqCst).to_string()))
}

fn scripted() -> (Arc<VirtualServer>, mpsc::UnboundedReceiver<ServerStream>) {
    common::init_tracing();
    let transport = Arc::new(VirtualServer::new());
    let incoming = transport.incoming().expect("incoming");
    (transport, incoming)
}

// ============================================================================
// End to end
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_subscription_receives_results_and_completes() {
    let (_server, transport) = start_server(ServerOptions::new().executor(counting_executor));
    let (options, _) = virtual_client(&transport);
    let client = Client::new(options).expect("client");

    let (subscription, mut events) = client.subscribe_channel(SubscribePayload::new("{ value }"));
    assert_eq!(
        drain(&mut events).await,
        vec![
            SubscriptionEvent::Next(value(1)),
            SubscriptionEvent::Next(value(2)),
            SubscriptionEvent::Next(value(3)),
            SubscriptionEvent::Complete,
        ]
    );
    assert!(subscription.is_disposed());

    settle().await;
    assert_eq!(transport.connection_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_connection_params_sent_with_init() {
    let (transport, mut incoming) = scripted();
    let mut params = Payload::new();
    params.insert("token".into(), json!("secret"));

    let (options, _) = virtual_client(&transport);
    let client = Client::new(options.connection_params(params.clone())).expect("client");
    let _subscription = client.subscribe_channel(SubscribePayload::new("{ value }"));

    let mut server = RawServer::accept(&mut incoming).await;
    assert_eq!(server.recv().await, Message::connection_init(Some(params)));
}

#[tokio::test(start_paused = true)]
async fn test_failing_connection_params_close_4005() {
    let (transport, mut incoming) = scripted();
    let (options, _) = virtual_client(&transport);
    let client = Client::new(
        options
            .retry_attempts(0)
            .connection_params_with(|| async { Err::<Option<Payload>, _>("no token".to_owned()) }),
    )
    .expect("client");
    let (_subscription, mut events) = client.subscribe_channel(SubscribePayload::new("{ value }"));

    let mut server = RawServer::accept(&mut incoming).await;
    assert_eq!(server.closed().await, CloseEvent::new(4005, "no token"));
    assert_eq!(
        drain(&mut events).await,
        vec![SubscriptionEvent::Error(SubscriptionError::Closed(CloseEvent::new(
            4005, "no token"
        )))]
    );
}

// ============================================================================
// Lazy and eager connections
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_lazy_client_connects_on_first_subscribe() {
    let (_server, transport) = start_server(ServerOptions::new().executor(pending_executor));
    let (options, connects) = virtual_client(&transport);
    let client = Client::new(options).expect("client");

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(connects.load(Ordering::SeqCst), 0);

    let (subscription, _events) = client.subscribe_channel(SubscribePayload::new("{ value }"));
    settle().await;
    assert_eq!(connects.load(Ordering::SeqCst), 1);
    assert_eq!(client.subscriber_count().await.expect("count"), 1);

    subscription.dispose();
    settle().await;
    assert_eq!(transport.connection_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_lazy_close_timeout_keeps_connection_for_next_subscriber() {
    let (_server, transport) = start_server(ServerOptions::new().executor(counting_executor));
    let (options, connects) = virtual_client(&transport);
    let client =
        Client::new(options.lazy_close_timeout(Duration::from_secs(1))).expect("client");

    let (_first, mut events) = client.subscribe_channel(SubscribePayload::new("{ value }"));
    assert_eq!(drain(&mut events).await.len(), 4);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(transport.connection_count(), 1);

    let (_second, mut events) = client.subscribe_channel(SubscribePayload::new("{ value }"));
    assert_eq!(drain(&mut events).await.len(), 4);
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(transport.connection_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_eager_client_connects_immediately() {
    let (_server, transport) = start_server(ServerOptions::new().executor(counting_executor));
    let (options, _) = virtual_client(&transport);
    let (options, mut connected) = watch(options.lazy(false), ClientEventKind::Connected);
    let client = Client::new(options).expect("client");

    assert_eq!(
        connected.recv().await,
        Some(ClientEvent::Connected {
            payload: None,
            was_retry: false
        })
    );
    assert_eq!(client.subscriber_count().await.expect("count"), 0);
    assert_eq!(transport.connection_count(), 1);
}

// ============================================================================
// Dispose and terminate
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_dispose_completes_subscribers_and_closes_normally() {
    let (transport, mut incoming) = scripted();
    let (options, _) = virtual_client(&transport);
    let client = Client::new(options).expect("client");

    let (_subscription, mut events) = client.subscribe_channel(SubscribePayload::new("{ value }"));
    let mut server = RawServer::handshake(&mut incoming).await;
    assert!(matches!(server.recv().await, Message::Subscribe { .. }));

    client.dispose();
    client.dispose();

    assert_eq!(drain(&mut events).await, vec![SubscriptionEvent::Complete]);
    assert_eq!(server.closed().await, CloseEvent::new(1000, "Normal Closure"));
    assert!(matches!(
        client.subscriber_count().await,
        Ok(0) | Err(Error::ChannelClosed(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_terminate_reports_4499() {
    let (_server, transport) = start_server(ServerOptions::new().executor(pending_executor));
    let (options, _) = virtual_client(&transport);
    let (options, mut closed) = watch(options.retry_attempts(0), ClientEventKind::Closed);
    let (options, mut connected) = watch(options, ClientEventKind::Connected);
    let client = Client::new(options).expect("client");

    let (_subscription, mut events) = client.subscribe_channel(SubscribePayload::new("{ value }"));
    assert!(connected.recv().await.is_some());

    client.terminate();
    let terminated = CloseEvent::unclean(4499, "Terminated");
    assert_eq!(closed.recv().await, Some(ClientEvent::Closed(terminated.clone())));
    assert_eq!(
        drain(&mut events).await,
        vec![SubscriptionEvent::Error(SubscriptionError::Closed(terminated))]
    );
}

// ============================================================================
// Subscribe and unsubscribe
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_sends_complete() {
    let (transport, mut incoming) = scripted();
    let (options, _) = virtual_client(&transport);
    let client = Client::new(sequential_ids(options)).expect("client");

    let (subscription, mut events) = client.subscribe_channel(SubscribePayload::new("{ value }"));
    let _other = client.subscribe_channel(SubscribePayload::new("{ other }"));
    let mut server = RawServer::handshake(&mut incoming).await;
    assert!(matches!(server.recv().await, Message::Subscribe { .. }));
    assert!(matches!(server.recv().await, Message::Subscribe { .. }));

    subscription.dispose();
    assert_eq!(server.recv().await, Message::complete("1".into()));
    assert_eq!(drain(&mut events).await, vec![SubscriptionEvent::Complete]);
    assert_eq!(client.subscriber_count().await.expect("count"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_server_error_fails_only_that_subscription() {
    let (transport, mut incoming) = scripted();
    let (options, _) = virtual_client(&transport);
    let client = Client::new(sequential_ids(options)).expect("client");

    let (_failing, mut failing) = client.subscribe_channel(SubscribePayload::new("{ a }"));
    let (_healthy, mut healthy) = client.subscribe_channel(SubscribePayload::new("{ b }"));
    let mut server = RawServer::handshake(&mut incoming).await;
    server.recv().await;
    server.recv().await;

    let errors = vec![json!({ "message": "boom" })];
    server.send_message(&Message::error("1".into(), errors.clone()));
    server.send_message(&Message::next("2".into(), value(7)));

    assert_eq!(
        drain(&mut failing).await,
        vec![SubscriptionEvent::Error(SubscriptionError::Graphql(errors))]
    );
    assert_eq!(healthy.recv().await, Some(SubscriptionEvent::Next(value(7))));
}

// ============================================================================
// Handshake failures
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_first_message_must_be_ack() {
    let (transport, mut incoming) = scripted();
    let (options, _) = virtual_client(&transport);
    let client = Client::new(options.retry_attempts(0)).expect("client");
    let (_subscription, mut events) = client.subscribe_channel(SubscribePayload::new("{ value }"));

    let mut server = RawServer::accept(&mut incoming).await;
    server.recv().await;
    server.send_message(&Message::next("1".into(), value(1)));

    let expected = CloseEvent::new(4004, "First message cannot be of type next");
    assert_eq!(server.closed().await, expected);
    assert_eq!(
        drain(&mut events).await,
        vec![SubscriptionEvent::Error(SubscriptionError::Closed(expected))]
    );
}

#[tokio::test(start_paused = true)]
async fn test_missing_ack_closes_4504() {
    let (transport, mut incoming) = scripted();
    let (options, _) = virtual_client(&transport);
    let client = Client::new(
        options
            .retry_attempts(0)
            .connection_ack_wait_timeout(Duration::from_secs(1)),
    )
    .expect("client");
    let (_subscription, mut events) = client.subscribe_channel(SubscribePayload::new("{ value }"));

    let mut server = RawServer::accept(&mut incoming).await;
    assert!(matches!(server.recv().await, Message::ConnectionInit { .. }));

    let expected = CloseEvent::new(4504, "Connection acknowledgement timeout");
    assert_eq!(server.closed().await, expected);
    assert_eq!(
        drain(&mut events).await,
        vec![SubscriptionEvent::Error(SubscriptionError::Closed(expected))]
    );
}

#[tokio::test(start_paused = true)]
async fn test_panicking_message_listener_closes_4005() {
    let (transport, mut incoming) = scripted();
    let (options, _) = virtual_client(&transport);
    let client = Client::new(
        options
            .retry_attempts(0)
            .on(ClientEventKind::Message, |_: &ClientEvent| panic!("listener bug")),
    )
    .expect("client");
    let _subscription = client.subscribe_channel(SubscribePayload::new("{ value }"));

    let mut server = RawServer::handshake(&mut incoming).await;
    assert_eq!(server.closed().await, CloseEvent::new(4005, "listener bug"));
}

// ============================================================================
// Retries
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_resubscribes_in_order_after_reconnect() {
    let (transport, mut incoming) = scripted();
    let (options, connects) = virtual_client(&transport);
    let (options, mut connected) = watch(no_wait(sequential_ids(options)), ClientEventKind::Connected);
    let client = Client::new(options).expect("client");

    let first = SubscribePayload::new("subscription { a }");
    let second = SubscribePayload::new("subscription { b }").with_operation_name("B");
    let _a = client.subscribe_channel(first.clone());
    let _b = client.subscribe_channel(second.clone());

    let expected = vec![
        Message::subscribe("1".into(), first),
        Message::subscribe("2".into(), second),
    ];

    let mut server = RawServer::handshake(&mut incoming).await;
    assert_eq!(vec![server.recv().await, server.recv().await], expected);
    server.stream.socket.close(1012, "Service restart");

    let mut server = RawServer::handshake(&mut incoming).await;
    assert_eq!(vec![server.recv().await, server.recv().await], expected);
    assert_eq!(connects.load(Ordering::SeqCst), 2);

    assert!(matches!(
        connected.recv().await,
        Some(ClientEvent::Connected { was_retry: false, .. })
    ));
    assert!(matches!(
        connected.recv().await,
        Some(ClientEvent::Connected { was_retry: true, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_reports_error_once() {
    common::init_tracing();
    let connects = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connects);
    let options = ClientOptions::new(move || -> Result<ClientStream> {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(Error::connection("refused"))
    });
    let client = Client::new(no_wait(options.retry_attempts(3))).expect("client");

    let (_subscription, mut events) = client.subscribe_channel(SubscribePayload::new("{ value }"));
    assert_eq!(
        drain(&mut events).await,
        vec![SubscriptionEvent::Error(SubscriptionError::Connection(
            "Connection failed: refused".into()
        ))]
    );
    settle().await;
    assert!(events.try_recv().is_err());
    assert_eq!(connects.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn test_server_closing_before_ack_exhausts_retries() {
    let (transport, mut incoming) = scripted();
    let (options, connects) = virtual_client(&transport);
    let client = Client::new(no_wait(options).retry_attempts(3)).expect("client");
    let (_subscription, mut events) = client.subscribe_channel(SubscribePayload::new("{ value }"));

    let mut servers = Vec::new();
    for _ in 0..4 {
        let mut server = RawServer::accept(&mut incoming).await;
        assert!(matches!(server.recv().await, Message::ConnectionInit { .. }));
        server.stream.socket.close(1006, "");
        servers.push(server);
    }

    assert!(matches!(
        drain(&mut events).await.as_slice(),
        [SubscriptionEvent::Error(error)] if error.close_code() == Some(1006)
    ));
    settle().await;
    assert!(events.try_recv().is_err());
    assert!(incoming.try_recv().is_err());
    assert_eq!(connects.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn test_subscriber_disposed_during_retry_wait_is_not_resubscribed() {
    let (transport, mut incoming) = scripted();
    let (options, connects) = virtual_client(&transport);
    let options = sequential_ids(options).retry_wait(|_| tokio::time::sleep(Duration::from_secs(1)));
    let client = Client::new(options).expect("client");

    let (first, mut first_events) = client.subscribe_channel(SubscribePayload::new("{ a }"));
    let _second = client.subscribe_channel(SubscribePayload::new("{ b }"));

    let mut server = RawServer::handshake(&mut incoming).await;
    assert!(matches!(server.recv().await, Message::Subscribe { .. }));
    assert!(matches!(server.recv().await, Message::Subscribe { .. }));
    server.stream.socket.close(1012, "Service restart");
    settle().await;

    first.dispose();
    assert_eq!(drain(&mut first_events).await, vec![SubscriptionEvent::Complete]);

    let mut server = RawServer::handshake(&mut incoming).await;
    assert_eq!(
        server.recv().await,
        Message::subscribe("2".into(), SubscribePayload::new("{ b }"))
    );
    server.send_message(&Message::ping(None));
    assert_eq!(server.recv().await, Message::pong(None));
    assert_eq!(connects.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_retry_waits_use_backoff_callback() {
    common::init_tracing();
    let waits = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&waits);
    let options = ClientOptions::new(refused)
        .retry_attempts(2)
        .retry_wait(move |retries| {
            recorded.lock().push(retries);
            tokio::time::sleep(Duration::from_secs(1))
        });
    let client = Client::new(options).expect("client");

    let (_subscription, mut events) = client.subscribe_channel(SubscribePayload::new("{ value }"));
    let started = tokio::time::Instant::now();
    drain(&mut events).await;

    assert_eq!(*waits.lock(), vec![0, 1]);
    assert!(started.elapsed() >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_dispose_during_retry_wait_does_not_reconnect() {
    common::init_tracing();
    let connects = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connects);
    let options = ClientOptions::new(move || -> Result<ClientStream> {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(Error::connection("refused"))
    })
    .retry_wait(|_| tokio::time::sleep(Duration::from_secs(10)));
    let client = Client::new(options).expect("client");

    let (_subscription, mut events) = client.subscribe_channel(SubscribePayload::new("{ value }"));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    client.dispose();
    assert_eq!(drain(&mut events).await, vec![SubscriptionEvent::Complete]);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(connects.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_close_is_not_retried() {
    let (transport, mut incoming) = scripted();
    let (options, connects) = virtual_client(&transport);
    let client = Client::new(no_wait(options)).expect("client");
    let (_subscription, mut events) = client.subscribe_channel(SubscribePayload::new("{ value }"));

    let server = RawServer::handshake(&mut incoming).await;
    server.stream.socket.close(4400, "Bad request");

    assert_eq!(
        drain(&mut events).await,
        vec![SubscriptionEvent::Error(SubscriptionError::Closed(CloseEvent::new(
            4400,
            "Bad request"
        )))]
    );
    settle().await;
    assert_eq!(connects.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_should_retry_can_refuse() {
    let (transport, mut incoming) = scripted();
    let (options, connects) = virtual_client(&transport);
    let client = Client::new(
        no_wait(options).should_retry(|problem: &SubscriptionError| problem.close_code() != Some(1006)),
    )
    .expect("client");
    let (_subscription, mut events) = client.subscribe_channel(SubscribePayload::new("{ value }"));

    let server = RawServer::handshake(&mut incoming).await;
    server.stream.socket.close(1006, "");

    assert!(matches!(
        drain(&mut events).await.as_slice(),
        [SubscriptionEvent::Error(error)] if error.close_code() == Some(1006)
    ));
    assert_eq!(connects.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_eager_fatal_error_reaches_handler() {
    common::init_tracing();
    let failures = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&failures);
    let options = ClientOptions::new(refused)
        .lazy(false)
        .retry_attempts(0)
        .on_non_lazy_error(move |problem: &SubscriptionError| recorded.lock().push(problem.clone()));
    let _client = Client::new(options).expect("client");

    settle().await;
    assert_eq!(
        *failures.lock(),
        vec![SubscriptionError::Connection("Connection failed: refused".into())]
    );
}

// ============================================================================
// Liveness
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_server_ping_is_answered() {
    let (transport, mut incoming) = scripted();
    let (options, _) = virtual_client(&transport);
    let (options, mut pings) = watch(options, ClientEventKind::Ping);
    let (options, mut pongs) = watch(options, ClientEventKind::Pong);
    let client = Client::new(options).expect("client");
    let _subscription = client.subscribe_channel(SubscribePayload::new("{ value }"));

    let mut server = RawServer::handshake(&mut incoming).await;
    server.recv().await;

    server.send_message(&Message::ping(None));
    assert_eq!(server.recv().await, Message::pong(None));
    assert_eq!(
        pings.recv().await,
        Some(ClientEvent::Ping {
            received: true,
            payload: None
        })
    );
    assert_eq!(
        pongs.recv().await,
        Some(ClientEvent::Pong {
            received: false,
            payload: None
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_disable_pong_stays_silent() {
    let (transport, mut incoming) = scripted();
    let (options, _) = virtual_client(&transport);
    let client = Client::new(sequential_ids(options).disable_pong(true)).expect("client");
    let (subscription, _events) = client.subscribe_channel(SubscribePayload::new("{ value }"));

    let mut server = RawServer::handshake(&mut incoming).await;
    server.recv().await;

    server.send_message(&Message::ping(None));
    settle().await;
    subscription.dispose();
    assert_eq!(server.recv().await, Message::complete("1".into()));
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_sends_ping_after_pong() {
    let (transport, mut incoming) = scripted();
    let (options, _) = virtual_client(&transport);
    let client = Client::new(options.keep_alive(Duration::from_secs(1))).expect("client");
    let _subscription = client.subscribe_channel(SubscribePayload::new("{ value }"));

    let mut server = RawServer::handshake(&mut incoming).await;
    server.recv().await;

    let started = tokio::time::Instant::now();
    assert_eq!(server.recv().await, Message::ping(None));
    assert!(started.elapsed() >= Duration::from_secs(1));

    server.send_message(&Message::pong(None));
    assert_eq!(server.recv().await, Message::ping(None));
    assert!(started.elapsed() >= Duration::from_secs(2));
}

// ============================================================================
// Listeners
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_lifecycle_events_in_order() {
    let (_server, transport) = start_server(ServerOptions::new().executor(counting_executor));
    let (options, _) = virtual_client(&transport);
    let events = Arc::new(Mutex::new(Vec::new()));

    let client = Client::new(options).expect("client");
    for kind in [
        ClientEventKind::Connecting,
        ClientEventKind::Opened,
        ClientEventKind::Connected,
        ClientEventKind::Closed,
    ] {
        let events = Arc::clone(&events);
        client.on(kind, move |event: &ClientEvent| events.lock().push(event.kind()));
    }

    let (_subscription, mut results) = client.subscribe_channel(SubscribePayload::new("{ value }"));
    drain(&mut results).await;
    settle().await;

    assert_eq!(
        *events.lock(),
        vec![
            ClientEventKind::Connecting,
            ClientEventKind::Opened,
            ClientEventKind::Connected,
            ClientEventKind::Closed,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_removed_listener_is_not_called() {
    let (_server, transport) = start_server(ServerOptions::new().executor(counting_executor));
    let (options, _) = virtual_client(&transport);
    let client = Client::new(options).expect("client");

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let id = client.on(ClientEventKind::Connecting, move |_: &ClientEvent| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert!(client.off(id));
    assert!(!client.off(id));

    let (_subscription, mut results) = client.subscribe_channel(SubscribePayload::new("{ value }"));
    drain(&mut results).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

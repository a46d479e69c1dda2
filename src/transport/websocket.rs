//! tokio-tungstenite socket adapters.
//!
//! Both adapters hand the stream to a spawned IO task and talk to it through
//! a command channel. The task owns the stream, forwards frames as
//! [`SocketEvent`]s, and always finishes with a single `Closed` event.
//!
//! # Close Handling
//!
//! | Trigger | Reported close |
//! |---------|----------------|
//! | Peer close frame | Peer's code and reason, clean |
//! | Local close, peer echoes | Echoed code and reason, clean |
//! | Local close, no echo in time | Local code and reason, not clean |
//! | Local close with 1005/1006 | Local code, not clean (no frame sent) |
//! | Stream error or EOF | 1006, not clean |

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::protocol::{CloseCode, CloseEvent, GRAPHQL_TRANSPORT_WS_PROTOCOL};

use super::{
    ClientSocket, ClientStream, ReadyState, ServerSocket, ServerStream, SocketEvent,
};

// ============================================================================
// Constants
// ============================================================================

/// How long to wait for the peer to answer a close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

// ============================================================================
// SocketCommand
// ============================================================================

/// Internal commands for the IO task.
#[derive(Debug)]
enum SocketCommand {
    /// Send a text frame.
    Send(String),
    /// Start a close handshake.
    Close { code: u16, reason: String },
    /// Send a ping frame.
    Ping(Vec<u8>),
    /// Send a pong frame.
    Pong(Vec<u8>),
    /// Drop the stream.
    Terminate,
}

// ============================================================================
// Handle
// ============================================================================

/// State shared between a socket handle and its IO task.
#[derive(Debug)]
struct Handle {
    ready_state: Mutex<ReadyState>,
    command_tx: mpsc::UnboundedSender<SocketCommand>,
}

impl Handle {
    fn new(initial: ReadyState) -> (Arc<Self>, mpsc::UnboundedReceiver<SocketCommand>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let handle = Arc::new(Self {
            ready_state: Mutex::new(initial),
            command_tx,
        });
        (handle, command_rx)
    }

    fn ready_state(&self) -> ReadyState {
        *self.ready_state.lock()
    }

    fn set_ready_state(&self, state: ReadyState) {
        *self.ready_state.lock() = state;
    }

    fn send(&self, text: String) -> Result<()> {
        if self.ready_state() != ReadyState::Open {
            return Err(Error::TransportClosed);
        }
        self.command_tx
            .send(SocketCommand::Send(text))
            .map_err(|_| Error::TransportClosed)
    }

    fn close(&self, code: u16, reason: &str) {
        {
            let mut state = self.ready_state.lock();
            if state.is_terminal() {
                return;
            }
            *state = ReadyState::Closing;
        }
        let _ = self.command_tx.send(SocketCommand::Close {
            code,
            reason: reason.to_owned(),
        });
    }

    fn command(&self, command: SocketCommand) {
        if self.ready_state() == ReadyState::Open {
            let _ = self.command_tx.send(command);
        }
    }

    fn terminate(&self) {
        {
            let mut state = self.ready_state.lock();
            if *state == ReadyState::Closed {
                return;
            }
            *state = ReadyState::Closing;
        }
        let _ = self.command_tx.send(SocketCommand::Terminate);
    }
}

// ============================================================================
// WsClientSocket
// ============================================================================

/// Client socket over tokio-tungstenite.
#[derive(Debug)]
pub struct WsClientSocket {
    handle: Arc<Handle>,
}

impl WsClientSocket {
    /// Starts connecting to `url` with the `graphql-transport-ws` subprotocol.
    ///
    /// Must be called inside a tokio runtime. The returned socket is
    /// `Connecting`; the outcome arrives on the event stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the URL is not a `ws://` or `wss://` URL.
    pub fn connect(url: &str) -> Result<ClientStream> {
        let parsed = Url::parse(url)
            .map_err(|e| Error::config(format!("Invalid WebSocket URL '{url}': {e}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(Error::config(format!(
                "Unsupported URL scheme '{}', expected ws or wss",
                parsed.scheme()
            )));
        }

        let mut request = parsed.as_str().into_client_request()?;
        request.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(GRAPHQL_TRANSPORT_WS_PROTOCOL),
        );

        let (handle, mut command_rx) = Handle::new(ReadyState::Connecting);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let task_handle = Arc::clone(&handle);
        tokio::spawn(async move {
            debug!(url = %parsed, "Connecting WebSocket");

            let connected = tokio::select! {
                result = tokio_tungstenite::connect_async(request) => result,
                command = command_rx.recv() => {
                    let event = match command {
                        Some(SocketCommand::Close { code, reason }) => {
                            CloseEvent::unclean(code, reason)
                        }
                        _ => CloseEvent::unclean(CloseCode::Abnormal.code(), ""),
                    };
                    debug!(%event, "WebSocket closed while connecting");
                    task_handle.set_ready_state(ReadyState::Closed);
                    let _ = event_tx.send(SocketEvent::Closed(event));
                    return;
                }
            };

            match connected {
                Ok((stream, _response)) => {
                    {
                        let mut state = task_handle.ready_state.lock();
                        if *state == ReadyState::Connecting {
                            *state = ReadyState::Open;
                        }
                    }
                    debug!(url = %parsed, "WebSocket connected");
                    let _ = event_tx.send(SocketEvent::Opened);
                    run_io_loop(stream, command_rx, event_tx, task_handle).await;
                }
                Err(e) => {
                    warn!(url = %parsed, error = %e, "WebSocket connect failed");
                    task_handle.set_ready_state(ReadyState::Closed);
                    let _ = event_tx.send(SocketEvent::Error(e.to_string()));
                    let _ = event_tx.send(SocketEvent::Closed(CloseEvent::unclean(
                        CloseCode::Abnormal.code(),
                        "",
                    )));
                }
            }
        });

        Ok(ClientStream {
            socket: Box::new(Self { handle }),
            events: event_rx,
        })
    }
}

impl ClientSocket for WsClientSocket {
    fn ready_state(&self) -> ReadyState {
        self.handle.ready_state()
    }

    fn send(&self, text: String) -> Result<()> {
        self.handle.send(text)
    }

    fn close(&self, code: u16, reason: &str) {
        self.handle.close(code, reason);
    }

    fn ping(&self, payload: Vec<u8>) {
        self.handle.command(SocketCommand::Ping(payload));
    }

    fn pong(&self, payload: Vec<u8>) {
        self.handle.command(SocketCommand::Pong(payload));
    }

    fn terminate(&self) {
        self.handle.terminate();
    }
}

// ============================================================================
// WsServerSocket
// ============================================================================

/// Server socket over tokio-tungstenite.
#[derive(Debug)]
pub struct WsServerSocket {
    handle: Arc<Handle>,
}

impl WsServerSocket {
    /// Upgrades an accepted TCP stream.
    ///
    /// A client that does not offer `graphql-transport-ws` is accepted at
    /// the HTTP level and then closed with `4406`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WebSocket`] if the upgrade handshake fails.
    pub async fn accept(stream: TcpStream) -> Result<ServerStream> {
        let peer = stream.peer_addr().ok();
        let negotiated = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&negotiated);
        let callback = move |request: &Request,
                             mut response: Response|
              -> std::result::Result<Response, ErrorResponse> {
            let offered = request
                .headers()
                .get_all(SEC_WEBSOCKET_PROTOCOL)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .flat_map(|value| value.split(','))
                .any(|protocol| protocol.trim() == GRAPHQL_TRANSPORT_WS_PROTOCOL);
            if offered {
                response.headers_mut().insert(
                    SEC_WEBSOCKET_PROTOCOL,
                    HeaderValue::from_static(GRAPHQL_TRANSPORT_WS_PROTOCOL),
                );
                flag.store(true, Ordering::Release);
            }
            Ok(response)
        };

        let stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
        debug!(?peer, "WebSocket connection accepted");

        Ok(Self::from_stream(stream, negotiated.load(Ordering::Acquire)))
    }

    /// Wraps an already upgraded stream.
    ///
    /// If `protocol_accepted` is false the socket is closed with `4406`
    /// right away.
    pub fn from_stream<S>(stream: WebSocketStream<S>, protocol_accepted: bool) -> ServerStream
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (handle, command_rx) = Handle::new(ReadyState::Open);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_io_loop(
            stream,
            command_rx,
            event_tx,
            Arc::clone(&handle),
        ));

        let socket = Arc::new(Self { handle });
        if !protocol_accepted {
            warn!("Client did not offer a supported subprotocol");
            socket.close(
                CloseCode::SubprotocolNotAcceptable.code(),
                CloseCode::SubprotocolNotAcceptable.reason(),
            );
        }

        ServerStream {
            socket,
            events: event_rx,
        }
    }
}

impl ServerSocket for WsServerSocket {
    fn is_open(&self) -> bool {
        self.handle.ready_state() == ReadyState::Open
    }

    fn send(&self, text: String) -> Result<()> {
        self.handle.send(text)
    }

    fn close(&self, code: u16, reason: &str) {
        self.handle.close(code, reason);
    }

    fn ping(&self, payload: Vec<u8>) {
        self.handle.command(SocketCommand::Ping(payload));
    }
}

// ============================================================================
// IO loop
// ============================================================================

/// Pumps frames between the stream and the handle until the connection ends.
async fn run_io_loop<S>(
    stream: WebSocketStream<S>,
    mut command_rx: mpsc::UnboundedReceiver<SocketCommand>,
    event_tx: mpsc::UnboundedSender<SocketEvent>,
    handle: Arc<Handle>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut write, mut read) = stream.split();

    // Close requested locally, waiting for the echo.
    let mut pending_close: Option<CloseEvent> = None;
    let mut close_deadline: Option<Instant> = None;
    // Close frame received from the peer, waiting for EOF.
    let mut received_close: Option<CloseEvent> = None;

    let closed = loop {
        let close_sleep = sleep_until(close_deadline.unwrap_or_else(Instant::now));
        tokio::pin!(close_sleep);

        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Frame::Text(text))) => {
                    trace!(len = text.len(), "Text frame received");
                    let _ = event_tx.send(SocketEvent::Message(text.as_str().to_owned()));
                }
                Some(Ok(Frame::Ping(payload))) => {
                    let _ = event_tx.send(SocketEvent::Ping(payload.to_vec()));
                }
                Some(Ok(Frame::Pong(payload))) => {
                    let _ = event_tx.send(SocketEvent::Pong(payload.to_vec()));
                }
                Some(Ok(Frame::Close(frame))) => {
                    let event = frame.map_or_else(
                        || CloseEvent::new(CloseCode::NoStatus.code(), ""),
                        |frame| CloseEvent::new(u16::from(frame.code), frame.reason.as_str()),
                    );
                    debug!(%event, "Close frame received");
                    handle.set_ready_state(ReadyState::Closing);
                    received_close = Some(event);
                }
                Some(Ok(Frame::Binary(_) | Frame::Frame(_))) => {
                    warn!("Ignoring non-text frame");
                }
                Some(Err(e)) => {
                    if received_close.is_none() && pending_close.is_none() {
                        let _ = event_tx.send(SocketEvent::Error(e.to_string()));
                    }
                    break received_close
                        .or(pending_close.map(|event| CloseEvent { was_clean: false, ..event }))
                        .unwrap_or_else(|| CloseEvent::unclean(CloseCode::Abnormal.code(), ""));
                }
                None => {
                    break received_close
                        .unwrap_or_else(|| CloseEvent::unclean(CloseCode::Abnormal.code(), ""));
                }
            },

            command = command_rx.recv() => match command {
                Some(SocketCommand::Send(text)) => {
                    if let Err(e) = write.send(Frame::Text(text.into())).await {
                        warn!(error = %e, "Failed to send text frame");
                    }
                }
                Some(SocketCommand::Ping(payload)) => {
                    let _ = write.send(Frame::Ping(payload.into())).await;
                }
                Some(SocketCommand::Pong(payload)) => {
                    let _ = write.send(Frame::Pong(payload.into())).await;
                }
                Some(SocketCommand::Close { code, reason }) => {
                    if pending_close.is_some() || received_close.is_some() {
                        continue;
                    }
                    if code == CloseCode::NoStatus.code() || code == CloseCode::Abnormal.code() {
                        debug!(code, "Dropping connection without close frame");
                        break CloseEvent::unclean(code, reason);
                    }
                    let frame = CloseFrame {
                        code: code.into(),
                        reason: reason.clone().into(),
                    };
                    if let Err(e) = write.send(Frame::Close(Some(frame))).await {
                        debug!(error = %e, "Failed to send close frame");
                        break CloseEvent::unclean(code, reason);
                    }
                    pending_close = Some(CloseEvent::new(code, reason));
                    close_deadline = Some(Instant::now() + CLOSE_TIMEOUT);
                }
                Some(SocketCommand::Terminate) | None => {
                    break CloseEvent::unclean(CloseCode::Abnormal.code(), "");
                }
            },

            () = &mut close_sleep, if close_deadline.is_some() => {
                debug!("Peer did not answer close frame in time");
                break pending_close
                    .take()
                    .map(|event| CloseEvent { was_clean: false, ..event })
                    .unwrap_or_else(|| CloseEvent::unclean(CloseCode::Abnormal.code(), ""));
            }
        }
    };

    handle.set_ready_state(ReadyState::Closed);
    debug!(event = %closed, "WebSocket closed");
    let _ = event_tx.send(SocketEvent::Closed(closed));
}

// ============================================================================
// Tests
// ============================================================================

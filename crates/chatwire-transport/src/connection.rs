//! Connection manager for the streaming chat socket.
//!
//! A single driver task owns the WebSocket, the heartbeat interval and the pong
//! deadline. [`ConnectionManager`] is a cloneable handle that talks to it over a
//! command channel, so there is exactly one socket per manager no matter how many
//! clones exist.
//!
//! ```text
//! Closed --connect--> Connecting --open--> Open --close/error--> Closed
//!                                          Open --disconnect--> Closing --close--> Closed
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chatwire_core::ClientType;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::auth::{current_token, TokenProvider};
use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::http::ACCESS_TOKEN_HEADER;
use crate::protocol::{self, FrameError, InboundFrame, OutboundCommand, PING_FRAME};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsResult<T> = std::result::Result<T, tokio_tungstenite::tungstenite::Error>;
type ConnectFuture = Pin<Box<dyn Future<Output = Result<WsStream>> + Send>>;

const CLIENT_TYPE_HEADER: &str = "clienttype";
const CLOSE_REASON: &str = "User closed";
const COMMAND_BUFFER: usize = 32;
const EVENT_BUFFER: usize = 64;

/// Lifecycle state of the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket.
    Closed,
    /// Handshake in progress.
    Connecting,
    /// Socket open, heartbeat running.
    Open,
    /// Close frame sent, waiting for the peer.
    Closing,
}

/// Connectivity signal for UI indicators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The socket opened.
    Opened,
    /// The socket closed, for any reason.
    Closed,
    /// Opening, reading or writing failed.
    Error(String),
    /// No pong arrived in time; the socket is being replaced.
    HeartbeatTimeout,
    /// A new socket is being opened after a heartbeat timeout.
    Reconnecting,
}

enum Command {
    Connect(Option<ClientType>),
    Send {
        text: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

/// State shared between the handle and the driver.
#[derive(Default)]
struct Shared {
    frames: Mutex<Option<mpsc::Sender<InboundFrame>>>,
    last_pong_at: Mutex<Option<DateTime<Utc>>>,
}

/// Handle to the connection driver.
///
/// Cloning is cheap; every clone controls the same socket. The driver stops once
/// the last handle is dropped.
#[derive(Clone)]
pub struct ConnectionManager {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    shared: Arc<Shared>,
    open_timeout: Duration,
    frame_buffer: usize,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create the manager and spawn its driver task. Must be called inside a Tokio
    /// runtime. No socket is opened until [`connect`](Self::connect) or the first send.
    #[must_use]
    pub fn new(config: TransportConfig, tokens: Arc<dyn TokenProvider>) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Closed);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let shared = Arc::new(Shared::default());

        let manager = Self {
            commands: commands_tx,
            state: state_rx,
            events: events.clone(),
            shared: shared.clone(),
            open_timeout: config.open_timeout(),
            frame_buffer: config.frame_buffer.max(1),
        };

        let driver = Driver {
            client_type: config.client_type,
            config,
            tokens,
            commands: commands_rx,
            state: state_tx,
            events,
            shared,
            socket: None,
            connecting: None,
            heartbeat: None,
            pong_deadline: None,
            close_deadline: None,
            disconnect_waiters: Vec::new(),
        };
        tokio::spawn(driver.run());

        manager
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Time the last pong was received.
    #[must_use]
    pub fn last_pong_at(&self) -> Option<DateTime<Utc>> {
        *self.shared.last_pong_at.lock()
    }

    /// Subscribe to connectivity signals.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Register the inbound frame consumer.
    ///
    /// There is only one consumer: registering again closes the previously returned
    /// receiver once it has drained.
    #[must_use]
    pub fn frames(&self) -> mpsc::Receiver<InboundFrame> {
        let (tx, rx) = mpsc::channel(self.frame_buffer);
        if self.shared.frames.lock().replace(tx).is_some() {
            tracing::debug!("Replaced inbound frame consumer");
        }
        rx
    }

    /// Open the socket as `client_type`. No-op unless the connection is `Closed`.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the driver has stopped.
    pub async fn connect(&self, client_type: ClientType) -> Result<()> {
        self.command(Command::Connect(Some(client_type))).await
    }

    /// Wait until the socket is open, opening it if necessary.
    ///
    /// # Errors
    ///
    /// Returns `OpenTimeout` if the socket is not open within the configured bound.
    pub async fn wait_until_open(&self) -> Result<()> {
        if self.state() == ConnectionState::Open {
            return Ok(());
        }
        self.command(Command::Connect(None)).await?;

        let mut state = self.state.clone();
        let opened = tokio::time::timeout(
            self.open_timeout,
            state.wait_for(|s| *s == ConnectionState::Open),
        )
        .await;

        match opened {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                tracing::warn!(timeout = ?self.open_timeout, "Connection did not open in time");
                Err(TransportError::OpenTimeout(self.open_timeout))
            }
        }
    }

    /// Encode and send a command, opening the socket first if needed.
    ///
    /// # Errors
    ///
    /// Returns `OpenTimeout` if the socket does not open in time, or `Send` if the
    /// write fails.
    pub async fn send(&self, command: &OutboundCommand) -> Result<()> {
        let text = command.encode()?;
        self.wait_until_open().await?;

        let (reply, rx) = oneshot::channel();
        self.command(Command::Send { text, reply }).await?;
        rx.await.map_err(|_| TransportError::Closed)?
    }

    /// Close the socket with a normal-closure frame and wait for the close to complete.
    ///
    /// Skipped while connecting or closing; a no-op when already closed.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the driver has stopped.
    pub async fn disconnect(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Disconnect { reply }).await?;
        rx.await.map_err(|_| TransportError::Closed)
    }

    async fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

struct Driver {
    config: TransportConfig,
    tokens: Arc<dyn TokenProvider>,
    client_type: ClientType,
    commands: mpsc::Receiver<Command>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    shared: Arc<Shared>,
    socket: Option<WsStream>,
    connecting: Option<ConnectFuture>,
    heartbeat: Option<Interval>,
    pong_deadline: Option<Instant>,
    close_deadline: Option<Instant>,
    disconnect_waiters: Vec<oneshot::Sender<()>>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                result = poll_connect(&mut self.connecting) => {
                    self.connecting = None;
                    self.on_connect_result(result);
                }
                message = next_message(&mut self.socket) => self.on_message(message).await,
                () = tick(&mut self.heartbeat) => self.send_ping().await,
                () = sleep_until(self.pong_deadline) => self.on_pong_timeout(),
                () = sleep_until(self.close_deadline) => {
                    tracing::warn!("Peer did not acknowledge close");
                    self.teardown();
                }
            }
        }

        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None).await;
        }
        tracing::debug!("Connection driver stopped");
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(client_type) => {
                if let Some(client_type) = client_type {
                    self.client_type = client_type;
                }
                self.start_connect();
            }
            Command::Send { text, reply } => {
                let result = self.write(text).await;
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => self.begin_close(reply).await,
        }
    }

    fn start_connect(&mut self) {
        let state = self.current_state();
        if state != ConnectionState::Closed {
            tracing::debug!(?state, "Already connected or connecting, skipping");
            return;
        }

        self.clear_timers();
        let request = match handshake_request(
            &self.config.ws_url,
            &current_token(self.tokens.as_ref()),
            self.client_type,
        ) {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(error = %e, "Invalid connection request");
                self.emit(ConnectionEvent::Error(e.to_string()));
                return;
            }
        };

        tracing::info!(url = %self.config.ws_url, client_type = %self.client_type, "Connecting");
        self.set_state(ConnectionState::Connecting);

        let open_timeout = self.config.open_timeout();
        self.connecting = Some(Box::pin(async move {
            match tokio::time::timeout(open_timeout, tokio_tungstenite::connect_async(request)).await {
                Ok(Ok((socket, _))) => Ok(socket),
                Ok(Err(e)) => Err(TransportError::Connection(e.to_string())),
                Err(_) => Err(TransportError::Connection("handshake timed out".to_string())),
            }
        }));
    }

    fn on_connect_result(&mut self, result: Result<WsStream>) {
        match result {
            Ok(socket) => {
                tracing::info!("Connection opened");
                self.socket = Some(socket);

                let period = self.config.heartbeat_interval().max(Duration::from_millis(1));
                let mut heartbeat = tokio::time::interval(period);
                heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.heartbeat = Some(heartbeat);

                self.set_state(ConnectionState::Open);
                self.emit(ConnectionEvent::Opened);
            }
            Err(e) => {
                tracing::error!(error = %e, "Connection failed");
                self.set_state(ConnectionState::Closed);
                self.emit(ConnectionEvent::Error(e.to_string()));
            }
        }
    }

    async fn write(&mut self, text: String) -> Result<()> {
        if self.current_state() != ConnectionState::Open {
            return Err(TransportError::Send("connection not open".to_string()));
        }
        let Some(socket) = self.socket.as_mut() else {
            return Err(TransportError::Send("connection not open".to_string()));
        };

        match socket.send(Message::Text(text)).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(error = %e, "Write failed");
                self.emit(ConnectionEvent::Error(e.to_string()));
                self.teardown();
                Err(TransportError::Send(e.to_string()))
            }
        }
    }

    async fn send_ping(&mut self) {
        if self.write(PING_FRAME.to_string()).await.is_err() {
            return;
        }
        // A pending deadline is not pushed back by later pings.
        if self.pong_deadline.is_none() {
            self.pong_deadline = Some(Instant::now() + self.config.pong_timeout());
        }
        tracing::trace!("Ping sent");
    }

    fn on_pong(&mut self) {
        self.pong_deadline = None;
        *self.shared.last_pong_at.lock() = Some(Utc::now());
        tracing::trace!("Pong received");
    }

    fn on_pong_timeout(&mut self) {
        tracing::warn!(
            timeout = ?self.config.pong_timeout(),
            "No pong received, reconnecting"
        );
        self.emit(ConnectionEvent::HeartbeatTimeout);
        self.teardown();
        self.emit(ConnectionEvent::Reconnecting);
        self.start_connect();
    }

    async fn on_message(&mut self, message: Option<WsResult<Message>>) {
        match message {
            Some(Ok(Message::Text(text))) => {
                if protocol::is_pong(&text) {
                    self.on_pong();
                } else {
                    self.dispatch(&text).await;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                if self.current_state() == ConnectionState::Closing {
                    tracing::info!("Close acknowledged");
                } else {
                    tracing::info!(frame = ?frame, "Connection closed by peer");
                }
                self.teardown();
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_) | Message::Binary(_))) => {}
            Some(Err(e)) => {
                if self.current_state() != ConnectionState::Closing {
                    tracing::error!(error = %e, "Connection error");
                    self.emit(ConnectionEvent::Error(e.to_string()));
                }
                self.teardown();
            }
            None => {
                tracing::info!("Connection stream ended");
                self.teardown();
            }
        }
    }

    async fn dispatch(&mut self, text: &str) {
        let frame = match protocol::decode_frame(text) {
            Ok(frame) => frame,
            Err(FrameError::UnexpectedCode(code)) => {
                tracing::debug!(code = %code, "Ignoring non-chat frame");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed frame");
                return;
            }
        };

        tracing::debug!(id = %frame.id, kind = ?frame.kind, "Frame received");
        let consumer = self.shared.frames.lock().clone();
        match consumer {
            Some(consumer) => {
                if consumer.send(frame).await.is_err() {
                    tracing::debug!("Frame consumer gone, dropping frame");
                }
            }
            None => tracing::debug!("No frame consumer registered, dropping frame"),
        }
    }

    async fn begin_close(&mut self, reply: oneshot::Sender<()>) {
        match self.current_state() {
            ConnectionState::Closed => {
                let _ = reply.send(());
            }
            ConnectionState::Connecting | ConnectionState::Closing => {
                tracing::debug!("Disconnect skipped while connecting or closing");
                let _ = reply.send(());
            }
            ConnectionState::Open => {
                tracing::info!("Disconnecting");
                self.set_state(ConnectionState::Closing);
                self.clear_timers();
                self.disconnect_waiters.push(reply);

                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: CLOSE_REASON.into(),
                };
                let sent = match self.socket.as_mut() {
                    Some(socket) => socket.close(Some(frame)).await.is_ok(),
                    None => false,
                };
                if sent {
                    self.close_deadline = Some(Instant::now() + self.config.close_timeout());
                } else {
                    self.teardown();
                }
            }
        }
    }

    fn clear_timers(&mut self) {
        self.heartbeat = None;
        self.pong_deadline = None;
        self.close_deadline = None;
    }

    /// Drop the socket and every timer tied to it, then report `Closed`.
    fn teardown(&mut self) {
        self.clear_timers();
        self.socket = None;

        if self.current_state() != ConnectionState::Closed {
            self.set_state(ConnectionState::Closed);
            self.emit(ConnectionEvent::Closed);
        }
        for waiter in self.disconnect_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

fn handshake_request(url: &str, token: &str, client_type: ClientType) -> Result<Request> {
    let mut request = url
        .into_client_request()
        .map_err(|e| TransportError::Connection(e.to_string()))?;

    let headers = request.headers_mut();
    headers.insert(HeaderName::from_static(ACCESS_TOKEN_HEADER), HeaderValue::from_str(token)?);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        HeaderName::from_static(CLIENT_TYPE_HEADER),
        HeaderValue::from_static(client_type.as_str()),
    );
    Ok(request)
}

async fn poll_connect(connecting: &mut Option<ConnectFuture>) -> Result<WsStream> {
    match connecting {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

async fn next_message(socket: &mut Option<WsStream>) -> Option<WsResult<Message>> {
    match socket {
        Some(socket) => socket.next().await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;

    fn config(url: &str) -> TransportConfig {
        TransportConfig {
            ws_url: url.to_string(),
            open_timeout_ms: 200,
            ..TransportConfig::default()
        }
    }

    #[test]
    fn handshake_carries_token_and_client_type() {
        let request = handshake_request("ws://127.0.0.1:9/ws", "tok", ClientType::Pc).unwrap();
        let headers = request.headers();
        assert_eq!(headers["accesstoken"], "tok");
        assert_eq!(headers["clienttype"], "PC");
        assert_eq!(headers["content-type"], "application/json");
    }

    #[test]
    fn handshake_rejects_bad_url() {
        let err = handshake_request("not a url", "tok", ClientType::Pc).unwrap_err();
        assert!(matches!(err, TransportError::Connection(_)));
    }

    #[tokio::test]
    async fn starts_closed() {
        let manager = ConnectionManager::new(config("ws://127.0.0.1:9/ws"), Arc::new(StaticToken::new("t")));
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(manager.last_pong_at().is_none());
        manager.disconnect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn unreachable_server_times_out_wait() {
        // Port 9 (discard) is closed on test hosts; the connect fails fast and the
        // wait runs into its bound.
        let manager = ConnectionManager::new(config("ws://127.0.0.1:9/ws"), Arc::new(StaticToken::new("t")));
        let mut events = manager.events();

        let started = std::time::Instant::now();
        let err = manager.wait_until_open().await.unwrap_err();

        assert!(matches!(err, TransportError::OpenTimeout(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(events.recv().await.unwrap(), ConnectionEvent::Error(_)));
    }

    #[tokio::test]
    async fn second_frames_registration_closes_first() {
        let manager = ConnectionManager::new(config("ws://127.0.0.1:9/ws"), Arc::new(StaticToken::new("t")));
        let mut first = manager.frames();
        let _second = manager.frames();
        assert!(first.recv().await.is_none());
    }
}

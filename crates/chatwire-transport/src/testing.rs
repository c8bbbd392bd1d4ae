//! Test support: an in-process chat server and frame builders.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::protocol::{OutboundCommand, CHAT_DATA_CODE, PING_FRAME, PONG_FRAME};

/// Build an inbound `message` frame; `payload` is JSON-encoded into a string.
#[must_use]
pub fn message_frame(payload: &Value) -> String {
    chat_frame("message", Value::String(payload.to_string()))
}

/// Build an inbound `stream-end` frame; `payload` is embedded as an object.
#[must_use]
pub fn stream_end_frame(payload: &Value) -> String {
    chat_frame("stream-end", payload.clone())
}

fn chat_frame(kind: &str, data: Value) -> String {
    json!({
        "id": "frame",
        "code": "200",
        "message": "",
        "body": {
            "code": CHAT_DATA_CODE,
            "data": {"sseMsgType": kind, "data": data, "type": "chat"}
        }
    })
    .to_string()
}

#[derive(Debug, Clone)]
enum ServerAction {
    Push(String),
    Kick,
}

/// Behaviour switches of [`MockChatServer`].
#[derive(Debug, Clone, Copy)]
pub struct MockServerOptions {
    /// Reply `pong` to every `ping`.
    pub answer_pings: bool,
    /// Answer every send-query with a `message` and a `stream-end` frame echoing the
    /// chat ID, the decoded query and the run ID.
    pub auto_answer: bool,
}

impl Default for MockServerOptions {
    fn default() -> Self {
        Self {
            answer_pings: true,
            auto_answer: false,
        }
    }
}

struct ServerState {
    accepted: AtomicUsize,
    answer_pings: AtomicBool,
    auto_answer: bool,
    received: Mutex<Vec<String>>,
    handshakes: Mutex<Vec<HeaderMap>>,
    actions: broadcast::Sender<ServerAction>,
}

/// A WebSocket chat server on an ephemeral local port.
///
/// Records every non-heartbeat text frame and every handshake. Stops when dropped.
pub struct MockChatServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
}

impl MockChatServer {
    /// Start a server with the given options.
    ///
    /// # Panics
    ///
    /// Panics if no local port can be bound.
    pub async fn start(options: MockServerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock server");
        let addr = listener.local_addr().expect("mock server address");
        let (actions, _) = broadcast::channel(64);
        let state = Arc::new(ServerState {
            accepted: AtomicUsize::new(0),
            answer_pings: AtomicBool::new(options.answer_pings),
            auto_answer: options.auto_answer,
            received: Mutex::new(Vec::new()),
            handshakes: Mutex::new(Vec::new()),
            actions,
        });
        let shutdown = CancellationToken::new();

        let accept_state = state.clone();
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    () = accept_shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(_) => break,
                    },
                };
                tokio::spawn(serve(stream, accept_state.clone(), accept_shutdown.clone()));
            }
        });

        Self {
            addr,
            state,
            shutdown,
        }
    }

    /// Socket URL of the server.
    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}/api/v1/buyer/ai-chat-ws", self.addr)
    }

    /// Number of completed WebSocket handshakes.
    #[must_use]
    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Handshake headers, in accept order.
    #[must_use]
    pub fn handshakes(&self) -> Vec<HeaderMap> {
        self.state.handshakes.lock().clone()
    }

    /// Non-heartbeat text frames received so far.
    #[must_use]
    pub fn received(&self) -> Vec<String> {
        self.state.received.lock().clone()
    }

    /// Received frames decoded as outbound commands; undecodable ones are skipped.
    #[must_use]
    pub fn commands(&self) -> Vec<OutboundCommand> {
        self.received()
            .iter()
            .filter_map(|text| OutboundCommand::decode(text).ok())
            .collect()
    }

    /// Poll until at least `count` frames were received or `timeout` elapses.
    pub async fn wait_for_received(&self, count: usize, timeout: Duration) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let received = self.received();
            if received.len() >= count || tokio::time::Instant::now() >= deadline {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Start or stop answering pings.
    pub fn set_answer_pings(&self, answer: bool) {
        self.state.answer_pings.store(answer, Ordering::SeqCst);
    }

    /// Send a text frame to every connected client.
    pub fn push(&self, text: impl Into<String>) {
        let _ = self.state.actions.send(ServerAction::Push(text.into()));
    }

    /// Close every connection from the server side.
    pub fn kick(&self) {
        let _ = self.state.actions.send(ServerAction::Kick);
    }
}

impl Drop for MockChatServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve(stream: TcpStream, state: Arc<ServerState>, shutdown: CancellationToken) {
    // Subscribed and counted before the client can observe the open.
    let mut actions = state.actions.subscribe();
    let handshake_state = state.clone();
    let callback = move |request: &Request, response: Response| {
        handshake_state.handshakes.lock().push(request.headers().clone());
        handshake_state.accepted.fetch_add(1, Ordering::SeqCst);
        Ok(response)
    };
    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            action = actions.recv() => match action {
                Ok(ServerAction::Push(text)) => {
                    if ws.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Ok(ServerAction::Kick) => {
                    let _ = ws.close(None).await;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            message = ws.next() => match message {
                Some(Ok(Message::Text(text))) if text == PING_FRAME => {
                    if state.answer_pings.load(Ordering::SeqCst)
                        && ws.send(Message::Text(PONG_FRAME.to_string())).await.is_err()
                    {
                        break;
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    state.received.lock().push(text.clone());
                    if state.auto_answer {
                        for reply in auto_answer(&text) {
                            if ws.send(Message::Text(reply)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            },
        }
    }
}

fn auto_answer(text: &str) -> Vec<String> {
    let Ok(OutboundCommand::SendQuery(query)) = OutboundCommand::decode(text) else {
        return Vec::new();
    };
    let snapshot = json!({
        "runId": query.run_id.as_str(),
        "chatId": query.chat_id.as_str(),
        "queryId": format!("q-{}", query.run_id),
        "query": query.query,
        "message": "thinking",
    });
    let mut last = snapshot.clone();
    last["response"] = Value::String(format!("answer to {}", query.query));
    vec![message_frame(&snapshot), stream_end_frame(&last)]
}

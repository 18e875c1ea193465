// tests/common.rs
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use delivery_realtime_rs::auth::{MemoryTokenStore, TokenCoordinator, TokenData, TokenRefresher};
use delivery_realtime_rs::config::Framing;
use delivery_realtime_rs::types::RefreshTokenResponse;
use delivery_realtime_rs::websocket::stomp::{decode_stream, Inbound};
use delivery_realtime_rs::websocket::{Command, StompFrame};
use delivery_realtime_rs::{RealtimeConfig, RealtimeError, Result};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;

static INIT: Once = Once::new();

// Loads .env if present and installs the test logger, once per test binary.
pub fn setup() {
    INIT.call_once(|| {
        if dotenv::from_path(".env").is_err() {
            let _ = dotenv::from_path("../.env");
        }
        env_logger::builder().is_test(true).try_init().ok();
    });
}

/// Polls `check` every 10ms until it holds or `within` elapses.
pub async fn eventually<F: Fn() -> bool>(within: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// --- Tokens ---

pub fn token_valid_for(access_token: &str, lifetime: ChronoDuration) -> TokenData {
    TokenData {
        access_token: access_token.to_string(),
        refresh_token: Some("refresh-1".to_string()),
        expires_at: Utc::now() + lifetime,
    }
}

/// Refresher that counts calls and hands out `fresh-N` tokens.
#[derive(Default)]
pub struct CountingRefresher {
    pub calls: AtomicUsize,
}

#[async_trait]
impl TokenRefresher for CountingRefresher {
    async fn refresh(&self, _refresh_token: &str) -> Result<RefreshTokenResponse> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(RefreshTokenResponse {
            access_token: format!("fresh-{}", n),
            refresh_token: Some("refresh-2".to_string()),
            token_expiry: Utc::now() + ChronoDuration::hours(1),
        })
    }
}

pub fn coordinator(initial: Option<TokenData>) -> (Arc<TokenCoordinator>, Arc<CountingRefresher>) {
    let refresher = Arc::new(CountingRefresher::default());
    let coordinator = Arc::new(TokenCoordinator::new(
        Arc::new(MemoryTokenStore::new(initial)),
        refresher.clone(),
        ChronoDuration::minutes(5),
    ));
    (coordinator, refresher)
}

pub fn test_config(server: &MockStompServer) -> RealtimeConfig {
    RealtimeConfig {
        api_base_url: "http://127.0.0.1:1".to_string(),
        ws_base_url: server.ws_url(),
        framing: server.framing,
        heartbeat_ms: 0,
        connect_timeout_ms: 2000,
        reconnect_delay_ms: 100,
        ..RealtimeConfig::default()
    }
}

// --- Mock broker ---

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Value of the `heart-beat` header sent back in CONNECTED.
    pub heart_beat: String,
    pub framing: Framing,
    /// Reply to CONNECT with an ERROR frame instead of CONNECTED.
    pub reject_connect: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            heart_beat: "0,0".to_string(),
            framing: Framing::Raw,
            reject_connect: false,
        }
    }
}

enum Control {
    Send(String),
    Drop,
}

#[derive(Default)]
struct Recorded {
    paths: Mutex<Vec<String>>,
    authorization: Mutex<Vec<Option<String>>>,
    frames: Mutex<Vec<StompFrame>>,
    live: Mutex<Vec<mpsc::UnboundedSender<Control>>>,
    connections: AtomicUsize,
    messages_sent: AtomicUsize,
}

/// Minimal STOMP broker over a local WebSocket listener.
///
/// Records every upgrade request and inbound frame so tests can assert on
/// what the client put on the wire.
pub struct MockStompServer {
    pub addr: SocketAddr,
    pub framing: Framing,
    recorded: Arc<Recorded>,
    shutdown: Arc<Notify>,
}

impl MockStompServer {
    pub async fn start() -> Self {
        Self::start_with(ServerOptions::default()).await
    }

    pub async fn start_with(options: ServerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let recorded = Arc::new(Recorded::default());
        let shutdown = Arc::new(Notify::new());
        let framing = options.framing;

        let accept_recorded = recorded.clone();
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => match result {
                        Ok((stream, _)) => {
                            let recorded = accept_recorded.clone();
                            let shutdown = accept_shutdown.clone();
                            let options = options.clone();
                            tokio::spawn(async move {
                                handle_connection(stream, recorded, options, shutdown).await;
                            });
                        }
                        Err(e) => {
                            eprintln!("Accept error: {}", e);
                            break;
                        }
                    },
                    _ = accept_shutdown.notified() => break,
                }
            }
        });

        Self {
            addr,
            framing,
            recorded,
            shutdown,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Completed WebSocket upgrades so far.
    pub fn connections(&self) -> usize {
        self.recorded.connections.load(Ordering::SeqCst)
    }

    pub fn paths(&self) -> Vec<String> {
        self.recorded.paths.lock().unwrap().clone()
    }

    pub fn authorization_headers(&self) -> Vec<Option<String>> {
        self.recorded.authorization.lock().unwrap().clone()
    }

    pub fn frames(&self) -> Vec<StompFrame> {
        self.recorded.frames.lock().unwrap().clone()
    }

    pub fn frames_of(&self, command: Command) -> Vec<StompFrame> {
        self.frames()
            .into_iter()
            .filter(|f| f.command == command)
            .collect()
    }

    pub fn subscribed_destinations(&self) -> Vec<String> {
        self.frames_of(Command::Subscribe)
            .iter()
            .filter_map(|f| f.get_header("destination").map(String::from))
            .collect()
    }

    pub fn messages_sent(&self) -> usize {
        self.recorded.messages_sent.load(Ordering::SeqCst)
    }

    /// Pushes a MESSAGE for `destination` to every live connection, using the
    /// id of the most recent SUBSCRIBE to that destination.
    pub fn push_message(&self, destination: &str, body: &str) {
        let subscription = self
            .frames_of(Command::Subscribe)
            .into_iter()
            .rev()
            .find(|f| f.get_header("destination") == Some(destination))
            .and_then(|f| f.get_header("id").map(String::from));
        let n = self.recorded.messages_sent.fetch_add(1, Ordering::SeqCst) + 1;
        let mut frame = StompFrame::new(Command::Message)
            .header("destination", destination)
            .header("message-id", format!("m-{}", n))
            .header("content-type", "application/json")
            .body(body);
        if let Some(id) = subscription {
            frame = frame.header("subscription", id);
        }
        self.broadcast(Control::Send(frame.encode()));
    }

    /// Kills every live connection without a close handshake.
    pub fn drop_connections(&self) {
        self.broadcast(Control::Drop);
        self.recorded.live.lock().unwrap().clear();
    }

    fn broadcast(&self, control: Control) {
        let live = self.recorded.live.lock().unwrap();
        for tx in live.iter() {
            let msg = match &control {
                Control::Send(text) => Control::Send(text.clone()),
                Control::Drop => Control::Drop,
            };
            let _ = tx.send(msg);
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

impl Drop for MockStompServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn wrap(framing: Framing, payload: &str) -> String {
    match framing {
        Framing::Raw => payload.to_string(),
        Framing::SockJs => format!("a{}", serde_json::to_string(&[payload]).unwrap()),
    }
}

fn unwrap_client(framing: Framing, text: &str) -> Vec<String> {
    match framing {
        Framing::Raw => vec![text.to_string()],
        Framing::SockJs => serde_json::from_str::<Vec<String>>(text).unwrap_or_default(),
    }
}

async fn handle_connection(
    stream: TcpStream,
    recorded: Arc<Recorded>,
    options: ServerOptions,
    shutdown: Arc<Notify>,
) {
    let on_upgrade = {
        let recorded = recorded.clone();
        move |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
            recorded.paths.lock().unwrap().push(req.uri().path().to_string());
            recorded.authorization.lock().unwrap().push(
                req.headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(String::from),
            );
            Ok(resp)
        }
    };
    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, on_upgrade).await {
        Ok(ws) => ws,
        Err(e) => {
            eprintln!("WebSocket handshake failed: {}", e);
            return;
        }
    };
    recorded.connections.fetch_add(1, Ordering::SeqCst);

    let (mut write, mut read) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Control>();
    recorded.live.lock().unwrap().push(tx);

    if options.framing == Framing::SockJs && write.send(Message::Text("o".to_string())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            control = rx.recv() => match control {
                Some(Control::Send(payload)) => {
                    if write.send(Message::Text(wrap(options.framing, &payload))).await.is_err() {
                        break;
                    }
                }
                Some(Control::Drop) | None => break,
            },
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    for payload in unwrap_client(options.framing, &text) {
                        for item in decode_stream(&payload) {
                            let Ok(Inbound::Frame(frame)) = item else { continue };
                            let reply = match frame.command {
                                Command::Connect if options.reject_connect => Some(
                                    StompFrame::new(Command::Error)
                                        .header("message", "Bad credentials")
                                        .encode(),
                                ),
                                Command::Connect => Some(
                                    StompFrame::new(Command::Connected)
                                        .header("version", "1.2")
                                        .header("heart-beat", options.heart_beat.clone())
                                        .encode(),
                                ),
                                _ => None,
                            };
                            recorded.frames.lock().unwrap().push(frame);
                            if let Some(reply) = reply {
                                if write.send(Message::Text(wrap(options.framing, &reply))).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            _ = shutdown.notified() => break,
        }
    }
}

pub fn is_send_rejected(err: &RealtimeError) -> bool {
    matches!(err, RealtimeError::SendRejected(_))
}

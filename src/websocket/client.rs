use super::reconnect::{BackoffPolicy, FixedDelay, ReconnectScheduler};
use super::status::{StatusBroadcaster, StatusListener};
use super::stomp::{self, Command, Heartbeat, Inbound, StompFrame, HEARTBEAT_PULSE};
use super::subscriptions::{
    FrameSink, InboundMessage, MessageHandler, SubscriptionRegistry, SubscriptionState,
};
use super::transport::{self, Envelope, WsStream};
use crate::auth::TokenCoordinator;
use crate::config::{Framing, RealtimeConfig};
use crate::error::{RealtimeError, Result};
use crate::types::SessionIdentity;
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::*;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, timeout, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::Message;

type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Outbound half of a live session. Frames are queued to the session task,
/// so sending never blocks the caller.
#[derive(Clone)]
struct OutboundSender {
    tx: mpsc::UnboundedSender<Message>,
    framing: Framing,
}

impl OutboundSender {
    fn send_text(&self, payload: &str) -> Result<()> {
        let text = transport::encode_envelope(self.framing, payload)?;
        self.tx
            .send(Message::Text(text))
            .map_err(|_| RealtimeError::SendRejected("Session writer closed".to_string()))
    }

    fn close(&self) {
        let _ = self.tx.send(Message::Close(None));
    }
}

impl FrameSink for OutboundSender {
    fn send_frame(&self, frame: &StompFrame) -> Result<()> {
        trace!("Queueing STOMP {} frame", frame.command);
        self.send_text(&frame.encode())
    }
}

struct SessionState {
    state: ConnectionState,
    // Bumped on every attempt and on disconnect; stale session tasks compare
    // against it and back off.
    generation: u64,
    identity: Option<SessionIdentity>,
    outbound: Option<OutboundSender>,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    config: RealtimeConfig,
    tokens: Arc<TokenCoordinator>,
    // Lock order: session, then registry.
    session: Mutex<SessionState>,
    registry: Mutex<SubscriptionRegistry>,
    scheduler: ReconnectScheduler,
    status: StatusBroadcaster,
    transport_attempts: AtomicU64,
}

/// Owns the single message-bus session of the process.
///
/// Cheap to clone; all clones drive the same session. Construct one at the
/// composition root and call [`shutdown`](Self::shutdown) when done.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

/// Returned by [`ConnectionManager::subscribe`]; unsubscribes on request.
pub struct SubscriptionHandle {
    topic: String,
    manager: ConnectionManager,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn unsubscribe(self) -> bool {
        self.manager.unsubscribe(&self.topic).await
    }
}

impl ConnectionManager {
    pub fn new(config: RealtimeConfig, tokens: Arc<TokenCoordinator>) -> Self {
        let policy = FixedDelay::new(config.reconnect_delay(), None);
        Self::with_backoff(config, tokens, Box::new(policy))
    }

    pub fn with_backoff(
        config: RealtimeConfig,
        tokens: Arc<TokenCoordinator>,
        policy: Box<dyn BackoffPolicy>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                tokens,
                session: Mutex::new(SessionState {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    identity: None,
                    outbound: None,
                    task: None,
                }),
                registry: Mutex::new(SubscriptionRegistry::new()),
                scheduler: ReconnectScheduler::new(policy),
                status: StatusBroadcaster::new(),
                transport_attempts: AtomicU64::new(0),
            }),
        }
    }

    /// Starts a session for `identity`.
    ///
    /// No-op unless the session is disconnected. Fails with
    /// [`RealtimeError::Auth`] when no token can be obtained, without touching
    /// the network. Otherwise returns once the attempt is under way; watch
    /// [`status`](Self::status) for the outcome.
    pub async fn connect(&self, identity: SessionIdentity) -> Result<()> {
        let generation = {
            let mut session = self.inner.session.lock().await;
            if session.state != ConnectionState::Disconnected {
                debug!(
                    "[Manager] connect() ignored, session is {:?}.",
                    session.state
                );
                return Ok(());
            }
            session.state = ConnectionState::Connecting;
            session.generation += 1;
            session.identity = Some(identity.clone());
            session.generation
        };
        Arc::clone(&self.inner)
            .start_attempt(generation, identity)
            .await
    }

    /// Ends the session for good: no reconnect follows, all subscriptions
    /// (active and pending) are dropped.
    ///
    /// The state reads `Disconnecting` while the session task writes the
    /// DISCONNECT frame and closes the socket, bounded by the connect timeout.
    pub async fn disconnect(&self) {
        let (previous, generation, task) = {
            let mut session = self.inner.session.lock().await;
            let previous = session.state;
            session.state = ConnectionState::Disconnecting;
            session.generation += 1;
            session.identity = None;

            self.inner.scheduler.cancel_pending().await;
            self.inner.scheduler.reset();
            self.inner.registry.lock().await.clear_all();

            let task = match (session.outbound.take(), session.task.take()) {
                (Some(outbound), task) => {
                    // The session task writes these and exits on the close.
                    if let Err(e) = outbound.send_frame(&StompFrame::disconnect()) {
                        debug!("[Manager] Could not queue DISCONNECT: {}", e);
                    }
                    outbound.close();
                    task
                }
                (None, Some(task)) => {
                    task.abort();
                    None
                }
                (None, None) => None,
            };
            (previous, session.generation, task)
        };

        if let Some(mut task) = task {
            if timeout(self.inner.config.connect_timeout(), &mut task)
                .await
                .is_err()
            {
                warn!("[Manager] Session did not close in time, aborting it.");
                task.abort();
            }
        }

        let mut session = self.inner.session.lock().await;
        if session.generation == generation {
            session.state = ConnectionState::Disconnected;
        }
        drop(session);
        info!("[Manager] Disconnected by caller (was {:?}).", previous);
        self.inner.status.publish(false);
    }

    pub async fn shutdown(&self) {
        info!("[Manager] Shutting down connection manager...");
        self.disconnect().await;
    }

    /// Registers `handler` for `topic`. Idempotent per topic; queued until the
    /// session is connected and replayed after every reconnect.
    pub async fn subscribe(&self, topic: &str, handler: MessageHandler) -> SubscriptionHandle {
        let session = self.inner.session.lock().await;
        let sink = match session.state {
            ConnectionState::Connected => session.outbound.clone(),
            _ => None,
        };
        let outcome = self.inner.registry.lock().await.subscribe(
            topic,
            handler,
            sink.as_ref().map(|s| s as &dyn FrameSink),
        );
        drop(session);
        debug!("[Manager] subscribe('{}'): {:?}", topic, outcome);
        SubscriptionHandle {
            topic: topic.to_string(),
            manager: self.clone(),
        }
    }

    pub async fn unsubscribe(&self, topic: &str) -> bool {
        let session = self.inner.session.lock().await;
        let sink = match session.state {
            ConnectionState::Connected => session.outbound.clone(),
            _ => None,
        };
        let removed = self
            .inner
            .registry
            .lock()
            .await
            .unsubscribe(topic, sink.as_ref().map(|s| s as &dyn FrameSink));
        drop(session);
        removed
    }

    /// Sends `body` as JSON to `destination`. Fails fast with
    /// [`RealtimeError::SendRejected`] unless connected; nothing is queued.
    pub async fn send<T: Serialize + ?Sized>(&self, destination: &str, body: &T) -> Result<()> {
        let outbound = {
            let session = self.inner.session.lock().await;
            match (session.state, session.outbound.as_ref()) {
                (ConnectionState::Connected, Some(outbound)) => outbound.clone(),
                (state, _) => {
                    return Err(RealtimeError::SendRejected(format!(
                        "Not connected (state {:?})",
                        state
                    )))
                }
            }
        };
        let payload = serde_json::to_string(body)?;
        outbound.send_frame(&StompFrame::send_json(destination, payload))
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.session.lock().await.state
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    /// New listener for connected/disconnected events.
    pub fn status(&self) -> StatusListener {
        self.inner.status.listen()
    }

    pub async fn subscription_state(&self, topic: &str) -> Option<SubscriptionState> {
        self.inner.registry.lock().await.state_of(topic)
    }

    pub async fn reconnect_pending(&self) -> bool {
        self.inner.scheduler.is_pending().await
    }

    /// How many times a transport open has been started.
    pub fn transport_attempts(&self) -> u64 {
        self.inner.transport_attempts.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.inner.config
    }

    pub fn tokens(&self) -> &Arc<TokenCoordinator> {
        &self.inner.tokens
    }
}

impl Inner {
    /// Gets a token and, if the attempt is still current, spawns the session task.
    async fn start_attempt(
        self: Arc<Self>,
        generation: u64,
        identity: SessionIdentity,
    ) -> Result<()> {
        let token = match self.tokens.get_valid_token().await {
            Ok(token) => token,
            Err(e) => {
                error!(
                    "[Manager] No usable token, connection attempt abandoned: {}",
                    e
                );
                let mut session = self.session.lock().await;
                if session.generation == generation
                    && session.state == ConnectionState::Connecting
                {
                    session.state = ConnectionState::Disconnected;
                }
                return Err(e.into());
            }
        };

        let mut session = self.session.lock().await;
        if session.generation != generation || session.state != ConnectionState::Connecting {
            debug!("[Manager] Attempt #{} superseded before opening.", generation);
            return Ok(());
        }
        let attempt = self.transport_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            "[Manager] Attempting connection (attempt {}, session #{})...",
            attempt, generation
        );
        session.task = Some(tokio::spawn(run_session(
            Arc::clone(&self),
            generation,
            token,
            identity,
        )));
        Ok(())
    }

    /// Fired by the reconnect timer.
    async fn reconnect(self: Arc<Self>) {
        let (generation, identity) = {
            let mut session = self.session.lock().await;
            if session.state != ConnectionState::Disconnected {
                return;
            }
            let Some(identity) = session.identity.clone() else {
                debug!("[Manager] Reconnect skipped, session was closed by caller.");
                return;
            };
            session.state = ConnectionState::Connecting;
            session.generation += 1;
            (session.generation, identity)
        };
        if let Err(e) = self.start_attempt(generation, identity).await {
            error!(
                "[Manager] Reconnect stopped: {}. Re-authentication required.",
                e
            );
        }
    }

    async fn on_connected(&self, generation: u64, outbound: OutboundSender) -> bool {
        let mut session = self.session.lock().await;
        if session.generation != generation || session.state != ConnectionState::Connecting {
            return false;
        }
        session.state = ConnectionState::Connected;
        session.outbound = Some(outbound.clone());

        self.scheduler.cancel_pending().await;
        self.scheduler.reset();
        let flushed = self.registry.lock().await.flush_pending(&outbound);
        drop(session);

        info!(
            "[Manager] Connection established (session #{}), {} subscriptions sent.",
            generation, flushed
        );
        self.status.publish(true);
        true
    }

    /// Tears down after a transport or protocol failure and arms one retry.
    /// Ignored if the session was superseded or closed by the caller.
    async fn handle_failure(self: &Arc<Self>, generation: u64, err: RealtimeError) {
        let mut session = self.session.lock().await;
        if session.generation != generation
            || !matches!(
                session.state,
                ConnectionState::Connecting | ConnectionState::Connected
            )
        {
            debug!(
                "[Manager] Ignoring failure of stale session #{}: {}",
                generation, err
            );
            return;
        }
        session.state = ConnectionState::Disconnected;
        session.outbound = None;
        session.task = None;
        self.registry.lock().await.mark_needs_resubscribe();

        warn!("[Manager] Disconnected: {}", err);
        let inner = Arc::clone(self);
        self.scheduler
            .schedule(async move { inner.reconnect().await }.boxed())
            .await;
        drop(session);
        self.status.publish(false);
    }

    async fn handle_text(&self, text: &str) -> Result<()> {
        for payload in unwrap_envelope(self.config.framing, text)? {
            for item in stomp::decode_stream(&payload) {
                match item {
                    Ok(Inbound::Heartbeat) => trace!("<<< heart-beat"),
                    Ok(Inbound::Frame(frame)) => {
                        let command = frame.command;
                        match command {
                            Command::Message => self.dispatch(frame).await,
                            Command::Error => {
                                return Err(RealtimeError::Protocol(format!(
                                    "Broker error: {}",
                                    frame.get_header("message").unwrap_or(&frame.body)
                                )))
                            }
                            Command::Receipt => debug!(
                                "Receipt {}",
                                frame.get_header("receipt-id").unwrap_or_default()
                            ),
                            other => debug!("Ignoring unexpected {} frame", other),
                        }
                    }
                    Err(e) => warn!("Dropping malformed frame: {}", e),
                }
            }
        }
        Ok(())
    }

    async fn dispatch(&self, frame: StompFrame) {
        let destination = frame.get_header("destination");
        let found = self
            .registry
            .lock()
            .await
            .handler_for(frame.get_header("subscription"), destination);
        let Some((topic, handler)) = found else {
            warn!("No subscription for MESSAGE to {:?}, dropping.", destination);
            return;
        };

        let body = match serde_json::from_str::<Value>(&frame.body) {
            Ok(body) => body,
            Err(e) => {
                let err = RealtimeError::MessageParse(e.to_string());
                warn!("Dropping message on '{}': {}", topic, err);
                return;
            }
        };
        trace!("Dispatching message on '{}'", topic);
        let message = InboundMessage {
            topic: topic.clone(),
            message_id: frame.get_header("message-id").map(String::from),
            body,
        };
        if let Err(cause) = panic::catch_unwind(AssertUnwindSafe(|| handler(message))) {
            error!(
                "Handler for '{}' panicked, message dropped: {}",
                topic,
                panic_message(cause.as_ref())
            );
        }
    }
}

// Boxed so the session future's type does not recurse through the reconnect path.
fn run_session(
    inner: Arc<Inner>,
    generation: u64,
    token: String,
    identity: SessionIdentity,
) -> BoxFuture<'static, ()> {
    async move {
        let outcome = AssertUnwindSafe(drive_session(&inner, generation, &token, &identity))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => info!("[Manager] Session #{} closed.", generation),
            Ok(Err(e)) => inner.handle_failure(generation, e).await,
            Err(cause) => {
                let err = RealtimeError::Transport(format!(
                    "Session task panicked: {}",
                    panic_message(cause.as_ref())
                ));
                inner.handle_failure(generation, err).await
            }
        }
    }
    .boxed()
}

fn panic_message(cause: &(dyn Any + Send)) -> &str {
    if let Some(message) = cause.downcast_ref::<&str>() {
        message
    } else if let Some(message) = cause.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

async fn drive_session(
    inner: &Arc<Inner>,
    generation: u64,
    token: &str,
    identity: &SessionIdentity,
) -> Result<()> {
    let config = &inner.config;
    let url = transport::session_url(&config.ws_base_url, &config.endpoint)?;
    let ws_stream = transport::open(&url, token, config.connect_timeout()).await?;
    let (mut write, mut read) = ws_stream.split();

    let heart_beat = (config.heartbeat_ms, config.heartbeat_ms);
    let host = url.host_str().unwrap_or("localhost");
    let connect = StompFrame::connect(host, heart_beat, &connect_headers(token, identity));
    write
        .send(Message::Text(transport::encode_envelope(
            config.framing,
            &connect.encode(),
        )?))
        .await?;

    let connected = timeout(
        config.connect_timeout(),
        await_connected(&mut read, config.framing),
    )
    .await
    .map_err(|_| RealtimeError::Transport("No CONNECTED frame before timeout".to_string()))??;
    let heartbeat = stomp::negotiate_heartbeat(heart_beat, connected.get_header("heart-beat"));
    debug!(
        "STOMP session up: version={:?}, heartbeat={:?}",
        connected.get_header("version"),
        heartbeat
    );

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let outbound = OutboundSender {
        tx,
        framing: config.framing,
    };
    if !inner.on_connected(generation, outbound).await {
        debug!("[Manager] Session #{} superseded during handshake.", generation);
        let _ = write.send(Message::Close(None)).await;
        return Ok(());
    }

    session_loop(inner, &mut write, &mut read, &mut rx, heartbeat).await
}

fn connect_headers(token: &str, identity: &SessionIdentity) -> Vec<(String, String)> {
    let mut headers = vec![
        ("Authorization".to_string(), format!("Bearer {}", token)),
        ("userId".to_string(), identity.user_id.clone()),
        ("userType".to_string(), identity.user_type.as_str().to_string()),
    ];
    if let Some(store_id) = &identity.store_id {
        headers.push(("storeId".to_string(), store_id.clone()));
    }
    headers
}

async fn await_connected(read: &mut WsReader, framing: Framing) -> Result<StompFrame> {
    while let Some(msg) = read.next().await {
        let text = match msg? {
            Message::Text(text) => text,
            Message::Close(frame) => {
                return Err(RealtimeError::Transport(format!(
                    "Closed during handshake: {:?}",
                    frame
                )))
            }
            _ => continue,
        };
        for payload in unwrap_envelope(framing, &text)? {
            for item in stomp::decode_stream(&payload) {
                match item? {
                    Inbound::Frame(frame) if frame.command == Command::Connected => {
                        return Ok(frame)
                    }
                    Inbound::Frame(frame) if frame.command == Command::Error => {
                        return Err(RealtimeError::Protocol(format!(
                            "Broker rejected CONNECT: {}",
                            frame.get_header("message").unwrap_or(&frame.body)
                        )))
                    }
                    _ => {}
                }
            }
        }
    }
    Err(RealtimeError::Transport(
        "Stream ended during handshake".to_string(),
    ))
}

fn unwrap_envelope(framing: Framing, text: &str) -> Result<Vec<String>> {
    match transport::decode_envelope(framing, text)? {
        Envelope::Messages(payloads) => Ok(payloads),
        Envelope::Open | Envelope::Heartbeat => Ok(Vec::new()),
        Envelope::Close { code, reason } => Err(RealtimeError::Transport(format!(
            "SockJS session closed ({}): {}",
            code, reason
        ))),
    }
}

async fn session_loop(
    inner: &Arc<Inner>,
    write: &mut WsWriter,
    read: &mut WsReader,
    rx: &mut mpsc::UnboundedReceiver<Message>,
    heartbeat: Heartbeat,
) -> Result<()> {
    let framing = inner.config.framing;
    let mut pulse = heartbeat.outgoing.map(|every| {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    });
    let deadline = heartbeat.incoming_deadline();
    let mut last_inbound = Instant::now();

    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(Message::Close(frame)) => {
                    let _ = write.send(Message::Close(frame)).await;
                    return Ok(());
                }
                Some(message) => write.send(message).await?,
                None => return Ok(()),
            },
            _ = next_pulse(&mut pulse) => {
                trace!(">>> heart-beat");
                write
                    .send(Message::Text(transport::encode_envelope(framing, HEARTBEAT_PULSE)?))
                    .await?;
            }
            _ = inbound_expired(deadline, last_inbound) => {
                return Err(RealtimeError::Transport(format!(
                    "Heart-beat timeout: no inbound traffic for {:?}",
                    deadline.unwrap_or_default()
                )));
            }
            inbound = read.next() => {
                last_inbound = Instant::now();
                match inbound {
                    Some(Ok(Message::Text(text))) => inner.handle_text(&text).await?,
                    Some(Ok(Message::Binary(bin))) => match String::from_utf8(bin) {
                        Ok(text) => inner.handle_text(&text).await?,
                        Err(_) => warn!("Dropping non UTF-8 binary message"),
                    },
                    Some(Ok(Message::Ping(data))) => write.send(Message::Pong(data)).await?,
                    Some(Ok(Message::Pong(_))) => trace!("Received WS Pong"),
                    Some(Ok(Message::Close(frame))) => {
                        return Err(RealtimeError::Transport(format!(
                            "Server closed the connection: {:?}",
                            frame
                        )));
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        return Err(RealtimeError::Transport(format!(
                            "WebSocket read error: {}",
                            e
                        )));
                    }
                    None => {
                        return Err(RealtimeError::Transport(
                            "WebSocket stream ended".to_string(),
                        ));
                    }
                }
            }
        }
    }
}

async fn next_pulse(pulse: &mut Option<Interval>) {
    match pulse {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn inbound_expired(deadline: Option<Duration>, since: Instant) {
    match deadline {
        Some(window) => sleep_until(since + window).await,
        None => std::future::pending::<()>().await,
    }
}

//! Live feed client over WebSocket.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect with backoff)
//! - Room join/leave, re-joined automatically after a reconnect
//! - Message send with server acknowledgement
//! - One ordered event queue ([`LiveEvent`]) for the consumer
//!
//! ```text
//!             ┌──────────── supervisor task ────────────┐
//! connect() ─►│ serve(socket) ── drop ──► backoff ──┐   │
//!             │      ▲                               │   │
//!             │      └──────── reconnect ◄───────────┘   │
//!             └───────────────────┬─────────────────────┘
//!                                 │ LiveEvent (mpsc)
//!                                 ▼
//!                          SyncCoordinator
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use lumen_core::{Message, MessageDraft, RoomId};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::protocol::{Ack, ErrorFrame, LiveFrame, ProtocolError};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the live feed, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveEvent {
    /// First connection established
    Connected,
    /// Connection re-established after a drop
    Reconnected,
    /// Connection lost (a reconnect may follow)
    Disconnected,
    /// A message pushed for a joined room
    Message(Message),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LiveFeedError {
    #[error("live feed is not connected")]
    Disconnected,
    #[error("could not connect: {0}")]
    Connect(String),
    #[error("no acknowledgement within {0:?}")]
    AckTimeout(Duration),
    #[error("server rejected request ({code}): {message}")]
    Rejected { code: String, message: String },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Live message feed for joined rooms.
///
/// Events are not delivered through this trait. Implementations hand out a
/// `mpsc::Receiver<LiveEvent>` that the consumer drains.
#[async_trait]
pub trait LiveFeed: Send + Sync + 'static {
    /// Subscribe to pushes for `room_id`.
    async fn join(&self, room_id: &RoomId) -> Result<(), LiveFeedError>;

    /// Stop receiving pushes for `room_id`.
    async fn leave(&self, room_id: &RoomId) -> Result<(), LiveFeedError>;

    /// Post a message and wait for the server-assigned version of it.
    async fn send(&self, room_id: &RoomId, draft: &MessageDraft) -> Result<Message, LiveFeedError>;

    async fn is_connected(&self) -> bool;
}

/// WebSocket client configuration.
#[derive(Debug, Clone)]
pub struct LiveFeedConfig {
    /// Server URL, e.g. `wss://chat.example.com/live`
    pub url: String,
    /// Bearer token appended as `?token=` (optional)
    pub auth_token: Option<String>,
    /// First reconnect delay in milliseconds (default: 250)
    pub reconnect_initial_ms: u64,
    /// Reconnect delay cap in milliseconds (default: 30s)
    pub reconnect_max_ms: u64,
    /// Give up after this many consecutive failed attempts (None = never)
    pub max_reconnect_attempts: Option<u32>,
    /// How long `send` waits for an ack in milliseconds (default: 10s)
    pub ack_timeout_ms: u64,
    /// Event queue capacity (default: 256)
    pub event_buffer: usize,
}

impl Default for LiveFeedConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8081/live".to_string(),
            auth_token: None,
            reconnect_initial_ms: 250,
            reconnect_max_ms: 30_000,
            max_reconnect_attempts: None,
            ack_timeout_ms: 10_000,
            event_buffer: 256,
        }
    }
}

impl LiveFeedConfig {
    /// Delay before reconnect attempt `attempt` (1-based): doubling, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let millis = self
            .reconnect_initial_ms
            .saturating_mul(1u64 << shift)
            .min(self.reconnect_max_ms);
        Duration::from_millis(millis)
    }

    fn connect_url(&self) -> String {
        match &self.auth_token {
            Some(token) => {
                let sep = if self.url.contains('?') { '&' } else { '?' };
                format!("{}{sep}token={token}", self.url)
            }
            None => self.url.clone(),
        }
    }
}

/// Outbound instruction for the connection task.
#[derive(Debug)]
enum Outbound {
    Frame(String),
    Close,
}

type PendingAcks = HashMap<String, oneshot::Sender<Result<Message, LiveFeedError>>>;

/// State shared between the client handle and its supervisor task.
struct Shared {
    config: LiveFeedConfig,
    state: RwLock<ConnectionState>,
    outgoing: Mutex<Option<mpsc::Sender<Outbound>>>,
    joined: Mutex<HashSet<RoomId>>,
    pending: Mutex<PendingAcks>,
    event_tx: mpsc::Sender<LiveEvent>,
    closed: AtomicBool,
}

impl Shared {
    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    async fn emit(&self, event: LiveEvent) {
        if self.event_tx.send(event).await.is_err() {
            log::debug!("Live event dropped: no consumer");
        }
    }

    async fn send_frame(&self, frame: &LiveFrame) -> Result<(), LiveFeedError> {
        let encoded = frame.encode()?;
        let tx = self.outgoing.lock().await.clone();
        match tx {
            Some(tx) => tx
                .send(Outbound::Frame(encoded))
                .await
                .map_err(|_| LiveFeedError::Disconnected),
            None => Err(LiveFeedError::Disconnected),
        }
    }

    async fn fail_pending(&self) {
        let mut pending = self.pending.lock().await;
        for (_, reply) in pending.drain() {
            let _ = reply.send(Err(LiveFeedError::Disconnected));
        }
    }

    /// Dispatch one inbound frame. Malformed frames are logged and dropped.
    async fn handle_inbound(&self, bytes: &[u8]) {
        let frame = match LiveFrame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Dropping malformed live frame: {e}");
                return;
            }
        };

        match frame {
            LiveFrame::Message(message) => self.emit(LiveEvent::Message(message)).await,
            LiveFrame::Ack(Ack { in_reply_to, message }) => {
                match self.pending.lock().await.remove(&in_reply_to) {
                    Some(reply) => {
                        let _ = reply.send(Ok(message));
                    }
                    None => log::debug!("Ack for unknown send {in_reply_to}"),
                }
            }
            LiveFrame::Error(ErrorFrame { in_reply_to, code, message }) => {
                let reply = match &in_reply_to {
                    Some(id) => self.pending.lock().await.remove(id),
                    None => None,
                };
                match reply {
                    Some(reply) => {
                        let _ = reply.send(Err(LiveFeedError::Rejected { code, message }));
                    }
                    None => log::warn!("Live feed error ({code}): {message}"),
                }
            }
            LiveFrame::Ping => {
                if let Err(e) = self.send_frame(&LiveFrame::Pong).await {
                    log::debug!("Could not answer ping: {e}");
                }
            }
            LiveFrame::Pong => {}
            other => log::debug!("Ignoring unexpected '{}' frame from server", other.kind()),
        }
    }

    /// Announce the connection, then pump one socket until it closes.
    async fn serve(&self, socket: Socket, reconnected: bool) {
        let (mut writer, mut reader) = socket.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(256);
        *self.outgoing.lock().await = Some(out_tx);

        // disconnect() stores `closed` before reading `outgoing`, so if it
        // missed the sender installed above it is visible here.
        if self.closed.load(Ordering::SeqCst) {
            let _ = writer.send(WsMessage::Close(None)).await;
            *self.outgoing.lock().await = None;
            return;
        }

        // The server forgets subscriptions when the socket drops.
        let rooms: Vec<RoomId> = self.joined.lock().await.iter().cloned().collect();
        for room_id in rooms {
            if let Err(e) = self.send_frame(&LiveFrame::join(room_id.clone())).await {
                log::warn!("Failed to re-join room {room_id}: {e}");
            }
        }

        self.set_state(ConnectionState::Connected).await;
        if reconnected {
            log::info!("Live feed reconnected");
            self.emit(LiveEvent::Reconnected).await;
        } else {
            log::info!("Live feed connected to {}", self.config.url);
            self.emit(LiveEvent::Connected).await;
        }

        loop {
            tokio::select! {
                outbound = out_rx.recv() => match outbound {
                    Some(Outbound::Frame(text)) => {
                        if writer.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = writer.send(WsMessage::Close(None)).await;
                        break;
                    }
                },
                inbound = reader.next() => match inbound {
                    Some(Ok(WsMessage::Text(text))) => self.handle_inbound(text.as_bytes()).await,
                    Some(Ok(WsMessage::Binary(data))) => self.handle_inbound(&data).await,
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
            }
        }

        *self.outgoing.lock().await = None;
        self.fail_pending().await;
    }

    /// Serve `first`, then keep reconnecting until closed or out of attempts.
    async fn supervise(self: Arc<Self>, first: Socket) {
        let mut socket = Some(first);
        let mut reconnecting = false;
        let mut attempt: u32 = 0;

        loop {
            let mut ws = match socket.take() {
                Some(ws) => ws,
                None => match tokio_tungstenite::connect_async(self.config.connect_url()).await {
                    Ok((ws, _)) => ws,
                    Err(e) => {
                        attempt += 1;
                        if self
                            .config
                            .max_reconnect_attempts
                            .is_some_and(|max| attempt >= max)
                        {
                            log::error!("Giving up on live feed after {attempt} attempts: {e}");
                            self.set_state(ConnectionState::Disconnected).await;
                            break;
                        }
                        let delay = self.config.backoff(attempt);
                        log::warn!("Reconnect attempt {attempt} failed ({e}), retrying in {delay:?}");
                        tokio::time::sleep(delay).await;
                        if self.closed.load(Ordering::SeqCst) {
                            self.set_state(ConnectionState::Disconnected).await;
                            break;
                        }
                        continue;
                    }
                },
            };
            attempt = 0;

            if self.closed.load(Ordering::SeqCst) {
                let _ = ws.close(None).await;
                self.set_state(ConnectionState::Disconnected).await;
                self.emit(LiveEvent::Disconnected).await;
                break;
            }

            self.serve(ws, reconnecting).await;

            if self.closed.load(Ordering::SeqCst) {
                self.set_state(ConnectionState::Disconnected).await;
                self.emit(LiveEvent::Disconnected).await;
                break;
            }

            log::warn!("Live feed connection lost");
            self.set_state(ConnectionState::Reconnecting).await;
            self.emit(LiveEvent::Disconnected).await;
            reconnecting = true;
        }
    }
}

/// tokio-tungstenite implementation of [`LiveFeed`].
pub struct WsLiveFeed {
    shared: Arc<Shared>,
    event_rx: Option<mpsc::Receiver<LiveEvent>>,
}

impl WsLiveFeed {
    pub fn new(config: LiveFeedConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        Self {
            shared: Arc::new(Shared {
                config,
                state: RwLock::new(ConnectionState::Disconnected),
                outgoing: Mutex::new(None),
                joined: Mutex::new(HashSet::new()),
                pending: Mutex::new(HashMap::new()),
                event_tx,
                closed: AtomicBool::new(false),
            }),
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<LiveEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// The first attempt is made inline so the caller learns about a bad URL
    /// or a server that is down. After that a background task owns the socket
    /// and reconnects on its own.
    pub async fn connect(&self) -> Result<(), LiveFeedError> {
        self.shared.closed.store(false, Ordering::SeqCst);
        self.shared.set_state(ConnectionState::Connecting).await;

        match tokio_tungstenite::connect_async(self.shared.config.connect_url()).await {
            Ok((socket, _)) => {
                tokio::spawn(self.shared.clone().supervise(socket));
                Ok(())
            }
            Err(e) => {
                self.shared.set_state(ConnectionState::Disconnected).await;
                Err(LiveFeedError::Connect(e.to_string()))
            }
        }
    }

    /// Close the socket and stop reconnecting.
    pub async fn disconnect(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let tx = self.shared.outgoing.lock().await.clone();
        if let Some(tx) = tx {
            let _ = tx.send(Outbound::Close).await;
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// Rooms that will be re-joined after a reconnect.
    pub async fn joined_rooms(&self) -> Vec<RoomId> {
        let mut rooms: Vec<RoomId> = self.shared.joined.lock().await.iter().cloned().collect();
        rooms.sort();
        rooms
    }

}

#[async_trait]
impl LiveFeed for WsLiveFeed {
    async fn join(&self, room_id: &RoomId) -> Result<(), LiveFeedError> {
        self.shared.send_frame(&LiveFrame::join(room_id.clone())).await?;
        self.shared.joined.lock().await.insert(room_id.clone());
        log::debug!("Joined room {room_id}");
        Ok(())
    }

    async fn leave(&self, room_id: &RoomId) -> Result<(), LiveFeedError> {
        let was_joined = self.shared.joined.lock().await.remove(room_id);
        if was_joined && self.is_connected().await {
            self.shared.send_frame(&LiveFrame::leave(room_id.clone())).await?;
            log::debug!("Left room {room_id}");
        }
        Ok(())
    }

    async fn send(&self, room_id: &RoomId, draft: &MessageDraft) -> Result<Message, LiveFeedError> {
        if !self.is_connected().await {
            return Err(LiveFeedError::Disconnected);
        }

        let client_msg_id = Uuid::new_v4().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .await
            .insert(client_msg_id.clone(), reply_tx);

        let frame = LiveFrame::send(client_msg_id.clone(), room_id.clone(), draft.clone());
        if let Err(e) = self.shared.send_frame(&frame).await {
            self.shared.pending.lock().await.remove(&client_msg_id);
            return Err(e);
        }

        let timeout = Duration::from_millis(self.shared.config.ack_timeout_ms);
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LiveFeedError::Disconnected),
            Err(_) => {
                self.shared.pending.lock().await.remove(&client_msg_id);
                Err(LiveFeedError::AckTimeout(timeout))
            }
        }
    }

    async fn is_connected(&self) -> bool {
        *self.shared.state.read().await == ConnectionState::Connected
    }
}

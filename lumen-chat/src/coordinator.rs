//! Message sync coordinator.
//!
//! One actor task owns the open room, its pagination state and the cache
//! observation. Everything that can change them arrives on a channel:
//!
//! ```text
//! SyncHandle ── Command ──────────┐
//! LiveFeed ──── LiveEvent ────────┤
//! fetch/send tasks ── Internal ───┼──► SyncCoordinator::run ──► watch<RoomView>
//! Observation ── Snapshot ────────┘                         └─► watch<ConnectionState>
//! ```
//!
//! Network calls run in spawned tasks and report back through `Internal`,
//! so a slow fetch never stalls live delivery. Each open room gets a fresh
//! [`SessionToken`]; completions carrying an older token are dropped.

use std::sync::Arc;

use lumen_core::{DraftError, Message, MessageDraft, RoomId};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::cache::{CacheError, MessageCache, Observation, Snapshot};
use crate::fetcher::{FetchError, Page, PageFetcher};
use crate::live::{ConnectionState, LiveEvent, LiveFeed, LiveFeedError};
use crate::pagination::{PaginationState, Refusal};
use crate::view::{merge_snapshot, RoomView};

/// Coordinator errors surfaced to callers.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("network error: {0}")]
    Network(#[from] FetchError),
    #[error("invalid draft: {0}")]
    Validation(#[from] DraftError),
    #[error("live feed is not connected")]
    Disconnected,
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("live feed error: {0}")]
    Live(LiveFeedError),
    #[error("no room is open")]
    NoOpenRoom,
    #[error("sync coordinator has stopped")]
    CoordinatorStopped,
}

impl From<LiveFeedError> for SyncError {
    fn from(err: LiveFeedError) -> Self {
        match err {
            LiveFeedError::Disconnected => SyncError::Disconnected,
            other => SyncError::Live(other),
        }
    }
}

/// Result of a page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    /// The page was stored. `exhausted` is set when it was the last one.
    Loaded { received: usize, exhausted: bool },
    /// Another page request was outstanding; nothing was sent.
    InFlight,
    /// No cursor to continue from; nothing was sent.
    Exhausted,
    /// The room was closed before the page arrived.
    Discarded,
}

/// Coordinator statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub pages_loaded: u64,
    pub pages_discarded: u64,
    pub live_messages: u64,
    pub messages_sent: u64,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Command queue capacity (default: 64)
    pub command_buffer: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self { command_buffer: 64 }
    }
}

/// Identity of one open-room session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SessionToken(u64);

type PageReply = oneshot::Sender<Result<PageOutcome, SyncError>>;
type SendReply = oneshot::Sender<Result<Message, SyncError>>;

enum Command {
    OpenRoom {
        room_id: RoomId,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    CloseRoom {
        reply: oneshot::Sender<()>,
    },
    LoadPage {
        kind: PageKind,
        reply: PageReply,
    },
    Send {
        draft: MessageDraft,
        reply: SendReply,
    },
    Stats {
        reply: oneshot::Sender<SyncStats>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageKind {
    Initial,
    Next,
}

enum Internal {
    PageFetched {
        token: SessionToken,
        result: Result<Page, FetchError>,
    },
    Sent {
        result: Result<Message, LiveFeedError>,
        reply: SendReply,
    },
}

/// State of the open room.
struct RoomSession {
    room_id: RoomId,
    token: SessionToken,
    pagination: PaginationState,
    /// Reply for the outstanding page request, if any.
    pending: Option<PageReply>,
    /// Whether the live feed has accepted a join for this session.
    joined: bool,
    observation: Observation,
}

/// Cloneable front end to the coordinator task.
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<RoomView>,
    connection: watch::Receiver<ConnectionState>,
}

impl SyncHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| SyncError::CoordinatorStopped)?;
        rx.await.map_err(|_| SyncError::CoordinatorStopped)
    }

    /// Open `room_id`, replay its cached messages and join its live feed.
    ///
    /// Opening the room that is already open is a no-op. Opening another room
    /// closes the current one first. When the live feed is down the room is
    /// still opened and `Disconnected` is returned; the join follows on the
    /// next connect.
    pub async fn open_room(&self, room_id: impl Into<RoomId>) -> Result<(), SyncError> {
        let room_id = room_id.into();
        self.request(|reply| Command::OpenRoom { room_id, reply })
            .await?
    }

    /// Leave the live feed and release the cache observation.
    pub async fn close_room(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::CloseRoom { reply }).await
    }

    /// Fetch the newest page. Acts as a refresh when pages were loaded before.
    pub async fn load_initial_page(&self) -> Result<PageOutcome, SyncError> {
        self.request(|reply| Command::LoadPage {
            kind: PageKind::Initial,
            reply,
        })
        .await?
    }

    /// Fetch the page behind the stored cursor.
    pub async fn load_next_page(&self) -> Result<PageOutcome, SyncError> {
        self.request(|reply| Command::LoadPage {
            kind: PageKind::Next,
            reply,
        })
        .await?
    }

    /// Post a message to the open room. Returns the server's copy.
    pub async fn send(&self, draft: MessageDraft) -> Result<Message, SyncError> {
        self.request(|reply| Command::Send { draft, reply }).await?
    }

    pub async fn stats(&self) -> Result<SyncStats, SyncError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Subscribe to view updates.
    pub fn view(&self) -> watch::Receiver<RoomView> {
        self.view.clone()
    }

    pub fn current_view(&self) -> RoomView {
        self.view.borrow().clone()
    }

    /// Subscribe to live connection state.
    pub fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }
}

/// The coordinator actor.
pub struct SyncCoordinator<C, F, L> {
    cache: Arc<C>,
    fetcher: Arc<F>,
    live: Arc<L>,
    commands: mpsc::Receiver<Command>,
    live_events: mpsc::Receiver<LiveEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    view_tx: watch::Sender<RoomView>,
    connection_tx: watch::Sender<ConnectionState>,
    session: Option<RoomSession>,
    next_token: u64,
    revision: u64,
    stats: SyncStats,
}

impl<C, F, L> SyncCoordinator<C, F, L>
where
    C: MessageCache,
    F: PageFetcher,
    L: LiveFeed,
{
    /// Start the coordinator task.
    ///
    /// `live_events` must be the event queue of `live`. The task stops once
    /// every [`SyncHandle`] is dropped.
    pub fn spawn(
        cache: Arc<C>,
        fetcher: Arc<F>,
        live: Arc<L>,
        live_events: mpsc::Receiver<LiveEvent>,
        config: CoordinatorConfig,
    ) -> (SyncHandle, JoinHandle<()>) {
        let (command_tx, commands) = mpsc::channel(config.command_buffer.max(1));
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(RoomView::default());
        let (connection_tx, connection_rx) = watch::channel(ConnectionState::Disconnected);

        let coordinator = Self {
            cache,
            fetcher,
            live,
            commands,
            live_events,
            internal_tx,
            internal_rx,
            view_tx,
            connection_tx,
            session: None,
            next_token: 0,
            revision: 0,
            stats: SyncStats::default(),
        };

        let handle = SyncHandle {
            commands: command_tx,
            view: view_rx,
            connection: connection_rx,
        };
        (handle, tokio::spawn(coordinator.run()))
    }

    async fn run(mut self) {
        if self.live.is_connected().await {
            self.connection_tx.send_replace(ConnectionState::Connected);
        }
        log::debug!("Sync coordinator started");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = self.live_events.recv() => self.handle_live_event(event).await,
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
                Some(snapshot) = next_snapshot(&mut self.session) => self.apply_snapshot(snapshot),
            }
        }

        self.close_room().await;
        log::debug!("Sync coordinator stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::OpenRoom { room_id, reply } => {
                let result = self.open_room(room_id).await;
                let _ = reply.send(result);
            }
            Command::CloseRoom { reply } => {
                self.close_room().await;
                let _ = reply.send(());
            }
            Command::LoadPage { kind, reply } => self.load_page(kind, reply),
            Command::Send { draft, reply } => self.send(draft, reply),
            Command::Stats { reply } => {
                let _ = reply.send(self.stats);
            }
        }
    }

    async fn open_room(&mut self, room_id: RoomId) -> Result<(), SyncError> {
        if let Some(session) = &self.session {
            if session.room_id == room_id {
                return if session.joined {
                    Ok(())
                } else {
                    self.join_current().await
                };
            }
            self.close_room().await;
        }

        let observation = self.cache.observe(&room_id)?;
        self.next_token += 1;
        self.session = Some(RoomSession {
            room_id: room_id.clone(),
            token: SessionToken(self.next_token),
            pagination: PaginationState::new(),
            pending: None,
            joined: false,
            observation,
        });
        log::info!("Opened room {room_id}");

        self.sync_view();
        self.join_current().await
    }

    async fn join_current(&mut self) -> Result<(), SyncError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        if !self.live.is_connected().await {
            session.joined = false;
            return Err(SyncError::Disconnected);
        }
        self.live.join(&session.room_id).await?;
        session.joined = true;
        Ok(())
    }

    async fn close_room(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if let Some(reply) = session.pending.take() {
            let _ = reply.send(Ok(PageOutcome::Discarded));
        }
        // Also when not joined: the feed may still re-join it after a reconnect.
        if let Err(e) = self.live.leave(&session.room_id).await {
            log::warn!("Failed to leave room {}: {e}", session.room_id);
        }
        log::info!("Closed room {}", session.room_id);
        drop(session);
        self.publish(None, Arc::new(Vec::new()));
    }

    fn load_page(&mut self, kind: PageKind, reply: PageReply) {
        let Some(session) = self.session.as_mut() else {
            let _ = reply.send(Err(SyncError::NoOpenRoom));
            return;
        };

        let cursor = match kind {
            PageKind::Initial => session.pagination.begin_initial().map(|()| None),
            PageKind::Next => session.pagination.begin_next().map(Some),
        };
        let cursor = match cursor {
            Ok(cursor) => cursor,
            Err(Refusal::InFlight) => {
                log::debug!("Page request for {} dropped: fetch in flight", session.room_id);
                let _ = reply.send(Ok(PageOutcome::InFlight));
                return;
            }
            Err(Refusal::NoCursor) => {
                let _ = reply.send(Ok(PageOutcome::Exhausted));
                return;
            }
        };
        session.pending = Some(reply);

        let fetcher = self.fetcher.clone();
        let internal_tx = self.internal_tx.clone();
        let room_id = session.room_id.clone();
        let token = session.token;
        tokio::spawn(async move {
            let result = fetcher.fetch_messages(&room_id, cursor.as_ref()).await;
            let _ = internal_tx.send(Internal::PageFetched { token, result });
        });
    }

    fn send(&mut self, draft: MessageDraft, reply: SendReply) {
        if let Err(e) = draft.validate() {
            let _ = reply.send(Err(e.into()));
            return;
        }
        let Some(session) = &self.session else {
            let _ = reply.send(Err(SyncError::NoOpenRoom));
            return;
        };

        let live = self.live.clone();
        let internal_tx = self.internal_tx.clone();
        let room_id = session.room_id.clone();
        tokio::spawn(async move {
            let result = live.send(&room_id, &draft).await;
            let _ = internal_tx.send(Internal::Sent { result, reply });
        });
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::PageFetched { token, result } => self.on_page_fetched(token, result),
            Internal::Sent { result, reply } => {
                let outcome = self.on_sent(result);
                let _ = reply.send(outcome);
            }
        }
    }

    fn on_page_fetched(&mut self, token: SessionToken, result: Result<Page, FetchError>) {
        let Some(session) = self.session.as_mut().filter(|s| s.token == token) else {
            self.stats.pages_discarded += 1;
            log::debug!("Discarding page for a closed room session");
            return;
        };
        let reply = session.pending.take();

        let outcome = match result {
            Ok(page) => match self.cache.upsert(&page.items) {
                Ok(()) => {
                    let received = page.items.len();
                    session.pagination.complete(page.next_cursor);
                    self.stats.pages_loaded += 1;
                    log::debug!("Loaded {received} messages for room {}", session.room_id);
                    Ok(PageOutcome::Loaded {
                        received,
                        exhausted: session.pagination.is_exhausted(),
                    })
                }
                Err(e) => {
                    session.pagination.fail();
                    log::error!("Failed to store page for room {}: {e}", session.room_id);
                    Err(SyncError::Cache(e))
                }
            },
            Err(e) => {
                session.pagination.fail();
                log::warn!("Page fetch for room {} failed: {e}", session.room_id);
                Err(SyncError::Network(e))
            }
        };

        self.sync_view();
        if let Some(reply) = reply {
            let _ = reply.send(outcome);
        }
    }

    fn on_sent(&mut self, result: Result<Message, LiveFeedError>) -> Result<Message, SyncError> {
        let message = result?;
        self.cache.upsert(std::slice::from_ref(&message))?;
        self.stats.messages_sent += 1;
        self.sync_view();
        Ok(message)
    }

    async fn handle_live_event(&mut self, event: LiveEvent) {
        let first_connect = event == LiveEvent::Connected;
        match event {
            LiveEvent::Connected | LiveEvent::Reconnected => {
                self.connection_tx.send_replace(ConnectionState::Connected);
                match self.session.as_mut() {
                    // Already joined on this connection.
                    Some(session) if first_connect && session.joined => return,
                    Some(session) => session.joined = false,
                    None => {}
                }
                match self.join_current().await {
                    Ok(()) => {}
                    Err(e) => log::warn!("Re-join after connect failed: {e}"),
                }
            }
            LiveEvent::Disconnected => {
                self.connection_tx.send_replace(ConnectionState::Disconnected);
                if let Some(session) = self.session.as_mut() {
                    session.joined = false;
                }
            }
            LiveEvent::Message(message) => self.on_live_message(message),
        }
    }

    /// Store a pushed message. A repeated id overwrites in place.
    fn on_live_message(&mut self, message: Message) {
        if let Err(e) = self.cache.upsert(std::slice::from_ref(&message)) {
            log::error!("Failed to store live message {}: {e}", message.id);
            return;
        }
        self.stats.live_messages += 1;
        self.sync_view();
    }

    /// Publish the newest snapshot already queued on the observation.
    ///
    /// Cache writes notify synchronously, so after an upsert the snapshot is
    /// waiting. Draining here keeps snapshots in write order.
    fn sync_view(&mut self) {
        let latest = self
            .session
            .as_mut()
            .and_then(|session| session.observation.latest());
        if let Some(snapshot) = latest {
            self.apply_snapshot(snapshot);
        }
    }

    fn apply_snapshot(&mut self, snapshot: Snapshot) {
        let is_current = self
            .session
            .as_ref()
            .is_some_and(|session| session.room_id == snapshot.room_id);
        if !is_current {
            return;
        }
        let messages = Arc::unwrap_or_clone(snapshot.messages);
        self.publish(Some(snapshot.room_id), Arc::new(merge_snapshot(messages)));
    }

    fn publish(&mut self, room_id: Option<RoomId>, messages: Arc<Vec<Message>>) {
        self.revision += 1;
        self.view_tx.send_replace(RoomView {
            room_id,
            messages,
            revision: self.revision,
        });
    }
}

async fn next_snapshot(session: &mut Option<RoomSession>) -> Option<Snapshot> {
    match session {
        Some(session) => session.observation.next().await,
        None => std::future::pending().await,
    }
}

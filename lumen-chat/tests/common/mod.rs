//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use lumen_chat::{
    CoordinatorConfig, FetchError, LiveEvent, LiveFeed, LiveFeedError, MemoryCache, Page,
    PageFetcher, RoomView, SyncCoordinator, SyncHandle,
};
use lumen_core::{Cursor, Message, MessageDraft, RoomId, UserSummary};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{timeout, Duration};

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn msg(id: &str, room: &str, secs: i64) -> Message {
    Message::new(id, room, UserSummary::new("u1", "Ada"), at(secs)).with_content(id)
}

/// Fetcher serving canned pages keyed by cursor (`None` = newest page).
#[derive(Default)]
pub struct ScriptedFetcher {
    pages: Mutex<HashMap<Option<Cursor>, Result<Page, FetchError>>>,
    cursors: Mutex<Vec<Option<Cursor>>>,
    calls: AtomicUsize,
    gate: Option<Semaphore>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every fetch waits for a [`release`](Self::release) before answering.
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        }
    }

    pub fn page(self, cursor: Option<&str>, items: Vec<Message>, next: Option<&str>) -> Self {
        self.pages.lock().unwrap().insert(
            cursor.map(Cursor::from),
            Ok(Page {
                items,
                next_cursor: next.map(Cursor::from),
            }),
        );
        self
    }

    pub fn failing(self, cursor: Option<&str>, error: FetchError) -> Self {
        self.pages
            .lock()
            .unwrap()
            .insert(cursor.map(Cursor::from), Err(error));
        self
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn cursors(&self) -> Vec<Option<Cursor>> {
        self.cursors.lock().unwrap().clone()
    }

    pub async fn wait_for_calls(&self, n: usize) {
        timeout(Duration::from_secs(2), async {
            while self.calls() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("fetch was never issued");
    }
}

#[async_trait]
impl PageFetcher for ScriptedFetcher {
    async fn fetch_messages(
        &self,
        _room_id: &RoomId,
        cursor: Option<&Cursor>,
    ) -> Result<Page, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.cursors.lock().unwrap().push(cursor.cloned());
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.pages
            .lock()
            .unwrap()
            .get(&cursor.cloned())
            .cloned()
            .unwrap_or_else(|| Ok(Page::default()))
    }
}

/// In-process live feed that records joins and leaves.
pub struct MockLive {
    connected: AtomicBool,
    joins: Mutex<Vec<RoomId>>,
    leaves: Mutex<Vec<RoomId>>,
    sent: AtomicUsize,
}

impl MockLive {
    pub fn new(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
            joins: Mutex::new(Vec::new()),
            leaves: Mutex::new(Vec::new()),
            sent: AtomicUsize::new(0),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn joins(&self) -> Vec<RoomId> {
        self.joins.lock().unwrap().clone()
    }

    pub fn leaves(&self) -> Vec<RoomId> {
        self.leaves.lock().unwrap().clone()
    }
}

#[async_trait]
impl LiveFeed for MockLive {
    async fn join(&self, room_id: &RoomId) -> Result<(), LiveFeedError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(LiveFeedError::Disconnected);
        }
        self.joins.lock().unwrap().push(room_id.clone());
        Ok(())
    }

    async fn leave(&self, room_id: &RoomId) -> Result<(), LiveFeedError> {
        self.leaves.lock().unwrap().push(room_id.clone());
        Ok(())
    }

    async fn send(&self, room_id: &RoomId, draft: &MessageDraft) -> Result<Message, LiveFeedError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(LiveFeedError::Disconnected);
        }
        let n = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
        let mut message = Message::new(
            format!("sent-{n}"),
            room_id.clone(),
            UserSummary::new("me", "Me"),
            at(1_000 + n as i64),
        );
        message.content = draft.content.clone();
        message.attachments = draft.attachments.clone();
        Ok(message)
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

pub struct Harness {
    pub handle: SyncHandle,
    pub cache: Arc<MemoryCache>,
    pub fetcher: Arc<ScriptedFetcher>,
    pub live: Arc<MockLive>,
    pub events: mpsc::Sender<LiveEvent>,
}

impl Harness {
    pub fn start(cache: MemoryCache, fetcher: ScriptedFetcher, live: MockLive) -> Self {
        let cache = Arc::new(cache);
        let fetcher = Arc::new(fetcher);
        let live = Arc::new(live);
        let (events, events_rx) = mpsc::channel(32);
        let (handle, _task) = SyncCoordinator::spawn(
            cache.clone(),
            fetcher.clone(),
            live.clone(),
            events_rx,
            CoordinatorConfig::default(),
        );
        Self {
            handle,
            cache,
            fetcher,
            live,
            events,
        }
    }

    pub async fn push(&self, event: LiveEvent) {
        self.events.send(event).await.unwrap();
    }

    /// Wait until the published view satisfies `pred`.
    pub async fn wait_for_view(&self, pred: impl FnMut(&RoomView) -> bool) -> RoomView {
        let mut rx = self.handle.view();
        let view = timeout(Duration::from_secs(2), rx.wait_for(pred))
            .await
            .expect("view never reached the expected state")
            .unwrap()
            .clone();
        view
    }

    pub async fn wait_for_stats(&self, mut pred: impl FnMut(&lumen_chat::SyncStats) -> bool) {
        timeout(Duration::from_secs(2), async {
            loop {
                if pred(&self.handle.stats().await.unwrap()) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("stats never reached the expected state");
    }
}

/// Poll `check` until it holds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

//! Local message cache.
//!
//! Architecture:
//! ```text
//! ┌────────────────┐   upsert    ┌──────────────────┐
//! │ SyncCoordinator│ ──────────► │ MessageCache     │
//! └──────▲─────────┘             │ (memory/RocksDB) │
//!        │                       └────────┬─────────┘
//!        │  Snapshot (full room contents) │ notify
//!        └─────────── Observation ◄───────┘
//! ```
//!
//! Observers never receive deltas. Every notification carries the room's
//! complete contents, so a consumer that misses or coalesces events still
//! converges on the right state.

pub mod memory;
pub mod rocks;

pub use memory::MemoryCache;
pub use rocks::{CacheConfig, RocksCache};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use lumen_core::{Message, Room, RoomId};
use thiserror::Error;
use tokio::sync::mpsc;

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("cache lock poisoned")]
    Poisoned,
}

/// Persisted message store keyed by message id.
///
/// Writes are idempotent: upserting a message whose id is already stored
/// replaces it and never produces a second entry.
pub trait MessageCache: Send + Sync + 'static {
    /// Insert or replace messages by id, then notify observers of every
    /// touched room.
    fn upsert(&self, messages: &[Message]) -> Result<(), CacheError>;

    /// All messages of a room, in display order.
    fn query(&self, room_id: &RoomId) -> Result<Vec<Message>, CacheError>;

    /// Watch a room. The first snapshot is delivered immediately.
    fn observe(&self, room_id: &RoomId) -> Result<Observation, CacheError>;

    /// Insert or replace room records by id.
    fn upsert_rooms(&self, rooms: &[Room]) -> Result<(), CacheError>;

    /// Known rooms, most recently active first.
    fn rooms(&self) -> Result<Vec<Room>, CacheError>;
}

/// Full contents of one room at a point in time.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub room_id: RoomId,
    pub messages: Arc<Vec<Message>>,
}

/// Live subscription to a room's snapshots.
///
/// Dropping it releases the subscription; the registry prunes closed
/// observers on the next write.
#[derive(Debug)]
pub struct Observation {
    rx: mpsc::UnboundedReceiver<Snapshot>,
}

impl Observation {
    /// Wait for the next snapshot. `None` once the cache is gone.
    pub async fn next(&mut self) -> Option<Snapshot> {
        self.rx.recv().await
    }

    /// Take a pending snapshot without waiting.
    pub fn try_next(&mut self) -> Option<Snapshot> {
        self.rx.try_recv().ok()
    }

    /// Skip to the most recent pending snapshot.
    pub fn latest(&mut self) -> Option<Snapshot> {
        let mut latest = None;
        while let Ok(snapshot) = self.rx.try_recv() {
            latest = Some(snapshot);
        }
        latest
    }
}

/// Fan-out of snapshots to room observers. Shared by the cache backends.
#[derive(Debug, Default)]
pub struct ObserverRegistry {
    observers: Mutex<HashMap<RoomId, Vec<mpsc::UnboundedSender<Snapshot>>>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer and seed it with `initial`.
    pub fn register(&self, room_id: &RoomId, initial: Vec<Message>) -> Observation {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Snapshot {
            room_id: room_id.clone(),
            messages: Arc::new(initial),
        });
        self.lock().entry(room_id.clone()).or_default().push(tx);
        Observation { rx }
    }

    /// Whether anyone is still listening to `room_id`.
    pub fn is_observed(&self, room_id: &RoomId) -> bool {
        self.lock()
            .get(room_id)
            .is_some_and(|senders| senders.iter().any(|tx| !tx.is_closed()))
    }

    /// Number of live observers of `room_id`.
    pub fn observer_count(&self, room_id: &RoomId) -> usize {
        self.lock()
            .get(room_id)
            .map_or(0, |senders| senders.iter().filter(|tx| !tx.is_closed()).count())
    }

    /// Deliver a snapshot, dropping observers that went away.
    pub fn notify(&self, room_id: &RoomId, messages: Vec<Message>) {
        let snapshot = Snapshot {
            room_id: room_id.clone(),
            messages: Arc::new(messages),
        };
        let mut observers = self.lock();
        if let Some(senders) = observers.get_mut(room_id) {
            senders.retain(|tx| tx.send(snapshot.clone()).is_ok());
            if senders.is_empty() {
                observers.remove(room_id);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RoomId, Vec<mpsc::UnboundedSender<Snapshot>>>> {
        // Every critical section leaves the map consistent, so poison is ignored.
        self.observers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Sort messages into display order in place.
pub(crate) fn sort_for_display(messages: &mut [Message]) {
    messages.sort_by(Message::display_order);
}

//! In-memory message cache.
//!
//! Same observable behaviour as [`RocksCache`](super::RocksCache) without
//! touching disk. Used by tests and as a scratch cache when no storage path is
//! configured.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use lumen_core::{Message, MessageId, Room, RoomId};

use super::{sort_for_display, CacheError, MessageCache, Observation, ObserverRegistry};

#[derive(Debug, Default)]
struct MemoryInner {
    messages: HashMap<RoomId, HashMap<MessageId, Message>>,
    rooms: HashMap<RoomId, Room>,
}

impl MemoryInner {
    fn room_messages(&self, room_id: &RoomId) -> Vec<Message> {
        let mut messages: Vec<Message> = self
            .messages
            .get(room_id)
            .map(|by_id| by_id.values().cloned().collect())
            .unwrap_or_default();
        sort_for_display(&mut messages);
        messages
    }
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    inner: Mutex<MemoryInner>,
    observers: ObserverRegistry,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored messages across all rooms.
    pub fn message_count(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.messages.values().map(HashMap::len).sum())
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>, CacheError> {
        self.inner.lock().map_err(|_| CacheError::Poisoned)
    }
}

impl MessageCache for MemoryCache {
    fn upsert(&self, messages: &[Message]) -> Result<(), CacheError> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut touched = BTreeSet::new();
        let mut inner = self.lock()?;
        for message in messages {
            inner
                .messages
                .entry(message.room_id.clone())
                .or_default()
                .insert(message.id.clone(), message.clone());
            if let Some(room) = inner.rooms.get_mut(&message.room_id) {
                room.observe_message(message);
            }
            touched.insert(message.room_id.clone());
        }

        // Still under the lock, so snapshots reach observers in write order.
        for room_id in touched {
            if self.observers.is_observed(&room_id) {
                self.observers.notify(&room_id, inner.room_messages(&room_id));
            }
        }
        Ok(())
    }

    fn query(&self, room_id: &RoomId) -> Result<Vec<Message>, CacheError> {
        Ok(self.lock()?.room_messages(room_id))
    }

    fn observe(&self, room_id: &RoomId) -> Result<Observation, CacheError> {
        let inner = self.lock()?;
        // Registered under the lock so no write slips between seed and subscribe.
        Ok(self.observers.register(room_id, inner.room_messages(room_id)))
    }

    fn upsert_rooms(&self, rooms: &[Room]) -> Result<(), CacheError> {
        let mut inner = self.lock()?;
        for room in rooms {
            let mut room = room.clone();
            if let Some(newest) = inner.room_messages(&room.id).pop() {
                room.observe_message(&newest);
            }
            inner.rooms.insert(room.id.clone(), room);
        }
        Ok(())
    }

    fn rooms(&self) -> Result<Vec<Room>, CacheError> {
        let inner = self.lock()?;
        let mut rooms: Vec<Room> = inner.rooms.values().cloned().collect();
        rooms.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(rooms)
    }
}

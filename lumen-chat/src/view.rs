//! Merged room view handed to the UI.

use std::collections::HashMap;
use std::sync::Arc;

use lumen_core::{Message, MessageId, RoomId};

/// What the UI should display for the open room.
///
/// Each value fully replaces the previous one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomView {
    /// `None` while no room is open.
    pub room_id: Option<RoomId>,
    /// Unique by id, ascending by `created_at`.
    pub messages: Arc<Vec<Message>>,
    /// Bumped on every publish.
    pub revision: u64,
}

impl RoomView {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.messages.iter().map(|m| m.id.as_str()).collect()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.messages.iter().any(|m| &m.id == id)
    }

    pub fn newest(&self) -> Option<&Message> {
        self.messages.last()
    }
}

/// Deduplicate by id (last occurrence wins) and sort for display.
pub fn merge_snapshot<I>(messages: I) -> Vec<Message>
where
    I: IntoIterator<Item = Message>,
{
    let mut by_id: HashMap<MessageId, Message> = HashMap::new();
    for message in messages {
        by_id.insert(message.id.clone(), message);
    }
    let mut merged: Vec<Message> = by_id.into_values().collect();
    merged.sort_by(Message::display_order);
    merged
}

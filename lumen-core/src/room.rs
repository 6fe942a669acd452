use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{RoomId, UserId};
use crate::message::{Message, UserSummary};

/// A chat room and its most recent activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: RoomId,
    #[serde(default)]
    pub name: Option<String>,
    /// Unique by user id.
    #[serde(default)]
    pub participants: Vec<UserSummary>,
    #[serde(default)]
    pub last_message: Option<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Room {
    pub fn new(id: impl Into<RoomId>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            name: None,
            participants: Vec::new(),
            last_message: None,
            created_at,
            updated_at: created_at,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add a participant, replacing any existing entry with the same id.
    pub fn add_participant(&mut self, user: UserSummary) {
        match self.participants.iter_mut().find(|p| p.id == user.id) {
            Some(existing) => *existing = user,
            None => self.participants.push(user),
        }
    }

    pub fn has_participant(&self, user_id: &UserId) -> bool {
        self.participants.iter().any(|p| &p.id == user_id)
    }

    /// Advance `last_message` if `message` belongs here and is newer.
    ///
    /// Returns true when the room changed.
    pub fn observe_message(&mut self, message: &Message) -> bool {
        if message.room_id != self.id {
            return false;
        }
        let newer = match &self.last_message {
            Some(last) => message.display_order(last).is_gt(),
            None => true,
        };
        if newer {
            self.last_message = Some(message.clone());
            if message.created_at > self.updated_at {
                self.updated_at = message.created_at;
            }
        }
        newer
    }
}

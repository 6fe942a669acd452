//! # lumen-core, chat data model shared by the Lumen client crates
//!
//! Plain serde types with no I/O. Field names are camelCase on the JSON wire
//! and timestamps are RFC 3339 (`chrono::DateTime<Utc>`).

pub mod draft;
pub mod ids;
pub mod message;
pub mod room;

pub use draft::{DraftError, MessageDraft, MAX_CONTENT_CHARS};
pub use ids::{Cursor, MessageId, RoomId, UserId};
pub use message::{Message, UserSummary};
pub use room::Room;

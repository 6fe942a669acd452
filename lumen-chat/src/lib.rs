//! # lumen-chat, chat message synchronization for Lumen
//!
//! Reconciles a persisted per-room message history with a paginated HTTP
//! backfill and a live WebSocket push feed.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  LiveEvent (mpsc)  ┌──────────────────┐   PageFetcher   ┌──────────────┐
//! │ WsLiveFeed   │ ─────────────────► │ SyncCoordinator  │ ◄─────────────► │ HTTP backend │
//! │ (join/send)  │ ◄───────────────── │ (actor task)     │                 └──────────────┘
//! └──────────────┘                    └───┬──────────▲───┘
//!                                upsert   │          │ full snapshots
//!                                         ▼          │
//!                                    ┌─────────────────┐
//!                                    │ MessageCache    │
//!                                    │ (memory/RocksDB)│
//!                                    └─────────────────┘
//!                                         │
//!                                         ▼
//!                              RoomView (watch) → UI
//! ```
//!
//! The cache is the only source of truth for what is displayed. Live pushes
//! and fetched pages only ever upsert into it; the coordinator re-derives the
//! sorted, deduplicated view from each cache snapshot.
//!
//! ## Modules
//!
//! - [`protocol`]: JSON frames spoken on the live WebSocket
//! - [`cache`]: `MessageCache` trait, observation streams, memory and RocksDB stores
//! - [`fetcher`]: `PageFetcher` trait and the reqwest implementation
//! - [`live`]: `LiveFeed` trait and the tokio-tungstenite client
//! - [`pagination`]: per-room cursor state machine
//! - [`view`]: merge policy and the `RoomView` output
//! - [`coordinator`]: the actor that ties it all together

pub mod cache;
pub mod coordinator;
pub mod fetcher;
pub mod live;
pub mod pagination;
pub mod protocol;
pub mod view;

// Re-exports for convenience
pub use cache::{
    CacheConfig, CacheError, MemoryCache, MessageCache, Observation, RocksCache, Snapshot,
};
pub use coordinator::{
    CoordinatorConfig, PageOutcome, SyncCoordinator, SyncError, SyncHandle, SyncStats,
};
pub use fetcher::{FetchError, FetcherConfig, HttpPageFetcher, Page, PageFetcher};
pub use live::{ConnectionState, LiveEvent, LiveFeed, LiveFeedConfig, LiveFeedError, WsLiveFeed};
pub use pagination::PaginationState;
pub use protocol::{LiveFrame, ProtocolError};
pub use view::{merge_snapshot, RoomView};

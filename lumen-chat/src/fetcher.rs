//! Paginated history fetch over HTTP.
//!
//! ```text
//! GET {base_url}/rooms/{room_id}/messages?limit=50[&cursor=...]
//! Authorization: Bearer <token>            (optional)
//!
//! 200 { "items": [Message, ...], "nextCursor": "..." | null }
//! ```
//!
//! Items come back newest first; callers must not rely on their order.

use std::time::Duration;

use async_trait::async_trait;
use lumen_core::{Cursor, Message, RoomId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One page of room history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub items: Vec<Message>,
    /// `None` when there is nothing older.
    #[serde(default)]
    pub next_cursor: Option<Cursor>,
}

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("server returned HTTP {status}")]
    Status { status: u16 },
    #[error("could not decode page: {0}")]
    Decode(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Source of room history pages.
#[async_trait]
pub trait PageFetcher: Send + Sync + 'static {
    /// Fetch the page behind `cursor`, or the newest page when `cursor` is `None`.
    async fn fetch_messages(
        &self,
        room_id: &RoomId,
        cursor: Option<&Cursor>,
    ) -> Result<Page, FetchError>;
}

/// HTTP fetcher configuration.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// API root, e.g. `https://api.example.com/v1`
    pub base_url: String,
    /// Messages per page (default: 50)
    pub page_size: u32,
    /// Request timeout in seconds (default: 15)
    pub timeout_secs: u64,
    /// Bearer token sent with every request
    pub auth_token: Option<String>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            page_size: 50,
            timeout_secs: 15,
            auth_token: None,
        }
    }
}

/// reqwest-backed [`PageFetcher`].
#[derive(Debug, Clone)]
pub struct HttpPageFetcher {
    client: reqwest::Client,
    config: FetcherConfig,
}

impl HttpPageFetcher {
    pub fn new(config: FetcherConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn messages_url(&self, room_id: &RoomId) -> Result<reqwest::Url, FetchError> {
        let mut url = reqwest::Url::parse(&self.config.base_url)
            .map_err(|e| FetchError::InvalidRequest(format!("bad base url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| FetchError::InvalidRequest("base url cannot carry a path".into()))?
            .pop_if_empty()
            .extend(["rooms", room_id.as_str(), "messages"]);
        Ok(url)
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch_messages(
        &self,
        room_id: &RoomId,
        cursor: Option<&Cursor>,
    ) -> Result<Page, FetchError> {
        let url = self.messages_url(room_id)?;

        let mut request = self
            .client
            .get(url)
            .query(&[("limit", self.config.page_size.to_string())]);
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor.as_str())]);
        }
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }

        log::debug!("Fetching room {room_id} page (cursor: {cursor:?})");

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            log::warn!("Page fetch for room {room_id} failed with HTTP {status}");
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        serde_json::from_slice(&body).map_err(|e| FetchError::Decode(e.to_string()))
    }
}

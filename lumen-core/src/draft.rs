use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on message text, in characters.
pub const MAX_CONTENT_CHARS: usize = 4000;

/// An outgoing message before the server has accepted it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDraft {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub attachments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DraftError {
    #[error("draft has no content and no attachments")]
    Empty,
    #[error("attachment {0} has an empty URL")]
    BlankAttachment(usize),
    #[error("content is {0} characters, limit is {MAX_CONTENT_CHARS}")]
    TooLong(usize),
}

impl MessageDraft {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachment(mut self, url: impl Into<String>) -> Self {
        self.attachments.push(url.into());
        self
    }

    /// Check that the draft is sendable.
    pub fn validate(&self) -> Result<(), DraftError> {
        let text = self.content.as_deref().map(str::trim).unwrap_or_default();

        if let Some(index) = self.attachments.iter().position(|u| u.trim().is_empty()) {
            return Err(DraftError::BlankAttachment(index));
        }
        if text.is_empty() && self.attachments.is_empty() {
            return Err(DraftError::Empty);
        }
        let chars = text.chars().count();
        if chars > MAX_CONTENT_CHARS {
            return Err(DraftError::TooLong(chars));
        }
        Ok(())
    }
}

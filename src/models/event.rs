use std::sync::Arc;

use chrono::{DateTime, Utc};

/// An image attachment posted in a chat channel, as handed over by the gateway.
#[derive(Debug, Clone)]
pub struct AttachmentEvent {
    pub event_id: String,
    pub channel_id: String,
    pub author_id: String,
    pub attachment: Arc<[u8]>,
    pub received_at: DateTime<Utc>,
}

impl AttachmentEvent {
    pub fn new(
        event_id: impl Into<String>,
        channel_id: impl Into<String>,
        author_id: impl Into<String>,
        attachment: impl Into<Arc<[u8]>>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            channel_id: channel_id.into(),
            author_id: author_id.into(),
            attachment: attachment.into(),
            received_at: Utc::now(),
        }
    }

    /// Metadata visible to policy rules.
    pub fn metadata(&self) -> EventMetadata {
        EventMetadata {
            channel_id: self.channel_id.clone(),
            author_id: self.author_id.clone(),
        }
    }
}

/// Event context passed to the policy engine alongside the extracted text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventMetadata {
    pub channel_id: String,
    pub author_id: String,
}

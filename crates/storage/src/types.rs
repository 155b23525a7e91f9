use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use super::error::{ConflictSnafu, StorageResult};
use super::ids::MessageId;

/// Creation instant of a message, in microseconds since the Unix epoch.
///
/// This is the only ordering key for both the durable and the in-memory views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub fn now() -> Self {
        Self(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0_i64, |duration| {
                    i64::try_from(duration.as_micros()).unwrap_or(i64::MAX)
                }),
        )
    }

    pub const fn as_micros(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Storage-local sender, intentionally decoupled from presentation concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sender {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageContent {
    Text(String),
    Image { reference: String },
}

impl MessageContent {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn image(reference: impl Into<String>) -> Self {
        Self::Image {
            reference: reference.into(),
        }
    }

    /// Text body, or `None` for image content.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Image { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    Pending,
    Committed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub timestamp: Timestamp,
    pub sender: Sender,
    pub content: MessageContent,
    pub status: MessageStatus,
}

impl MessageRecord {
    pub fn new(
        id: MessageId,
        timestamp: Timestamp,
        sender: Sender,
        content: MessageContent,
        status: MessageStatus,
    ) -> Self {
        Self {
            id,
            timestamp,
            sender,
            content,
            status,
        }
    }

    /// Text body, empty for image content.
    pub fn text(&self) -> &str {
        self.content.as_text().unwrap_or_default()
    }
}

pub(crate) fn validate_image_reference(
    content: &MessageContent,
    stage: &'static str,
) -> StorageResult<()> {
    let MessageContent::Image { reference } = content else {
        return Ok(());
    };

    let reference_lower = reference.to_ascii_lowercase();
    let is_blob_like = reference_lower.starts_with("data:") || reference_lower.contains(";base64,");
    if is_blob_like {
        return ConflictSnafu {
            stage,
            entity: "message",
            details: "blob payloads are not allowed; store URI/path references only".to_string(),
        }
        .fail();
    }

    Ok(())
}

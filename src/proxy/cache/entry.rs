use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::fs::File as AsyncFile;

/// Sidecar stored next to every payload as `<stem>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    #[serde(rename = "content-type")]
    pub content_type: String,
    #[serde(rename = "created-at", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
    #[serde(
        rename = "content-length",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub content_length: Option<u64>,
}

impl EntryMetadata {
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            created_at: Some(
                SystemTime::now()
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs(),
            ),
            content_length: None,
        }
    }
}

/// A committed entry opened for reading.
#[derive(Debug)]
pub struct CachedEntry {
    pub file: AsyncFile,
    pub metadata: EntryMetadata,
    pub content_length: u64,
}

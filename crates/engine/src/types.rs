use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Name under which [`TransferEvent::Update`] is published to observers.
pub const DOWNLOAD_UPDATE_EVENT: &str = "download-update";

/// Lifecycle state of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Cancelled,
    Failed(String),
}

impl TransferStatus {
    /// Completed and Cancelled transfers never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Cancelled)
    }

    /// Pending and Downloading transfers have work in flight.
    pub fn is_active(&self) -> bool {
        matches!(self, TransferStatus::Pending | TransferStatus::Downloading)
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferStatus::Pending => write!(f, "pending"),
            TransferStatus::Downloading => write!(f, "downloading"),
            TransferStatus::Paused => write!(f, "paused"),
            TransferStatus::Completed => write!(f, "completed"),
            TransferStatus::Cancelled => write!(f, "cancelled"),
            TransferStatus::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// HTTP context captured from the browser when the download was intercepted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookies: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl From<&gripdl_protocol::DownloadRequest> for RequestContext {
    fn from(req: &gripdl_protocol::DownloadRequest) -> Self {
        Self {
            cookies: req.cookies.clone(),
            referrer: req.referrer.clone(),
            user_agent: req.user_agent.clone(),
        }
    }
}

/// One requested download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: String,
    pub source_url: String,
    pub destination_path: PathBuf,
    pub display_name: String,
    pub total_size: Option<u64>,
    pub downloaded_size: u64,
    pub status: TransferStatus,
    #[serde(default)]
    pub request_context: RequestContext,
    #[serde(default)]
    pub range_supported: bool,
    /// `ETag` or `Last-Modified` of the probed resource, sent as `If-Range`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TransferRecord {
    /// Fraction of the resource downloaded, when the size is known.
    pub fn progress(&self) -> Option<f64> {
        match self.total_size {
            Some(0) => Some(1.0),
            Some(total) => Some(self.downloaded_size as f64 / total as f64),
            None => None,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = now_secs();
    }
}

/// State of a single segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

/// One planned byte range of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub transfer_id: String,
    pub index: u32,
    pub start_offset: u64,
    /// Inclusive end; `None` for an open-ended fetch of unknown length.
    pub end_offset: Option<u64>,
    pub bytes_written: u64,
    pub status: SegmentStatus,
}

impl SegmentRecord {
    /// Whether every byte of a bounded range has been written.
    pub fn is_filled(&self) -> bool {
        self.end_offset
            .is_some_and(|end| self.bytes_written >= end + 1 - self.start_offset)
    }
}

/// Notification published by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransferEvent {
    /// Emitted on every status change and at the progress persistence rate.
    Update(TransferRecord),
}

impl TransferEvent {
    /// Event name as seen by observers.
    pub fn name(&self) -> &'static str {
        match self {
            TransferEvent::Update(_) => DOWNLOAD_UPDATE_EVENT,
        }
    }

    pub fn record(&self) -> &TransferRecord {
        match self {
            TransferEvent::Update(record) => record,
        }
    }
}

pub(crate) fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

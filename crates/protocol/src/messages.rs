use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// A download intercepted by the capture agent.
///
/// Everything except the URL is optional; the request context is captured
/// once here and never fetched again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookies: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(
        default,
        alias = "userAgent",
        skip_serializing_if = "Option::is_none"
    )]
    pub user_agent: Option<String>,
}

impl DownloadRequest {
    /// Creates a request with no context.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            cookies: None,
            referrer: None,
            user_agent: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// Reply sent back to the capture agent for every request frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CaptureResponse {
    /// The request was accepted and a transfer was created.
    pub fn accepted(transfer_id: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(transfer_id.into()),
        }
    }

    /// The request was rejected.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

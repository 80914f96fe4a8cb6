//! Engine tuning knobs.

use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Default user agent sent when the capture agent supplied none.
pub const DEFAULT_USER_AGENT: &str = "GripDL/1.0";

/// Default upper bound on segments per transfer.
pub const DEFAULT_MAX_SEGMENTS: u32 = 32;

/// Default lower bound on segment length (1 MiB).
pub const DEFAULT_MIN_SEGMENT_BYTES: u64 = 1024 * 1024;

/// Default write buffer flushed by a fetcher (256 KiB).
pub const DEFAULT_FLUSH_BYTES: usize = 256 * 1024;

/// Default idle time allowed between two reads of a response.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Runtime configuration of an [`Engine`](crate::Engine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory finished downloads are written to.
    pub download_dir: PathBuf,
    pub max_segments: u32,
    pub min_segment_bytes: u64,
    pub retry: RetryPolicy,
    /// Persist progress after at least this many new bytes...
    pub persist_bytes: u64,
    /// ...or after this much time, whichever comes first.
    pub persist_interval: Duration,
    pub flush_bytes: usize,
    /// Per-attempt request timeout. `None` lets a long range stream run.
    pub request_timeout: Option<Duration>,
    /// Longest wait for the next bytes of a response. A stalled attempt
    /// fails with a retryable network error.
    pub read_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            max_segments: DEFAULT_MAX_SEGMENTS,
            min_segment_bytes: DEFAULT_MIN_SEGMENT_BYTES,
            retry: RetryPolicy::default(),
            persist_bytes: 1024 * 1024,
            persist_interval: Duration::from_secs(1),
            flush_bytes: DEFAULT_FLUSH_BYTES,
            request_timeout: None,
            read_timeout: Some(DEFAULT_READ_TIMEOUT),
            connect_timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.into(),
        }
    }
}

/// Returns the platform download directory, falling back to the working dir.
pub fn default_download_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(|p| PathBuf::from(p).join("Downloads"))
            .unwrap_or_else(|_| PathBuf::from("."))
    }

    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(|h| PathBuf::from(h).join("Downloads"))
            .unwrap_or_else(|_| PathBuf::from("."))
    }
}

//! Error types for the capture channel.

/// Errors produced while decoding or encoding framed messages.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

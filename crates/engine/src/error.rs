//! Engine error type.

/// Errors produced by the download engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("probe failed: {0}")]
    Probe(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("server responded with status {status}")]
    Server { status: u16 },

    #[error("byte range no longer valid for this resource")]
    StaleRange,

    #[error("assembly failed: {0}")]
    Assembly(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("transfer not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine is shutting down")]
    ShuttingDown,
}

impl EngineError {
    /// Whether a fetch attempt failing with this error may be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Network(e) => !e.is_builder() && !e.is_redirect(),
            EngineError::Server { status } => (500..600).contains(status),
            EngineError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Persistence(e.to_string())
    }
}

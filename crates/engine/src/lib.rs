//! Segmented HTTP download engine.
//!
//! Splits a remote resource into byte ranges, fetches them concurrently with
//! retry, and reassembles the result. Transfer state is persisted so that
//! interrupted downloads resume from their last flushed offsets after a
//! restart.

pub mod assembler;
pub mod config;
mod engine;
pub mod error;
pub mod fetcher;
pub mod filename;
pub mod http;
mod orchestrator;
pub mod planner;
pub mod probe;
pub mod progress;
pub mod retry;
pub mod store;
pub mod types;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::EngineError;
pub use fetcher::{FetchOutcome, SegmentFetcher, SegmentJob};
pub use planner::{ByteRange, plan};
pub use probe::{ProbeResult, probe};
pub use retry::RetryPolicy;
pub use store::{JsonStore, MemoryStore, RecordStore, StoreSnapshot};
pub use types::{
    DOWNLOAD_UPDATE_EVENT, RequestContext, SegmentRecord, SegmentStatus, TransferEvent,
    TransferRecord, TransferStatus,
};

//! Durable transfer and segment records.
//!
//! The store is written only by the orchestrator task. [`JsonStore`] keeps a
//! single JSON document with both record sets and replaces it atomically on
//! every change; [`MemoryStore`] keeps them in memory only.

use std::collections::BTreeMap;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineError;
use crate::types::{SegmentRecord, TransferRecord};

/// Current on-disk document version.
const STATE_VERSION: u32 = 1;

/// Everything a store holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub transfers: Vec<TransferRecord>,
    pub segments: Vec<SegmentRecord>,
}

impl StoreSnapshot {
    /// Segments of one transfer, ordered by index.
    pub fn segments_of(&self, transfer_id: &str) -> Vec<SegmentRecord> {
        let mut segs: Vec<SegmentRecord> = self
            .segments
            .iter()
            .filter(|s| s.transfer_id == transfer_id)
            .cloned()
            .collect();
        segs.sort_by_key(|s| s.index);
        segs
    }
}

/// Persistence seam for transfer state.
///
/// `load` runs once while the engine starts. Writes are awaited by the
/// orchestrator task, so an implementation doing blocking I/O must move it
/// off the runtime. A failed write leaves the store as it was.
pub trait RecordStore: Send + 'static {
    /// Reads every record.
    fn load(&mut self) -> Result<StoreSnapshot, EngineError>;

    /// Inserts or replaces a transfer together with its full segment set.
    fn upsert(
        &mut self,
        transfer: &TransferRecord,
        segments: &[SegmentRecord],
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    /// Deletes a transfer and its segments. Unknown ids are ignored.
    fn remove(&mut self, transfer_id: &str) -> impl Future<Output = Result<(), EngineError>> + Send;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateDocument {
    version: u32,
    transfers: Vec<TransferRecord>,
    segments: Vec<SegmentRecord>,
}

#[derive(Debug, Clone, Default)]
struct Records {
    transfers: BTreeMap<String, TransferRecord>,
    segments: BTreeMap<String, Vec<SegmentRecord>>,
}

impl Records {
    fn upsert(&mut self, transfer: &TransferRecord, segments: &[SegmentRecord]) {
        self.transfers.insert(transfer.id.clone(), transfer.clone());
        if segments.is_empty() {
            self.segments.remove(&transfer.id);
        } else {
            self.segments.insert(transfer.id.clone(), segments.to_vec());
        }
    }

    fn remove(&mut self, transfer_id: &str) -> bool {
        let had_transfer = self.transfers.remove(transfer_id).is_some();
        let had_segments = self.segments.remove(transfer_id).is_some();
        had_transfer || had_segments
    }

    fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            transfers: self.transfers.values().cloned().collect(),
            segments: self.segments.values().flatten().cloned().collect(),
        }
    }

    fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let mut records = Records::default();
        for t in snapshot.transfers {
            records.transfers.insert(t.id.clone(), t);
        }
        for s in snapshot.segments {
            if records.transfers.contains_key(&s.transfer_id) {
                records
                    .segments
                    .entry(s.transfer_id.clone())
                    .or_default()
                    .push(s);
            }
        }
        for segs in records.segments.values_mut() {
            segs.sort_by_key(|s| s.index);
        }
        records
    }
}

// ---------------------------------------------------------------------------
// JsonStore
// ---------------------------------------------------------------------------

/// File-backed store (`state.json`).
pub struct JsonStore {
    path: PathBuf,
    records: Records,
}

impl JsonStore {
    /// Opens the store at `path`; a missing file is an empty store.
    pub fn open(path: PathBuf) -> Result<Self, EngineError> {
        let records = Records::from_snapshot(read_document(&path)?);
        Ok(Self { path, records })
    }

    /// Writes `next` to disk on the blocking pool and adopts it on success.
    async fn commit(&mut self, next: Records) -> Result<(), EngineError> {
        let snapshot = next.snapshot();
        let doc = StateDocument {
            version: STATE_VERSION,
            transfers: snapshot.transfers,
            segments: snapshot.segments,
        };
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_document(&path, &doc))
            .await
            .map_err(|e| EngineError::Persistence(format!("state writer stopped: {e}")))??;
        self.records = next;
        Ok(())
    }
}

impl RecordStore for JsonStore {
    fn load(&mut self) -> Result<StoreSnapshot, EngineError> {
        Ok(self.records.snapshot())
    }

    async fn upsert(
        &mut self,
        transfer: &TransferRecord,
        segments: &[SegmentRecord],
    ) -> Result<(), EngineError> {
        let mut next = self.records.clone();
        next.upsert(transfer, segments);
        self.commit(next).await
    }

    async fn remove(&mut self, transfer_id: &str) -> Result<(), EngineError> {
        let mut next = self.records.clone();
        if next.remove(transfer_id) {
            self.commit(next).await?;
        }
        Ok(())
    }
}

/// Writes the document to a sibling temp file and renames it into place.
///
/// The temp file is private from the moment it is created since it carries
/// captured cookies.
fn write_document(path: &Path, doc: &StateDocument) -> Result<(), EngineError> {
    let json = serde_json::to_vec_pretty(doc)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(persistence)?;
    }
    let tmp = path.with_extension("json.tmp");
    {
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp).map_err(persistence)?;
        // `mode` only applies to new files; a leftover temp file keeps its own.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))
                .map_err(persistence)?;
        }
        file.write_all(&json).map_err(persistence)?;
        file.sync_all().map_err(persistence)?;
    }
    std::fs::rename(&tmp, path).map_err(persistence)?;

    debug!(
        transfers = doc.transfers.len(),
        segments = doc.segments.len(),
        path = %path.display(),
        "persisted state"
    );
    Ok(())
}

fn read_document(path: &Path) -> Result<StoreSnapshot, EngineError> {
    if !path.exists() {
        return Ok(StoreSnapshot::default());
    }
    let data = std::fs::read(path).map_err(persistence)?;
    let doc: StateDocument = serde_json::from_slice(&data)?;
    if doc.version > STATE_VERSION {
        return Err(EngineError::Persistence(format!(
            "state file version {} is newer than supported version {STATE_VERSION}",
            doc.version
        )));
    }
    debug!(
        transfers = doc.transfers.len(),
        segments = doc.segments.len(),
        path = %path.display(),
        "loaded state"
    );
    Ok(StoreSnapshot {
        transfers: doc.transfers,
        segments: doc.segments,
    })
}

fn persistence(e: std::io::Error) -> EngineError {
    EngineError::Persistence(e.to_string())
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// Volatile store for embedding and tests.
#[derive(Default)]
pub struct MemoryStore {
    records: Records,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populated store.
    pub fn with_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            records: Records::from_snapshot(snapshot),
        }
    }
}

impl RecordStore for MemoryStore {
    fn load(&mut self) -> Result<StoreSnapshot, EngineError> {
        Ok(self.records.snapshot())
    }

    async fn upsert(
        &mut self,
        transfer: &TransferRecord,
        segments: &[SegmentRecord],
    ) -> Result<(), EngineError> {
        self.records.upsert(transfer, segments);
        Ok(())
    }

    async fn remove(&mut self, transfer_id: &str) -> Result<(), EngineError> {
        self.records.remove(transfer_id);
        Ok(())
    }
}

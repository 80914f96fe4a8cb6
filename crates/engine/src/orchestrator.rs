//! Transfer orchestrator.
//!
//! A single actor task owns every transfer and segment record. Commands from
//! [`Engine`](crate::Engine) handles arrive on an `mpsc` channel with
//! `oneshot` replies; probe, fetcher and assembly tasks report back on a
//! second channel. Every report carries the run generation it was spawned
//! under, so reports from an abandoned run are dropped.
//!
//! Pause and cancel of a running transfer are acknowledged only after every
//! fetcher has stopped and flushed.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gripdl_protocol::DownloadRequest;

use crate::assembler::{assemble, assembling_path, part_path};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::fetcher::{FetchOutcome, SegmentFetcher, SegmentJob};
use crate::filename;
use crate::http::build_client;
use crate::planner::{ByteRange, plan};
use crate::probe::{ProbeResult, probe};
use crate::progress::PersistThrottle;
use crate::store::RecordStore;
use crate::types::{
    RequestContext, SegmentRecord, SegmentStatus, TransferEvent, TransferRecord, TransferStatus,
    now_secs,
};

/// Command queue depth.
const COMMAND_CAPACITY: usize = 64;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

pub(crate) enum Command {
    Start {
        request: DownloadRequest,
        reply: Reply<String>,
    },
    Pause {
        id: String,
        reply: Reply<()>,
    },
    Resume {
        id: String,
        reply: Reply<()>,
    },
    Cancel {
        id: String,
        reply: Reply<()>,
    },
    List {
        reply: Reply<Vec<TransferRecord>>,
    },
    Get {
        id: String,
        reply: Reply<TransferRecord>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Reports from tasks spawned by the orchestrator.
enum Internal {
    Probed {
        id: String,
        run: u64,
        result: Result<ProbeResult, EngineError>,
    },
    Progress {
        id: String,
        run: u64,
        index: u32,
        bytes: u64,
    },
    SegmentFinished {
        id: String,
        run: u64,
        index: u32,
        outcome: FetchOutcome,
    },
    Assembled {
        id: String,
        run: u64,
        result: Result<(), EngineError>,
    },
}

/// What the transfer's background work is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Probing,
    Fetching,
    Assembling,
}

/// Why the running fetchers are being stopped. Higher rank wins.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Stop {
    Restart,
    Pause,
    Fail(String),
    Cancel,
}

impl Stop {
    fn rank(&self) -> u8 {
        match self {
            Stop::Restart => 0,
            Stop::Pause => 1,
            Stop::Fail(_) => 2,
            Stop::Cancel => 3,
        }
    }
}

struct Entry {
    record: TransferRecord,
    segments: Vec<SegmentRecord>,
    phase: Phase,
    run: u64,
    cancel: Option<CancellationToken>,
    active: usize,
    stop: Option<Stop>,
    /// Pause/cancel callers waiting for the fetchers to stop.
    waiters: Vec<Reply<()>>,
    throttle: PersistThrottle,
    client: Option<reqwest::Client>,
}

impl Entry {
    fn new(record: TransferRecord, segments: Vec<SegmentRecord>, config: &EngineConfig) -> Self {
        Self {
            record,
            segments,
            phase: Phase::Idle,
            run: 0,
            cancel: None,
            active: 0,
            stop: None,
            waiters: Vec::new(),
            throttle: PersistThrottle::new(config.persist_bytes, config.persist_interval),
            client: None,
        }
    }

    fn client(&mut self, config: &EngineConfig) -> Result<reqwest::Client, EngineError> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }
        let client = build_client(config, &self.record.request_context)?;
        self.client = Some(client.clone());
        Ok(client)
    }

    /// Starts a new run and returns its generation and cancellation token.
    fn next_run(&mut self, phase: Phase) -> (u64, CancellationToken) {
        self.run += 1;
        let token = CancellationToken::new();
        self.cancel = Some(token.clone());
        self.phase = phase;
        self.stop = None;
        (self.run, token)
    }

    fn request_stop(&mut self, stop: Stop) {
        if self.stop.as_ref().is_none_or(|cur| stop.rank() > cur.rank()) {
            self.stop = Some(stop);
        }
        if let Some(token) = &self.cancel {
            token.cancel();
        }
    }

    /// Abandons an in-flight probe, if any.
    fn abort_probe(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        self.phase = Phase::Idle;
    }

    fn segment_mut(&mut self, index: u32) -> Option<&mut SegmentRecord> {
        self.segments.iter_mut().find(|s| s.index == index)
    }

    fn set_plan(&mut self, ranges: Vec<ByteRange>) {
        let id = self.record.id.clone();
        self.segments = ranges
            .into_iter()
            .enumerate()
            .map(|(i, r)| SegmentRecord {
                transfer_id: id.clone(),
                index: i as u32,
                start_offset: r.start,
                end_offset: r.end,
                bytes_written: 0,
                status: SegmentStatus::Pending,
            })
            .collect();
    }

    fn remove_temporaries(&self) {
        let dest = &self.record.destination_path;
        let scratch = std::iter::once(assembling_path(dest));
        let parts = self.segments.iter().map(|s| part_path(dest, s.index));
        for path in parts.chain(scratch) {
            remove_if_exists(&path);
        }
    }
}

/// Loads the store and spawns the orchestrator task.
pub(crate) fn spawn<S: RecordStore>(
    config: EngineConfig,
    store: S,
    events: broadcast::Sender<TransferEvent>,
) -> Result<mpsc::Sender<Command>, EngineError> {
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();

    let mut orchestrator = Orchestrator {
        config,
        store,
        entries: HashMap::new(),
        events,
        internal_tx,
        shutdown: None,
    };
    let restored = orchestrator.restore()?;

    tokio::spawn(orchestrator.run(restored, commands_rx, internal_rx));
    Ok(commands_tx)
}

/// Store writes left over from [`Orchestrator::restore`].
#[derive(Default)]
struct Restored {
    /// Terminal transfers to drop.
    purge: Vec<String>,
    /// Transfers whose records were corrected in memory.
    rewrite: Vec<String>,
}

struct Orchestrator<S> {
    config: EngineConfig,
    store: S,
    entries: HashMap<String, Entry>,
    events: broadcast::Sender<TransferEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    /// Set once shutdown begins; holds the callers to notify.
    shutdown: Option<Vec<Reply<()>>>,
}

impl<S: RecordStore> Orchestrator<S> {
    /// Loads persisted records. Interrupted transfers come back as `Paused`.
    ///
    /// Corrections are applied in memory here and written once the task
    /// runs.
    fn restore(&mut self) -> Result<Restored, EngineError> {
        let snapshot = self.store.load()?;
        let mut restored = Restored::default();

        for mut record in snapshot.transfers.iter().cloned() {
            let mut segments = snapshot.segments_of(&record.id);

            if record.status.is_terminal() {
                restored.purge.push(record.id.clone());
                continue;
            }

            let mut changed = false;
            if record.status.is_active() {
                record.status = TransferStatus::Paused;
                changed = true;
            }
            for seg in &mut segments {
                let status = if seg.is_filled() {
                    SegmentStatus::Done
                } else if seg.status == SegmentStatus::InProgress {
                    SegmentStatus::Pending
                } else {
                    continue;
                };
                if seg.status != status {
                    seg.status = status;
                    changed = true;
                }
            }
            let written: u64 = segments.iter().map(|s| s.bytes_written).sum();
            if !segments.is_empty() && record.downloaded_size != written {
                record.downloaded_size = written;
                changed = true;
            }
            if changed {
                record.updated_at = now_secs();
                restored.rewrite.push(record.id.clone());
            }

            debug!(
                transfer = %record.id,
                status = %record.status,
                downloaded = record.downloaded_size,
                "restored transfer"
            );
            let id = record.id.clone();
            self.entries
                .insert(id, Entry::new(record, segments, &self.config));
        }

        info!(transfers = self.entries.len(), "transfer state loaded");
        Ok(restored)
    }

    async fn persist_restored(&mut self, restored: Restored) {
        for id in restored.purge {
            if let Err(e) = self.store.remove(&id).await {
                warn!(transfer = %id, error = %e, "failed to drop finished transfer");
            }
        }
        for id in restored.rewrite {
            let Some(entry) = self.entries.get(&id) else {
                continue;
            };
            if let Err(e) = self.store.upsert(&entry.record, &entry.segments).await {
                warn!(transfer = %id, error = %e, "failed to persist restored transfer");
            }
        }
    }

    async fn run(
        mut self,
        restored: Restored,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        self.persist_restored(restored).await;

        let period = self.config.persist_interval.max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut commands_open = true;

        loop {
            tokio::select! {
                cmd = commands.recv(), if commands_open => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        debug!("all engine handles dropped");
                        commands_open = false;
                        self.begin_shutdown(None).await;
                    }
                },
                Some(event) = internal.recv() => self.handle_internal(event).await,
                _ = ticker.tick() => self.flush_due().await,
            }

            if self.shutdown_ready() {
                self.finish_shutdown().await;
                break;
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start { request, reply } => {
                let result = if self.shutdown.is_some() {
                    Err(EngineError::ShuttingDown)
                } else {
                    self.start(request).await
                };
                let _ = reply.send(result);
            }
            Command::Pause { id, reply } => self.pause(&id, reply).await,
            Command::Resume { id, reply } => {
                if self.shutdown.is_some() {
                    let _ = reply.send(Err(EngineError::ShuttingDown));
                } else {
                    self.resume(&id, reply).await;
                }
            }
            Command::Cancel { id, reply } => self.cancel(&id, reply).await,
            Command::List { reply } => {
                let mut records: Vec<TransferRecord> =
                    self.entries.values().map(|e| e.record.clone()).collect();
                records.sort_by(|a, b| {
                    a.created_at
                        .cmp(&b.created_at)
                        .then_with(|| a.id.cmp(&b.id))
                });
                let _ = reply.send(Ok(records));
            }
            Command::Get { id, reply } => {
                let result = self
                    .entries
                    .get(&id)
                    .map(|e| e.record.clone())
                    .ok_or(EngineError::NotFound(id));
                let _ = reply.send(result);
            }
            Command::Shutdown { reply } => self.begin_shutdown(Some(reply)).await,
        }
    }

    async fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Probed { id, run, result } => self.on_probed(&id, run, result).await,
            Internal::Progress {
                id,
                run,
                index,
                bytes,
            } => self.on_progress(&id, run, index, bytes).await,
            Internal::SegmentFinished {
                id,
                run,
                index,
                outcome,
            } => self.on_segment_finished(&id, run, index, outcome).await,
            Internal::Assembled { id, run, result } => {
                self.on_assembled(&id, run, result).await
            }
        }
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn start(&mut self, request: DownloadRequest) -> Result<String, EngineError> {
        let url = request.url.trim().to_string();
        match reqwest::Url::parse(&url) {
            Ok(u) if matches!(u.scheme(), "http" | "https") => {}
            _ => return Err(EngineError::Probe(format!("unsupported URL: {url}"))),
        }

        let id = uuid::Uuid::new_v4().to_string();
        let name = filename::display_name(&url, &id);
        let entries = &self.entries;
        let destination = filename::unique_destination(&self.config.download_dir, &name, |p| {
            entries
                .values()
                .any(|e| !e.record.status.is_terminal() && e.record.destination_path == p)
        });
        let display_name = destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or(name);

        let now = now_secs();
        let record = TransferRecord {
            id: id.clone(),
            source_url: url,
            destination_path: destination,
            display_name,
            total_size: None,
            downloaded_size: 0,
            status: TransferStatus::Pending,
            request_context: RequestContext::from(&request),
            range_supported: false,
            validator: None,
            created_at: now,
            updated_at: now,
        };
        self.store.upsert(&record, &[]).await?;

        info!(
            transfer = %id,
            url = %record.source_url,
            destination = %record.destination_path.display(),
            "download queued"
        );
        emit(&self.events, &record);
        self.entries
            .insert(id.clone(), Entry::new(record, Vec::new(), &self.config));
        self.begin_probe(&id).await;
        Ok(id)
    }

    async fn pause(&mut self, id: &str, reply: Reply<()>) {
        let Some(entry) = self.entries.get_mut(id) else {
            let _ = reply.send(Err(EngineError::NotFound(id.to_string())));
            return;
        };

        let status = entry.record.status.clone();
        match (&status, entry.phase) {
            (_, Phase::Assembling) => {
                let _ = reply.send(Err(EngineError::InvalidState(
                    "download is being assembled".into(),
                )));
            }
            (TransferStatus::Paused, _) => {
                let _ = reply.send(Ok(()));
            }
            (
                TransferStatus::Completed | TransferStatus::Cancelled | TransferStatus::Failed(_),
                _,
            ) => {
                let msg = format!("cannot pause a {status} download");
                let _ = reply.send(Err(EngineError::InvalidState(msg)));
            }
            (_, Phase::Fetching) => {
                debug!(transfer = %id, "pausing, waiting for fetchers to stop");
                entry.request_stop(Stop::Pause);
                entry.waiters.push(reply);
            }
            (_, Phase::Probing | Phase::Idle) => {
                entry.abort_probe();
                entry.record.status = TransferStatus::Paused;
                let result = commit(&mut self.store, &self.events, entry).await;
                info!(transfer = %id, "download paused");
                let _ = reply.send(result);
            }
        }
    }

    async fn resume(&mut self, id: &str, reply: Reply<()>) {
        let Some(entry) = self.entries.get_mut(id) else {
            let _ = reply.send(Err(EngineError::NotFound(id.to_string())));
            return;
        };

        let previous = entry.record.status.clone();
        match previous {
            TransferStatus::Pending | TransferStatus::Downloading => {
                let _ = reply.send(Ok(()));
                return;
            }
            TransferStatus::Completed | TransferStatus::Cancelled => {
                let msg = format!("cannot resume a {previous} download");
                let _ = reply.send(Err(EngineError::InvalidState(msg)));
                return;
            }
            TransferStatus::Paused | TransferStatus::Failed(_) => {}
        }

        let needs_probe = entry.segments.is_empty();
        for seg in &mut entry.segments {
            if seg.status == SegmentStatus::Failed {
                seg.status = SegmentStatus::Pending;
            }
        }
        entry.record.status = if needs_probe {
            TransferStatus::Pending
        } else {
            TransferStatus::Downloading
        };

        if let Err(e) = commit(&mut self.store, &self.events, entry).await {
            entry.record.status = previous;
            emit(&self.events, &entry.record);
            let _ = reply.send(Err(e));
            return;
        }

        info!(transfer = %id, reprobe = needs_probe, "download resumed");
        if needs_probe {
            self.begin_probe(id).await;
        } else {
            self.spawn_fetchers(id).await;
        }
        let _ = reply.send(Ok(()));
    }

    async fn cancel(&mut self, id: &str, reply: Reply<()>) {
        let Some(entry) = self.entries.get_mut(id) else {
            let _ = reply.send(Err(EngineError::NotFound(id.to_string())));
            return;
        };

        let status = entry.record.status.clone();
        match (&status, entry.phase) {
            (TransferStatus::Cancelled, _) => {
                let _ = reply.send(Ok(()));
            }
            (_, Phase::Assembling) => {
                let _ = reply.send(Err(EngineError::InvalidState(
                    "download is being assembled".into(),
                )));
            }
            (TransferStatus::Completed, _) => {
                let _ = reply.send(Err(EngineError::InvalidState(
                    "cannot cancel a completed download".into(),
                )));
            }
            (_, Phase::Fetching) => {
                debug!(transfer = %id, "cancelling, waiting for fetchers to stop");
                entry.request_stop(Stop::Cancel);
                entry.waiters.push(reply);
            }
            (_, Phase::Probing | Phase::Idle) => {
                entry.abort_probe();
                entry.waiters.push(reply);
                self.finish_cancel(id).await;
            }
        }
    }

    async fn begin_shutdown(&mut self, reply: Option<Reply<()>>) {
        let first = self.shutdown.is_none();
        let waiters = self.shutdown.get_or_insert_with(Vec::new);
        if let Some(reply) = reply {
            waiters.push(reply);
        }
        if !first {
            return;
        }

        info!("engine shutting down, pausing active transfers");
        for entry in self.entries.values_mut() {
            match entry.phase {
                Phase::Probing => {
                    entry.abort_probe();
                    entry.record.status = TransferStatus::Paused;
                    commit_logged(&mut self.store, &self.events, entry).await;
                }
                Phase::Fetching => entry.request_stop(Stop::Pause),
                Phase::Idle | Phase::Assembling => {}
            }
        }
    }

    fn shutdown_ready(&self) -> bool {
        self.shutdown.is_some() && self.entries.values().all(|e| e.phase == Phase::Idle)
    }

    async fn finish_shutdown(&mut self) {
        for entry in self.entries.values_mut() {
            if entry.throttle.is_dirty() {
                commit_logged(&mut self.store, &self.events, entry).await;
            }
        }
        for reply in self.shutdown.take().unwrap_or_default() {
            let _ = reply.send(Ok(()));
        }
        info!("engine stopped");
    }

    // -----------------------------------------------------------------------
    // Background work
    // -----------------------------------------------------------------------

    async fn begin_probe(&mut self, id: &str) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        let client = match entry.client(&self.config) {
            Ok(client) => client,
            Err(e) => {
                fail(&mut self.store, &self.events, entry, e.to_string()).await;
                return;
            }
        };

        let (run, token) = entry.next_run(Phase::Probing);
        let url = entry.record.source_url.clone();
        let tx = self.internal_tx.clone();
        let id = id.to_string();

        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => debug!(transfer = %id, "probe abandoned"),
                result = probe(&client, &url) => {
                    let _ = tx.send(Internal::Probed { id, run, result });
                }
            }
        });
    }

    async fn on_probed(&mut self, id: &str, run: u64, result: Result<ProbeResult, EngineError>) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        if entry.run != run || entry.phase != Phase::Probing {
            return;
        }
        entry.cancel = None;
        entry.phase = Phase::Idle;

        let probed = match result {
            Ok(probed) => probed,
            Err(e) => {
                fail(&mut self.store, &self.events, entry, e.to_string()).await;
                return;
            }
        };

        if entry.record.total_size.is_none() {
            entry.record.total_size = probed.total_size;
        }
        entry.record.range_supported = probed.range_supported;
        entry.record.validator = probed.validator;

        let ranges = plan(
            entry.record.total_size,
            entry.record.range_supported,
            self.config.max_segments,
            self.config.min_segment_bytes,
        );
        entry.set_plan(ranges);
        entry.record.status = TransferStatus::Downloading;
        commit_logged(&mut self.store, &self.events, entry).await;

        info!(
            transfer = %id,
            size = ?entry.record.total_size,
            ranged = entry.record.range_supported,
            segments = entry.segments.len(),
            "download planned"
        );
        self.spawn_fetchers(id).await;
    }

    async fn spawn_fetchers(&mut self, id: &str) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        let client = match entry.client(&self.config) {
            Ok(client) => client,
            Err(e) => {
                fail(&mut self.store, &self.events, entry, e.to_string()).await;
                return;
            }
        };

        let fetcher = Arc::new(
            SegmentFetcher::new(
                client,
                entry.record.source_url.clone(),
                entry.record.validator.clone(),
                entry.record.range_supported,
                self.config.retry.clone(),
                self.config.flush_bytes,
            )
            .expect_total(entry.record.total_size),
        );
        let (run, token) = entry.next_run(Phase::Fetching);
        entry.active = 0;
        let destination = entry.record.destination_path.clone();

        for seg in entry
            .segments
            .iter_mut()
            .filter(|s| s.status != SegmentStatus::Done)
        {
            seg.status = SegmentStatus::InProgress;
            let index = seg.index;
            let job = SegmentJob {
                index,
                start_offset: seg.start_offset,
                end_offset: seg.end_offset,
                bytes_written: seg.bytes_written,
                part_path: part_path(&destination, index),
            };

            let fetcher = Arc::clone(&fetcher);
            let token = token.clone();
            let tx = self.internal_tx.clone();
            let id = id.to_string();

            tokio::spawn(async move {
                let progress_tx = tx.clone();
                let progress_id = id.clone();
                let outcome = fetcher
                    .fetch(job, token, move |bytes| {
                        let _ = progress_tx.send(Internal::Progress {
                            id: progress_id.clone(),
                            run,
                            index,
                            bytes,
                        });
                    })
                    .await;
                let _ = tx.send(Internal::SegmentFinished {
                    id,
                    run,
                    index,
                    outcome,
                });
            });
            entry.active += 1;
        }

        if entry.active == 0 {
            self.begin_assembly(id).await;
        } else {
            debug!(transfer = %id, fetchers = entry.active, run, "fetchers spawned");
        }
    }

    async fn on_progress(&mut self, id: &str, run: u64, index: u32, bytes: u64) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        if entry.run != run {
            return;
        }
        if let Some(seg) = entry.segment_mut(index) {
            seg.bytes_written += bytes;
        }
        entry.record.downloaded_size += bytes;

        if entry.throttle.record(bytes) {
            commit_logged(&mut self.store, &self.events, entry).await;
        }
    }

    async fn on_segment_finished(&mut self, id: &str, run: u64, index: u32, outcome: FetchOutcome) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        if entry.run != run || entry.phase != Phase::Fetching {
            return;
        }
        entry.active = entry.active.saturating_sub(1);

        match outcome {
            FetchOutcome::Done => {
                if let Some(seg) = entry.segment_mut(index) {
                    seg.status = SegmentStatus::Done;
                }
                debug!(transfer = %id, segment = index, "segment done");
            }
            FetchOutcome::Cancelled => {
                if let Some(seg) = entry.segment_mut(index) {
                    seg.status = SegmentStatus::Pending;
                }
            }
            FetchOutcome::StaleRange => {
                if let Some(seg) = entry.segment_mut(index) {
                    seg.status = SegmentStatus::Pending;
                }
                info!(transfer = %id, segment = index, "range no longer valid, restarting");
                entry.request_stop(Stop::Restart);
            }
            FetchOutcome::Failed(e) => {
                if let Some(seg) = entry.segment_mut(index) {
                    seg.status = SegmentStatus::Failed;
                }
                warn!(transfer = %id, segment = index, error = %e, "segment failed");
                entry.request_stop(Stop::Fail(e.to_string()));
            }
        }

        if entry.active > 0 {
            return;
        }

        entry.cancel = None;
        entry.phase = Phase::Idle;
        match entry.stop.take() {
            None => {
                if entry
                    .segments
                    .iter()
                    .all(|s| s.status == SegmentStatus::Done)
                {
                    self.begin_assembly(id).await;
                } else {
                    fail(
                        &mut self.store,
                        &self.events,
                        entry,
                        "segments stopped before completion".into(),
                    )
                    .await;
                }
            }
            Some(Stop::Pause) => {
                entry.record.status = TransferStatus::Paused;
                let result = commit(&mut self.store, &self.events, entry).await;
                info!(transfer = %id, downloaded = entry.record.downloaded_size, "download paused");
                reply_waiters(entry, &result);
            }
            Some(Stop::Fail(reason)) => {
                fail(&mut self.store, &self.events, entry, reason).await;
                reply_waiters(entry, &Ok(()));
            }
            Some(Stop::Cancel) => self.finish_cancel(id).await,
            Some(Stop::Restart) => self.restart_single(id).await,
        }
    }

    /// Drops all partial data and fetches the whole resource as one
    /// non-ranged, open-ended segment.
    ///
    /// The resource changed, so its old size is forgotten too; assembly
    /// takes the size from the bytes actually received.
    async fn restart_single(&mut self, id: &str) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        entry.remove_temporaries();
        entry.record.range_supported = false;
        entry.record.validator = None;
        entry.record.total_size = None;
        entry.record.downloaded_size = 0;
        let ranges = plan(
            None,
            false,
            self.config.max_segments,
            self.config.min_segment_bytes,
        );
        entry.set_plan(ranges);
        commit_logged(&mut self.store, &self.events, entry).await;
        self.spawn_fetchers(id).await;
    }

    async fn begin_assembly(&mut self, id: &str) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        if entry.record.total_size.is_none() {
            entry.record.total_size = Some(entry.record.downloaded_size);
        }
        commit_logged(&mut self.store, &self.events, entry).await;

        let (run, _) = entry.next_run(Phase::Assembling);
        entry.cancel = None;
        let destination = entry.record.destination_path.clone();
        let parts: Vec<_> = entry
            .segments
            .iter()
            .map(|s| part_path(&destination, s.index))
            .collect();
        let expected = entry.record.total_size;
        let tx = self.internal_tx.clone();
        let id = id.to_string();

        debug!(transfer = %id, parts = parts.len(), "assembling");
        tokio::spawn(async move {
            let result = assemble(&parts, &destination, expected).await;
            let _ = tx.send(Internal::Assembled { id, run, result });
        });
    }

    async fn on_assembled(&mut self, id: &str, run: u64, result: Result<(), EngineError>) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        if entry.run != run || entry.phase != Phase::Assembling {
            return;
        }
        entry.phase = Phase::Idle;

        match result {
            Ok(()) => {
                entry.record.status = TransferStatus::Completed;
                entry.record.touch();
                entry.segments.clear();
                entry.throttle.flushed();
                if let Err(e) = self.store.remove(id).await {
                    warn!(transfer = %id, error = %e, "failed to delete completed transfer records");
                }
                emit(&self.events, &entry.record);
                info!(
                    transfer = %id,
                    bytes = entry.record.downloaded_size,
                    destination = %entry.record.destination_path.display(),
                    "download completed"
                );
            }
            Err(e) => fail(&mut self.store, &self.events, entry, e.to_string()).await,
        }
    }

    async fn finish_cancel(&mut self, id: &str) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        entry.remove_temporaries();
        entry.segments.clear();
        entry.record.status = TransferStatus::Cancelled;
        entry.record.touch();
        entry.throttle.flushed();

        let result = self.store.remove(id).await;
        emit(&self.events, &entry.record);
        info!(transfer = %id, "download cancelled");
        reply_waiters(entry, &result);
    }

    async fn flush_due(&mut self) {
        for entry in self.entries.values_mut() {
            if entry.throttle.is_due() {
                commit_logged(&mut self.store, &self.events, entry).await;
            }
        }
    }
}

/// Persists the entry and publishes it.
async fn commit<S: RecordStore>(
    store: &mut S,
    events: &broadcast::Sender<TransferEvent>,
    entry: &mut Entry,
) -> Result<(), EngineError> {
    entry.record.touch();
    let result = store.upsert(&entry.record, &entry.segments).await;
    entry.throttle.flushed();
    emit(events, &entry.record);
    result
}

async fn commit_logged<S: RecordStore>(
    store: &mut S,
    events: &broadcast::Sender<TransferEvent>,
    entry: &mut Entry,
) {
    if let Err(e) = commit(store, events, entry).await {
        warn!(transfer = %entry.record.id, error = %e, "failed to persist transfer");
    }
}

async fn fail<S: RecordStore>(
    store: &mut S,
    events: &broadcast::Sender<TransferEvent>,
    entry: &mut Entry,
    reason: String,
) {
    warn!(transfer = %entry.record.id, %reason, "download failed");
    entry.phase = Phase::Idle;
    entry.cancel = None;
    entry.record.status = TransferStatus::Failed(reason);
    commit_logged(store, events, entry).await;
}

fn emit(events: &broadcast::Sender<TransferEvent>, record: &TransferRecord) {
    // No subscribers is fine.
    let _ = events.send(TransferEvent::Update(record.clone()));
}

fn reply_waiters(entry: &mut Entry, result: &Result<(), EngineError>) {
    for waiter in entry.waiters.drain(..) {
        let reply = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(EngineError::Persistence(e.to_string())),
        };
        let _ = waiter.send(reply);
    }
}

fn remove_if_exists(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed temporary file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove temporary file"),
    }
}

use tokio::sync::{broadcast, mpsc, oneshot};

use gripdl_protocol::DownloadRequest;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::orchestrator::{self, Command, Reply};
use crate::store::RecordStore;
use crate::types::{TransferEvent, TransferRecord};

/// Buffered events per subscriber before the slowest one starts lagging.
const EVENT_CAPACITY: usize = 256;

/// Cloneable handle to a running download engine.
///
/// All handles talk to one orchestrator task. Dropping every handle pauses
/// active transfers and stops the task, like [`Engine::shutdown`].
#[derive(Clone)]
pub struct Engine {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<TransferEvent>,
}

impl Engine {
    /// Loads `store` and starts the orchestrator.
    ///
    /// Transfers that were running when the state was last written come back
    /// `Paused`; nothing is resumed automatically. Must be called from within
    /// a Tokio runtime.
    pub fn init<S: RecordStore>(config: EngineConfig, store: S) -> Result<Self, EngineError> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let commands = orchestrator::spawn(config, store, events.clone())?;
        Ok(Self { commands, events })
    }

    /// Queues a download and returns its id. Probing happens in the background.
    pub async fn start_download(
        &self,
        url: impl Into<String>,
        cookies: Option<String>,
        referrer: Option<String>,
        user_agent: Option<String>,
    ) -> Result<String, EngineError> {
        self.submit(DownloadRequest {
            url: url.into(),
            cookies,
            referrer,
            user_agent,
        })
        .await
    }

    /// Queues a download received from the capture agent.
    pub async fn submit(&self, request: DownloadRequest) -> Result<String, EngineError> {
        self.request(|reply| Command::Start { request, reply }).await
    }

    /// Stops a transfer at a safe point. Idempotent on paused transfers.
    pub async fn pause_download(&self, id: &str) -> Result<(), EngineError> {
        let id = id.to_string();
        self.request(|reply| Command::Pause { id, reply }).await
    }

    /// Continues a paused or failed transfer from its persisted offsets.
    pub async fn resume_download(&self, id: &str) -> Result<(), EngineError> {
        let id = id.to_string();
        self.request(|reply| Command::Resume { id, reply }).await
    }

    /// Stops a transfer and deletes its partial data.
    pub async fn cancel_download(&self, id: &str) -> Result<(), EngineError> {
        let id = id.to_string();
        self.request(|reply| Command::Cancel { id, reply }).await
    }

    /// All known transfers, oldest first.
    pub async fn get_downloads(&self) -> Result<Vec<TransferRecord>, EngineError> {
        self.request(|reply| Command::List { reply }).await
    }

    pub async fn get_download(&self, id: &str) -> Result<TransferRecord, EngineError> {
        let id = id.to_string();
        self.request(|reply| Command::Get { id, reply }).await
    }

    /// Receives `download-update` events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    /// Pauses active transfers, flushes their records and stops the engine.
    ///
    /// Returns once every fetcher has stopped. Calls on any handle after this
    /// fail with [`EngineError::ShuttingDown`].
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| EngineError::ShuttingDown)?;
        rx.await.map_err(|_| EngineError::ShuttingDown)?
    }
}

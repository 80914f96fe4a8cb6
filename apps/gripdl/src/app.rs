//! Daemon wiring: engine, capture channel and event log.

use std::collections::HashMap;

use gripdl_engine::{Engine, JsonStore, TransferEvent, TransferStatus};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capture;
use crate::config::Config;

/// Runs the daemon until Ctrl-C.
pub async fn run(config: Config) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.download_dir)?;
    let store = JsonStore::open(config.state_file())?;
    let engine = Engine::init(config.engine_config(), store)?;

    let paused = engine
        .get_downloads()
        .await?
        .into_iter()
        .filter(|r| r.status == TransferStatus::Paused)
        .count();
    info!(paused, "engine started");

    let events = tokio::spawn(log_events(engine.subscribe()));

    let cancel = CancellationToken::new();
    let listener = capture::bind(config.capture_port).await?;
    let mut server = tokio::spawn(capture::serve(listener, engine.clone(), cancel.clone()));

    info!("GripDL ready");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("SIGINT received, shutting down");
        }
        result = &mut server => {
            match result {
                Ok(Ok(())) => warn!("capture channel stopped unexpectedly"),
                Ok(Err(e)) => error!(error = %e, "capture channel failed"),
                Err(e) => error!(error = %e, "capture channel task panicked"),
            }
        }
    }

    cancel.cancel();
    engine.shutdown().await?;
    events.abort();
    if !server.is_finished() {
        let _ = server.await;
    }
    Ok(())
}

/// Logs status changes at info and progress at debug.
async fn log_events(mut events: broadcast::Receiver<TransferEvent>) {
    let mut last: HashMap<String, TransferStatus> = HashMap::new();

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event log lagging");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let record = event.record();
        let percent = record.progress().map(|p| (p * 100.0).round() as u32);

        if last.get(&record.id) == Some(&record.status) {
            debug!(
                event = event.name(),
                transfer = %record.id,
                downloaded = record.downloaded_size,
                total = ?record.total_size,
                ?percent,
                "transfer progress"
            );
            continue;
        }

        info!(
            event = event.name(),
            transfer = %record.id,
            name = %record.display_name,
            status = %record.status,
            downloaded = record.downloaded_size,
            total = ?record.total_size,
            ?percent,
            "transfer status changed"
        );
        if record.status.is_terminal() {
            last.remove(&record.id);
        } else {
            last.insert(record.id.clone(), record.status.clone());
        }
    }
}

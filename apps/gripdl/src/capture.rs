//! Capture channel server (daemon side).
//!
//! Listens on a loopback port for length-prefixed JSON download requests
//! relayed by the native host. Every request frame gets exactly one reply
//! frame. A frame that breaks the framing itself (oversized, truncated)
//! closes that connection; the server keeps accepting.

use std::net::{Ipv4Addr, SocketAddr};

use futures_util::{SinkExt, StreamExt};
use gripdl_engine::Engine;
use gripdl_protocol::wire::{decode_payload, encode_payload};
use gripdl_protocol::{CaptureResponse, DEFAULT_MAX_FRAME_LEN, DownloadRequest, FrameCodec};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default loopback port shared by the daemon and the native host.
pub const DEFAULT_CAPTURE_PORT: u16 = 47821;

/// Reply text for a frame that is not a download request.
pub const INVALID_MESSAGE: &str = "Invalid message format";

/// Binds the capture listener on `127.0.0.1:port` (0 = ephemeral).
pub async fn bind(port: u16) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await?;
    let port = listener.local_addr()?.port();
    info!(port, "capture channel listening");
    Ok(listener)
}

/// Accepts capture connections until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    engine: Engine,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    loop {
        let (stream, addr) = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("capture channel stopped");
                return Ok(());
            }
            accepted = listener.accept() => accepted?,
        };

        debug!(%addr, "capture connection accepted");
        let engine = engine.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            handle_connection(stream, engine, cancel).await;
            debug!(%addr, "capture connection closed");
        });
    }
}

async fn handle_connection(stream: TcpStream, engine: Engine, cancel: CancellationToken) {
    let mut framed = Framed::new(stream, FrameCodec::new(DEFAULT_MAX_FRAME_LEN));

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            frame = framed.next() => frame,
        };

        let response = match frame {
            None => return,
            Some(Ok(payload)) => handle_request(&engine, &payload).await,
            Some(Err(e)) => {
                warn!(error = %e, "dropping capture connection");
                let reply = CaptureResponse::error(e.to_string());
                if let Ok(bytes) = encode_payload(&reply) {
                    let _ = framed.send(bytes).await;
                }
                return;
            }
        };

        let sent = match encode_payload(&response) {
            Ok(bytes) => framed.send(bytes).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!(error = %e, "failed to reply on capture connection");
            return;
        }
    }
}

/// Turns one request payload into a transfer and describes the outcome.
pub async fn handle_request(engine: &Engine, payload: &[u8]) -> CaptureResponse {
    let request: DownloadRequest = match decode_payload(payload) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "malformed capture request");
            return CaptureResponse::error(INVALID_MESSAGE);
        }
    };

    let url = request.url.clone();
    match engine.submit(request).await {
        Ok(id) => {
            info!(transfer = %id, %url, "captured download accepted");
            CaptureResponse::accepted(id)
        }
        Err(e) => {
            warn!(%url, error = %e, "captured download rejected");
            CaptureResponse::error(e.to_string())
        }
    }
}

//! Browser native-messaging relay.
//!
//! The browser starts the host and talks to it over stdin/stdout with
//! length-prefixed JSON frames. Each request is validated, forwarded to the
//! daemon's capture port and the daemon's reply is written back. When the
//! daemon cannot be reached the host answers on its behalf, so the browser
//! always gets one reply per request.

use std::net::SocketAddr;
use std::time::Duration;

use gripdl_protocol::wire::{decode_payload, read_frame, read_message, write_frame, write_message};
use gripdl_protocol::{CaptureResponse, DEFAULT_MAX_FRAME_LEN, DownloadRequest, FramingError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::capture::INVALID_MESSAGE;

/// Reply text when no daemon is listening.
pub const DAEMON_UNAVAILABLE: &str = "GripDL is not running";

/// Upper bound on one exchange with the daemon.
const RELAY_TIMEOUT: Duration = Duration::from_secs(10);

/// Relays frames from `input` to the daemon at `daemon` until `input` ends.
///
/// Oversized frames are skipped and answered with an error. Only a
/// truncated frame or a broken `output` ends the relay early.
pub async fn run<R, W>(
    mut input: R,
    mut output: W,
    daemon: SocketAddr,
) -> Result<(), FramingError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let response = match read_frame(&mut input, DEFAULT_MAX_FRAME_LEN).await {
            Ok(Some(payload)) => relay(&payload, daemon).await,
            Ok(None) => {
                debug!("input closed");
                return Ok(());
            }
            Err(FramingError::FrameTooLarge { len, max }) => {
                warn!(len, max, "skipping oversized frame");
                let skipped = discard(&mut input, len as u64).await?;
                let reply = CaptureResponse::error(INVALID_MESSAGE);
                write_message(&mut output, &reply, DEFAULT_MAX_FRAME_LEN).await?;
                if skipped < len as u64 {
                    return Ok(());
                }
                continue;
            }
            Err(e) => return Err(e),
        };

        write_message(&mut output, &response, DEFAULT_MAX_FRAME_LEN).await?;
    }
}

/// Handles one request payload.
async fn relay(payload: &[u8], daemon: SocketAddr) -> CaptureResponse {
    let request: DownloadRequest = match decode_payload(payload) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "malformed request from browser");
            return CaptureResponse::error(INVALID_MESSAGE);
        }
    };
    info!(url = %request.url, "forwarding download request");

    let mut stream = match TcpStream::connect(daemon).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%daemon, error = %e, "daemon unreachable");
            return CaptureResponse::error(DAEMON_UNAVAILABLE);
        }
    };

    match tokio::time::timeout(RELAY_TIMEOUT, exchange(&mut stream, payload)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            warn!(error = %e, "relay to daemon failed");
            CaptureResponse::error(DAEMON_UNAVAILABLE)
        }
        Err(_) => {
            warn!("daemon did not reply in time");
            CaptureResponse::error(DAEMON_UNAVAILABLE)
        }
    }
}

async fn exchange(
    stream: &mut TcpStream,
    payload: &[u8],
) -> Result<CaptureResponse, FramingError> {
    write_frame(stream, payload, DEFAULT_MAX_FRAME_LEN).await?;
    read_message(stream, DEFAULT_MAX_FRAME_LEN)
        .await?
        .ok_or_else(|| {
            FramingError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "daemon closed the connection without replying",
            ))
        })
}

/// Reads and drops `len` bytes. Returns how many were available.
async fn discard<R: AsyncRead + Unpin>(input: &mut R, len: u64) -> std::io::Result<u64> {
    tokio::io::copy(&mut input.take(len), &mut tokio::io::sink()).await
}

use std::net::SocketAddr;
use std::time::Duration;

use gripdl::capture::{self, INVALID_MESSAGE};
use gripdl::native_host::{self, DAEMON_UNAVAILABLE};
use gripdl_engine::{Engine, EngineConfig, MemoryStore};
use gripdl_protocol::wire::{read_message, write_frame, write_message};
use gripdl_protocol::{CaptureResponse, DEFAULT_MAX_FRAME_LEN, DownloadRequest};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

struct Daemon {
    addr: SocketAddr,
    engine: Engine,
    cancel: CancellationToken,
    _dir: tempfile::TempDir,
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn daemon() -> Daemon {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        download_dir: dir.path().to_path_buf(),
        ..EngineConfig::default()
    };
    let engine = Engine::init(config, MemoryStore::new()).unwrap();
    let listener = capture::bind(0).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(capture::serve(listener, engine.clone(), cancel.clone()));
    Daemon {
        addr,
        engine,
        cancel,
        _dir: dir,
    }
}

/// An address nothing listens on.
fn closed_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

async fn reply(stream: &mut TcpStream) -> CaptureResponse {
    tokio::time::timeout(
        Duration::from_secs(5),
        read_message(stream, DEFAULT_MAX_FRAME_LEN),
    )
    .await
    .unwrap()
    .unwrap()
    .unwrap()
}

#[tokio::test]
async fn request_creates_transfer() {
    let d = daemon().await;
    let mut stream = TcpStream::connect(d.addr).await.unwrap();

    let request = DownloadRequest {
        cookies: Some("sid=1".into()),
        ..DownloadRequest::new(format!("http://{}/archive.tar.gz", closed_addr()))
    };
    write_message(&mut stream, &request, DEFAULT_MAX_FRAME_LEN)
        .await
        .unwrap();
    let resp = reply(&mut stream).await;

    assert!(resp.success);
    let id = resp.message.unwrap();
    let record = d.engine.get_download(&id).await.unwrap();
    assert_eq!(record.display_name, "archive.tar.gz");
    assert_eq!(record.request_context.cookies.as_deref(), Some("sid=1"));
}

#[tokio::test]
async fn invalid_json_keeps_connection_open() {
    let d = daemon().await;
    let mut stream = TcpStream::connect(d.addr).await.unwrap();

    write_frame(&mut stream, b"{not json", DEFAULT_MAX_FRAME_LEN)
        .await
        .unwrap();
    let resp = reply(&mut stream).await;
    assert_eq!(resp, CaptureResponse::error(INVALID_MESSAGE));

    write_frame(&mut stream, br#"{"referrer":"x"}"#, DEFAULT_MAX_FRAME_LEN)
        .await
        .unwrap();
    assert!(!reply(&mut stream).await.success);

    let request = DownloadRequest::new(format!("http://{}/ok.bin", closed_addr()));
    write_message(&mut stream, &request, DEFAULT_MAX_FRAME_LEN)
        .await
        .unwrap();
    assert!(reply(&mut stream).await.success);
}

#[tokio::test]
async fn unsupported_url_is_reported() {
    let d = daemon().await;
    let mut stream = TcpStream::connect(d.addr).await.unwrap();

    write_message(
        &mut stream,
        &DownloadRequest::new("mailto:someone@example.com"),
        DEFAULT_MAX_FRAME_LEN,
    )
    .await
    .unwrap();
    let resp = reply(&mut stream).await;

    assert!(!resp.success);
    assert!(resp.message.unwrap().contains("unsupported URL"));
    assert!(d.engine.get_downloads().await.unwrap().is_empty());
}

#[tokio::test]
async fn oversized_frame_closes_only_that_connection() {
    let d = daemon().await;
    let mut stream = TcpStream::connect(d.addr).await.unwrap();

    let len = (DEFAULT_MAX_FRAME_LEN as u32) + 1;
    stream.write_all(&len.to_le_bytes()).await.unwrap();
    stream.flush().await.unwrap();
    let resp = reply(&mut stream).await;
    assert!(!resp.success);
    assert!(resp.message.unwrap().contains("exceeds"));

    // The server keeps accepting.
    let mut fresh = TcpStream::connect(d.addr).await.unwrap();
    let request = DownloadRequest::new(format!("http://{}/after.bin", closed_addr()));
    write_message(&mut fresh, &request, DEFAULT_MAX_FRAME_LEN)
        .await
        .unwrap();
    assert!(reply(&mut fresh).await.success);
}

#[tokio::test]
async fn native_host_relays_to_daemon() {
    let d = daemon().await;
    let (mut browser, host_io) = tokio::io::duplex(64 * 1024);
    let (host_in, host_out) = tokio::io::split(host_io);
    let relay = tokio::spawn(native_host::run(host_in, host_out, d.addr));

    let request = DownloadRequest::new(format!("http://{}/relayed.iso", closed_addr()));
    write_message(&mut browser, &request, DEFAULT_MAX_FRAME_LEN)
        .await
        .unwrap();
    let resp: CaptureResponse = read_message(&mut browser, DEFAULT_MAX_FRAME_LEN)
        .await
        .unwrap()
        .unwrap();
    assert!(resp.success);
    let record = d.engine.get_download(&resp.message.unwrap()).await.unwrap();
    assert_eq!(record.display_name, "relayed.iso");

    drop(browser);
    relay.await.unwrap().unwrap();
}

#[tokio::test]
async fn native_host_answers_when_daemon_is_down() {
    let (mut browser, host_io) = tokio::io::duplex(64 * 1024);
    let (host_in, host_out) = tokio::io::split(host_io);
    let relay = tokio::spawn(native_host::run(host_in, host_out, closed_addr()));

    let request = DownloadRequest::new("https://example.com/file.zip");
    write_message(&mut browser, &request, DEFAULT_MAX_FRAME_LEN)
        .await
        .unwrap();
    let resp: CaptureResponse = read_message(&mut browser, DEFAULT_MAX_FRAME_LEN)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resp, CaptureResponse::error(DAEMON_UNAVAILABLE));

    drop(browser);
    relay.await.unwrap().unwrap();
}

#[tokio::test]
async fn native_host_survives_bad_frames() {
    let (mut browser, host_io) = tokio::io::duplex(4 * 1024 * 1024);
    let (host_in, host_out) = tokio::io::split(host_io);
    let relay = tokio::spawn(native_host::run(host_in, host_out, closed_addr()));

    // Malformed JSON is answered without contacting the daemon.
    write_frame(&mut browser, b"42", DEFAULT_MAX_FRAME_LEN)
        .await
        .unwrap();
    let resp: CaptureResponse = read_message(&mut browser, DEFAULT_MAX_FRAME_LEN)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resp, CaptureResponse::error(INVALID_MESSAGE));

    // Oversized frame: prefix plus body are skipped.
    let big = vec![b'x'; DEFAULT_MAX_FRAME_LEN + 10];
    browser
        .write_all(&(big.len() as u32).to_le_bytes())
        .await
        .unwrap();
    browser.write_all(&big).await.unwrap();
    let resp: CaptureResponse = read_message(&mut browser, DEFAULT_MAX_FRAME_LEN)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resp, CaptureResponse::error(INVALID_MESSAGE));

    // Still relaying afterwards.
    let request = DownloadRequest::new("https://example.com/next.zip");
    write_message(&mut browser, &request, DEFAULT_MAX_FRAME_LEN)
        .await
        .unwrap();
    let resp: CaptureResponse = read_message(&mut browser, DEFAULT_MAX_FRAME_LEN)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resp, CaptureResponse::error(DAEMON_UNAVAILABLE));

    drop(browser);
    relay.await.unwrap().unwrap();
}

//! Shared fixtures: a raw TCP mock HTTP server for throttled, stalled and
//! rewritable bodies, plus event helpers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use gripdl_engine::{EngineConfig, RetryPolicy, TransferEvent, TransferRecord};

/// Deterministic test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Engine config with small segments and fast retries.
pub fn test_config(download_dir: &Path) -> EngineConfig {
    EngineConfig {
        download_dir: download_dir.to_path_buf(),
        max_segments: 4,
        min_segment_bytes: 64 * 1024,
        retry: RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            backoff_factor: 2.0,
        },
        persist_bytes: 32 * 1024,
        persist_interval: Duration::from_millis(50),
        flush_bytes: 16 * 1024,
        ..EngineConfig::default()
    }
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub body: Vec<u8>,
    /// Honour `Range` and advertise `Accept-Ranges: bytes`.
    pub ranges: bool,
    /// Answer `HEAD` with 405 when false.
    pub head_allowed: bool,
    /// Omit `Content-Length` from `HEAD` replies.
    pub head_without_length: bool,
    /// Number of `GET` requests answered with 503 before serving.
    pub fail_first: usize,
    /// Number of bodies that send a few bytes and then go silent.
    pub stall_first: usize,
    /// Ranged `GET`s starting at this offset are answered with 403...
    pub forbidden_range: Option<usize>,
    /// ...after this pause.
    pub forbidden_delay: Duration,
    /// Status for every request instead of serving the body.
    pub status_override: Option<u16>,
    pub etag: Option<String>,
    /// Body is written in chunks of this size...
    pub chunk_size: usize,
    /// ...with this pause between chunks.
    pub chunk_delay: Option<Duration>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            body: payload(256 * 1024),
            ranges: true,
            head_allowed: true,
            head_without_length: false,
            fail_first: 0,
            stall_first: 0,
            forbidden_range: None,
            forbidden_delay: Duration::ZERO,
            status_override: None,
            etag: None,
            chunk_size: 8 * 1024,
            chunk_delay: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: String,
    pub headers: HashMap<String, String>,
}

struct ServerState {
    options: Mutex<ServerOptions>,
    failures_left: AtomicUsize,
    stalls_left: AtomicUsize,
    requests: Mutex<Vec<SeenRequest>>,
}

/// Minimal HTTP/1.1 server; one request per connection.
pub struct MockServer {
    pub base_url: String,
    state: Arc<ServerState>,
    handle: tokio::task::JoinHandle<()>,
}

impl MockServer {
    pub async fn start(options: ServerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(ServerState {
            failures_left: AtomicUsize::new(options.fail_first),
            stalls_left: AtomicUsize::new(options.stall_first),
            options: Mutex::new(options),
            requests: Mutex::new(Vec::new()),
        });

        let accept_state = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    let _ = serve(stream, state).await;
                });
            }
        });

        Self {
            base_url: format!("http://127.0.0.1:{port}"),
            state,
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Swaps the served resource (body and entity tag).
    pub fn replace_resource(&self, body: Vec<u8>, etag: Option<String>) {
        let mut opts = self.state.options.lock().unwrap();
        opts.body = body;
        opts.etag = etag;
    }

    pub fn set_chunk_delay(&self, delay: Option<Duration>) {
        self.state.options.lock().unwrap().chunk_delay = delay;
    }

    pub fn set_forbidden_range(&self, start: Option<usize>) {
        self.state.options.lock().unwrap().forbidden_range = start;
    }

    pub fn requests(&self) -> Vec<SeenRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn get_requests(&self) -> Vec<SeenRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == "GET")
            .collect()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(mut stream: TcpStream, state: Arc<ServerState>) -> std::io::Result<()> {
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];
    while !raw.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        raw.extend_from_slice(&buf[..n]);
    }

    let text = String::from_utf8_lossy(&raw).into_owned();
    let mut lines = text.split("\r\n");
    let method = lines
        .next()
        .and_then(|l| l.split_whitespace().next())
        .unwrap_or_default()
        .to_string();
    let headers: HashMap<String, String> = lines
        .take_while(|l| !l.is_empty())
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    state.requests.lock().unwrap().push(SeenRequest {
        method: method.clone(),
        headers: headers.clone(),
    });

    let opts = state.options.lock().unwrap().clone();
    let total = opts.body.len();

    if let Some(status) = opts.status_override {
        return write_head(&mut stream, status, &[("Content-Length", "0".into())]).await;
    }

    if method == "HEAD" {
        if !opts.head_allowed {
            return write_head(&mut stream, 405, &[("Content-Length", "0".into())]).await;
        }
        let mut hdrs = Vec::new();
        if !opts.head_without_length {
            hdrs.push(("Content-Length", total.to_string()));
        }
        if opts.ranges {
            hdrs.push(("Accept-Ranges", "bytes".into()));
        }
        if let Some(etag) = &opts.etag {
            hdrs.push(("ETag", etag.clone()));
        }
        return write_head(&mut stream, 200, &hdrs).await;
    }

    if state
        .failures_left
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return write_head(&mut stream, 503, &[("Content-Length", "0".into())]).await;
    }

    let range = headers.get("range").and_then(|r| parse_range(r, total));
    if let (Some(forbidden), Some(Ok((start, _)))) = (opts.forbidden_range, &range) {
        if forbidden == *start {
            tokio::time::sleep(opts.forbidden_delay).await;
            return write_head(&mut stream, 403, &[("Content-Length", "0".into())]).await;
        }
    }
    let stall = state
        .stalls_left
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    let if_range_ok = match (headers.get("if-range"), &opts.etag) {
        (Some(sent), Some(current)) => sent == current,
        (Some(_), None) => false,
        (None, _) => true,
    };

    let mut hdrs = Vec::new();
    if let Some(etag) = &opts.etag {
        hdrs.push(("ETag", etag.clone()));
    }

    match range {
        Some(Err(())) if opts.ranges && if_range_ok => {
            hdrs.push(("Content-Range", format!("bytes */{total}")));
            hdrs.push(("Content-Length", "0".into()));
            write_head(&mut stream, 416, &hdrs).await
        }
        Some(Ok((start, end))) if opts.ranges && if_range_ok => {
            hdrs.push(("Accept-Ranges", "bytes".into()));
            hdrs.push(("Content-Range", format!("bytes {start}-{end}/{total}")));
            hdrs.push(("Content-Length", (end + 1 - start).to_string()));
            write_head(&mut stream, 206, &hdrs).await?;
            write_body(&mut stream, &opts.body[start..=end], &opts, stall).await
        }
        _ => {
            if opts.ranges {
                hdrs.push(("Accept-Ranges", "bytes".into()));
            }
            hdrs.push(("Content-Length", total.to_string()));
            write_head(&mut stream, 200, &hdrs).await?;
            write_body(&mut stream, &opts.body, &opts, stall).await
        }
    }
}

/// `bytes=a-b` / `bytes=a-`; `Err` when unsatisfiable.
fn parse_range(value: &str, total: usize) -> Option<Result<(usize, usize), ()>> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: usize = start.parse().ok()?;
    if start >= total {
        return Some(Err(()));
    }
    let end = if end.is_empty() {
        total - 1
    } else {
        end.parse::<usize>().ok()?.min(total - 1)
    };
    Some(Ok((start, end)))
}

async fn write_head(
    stream: &mut TcpStream,
    status: u16,
    headers: &[(&str, String)],
) -> std::io::Result<()> {
    let reason = match status {
        200 => "OK",
        206 => "Partial Content",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        416 => "Range Not Satisfiable",
        503 => "Service Unavailable",
        _ => "Status",
    };
    let mut head = format!("HTTP/1.1 {status} {reason}\r\nConnection: close\r\n");
    for (name, value) in headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes()).await?;
    stream.flush().await
}

async fn write_body(
    stream: &mut TcpStream,
    body: &[u8],
    opts: &ServerOptions,
    stall: bool,
) -> std::io::Result<()> {
    if stall {
        stream.write_all(&body[..body.len().min(3)]).await?;
        stream.flush().await?;
        tokio::time::sleep(Duration::from_secs(60)).await;
        return Ok(());
    }
    for chunk in body.chunks(opts.chunk_size.max(1)) {
        stream.write_all(chunk).await?;
        stream.flush().await?;
        if let Some(delay) = opts.chunk_delay {
            tokio::time::sleep(delay).await;
        }
    }
    stream.shutdown().await
}

/// Waits for an update of transfer `id` matching `pred`.
pub async fn wait_for<F>(
    events: &mut broadcast::Receiver<TransferEvent>,
    id: &str,
    pred: F,
) -> TransferRecord
where
    F: Fn(&TransferRecord) -> bool,
{
    let deadline = Duration::from_secs(15);
    tokio::time::timeout(deadline, async {
        loop {
            match events.recv().await {
                Ok(TransferEvent::Update(record)) if record.id == id && pred(&record) => {
                    return record;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for transfer update")
}

/// Lists `*.part.*` and `*.assembling` leftovers in `dir`.
pub fn temporaries(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.contains(".part.") || n.ends_with(".assembling"))
        .collect()
}

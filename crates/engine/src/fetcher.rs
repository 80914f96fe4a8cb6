//! Segment fetcher.
//!
//! Streams one byte range into its part file. Bytes are buffered and flushed
//! in bounded chunks; each flush is synced to disk before the progress sink
//! hears about it, so reported progress never runs ahead of durable data.

use std::io::SeekFrom;
use std::path::PathBuf;

use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_RANGE, IF_RANGE, RANGE};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::http::{header_str, parse_content_range};
use crate::retry::RetryPolicy;

/// How a fetcher stopped.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The range (or the whole body, if open-ended) is on disk.
    Done,
    /// Stopped on request after flushing everything received.
    Cancelled,
    /// The server no longer honours the range for this resource.
    StaleRange,
    /// Permanent error or retry budget exhausted.
    Failed(EngineError),
}

/// One segment's work order.
#[derive(Debug, Clone)]
pub struct SegmentJob {
    pub index: u32,
    pub start_offset: u64,
    pub end_offset: Option<u64>,
    pub bytes_written: u64,
    pub part_path: PathBuf,
}

impl SegmentJob {
    fn next_offset(&self) -> u64 {
        self.start_offset + self.bytes_written
    }

    /// Bytes still missing from a bounded range.
    fn remaining(&self) -> Option<u64> {
        self.end_offset
            .map(|end| (end + 1 - self.start_offset).saturating_sub(self.bytes_written))
    }
}

enum AttemptEnd {
    Finished,
    Cancelled,
}

/// Fetches segments of one resource. Shared by all segments of a transfer.
#[derive(Debug, Clone)]
pub struct SegmentFetcher {
    client: reqwest::Client,
    url: String,
    validator: Option<String>,
    ranged: bool,
    retry: RetryPolicy,
    flush_bytes: usize,
    total: Option<u64>,
}

impl SegmentFetcher {
    /// `ranged` selects `Range` requests; without it every attempt fetches
    /// the whole body and skips what is already on disk.
    pub fn new(
        client: reqwest::Client,
        url: impl Into<String>,
        validator: Option<String>,
        ranged: bool,
        retry: RetryPolicy,
        flush_bytes: usize,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            validator,
            ranged,
            retry,
            flush_bytes: flush_bytes.max(1),
            total: None,
        }
    }

    /// Size the resource had when it was planned. A partial response that
    /// reports a different complete length is treated as a stale range.
    pub fn expect_total(mut self, total: Option<u64>) -> Self {
        self.total = total;
        self
    }

    /// Runs `job` to completion, cancellation or failure.
    ///
    /// `on_progress` receives the number of bytes made durable by each flush.
    pub async fn fetch<P>(
        &self,
        mut job: SegmentJob,
        cancel: CancellationToken,
        on_progress: P,
    ) -> FetchOutcome
    where
        P: Fn(u64) + Send + Sync,
    {
        let mut file = match open_part(&job).await {
            Ok(f) => f,
            Err(e) => return FetchOutcome::Failed(e),
        };

        let mut failures: u32 = 0;
        loop {
            if job.remaining() == Some(0) {
                return FetchOutcome::Done;
            }
            if cancel.is_cancelled() {
                return FetchOutcome::Cancelled;
            }

            let before = job.bytes_written;
            match self.attempt(&mut job, &mut file, &cancel, &on_progress).await {
                Ok(AttemptEnd::Finished) => return FetchOutcome::Done,
                Ok(AttemptEnd::Cancelled) => return FetchOutcome::Cancelled,
                Err(EngineError::StaleRange) => return FetchOutcome::StaleRange,
                Err(e) if e.is_transient() => {
                    if job.bytes_written > before {
                        failures = 0;
                    }
                    failures += 1;
                    if !self.retry.allows_retry(failures) {
                        warn!(segment = job.index, attempts = failures, error = %e, "giving up on segment");
                        return FetchOutcome::Failed(e);
                    }
                    let delay = self.retry.delay_for_retry(failures);
                    warn!(
                        segment = job.index,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "segment attempt failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return FetchOutcome::Cancelled,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return FetchOutcome::Failed(e),
            }
        }
    }

    async fn attempt<P>(
        &self,
        job: &mut SegmentJob,
        file: &mut File,
        cancel: &CancellationToken,
        on_progress: &P,
    ) -> Result<AttemptEnd, EngineError>
    where
        P: Fn(u64) + Send + Sync,
    {
        let offset = job.next_offset();
        let mut request = self.client.get(&self.url);
        if self.ranged {
            let range = match job.end_offset {
                Some(end) => format!("bytes={offset}-{end}"),
                None => format!("bytes={offset}-"),
            };
            request = request.header(RANGE, range);
            if let Some(validator) = &self.validator {
                request = request.header(IF_RANGE, validator.as_str());
            }
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(AttemptEnd::Cancelled),
            r = request.send() => r?,
        };

        let status = response.status();
        if self.ranged {
            match status {
                StatusCode::PARTIAL_CONTENT => {
                    let served = header_str(response.headers(), CONTENT_RANGE)
                        .and_then(|v| parse_content_range(&v));
                    if let Some(served) = served {
                        if served.start != offset {
                            debug!(segment = job.index, offset, "server served a different range");
                            return Err(EngineError::StaleRange);
                        }
                        if let (Some(expected), Some(total)) = (self.total, served.total) {
                            if expected != total {
                                debug!(segment = job.index, expected, total, "resource size changed");
                                return Err(EngineError::StaleRange);
                            }
                        }
                    }
                }
                StatusCode::OK | StatusCode::RANGE_NOT_SATISFIABLE => {
                    debug!(segment = job.index, status = status.as_u16(), "range rejected");
                    return Err(EngineError::StaleRange);
                }
                s if !s.is_success() => return Err(EngineError::Server { status: s.as_u16() }),
                _ => {}
            }
        } else if !status.is_success() {
            return Err(EngineError::Server {
                status: status.as_u16(),
            });
        }

        debug!(segment = job.index, offset, status = status.as_u16(), "streaming segment");

        let mut skip = if self.ranged { 0 } else { job.bytes_written };
        let mut buf: Vec<u8> = Vec::with_capacity(self.flush_bytes);
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    flush(file, &mut buf, job, on_progress).await?;
                    return Ok(AttemptEnd::Cancelled);
                }
                next = stream.next() => next,
            };

            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    flush(file, &mut buf, job, on_progress).await?;
                    return Err(e.into());
                }
                None => break,
            };

            let mut data = &chunk[..];
            if skip > 0 {
                let n = skip.min(data.len() as u64) as usize;
                data = &data[n..];
                skip -= n as u64;
            }
            if let Some(remaining) = job.remaining() {
                let room = remaining.saturating_sub(buf.len() as u64);
                if (data.len() as u64) > room {
                    data = &data[..room as usize];
                }
            }
            buf.extend_from_slice(data);

            let filled = job
                .remaining()
                .is_some_and(|remaining| buf.len() as u64 >= remaining);
            if buf.len() >= self.flush_bytes || filled {
                flush(file, &mut buf, job, on_progress).await?;
                if cancel.is_cancelled() {
                    return Ok(AttemptEnd::Cancelled);
                }
            }
            if filled {
                return Ok(AttemptEnd::Finished);
            }
        }

        flush(file, &mut buf, job, on_progress).await?;

        if skip > 0 || job.remaining().is_some_and(|r| r > 0) {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "response body ended before the segment was complete",
            )));
        }
        Ok(AttemptEnd::Finished)
    }
}

/// Opens the part file positioned at the recorded progress, dropping any
/// tail that was written but never acknowledged.
async fn open_part(job: &SegmentJob) -> Result<File, EngineError> {
    if let Some(parent) = job.part_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&job.part_path)
        .await?;

    let on_disk = file.metadata().await?.len();
    if on_disk < job.bytes_written {
        return Err(EngineError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "part file {} holds {on_disk} bytes, expected {}",
                job.part_path.display(),
                job.bytes_written
            ),
        )));
    }
    if on_disk > job.bytes_written {
        file.set_len(job.bytes_written).await?;
    }
    file.seek(SeekFrom::Start(job.bytes_written)).await?;
    Ok(file)
}

async fn flush<P>(
    file: &mut File,
    buf: &mut Vec<u8>,
    job: &mut SegmentJob,
    on_progress: &P,
) -> Result<(), EngineError>
where
    P: Fn(u64) + Send + Sync,
{
    if buf.is_empty() {
        return Ok(());
    }
    file.write_all(&buf[..]).await?;
    file.flush().await?;
    file.sync_data().await?;

    let n = buf.len() as u64;
    buf.clear();
    job.bytes_written += n;
    on_progress(n);
    Ok(())
}

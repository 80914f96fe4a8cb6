//! Resource metadata probing.
//!
//! A `HEAD` request is tried first. Servers that reject it or do not report
//! a size get a one-byte ranged `GET` instead, whose `Content-Range` carries
//! both the size and proof of range support. The body of that reply is never
//! read.

use reqwest::StatusCode;
use reqwest::header::{
    ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, ETAG, HeaderMap, LAST_MODIFIED, RANGE,
};
use tracing::debug;

use crate::error::EngineError;
use crate::http::{header_str, parse_content_range};

/// What the server told us about a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub total_size: Option<u64>,
    pub range_supported: bool,
    /// `ETag`, or `Last-Modified` when no entity tag was sent.
    pub validator: Option<String>,
}

/// Queries size, range support and validator of `url`.
///
/// Request context (cookies, referrer, user agent) travels in the client's
/// default headers. Failures are reported as [`EngineError::Probe`] and are
/// not retried.
pub async fn probe(client: &reqwest::Client, url: &str) -> Result<ProbeResult, EngineError> {
    let head = client
        .head(url)
        .send()
        .await
        .map_err(|e| EngineError::Probe(e.to_string()))?;

    let status = head.status();
    if status.is_success() {
        let headers = head.headers();
        let total_size = header_str(headers, CONTENT_LENGTH).and_then(|v| v.parse::<u64>().ok());
        let accepts_bytes = header_str(headers, ACCEPT_RANGES)
            .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));

        if total_size.is_some() {
            let result = ProbeResult {
                total_size,
                range_supported: accepts_bytes,
                validator: validator(headers),
            };
            debug!(url, ?result, "HEAD probe");
            return Ok(result);
        }
        debug!(url, "HEAD reported no size, probing with ranged GET");
    } else {
        debug!(url, status = status.as_u16(), "HEAD rejected, probing with ranged GET");
    }

    probe_with_range(client, url).await
}

async fn probe_with_range(client: &reqwest::Client, url: &str) -> Result<ProbeResult, EngineError> {
    let resp = client
        .get(url)
        .header(RANGE, "bytes=0-0")
        .send()
        .await
        .map_err(|e| EngineError::Probe(e.to_string()))?;

    let status = resp.status();
    let headers = resp.headers();
    let result = match status {
        StatusCode::PARTIAL_CONTENT => {
            let total_size = header_str(headers, CONTENT_RANGE)
                .and_then(|v| parse_content_range(&v))
                .and_then(|r| r.total);
            ProbeResult {
                total_size,
                range_supported: total_size.is_some(),
                validator: validator(headers),
            }
        }
        s if s.is_success() => ProbeResult {
            total_size: header_str(headers, CONTENT_LENGTH).and_then(|v| v.parse::<u64>().ok()),
            range_supported: false,
            validator: validator(headers),
        },
        s => {
            return Err(EngineError::Probe(format!(
                "server responded with status {}",
                s.as_u16()
            )));
        }
    };

    debug!(url, ?result, "ranged GET probe");
    Ok(result)
}

// Weak entity tags are not allowed in If-Range.
fn validator(headers: &HeaderMap) -> Option<String> {
    header_str(headers, ETAG)
        .filter(|tag| !tag.starts_with("W/"))
        .or_else(|| header_str(headers, LAST_MODIFIED))
}

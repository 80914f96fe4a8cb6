//! HTTP client construction and header helpers.

use reqwest::header::{COOKIE, HeaderMap, HeaderValue, REFERER};
use tracing::warn;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::types::RequestContext;

/// Builds a client that replays the captured browser context on every request.
pub fn build_client(
    config: &EngineConfig,
    context: &RequestContext,
) -> Result<reqwest::Client, EngineError> {
    let mut headers = HeaderMap::new();
    if let Some(cookies) = context.cookies.as_deref().filter(|c| !c.is_empty()) {
        insert_header(&mut headers, COOKIE, cookies);
    }
    if let Some(referrer) = context.referrer.as_deref().filter(|r| !r.is_empty()) {
        insert_header(&mut headers, REFERER, referrer);
    }

    let user_agent = context
        .user_agent
        .as_deref()
        .filter(|ua| !ua.is_empty())
        .unwrap_or(&config.user_agent);

    let mut builder = reqwest::Client::builder()
        .user_agent(user_agent)
        .default_headers(headers)
        .connect_timeout(config.connect_timeout);
    if let Some(timeout) = config.request_timeout {
        builder = builder.timeout(timeout);
    }
    if let Some(timeout) = config.read_timeout {
        builder = builder.read_timeout(timeout);
    }
    Ok(builder.build()?)
}

fn insert_header(headers: &mut HeaderMap, name: reqwest::header::HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(v) => {
            headers.insert(name, v);
        }
        Err(_) => warn!(header = %name, "dropping header with invalid characters"),
    }
}

/// Parsed `Content-Range: bytes <start>-<end>/<total|*>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: Option<u64>,
}

/// Parses a `Content-Range` header value. Unsatisfied ranges (`bytes */N`)
/// yield `None`.
pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (span, total) = rest.split_once('/')?;
    let (start, end) = span.trim().split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    if end < start {
        return None;
    }
    let total = match total.trim() {
        "*" => None,
        n => Some(n.parse().ok()?),
    };
    Some(ContentRange { start, end, total })
}

/// Reads a header as a trimmed string.
pub(crate) fn header_str(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

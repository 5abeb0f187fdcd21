//! Upstream Source Connector
//!
//! Performs the provider fetch with caller-supplied headers and streams the
//! body into a session's [`RingBuffer`]. The connector has no provider
//! knowledge; whatever headers the caller resolved are sent verbatim.
//!
//! A pump run ends with an [`UpstreamOutcome`] instead of an error so the
//! continuity controller can decide whether a closed connection is the end
//! of the program or just a provider cycling its connections.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT_RANGES, CONTENT_TYPE, RANGE, USER_AGENT};
use reqwest::{Client, Response, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::RingBuffer;
use crate::error::{RelayError, RelayResult};

/// How a pump run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamOutcome {
    /// The server closed the body normally.
    Finished,
    /// No bytes arrived within the stall timeout.
    Stalled,
    /// The body failed mid-transfer.
    Interrupted(String),
    Cancelled,
    /// The ring buffer stopped accepting data (session closing).
    BufferClosed,
}

#[derive(Debug, Clone)]
pub struct UpstreamConnector {
    client: Client,
    url: String,
    headers: HeaderMap,
    connect_timeout: Duration,
    stall_timeout: Duration,
}

impl UpstreamConnector {
    /// `default_user_agent` is sent when `headers` carries none.
    pub fn new(
        client: Client,
        url: impl Into<String>,
        headers: &BTreeMap<String, String>,
        default_user_agent: &str,
        connect_timeout: Duration,
        stall_timeout: Duration,
    ) -> Self {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    map.append(name, value);
                }
                _ => warn!(header = %name, "Dropping invalid upstream header"),
            }
        }
        if !map.contains_key(USER_AGENT) {
            if let Ok(value) = HeaderValue::from_str(default_user_agent) {
                map.insert(USER_AGENT, value);
            }
        }

        Self {
            client,
            url: url.into(),
            headers: map,
            connect_timeout,
            stall_timeout,
        }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub const fn stall_timeout(&self) -> Duration {
        self.stall_timeout
    }

    /// Connect, resuming at byte `resume_from` when it is non-zero. A `416`
    /// answer to a ranged request is retried once without a range.
    ///
    /// When the server sends the whole resource instead of the requested
    /// range, the first `resume_from` bytes of the body are discarded so the
    /// session never sees bytes it already forwarded.
    pub async fn open(&self, resume_from: u64) -> RelayResult<UpstreamResponse> {
        let mut response = self.send(resume_from).await?;

        if resume_from > 0 && response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            debug!(url = %self.url, resume_from, "Range not satisfiable, refetching without range");
            response = self.send(0).await?;
        }
        let skip = if resume_from > 0 && response.status() != StatusCode::PARTIAL_CONTENT {
            debug!(url = %self.url, resume_from, "Range ignored, skipping delivered prefix");
            resume_from
        } else {
            0
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(RelayError::UpstreamUnauthorized {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(RelayError::UpstreamUnreachable(format!("HTTP {status}")));
        }

        info!(url = %self.url, status = status.as_u16(), offset = resume_from, "Upstream connected");
        Ok(UpstreamResponse::new(response, resume_from, skip))
    }

    async fn send(&self, offset: u64) -> RelayResult<Response> {
        let mut request = self.client.get(&self.url).headers(self.headers.clone());
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        match tokio::time::timeout(self.connect_timeout, request.send()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(RelayError::UpstreamUnreachable(e.to_string())),
            Err(_) => Err(RelayError::UpstreamUnreachable(format!(
                "no response within {}s",
                self.connect_timeout.as_secs()
            ))),
        }
    }
}

/// Where a body started and whether a reconnect may continue it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePoint {
    pub offset: u64,
    pub total_length: Option<u64>,
    pub accepts_ranges: bool,
}

impl ResumePoint {
    #[must_use]
    pub fn after(&self, received: u64) -> Option<u64> {
        let position = self.offset + received;
        match self.total_length {
            Some(total) if self.accepts_ranges && position < total => Some(position),
            _ => None,
        }
    }
}

/// An open upstream body.
#[derive(Debug)]
pub struct UpstreamResponse {
    response: Response,
    /// Body bytes already read for sniffing but not yet forwarded.
    head: Vec<u8>,
    /// Body bytes still to discard before `offset` is reached.
    skip: u64,
    body_done: bool,
    pub content_type: Option<String>,
    pub icy: bool,
    pub icy_bitrate_kbps: Option<u32>,
    /// Total resource length when the server advertised one.
    pub total_length: Option<u64>,
    pub accepts_ranges: bool,
    /// Byte offset this body starts at.
    pub offset: u64,
}

impl UpstreamResponse {
    fn new(response: Response, offset: u64, skip: u64) -> Self {
        let headers = response.headers();
        let header_str = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let content_type = header_str(CONTENT_TYPE.as_str());
        let icy = headers
            .keys()
            .any(|name| name.as_str().starts_with("icy-"));
        let icy_bitrate_kbps = header_str("icy-br").and_then(|v| {
            v.split(',').next().and_then(|n| n.trim().parse().ok())
        });
        let accepts_ranges = headers
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));
        let total_length = response
            .content_length()
            .map(|len| len + offset.saturating_sub(skip));

        Self {
            response,
            head: Vec::new(),
            skip,
            body_done: false,
            content_type,
            icy,
            icy_bitrate_kbps,
            total_length,
            accepts_ranges,
            offset,
        }
    }

    #[must_use]
    pub const fn resume_point(&self) -> ResumePoint {
        ResumePoint {
            offset: self.offset,
            total_length: self.total_length,
            accepts_ranges: self.accepts_ranges,
        }
    }

    /// The byte offset to resume from after `received` more bytes, if this
    /// resource can be resumed at all.
    #[must_use]
    pub fn resume_offset(&self, received: u64) -> Option<u64> {
        self.resume_point().after(received)
    }

    /// Read until at least `bytes` of the body are buffered, the body ends, or
    /// `timeout` passes. Returns what was collected; nothing is lost, the pump
    /// forwards it first.
    pub async fn peek_head(&mut self, bytes: usize, timeout: Duration) -> RelayResult<&[u8]> {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.head.len() < bytes && !self.body_done {
            match tokio::time::timeout_at(deadline, self.response.chunk()).await {
                Ok(Ok(Some(chunk))) => {
                    let chunk = self.skip_prefix(chunk);
                    self.head.extend_from_slice(&chunk);
                }
                Ok(Ok(None)) => self.body_done = true,
                Ok(Err(e)) => return Err(RelayError::UpstreamUnreachable(e.to_string())),
                Err(_) => break,
            }
        }
        Ok(&self.head)
    }

    /// Stream the body into `buffer` until it ends, stalls, fails or is
    /// cancelled. Returns the outcome and the number of bytes forwarded.
    pub async fn pump_into(
        mut self,
        buffer: &RingBuffer,
        stall_timeout: Duration,
        cancel: &CancellationToken,
    ) -> (UpstreamOutcome, u64) {
        let mut forwarded: u64 = 0;

        let head = std::mem::take(&mut self.head);
        if !head.is_empty() {
            match forward(buffer, Bytes::from(head), cancel).await {
                Ok(n) => forwarded += n,
                Err(outcome) => return (outcome, forwarded),
            }
        }
        if self.body_done {
            return (UpstreamOutcome::Finished, forwarded);
        }

        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => return (UpstreamOutcome::Cancelled, forwarded),
                next = tokio::time::timeout(stall_timeout, self.response.chunk()) => next,
            };
            let chunk = match next {
                Ok(Ok(Some(chunk))) => chunk,
                Ok(Ok(None)) => return (UpstreamOutcome::Finished, forwarded),
                Ok(Err(e)) => return (UpstreamOutcome::Interrupted(e.to_string()), forwarded),
                Err(_) => return (UpstreamOutcome::Stalled, forwarded),
            };
            let chunk = self.skip_prefix(chunk);
            if chunk.is_empty() {
                continue;
            }
            match forward(buffer, chunk, cancel).await {
                Ok(n) => forwarded += n,
                Err(outcome) => return (outcome, forwarded),
            }
        }
    }

    fn skip_prefix(&mut self, chunk: Bytes) -> Bytes {
        if self.skip == 0 {
            return chunk;
        }
        let n = usize::try_from(self.skip).map_or(chunk.len(), |skip| skip.min(chunk.len()));
        self.skip -= n as u64;
        chunk.slice(n..)
    }
}

async fn forward(
    buffer: &RingBuffer,
    chunk: Bytes,
    cancel: &CancellationToken,
) -> Result<u64, UpstreamOutcome> {
    tokio::select! {
        () = cancel.cancelled() => Err(UpstreamOutcome::Cancelled),
        written = buffer.write_all(&chunk) => match written {
            Ok(()) => Ok(chunk.len() as u64),
            Err(_) => Err(UpstreamOutcome::BufferClosed),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn connector(url: String, headers: &BTreeMap<String, String>) -> UpstreamConnector {
        UpstreamConnector::new(
            Client::new(),
            url,
            headers,
            "TestAgent/1.0",
            Duration::from_secs(5),
            Duration::from_millis(300),
        )
    }

    async fn drain(buffer: &RingBuffer) -> Vec<u8> {
        buffer.close();
        let mut out = Vec::new();
        while let Some(chunk) = buffer.read_chunk(1 << 16).await {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn test_forwards_headers_and_default_agent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/live"))
            .and(header("user-agent", "TestAgent/1.0"))
            .and(header("x-token", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"payload".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let mut headers = BTreeMap::new();
        headers.insert("X-Token".to_string(), "secret".to_string());
        let upstream = connector(format!("{}/live", server.uri()), &headers);

        let response = upstream.open(0).await.unwrap();
        let buffer = RingBuffer::new(1024, 0);
        let (outcome, forwarded) = response
            .pump_into(&buffer, upstream.stall_timeout(), &CancellationToken::new())
            .await;
        assert_eq!(outcome, UpstreamOutcome::Finished);
        assert_eq!(forwarded, 7);
        assert_eq!(drain(&buffer).await, b"payload");
    }

    #[tokio::test]
    async fn test_caller_agent_wins() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("user-agent", "Kodi/20"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut headers = BTreeMap::new();
        headers.insert("User-Agent".to_string(), "Kodi/20".to_string());
        assert!(connector(server.uri(), &headers).open(0).await.is_ok());
    }

    #[tokio::test]
    async fn test_unauthorized_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let err = connector(server.uri(), &BTreeMap::new()).open(0).await.unwrap_err();
        assert_eq!(err, RelayError::UpstreamUnauthorized { status: 403 });
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_server_error_is_unreachable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let err = connector(server.uri(), &BTreeMap::new()).open(0).await.unwrap_err();
        assert!(matches!(err, RelayError::UpstreamUnreachable(_)));
    }

    #[tokio::test]
    async fn test_range_416_retries_without_range() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header_exists("range"))
            .respond_with(ResponseTemplate::new(416))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fresh".to_vec()))
            .mount(&server)
            .await;

        let response = connector(server.uri(), &BTreeMap::new()).open(100).await.unwrap();
        assert_eq!(response.offset, 100);

        // The whole five-byte body lies before the resume point.
        let buffer = RingBuffer::new(1024, 0);
        let (outcome, forwarded) = response
            .pump_into(&buffer, Duration::from_secs(1), &CancellationToken::new())
            .await;
        assert_eq!(outcome, UpstreamOutcome::Finished);
        assert_eq!(forwarded, 0);
    }

    #[tokio::test]
    async fn test_ignored_range_skips_delivered_prefix() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("range", "bytes=4-"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"0123456789".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let mut response = connector(server.uri(), &BTreeMap::new()).open(4).await.unwrap();
        assert_eq!(response.offset, 4);
        assert_eq!(response.total_length, Some(10));

        let head = response.peek_head(2, Duration::from_secs(2)).await.unwrap();
        assert_eq!(head.first(), Some(&b'4'));

        let buffer = RingBuffer::new(1024, 0);
        let (outcome, forwarded) = response
            .pump_into(&buffer, Duration::from_secs(1), &CancellationToken::new())
            .await;
        assert_eq!(outcome, UpstreamOutcome::Finished);
        assert_eq!(forwarded, 6);
        assert_eq!(drain(&buffer).await, b"456789");
    }

    #[tokio::test]
    async fn test_partial_content_resumes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("range", "bytes=4-"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("accept-ranges", "bytes")
                    .set_body_bytes(b"6789".to_vec()),
            )
            .mount(&server)
            .await;

        let response = connector(server.uri(), &BTreeMap::new()).open(4).await.unwrap();
        assert_eq!(response.offset, 4);
        assert_eq!(response.total_length, Some(8));
        assert_eq!(response.resume_offset(2), Some(6));
        assert_eq!(response.resume_offset(4), None);
    }

    #[tokio::test]
    async fn test_peeked_bytes_are_forwarded_first() {
        let server = MockServer::start().await;
        let body: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/octet-stream")
                    .insert_header("icy-br", "128,128")
                    .set_body_bytes(body.clone()),
            )
            .mount(&server)
            .await;

        let mut response = connector(server.uri(), &BTreeMap::new()).open(0).await.unwrap();
        assert_eq!(response.content_type.as_deref(), Some("application/octet-stream"));
        assert!(response.icy);
        assert_eq!(response.icy_bitrate_kbps, Some(128));

        let head = response.peek_head(512, Duration::from_secs(2)).await.unwrap();
        assert!(head.len() >= 512);
        assert_eq!(head[..512], body[..512]);

        let buffer = RingBuffer::new(1 << 16, 0);
        let (outcome, forwarded) = response
            .pump_into(&buffer, Duration::from_secs(1), &CancellationToken::new())
            .await;
        assert_eq!(outcome, UpstreamOutcome::Finished);
        assert_eq!(forwarded, body.len() as u64);
        assert_eq!(drain(&buffer).await, body);
    }

    #[tokio::test]
    async fn test_cancel_stops_pump() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 4096]))
            .mount(&server)
            .await;

        let response = connector(server.uri(), &BTreeMap::new()).open(0).await.unwrap();
        // A one-byte buffer with no reader blocks the pump until cancelled.
        let buffer = RingBuffer::new(1, 0);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (outcome, _) = response
            .pump_into(&buffer, Duration::from_secs(1), &cancel)
            .await;
        assert_eq!(outcome, UpstreamOutcome::Cancelled);
    }
}

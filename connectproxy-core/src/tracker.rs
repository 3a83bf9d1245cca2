//! Per-request traffic accounting
//!
//! The [`TrafficTracker`] keeps one [`ActiveRequest`] per in-flight request in a
//! concurrent registry. Byte counts are fed by stream wrappers handed out by the
//! `track_*` methods; every wrapper of a request shares that request's atomic
//! counters and nothing else. [`TrafficTracker::end_request`] removes the entry
//! and publishes an immutable [`RequestStats`] snapshot to subscribers.
//!
//! ```text
//!   client ──TrackedSocket──▶ proxy ──CountingStream──▶ target
//!          (client upload)          (target upload/download)
//! ```

use crate::counter::{ByteCount, CountingStream, byte_len};
use crate::http::{RequestHead, render_headers};
use crate::request_id::{ConnectionId, RequestId, RequestIdAllocator};
use dashmap::DashMap;
use http::uri::{Authority, Uri};
use serde::Serialize;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::broadcast;
use tracing::debug;

/// Hostname recorded when a request target cannot be parsed.
pub const UNKNOWN_HOST: &str = "unknown";

/// Traffic record of a single request.
///
/// `total_upload_bytes` and `total_download_bytes` mirror the client-side
/// counters: they describe the client-facing leg, not a sum of both legs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStats {
    pub request_id: RequestId,
    pub method: String,
    pub url: String,
    pub hostname: String,
    pub port: u16,
    /// Milliseconds since the UNIX epoch
    pub start_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    /// Milliseconds between start and end
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    pub is_http: bool,
    pub client_upload_bytes: u64,
    pub client_download_bytes: u64,
    pub target_upload_bytes: u64,
    pub target_download_bytes: u64,
    pub total_upload_bytes: u64,
    pub total_download_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Leg {
    ClientUpload,
    ClientDownload,
    TargetUpload,
    TargetDownload,
}

/// Registry entry of an in-flight request.
#[derive(Debug)]
pub struct ActiveRequest {
    id: RequestId,
    method: String,
    url: String,
    hostname: String,
    port: u16,
    start_time: u64,
    is_http: bool,
    client_upload: AtomicU64,
    client_download: AtomicU64,
    target_upload: AtomicU64,
    target_download: AtomicU64,
    // 0 until a response status is recorded
    status_code: AtomicU16,
}

impl ActiveRequest {
    fn counter(&self, leg: Leg) -> &AtomicU64 {
        match leg {
            Leg::ClientUpload => &self.client_upload,
            Leg::ClientDownload => &self.client_download,
            Leg::TargetUpload => &self.target_upload,
            Leg::TargetDownload => &self.target_download,
        }
    }

    fn add(&self, leg: Leg, bytes: u64) {
        self.counter(leg).fetch_add(bytes, Ordering::Relaxed);
    }

    fn snapshot(&self) -> RequestStats {
        let client_upload_bytes = self.client_upload.load(Ordering::Relaxed);
        let client_download_bytes = self.client_download.load(Ordering::Relaxed);
        RequestStats {
            request_id: self.id,
            method: self.method.clone(),
            url: self.url.clone(),
            hostname: self.hostname.clone(),
            port: self.port,
            start_time: self.start_time,
            end_time: None,
            duration: None,
            is_http: self.is_http,
            client_upload_bytes,
            client_download_bytes,
            target_upload_bytes: self.target_upload.load(Ordering::Relaxed),
            target_download_bytes: self.target_download.load(Ordering::Relaxed),
            total_upload_bytes: client_upload_bytes,
            total_download_bytes: client_download_bytes,
            status_code: match self.status_code.load(Ordering::Relaxed) {
                0 => None,
                code => Some(code),
            },
            error: None,
        }
    }
}

/// Routes a byte count into one counter of one request.
struct LegCounter {
    request: Arc<ActiveRequest>,
    leg: Leg,
}

impl ByteCount for LegCounter {
    #[inline]
    fn count(&self, bytes: u64) {
        self.request.add(self.leg, bytes);
    }
}

struct TrackerInner {
    active: DashMap<RequestId, Arc<ActiveRequest>>,
    ids: RequestIdAllocator,
    completed: broadcast::Sender<Arc<RequestStats>>,
}

/// Registry of in-flight request statistics.
///
/// Cloning is cheap; clones share the same registry and id sequence.
#[derive(Clone)]
pub struct TrafficTracker {
    inner: Arc<TrackerInner>,
}

impl TrafficTracker {
    /// Creates a tracker whose completion channel buffers `event_capacity`
    /// records for slow subscribers.
    pub fn new(event_capacity: usize) -> Self {
        let (completed, _) = broadcast::channel(event_capacity.max(1));
        Self {
            inner: Arc::new(TrackerInner {
                active: DashMap::new(),
                ids: RequestIdAllocator::new(),
                completed,
            }),
        }
    }

    /// Receives every finalized [`RequestStats`] published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RequestStats>> {
        self.inner.completed.subscribe()
    }

    /// Registers a new request and returns its id. Never fails: an unparsable
    /// target is recorded as `unknown:80`.
    pub fn start_request(
        &self,
        request: &RequestHead,
        connection_id: ConnectionId,
        is_http: bool,
    ) -> RequestId {
        let id = self.inner.ids.allocate(connection_id);
        let target = parse_target(request);

        let entry = Arc::new(ActiveRequest {
            id,
            method: request.method.clone(),
            url: target.url,
            hostname: target.hostname,
            port: target.port,
            start_time: now_millis(),
            is_http,
            client_upload: AtomicU64::new(0),
            client_download: AtomicU64::new(0),
            target_upload: AtomicU64::new(0),
            target_download: AtomicU64::new(0),
            status_code: AtomicU16::new(0),
        });

        debug!(
            request_id = %id,
            method = %entry.method,
            host = %entry.hostname,
            port = entry.port,
            is_http,
            "Request tracking started"
        );
        self.inner.active.insert(id, entry);
        id
    }

    /// Starts accounting for a plain HTTP exchange.
    ///
    /// The request header size is added to the client upload immediately; the
    /// returned handle wraps the request body and the response writer.
    pub fn track_http_request(&self, id: &RequestId, request: &RequestHead) -> HttpTracking {
        let entry = self.lookup(id);
        if let Some(entry) = &entry {
            entry.add(Leg::ClientUpload, request_headers_size(&request.headers));
        }
        HttpTracking {
            tracker: self.clone(),
            id: *id,
            entry,
        }
    }

    /// Wraps the client-facing socket of a tunnel.
    ///
    /// Received bytes count as client upload. The request ends when the socket
    /// is dropped, or with the error message when an I/O error surfaces first.
    pub fn track_connect_request<S>(&self, id: &RequestId, socket: S) -> TrackedSocket<S> {
        let entry = self.lookup(id);
        let stream = match &entry {
            Some(entry) => CountingStream::new(socket).count_reads(LegCounter {
                request: entry.clone(),
                leg: Leg::ClientUpload,
            }),
            None => CountingStream::new(socket),
        };
        TrackedSocket {
            inner: stream,
            completion: Completion::new(entry.map(|_| self.clone()), *id),
        }
    }

    /// Wraps the target-facing socket of a request. Target counters are kept
    /// apart from the client totals; dropping this stream ends nothing.
    pub fn track_target_socket<S>(&self, id: &RequestId, socket: S) -> CountingStream<S> {
        match self.lookup(id) {
            Some(entry) => CountingStream::new(socket)
                .count_writes(LegCounter {
                    request: entry.clone(),
                    leg: Leg::TargetUpload,
                })
                .count_reads(LegCounter {
                    request: entry,
                    leg: Leg::TargetDownload,
                }),
            None => CountingStream::new(socket),
        }
    }

    /// Finalizes a request: stamps end time and duration, records `error`,
    /// removes the registry entry and publishes the snapshot.
    ///
    /// Only the first call for an id has an effect; later calls return `None`.
    pub fn end_request(&self, id: &RequestId, error: Option<&str>) -> Option<Arc<RequestStats>> {
        let (_, entry) = self.inner.active.remove(id)?;

        let end_time = now_millis();
        let mut stats = entry.snapshot();
        stats.end_time = Some(end_time);
        stats.duration = Some(end_time.saturating_sub(stats.start_time));
        stats.error = error.map(str::to_string);
        stats.total_upload_bytes = stats.client_upload_bytes;
        stats.total_download_bytes = stats.client_download_bytes;

        debug!(
            request_id = %id,
            duration_ms = stats.duration,
            upload = stats.total_upload_bytes,
            download = stats.total_download_bytes,
            error = stats.error.as_deref(),
            "Request tracking ended"
        );

        let stats = Arc::new(stats);
        // No subscribers is not an error
        let _ = self.inner.completed.send(stats.clone());
        Some(stats)
    }

    /// Live snapshot of an in-flight request.
    pub fn get_request_stats(&self, id: &RequestId) -> Option<RequestStats> {
        self.inner.active.get(id).map(|entry| entry.snapshot())
    }

    /// Live snapshots of every in-flight request.
    pub fn get_active_requests(&self) -> Vec<RequestStats> {
        self.inner
            .active
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    /// Drops all in-flight entries without publishing anything. Wrappers still
    /// alive keep working but their completion becomes a no-op.
    pub fn clear(&self) {
        self.inner.active.clear();
    }

    fn lookup(&self, id: &RequestId) -> Option<Arc<ActiveRequest>> {
        self.inner.active.get(id).map(|entry| entry.value().clone())
    }
}

impl Default for TrafficTracker {
    fn default() -> Self {
        Self::new(1024)
    }
}

struct Target {
    hostname: String,
    port: u16,
    url: String,
}

fn parse_target(request: &RequestHead) -> Target {
    let parsed = if request.is_connect() {
        parse_connect_target(&request.url)
    } else {
        parse_url_target(&request.url)
    };
    parsed.unwrap_or_else(|| Target {
        hostname: UNKNOWN_HOST.to_string(),
        port: 80,
        url: if request.url.is_empty() {
            UNKNOWN_HOST.to_string()
        } else {
            request.url.clone()
        },
    })
}

fn parse_connect_target(url: &str) -> Option<Target> {
    let authority: Authority = url.parse().ok()?;
    let host = authority.host();
    if host.is_empty() {
        return None;
    }
    let port = authority.port_u16().unwrap_or(443);
    Some(Target {
        hostname: unbracket(host).to_string(),
        port,
        url: format!("{}:{}", host, port),
    })
}

fn parse_url_target(url: &str) -> Option<Target> {
    let uri: Uri = url.parse().ok()?;
    let scheme = uri.scheme_str()?;
    let host = uri.host().filter(|host| !host.is_empty())?;
    let port = uri
        .port_u16()
        .unwrap_or(if scheme.eq_ignore_ascii_case("https") { 443 } else { 80 });
    Some(Target {
        hostname: unbracket(host).to_string(),
        port,
        url: url.to_string(),
    })
}

pub(crate) fn unbracket(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|inner| inner.strip_suffix(']'))
        .unwrap_or(host)
}

/// Size of a request header block: every header rendered as `name: value`,
/// lines joined by CRLF, followed by a blank line.
pub fn request_headers_size(headers: &[(String, String)]) -> u64 {
    let lines: u64 = headers
        .iter()
        .map(|(name, value)| byte_len(name) + 2 + byte_len(value))
        .sum();
    let separators = headers.len().saturating_sub(1) as u64 * 2;
    lines + separators + 4
}

/// Size of a response head as synthesized from its status and headers:
/// `HTTP/1.1 <code> <reason>\r\n`, then the request-style header block.
pub fn response_headers_size(status: u16, headers: &[(String, String)]) -> u64 {
    let status_line = format!("HTTP/1.1 {} {}\r\n", status, reason_phrase(status));
    byte_len(&status_line) + request_headers_size(headers)
}

fn reason_phrase(status: u16) -> &'static str {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or("")
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Ends a request once, either explicitly or when dropped.
struct Completion {
    tracker: Option<TrafficTracker>,
    id: RequestId,
}

impl Completion {
    fn new(tracker: Option<TrafficTracker>, id: RequestId) -> Self {
        Self { tracker, id }
    }

    fn finish(&mut self, error: Option<&str>) {
        if let Some(tracker) = self.tracker.take() {
            tracker.end_request(&self.id, error);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.finish(None);
    }
}

/// Client-facing tunnel socket reporting into a [`TrafficTracker`].
pub struct TrackedSocket<S> {
    inner: CountingStream<S>,
    completion: Completion,
}

impl<S> TrackedSocket<S> {
    /// A socket that reports nothing.
    pub fn untracked(socket: S) -> Self {
        Self {
            inner: CountingStream::new(socket),
            completion: Completion::new(None, RequestId::new(0, 0)),
        }
    }

    /// Tears the socket down. With a cause, the request ends with its message;
    /// otherwise it ends as a plain close.
    pub fn destroy(mut self, cause: Option<&io::Error>) {
        if let Some(err) = cause {
            self.completion.finish(Some(&err.to_string()));
        }
    }

    fn observe<T>(&mut self, result: &Poll<io::Result<T>>) {
        if let Poll::Ready(Err(err)) = result {
            self.completion.finish(Some(&err.to_string()));
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TrackedSocket<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        self.observe(&result);
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TrackedSocket<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, data);
        self.observe(&result);
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let result = Pin::new(&mut self.inner).poll_flush(cx);
        self.observe(&result);
        result
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let result = Pin::new(&mut self.inner).poll_shutdown(cx);
        self.observe(&result);
        result
    }
}

/// Accounting handle for one plain HTTP request/response exchange.
pub struct HttpTracking {
    tracker: TrafficTracker,
    id: RequestId,
    entry: Option<Arc<ActiveRequest>>,
}

impl HttpTracking {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Counts request body bytes read through the wrapper as client upload.
    pub fn request_body<R>(&self, body: R) -> CountingStream<R> {
        match &self.entry {
            Some(entry) => CountingStream::new(body).count_reads(LegCounter {
                request: entry.clone(),
                leg: Leg::ClientUpload,
            }),
            None => CountingStream::new(body),
        }
    }

    /// Wraps the writer the response is sent through.
    pub fn response<W>(&self, writer: W) -> TrackedResponse<W> {
        let inner = match &self.entry {
            Some(entry) => CountingStream::new(writer).count_writes(LegCounter {
                request: entry.clone(),
                leg: Leg::ClientDownload,
            }),
            None => CountingStream::new(writer),
        };
        TrackedResponse {
            inner,
            entry: self.entry.clone(),
            status: 200,
            headers: Vec::new(),
            completion: Completion::new(self.entry.as_ref().map(|_| self.tracker.clone()), self.id),
        }
    }
}

/// Response writer of a tracked HTTP exchange.
///
/// Body bytes written through it count as client download. [`end`](Self::end)
/// adds the synthesized head size, records the status and finalizes the
/// request; dropping the writer without ending it finalizes as a close.
pub struct TrackedResponse<W> {
    inner: CountingStream<W>,
    entry: Option<Arc<ActiveRequest>>,
    status: u16,
    headers: Vec<(String, String)>,
    completion: Completion,
}

impl<W: AsyncWrite + Unpin> TrackedResponse<W> {
    /// Sends the status line and headers. They are accounted for at `end`,
    /// not as body bytes.
    pub async fn write_head(
        &mut self,
        status: u16,
        headers: Vec<(String, String)>,
    ) -> io::Result<()> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", status, reason_phrase(status));
        render_headers(&headers, &mut head);
        head.push_str("\r\n");
        self.inner.get_mut().write_all(head.as_bytes()).await?;

        self.status = status;
        self.headers = headers;
        Ok(())
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Flushes the response and finalizes the request.
    pub async fn end(mut self) -> io::Result<()> {
        let flushed = self.inner.flush().await;
        self.account_head();
        match &flushed {
            Ok(()) => self.completion.finish(None),
            Err(err) => self.completion.finish(Some(&err.to_string())),
        }
        flushed
    }

    /// Finalizes the request with an error message.
    pub async fn fail(mut self, error: &str) -> io::Result<()> {
        let flushed = self.inner.flush().await;
        self.account_head();
        self.completion.finish(Some(error));
        flushed
    }

    fn account_head(&self) {
        if let Some(entry) = &self.entry {
            entry.add(
                Leg::ClientDownload,
                response_headers_size(self.status, &self.headers),
            );
            entry.status_code.store(self.status, Ordering::Relaxed);
        }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for TrackedResponse<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

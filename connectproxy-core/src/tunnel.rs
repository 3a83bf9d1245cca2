//! Direct CONNECT tunnels
//!
//! [`establish_direct_tunnel`] opens a TCP connection to the target named in a
//! CONNECT request, acknowledges the client and splices both sockets until the
//! target side closes:
//!
//! ```text
//! client ──CONNECT──▶ proxy ──TCP──▶ target
//! client ◀──200─────  proxy
//! client ◀═════════ bytes ═════════▶ target
//! ```

use crate::counter::CountingStream;
use crate::events::{RequestFinished, TunnelEvents};
use crate::http::RequestHead;
use crate::request_id::{ConnectionId, RequestId};
use crate::tracker::{TrackedSocket, TrafficTracker, unbracket};
use bytes::{Buf, Bytes};
use futures::future::{self, BoxFuture};
use http::uri::Authority;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, Interest, ReadBuf, ReadHalf};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;

/// Acknowledgement sent to the client once the target connection is up.
pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_STALLED_WRITE_TIMEOUT: Duration = Duration::from_secs(300);

const SPLICE_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
    MissingHostname,
    MissingPort,
    InvalidTarget(String),
}

impl fmt::Display for TunnelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelError::MissingHostname => write!(f, "Missing CONNECT hostname"),
            TunnelError::MissingPort => write!(f, "Missing CONNECT port"),
            TunnelError::InvalidTarget(target) => write!(f, "Invalid CONNECT target: {}", target),
        }
    }
}

impl std::error::Error for TunnelError {}

/// Host and port of a CONNECT request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    /// Hostname or IP literal, IPv6 without brackets
    pub host: String,
    pub port: u16,
}

impl ConnectTarget {
    /// Parses an authority-form target such as `example.com:443` or `[::1]:8443`.
    /// The port is mandatory.
    pub fn parse(url: &str) -> Result<Self, TunnelError> {
        let url = url.trim();
        if url.is_empty() || url.starts_with(':') {
            return Err(TunnelError::MissingHostname);
        }

        let authority: Authority = url
            .parse()
            .map_err(|_| TunnelError::InvalidTarget(url.to_string()))?;
        let host = unbracket(authority.host());
        if host.is_empty() {
            return Err(TunnelError::MissingHostname);
        }
        let port = authority.port().ok_or(TunnelError::MissingPort)?.as_u16();

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Address family restriction for outgoing connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    /// Maps the numeric family used in configuration (4 or 6).
    pub fn from_version(version: u8) -> Option<Self> {
        match version {
            4 => Some(IpFamily::V4),
            6 => Some(IpFamily::V6),
            _ => None,
        }
    }

    #[inline]
    pub fn matches(&self, addr: &SocketAddr) -> bool {
        match self {
            IpFamily::V4 => addr.is_ipv4(),
            IpFamily::V6 => addr.is_ipv6(),
        }
    }
}

/// Hostname resolution used when connecting to a target.
pub trait Resolve: Send + Sync {
    fn resolve<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, io::Result<Vec<SocketAddr>>>;
}

/// Resolves through the operating system.
pub struct SystemResolver;

impl Resolve for SystemResolver {
    fn resolve<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, io::Result<Vec<SocketAddr>>> {
        Box::pin(async move { Ok(lookup_host((host, port)).await?.collect()) })
    }
}

/// Per-tunnel options supplied by the server.
#[derive(Clone)]
pub struct HandlerOpts {
    /// Local address outgoing sockets bind to
    pub local_address: Option<IpAddr>,
    pub ip_family: Option<IpFamily>,
    /// Replaces the system resolver when set
    pub resolver: Option<Arc<dyn Resolve>>,
    /// Opaque value echoed back in [`RequestFinished`]
    pub custom_tag: Option<serde_json::Value>,
    pub request_id: String,
    pub connection_id: ConnectionId,
    /// Applies to each connection attempt separately
    pub connect_timeout: Duration,
    /// A splice write that makes no progress for this long tears the tunnel down
    pub stalled_write_timeout: Duration,
    pub traffic: Option<TrafficTracker>,
}

impl HandlerOpts {
    pub fn new(request_id: impl Into<String>, connection_id: ConnectionId) -> Self {
        Self {
            local_address: None,
            ip_family: None,
            resolver: None,
            custom_tag: None,
            request_id: request_id.into(),
            connection_id,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            stalled_write_timeout: DEFAULT_STALLED_WRITE_TIMEOUT,
            traffic: None,
        }
    }
}

/// Stream that yields `head` before reading from the inner stream.
///
/// Bytes a client pipelined behind its CONNECT head are replayed this way so
/// they reach the target first.
pub struct ReplayStream<S> {
    head: Bytes,
    inner: S,
}

impl<S> ReplayStream<S> {
    pub fn new(head: Bytes, inner: S) -> Self {
        Self { head, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ReplayStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.head.has_remaining() {
            let n = self.head.len().min(buf.remaining());
            buf.put_slice(&self.head[..n]);
            self.head.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ReplayStream<S> {
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

/// Starts a direct tunnel for a CONNECT request.
///
/// `head` holds bytes the client sent after the request head; they are
/// forwarded to the target before anything else read from `source`. Target
/// parse errors are returned before any socket is opened. Everything after that
/// runs on the returned task, and failures are reported through `events`.
pub fn establish_direct_tunnel<S>(
    request: RequestHead,
    source: S,
    head: Bytes,
    opts: HandlerOpts,
    events: Arc<dyn TunnelEvents>,
) -> Result<JoinHandle<()>, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let target = ConnectTarget::parse(&request.url)?;

    let source = ReplayStream::new(head, source);
    let (source, stats_id) = match &opts.traffic {
        Some(tracker) => {
            let id = tracker.start_request(&request, opts.connection_id, false);
            (tracker.track_connect_request(&id, source), Some(id))
        }
        None => (TrackedSocket::untracked(source), None),
    };

    debug!(
        connection_id = opts.connection_id,
        target = %target,
        "Establishing direct tunnel"
    );

    let tunnel = Tunnel {
        request,
        opts,
        events,
        stats_id,
    };
    Ok(tokio::spawn(tunnel.run(source, target)))
}

/// Opens a TCP connection to `target`, trying each resolved address in turn.
pub async fn connect_target(target: &ConnectTarget, opts: &HandlerOpts) -> io::Result<TcpStream> {
    let addrs = match target.host.parse::<IpAddr>() {
        Ok(ip) => vec![SocketAddr::new(ip, target.port)],
        Err(_) => match &opts.resolver {
            Some(resolver) => resolver.resolve(&target.host, target.port).await?,
            None => SystemResolver.resolve(&target.host, target.port).await?,
        },
    };

    let mut last_error = None;
    for addr in addrs
        .into_iter()
        .filter(|addr| opts.ip_family.is_none_or(|family| family.matches(addr)))
    {
        debug!(connection_id = opts.connection_id, %addr, "Connecting to target");
        match connect_addr(addr, opts).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(connection_id = opts.connection_id, %addr, error = %e, "Connect attempt failed");
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no usable address for {}", target.host),
        )
    }))
}

async fn connect_addr(addr: SocketAddr, opts: &HandlerOpts) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if let Some(local) = opts.local_address {
        socket.bind(SocketAddr::new(local, 0))?;
    }

    timeout(opts.connect_timeout, socket.connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("connect to {} timed out", addr)))?
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Source,
    Destination,
}

impl Side {
    fn prefix(&self) -> &'static str {
        match self {
            Side::Source => "Direct Source Socket Error",
            Side::Destination => "Direct Destination Socket Error",
        }
    }
}

struct PumpError {
    side: Side,
    error: io::Error,
}

/// Read side of a tunnel leg that can notice its connection failing while the
/// tunnel is blocked writing to the other leg.
trait WatchReset {
    /// Resolves with the socket error once the connection is reset.
    fn reset(&self) -> BoxFuture<'_, io::Error>;
}

impl WatchReset for CountingStream<OwnedReadHalf> {
    fn reset(&self) -> BoxFuture<'_, io::Error> {
        let socket = self.get_ref();
        Box::pin(async move {
            match socket.ready(Interest::ERROR).await {
                Ok(_) => match socket.as_ref().take_error() {
                    Ok(Some(error)) => error,
                    Ok(None) => io::ErrorKind::ConnectionReset.into(),
                    Err(error) => error,
                },
                Err(error) => error,
            }
        })
    }
}

// Client streams are opaque. A reset there surfaces on the next read, or as a
// stalled write towards the target.
impl<S> WatchReset for ReadHalf<S> {
    fn reset(&self) -> BoxFuture<'_, io::Error> {
        Box::pin(future::pending())
    }
}

/// Copies `reader` into `writer` until EOF. Errors are attributed to the
/// socket they surfaced on.
///
/// While a write is pending the reader is still watched, so a target reset
/// ends the copy even when the client has stopped draining. A write that makes
/// no progress for `stalled_write` fails on the leg being written.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    from: Side,
    to: Side,
    shutdown_on_eof: bool,
    stalled_write: Duration,
) -> Result<(), PumpError>
where
    R: AsyncRead + WatchReset + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; SPLICE_BUFFER_SIZE];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|error| PumpError { side: from, error })?;
        if n == 0 {
            break;
        }
        tokio::select! {
            written = timeout(stalled_write, writer.write_all(&buf[..n])) => match written {
                Ok(result) => result.map_err(|error| PumpError { side: to, error })?,
                Err(_) => {
                    return Err(PumpError {
                        side: to,
                        error: io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("write stalled for {}s", stalled_write.as_secs_f64()),
                        ),
                    });
                }
            },
            error = reader.reset() => return Err(PumpError { side: from, error }),
        }
    }
    if shutdown_on_eof {
        writer
            .shutdown()
            .await
            .map_err(|error| PumpError { side: to, error })?;
    }
    Ok(())
}

struct Tunnel {
    request: RequestHead,
    opts: HandlerOpts,
    events: Arc<dyn TunnelEvents>,
    stats_id: Option<RequestId>,
}

impl Tunnel {
    async fn run<S>(self, mut source: TrackedSocket<S>, target: ConnectTarget)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let stream = match connect_target(&target, &self.opts).await {
            Ok(stream) => stream,
            Err(e) => {
                self.report(Side::Destination, &e);
                source.destroy(Some(&e));
                self.finish();
                return;
            }
        };
        let target_stream = match (&self.opts.traffic, &self.stats_id) {
            (Some(tracker), Some(id)) => tracker.track_target_socket(id, stream),
            _ => CountingStream::new(stream),
        };

        if let Err(e) = acknowledge(&mut source).await {
            self.report(Side::Source, &e);
            source.destroy(Some(&e));
            drop(target_stream);
            self.finish();
            return;
        }

        debug!(
            connection_id = self.opts.connection_id,
            target = %target,
            "Tunnel established"
        );
        self.splice(source, target_stream).await;
    }

    async fn splice<A>(self, source: A, target: CountingStream<TcpStream>)
    where
        A: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut source_read, mut source_write) = tokio::io::split(source);
        let (mut target_read, mut target_write) = target.into_split();
        let stalled_write = self.opts.stalled_write_timeout;

        let ended = {
            let upload = pump(
                &mut source_read,
                &mut target_write,
                Side::Source,
                Side::Destination,
                true,
                stalled_write,
            );
            let download = pump(
                &mut target_read,
                &mut source_write,
                Side::Destination,
                Side::Source,
                false,
                stalled_write,
            );
            tokio::pin!(upload, download);

            // Source EOF only half-closes the target; the tunnel lives until
            // the target side is done.
            let mut upload_open = true;
            loop {
                tokio::select! {
                    result = &mut upload, if upload_open => match result {
                        Ok(()) => upload_open = false,
                        Err(e) => break Err(e),
                    },
                    result = &mut download => break result,
                }
            }
        };

        match ended {
            Ok(()) => {
                self.finish();
                if let Err(e) = source_write.shutdown().await {
                    debug!(error = %e, "Source shutdown failed");
                }
            }
            Err(PumpError { side, error }) => {
                self.report(side, &error);
                drop((target_read, target_write));
                drop((source_read, source_write));
                self.finish();
            }
        }
    }

    fn report(&self, side: Side, error: &io::Error) {
        self.events.log(
            self.opts.connection_id,
            &format!("{}: {}", side.prefix(), error),
        );
        // No-op when the tracked source already recorded the error
        if let (Some(tracker), Some(id)) = (&self.opts.traffic, &self.stats_id) {
            tracker.end_request(id, Some(&error.to_string()));
        }
    }

    fn finish(self) {
        let event = RequestFinished {
            id: self.opts.request_id,
            request: self.request,
            connection_id: self.opts.connection_id,
            custom_tag: self.opts.custom_tag,
            stats_id: self.stats_id,
        };
        self.events.request_finished(event);
    }
}

async fn acknowledge<S: AsyncWrite + Unpin>(source: &mut S) -> io::Result<()> {
    source.write_all(CONNECTION_ESTABLISHED).await?;
    source.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target() {
        let target = ConnectTarget::parse("example.com:443").unwrap();
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 443);
        assert_eq!(target.to_string(), "example.com:443");
    }

    #[test]
    fn test_parse_ipv6_target_is_unbracketed() {
        let target = ConnectTarget::parse("[2001:db8::1]:8443").unwrap();
        assert_eq!(target.host, "2001:db8::1");
        assert_eq!(target.port, 8443);
        assert_eq!(target.to_string(), "[2001:db8::1]:8443");
    }

    #[test]
    fn test_parse_missing_parts() {
        assert_eq!(ConnectTarget::parse("example.com"), Err(TunnelError::MissingPort));
        assert_eq!(ConnectTarget::parse(""), Err(TunnelError::MissingHostname));
        assert_eq!(ConnectTarget::parse(":443"), Err(TunnelError::MissingHostname));
        assert!(matches!(
            ConnectTarget::parse("bad host:443"),
            Err(TunnelError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_tunnel_error_messages() {
        assert_eq!(TunnelError::MissingHostname.to_string(), "Missing CONNECT hostname");
        assert_eq!(TunnelError::MissingPort.to_string(), "Missing CONNECT port");
    }

    #[test]
    fn test_ip_family() {
        let v4: SocketAddr = "127.0.0.1:80".parse().unwrap();
        let v6: SocketAddr = "[::1]:80".parse().unwrap();
        assert_eq!(IpFamily::from_version(4), Some(IpFamily::V4));
        assert_eq!(IpFamily::from_version(5), None);
        assert!(IpFamily::V4.matches(&v4));
        assert!(!IpFamily::V4.matches(&v6));
        assert!(IpFamily::V6.matches(&v6));
    }

    #[tokio::test]
    async fn test_replay_stream_yields_head_first() {
        let rest: &[u8] = b" world";
        let mut stream = ReplayStream::new(Bytes::from_static(b"hello"), rest);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn test_replay_stream_respects_small_buffers() {
        let rest: &[u8] = b"";
        let mut stream = ReplayStream::new(Bytes::from_static(b"abcdef"), rest);
        let mut buf = [0u8; 4];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ef");
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_connect_with_family_filter_and_no_candidates() {
        struct Fixed(Vec<SocketAddr>);
        impl Resolve for Fixed {
            fn resolve<'a>(&'a self, _: &'a str, _: u16) -> BoxFuture<'a, io::Result<Vec<SocketAddr>>> {
                let addrs = self.0.clone();
                Box::pin(async move { Ok(addrs) })
            }
        }

        let mut opts = HandlerOpts::new("r", 1);
        opts.resolver = Some(Arc::new(Fixed(vec!["127.0.0.1:1".parse().unwrap()])));
        opts.ip_family = Some(IpFamily::V6);
        let target = ConnectTarget::parse("proxy.test:1").unwrap();
        let err = connect_target(&target, &opts).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}

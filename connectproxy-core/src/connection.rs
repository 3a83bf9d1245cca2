use crate::counter::CountingStream;
use crate::events::TunnelEvents;
use crate::forward::forward_http;
use crate::http::{self, HttpError, RequestHead};
use crate::metrics::ProxyMetrics;
use crate::request_id::{ConnectionId, ConnectionIdAllocator};
use crate::tracker::TrafficTracker;
use crate::tunnel::{ConnectTarget, HandlerOpts, IpFamily, establish_direct_tunnel};
use bytes::Bytes;
use connectproxy_config::Config;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Duration, timeout};
use tracing::{debug, error, info};

const BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

type BoxError = Box<dyn Error + Send + Sync>;

/// Serves client connections: reads the request head and hands the
/// connection to a CONNECT tunnel or to the plain HTTP forwarder.
#[derive(Clone)]
pub struct ConnectionHandler {
    config: Arc<Config>,
    tracker: TrafficTracker,
    events: Arc<dyn TunnelEvents>,
    metrics: Option<Arc<ProxyMetrics>>,
    connection_ids: Arc<ConnectionIdAllocator>,
}

impl ConnectionHandler {
    pub fn new(
        config: Arc<Config>,
        tracker: TrafficTracker,
        events: Arc<dyn TunnelEvents>,
        metrics: Option<Arc<ProxyMetrics>>,
    ) -> Self {
        Self {
            config,
            tracker,
            events,
            metrics,
            connection_ids: Arc::new(ConnectionIdAllocator::new()),
        }
    }

    pub async fn handle_connection(&self, client: TcpStream, client_addr: SocketAddr) {
        let connection_id = self.connection_ids.next_id();
        let peer = client_addr.to_string();
        let start_time = std::time::Instant::now();

        if let Some(ref metrics) = self.metrics {
            metrics.connections_active.inc();
        }

        debug!(peer, connection_id, "New connection");

        let result = match &self.metrics {
            Some(metrics) => {
                let client = CountingStream::new(client)
                    .count_reads(metrics.bytes_transferred.with_label_values(&["upload"]))
                    .count_writes(metrics.bytes_transferred.with_label_values(&["download"]));
                self.process_connection(client, connection_id).await
            }
            None => self.process_connection(client, connection_id).await,
        };
        let duration = start_time.elapsed().as_secs_f64();

        if let Some(ref metrics) = self.metrics {
            metrics.connections_active.dec();

            let (kind, status) = match &result {
                Ok(kind) => (*kind, "success"),
                Err(_) => ("unknown", "failure"),
            };
            metrics
                .connections_total
                .with_label_values(&[kind, status])
                .inc();
        }

        match result {
            Ok(kind) => info!(peer, connection_id, kind, duration_secs = %duration, "Connection completed"),
            Err(e) => {
                let error_msg = e.to_string();

                // Client misbehavior is not worth an error-level entry
                let is_client_error = e.downcast_ref::<HttpError>().is_some()
                    || error_msg.contains("Connection reset")
                    || error_msg.contains("Broken pipe");

                if is_client_error {
                    debug!(peer, connection_id, error = %error_msg, duration_secs = %duration, "Client request rejected");
                } else {
                    error!(peer, connection_id, error = %error_msg, duration_secs = %duration, "Connection error");
                }

                if let Some(ref metrics) = self.metrics {
                    metrics.errors_total.with_label_values(&["connection"]).inc();
                }
            }
        }
    }

    /// Returns the kind of request the connection carried.
    async fn process_connection<S>(
        &self,
        mut client: S,
        connection_id: ConnectionId,
    ) -> Result<&'static str, BoxError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let head_timeout = Duration::from_secs(self.config.timeouts.request_head);
        let mut buffer = Vec::new();
        let end = timeout(head_timeout, http::read_head(&mut client, &mut buffer))
            .await
            .map_err(HttpError::from)??;
        let request = http::parse_request_head(&buffer[..end])?;
        let leftover = Bytes::copy_from_slice(&buffer[end..]);

        debug!(connection_id, method = %request.method, target = %request.url, "Request received");

        let opts = self.handler_opts(connection_id);
        if request.is_connect() {
            if let Err(e) = ConnectTarget::parse(&request.url) {
                client.write_all(BAD_REQUEST).await?;
                client.shutdown().await?;
                return Err(e.into());
            }
            self.tunnel(request, client, leftover, opts).await?;
            Ok("connect")
        } else {
            forward_http(request, client, leftover, &opts, &self.tracker).await?;
            Ok("http")
        }
    }

    async fn tunnel<S>(
        &self,
        request: RequestHead,
        client: S,
        leftover: Bytes,
        opts: HandlerOpts,
    ) -> Result<(), BoxError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handle = establish_direct_tunnel(request, client, leftover, opts, self.events.clone())?;
        handle.await?;
        Ok(())
    }

    fn handler_opts(&self, connection_id: ConnectionId) -> HandlerOpts {
        let outbound = self.config.outbound();
        let mut opts = HandlerOpts::new(connection_id.to_string(), connection_id);
        opts.local_address = outbound.local_address;
        opts.ip_family = outbound.ip_family.and_then(IpFamily::from_version);
        opts.connect_timeout = Duration::from_secs(self.config.timeouts.connect);
        opts.stalled_write_timeout = Duration::from_secs(self.config.timeouts.stalled_write);
        opts.traffic = Some(self.tracker.clone());
        opts
    }
}

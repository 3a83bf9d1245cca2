pub mod connection;
pub mod counter;
pub mod events;
pub mod forward;
pub mod http;
pub mod metrics;
pub mod request_id;
pub mod tracker;
pub mod tunnel;

pub use crate::http::RequestHead;
pub use counter::{ByteCount, CountFn, CountingStream};
pub use events::{RequestFinished, ServerEvents, TunnelEvents};
pub use request_id::{ConnectionId, RequestId};
pub use tracker::{RequestStats, TrafficTracker};
pub use tunnel::{HandlerOpts, TunnelError, establish_direct_tunnel};

use connection::ConnectionHandler;
use connectproxy_config::Config;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use metrics::ProxyMetrics;
use prometheus::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Runs the proxy until `shutdown` fires.
///
/// Every finalized traffic record is logged (when `stats.log_completed` is set)
/// and fed into the Prometheus collectors when a registry is given.
pub async fn run_proxy(
    config: Config,
    tracker: TrafficTracker,
    registry: Option<Registry>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Arc::new(config);
    let metrics = match &registry {
        Some(registry) => Some(Arc::new(ProxyMetrics::new(registry)?)),
        None => None,
    };
    let events: Arc<dyn TunnelEvents> = Arc::new(ServerEvents::new(config.stats().event_capacity));
    let handler = ConnectionHandler::new(config.clone(), tracker.clone(), events, metrics.clone());

    let mut listeners: Vec<TcpListener> = Vec::new();
    for addr_str in &config.listen_addrs {
        let addr: SocketAddr = addr_str.parse()?;
        info!("Starting listener on {}", addr);
        listeners.push(TcpListener::bind(addr).await?);
    }

    let observer = tokio::spawn(observe_completed(
        tracker.subscribe(),
        metrics,
        config.stats().log_completed,
    ));

    info!("Proxy started, waiting for connections...");

    loop {
        let mut accepts = FuturesUnordered::new();
        for listener in &listeners {
            accepts.push(listener.accept());
        }

        tokio::select! {
            _ = shutdown.recv() => {
                info!("Received shutdown signal");
                break;
            }
            Some(result) = accepts.next() => {
                match result {
                    Ok((socket, addr)) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            handler.handle_connection(socket, addr).await;
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
        }
    }

    let in_flight = tracker.active_count();
    if in_flight > 0 {
        warn!(in_flight, "Dropping in-flight request statistics");
    }
    tracker.clear();
    observer.abort();

    info!("Shutting down proxy");
    Ok(())
}

async fn observe_completed(
    mut completed: broadcast::Receiver<Arc<RequestStats>>,
    metrics: Option<Arc<ProxyMetrics>>,
    log_completed: bool,
) {
    loop {
        match completed.recv().await {
            Ok(stats) => {
                if let Some(metrics) = &metrics {
                    metrics.observe_completed(&stats);
                }
                if log_completed {
                    info!(
                        request_id = %stats.request_id,
                        method = %stats.method,
                        target = %stats.url,
                        status = stats.status_code,
                        duration_ms = stats.duration,
                        upload = stats.total_upload_bytes,
                        download = stats.total_download_bytes,
                        target_upload = stats.target_upload_bytes,
                        target_download = stats.target_download_bytes,
                        error = stats.error.as_deref(),
                        "Request completed"
                    );
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Completion observer lagged behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

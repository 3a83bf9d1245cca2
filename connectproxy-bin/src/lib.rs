use bytes::Bytes;
use connectproxy_config::Config;
use connectproxy_core::{TrafficTracker, run_proxy};
use http_body_util::Full;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry, TextEncoder};
use std::convert::Infallible;
use std::error::Error;
use std::net::SocketAddr;
use std::path::Path;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

pub async fn run(config_path: &Path) -> Result<(), Box<dyn Error + Send + Sync>> {
    // Initialize logging
    fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
                .add_directive("connectproxy_core=debug".parse()?),
        )
        .with_target(false)
        .json()
        .init();

    // Load configuration
    let config = Config::from_file(config_path)?;
    let tracker = TrafficTracker::new(config.stats().event_capacity);

    // Set up metrics and the admin endpoint
    let registry = if config.metrics.enabled {
        let registry = Registry::new();
        let admin_addr: SocketAddr = config.metrics.address.parse()?;
        let admin_listener = TcpListener::bind(admin_addr).await?;
        info!("Admin endpoint listening on {}", admin_addr);
        tokio::spawn(serve_admin(admin_listener, registry.clone(), tracker.clone()));
        Some(registry)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                let _ = shutdown_tx.send(());
            }
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
    });

    // Run the proxy
    run_proxy(config, tracker, registry, shutdown_rx).await
}

/// Serves `GET /metrics` and `GET /requests` until the listener fails.
pub async fn serve_admin(listener: TcpListener, registry: Registry, tracker: TrafficTracker) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Admin accept error: {}", e);
                continue;
            }
        };
        let registry = registry.clone();
        let tracker = tracker.clone();
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            let service = hyper::service::service_fn(move |req: Request<hyper::body::Incoming>| {
                let response = admin_response(req.method(), req.uri().path(), &registry, &tracker);
                async move { Ok::<_, Infallible>(response) }
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                warn!("Admin server error: {}", err);
            }
        });
    }
}

/// Routes one admin request.
pub fn admin_response(
    method: &Method,
    path: &str,
    registry: &Registry,
    tracker: &TrafficTracker,
) -> Response<Full<Bytes>> {
    if method != Method::GET {
        return plain(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }

    match path {
        "/metrics" => {
            let encoder = TextEncoder::new();
            let mut buffer = Vec::new();
            if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
                return plain(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &format!("Metrics encoding error: {}", e),
                );
            }
            with_content_type(Response::new(Full::new(Bytes::from(buffer))), encoder.format_type())
        }
        "/requests" => match serde_json::to_vec(&tracker.get_active_requests()) {
            Ok(body) => with_content_type(Response::new(Full::new(Bytes::from(body))), "application/json"),
            Err(e) => plain(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("Stats encoding error: {}", e),
            ),
        },
        _ => plain(StatusCode::NOT_FOUND, "not found"),
    }
}

fn plain(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = with_content_type(
        Response::new(Full::new(Bytes::from(message.to_string()))),
        "text/plain",
    );
    *response.status_mut() = status;
    response
}

fn with_content_type(mut response: Response<Full<Bytes>>, content_type: &str) -> Response<Full<Bytes>> {
    if let Ok(value) = HeaderValue::from_str(content_type) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

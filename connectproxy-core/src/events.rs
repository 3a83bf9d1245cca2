//! Notifications a tunnel sends back to the server that owns it

use crate::http::RequestHead;
use crate::request_id::{ConnectionId, RequestId};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Emitted once per tunnel when its target side has closed.
#[derive(Debug, Clone)]
pub struct RequestFinished {
    /// Caller-supplied request id, passed through untouched
    pub id: String,
    pub request: RequestHead,
    pub connection_id: ConnectionId,
    pub custom_tag: Option<serde_json::Value>,
    /// Key of the traffic record, when the tunnel reported into a tracker
    pub stats_id: Option<RequestId>,
}

/// Server-side collaborator of a tunnel.
pub trait TunnelEvents: Send + Sync {
    /// Free-form diagnostic message about a connection.
    fn log(&self, connection_id: ConnectionId, message: &str);

    fn request_finished(&self, event: RequestFinished);
}

/// Default [`TunnelEvents`] implementation: logs through `tracing` and
/// republishes `request_finished` on a broadcast channel.
pub struct ServerEvents {
    finished: broadcast::Sender<Arc<RequestFinished>>,
}

impl ServerEvents {
    pub fn new(capacity: usize) -> Self {
        let (finished, _) = broadcast::channel(capacity.max(1));
        Self { finished }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RequestFinished>> {
        self.finished.subscribe()
    }
}

impl Default for ServerEvents {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl TunnelEvents for ServerEvents {
    fn log(&self, connection_id: ConnectionId, message: &str) {
        warn!(connection_id, "{}", message);
    }

    fn request_finished(&self, event: RequestFinished) {
        debug!(
            connection_id = event.connection_id,
            request_id = %event.id,
            target = %event.request.url,
            "Request finished"
        );
        let _ = self.finished.send(Arc::new(event));
    }
}

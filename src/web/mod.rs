//! Preview HTTP server
//!
//! Serves whatever the display would show (local or remote view) as
//! MJPEG, a JPEG snapshot, a JSON status document and the event bus as
//! server-sent events.

mod handlers;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use crate::error::{AppError, Result};
use crate::state::RunContext;
use crate::transport::Publisher;
use crate::utils::bind_tcp_listener;
use crate::worker::SharedWorkerStatus;

pub use routes::create_router;

/// State shared by all preview handlers
pub struct AppState {
    pub ctx: RunContext,
    /// MJPEG sampling rate
    pub fps: u32,
    pub remote: String,
    pub publisher: Option<Arc<Publisher>>,
    pub worker: Option<SharedWorkerStatus>,
}

impl AppState {
    pub fn new(ctx: RunContext, fps: u32, remote: impl Into<String>) -> Self {
        Self {
            ctx,
            fps,
            remote: remote.into(),
            publisher: None,
            worker: None,
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_worker(mut self, status: SharedWorkerStatus) -> Self {
        self.worker = Some(status);
        self
    }
}

/// Serve the preview until the run context stops
pub async fn serve(bind: SocketAddr, state: Arc<AppState>) -> Result<()> {
    let ctx = state.ctx.clone();
    let listener = bind_tcp_listener(bind).map_err(|e| AppError::Bind {
        port: bind.port(),
        reason: e.to_string(),
    })?;
    info!("Preview server listening on http://{}", bind);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { ctx.stopped().await })
        .await?;

    info!("Preview server stopped");
    Ok(())
}

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use bytes::{BufMut, Bytes, BytesMut};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use super::AppState;
use crate::state::{Field, SharedState};
use crate::stream::View;
use crate::video::DisplayFrame;
use crate::worker::WorkerStatus;

/// JPEG of whatever the display currently shows
fn current_jpeg(state: &SharedState) -> Option<Bytes> {
    match View::current(state) {
        View::Remote => state
            .get::<Option<Arc<DisplayFrame>>>(Field::RemoteFrame, None)
            .filter(|f| f.has_valid_jpeg())
            .map(|f| f.jpeg.clone()),
        View::Local => state.get::<Option<Bytes>>(Field::LocalFrame, None),
    }
}

/// Create MJPEG multipart frame bytes
fn create_mjpeg_part(jpeg_data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(128 + jpeg_data.len());

    buf.put_slice(b"--frame\r\n");
    buf.put_slice(b"Content-Type: image/jpeg\r\n");
    buf.put_slice(format!("Content-Length: {}\r\n", jpeg_data.len()).as_bytes());
    buf.put_slice(b"\r\n");

    buf.put_slice(jpeg_data);
    buf.put_slice(b"\r\n");

    buf.freeze()
}

/// MJPEG stream of the displayed view, sampled at the configured fps
pub async fn mjpeg_stream(State(app): State<Arc<AppState>>) -> impl IntoResponse {
    let ctx = app.ctx.clone();
    let period = Duration::from_millis(1000 / app.fps.max(1) as u64);

    let body_stream = async_stream::stream! {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last: Option<Bytes> = None;

        while ctx.should_run() {
            ticker.tick().await;
            let Some(jpeg) = current_jpeg(ctx.state()) else {
                continue;
            };
            // Same buffer means no new frame since the last tick
            if last.as_ref().is_some_and(|prev| prev.as_ptr() == jpeg.as_ptr()) {
                continue;
            }
            yield Ok::<Bytes, Infallible>(create_mjpeg_part(&jpeg));
            last = Some(jpeg);
        }
        debug!("MJPEG client stream ended");
    };

    (
        [
            (header::CONTENT_TYPE, "multipart/x-mixed-replace; boundary=frame"),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            (header::PRAGMA, "no-cache"),
        ],
        Body::from_stream(body_stream),
    )
}

/// Single JPEG snapshot
pub async fn snapshot(State(app): State<Arc<AppState>>) -> Response {
    match current_jpeg(app.ctx.state()) {
        Some(jpeg) => (
            [
                (header::CONTENT_TYPE, "image/jpeg"),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            jpeg,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "No frame available").into_response(),
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub view: View,
    pub local_people: u32,
    pub remote_people: u32,
    /// Seconds since the last accepted remote frame
    pub remote_frame_age: Option<f64>,
    pub remote: String,
    pub peers_connected: usize,
    pub worker: Option<WorkerStatus>,
}

pub async fn status(State(app): State<Arc<AppState>>) -> Json<StatusResponse> {
    let fields = app.ctx.state().snapshot();
    let last_remote = fields.get::<Option<Instant>>(Field::LastRemoteFrameTime, None);

    Json(StatusResponse {
        view: View::from_display_local(fields.get(Field::DisplayLocal, true)),
        local_people: fields.get(Field::LocalNumPeople, 0),
        remote_people: fields.get(Field::RemoteNumPeople, 0),
        remote_frame_age: last_remote.map(|t| t.elapsed().as_secs_f64()),
        remote: app.remote.clone(),
        peers_connected: app
            .publisher
            .as_ref()
            .map_or(0, |p| p.connection_count()),
        worker: app.worker.as_ref().map(|w| w.read().clone()),
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Comma separated topic patterns (`link.*`, `worker.restarted`)
    pub topics: Option<String>,
}

/// Event bus as server-sent events
pub async fn events(
    State(app): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let topics: Vec<String> = query
        .topics
        .unwrap_or_else(|| "*".to_string())
        .split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    let ctx = app.ctx.clone();
    let mut rx = ctx.events().subscribe();

    // The bus outlives the server, so the stream ends on stop instead
    let stream = async_stream::stream! {
        loop {
            let received = tokio::select! {
                received = rx.recv() => received,
                _ = ctx.stopped() => break,
            };
            match received {
                Ok(event) => {
                    if !topics.iter().any(|t| event.matches_topic(t)) {
                        continue;
                    }
                    match Event::default().event(event.event_name()).json_data(&event) {
                        Ok(sse) => yield Ok(sse),
                        Err(e) => debug!("Failed to encode event: {}", e),
                    }
                }
                Err(RecvError::Lagged(n)) => debug!("Event client lagged by {}", n),
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Event client stream ended");
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub async fn health() -> &'static str {
    "ok"
}

//! WebSocket ingest listener.
//!
//! Devices keep one socket open and push one encoded image per binary
//! message. Each connection is served by its own task; the only shared
//! critical section is the single ledger append after the frame is on disk.

use crate::ledger::{FrameLedger, FrameRecord};
use crate::staging::{StagingError, StagingStore};
use crate::stats::RecorderStats;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, trace, warn};

/// State shared by all ingest handlers.
#[derive(Clone)]
pub struct IngestState {
    pub staging: Arc<StagingStore>,
    pub ledger: Arc<FrameLedger>,
    pub stats: Arc<RecorderStats>,
    pub shutdown: CancellationToken,
    /// Upgraded sockets, awaited on shutdown
    pub connections: TaskTracker,
}

/// What the connection loop should do after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageAction {
    Continue,
    Close,
}

/// Create the ingest router.
pub fn create_router(state: IngestState, ingest_path: &str) -> Router {
    Router::new()
        .route(ingest_path, get(ws_handler))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the router on an already bound listener until `shutdown` fires.
pub async fn serve(listener: TcpListener, state: IngestState, ingest_path: &str) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let local_addr = listener.local_addr().context("Listener has no local address")?;
    let router = create_router(state, ingest_path);

    info!(address = %local_addr, path = %ingest_path, "Ingest listener started");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .context("Ingest server error")?;

    info!("Ingest listener stopped");
    Ok(())
}

async fn health_check(State(state): State<IngestState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "framereel-recorder",
        "pending_frames": state.ledger.len(),
        "stats": state.stats.snapshot(),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<IngestState>,
) -> impl IntoResponse {
    let connections = state.connections.clone();
    ws.on_upgrade(move |socket| connections.track_future(handle_socket(socket, peer, state)))
}

async fn handle_socket(mut socket: WebSocket, peer: SocketAddr, state: IngestState) {
    info!(peer = %peer, "Client connected");
    state.stats.connection_opened();

    loop {
        let message = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            message = socket.recv() => message,
        };

        match message {
            Some(Ok(message)) => {
                if handle_message(&state, peer, message).await == MessageAction::Close {
                    info!(peer = %peer, "Client disconnected normally");
                    break;
                }
            }
            Some(Err(e)) => {
                warn!(peer = %peer, error = %e, "Client disconnected with error");
                break;
            }
            None => {
                info!(peer = %peer, "Client stream ended");
                break;
            }
        }
    }

    state.stats.connection_closed();
    info!(peer = %peer, "Connection closed");
}

/// Dispatch one WebSocket message.
pub async fn handle_message(state: &IngestState, peer: SocketAddr, message: Message) -> MessageAction {
    match message {
        Message::Binary(payload) => {
            if let Err(e) = ingest_frame(state, &payload).await {
                state.stats.record_dropped_frame();
                error!(peer = %peer, error = %e, "Error saving frame");
            }
            MessageAction::Continue
        }
        Message::Text(text) => {
            warn!(peer = %peer, message = %truncate(&text, 128), "Received non-binary message");
            MessageAction::Continue
        }
        Message::Ping(_) | Message::Pong(_) => {
            trace!(peer = %peer, "Control frame");
            MessageAction::Continue
        }
        Message::Close(_) => MessageAction::Close,
    }
}

/// Stage one frame and record it in the ledger.
///
/// The receipt time is the frame's capture time.
pub async fn ingest_frame(state: &IngestState, payload: &[u8]) -> Result<FrameRecord, StagingError> {
    let received_at = Utc::now();
    let path = state.staging.write_frame(payload, received_at).await?;

    let record = FrameRecord::new(received_at, path);
    state.ledger.append(record.clone());
    state.stats.record_frame(payload.len());

    debug!(
        path = %record.path.display(),
        size = payload.len(),
        "Received and saved frame"
    );
    Ok(record)
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

//! HTTP and WebSocket surface of the coordinator.
//!
//! - `POST /rounds/:id/start` and `POST /rounds/:id/cancel`
//! - `GET /rounds/:id/status`: live session if running, stored round otherwise
//! - `GET /ws`: progress stream; clients send `{"type":"subscribe","topic":"training:<id>"}`
//! - `GET /live`, `GET /ready`

use std::sync::Arc;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;
use fedround_core::{is_live, is_ready, Orchestrator, OrchestratorError, ProgressBus, StartAck, StoreError};

pub fn router(orchestrator: Orchestrator) -> Router {
    Router::new()
        .route("/live", get(|| async { Json(json!({ "live": is_live() })) }))
        .route("/ready", get(|| async { Json(json!({ "ready": is_ready() })) }))
        .route("/rounds/:id/start", post(start_round))
        .route("/rounds/:id/cancel", post(cancel_round))
        .route("/rounds/:id/status", get(round_status))
        .route("/ws", get(ws_upgrade))
        .with_state(orchestrator)
}

pub struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self { Self(e) }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            OrchestratorError::RoundNotFound(_) | OrchestratorError::Store(StoreError::RoundNotFound(_)) => StatusCode::NOT_FOUND,
            OrchestratorError::AlreadyRunning(_) | OrchestratorError::InvalidState { .. } => StatusCode::CONFLICT,
            OrchestratorError::NoDevicesAssigned(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() { warn!(error = %self.0, "request failed"); }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn start_round(State(orch): State<Orchestrator>, Path(id): Path<Uuid>) -> Result<Json<StartAck>, ApiError> {
    Ok(Json(orch.start(id).await?))
}

async fn cancel_round(State(orch): State<Orchestrator>, Path(id): Path<Uuid>) -> Result<Json<Value>, ApiError> {
    let cancelled = orch.cancel(id).await?;
    Ok(Json(json!({ "round_id": id, "cancelled": cancelled })))
}

async fn round_status(State(orch): State<Orchestrator>, Path(id): Path<Uuid>) -> Result<Json<Value>, ApiError> {
    if let Some(session) = orch.status(id) {
        return Ok(Json(json!({ "active": true, "session": session })));
    }
    let round = orch.store().get_round(id).await.map_err(OrchestratorError::from)?.ok_or(OrchestratorError::RoundNotFound(id))?;
    Ok(Json(json!({ "active": false, "round": round })))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(orch): State<Orchestrator>) -> Response {
    let bus = orch.bus().clone();
    ws.on_upgrade(move |socket| observe(socket, bus))
}

/// Pumps bus events to the socket and applies subscribe/unsubscribe frames until either side closes.
async fn observe(socket: WebSocket, bus: Arc<ProgressBus>) {
    let observer = Uuid::new_v4().to_string();
    let mut events = bus.connect(observer.clone());
    let (mut sink, mut stream) = socket.split();
    debug!(%observer, "observer_connected");
    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if sink.send(Message::Text(text)).await.is_err() { break; }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(raw))) => {
                    let ack = bus.handle_frame(&observer, &raw);
                    let Ok(text) = serde_json::to_string(&ack) else { continue };
                    if sink.send(Message::Text(text)).await.is_err() { break; }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    bus.disconnect(&observer);
}

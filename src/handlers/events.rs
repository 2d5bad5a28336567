//! WebSocket event stream handlers.
//!
//! Subscribers get a current-state snapshot on connect, then live events.
//! Delivery while disconnected is not backfilled; reconnecting clients rely
//! on the snapshot instead of the stream for anything they missed.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::events::DeviceEvent;
use crate::middleware::auth::OperatorContext;
use crate::models::Device;
use crate::{AppError, AppResult, AppState};

/// Subscribe to one device's event stream
pub async fn device_events(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    operator: OperatorContext,
    Path(id): Path<Uuid>,
) -> AppResult<Response> {
    let device = Device::find_by_id(&state.pool, id)
        .await?
        .ok_or(AppError::UnknownDevice)?;
    if device.org_id != operator.org_id {
        return Err(AppError::Forbidden);
    }

    let rx = state.events.subscribe_device(device.id).await;
    let snapshot = json!({
        "type": "snapshot",
        "devices": [device.view(Utc::now(), state.config.offline_after())],
        "timestamp": Utc::now(),
    });

    Ok(ws.on_upgrade(move |socket| stream_events(socket, rx, snapshot)))
}

/// Subscribe to all devices in the operator's organization
pub async fn org_events(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    operator: OperatorContext,
) -> AppResult<Response> {
    let devices = Device::list_by_org(&state.pool, operator.org_id, 500).await?;
    let now = Utc::now();
    let window = state.config.offline_after();
    let views: Vec<_> = devices.into_iter().map(|d| d.view(now, window)).collect();

    let rx = state.events.subscribe_org(operator.org_id).await;
    let snapshot = json!({
        "type": "snapshot",
        "devices": views,
        "timestamp": Utc::now(),
    });

    Ok(ws.on_upgrade(move |socket| stream_events(socket, rx, snapshot)))
}

async fn stream_events(
    socket: WebSocket,
    mut rx: broadcast::Receiver<DeviceEvent>,
    snapshot: serde_json::Value,
) {
    let (mut sender, mut receiver) = socket.split();

    match serde_json::to_string(&snapshot) {
        Ok(text) => {
            if sender.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
        Err(e) => {
            tracing::error!("Failed to serialize snapshot: {}", e);
            return;
        }
    }

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else { continue };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // At-most-once delivery: lagged events are gone, the
                    // client re-syncs from the snapshot on reconnect.
                    tracing::debug!("Event subscriber lagged, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

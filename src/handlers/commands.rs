//! Operator command handlers: dispatch, cancel, history.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::is_unique_violation;
use crate::middleware::auth::OperatorContext;
use crate::models::{
    self, deadline_for, CommandKind, CommandOutcome, CommandRecord, Device,
};
use crate::{AppError, AppResult, AppState};

#[derive(Debug, Deserialize)]
pub struct DispatchRequest {
    pub command: CommandKind,
}

#[derive(Debug, Serialize)]
pub struct DispatchResponse {
    pub record: CommandRecord,
    /// Presence at dispatch time. Informational only; an offline device can
    /// still receive the command through eventual delivery or the poll
    /// channel, the deadline is the safety net.
    pub device_online: bool,
}

/// Dispatch a command to a device's agent. At most one command may be
/// outstanding per device; the slot claim is a conditional update so two
/// concurrent dispatches can never both succeed.
pub async fn dispatch(
    State(state): State<AppState>,
    operator: OperatorContext,
    Path(id): Path<Uuid>,
    Json(req): Json<DispatchRequest>,
) -> AppResult<Json<DispatchResponse>> {
    let device = Device::find_by_id(&state.pool, id)
        .await?
        .ok_or(AppError::UnknownDevice)?;
    if device.org_id != operator.org_id {
        return Err(AppError::Forbidden);
    }
    if device.agent_id.is_none() {
        return Err(AppError::UnknownDevice);
    }

    let issued_at = Utc::now();
    let deadline = deadline_for(issued_at);

    // Claim and record insert commit together: a claimed slot always has an
    // open record, and a failed insert rolls the claim back.
    let mut tx = state.pool.begin().await?;
    let claimed =
        Device::claim_command(&mut *tx, device.id, req.command.as_str(), issued_at, deadline)
            .await?;
    if !claimed {
        let pending = Device::find_by_id(&state.pool, device.id)
            .await?
            .and_then(|d| d.pending_command)
            .unwrap_or_else(|| "unknown".to_string());
        return Err(AppError::AlreadyPending(pending));
    }

    let record = match CommandRecord::open(
        &mut *tx,
        device.id,
        req.command.as_str(),
        operator.user_id,
        issued_at,
    )
    .await
    {
        Ok(record) => record,
        // The one-open-record index can still collide with a record a
        // half-finished closer left open; that is a conflict, not a 500.
        Err(e) if is_unique_violation(&e) => {
            return Err(AppError::AlreadyPending(req.command.as_str().to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    tx.commit().await?;

    // Fire-and-forget hand-off. The slot stays claimed on failure: the agent
    // may still pick the command up via poll, and the sweep frees the slot
    // at the deadline otherwise.
    let transport = state.transport.clone();
    let handed_off = device.clone();
    let command = req.command;
    tokio::spawn(async move {
        if let Err(e) = transport.deliver(&handed_off, command).await {
            tracing::warn!(
                "Push hand-off of '{}' to {} failed ({}), agent will poll for it",
                command,
                handed_off.id,
                e
            );
        }
    });

    let device_online =
        models::is_online(device.last_heartbeat_at, Utc::now(), state.config.offline_after());
    tracing::info!(
        "Command '{}' dispatched to {} ({}) by {}",
        req.command,
        device.hostname,
        device.id,
        operator.user_id
    );

    Ok(Json(DispatchResponse {
        record,
        device_online,
    }))
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
    pub reason: Option<&'static str>,
}

/// Cancel the pending command, if any. Cancelling with nothing pending is a
/// benign no-op, not an error.
pub async fn cancel(
    State(state): State<AppState>,
    operator: OperatorContext,
    Path(id): Path<Uuid>,
) -> AppResult<Json<CancelResponse>> {
    let device = Device::find_by_id(&state.pool, id)
        .await?
        .ok_or(AppError::UnknownDevice)?;
    if device.org_id != operator.org_id {
        return Err(AppError::Forbidden);
    }

    let Some(pending) = device.pending_command.clone() else {
        tracing::debug!("Cancel on {} with nothing pending", device.id);
        return Ok(Json(CancelResponse {
            cancelled: false,
            reason: Some("nothing_pending"),
        }));
    };

    let mut tx = state.pool.begin().await?;
    let cleared = Device::clear_command_if(&mut *tx, device.id, &pending).await?;
    if !cleared {
        // Lost the race against the report or the sweep between read and clear.
        return Ok(Json(CancelResponse {
            cancelled: false,
            reason: Some("nothing_pending"),
        }));
    }

    CommandRecord::close_if_open(
        &mut *tx,
        device.id,
        &pending,
        CommandOutcome::Cancelled,
        Some("cancelled by operator"),
    )
    .await?;
    tx.commit().await?;

    tracing::info!(
        "Command '{}' cancelled on {} by {}",
        pending,
        device.id,
        operator.user_id
    );

    Ok(Json(CancelResponse {
        cancelled: true,
        reason: None,
    }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

/// Command record history for a device
pub async fn history(
    State(state): State<AppState>,
    operator: OperatorContext,
    Path(id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<Vec<CommandRecord>>> {
    let device = Device::find_by_id(&state.pool, id)
        .await?
        .ok_or(AppError::UnknownDevice)?;
    if device.org_id != operator.org_id {
        return Err(AppError::Forbidden);
    }

    let limit = super::validate_limit(query.limit)?;
    let records = CommandRecord::list_by_device(&state.pool, device.id, limit).await?;
    Ok(Json(records))
}

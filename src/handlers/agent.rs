//! Agent-facing handlers: registration, heartbeat ingest, command poll and
//! execution reports.

use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::middleware::auth::{hash_token, AgentContext};
use crate::models::{CommandKind, CommandOutcome, CommandRecord, Device};
use crate::events::DeviceEvent;
use crate::{AppError, AppResult, AppState};

#[derive(Debug, Deserialize)]
pub struct RegisterAgentRequest {
    pub registration_key: String,
    pub device_code: String,
    pub agent_version: String,
    pub push_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterAgentResponse {
    pub agent_id: Uuid,
    pub device_id: Uuid,
    pub token: String,
}

/// Attach an agent to an existing device. Device rows themselves come from
/// the asset-management side; registration only claims one by device code.
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterAgentRequest>,
) -> AppResult<Json<RegisterAgentResponse>> {
    if req.registration_key != state.config.agent_registration_key {
        return Err(AppError::Unauthorized);
    }

    let agent_id = Uuid::new_v4();
    let token = Uuid::new_v4().to_string();
    let token_hash = hash_token(&token);

    let device = Device::attach_agent(
        &state.pool,
        &req.device_code,
        agent_id,
        &token_hash,
        &req.agent_version,
        req.push_url.as_deref(),
    )
    .await?
    .ok_or(AppError::UnknownDevice)?;

    tracing::info!("Agent registered on {} ({})", device.hostname, device.id);

    Ok(Json(RegisterAgentResponse {
        agent_id,
        device_id: device.id,
        token,
    }))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub cpu_usage: Option<f32>,
    pub memory_usage: Option<f32>,
    pub uptime_seconds: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub agent_id: Uuid,
    pub reported_at: Option<DateTime<Utc>>,
    pub status: Option<StatusSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub accepted: bool,
    pub server_time: i64,
    /// Poll channel: agents without a push URL learn about commands here.
    pub pending_command: Option<CommandKind>,
}

/// Agent heartbeat. Unknown agent ids are logged and dropped; a heartbeat
/// must never create state on the server.
pub async fn heartbeat(
    State(state): State<AppState>,
    Json(req): Json<HeartbeatRequest>,
) -> AppResult<Json<HeartbeatResponse>> {
    let reported_at = req.reported_at.unwrap_or_else(Utc::now);
    let snapshot = req.status.as_ref().and_then(|s| serde_json::to_value(s).ok());

    let Some(update) =
        Device::record_heartbeat(&state.pool, req.agent_id, reported_at, snapshot.as_ref()).await?
    else {
        tracing::warn!("Heartbeat from unknown agent {}, dropped", req.agent_id);
        return Ok(Json(HeartbeatResponse {
            accepted: false,
            server_time: Utc::now().timestamp(),
            pending_command: None,
        }));
    };

    record_heartbeat_metrics(&state.pool, update.id, req.status.as_ref()).await?;

    let went_online = !update.was_online;
    if went_online {
        tracing::info!("Device {} back online", update.id);
    }
    state
        .events
        .publish(
            update.org_id,
            DeviceEvent::heartbeat(
                update.id,
                json!({
                    "is_online": true,
                    "went_online": went_online,
                    "last_heartbeat_at": update.last_heartbeat_at,
                    "status": req.status,
                }),
            ),
        )
        .await;

    Ok(Json(HeartbeatResponse {
        accepted: true,
        server_time: Utc::now().timestamp(),
        pending_command: update.pending_command.as_deref().and_then(|c| c.parse().ok()),
    }))
}

#[derive(Debug, Serialize)]
pub struct PendingCommandResponse {
    pub command: Option<CommandKind>,
    pub issued_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
}

/// Poll endpoint for the currently pending command, if any.
pub async fn pending_command(
    State(state): State<AppState>,
    agent: AgentContext,
) -> AppResult<Json<PendingCommandResponse>> {
    let device = Device::find_by_id(&state.pool, agent.device_id)
        .await?
        .ok_or(AppError::UnknownDevice)?;

    Ok(Json(PendingCommandResponse {
        command: device.pending_command.as_deref().and_then(|c| c.parse().ok()),
        issued_at: device.pending_command_issued_at,
        deadline: device.pending_command_deadline,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ExecutionResultRequest {
    pub command: CommandKind,
    pub success: bool,
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ExecutionResultResponse {
    pub accepted: bool,
    /// False when the report was stale or lost the race against the sweep.
    pub applied: bool,
}

/// Outcome report from the agent for a previously dispatched command.
/// Stale, duplicate or mismatched reports are accepted for logging but do
/// not mutate device state.
pub async fn execution_result(
    State(state): State<AppState>,
    agent: AgentContext,
    Json(req): Json<ExecutionResultRequest>,
) -> AppResult<Json<ExecutionResultResponse>> {
    let device = Device::find_by_id(&state.pool, agent.device_id)
        .await?
        .ok_or(AppError::UnknownDevice)?;

    match device.pending_command.as_deref() {
        None => {
            tracing::info!(
                "Execution report for '{}' on {} with nothing pending, ignored",
                req.command,
                device.id
            );
            return Ok(Json(ExecutionResultResponse {
                accepted: true,
                applied: false,
            }));
        }
        Some(pending) if pending != req.command.as_str() => {
            tracing::warn!(
                "Mismatched execution report on {}: reported '{}', pending '{}'",
                device.id,
                req.command,
                pending
            );
            return Ok(Json(ExecutionResultResponse {
                accepted: true,
                applied: false,
            }));
        }
        Some(_) => {}
    }

    // Guarded clear; the expiry sweep may win this race, in which case the
    // report becomes a no-op. Clear and record close commit together so no
    // window exists where the slot is free but the record still open.
    let mut tx = state.pool.begin().await?;
    let cleared = Device::clear_command_if(&mut *tx, device.id, req.command.as_str()).await?;
    if !cleared {
        tracing::info!(
            "Execution report for '{}' on {} lost the clear race, ignored",
            req.command,
            device.id
        );
        return Ok(Json(ExecutionResultResponse {
            accepted: true,
            applied: false,
        }));
    }

    let outcome = if req.success {
        CommandOutcome::ExecutedSuccess
    } else {
        CommandOutcome::ExecutedFailure
    };
    CommandRecord::close_if_open(
        &mut *tx,
        device.id,
        req.command.as_str(),
        outcome,
        req.message.as_deref(),
    )
    .await?;

    // A successful uninstall retires the agent registration entirely.
    if req.success && req.command == CommandKind::Uninstall {
        Device::detach_agent(&mut *tx, device.id).await?;
    }
    tx.commit().await?;

    state
        .events
        .publish(
            device.org_id,
            DeviceEvent::command_executed(
                device.id,
                req.command.as_str(),
                req.success,
                req.message.as_deref(),
            ),
        )
        .await;

    let status_text = if req.success { "executed" } else { "failed" };
    tracing::info!(
        "Command '{}' {} on device {} ({})",
        req.command,
        status_text,
        device.hostname,
        device.id
    );

    Ok(Json(ExecutionResultResponse {
        accepted: true,
        applied: true,
    }))
}

async fn record_heartbeat_metrics(
    pool: &sqlx::PgPool,
    device_id: Uuid,
    status: Option<&StatusSnapshot>,
) -> AppResult<()> {
    let Some(status) = status else {
        return Ok(());
    };
    sqlx::query(
        r#"
        INSERT INTO heartbeat_history (device_id, cpu_usage, memory_usage, uptime_seconds)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(device_id)
    .bind(status.cpu_usage)
    .bind(status.memory_usage)
    .bind(status.uptime_seconds)
    .execute(pool)
    .await?;
    Ok(())
}

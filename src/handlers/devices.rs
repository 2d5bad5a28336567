//! Device read handlers. Presence is derived from heartbeat recency on
//! every read, never trusted from a cached flag.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::middleware::auth::OperatorContext;
use crate::models::{Device, DeviceView};
use crate::{AppError, AppResult, AppState};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

/// List devices for the operator's organization
pub async fn list(
    State(state): State<AppState>,
    operator: OperatorContext,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<DeviceView>>> {
    let limit = super::validate_limit(query.limit)?;
    let devices = Device::list_by_org(&state.pool, operator.org_id, limit).await?;

    let now = Utc::now();
    let window = state.config.offline_after();
    let views = devices.into_iter().map(|d| d.view(now, window)).collect();
    Ok(Json(views))
}

/// Get a single device
pub async fn get(
    State(state): State<AppState>,
    operator: OperatorContext,
    Path(id): Path<Uuid>,
) -> AppResult<Json<DeviceView>> {
    let device = Device::find_by_id(&state.pool, id)
        .await?
        .ok_or(AppError::UnknownDevice)?;

    if device.org_id != operator.org_id {
        return Err(AppError::Forbidden);
    }

    Ok(Json(device.view(Utc::now(), state.config.offline_after())))
}

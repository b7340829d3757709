//! VM lifecycle and query handlers.

use axum::{
    extract::{Path, State},
    Json,
};
use leasepool_protocol::{DeviceActionRequest, OpResult};
use std::sync::Arc;

use crate::api::error::{require, ApiError};
use crate::api::handlers::detached;
use crate::pool::Pool;

/// POST /{root}/start - Start a leased VM.
pub async fn start(
    State(pool): State<Arc<Pool>>,
    Json(req): Json<DeviceActionRequest>,
) -> Result<Json<OpResult>, ApiError> {
    require("name", &req.name)?;
    detached(async move { pool.start(&req.name, &req.actor).await }).await
}

/// POST /{root}/stop - Stop a leased VM.
pub async fn stop(
    State(pool): State<Arc<Pool>>,
    Json(req): Json<DeviceActionRequest>,
) -> Result<Json<OpResult>, ApiError> {
    require("name", &req.name)?;
    detached(async move { pool.stop(&req.name, &req.actor).await }).await
}

/// POST /{root}/restore - Restore a leased VM to its bound snapshot.
pub async fn restore(
    State(pool): State<Arc<Pool>>,
    Json(req): Json<DeviceActionRequest>,
) -> Result<Json<OpResult>, ApiError> {
    require("name", &req.name)?;
    detached(async move { pool.restore(&req.name, &req.actor).await }).await
}

/// GET /{root}/status/:name - Run state and recent activity.
pub async fn status(
    State(pool): State<Arc<Pool>>,
    Path(name): Path<String>,
) -> Result<Json<OpResult>, ApiError> {
    Ok(Json(pool.query_status(&name).await?))
}

/// GET /{root}/ip/:name - Network address.
pub async fn address(
    State(pool): State<Arc<Pool>>,
    Path(name): Path<String>,
) -> Result<Json<OpResult>, ApiError> {
    Ok(Json(pool.query_address(&name).await?))
}

/// GET /{root}/ping/:hostname - Whether a host answers one ping.
pub async fn ping(
    State(pool): State<Arc<Pool>>,
    Path(hostname): Path<String>,
) -> Result<Json<OpResult>, ApiError> {
    Ok(Json(pool.can_ping(&hostname).await?))
}

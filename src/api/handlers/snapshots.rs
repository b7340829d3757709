//! Snapshot handlers.

use axum::{extract::State, Json};
use leasepool_protocol::{BindSnapshotRequest, DeviceActionRequest, OpResult, RenameSnapshotRequest};
use std::sync::Arc;

use crate::api::error::{require, ApiError};
use crate::api::handlers::detached;
use crate::pool::Pool;

/// POST /{root}/snapshot/take - Take the bound snapshot.
pub async fn take(
    State(pool): State<Arc<Pool>>,
    Json(req): Json<DeviceActionRequest>,
) -> Result<Json<OpResult>, ApiError> {
    require("name", &req.name)?;
    detached(async move { pool.take_snapshot(&req.name, &req.actor).await }).await
}

/// POST /{root}/snapshot/rename - Rename the bound snapshot.
pub async fn rename(
    State(pool): State<Arc<Pool>>,
    Json(req): Json<RenameSnapshotRequest>,
) -> Result<Json<OpResult>, ApiError> {
    require("name", &req.name)?;
    detached(async move {
        pool.rename_snapshot(&req.name, &req.actor, req.new_name.as_deref())
            .await
    })
    .await
}

/// POST /{root}/snapshot/update - Archive and retake the bound snapshot.
pub async fn update(
    State(pool): State<Arc<Pool>>,
    Json(req): Json<DeviceActionRequest>,
) -> Result<Json<OpResult>, ApiError> {
    require("name", &req.name)?;
    detached(async move { pool.update_snapshot(&req.name, &req.actor).await }).await
}

/// POST /{root}/snapshot/bind - Change which snapshot a VM restores to.
pub async fn bind(
    State(pool): State<Arc<Pool>>,
    Json(req): Json<BindSnapshotRequest>,
) -> Result<Json<OpResult>, ApiError> {
    require("name", &req.name)?;
    detached(async move { pool.bind_snapshot(&req.name, &req.actor, &req.snapshot).await }).await
}

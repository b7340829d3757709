//! Catalog handlers.

use axum::{
    extract::{Path, State},
    Json,
};
use leasepool_protocol::{AddDeviceRequest, DeviceActionRequest, DeviceView, OpResult};
use std::sync::Arc;

use crate::api::error::{require, ApiError};
use crate::api::handlers::detached;
use crate::pool::Pool;

/// GET /{root}/devices/:lessor - Catalog as seen by `lessor`.
pub async fn list_devices(
    State(pool): State<Arc<Pool>>,
    Path(lessor): Path<String>,
) -> Json<Vec<DeviceView>> {
    Json(pool.list_devices(&lessor))
}

/// POST /{root}/devices/add - Add a device to the catalog.
pub async fn add_device(
    State(pool): State<Arc<Pool>>,
    Json(req): Json<AddDeviceRequest>,
) -> Result<Json<OpResult>, ApiError> {
    require("device.name", &req.device.name)?;
    detached(async move { pool.add_device(&req.actor, req.device).await }).await
}

/// POST /{root}/devices/remove - Remove a device from the catalog.
pub async fn remove_device(
    State(pool): State<Arc<Pool>>,
    Json(req): Json<DeviceActionRequest>,
) -> Result<Json<OpResult>, ApiError> {
    require("name", &req.name)?;
    detached(async move { pool.remove_device(&req.actor, &req.name).await }).await
}

/// POST /{root}/reload - Re-read the catalog from disk.
pub async fn reload(State(pool): State<Arc<Pool>>) -> Result<Json<OpResult>, ApiError> {
    Ok(Json(pool.reload_catalog()?))
}

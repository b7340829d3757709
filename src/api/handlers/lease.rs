//! Lease and unlease handlers.

use axum::{extract::State, Json};
use leasepool_protocol::{
    DeviceActionRequest, LeaseByContentsRequest, LeaseByNameRequest, LeaseByOsRequest, OpResult,
};
use std::sync::Arc;

use crate::api::error::{require, ApiError};
use crate::api::handlers::detached;
use crate::pool::Pool;

/// POST /{root}/lease/by-name - Lease a device by name.
pub async fn lease_by_name(
    State(pool): State<Arc<Pool>>,
    Json(req): Json<LeaseByNameRequest>,
) -> Result<Json<OpResult>, ApiError> {
    require("name", &req.name)?;
    require("lessor", &req.lessor)?;
    detached(async move { pool.lease_by_name(&req.name, &req.lessor).await }).await
}

/// POST /{root}/lease/by-os - Lease the first available device with an OS.
pub async fn lease_by_os(
    State(pool): State<Arc<Pool>>,
    Json(req): Json<LeaseByOsRequest>,
) -> Result<Json<OpResult>, ApiError> {
    require("os", &req.os)?;
    require("lessor", &req.lessor)?;
    detached(async move { pool.lease_by_os(&req.os, &req.lessor).await }).await
}

/// POST /{root}/lease/by-contents - Lease by contents, OS and word size.
pub async fn lease_by_contents(
    State(pool): State<Arc<Pool>>,
    Json(req): Json<LeaseByContentsRequest>,
) -> Result<Json<OpResult>, ApiError> {
    require("lessor", &req.lessor)?;
    detached(async move {
        pool.lease_by_contents(&req.contents, &req.os, &req.bits, &req.lessor)
            .await
    })
    .await
}

/// POST /{root}/unlease - Release a device.
pub async fn unlease(
    State(pool): State<Arc<Pool>>,
    Json(req): Json<DeviceActionRequest>,
) -> Result<Json<OpResult>, ApiError> {
    require("name", &req.name)?;
    detached(async move { pool.unlease(&req.name, &req.actor).await }).await
}

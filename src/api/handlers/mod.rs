//! Route handlers, grouped by concern.

pub mod devices;
pub mod lease;
pub mod snapshots;
pub mod vm;

use axum::Json;
use leasepool_protocol::OpResult;
use std::future::Future;

use crate::api::error::ApiError;

/// GET /{root}/health - Liveness check.
pub async fn health() -> Json<OpResult> {
    Json(OpResult::ok("ok").with("version", crate::VERSION))
}

/// Run a state-changing pool operation on its own task.
///
/// The task runs to completion even if the client disconnects or the
/// request times out, so a backend is never left half-provisioned.
pub(crate) async fn detached<Fut>(work: Fut) -> Result<Json<OpResult>, ApiError>
where
    Fut: Future<Output = crate::Result<OpResult>> + Send + 'static,
{
    let result = tokio::spawn(work).await?;
    Ok(Json(result?))
}

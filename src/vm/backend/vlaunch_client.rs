//! HTTP client for the vLaunch REST API.

use crate::config::VLaunchConfig;
use crate::error::{Error, Result};
use crate::vm::backend::{LaunchService, VmRecord, WorkRequest};
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;

/// Workflow the service runs for a forced power off.
const FORCE_OFF_WORKFLOW: i64 = 128;

/// [`LaunchService`] over HTTPS.
#[derive(Debug, Clone)]
pub struct VLaunchClient {
    http: Client,
    base: String,
}

impl VLaunchClient {
    /// Client for the service at `config.url`.
    pub fn new(config: &VLaunchConfig) -> Result<Self> {
        if config.url.is_empty() {
            return Err(Error::Config("vlaunch binding needs a url".to_string()));
        }
        let http = Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            base: config.url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn authorized(&self, request: RequestBuilder, token: &str) -> RequestBuilder {
        request.header(AUTHORIZATION, format!("Token token={}", token))
    }

    async fn expect<T: DeserializeOwned>(
        response: Response,
        expected: StatusCode,
        what: &str,
    ) -> Result<T> {
        let status = response.status();
        if status != expected {
            tracing::warn!(status = %status, request = %what, "unexpected vlaunch response");
            return Err(Error::backend(
                "vlaunch",
                format!("{} returned status {}", what, status.as_u16()),
            ));
        }
        Ok(response.json().await?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, token: &str) -> Result<T> {
        let response = self
            .authorized(self.http.get(self.url(path)), token)
            .send()
            .await?;
        Self::expect(response, StatusCode::OK, &format!("GET {}", path)).await
    }

    async fn post(&self, path: &str, body: serde_json::Value, token: &str) -> Result<WorkRequest> {
        tracing::debug!(path = %path, "vlaunch request");
        let response = self
            .authorized(self.http.post(self.url(path)), token)
            .json(&body)
            .send()
            .await?;
        Self::expect(response, StatusCode::CREATED, &format!("POST {}", path)).await
    }
}

#[async_trait]
impl LaunchService for VLaunchClient {
    async fn list_vms(&self, token: &str) -> Result<Vec<VmRecord>> {
        self.get("/vms", token).await
    }

    async fn get_vm(&self, id: i64, token: &str) -> Result<Option<VmRecord>> {
        let path = format!("/vms/{}", id);
        let response = self
            .authorized(self.http.get(self.url(&path)), token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::expect(response, StatusCode::OK, &format!("GET {}", path))
            .await
            .map(Some)
    }

    async fn get_request(&self, id: i64, token: &str) -> Result<WorkRequest> {
        self.get(&format!("/requests/{}", id), token).await
    }

    async fn open_requests(&self, vm_id: i64, token: &str) -> Result<Vec<WorkRequest>> {
        let request = self.http.get(self.url("/requests/")).query(&[
            ("q[vm_id_eq]", vm_id.to_string()),
            ("q[status_not_eq]", "Completed".to_string()),
        ]);
        let response = self.authorized(request, token).send().await?;
        Self::expect(response, StatusCode::OK, "GET /requests/").await
    }

    async fn power_on(&self, vm_id: i64, token: &str) -> Result<WorkRequest> {
        self.post("/actions/poweron", json!({ "vm_id": vm_id, "force": 1 }), token)
            .await
    }

    async fn force_off(&self, vm_id: i64, token: &str) -> Result<WorkRequest> {
        self.post(
            "/requests",
            json!({ "workflow_id": FORCE_OFF_WORKFLOW, "vm_id": vm_id }),
            token,
        )
        .await
    }

    async fn revert_snapshot(
        &self,
        vm_id: i64,
        snapshot_id: i64,
        token: &str,
    ) -> Result<WorkRequest> {
        self.post(
            "/actions/revertsnapshot",
            json!({ "vm_id": vm_id, "snapshot-id": snapshot_id }),
            token,
        )
        .await
    }
}

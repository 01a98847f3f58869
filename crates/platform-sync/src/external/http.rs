// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP adapter for the control plane gateway.
//!
//! | Operation | Request |
//! |-----------|---------|
//! | ensure container | `PUT /v1/projects/{name}` |
//! | apply | `PUT /v1/namespaces/{ns}/shoots/by-owner/{owner_id}` |
//! | delete | `DELETE /v1/shoots/by-owner/{owner_id}` |
//! | list | `GET /v1/shoots?labelSelector=...` |
//! | status | `GET /v1/shoots/by-owner/{owner_id}/status` |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::traits::*;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct EnsureContainerRequest {
    owner_id: Uuid,
}

#[derive(Deserialize)]
struct EnsureContainerResponse {
    #[serde(default)]
    namespace: String,
}

/// External client backed by the control plane's REST gateway.
#[derive(Clone)]
pub struct HttpExternalClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpExternalClient {
    /// Create a client for `base_url` with an optional bearer token.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn label_selector() -> String {
        format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE)
    }
}

async fn status_error(response: Response) -> ExternalError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    ExternalError::Status { status, body }
}

#[async_trait]
impl ExternalClient for HttpExternalClient {
    fn client_type(&self) -> &'static str {
        "http"
    }

    async fn ensure_container(&self, name: &str, owner_id: Uuid) -> Result<String> {
        let response = self
            .request(reqwest::Method::PUT, &format!("/v1/projects/{}", name))
            .json(&EnsureContainerRequest { owner_id })
            .send()
            .await?;

        match response.status() {
            StatusCode::ACCEPTED => {
                debug!(project = %name, "Project accepted, not ready yet");
                Ok(String::new())
            }
            s if s.is_success() => {
                let body: EnsureContainerResponse = response
                    .json()
                    .await
                    .map_err(|e| ExternalError::Decode(e.to_string()))?;
                Ok(body.namespace)
            }
            _ => Err(status_error(response).await),
        }
    }

    async fn apply_resource(&self, spec: &ResourceSpec) -> Result<()> {
        let path = format!(
            "/v1/namespaces/{}/shoots/by-owner/{}",
            spec.namespace, spec.owner_id
        );
        let response = self
            .request(reqwest::Method::PUT, &path)
            .json(spec)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(status_error(response).await)
        }
    }

    async fn delete_resource_by_owner_id(&self, owner_id: Uuid) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::DELETE,
                &format!("/v1/shoots/by-owner/{}", owner_id),
            )
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(status_error(response).await)
        }
    }

    async fn list_resources(&self) -> Result<Vec<ExternalResource>> {
        let response = self
            .request(reqwest::Method::GET, "/v1/shoots")
            .query(&[("labelSelector", Self::label_selector())])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ExternalError::Decode(e.to_string()))
    }

    async fn get_status(&self, spec: &ResourceSpec) -> Result<ResourceStatus> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/v1/shoots/by-owner/{}/status", spec.owner_id),
            )
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(ResourceStatus::not_found()),
            s if s.is_success() => response
                .json()
                .await
                .map_err(|e| ExternalError::Decode(e.to_string())),
            _ => Err(status_error(response).await),
        }
    }
}

use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;

use super::ControlPlane;
use crate::types::{Application, Node};

/// Base URL of the orchestrator, reachable from inside the sidecar container.
const CONTROL_PLANE_URL: &str = "http://host.docker.internal:14440";

/// Asks the control plane not to log our polling traffic.
const DISABLE_LOG_HEADER: &str = "X-agogos-disable-log";

pub struct HttpControlPlane {
    client: Client,
    base_url: String,
}

impl HttpControlPlane {
    pub fn new() -> Self {
        Self::with_base_url(CONTROL_PLANE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .header(DISABLE_LOG_HEADER, "true")
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;
        if status != StatusCode::OK {
            bail!("{} {}", status.as_u16(), String::from_utf8_lossy(&body));
        }

        Ok(body)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let body = self.get(path).await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

impl Default for HttpControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn applications(&self) -> Result<Vec<Application>> {
        self.get_json("/applications").await
    }

    async fn nodes(&self) -> Result<Vec<Node>> {
        self.get_json("/nodes").await
    }
}

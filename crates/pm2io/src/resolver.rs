//! Endpoint discovery
//!
//! One authenticated request/response exchange that turns the static
//! credentials and host facts into the address of the live stream
//! endpoint. No retry happens here; the connect loop owns the retry policy.

use crate::config::Config;
use crate::error::ConnectionError;
use crate::host::HostFacts;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::*;

/// Path of the discovery endpoint on the collector host
pub const VERIFY_PATH: &str = "/api/node/verifyPM2";

#[async_trait]
pub trait Resolve: Send + Sync {
    /// Resolve the current stream endpoint
    async fn resolve(&self) -> Result<String, ConnectionError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub public_id: String,
    pub private_id: String,
    pub data: VerifyData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyData {
    pub machine_name: String,
    pub cpus: usize,
    pub memory: u64,
    pub version: String,
    pub hostname: String,
}

impl VerifyRequest {
    pub fn new(config: &Config, host: &HostFacts) -> Self {
        Self {
            public_id: config.public_key.clone(),
            private_id: config.private_key.clone(),
            data: VerifyData {
                machine_name: host.machine_name.clone(),
                cpus: host.cpus,
                memory: host.memory,
                version: host.version.clone(),
                hostname: host.hostname.clone(),
            },
        }
    }
}

/// Only `endpoints.ws` is consumed, the rest of the body is ignored
#[derive(Debug, Clone, Deserialize)]
pub struct VerifyResponse {
    pub endpoints: Endpoints,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Endpoints {
    pub ws: String,
}

impl VerifyResponse {
    pub fn into_endpoint(self) -> Option<String> {
        let ws = self.endpoints.ws.trim();
        (!ws.is_empty()).then(|| ws.to_string())
    }
}

/// Discovery over HTTPS against `https://{server}/api/node/verifyPM2`
pub struct HttpResolver {
    client: reqwest::Client,
    url: String,
    server: String,
    request: VerifyRequest,
}

impl HttpResolver {
    pub fn new(
        config: &Config,
        host: &HostFacts,
        timeout: Duration,
    ) -> Result<Self, ConnectionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConnectionError::DiscoveryFailed {
                server: config.server.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            url: format!("https://{}{}", config.server, VERIFY_PATH),
            server: config.server.clone(),
            request: VerifyRequest::new(config, host),
        })
    }

    fn failure(&self, reason: impl ToString) -> ConnectionError {
        ConnectionError::DiscoveryFailed {
            server: self.server.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Resolve for HttpResolver {
    async fn resolve(&self) -> Result<String, ConnectionError> {
        trace!("Resolving stream endpoint via {}", self.url);

        let response = self
            .client
            .post(&self.url)
            .json(&self.request)
            .send()
            .await
            .map_err(|e| self.failure(e))?
            .error_for_status()
            .map_err(|e| self.failure(e))?;

        let body: VerifyResponse = response.json().await.map_err(|e| self.failure(e))?;

        body.into_endpoint()
            .ok_or_else(|| self.failure("response carries no stream endpoint"))
    }
}

//! HTTP health probing of the executor API.

use std::time::Duration;

use async_trait::async_trait;

use super::models::HealthStatus;
use crate::error::{SandboxError, SandboxResult};

/// Probes an executor health endpoint. Implemented over HTTP in production
/// and by fakes in tests.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, url: &str) -> HealthStatus;
}

#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    /// `timeout` bounds each single request.
    pub fn new(timeout: Duration) -> SandboxResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SandboxError::Config(format!("building health probe client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, url: &str) -> HealthStatus {
        match self.client.get(url).send().await {
            Ok(res) if res.status() == reqwest::StatusCode::OK => HealthStatus::Healthy,
            Ok(res) => HealthStatus::Unhealthy {
                code: res.status().as_u16(),
            },
            Err(e) => HealthStatus::Error {
                message: e.to_string(),
            },
        }
    }
}

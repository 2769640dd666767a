//! Sandbox data models.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a sandbox container as seen by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Started by the runtime, not yet probed.
    Created,
    /// Running but the health endpoint has not answered yet.
    Starting,
    /// Running and healthy.
    Running,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Created => write!(f, "created"),
            ContainerStatus::Starting => write!(f, "starting"),
            ContainerStatus::Running => write!(f, "running"),
        }
    }
}

/// A session's sandbox container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Container name, derived from the session id.
    pub name: String,
    pub session_id: String,
    /// Host port published for the executor API.
    pub api_port: u16,
    /// Host port published for the code preview server.
    pub code_port: u16,
    /// Host directory bind-mounted as the workspace. Unknown for containers
    /// found through the runtime without a caller-supplied workspace.
    pub workspace_path: Option<PathBuf>,
    pub status: ContainerStatus,
    pub created_at: DateTime<Utc>,
}

impl ContainerInfo {
    /// Base URL of the executor API on the host.
    pub fn api_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.api_port)
    }

    pub fn preview_url(&self, host: &str) -> String {
        format!("http://{}:{}", host, self.code_port)
    }
}

/// Result of a single health probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// The endpoint answered with a non-200 status.
    Unhealthy { code: u16 },
    /// The endpoint could not be reached.
    Error { message: String },
    /// No container exists for the session.
    NotFound,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        *self == HealthStatus::Healthy
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy { code } => write!(f, "unhealthy ({})", code),
            HealthStatus::Error { message } => write!(f, "error: {}", message),
            HealthStatus::NotFound => write!(f, "not_found"),
        }
    }
}

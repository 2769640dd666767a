//! Task requests and synchronous results exchanged with the executor API.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What the executor is asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Write a specification from a prompt.
    Spec,
    /// Implement an existing specification in the workspace.
    Build,
    /// Anything else the executor understands.
    Generic,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Spec => write!(f, "spec"),
            TaskKind::Build => write!(f, "build"),
            TaskKind::Generic => write!(f, "generic"),
        }
    }
}

/// Body of `POST /execute` and `POST /execute/stream`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub session_id: String,
    pub kind: TaskKind,
    pub prompt: String,
    /// Specification the build works from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<String>,
    /// Free-form executor options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

impl TaskRequest {
    pub fn new(session_id: impl Into<String>, kind: TaskKind, prompt: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            kind,
            prompt: prompt.into(),
            spec: None,
            options: None,
        }
    }

    pub fn with_spec(mut self, spec: impl Into<String>) -> Self {
        self.spec = Some(spec.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Response of `POST /execute`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl TaskResult {
    pub fn failed(error_message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            output: None,
            error_message: Some(error_message.into()),
            metadata: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_result_shape() {
        let value = serde_json::to_value(TaskResult::failed("timed out")).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["error_message"], "timed out");
        assert!(value.get("output").is_none());
    }

    #[test]
    fn request_omits_empty_spec() {
        let req = TaskRequest::new("s1", TaskKind::Spec, "write a todo app");
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["kind"], "spec");
        assert!(value.get("spec").is_none());

        let req = req.with_spec("# Spec");
        assert_eq!(serde_json::to_value(&req).unwrap()["spec"], "# Spec");
    }
}

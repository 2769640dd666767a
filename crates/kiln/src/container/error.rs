//! Container runtime error types.

use thiserror::Error;

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors that can occur during container operations.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The container command failed.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Another container already uses the requested name.
    #[error("container name already in use: {0}")]
    NameConflict(String),

    /// Failed to parse container output.
    #[error("failed to parse container output: {0}")]
    ParseError(String),

    /// No container runtime available.
    #[error("no container runtime available (docker or podman)")]
    NoRuntimeAvailable,

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    /// Classify a failed `run` by its stderr. Both docker and podman report a
    /// duplicate name with "already in use".
    pub(crate) fn from_run_stderr(name: Option<&str>, stderr: &str) -> Self {
        if stderr.contains("already in use") {
            return ContainerError::NameConflict(name.unwrap_or_default().to_string());
        }
        ContainerError::CommandFailed {
            command: "run".to_string(),
            message: stderr.trim().to_string(),
        }
    }
}

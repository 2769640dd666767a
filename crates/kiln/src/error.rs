//! Sandbox error taxonomy.

use thiserror::Error;

use crate::container::ContainerError;

/// Result type for sandbox operations.
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Errors raised by sandbox orchestration.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Every port in a configured range is published by a running container.
    #[error("no free port in {service} range {start}-{end}")]
    ResourceExhausted {
        service: &'static str,
        start: u16,
        end: u16,
    },

    /// No owned container exists for the session.
    #[error("no container for session {0}")]
    ContainerNotFound(String),

    /// The runtime refused or failed to start the container.
    #[error("failed to create container {name}: {message}")]
    ContainerCreationFailed { name: String, message: String },

    /// The container did not pass its health check in time.
    #[error("container {name} not healthy after {waited_ms}ms")]
    ContainerUnhealthy { name: String, waited_ms: u64 },

    /// The stream to the executor broke or could not be opened.
    #[error("stream transport error: {0}")]
    StreamTransportError(String),

    /// The executor reported a task failure.
    #[error("remote task error: {0}")]
    RemoteTaskError(String),

    #[error(transparent)]
    Runtime(#[from] ContainerError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Whether retrying later could succeed without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SandboxError::ResourceExhausted { .. }
                | SandboxError::ContainerUnhealthy { .. }
                | SandboxError::StreamTransportError(_)
        )
    }
}

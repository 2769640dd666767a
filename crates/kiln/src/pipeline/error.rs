use thiserror::Error;

use crate::error::SandboxError;
use crate::version::VersionStatus;

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Why a pipeline request was refused before streaming began.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("admission ceiling reached: {active} active versions (limit {limit})")]
    AdmissionRejected { active: i64, limit: u32 },

    #[error("module not found: {0}")]
    ModuleNotFound(String),

    #[error("module {module} is busy building {version}")]
    ModuleBusy { module: String, version: String },

    #[error("version not found: {0}")]
    VersionNotFound(String),

    #[error("version {id} is {actual}, expected {expected}")]
    InvalidState {
        id: String,
        actual: VersionStatus,
        expected: VersionStatus,
    },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Persistence(#[from] anyhow::Error),
}

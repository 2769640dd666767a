//! Version data models and the status graph.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle of a Version.
///
/// ```text
/// SPEC_GENERATING -> SPEC_GENERATED -> CODE_BUILDING -> BUILD_COMPLETED
///        \________________\_________________\________________\__-> DELETED
/// ```
///
/// A failed build rolls CODE_BUILDING back to SPEC_GENERATED through
/// [`VersionStatus::can_roll_back_to`]; that edge is not a forward transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VersionStatus {
    SpecGenerating,
    SpecGenerated,
    CodeBuilding,
    BuildCompleted,
    Deleted,
}

impl VersionStatus {
    /// States that hold an admission slot.
    pub const ACTIVE: [VersionStatus; 3] = [
        VersionStatus::SpecGenerating,
        VersionStatus::SpecGenerated,
        VersionStatus::CodeBuilding,
    ];

    /// States in which a module's Version is reused by a new spec request.
    pub const REUSABLE: [VersionStatus; 2] =
        [VersionStatus::SpecGenerating, VersionStatus::SpecGenerated];

    pub fn as_str(&self) -> &'static str {
        match self {
            VersionStatus::SpecGenerating => "SPEC_GENERATING",
            VersionStatus::SpecGenerated => "SPEC_GENERATED",
            VersionStatus::CodeBuilding => "CODE_BUILDING",
            VersionStatus::BuildCompleted => "BUILD_COMPLETED",
            VersionStatus::Deleted => "DELETED",
        }
    }

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    pub fn is_reusable(&self) -> bool {
        Self::REUSABLE.contains(self)
    }

    /// Forward edges, plus DELETED from anywhere but DELETED.
    pub fn can_transition_to(&self, next: VersionStatus) -> bool {
        use VersionStatus::*;
        matches!(
            (*self, next),
            (SpecGenerating, SpecGenerated)
                | (SpecGenerated, CodeBuilding)
                | (CodeBuilding, BuildCompleted)
                | (SpecGenerating | SpecGenerated | CodeBuilding | BuildCompleted, Deleted)
        )
    }

    /// The single compensating edge taken when a build fails.
    pub fn can_roll_back_to(&self, previous: VersionStatus) -> bool {
        matches!(
            (*self, previous),
            (VersionStatus::CodeBuilding, VersionStatus::SpecGenerated)
        )
    }
}

impl std::fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VersionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "SPEC_GENERATING" => Ok(VersionStatus::SpecGenerating),
            "SPEC_GENERATED" => Ok(VersionStatus::SpecGenerated),
            "CODE_BUILDING" => Ok(VersionStatus::CodeBuilding),
            "BUILD_COMPLETED" => Ok(VersionStatus::BuildCompleted),
            "DELETED" => Ok(VersionStatus::Deleted),
            _ => Err(format!("unknown version status: {}", s)),
        }
    }
}

impl TryFrom<String> for VersionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One spec -> code -> commit attempt of a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Version {
    pub id: String,
    pub module_id: String,
    /// Per-module sequence number behind `code`.
    pub seq: i64,
    /// Human label, `v1`, `v2`, ...
    pub code: String,
    /// Commit sha, set when the build completes.
    #[sqlx(rename = "commit_sha")]
    pub commit: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: VersionStatus,
    pub spec_content: Option<String>,
    /// Last failure or note.
    pub message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

//! Versions: persisted spec -> code -> commit state per module.

mod models;
mod repository;

pub use models::{Version, VersionStatus};
pub use repository::VersionRepository;

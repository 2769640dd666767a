//! Kiln library
//!
//! Per-session sandbox containers, the executor façade that streams tasks
//! into them, and the versioned spec -> code -> commit pipeline on top.

pub mod config;
pub mod container;
pub mod db;
pub mod error;
pub mod executor;
pub mod module;
pub mod pipeline;
pub mod sandbox;
pub mod stream;
pub mod version;

pub use error::{SandboxError, SandboxResult};

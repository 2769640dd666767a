//! Wire types shared between Kiln and the contained executor.
//!
//! ```text
//! caller <--[StreamEvent]-- kiln --[TaskRequest / SSE]--> sandbox container
//!                                                              |
//!                                                     code-generation executor
//! ```
//!
//! The executor owns its event vocabulary (`text`, `tool_use`, `result`, ...).
//! Kiln relays those events untouched and only adds a handful of synthetic
//! wrapper events of its own, listed in [`events::kinds`].

pub mod events;
pub mod task;

pub use events::StreamEvent;
pub use task::{TaskKind, TaskRequest, TaskResult, TaskStatus};

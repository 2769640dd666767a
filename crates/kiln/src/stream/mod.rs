//! SSE relay from sandbox executors.

mod proxy;
mod sse;

pub use proxy::StreamProxy;
pub use sse::{SseDecoder, SseFrame};

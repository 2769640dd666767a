//! Streams executor output as [`StreamEvent`]s.
//!
//! Every failure ends the stream with exactly one `error` event; caller
//! cancellation ends it with one `interrupted` event. Nothing is retried.
//! The timeout is an idle timeout: it restarts whenever a chunk arrives.

use std::time::Duration;

use async_stream::stream;
use futures::{Stream, StreamExt};
use kiln_protocol::{StreamEvent, TaskRequest};
use reqwest::StatusCode;
use reqwest::header::ACCEPT;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::sse::SseDecoder;
use crate::error::SandboxError;

/// Longest remote error body quoted in an `error` event.
const MAX_ERROR_BODY: usize = 512;
/// Bytes read from a rejected response before quoting it.
const MAX_ERROR_BODY_BYTES: usize = MAX_ERROR_BODY * 4;

enum Step<T> {
    Ready(T),
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct StreamProxy {
    client: reqwest::Client,
    timeout: Duration,
}

impl StreamProxy {
    /// `timeout` bounds the wait for the response headers and then each gap
    /// between body chunks.
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// POST `request` to `url` and relay the SSE response.
    pub fn proxy_stream(
        &self,
        url: String,
        request: TaskRequest,
        cancel: CancellationToken,
    ) -> impl Stream<Item = StreamEvent> + Send + 'static {
        let client = self.client.clone();
        let timeout = self.timeout;

        stream! {
            let mut deadline = Instant::now() + timeout;
            debug!(%url, session_id = %request.session_id, "opening executor stream");

            let send = client
                .post(&url)
                .header(ACCEPT, "text/event-stream")
                .json(&request)
                .send();
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                _ = sleep_until(deadline) => Step::TimedOut,
                res = send => Step::Ready(res),
            };

            let response = match step {
                Step::Ready(Ok(response)) => response,
                Step::Ready(Err(e)) => {
                    warn!(%url, error = %e, "executor stream request failed");
                    yield transport_error(&e);
                    return;
                }
                Step::Cancelled => {
                    yield StreamEvent::interrupted();
                    return;
                }
                Step::TimedOut => {
                    yield timeout_error(timeout);
                    return;
                }
            };

            let status = response.status();
            if status != StatusCode::OK {
                // Quote what arrives before the deadline, cancellation or the cap.
                let mut body = response.bytes_stream();
                let mut quoted = Vec::new();
                while quoted.len() < MAX_ERROR_BODY_BYTES {
                    match next_step(&mut body, &cancel, deadline).await {
                        Step::Ready(Some(Ok(bytes))) => quoted.extend_from_slice(&bytes),
                        _ => break,
                    }
                }
                let body = String::from_utf8_lossy(&quoted);
                warn!(%url, %status, "executor stream rejected");
                yield StreamEvent::error(
                    SandboxError::StreamTransportError(format!(
                        "executor returned {}: {}",
                        status,
                        truncate(body.trim(), MAX_ERROR_BODY)
                    ))
                    .to_string(),
                );
                return;
            }

            let mut body = response.bytes_stream();
            let mut decoder = SseDecoder::new();
            loop {
                match next_step(&mut body, &cancel, deadline).await {
                    Step::Ready(Some(Ok(bytes))) => {
                        deadline = Instant::now() + timeout;
                        for frame in decoder.push(&bytes) {
                            yield frame.into_event();
                        }
                    }
                    Step::Ready(Some(Err(e))) => {
                        warn!(%url, error = %e, "executor stream broke");
                        yield transport_error(&e);
                        return;
                    }
                    Step::Ready(None) => break,
                    Step::Cancelled => {
                        debug!(%url, "executor stream cancelled by caller");
                        yield StreamEvent::interrupted();
                        return;
                    }
                    Step::TimedOut => {
                        yield timeout_error(timeout);
                        return;
                    }
                }
            }

            if let Some(frame) = decoder.finish() {
                yield frame.into_event();
            }
            debug!(%url, "executor stream ended");
        }
    }
}

async fn next_step<S>(
    body: &mut S,
    cancel: &CancellationToken,
    deadline: Instant,
) -> Step<Option<S::Item>>
where
    S: Stream + Unpin,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Step::Cancelled,
        _ = sleep_until(deadline) => Step::TimedOut,
        chunk = body.next() => Step::Ready(chunk),
    }
}

fn transport_error(e: &reqwest::Error) -> StreamEvent {
    let message = if e.is_timeout() {
        format!("timed out: {e}")
    } else if e.is_connect() {
        format!("connection failed: {e}")
    } else {
        e.to_string()
    };
    StreamEvent::error(SandboxError::StreamTransportError(message).to_string())
}

fn timeout_error(timeout: Duration) -> StreamEvent {
    StreamEvent::error(
        SandboxError::StreamTransportError(format!(
            "timed out after {}s without output",
            timeout.as_secs_f64()
        ))
            .to_string(),
    )
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

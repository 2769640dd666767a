//! Executor façade: ensures the session's sandbox and talks to the executor
//! API inside it.

mod bootstrap;

pub use bootstrap::{BootstrapHandle, BootstrapOutcome, bootstrap_command, spawn_bootstrap};

use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use futures::Stream;
use kiln_protocol::{StreamEvent, TaskRequest, TaskResult};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{SandboxError, SandboxResult};
use crate::sandbox::{ContainerInfo, ContainerManager};
use crate::stream::StreamProxy;

/// Events relayed from a sandbox, terminated by the remote end, an `error`
/// or an `interrupted` event.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// What the pipeline needs from a sandbox executor.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Stream a task. Never fails: errors arrive as one terminal `error` event.
    fn execute_stream(
        &self,
        session_id: &str,
        workspace: &Path,
        request: TaskRequest,
        cancel: CancellationToken,
    ) -> EventStream;

    /// Run a task to completion in one request.
    async fn execute(&self, session_id: &str, workspace: &Path, request: TaskRequest)
    -> TaskResult;

    /// Ask the executor to stop the session's running task.
    async fn cancel(&self, session_id: &str) -> bool;

    /// Remove the session's container.
    async fn cleanup(&self, session_id: &str) -> SandboxResult<bool>;

    /// Start (or reuse) the session's container and kick off the workspace
    /// bootstrap script when one exists.
    async fn create_workspace(
        &self,
        session_id: &str,
        workspace: &Path,
    ) -> SandboxResult<(ContainerInfo, Option<BootstrapHandle>)>;

    /// Running container of the session, without creating one.
    async fn container_info(&self, session_id: &str) -> SandboxResult<Option<ContainerInfo>>;
}

/// [`SandboxBackend`] over real sandbox containers.
pub struct ContainerExecutor {
    manager: Arc<ContainerManager>,
    proxy: StreamProxy,
    client: reqwest::Client,
}

impl ContainerExecutor {
    pub fn new(manager: Arc<ContainerManager>) -> SandboxResult<Self> {
        let config = manager.config();
        let stream_client = reqwest::Client::builder()
            .build()
            .map_err(|e| SandboxError::Config(format!("building stream client: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| SandboxError::Config(format!("building executor client: {e}")))?;

        Ok(Self {
            proxy: StreamProxy::new(stream_client, config.stream_timeout()),
            manager,
            client,
        })
    }

    pub fn manager(&self) -> &Arc<ContainerManager> {
        &self.manager
    }
}

#[async_trait]
impl SandboxBackend for ContainerExecutor {
    fn execute_stream(
        &self,
        session_id: &str,
        workspace: &Path,
        request: TaskRequest,
        cancel: CancellationToken,
    ) -> EventStream {
        let manager = self.manager.clone();
        let proxy = self.proxy.clone();
        let session_id = session_id.to_string();
        let workspace = workspace.to_path_buf();

        Box::pin(stream! {
            let ensured = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                res = manager.get_or_create(&session_id, &workspace) => Some(res),
            };
            let info = match ensured {
                Some(Ok(info)) => info,
                Some(Err(e)) => {
                    error!(%session_id, error = %e, "could not prepare sandbox");
                    yield StreamEvent::error(e.to_string());
                    return;
                }
                None => {
                    yield StreamEvent::interrupted();
                    return;
                }
            };

            yield StreamEvent::connected(json!({
                "container": info.name,
                "api_port": info.api_port,
                "code_port": info.code_port,
                "status": info.status,
            }));

            let url = format!("{}/execute/stream", info.api_url());
            let events = proxy.proxy_stream(url, request, cancel);
            for await event in events {
                yield event;
            }
        })
    }

    async fn execute(
        &self,
        session_id: &str,
        workspace: &Path,
        request: TaskRequest,
    ) -> TaskResult {
        let info = match self.manager.get_or_create(session_id, workspace).await {
            Ok(info) => info,
            Err(e) => return TaskResult::failed(e.to_string()),
        };

        let url = format!("{}/execute", info.api_url());
        let response = match self.client.post(&url).json(&request).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                warn!(%session_id, "execute timed out");
                return TaskResult::failed(format!(
                    "timed out after {}s",
                    self.manager.config().request_timeout_secs
                ));
            }
            Err(e) => return TaskResult::failed(format!("request failed: {e}")),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return TaskResult::failed(format!("executor returned {status}: {}", body.trim()));
        }

        match response.json::<TaskResult>().await {
            Ok(result) => result,
            Err(e) => TaskResult::failed(format!("invalid executor response: {e}")),
        }
    }

    async fn cancel(&self, session_id: &str) -> bool {
        let info = match self.manager.info(session_id).await {
            Ok(Some(info)) => info,
            Ok(None) => return false,
            Err(e) => {
                warn!(%session_id, error = %e, "cancel could not resolve container");
                return false;
            }
        };

        let url = format!("{}/cancel/{}", info.api_url(), session_id);
        match self.client.post(&url).send().await {
            Ok(res) if res.status().is_success() => {
                info!(%session_id, "cancel requested");
                true
            }
            Ok(res) => {
                warn!(%session_id, status = %res.status(), "cancel rejected by executor");
                false
            }
            Err(e) => {
                warn!(%session_id, error = %e, "cancel request failed");
                false
            }
        }
    }

    async fn cleanup(&self, session_id: &str) -> SandboxResult<bool> {
        self.manager.remove(session_id).await
    }

    async fn create_workspace(
        &self,
        session_id: &str,
        workspace: &Path,
    ) -> SandboxResult<(ContainerInfo, Option<BootstrapHandle>)> {
        let info = self.manager.get_or_create(session_id, workspace).await?;
        let config = self.manager.config();

        let script = workspace.join(&config.bootstrap_script);
        if !tokio::fs::try_exists(&script).await.unwrap_or(false) {
            debug!(%session_id, script = %script.display(), "no bootstrap script");
            return Ok((info, None));
        }

        let command = bootstrap_command(
            &config.workspace_mount,
            &config.bootstrap_script,
            &config.bootstrap_log,
        );
        let handle = spawn_bootstrap(self.manager.runtime().clone(), info.name.clone(), command);
        Ok((info, Some(handle)))
    }

    async fn container_info(&self, session_id: &str) -> SandboxResult<Option<ContainerInfo>> {
        self.manager.info(session_id).await
    }
}

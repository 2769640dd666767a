//! Spec -> code -> commit pipeline.
//!
//! Each module runs in its own sandbox session (the session id is the module
//! id) over the workspace `<workspace_root>/<module_id>`. Requests are
//! admitted or refused up front; once a stream is returned every outcome is
//! reported as events.

mod error;
mod git;

pub use error::{PipelineError, PipelineResult};
pub use git::{GitCli, GitCommitter};

use std::path::PathBuf;
use std::sync::Arc;

use async_stream::stream;
use kiln_protocol::events::kinds;
use kiln_protocol::{StreamEvent, TaskKind, TaskRequest};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::config::AppConfig;
use crate::db::Database;
use crate::executor::{EventStream, SandboxBackend};
use crate::module::{Module, ModuleRepository};
use crate::version::{Version, VersionRepository, VersionStatus};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Ceiling on active versions, `None` for unlimited.
    pub ceiling: Option<u32>,
    pub workspace_root: PathBuf,
    /// Host used in module preview URLs.
    pub preview_host: String,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        Ok(Self {
            ceiling: config.admission.ceiling(),
            workspace_root: config.workspace_root()?,
            preview_host: config.sandbox.preview_host.clone(),
        })
    }
}

/// What a relayed executor stream amounted to.
#[derive(Debug, Default)]
struct Relay {
    result: Option<String>,
    text: String,
    error: Option<String>,
    interrupted: bool,
}

impl Relay {
    fn observe(&mut self, event: &StreamEvent) {
        match event.event_type.as_str() {
            kinds::RESULT => self.result = Some(content_string(&event.content)),
            kinds::TEXT => self.text.push_str(&content_string(&event.content)),
            kinds::ERROR => self.error = Some(content_string(&event.content)),
            kinds::INTERRUPTED => self.interrupted = true,
            _ => {}
        }
    }

    /// The last `result`, else all `text` concatenated.
    fn spec_content(&self) -> Option<String> {
        self.result
            .clone()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| Some(self.text.clone()).filter(|s| !s.trim().is_empty()))
    }
}

fn content_string(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

const SPEC_INTERRUPTED: &str = "spec generation interrupted";
const BUILD_INTERRUPTED: &str = "build interrupted";

#[derive(Debug, Clone, Copy)]
enum Abandoned {
    Spec,
    Build,
}

/// Compensation for a pipeline stream dropped before it settled its
/// version. Spawned on drop unless [`AbandonGuard::disarm`] ran.
struct AbandonGuard {
    pipeline: Option<Pipeline>,
    version: Version,
    kind: Abandoned,
}

impl AbandonGuard {
    fn new(pipeline: &Pipeline, version: &Version, kind: Abandoned) -> Self {
        Self {
            pipeline: Some(pipeline.clone()),
            version: version.clone(),
            kind,
        }
    }

    fn disarm(&mut self) {
        self.pipeline = None;
    }
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        let Some(pipeline) = self.pipeline.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(version = %self.version.code, "stream dropped outside a runtime, version left as is");
            return;
        };
        let version = self.version.clone();
        info!(version = %version.code, kind = ?self.kind, "pipeline stream abandoned");
        match self.kind {
            Abandoned::Spec => runtime.spawn(async move {
                pipeline.note(&version.id, SPEC_INTERRUPTED).await;
            }),
            Abandoned::Build => runtime.spawn(async move {
                pipeline.roll_back_build(&version, BUILD_INTERRUPTED).await;
            }),
        };
    }
}

#[derive(Clone)]
pub struct Pipeline {
    executor: Arc<dyn SandboxBackend>,
    versions: VersionRepository,
    modules: ModuleRepository,
    committer: Arc<dyn GitCommitter>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        executor: Arc<dyn SandboxBackend>,
        db: &Database,
        committer: Arc<dyn GitCommitter>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            executor,
            versions: VersionRepository::new(db.pool().clone()),
            modules: ModuleRepository::new(db.pool().clone()),
            committer,
            settings,
        }
    }

    pub fn versions(&self) -> &VersionRepository {
        &self.versions
    }

    pub fn modules(&self) -> &ModuleRepository {
        &self.modules
    }

    pub fn workspace(&self, module_id: &str) -> PathBuf {
        self.settings.workspace_root.join(module_id)
    }

    async fn live_module(&self, module_id: &str) -> PipelineResult<Module> {
        match self.modules.get(module_id).await? {
            Some(module) if !module.deleted => Ok(module),
            _ => Err(PipelineError::ModuleNotFound(module_id.to_string())),
        }
    }

    /// Refuse when the active version count is at the ceiling.
    async fn admit(&self, excluding: Option<&str>) -> PipelineResult<()> {
        let Some(limit) = self.settings.ceiling else {
            return Ok(());
        };
        let active = self.versions.count_active(excluding).await?;
        if active >= i64::from(limit) {
            warn!(active, limit, "admission rejected");
            return Err(PipelineError::AdmissionRejected { active, limit });
        }
        Ok(())
    }

    /// Generate (or regenerate) the module's spec.
    #[instrument(skip(self, prompt, cancel))]
    pub async fn generate_spec(
        &self,
        module_id: &str,
        prompt: &str,
        cancel: CancellationToken,
    ) -> PipelineResult<EventStream> {
        let module = self.live_module(module_id).await?;

        if let Some(building) = self
            .versions
            .find_by_module_statuses(&module.id, &[VersionStatus::CodeBuilding])
            .await?
        {
            warn!(version = %building.code, "spec refused while a build is running");
            return Err(PipelineError::ModuleBusy {
                module: module.id,
                version: building.code,
            });
        }

        let reusable = self
            .versions
            .find_by_module_statuses(&module.id, &VersionStatus::REUSABLE)
            .await?;
        let (version, created) = match reusable {
            Some(version) => {
                info!(version = %version.code, status = %version.status, "reusing version");
                (version, false)
            }
            None => {
                self.admit(None).await?;
                let version = self.versions.create(&module.id).await?;
                info!(version = %version.code, "created version");
                (version, true)
            }
        };

        let this = self.clone();
        let workspace = self.workspace(&module.id);
        let module_id = module.id;
        let prompt = prompt.to_string();
        let mut guard = AbandonGuard::new(self, &version, Abandoned::Spec);

        Ok(Box::pin(stream! {
            let note = if created { None } else { Some("reusing existing version") };
            yield StreamEvent::status(&version.id, version.status.as_str(), note);

            let request = TaskRequest::new(&module_id, TaskKind::Spec, prompt);
            let events = this
                .executor
                .execute_stream(&module_id, &workspace, request, cancel.clone());

            let mut relay = Relay::default();
            for await event in events {
                relay.observe(&event);
                if event.is(kinds::CONNECTED) {
                    this.record_container(&module_id, &event).await;
                }
                yield event;
            }

            if relay.interrupted {
                this.note(&version.id, SPEC_INTERRUPTED).await;
                guard.disarm();
                return;
            }
            if let Some(message) = relay.error {
                this.fail_spec(&module_id, &version, created, &message).await;
                guard.disarm();
                return;
            }

            let Some(spec) = relay.spec_content() else {
                let message = "executor finished without producing a spec";
                this.fail_spec(&module_id, &version, created, message).await;
                guard.disarm();
                yield StreamEvent::error(message);
                return;
            };

            let stored = this.versions.complete_spec(&version.id, &spec).await;
            guard.disarm();
            match stored {
                Ok(true) => {
                    info!(version = %version.code, bytes = spec.len(), "spec generated");
                    yield StreamEvent::status(&version.id, VersionStatus::SpecGenerated.as_str(), None);
                }
                Ok(false) => {
                    warn!(version = %version.code, "version moved while its spec was generated");
                    yield StreamEvent::error(format!(
                        "version {} changed while its spec was generated",
                        version.code
                    ));
                }
                Err(e) => {
                    error!(version = %version.code, error = %e, "storing spec failed");
                    yield StreamEvent::error(format!("storing spec failed: {e:#}"));
                }
            }
        }))
    }

    /// Build a SPEC_GENERATED version and commit the result.
    #[instrument(skip(self, cancel))]
    pub async fn build_code(
        &self,
        version_id: &str,
        cancel: CancellationToken,
    ) -> PipelineResult<EventStream> {
        let version = self
            .versions
            .get(version_id)
            .await?
            .ok_or_else(|| PipelineError::VersionNotFound(version_id.to_string()))?;
        if version.status != VersionStatus::SpecGenerated {
            return Err(PipelineError::InvalidState {
                id: version.id,
                actual: version.status,
                expected: VersionStatus::SpecGenerated,
            });
        }
        let module = self.live_module(&version.module_id).await?;

        // The version already holds a slot, so it does not count against itself.
        self.admit(Some(&version.id)).await?;

        if !self
            .versions
            .transition(
                &version.id,
                VersionStatus::SpecGenerated,
                VersionStatus::CodeBuilding,
            )
            .await?
        {
            let actual = self
                .versions
                .get(&version.id)
                .await?
                .map(|v| v.status)
                .unwrap_or(VersionStatus::Deleted);
            return Err(PipelineError::InvalidState {
                id: version.id,
                actual,
                expected: VersionStatus::SpecGenerated,
            });
        }
        info!(version = %version.code, "build started");

        let this = self.clone();
        let workspace = self.workspace(&module.id);
        let module_id = module.id;
        let module_name = module.name;
        // Armed from here on: dropping the stream, polled or not, rolls back.
        let mut guard = AbandonGuard::new(self, &version, Abandoned::Build);

        Ok(Box::pin(stream! {
            yield StreamEvent::status(&version.id, VersionStatus::CodeBuilding.as_str(), None);

            let request = TaskRequest::new(
                &module_id,
                TaskKind::Build,
                format!("Implement {} of module {}", version.code, module_name),
            )
            .with_spec(version.spec_content.clone().unwrap_or_default());
            let events = this
                .executor
                .execute_stream(&module_id, &workspace, request, cancel.clone());

            let mut relay = Relay::default();
            for await event in events {
                relay.observe(&event);
                if event.is(kinds::CONNECTED) {
                    this.record_container(&module_id, &event).await;
                }
                yield event;
            }

            if relay.interrupted {
                this.roll_back_build(&version, BUILD_INTERRUPTED).await;
                guard.disarm();
                return;
            }
            if let Some(message) = relay.error {
                this.fail_build(&module_id, &version, &message).await;
                guard.disarm();
                return;
            }

            let commit_message = format!("kiln: {} of {}", version.code, module_name);
            let commit = match this.committer.commit_all(&workspace, &commit_message).await {
                Ok(sha) => sha,
                Err(e) => {
                    let message = format!("commit failed: {e:#}");
                    this.fail_build(&module_id, &version, &message).await;
                    guard.disarm();
                    yield StreamEvent::error(message);
                    return;
                }
            };

            let stored = this.versions.complete_build(&version.id, &commit).await;
            if stored.is_ok() {
                guard.disarm();
            }
            match stored {
                Ok(true) => {
                    info!(version = %version.code, %commit, "build completed");
                    this.teardown(&module_id).await;
                    yield StreamEvent::status(
                        &version.id,
                        VersionStatus::BuildCompleted.as_str(),
                        Some(&commit),
                    );
                }
                Ok(false) => {
                    warn!(version = %version.code, "version moved during build");
                    this.teardown(&module_id).await;
                    yield StreamEvent::error(format!("version {} changed during build", version.code));
                }
                Err(e) => {
                    let message = format!("storing build commit failed: {e:#}");
                    this.fail_build(&module_id, &version, &message).await;
                    guard.disarm();
                    yield StreamEvent::error(message);
                }
            }
        }))
    }

    /// Mark the module and all its versions deleted and drop its sandbox.
    /// Returns how many versions changed.
    #[instrument(skip(self))]
    pub async fn delete_module(&self, module_id: &str) -> PipelineResult<u64> {
        let module = self
            .modules
            .get(module_id)
            .await?
            .ok_or_else(|| PipelineError::ModuleNotFound(module_id.to_string()))?;

        let marked = self.versions.mark_deleted_for_module(&module.id).await?;
        if let Err(e) = self.executor.cleanup(&module.id).await {
            warn!(module = %module.id, error = %e, "removing module sandbox failed");
        }
        self.modules.mark_deleted(&module.id).await?;
        info!(module = %module.id, versions = marked, "module deleted");
        Ok(marked)
    }

    async fn record_container(&self, module_id: &str, connected: &StreamEvent) {
        let Some(meta) = connected.metadata.as_ref() else {
            return;
        };
        let container = meta.get("container").and_then(Value::as_str);
        let preview = meta
            .get("code_port")
            .and_then(Value::as_u64)
            .map(|port| format!("http://{}:{}", self.settings.preview_host, port));

        if let Err(e) = self
            .modules
            .set_container(module_id, container, preview.as_deref())
            .await
        {
            warn!(module = %module_id, error = %e, "recording module container failed");
        }
    }

    async fn note(&self, version_id: &str, message: &str) {
        if let Err(e) = self.versions.set_message(version_id, message).await {
            warn!(version = %version_id, error = %e, "setting version message failed");
        }
    }

    async fn teardown(&self, module_id: &str) {
        if let Err(e) = self.executor.cleanup(module_id).await {
            warn!(module = %module_id, error = %e, "removing sandbox failed");
        }
        if let Err(e) = self.modules.set_container(module_id, None, None).await {
            warn!(module = %module_id, error = %e, "clearing module container failed");
        }
    }

    /// A version created by the failed request is deleted; a reused one
    /// keeps its state and records the failure.
    async fn fail_spec(&self, module_id: &str, version: &Version, created: bool, message: &str) {
        warn!(version = %version.code, %message, "spec generation failed");
        if created {
            if let Err(e) = self.versions.delete(&version.id).await {
                warn!(version = %version.code, error = %e, "deleting failed version failed");
            }
        } else {
            self.note(&version.id, message).await;
        }
        self.teardown(module_id).await;
    }

    async fn roll_back_build(&self, version: &Version, message: &str) {
        match self
            .versions
            .roll_back(
                &version.id,
                VersionStatus::CodeBuilding,
                VersionStatus::SpecGenerated,
                message,
            )
            .await
        {
            Ok(true) => info!(version = %version.code, %message, "build rolled back"),
            Ok(false) => warn!(version = %version.code, "version moved before rollback"),
            Err(e) => warn!(version = %version.code, error = %e, "build rollback failed"),
        }
    }

    async fn fail_build(&self, module_id: &str, version: &Version, message: &str) {
        warn!(version = %version.code, %message, "build failed");
        self.roll_back_build(version, message).await;
        self.teardown(module_id).await;
    }
}

#[cfg(test)]
mod tests;

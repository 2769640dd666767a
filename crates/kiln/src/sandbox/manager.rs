//! Sandbox container lifecycle.
//!
//! One container per session, reused while it runs. The registry only caches
//! what the runtime reports; every decision re-reads runtime state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::models::{ContainerInfo, ContainerStatus, HealthStatus};
use super::ports::{OWNER_LABEL, PortAllocator, extract_host_ports};
use super::probe::HealthProbe;
use crate::config::SandboxConfig;
use crate::container::{
    ContainerConfig, ContainerError, ContainerFilter, ContainerRuntimeApi, ContainerSummary,
};
use crate::error::{SandboxError, SandboxResult};

/// Label key carrying the session id.
pub const SESSION_LABEL: &str = "kiln.session";

const NAME_SUFFIX_LEN: usize = 12;

/// Derive the container name for a session: the prefix plus the first twelve
/// alphanumeric characters of the lowercased id. Ids sharing those twelve
/// characters map to the same container.
pub fn container_name(prefix: &str, session_id: &str) -> SandboxResult<String> {
    let suffix: String = session_id
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(NAME_SUFFIX_LEN)
        .collect();
    if suffix.is_empty() {
        return Err(ContainerError::InvalidInput(format!(
            "session id {session_id:?} has no alphanumeric characters"
        ))
        .into());
    }
    Ok(format!("{prefix}{suffix}"))
}

pub struct ContainerManager {
    runtime: Arc<dyn ContainerRuntimeApi>,
    probe: Arc<dyn HealthProbe>,
    ports: PortAllocator,
    config: SandboxConfig,
    registry: DashMap<String, ContainerInfo>,
}

impl ContainerManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntimeApi>,
        probe: Arc<dyn HealthProbe>,
        config: SandboxConfig,
    ) -> Self {
        Self {
            ports: PortAllocator::new(runtime.clone(), config.owner.clone()),
            runtime,
            probe,
            config,
            registry: DashMap::new(),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntimeApi> {
        &self.runtime
    }

    pub fn container_name(&self, session_id: &str) -> SandboxResult<String> {
        container_name(&self.config.name_prefix, session_id)
    }

    /// Return the session's running container, creating it if needed.
    #[instrument(skip(self, workspace_path), fields(workspace = %workspace_path.display()))]
    pub async fn get_or_create(
        &self,
        session_id: &str,
        workspace_path: &Path,
    ) -> SandboxResult<ContainerInfo> {
        let name = self.container_name(session_id)?;

        let cached = self.registry.get(session_id).map(|entry| entry.clone());
        let existing = self.find_owned(&name).await?;

        if let Some(cached) = cached {
            if existing.as_ref().is_some_and(|c| c.state.is_running()) {
                debug!(container = %name, "reusing registered container");
                return Ok(cached);
            }
            self.registry.remove(session_id);
        }

        if let Some(summary) = existing {
            if summary.state.is_running() {
                if let Some(info) =
                    self.adopt(session_id, &summary, Some(workspace_path.to_path_buf()))
                {
                    info!(container = %name, api_port = info.api_port, "adopted running container");
                    self.registry.insert(session_id.to_string(), info.clone());
                    return Ok(info);
                }
                warn!(container = %name, ports = %summary.ports, "running container has unexpected ports, replacing");
            } else {
                info!(container = %name, state = %summary.state, "removing stale container");
            }
            self.runtime.remove_container(&summary.name, true).await?;
        }

        self.create(session_id, &name, workspace_path).await
    }

    async fn create(
        &self,
        session_id: &str,
        name: &str,
        workspace_path: &Path,
    ) -> SandboxResult<ContainerInfo> {
        tokio::fs::create_dir_all(workspace_path).await?;
        let workspace = tokio::fs::canonicalize(workspace_path).await?;

        let (api_port, code_port) = self
            .ports
            .allocate_pair(self.config.api_ports, self.config.code_ports)
            .await?;

        let config = self.run_config(session_id, name, &workspace, api_port, code_port);
        match self.runtime.run_container(&config).await {
            Ok(id) => debug!(container = %name, %id, "container started"),
            Err(ContainerError::NameConflict(_)) => {
                // Lost a race with a concurrent create for the same session.
                if let Some(summary) = self.find_owned(name).await?
                    && summary.state.is_running()
                    && let Some(info) = self.adopt(session_id, &summary, Some(workspace.clone()))
                {
                    self.registry.insert(session_id.to_string(), info.clone());
                    return Ok(info);
                }
                return Err(SandboxError::ContainerCreationFailed {
                    name: name.to_string(),
                    message: "name already in use".to_string(),
                });
            }
            Err(e) => {
                return Err(SandboxError::ContainerCreationFailed {
                    name: name.to_string(),
                    message: e.to_string(),
                });
            }
        }

        let mut info = ContainerInfo {
            name: name.to_string(),
            session_id: session_id.to_string(),
            api_port,
            code_port,
            workspace_path: Some(workspace),
            status: ContainerStatus::Created,
            created_at: Utc::now(),
        };

        info.status = match self.wait_healthy(&info).await {
            Ok(()) => ContainerStatus::Running,
            Err(e) => {
                warn!(container = %name, error = %e, "container started but not healthy yet");
                ContainerStatus::Starting
            }
        };
        info!(
            container = %name,
            api_port,
            code_port,
            status = %info.status,
            "sandbox container ready"
        );

        self.registry.insert(session_id.to_string(), info.clone());
        Ok(info)
    }

    fn run_config(
        &self,
        session_id: &str,
        name: &str,
        workspace: &Path,
        api_port: u16,
        code_port: u16,
    ) -> ContainerConfig {
        let cfg = &self.config;
        let mut config = ContainerConfig::new(&cfg.image)
            .name(name)
            .label(OWNER_LABEL, &cfg.owner)
            .label(SESSION_LABEL, session_id)
            .env("KILN_SESSION_ID", session_id)
            .env("KILN_API_PORT", cfg.internal_api_port.to_string())
            .env("KILN_CODE_PORT", cfg.internal_code_port.to_string())
            .port(api_port, cfg.internal_api_port)
            .port(code_port, cfg.internal_code_port)
            .volume(workspace.display().to_string(), &cfg.workspace_mount)
            .workdir(&cfg.workspace_mount);

        if let Some(ref memory) = cfg.memory {
            config = config.memory(memory);
        }
        if let Some(cpus) = cfg.cpus {
            config = config.cpus(cpus);
        }
        if let Some(ref network) = cfg.network {
            config = config.network(network);
        }
        config
    }

    /// Poll the health endpoint until it answers 200 or the timeout passes.
    async fn wait_healthy(&self, info: &ContainerInfo) -> SandboxResult<()> {
        let url = self.health_url(info);
        let timeout = self.config.health_timeout();
        let start = Instant::now();

        loop {
            let status = self.probe.probe(&url).await;
            if status.is_healthy() {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(SandboxError::ContainerUnhealthy {
                    name: info.name.clone(),
                    waited_ms: start.elapsed().as_millis() as u64,
                });
            }
            debug!(container = %info.name, %status, "waiting for health endpoint");
            tokio::time::sleep(self.config.health_interval()).await;
        }
    }

    fn health_url(&self, info: &ContainerInfo) -> String {
        format!("{}{}", info.api_url(), self.config.health_path)
    }

    /// Rebuild a ContainerInfo from a runtime listing. `None` if the published
    /// ports do not cover both configured ranges.
    fn adopt(
        &self,
        session_id: &str,
        summary: &ContainerSummary,
        workspace_path: Option<PathBuf>,
    ) -> Option<ContainerInfo> {
        let published = extract_host_ports(&summary.ports);
        let api_port = published
            .iter()
            .copied()
            .find(|p| self.config.api_ports.contains(*p))?;
        let code_port = published
            .iter()
            .copied()
            .find(|p| self.config.code_ports.contains(*p))?;

        Some(ContainerInfo {
            name: summary.name.clone(),
            session_id: session_id.to_string(),
            api_port,
            code_port,
            workspace_path,
            status: ContainerStatus::Running,
            created_at: Utc::now(),
        })
    }

    /// Owned container with exactly this name, in any state.
    async fn find_owned(&self, name: &str) -> SandboxResult<Option<ContainerSummary>> {
        let filter = ContainerFilter::default()
            .label(OWNER_LABEL, &self.config.owner)
            .name(name)
            .all();
        let mut containers = self.runtime.list_containers(&filter).await?;
        // Prefer a running one should the runtime report duplicates.
        containers.sort_by_key(|c| !c.state.is_running());
        Ok(containers.into_iter().next())
    }

    /// Force-remove the session's container. True only if one existed.
    #[instrument(skip(self))]
    pub async fn remove(&self, session_id: &str) -> SandboxResult<bool> {
        let name = self.container_name(session_id)?;
        self.registry.remove(session_id);

        let Some(summary) = self.find_owned(&name).await? else {
            debug!(container = %name, "no container to remove");
            return Ok(false);
        };
        self.runtime.remove_container(&summary.name, true).await?;
        info!(container = %name, "sandbox container removed");
        Ok(true)
    }

    /// Resolve the session's running container without creating one.
    pub async fn info(&self, session_id: &str) -> SandboxResult<Option<ContainerInfo>> {
        let name = self.container_name(session_id)?;
        let Some(summary) = self.find_owned(&name).await? else {
            self.registry.remove(session_id);
            return Ok(None);
        };
        if !summary.state.is_running() {
            self.registry.remove(session_id);
            return Ok(None);
        }
        if let Some(cached) = self.registry.get(session_id) {
            return Ok(Some(cached.clone()));
        }
        Ok(self.adopt(session_id, &summary, None))
    }

    /// One probe of the session's health endpoint.
    pub async fn health_check(&self, session_id: &str) -> SandboxResult<HealthStatus> {
        match self.info(session_id).await? {
            Some(info) => Ok(self.probe.probe(&self.health_url(&info)).await),
            None => Ok(HealthStatus::NotFound),
        }
    }

    /// Snapshot of registered containers.
    pub fn list(&self) -> Vec<ContainerInfo> {
        let mut infos: Vec<ContainerInfo> = self
            .registry
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        infos.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        infos
    }

    /// Every container carrying our owner label, from the runtime.
    pub async fn list_owned(&self) -> SandboxResult<Vec<ContainerSummary>> {
        let filter = ContainerFilter::default()
            .label(OWNER_LABEL, &self.config.owner)
            .all();
        Ok(self.runtime.list_containers(&filter).await?)
    }
}

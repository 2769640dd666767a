//! Container types and configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::error::{ContainerError, ContainerResult};

/// Port mapping configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port on the host.
    pub host_port: u16,
    /// Port in the container.
    pub container_port: u16,
}

impl PortMapping {
    pub fn new(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            container_port,
        }
    }
}

/// Configuration for creating a new container.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    /// Container name.
    pub name: Option<String>,
    /// Docker/OCI image to use.
    pub image: String,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Published port mappings.
    pub ports: Vec<PortMapping>,
    /// Volume mounts (host_path -> container_path).
    pub volumes: Vec<(String, String)>,
    /// Working directory inside the container.
    pub workdir: Option<String>,
    /// Labels for the container.
    pub labels: BTreeMap<String, String>,
    /// Network to attach to, runtime default when unset.
    pub network: Option<String>,
    /// Memory limit in runtime syntax, e.g. "2g".
    pub memory: Option<String>,
    /// CPU limit, fractional cores.
    pub cpus: Option<f64>,
}

impl ContainerConfig {
    /// Create a new container config with the given image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Validate all container configuration fields.
    ///
    /// Called before creating a container so nothing malformed reaches the
    /// runtime's argument list.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;

        if let Some(ref name) = self.name {
            validate_container_name(name)?;
        }

        for key in self.env.keys() {
            validate_env_var_key(key)?;
        }

        for key in self.labels.keys() {
            validate_label_key(key)?;
        }

        for (host_path, container_path) in &self.volumes {
            validate_volume_path(host_path, "host")?;
            validate_volume_path(container_path, "container")?;
        }

        if let Some(ref workdir) = self.workdir {
            validate_container_path(workdir)?;
        }

        if let Some(ref network) = self.network {
            validate_container_name(network)?;
        }

        if let Some(cpus) = self.cpus
            && !(cpus.is_finite() && cpus > 0.0)
        {
            return Err(ContainerError::InvalidInput(format!(
                "cpu limit must be positive, got {}",
                cpus
            )));
        }

        Ok(())
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn port(mut self, host_port: u16, container_port: u16) -> Self {
        self.ports.push(PortMapping::new(host_port, container_port));
        self
    }

    pub fn volume(
        mut self,
        host_path: impl Into<String>,
        container_path: impl Into<String>,
    ) -> Self {
        self.volumes.push((host_path.into(), container_path.into()));
        self
    }

    pub fn workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn memory(mut self, memory: impl Into<String>) -> Self {
        self.memory = Some(memory.into());
        self
    }

    pub fn cpus(mut self, cpus: f64) -> Self {
        self.cpus = Some(cpus);
        self
    }
}

/// Container state as reported by `ps`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    #[default]
    #[serde(other)]
    Unknown,
}

impl ContainerState {
    /// Parse the runtime's state word. Podman reports "stopped" where docker
    /// says "exited".
    pub fn parse(state: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "created" | "configured" | "initialized" => ContainerState::Created,
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "removing" => ContainerState::Removing,
            "exited" | "stopped" => ContainerState::Exited,
            "dead" => ContainerState::Dead,
            _ => ContainerState::Unknown,
        }
    }

    pub fn is_running(&self) -> bool {
        *self == ContainerState::Running
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let word = match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Restarting => "restarting",
            ContainerState::Removing => "removing",
            ContainerState::Exited => "exited",
            ContainerState::Dead => "dead",
            ContainerState::Unknown => "unknown",
        };
        f.write_str(word)
    }
}

/// One row of `ps` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
    /// Port mapping text exactly as the runtime prints it,
    /// e.g. `0.0.0.0:8101->8000/tcp, [::]:8101->8000/tcp`.
    pub ports: String,
}

/// Selects containers for `ps`.
#[derive(Debug, Clone, Default)]
pub struct ContainerFilter {
    /// `key=value` labels that must all be present.
    pub labels: Vec<(String, String)>,
    /// Exact container name.
    pub name: Option<String>,
    /// Include stopped containers.
    pub all: bool,
}

impl ContainerFilter {
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((key.into(), value.into()));
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn all(mut self) -> Self {
        self.all = true;
        self
    }

    /// Whether a summary satisfies the name constraint. The runtime's name
    /// filter is a substring match, so results are narrowed again locally.
    pub fn matches_name(&self, summary: &ContainerSummary) -> bool {
        match self.name {
            Some(ref name) => summary.name.trim_start_matches('/') == name,
            None => true,
        }
    }
}

// Argument validation. Everything in a ContainerConfig ends up on the
// runtime's command line, so values are checked before `run` is spawned.

fn invalid(message: impl Into<String>) -> ContainerError {
    ContainerError::InvalidInput(message.into())
}

/// `[registry/][namespace/]name[:tag][@digest]`, without `..`.
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() || image.len() > 256 {
        return Err(invalid(format!(
            "image name must be 1-256 characters, got {}",
            image.len()
        )));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || "._-/:@".contains(c);
    if let Some(bad) = image.chars().find(|c| !allowed(*c)) {
        return Err(invalid(format!("image name {image:?} contains {bad:?}")));
    }
    if image.contains("..") {
        return Err(invalid("image name cannot contain '..'"));
    }
    Ok(())
}

/// Container and network names: `[A-Za-z0-9_][A-Za-z0-9_-]*`, at most 128.
pub fn validate_container_name(name: &str) -> ContainerResult<()> {
    let Some(first) = name.chars().next() else {
        return Err(invalid("container name cannot be empty"));
    };
    if name.len() > 128 {
        return Err(invalid("container name exceeds 128 characters"));
    }
    if !(first.is_ascii_alphanumeric() || first == '_') {
        return Err(invalid(format!(
            "container name {name:?} must start with a letter, digit or '_'"
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(invalid(format!("container name {name:?} contains {bad:?}")));
    }
    Ok(())
}

fn validate_env_var_key(key: &str) -> ContainerResult<()> {
    let starts_ok = key
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !starts_ok || key.len() > 256 || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(invalid(format!("invalid environment variable name {key:?}")));
    }
    Ok(())
}

fn validate_label_key(key: &str) -> ContainerResult<()> {
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || "._-".contains(c)) {
        return Err(invalid(format!("invalid label key {key:?}")));
    }
    Ok(())
}

/// Shell metacharacters, quotes and `:` (which would split the bind spec).
const FORBIDDEN_IN_VOLUME: &str = "$`!&|;<>(){}[]*?\\\"'\n\r:\0";

fn validate_volume_path(path: &str, side: &str) -> ContainerResult<()> {
    if path.is_empty() || path.len() > 4096 {
        return Err(invalid(format!("{side} volume path must be 1-4096 characters")));
    }
    if let Some(bad) = path.chars().find(|c| FORBIDDEN_IN_VOLUME.contains(*c)) {
        return Err(invalid(format!("{side} volume path {path:?} contains {bad:?}")));
    }
    Ok(())
}

fn validate_container_path(path: &str) -> ContainerResult<()> {
    if !path.starts_with('/') || path.contains('\0') {
        return Err(invalid(format!("container path {path:?} must be absolute")));
    }
    Ok(())
}

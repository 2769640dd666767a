//! Container runtime management module.
//!
//! Provides an async interface to manage containers via the Docker or Podman
//! CLI. The runtime is auto-detected or can be configured explicitly.

mod container;
mod error;

pub use container::{
    ContainerConfig, ContainerFilter, ContainerState, ContainerSummary, PortMapping,
    validate_container_name, validate_image_name,
};
pub use error::{ContainerError, ContainerResult};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::debug;

/// `ps` row template. Both docker and podman render `.Ports` as
/// `host:port->port/proto` text.
const PS_FORMAT: &str = "{{.ID}}\t{{.Names}}\t{{.State}}\t{{.Ports}}";

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    #[default]
    Docker,
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }

    /// Whether this runtime requires SELinux volume labels (:Z suffix).
    pub fn needs_selinux_labels(&self) -> bool {
        match self {
            RuntimeType::Docker => false,
            RuntimeType::Podman => true,
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.default_binary())
    }
}

/// Container runtime abstraction for testability.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// Create and start a container, returning its id.
    async fn run_container(&self, config: &ContainerConfig) -> ContainerResult<String>;

    /// Remove a container by id or name.
    async fn remove_container(&self, id_or_name: &str, force: bool) -> ContainerResult<()>;

    /// List containers matching the filter.
    async fn list_containers(&self, filter: &ContainerFilter)
    -> ContainerResult<Vec<ContainerSummary>>;

    /// Execute a command in a container and return its stdout.
    async fn exec_output(&self, id_or_name: &str, command: &[&str]) -> ContainerResult<String>;

    /// Check if the runtime is available, returning its version string.
    async fn version(&self) -> ContainerResult<String>;
}

/// Container runtime client for managing containers through the CLI.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    runtime_type: RuntimeType,
    binary: String,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime {
    /// Create a runtime with auto-detection: docker if on PATH, else podman.
    pub fn new() -> Self {
        if Self::is_binary_available("docker") {
            Self::with_type(RuntimeType::Docker)
        } else if Self::is_binary_available("podman") {
            Self::with_type(RuntimeType::Podman)
        } else {
            // Fall back to docker, will fail at runtime
            Self::with_type(RuntimeType::Docker)
        }
    }

    /// Create a container runtime with a specific type.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
        }
    }

    /// Create a container runtime with a custom binary path.
    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
        }
    }

    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run the runtime binary and capture its output.
    async fn run(&self, command: &str, args: &[String]) -> ContainerResult<Output> {
        debug!(binary = %self.binary, ?args, "invoking container runtime");

        Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ContainerError::NoRuntimeAvailable,
                _ => ContainerError::CommandFailed {
                    command: command.to_string(),
                    message: e.to_string(),
                },
            })
    }

    /// Run and fail on a non-zero exit status.
    async fn run_checked(&self, command: &str, args: &[String]) -> ContainerResult<String> {
        let output = self.run(command, args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::CommandFailed {
                command: command.to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Build the `run -d` argument list for a validated config.
    pub fn run_args(&self, config: &ContainerConfig) -> Vec<String> {
        let mut args: Vec<String> = vec!["run".to_string(), "-d".to_string()];

        if let Some(ref name) = config.name {
            args.push("--name".to_string());
            args.push(name.clone());
        }

        if let Some(ref network) = config.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }

        if let Some(ref memory) = config.memory {
            args.push("--memory".to_string());
            args.push(memory.clone());
        }

        if let Some(cpus) = config.cpus {
            args.push("--cpus".to_string());
            args.push(cpus.to_string());
        }

        for (key, value) in &config.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        for port in &config.ports {
            args.push("-p".to_string());
            args.push(format!("{}:{}", port.host_port, port.container_port));
        }

        // Volume mounts - handle SELinux labels for Podman
        for (host, container) in &config.volumes {
            args.push("-v".to_string());
            if self.runtime_type.needs_selinux_labels() {
                args.push(format!("{}:{}:Z", host, container));
            } else {
                args.push(format!("{}:{}", host, container));
            }
        }

        for (key, value) in &config.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        if let Some(ref workdir) = config.workdir {
            args.push("-w".to_string());
            args.push(workdir.clone());
        }

        // The image's own entrypoint serves the executor API.
        args.push(config.image.clone());

        args
    }

    /// Build the `ps` argument list for a filter.
    pub fn ps_args(filter: &ContainerFilter) -> Vec<String> {
        let mut args = vec!["ps".to_string()];

        if filter.all {
            args.push("-a".to_string());
        }

        for (key, value) in &filter.labels {
            args.push("--filter".to_string());
            args.push(format!("label={}={}", key, value));
        }

        if let Some(ref name) = filter.name {
            args.push("--filter".to_string());
            args.push(format!("name={}", name));
        }

        args.push("--no-trunc".to_string());
        args.push("--format".to_string());
        args.push(PS_FORMAT.to_string());
        args
    }
}

/// Parse `ps` output rendered with [`PS_FORMAT`].
pub fn parse_ps_output(stdout: &str) -> ContainerResult<Vec<ContainerSummary>> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let mut fields = line.splitn(4, '\t');
            let (Some(id), Some(name), Some(state)) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(ContainerError::ParseError(format!(
                    "unexpected ps row: {:?}",
                    line
                )));
            };
            Ok(ContainerSummary {
                id: id.trim().to_string(),
                name: name.trim().trim_start_matches('/').to_string(),
                state: ContainerState::parse(state),
                ports: fields.next().unwrap_or_default().trim().to_string(),
            })
        })
        .collect()
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    /// The configuration is validated before the container is created.
    async fn run_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;

        let output = self.run("run", &self.run_args(config)).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::from_run_stderr(
                config.name.as_deref(),
                &stderr,
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn remove_container(&self, id_or_name: &str, force: bool) -> ContainerResult<()> {
        validate_container_name(id_or_name)?;

        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(id_or_name.to_string());

        self.run_checked("rm", &args).await.map(|_| ())
    }

    async fn list_containers(
        &self,
        filter: &ContainerFilter,
    ) -> ContainerResult<Vec<ContainerSummary>> {
        if let Some(ref name) = filter.name {
            validate_container_name(name)?;
        }

        let stdout = self.run_checked("ps", &Self::ps_args(filter)).await?;
        let mut containers = parse_ps_output(&stdout)?;
        containers.retain(|c| filter.matches_name(c));
        Ok(containers)
    }

    async fn exec_output(&self, id_or_name: &str, command: &[&str]) -> ContainerResult<String> {
        validate_container_name(id_or_name)?;

        let mut args = vec!["exec".to_string(), id_or_name.to_string()];
        args.extend(command.iter().map(|part| part.to_string()));

        self.run_checked("exec", &args).await
    }

    async fn version(&self) -> ContainerResult<String> {
        let args = vec![
            "version".to_string(),
            "--format".to_string(),
            "{{.Client.Version}}".to_string(),
        ];
        self.run_checked("version", &args)
            .await
            .map(|v| v.trim().to_string())
    }
}

//! Layered configuration: defaults, then the TOML file, then `KILN__*` env vars.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::container::{ContainerRuntime, RuntimeType};

pub const APP_NAME: &str = "kiln";
const ENV_PREFIX: &str = "KILN";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub runtime: RuntimeConfig,
    pub sandbox: SandboxConfig,
    pub admission: AdmissionConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    #[default]
    Auto,
    Docker,
    Podman,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// "docker", "podman" or "auto" (docker when on PATH).
    pub kind: RuntimeKind,
    /// Custom path to the runtime binary.
    pub binary: Option<String>,
}

impl RuntimeConfig {
    pub fn build(&self) -> ContainerRuntime {
        let runtime = match self.kind {
            RuntimeKind::Auto => ContainerRuntime::new(),
            RuntimeKind::Docker => ContainerRuntime::with_type(RuntimeType::Docker),
            RuntimeKind::Podman => ContainerRuntime::with_type(RuntimeType::Podman),
        };
        match self.binary {
            Some(ref binary) => ContainerRuntime::with_binary(runtime.runtime_type(), binary),
            None => runtime,
        }
    }
}

/// Inclusive host port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn overlaps(&self, other: &PortRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.start == 0 {
            bail!("{name} port range must not include port 0");
        }
        if self.start > self.end {
            bail!(
                "{name} port range is empty ({}-{})",
                self.start,
                self.end
            );
        }
        Ok(())
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Executor image.
    pub image: String,
    /// Container names are this prefix plus a session-derived suffix.
    pub name_prefix: String,
    /// Value of the `kiln.owner` label on every container this process starts.
    pub owner: String,
    pub api_ports: PortRange,
    pub code_ports: PortRange,
    /// Executor API port inside the container.
    pub internal_api_port: u16,
    /// Preview server port inside the container.
    pub internal_code_port: u16,
    /// Memory limit in runtime syntax.
    pub memory: Option<String>,
    pub cpus: Option<f64>,
    pub network: Option<String>,
    /// Where the workspace is mounted inside the container.
    pub workspace_mount: String,
    /// Host directory holding one workspace per module.
    pub workspace_root: Option<String>,
    pub health_path: String,
    /// Script run from the workspace root after the container is up.
    pub bootstrap_script: String,
    pub bootstrap_log: String,
    /// Total time to wait for a new container to become healthy.
    pub health_timeout_ms: u64,
    pub health_interval_ms: u64,
    /// Per-request timeout of a single health probe.
    pub probe_timeout_ms: u64,
    /// Timeout of a synchronous execute call.
    pub request_timeout_secs: u64,
    /// Longest wait for output on a streaming execution; restarts on each chunk.
    pub stream_timeout_secs: u64,
    /// Host printed in preview URLs.
    pub preview_host: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "kiln-executor:latest".to_string(),
            name_prefix: "kiln-sbx-".to_string(),
            owner: APP_NAME.to_string(),
            api_ports: PortRange::new(8100, 8199),
            code_ports: PortRange::new(9100, 9199),
            internal_api_port: 8000,
            internal_code_port: 3000,
            memory: Some("2g".to_string()),
            cpus: Some(2.0),
            network: None,
            workspace_mount: "/workspace".to_string(),
            workspace_root: None,
            health_path: "/health".to_string(),
            bootstrap_script: "bootstrap.sh".to_string(),
            bootstrap_log: "bootstrap.log".to_string(),
            health_timeout_ms: 30_000,
            health_interval_ms: 500,
            probe_timeout_ms: 2_000,
            request_timeout_secs: 300,
            stream_timeout_secs: 1_800,
            preview_host: "localhost".to_string(),
        }
    }
}

impl SandboxConfig {
    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        self.api_ports.validate("api")?;
        self.code_ports.validate("code")?;
        if self.api_ports.overlaps(&self.code_ports) {
            bail!(
                "api port range {} overlaps code port range {}",
                self.api_ports,
                self.code_ports
            );
        }
        if self.internal_api_port == self.internal_code_port {
            bail!("internal api and code ports must differ");
        }
        if self.health_interval_ms == 0 {
            bail!("health interval must be positive");
        }
        if self.probe_timeout() >= self.stream_timeout() {
            bail!("probe timeout must be shorter than the stream timeout");
        }
        if self.health_timeout() >= self.stream_timeout() {
            bail!("health timeout must be shorter than the stream timeout");
        }
        if !self.workspace_mount.starts_with('/') {
            bail!("workspace mount must be an absolute container path");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Ceiling on Versions in an active state. Zero or less disables the check.
    pub max_active_versions: i64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_active_versions: 4,
        }
    }
}

impl AdmissionConfig {
    pub fn ceiling(&self) -> Option<u32> {
        u32::try_from(self.max_active_versions)
            .ok()
            .filter(|ceiling| *ceiling > 0)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file; `<data dir>/kiln.db` when unset.
    pub path: Option<String>,
}

impl AppConfig {
    /// Load the layered config, writing a default file first if none exists.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if !path.exists() {
            write_default_config(path)?;
        }
        Self::load(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let built = Config::builder()
            .set_default("logging.level", "info")?
            .add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("loading config from {}", path.display()))?;

        let config: AppConfig = built
            .try_deserialize()
            .context("deserializing configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.sandbox.validate().context("invalid [sandbox] section")
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        match self.database.path {
            Some(ref path) => expand_str_path(path),
            None => Ok(default_data_dir()?.join("kiln.db")),
        }
    }

    pub fn workspace_root(&self) -> Result<PathBuf> {
        match self.sandbox.workspace_root {
            Some(ref path) => expand_str_path(path),
            None => Ok(default_data_dir()?.join("workspaces")),
        }
    }
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = format!("# Configuration for {}\n# File: {}\n\n", APP_NAME, path.display());
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

/// Config file location: an explicit override (file or directory) or the
/// XDG default.
pub fn config_file_path(override_path: Option<&Path>) -> Result<PathBuf> {
    match override_path {
        Some(path) => {
            let expanded = match path.to_str() {
                Some(text) => expand_str_path(text)?,
                None => path.to_path_buf(),
            };
            if expanded.is_dir() {
                Ok(expanded.join("config.toml"))
            } else {
                Ok(expanded)
            }
        }
        None => Ok(default_config_dir()?.join("config.toml")),
    }
}

pub fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::data_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

//! Host port allocation.
//!
//! A port is free when no running container carrying our owner label
//! publishes it. Nothing is reserved between selection and `run`, so two
//! concurrent allocations can pick the same port; the runtime rejects the
//! second bind.

use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::debug;

use crate::config::PortRange;
use crate::container::{ContainerFilter, ContainerRuntimeApi};
use crate::error::{SandboxError, SandboxResult};

/// Label key identifying containers started by this process.
pub const OWNER_LABEL: &str = "kiln.owner";

// Matches the host side of `0.0.0.0:8101->8000/tcp`, `[::]:8101->8000/tcp`
// and `:::8101->8000/tcp`, plus published ranges like `:8100-8102->`.
static HOST_PORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":(\d{1,5})(?:-(\d{1,5}))?->").expect("valid host port regex"));

/// Extract published host ports from the runtime's port-mapping text.
pub fn extract_host_ports(text: &str) -> BTreeSet<u16> {
    let mut ports = BTreeSet::new();
    for caps in HOST_PORT_RE.captures_iter(text) {
        let Some(start) = caps.get(1).and_then(|m| m.as_str().parse::<u16>().ok()) else {
            continue;
        };
        let end = caps
            .get(2)
            .and_then(|m| m.as_str().parse::<u16>().ok())
            .unwrap_or(start);
        ports.extend(start..=end.max(start));
    }
    ports
}

/// Picks free host ports from configured ranges.
#[derive(Clone)]
pub struct PortAllocator {
    runtime: Arc<dyn ContainerRuntimeApi>,
    owner: String,
}

impl PortAllocator {
    pub fn new(runtime: Arc<dyn ContainerRuntimeApi>, owner: impl Into<String>) -> Self {
        Self {
            runtime,
            owner: owner.into(),
        }
    }

    /// Host ports published by running owned containers, read fresh each call.
    pub async fn used_ports(&self) -> SandboxResult<BTreeSet<u16>> {
        let filter = ContainerFilter::default().label(OWNER_LABEL, &self.owner);
        let containers = self.runtime.list_containers(&filter).await?;

        let used = containers
            .iter()
            .filter(|c| c.state.is_running())
            .flat_map(|c| extract_host_ports(&c.ports))
            .collect::<BTreeSet<_>>();
        debug!(count = used.len(), "published host ports in use");
        Ok(used)
    }

    /// First port of `range`, ascending, absent from `used`.
    pub fn first_free(
        service: &'static str,
        range: PortRange,
        used: &BTreeSet<u16>,
    ) -> SandboxResult<u16> {
        range
            .iter()
            .find(|port| !used.contains(port))
            .ok_or(SandboxError::ResourceExhausted {
                service,
                start: range.start,
                end: range.end,
            })
    }

    /// Allocate one port from `range`.
    pub async fn allocate(&self, service: &'static str, range: PortRange) -> SandboxResult<u16> {
        let used = self.used_ports().await?;
        Self::first_free(service, range, &used)
    }

    /// Allocate the API port, then the code port skipping the API port.
    pub async fn allocate_pair(
        &self,
        api_range: PortRange,
        code_range: PortRange,
    ) -> SandboxResult<(u16, u16)> {
        let mut used = self.used_ports().await?;
        let api_port = Self::first_free("api", api_range, &used)?;
        used.insert(api_port);
        let code_port = Self::first_free("code", code_range, &used)?;
        Ok((api_port, code_port))
    }
}

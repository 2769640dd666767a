//! Per-session sandbox containers: naming, ports, health and lifecycle.

mod manager;
mod models;
mod ports;
mod probe;

#[cfg(test)]
pub(crate) mod testing;

pub use manager::{ContainerManager, SESSION_LABEL, container_name};
pub use models::{ContainerInfo, ContainerStatus, HealthStatus};
pub use ports::{OWNER_LABEL, PortAllocator, extract_host_ports};
pub use probe::{HealthProbe, HttpHealthProbe};

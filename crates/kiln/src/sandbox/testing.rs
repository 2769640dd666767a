//! In-memory runtime and probe fakes shared by unit tests.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::models::HealthStatus;
use super::ports::OWNER_LABEL;
use super::probe::HealthProbe;
use crate::container::{
    ContainerConfig, ContainerError, ContainerFilter, ContainerResult, ContainerRuntimeApi,
    ContainerState, ContainerSummary,
};

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub state: ContainerState,
    /// (host, container) pairs.
    pub ports: Vec<(u16, u16)>,
    pub env: BTreeMap<String, String>,
}

impl FakeContainer {
    fn ports_text(&self) -> String {
        self.ports
            .iter()
            .map(|(host, container)| {
                format!("0.0.0.0:{host}->{container}/tcp, [::]:{host}->{container}/tcp")
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Behaves like a runtime that enforces unique names.
#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<Vec<FakeContainer>>,
    execs: Mutex<Vec<(String, Vec<String>)>>,
    next_id: AtomicUsize,
    runs: AtomicUsize,
    fail_runs: AtomicBool,
    fail_execs: AtomicBool,
    exec_delay: Mutex<Option<Duration>>,
}

impl FakeRuntime {
    fn insert(&self, name: &str, owner: &str, api: u16, code: u16, state: ContainerState) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.containers.lock().unwrap().push(FakeContainer {
            id: format!("fake-{id}"),
            name: name.to_string(),
            labels: BTreeMap::from([(OWNER_LABEL.to_string(), owner.to_string())]),
            state,
            ports: vec![(api, 8000), (code, 3000)],
            env: BTreeMap::new(),
        });
    }

    pub fn insert_running(&self, name: &str, owner: &str, api: u16, code: u16) {
        self.insert(name, owner, api, code, ContainerState::Running);
    }

    pub fn insert_exited(&self, name: &str, owner: &str, api: u16, code: u16) {
        self.insert(name, owner, api, code, ContainerState::Exited);
    }

    pub fn set_state(&self, name: &str, state: ContainerState) {
        for c in self.containers.lock().unwrap().iter_mut() {
            if c.name == name {
                c.state = state;
            }
        }
    }

    pub fn fail_runs(&self, fail: bool) {
        self.fail_runs.store(fail, Ordering::SeqCst);
    }

    pub fn fail_execs(&self, fail: bool) {
        self.fail_execs.store(fail, Ordering::SeqCst);
    }

    /// Make every `exec` take `delay` before answering.
    pub fn slow_execs(&self, delay: Duration) {
        *self.exec_delay.lock().unwrap() = Some(delay);
    }

    pub fn containers(&self) -> Vec<FakeContainer> {
        self.containers.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.containers().into_iter().map(|c| c.name).collect()
    }

    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn execs(&self) -> Vec<(String, Vec<String>)> {
        self.execs.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerRuntimeApi for FakeRuntime {
    async fn run_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.fail_runs.load(Ordering::SeqCst) {
            return Err(ContainerError::CommandFailed {
                command: "run".to_string(),
                message: "image not found".to_string(),
            });
        }

        let name = config.name.clone().unwrap_or_default();
        let mut containers = self.containers.lock().unwrap();
        if containers.iter().any(|c| c.name == name) {
            return Err(ContainerError::NameConflict(name));
        }
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        containers.push(FakeContainer {
            id: id.clone(),
            name,
            labels: config.labels.clone(),
            state: ContainerState::Running,
            ports: config
                .ports
                .iter()
                .map(|p| (p.host_port, p.container_port))
                .collect(),
            env: config.env.clone(),
        });
        Ok(id)
    }

    async fn remove_container(&self, id_or_name: &str, _force: bool) -> ContainerResult<()> {
        let mut containers = self.containers.lock().unwrap();
        let before = containers.len();
        containers.retain(|c| c.id != id_or_name && c.name != id_or_name);
        if containers.len() == before {
            return Err(ContainerError::CommandFailed {
                command: "rm".to_string(),
                message: format!("no such container: {id_or_name}"),
            });
        }
        Ok(())
    }

    async fn list_containers(
        &self,
        filter: &ContainerFilter,
    ) -> ContainerResult<Vec<ContainerSummary>> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .filter(|c| filter.all || c.state.is_running())
            .filter(|c| {
                filter
                    .labels
                    .iter()
                    .all(|(k, v)| c.labels.get(k).is_some_and(|value| value == v))
            })
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                name: c.name.clone(),
                state: c.state,
                ports: if c.state.is_running() {
                    c.ports_text()
                } else {
                    String::new()
                },
            })
            .filter(|s| filter.matches_name(s))
            .collect())
    }

    async fn exec_output(&self, id_or_name: &str, command: &[&str]) -> ContainerResult<String> {
        self.execs.lock().unwrap().push((
            id_or_name.to_string(),
            command.iter().map(|s| s.to_string()).collect(),
        ));
        let delay = *self.exec_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_execs.load(Ordering::SeqCst) {
            return Err(ContainerError::CommandFailed {
                command: "exec".to_string(),
                message: "exit status 127".to_string(),
            });
        }
        Ok(String::new())
    }

    async fn version(&self) -> ContainerResult<String> {
        Ok("fake-1.0".to_string())
    }
}

/// Probe with a switchable answer.
pub struct FakeProbe {
    healthy: AtomicBool,
    calls: AtomicUsize,
}

impl FakeProbe {
    pub fn healthy() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn unhealthy() -> Self {
        Self {
            healthy: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for FakeProbe {
    async fn probe(&self, _url: &str) -> HealthStatus {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy { code: 503 }
        }
    }
}

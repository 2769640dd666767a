//! Supervised workspace bootstrap.
//!
//! Runs the workspace's bootstrap script inside the sandbox after the
//! container is up. The task is owned through a [`BootstrapHandle`]; failures
//! are logged and reported through the handle, never raised to the caller
//! that started it.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::container::ContainerRuntimeApi;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

/// Completion signal and cancellation handle of a bootstrap run.
#[derive(Debug)]
pub struct BootstrapHandle {
    task: JoinHandle<BootstrapOutcome>,
    cancel: CancellationToken,
}

impl BootstrapHandle {
    /// Stop waiting on the script. The `exec` client is dropped; a script
    /// already running inside the container is not killed.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> BootstrapOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => BootstrapOutcome::Failed(format!("bootstrap task panicked: {e}")),
        }
    }
}

/// Shell line executed inside the container.
pub fn bootstrap_command(mount: &str, script: &str, log: &str) -> String {
    format!(
        "cd {mount} && chmod +x {script} && ./{script} > {log} 2>&1",
        mount = shell_quote(mount),
        script = shell_quote(script),
        log = shell_quote(log),
    )
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

pub fn spawn_bootstrap(
    runtime: Arc<dyn ContainerRuntimeApi>,
    container: String,
    command: String,
) -> BootstrapHandle {
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    let task = tokio::spawn(async move {
        info!(%container, "running workspace bootstrap");
        let argv = ["sh", "-c", command.as_str()];
        let exec = runtime.exec_output(&container, &argv);
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!(%container, "workspace bootstrap cancelled");
                BootstrapOutcome::Cancelled
            }
            res = exec => match res {
                Ok(_) => {
                    info!(%container, "workspace bootstrap finished");
                    BootstrapOutcome::Completed
                }
                Err(e) => {
                    warn!(%container, error = %e, "workspace bootstrap failed");
                    BootstrapOutcome::Failed(e.to_string())
                }
            },
        }
    });

    BootstrapHandle { task, cancel }
}

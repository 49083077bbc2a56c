//! Bounded polling for eventually-consistent task state.
//!
//! Right after a service is created or updated, the cluster may not yet
//! report a running task for it. These helpers poll a fixed number of
//! times with a fixed delay instead of waiting indefinitely.

use std::time::Duration;

use keel_core::config::DockerConfig;
use tracing::debug;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::orchestrator::Orchestrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DockerConfig) -> Self {
        Self {
            retries: config.retry_count,
            delay: config.retry_delay(),
        }
    }

    /// No waiting at all; useful in tests.
    pub fn immediate(retries: u32) -> Self {
        Self {
            retries,
            delay: Duration::ZERO,
        }
    }
}

/// Node id of the (single) running task of `service`.
pub async fn node_id_for_service(
    orchestrator: &dyn Orchestrator,
    service: &str,
    policy: RetryPolicy,
) -> OrchestratorResult<String> {
    for attempt in 0..=policy.retries {
        let tasks = orchestrator.list_running_tasks(service).await?;
        if let Some(task) = tasks.into_iter().next() {
            return Ok(task.node_id);
        }
        if attempt < policy.retries {
            debug!(%service, retry = attempt, "retrying to get node id");
            tokio::time::sleep(policy.delay).await;
        }
    }
    Err(OrchestratorError::NotFound(format!(
        "There must be only one instance of the service running to find node id. {service}"
    )))
}

/// Container id of the single running task of `service`.
pub async fn container_id_for_service(
    orchestrator: &dyn Orchestrator,
    service: &str,
    policy: RetryPolicy,
) -> OrchestratorResult<String> {
    for attempt in 0..=policy.retries {
        let tasks = orchestrator.list_running_tasks(service).await?;
        if tasks.len() >= 2 {
            return Err(OrchestratorError::Other(format!(
                "There must be only one instance (not {}) of the service running. {service}",
                tasks.len()
            )));
        }
        if let Some(id) = tasks.into_iter().next().and_then(|t| t.container_id) {
            return Ok(id);
        }
        if attempt < policy.retries {
            debug!(%service, retry = attempt, "retrying to get container id");
            tokio::time::sleep(policy.delay).await;
        }
    }
    Err(OrchestratorError::NotFound(format!(
        "No containerId is found for {service}"
    )))
}

/// Send `HUP` to the single container of `service`.
pub async fn send_single_container_hup(
    orchestrator: &dyn Orchestrator,
    service: &str,
    policy: RetryPolicy,
) -> OrchestratorResult<()> {
    let container = container_id_for_service(orchestrator, service, policy).await?;
    debug!(%service, %container, "kill HUP container");
    orchestrator.kill_container(&container, "HUP").await
}

//! The orchestrator contract and the request/response types it speaks.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use keel_core::registry::{RegistryAuth, RegistryCredential};
use keel_core::{EnvVar, PortMapping};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::error::OrchestratorResult;

/// Raw output chunks of a build, push or pull, in arrival order.
/// The channel closes when the operation's output ends.
pub type ProgressStream = mpsc::Receiver<OrchestratorResult<String>>;

/// Live service spec plus its optimistic-concurrency version.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceInspect {
    pub version: u64,
    pub spec: Value,
}

/// A running task of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub node_id: String,
    pub container_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub hostname: String,
    pub role: String,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: String,
    pub repo_tags: Vec<String>,
    /// Unix epoch seconds.
    pub created: i64,
}

/// A host path bind-mounted into a created service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub host_path: String,
    pub container_path: String,
}

/// Parameters for creating a service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceCreate {
    pub name: String,
    pub image: String,
    pub ports: Vec<PortMapping>,
    pub node_id: Option<String>,
    pub mounts: Vec<BindMount>,
    pub env: Vec<EnvVar>,
    /// `max-size` for the json-file log driver.
    pub log_max_size: Option<String>,
}

impl ServiceCreate {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    /// Engine API service spec for this request.
    pub fn to_spec(&self) -> Value {
        let constraints: Vec<String> = self
            .node_id
            .iter()
            .map(|id| format!("node.id == {id}"))
            .collect();
        let mut container_spec = json!({ "Image": self.image });
        if !self.mounts.is_empty() {
            container_spec["Mounts"] = self
                .mounts
                .iter()
                .map(|m| bind_mount_spec(&m.host_path, &m.container_path))
                .collect();
        }
        if !self.env.is_empty() {
            container_spec["Env"] = env_spec(&self.env);
        }
        let mut task_template = json!({
            "ContainerSpec": container_spec,
            "Placement": { "Constraints": constraints },
        });
        if let Some(max_size) = &self.log_max_size {
            task_template["LogDriver"] = json!({
                "Name": "json-file",
                "Options": { "max-size": max_size },
            });
        }
        json!({
            "Name": self.name,
            "TaskTemplate": task_template,
            "EndpointSpec": { "Ports": endpoint_ports(&self.ports) },
        })
    }
}

/// Published-port entries. An unpinned port publishes both tcp and udp.
pub fn endpoint_ports(ports: &[PortMapping]) -> Vec<Value> {
    let mut out = Vec::new();
    for p in ports {
        let protocols: Vec<&str> = match p.protocol.as_deref() {
            Some(proto) => vec![proto],
            None => vec!["tcp", "udp"],
        };
        for proto in protocols {
            let mut item = json!({
                "Protocol": proto,
                "TargetPort": p.container_port,
                "PublishedPort": p.host_port,
            });
            if let Some(mode) = &p.publish_mode {
                item["PublishMode"] = json!(mode);
            }
            out.push(item);
        }
    }
    out
}

pub fn env_spec(env: &[EnvVar]) -> Value {
    env.iter()
        .map(|e| Value::String(format!("{}={}", e.key, e.value)))
        .collect()
}

pub fn bind_mount_spec(host_path: &str, container_path: &str) -> Value {
    json!({
        "Source": host_path,
        "Target": container_path,
        "Type": "bind",
        "ReadOnly": false,
        "Consistency": "default",
    })
}

/// Options for an image build.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildOptions {
    /// Repository the built image is tagged as.
    pub tag: String,
    pub build_args: BTreeMap<String, String>,
    /// Credentials for base-image pulls, keyed by registry address.
    pub registry_config: BTreeMap<String, RegistryCredential>,
}

/// The container cluster, as seen by keel.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    // ── Services ───────────────────────────────────────────────────

    async fn is_service_running(&self, name: &str) -> OrchestratorResult<bool>;

    async fn inspect_service(&self, name: &str) -> OrchestratorResult<ServiceInspect>;

    async fn create_service(&self, create: &ServiceCreate) -> OrchestratorResult<()>;

    /// Submit a full spec. `version` must match the live version or the
    /// call fails with [`OrchestratorError::Conflict`](crate::OrchestratorError::Conflict).
    async fn update_service(
        &self,
        name: &str,
        version: u64,
        spec: &Value,
        auth: &RegistryAuth,
    ) -> OrchestratorResult<()>;

    async fn remove_service(&self, name: &str) -> OrchestratorResult<()>;

    // ── Tasks and containers ───────────────────────────────────────

    async fn list_running_tasks(&self, service: &str) -> OrchestratorResult<Vec<TaskInfo>>;

    async fn prune_containers(&self) -> OrchestratorResult<()>;

    async fn kill_container(&self, container_id: &str, signal: &str) -> OrchestratorResult<()>;

    // ── Images ─────────────────────────────────────────────────────

    async fn build_image(
        &self,
        context_tar: &Path,
        options: &BuildOptions,
    ) -> OrchestratorResult<ProgressStream>;

    async fn tag_image(&self, source: &str, repo: &str, tag: &str) -> OrchestratorResult<()>;

    async fn push_image(&self, image: &str, auth: &RegistryAuth)
        -> OrchestratorResult<ProgressStream>;

    async fn pull_image(
        &self,
        image: &str,
        auth: Option<&RegistryAuth>,
    ) -> OrchestratorResult<ProgressStream>;

    async fn list_images(&self) -> OrchestratorResult<Vec<ImageInfo>>;

    async fn remove_image(&self, id: &str) -> OrchestratorResult<()>;

    // ── Cluster ────────────────────────────────────────────────────

    async fn list_nodes(&self) -> OrchestratorResult<Vec<NodeInfo>>;

    async fn remove_volume(&self, name: &str) -> OrchestratorResult<()>;

    async fn check_registry_auth(&self, auth: &RegistryAuth) -> OrchestratorResult<()>;
}

/// Split `repo:tag`, treating a colon inside the registry host as part of the repo.
pub fn split_repo_tag(image: &str) -> (&str, &str) {
    match image.rfind(':') {
        Some(idx) if !image[idx + 1..].contains('/') => (&image[..idx], &image[idx + 1..]),
        _ => (image, "latest"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unpinned_ports_publish_tcp_and_udp() {
        let ports = vec![
            PortMapping {
                host_port: 8080,
                container_port: 80,
                protocol: None,
                publish_mode: Some("host".into()),
            },
            PortMapping {
                host_port: 53,
                container_port: 53,
                protocol: Some("udp".into()),
                publish_mode: None,
            },
        ];
        let out = endpoint_ports(&ports);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0]["Protocol"], "tcp");
        assert_eq!(out[1]["Protocol"], "udp");
        assert_eq!(out[1]["PublishMode"], "host");
        assert_eq!(out[2]["Protocol"], "udp");
        assert!(out[2].get("PublishMode").is_none());
    }

    #[test]
    fn test_create_spec_shape() {
        let mut create = ServiceCreate::new("srv-keel--api", "keel/placeholder-app:latest");
        create.node_id = Some("node-1".into());
        create.log_max_size = Some("512m".into());
        create.env = vec![EnvVar::new("A", "1")];
        let spec = create.to_spec();
        assert_eq!(spec["Name"], "srv-keel--api");
        assert_eq!(
            spec["TaskTemplate"]["Placement"]["Constraints"][0],
            "node.id == node-1"
        );
        assert_eq!(spec["TaskTemplate"]["LogDriver"]["Name"], "json-file");
        assert_eq!(spec["TaskTemplate"]["ContainerSpec"]["Env"][0], "A=1");
        assert!(spec["TaskTemplate"]["ContainerSpec"].get("Mounts").is_none());
    }

    #[test]
    fn test_split_repo_tag() {
        assert_eq!(split_repo_tag("nginx:1"), ("nginx", "1"));
        assert_eq!(split_repo_tag("nginx"), ("nginx", "latest"));
        assert_eq!(
            split_repo_tag("reg.io:5000/team/api:3"),
            ("reg.io:5000/team/api", "3")
        );
        assert_eq!(
            split_repo_tag("reg.io:5000/team/api"),
            ("reg.io:5000/team/api", "latest")
        );
    }
}

//! Merge-patch of a live service spec.
//!
//! Only the fields set on a [`ServicePatch`] are touched; everything else in
//! the spec read from the orchestrator is submitted back unchanged.

use keel_core::names::volume_name;
use keel_core::{EnvVar, PortMapping, UpdateOrder, VolumeMount};
use keel_docker::{bind_mount_spec, endpoint_ports, env_spec};
use serde_json::{json, Map, Value};

use crate::error::{ServiceError, ServiceResult};

/// Label stamped with a fresh value on every update so the orchestrator
/// never skips an update it considers unchanged.
pub const FORCE_UPDATE_LABEL: &str = "keelForceUpdate";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    pub secret_name: String,
    pub secret_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServicePatch {
    pub image: Option<String>,
    /// Pins the service to one node, replacing any earlier node constraint.
    pub node_id: Option<String>,
    pub env: Option<Vec<EnvVar>>,
    pub ports: Option<Vec<PortMapping>>,
    pub mounts: Option<Vec<VolumeMount>>,
    /// Network ids or names; replaces the current list.
    pub networks: Option<Vec<String>>,
    /// Upserted by secret id.
    pub secrets: Option<Vec<SecretRef>>,
    /// Ignored for global-mode services.
    pub replicas: Option<u32>,
    pub update_order: Option<UpdateOrder>,
}

/// Index into `value[key]`, creating an empty object there if needed.
fn object_at<'a>(value: &'a mut Value, key: &str) -> &'a mut Value {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    let slot = &mut value[key];
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    slot
}

fn mount_spec(mount: &VolumeMount, namespace: &str) -> ServiceResult<Value> {
    if let Some(host_path) = &mount.host_path {
        Ok(bind_mount_spec(host_path, &mount.container_path))
    } else if let Some(name) = &mount.volume_name {
        Ok(json!({
            "Source": volume_name(namespace, name),
            "Target": mount.container_path,
            "Type": "volume",
            "ReadOnly": false,
        }))
    } else {
        Err(ServiceError::IllegalParameter(format!(
            "Unknown volume type for {}: neither a host path nor a volume name",
            mount.container_path
        )))
    }
}

fn secret_spec(secret: &SecretRef) -> Value {
    json!({
        "File": { "Name": secret.secret_name, "UID": "0", "GID": "0", "Mode": 0o444 },
        "SecretID": secret.secret_id,
        "SecretName": secret.secret_name,
    })
}

/// `stop-first` when the service mounts anything, `start-first` otherwise.
pub fn resolve_update_order(order: UpdateOrder, container_spec: &Value) -> &'static str {
    match order {
        UpdateOrder::StopFirst => "stop-first",
        UpdateOrder::StartFirst => "start-first",
        UpdateOrder::Auto => {
            let has_mounts = container_spec["Mounts"]
                .as_array()
                .is_some_and(|m| !m.is_empty());
            if has_mounts { "stop-first" } else { "start-first" }
        }
    }
}

impl ServicePatch {
    /// Apply this patch to `spec` in place and stamp the force-update label.
    pub fn apply(&self, spec: &mut Value, namespace: &str) -> ServiceResult<()> {
        let task = object_at(spec, "TaskTemplate");

        if let Some(node_id) = &self.node_id {
            let placement = object_at(task, "Placement");
            let mut constraints: Vec<Value> = placement["Constraints"]
                .as_array()
                .map(|c| {
                    c.iter()
                        .filter(|c| !c.as_str().is_some_and(|s| s.contains("node.id")))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            constraints.push(json!(format!("node.id == {node_id}")));
            placement["Constraints"] = Value::Array(constraints);
        }

        if let Some(networks) = &self.networks {
            task["Networks"] = networks.iter().map(|n| json!({ "Target": n })).collect();
        }

        let container = object_at(task, "ContainerSpec");
        if let Some(image) = &self.image {
            container["Image"] = json!(image);
        }
        if let Some(env) = &self.env {
            container["Env"] = env_spec(env);
        }
        if let Some(mounts) = &self.mounts {
            container["Mounts"] = mounts
                .iter()
                .map(|m| mount_spec(m, namespace))
                .collect::<ServiceResult<Vec<_>>>()?
                .into();
        }
        if let Some(secrets) = &self.secrets {
            let mut current = container["Secrets"].as_array().cloned().unwrap_or_default();
            for secret in secrets {
                let entry = secret_spec(secret);
                match current
                    .iter_mut()
                    .find(|s| s["SecretID"].as_str() == Some(secret.secret_id.as_str()))
                {
                    Some(existing) => *existing = entry,
                    None => current.push(entry),
                }
            }
            container["Secrets"] = Value::Array(current);
        }
        let labels = object_at(container, "Labels");
        labels[FORCE_UPDATE_LABEL] = json!(uuid::Uuid::new_v4().to_string());

        let order = self
            .update_order
            .map(|o| resolve_update_order(o, &spec["TaskTemplate"]["ContainerSpec"]));

        if let Some(ports) = &self.ports {
            object_at(spec, "EndpointSpec")["Ports"] = endpoint_ports(ports).into();
        }
        if let Some(order) = order {
            object_at(spec, "UpdateConfig")["Order"] = json!(order);
        }
        if let Some(replicas) = self.replicas {
            if let Some(replicated) = spec
                .get_mut("Mode")
                .and_then(|m| m.get_mut("Replicated"))
                .and_then(Value::as_object_mut)
            {
                replicated.insert("Replicas".to_string(), json!(replicas));
            }
        }
        Ok(())
    }
}

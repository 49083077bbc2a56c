//! In-memory orchestrator for tests and dry runs.
//!
//! Services carry a version that is bumped on every update and checked on
//! every submit, like the real cluster. Every image, container and volume
//! operation is recorded so tests can assert on what was asked of the
//! cluster, and build, push and pull output can be scripted.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use keel_core::registry::RegistryAuth;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Semaphore};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::orchestrator::*;

const DEFAULT_NODE: &str = "node-1";

/// A build submitted to the fake.
#[derive(Debug, Clone)]
pub struct BuildRecord {
    pub options: BuildOptions,
    /// Raw bytes of the build context archive.
    pub context: Vec<u8>,
}

/// A service update submitted to the fake.
#[derive(Debug, Clone)]
pub struct UpdateRecord {
    pub name: String,
    pub version: u64,
    pub spec: Value,
    pub auth: RegistryAuth,
}

#[derive(Debug)]
struct MemService {
    version: u64,
    spec: Value,
    tasks: Vec<TaskInfo>,
}

#[derive(Default)]
struct MemState {
    services: HashMap<String, MemService>,
    nodes: Vec<NodeInfo>,
    images: Vec<ImageInfo>,

    builds: Vec<BuildRecord>,
    updates: Vec<UpdateRecord>,
    tags: Vec<(String, String, String)>,
    pushes: Vec<String>,
    pulls: Vec<String>,
    kills: Vec<(String, String)>,
    prunes: usize,
    task_list_calls: usize,
    removed_services: Vec<String>,
    removed_images: Vec<String>,
    removed_volumes: Vec<String>,

    build_output: Option<Vec<String>>,
    build_error: Option<String>,
    push_error: Option<String>,
    pull_error: Option<String>,
    reject_auth: bool,
    prune_conflict: bool,
    failing_volumes: HashSet<String>,
    build_gate: Option<Arc<Semaphore>>,
}

#[derive(Clone)]
pub struct MemoryOrchestrator {
    state: Arc<Mutex<MemState>>,
}

impl Default for MemoryOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryOrchestrator {
    /// A single-node cluster with no services.
    pub fn new() -> Self {
        let state = MemState {
            nodes: vec![NodeInfo {
                id: DEFAULT_NODE.to_string(),
                hostname: "keel-node-1".to_string(),
                role: "manager".to_string(),
                state: "ready".to_string(),
            }],
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Scripting ──────────────────────────────────────────────────

    /// Raw chunks every subsequent build emits.
    pub fn set_build_output(&self, chunks: Vec<String>) {
        self.state().build_output = Some(chunks);
    }

    /// Make every subsequent build emit an error entry.
    pub fn fail_builds_with(&self, message: &str) {
        self.state().build_error = Some(message.to_string());
    }

    pub fn fail_pushes_with(&self, message: &str) {
        self.state().push_error = Some(message.to_string());
    }

    pub fn fail_pulls_with(&self, message: &str) {
        self.state().pull_error = Some(message.to_string());
    }

    pub fn reject_registry_auth(&self, reject: bool) {
        self.state().reject_auth = reject;
    }

    /// Make prunes fail as if another prune were running.
    pub fn conflict_on_prune(&self, conflict: bool) {
        self.state().prune_conflict = conflict;
    }

    pub fn fail_volume_removal(&self, name: &str) {
        self.state().failing_volumes.insert(name.to_string());
    }

    pub fn add_node(&self, node: NodeInfo) {
        self.state().nodes.push(node);
    }

    pub fn add_image(&self, image: ImageInfo) {
        self.state().images.push(image);
    }

    pub fn set_running_tasks(&self, service: &str, tasks: Vec<TaskInfo>) {
        if let Some(svc) = self.state().services.get_mut(service) {
            svc.tasks = tasks;
        }
    }

    /// Block builds until [`release_build`](Self::release_build) is called
    /// once per build.
    pub fn hold_builds(&self) {
        self.state().build_gate = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_build(&self) {
        if let Some(gate) = &self.state().build_gate {
            gate.add_permits(1);
        }
    }

    // ── Recorded calls ─────────────────────────────────────────────

    pub fn builds(&self) -> Vec<BuildRecord> {
        self.state().builds.clone()
    }

    pub fn updates(&self) -> Vec<UpdateRecord> {
        self.state().updates.clone()
    }

    /// `(source, repo, tag)` triples.
    pub fn tags(&self) -> Vec<(String, String, String)> {
        self.state().tags.clone()
    }

    pub fn pushes(&self) -> Vec<String> {
        self.state().pushes.clone()
    }

    pub fn pulls(&self) -> Vec<String> {
        self.state().pulls.clone()
    }

    /// `(container, signal)` pairs.
    pub fn kills(&self) -> Vec<(String, String)> {
        self.state().kills.clone()
    }

    pub fn prune_count(&self) -> usize {
        self.state().prunes
    }

    pub fn task_list_calls(&self) -> usize {
        self.state().task_list_calls
    }

    pub fn removed_services(&self) -> Vec<String> {
        self.state().removed_services.clone()
    }

    pub fn removed_images(&self) -> Vec<String> {
        self.state().removed_images.clone()
    }

    pub fn removed_volumes(&self) -> Vec<String> {
        self.state().removed_volumes.clone()
    }

    pub fn service_spec(&self, name: &str) -> Option<Value> {
        self.state().services.get(name).map(|s| s.spec.clone())
    }

    pub fn service_version(&self, name: &str) -> Option<u64> {
        self.state().services.get(name).map(|s| s.version)
    }

    fn stream_of(chunks: Vec<String>) -> ProgressStream {
        let (tx, rx) = mpsc::channel(chunks.len().max(1));
        for chunk in chunks {
            // Capacity covers every chunk, so this cannot fail.
            let _ = tx.try_send(Ok(chunk));
        }
        rx
    }

    fn error_chunk(message: &str) -> String {
        json!({ "error": message, "errorDetail": { "message": message } }).to_string()
    }
}

fn node_from_constraints(spec: &Value) -> Option<String> {
    spec["TaskTemplate"]["Placement"]["Constraints"]
        .as_array()?
        .iter()
        .filter_map(Value::as_str)
        .find_map(|c| c.strip_prefix("node.id == ").map(str::to_string))
}

#[async_trait]
impl Orchestrator for MemoryOrchestrator {
    async fn is_service_running(&self, name: &str) -> OrchestratorResult<bool> {
        Ok(self.state().services.contains_key(name))
    }

    async fn inspect_service(&self, name: &str) -> OrchestratorResult<ServiceInspect> {
        let state = self.state();
        let svc = state
            .services
            .get(name)
            .ok_or_else(|| OrchestratorError::NotFound(format!("service {name}")))?;
        Ok(ServiceInspect {
            version: svc.version,
            spec: svc.spec.clone(),
        })
    }

    async fn create_service(&self, create: &ServiceCreate) -> OrchestratorResult<()> {
        let mut state = self.state();
        if state.services.contains_key(&create.name) {
            return Err(OrchestratorError::Conflict(format!(
                "service {} already exists",
                create.name
            )));
        }
        let mut spec = create.to_spec();
        spec["Mode"] = json!({ "Replicated": { "Replicas": 1 } });
        let node_id = create
            .node_id
            .clone()
            .unwrap_or_else(|| DEFAULT_NODE.to_string());
        let task = TaskInfo {
            node_id,
            container_id: Some(format!("container-{}", create.name)),
        };
        state.services.insert(
            create.name.clone(),
            MemService {
                version: 1,
                spec,
                tasks: vec![task],
            },
        );
        Ok(())
    }

    async fn update_service(
        &self,
        name: &str,
        version: u64,
        spec: &Value,
        auth: &RegistryAuth,
    ) -> OrchestratorResult<()> {
        let mut state = self.state();
        let svc = state
            .services
            .get_mut(name)
            .ok_or_else(|| OrchestratorError::NotFound(format!("service {name}")))?;
        if svc.version != version {
            return Err(OrchestratorError::Conflict(format!(
                "update out of sequence: service {name} is at version {}, got {version}",
                svc.version
            )));
        }
        svc.version += 1;
        svc.spec = spec.clone();
        if let Some(node) = node_from_constraints(spec) {
            for task in &mut svc.tasks {
                task.node_id = node.clone();
            }
        }
        state.updates.push(UpdateRecord {
            name: name.to_string(),
            version,
            spec: spec.clone(),
            auth: auth.clone(),
        });
        Ok(())
    }

    async fn remove_service(&self, name: &str) -> OrchestratorResult<()> {
        let mut state = self.state();
        if state.services.remove(name).is_none() {
            return Err(OrchestratorError::NotFound(format!("service {name}")));
        }
        state.removed_services.push(name.to_string());
        Ok(())
    }

    async fn list_running_tasks(&self, service: &str) -> OrchestratorResult<Vec<TaskInfo>> {
        let mut state = self.state();
        state.task_list_calls += 1;
        Ok(state
            .services
            .get(service)
            .map(|s| s.tasks.clone())
            .unwrap_or_default())
    }

    async fn prune_containers(&self) -> OrchestratorResult<()> {
        let mut state = self.state();
        state.prunes += 1;
        if state.prune_conflict {
            return Err(OrchestratorError::Conflict(
                "a prune operation is already running".to_string(),
            ));
        }
        Ok(())
    }

    async fn kill_container(&self, container_id: &str, signal: &str) -> OrchestratorResult<()> {
        self.state()
            .kills
            .push((container_id.to_string(), signal.to_string()));
        Ok(())
    }

    async fn build_image(
        &self,
        context_tar: &Path,
        options: &BuildOptions,
    ) -> OrchestratorResult<ProgressStream> {
        let context = tokio::fs::read(context_tar)
            .await
            .map_err(|e| OrchestratorError::Request(format!("reading build context: {e}")))?;

        let gate = self.state().build_gate.clone();
        if let Some(gate) = gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|e| OrchestratorError::Other(e.to_string()))?;
            permit.forget();
        }

        let mut state = self.state();
        state.builds.push(BuildRecord {
            options: options.clone(),
            context,
        });
        let mut chunks = state.build_output.clone().unwrap_or_else(|| {
            vec![json!({ "stream": "Successfully built keel-fake\n" }).to_string()]
        });
        match &state.build_error {
            Some(message) => chunks.push(Self::error_chunk(message)),
            None => {
                let id = format!("sha256:{}", state.images.len() + 1);
                state.images.push(ImageInfo {
                    id,
                    repo_tags: vec![format!("{}:latest", options.tag)],
                    created: keel_core::epoch_secs() as i64,
                });
            }
        }
        Ok(Self::stream_of(chunks))
    }

    async fn tag_image(&self, source: &str, repo: &str, tag: &str) -> OrchestratorResult<()> {
        let mut state = self.state();
        let source_ref = if source.contains(':') {
            source.to_string()
        } else {
            format!("{source}:latest")
        };
        let new_tag = format!("{repo}:{tag}");
        match state
            .images
            .iter_mut()
            .find(|img| img.repo_tags.contains(&source_ref))
        {
            Some(img) => img.repo_tags.push(new_tag),
            None => {
                return Err(OrchestratorError::NotFound(format!(
                    "No such image: {source_ref}"
                )));
            }
        }
        state
            .tags
            .push((source.to_string(), repo.to_string(), tag.to_string()));
        Ok(())
    }

    async fn push_image(
        &self,
        image: &str,
        _auth: &RegistryAuth,
    ) -> OrchestratorResult<ProgressStream> {
        let mut state = self.state();
        state.pushes.push(image.to_string());
        let mut chunks = vec![json!({ "status": format!("Pushing {image}") }).to_string()];
        if let Some(message) = &state.push_error {
            chunks.push(Self::error_chunk(message));
        }
        Ok(Self::stream_of(chunks))
    }

    async fn pull_image(
        &self,
        image: &str,
        _auth: Option<&RegistryAuth>,
    ) -> OrchestratorResult<ProgressStream> {
        let mut state = self.state();
        state.pulls.push(image.to_string());
        let mut chunks = vec![json!({ "stream": format!("Pulling {image}\n") }).to_string()];
        if let Some(message) = &state.pull_error {
            chunks.push(Self::error_chunk(message));
        }
        Ok(Self::stream_of(chunks))
    }

    async fn list_images(&self) -> OrchestratorResult<Vec<ImageInfo>> {
        Ok(self.state().images.clone())
    }

    async fn remove_image(&self, id: &str) -> OrchestratorResult<()> {
        let mut state = self.state();
        let before = state.images.len();
        state.images.retain(|img| img.id != id);
        if state.images.len() == before {
            return Err(OrchestratorError::NotFound(format!("No such image: {id}")));
        }
        state.removed_images.push(id.to_string());
        Ok(())
    }

    async fn list_nodes(&self) -> OrchestratorResult<Vec<NodeInfo>> {
        Ok(self.state().nodes.clone())
    }

    async fn remove_volume(&self, name: &str) -> OrchestratorResult<()> {
        let mut state = self.state();
        if state.failing_volumes.contains(name) {
            return Err(OrchestratorError::Conflict(format!("volume {name} is in use")));
        }
        state.removed_volumes.push(name.to_string());
        Ok(())
    }

    async fn check_registry_auth(&self, auth: &RegistryAuth) -> OrchestratorResult<()> {
        if self.state().reject_auth {
            return Err(OrchestratorError::Api {
                status: 401,
                message: format!("login to {} failed", auth.serveraddress),
            });
        }
        Ok(())
    }
}

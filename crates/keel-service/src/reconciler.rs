//! ServiceReconciler: converge an app's orchestrator service to its record.
//!
//! Services are created with a placeholder image first and receive their
//! real image, networks and mounts in a separate update; creating them with
//! networks attached tends to race with the first update.
//!
//! Every update reads the live spec and its version, patches only the
//! requested fields and submits with that version. A stale version is a
//! [`ServiceError::VersionConflict`]; it is never retried here.

use std::sync::Arc;
use std::time::Duration;

use keel_core::registry::{self, RegistryAuth};
use keel_core::{AppDefinition, KeelConfig};
use keel_docker::retry::{self, RetryPolicy};
use keel_docker::{Orchestrator, OrchestratorError, ServiceCreate};
use keel_proxy::LoadBalancerReconciler;
use keel_state::{AppsDataStore, RegistriesDataStore};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{ServiceError, ServiceResult};
use crate::hooks::{HookRegistry, PreDeployHook};
use crate::overrides::{deep_merge, parse_override};
use crate::patch::ServicePatch;

/// A patched spec ready to submit, bound to the version it was read at.
#[derive(Debug, Clone)]
pub struct DraftUpdate {
    pub service: String,
    pub version: u64,
    pub spec: Value,
    pub auth: RegistryAuth,
}

#[derive(Clone)]
pub struct ServiceReconciler {
    orchestrator: Arc<dyn Orchestrator>,
    apps: AppsDataStore,
    registries: RegistriesDataStore,
    load_balancer: LoadBalancerReconciler,
    hooks: HookRegistry,
    namespace: String,
    placeholder_image: String,
    log_max_size: String,
    prune_delay: Duration,
    dns_settle: Duration,
    retry: RetryPolicy,
}

impl ServiceReconciler {
    pub fn new(
        config: &KeelConfig,
        orchestrator: Arc<dyn Orchestrator>,
        apps: AppsDataStore,
        load_balancer: LoadBalancerReconciler,
        hooks: HookRegistry,
    ) -> Self {
        Self {
            registries: RegistriesDataStore::new(apps.store().clone()),
            orchestrator,
            apps,
            load_balancer,
            hooks,
            namespace: config.namespace.clone(),
            placeholder_image: config.build.placeholder_image.clone(),
            log_max_size: config.build.service_log_max_size.clone(),
            prune_delay: config.docker.prune_delay(),
            dns_settle: config.docker.dns_settle(),
            retry: RetryPolicy::from_config(&config.docker),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn load_balancer(&self) -> &LoadBalancerReconciler {
        &self.load_balancer
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// Read `service` and apply `patch`, without submitting.
    pub async fn prepare_update(
        &self,
        service: &str,
        patch: &ServicePatch,
        auth: Option<RegistryAuth>,
    ) -> ServiceResult<DraftUpdate> {
        let live = self.orchestrator.inspect_service(service).await?;
        let mut spec = live.spec;
        patch.apply(&mut spec, &self.namespace)?;
        Ok(DraftUpdate {
            service: service.to_string(),
            version: live.version,
            spec,
            // An explicit empty block; submitting none breaks switching
            // from a private-registry image to a public one.
            auth: auth.unwrap_or_default(),
        })
    }

    /// Submit `draft` with the version it was read at, then schedule a
    /// container prune.
    pub async fn submit(&self, draft: &DraftUpdate) -> ServiceResult<()> {
        self.orchestrator
            .update_service(&draft.service, draft.version, &draft.spec, &draft.auth)
            .await?;
        info!(service = %draft.service, version = draft.version, "service updated");
        self.schedule_prune();
        Ok(())
    }

    /// Patch and submit in one go. Returns the submitted spec.
    pub async fn update_service(
        &self,
        service: &str,
        patch: &ServicePatch,
        auth: Option<RegistryAuth>,
    ) -> ServiceResult<Value> {
        let draft = self.prepare_update(service, patch, auth).await?;
        self.submit(&draft).await?;
        Ok(draft.spec)
    }

    fn schedule_prune(&self) {
        let orchestrator = self.orchestrator.clone();
        let delay = self.prune_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debug!("pruning containers");
            match orchestrator.prune_containers().await {
                Ok(()) => {}
                Err(OrchestratorError::Conflict(e)) => {
                    debug!(error = %e, "skipping prune, one is already running");
                }
                Err(e) => warn!(error = %e, "container prune failed"),
            }
        });
    }

    /// Make sure the app's service exists and runs its deployed image with
    /// the current definition, then refresh the load balancer.
    pub async fn ensure_service_inited_and_updated(&self, app_name: &str) -> ServiceResult<()> {
        debug!(app = %app_name, "ensure service inited and updated");
        let app = self.apps.get_app(app_name)?;
        let service = self.apps.service_name(app_name);

        let image = app.deployed_image().map(str::to_string).ok_or_else(|| {
            ServiceError::IllegalParameter(
                "ImageName for deployed version is not available, this version was probably failed due to an unsuccessful build!"
                    .to_string(),
            )
        })?;

        if self.orchestrator.is_service_running(&service).await? {
            debug!(%service, "service is already running");
        } else {
            info!(%service, "creating service with placeholder image, real image follows");
            let create = ServiceCreate {
                log_max_size: Some(self.log_max_size.clone()),
                ..ServiceCreate::new(&service, &self.placeholder_image)
            };
            self.orchestrator.create_service(&create).await?;
        }

        let auth = registry::auth_for_image(&self.registries.get_all()?, &image);
        let hook = self.hooks.for_app(&app)?;
        let overrides = match app.service_update_override.as_deref() {
            Some(raw) => parse_override(raw)?,
            None => None,
        };

        let patch = ServicePatch {
            image: Some(image.clone()),
            node_id: app.node_id.clone(),
            env: Some(app.env_vars.clone()),
            ports: Some(app.ports.clone()),
            mounts: Some(app.volumes.clone()),
            networks: Some(app.networks.clone()),
            secrets: None,
            replicas: Some(app.instance_count),
            update_order: Some(app.update_order),
        };
        info!(%service, %image, "updating service");
        let mut draft = self.prepare_update(&service, &patch, auth).await?;
        if let Some(overrides) = &overrides {
            deep_merge(&mut draft.spec, overrides);
        }
        if let Some(hook) = hook {
            draft.spec = run_hook(hook.as_ref(), &app, draft.spec).await?;
        }
        self.submit(&draft).await?;

        // Let the orchestrator's DNS pick up the service name.
        tokio::time::sleep(self.dns_settle).await;
        self.load_balancer.re_populate_config(true).await?;
        Ok(())
    }

    /// Node a persistent app must be pinned to, validated against the cluster.
    ///
    /// A requested node must be part of the cluster. Without one, the stored
    /// node is kept, or discovered from the running task. Non-persistent apps
    /// cannot mount volumes.
    pub async fn resolve_node_id(
        &self,
        app: &AppDefinition,
        requested: Option<&str>,
        has_volumes: bool,
    ) -> ServiceResult<Option<String>> {
        let requested = requested.filter(|n| !n.is_empty());
        if !app.has_persistent_data && has_volumes {
            return Err(ServiceError::IllegalOperation(
                "Cannot set volumes for a non-persistent container!".to_string(),
            ));
        }
        if let Some(node) = requested {
            self.ensure_node_exists(node).await?;
            return Ok(Some(node.to_string()));
        }
        if !app.has_persistent_data {
            return Ok(None);
        }
        if let Some(node) = &app.node_id {
            return Ok(Some(node.clone()));
        }

        let service = self.apps.service_name(&app.name);
        if !self.orchestrator.is_service_running(&service).await? {
            return Err(ServiceError::Generic(
                "Cannot find the service. Try again in a minute...".to_string(),
            ));
        }
        let node = retry::node_id_for_service(self.orchestrator.as_ref(), &service, self.retry)
            .await
            .map_err(|e| {
                debug!(%service, error = %e, "no node found for service");
                ServiceError::Generic("No NodeId was found. Try again in a minute...".to_string())
            })?;
        Ok(Some(node))
    }

    async fn ensure_node_exists(&self, node_id: &str) -> ServiceResult<()> {
        let nodes = self.orchestrator.list_nodes().await?;
        if nodes.iter().any(|n| n.id == node_id) {
            Ok(())
        } else {
            Err(ServiceError::Generic(format!(
                "Node ID you requested is not part of the swarm cluster: {node_id}"
            )))
        }
    }

    /// Remove the app's service if it exists.
    pub async fn remove_service_if_exists(&self, app_name: &str) -> ServiceResult<()> {
        let service = self.apps.service_name(app_name);
        if self.orchestrator.is_service_running(&service).await? {
            info!(%service, "removing service");
            self.orchestrator.remove_service(&service).await?;
        }
        Ok(())
    }
}

async fn run_hook(hook: &dyn PreDeployHook, app: &AppDefinition, spec: Value) -> ServiceResult<Value> {
    debug!(app = %app.name, "running pre-deploy hook");
    hook.apply(app, spec).await
}

//! Subsystem wiring shared by every subcommand.

use std::sync::Arc;

use anyhow::Context;
use keel_build::{BuildLogsManager, ImageBuilder, RegistryHelper};
use keel_core::KeelConfig;
use keel_docker::Orchestrator;
use keel_proxy::{LoadBalancerReconciler, ProxyBootstrap};
use keel_scheduler::{AppManager, BuildScheduler, CertificateAuthority, DeployPipeline};
use keel_service::{HookRegistry, ServiceReconciler};
use keel_state::{AppsDataStore, RegistriesDataStore, StateStore};
use tracing::{info, warn};

pub struct Daemon {
    config: KeelConfig,
    orchestrator: Arc<dyn Orchestrator>,
    manager: AppManager,
}

impl Daemon {
    pub fn assemble(
        config: KeelConfig,
        store: StateStore,
        orchestrator: Arc<dyn Orchestrator>,
        certs: Arc<dyn CertificateAuthority>,
    ) -> Self {
        let apps = AppsDataStore::new(store.clone(), &config);
        let lb = LoadBalancerReconciler::new(&config, apps.clone(), orchestrator.clone());
        let services = ServiceReconciler::new(
            &config,
            orchestrator.clone(),
            apps.clone(),
            lb,
            HookRegistry::new(),
        );
        let logs = BuildLogsManager::new(config.build.log_size);
        let registry = RegistryHelper::new(RegistriesDataStore::new(store), orchestrator.clone());
        let builder = ImageBuilder::new(&config, orchestrator.clone(), registry, logs.clone());
        let pipeline = DeployPipeline::new(apps.clone(), builder, services.clone());
        let scheduler = BuildScheduler::new(Arc::new(pipeline), logs);
        let manager = AppManager::new(
            apps,
            orchestrator.clone(),
            scheduler,
            services,
            certs,
            &config.build.placeholder_image,
        );
        Self {
            config,
            orchestrator,
            manager,
        }
    }

    pub fn manager(&self) -> &AppManager {
        &self.manager
    }

    /// `requested`, or the first manager node the engine reports.
    pub async fn resolve_node_id(&self, requested: Option<String>) -> anyhow::Result<String> {
        if let Some(id) = requested {
            return Ok(id);
        }
        let nodes = self.orchestrator.list_nodes().await?;
        nodes
            .iter()
            .find(|n| n.role == "manager")
            .or_else(|| nodes.first())
            .map(|n| n.id.clone())
            .context("the swarm reports no nodes")
    }

    pub async fn bootstrap_proxy(&self, node_id: &str) -> anyhow::Result<()> {
        ProxyBootstrap::new(&self.config, self.orchestrator.as_ref())
            .run(self.manager.services().load_balancer(), node_id)
            .await?;
        Ok(())
    }

    /// Bring every app with a deployed image in line with its record.
    /// Returns the number of apps that converged.
    pub async fn converge_apps(&self) -> anyhow::Result<usize> {
        let mut converged = 0;
        for app in self.manager.apps().get_apps()? {
            if app.deployed_image().is_none() {
                continue;
            }
            match self
                .manager
                .services()
                .ensure_service_inited_and_updated(&app.name)
                .await
            {
                Ok(()) => converged += 1,
                Err(e) => warn!(app = %app.name, error = %e, "failed to converge service"),
            }
        }
        info!(converged, "app services converged");
        Ok(converged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::PreIssuedCertificates;
    use keel_docker::{MemoryOrchestrator, ServiceCreate};

    fn daemon(root: &std::path::Path, orch: &MemoryOrchestrator) -> Daemon {
        let mut config = KeelConfig::default();
        config.paths.root = root.to_path_buf();
        config.docker.prune_delay_ms = 0;
        config.docker.dns_settle_ms = 0;
        config.docker.retry_count = 0;
        Daemon::assemble(
            config,
            StateStore::open_in_memory().unwrap(),
            Arc::new(orch.clone()),
            Arc::new(PreIssuedCertificates::new(root.join("letsencrypt"))),
        )
    }

    #[tokio::test]
    async fn test_node_id_defaults_to_first_node() {
        let root = tempfile::tempdir().unwrap();
        let orch = MemoryOrchestrator::new();
        let d = daemon(root.path(), &orch);
        assert_eq!(d.resolve_node_id(None).await.unwrap(), "node-1");
        assert_eq!(d.resolve_node_id(Some("n9".into())).await.unwrap(), "n9");
    }

    #[tokio::test]
    async fn test_converge_skips_apps_without_image() {
        let root = tempfile::tempdir().unwrap();
        let orch = MemoryOrchestrator::new();
        orch.create_service(&ServiceCreate::new("keel-nginx", "nginx:1"))
            .await
            .unwrap();
        let d = daemon(root.path(), &orch);
        d.manager().register_app("api", false).unwrap().wait().await.unwrap();
        d.manager().apps().register_app("bare", false).unwrap();

        assert_eq!(d.converge_apps().await.unwrap(), 1);
        assert!(orch.service_spec("srv-keel--bare").is_none());
    }
}

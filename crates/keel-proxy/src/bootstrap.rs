//! Daemon start-up for the nginx service.

use std::time::Duration;

use keel_core::registry::RegistryAuth;
use keel_core::{KeelConfig, PortMapping};
use keel_docker::retry::{self, RetryPolicy};
use keel_docker::{bind_mount_spec, BindMount, Orchestrator, ServiceCreate};
use serde_json::json;
use tracing::{debug, info};

use crate::error::ProxyResult;
use crate::reconciler::LoadBalancerReconciler;

/// Where the nginx service runs and what it mounts.
pub struct ProxyBootstrap<'a> {
    config: &'a KeelConfig,
    orchestrator: &'a dyn Orchestrator,
    retry: RetryPolicy,
    startup_wait: Duration,
}

impl<'a> ProxyBootstrap<'a> {
    pub fn new(config: &'a KeelConfig, orchestrator: &'a dyn Orchestrator) -> Self {
        Self {
            config,
            orchestrator,
            retry: RetryPolicy::from_config(&config.docker),
            startup_wait: config.docker.dns_settle(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_startup_wait(mut self, wait: Duration) -> Self {
        self.startup_wait = wait;
        self
    }

    /// Host directories bind-mounted into the nginx container.
    pub fn mounts(&self) -> Vec<BindMount> {
        let paths = &self.config.paths;
        let proxy = &self.config.proxy;
        let mount = |host: std::path::PathBuf, container: &str| BindMount {
            host_path: host.to_string_lossy().into_owned(),
            container_path: container.to_string(),
        };
        vec![
            mount(paths.static_files_dir(), &proxy.static_root_on_nginx),
            mount(paths.fake_certs_dir(), &proxy.fake_certs_on_nginx),
            mount(paths.base_nginx_conf(), "/etc/nginx/nginx.conf"),
            mount(paths.nginx_conf_dir(), &proxy.conf_dir_on_nginx),
            mount(paths.letsencrypt_dir(), &proxy.letsencrypt_on_nginx),
            mount(paths.nginx_shared_dir(), &proxy.shared_on_nginx),
        ]
    }

    /// Render the config without a reload, make sure nginx runs on
    /// `node_id`, then attach its mounts and the overlay network.
    pub async fn run(&self, lb: &LoadBalancerReconciler, node_id: &str) -> ProxyResult<()> {
        let paths = &self.config.paths;
        for dir in [
            paths.letsencrypt_dir(),
            paths.nginx_shared_dir(),
            paths.fake_certs_dir(),
            paths.static_files_dir(),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }

        debug!("setting up nginx conf files");
        lb.re_populate_config(false).await?;

        let service = &self.config.proxy.service_name;
        if self.orchestrator.is_service_running(service).await? {
            let current = retry::node_id_for_service(self.orchestrator, service, self.retry).await?;
            if current != node_id {
                info!(%service, %current, target = %node_id, "nginx is running on a different node, recreating");
                self.orchestrator.remove_service(service).await?;
                self.create_on_node(node_id).await?;
            } else {
                debug!(%service, "nginx is already running");
            }
        } else {
            info!(%service, %node_id, "no nginx service is running, creating one");
            self.create_on_node(node_id).await?;
        }

        self.attach_mounts_and_network().await?;
        info!(%service, "nginx is set up");
        Ok(())
    }

    async fn create_on_node(&self, node_id: &str) -> ProxyResult<()> {
        let proxy = &self.config.proxy;
        let host_port = |host_port, container_port| PortMapping {
            host_port,
            container_port,
            protocol: Some("tcp".to_string()),
            publish_mode: Some("host".to_string()),
        };
        let mut create = ServiceCreate::new(proxy.service_name.clone(), proxy.image.clone());
        create.ports = vec![host_port(proxy.http_port, 80), host_port(proxy.https_port, 443)];
        create.node_id = Some(node_id.to_string());
        self.orchestrator.create_service(&create).await?;
        debug!(wait_ms = self.startup_wait.as_millis() as u64, "waiting for nginx to start up");
        tokio::time::sleep(self.startup_wait).await;
        Ok(())
    }

    async fn attach_mounts_and_network(&self) -> ProxyResult<()> {
        let service = &self.config.proxy.service_name;
        let inspect = self.orchestrator.inspect_service(service).await?;
        let mut spec = inspect.spec;
        let mounts: Vec<_> = self
            .mounts()
            .iter()
            .map(|m| bind_mount_spec(&m.host_path, &m.container_path))
            .collect();
        spec["TaskTemplate"]["ContainerSpec"]["Image"] = json!(self.config.proxy.image);
        spec["TaskTemplate"]["ContainerSpec"]["Mounts"] = json!(mounts);
        spec["TaskTemplate"]["Networks"] =
            json!([{ "Target": self.config.docker.overlay_network }]);
        self.orchestrator
            .update_service(service, inspect.version, &spec, &RegistryAuth::default())
            .await?;
        Ok(())
    }
}

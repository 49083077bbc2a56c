//! AppManager: application operations layered on the deploy pipeline.
//!
//! Everything that changes an app outside of a build goes through here:
//! definition updates, renames, removal, custom domains, SSL and image and
//! volume cleanup. Mutations are refused while the app has a build running
//! or queued.

use std::sync::Arc;

use async_trait::async_trait;
use keel_core::names::{check_custom_domain, ensure_name_allowed};
use keel_core::{BuildSource, BuildStatus};
use keel_docker::Orchestrator;
use keel_proxy::render::validate_template;
use keel_proxy::routes::root_domain;
use keel_proxy::LoadBalancerReconciler;
use keel_service::overrides::parse_override;
use keel_service::ServiceReconciler;
use keel_state::{AppUpdate, AppsDataStore};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::scheduler::{BuildScheduler, DeployHandle};

const ERROR_FIRST_ENABLE_ROOT_SSL: &str = "You have to first enable SSL for your root domain";

/// Certificate issuance, consumed as an external collaborator.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// The domain points at this cluster's default server.
    async fn verify_domain_resolves(&self, domain: &str) -> SchedulerResult<()>;

    /// This cluster answers challenges served for the domain.
    async fn verify_owns_domain(&self, domain: &str) -> SchedulerResult<()>;

    /// Obtain a certificate and place it where the proxy reads it.
    async fn request_certificate(&self, domain: &str) -> SchedulerResult<()>;
}

/// An image no recent deployed version refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnusedImage {
    pub id: String,
    pub tags: Vec<String>,
}

#[derive(Clone)]
pub struct AppManager {
    apps: AppsDataStore,
    orchestrator: Arc<dyn Orchestrator>,
    scheduler: BuildScheduler,
    services: ServiceReconciler,
    certs: Arc<dyn CertificateAuthority>,
    placeholder_image: String,
}

impl AppManager {
    pub fn new(
        apps: AppsDataStore,
        orchestrator: Arc<dyn Orchestrator>,
        scheduler: BuildScheduler,
        services: ServiceReconciler,
        certs: Arc<dyn CertificateAuthority>,
        placeholder_image: &str,
    ) -> Self {
        Self {
            apps,
            orchestrator,
            scheduler,
            services,
            certs,
            placeholder_image: placeholder_image.to_string(),
        }
    }

    pub fn apps(&self) -> &AppsDataStore {
        &self.apps
    }

    pub fn scheduler(&self) -> &BuildScheduler {
        &self.scheduler
    }

    pub fn services(&self) -> &ServiceReconciler {
        &self.services
    }

    fn load_balancer(&self) -> &LoadBalancerReconciler {
        self.services.load_balancer()
    }

    async fn reload_load_balancer(&self) -> SchedulerResult<()> {
        debug!("updating load balancer");
        self.load_balancer().re_populate_config(true).await?;
        Ok(())
    }

    /// Register an app and deploy the placeholder image to it, so the app
    /// has a running service before its first real build.
    pub fn register_app(&self, name: &str, has_persistent_data: bool) -> SchedulerResult<DeployHandle> {
        self.apps.register_app(name, has_persistent_data)?;
        let content = json!({
            "schemaVersion": 2,
            "imageName": self.placeholder_image,
        });
        Ok(self.scheduler.schedule_deploy(
            name,
            BuildSource::Definition {
                content: content.to_string(),
                source_revision: None,
            },
        ))
    }

    pub fn get_build_status(&self, app: &str) -> BuildStatus {
        let logs = self.scheduler.logs();
        BuildStatus {
            is_app_building: self.scheduler.is_app_building(app),
            logs: logs.logs(app),
            is_build_failed: logs.is_build_failed(app),
        }
    }

    /// Store a new definition for `app` and converge its service to it.
    pub async fn update_app_definition(&self, app: &str, mut update: AppUpdate) -> SchedulerResult<()> {
        self.scheduler.ensure_not_building(app)?;
        let record = self.apps.get_app(app)?;

        let has_volumes = update.volumes.as_ref().is_some_and(|v| !v.is_empty());
        update.node_id = self
            .services
            .resolve_node_id(&record, update.node_id.as_deref(), has_volumes)
            .await?;

        if let Some(raw) = update.service_update_override.as_deref() {
            parse_override(raw)?;
        }
        if let Some(template) = update
            .custom_nginx_config
            .as_deref()
            .filter(|t| !t.trim().is_empty())
        {
            validate_template(template)?;
        }

        self.apps.update_app_definition_in_db(app, update)?;
        self.services.ensure_service_inited_and_updated(app).await?;
        Ok(())
    }

    /// Move `old` to `new`: the service is recreated under the new name.
    pub async fn rename_app(&self, old: &str, new: &str) -> SchedulerResult<()> {
        info!(%old, %new, "renaming app");
        let record = self.apps.get_app(old)?;
        let default_ssl_on = record.has_default_subdomain_ssl;
        ensure_name_allowed(new)?;
        self.scheduler.ensure_not_building(old)?;

        let old_service = self.apps.service_name(old);
        if !self.orchestrator.is_service_running(&old_service).await? {
            return Err(SchedulerError::Generic("Service is not running!".to_string()));
        }
        self.orchestrator.remove_service(&old_service).await?;
        self.apps.rename_app_record(old, new)?;
        self.scheduler.logs().remove(old);

        self.services.ensure_service_inited_and_updated(new).await?;
        if default_ssl_on {
            self.enable_ssl_for_default_subdomain(new).await?;
        }
        Ok(())
    }

    pub async fn remove_app(&self, app: &str) -> SchedulerResult<()> {
        info!(%app, "removing app");
        self.scheduler.ensure_not_building(app)?;
        let service = self.apps.service_name(app);
        if self.orchestrator.is_service_running(&service).await? {
            self.orchestrator.remove_service(&service).await?;
        } else {
            warn!(%service, "cannot delete service, it is not running");
        }
        self.apps.delete_app(app)?;
        self.scheduler.logs().remove(app);
        self.reload_load_balancer().await
    }

    pub async fn add_custom_domain(&self, app: &str, domain: &str) -> SchedulerResult<()> {
        let settings = self.apps.store().get_settings()?;
        check_custom_domain(domain, app, root_domain(&settings))?;
        self.certs.verify_domain_resolves(domain).await?;
        debug!(%app, %domain, "enabling custom domain");
        self.apps.add_custom_domain(app, domain)?;
        self.reload_load_balancer().await
    }

    pub async fn remove_custom_domain(&self, app: &str, domain: &str) -> SchedulerResult<()> {
        debug!(%app, %domain, "removing custom domain");
        self.apps.remove_custom_domain(app, domain)?;
        self.reload_load_balancer().await
    }

    fn ensure_root_ssl(&self) -> SchedulerResult<String> {
        let settings = self.apps.store().get_settings()?;
        if !settings.has_root_ssl {
            return Err(SchedulerError::Generic(ERROR_FIRST_ENABLE_ROOT_SSL.to_string()));
        }
        Ok(root_domain(&settings).to_string())
    }

    pub async fn enable_ssl_for_default_subdomain(&self, app: &str) -> SchedulerResult<()> {
        let root = self.ensure_root_ssl()?;
        self.apps.get_app(app)?;
        let domain = format!("{app}.{root}");
        debug!(%domain, "verifying domain ownership");
        self.certs.verify_owns_domain(&domain).await?;
        info!(%app, %domain, "enabling SSL");
        self.certs.request_certificate(&domain).await?;
        self.apps.set_ssl_for_default_subdomain(app, true)?;
        self.reload_load_balancer().await
    }

    pub async fn enable_custom_domain_ssl(&self, app: &str, domain: &str) -> SchedulerResult<()> {
        self.ensure_root_ssl()?;
        debug!(%domain, "verifying domain ownership");
        self.certs.verify_owns_domain(domain).await?;
        info!(%app, %domain, "enabling SSL");
        self.apps.verify_custom_domain_belongs_to_app(app, domain)?;
        self.certs.request_certificate(domain).await?;
        self.apps.enable_custom_domain_ssl(app, domain)?;
        self.reload_load_balancer().await
    }

    /// Images not referenced by the deployed version of any app, nor by the
    /// `most_recent_limit` versions before it.
    pub async fn get_unused_images(&self, most_recent_limit: i64) -> SchedulerResult<Vec<UnusedImage>> {
        debug!(most_recent_limit, "getting unused images");
        if most_recent_limit < 0 {
            return Err(SchedulerError::IllegalParameter(
                "Most Recent Limit cannot be negative".to_string(),
            ));
        }
        let images = self.orchestrator.list_images().await?;
        let apps = self.apps.get_apps()?;

        let mut in_use = Vec::new();
        for app in &apps {
            let newest = i64::from(app.deployed_version);
            let oldest = newest - most_recent_limit;
            in_use.extend(
                app.versions
                    .iter()
                    .filter(|v| (oldest..=newest).contains(&i64::from(v.version)))
                    .filter_map(|v| v.image_name.clone()),
            );
        }

        Ok(images
            .into_iter()
            .filter(|img| !img.repo_tags.iter().any(|t| in_use.contains(t)))
            .map(|img| UnusedImage {
                id: img.id,
                tags: img.repo_tags,
            })
            .collect())
    }

    /// Remove images one by one. Returns the ids that could not be removed.
    pub async fn delete_images(&self, ids: &[String]) -> Vec<String> {
        debug!(count = ids.len(), "deleting images");
        let mut failed = Vec::new();
        for id in ids {
            match self.orchestrator.remove_image(id).await {
                Ok(()) => debug!(%id, "image deleted"),
                Err(e) => {
                    error!(%id, error = %e, "image removal failed");
                    failed.push(id.clone());
                }
            }
        }
        failed
    }

    /// Remove volumes no app refers to. Returns the volumes left in place,
    /// either because an app uses them or because removal failed.
    pub async fn remove_volumes_safe(&self, volumes: &[String]) -> SchedulerResult<Vec<String>> {
        let apps = self.apps.get_apps()?;
        let mut kept: Vec<String> = Vec::new();
        for volume in volumes {
            let used = apps
                .iter()
                .flat_map(|a| a.volumes.iter())
                .any(|v| v.volume_name.as_deref() == Some(volume.as_str()));
            if used && !kept.contains(volume) {
                kept.push(volume.clone());
            }
        }

        let unused: Vec<&String> = volumes.iter().filter(|v| !kept.contains(v)).collect();
        for volume in unused {
            let name = self.apps.volume_name(volume);
            if let Err(e) = self.orchestrator.remove_volume(&name).await {
                debug!(volume = %name, error = %e, "volume removal failed");
                kept.push(volume.clone());
            }
        }
        Ok(kept)
    }
}

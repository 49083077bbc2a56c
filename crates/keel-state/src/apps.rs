//! Application record rules layered over the raw store.

use keel_core::names::{self, ensure_name_allowed};
use keel_core::{
    epoch_secs, AppDefinition, AppVersion, BuiltImage, CustomDomain, DeployTokenConfig, EnvVar,
    HttpAuth, KeelConfig, PortMapping, RepoInfo, UpdateOrder, VolumeMount,
};
use tracing::info;

use crate::error::{StateError, StateResult};
use crate::store::StateStore;

/// Fields of an application definition a caller may change.
///
/// `None` leaves a collection untouched; scalar flags are always applied.
#[derive(Debug, Clone, Default)]
pub struct AppUpdate {
    pub description: String,
    pub instance_count: Option<u32>,
    pub definition_path: Option<String>,
    pub env_vars: Option<Vec<EnvVar>>,
    pub volumes: Option<Vec<VolumeMount>>,
    pub ports: Option<Vec<PortMapping>>,
    pub tags: Vec<String>,
    pub node_id: Option<String>,
    pub not_expose_as_web_app: bool,
    pub container_http_port: Option<u16>,
    pub http_auth: Option<HttpAuth>,
    pub force_ssl: bool,
    pub websocket_support: bool,
    pub custom_nginx_config: Option<String>,
    pub redirect_domain: Option<String>,
    pub pre_deploy_hook: Option<String>,
    pub service_update_override: Option<String>,
    pub update_order: Option<UpdateOrder>,
    pub repo_info: Option<RepoInfo>,
    pub deploy_token: DeployTokenConfig,
}

/// Application data store.
#[derive(Clone)]
pub struct AppsDataStore {
    store: StateStore,
    namespace: String,
    overlay_network: String,
    default_definition_path: String,
    max_version_history: usize,
}

impl AppsDataStore {
    pub fn new(store: StateStore, config: &KeelConfig) -> Self {
        Self {
            store,
            namespace: config.namespace.clone(),
            overlay_network: config.docker.overlay_network.clone(),
            default_definition_path: config.build.definition_path.clone(),
            max_version_history: config.build.max_version_history,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn service_name(&self, app: &str) -> String {
        names::service_name(&self.namespace, app)
    }

    pub fn volume_name(&self, volume: &str) -> String {
        names::volume_name(&self.namespace, volume)
    }

    pub fn get_app(&self, name: &str) -> StateResult<AppDefinition> {
        if name.is_empty() {
            return Err(StateError::Invalid("App Name should not be empty".to_string()));
        }
        self.store.get_app(name)?.ok_or_else(|| {
            StateError::NotFound(format!(
                "App ({name}) could not be found. Make sure that you have created the app."
            ))
        })
    }

    pub fn get_apps(&self) -> StateResult<Vec<AppDefinition>> {
        self.store.list_apps()
    }

    /// Validate and apply `f` to a stored app in one transaction.
    fn modify<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut AppDefinition) -> StateResult<R>,
    ) -> StateResult<R> {
        self.store.update_app(name, |app| {
            let result = f(app)?;
            validate_app(app)?;
            Ok(result)
        })
    }

    pub fn register_app(&self, name: &str, has_persistent_data: bool) -> StateResult<()> {
        ensure_name_allowed(name)?;
        let app = AppDefinition::new(
            name,
            has_persistent_data,
            &self.overlay_network,
            &self.default_definition_path,
        );
        self.store.insert_app(&app)?;
        info!(app = %name, has_persistent_data, "app registered");
        Ok(())
    }

    /// Allocate the next version number and append it to the history.
    ///
    /// Older entries are dropped first so the history stays below the
    /// configured maximum; the new number is always greater than every
    /// number still on file, so numbers are never reused.
    pub fn create_new_version(&self, name: &str) -> StateResult<u32> {
        let keep = self.max_version_history.saturating_sub(1);
        self.modify(name, |app| {
            if app.versions.len() > keep {
                let drop = app.versions.len() - keep;
                app.versions.drain(..drop);
            }
            let mut next = app.versions.len() as u32;
            for v in &app.versions {
                if next <= v.version {
                    next = v.version + 1;
                }
            }
            app.versions.push(AppVersion {
                version: next,
                image_name: None,
                source_revision: None,
                timestamp: epoch_secs(),
            });
            Ok(next)
        })
    }

    pub fn set_deployed_version_and_image(
        &self,
        name: &str,
        version: u32,
        built: &BuiltImage,
    ) -> StateResult<()> {
        if built.image_name.is_empty() {
            return Err(StateError::Invalid(
                "ImageName Name should not be empty".to_string(),
            ));
        }
        self.modify(name, |app| {
            let entry = app
                .versions
                .iter_mut()
                .find(|v| v.version == version)
                .ok_or_else(|| {
                    StateError::Invalid(format!("Version trying to deploy not found {version}"))
                })?;
            entry.image_name = Some(built.image_name.clone());
            entry.source_revision = built.source_revision.clone();
            app.deployed_version = version;
            Ok(())
        })?;
        info!(app = %name, version, image = %built.image_name, "deployed version recorded");
        Ok(())
    }

    // ── Custom domains ─────────────────────────────────────────────

    pub fn add_custom_domain(&self, name: &str, domain: &str) -> StateResult<()> {
        self.modify(name, |app| {
            if app.custom_domains.iter().any(|d| d.public_domain == domain) {
                return Err(StateError::IllegalParameter(format!(
                    "App already has customDomain: {domain} attached to app {name}"
                )));
            }
            app.custom_domains.push(CustomDomain {
                public_domain: domain.to_string(),
                has_ssl: false,
            });
            Ok(())
        })
    }

    pub fn remove_custom_domain(&self, name: &str, domain: &str) -> StateResult<()> {
        self.modify(name, |app| {
            let before = app.custom_domains.len();
            app.custom_domains.retain(|d| d.public_domain != domain);
            if app.custom_domains.len() == before {
                return Err(StateError::Invalid(format!(
                    "Custom domain {domain} does not exist in {name}"
                )));
            }
            if app.redirect_domain.as_deref() == Some(domain) || app.custom_domains.is_empty() {
                app.redirect_domain = None;
            }
            // Forced SSL may have depended on the removed domain.
            if app.force_ssl && !app.has_ssl_domain() {
                app.force_ssl = false;
            }
            Ok(())
        })
    }

    pub fn enable_custom_domain_ssl(&self, name: &str, domain: &str) -> StateResult<()> {
        self.modify(name, |app| {
            let entry = app
                .custom_domains
                .iter_mut()
                .find(|d| d.public_domain == domain)
                .ok_or_else(|| {
                    StateError::Invalid(format!(
                        "customDomain: {domain} is not attached to app {name}"
                    ))
                })?;
            entry.has_ssl = true;
            Ok(())
        })
    }

    pub fn verify_custom_domain_belongs_to_app(&self, name: &str, domain: &str) -> StateResult<()> {
        let app = self.get_app(name)?;
        if app.custom_domains.iter().any(|d| d.public_domain == domain) {
            Ok(())
        } else {
            Err(StateError::IllegalParameter(format!(
                "customDomain {domain} is not attached to app {name}"
            )))
        }
    }

    pub fn set_ssl_for_default_subdomain(&self, name: &str, enabled: bool) -> StateResult<()> {
        self.modify(name, |app| {
            app.has_default_subdomain_ssl = enabled;
            Ok(())
        })
    }

    /// Turn off default-subdomain SSL and forced SSL on every app, used
    /// when the root domain changes.
    pub fn disable_all_subdomain_ssl(&self) -> StateResult<()> {
        for app in self.get_apps()? {
            self.modify(&app.name, |app| {
                app.force_ssl = false;
                app.has_default_subdomain_ssl = false;
                Ok(())
            })?;
        }
        Ok(())
    }

    // ── Definition updates ─────────────────────────────────────────

    pub fn update_app_definition_in_db(&self, name: &str, update: AppUpdate) -> StateResult<()> {
        self.modify(name, move |app| {
            apply_update(app, update);
            Ok(())
        })?;
        info!(app = %name, "app definition updated");
        Ok(())
    }

    pub fn rename_app_record(&self, old: &str, new: &str) -> StateResult<()> {
        ensure_name_allowed(new)?;
        self.store.rename_app(old, new, |app| {
            // The certificate was issued for the old subdomain.
            app.has_default_subdomain_ssl = false;
            if app.force_ssl && !app.has_ssl_domain() {
                app.force_ssl = false;
            }
            Ok(())
        })?;
        info!(%old, %new, "app renamed");
        Ok(())
    }

    pub fn delete_app(&self, name: &str) -> StateResult<()> {
        ensure_name_allowed(name)?;
        if !self.store.delete_app(name)? {
            return Err(StateError::Invalid(
                "App Name does not exist in Database! Cannot be deleted.".to_string(),
            ));
        }
        info!(app = %name, "app deleted");
        Ok(())
    }
}

fn apply_update(app: &mut AppDefinition, update: AppUpdate) {
    if let Some(count) = update.instance_count {
        app.instance_count = count;
    }
    if let Some(path) = update.definition_path.filter(|p| !p.trim().is_empty()) {
        app.definition_path = path;
    }
    app.description = update.description;
    app.tags = update.tags;
    app.node_id = update.node_id.filter(|n| !n.is_empty());
    app.not_expose_as_web_app = update.not_expose_as_web_app;
    app.container_http_port = update.container_http_port;
    app.force_ssl = update.force_ssl;
    app.websocket_support = update.websocket_support;
    app.custom_nginx_config = update.custom_nginx_config.filter(|c| !c.trim().is_empty());
    app.redirect_domain = update.redirect_domain.filter(|d| !d.is_empty());
    app.pre_deploy_hook = update.pre_deploy_hook.filter(|h| !h.trim().is_empty());
    app.service_update_override = update
        .service_update_override
        .filter(|o| !o.trim().is_empty());
    if let Some(order) = update.update_order {
        app.update_order = order;
    }

    app.repo_info = update.repo_info.filter(|r| {
        !r.repo.is_empty()
            && !r.branch.is_empty()
            && ((!r.user.is_empty() && !r.password.is_empty()) || r.ssh_key.is_some())
    });

    app.deploy_token = if update.deploy_token.enabled {
        let token = update
            .deploy_token
            .token
            .filter(|t| !t.is_empty())
            .or_else(|| app.deploy_token.token.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        DeployTokenConfig {
            enabled: true,
            token: Some(token),
        }
    } else {
        DeployTokenConfig::default()
    };

    app.http_auth = update.http_auth.filter(|a| !a.user.is_empty());

    if let Some(ports) = update.ports {
        app.ports = ports
            .into_iter()
            .filter(|p| p.host_port != 0 || p.container_port != 0)
            .collect();
    }
    if let Some(env_vars) = update.env_vars {
        app.env_vars = env_vars
            .into_iter()
            .map(|e| EnvVar::new(e.key.trim(), e.value))
            .filter(|e| !e.key.is_empty() || !e.value.is_empty())
            .collect();
    }
    if let Some(volumes) = update.volumes {
        app.volumes = volumes
            .into_iter()
            .map(|v| {
                let host_path = v.host_path.map(|p| p.trim().to_string()).filter(|p| !p.is_empty());
                let volume_name = if host_path.is_some() {
                    None
                } else {
                    v.volume_name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty())
                };
                VolumeMount {
                    container_path: v.container_path.trim().to_string(),
                    volume_name,
                    host_path,
                }
            })
            .filter(|v| {
                !v.container_path.is_empty() || v.host_path.is_some() || v.volume_name.is_some()
            })
            .collect();
    }
}

fn is_valid_path(path: &str) -> bool {
    path.starts_with('/') && !path.contains("..") && !path.contains('\0')
}

/// Save-time checks every stored record must pass.
pub fn validate_app(app: &AppDefinition) -> StateResult<()> {
    if app.force_ssl && !app.has_ssl_domain() {
        return Err(StateError::IllegalOperation(
            "Cannot force SSL without at least one SSL-enabled domain!".to_string(),
        ));
    }
    if !names::is_contained_relative_path(&app.definition_path) {
        return Err(StateError::Invalid(format!(
            "Definition path must be relative to the source root: {}",
            app.definition_path
        )));
    }
    if app.env_vars.iter().any(|e| e.key.is_empty()) {
        return Err(StateError::Invalid(
            "Environmental Variable key is empty!".to_string(),
        ));
    }
    for port in &app.ports {
        let valid = |p: u16| p > 0 && p < 65535;
        if !valid(port.host_port) || !valid(port.container_port) {
            return Err(StateError::Invalid(format!(
                "Invalid ports: {} or {}",
                port.host_port, port.container_port
            )));
        }
    }
    for vol in &app.volumes {
        if vol.container_path.is_empty() || (vol.volume_name.is_none() && vol.host_path.is_none())
        {
            return Err(StateError::Invalid(
                "containerPath or the source paths (volume name or host path) are missing"
                    .to_string(),
            ));
        }
        if vol.volume_name.is_some() && vol.host_path.is_some() {
            return Err(StateError::Invalid(
                "Cannot define both host path and volume name!".to_string(),
            ));
        }
        if !is_valid_path(&vol.container_path) {
            return Err(StateError::Invalid(format!(
                "Invalid containerPath: {}",
                vol.container_path
            )));
        }
        match (&vol.host_path, &vol.volume_name) {
            (Some(host), _) if !is_valid_path(host) => {
                return Err(StateError::Invalid(format!(
                    "Invalid volume host path: {host}"
                )));
            }
            (None, Some(name)) if !names::is_name_allowed(name) => {
                return Err(StateError::Invalid(format!("Invalid volume name: {name}")));
            }
            _ => {}
        }
    }
    Ok(())
}

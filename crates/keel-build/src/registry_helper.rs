//! Registry operations that need both the stored records and the orchestrator.

use std::collections::BTreeMap;
use std::sync::Arc;

use keel_core::names::remove_http_https;
use keel_core::registry::{self, RegistryAuth, RegistryCredential};
use keel_core::RegistryKind;
use keel_docker::{split_repo_tag, Orchestrator};
use keel_state::RegistriesDataStore;
use tracing::{debug, error, info};

use crate::build_log::AppBuildLog;
use crate::error::{BuildError, BuildResult};
use crate::output;

#[derive(Clone)]
pub struct RegistryHelper {
    registries: RegistriesDataStore,
    orchestrator: Arc<dyn Orchestrator>,
}

impl RegistryHelper {
    pub fn new(registries: RegistriesDataStore, orchestrator: Arc<dyn Orchestrator>) -> Self {
        Self {
            registries,
            orchestrator,
        }
    }

    pub fn registries(&self) -> &RegistriesDataStore {
        &self.registries
    }

    async fn ensure_authenticated(
        &self,
        user: &str,
        password: &str,
        domain: &str,
    ) -> BuildResult<()> {
        let auth = RegistryAuth {
            username: user.to_string(),
            password: password.to_string(),
            serveraddress: remove_http_https(domain).to_string(),
        };
        self.orchestrator
            .check_registry_auth(&auth)
            .await
            .map_err(|e| {
                debug!(error = %e, %domain, "registry login rejected");
                BuildError::AuthenticationFailed(
                    "Authentication failed. Either username, password or domain is incorrect."
                        .to_string(),
                )
            })
    }

    /// Store a registry. Remote registries must accept the credentials first.
    pub async fn add_registry(
        &self,
        user: &str,
        password: &str,
        domain: &str,
        image_prefix: &str,
        kind: RegistryKind,
    ) -> BuildResult<String> {
        if kind == RegistryKind::Remote {
            self.ensure_authenticated(user, password, domain).await?;
        }
        Ok(self
            .registries
            .add(user, password, domain, image_prefix, kind)?)
    }

    pub async fn update_registry(
        &self,
        id: &str,
        user: &str,
        password: &str,
        domain: &str,
        image_prefix: &str,
    ) -> BuildResult<()> {
        self.ensure_authenticated(user, password, domain).await?;
        Ok(self
            .registries
            .update(id, user, password, domain, image_prefix)?)
    }

    pub fn delete_registry(&self, id: &str, allow_local: bool) -> BuildResult<()> {
        Ok(self.registries.delete(id, allow_local)?)
    }

    pub fn set_default_push_registry(&self, id: Option<&str>) -> BuildResult<()> {
        Ok(self.registries.set_default_push_registry(id)?)
    }

    pub fn auth_for_image(&self, image: &str) -> BuildResult<Option<RegistryAuth>> {
        Ok(registry::auth_for_image(&self.registries.get_all()?, image))
    }

    pub fn build_registry_config(&self) -> BuildResult<BTreeMap<String, RegistryCredential>> {
        Ok(registry::registry_config(&self.registries.get_all()?))
    }

    /// Push `{base}:{version}` to the default push registry, if there is one.
    ///
    /// Returns the name the image should be deployed as: the
    /// registry-qualified name after a push, or the local tag otherwise.
    pub async fn retag_and_push_if_default_push_exists(
        &self,
        base_image: &str,
        version: u32,
        log: &AppBuildLog,
    ) -> BuildResult<String> {
        if base_image.is_empty() {
            return Err(BuildError::Generic("no image name! cannot re-tag!".to_string()));
        }
        let local = format!("{base_image}:{version}");
        let Some(reg) = self.registries.default_push_registry()? else {
            return Ok(local);
        };

        let target = registry::push_target(&reg, base_image, version)?;
        let auth = self.auth_for_image(&target)?.ok_or_else(|| {
            BuildError::Generic(
                "Registry auth is missing just after re-tagging! Something is wrong!".to_string(),
            )
        })?;
        debug!(%target, "registry auth found, pushing the image");

        let (repo, tag) = split_repo_tag(&target);
        let pushed: Result<(), String> = async {
            self.orchestrator
                .tag_image(&local, repo, tag)
                .await
                .map_err(|e| e.to_string())?;
            self.push_image(&target, &auth, log).await
        }
        .await;
        if let Err(e) = pushed {
            error!(%target, error = %e, "push failed");
            return Err(BuildError::Push(format!("Push failed: {e}")));
        }
        info!(%target, "image pushed");
        Ok(target)
    }

    async fn push_image(
        &self,
        image: &str,
        auth: &RegistryAuth,
        log: &AppBuildLog,
    ) -> Result<(), String> {
        log.log(format!("Pushing to remote: {image}"));
        log.log(format!("Server: {}", auth.serveraddress));
        log.log("This might take a few minutes...");
        let rx = self
            .orchestrator
            .push_image(image, auth)
            .await
            .map_err(|e| e.to_string())?;
        match output::drain_logged(rx, log).await {
            Ok(()) => {
                log.log("Push succeeded...");
                Ok(())
            }
            Err(e) => {
                log.log("Push failed...");
                Err(e)
            }
        }
    }
}

//! Deploy pipeline: new version, image, record, service.

use async_trait::async_trait;
use keel_build::{ImageBuilder, ImageRequest};
use keel_core::BuildSource;
use keel_service::ServiceReconciler;
use keel_state::AppsDataStore;
use tracing::info;

use crate::error::SchedulerResult;
use crate::scheduler::{DeployRunner, DeployedVersion};

/// The production [`DeployRunner`].
///
/// A failed build never touches the running service: the version stays in
/// the history without an image and `deployed_version` is not moved.
#[derive(Clone)]
pub struct DeployPipeline {
    apps: AppsDataStore,
    builder: ImageBuilder,
    services: ServiceReconciler,
}

impl DeployPipeline {
    pub fn new(apps: AppsDataStore, builder: ImageBuilder, services: ServiceReconciler) -> Self {
        Self {
            apps,
            builder,
            services,
        }
    }
}

#[async_trait]
impl DeployRunner for DeployPipeline {
    async fn build(&self, app: &str, source: &BuildSource) -> SchedulerResult<DeployedVersion> {
        let version = self.apps.create_new_version(app)?;
        let record = self.apps.get_app(app)?;
        let image = self
            .builder
            .ensure_image(&ImageRequest {
                source,
                app,
                definition_path: &record.definition_path,
                version,
                env_vars: &record.env_vars,
            })
            .await?;
        self.apps.set_deployed_version_and_image(app, version, &image)?;
        info!(%app, version, image = %image.image_name, "version recorded as deployed");
        Ok(DeployedVersion {
            app: app.to_string(),
            version,
            image,
        })
    }

    async fn activate(&self, deployed: &DeployedVersion) -> SchedulerResult<()> {
        self.services
            .ensure_service_inited_and_updated(&deployed.app)
            .await?;
        Ok(())
    }
}

//! End-to-end deploy scenarios.
//!
//! Wires the real pipeline (state store, image builder, service and load
//! balancer reconcilers, scheduler) over an in-memory orchestrator.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_build::{BuildLogsManager, ImageBuilder, RegistryHelper};
use keel_core::{ApiStatus, BuildSource, KeelConfig};
use keel_docker::{MemoryOrchestrator, Orchestrator, RetryPolicy, ServiceCreate};
use keel_proxy::LoadBalancerReconciler;
use keel_scheduler::{
    AppManager, BuildScheduler, CertificateAuthority, DeployPipeline, SchedulerResult,
};
use keel_service::{HookRegistry, ServiceError, ServicePatch, ServiceReconciler};
use keel_state::{AppsDataStore, RegistriesDataStore, StateStore};

struct AcceptAll;

#[async_trait]
impl CertificateAuthority for AcceptAll {
    async fn verify_domain_resolves(&self, _domain: &str) -> SchedulerResult<()> {
        Ok(())
    }

    async fn verify_owns_domain(&self, _domain: &str) -> SchedulerResult<()> {
        Ok(())
    }

    async fn request_certificate(&self, _domain: &str) -> SchedulerResult<()> {
        Ok(())
    }
}

struct Cluster {
    root: tempfile::TempDir,
    orch: MemoryOrchestrator,
    manager: AppManager,
}

async fn cluster() -> Cluster {
    let root = tempfile::tempdir().unwrap();
    let mut config = KeelConfig::default();
    config.paths.root = root.path().join("keel");
    config.docker.prune_delay_ms = 0;
    config.docker.dns_settle_ms = 0;

    let store = StateStore::open_in_memory().unwrap();
    let apps = AppsDataStore::new(store.clone(), &config);
    let orch = MemoryOrchestrator::new();
    let shared: Arc<dyn Orchestrator> = Arc::new(orch.clone());
    orch.create_service(&ServiceCreate::new(
        config.proxy.service_name.clone(),
        config.proxy.image.clone(),
    ))
    .await
    .unwrap();

    let lb = LoadBalancerReconciler::new(&config, apps.clone(), shared.clone())
        .with_retry(RetryPolicy::immediate(0));
    let services =
        ServiceReconciler::new(&config, shared.clone(), apps.clone(), lb, HookRegistry::new())
            .with_retry(RetryPolicy::immediate(0));
    let logs = BuildLogsManager::new(config.build.log_size);
    let registry = RegistryHelper::new(RegistriesDataStore::new(store), shared.clone());
    let builder = ImageBuilder::new(&config, shared.clone(), registry, logs.clone());
    let pipeline = DeployPipeline::new(apps.clone(), builder, services.clone());
    let scheduler = BuildScheduler::new(Arc::new(pipeline), logs);
    let manager = AppManager::new(
        apps,
        shared,
        scheduler,
        services,
        Arc::new(AcceptAll),
        &config.build.placeholder_image,
    );
    Cluster {
        root,
        orch,
        manager,
    }
}

async fn register(cluster: &Cluster, app: &str) {
    cluster
        .manager
        .register_app(app, false)
        .unwrap()
        .wait()
        .await
        .unwrap();
}

fn upload(cluster: &Cluster, name: &str, files: &[(&str, &str)]) -> PathBuf {
    let src = tempfile::tempdir().unwrap();
    for (file, content) in files {
        std::fs::write(src.path().join(file), content).unwrap();
    }
    let tar_path = cluster.root.path().join(format!("{name}.tar"));
    let mut builder = tar::Builder::new(std::fs::File::create(&tar_path).unwrap());
    builder.append_dir_all(".", src.path()).unwrap();
    builder.into_inner().unwrap();
    tar_path
}

fn dockerfile_source(base: &str) -> BuildSource {
    BuildSource::Definition {
        content: format!(r#"{{"schemaVersion":2,"dockerfileLines":["FROM {base}"]}}"#),
        source_revision: None,
    }
}

#[tokio::test]
async fn scenario_tarball_deploy_records_new_version() {
    let cluster = cluster().await;
    register(&cluster, "api").await;
    let before = cluster.manager.apps().get_app("api").unwrap().deployed_version;

    let tar_path = upload(
        &cluster,
        "api",
        &[
            ("keel-definition", r#"{"schemaVersion":2,"dockerfilePath":"./Dockerfile"}"#),
            ("Dockerfile", "FROM busybox\n"),
        ],
    );
    let deployed = cluster
        .manager
        .scheduler()
        .deploy(
            "api",
            BuildSource::Tarball {
                uploaded_tar_path: tar_path.clone(),
                source_revision: Some("rev-1".into()),
            },
        )
        .await
        .unwrap();

    assert_eq!(deployed.version, before + 1);
    assert_eq!(deployed.image.image_name, format!("img-keel-api:{}", before + 1));
    let builds = cluster.orch.builds();
    assert_eq!(builds.len(), 1);
    assert_eq!(builds[0].options.tag, "img-keel-api");

    let app = cluster.manager.apps().get_app("api").unwrap();
    assert_eq!(app.deployed_version, before + 1);
    assert_eq!(app.deployed_image(), Some(deployed.image.image_name.as_str()));
    let spec = cluster.orch.service_spec("srv-keel--api").unwrap();
    assert_eq!(
        spec["TaskTemplate"]["ContainerSpec"]["Image"],
        deployed.image.image_name.as_str()
    );
    assert!(!tar_path.exists());
}

#[tokio::test]
async fn scenario_queued_deploy_waits_for_active_build() {
    let cluster = cluster().await;
    register(&cluster, "api").await;
    register(&cluster, "worker").await;
    cluster.orch.hold_builds();

    let scheduler = cluster.manager.scheduler().clone();
    let api = scheduler.schedule_deploy("api", dockerfile_source("alpine"));
    let worker = tokio::spawn(scheduler.schedule_deploy("worker", dockerfile_source("busybox")).wait());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(scheduler.active_build().as_deref(), Some("api"));
    assert!(scheduler.is_app_building("worker"));
    assert!(!worker.is_finished());

    cluster.orch.release_build();
    api.wait().await.unwrap();

    cluster.orch.release_build();
    let deployed = worker.await.unwrap().unwrap();
    assert_eq!(deployed.app, "worker");

    let tags: Vec<String> = cluster
        .orch
        .builds()
        .iter()
        .map(|b| b.options.tag.clone())
        .collect();
    assert_eq!(tags, vec!["img-keel-api", "img-keel-worker"]);
}

#[tokio::test]
async fn scenario_custom_domain_reaches_proxy_config() {
    let cluster = cluster().await;
    register(&cluster, "api").await;

    cluster
        .manager
        .add_custom_domain("api", "x.example.com")
        .await
        .unwrap();

    let lb = cluster.manager.services().load_balancer();
    let conf = std::fs::read_to_string(lb.apps_config_path()).unwrap();
    let block = conf
        .split("server {")
        .find(|b| b.contains("server_name x.example.com;"))
        .expect("server block for x.example.com");
    assert!(block.contains("set $upstream http://srv-keel--api:80;"));
}

#[tokio::test]
async fn scenario_stale_service_update_conflicts() {
    let cluster = cluster().await;
    register(&cluster, "api").await;
    let services = cluster.manager.services();

    let patch = ServicePatch {
        image: Some("img-keel-api:9".into()),
        ..Default::default()
    };
    let first = services.prepare_update("srv-keel--api", &patch, None).await.unwrap();
    let second = services.prepare_update("srv-keel--api", &patch, None).await.unwrap();
    assert_eq!(first.version, second.version);

    services.submit(&first).await.unwrap();
    let err = services.submit(&second).await.unwrap_err();
    assert!(matches!(err, ServiceError::VersionConflict(_)));
    assert_eq!(err.status(), ApiStatus::IllegalOperation);
}

#[tokio::test]
async fn failed_build_keeps_running_version() {
    let cluster = cluster().await;
    register(&cluster, "api").await;
    let before = cluster.manager.apps().get_app("api").unwrap();
    let image_before = cluster.orch.service_spec("srv-keel--api").unwrap()["TaskTemplate"]
        ["ContainerSpec"]["Image"]
        .clone();

    cluster.orch.fail_builds_with("compilation failed");
    let err = cluster
        .manager
        .scheduler()
        .deploy("api", dockerfile_source("alpine"))
        .await
        .unwrap_err();
    assert_eq!(err.status, ApiStatus::BuildError);

    let after = cluster.manager.apps().get_app("api").unwrap();
    assert_eq!(after.deployed_version, before.deployed_version);
    assert_eq!(after.versions.len(), before.versions.len() + 1);
    assert_eq!(after.versions.last().unwrap().image_name, None);
    assert_eq!(
        cluster.orch.service_spec("srv-keel--api").unwrap()["TaskTemplate"]["ContainerSpec"]
            ["Image"],
        image_before
    );

    let status = cluster.manager.get_build_status("api");
    assert!(status.is_build_failed);
    assert!(!status.is_app_building);
}

//! LoadBalancerReconciler: serialized regeneration of the nginx config.
//!
//! Callers may ask for a regeneration at any time and concurrently. Requests
//! are queued; one background pass runs at a time and answers every request
//! that was waiting when it started. Requests arriving while a pass runs are
//! answered together by the next pass.
//!
//! ```text
//!   re_populate_config ──► waiters ──► [pass: apps ─► entries ─► render ─► swap]
//!          │                                                                │
//!          └──────────── outcome (shared by the batch) ◄────────────────────┘
//!          │
//!          └─► HUP to the nginx container (unless suppressed)
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use keel_core::{ClusterSettings, DeployFailure, KeelConfig};
use keel_docker::retry::{self, RetryPolicy};
use keel_docker::Orchestrator;
use keel_state::AppsDataStore;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::error::{ProxyError, ProxyResult};
use crate::render::{self, ServerRenderer, BASE_TEMPLATE, ROOT_TEMPLATE};
use crate::routes::{self, NginxPaths};
use crate::swap::swap_config;

/// DH params files shorter than this are treated as broken.
const MIN_DHPARAMS_LEN: usize = 10;

type Waiter = oneshot::Sender<Result<(), DeployFailure>>;

#[derive(Default)]
struct ReloadQueue {
    in_progress: bool,
    waiters: Vec<Waiter>,
}

/// Host-side locations of the generated files.
#[derive(Debug, Clone)]
struct ConfigFiles {
    /// `{nginx_conf_dir}/{namespace}`, without extension.
    apps_base: PathBuf,
    root_base: PathBuf,
    base_conf: PathBuf,
    dhparams_on_host: PathBuf,
}

struct Inner {
    apps: AppsDataStore,
    orchestrator: Arc<dyn Orchestrator>,
    namespace: String,
    files: ConfigFiles,
    nginx: NginxPaths,
    proxy: keel_core::config::ProxyConfig,
    queue: Mutex<ReloadQueue>,
    passes: AtomicU64,
}

#[derive(Clone)]
pub struct LoadBalancerReconciler {
    inner: Arc<Inner>,
    retry: RetryPolicy,
}

impl LoadBalancerReconciler {
    pub fn new(
        config: &KeelConfig,
        apps: AppsDataStore,
        orchestrator: Arc<dyn Orchestrator>,
    ) -> Self {
        let conf_dir = config.paths.nginx_conf_dir();
        let files = ConfigFiles {
            apps_base: conf_dir.join(&config.namespace),
            root_base: config.paths.root_nginx_conf_base(),
            base_conf: config.paths.base_nginx_conf(),
            dhparams_on_host: config
                .paths
                .nginx_shared_dir()
                .join(&config.proxy.dhparam_file_name),
        };
        let nginx = NginxPaths {
            letsencrypt: config.proxy.letsencrypt_on_nginx.clone(),
            static_root: config.proxy.static_root_on_nginx.clone(),
            conf_dir: config.proxy.conf_dir_on_nginx.clone(),
        };
        Self {
            inner: Arc::new(Inner {
                apps,
                orchestrator,
                namespace: config.namespace.clone(),
                files,
                nginx,
                proxy: config.proxy.clone(),
                queue: Mutex::new(ReloadQueue::default()),
                passes: AtomicU64::new(0),
            }),
            retry: RetryPolicy::from_config(&config.docker),
        }
    }

    /// Replace the retry policy used to find the nginx container.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Path of the generated per-app config (`{namespace}.conf`).
    pub fn apps_config_path(&self) -> PathBuf {
        crate::swap::config_path(&self.inner.files.apps_base)
    }

    pub fn root_config_path(&self) -> PathBuf {
        crate::swap::config_path(&self.inner.files.root_base)
    }

    pub fn base_config_path(&self) -> PathBuf {
        self.inner.files.base_conf.clone()
    }

    /// Number of regeneration passes completed successfully.
    pub fn passes(&self) -> u64 {
        self.inner.passes.load(Ordering::SeqCst)
    }

    /// Regenerate every config file from the current state, then signal
    /// nginx to reload unless `signal_proxy` is false.
    pub async fn re_populate_config(&self, signal_proxy: bool) -> ProxyResult<()> {
        let (tx, rx) = oneshot::channel();
        let start_pass = {
            let mut queue = self.inner.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.waiters.push(tx);
            if queue.in_progress {
                debug!("nginx reload already in progress, queued");
                false
            } else {
                queue.in_progress = true;
                true
            }
        };
        if start_pass {
            let this = self.clone();
            tokio::spawn(async move { this.drain_queue().await });
        }

        rx.await
            .map_err(|_| ProxyError::Generic("nginx reload queue was dropped".to_string()))?
            .map_err(ProxyError::Pass)?;

        if signal_proxy {
            self.send_reload_signal().await?;
        }
        Ok(())
    }

    /// Send `HUP` to the nginx container.
    pub async fn send_reload_signal(&self) -> ProxyResult<()> {
        debug!("sending reload signal");
        retry::send_single_container_hup(
            self.inner.orchestrator.as_ref(),
            &self.inner.proxy.service_name,
            self.retry,
        )
        .await?;
        Ok(())
    }

    async fn drain_queue(&self) {
        loop {
            let batch = {
                let mut queue = self.inner.queue.lock().unwrap_or_else(PoisonError::into_inner);
                if queue.waiters.is_empty() {
                    queue.in_progress = false;
                    return;
                }
                std::mem::take(&mut queue.waiters)
            };

            debug!(waiters = batch.len(), "locking nginx configuration reloading");
            let outcome = match self.regenerate().await {
                Ok(()) => {
                    self.inner.passes.fetch_add(1, Ordering::SeqCst);
                    debug!("nginx configuration regenerated, unlocking");
                    Ok(())
                }
                Err(e) => {
                    error!(error = %e, "nginx configuration regeneration failed, unlocking");
                    Err(e.to_failure())
                }
            };
            for waiter in batch {
                // The caller may have given up waiting.
                let _ = waiter.send(outcome.clone());
            }
        }
    }

    async fn regenerate(&self) -> ProxyResult<()> {
        let settings = self.inner.apps.store().get_settings()?;
        let apps = self.inner.apps.get_apps()?;
        let mut servers =
            routes::server_list(&apps, &settings, &self.inner.namespace, &self.inner.nginx);

        let mut renderer = ServerRenderer::new();
        let mut content = String::new();
        for server in &mut servers {
            if !server.http_basic_auth.is_empty() {
                let file_name = format!(
                    "{}-{}.auth",
                    self.inner.namespace, server.public_domain
                );
                let host_path = self
                    .inner
                    .files
                    .apps_base
                    .with_file_name(&file_name);
                if let Some(dir) = host_path.parent() {
                    tokio::fs::create_dir_all(dir).await?;
                }
                tokio::fs::write(&host_path, &server.http_basic_auth).await?;
                server.http_basic_auth_path =
                    Some(format!("{}/{file_name}", self.inner.nginx.conf_dir));
            }
            content.push_str(&renderer.render(server)?);
        }

        swap_config(&self.inner.files.apps_base, &content).await?;
        self.write_base_config(&settings).await?;
        self.write_root_config(&settings).await?;
        info!(servers = servers.len(), "load balancer config regenerated");
        Ok(())
    }

    async fn dhparams_path_on_nginx(&self) -> String {
        match tokio::fs::read(&self.inner.files.dhparams_on_host).await {
            Ok(content) if content.len() > MIN_DHPARAMS_LEN => format!(
                "{}/{}",
                self.inner.proxy.shared_on_nginx, self.inner.proxy.dhparam_file_name
            ),
            _ => String::new(),
        }
    }

    async fn write_base_config(&self, settings: &ClusterSettings) -> ProxyResult<()> {
        let template = settings
            .custom_base_nginx_template
            .as_deref()
            .unwrap_or(BASE_TEMPLATE);
        let context = json!({
            "base": { "dhparams_file_path": self.dhparams_path_on_nginx().await }
        });
        let content = render::render_one(template, &context)?;
        if let Some(dir) = self.inner.files.base_conf.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&self.inner.files.base_conf, content).await?;
        Ok(())
    }

    async fn write_root_config(&self, settings: &ClusterSettings) -> ProxyResult<()> {
        let root = routes::root_domain(settings);
        let proxy = &self.inner.proxy;
        let nginx = &self.inner.nginx;
        let control_domain = format!("{}.{root}", proxy.control_subdomain);
        let registry_domain = format!("{}.{root}", proxy.registry_subdomain);

        let context = json!({
            "fake": {
                "crt_path": format!("{}/nginx.crt", proxy.fake_certs_on_nginx),
                "key_path": format!("{}/nginx.key", proxy.fake_certs_on_nginx),
            },
            "control": {
                "crt_path": nginx.cert_path(&control_domain),
                "key_path": nginx.key_path(&control_domain),
                "has_root_ssl": settings.has_root_ssl,
                "service_name": proxy.control_service_name,
                "domain": control_domain,
                "service_exposed_port": proxy.control_port,
                "default_html_dir": nginx.default_html_dir(),
                "static_web_root": nginx.domain_web_root(&control_domain),
            },
            "registry": {
                "crt_path": nginx.cert_path(&registry_domain),
                "key_path": nginx.key_path(&registry_domain),
                "has_root_ssl": settings.has_registry_ssl,
                "domain": registry_domain,
                "static_web_root": nginx.domain_web_root(&registry_domain),
            },
        });
        let template = settings
            .custom_root_nginx_template
            .as_deref()
            .unwrap_or(ROOT_TEMPLATE);
        let content = render::render_one(template, &context)?;
        swap_config(&self.inner.files.root_base, &content).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{ApiStatus, HttpAuth};
    use keel_docker::{MemoryOrchestrator, ServiceCreate};
    use keel_state::{AppUpdate, StateStore};

    struct Fixture {
        _root: tempfile::TempDir,
        apps: AppsDataStore,
        orch: MemoryOrchestrator,
        lb: LoadBalancerReconciler,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let mut config = KeelConfig::default();
        config.paths.root = root.path().to_path_buf();
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_settings(&ClusterSettings {
                root_domain: "apps.example.com".into(),
                ..Default::default()
            })
            .unwrap();
        let apps = AppsDataStore::new(store, &config);
        let orch = MemoryOrchestrator::new();
        let lb = LoadBalancerReconciler::new(&config, apps.clone(), Arc::new(orch.clone()))
            .with_retry(RetryPolicy::immediate(0));
        Fixture {
            _root: root,
            apps,
            orch,
            lb,
        }
    }

    fn read(path: PathBuf) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[tokio::test]
    async fn test_custom_domain_gets_server_block() {
        let fx = fixture();
        fx.apps.register_app("api", false).unwrap();
        fx.apps.add_custom_domain("api", "x.example.com").unwrap();

        fx.lb.re_populate_config(false).await.unwrap();

        let conf = read(fx.lb.apps_config_path());
        assert!(conf.contains("server_name api.apps.example.com;"));
        assert!(conf.contains("server_name x.example.com;"));
        assert!(conf.contains("set $upstream http://srv-keel--api:80;"));

        let root = read(fx.lb.root_config_path());
        assert!(root.contains("server_name keel.apps.example.com;"));
        assert!(root.contains("/etc/nginx/fake-certs/nginx.crt"));
        assert!(read(fx.lb.base_config_path()).contains("include /etc/nginx/conf.d/*.conf;"));
    }

    #[tokio::test]
    async fn test_same_state_renders_identically() {
        let fx = fixture();
        fx.apps.register_app("api", false).unwrap();
        fx.apps.register_app("web", false).unwrap();

        fx.lb.re_populate_config(false).await.unwrap();
        let first = read(fx.lb.apps_config_path());
        fx.lb.re_populate_config(false).await.unwrap();
        assert_eq!(read(fx.lb.apps_config_path()), first);
        assert_eq!(fx.lb.passes(), 2);
    }

    #[tokio::test]
    async fn test_reload_signal_hits_nginx_container() {
        let fx = fixture();
        fx.orch
            .create_service(&ServiceCreate::new("keel-nginx", "nginx:1"))
            .await
            .unwrap();

        fx.lb.re_populate_config(true).await.unwrap();
        assert_eq!(
            fx.orch.kills(),
            vec![("container-keel-nginx".to_string(), "HUP".to_string())]
        );

        fx.lb.re_populate_config(false).await.unwrap();
        assert_eq!(fx.orch.kills().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_all_resolve() {
        let fx = fixture();
        fx.apps.register_app("api", false).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lb = fx.lb.clone();
            handles.push(tokio::spawn(async move { lb.re_populate_config(false).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(read(fx.lb.apps_config_path()).contains("srv-keel--api"));
    }

    #[tokio::test]
    async fn test_requests_during_pass_share_one_follow_up_pass() {
        let fx = fixture();
        fx.apps.register_app("api", false).unwrap();

        // A pass is running: callers must queue instead of starting their own.
        fx.lb.inner.queue.lock().unwrap().in_progress = true;
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lb = fx.lb.clone();
            handles.push(tokio::spawn(async move { lb.re_populate_config(false).await }));
        }
        for _ in 0..1000 {
            if fx.lb.inner.queue.lock().unwrap().waiters.len() == 8 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(fx.lb.inner.queue.lock().unwrap().waiters.len(), 8);
        assert_eq!(fx.lb.passes(), 0);

        // The running pass finishes and picks up everything queued meanwhile.
        let lb = fx.lb.clone();
        tokio::spawn(async move { lb.drain_queue().await });
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(fx.lb.passes(), 1);
        assert!(!fx.lb.inner.queue.lock().unwrap().in_progress);
    }

    #[tokio::test]
    async fn test_failed_pass_leaves_config_and_unlocks() {
        let fx = fixture();
        fx.apps.register_app("api", false).unwrap();
        fx.lb.re_populate_config(false).await.unwrap();
        let good = read(fx.lb.apps_config_path());

        fx.apps
            .update_app_definition_in_db(
                "api",
                AppUpdate {
                    custom_nginx_config: Some("{% if s.has_ssl %}".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        let err = fx.lb.re_populate_config(false).await.unwrap_err();
        assert_eq!(err.status(), ApiStatus::Generic);
        assert_eq!(read(fx.lb.apps_config_path()), good);

        fx.apps
            .update_app_definition_in_db("api", AppUpdate::default())
            .unwrap();
        fx.lb.re_populate_config(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_basic_auth_file_written() {
        let fx = fixture();
        fx.apps.register_app("api", false).unwrap();
        fx.apps
            .update_app_definition_in_db(
                "api",
                AppUpdate {
                    http_auth: Some(HttpAuth {
                        user: "bob".into(),
                        password_hashed: "$apr1$abc".into(),
                    }),
                    ..Default::default()
                },
            )
            .unwrap();

        fx.lb.re_populate_config(false).await.unwrap();
        let conf = read(fx.lb.apps_config_path());
        assert!(conf.contains(
            "auth_basic_user_file /etc/nginx/conf.d/keel-api.apps.example.com.auth;"
        ));
        let auth_file = fx
            .lb
            .apps_config_path()
            .with_file_name("keel-api.apps.example.com.auth");
        assert_eq!(read(auth_file), "bob:$apr1$abc");
    }
}

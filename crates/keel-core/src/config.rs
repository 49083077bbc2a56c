//! keel.toml configuration parser.
//!
//! Every field has a default, so an empty file is a valid configuration.
//! Mutable cluster settings (root domain, SSL flags, default push registry)
//! are not part of this file; they live in the state store.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeelConfig {
    /// Prefix for service, image, volume and config names.
    pub namespace: String,
    pub paths: PathsConfig,
    pub build: BuildConfig,
    pub docker: DockerConfig,
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Host directory under which all generated files live.
    pub root: PathBuf,
    /// Directory holding the state database.
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Number of lines kept in each application's build log.
    pub log_size: usize,
    /// Maximum number of version entries kept per application.
    pub max_version_history: usize,
    /// Default location of the definition file inside the source tree.
    pub definition_path: String,
    /// Environment variable that receives the source revision.
    pub git_sha_env_var: String,
    /// Image used when a service is created before its first real update.
    pub placeholder_image: String,
    /// `max-size` option of the json-file log driver on created services.
    pub service_log_max_size: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub socket: PathBuf,
    pub overlay_network: String,
    /// Attempts when polling eventually-consistent task state.
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub prune_delay_ms: u64,
    pub dns_settle_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub service_name: String,
    pub image: String,
    pub control_subdomain: String,
    pub registry_subdomain: String,
    pub control_service_name: String,
    pub control_port: u16,
    pub http_port: u16,
    pub https_port: u16,
    pub letsencrypt_on_nginx: String,
    pub static_root_on_nginx: String,
    pub fake_certs_on_nginx: String,
    pub conf_dir_on_nginx: String,
    pub shared_on_nginx: String,
    pub dhparam_file_name: String,
}

impl Default for KeelConfig {
    fn default() -> Self {
        Self {
            namespace: "keel".to_string(),
            paths: PathsConfig::default(),
            build: BuildConfig::default(),
            docker: DockerConfig::default(),
            proxy: ProxyConfig::default(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/keel"),
            data_dir: PathBuf::from("/keel/data"),
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            log_size: 50,
            max_version_history: 50,
            definition_path: "./keel-definition".to_string(),
            git_sha_env_var: "KEEL_GIT_COMMIT_SHA".to_string(),
            placeholder_image: "keel/placeholder-app:latest".to_string(),
            service_log_max_size: "512m".to_string(),
        }
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket: PathBuf::from("/var/run/docker.sock"),
            overlay_network: "keel-overlay-network".to_string(),
            retry_count: 10,
            retry_delay_ms: 3000,
            prune_delay_ms: 5000,
            dns_settle_ms: 2000,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            service_name: "keel-nginx".to_string(),
            image: "nginx:1".to_string(),
            control_subdomain: "keel".to_string(),
            registry_subdomain: "registry".to_string(),
            control_service_name: "keel-keel".to_string(),
            control_port: 3000,
            http_port: 80,
            https_port: 443,
            letsencrypt_on_nginx: "/etc/letsencrypt".to_string(),
            static_root_on_nginx: "/usr/share/nginx/html".to_string(),
            fake_certs_on_nginx: "/etc/nginx/fake-certs".to_string(),
            conf_dir_on_nginx: "/etc/nginx/conf.d".to_string(),
            shared_on_nginx: "/nginx-shared".to_string(),
            dhparam_file_name: "dhparam.pem".to_string(),
        }
    }
}

impl PathsConfig {
    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("temp")
    }

    /// Base directory for per-build working directories.
    pub fn raw_source_base(&self) -> PathBuf {
        self.temp_dir().join("image_raw")
    }

    pub fn generated_dir(&self) -> PathBuf {
        self.root.join("generated")
    }

    pub fn nginx_conf_dir(&self) -> PathBuf {
        self.generated_dir().join("nginx").join("conf.d")
    }

    pub fn base_nginx_conf(&self) -> PathBuf {
        self.generated_dir().join("nginx").join("nginx.conf")
    }

    /// Base path (without extension) of the root routing config.
    pub fn root_nginx_conf_base(&self) -> PathBuf {
        self.nginx_conf_dir().join("keel-root")
    }

    pub fn nginx_shared_dir(&self) -> PathBuf {
        self.generated_dir().join("nginx").join("shared")
    }

    pub fn fake_certs_dir(&self) -> PathBuf {
        self.generated_dir().join("nginx").join("fake-certs-self-signed")
    }

    pub fn static_files_dir(&self) -> PathBuf {
        self.generated_dir().join("static")
    }

    pub fn letsencrypt_dir(&self) -> PathBuf {
        self.root.join("letsencrypt").join("etc")
    }

    pub fn state_db(&self) -> PathBuf {
        self.data_dir.join("keel.redb")
    }
}

impl DockerConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn prune_delay(&self) -> Duration {
        Duration::from_millis(self.prune_delay_ms)
    }

    pub fn dns_settle(&self) -> Duration {
        Duration::from_millis(self.dns_settle_ms)
    }
}

impl KeelConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: KeelConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject settings the rest of the system cannot honor.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.namespace.is_empty() || self.namespace.contains("--") {
            anyhow::bail!("namespace must be non-empty and must not contain \"--\"");
        }
        // Truncation keeps max_version_history - 1 entries; with fewer than
        // one survivor the next version number could be reused.
        if self.build.max_version_history < 2 {
            anyhow::bail!(
                "build.max_version_history must be at least 2 (got {})",
                self.build.max_version_history
            );
        }
        if self.build.log_size == 0 {
            anyhow::bail!("build.log_size must be at least 1");
        }
        if self.build.definition_path.trim().is_empty() {
            anyhow::bail!("build.definition_path must not be empty");
        }
        Ok(())
    }
}

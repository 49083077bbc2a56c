//! Shared types used across keel crates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::source::RepoInfo;

/// Persisted record of a deployable application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub has_persistent_data: bool,
    pub instance_count: u32,
    /// Location of the definition file inside the source tree.
    pub definition_path: String,
    /// Version whose image the service currently runs; 0 before the first deploy.
    pub deployed_version: u32,
    pub versions: Vec<AppVersion>,
    pub networks: Vec<String>,
    pub env_vars: Vec<EnvVar>,
    pub volumes: Vec<VolumeMount>,
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Node the service is pinned to. Required for persistent-data apps.
    pub node_id: Option<String>,
    pub not_expose_as_web_app: bool,
    pub container_http_port: Option<u16>,
    pub custom_domains: Vec<CustomDomain>,
    pub has_default_subdomain_ssl: bool,
    pub force_ssl: bool,
    pub websocket_support: bool,
    pub redirect_domain: Option<String>,
    pub http_auth: Option<HttpAuth>,
    pub custom_nginx_config: Option<String>,
    /// Name of a registered pre-deploy hook.
    pub pre_deploy_hook: Option<String>,
    /// JSON or YAML object deep-merged over the generated service spec.
    pub service_update_override: Option<String>,
    pub update_order: UpdateOrder,
    pub repo_info: Option<RepoInfo>,
    pub deploy_token: DeployTokenConfig,
}

impl AppDefinition {
    /// Fresh record for a newly registered application.
    pub fn new(
        name: &str,
        has_persistent_data: bool,
        overlay_network: &str,
        definition_path: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            has_persistent_data,
            instance_count: 1,
            definition_path: definition_path.to_string(),
            deployed_version: 0,
            versions: Vec::new(),
            networks: vec![overlay_network.to_string()],
            env_vars: Vec::new(),
            volumes: Vec::new(),
            ports: Vec::new(),
            tags: Vec::new(),
            node_id: None,
            not_expose_as_web_app: false,
            container_http_port: None,
            custom_domains: Vec::new(),
            has_default_subdomain_ssl: false,
            force_ssl: false,
            websocket_support: false,
            redirect_domain: None,
            http_auth: None,
            custom_nginx_config: None,
            pre_deploy_hook: None,
            service_update_override: None,
            update_order: UpdateOrder::Auto,
            repo_info: None,
            deploy_token: DeployTokenConfig::default(),
        }
    }

    pub fn version(&self, version: u32) -> Option<&AppVersion> {
        self.versions.iter().find(|v| v.version == version)
    }

    pub fn deployed_image(&self) -> Option<&str> {
        self.version(self.deployed_version)
            .and_then(|v| v.image_name.as_deref())
    }

    pub fn has_ssl_domain(&self) -> bool {
        self.has_default_subdomain_ssl || self.custom_domains.iter().any(|d| d.has_ssl)
    }
}

/// One entry of an application's version history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppVersion {
    pub version: u32,
    pub image_name: Option<String>,
    pub source_revision: Option<String>,
    /// Unix epoch seconds at creation.
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A container mount, either a named volume or a host bind path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub container_path: String,
    pub volume_name: Option<String>,
    pub host_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
    /// Pinned protocol (`tcp` or `udp`). Unpinned ports publish both.
    pub protocol: Option<String>,
    /// `ingress` or `host`.
    pub publish_mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomDomain {
    pub public_domain: String,
    pub has_ssl: bool,
}

/// HTTP basic auth. The password is stored already hashed in an
/// nginx-compatible format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpAuth {
    pub user: String,
    pub password_hashed: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployTokenConfig {
    pub enabled: bool,
    pub token: Option<String>,
}

/// Update ordering for rolling service updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateOrder {
    /// Stop-first when the service mounts anything, start-first otherwise.
    #[default]
    Auto,
    StopFirst,
    StartFirst,
}

impl FromStr for UpdateOrder {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(UpdateOrder::Auto),
            "stop-first" => Ok(UpdateOrder::StopFirst),
            "start-first" => Ok(UpdateOrder::StartFirst),
            other => Err(CoreError::InvalidUpdateOrder(other.to_string())),
        }
    }
}

impl fmt::Display for UpdateOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpdateOrder::Auto => "auto",
            UpdateOrder::StopFirst => "stop-first",
            UpdateOrder::StartFirst => "start-first",
        };
        f.write_str(s)
    }
}

/// Result of a successful image build or pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltImage {
    pub image_name: String,
    pub source_revision: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
    Remote,
    Local,
}

/// A container registry keel can pull from or push to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryInfo {
    pub id: String,
    pub user: String,
    pub password: String,
    /// Domain without scheme, optionally with port.
    pub domain: String,
    pub image_prefix: String,
    pub kind: RegistryKind,
}

/// Mutable cluster-wide settings kept in the state store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSettings {
    pub root_domain: String,
    pub has_root_ssl: bool,
    pub has_registry_ssl: bool,
    pub default_push_registry: Option<String>,
    pub default_app_nginx_template: Option<String>,
    pub custom_base_nginx_template: Option<String>,
    pub custom_root_nginx_template: Option<String>,
}

/// Build status snapshot returned to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStatus {
    pub is_app_building: bool,
    pub logs: BuildLogLines,
    pub is_build_failed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildLogLines {
    pub lines: Vec<String>,
    /// Line number of `lines[0]`. Starts negative and grows by one per log call.
    pub first_line_number: i64,
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_order_parse() {
        assert_eq!("auto".parse::<UpdateOrder>().unwrap(), UpdateOrder::Auto);
        assert_eq!(
            "stop-first".parse::<UpdateOrder>().unwrap(),
            UpdateOrder::StopFirst
        );
        assert!("rolling".parse::<UpdateOrder>().is_err());
        assert_eq!(UpdateOrder::StartFirst.to_string(), "start-first");
    }

    #[test]
    fn test_update_order_serde_kebab() {
        let json = serde_json::to_string(&UpdateOrder::StopFirst).unwrap();
        assert_eq!(json, "\"stop-first\"");
    }

    #[test]
    fn test_deployed_image_lookup() {
        let mut app =
            AppDefinition::new("api", false, "keel-overlay-network", "./keel-definition");
        assert_eq!(app.deployed_image(), None);
        app.versions.push(AppVersion {
            version: 0,
            image_name: Some("img-keel-api:0".into()),
            source_revision: None,
            timestamp: 1,
        });
        assert_eq!(app.deployed_image(), Some("img-keel-api:0"));
        assert_eq!(app.networks, vec!["keel-overlay-network".to_string()]);
    }

    #[test]
    fn test_has_ssl_domain() {
        let mut app = AppDefinition::new("api", false, "net", "./d");
        assert!(!app.has_ssl_domain());
        app.custom_domains.push(CustomDomain {
            public_domain: "x.example.com".into(),
            has_ssl: true,
        });
        assert!(app.has_ssl_domain());
    }
}

//! Registry credential selection for pulls, pushes and builds.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::types::RegistryInfo;

/// Address Docker Hub credentials must be keyed under in a build's registry config.
pub const DOCKER_HUB_INDEX: &str = "https://index.docker.io/v1/";

/// Credentials sent with image and service operations (`X-Registry-Auth`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
    pub serveraddress: String,
}

impl Default for RegistryAuth {
    /// Empty credentials naming the public registry.
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            serveraddress: "docker.io/v1".to_string(),
        }
    }
}

impl From<&RegistryInfo> for RegistryAuth {
    fn from(reg: &RegistryInfo) -> Self {
        Self {
            username: reg.user.clone(),
            password: reg.password.clone(),
            serveraddress: reg.domain.clone(),
        }
    }
}

/// Entry of the build-time registry config (`X-Registry-Config`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCredential {
    pub username: String,
    pub password: String,
}

fn is_docker_hub_domain(domain: &str) -> bool {
    domain.ends_with(".docker.io")
        || domain.ends_with(".docker.com")
        || domain == "docker.com"
        || domain == "docker.io"
}

/// Pick the credentials to use for `image`.
///
/// A registry whose `domain[/prefix]/` prefixes the image wins. Failing
/// that, images that look like Docker Hub references use the first Docker
/// Hub registry on file.
pub fn auth_for_image(registries: &[RegistryInfo], image: &str) -> Option<RegistryAuth> {
    for reg in registries {
        let prefix = if reg.image_prefix.is_empty() {
            format!("{}/", reg.domain)
        } else {
            format!("{}/{}/", reg.domain, reg.image_prefix)
        };
        if image.starts_with(&prefix) {
            return Some(RegistryAuth::from(reg));
        }
    }

    let segments: Vec<&str> = image.split('/').collect();
    let looks_like_hub = segments.len() <= 2 || is_docker_hub_domain(segments[0]);
    if looks_like_hub {
        return registries
            .iter()
            .find(|r| is_docker_hub_domain(&r.domain))
            .map(RegistryAuth::from);
    }
    None
}

/// Registry config for image builds, keyed by registry address.
pub fn registry_config(registries: &[RegistryInfo]) -> BTreeMap<String, RegistryCredential> {
    registries
        .iter()
        .map(|reg| {
            let key = if reg.domain.contains(".docker.io") {
                DOCKER_HUB_INDEX.to_string()
            } else {
                reg.domain.clone()
            };
            let cred = RegistryCredential {
                username: reg.user.clone(),
                password: reg.password.clone(),
            };
            (key, cred)
        })
        .collect()
}

/// Registry-qualified name an image is pushed under.
pub fn push_target(registry: &RegistryInfo, base_image: &str, version: u32) -> CoreResult<String> {
    if base_image.contains('/') || base_image.contains(':') {
        return Err(CoreError::Generic(format!(
            "Registry cannot push an image with an already qualified name: {base_image}"
        )));
    }
    let mut target = registry.domain.clone();
    if !registry.image_prefix.is_empty() {
        target.push('/');
        target.push_str(&registry.image_prefix);
    }
    Ok(format!("{target}/{base_image}:{version}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RegistryKind;

    fn reg(id: &str, domain: &str, prefix: &str) -> RegistryInfo {
        RegistryInfo {
            id: id.into(),
            user: format!("{id}-user"),
            password: "pw".into(),
            domain: domain.into(),
            image_prefix: prefix.into(),
            kind: RegistryKind::Remote,
        }
    }

    #[test]
    fn test_prefix_match_wins() {
        let regs = vec![
            reg("hub", "registry-1.docker.io", ""),
            reg("priv", "reg.example.com", "team"),
        ];
        let auth = auth_for_image(&regs, "reg.example.com/team/api:3").unwrap();
        assert_eq!(auth.username, "priv-user");
        assert_eq!(auth.serveraddress, "reg.example.com");
    }

    #[test]
    fn test_short_names_fall_back_to_hub() {
        let regs = vec![
            reg("priv", "reg.example.com", ""),
            reg("hub", "registry-1.docker.io", ""),
        ];
        assert_eq!(auth_for_image(&regs, "nginx:1").unwrap().username, "hub-user");
        assert_eq!(auth_for_image(&regs, "acme/api").unwrap().username, "hub-user");
        assert!(auth_for_image(&regs, "ghcr.io/acme/api").is_none());
    }

    #[test]
    fn test_no_hub_registry_means_no_auth() {
        let regs = vec![reg("priv", "reg.example.com", "")];
        assert!(auth_for_image(&regs, "nginx").is_none());
    }

    #[test]
    fn test_registry_config_keys_hub_by_index() {
        let regs = vec![
            reg("hub", "registry-1.docker.io", ""),
            reg("priv", "reg.example.com", ""),
        ];
        let config = registry_config(&regs);
        assert!(config.contains_key(DOCKER_HUB_INDEX));
        assert!(config.contains_key("reg.example.com"));
    }

    #[test]
    fn test_push_target() {
        let r = reg("priv", "reg.example.com:5000", "team");
        assert_eq!(
            push_target(&r, "img-keel-api", 4).unwrap(),
            "reg.example.com:5000/team/img-keel-api:4"
        );
        assert!(push_target(&r, "img-keel-api:4", 4).is_err());
    }
}

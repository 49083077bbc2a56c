//! Naming rules for applications, volumes, services and custom domains.

use std::path::{Component, Path};

use regex::Regex;

use crate::error::{CoreError, CoreResult};

const RESERVED_NAMES: &[&str] = &["captain", "registry", "keel"];

/// Whether `name` is usable as an application or volume name.
///
/// Names become DNS labels and service names, so they are restricted to
/// lowercase letters, digits and single hyphens, starting with a letter.
pub fn is_name_allowed(name: &str) -> bool {
    let formatting_ok = !name.is_empty()
        && name.len() < 50
        && name.starts_with(|c: char| c.is_ascii_lowercase())
        && name.ends_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.contains("--");
    formatting_ok && !RESERVED_NAMES.contains(&name)
}

pub fn ensure_name_allowed(name: &str) -> CoreResult<()> {
    if is_name_allowed(name) {
        Ok(())
    } else {
        Err(CoreError::BadName(
            "App Name is not allowed. Only lowercase letters and single hyphens are allowed"
                .to_string(),
        ))
    }
}

/// Validate a custom domain for `app` under the cluster's `root_domain`.
///
/// A subdomain of the root domain is only accepted when it sits under the
/// app's own default subdomain (`*.{app}.{root}`).
pub fn check_custom_domain(domain: &str, app: &str, root_domain: &str) -> CoreResult<()> {
    let domain_chars =
        Regex::new(r"^[a-z0-9\-.]+$").map_err(|e| CoreError::Generic(e.to_string()))?;
    if domain.is_empty() || !domain_chars.is_match(domain) {
        return Err(CoreError::InvalidDomain(
            "Please use alphanumerical domains such as myapp.google123.ca".to_string(),
        ));
    }
    if domain.len() > 80 {
        return Err(CoreError::InvalidDomain(
            "Please use alphanumerical domains less than 80 characters in length.".to_string(),
        ));
    }
    if domain.contains("..") {
        return Err(CoreError::InvalidDomain(
            "You cannot have two consecutive periods \"..\" inside a domain name.".to_string(),
        ));
    }
    let dot_root = format!(".{root_domain}");
    let dot_app = format!(".{app}{dot_root}");
    if !domain.contains(&dot_app) && domain.ends_with(&dot_root) {
        return Err(CoreError::InvalidDomain(
            "Custom domain cannot be subdomain of root domain.".to_string(),
        ));
    }
    Ok(())
}

/// Orchestrator service name for an application.
pub fn service_name(namespace: &str, app: &str) -> String {
    format!("srv-{namespace}--{app}")
}

/// Cluster-level name of a named volume owned by an application.
pub fn volume_name(namespace: &str, volume: &str) -> String {
    format!("{namespace}--{volume}")
}

/// Local image repository name for an application.
pub fn image_name(namespace: &str, app: &str) -> String {
    format!("img-{namespace}-{app}")
}

/// Strip a leading `http://` or `https://`.
pub fn remove_http_https(input: &str) -> &str {
    let trimmed = input.trim();
    trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed)
}

/// Whether `path` stays inside the directory it is joined to: relative,
/// with only normal and `.` components.
pub fn is_contained_relative_path(path: &str) -> bool {
    !path.is_empty()
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

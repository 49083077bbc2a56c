//! Route derivation: one server entry per public domain of every exposed app.

use keel_core::names::service_name;
use keel_core::{AppDefinition, ClusterSettings};
use serde::Serialize;

/// Used for default subdomains until a root domain has been set.
pub const DEFAULT_ROOT_DOMAIN: &str = "keel.localhost";

const DEFAULT_CONTAINER_HTTP_PORT: u16 = 80;

/// Paths as seen from inside the nginx container.
#[derive(Debug, Clone)]
pub struct NginxPaths {
    pub letsencrypt: String,
    pub static_root: String,
    pub conf_dir: String,
}

impl NginxPaths {
    pub fn cert_path(&self, domain: &str) -> String {
        format!("{}/live/{domain}/fullchain.pem", self.letsencrypt)
    }

    pub fn key_path(&self, domain: &str) -> String {
        format!("{}/live/{domain}/privkey.pem", self.letsencrypt)
    }

    /// Web root for ACME challenges and per-domain static files.
    pub fn domain_web_root(&self, domain: &str) -> String {
        format!("{}/domains/{domain}", self.static_root)
    }

    pub fn default_html_dir(&self) -> String {
        format!("{}/default", self.static_root)
    }
}

/// A rendered-to-be nginx server block. Exposed to templates as `s`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerEntry {
    pub app: String,
    pub public_domain: String,
    pub local_domain: String,
    pub container_http_port: u16,
    pub has_ssl: bool,
    pub force_ssl: bool,
    pub websocket_support: bool,
    pub crt_path: Option<String>,
    pub key_path: Option<String>,
    pub static_web_root: String,
    pub custom_error_pages_dir: String,
    /// `user:hash` line for the auth file; empty when auth is off.
    #[serde(skip)]
    pub http_basic_auth: String,
    /// Auth file location inside the nginx container, set once written.
    pub http_basic_auth_path: Option<String>,
    pub redirect_to_path: Option<String>,
    /// Template this entry renders through.
    #[serde(skip)]
    pub template: Option<String>,
}

pub fn root_domain(settings: &ClusterSettings) -> &str {
    if settings.root_domain.is_empty() {
        DEFAULT_ROOT_DOMAIN
    } else {
        &settings.root_domain
    }
}

/// Server entries for `apps`, in app order: default subdomain first, then
/// each custom domain.
pub fn server_list(
    apps: &[AppDefinition],
    settings: &ClusterSettings,
    namespace: &str,
    paths: &NginxPaths,
) -> Vec<ServerEntry> {
    let root = root_domain(settings);
    let mut servers = Vec::new();

    for app in apps.iter().filter(|a| !a.not_expose_as_web_app) {
        let http_basic_auth = app
            .http_auth
            .as_ref()
            .filter(|a| !a.password_hashed.is_empty())
            .map(|a| format!("{}:{}", a.user, a.password_hashed))
            .unwrap_or_default();
        let template = app
            .custom_nginx_config
            .clone()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| settings.default_app_nginx_template.clone());

        let default_domain = format!("{}.{root}", app.name);
        let domains = std::iter::once((
            default_domain,
            settings.has_root_ssl && app.has_default_subdomain_ssl,
        ))
        .chain(
            app.custom_domains
                .iter()
                .map(|d| (d.public_domain.clone(), d.has_ssl)),
        );

        for (public_domain, has_ssl) in domains {
            let redirect_to_path = app
                .redirect_domain
                .as_deref()
                .filter(|r| !r.is_empty() && *r != public_domain)
                .map(|r| format!("http://{r}"));
            servers.push(ServerEntry {
                app: app.name.clone(),
                local_domain: service_name(namespace, &app.name),
                container_http_port: app
                    .container_http_port
                    .unwrap_or(DEFAULT_CONTAINER_HTTP_PORT),
                has_ssl,
                force_ssl: app.force_ssl,
                websocket_support: app.websocket_support,
                crt_path: has_ssl.then(|| paths.cert_path(&public_domain)),
                key_path: has_ssl.then(|| paths.key_path(&public_domain)),
                static_web_root: paths.domain_web_root(&public_domain),
                custom_error_pages_dir: paths.default_html_dir(),
                http_basic_auth: http_basic_auth.clone(),
                http_basic_auth_path: None,
                redirect_to_path,
                template: template.clone(),
                public_domain,
            });
        }
    }
    servers
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{CustomDomain, HttpAuth};

    fn paths() -> NginxPaths {
        NginxPaths {
            letsencrypt: "/etc/letsencrypt".into(),
            static_root: "/usr/share/nginx/html".into(),
            conf_dir: "/etc/nginx/conf.d".into(),
        }
    }

    fn app(name: &str) -> AppDefinition {
        AppDefinition::new(name, false, "net", "./keel-definition")
    }

    #[test]
    fn test_default_and_custom_domains() {
        let mut api = app("api");
        api.custom_domains.push(CustomDomain {
            public_domain: "x.example.com".into(),
            has_ssl: true,
        });
        api.container_http_port = Some(3000);
        let settings = ClusterSettings {
            root_domain: "apps.example.com".into(),
            ..Default::default()
        };

        let servers = server_list(&[api], &settings, "keel", &paths());
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].public_domain, "api.apps.example.com");
        assert!(!servers[0].has_ssl);
        assert_eq!(servers[0].crt_path, None);
        assert_eq!(servers[1].public_domain, "x.example.com");
        assert_eq!(servers[1].local_domain, "srv-keel--api");
        assert_eq!(servers[1].container_http_port, 3000);
        assert_eq!(
            servers[1].crt_path.as_deref(),
            Some("/etc/letsencrypt/live/x.example.com/fullchain.pem")
        );
        assert_eq!(
            servers[1].static_web_root,
            "/usr/share/nginx/html/domains/x.example.com"
        );
    }

    #[test]
    fn test_default_subdomain_ssl_needs_root_ssl() {
        let mut api = app("api");
        api.has_default_subdomain_ssl = true;
        let mut settings = ClusterSettings::default();
        assert!(!server_list(&[api.clone()], &settings, "keel", &paths())[0].has_ssl);
        settings.has_root_ssl = true;
        let servers = server_list(&[api], &settings, "keel", &paths());
        assert!(servers[0].has_ssl);
        assert_eq!(servers[0].public_domain, "api.keel.localhost");
    }

    #[test]
    fn test_hidden_apps_and_redirects() {
        let mut worker = app("worker");
        worker.not_expose_as_web_app = true;
        let mut web = app("web");
        web.redirect_domain = Some("www.example.com".into());
        web.custom_domains.push(CustomDomain {
            public_domain: "www.example.com".into(),
            has_ssl: false,
        });
        web.http_auth = Some(HttpAuth {
            user: "bob".into(),
            password_hashed: "$apr1$x".into(),
        });

        let servers = server_list(&[worker, web], &ClusterSettings::default(), "keel", &paths());
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].redirect_to_path.as_deref(), Some("http://www.example.com"));
        assert_eq!(servers[1].redirect_to_path, None);
        assert_eq!(servers[1].http_basic_auth, "bob:$apr1$x");
    }

    #[test]
    fn test_template_precedence() {
        let mut custom = app("custom");
        custom.custom_nginx_config = Some("app template".into());
        let plain = app("plain");
        let settings = ClusterSettings {
            default_app_nginx_template: Some("cluster template".into()),
            ..Default::default()
        };
        let servers = server_list(&[custom, plain], &settings, "keel", &paths());
        assert_eq!(servers[0].template.as_deref(), Some("app template"));
        assert_eq!(servers[1].template.as_deref(), Some("cluster template"));
    }
}

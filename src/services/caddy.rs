//! Reverse proxy configuration.
//!
//! The proxy's live configuration is a disposable artifact: [`sync`]
//! recomputes the complete routing + TLS config from the domain and
//! deployment records and replaces whatever the proxy is currently serving
//! in a single admin-API call. Nothing ever patches the live config in
//! place, which keeps a resync idempotent.
//!
//! [`sync`]: CaddyConfigurator::sync

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::db::{DeploymentRepository, DomainRepository, SettingsRepository};
use crate::models::{DomainKind, DEFAULT_REDIRECT_CODE};

pub const ACME_STAGING_CA: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

const LIVENESS_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum CaddyError {
    Store(String),
    Http(String),
    Api { status: u16, body: String },
}

impl std::fmt::Display for CaddyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(msg) => write!(f, "Store error: {}", msg),
            Self::Http(msg) => write!(f, "Caddy admin request failed: {}", msg),
            Self::Api { status, body } => {
                write!(f, "Caddy admin error {}: {}", status, body)
            }
        }
    }
}

impl std::error::Error for CaddyError {}

/// Where a routed hostname points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// The control plane's own dashboard.
    Admin,
    /// A running deployment's published host port.
    Proxy { host_port: u16 },
    Redirect { target: String, code: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRoute {
    pub hostname: String,
    pub target: RouteTarget,
}

/// Pure config synthesis: identical inputs produce byte-identical JSON.
pub fn build_config(routes: &[DomainRoute], email: &str, staging: bool, admin_port: u16) -> Value {
    let mut https_routes: Vec<Value> = Vec::new();
    let mut subjects: Vec<Value> = Vec::new();

    for route in routes {
        subjects.push(Value::String(route.hostname.clone()));

        let handle = match &route.target {
            RouteTarget::Admin => json!({
                "handler": "reverse_proxy",
                "upstreams": [{ "dial": format!("localhost:{}", admin_port) }],
            }),
            RouteTarget::Proxy { host_port } => json!({
                "handler": "reverse_proxy",
                "upstreams": [{ "dial": format!("localhost:{}", host_port) }],
            }),
            RouteTarget::Redirect { target, code } => json!({
                "handler": "static_response",
                "status_code": code,
                "headers": {
                    "Location": [format!("https://{}{{http.request.uri}}", target)],
                },
            }),
        };

        https_routes.push(json!({
            "match": [{ "host": [route.hostname.clone()] }],
            "handle": [handle],
        }));
    }

    let issuer = if staging {
        json!({ "module": "acme", "email": email, "ca": ACME_STAGING_CA })
    } else {
        json!({ "module": "acme", "email": email })
    };

    json!({
        "apps": {
            "http": {
                "servers": {
                    "https": {
                        "listen": [":443"],
                        "routes": https_routes,
                    },
                    "http": {
                        "listen": [":80"],
                        "routes": [
                            {
                                "handle": [{
                                    "handler": "static_response",
                                    "status_code": 301,
                                    "headers": {
                                        "Location": ["https://{http.request.host}{http.request.uri}"],
                                    },
                                }],
                            },
                        ],
                    },
                },
            },
            "tls": {
                "automation": {
                    "policies": [
                        {
                            "subjects": subjects,
                            "issuers": [issuer],
                        },
                    ],
                },
            },
        },
    })
}

pub struct CaddyConfigurator {
    deployments: Arc<dyn DeploymentRepository>,
    domains: Arc<dyn DomainRepository>,
    settings: Arc<dyn SettingsRepository>,
    http: reqwest::Client,
    admin_url: String,
    admin_port: u16,
}

impl CaddyConfigurator {
    pub fn new(
        deployments: Arc<dyn DeploymentRepository>,
        domains: Arc<dyn DomainRepository>,
        settings: Arc<dyn SettingsRepository>,
        admin_url: impl Into<String>,
        admin_port: u16,
    ) -> Self {
        Self {
            deployments,
            domains,
            settings,
            http: reqwest::Client::new(),
            admin_url: admin_url.into().trim_end_matches('/').to_string(),
            admin_port,
        }
    }

    /// Whether the proxy's admin endpoint answers at all.
    pub async fn is_running(&self) -> bool {
        let url = format!("{}/config/", self.admin_url);
        match self.http.get(&url).timeout(LIVENESS_TIMEOUT).send().await {
            Ok(res) => res.status().is_success(),
            Err(_) => false,
        }
    }

    async fn setting(&self, key: &str) -> Result<Option<String>, CaddyError> {
        let value = self.settings.get(key).await.map_err(CaddyError::Store)?;
        Ok(value.filter(|v| !v.is_empty()))
    }

    /// Routes eligible right now: the admin UI's own domain plus every
    /// dns-verified domain whose service has a running deployment.
    async fn collect_routes(&self) -> Result<Vec<DomainRoute>, CaddyError> {
        let mut routes = Vec::new();

        if let Some(admin_domain) = self.setting("domain").await? {
            routes.push(DomainRoute {
                hostname: admin_domain,
                target: RouteTarget::Admin,
            });
        }

        for domain in self
            .domains
            .fetch_verified()
            .await
            .map_err(CaddyError::Store)?
        {
            // a domain is only routable while its service has a live version
            let running = self
                .deployments
                .fetch_running_for_service(&domain.service_id)
                .await
                .map_err(CaddyError::Store)?;
            let Some(live) = running.first() else {
                continue;
            };

            match domain.kind {
                DomainKind::Proxy => {
                    if let Some(host_port) = live.host_port {
                        routes.push(DomainRoute {
                            hostname: domain.hostname,
                            target: RouteTarget::Proxy { host_port },
                        });
                    }
                }
                DomainKind::Redirect => {
                    if let Some(target) = domain.redirect_target {
                        routes.push(DomainRoute {
                            hostname: domain.hostname,
                            target: RouteTarget::Redirect {
                                target,
                                code: domain.redirect_code.unwrap_or(DEFAULT_REDIRECT_CODE),
                            },
                        });
                    }
                }
            }
        }

        Ok(routes)
    }

    /// Recompute and fully replace the proxy's live configuration.
    #[tracing::instrument(name = "Sync caddy config", skip(self))]
    pub async fn sync(&self) -> Result<(), CaddyError> {
        let email = match self.setting("email").await? {
            Some(email) => email,
            None => {
                tracing::info!("No ACME email configured, skipping proxy sync");
                return Ok(());
            }
        };
        let staging = self
            .setting("ssl_staging")
            .await?
            .map(|v| v == "true")
            .unwrap_or(false);

        let routes = self.collect_routes().await?;
        if routes.is_empty() {
            tracing::info!("No routable domains, skipping proxy sync");
            return Ok(());
        }

        let config = build_config(&routes, &email, staging, self.admin_port);

        let url = format!("{}/load", self.admin_url);
        let res = self
            .http
            .post(&url)
            .json(&config)
            .send()
            .await
            .map_err(|err| CaddyError::Http(err.to_string()))?;

        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(CaddyError::Api { status, body });
        }

        tracing::info!(routes = routes.len(), "Caddy config synced");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_routes() -> Vec<DomainRoute> {
        vec![
            DomainRoute {
                hostname: "panel.example.com".into(),
                target: RouteTarget::Admin,
            },
            DomainRoute {
                hostname: "app.example.com".into(),
                target: RouteTarget::Proxy { host_port: 10004 },
            },
            DomainRoute {
                hostname: "old.example.com".into(),
                target: RouteTarget::Redirect {
                    target: "app.example.com".into(),
                    code: 307,
                },
            },
        ]
    }

    #[test]
    fn config_is_deterministic() {
        let a = build_config(&sample_routes(), "ops@example.com", false, 3000);
        let b = build_config(&sample_routes(), "ops@example.com", false, 3000);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn subjects_cover_every_hostname() {
        let config = build_config(&sample_routes(), "ops@example.com", false, 3000);
        let subjects = &config["apps"]["tls"]["automation"]["policies"][0]["subjects"];
        assert_eq!(
            subjects,
            &json!(["panel.example.com", "app.example.com", "old.example.com"])
        );
    }

    #[test]
    fn staging_flag_points_issuer_at_staging_ca() {
        let config = build_config(&sample_routes(), "ops@example.com", true, 3000);
        let issuer = &config["apps"]["tls"]["automation"]["policies"][0]["issuers"][0];
        assert_eq!(issuer["ca"], ACME_STAGING_CA);

        let config = build_config(&sample_routes(), "ops@example.com", false, 3000);
        let issuer = &config["apps"]["tls"]["automation"]["policies"][0]["issuers"][0];
        assert!(issuer.get("ca").is_none());
    }

    #[test]
    fn proxy_route_dials_host_port() {
        let config = build_config(&sample_routes(), "ops@example.com", false, 3000);
        let routes = config["apps"]["http"]["servers"]["https"]["routes"]
            .as_array()
            .unwrap();
        assert_eq!(routes.len(), 3);
        assert_eq!(
            routes[1]["handle"][0]["upstreams"][0]["dial"],
            "localhost:10004"
        );
        assert_eq!(routes[0]["handle"][0]["upstreams"][0]["dial"], "localhost:3000");
    }

    #[test]
    fn redirect_route_carries_location_and_code() {
        let config = build_config(&sample_routes(), "ops@example.com", false, 3000);
        let redirect = &config["apps"]["http"]["servers"]["https"]["routes"][2]["handle"][0];
        assert_eq!(redirect["status_code"], 307);
        assert_eq!(
            redirect["headers"]["Location"][0],
            "https://app.example.com{http.request.uri}"
        );
    }

    #[test]
    fn port_80_redirects_to_https() {
        let config = build_config(&sample_routes(), "ops@example.com", false, 3000);
        let http_route = &config["apps"]["http"]["servers"]["http"]["routes"][0]["handle"][0];
        assert_eq!(http_route["status_code"], 301);
        assert_eq!(
            http_route["headers"]["Location"][0],
            "https://{http.request.host}{http.request.uri}"
        );
    }
}

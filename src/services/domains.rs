//! Domain management: custom hostnames, DNS verification and the
//! auto-provisioned sslip.io system domains.

use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

use crate::configuration::Settings;
use crate::db::DomainRepository;
use crate::helpers::public_ip;
use crate::models::{Domain, DomainKind, Project, Service, TlsStatus};
use crate::services::caddy::CaddyConfigurator;

/// Suffix candidates tried when deriving a system hostname.
const SYSTEM_DOMAIN_ATTEMPTS: u32 = 10;

lazy_static! {
    static ref SLUG_RE: Regex = Regex::new(r"[^a-z0-9]+").expect("slug pattern compiles");
}

#[derive(Debug)]
pub enum DomainError {
    NotFound(String),
    /// The case-folded hostname is already taken.
    AlreadyExists(String),
    Validation(String),
    Store(String),
    /// The host's own public address could not be determined.
    PublicIp(String),
}

impl std::fmt::Display for DomainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(msg) => write!(f, "Domain not found: {}", msg),
            Self::AlreadyExists(hostname) => {
                write!(f, "Domain {} already exists", hostname)
            }
            Self::Validation(msg) => write!(f, "Invalid domain: {}", msg),
            Self::Store(msg) => write!(f, "Store error: {}", msg),
            Self::PublicIp(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for DomainError {}

#[derive(Debug, Clone)]
pub struct DomainInput {
    pub hostname: String,
    pub kind: DomainKind,
    pub redirect_target: Option<String>,
    pub redirect_code: Option<u16>,
}

impl DomainInput {
    pub fn proxy(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            kind: DomainKind::Proxy,
            redirect_target: None,
            redirect_code: None,
        }
    }

    pub fn redirect(hostname: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            kind: DomainKind::Redirect,
            redirect_target: Some(target.into()),
            redirect_code: None,
        }
    }
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct DomainUpdate {
    pub kind: Option<DomainKind>,
    pub redirect_target: Option<Option<String>>,
    pub redirect_code: Option<u16>,
    pub dns_verified: Option<bool>,
    pub tls_status: Option<TlsStatus>,
}

/// Outcome of a DNS check, polled by progress UIs.
#[derive(Debug, Clone, Serialize)]
pub struct DnsStatus {
    pub valid: bool,
    pub server_ip: String,
    pub domain_ip: Option<String>,
}

pub struct DomainService {
    domains: Arc<dyn DomainRepository>,
    caddy: Arc<CaddyConfigurator>,
    config: Arc<Settings>,
}

impl DomainService {
    pub fn new(
        domains: Arc<dyn DomainRepository>,
        caddy: Arc<CaddyConfigurator>,
        config: Arc<Settings>,
    ) -> Self {
        Self {
            domains,
            caddy,
            config,
        }
    }

    /// Add a hostname for a service. Hostnames are case-folded before the
    /// uniqueness check, so `App.Example.com` collides with
    /// `app.example.com`.
    pub async fn add_domain(
        &self,
        service_id: &str,
        input: DomainInput,
    ) -> Result<Domain, DomainError> {
        let hostname = input.hostname.trim().to_lowercase();
        if hostname.is_empty() {
            return Err(DomainError::Validation("hostname is empty".to_string()));
        }
        if input.kind == DomainKind::Redirect && input.redirect_target.is_none() {
            return Err(DomainError::Validation(
                "redirect domains need a target".to_string(),
            ));
        }

        if self
            .domains
            .fetch_by_hostname(&hostname)
            .await
            .map_err(DomainError::Store)?
            .is_some()
        {
            return Err(DomainError::AlreadyExists(hostname));
        }

        let mut domain = Domain::new(service_id, hostname, input.kind);
        if input.kind == DomainKind::Redirect {
            domain.redirect_target = input.redirect_target;
            domain.redirect_code = input.redirect_code.or(Some(crate::models::DEFAULT_REDIRECT_CODE));
        }

        self.domains.insert(domain).await.map_err(DomainError::Store)
    }

    pub async fn get_domain(&self, id: &str) -> Result<Option<Domain>, DomainError> {
        self.domains.fetch(id).await.map_err(DomainError::Store)
    }

    pub async fn get_domain_by_name(
        &self,
        hostname: &str,
    ) -> Result<Option<Domain>, DomainError> {
        self.domains
            .fetch_by_hostname(&hostname.to_lowercase())
            .await
            .map_err(DomainError::Store)
    }

    pub async fn list_for_service(&self, service_id: &str) -> Result<Vec<Domain>, DomainError> {
        self.domains
            .fetch_by_service(service_id)
            .await
            .map_err(DomainError::Store)
    }

    pub async fn update_domain(
        &self,
        id: &str,
        updates: DomainUpdate,
    ) -> Result<Domain, DomainError> {
        let mut domain = self
            .domains
            .fetch(id)
            .await
            .map_err(DomainError::Store)?
            .ok_or_else(|| DomainError::NotFound(id.to_string()))?;

        if let Some(kind) = updates.kind {
            domain.kind = kind;
        }
        if let Some(target) = updates.redirect_target {
            domain.redirect_target = target;
        }
        if let Some(code) = updates.redirect_code {
            domain.redirect_code = Some(code);
        }
        if let Some(verified) = updates.dns_verified {
            domain.dns_verified = verified;
        }
        if let Some(tls) = updates.tls_status {
            domain.tls_status = tls;
        }

        self.domains.update(domain).await.map_err(DomainError::Store)
    }

    /// Remove the domain and resync so the proxy stops routing it.
    pub async fn remove_domain(&self, id: &str) -> Result<(), DomainError> {
        self.domains.delete(id).await.map_err(DomainError::Store)?;
        if let Err(err) = self.caddy.sync().await {
            tracing::warn!(error = %err, "proxy resync after domain removal failed");
        }
        Ok(())
    }

    /// Compare the hostname's A records against this host's public address.
    /// Resolution failure yields an empty record set (valid=false); not
    /// knowing our own address is an error.
    pub async fn verify_domain_dns(&self, hostname: &str) -> Result<DnsStatus, DomainError> {
        let server_ip = public_ip::fetch_public_ip(&self.config.ip_echo_urls)
            .await
            .map_err(DomainError::PublicIp)?;
        let addresses = resolve_v4(hostname).await;

        Ok(DnsStatus {
            valid: addresses.contains(&server_ip),
            server_ip,
            domain_ip: addresses.into_iter().next(),
        })
    }

    /// DNS-check a stored domain; on first success mark it verified and
    /// resync the proxy (resync failure is logged, not surfaced).
    pub async fn verify_and_activate(&self, domain_id: &str) -> Result<DnsStatus, DomainError> {
        let domain = self
            .domains
            .fetch(domain_id)
            .await
            .map_err(DomainError::Store)?
            .ok_or_else(|| DomainError::NotFound(domain_id.to_string()))?;

        let status = self.verify_domain_dns(&domain.hostname).await?;

        if status.valid && !domain.dns_verified {
            self.update_domain(
                domain_id,
                DomainUpdate {
                    dns_verified: Some(true),
                    ..Default::default()
                },
            )
            .await?;
            if let Err(err) = self.caddy.sync().await {
                tracing::warn!(error = %err, "proxy resync after DNS verification failed");
            }
        }

        Ok(status)
    }

    /// Ensure the service has a wildcard-DNS system hostname. First deploy
    /// outside development lands here; development hosts get none. Returns
    /// the assigned domain, or `None` when nothing had to happen.
    pub async fn ensure_system_domain(
        &self,
        service: &Service,
        project: &Project,
    ) -> Result<Option<Domain>, DomainError> {
        if self.config.is_development() {
            return Ok(None);
        }

        let existing = self.list_for_service(&service.id).await?;
        if existing.iter().any(|d| d.system) {
            return Ok(None);
        }

        let domain = self.assign_system_domain(service, project).await?;
        if let Err(err) = self.caddy.sync().await {
            tracing::warn!(error = %err, "proxy resync after system domain assignment failed");
        }
        Ok(Some(domain))
    }

    /// Re-derive the system hostname after a service or project rename.
    pub async fn regenerate_system_domain(
        &self,
        service: &Service,
        project: &Project,
    ) -> Result<Option<Domain>, DomainError> {
        if self.config.is_development() {
            return Ok(None);
        }

        for domain in self.list_for_service(&service.id).await? {
            if domain.system {
                self.domains
                    .delete(&domain.id)
                    .await
                    .map_err(DomainError::Store)?;
            }
        }

        let domain = self.assign_system_domain(service, project).await?;
        if let Err(err) = self.caddy.sync().await {
            tracing::warn!(error = %err, "proxy resync after system domain regeneration failed");
        }
        Ok(Some(domain))
    }

    async fn assign_system_domain(
        &self,
        service: &Service,
        project: &Project,
    ) -> Result<Domain, DomainError> {
        let server_ip = public_ip::fetch_public_ip(&self.config.ip_echo_urls)
            .await
            .map_err(DomainError::PublicIp)?;
        let base = format!("{}-{}", slug(&service.name), slug(&project.name));

        for attempt in 0..SYSTEM_DOMAIN_ATTEMPTS {
            let hostname = if attempt == 0 {
                format!("{}.{}.sslip.io", base, server_ip)
            } else {
                format!("{}-{}.{}.sslip.io", base, attempt + 1, server_ip)
            };

            if self
                .domains
                .fetch_by_hostname(&hostname)
                .await
                .map_err(DomainError::Store)?
                .is_some()
            {
                continue;
            }

            // wildcard DNS resolves by construction, no user action needed
            let mut domain = Domain::new(&service.id, hostname, DomainKind::Proxy);
            domain.dns_verified = true;
            domain.system = true;
            let domain = self
                .domains
                .insert(domain)
                .await
                .map_err(DomainError::Store)?;
            tracing::info!(service = %service.id, hostname = %domain.hostname, "assigned system domain");
            return Ok(domain);
        }

        Err(DomainError::Validation(format!(
            "could not find a free system hostname for {}",
            base
        )))
    }
}

/// Resolve a hostname's IPv4 addresses through the system resolver.
/// Failures come back as an empty set.
async fn resolve_v4(hostname: &str) -> Vec<String> {
    match tokio::net::lookup_host((hostname, 0)).await {
        Ok(addrs) => addrs
            .filter(|addr| addr.is_ipv4())
            .map(|addr| addr.ip().to_string())
            .collect(),
        Err(err) => {
            tracing::debug!(hostname, error = %err, "DNS resolution failed");
            Vec::new()
        }
    }
}

/// Lowercase alphanumeric slug with single dashes, for hostname labels.
pub fn slug(input: &str) -> String {
    SLUG_RE
        .replace_all(&input.to_lowercase(), "-")
        .trim_matches('-')
        .to_string()
}

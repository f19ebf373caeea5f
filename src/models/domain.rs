use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainKind {
    Proxy,
    Redirect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsStatus {
    Pending,
    Active,
    Failed,
}

/// Default status code for redirect domains.
pub const DEFAULT_REDIRECT_CODE: u16 = 301;

// A hostname routed to a service. Hostnames are case-folded on write and
// globally unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domain {
    pub id: String,
    pub service_id: String,
    pub hostname: String,
    pub kind: DomainKind,
    pub redirect_target: Option<String>,
    pub redirect_code: Option<u16>,
    pub dns_verified: bool,
    pub tls_status: TlsStatus,
    pub system: bool,
    pub created_at: DateTime<Utc>,
}

impl Domain {
    pub fn new(
        service_id: impl Into<String>,
        hostname: impl Into<String>,
        kind: DomainKind,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            service_id: service_id.into(),
            hostname: hostname.into().to_lowercase(),
            kind,
            redirect_target: None,
            redirect_code: None,
            dns_verified: false,
            tls_status: TlsStatus::Pending,
            system: false,
            created_at: Utc::now(),
        }
    }
}

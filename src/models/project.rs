use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single KEY=VALUE pair. Order matters: env vars are written to `.env`
/// files and passed as build arguments in the order they were configured.
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

// A project groups services that share a docker network and a set of
// project-level env vars
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub env_vars: Vec<EnvVar>,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            env_vars: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

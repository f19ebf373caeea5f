use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a deployment attempt.
///
/// `pending → cloning|pulling → building (repo only) → deploying →
/// running | failed`. Running and failed are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Cloning,
    Pulling,
    Building,
    Deploying,
    Running,
    Failed,
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Running | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Cloning => "cloning",
            Self::Pulling => "pulling",
            Self::Building => "building",
            Self::Deploying => "deploying",
            Self::Running => "running",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// One attempt to materialize a service as a running container. Rows are
// created once per attempt and only removed by cascade with their service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub project_id: String,
    pub service_id: String,
    pub commit_sha: String,
    pub status: DeploymentStatus,
    pub container_id: Option<String>,
    pub host_port: Option<u16>,
    pub build_log: String,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Deployment {
    pub fn new(project_id: impl Into<String>, service_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            service_id: service_id.into(),
            commit_sha: "HEAD".to_string(),
            status: DeploymentStatus::Pending,
            container_id: None,
            host_port: None,
            build_log: String::new(),
            error_message: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }
}

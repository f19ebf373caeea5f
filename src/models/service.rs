use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::EnvVar;

/// Container port services listen on when none is configured.
pub const DEFAULT_CONTAINER_PORT: u16 = 8080;

/// How a service materializes into an image: built from a repository
/// checkout, or pulled as-is from a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "deploy_type", rename_all = "lowercase")]
pub enum DeploySpec {
    Repo {
        repo_url: String,
        branch: String,
        dockerfile_path: String,
    },
    Image {
        image_url: String,
    },
}

impl DeploySpec {
    pub fn is_repo(&self) -> bool {
        matches!(self, Self::Repo { .. })
    }

    pub fn is_image(&self) -> bool {
        matches!(self, Self::Image { .. })
    }
}

// A deployable unit within a project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub project_id: String,
    pub name: String,
    #[serde(flatten)]
    pub deploy: DeploySpec,
    pub env_vars: Vec<EnvVar>,
    pub container_port: Option<u16>,
    pub health_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Service {
    pub fn new(project_id: impl Into<String>, name: impl Into<String>, deploy: DeploySpec) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            name: name.into(),
            deploy,
            env_vars: Vec::new(),
            container_port: None,
            health_path: None,
            created_at: Utc::now(),
        }
    }
}

/// Merge project-level and service-level env vars. Project vars come first
/// in their configured order; a service var with the same key replaces the
/// project value in place, service-only vars are appended.
pub fn merge_env_vars(project: &[EnvVar], service: &[EnvVar]) -> Vec<EnvVar> {
    let mut merged: Vec<EnvVar> = project.to_vec();
    for var in service {
        match merged.iter_mut().find(|existing| existing.key == var.key) {
            Some(existing) => existing.value = var.value.clone(),
            None => merged.push(var.clone()),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_wins_on_key_collision() {
        let project = vec![
            EnvVar::new("DATABASE_URL", "postgres://project"),
            EnvVar::new("LOG_LEVEL", "info"),
        ];
        let service = vec![
            EnvVar::new("DATABASE_URL", "postgres://service"),
            EnvVar::new("FEATURE_FLAG", "on"),
        ];

        let merged = merge_env_vars(&project, &service);

        assert_eq!(
            merged,
            vec![
                EnvVar::new("DATABASE_URL", "postgres://service"),
                EnvVar::new("LOG_LEVEL", "info"),
                EnvVar::new("FEATURE_FLAG", "on"),
            ]
        );
    }

    #[test]
    fn merge_keeps_project_order() {
        let project = vec![EnvVar::new("A", "1"), EnvVar::new("B", "2")];
        let merged = merge_env_vars(&project, &[]);
        assert_eq!(merged, project);
    }

    #[test]
    fn deploy_spec_discriminates_on_tag() {
        let json = serde_json::json!({
            "deploy_type": "image",
            "image_url": "nginx:alpine",
        });
        let spec: DeploySpec = serde_json::from_value(json).unwrap();
        assert!(spec.is_image());

        let json = serde_json::json!({
            "deploy_type": "repo",
            "repo_url": "https://github.com/acme/widgets",
            "branch": "main",
            "dockerfile_path": "Dockerfile",
        });
        let spec: DeploySpec = serde_json::from_value(json).unwrap();
        assert!(spec.is_repo());
    }
}

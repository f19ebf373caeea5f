use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    DeploymentRepository, DomainRepository, GitInstallationRepository, ProjectRepository,
    ServiceRepository, SettingsRepository,
};
use crate::models;

/// In-memory backend implementing every repository trait.
///
/// Used by the test suite and by single-binary development setups that have
/// no external store. Status transitions of deployments are recorded so
/// progress UIs (and tests) can replay the observed lifecycle.
#[derive(Default)]
pub struct MemoryStore {
    projects: RwLock<HashMap<String, models::Project>>,
    services: RwLock<HashMap<String, models::Service>>,
    deployments: RwLock<HashMap<String, models::Deployment>>,
    domains: RwLock<HashMap<String, models::Domain>>,
    settings: RwLock<HashMap<String, String>>,
    installations: RwLock<Vec<models::GitInstallation>>,
    transitions: RwLock<Vec<(String, models::DeploymentStatus)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_project(&self, project: models::Project) {
        self.projects
            .write()
            .await
            .insert(project.id.clone(), project);
    }

    pub async fn add_service(&self, service: models::Service) {
        self.services
            .write()
            .await
            .insert(service.id.clone(), service);
    }

    /// The sequence of statuses a deployment has moved through, in write
    /// order, starting with the inserted status.
    pub async fn status_history(&self, deployment_id: &str) -> Vec<models::DeploymentStatus> {
        self.transitions
            .read()
            .await
            .iter()
            .filter(|(id, _)| id == deployment_id)
            .map(|(_, status)| *status)
            .collect()
    }
}

#[async_trait]
impl ProjectRepository for MemoryStore {
    async fn fetch(&self, id: &str) -> Result<Option<models::Project>, String> {
        Ok(self.projects.read().await.get(id).cloned())
    }
}

#[async_trait]
impl ServiceRepository for MemoryStore {
    async fn fetch(&self, id: &str) -> Result<Option<models::Service>, String> {
        Ok(self.services.read().await.get(id).cloned())
    }

    async fn fetch_by_project(&self, project_id: &str) -> Result<Vec<models::Service>, String> {
        let mut services: Vec<_> = self
            .services
            .read()
            .await
            .values()
            .filter(|service| service.project_id == project_id)
            .cloned()
            .collect();
        services.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(services)
    }
}

#[async_trait]
impl DeploymentRepository for MemoryStore {
    async fn fetch(&self, id: &str) -> Result<Option<models::Deployment>, String> {
        Ok(self.deployments.read().await.get(id).cloned())
    }

    async fn insert(
        &self,
        deployment: models::Deployment,
    ) -> Result<models::Deployment, String> {
        self.transitions
            .write()
            .await
            .push((deployment.id.clone(), deployment.status));
        self.deployments
            .write()
            .await
            .insert(deployment.id.clone(), deployment.clone());
        Ok(deployment)
    }

    async fn update(
        &self,
        deployment: models::Deployment,
    ) -> Result<models::Deployment, String> {
        let status_changed = {
            let mut deployments = self.deployments.write().await;
            let previous = deployments
                .get(&deployment.id)
                .ok_or_else(|| format!("deployment {} not found", deployment.id))?;
            let changed = previous.status != deployment.status;
            deployments.insert(deployment.id.clone(), deployment.clone());
            changed
        };
        if status_changed {
            self.transitions
                .write()
                .await
                .push((deployment.id.clone(), deployment.status));
        }
        Ok(deployment)
    }

    async fn append_log(&self, id: &str, fragment: &str) -> Result<usize, String> {
        let mut deployments = self.deployments.write().await;
        let deployment = deployments
            .get_mut(id)
            .ok_or_else(|| format!("deployment {} not found", id))?;
        deployment.build_log.push_str(fragment);
        Ok(deployment.build_log.len())
    }

    async fn fetch_running_for_service(
        &self,
        service_id: &str,
    ) -> Result<Vec<models::Deployment>, String> {
        Ok(self
            .deployments
            .read()
            .await
            .values()
            .filter(|d| {
                d.service_id == service_id && d.status == models::DeploymentStatus::Running
            })
            .cloned()
            .collect())
    }

    async fn fetch_non_terminal(&self) -> Result<Vec<models::Deployment>, String> {
        Ok(self
            .deployments
            .read()
            .await
            .values()
            .filter(|d| !d.status.is_terminal())
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DomainRepository for MemoryStore {
    async fn fetch(&self, id: &str) -> Result<Option<models::Domain>, String> {
        Ok(self.domains.read().await.get(id).cloned())
    }

    async fn fetch_by_hostname(
        &self,
        hostname: &str,
    ) -> Result<Option<models::Domain>, String> {
        let hostname = hostname.to_lowercase();
        Ok(self
            .domains
            .read()
            .await
            .values()
            .find(|d| d.hostname == hostname)
            .cloned())
    }

    async fn fetch_by_service(&self, service_id: &str) -> Result<Vec<models::Domain>, String> {
        let mut domains: Vec<_> = self
            .domains
            .read()
            .await
            .values()
            .filter(|d| d.service_id == service_id)
            .cloned()
            .collect();
        domains.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(domains)
    }

    async fn fetch_verified(&self) -> Result<Vec<models::Domain>, String> {
        let mut domains: Vec<_> = self
            .domains
            .read()
            .await
            .values()
            .filter(|d| d.dns_verified)
            .cloned()
            .collect();
        domains.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(domains)
    }

    async fn insert(&self, domain: models::Domain) -> Result<models::Domain, String> {
        self.domains
            .write()
            .await
            .insert(domain.id.clone(), domain.clone());
        Ok(domain)
    }

    async fn update(&self, domain: models::Domain) -> Result<models::Domain, String> {
        let mut domains = self.domains.write().await;
        if !domains.contains_key(&domain.id) {
            return Err(format!("domain {} not found", domain.id));
        }
        domains.insert(domain.id.clone(), domain.clone());
        Ok(domain)
    }

    async fn delete(&self, id: &str) -> Result<(), String> {
        self.domains.write().await.remove(id);
        Ok(())
    }
}

#[async_trait]
impl SettingsRepository for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, String> {
        Ok(self.settings.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.settings
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[async_trait]
impl GitInstallationRepository for MemoryStore {
    async fn list(&self) -> Result<Vec<models::GitInstallation>, String> {
        Ok(self.installations.read().await.clone())
    }

    async fn fetch_by_login(
        &self,
        login: &str,
    ) -> Result<Option<models::GitInstallation>, String> {
        Ok(self
            .installations
            .read()
            .await
            .iter()
            .find(|i| i.account_login.eq_ignore_ascii_case(login))
            .cloned())
    }

    async fn upsert(&self, installation: models::GitInstallation) -> Result<(), String> {
        let mut installations = self.installations.write().await;
        match installations
            .iter_mut()
            .find(|i| i.installation_id == installation.installation_id)
        {
            Some(existing) => *existing = installation,
            None => installations.push(installation),
        }
        Ok(())
    }
}

//! Typed store surface consumed by the core.
//!
//! The relational store itself lives outside this crate; components depend
//! on these repository traits and get a concrete backend injected. The
//! in-memory backend in [`memory`] backs tests and single-binary setups.

mod memory;

pub use memory::MemoryStore;

use crate::models;
use async_trait::async_trait;

#[async_trait]
pub trait ProjectRepository: Send + Sync {
    async fn fetch(&self, id: &str) -> Result<Option<models::Project>, String>;
}

#[async_trait]
pub trait ServiceRepository: Send + Sync {
    async fn fetch(&self, id: &str) -> Result<Option<models::Service>, String>;
    async fn fetch_by_project(&self, project_id: &str) -> Result<Vec<models::Service>, String>;
}

#[async_trait]
pub trait DeploymentRepository: Send + Sync {
    async fn fetch(&self, id: &str) -> Result<Option<models::Deployment>, String>;
    async fn insert(&self, deployment: models::Deployment)
        -> Result<models::Deployment, String>;
    async fn update(&self, deployment: models::Deployment)
        -> Result<models::Deployment, String>;
    /// Atomically append a fragment to the deployment's build log and
    /// return the log's new length, usable as a cursor for incremental
    /// tailing.
    async fn append_log(&self, id: &str, fragment: &str) -> Result<usize, String>;
    /// Every deployment of the service currently marked running.
    async fn fetch_running_for_service(
        &self,
        service_id: &str,
    ) -> Result<Vec<models::Deployment>, String>;
    /// Every deployment not yet in a terminal state, across all services.
    async fn fetch_non_terminal(&self) -> Result<Vec<models::Deployment>, String>;
}

#[async_trait]
pub trait DomainRepository: Send + Sync {
    async fn fetch(&self, id: &str) -> Result<Option<models::Domain>, String>;
    async fn fetch_by_hostname(&self, hostname: &str)
        -> Result<Option<models::Domain>, String>;
    async fn fetch_by_service(&self, service_id: &str) -> Result<Vec<models::Domain>, String>;
    /// Every domain with a passed DNS check, across all services.
    async fn fetch_verified(&self) -> Result<Vec<models::Domain>, String>;
    async fn insert(&self, domain: models::Domain) -> Result<models::Domain, String>;
    async fn update(&self, domain: models::Domain) -> Result<models::Domain, String>;
    async fn delete(&self, id: &str) -> Result<(), String>;
}

#[async_trait]
pub trait SettingsRepository: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, String>;
    async fn set(&self, key: &str, value: &str) -> Result<(), String>;
}

#[async_trait]
pub trait GitInstallationRepository: Send + Sync {
    async fn list(&self) -> Result<Vec<models::GitInstallation>, String>;
    async fn fetch_by_login(&self, login: &str)
        -> Result<Option<models::GitInstallation>, String>;
    async fn upsert(&self, installation: models::GitInstallation) -> Result<(), String>;
}

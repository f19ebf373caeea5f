//! Deployment orchestration.
//!
//! A deploy request inserts a pending deployment row and hands the rest to
//! a spawned worker; callers poll the row for progress. The worker drives
//! `pending → cloning|pulling → building → deploying → running | failed`,
//! delegating every engine operation to [`ContainerEngine`] and retiring
//! the previously running deployment only after the new one is healthy —
//! between those two moments both versions run on different host ports.
//!
//! There is no cancellation: a worker ends in a terminal status or dies
//! with the process, and [`Deployer::reconcile_stuck`] sweeps up rows a
//! crash left behind.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::configuration::Settings;
use crate::db::{DeploymentRepository, ProjectRepository, ServiceRepository};
use crate::helpers::docker::{
    ContainerEngine, RunContainerOptions, MANAGED_LABEL, PROJECT_LABEL, SERVICE_LABEL,
    SERVICE_NAME_LABEL,
};
use crate::helpers::github::{self, GitHubApp};
use crate::models::{
    merge_env_vars, DeploySpec, Deployment, DeploymentStatus, EnvVar, Project, Service,
    DEFAULT_CONTAINER_PORT,
};
use crate::services::caddy::CaddyConfigurator;
use crate::services::domains::DomainService;

#[derive(Debug)]
pub enum DeployError {
    ServiceNotFound(String),
    ProjectNotFound(String),
    Store(String),
}

impl std::fmt::Display for DeployError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ServiceNotFound(id) => write!(f, "Service not found: {}", id),
            Self::ProjectNotFound(id) => write!(f, "Project not found: {}", id),
            Self::Store(msg) => write!(f, "Store error: {}", msg),
        }
    }
}

impl std::error::Error for DeployError {}

/// Source checkout operations. The CLI implementation shells out to git;
/// lifecycle tests substitute a fake.
#[async_trait]
pub trait GitFetcher: Send + Sync {
    /// Shallow single-branch clone into `dest`; returns the command output.
    async fn clone_branch(
        &self,
        repo_url: &str,
        branch: &str,
        dest: &Path,
    ) -> Result<String, String>;

    /// Full hash of the checkout's HEAD.
    async fn head_commit(&self, checkout: &Path) -> Result<String, String>;
}

#[derive(Debug, Clone)]
pub struct GitCli {
    program: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new()
    }
}

impl GitCli {
    pub fn new() -> Self {
        Self {
            program: "git".to_string(),
        }
    }
}

#[async_trait]
impl GitFetcher for GitCli {
    async fn clone_branch(
        &self,
        repo_url: &str,
        branch: &str,
        dest: &Path,
    ) -> Result<String, String> {
        let output = tokio::process::Command::new(&self.program)
            .args(["clone", "--depth", "1", "--branch", branch, repo_url])
            .arg(dest)
            .output()
            .await
            .map_err(|err| format!("failed to spawn {}: {}", self.program, err))?;

        let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
        log.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            Ok(log)
        } else if log.trim().is_empty() {
            Err(format!(
                "git clone exited with code {}",
                output.status.code().unwrap_or(-1)
            ))
        } else {
            Err(log)
        }
    }

    async fn head_commit(&self, checkout: &Path) -> Result<String, String> {
        let output = tokio::process::Command::new(&self.program)
            .arg("-C")
            .arg(checkout)
            .args(["rev-parse", "HEAD"])
            .output()
            .await
            .map_err(|err| format!("failed to spawn {}: {}", self.program, err))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }
}

#[derive(Clone)]
pub struct Deployer {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<Settings>,
    projects: Arc<dyn ProjectRepository>,
    services: Arc<dyn ServiceRepository>,
    deployments: Arc<dyn DeploymentRepository>,
    engine: Arc<dyn ContainerEngine>,
    git: Arc<dyn GitFetcher>,
    github: Arc<GitHubApp>,
    caddy: Arc<CaddyConfigurator>,
    domains: Arc<DomainService>,
    workers: Mutex<HashMap<String, JoinHandle<()>>>,
    claimed_ports: Mutex<HashSet<u16>>,
}

impl Deployer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Settings>,
        projects: Arc<dyn ProjectRepository>,
        services: Arc<dyn ServiceRepository>,
        deployments: Arc<dyn DeploymentRepository>,
        engine: Arc<dyn ContainerEngine>,
        git: Arc<dyn GitFetcher>,
        github: Arc<GitHubApp>,
        caddy: Arc<CaddyConfigurator>,
        domains: Arc<DomainService>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                projects,
                services,
                deployments,
                engine,
                git,
                github,
                caddy,
                domains,
                workers: Mutex::new(HashMap::new()),
                claimed_ports: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Validate the request, insert a pending deployment and launch the
    /// worker. Returns the deployment id immediately; progress is polled
    /// off the row.
    pub async fn deploy_service(&self, service_id: &str) -> Result<String, DeployError> {
        let service = self
            .inner
            .services
            .fetch(service_id)
            .await
            .map_err(DeployError::Store)?
            .ok_or_else(|| DeployError::ServiceNotFound(service_id.to_string()))?;
        let project = self
            .inner
            .projects
            .fetch(&service.project_id)
            .await
            .map_err(DeployError::Store)?
            .ok_or_else(|| DeployError::ProjectNotFound(service.project_id.clone()))?;

        let deployment = self
            .inner
            .deployments
            .insert(Deployment::new(project.id.as_str(), service.id.as_str()))
            .await
            .map_err(DeployError::Store)?;
        let deployment_id = deployment.id.clone();

        tracing::info!(
            deployment_id = %deployment_id,
            service_id = %service.id,
            "deployment accepted"
        );

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            inner.run_deployment(deployment, service, project).await;
        });

        let mut workers = self.inner.workers.lock().await;
        workers.retain(|_, worker| !worker.is_finished());
        workers.insert(deployment_id.clone(), handle);

        Ok(deployment_id)
    }

    /// Fan out over every service in the project concurrently. Per-service
    /// validation failures are logged and skipped, not fatal to the rest.
    pub async fn deploy_project(&self, project_id: &str) -> Result<Vec<String>, DeployError> {
        let project = self
            .inner
            .projects
            .fetch(project_id)
            .await
            .map_err(DeployError::Store)?
            .ok_or_else(|| DeployError::ProjectNotFound(project_id.to_string()))?;

        let services = self
            .inner
            .services
            .fetch_by_project(&project.id)
            .await
            .map_err(DeployError::Store)?;

        let results = join_all(
            services
                .iter()
                .map(|service| self.deploy_service(&service.id)),
        )
        .await;

        let mut deployment_ids = Vec::new();
        for (service, result) in services.iter().zip(results) {
            match result {
                Ok(id) => deployment_ids.push(id),
                Err(err) => {
                    tracing::error!(service_id = %service.id, error = %err, "service skipped in project deploy")
                }
            }
        }
        Ok(deployment_ids)
    }

    /// Await one worker, for tests and graceful shutdown.
    pub async fn wait_for(&self, deployment_id: &str) {
        let handle = self.inner.workers.lock().await.remove(deployment_id);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Startup reconciliation: a crash leaves workers' rows stuck in a
    /// non-terminal state; fail every one older than the cutoff. Returns
    /// the ids that were swept.
    pub async fn reconcile_stuck(
        &self,
        older_than: chrono::Duration,
    ) -> Result<Vec<String>, DeployError> {
        let cutoff = Utc::now() - older_than;
        let mut swept = Vec::new();

        for deployment in self
            .inner
            .deployments
            .fetch_non_terminal()
            .await
            .map_err(DeployError::Store)?
        {
            if deployment.created_at >= cutoff {
                continue;
            }
            let id = deployment.id.clone();
            let mut stuck = deployment;
            stuck.status = DeploymentStatus::Failed;
            stuck.error_message =
                Some("Deployment interrupted by control plane restart".to_string());
            stuck.finished_at = Some(Utc::now());

            match self.inner.deployments.update(stuck).await {
                Ok(_) => {
                    let _ = self
                        .inner
                        .deployments
                        .append_log(&id, "\nError: Deployment interrupted by control plane restart\n")
                        .await;
                    tracing::warn!(deployment_id = %id, "reconciled stuck deployment");
                    swept.push(id);
                }
                Err(err) => {
                    tracing::error!(deployment_id = %id, error = %err, "could not reconcile deployment")
                }
            }
        }
        Ok(swept)
    }
}

impl Inner {
    async fn run_deployment(self: Arc<Self>, deployment: Deployment, service: Service, project: Project) {
        let deployment_id = deployment.id.clone();
        if let Err(message) = self.execute(&deployment_id, &service, &project).await {
            tracing::error!(deployment_id = %deployment_id, error = %message, "deployment failed");
            if let Err(store_err) = self.fail(&deployment_id, &message).await {
                tracing::error!(
                    deployment_id = %deployment_id,
                    error = %store_err,
                    "could not record deployment failure"
                );
            }
        }
    }

    async fn execute(&self, id: &str, service: &Service, project: &Project) -> Result<(), String> {
        let container_port = service.container_port.unwrap_or(DEFAULT_CONTAINER_PORT);
        let env = merge_env_vars(&project.env_vars, &service.env_vars);
        let labels = management_labels(project, service);

        let image = match &service.deploy {
            DeploySpec::Image { image_url } => self.prepare_image(id, image_url).await?,
            DeploySpec::Repo {
                repo_url,
                branch,
                dockerfile_path,
            } => {
                self.build_from_repo(id, service, project, repo_url, branch, dockerfile_path, &env, &labels)
                    .await?
            }
        };

        self.set_status(id, DeploymentStatus::Deploying).await?;
        self.append_log(id, "\nStarting container...\n").await?;

        // every service of a project shares one network, so containers can
        // reach each other by service name
        let network = format!("slipway-net-{}", project.id);
        self.engine.create_network(&network, &labels).await?;

        let host_port = self.claim_port().await?;

        let run = self
            .engine
            .run_container(RunContainerOptions {
                image,
                host_port,
                container_port,
                name: container_name(service, id),
                env_vars: env,
                network: Some(network),
                hostname: Some(service.name.clone()),
                labels,
            })
            .await;
        // once the engine has had its chance to bind, the published-port
        // scan takes over; the claim has done its job
        self.release_port(host_port).await;
        if !run.success {
            return Err(run
                .error
                .unwrap_or_else(|| "Failed to start container".to_string()));
        }

        let short_id: String = run.container_id.chars().take(12).collect();
        self.append_log(id, &format!("Container started: {}\n", short_id))
            .await?;
        self.append_log(id, "Waiting for container to be healthy...\n")
            .await?;

        let healthy = self
            .engine
            .wait_for_healthy(
                &run.container_id,
                host_port,
                service.health_path.as_deref(),
                self.config.container.health_timeout_seconds,
            )
            .await;
        if !healthy {
            return Err("Container failed health check".to_string());
        }

        self.promote(id, &run.container_id, host_port).await?;
        self.append_log(
            id,
            &format!(
                "\nDeployment successful! App available at http://localhost:{}\n",
                host_port
            ),
        )
        .await?;

        self.publish(id, service, project).await;
        self.retire_previous(id, &service.id).await;

        Ok(())
    }

    async fn prepare_image(&self, id: &str, image_url: &str) -> Result<String, String> {
        self.set_status(id, DeploymentStatus::Pulling).await?;
        self.append_log(id, &format!("Pulling {}...\n", image_url))
            .await?;

        let out = self.engine.pull_image(image_url).await;
        self.append_log(id, &out.log).await?;
        if !out.success {
            return Err(out.error.unwrap_or_else(|| "Pull failed".to_string()));
        }

        self.set_commit(id, &image_tag(image_url)).await?;
        Ok(image_url.to_string())
    }

    #[allow(clippy::too_many_arguments)]
    async fn build_from_repo(
        &self,
        id: &str,
        service: &Service,
        project: &Project,
        repo_url: &str,
        branch: &str,
        dockerfile_path: &str,
        env: &[EnvVar],
        labels: &BTreeMap<String, String>,
    ) -> Result<String, String> {
        self.set_status(id, DeploymentStatus::Cloning).await?;
        self.append_log(id, &format!("Cloning {}...\n", repo_url))
            .await?;

        // always a fresh full checkout, never incremental
        let checkout = PathBuf::from(&self.config.repos_path).join(&service.id);
        if let Err(err) = tokio::fs::remove_dir_all(&checkout).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("could not clear checkout: {}", err));
            }
        }
        tokio::fs::create_dir_all(&self.config.repos_path)
            .await
            .map_err(|err| format!("could not create repos dir: {}", err))?;

        let clone_url = self.clone_url_with_auth(id, repo_url).await;
        let clone_log = self.git.clone_branch(&clone_url, branch, &checkout).await?;
        if clone_log.trim().is_empty() {
            self.append_log(id, "Cloned successfully\n").await?;
        } else {
            self.append_log(id, &clone_log).await?;
        }

        let sha = self.git.head_commit(&checkout).await?;
        let commit: String = sha.chars().take(7).collect();
        self.set_commit(id, &commit).await?;

        write_env_file(&checkout, env).await?;

        self.set_status(id, DeploymentStatus::Building).await?;
        self.append_log(id, "\nBuilding image...\n").await?;

        let tag = format!("slipway-{}-{}:{}", project.id, service.id, commit).to_lowercase();
        let out = self
            .engine
            .build_image(&checkout, &tag, dockerfile_path, env, labels)
            .await;
        self.append_log(id, &out.log).await?;
        if !out.success {
            return Err(out.error.unwrap_or_else(|| "Build failed".to_string()));
        }
        Ok(tag)
    }

    /// Rewrite the clone URL with a short-lived installation token when the
    /// repo lives at the configured provider and an installation resolves.
    /// Auth resolution failure downgrades to an unauthenticated clone; a
    /// private repo then fails normally at the clone step.
    async fn clone_url_with_auth(&self, id: &str, repo_url: &str) -> String {
        if !github::is_github_repo(repo_url) {
            return repo_url.to_string();
        }
        match self.github.generate_installation_token(Some(repo_url)).await {
            Ok(token) => github::inject_token_into_url(repo_url, &token),
            Err(err) => {
                tracing::warn!(
                    deployment_id = %id,
                    error = %err,
                    "proceeding with unauthenticated clone"
                );
                repo_url.to_string()
            }
        }
    }

    /// Post-promotion publication: system domain + proxy resync, both
    /// best-effort — failures land in the build log, the deployment stays
    /// running.
    async fn publish(&self, id: &str, service: &Service, project: &Project) {
        if let Err(err) = self.domains.ensure_system_domain(service, project).await {
            tracing::warn!(deployment_id = %id, error = %err, "system domain assignment failed");
            let _ = self
                .append_log(id, &format!("\nWarning: system domain assignment failed: {}\n", err))
                .await;
        }
        if let Err(err) = self.caddy.sync().await {
            tracing::warn!(deployment_id = %id, error = %err, "proxy resync failed");
            let _ = self
                .append_log(id, &format!("\nWarning: proxy resync failed: {}\n", err))
                .await;
        }
    }

    /// Stop and fail every other deployment of the service still marked
    /// running. Runs only after the new deployment is healthy, which leaves
    /// a deliberate overlap window with both versions live.
    async fn retire_previous(&self, new_id: &str, service_id: &str) {
        let running = match self.deployments.fetch_running_for_service(service_id).await {
            Ok(list) => list,
            Err(err) => {
                tracing::error!(service_id, error = %err, "could not list running deployments");
                return;
            }
        };

        for previous in running.into_iter().filter(|d| d.id != new_id) {
            if let Some(container_id) = &previous.container_id {
                self.engine.stop_container(container_id).await;
            }
            let previous_id = previous.id.clone();
            let mut retired = previous;
            retired.status = DeploymentStatus::Failed;
            retired.finished_at = Some(Utc::now());
            match self.deployments.update(retired).await {
                Ok(_) => {
                    tracing::info!(deployment_id = %previous_id, "retired previous deployment")
                }
                Err(err) => {
                    tracing::error!(deployment_id = %previous_id, error = %err, "could not retire deployment")
                }
            }
        }
    }

    /// Claim a host port before the container binds it. The engine scan
    /// alone is advisory: two workers could pick the same port between
    /// scan and start, so the claim set arbitrates within this process.
    async fn claim_port(&self) -> Result<u16, String> {
        let end = self.config.container.port_range_end;
        let mut claimed = self.claimed_ports.lock().await;
        let mut from = self.config.container.port_range_start;
        loop {
            let port = self.engine.available_port(from, end).await?;
            if claimed.insert(port) {
                return Ok(port);
            }
            from = port
                .checked_add(1)
                .ok_or_else(|| format!("No available ports in range {}..{}", from, end))?;
        }
    }

    async fn release_port(&self, port: u16) {
        self.claimed_ports.lock().await.remove(&port);
    }

    async fn load(&self, id: &str) -> Result<Deployment, String> {
        self.deployments
            .fetch(id)
            .await?
            .ok_or_else(|| format!("deployment {} disappeared", id))
    }

    async fn set_status(&self, id: &str, status: DeploymentStatus) -> Result<(), String> {
        let mut deployment = self.load(id).await?;
        deployment.status = status;
        self.deployments.update(deployment).await.map(|_| ())
    }

    async fn set_commit(&self, id: &str, commit: &str) -> Result<(), String> {
        let mut deployment = self.load(id).await?;
        deployment.commit_sha = commit.to_string();
        self.deployments.update(deployment).await.map(|_| ())
    }

    async fn append_log(&self, id: &str, fragment: &str) -> Result<(), String> {
        self.deployments.append_log(id, fragment).await.map(|_| ())
    }

    async fn promote(&self, id: &str, container_id: &str, host_port: u16) -> Result<(), String> {
        let mut deployment = self.load(id).await?;
        deployment.status = DeploymentStatus::Running;
        deployment.container_id = Some(container_id.to_string());
        deployment.host_port = Some(host_port);
        deployment.finished_at = Some(Utc::now());
        self.deployments.update(deployment).await.map(|_| ())
    }

    async fn fail(&self, id: &str, message: &str) -> Result<(), String> {
        let mut deployment = self.load(id).await?;
        deployment.status = DeploymentStatus::Failed;
        deployment.error_message = Some(message.to_string());
        deployment.finished_at = Some(Utc::now());
        self.deployments.update(deployment).await?;
        self.append_log(id, &format!("\nError: {}\n", message)).await
    }
}

fn management_labels(project: &Project, service: &Service) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_LABEL.to_string(), "true".to_string()),
        (PROJECT_LABEL.to_string(), project.id.clone()),
        (SERVICE_LABEL.to_string(), service.id.clone()),
        (SERVICE_NAME_LABEL.to_string(), service.name.clone()),
    ])
}

/// Container names are unique per deployment so the outgoing version keeps
/// running until the new one is promoted.
fn container_name(service: &Service, deployment_id: &str) -> String {
    let short: String = deployment_id.chars().take(8).collect();
    format!("slipway-{}-{}", service.id, short).to_lowercase()
}

/// Commit identifier for image deploys: the reference's tag, `latest` when
/// it has none.
fn image_tag(image_url: &str) -> String {
    let after_slash = image_url.rsplit('/').next().unwrap_or(image_url);
    match after_slash.split_once(':') {
        Some((_, tag)) if !tag.is_empty() => tag.to_string(),
        _ => "latest".to_string(),
    }
}

async fn write_env_file(checkout: &Path, env: &[EnvVar]) -> Result<(), String> {
    let mut contents = String::new();
    for var in env {
        contents.push_str(&var.key);
        contents.push('=');
        contents.push_str(&var.value);
        contents.push('\n');
    }
    tokio::fs::write(checkout.join(".env"), contents)
        .await
        .map_err(|err| format!("could not write .env: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_tag_defaults_to_latest() {
        assert_eq!(image_tag("nginx"), "latest");
        assert_eq!(image_tag("nginx:alpine"), "alpine");
        assert_eq!(image_tag("ghcr.io/acme/widgets:v2"), "v2");
        // a registry port is not a tag
        assert_eq!(image_tag("registry.local:5000/acme/widgets"), "latest");
    }

    #[test]
    fn container_names_differ_per_deployment() {
        let service = Service::new(
            "proj",
            "api",
            DeploySpec::Image {
                image_url: "nginx:alpine".into(),
            },
        );
        let a = container_name(&service, "AAAAAAAA-1111");
        let b = container_name(&service, "BBBBBBBB-2222");
        assert_ne!(a, b);
        assert!(a.starts_with(&format!("slipway-{}-", service.id)));
        assert_eq!(a, a.to_lowercase());
    }

    #[test]
    fn labels_mark_resources_managed() {
        let project = Project::new("shop");
        let service = Service::new(
            project.id.as_str(),
            "api",
            DeploySpec::Image {
                image_url: "nginx:alpine".into(),
            },
        );
        let labels = management_labels(&project, &service);
        assert_eq!(labels.get(MANAGED_LABEL).map(String::as_str), Some("true"));
        assert_eq!(labels.get(PROJECT_LABEL), Some(&project.id));
        assert_eq!(labels.get(SERVICE_NAME_LABEL).map(String::as_str), Some("api"));
    }

    #[tokio::test]
    async fn env_file_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let env = vec![
            EnvVar::new("B", "2"),
            EnvVar::new("A", "1"),
        ];
        write_env_file(dir.path(), &env).await.unwrap();
        let contents = tokio::fs::read_to_string(dir.path().join(".env"))
            .await
            .unwrap();
        assert_eq!(contents, "B=2\nA=1\n");
    }
}

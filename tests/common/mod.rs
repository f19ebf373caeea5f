#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use slipway::configuration::{
    CaddySettings, ContainerSettings, GithubSettings, Settings,
};
use slipway::db::MemoryStore;
use slipway::helpers::docker::{
    ContainerEngine, ContainerState, EngineOutput, RunContainerOptions, RunOutput,
};
use slipway::helpers::github::GitHubApp;
use slipway::models::{DeploySpec, EnvVar, Project, Service};
use slipway::services::caddy::CaddyConfigurator;
use slipway::services::deployer::{Deployer, GitFetcher};
use slipway::services::domains::DomainService;

pub const FAKE_PULL_LOG: &str = "pulled image layers\n";
pub const FAKE_BUILD_LOG: &str = "built image\n";
pub const FAKE_CLONE_LOG: &str = "Cloning into checkout...\n";
pub const FAKE_COMMIT: &str = "0123456789abcdef0123456789abcdef01234567";

// ─────────────────────────────────────────────────────────────────────────────
// Fake engine / git seams
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BuildCall {
    pub repo_path: String,
    pub tag: String,
    pub dockerfile_path: String,
    pub build_args: Vec<EnvVar>,
}

/// In-memory `ContainerEngine` recording every call. Containers it "starts"
/// are always healthy unless told otherwise.
#[derive(Default)]
pub struct FakeEngine {
    pub build_failure: Mutex<Option<String>>,
    pub pull_failure: Mutex<Option<String>>,
    pub run_failure: Mutex<Option<String>>,
    pub unhealthy: Mutex<bool>,
    pub builds: Mutex<Vec<BuildCall>>,
    pub pulls: Mutex<Vec<String>>,
    pub runs: Mutex<Vec<RunContainerOptions>>,
    pub stopped: Mutex<Vec<String>>,
    pub networks: Mutex<Vec<String>>,
    pub used_ports: Mutex<HashSet<u16>>,
    container_counter: AtomicUsize,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_pulls(&self, message: &str) {
        *self.pull_failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn fail_builds(&self, message: &str) {
        *self.build_failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn mark_unhealthy(&self) {
        *self.unhealthy.lock().unwrap() = true;
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn build_image(
        &self,
        repo_path: &Path,
        tag: &str,
        dockerfile_path: &str,
        build_args: &[EnvVar],
        _labels: &std::collections::BTreeMap<String, String>,
    ) -> EngineOutput {
        self.builds.lock().unwrap().push(BuildCall {
            repo_path: repo_path.to_string_lossy().into_owned(),
            tag: tag.to_string(),
            dockerfile_path: dockerfile_path.to_string(),
            build_args: build_args.to_vec(),
        });
        match self.build_failure.lock().unwrap().clone() {
            Some(error) => EngineOutput {
                success: false,
                log: FAKE_BUILD_LOG.to_string(),
                error: Some(error),
            },
            None => EngineOutput {
                success: true,
                log: FAKE_BUILD_LOG.to_string(),
                error: None,
            },
        }
    }

    async fn pull_image(&self, image: &str) -> EngineOutput {
        self.pulls.lock().unwrap().push(image.to_string());
        match self.pull_failure.lock().unwrap().clone() {
            Some(error) => EngineOutput {
                success: false,
                log: FAKE_PULL_LOG.to_string(),
                error: Some(error),
            },
            None => EngineOutput {
                success: true,
                log: FAKE_PULL_LOG.to_string(),
                error: None,
            },
        }
    }

    async fn run_container(&self, options: RunContainerOptions) -> RunOutput {
        if let Some(error) = self.run_failure.lock().unwrap().clone() {
            return RunOutput {
                success: false,
                container_id: String::new(),
                error: Some(error),
            };
        }
        let n = self.container_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.used_ports.lock().unwrap().insert(options.host_port);
        self.runs.lock().unwrap().push(options);
        RunOutput {
            success: true,
            container_id: format!("c{}", n),
            error: None,
        }
    }

    async fn stop_container(&self, name_or_id: &str) {
        self.stopped.lock().unwrap().push(name_or_id.to_string());
    }

    async fn container_state(&self, _name_or_id: &str) -> ContainerState {
        if *self.unhealthy.lock().unwrap() {
            ContainerState::Exited
        } else {
            ContainerState::Running
        }
    }

    async fn wait_for_healthy(
        &self,
        _container_id: &str,
        _host_port: u16,
        _health_path: Option<&str>,
        _timeout_seconds: u64,
    ) -> bool {
        !*self.unhealthy.lock().unwrap()
    }

    async fn available_port(&self, start: u16, end: u16) -> Result<u16, String> {
        let used = self.used_ports.lock().unwrap();
        (start..end)
            .find(|port| !used.contains(port))
            .ok_or_else(|| format!("No available ports in range {}..{}", start, end))
    }

    async fn create_network(
        &self,
        name: &str,
        _labels: &std::collections::BTreeMap<String, String>,
    ) -> Result<(), String> {
        let mut networks = self.networks.lock().unwrap();
        if !networks.iter().any(|n| n == name) {
            networks.push(name.to_string());
        }
        Ok(())
    }

    async fn remove_network(&self, name: &str) {
        self.networks.lock().unwrap().retain(|n| n != name);
    }
}

/// Records clone requests and fabricates checkouts without touching git.
#[derive(Default)]
pub struct FakeGit {
    pub cloned: Mutex<Vec<(String, String)>>,
    pub failure: Mutex<Option<String>>,
}

impl FakeGit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_clones(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }
}

#[async_trait]
impl GitFetcher for FakeGit {
    async fn clone_branch(
        &self,
        repo_url: &str,
        branch: &str,
        dest: &Path,
    ) -> Result<String, String> {
        if let Some(error) = self.failure.lock().unwrap().clone() {
            return Err(error);
        }
        self.cloned
            .lock()
            .unwrap()
            .push((repo_url.to_string(), branch.to_string()));
        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|err| err.to_string())?;
        Ok(FAKE_CLONE_LOG.to_string())
    }

    async fn head_commit(&self, _checkout: &Path) -> Result<String, String> {
        Ok(FAKE_COMMIT.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test environment
// ─────────────────────────────────────────────────────────────────────────────

pub struct TestEnv {
    pub store: Arc<MemoryStore>,
    pub engine: Arc<FakeEngine>,
    pub git: Arc<FakeGit>,
    pub github: Arc<GitHubApp>,
    pub caddy: Arc<CaddyConfigurator>,
    pub domains: Arc<DomainService>,
    pub deployer: Deployer,
    pub config: Arc<Settings>,
    _repos_dir: tempfile::TempDir,
}

pub fn test_settings(repos_path: &str) -> Settings {
    Settings {
        environment: "development".to_string(),
        repos_path: repos_path.to_string(),
        admin_port: 3000,
        container: ContainerSettings {
            engine: "docker".to_string(),
            port_range_start: 10000,
            port_range_end: 20000,
            health_timeout_seconds: 5,
        },
        caddy: CaddySettings {
            admin_url: "http://127.0.0.1:2019".to_string(),
        },
        github: GithubSettings {
            api_url: "https://api.github.com".to_string(),
        },
        ip_echo_urls: Vec::new(),
    }
}

pub async fn spawn_env() -> TestEnv {
    spawn_env_with(|_| {}).await
}

pub async fn spawn_env_with<F>(customize: F) -> TestEnv
where
    F: FnOnce(&mut Settings),
{
    let repos_dir = tempfile::tempdir().expect("Failed to create repos tempdir");
    let mut settings = test_settings(repos_dir.path().to_str().expect("utf-8 tempdir path"));
    customize(&mut settings);
    let config = Arc::new(settings);

    let store = Arc::new(MemoryStore::new());
    let engine = Arc::new(FakeEngine::new());
    let git = Arc::new(FakeGit::new());

    let github = Arc::new(GitHubApp::new(
        store.clone(),
        store.clone(),
        config.github.api_url.clone(),
    ));
    let caddy = Arc::new(CaddyConfigurator::new(
        store.clone(),
        store.clone(),
        store.clone(),
        config.caddy.admin_url.clone(),
        config.admin_port,
    ));
    let domains = Arc::new(DomainService::new(
        store.clone(),
        caddy.clone(),
        config.clone(),
    ));
    let deployer = Deployer::new(
        config.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        engine.clone(),
        git.clone(),
        github.clone(),
        caddy.clone(),
        domains.clone(),
    );

    TestEnv {
        store,
        engine,
        git,
        github,
        caddy,
        domains,
        deployer,
        config,
        _repos_dir: repos_dir,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Seeding helpers
// ─────────────────────────────────────────────────────────────────────────────

pub async fn seed_image_service(env: &TestEnv, image: &str) -> (Project, Service) {
    let project = Project::new("shop");
    let service = Service::new(
        project.id.as_str(),
        "api",
        DeploySpec::Image {
            image_url: image.to_string(),
        },
    );
    env.store.add_project(project.clone()).await;
    env.store.add_service(service.clone()).await;
    (project, service)
}

pub async fn seed_repo_service(env: &TestEnv, repo_url: &str) -> (Project, Service) {
    let mut project = Project::new("shop");
    project.env_vars = vec![
        EnvVar::new("DATABASE_URL", "postgres://project"),
        EnvVar::new("LOG_LEVEL", "info"),
    ];
    let mut service = Service::new(
        project.id.as_str(),
        "api",
        DeploySpec::Repo {
            repo_url: repo_url.to_string(),
            branch: "main".to_string(),
            dockerfile_path: "Dockerfile".to_string(),
        },
    );
    service.env_vars = vec![
        EnvVar::new("DATABASE_URL", "postgres://service"),
        EnvVar::new("FEATURE_FLAG", "on"),
    ];
    env.store.add_project(project.clone()).await;
    env.store.add_service(service.clone()).await;
    (project, service)
}

/// Write an executable shell script standing in for the engine binary, so
/// adapter tests can assert the exact CLI conversation without a docker
/// daemon.
#[cfg(unix)]
pub fn stub_engine(dir: &Path, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("engine-stub.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("Failed to write stub");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("Failed to chmod stub");
    path.to_string_lossy().into_owned()
}

/// Generate an RSA private key with the host's openssl, or `None` when the
/// binary is unavailable (the caller should skip).
pub async fn generate_rsa_pem() -> Option<String> {
    let output = tokio::process::Command::new("openssl")
        .args(["genrsa", "2048"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let pem = String::from_utf8(output.stdout).ok()?;
    if pem.contains("PRIVATE KEY") {
        Some(pem)
    } else {
        None
    }
}

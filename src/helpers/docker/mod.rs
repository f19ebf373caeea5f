//! Container engine adapter.
//!
//! Wraps the engine's command-line interface behind the [`ContainerEngine`]
//! trait. Everything the control plane does to the docker host goes through
//! here: image build/pull, container run/stop/inspect, health gating, host
//! port scanning, per-project networks, log streaming and the label-filtered
//! inventory primitives cleanup jobs consume.
//!
//! Resources created by this adapter carry `slipway.*` labels; inventory and
//! cleanup operations filter on them so unmanaged host resources are never
//! touched.

mod inventory;
mod logs;

pub use inventory::ImageInfo;
pub use logs::{LogEvent, LogStream, LogStreamOptions, StopHandle};

use std::collections::{BTreeMap, HashSet};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;

use crate::models::EnvVar;

/// Label marking a resource as managed by this control plane.
pub const MANAGED_LABEL: &str = "slipway.managed";
pub const PROJECT_LABEL: &str = "slipway.project.id";
pub const SERVICE_LABEL: &str = "slipway.service.id";
pub const SERVICE_NAME_LABEL: &str = "slipway.service.name";

/// Host port scan range, end exclusive.
pub const PORT_RANGE_START: u16 = 10000;
pub const PORT_RANGE_END: u16 = 20000;

pub const DEFAULT_HEALTH_TIMEOUT_SECONDS: u64 = 60;

const RESTART_POLICY: &str = "on-failure:5";
const LOG_MAX_SIZE: &str = "10m";
const LOG_MAX_FILE: &str = "3";
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

lazy_static! {
    static ref PUBLISHED_PORT_RE: Regex =
        Regex::new(r"0\.0\.0\.0:(\d+)").expect("published port pattern compiles");
}

/// Result of a build or pull: combined stdout/stderr plus the failure
/// reason when the engine exited nonzero or could not be spawned.
#[derive(Debug, Clone, Default)]
pub struct EngineOutput {
    pub success: bool,
    pub log: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub success: bool,
    pub container_id: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Restarting,
    Running,
    Paused,
    Exited,
    Dead,
    Unknown,
}

impl ContainerState {
    fn parse(raw: &str) -> Self {
        match raw.trim().trim_matches('\'') {
            "created" => Self::Created,
            "restarting" => Self::Restarting,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }

    /// The container process is gone and will not come back on its own.
    pub fn is_defunct(&self) -> bool {
        matches!(self, Self::Exited | Self::Dead)
    }
}

#[derive(Debug, Clone)]
pub struct RunContainerOptions {
    pub image: String,
    pub host_port: u16,
    pub container_port: u16,
    pub name: String,
    pub env_vars: Vec<EnvVar>,
    pub network: Option<String>,
    pub hostname: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl RunContainerOptions {
    pub fn new(image: impl Into<String>, host_port: u16, name: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            host_port,
            container_port: crate::models::DEFAULT_CONTAINER_PORT,
            name: name.into(),
            env_vars: Vec::new(),
            network: None,
            hostname: None,
            labels: BTreeMap::new(),
        }
    }
}

/// The engine operations the orchestrator depends on. `DockerClient` is the
/// production implementation; tests drive the deploy lifecycle through a
/// fake.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn build_image(
        &self,
        repo_path: &Path,
        tag: &str,
        dockerfile_path: &str,
        build_args: &[EnvVar],
        labels: &BTreeMap<String, String>,
    ) -> EngineOutput;

    async fn pull_image(&self, image: &str) -> EngineOutput;

    async fn run_container(&self, options: RunContainerOptions) -> RunOutput;

    /// Best-effort stop + remove; a missing container is not an error.
    async fn stop_container(&self, name_or_id: &str);

    async fn container_state(&self, name_or_id: &str) -> ContainerState;

    async fn wait_for_healthy(
        &self,
        container_id: &str,
        host_port: u16,
        health_path: Option<&str>,
        timeout_seconds: u64,
    ) -> bool;

    /// First host port in `[start, end)` not published by a live container.
    /// Advisory only: two concurrent callers can get the same value, the
    /// loser fails at container start.
    async fn available_port(&self, start: u16, end: u16) -> Result<u16, String>;

    /// Idempotent create.
    async fn create_network(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), String>;

    /// Best-effort remove; "in use" and "not found" are swallowed.
    async fn remove_network(&self, name: &str);
}

/// Exec-based client for the docker (or compatible) CLI.
#[derive(Debug, Clone)]
pub struct DockerClient {
    program: String,
}

impl Default for DockerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerClient {
    pub fn new() -> Self {
        Self {
            program: "docker".to_string(),
        }
    }

    /// Point the client at a different engine binary, e.g. `podman`.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn from_settings(settings: &crate::configuration::ContainerSettings) -> Self {
        Self::with_program(settings.engine.clone())
    }

    pub async fn is_available(&self) -> bool {
        self.exec(["--version"]).await.map(|o| o.status.success()).unwrap_or(false)
    }

    pub(crate) async fn exec<I, S>(&self, args: I) -> Result<Output, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        tokio::process::Command::new(&self.program)
            .args(args)
            .output()
            .await
            .map_err(|err| format!("failed to spawn {}: {}", self.program, err))
    }

    /// Run a subcommand, returning trimmed stdout on success and trimmed
    /// stderr (or the exit code) on failure.
    pub(crate) async fn exec_ok<I, S>(&self, args: I) -> Result<String, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.exec(args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.is_empty() {
                Err(format!(
                    "{} exited with code {}",
                    self.program,
                    output.status.code().unwrap_or(-1)
                ))
            } else {
                Err(stderr)
            }
        }
    }

    pub(crate) fn program(&self) -> &str {
        &self.program
    }
}

fn combined_log(output: &Output) -> String {
    let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
    log.push_str(&String::from_utf8_lossy(&output.stderr));
    log
}

/// Split a dockerfile path relative to the checkout into (build context,
/// dockerfile name). The dockerfile's parent directory is the context.
fn build_context(repo_path: &Path, dockerfile_path: &str) -> (PathBuf, String) {
    let dockerfile = Path::new(dockerfile_path);
    let file_name = dockerfile
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Dockerfile".to_string());
    let context = match dockerfile.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => repo_path.join(parent),
        _ => repo_path.to_path_buf(),
    };
    (context, file_name)
}

fn parse_published_ports(ps_output: &str) -> HashSet<u16> {
    PUBLISHED_PORT_RE
        .captures_iter(ps_output)
        .filter_map(|caps| caps.get(1))
        .filter_map(|m| m.as_str().parse::<u16>().ok())
        .collect()
}

async fn probe_ready(host_port: u16, health_path: Option<&str>) -> bool {
    match health_path {
        Some(path) => {
            let path = if path.starts_with('/') {
                path.to_string()
            } else {
                format!("/{}", path)
            };
            let url = format!("http://127.0.0.1:{}{}", host_port, path);
            match reqwest::Client::new()
                .get(&url)
                .timeout(PROBE_TIMEOUT)
                .send()
                .await
            {
                Ok(res) => res.status().as_u16() < 400,
                Err(_) => false,
            }
        }
        None => {
            let connect = tokio::net::TcpStream::connect(("127.0.0.1", host_port));
            matches!(tokio::time::timeout(PROBE_TIMEOUT, connect).await, Ok(Ok(_)))
        }
    }
}

#[async_trait]
impl ContainerEngine for DockerClient {
    #[tracing::instrument(name = "Build image", skip(self, build_args, labels))]
    async fn build_image(
        &self,
        repo_path: &Path,
        tag: &str,
        dockerfile_path: &str,
        build_args: &[EnvVar],
        labels: &BTreeMap<String, String>,
    ) -> EngineOutput {
        let (context, file_name) = build_context(repo_path, dockerfile_path);

        let mut args: Vec<String> = vec![
            "build".into(),
            "-t".into(),
            tag.into(),
            "-f".into(),
            file_name,
        ];
        for var in build_args {
            args.push("--build-arg".into());
            args.push(format!("{}={}", var.key, var.value));
        }
        for (key, value) in labels {
            args.push("--label".into());
            args.push(format!("{}={}", key, value));
        }
        args.push(".".into());

        let output = tokio::process::Command::new(&self.program)
            .args(&args)
            .current_dir(&context)
            .output()
            .await;

        match output {
            Ok(output) => {
                let log = combined_log(&output);
                if output.status.success() {
                    EngineOutput {
                        success: true,
                        log,
                        error: None,
                    }
                } else {
                    EngineOutput {
                        success: false,
                        log,
                        error: Some(format!(
                            "Build exited with code {}",
                            output.status.code().unwrap_or(-1)
                        )),
                    }
                }
            }
            Err(err) => EngineOutput {
                success: false,
                log: String::new(),
                error: Some(format!("failed to spawn {}: {}", self.program, err)),
            },
        }
    }

    #[tracing::instrument(name = "Pull image", skip(self))]
    async fn pull_image(&self, image: &str) -> EngineOutput {
        match self.exec(["pull", image]).await {
            Ok(output) => {
                let log = combined_log(&output);
                if output.status.success() {
                    EngineOutput {
                        success: true,
                        log,
                        error: None,
                    }
                } else {
                    EngineOutput {
                        success: false,
                        log,
                        error: Some(format!(
                            "Pull exited with code {}",
                            output.status.code().unwrap_or(-1)
                        )),
                    }
                }
            }
            Err(err) => EngineOutput {
                success: false,
                log: String::new(),
                error: Some(err),
            },
        }
    }

    #[tracing::instrument(name = "Run container", skip(self, options), fields(name = %options.name, image = %options.image))]
    async fn run_container(&self, options: RunContainerOptions) -> RunOutput {
        // a stale container from an interrupted attempt may still hold the name
        self.stop_container(&options.name).await;

        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            options.name.clone(),
            "--restart".into(),
            RESTART_POLICY.into(),
            "--log-opt".into(),
            format!("max-size={}", LOG_MAX_SIZE),
            "--log-opt".into(),
            format!("max-file={}", LOG_MAX_FILE),
            "-p".into(),
            format!("{}:{}", options.host_port, options.container_port),
        ];
        if let Some(network) = &options.network {
            args.push("--network".into());
            args.push(network.clone());
        }
        if let Some(hostname) = &options.hostname {
            args.push("--hostname".into());
            args.push(hostname.clone());
        }
        for (key, value) in &options.labels {
            args.push("--label".into());
            args.push(format!("{}={}", key, value));
        }
        // PORT first so an explicit env var overrides it (last flag wins)
        args.push("-e".into());
        args.push(format!("PORT={}", options.container_port));
        for var in &options.env_vars {
            args.push("-e".into());
            args.push(format!("{}={}", var.key, var.value));
        }
        args.push(options.image.clone());

        match self.exec_ok(&args).await {
            Ok(container_id) => RunOutput {
                success: true,
                container_id,
                error: None,
            },
            Err(err) => RunOutput {
                success: false,
                container_id: String::new(),
                error: Some(err),
            },
        }
    }

    async fn stop_container(&self, name_or_id: &str) {
        if let Err(err) = self.exec_ok(["stop", name_or_id]).await {
            tracing::debug!(container = name_or_id, error = %err, "stop skipped");
        }
        if let Err(err) = self.exec_ok(["rm", name_or_id]).await {
            tracing::debug!(container = name_or_id, error = %err, "rm skipped");
        }
    }

    async fn container_state(&self, name_or_id: &str) -> ContainerState {
        match self
            .exec_ok(["inspect", "--format", "{{.State.Status}}", name_or_id])
            .await
        {
            Ok(raw) => ContainerState::parse(&raw),
            Err(_) => ContainerState::Unknown,
        }
    }

    async fn wait_for_healthy(
        &self,
        container_id: &str,
        host_port: u16,
        health_path: Option<&str>,
        timeout_seconds: u64,
    ) -> bool {
        for _ in 0..timeout_seconds.max(1) {
            let state = self.container_state(container_id).await;
            if state.is_defunct() {
                tracing::warn!(container = container_id, ?state, "container died before becoming ready");
                return false;
            }
            if state == ContainerState::Running && probe_ready(host_port, health_path).await {
                return true;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        tracing::warn!(container = container_id, timeout_seconds, "readiness probe timed out");
        false
    }

    async fn available_port(&self, start: u16, end: u16) -> Result<u16, String> {
        let used = match self.exec_ok(["ps", "--format", "{{.Ports}}"]).await {
            Ok(output) => parse_published_ports(&output),
            Err(err) => {
                tracing::debug!(error = %err, "port scan failed, assuming none published");
                HashSet::new()
            }
        };

        (start..end)
            .find(|port| !used.contains(port))
            .ok_or_else(|| format!("No available ports in range {}..{}", start, end))
    }

    async fn create_network(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), String> {
        if self.exec_ok(["network", "inspect", name]).await.is_ok() {
            return Ok(());
        }
        let mut args: Vec<String> = vec!["network".into(), "create".into()];
        for (key, value) in labels {
            args.push("--label".into());
            args.push(format!("{}={}", key, value));
        }
        args.push(name.into());
        self.exec_ok(&args).await.map(|_| ())
    }

    async fn remove_network(&self, name: &str) {
        if let Err(err) = self.exec_ok(["network", "rm", name]).await {
            tracing::debug!(network = name, error = %err, "network rm skipped");
        }
    }
}

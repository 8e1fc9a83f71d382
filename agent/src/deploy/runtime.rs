//! Container runtime operations over the docker CLI

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::deploy::process::{CommandSpec, ProcessOutput, ProcessRunner};
use crate::errors::AgentError;

/// State of a container as reported by the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub created: DateTime<Utc>,
    pub status: String,
    pub running: bool,
    /// `healthy`, `unhealthy`, `starting`; `None` without a health probe
    pub health: Option<String>,
    /// container port → host port
    pub host_ports: HashMap<u16, u16>,
    pub labels: HashMap<String, String>,
}

impl ContainerInfo {
    pub fn host_port_for(&self, container_port: u16) -> Option<u16> {
        self.host_ports.get(&container_port).copied()
    }

    pub fn is_healthy(&self) -> bool {
        self.health.as_deref() == Some("healthy")
    }
}

/// Health probe the runtime runs inside the container
#[derive(Debug, Clone)]
pub struct HealthProbe {
    pub command: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
    pub start_period: Duration,
}

impl HealthProbe {
    /// HTTP probe against the in-container listen port
    pub fn http(container_port: u16, path: &str, interval: Duration) -> Self {
        let url = format!("http://localhost:{}{}", container_port, path);
        Self {
            command: format!(
                "curl -fsS {url} >/dev/null || wget -q -O /dev/null {url} || exit 1",
                url = url
            ),
            interval,
            timeout: Duration::from_secs(3),
            retries: 3,
            start_period: Duration::from_secs(10),
        }
    }
}

/// Launch parameters for a new container
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    /// (host port, container port)
    pub ports: Vec<(u16, u16)>,
    pub expose: Vec<u16>,
    pub env_file: Option<PathBuf>,
    pub labels: Vec<(String, String)>,
    pub network: Option<String>,
    pub restart: Option<String>,
    pub health: Option<HealthProbe>,
}

impl RunSpec {
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.name.clone(),
        ];
        if let Some(restart) = &self.restart {
            args.extend(["--restart".to_string(), restart.clone()]);
        }
        if let Some(network) = &self.network {
            args.extend(["--network".to_string(), network.clone()]);
        }
        for (host, container) in &self.ports {
            args.extend(["-p".to_string(), format!("{}:{}", host, container)]);
        }
        for port in &self.expose {
            args.extend(["--expose".to_string(), port.to_string()]);
        }
        if let Some(env_file) = &self.env_file {
            args.extend(["--env-file".to_string(), env_file.display().to_string()]);
        }
        for (key, value) in &self.labels {
            args.extend(["--label".to_string(), format!("{}={}", key, value)]);
        }
        if let Some(probe) = &self.health {
            args.extend([
                "--health-cmd".to_string(),
                probe.command.clone(),
                "--health-interval".to_string(),
                format!("{}s", probe.interval.as_secs().max(1)),
                "--health-timeout".to_string(),
                format!("{}s", probe.timeout.as_secs().max(1)),
                "--health-retries".to_string(),
                probe.retries.to_string(),
                "--health-start-period".to_string(),
                format!("{}s", probe.start_period.as_secs()),
            ]);
        }
        args.push(self.image.clone());
        args
    }
}

/// Container runtime operations used by the rollout
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Fail with `PrerequisiteError` when the runtime is unreachable
    async fn ping(&self) -> Result<(), AgentError>;

    /// All containers (any state) whose name contains `prefix`
    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<ContainerInfo>, AgentError>;

    /// `None` when no such container exists
    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>, AgentError>;

    /// Start a new container, returning its ID
    async fn run(&self, spec: &RunSpec) -> Result<String, AgentError>;

    async fn start(&self, name: &str) -> Result<(), AgentError>;

    /// `NotFound` when the container does not exist
    async fn stop(&self, name: &str) -> Result<(), AgentError>;

    /// Force-remove; `NotFound` when the container does not exist
    async fn remove(&self, name: &str) -> Result<(), AgentError>;

    /// Capture the container filesystem as an image
    async fn commit(&self, name: &str, image_ref: &str) -> Result<(), AgentError>;

    async fn remove_image(&self, image_ref: &str) -> Result<(), AgentError>;

    async fn logs_tail(&self, name: &str, lines: u32) -> Result<String, AgentError>;

    async fn port_bindings(&self, name: &str) -> Result<String, AgentError>;

    async fn network_exists(&self, network: &str) -> Result<bool, AgentError>;

    async fn create_network(&self, network: &str) -> Result<(), AgentError>;

    async fn inspect_network(&self, network: &str) -> Result<String, AgentError>;
}

/// [`ContainerRuntime`] backed by the docker CLI
pub struct DockerCli {
    runner: Arc<dyn ProcessRunner>,
    bin: String,
    timeout: Duration,
}

impl DockerCli {
    pub fn new(runner: Arc<dyn ProcessRunner>, bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            bin: bin.into(),
            timeout,
        }
    }

    fn command<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(&self.bin).args(args).timeout(self.timeout)
    }

    async fn exec<I, S>(&self, args: I) -> Result<ProcessOutput, AgentError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = self.command(args);
        let output = self.runner.run(&spec).await?;
        if !output.success() && is_missing(&output) {
            return Err(AgentError::NotFound(output.stderr_excerpt()));
        }
        output.into_result(&spec.display())
    }
}

fn is_missing(output: &ProcessOutput) -> bool {
    let stderr = output.stderr.to_lowercase();
    stderr.contains("no such container") || stderr.contains("no such object")
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn ping(&self) -> Result<(), AgentError> {
        self.exec(["version", "--format", "{{.Server.Version}}"])
            .await
            .map(|_| ())
            .map_err(|e| AgentError::PrerequisiteError(format!("container runtime unavailable: {}", e)))
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<ContainerInfo>, AgentError> {
        let output = self
            .exec([
                "ps".to_string(),
                "-a".to_string(),
                "--filter".to_string(),
                format!("name={}", prefix),
                "--format".to_string(),
                "{{.Names}}".to_string(),
            ])
            .await?;

        let mut containers = Vec::new();
        for name in output.stdout.lines().map(str::trim).filter(|n| !n.is_empty()) {
            // Removed between listing and inspection
            if let Some(info) = self.inspect(name).await? {
                containers.push(info);
            }
        }
        Ok(containers)
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>, AgentError> {
        match self.exec(["inspect", "--type", "container", name]).await {
            Ok(output) => parse_inspect(&output.stdout).map(|mut v| v.pop()),
            Err(AgentError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn run(&self, spec: &RunSpec) -> Result<String, AgentError> {
        debug!("Starting container {} from {}", spec.name, spec.image);
        let output = self
            .exec(spec.to_args())
            .await
            .map_err(|e| AgentError::StartError(e.to_string()))?;
        Ok(output.stdout.trim().to_string())
    }

    async fn start(&self, name: &str) -> Result<(), AgentError> {
        self.exec(["start", name]).await.map(|_| ())
    }

    async fn stop(&self, name: &str) -> Result<(), AgentError> {
        self.exec(["stop", "-t", "10", name]).await.map(|_| ())
    }

    async fn remove(&self, name: &str) -> Result<(), AgentError> {
        self.exec(["rm", "-f", name]).await.map(|_| ())
    }

    async fn commit(&self, name: &str, image_ref: &str) -> Result<(), AgentError> {
        self.exec(["commit", name, image_ref]).await.map(|_| ())
    }

    async fn remove_image(&self, image_ref: &str) -> Result<(), AgentError> {
        self.exec(["rmi", "-f", image_ref]).await.map(|_| ())
    }

    async fn logs_tail(&self, name: &str, lines: u32) -> Result<String, AgentError> {
        let output = self
            .exec(["logs".to_string(), "--tail".to_string(), lines.to_string(), name.to_string()])
            .await?;
        Ok(format!("{}{}", output.stdout, output.stderr))
    }

    async fn port_bindings(&self, name: &str) -> Result<String, AgentError> {
        Ok(self.exec(["port", name]).await?.stdout)
    }

    async fn network_exists(&self, network: &str) -> Result<bool, AgentError> {
        let output = self.runner.run(&self.command(["network", "inspect", network])).await?;
        Ok(output.success())
    }

    async fn create_network(&self, network: &str) -> Result<(), AgentError> {
        self.exec(["network", "create", network]).await.map(|_| ())
    }

    async fn inspect_network(&self, network: &str) -> Result<String, AgentError> {
        let output = self
            .exec([
                "network",
                "inspect",
                "--format",
                "{{.Name}} {{.Driver}} {{range $id, $c := .Containers}}{{$c.Name}}={{$c.IPv4Address}} {{end}}",
                network,
            ])
            .await?;
        Ok(output.stdout.trim().to_string())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectEntry {
    id: String,
    name: String,
    created: DateTime<Utc>,
    state: InspectState,
    config: InspectConfig,
    network_settings: InspectNetwork,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
    running: bool,
    #[serde(default)]
    health: Option<InspectHealth>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHealth {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    image: String,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetwork {
    #[serde(default)]
    ports: Option<HashMap<String, Option<Vec<InspectBinding>>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectBinding {
    #[serde(default)]
    host_port: String,
}

/// Parse `docker inspect` output
pub fn parse_inspect(stdout: &str) -> Result<Vec<ContainerInfo>, AgentError> {
    let entries: Vec<InspectEntry> = serde_json::from_str(stdout)?;
    Ok(entries.into_iter().map(ContainerInfo::from).collect())
}

impl From<InspectEntry> for ContainerInfo {
    fn from(entry: InspectEntry) -> Self {
        let mut host_ports = HashMap::new();
        for (key, bindings) in entry.network_settings.ports.unwrap_or_default() {
            let Some(container_port) = key.split('/').next().and_then(|p| p.parse::<u16>().ok())
            else {
                continue;
            };
            let host_port = bindings
                .unwrap_or_default()
                .iter()
                .find_map(|b| b.host_port.parse::<u16>().ok());
            if let Some(host_port) = host_port {
                host_ports.insert(container_port, host_port);
            }
        }

        ContainerInfo {
            id: entry.id,
            name: entry.name.trim_start_matches('/').to_string(),
            image: entry.config.image,
            created: entry.created,
            status: entry.state.status,
            running: entry.state.running,
            health: entry.state.health.map(|h| h.status),
            host_ports,
            labels: entry.config.labels.unwrap_or_default(),
        }
    }
}

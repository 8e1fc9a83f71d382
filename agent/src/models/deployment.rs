//! Deployment models

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::AgentError;
use crate::filesys::dir::Dir;
use crate::utils::SecretToken;

/// Application type of the source being deployed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppType {
    #[serde(alias = "nodejs")]
    Node,
    Python,
    Go,
    Rust,
    Static,
    #[serde(alias = "docker")]
    Dockerfile,
    #[serde(alias = "postgresql")]
    Postgres,
    Mysql,
    Mariadb,
    Redis,
    #[serde(alias = "mongo")]
    Mongodb,
}

impl AppType {
    /// Datastores are provisioned by a separate collaborator, never rolled out here
    pub fn is_datastore(&self) -> bool {
        matches!(
            self,
            AppType::Postgres | AppType::Mysql | AppType::Mariadb | AppType::Redis | AppType::Mongodb
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AppType::Node => "node",
            AppType::Python => "python",
            AppType::Go => "go",
            AppType::Rust => "rust",
            AppType::Static => "static",
            AppType::Dockerfile => "dockerfile",
            AppType::Postgres => "postgres",
            AppType::Mysql => "mysql",
            AppType::Mariadb => "mariadb",
            AppType::Redis => "redis",
            AppType::Mongodb => "mongodb",
        }
    }

    /// Detect the application type from marker files in a source tree
    pub async fn detect(source: &Dir) -> Option<AppType> {
        const MARKERS: &[(&str, AppType)] = &[
            ("Dockerfile", AppType::Dockerfile),
            ("package.json", AppType::Node),
            ("requirements.txt", AppType::Python),
            ("pyproject.toml", AppType::Python),
            ("Pipfile", AppType::Python),
            ("go.mod", AppType::Go),
            ("Cargo.toml", AppType::Rust),
            ("index.html", AppType::Static),
        ];

        for (marker, app_type) in MARKERS {
            if source.contains(marker).await {
                return Some(*app_type);
            }
        }
        None
    }
}

impl fmt::Display for AppType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Blue/green label distinguishing the two instances of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    Blue,
    Green,
}

impl Color {
    pub fn complement(&self) -> Color {
        match self {
            Color::Blue => Color::Green,
            Color::Green => Color::Blue,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Color::Blue => "blue",
            Color::Green => "green",
        }
    }

    /// Color for the next rollout given the color currently serving
    ///
    /// A legacy undecorated container counts as "no color", so the next
    /// rollout starts at blue.
    pub fn next_after(current: Option<Color>) -> Color {
        current.map(|c| c.complement()).unwrap_or(Color::Blue)
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Container label naming the owning service
pub const SERVICE_LABEL: &str = "rollout.service";

/// Container name for a service and color
pub fn container_name(service_name: &str, color: Color) -> String {
    format!("{}-{}", service_name, color)
}

/// Classify a runtime container name against a service
///
/// `Some(Some(color))` for `<service>-<color>`, `Some(None)` for the legacy
/// undecorated `<service>`, and `None` for anything else.
pub fn classify_container_name(service_name: &str, name: &str) -> Option<Option<Color>> {
    let name = name.trim_start_matches('/');
    if name == service_name {
        return Some(None);
    }
    match name.strip_prefix(service_name)?.strip_prefix('-')? {
        "blue" => Some(Some(Color::Blue)),
        "green" => Some(Some(Color::Green)),
        _ => None,
    }
}

/// An inbound deployment request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRequest {
    /// Unique per attempt
    pub deployment_id: String,

    pub service_name: String,

    pub environment: String,

    /// Auto-detected from the source tree when absent
    #[serde(default)]
    pub app_type: Option<AppType>,

    pub repo_url: String,

    pub branch: String,

    /// Pin the fetch to a single commit
    #[serde(default)]
    pub commit_sha: Option<String>,

    /// Short-lived credential for the source fetch
    #[serde(default, skip_serializing)]
    pub git_token: Option<SecretToken>,

    /// Short-lived credential for the secret fetch
    #[serde(default, skip_serializing)]
    pub deploy_token: Option<SecretToken>,

    #[serde(default)]
    pub domain: Option<String>,

    /// Exposed non-primary container ports
    #[serde(default)]
    pub additional_ports: Vec<u16>,

    #[serde(default)]
    pub job_id: Option<String>,

    #[serde(default)]
    pub project_id: Option<String>,
}

impl DeploymentRequest {
    /// Parse and validate a raw request payload
    pub fn from_value(value: serde_json::Value) -> Result<Self, AgentError> {
        let request: DeploymentRequest = serde_json::from_value(value)
            .map_err(|e| AgentError::ValidationError(e.to_string()))?;
        request.validate()?;
        Ok(request)
    }

    /// Check required fields and shapes; no side effects
    pub fn validate(&self) -> Result<(), AgentError> {
        let required = [
            ("deploymentId", &self.deployment_id),
            ("serviceName", &self.service_name),
            ("environment", &self.environment),
            ("repoUrl", &self.repo_url),
            ("branch", &self.branch),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(AgentError::ValidationError(format!("{} is required", field)));
            }
        }

        // Names a working directory and an image tag
        let id_ok = self
            .deployment_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            && self.deployment_id.len() <= 128;
        if !id_ok {
            return Err(AgentError::ValidationError(format!(
                "deploymentId '{}' may only contain letters, digits, '-' and '_'",
                self.deployment_id
            )));
        }

        if !is_dns_label(&self.service_name) {
            return Err(AgentError::ValidationError(format!(
                "serviceName '{}' must be a lowercase DNS label",
                self.service_name
            )));
        }

        // `<service>-<color>` would collide with another service's container
        if let Some(color) = [Color::Blue, Color::Green]
            .into_iter()
            .find(|c| self.service_name.ends_with(&format!("-{}", c)))
        {
            return Err(AgentError::ValidationError(format!(
                "serviceName '{}' may not end in '-{}'",
                self.service_name, color
            )));
        }

        if !is_dns_label(&self.environment) {
            return Err(AgentError::ValidationError(format!(
                "environment '{}' must be a lowercase DNS label",
                self.environment
            )));
        }

        if let Some(app_type) = self.app_type {
            if app_type.is_datastore() {
                return Err(AgentError::ValidationError(format!(
                    "{} deployments are handled by the datastore provisioner",
                    app_type
                )));
            }
        }

        if let Some(port) = self.additional_ports.iter().find(|p| **p == 0) {
            return Err(AgentError::ValidationError(format!(
                "additionalPorts contains invalid port {}",
                port
            )));
        }

        if let Some(sha) = &self.commit_sha {
            if sha.is_empty() || !sha.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(AgentError::ValidationError(format!(
                    "commitSha '{}' is not a hex revision",
                    sha
                )));
            }
        }

        Ok(())
    }

    /// Lock key identifying the logical service
    pub fn lock_key(&self) -> String {
        lock_key(&self.service_name, &self.environment)
    }
}

/// `serviceName:environment`
pub fn lock_key(service_name: &str, environment: &str) -> String {
    format!("{}:{}", service_name, environment)
}

fn is_dns_label(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 63
        && !value.starts_with('-')
        && !value.ends_with('-')
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// A container discovered for, or started by, a rollout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedContainer {
    /// Runtime-assigned ID
    pub id: String,

    /// `serviceName-color`, or the bare service name for legacy containers
    pub name: String,

    /// `None` for legacy undecorated containers
    pub color: Option<Color>,

    pub host_port: Option<u16>,

    pub container_port: u16,

    /// Runtime state (`running`, `exited`, ...)
    pub status: String,

    pub created: DateTime<Utc>,
}

impl TrackedContainer {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

/// Persisted service → host port mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAllocation {
    pub service_name: String,
    pub host_port: u16,
    pub allocated_at: DateTime<Utc>,
}

/// Snapshot record written before the old container is touched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    pub container_id: String,
    pub container_name: String,
    pub backup_image_ref: String,
    #[serde(default)]
    pub host_port: Option<u16>,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of one health poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub message: String,
}

impl HealthCheckResult {
    pub fn healthy(message: impl Into<String>) -> Self {
        Self {
            healthy: true,
            message: message.into(),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: message.into(),
        }
    }
}

/// Status reported on the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    InProgress,
    Success,
    Failed,
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeploymentStatus::InProgress)
    }
}

/// Status event payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub deployment_id: String,
    pub status: DeploymentStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// Out-of-band completion notice correlated by job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCompletion {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub deployment_id: String,
    pub status: DeploymentStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// Frames exchanged on the control channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Inbound request; validated by the orchestrator
    Deploy(serde_json::Value),
    Status(StatusEvent),
    Ping,
    Pong,
}

/// Result of a successful rollout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentOutcome {
    pub deployment_id: String,
    pub service_name: String,
    pub color: Color,
    pub container_name: String,
    pub host_port: u16,
    pub domain: String,
    /// The routing front end listed the new route
    pub route_confirmed: bool,
    pub message: String,
}

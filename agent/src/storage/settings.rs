//! Settings file management

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;
use crate::utils::SecretToken;

/// Agent settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON logs on stdout
    #[serde(default)]
    pub log_json: bool,

    /// Also write rolling log files under the storage layout
    #[serde(default)]
    pub log_to_file: bool,

    /// Backend configuration
    #[serde(default)]
    pub backend: BackendSettings,

    /// Control channel configuration
    #[serde(default)]
    pub control_channel: ControlChannelSettings,

    /// Local HTTP server configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// Host port allocation
    #[serde(default)]
    pub ports: PortSettings,

    /// Container health verification
    #[serde(default)]
    pub health_check: HealthCheckSettings,

    /// Traffic switch polling
    #[serde(default)]
    pub traffic: TrafficSettings,

    /// Routing front end
    #[serde(default)]
    pub routing: RoutingSettings,

    /// Container runtime and external tooling
    #[serde(default)]
    pub runtime: RuntimeSettings,
}

fn default_true() -> bool {
    true
}

/// Backend API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    /// Base URL for the backend API
    #[serde(default = "default_backend_url")]
    pub base_url: String,

    /// Agent credential presented to the backend
    #[serde(default, skip_serializing)]
    pub token: Option<SecretToken>,
}

fn default_backend_url() -> String {
    "http://localhost:8000/api/v1".to_string()
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            base_url: default_backend_url(),
            token: None,
        }
    }
}

/// Control channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlChannelSettings {
    /// Connect to the backend control channel
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Websocket path appended to the backend URL
    #[serde(default = "default_ws_path")]
    pub path: String,

    /// Port the control channel is served on, kept out of the allocation pool
    #[serde(default = "default_control_port")]
    pub port: u16,

    /// Heartbeat interval in seconds
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Initial reconnect delay in seconds
    #[serde(default = "default_reconnect_secs")]
    pub reconnect_base_secs: u64,

    /// Maximum reconnect delay in seconds
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,
}

fn default_ws_path() -> String {
    "/agent/ws".to_string()
}

fn default_control_port() -> u16 {
    8000
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_reconnect_secs() -> u64 {
    2
}

fn default_reconnect_max_secs() -> u64 {
    60
}

impl Default for ControlChannelSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_ws_path(),
            port: default_control_port(),
            heartbeat_secs: default_heartbeat_secs(),
            reconnect_base_secs: default_reconnect_secs(),
            reconnect_max_secs: default_reconnect_max_secs(),
        }
    }
}

/// Local HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Enable the local API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Host to bind to
    #[serde(default = "default_server_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    7070
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

/// Host port allocation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortSettings {
    /// First port of the allocation range
    #[serde(default = "default_range_start")]
    pub range_start: u16,

    /// Last port of the allocation range (inclusive)
    #[serde(default = "default_range_end")]
    pub range_end: u16,

    /// Extra ports never handed out
    #[serde(default)]
    pub reserved: Vec<u16>,

    /// Port applications listen on inside their container
    #[serde(default = "default_container_port")]
    pub container_port: u16,
}

fn default_range_start() -> u16 {
    3001
}

fn default_range_end() -> u16 {
    9999
}

fn default_container_port() -> u16 {
    8080
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            range_start: default_range_start(),
            range_end: default_range_end(),
            reserved: Vec::new(),
            container_port: default_container_port(),
        }
    }
}

/// Health check settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckSettings {
    /// Number of health polls before giving up
    #[serde(default = "default_health_retries")]
    pub retries: u32,

    /// Seconds between health polls
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    /// Probe endpoint inside the container
    #[serde(default = "default_probe_path")]
    pub probe_path: String,

    /// Attempts per routed-domain probe stage
    #[serde(default = "default_health_retries")]
    pub route_retries: u32,

    /// Initial backoff for routed-domain probes in seconds
    #[serde(default = "default_route_base_delay")]
    pub route_base_delay_secs: u64,
}

fn default_health_retries() -> u32 {
    5
}

fn default_health_interval() -> u64 {
    5
}

fn default_probe_path() -> String {
    "/health".to_string()
}

fn default_route_base_delay() -> u64 {
    2
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            retries: default_health_retries(),
            interval_secs: default_health_interval(),
            probe_path: default_probe_path(),
            route_retries: default_health_retries(),
            route_base_delay_secs: default_route_base_delay(),
        }
    }
}

/// Traffic switch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficSettings {
    /// Route listing polls before reporting unconfirmed
    #[serde(default = "default_traffic_retries")]
    pub retries: u32,

    /// Seconds between route listing polls
    #[serde(default = "default_traffic_interval")]
    pub interval_secs: u64,

    /// Seconds to wait after registration before polling
    #[serde(default = "default_settle_delay")]
    pub settle_delay_secs: u64,

    /// Probe the new container once more before registering it
    #[serde(default = "default_true")]
    pub final_probe: bool,
}

fn default_traffic_retries() -> u32 {
    5
}

fn default_traffic_interval() -> u64 {
    2
}

fn default_settle_delay() -> u64 {
    3
}

impl Default for TrafficSettings {
    fn default() -> Self {
        Self {
            retries: default_traffic_retries(),
            interval_secs: default_traffic_interval(),
            settle_delay_secs: default_settle_delay(),
            final_probe: true,
        }
    }
}

/// Routing front end settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingSettings {
    /// Front end API base URL; routes are kept in memory when unset
    #[serde(default)]
    pub api_url: Option<String>,

    /// Bearer credential for the front end API
    #[serde(default, skip_serializing)]
    pub token: Option<SecretToken>,

    /// Base domain services are published under
    #[serde(default = "default_base_domain")]
    pub base_domain: String,

    /// Host address the front end uses to reach containers
    #[serde(default = "default_target_host")]
    pub target_host: String,

    /// Name of the front end container, used for diagnostics
    #[serde(default)]
    pub front_end_container: Option<String>,

    /// Probe the public domain after switching traffic
    #[serde(default)]
    pub verify_domain: bool,
}

fn default_base_domain() -> String {
    "localhost".to_string()
}

fn default_target_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            api_url: None,
            token: None,
            base_domain: default_base_domain(),
            target_host: default_target_host(),
            front_end_container: None,
            verify_domain: false,
        }
    }
}

/// Container runtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Container runtime binary
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,

    /// Version control binary
    #[serde(default = "default_git_bin")]
    pub git_bin: String,

    /// Network every service container joins
    #[serde(default)]
    pub network: Option<String>,

    /// Default timeout for runtime commands in seconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Timeout for image builds in seconds
    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,

    /// Timeout for source fetches in seconds
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
}

fn default_docker_bin() -> String {
    "docker".to_string()
}

fn default_git_bin() -> String {
    "git".to_string()
}

fn default_command_timeout() -> u64 {
    60
}

fn default_build_timeout() -> u64 {
    1200
}

fn default_fetch_timeout() -> u64 {
    300
}

impl RuntimeSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            docker_bin: default_docker_bin(),
            git_bin: default_git_bin(),
            network: None,
            command_timeout_secs: default_command_timeout(),
            build_timeout_secs: default_build_timeout(),
            fetch_timeout_secs: default_fetch_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults_from_empty_json() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.ports.container_port, 8080);
        assert_eq!(settings.health_check.retries, 5);
        assert!(settings.routing.api_url.is_none());
        assert!(settings.control_channel.enabled);
    }

    #[test]
    fn test_settings_secret_not_serialized() {
        let settings: Settings = serde_json::from_str(
            r#"{"routing": {"api_url": "http://proxy:2019", "token": "s3cr3t"}}"#,
        )
        .unwrap();
        assert!(settings.routing.token.is_some());

        let out = serde_json::to_string(&settings).unwrap();
        assert!(!out.contains("s3cr3t"));
    }
}

//! Application configuration options

use std::time::Duration;

use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::utils::CooldownOptions;
use crate::workers::control;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage layout paths
    pub layout: StorageLayout,

    /// Settings the collaborators are built from
    pub settings: Settings,

    /// Enable the control channel worker
    pub enable_control_channel: bool,

    /// Enable local HTTP server
    pub enable_server: bool,

    /// Server configuration
    pub server: ServerOptions,

    /// Control channel worker options
    pub control_channel: control::Options,
}

impl AppOptions {
    pub fn from_settings(settings: Settings, layout: StorageLayout) -> Self {
        let cc = &settings.control_channel;
        let control_channel = control::Options {
            path: cc.path.clone(),
            reconnect: CooldownOptions {
                base_delay: Duration::from_secs(cc.reconnect_base_secs),
                max_delay: Duration::from_secs(cc.reconnect_max_secs),
                multiplier: 2.0,
            },
            heartbeat_interval: Duration::from_secs(cc.heartbeat_secs.max(1)),
        };
        let server = ServerOptions {
            host: settings.server.host.clone(),
            port: settings.server.port,
        };

        Self {
            lifecycle: LifecycleOptions::default(),
            layout,
            enable_control_channel: cc.enabled,
            enable_server: settings.server.enabled,
            server,
            control_channel,
            settings,
        }
    }
}

/// Lifecycle options for the agent
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(120),
        }
    }
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7070,
        }
    }
}

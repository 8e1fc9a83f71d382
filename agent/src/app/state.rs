//! Application state management

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::deploy::builder::DockerImageBuilder;
use crate::deploy::health::{HealthCheckConfig, HealthCheckEngine, ReqwestProbe};
use crate::deploy::locks::DeploymentLocks;
use crate::deploy::orchestrator::{Collaborators, Orchestrator, OrchestratorSettings};
use crate::deploy::ports::{PortAllocator, PortAllocatorConfig, TcpPortProbe};
use crate::deploy::process::{ProcessRunner, TokioProcessRunner};
use crate::deploy::reporter::ChannelReporter;
use crate::deploy::runtime::{ContainerRuntime, DockerCli};
use crate::deploy::source::GitSourceFetcher;
use crate::deploy::traffic::{
    InMemoryRouteTable, RoutingApiClient, RoutingClient, TrafficConfig, TrafficSwitch,
};
use crate::errors::AgentError;
use crate::http::client::HttpClient;
use crate::http::secrets::BackendSecretFetcher;
use crate::models::deployment::ControlMessage;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Main application state
pub struct AppState {
    /// Rollout entry point shared by the control channel and the server
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    /// Initialize application state
    ///
    /// Also returns the receiving end of the status frame queue, which the
    /// control channel worker drains.
    pub async fn init(
        layout: &StorageLayout,
        settings: &Settings,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ControlMessage>), AgentError> {
        info!("Initializing application state...");
        layout.setup().await?;

        let runner: Arc<dyn ProcessRunner> = Arc::new(TokioProcessRunner);
        let runtime_settings = &settings.runtime;
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCli::new(
            Arc::clone(&runner),
            runtime_settings.docker_bin.clone(),
            runtime_settings.command_timeout(),
        ));

        // The agent's own listeners are never handed to services
        let agent_ports = [settings.control_channel.port, settings.server.port];
        let ports = Arc::new(PortAllocator::new(
            PortAllocatorConfig::from_settings(&settings.ports, &agent_ports),
            layout.ports_file(),
            Arc::new(TcpPortProbe),
        ));

        let routing_settings = &settings.routing;
        let (routing, front_end): (Arc<dyn RoutingClient>, bool) = match &routing_settings.api_url
        {
            Some(api_url) => (
                Arc::new(RoutingApiClient::new(api_url, routing_settings.token.clone())?),
                true,
            ),
            None => {
                warn!("No routing front end configured, keeping routes in memory");
                (
                    Arc::new(InMemoryRouteTable::new(routing_settings.base_domain.clone())),
                    false,
                )
            }
        };

        let probe = Arc::new(ReqwestProbe::new(PROBE_TIMEOUT)?);
        let mut health = HealthCheckEngine::new(
            Arc::clone(&runtime),
            probe.clone(),
            HealthCheckConfig::from_settings(&settings.health_check, &routing_settings.target_host),
        )
        .with_network(runtime_settings.network.clone());
        if front_end {
            health = health.with_front_end(
                Arc::clone(&routing),
                routing_settings.front_end_container.clone(),
            );
        }

        let traffic = TrafficSwitch::new(
            routing,
            probe,
            TrafficConfig::from_settings(
                &settings.traffic,
                &settings.health_check.probe_path,
                &routing_settings.target_host,
                &routing_settings.base_domain,
            ),
        );

        let http_client = HttpClient::new(&settings.backend.base_url)?;
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let mut reporter = ChannelReporter::new(frames_tx);
        if let Some(token) = &settings.backend.token {
            reporter = reporter.with_backend(http_client.clone(), token.clone());
        }

        let collaborators = Collaborators {
            runtime,
            ports,
            locks: Arc::new(DeploymentLocks::new()),
            health,
            traffic,
            source: Arc::new(GitSourceFetcher::new(
                Arc::clone(&runner),
                runtime_settings.git_bin.clone(),
                runtime_settings.fetch_timeout(),
            )),
            secrets: Arc::new(BackendSecretFetcher::new(http_client)),
            builder: Arc::new(DockerImageBuilder::new(
                runner,
                runtime_settings.docker_bin.clone(),
                runtime_settings.build_timeout(),
            )),
            reporter: Arc::new(reporter),
        };

        let orchestrator_settings = OrchestratorSettings {
            network: runtime_settings.network.clone(),
            verify_domain: routing_settings.verify_domain,
            ..OrchestratorSettings::new(layout.deployment_dir())
        };

        let state = Self {
            orchestrator: Arc::new(Orchestrator::new(orchestrator_settings, collaborators)),
        };
        Ok((state, frames_rx))
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<(), AgentError> {
        info!("Shutting down application state...");
        let held = self.orchestrator.locks().held();
        if !held.is_empty() {
            warn!("Deployments still running at shutdown: {:?}", held);
        }
        Ok(())
    }
}

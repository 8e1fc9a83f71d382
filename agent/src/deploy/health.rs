//! Container health verification
//!
//! A container counts as ready only once the runtime reports its health
//! probe as `healthy`. Being merely `running` is not enough.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::deploy::runtime::ContainerRuntime;
use crate::deploy::traffic::RoutingClient;
use crate::errors::AgentError;
use crate::models::deployment::{HealthCheckResult, TrackedContainer};
use crate::storage::settings::HealthCheckSettings;
use crate::utils::{calc_exp_backoff, CooldownOptions};

const LOG_TAIL_LINES: u32 = 50;

/// Retry budget for health verification
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Health polls before giving up
    pub retries: u32,

    /// Delay before each poll
    pub interval: Duration,

    /// Probe endpoint inside the container
    pub probe_path: String,

    /// Host the direct probe reaches published ports on
    pub direct_host: String,

    /// Attempts per routed-domain probe stage
    pub route_retries: u32,

    /// Backoff between routed-domain attempts
    pub route_backoff: CooldownOptions,
}

impl HealthCheckConfig {
    pub fn from_settings(settings: &HealthCheckSettings, direct_host: &str) -> Self {
        Self {
            retries: settings.retries,
            interval: Duration::from_secs(settings.interval_secs),
            probe_path: settings.probe_path.clone(),
            direct_host: direct_host.to_string(),
            route_retries: settings.route_retries,
            route_backoff: CooldownOptions {
                base_delay: Duration::from_secs(settings.route_base_delay_secs),
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
            },
        }
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self::from_settings(&HealthCheckSettings::default(), "127.0.0.1")
    }
}

/// Context gathered when a container never became healthy
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthDiagnostics {
    pub container_state: String,
    pub logs_tail: String,
    pub front_end_state: String,
    pub network_topology: String,
    pub port_bindings: String,
}

/// Minimal HTTP GET used for liveness probes
#[async_trait]
pub trait HttpProbe: Send + Sync {
    /// Response status code
    async fn get(&self, url: &str) -> Result<u16, AgentError>;
}

/// [`HttpProbe`] backed by reqwest
pub struct ReqwestProbe {
    client: reqwest::Client,
}

impl ReqwestProbe {
    pub fn new(timeout: Duration) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpProbe for ReqwestProbe {
    async fn get(&self, url: &str) -> Result<u16, AgentError> {
        let response = self.client.get(url).send().await?;
        Ok(response.status().as_u16())
    }
}

/// Polls containers until they report healthy
#[derive(Clone)]
pub struct HealthCheckEngine {
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn HttpProbe>,
    config: HealthCheckConfig,
    front_end: Option<Arc<dyn RoutingClient>>,
    front_end_container: Option<String>,
    network: Option<String>,
}

impl HealthCheckEngine {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn HttpProbe>,
        config: HealthCheckConfig,
    ) -> Self {
        Self {
            runtime,
            probe,
            config,
            front_end: None,
            front_end_container: None,
            network: None,
        }
    }

    /// Attach the routing front end used for routed-domain checks
    pub fn with_front_end(
        mut self,
        routing: Arc<dyn RoutingClient>,
        container: Option<String>,
    ) -> Self {
        self.front_end = Some(routing);
        self.front_end_container = container;
        self
    }

    /// Network inspected when gathering diagnostics
    pub fn with_network(mut self, network: Option<String>) -> Self {
        self.network = network;
        self
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// Block until the container is healthy or the retry budget runs out
    pub async fn perform_health_check(&self, container: &TrackedContainer) -> Result<(), AgentError> {
        info!(
            "Waiting for {} to become healthy ({} checks, {:?} apart)",
            container.name, self.config.retries, self.config.interval
        );

        let mut last = HealthCheckResult::unhealthy("not checked");
        for attempt in 1..=self.config.retries {
            tokio::time::sleep(self.config.interval).await;

            last = self.check_once(&container.name).await;
            if last.healthy {
                info!("{} is healthy after {} check(s)", container.name, attempt);
                return Ok(());
            }
            debug!(
                "Health check {}/{} for {}: {}",
                attempt, self.config.retries, container.name, last.message
            );
        }

        warn!("{} never became healthy: {}", container.name, last.message);
        let diagnostics = self.gather_diagnostics(&container.name).await;
        Err(AgentError::HealthCheckError {
            message: format!(
                "{} not healthy after {} checks: {}",
                container.name, self.config.retries, last.message
            ),
            diagnostics: Some(Box::new(diagnostics)),
        })
    }

    /// One binary health poll
    pub async fn check_once(&self, container_name: &str) -> HealthCheckResult {
        match self.runtime.inspect(container_name).await {
            Ok(Some(info)) if !info.running => {
                HealthCheckResult::unhealthy(format!("container is {}", info.status))
            }
            Ok(Some(info)) => match info.health.as_deref() {
                Some("healthy") => HealthCheckResult::healthy("healthy"),
                Some(status) => HealthCheckResult::unhealthy(format!("health status is {}", status)),
                None => HealthCheckResult::unhealthy("no health status reported"),
            },
            Ok(None) => HealthCheckResult::unhealthy("container not found"),
            Err(e) => HealthCheckResult::unhealthy(format!("inspect failed: {}", e)),
        }
    }

    /// Verify the service end to end through its public domain
    ///
    /// Probes the front end, then the container directly, then the routed
    /// domain. Diagnostics are attached when any stage runs out of retries.
    pub async fn verify_routed_domain(
        &self,
        container: &TrackedContainer,
        domain: &str,
    ) -> Result<(), AgentError> {
        if let Some(front_end) = &self.front_end {
            let front_end = Arc::clone(front_end);
            let liveness = self
                .retry_stage("front end liveness", || {
                    let front_end = Arc::clone(&front_end);
                    async move { front_end.health().await.map_err(|e| e.to_string()) }
                })
                .await;
            if let Err(message) = liveness {
                return Err(self.stage_failure(message, container).await);
            }
        }

        if let Some(host_port) = container.host_port {
            let url = format!(
                "http://{}:{}{}",
                self.config.direct_host, host_port, self.config.probe_path
            );
            if let Err(message) = self.probe_stage("direct probe", &url).await {
                return Err(self.stage_failure(message, container).await);
            }
        }

        let url = format!("https://{}{}", domain, self.config.probe_path);
        if let Err(message) = self.probe_stage("routed probe", &url).await {
            return Err(self.stage_failure(message, container).await);
        }

        info!("{} verified through {}", container.name, domain);
        Ok(())
    }

    async fn probe_stage(&self, stage: &str, url: &str) -> Result<(), String> {
        let probe = Arc::clone(&self.probe);
        let url = url.to_string();
        self.retry_stage(stage, || {
            let probe = Arc::clone(&probe);
            let url = url.clone();
            async move {
                match probe.get(&url).await {
                    Ok(status) if (200..400).contains(&status) => Ok(()),
                    Ok(status) => Err(format!("{} returned {}", url, status)),
                    Err(e) => Err(format!("{}: {}", url, e)),
                }
            }
        })
        .await
    }

    async fn retry_stage<F, Fut>(&self, stage: &str, mut attempt_fn: F) -> Result<(), String>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), String>>,
    {
        let mut last_error = String::new();
        for attempt in 0..self.config.route_retries {
            match attempt_fn().await {
                Ok(()) => {
                    debug!("{} passed on attempt {}", stage, attempt + 1);
                    return Ok(());
                }
                Err(e) => {
                    debug!("{} attempt {} failed: {}", stage, attempt + 1, e);
                    last_error = e;
                }
            }
            if attempt + 1 < self.config.route_retries {
                tokio::time::sleep(calc_exp_backoff(&self.config.route_backoff, attempt)).await;
            }
        }
        Err(format!(
            "{} failed after {} attempts: {}",
            stage, self.config.route_retries, last_error
        ))
    }

    async fn stage_failure(&self, message: String, container: &TrackedContainer) -> AgentError {
        warn!("Routed verification of {} failed: {}", container.name, message);
        AgentError::HealthCheckError {
            message,
            diagnostics: Some(Box::new(self.gather_diagnostics(&container.name).await)),
        }
    }

    /// Collect operator-facing context about a container
    pub async fn gather_diagnostics(&self, container_name: &str) -> HealthDiagnostics {
        let container_state = match self.runtime.inspect(container_name).await {
            Ok(Some(info)) => format!(
                "status={} running={} health={} image={}",
                info.status,
                info.running,
                info.health.as_deref().unwrap_or("none"),
                info.image
            ),
            Ok(None) => "container not found".to_string(),
            Err(e) => format!("unavailable: {}", e),
        };

        let logs_tail = self
            .runtime
            .logs_tail(container_name, LOG_TAIL_LINES)
            .await
            .unwrap_or_else(|e| format!("unavailable: {}", e));

        let mut front_end_state = Vec::new();
        if let Some(name) = &self.front_end_container {
            front_end_state.push(match self.runtime.inspect(name).await {
                Ok(Some(info)) => format!("{} {}", name, info.status),
                Ok(None) => format!("{} not found", name),
                Err(e) => format!("{} unavailable: {}", name, e),
            });
        }
        if let Some(front_end) = &self.front_end {
            front_end_state.push(match front_end.health().await {
                Ok(()) => "api reachable".to_string(),
                Err(e) => format!("api unreachable: {}", e),
            });
        }

        let network_topology = match &self.network {
            Some(network) => self
                .runtime
                .inspect_network(network)
                .await
                .unwrap_or_else(|e| format!("unavailable: {}", e)),
            None => "no shared network configured".to_string(),
        };

        let port_bindings = self
            .runtime
            .port_bindings(container_name)
            .await
            .unwrap_or_else(|e| format!("unavailable: {}", e));

        HealthDiagnostics {
            container_state,
            logs_tail,
            front_end_state: if front_end_state.is_empty() {
                "no front end configured".to_string()
            } else {
                front_end_state.join("; ")
            },
            network_topology,
            port_bindings,
        }
    }
}

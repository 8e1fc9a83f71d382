//! Traffic switching through the routing front end
//!
//! Registration is authoritative; confirmation through the route listing is
//! best-effort because the front end applies configuration eventually.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::deploy::health::HttpProbe;
use crate::errors::AgentError;
use crate::http::client::HttpClient;
use crate::models::deployment::TrackedContainer;
use crate::storage::settings::TrafficSettings;
use crate::utils::SecretToken;

/// Retry budget for route confirmation
#[derive(Debug, Clone)]
pub struct TrafficConfig {
    pub retries: u32,
    pub interval: Duration,
    pub settle_delay: Duration,
    pub final_probe: bool,
    /// Probe endpoint used for the pre-switch check
    pub probe_path: String,
    /// Host address the front end forwards to
    pub target_host: String,
    pub base_domain: String,
}

impl TrafficConfig {
    pub fn from_settings(
        settings: &TrafficSettings,
        probe_path: &str,
        target_host: &str,
        base_domain: &str,
    ) -> Self {
        Self {
            retries: settings.retries,
            interval: Duration::from_secs(settings.interval_secs),
            settle_delay: Duration::from_secs(settings.settle_delay_secs),
            final_probe: settings.final_probe,
            probe_path: probe_path.to_string(),
            target_host: target_host.to_string(),
            base_domain: base_domain.to_string(),
        }
    }

    /// `serviceName.baseDomain`
    pub fn expected_domain(&self, service_name: &str) -> String {
        format!("{}.{}", service_name, self.base_domain)
    }

    /// Address the front end should forward a container's traffic to
    pub fn target_address(&self, host_port: u16) -> String {
        format!("http://{}:{}", self.target_host, host_port)
    }
}

/// Response to a route registration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteRegistration {
    pub success: bool,
    #[serde(default)]
    pub domain: Option<String>,
}

/// One row of the front end's route table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub subdomain: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
}

/// Registration and listing interface of the routing front end
#[async_trait]
pub trait RoutingClient: Send + Sync {
    /// Create or replace the route for a service
    async fn register_route(
        &self,
        service_name: &str,
        target: &str,
    ) -> Result<RouteRegistration, AgentError>;

    async fn list_routes(&self) -> Result<Vec<RouteEntry>, AgentError>;

    /// Liveness of the front end itself
    async fn health(&self) -> Result<(), AgentError>;
}

#[derive(Serialize)]
struct RegisterBody<'a> {
    subdomain: &'a str,
    target: &'a str,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RouteListing {
    Bare(Vec<RouteEntry>),
    Wrapped { routes: Vec<RouteEntry> },
}

/// [`RoutingClient`] speaking to the front end's HTTP API
pub struct RoutingApiClient {
    http: HttpClient,
    token: Option<SecretToken>,
}

impl RoutingApiClient {
    pub fn new(api_url: &str, token: Option<SecretToken>) -> Result<Self, AgentError> {
        Ok(Self {
            http: HttpClient::new(api_url)?,
            token,
        })
    }

    fn token(&self) -> &str {
        self.token.as_ref().map(SecretToken::expose).unwrap_or("")
    }
}

#[async_trait]
impl RoutingClient for RoutingApiClient {
    async fn register_route(
        &self,
        service_name: &str,
        target: &str,
    ) -> Result<RouteRegistration, AgentError> {
        let body = RegisterBody {
            subdomain: service_name,
            target,
        };
        self.http.post("/routes", self.token(), &body).await
    }

    async fn list_routes(&self) -> Result<Vec<RouteEntry>, AgentError> {
        let listing: RouteListing = self.http.get("/routes", self.token()).await?;
        Ok(match listing {
            RouteListing::Bare(routes) => routes,
            RouteListing::Wrapped { routes } => routes,
        })
    }

    async fn health(&self) -> Result<(), AgentError> {
        self.http.ping("/health", self.token()).await
    }
}

/// Route table kept in process, used when no front end is configured
#[derive(Debug, Default)]
pub struct InMemoryRouteTable {
    routes: Mutex<BTreeMap<String, String>>,
    base_domain: String,
}

impl InMemoryRouteTable {
    pub fn new(base_domain: impl Into<String>) -> Self {
        Self {
            routes: Mutex::new(BTreeMap::new()),
            base_domain: base_domain.into(),
        }
    }

    /// Current target for a service
    pub async fn target_of(&self, service_name: &str) -> Option<String> {
        self.routes.lock().await.get(service_name).cloned()
    }
}

#[async_trait]
impl RoutingClient for InMemoryRouteTable {
    async fn register_route(
        &self,
        service_name: &str,
        target: &str,
    ) -> Result<RouteRegistration, AgentError> {
        self.routes
            .lock()
            .await
            .insert(service_name.to_string(), target.to_string());
        Ok(RouteRegistration {
            success: true,
            domain: Some(format!("{}.{}", service_name, self.base_domain)),
        })
    }

    async fn list_routes(&self) -> Result<Vec<RouteEntry>, AgentError> {
        let routes = self.routes.lock().await;
        Ok(routes
            .iter()
            .map(|(subdomain, target)| RouteEntry {
                subdomain: subdomain.clone(),
                target: Some(target.clone()),
                domain: Some(format!("{}.{}", subdomain, self.base_domain)),
            })
            .collect())
    }

    async fn health(&self) -> Result<(), AgentError> {
        Ok(())
    }
}

/// Result of a traffic switch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchOutcome {
    /// The route listing showed the service
    pub confirmed: bool,
    pub domain: String,
}

/// Moves a service's route onto a new container
#[derive(Clone)]
pub struct TrafficSwitch {
    routing: Arc<dyn RoutingClient>,
    probe: Arc<dyn HttpProbe>,
    config: TrafficConfig,
}

impl TrafficSwitch {
    pub fn new(
        routing: Arc<dyn RoutingClient>,
        probe: Arc<dyn HttpProbe>,
        config: TrafficConfig,
    ) -> Self {
        Self {
            routing,
            probe,
            config,
        }
    }

    pub fn config(&self) -> &TrafficConfig {
        &self.config
    }

    pub fn routing(&self) -> Arc<dyn RoutingClient> {
        Arc::clone(&self.routing)
    }

    /// Register the new container and wait for the route to appear
    ///
    /// A registration call that errors or answers `success: false` is a hard
    /// `RegistrationError`. The old container must not be retired while the
    /// front end may still point at it, so the caller rolls back rather than
    /// carrying on degraded. A registered route missing from the listing is
    /// the degraded case and yields `confirmed == false`.
    pub async fn switch_traffic(
        &self,
        old: Option<&TrackedContainer>,
        new: &TrackedContainer,
        service_name: &str,
    ) -> Result<SwitchOutcome, AgentError> {
        let host_port = new.host_port.ok_or_else(|| {
            AgentError::RegistrationError(format!("{} has no published host port", new.name))
        })?;
        let target = self.config.target_address(host_port);

        if self.config.final_probe {
            let url = format!("{}{}", target, self.config.probe_path);
            match self.probe.get(&url).await {
                Ok(status) if (200..400).contains(&status) => debug!("Pre-switch probe ok"),
                Ok(status) => warn!("Pre-switch probe of {} returned {}", url, status),
                Err(e) => warn!("Pre-switch probe of {} failed: {}", url, e),
            }
        }

        info!(
            "Switching {} from {} to {} ({})",
            service_name,
            old.map(|c| c.name.as_str()).unwrap_or("nothing"),
            new.name,
            target
        );
        let registration = self
            .routing
            .register_route(service_name, &target)
            .await
            .map_err(|e| AgentError::RegistrationError(e.to_string()))?;
        if !registration.success {
            return Err(AgentError::RegistrationError(format!(
                "front end rejected route for {}",
                service_name
            )));
        }

        let domain = self.config.expected_domain(service_name);
        if let Some(reported) = &registration.domain {
            if reported != &domain {
                debug!("Front end reported {} for {}, using {}", reported, service_name, domain);
            }
        }

        tokio::time::sleep(self.config.settle_delay).await;

        for attempt in 1..=self.config.retries {
            match self.routing.list_routes().await {
                Ok(routes) if routes.iter().any(|r| r.subdomain == service_name) => {
                    info!("Route for {} confirmed on attempt {}", service_name, attempt);
                    return Ok(SwitchOutcome {
                        confirmed: true,
                        domain,
                    });
                }
                Ok(_) => debug!("Route for {} not listed yet ({})", service_name, attempt),
                Err(e) => debug!("Route listing failed ({}): {}", attempt, e),
            }
            if attempt < self.config.retries {
                tokio::time::sleep(self.config.interval).await;
            }
        }

        warn!(
            "Route for {} registered but not confirmed after {} checks",
            service_name, self.config.retries
        );
        Ok(SwitchOutcome {
            confirmed: false,
            domain,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_registration_is_idempotent() {
        let table = InMemoryRouteTable::new("example.test");
        table.register_route("svc", "http://127.0.0.1:3001").await.unwrap();
        table.register_route("svc", "http://127.0.0.1:3002").await.unwrap();

        let routes = table.list_routes().await.unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].target.as_deref(), Some("http://127.0.0.1:3002"));
        assert_eq!(routes[0].domain.as_deref(), Some("svc.example.test"));
    }

    #[test]
    fn test_route_listing_shapes() {
        let bare: RouteListing =
            serde_json::from_str(r#"[{"subdomain": "demo", "target": "http://h:1"}]"#).unwrap();
        let wrapped: RouteListing =
            serde_json::from_str(r#"{"routes": [{"subdomain": "demo"}]}"#).unwrap();
        assert!(matches!(bare, RouteListing::Bare(ref r) if r[0].subdomain == "demo"));
        assert!(matches!(wrapped, RouteListing::Wrapped { ref routes } if routes.len() == 1));
    }

    #[test]
    fn test_expected_domain() {
        let config = TrafficConfig::from_settings(
            &TrafficSettings::default(),
            "/health",
            "127.0.0.1",
            "apps.example.test",
        );
        assert_eq!(config.expected_domain("demo"), "demo.apps.example.test");
        assert_eq!(config.target_address(3001), "http://127.0.0.1:3001");
    }
}

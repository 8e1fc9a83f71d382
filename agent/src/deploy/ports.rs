//! Host port allocation
//!
//! Each service keeps a stable host port across redeployments. The mapping
//! is persisted so it survives agent restarts, and every candidate port is
//! checked against live OS state right before it is recorded because the
//! persisted map can go stale.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::AgentError;
use crate::filesys::file::File;
use crate::models::deployment::PortAllocation;
use crate::storage::settings::PortSettings;

/// Ports below this are never handed out
pub const WELL_KNOWN_PORT_LIMIT: u16 = 1024;

/// Primary ingress ports of the routing front end
pub const INGRESS_PORTS: [u16; 2] = [80, 443];

type PortTable = BTreeMap<String, PortAllocation>;

/// Port allocation policy
#[derive(Debug, Clone)]
pub struct PortAllocatorConfig {
    pub range_start: u16,
    pub range_end: u16,
    pub reserved: BTreeSet<u16>,
    pub container_port: u16,
}

impl PortAllocatorConfig {
    /// Build from settings, reserving the given agent-owned ports as well
    pub fn from_settings(settings: &PortSettings, agent_ports: &[u16]) -> Self {
        let mut reserved: BTreeSet<u16> = INGRESS_PORTS.into_iter().collect();
        reserved.extend(settings.reserved.iter().copied());
        reserved.extend(agent_ports.iter().copied());
        Self {
            range_start: settings.range_start,
            range_end: settings.range_end,
            reserved,
            container_port: settings.container_port,
        }
    }

    /// Whether a port may ever be handed out
    pub fn is_allocatable(&self, port: u16) -> bool {
        port >= WELL_KNOWN_PORT_LIMIT
            && port >= self.range_start
            && port <= self.range_end
            && !self.reserved.contains(&port)
    }
}

/// Checks whether a host port is currently bound
#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn is_free(&self, port: u16) -> bool;
}

/// Probes by binding a TCP listener on all interfaces
#[derive(Debug, Default, Clone)]
pub struct TcpPortProbe;

#[async_trait]
impl PortProbe for TcpPortProbe {
    async fn is_free(&self, port: u16) -> bool {
        TcpListener::bind(("0.0.0.0", port)).await.is_ok()
    }
}

/// Persisted service → host port allocator
pub struct PortAllocator {
    config: PortAllocatorConfig,
    store: File,
    probe: Arc<dyn PortProbe>,
    table: Mutex<Option<PortTable>>,
}

impl PortAllocator {
    pub fn new(config: PortAllocatorConfig, store: File, probe: Arc<dyn PortProbe>) -> Self {
        Self {
            config,
            store,
            probe,
            table: Mutex::new(None),
        }
    }

    /// Port the application listens on inside its container
    pub fn container_port(&self) -> u16 {
        self.config.container_port
    }

    /// Allocate or reuse a host port for a service
    ///
    /// Returns `(host_port, container_port)`.
    pub async fn allocate_port(&self, service_name: &str) -> Result<(u16, u16), AgentError> {
        let mut guard = self.table.lock().await;
        let table = self.loaded(&mut *guard).await?;

        if let Some(existing) = table.get(service_name) {
            let port = existing.host_port;
            if self.config.is_allocatable(port) && self.probe.is_free(port).await {
                debug!("Reusing port {} for {}", port, service_name);
                return Ok((port, self.config.container_port));
            }
            info!(
                "Recorded port {} for {} is unavailable, selecting a new one",
                port, service_name
            );
        }

        let taken: BTreeSet<u16> = table
            .values()
            .filter(|a| a.service_name != service_name)
            .map(|a| a.host_port)
            .collect();

        for port in self.config.range_start.max(WELL_KNOWN_PORT_LIMIT)..=self.config.range_end {
            if !self.config.is_allocatable(port) || taken.contains(&port) {
                continue;
            }
            if !self.probe.is_free(port).await {
                continue;
            }

            table.insert(service_name.to_string(), allocation(service_name, port));
            self.persist(table).await?;
            info!("Allocated port {} for {}", port, service_name);
            return Ok((port, self.config.container_port));
        }

        Err(AgentError::ExhaustedError(format!(
            "no free port in {}-{} for {}",
            self.config.range_start, self.config.range_end, service_name
        )))
    }

    /// Remove the persisted mapping, returning the released port
    pub async fn release_port(&self, service_name: &str) -> Result<Option<u16>, AgentError> {
        let mut guard = self.table.lock().await;
        let table = self.loaded(&mut *guard).await?;

        let released = table.remove(service_name).map(|a| a.host_port);
        if released.is_some() {
            self.persist(table).await?;
            info!("Released port allocation for {}", service_name);
        }
        Ok(released)
    }

    /// Reconcile the record with the port a container actually bound
    ///
    /// Returns `true` when the record was corrected.
    pub async fn verify_port_mapping(
        &self,
        service_name: &str,
        observed_host_port: u16,
    ) -> Result<bool, AgentError> {
        let mut guard = self.table.lock().await;
        let table = self.loaded(&mut *guard).await?;

        let recorded = table.get(service_name).map(|a| a.host_port);
        if recorded == Some(observed_host_port) {
            return Ok(false);
        }

        if !self.config.is_allocatable(observed_host_port) {
            warn!(
                "{} is bound to port {} outside the allocation policy",
                service_name, observed_host_port
            );
        }

        warn!(
            "Port record for {} corrected: {:?} -> {}",
            service_name, recorded, observed_host_port
        );
        table.insert(
            service_name.to_string(),
            allocation(service_name, observed_host_port),
        );
        self.persist(table).await?;
        Ok(true)
    }

    /// Currently recorded port for a service
    pub async fn lookup(&self, service_name: &str) -> Result<Option<u16>, AgentError> {
        let mut guard = self.table.lock().await;
        let table = self.loaded(&mut *guard).await?;
        Ok(table.get(service_name).map(|a| a.host_port))
    }

    /// All persisted allocations
    pub async fn allocations(&self) -> Result<Vec<PortAllocation>, AgentError> {
        let mut guard = self.table.lock().await;
        let table = self.loaded(&mut *guard).await?;
        Ok(table.values().cloned().collect())
    }

    async fn loaded<'a>(
        &self,
        guard: &'a mut Option<PortTable>,
    ) -> Result<&'a mut PortTable, AgentError> {
        if guard.is_none() {
            let table: PortTable = self.store.read_json_opt().await?.unwrap_or_default();
            debug!("Loaded {} port allocations", table.len());
            *guard = Some(table);
        }
        guard
            .as_mut()
            .ok_or_else(|| AgentError::Internal("port table not loaded".to_string()))
    }

    async fn persist(&self, table: &PortTable) -> Result<(), AgentError> {
        self.store.write_json_atomic(table).await
    }
}

fn allocation(service_name: &str, host_port: u16) -> PortAllocation {
    PortAllocation {
        service_name: service_name.to_string(),
        host_port,
        allocated_at: Utc::now(),
    }
}

//! Container snapshots, rollback and retirement

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::deploy::health::HealthCheckEngine;
use crate::deploy::ports::PortAllocator;
use crate::deploy::runtime::{ContainerRuntime, HealthProbe, RunSpec};
use crate::deploy::traffic::TrafficSwitch;
use crate::errors::AgentError;
use crate::filesys::dir::Dir;
use crate::models::deployment::{BackupMetadata, TrackedContainer};
use crate::utils::short_id;

pub const BACKUP_FILE: &str = "backup.json";

/// Image reference a snapshot is committed to
pub fn backup_image_ref(service_name: &str, deployment_id: &str) -> String {
    format!("rollout-backup/{}:{}", service_name, short_id(deployment_id))
}

/// What a failed rollout left behind
#[derive(Debug, Clone)]
pub struct RollbackPlan {
    pub service_name: String,

    /// The container serving before the rollout
    pub old: Option<TrackedContainer>,

    /// Name of the new container, if one was started
    pub new_container: Option<String>,

    /// Image built for the new container
    pub new_image: Option<String>,

    /// Holds `backup.json`
    pub backup_dir: Dir,

    /// The route was already pointed at the new container
    pub route_switched: bool,
}

/// Snapshots the serving container and restores it on failure
#[derive(Clone)]
pub struct BackupManager {
    runtime: Arc<dyn ContainerRuntime>,
    health: HealthCheckEngine,
    ports: Arc<PortAllocator>,
    traffic: TrafficSwitch,
    network: Option<String>,
}

impl BackupManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        health: HealthCheckEngine,
        ports: Arc<PortAllocator>,
        traffic: TrafficSwitch,
        network: Option<String>,
    ) -> Self {
        Self {
            runtime,
            health,
            ports,
            traffic,
            network,
        }
    }

    /// Commit the container to a backup image and record it
    ///
    /// Best-effort: failures are logged and yield `None`.
    pub async fn snapshot(
        &self,
        container: &TrackedContainer,
        backup_dir: &Dir,
        service_name: &str,
        deployment_id: &str,
    ) -> Option<BackupMetadata> {
        let image_ref = backup_image_ref(service_name, deployment_id);
        if let Err(e) = self.runtime.commit(&container.name, &image_ref).await {
            warn!("Snapshot of {} failed: {}", container.name, e);
            return None;
        }

        let metadata = BackupMetadata {
            container_id: container.id.clone(),
            container_name: container.name.clone(),
            backup_image_ref: image_ref,
            host_port: container.host_port,
            timestamp: Utc::now(),
        };

        let written = async {
            backup_dir.create().await?;
            backup_dir.file(BACKUP_FILE).write_json(&metadata).await
        }
        .await;
        if let Err(e) = written {
            warn!("Could not record backup of {}: {}", container.name, e);
        }

        info!("Snapshotted {} as {}", container.name, metadata.backup_image_ref);
        Some(metadata)
    }

    /// Drop a snapshot image once it is no longer needed
    pub async fn discard(&self, metadata: &BackupMetadata) {
        if let Err(e) = self.runtime.remove_image(&metadata.backup_image_ref).await {
            debug!("Could not remove backup image {}: {}", metadata.backup_image_ref, e);
        }
    }

    /// Undo a failed rollout
    ///
    /// Removes whatever the rollout created and brings the previous
    /// container back to a healthy, routed state.
    pub async fn rollback(&self, plan: &RollbackPlan) -> Result<(), AgentError> {
        info!("Rolling back {}", plan.service_name);

        if let Some(name) = &plan.new_container {
            self.graceful_removal(name).await.map_err(|e| {
                AgentError::RollbackError(format!("could not remove {}: {}", name, e))
            })?;
        }
        if let Some(image) = &plan.new_image {
            if let Err(e) = self.runtime.remove_image(image).await {
                debug!("Could not remove image {}: {}", image, e);
            }
        }

        let Some(old) = &plan.old else {
            if let Err(e) = self.ports.release_port(&plan.service_name).await {
                warn!("Could not release port for {}: {}", plan.service_name, e);
            }
            info!("Rollback of {} complete, nothing to restore", plan.service_name);
            return Ok(());
        };

        let restored = self.restore(old, &plan.backup_dir).await?;

        self.health
            .perform_health_check(&restored)
            .await
            .map_err(|e| AgentError::RollbackError(format!("{} did not recover: {}", old.name, e)))?;

        if let Some(port) = restored.host_port {
            if let Err(e) = self.ports.verify_port_mapping(&plan.service_name, port).await {
                warn!("Could not restore port record for {}: {}", plan.service_name, e);
            }

            if plan.route_switched {
                let target = self.traffic.config().target_address(port);
                self.traffic
                    .routing()
                    .register_route(&plan.service_name, &target)
                    .await
                    .map_err(|e| {
                        AgentError::RollbackError(format!("could not restore route: {}", e))
                    })?;
                info!("Route for {} restored to {}", plan.service_name, target);
            }
        }

        info!("Rollback of {} complete, {} restored", plan.service_name, old.name);
        Ok(())
    }

    async fn restore(
        &self,
        old: &TrackedContainer,
        backup_dir: &Dir,
    ) -> Result<TrackedContainer, AgentError> {
        match self.runtime.inspect(&old.name).await {
            Ok(Some(info)) => {
                if !info.running {
                    info!("Restarting {}", old.name);
                    self.runtime.start(&old.name).await.map_err(|e| {
                        AgentError::RollbackError(format!("could not start {}: {}", old.name, e))
                    })?;
                }
                let host_port = info.host_port_for(old.container_port).or(old.host_port);
                return Ok(TrackedContainer {
                    id: info.id,
                    status: "running".to_string(),
                    host_port,
                    ..old.clone()
                });
            }
            Ok(None) => {}
            Err(e) => {
                return Err(AgentError::RollbackError(format!(
                    "could not inspect {}: {}",
                    old.name, e
                )))
            }
        }

        let metadata: BackupMetadata = backup_dir
            .file(BACKUP_FILE)
            .read_json_opt()
            .await
            .ok()
            .flatten()
            .ok_or_else(|| {
                AgentError::RollbackError(format!("{} is gone and no backup exists", old.name))
            })?;

        info!(
            "Recreating {} from {}",
            metadata.container_name, metadata.backup_image_ref
        );
        let host_port = metadata.host_port.or(old.host_port);
        let health = self.health.config();
        let spec = RunSpec {
            name: metadata.container_name.clone(),
            image: metadata.backup_image_ref.clone(),
            ports: host_port
                .map(|p| vec![(p, old.container_port)])
                .unwrap_or_default(),
            network: self.network.clone(),
            restart: Some("unless-stopped".to_string()),
            health: Some(HealthProbe::http(
                old.container_port,
                &health.probe_path,
                health.interval,
            )),
            ..RunSpec::default()
        };
        let id = self.runtime.run(&spec).await.map_err(|e| {
            AgentError::RollbackError(format!("could not recreate {}: {}", old.name, e))
        })?;

        Ok(TrackedContainer {
            id,
            name: metadata.container_name,
            status: "running".to_string(),
            host_port,
            created: Utc::now(),
            ..old.clone()
        })
    }

    /// Stop and remove a container; a missing container counts as removed
    pub async fn graceful_removal(&self, name: &str) -> Result<(), AgentError> {
        let info = match self.runtime.inspect(name).await? {
            Some(info) => info,
            None => {
                debug!("{} already gone", name);
                return Ok(());
            }
        };

        if info.running {
            match self.runtime.stop(name).await {
                Ok(()) | Err(AgentError::NotFound(_)) => {}
                Err(e) => warn!("Stopping {} failed, forcing removal: {}", name, e),
            }
        }

        match self.runtime.remove(name).await {
            Ok(()) | Err(AgentError::NotFound(_)) => {
                info!("Removed {}", name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_image_ref() {
        assert_eq!(
            backup_image_ref("demo", "7F3A-91c2-4d"),
            "rollout-backup/demo:7f3a91c2"
        );
    }
}

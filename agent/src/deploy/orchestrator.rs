//! Blue-green rollout orchestration
//!
//! One call to [`Orchestrator::deploy`] drives a request through the
//! [`RolloutFsm`] stages. Every failure after the lock is taken triggers a
//! rollback, and exactly one terminal status event is emitted per call.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use crate::deploy::backup::{BackupManager, RollbackPlan};
use crate::deploy::builder::{ImageBuildRequest, ImageBuilder};
use crate::deploy::fsm::{RolloutEvent, RolloutFsm, RolloutState};
use crate::deploy::health::HealthCheckEngine;
use crate::deploy::locks::DeploymentLocks;
use crate::deploy::ports::PortAllocator;
use crate::deploy::reporter::StatusReporter;
use crate::deploy::runtime::{ContainerRuntime, HealthProbe, RunSpec};
use crate::deploy::source::SourceFetcher;
use crate::deploy::traffic::TrafficSwitch;
use crate::errors::AgentError;
use crate::filesys::dir::Dir;
use crate::http::secrets::{render_env_file, SecretFetcher};
use crate::models::deployment::{
    classify_container_name, container_name, AppType, BackupMetadata, Color, DeploymentOutcome,
    DeploymentRequest, DeploymentStatus, JobCompletion, StatusEvent, TrackedContainer,
    SERVICE_LABEL,
};
use crate::utils::short_id;

const ENV_FILE: &str = ".env";
const SOURCE_DIR: &str = "source";
const BACKUP_DIR: &str = "backup";

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Parent of the per-deployment working directories
    pub work_root: Dir,

    /// Shared network every service container joins
    pub network: Option<String>,

    /// Repository prefix for built images
    pub image_prefix: String,

    /// Probe the public domain after the route is switched
    pub verify_domain: bool,
}

impl OrchestratorSettings {
    pub fn new(work_root: Dir) -> Self {
        Self {
            work_root,
            network: None,
            image_prefix: "rollout".to_string(),
            verify_domain: false,
        }
    }
}

/// Everything the orchestrator talks to
#[derive(Clone)]
pub struct Collaborators {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub ports: Arc<PortAllocator>,
    pub locks: Arc<DeploymentLocks>,
    pub health: HealthCheckEngine,
    pub traffic: TrafficSwitch,
    pub source: Arc<dyn SourceFetcher>,
    pub secrets: Arc<dyn SecretFetcher>,
    pub builder: Arc<dyn ImageBuilder>,
    pub reporter: Arc<dyn StatusReporter>,
}

/// Per-rollout bookkeeping
struct Rollout {
    request: DeploymentRequest,
    fsm: RolloutFsm,
    work_dir: Dir,
    env_file: Option<PathBuf>,
    secrets: BTreeMap<String, String>,
    app_type: Option<AppType>,
    old: Option<TrackedContainer>,
    color: Option<Color>,
    backup: Option<BackupMetadata>,
    new_image: Option<String>,
    new_name: Option<String>,
    new: Option<TrackedContainer>,
    route_switched: bool,
}

impl Rollout {
    fn new(request: DeploymentRequest, work_dir: Dir) -> Self {
        Self {
            request,
            fsm: RolloutFsm::new(),
            work_dir,
            env_file: None,
            secrets: BTreeMap::new(),
            app_type: None,
            old: None,
            color: None,
            backup: None,
            new_image: None,
            new_name: None,
            new: None,
            route_switched: false,
        }
    }

    fn source_dir(&self) -> Dir {
        self.work_dir.subdir(SOURCE_DIR)
    }

    fn backup_dir(&self) -> Dir {
        self.work_dir.subdir(BACKUP_DIR)
    }

    fn advance(&mut self, stage: RolloutState) -> Result<(), AgentError> {
        self.fsm.advance_to(stage).map_err(AgentError::Internal)?;
        debug!(
            deployment_id = %self.request.deployment_id,
            "Rollout stage {:?}",
            stage
        );
        Ok(())
    }
}

/// Sequences a blue-green rollout
pub struct Orchestrator {
    settings: OrchestratorSettings,
    runtime: Arc<dyn ContainerRuntime>,
    ports: Arc<PortAllocator>,
    locks: Arc<DeploymentLocks>,
    health: HealthCheckEngine,
    traffic: TrafficSwitch,
    backup: BackupManager,
    source: Arc<dyn SourceFetcher>,
    secrets: Arc<dyn SecretFetcher>,
    builder: Arc<dyn ImageBuilder>,
    reporter: Arc<dyn StatusReporter>,
}

impl Orchestrator {
    pub fn new(settings: OrchestratorSettings, collaborators: Collaborators) -> Self {
        let backup = BackupManager::new(
            Arc::clone(&collaborators.runtime),
            collaborators.health.clone(),
            Arc::clone(&collaborators.ports),
            collaborators.traffic.clone(),
            settings.network.clone(),
        );
        Self {
            settings,
            runtime: collaborators.runtime,
            ports: collaborators.ports,
            locks: collaborators.locks,
            health: collaborators.health,
            traffic: collaborators.traffic,
            backup,
            source: collaborators.source,
            secrets: collaborators.secrets,
            builder: collaborators.builder,
            reporter: collaborators.reporter,
        }
    }

    pub fn locks(&self) -> &Arc<DeploymentLocks> {
        &self.locks
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    /// Run a rollout from a raw control channel payload
    ///
    /// A payload that does not even parse is reported as failed under
    /// whatever `deploymentId` it carries.
    pub async fn deploy_payload(
        &self,
        payload: serde_json::Value,
    ) -> Result<DeploymentOutcome, AgentError> {
        let deployment_id = payload
            .get("deploymentId")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();

        match serde_json::from_value::<DeploymentRequest>(payload) {
            Ok(request) => self.deploy(request).await,
            Err(e) => {
                let err = AgentError::ValidationError(e.to_string());
                warn!("Deployment {} rejected: {}", deployment_id, err);
                self.reporter
                    .report(StatusEvent {
                        deployment_id,
                        status: DeploymentStatus::Failed,
                        message: err.to_string(),
                        domain: None,
                    })
                    .await;
                Err(err)
            }
        }
    }

    /// Run a rollout to completion
    #[instrument(skip_all, fields(deployment_id = %request.deployment_id, service = %request.service_name))]
    pub async fn deploy(&self, request: DeploymentRequest) -> Result<DeploymentOutcome, AgentError> {
        let work_dir = self.settings.work_root.subdir(&request.deployment_id);
        let mut rollout = Rollout::new(request, work_dir);

        if let Err(e) = rollout.request.validate() {
            return Err(self.reject(&mut rollout, e).await);
        }
        rollout.advance(RolloutState::Validated)?;

        let _lock = match self
            .locks
            .try_acquire(&rollout.request.service_name, &rollout.request.environment)
        {
            Ok(guard) => guard,
            Err(e) => return Err(self.reject(&mut rollout, e).await),
        };
        rollout.advance(RolloutState::Locked)?;
        self.progress(&rollout, "Deployment started").await;

        match self.run_stages(&mut rollout).await {
            Ok(outcome) => {
                if let Err(e) = rollout.work_dir.delete().await {
                    warn!("Could not remove {}: {}", rollout.work_dir.path().display(), e);
                }
                info!("{}", outcome.message);
                self.finish(
                    &rollout.request,
                    DeploymentStatus::Success,
                    &outcome.message,
                    Some(outcome.domain.clone()),
                )
                .await;
                Ok(outcome)
            }
            Err(e) => {
                self.fail(&mut rollout, &e).await;
                Err(e)
            }
        }
    }

    /// Failure before the lock: no cleanup, one failed event
    async fn reject(&self, rollout: &mut Rollout, err: AgentError) -> AgentError {
        if let Err(e) = rollout.fsm.process(RolloutEvent::Fail(err.to_string())) {
            debug!("Rejection not recorded in rollout state: {}", e);
        }
        warn!("Deployment rejected: {}", err);
        self.finish(&rollout.request, DeploymentStatus::Failed, &err.to_string(), None)
            .await;
        err
    }

    /// Failure after the lock: roll back, then report
    async fn fail(&self, rollout: &mut Rollout, err: &AgentError) {
        error!(
            kind = err.kind(),
            stage = ?rollout.fsm.state(),
            "Deployment failed: {}",
            err
        );
        if let AgentError::HealthCheckError {
            diagnostics: Some(diagnostics),
            ..
        } = err
        {
            warn!(?diagnostics, "Health diagnostics");
        }

        let state = rollout
            .fsm
            .process(RolloutEvent::Fail(err.to_string()))
            .unwrap_or(RolloutState::Failed);

        if state == RolloutState::RollingBack {
            let plan = RollbackPlan {
                service_name: rollout.request.service_name.clone(),
                old: rollout.old.clone(),
                new_container: rollout.new_name.clone(),
                new_image: rollout.new_image.clone(),
                backup_dir: rollout.backup_dir(),
                route_switched: rollout.route_switched,
            };
            if let Err(rollback_err) = self.backup.rollback(&plan).await {
                error!("{}", rollback_err);
            }
            if let Err(e) = rollout.fsm.process(RolloutEvent::RollbackFinished) {
                debug!("Rollback not recorded in rollout state: {}", e);
            }
            info!(
                "Keeping {} for inspection",
                rollout.work_dir.path().display()
            );
        }

        self.finish(&rollout.request, DeploymentStatus::Failed, &err.to_string(), None)
            .await;
    }

    async fn run_stages(&self, rollout: &mut Rollout) -> Result<DeploymentOutcome, AgentError> {
        self.prepare_directories(rollout).await?;
        rollout.advance(RolloutState::DirectoriesReady)?;

        self.write_env_file(rollout).await?;
        rollout.advance(RolloutState::EnvFetched)?;

        self.progress(rollout, "Fetching source").await;
        self.source
            .fetch(&rollout.request, &rollout.source_dir())
            .await?;
        rollout.advance(RolloutState::SourceFetched)?;

        rollout.app_type = Some(self.resolve_app_type(rollout).await?);
        rollout.advance(RolloutState::TypeResolved)?;

        self.snapshot_current(rollout).await?;
        rollout.advance(RolloutState::OldContainerSnapshotted)?;

        self.progress(rollout, "Building image").await;
        self.build_image(rollout).await?;
        rollout.advance(RolloutState::NewContainerBuilt)?;

        self.start_container(rollout).await?;
        rollout.advance(RolloutState::NewContainerStarted)?;

        let new = rollout
            .new
            .clone()
            .ok_or_else(|| AgentError::Internal("new container not tracked".to_string()))?;

        self.progress(rollout, &format!("Waiting for {} to become healthy", new.name))
            .await;
        self.health.perform_health_check(&new).await?;
        rollout.advance(RolloutState::HealthVerified)?;

        self.progress(rollout, "Switching traffic").await;
        // The old route may already be replaced even if registration errors
        rollout.route_switched = rollout.old.is_some();
        let switch = self
            .traffic
            .switch_traffic(rollout.old.as_ref(), &new, &rollout.request.service_name)
            .await?;
        rollout.route_switched = true;
        rollout.advance(RolloutState::TrafficRegistered)?;

        let domain = rollout
            .request
            .domain
            .clone()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or(switch.domain);
        if self.settings.verify_domain {
            self.health.verify_routed_domain(&new, &domain).await?;
        }
        rollout.advance(RolloutState::TrafficSwitchVerified)?;

        self.retire_old(rollout, &new).await;
        rollout.advance(RolloutState::OldContainerRetired)?;
        rollout.advance(RolloutState::Succeeded)?;

        let host_port = new.host_port.unwrap_or_default();
        let message = if switch.confirmed {
            format!("Deployed {} on port {} at {}", new.name, host_port, domain)
        } else {
            format!(
                "Deployed {} on port {} at {}; route registered locally, not externally confirmed",
                new.name, host_port, domain
            )
        };

        Ok(DeploymentOutcome {
            deployment_id: rollout.request.deployment_id.clone(),
            service_name: rollout.request.service_name.clone(),
            color: new.color.unwrap_or(Color::Blue),
            container_name: new.name.clone(),
            host_port,
            domain,
            route_confirmed: switch.confirmed,
            message,
        })
    }

    async fn prepare_directories(&self, rollout: &Rollout) -> Result<(), AgentError> {
        self.runtime.ping().await?;

        if let Some(network) = &self.settings.network {
            let exists = self.runtime.network_exists(network).await.map_err(|e| {
                AgentError::PrerequisiteError(format!("cannot inspect network {}: {}", network, e))
            })?;
            if !exists {
                info!("Creating network {}", network);
                self.runtime.create_network(network).await.map_err(|e| {
                    AgentError::PrerequisiteError(format!(
                        "cannot create network {}: {}",
                        network, e
                    ))
                })?;
            }
        }

        // A stale directory can only come from a crashed earlier run
        rollout.work_dir.reset().await
    }

    async fn write_env_file(&self, rollout: &mut Rollout) -> Result<(), AgentError> {
        let secrets = self
            .secrets
            .fetch_secrets(
                &rollout.request.deployment_id,
                rollout.request.deploy_token.as_ref(),
            )
            .await?;

        let env_file = rollout.work_dir.file(ENV_FILE);
        env_file.write_private(&render_env_file(&secrets)?).await?;
        debug!("Wrote {} variables to {}", secrets.len(), env_file.path().display());

        rollout.env_file = Some(env_file.path().to_path_buf());
        rollout.secrets = secrets;
        Ok(())
    }

    async fn resolve_app_type(&self, rollout: &Rollout) -> Result<AppType, AgentError> {
        let app_type = match rollout.request.app_type {
            Some(app_type) => app_type,
            None => AppType::detect(&rollout.source_dir()).await.ok_or_else(|| {
                AgentError::ValidationError(
                    "appType not given and could not be detected".to_string(),
                )
            })?,
        };
        if app_type.is_datastore() {
            return Err(AgentError::ValidationError(format!(
                "{} deployments are handled by the datastore provisioner",
                app_type
            )));
        }
        info!("Application type {}", app_type);
        Ok(app_type)
    }

    /// Containers belonging to a service, oldest first
    pub async fn discover(&self, service_name: &str) -> Result<Vec<TrackedContainer>, AgentError> {
        let container_port = self.ports.container_port();
        let mut found: Vec<TrackedContainer> = self
            .runtime
            .list_by_prefix(service_name)
            .await?
            .into_iter()
            .filter(|info| {
                info.labels
                    .get(SERVICE_LABEL)
                    .map_or(true, |owner| owner == service_name)
            })
            .filter_map(|info| {
                let color = classify_container_name(service_name, &info.name)?;
                Some(TrackedContainer {
                    host_port: info.host_port_for(container_port),
                    id: info.id,
                    name: info.name,
                    color,
                    container_port,
                    status: info.status,
                    created: info.created,
                })
            })
            .collect();
        found.sort_by_key(|c| c.created);
        Ok(found)
    }

    async fn snapshot_current(&self, rollout: &mut Rollout) -> Result<(), AgentError> {
        let service_name = rollout.request.service_name.clone();
        let containers = self.discover(&service_name).await?;

        let current = containers.iter().find(|c| c.is_running()).cloned();
        let color = Color::next_after(current.as_ref().and_then(|c| c.color));
        let target_name = container_name(&service_name, color);
        info!(
            "Current container: {}, deploying {}",
            current.as_ref().map(|c| c.name.as_str()).unwrap_or("none"),
            target_name
        );

        for stale in containers.iter().filter(|c| c.name == target_name) {
            info!("Removing stale {}", stale.name);
            self.backup
                .graceful_removal(&stale.name)
                .await
                .map_err(|e| AgentError::StartError(format!("cannot clear {}: {}", stale.name, e)))?;
        }

        if let Some(current) = &current {
            rollout.backup = self
                .backup
                .snapshot(
                    current,
                    &rollout.backup_dir(),
                    &service_name,
                    &rollout.request.deployment_id,
                )
                .await;
        }

        rollout.old = current;
        rollout.color = Some(color);
        Ok(())
    }

    async fn build_image(&self, rollout: &mut Rollout) -> Result<(), AgentError> {
        let app_type = rollout
            .app_type
            .ok_or_else(|| AgentError::Internal("app type not resolved".to_string()))?;
        let image = format!(
            "{}/{}:{}",
            self.settings.image_prefix,
            rollout.request.service_name,
            short_id(&rollout.request.deployment_id)
        );

        let request = ImageBuildRequest {
            context: rollout.source_dir(),
            image: image.clone(),
            app_type,
            container_port: self.ports.container_port(),
            env: rollout.secrets.clone(),
        };
        self.builder.build(&request).await.map_err(|e| match e {
            AgentError::BuildError(_) => e,
            other => AgentError::BuildError(other.to_string()),
        })?;

        rollout.new_image = Some(image);
        Ok(())
    }

    async fn start_container(&self, rollout: &mut Rollout) -> Result<(), AgentError> {
        let service_name = rollout.request.service_name.clone();
        let color = rollout
            .color
            .ok_or_else(|| AgentError::Internal("color not selected".to_string()))?;
        let image = rollout
            .new_image
            .clone()
            .ok_or_else(|| AgentError::Internal("image not built".to_string()))?;
        let name = container_name(&service_name, color);

        let (host_port, container_port) = self.ports.allocate_port(&service_name).await?;
        self.progress(rollout, &format!("Starting {} on port {}", name, host_port))
            .await;

        let health = self.health.config();
        let spec = RunSpec {
            name: name.clone(),
            image,
            ports: vec![(host_port, container_port)],
            expose: rollout.request.additional_ports.clone(),
            env_file: rollout.env_file.clone(),
            labels: vec![
                (SERVICE_LABEL.to_string(), service_name.clone()),
                ("rollout.environment".to_string(), rollout.request.environment.clone()),
                ("rollout.color".to_string(), color.to_string()),
                ("rollout.deployment".to_string(), rollout.request.deployment_id.clone()),
            ],
            network: self.settings.network.clone(),
            restart: Some("unless-stopped".to_string()),
            health: Some(HealthProbe::http(
                container_port,
                &health.probe_path,
                health.interval,
            )),
        };

        rollout.new_name = Some(name.clone());
        let id = self.runtime.run(&spec).await.map_err(|e| match e {
            AgentError::StartError(_) => e,
            other => AgentError::StartError(other.to_string()),
        })?;

        let info = self
            .runtime
            .inspect(&name)
            .await?
            .ok_or_else(|| AgentError::StartError(format!("{} vanished after start", name)))?;

        let observed = info.host_port_for(container_port).unwrap_or(host_port);
        if self.ports.verify_port_mapping(&service_name, observed).await? {
            warn!("{} bound {} instead of {}", name, observed, host_port);
        }

        rollout.new = Some(TrackedContainer {
            id,
            name,
            color: Some(color),
            host_port: Some(observed),
            container_port,
            status: info.status,
            created: info.created,
        });
        Ok(())
    }

    async fn retire_old(&self, rollout: &Rollout, new: &TrackedContainer) {
        if let Some(old) = rollout.old.as_ref().filter(|old| old.name != new.name) {
            self.progress(rollout, &format!("Retiring {}", old.name)).await;
            if let Err(e) = self.backup.graceful_removal(&old.name).await {
                warn!("Could not retire {}: {}", old.name, e);
            }
        }
        if let Some(backup) = &rollout.backup {
            self.backup.discard(backup).await;
        }
    }

    async fn progress(&self, rollout: &Rollout, message: &str) {
        self.reporter
            .report(StatusEvent {
                deployment_id: rollout.request.deployment_id.clone(),
                status: DeploymentStatus::InProgress,
                message: message.to_string(),
                domain: None,
            })
            .await;
    }

    async fn finish(
        &self,
        request: &DeploymentRequest,
        status: DeploymentStatus,
        message: &str,
        domain: Option<String>,
    ) {
        self.reporter
            .report(StatusEvent {
                deployment_id: request.deployment_id.clone(),
                status,
                message: message.to_string(),
                domain: domain.clone(),
            })
            .await;

        if let Some(job_id) = &request.job_id {
            self.reporter
                .notify_job_completion(JobCompletion {
                    job_id: job_id.clone(),
                    project_id: request.project_id.clone(),
                    deployment_id: request.deployment_id.clone(),
                    status,
                    message: message.to_string(),
                    domain,
                })
                .await;
        }
    }
}

//! Shared fakes for rollout integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;
use tokio::sync::Notify;

use rollout_agent::deploy::builder::{ImageBuildRequest, ImageBuilder};
use rollout_agent::deploy::health::{HealthCheckConfig, HealthCheckEngine, HttpProbe};
use rollout_agent::deploy::locks::DeploymentLocks;
use rollout_agent::deploy::orchestrator::{Collaborators, Orchestrator, OrchestratorSettings};
use rollout_agent::deploy::ports::{PortAllocator, PortAllocatorConfig, PortProbe};
use rollout_agent::deploy::reporter::StatusReporter;
use rollout_agent::deploy::runtime::{ContainerInfo, ContainerRuntime, RunSpec};
use rollout_agent::deploy::source::SourceFetcher;
use rollout_agent::deploy::traffic::{InMemoryRouteTable, TrafficConfig, TrafficSwitch};
use rollout_agent::errors::AgentError;
use rollout_agent::filesys::dir::Dir;
use rollout_agent::filesys::file::File;
use rollout_agent::http::secrets::SecretFetcher;
use rollout_agent::models::deployment::{
    DeploymentRequest, DeploymentStatus, JobCompletion, StatusEvent,
};
use rollout_agent::storage::settings::PortSettings;
use rollout_agent::utils::{CooldownOptions, SecretToken};

pub const CONTAINER_PORT: u16 = 8080;

// ================================= RUNTIME ===================================== //

/// In-memory container runtime
#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<BTreeMap<String, ContainerInfo>>,
    removed_images: Mutex<Vec<String>>,
    committed: Mutex<Vec<String>>,
    /// Health given to containers started from now on
    new_health: Mutex<Option<String>>,
    /// Health reported by successive inspects, per container
    health_script: Mutex<HashMap<String, VecDeque<String>>>,
    inspections: AtomicU64,
    seq: AtomicU64,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            new_health: Mutex::new(Some("healthy".to_string())),
            ..Default::default()
        }
    }

    fn next_created(&self) -> DateTime<Utc> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) as i64;
        Utc.timestamp_opt(1_700_000_000 + seq, 0).unwrap()
    }

    /// Containers started after this call report the given health
    pub fn set_new_health(&self, health: Option<&str>) {
        *self.new_health.lock().unwrap() = health.map(str::to_string);
    }

    /// Report these health states on the next inspects of `name`
    ///
    /// The last state sticks once the script runs out.
    pub fn script_health(&self, name: &str, states: &[&str]) {
        self.health_script.lock().unwrap().insert(
            name.to_string(),
            states.iter().map(|s| s.to_string()).collect(),
        );
    }

    pub fn inspections(&self) -> u64 {
        self.inspections.load(Ordering::SeqCst)
    }

    /// Place an existing container, as if left by an earlier rollout
    pub fn seed(&self, name: &str, host_port: u16, running: bool) {
        let info = ContainerInfo {
            id: format!("id-{}", name),
            name: name.to_string(),
            image: format!("rollout/{}:seed", name),
            created: self.next_created(),
            status: if running { "running" } else { "exited" }.to_string(),
            running,
            health: Some("healthy".to_string()),
            host_ports: HashMap::from([(CONTAINER_PORT, host_port)]),
            labels: HashMap::new(),
        };
        self.containers
            .lock()
            .unwrap()
            .insert(name.to_string(), info);
    }

    /// Stop a container outside of any rollout
    pub fn stop_for_test(&self, name: &str) {
        self.update(name, |c| {
            c.running = false;
            c.status = "exited".to_string();
        })
        .unwrap();
    }

    pub fn container(&self, name: &str) -> Option<ContainerInfo> {
        self.containers.lock().unwrap().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.containers.lock().unwrap().keys().cloned().collect()
    }

    pub fn removed_images(&self) -> Vec<String> {
        self.removed_images.lock().unwrap().clone()
    }

    pub fn committed(&self) -> Vec<String> {
        self.committed.lock().unwrap().clone()
    }

    /// Host ports held by running containers
    pub fn bound_ports(&self) -> HashSet<u16> {
        self.containers
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.running)
            .flat_map(|c| c.host_ports.values().copied())
            .collect()
    }

    fn update<F: FnOnce(&mut ContainerInfo)>(&self, name: &str, f: F) -> Result<(), AgentError> {
        let mut containers = self.containers.lock().unwrap();
        let info = containers
            .get_mut(name)
            .ok_or_else(|| AgentError::NotFound(name.to_string()))?;
        f(info);
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<(), AgentError> {
        Ok(())
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<ContainerInfo>, AgentError> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.name.contains(prefix))
            .cloned()
            .collect())
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>, AgentError> {
        self.inspections.fetch_add(1, Ordering::SeqCst);
        let next = self
            .health_script
            .lock()
            .unwrap()
            .get_mut(name)
            .and_then(|script| script.pop_front());
        if let Some(health) = next {
            let _ = self.update(name, |c| c.health = Some(health));
        }
        Ok(self.container(name))
    }

    async fn run(&self, spec: &RunSpec) -> Result<String, AgentError> {
        if self.container(&spec.name).is_some() {
            return Err(AgentError::StartError(format!("{} already exists", spec.name)));
        }
        let id = format!("id-{}-{}", spec.name, self.seq.load(Ordering::SeqCst));
        let info = ContainerInfo {
            id: id.clone(),
            name: spec.name.clone(),
            image: spec.image.clone(),
            created: self.next_created(),
            status: "running".to_string(),
            running: true,
            health: self.new_health.lock().unwrap().clone(),
            host_ports: spec.ports.iter().map(|(host, c)| (*c, *host)).collect(),
            labels: spec.labels.iter().cloned().collect(),
        };
        self.containers
            .lock()
            .unwrap()
            .insert(spec.name.clone(), info);
        Ok(id)
    }

    async fn start(&self, name: &str) -> Result<(), AgentError> {
        self.update(name, |c| {
            c.running = true;
            c.status = "running".to_string();
        })
    }

    async fn stop(&self, name: &str) -> Result<(), AgentError> {
        self.update(name, |c| {
            c.running = false;
            c.status = "exited".to_string();
        })
    }

    async fn remove(&self, name: &str) -> Result<(), AgentError> {
        self.containers
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| AgentError::NotFound(name.to_string()))
    }

    async fn commit(&self, _name: &str, image_ref: &str) -> Result<(), AgentError> {
        self.committed.lock().unwrap().push(image_ref.to_string());
        Ok(())
    }

    async fn remove_image(&self, image_ref: &str) -> Result<(), AgentError> {
        self.removed_images
            .lock()
            .unwrap()
            .push(image_ref.to_string());
        Ok(())
    }

    async fn logs_tail(&self, name: &str, _lines: u32) -> Result<String, AgentError> {
        Ok(format!("{} logs", name))
    }

    async fn port_bindings(&self, name: &str) -> Result<String, AgentError> {
        Ok(format!("{:?}", self.container(name).map(|c| c.host_ports)))
    }

    async fn network_exists(&self, _network: &str) -> Result<bool, AgentError> {
        Ok(true)
    }

    async fn create_network(&self, _network: &str) -> Result<(), AgentError> {
        Ok(())
    }

    async fn inspect_network(&self, network: &str) -> Result<String, AgentError> {
        Ok(network.to_string())
    }
}

// ================================ COLLABORATORS ================================== //

/// Reports ports held by the fake runtime, plus any marked busy, as taken
pub struct FakePortProbe {
    runtime: Option<Arc<FakeRuntime>>,
    busy: Mutex<HashSet<u16>>,
}

impl FakePortProbe {
    pub fn new(runtime: Option<Arc<FakeRuntime>>) -> Self {
        Self {
            runtime,
            busy: Mutex::new(HashSet::new()),
        }
    }

    pub fn mark_busy(&self, port: u16) {
        self.busy.lock().unwrap().insert(port);
    }
}

#[async_trait]
impl PortProbe for FakePortProbe {
    async fn is_free(&self, port: u16) -> bool {
        if self.busy.lock().unwrap().contains(&port) {
            return false;
        }
        match &self.runtime {
            Some(runtime) => !runtime.bound_ports().contains(&port),
            None => true,
        }
    }
}

/// Writes a marker file, optionally pausing until released
#[derive(Default)]
pub struct FakeSource {
    pub entered: Arc<Notify>,
    gate: Option<Arc<Notify>>,
}

impl FakeSource {
    /// Fetches block until `gate` is notified
    pub fn gated(gate: Arc<Notify>) -> Self {
        Self {
            entered: Arc::new(Notify::new()),
            gate: Some(gate),
        }
    }
}

#[async_trait]
impl SourceFetcher for FakeSource {
    async fn fetch(&self, _request: &DeploymentRequest, dest: &Dir) -> Result<(), AgentError> {
        dest.create().await?;
        dest.file("package.json").write_string("{}").await?;
        self.entered.notify_one();
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeBuilder {
    pub fail: AtomicBool,
    built: Mutex<Vec<String>>,
}

impl FakeBuilder {
    pub fn built(&self) -> Vec<String> {
        self.built.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageBuilder for FakeBuilder {
    async fn build(&self, request: &ImageBuildRequest) -> Result<(), AgentError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AgentError::BuildError("npm install exited with 1".to_string()));
        }
        self.built.lock().unwrap().push(request.image.clone());
        Ok(())
    }
}

pub struct FakeSecrets;

#[async_trait]
impl SecretFetcher for FakeSecrets {
    async fn fetch_secrets(
        &self,
        _deployment_id: &str,
        _token: Option<&SecretToken>,
    ) -> Result<BTreeMap<String, String>, AgentError> {
        Ok(BTreeMap::from([(
            "DATABASE_URL".to_string(),
            "postgres://db:5432/app".to_string(),
        )]))
    }
}

pub struct OkProbe;

#[async_trait]
impl HttpProbe for OkProbe {
    async fn get(&self, _url: &str) -> Result<u16, AgentError> {
        Ok(200)
    }
}

/// Answers from a queue of status codes, then a fixed fallback
///
/// URLs under a failing prefix always answer 503.
pub struct ScriptedProbe {
    queue: Mutex<VecDeque<u16>>,
    fallback: u16,
    failing_prefix: Mutex<Option<String>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedProbe {
    pub fn new(statuses: &[u16], fallback: u16) -> Self {
        Self {
            queue: Mutex::new(statuses.iter().copied().collect()),
            fallback,
            failing_prefix: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_urls_starting_with(&self, prefix: Option<&str>) {
        *self.failing_prefix.lock().unwrap() = prefix.map(str::to_string);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpProbe for ScriptedProbe {
    async fn get(&self, url: &str) -> Result<u16, AgentError> {
        self.calls.lock().unwrap().push(url.to_string());
        let failing = self
            .failing_prefix
            .lock()
            .unwrap()
            .as_deref()
            .is_some_and(|prefix| url.starts_with(prefix));
        if failing {
            return Ok(503);
        }
        Ok(self
            .queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback))
    }
}

#[derive(Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<StatusEvent>>,
    completions: Mutex<Vec<JobCompletion>>,
}

impl RecordingReporter {
    pub fn events_for(&self, deployment_id: &str) -> Vec<StatusEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.deployment_id == deployment_id)
            .cloned()
            .collect()
    }

    pub fn terminal_events(&self, deployment_id: &str) -> Vec<StatusEvent> {
        self.events_for(deployment_id)
            .into_iter()
            .filter(|e| e.status.is_terminal())
            .collect()
    }

    pub fn completions(&self) -> Vec<JobCompletion> {
        self.completions.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatusReporter for RecordingReporter {
    async fn report(&self, event: StatusEvent) {
        self.events.lock().unwrap().push(event);
    }

    async fn notify_job_completion(&self, completion: JobCompletion) {
        self.completions.lock().unwrap().push(completion);
    }
}

// ================================== HARNESS ===================================== //

pub fn health_config() -> HealthCheckConfig {
    HealthCheckConfig {
        retries: 3,
        interval: Duration::from_millis(5),
        probe_path: "/health".to_string(),
        direct_host: "127.0.0.1".to_string(),
        route_retries: 1,
        route_backoff: CooldownOptions {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        },
    }
}

pub fn traffic_config() -> TrafficConfig {
    TrafficConfig {
        retries: 2,
        interval: Duration::from_millis(5),
        settle_delay: Duration::ZERO,
        final_probe: true,
        probe_path: "/health".to_string(),
        target_host: "127.0.0.1".to_string(),
        base_domain: "apps.test".to_string(),
    }
}

pub fn port_config(range_start: u16, range_end: u16) -> PortAllocatorConfig {
    PortAllocatorConfig::from_settings(
        &PortSettings {
            range_start,
            range_end,
            reserved: Vec::new(),
            container_port: CONTAINER_PORT,
        },
        &[8000, 7070],
    )
}

pub fn request(deployment_id: &str, service_name: &str) -> DeploymentRequest {
    serde_json::from_value(serde_json::json!({
        "deploymentId": deployment_id,
        "serviceName": service_name,
        "environment": "production",
        "appType": "node",
        "repoUrl": "https://git.example.com/acme/demo.git",
        "branch": "main",
    }))
    .unwrap()
}

/// An orchestrator wired to fakes under a temporary directory
pub struct Harness {
    pub runtime: Arc<FakeRuntime>,
    pub routes: Arc<InMemoryRouteTable>,
    pub reporter: Arc<RecordingReporter>,
    pub builder: Arc<FakeBuilder>,
    pub source: Arc<FakeSource>,
    pub port_probe: Arc<FakePortProbe>,
    pub ports_file: File,
    pub work_root: Dir,
    pub orchestrator: Arc<Orchestrator>,
    _tmp: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_source(FakeSource::default())
    }

    pub fn with_source(source: FakeSource) -> Self {
        Self::build(source, Arc::new(OkProbe), false)
    }

    /// Probe the routed domain after each switch through `probe`
    pub fn with_domain_check(probe: Arc<dyn HttpProbe>) -> Self {
        Self::build(FakeSource::default(), probe, true)
    }

    fn build(source: FakeSource, probe: Arc<dyn HttpProbe>, verify_domain: bool) -> Self {
        let tmp = TempDir::new().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let routes = Arc::new(InMemoryRouteTable::new("apps.test"));
        let reporter = Arc::new(RecordingReporter::default());
        let builder = Arc::new(FakeBuilder::default());
        let source = Arc::new(source);
        let port_probe = Arc::new(FakePortProbe::new(Some(runtime.clone())));
        let ports_file = File::new(tmp.path().join("ports.json"));
        let work_root = Dir::new(tmp.path().join("deployments"));

        let health = HealthCheckEngine::new(runtime.clone(), probe.clone(), health_config());
        let traffic = TrafficSwitch::new(routes.clone(), probe, traffic_config());

        let collaborators = Collaborators {
            runtime: runtime.clone(),
            ports: Arc::new(PortAllocator::new(
                port_config(3001, 3010),
                ports_file.clone(),
                port_probe.clone(),
            )),
            locks: Arc::new(DeploymentLocks::new()),
            health,
            traffic,
            source: source.clone(),
            secrets: Arc::new(FakeSecrets),
            builder: builder.clone(),
            reporter: reporter.clone(),
        };

        let mut settings = OrchestratorSettings::new(work_root.clone());
        settings.verify_domain = verify_domain;
        let orchestrator = Arc::new(Orchestrator::new(settings, collaborators));

        Self {
            runtime,
            routes,
            reporter,
            builder,
            source,
            port_probe,
            ports_file,
            work_root,
            orchestrator,
            _tmp: tmp,
        }
    }

    pub fn assert_single_terminal(&self, deployment_id: &str, status: DeploymentStatus) {
        let terminal = self.reporter.terminal_events(deployment_id);
        assert_eq!(terminal.len(), 1, "events: {:?}", terminal);
        assert_eq!(terminal[0].status, status, "event: {:?}", terminal[0]);
    }
}

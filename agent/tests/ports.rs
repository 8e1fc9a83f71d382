//! Host port allocation tests

mod common;

use std::sync::Arc;

use tempfile::TempDir;

use common::{port_config, FakePortProbe};
use rollout_agent::deploy::ports::PortAllocator;
use rollout_agent::errors::AgentError;
use rollout_agent::filesys::file::File;
use rollout_agent::models::deployment::PortAllocation;

fn allocator(tmp: &TempDir, probe: Arc<FakePortProbe>, start: u16, end: u16) -> PortAllocator {
    PortAllocator::new(
        port_config(start, end),
        File::new(tmp.path().join("ports.json")),
        probe,
    )
}

#[tokio::test]
async fn test_port_is_stable_across_allocations_and_restarts() {
    let tmp = TempDir::new().unwrap();
    let probe = Arc::new(FakePortProbe::new(None));

    let ports = allocator(&tmp, probe.clone(), 4000, 4100);
    let (first, container_port) = ports.allocate_port("demo").await.unwrap();
    let (again, _) = ports.allocate_port("demo").await.unwrap();
    assert_eq!(first, again);
    assert_eq!(container_port, common::CONTAINER_PORT);

    // A fresh allocator reads the persisted mapping
    let restarted = allocator(&tmp, probe, 4000, 4100);
    assert_eq!(restarted.lookup("demo").await.unwrap(), Some(first));
    assert_eq!(restarted.allocate_port("demo").await.unwrap().0, first);

    let persisted: std::collections::BTreeMap<String, PortAllocation> =
        File::new(tmp.path().join("ports.json"))
            .read_json()
            .await
            .unwrap();
    assert_eq!(persisted["demo"].host_port, first);
}

#[tokio::test]
async fn test_services_never_share_a_port() {
    let tmp = TempDir::new().unwrap();
    let ports = allocator(&tmp, Arc::new(FakePortProbe::new(None)), 4000, 4100);

    let mut seen = std::collections::HashSet::new();
    for service in ["api", "web", "worker", "admin"] {
        let (port, _) = ports.allocate_port(service).await.unwrap();
        assert!(seen.insert(port), "{} reused {}", service, port);
    }
    assert_eq!(ports.allocations().await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_busy_and_reserved_ports_are_skipped() {
    let tmp = TempDir::new().unwrap();
    let probe = Arc::new(FakePortProbe::new(None));
    probe.mark_busy(7069);

    // 7070 belongs to the agent itself
    let ports = allocator(&tmp, probe, 7069, 7072);
    assert_eq!(ports.allocate_port("demo").await.unwrap().0, 7071);
}

#[tokio::test]
async fn test_recorded_port_taken_by_another_process_is_replaced() {
    let tmp = TempDir::new().unwrap();
    let probe = Arc::new(FakePortProbe::new(None));
    let ports = allocator(&tmp, probe.clone(), 4000, 4100);

    let (first, _) = ports.allocate_port("demo").await.unwrap();
    probe.mark_busy(first);

    let (second, _) = ports.allocate_port("demo").await.unwrap();
    assert_ne!(first, second);
    assert_eq!(ports.lookup("demo").await.unwrap(), Some(second));
}

#[tokio::test]
async fn test_exhausted_range_fails() {
    let tmp = TempDir::new().unwrap();
    let ports = allocator(&tmp, Arc::new(FakePortProbe::new(None)), 4000, 4001);

    ports.allocate_port("a").await.unwrap();
    ports.allocate_port("b").await.unwrap();
    let err = ports.allocate_port("c").await.unwrap_err();
    assert!(matches!(err, AgentError::ExhaustedError(_)));
}

#[tokio::test]
async fn test_release_and_verify_mapping() {
    let tmp = TempDir::new().unwrap();
    let ports = allocator(&tmp, Arc::new(FakePortProbe::new(None)), 4000, 4100);

    let (port, _) = ports.allocate_port("demo").await.unwrap();
    assert!(!ports.verify_port_mapping("demo", port).await.unwrap());
    assert!(ports.verify_port_mapping("demo", 4050).await.unwrap());
    assert_eq!(ports.lookup("demo").await.unwrap(), Some(4050));

    assert_eq!(ports.release_port("demo").await.unwrap(), Some(4050));
    assert_eq!(ports.release_port("demo").await.unwrap(), None);
    assert_eq!(ports.lookup("demo").await.unwrap(), None);
}

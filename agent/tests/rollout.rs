//! End-to-end rollout tests against an in-memory runtime

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::Notify;

use common::{request, FakeSource, Harness};
use rollout_agent::errors::AgentError;
use rollout_agent::models::deployment::{Color, DeploymentStatus};

#[tokio::test]
async fn test_first_rollout_starts_blue() {
    let h = Harness::new();

    let outcome = h.orchestrator.deploy(request("dep-1", "demo")).await.unwrap();

    assert_eq!(outcome.color, Color::Blue);
    assert_eq!(outcome.container_name, "demo-blue");
    assert_eq!(outcome.host_port, 3001);
    assert_eq!(outcome.domain, "demo.apps.test");
    assert!(outcome.route_confirmed);

    let container = h.runtime.container("demo-blue").unwrap();
    assert!(container.running);
    assert_eq!(container.labels.get("rollout.color").map(String::as_str), Some("blue"));
    assert_eq!(h.builder.built(), vec!["rollout/demo:dep1".to_string()]);

    assert_eq!(
        h.routes.target_of("demo").await.as_deref(),
        Some("http://127.0.0.1:3001")
    );
    assert_eq!(h.orchestrator.ports().lookup("demo").await.unwrap(), Some(3001));
    assert!(h.ports_file.exists().await);

    let events = h.reporter.events_for("dep-1");
    assert!(events.len() > 1);
    assert!(events[..events.len() - 1]
        .iter()
        .all(|e| e.status == DeploymentStatus::InProgress));
    h.assert_single_terminal("dep-1", DeploymentStatus::Success);
    assert_eq!(
        events.last().unwrap().domain.as_deref(),
        Some("demo.apps.test")
    );

    assert!(!h.work_root.subdir("dep-1").exists().await);
    assert!(!h.orchestrator.locks().is_locked("demo", "production"));
}

#[tokio::test]
async fn test_colors_alternate_and_old_container_is_retired() {
    let h = Harness::new();

    let first = h.orchestrator.deploy(request("dep-1", "demo")).await.unwrap();
    let second = h.orchestrator.deploy(request("dep-2", "demo")).await.unwrap();
    let third = h.orchestrator.deploy(request("dep-3", "demo")).await.unwrap();

    assert_eq!(first.color, Color::Blue);
    assert_eq!(second.color, Color::Green);
    assert_eq!(third.color, Color::Blue);

    // Only the latest instance survives
    assert_eq!(h.runtime.names(), vec!["demo-blue".to_string()]);

    // The serving instance holds its port, so the next one gets another
    assert_ne!(first.host_port, second.host_port);
    assert_eq!(
        h.routes.target_of("demo").await,
        Some(format!("http://127.0.0.1:{}", third.host_port))
    );

    // Each retired instance was snapshotted, then the snapshot dropped
    assert_eq!(h.runtime.committed().len(), 2);
    assert!(h
        .runtime
        .removed_images()
        .contains(&"rollout-backup/demo:dep2".to_string()));
}

#[tokio::test]
async fn test_legacy_container_is_replaced_by_blue() {
    let h = Harness::new();
    h.runtime.seed("demo", 3005, true);

    let outcome = h.orchestrator.deploy(request("dep-1", "demo")).await.unwrap();

    assert_eq!(outcome.container_name, "demo-blue");
    assert!(h.runtime.container("demo").is_none());
}

#[tokio::test]
async fn test_other_services_container_is_never_adopted() {
    let h = Harness::new();
    h.orchestrator.deploy(request("dep-1", "demo")).await.unwrap();

    // `demo-blue` belongs to `demo` even though its name matches verbatim
    let claimed = h.orchestrator.discover("demo-blue").await.unwrap();
    assert!(claimed.is_empty(), "claimed: {:?}", claimed);

    let err = h
        .orchestrator
        .deploy(request("dep-2", "demo-blue"))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::ValidationError(_)));
    h.assert_single_terminal("dep-2", DeploymentStatus::Failed);

    assert_eq!(h.runtime.names(), vec!["demo-blue".to_string()]);
    assert!(h.runtime.container("demo-blue").unwrap().running);
    assert_eq!(
        h.routes.target_of("demo").await.as_deref(),
        Some("http://127.0.0.1:3001")
    );
}

#[tokio::test]
async fn test_build_failure_reports_once_and_leaves_nothing_behind() {
    let h = Harness::new();
    h.builder.fail.store(true, Ordering::SeqCst);

    let err = h.orchestrator.deploy(request("dep-1", "demo")).await.unwrap_err();

    assert!(matches!(err, AgentError::BuildError(_)), "got {:?}", err);
    h.assert_single_terminal("dep-1", DeploymentStatus::Failed);
    assert!(h.runtime.container("demo-blue").is_none());
    assert_eq!(h.orchestrator.ports().lookup("demo").await.unwrap(), None);
    assert!(h.routes.target_of("demo").await.is_none());
    assert!(!h.orchestrator.locks().is_locked("demo", "production"));

    // Kept for inspection after a rollback
    assert!(h.work_root.subdir("dep-1").exists().await);
}

#[tokio::test]
async fn test_health_failure_releases_lock_and_restores_previous() {
    let h = Harness::new();
    h.orchestrator.deploy(request("dep-1", "demo")).await.unwrap();
    let serving_port = h.orchestrator.ports().lookup("demo").await.unwrap();

    h.runtime.set_new_health(Some("unhealthy"));
    let err = h.orchestrator.deploy(request("dep-2", "demo")).await.unwrap_err();

    match &err {
        AgentError::HealthCheckError { diagnostics, .. } => {
            let diagnostics = diagnostics.as_ref().unwrap();
            assert!(diagnostics.logs_tail.contains("demo-green"));
        }
        other => panic!("expected health check error, got {:?}", other),
    }
    assert!(!h.orchestrator.locks().is_locked("demo", "production"));
    h.assert_single_terminal("dep-2", DeploymentStatus::Failed);

    // The previous instance still serves on its original port
    assert!(h.runtime.container("demo-green").is_none());
    assert!(h.runtime.container("demo-blue").unwrap().running);
    assert_eq!(h.orchestrator.ports().lookup("demo").await.unwrap(), serving_port);
    assert_eq!(
        h.routes.target_of("demo").await,
        serving_port.map(|p| format!("http://127.0.0.1:{}", p))
    );
    assert!(h
        .runtime
        .removed_images()
        .contains(&"rollout/demo:dep2".to_string()));

    // A later healthy rollout goes through
    h.runtime.set_new_health(Some("healthy"));
    let outcome = h.orchestrator.deploy(request("dep-3", "demo")).await.unwrap();
    assert_eq!(outcome.color, Color::Green);
}

#[tokio::test]
async fn test_health_failure_without_previous_releases_port() {
    let h = Harness::new();
    h.runtime.set_new_health(None);

    let err = h.orchestrator.deploy(request("dep-1", "demo")).await.unwrap_err();

    assert_eq!(err.kind(), "health_check");
    assert!(h.runtime.names().is_empty());
    assert_eq!(h.orchestrator.ports().lookup("demo").await.unwrap(), None);
}

#[tokio::test]
async fn test_stopped_previous_container_is_not_treated_as_serving() {
    let h = Harness::new();
    h.runtime.seed("demo-green", 3004, false);

    let outcome = h.orchestrator.deploy(request("dep-1", "demo")).await.unwrap();

    // Nothing was serving, so the rollout starts at blue
    assert_eq!(outcome.color, Color::Blue);
    assert!(h.runtime.committed().is_empty());
}

#[tokio::test]
async fn test_concurrent_rollouts_of_one_service_conflict() {
    let gate = Arc::new(Notify::new());
    let h = Harness::with_source(FakeSource::gated(gate.clone()));

    let orchestrator = h.orchestrator.clone();
    let first = tokio::spawn(async move { orchestrator.deploy(request("dep-1", "demo")).await });
    h.source.entered.notified().await;
    assert!(h.orchestrator.locks().is_locked("demo", "production"));

    let err = h.orchestrator.deploy(request("dep-2", "demo")).await.unwrap_err();
    assert!(matches!(err, AgentError::ConflictError(ref key) if key == "demo:production"));
    h.assert_single_terminal("dep-2", DeploymentStatus::Failed);
    assert_eq!(h.reporter.events_for("dep-2").len(), 1);

    gate.notify_one();
    let outcome = first.await.unwrap().unwrap();
    assert_eq!(outcome.container_name, "demo-blue");
    h.assert_single_terminal("dep-1", DeploymentStatus::Success);
    assert!(h.orchestrator.locks().held().is_empty());
}

#[tokio::test]
async fn test_invalid_request_is_rejected_before_any_work() {
    let h = Harness::new();
    let mut bad = request("dep-1", "demo");
    bad.service_name = "Demo_App".to_string();

    let err = h.orchestrator.deploy(bad).await.unwrap_err();

    assert!(matches!(err, AgentError::ValidationError(_)));
    h.assert_single_terminal("dep-1", DeploymentStatus::Failed);
    assert_eq!(h.reporter.events_for("dep-1").len(), 1);
    assert!(!h.work_root.exists().await);
    assert!(h.builder.built().is_empty());
}

#[tokio::test]
async fn test_malformed_payload_is_reported_under_its_id() {
    let h = Harness::new();

    let err = h
        .orchestrator
        .deploy_payload(serde_json::json!({ "deploymentId": "dep-9", "serviceName": "demo" }))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "validation");
    h.assert_single_terminal("dep-9", DeploymentStatus::Failed);
}

#[tokio::test]
async fn test_job_completion_follows_terminal_status() {
    let h = Harness::new();
    let mut with_job = request("dep-1", "demo");
    with_job.job_id = Some("job-7".to_string());
    with_job.project_id = Some("proj-1".to_string());

    h.orchestrator.deploy(with_job).await.unwrap();
    h.orchestrator.deploy(request("dep-2", "demo")).await.unwrap();

    let completions = h.reporter.completions();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].job_id, "job-7");
    assert_eq!(completions[0].deployment_id, "dep-1");
    assert_eq!(completions[0].status, DeploymentStatus::Success);
    assert_eq!(completions[0].domain.as_deref(), Some("demo.apps.test"));
}

#[tokio::test]
async fn test_explicit_domain_is_reported() {
    let h = Harness::new();
    let mut custom = request("dep-1", "demo");
    custom.domain = Some("shop.example.com".to_string());

    let outcome = h.orchestrator.deploy(custom).await.unwrap();

    assert_eq!(outcome.domain, "shop.example.com");
}

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use sandbox_isolation::filter::MockFilter;
use sandbox_isolation::manager::types::SandboxStatus;
use sandbox_isolation::network::{Protocol, TrafficRequest};
use sandbox_isolation::prelude::*;
use sandbox_isolation::runtime::MockRuntime;
use sandbox_isolation::security::profile::ResourceSecurityPolicy;
use sandbox_isolation::security::report::CSV_HEADER;
use sandbox_isolation::security::{EventAction, ProfileTemplate, ViolationCategory};
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    runtime: Arc<MockRuntime>,
    engine: SandboxEngine,
}

fn harness(cpu: f64, memory_mb: u64) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::default();
    config.resources.total_cpu = Some(cpu);
    config.resources.total_memory_mb = Some(memory_mb);
    config.security.policy_dir = Some(dir.path().to_path_buf());

    let runtime = Arc::new(MockRuntime::new());
    let engine = SandboxEngine::new(config, runtime.clone(), Arc::new(MockFilter::new())).unwrap();
    Harness {
        _dir: dir,
        runtime,
        engine,
    }
}

fn sandbox(id: &str, cpu: f64, memory_mb: u64) -> SandboxConfig {
    SandboxConfig::new(id, "alpine:3.19")
        .with_resources(ResourceLimits::default().with_cpu(cpu).with_memory_mb(memory_mb))
}

#[tokio::test]
async fn exhaustion_is_reported_before_any_container_is_created() {
    let h = harness(2.0, 1024);
    let result = h
        .engine
        .provision(ProvisionRequest::new(sandbox("big", 4.0, 512)))
        .await;

    assert!(matches!(result, Err(SandboxError::ResourceExhaustion(_))));
    assert_eq!(h.runtime.call_count("create"), 0);
    assert!(h.engine.sandboxes().get_sandbox("big").is_none());
}

#[tokio::test]
async fn cleanup_is_idempotent_and_restores_the_ledger() {
    let h = harness(4.0, 4096);
    let baseline = h.engine.ledger().utilization();

    h.engine
        .provision(ProvisionRequest::new(sandbox("sb-1", 1.5, 1024)))
        .await
        .unwrap();
    assert_eq!(h.engine.ledger().utilization().allocated_memory_mb, 1024);

    h.engine.teardown("sb-1").await;
    h.engine.teardown("sb-1").await;
    h.engine.sandboxes().cleanup_sandbox("sb-1").await;

    assert_eq!(h.engine.ledger().utilization(), baseline);
    assert_eq!(h.runtime.call_count("rm"), 1);
}

#[tokio::test]
async fn blocked_and_allowed_paths() {
    let h = harness(4.0, 4096);
    let id = h
        .engine
        .provision(ProvisionRequest::new(sandbox("sb-1", 1.0, 512)).with_profile("medium-risk"))
        .await
        .unwrap();
    let security = h.engine.security();

    let denied = security
        .validate_execution(&id, "read_file", &ExecutionContext::path("/etc/passwd"))
        .await;
    assert!(!denied.allowed);
    assert_eq!(denied.violations[0].category, ViolationCategory::Filesystem);

    let allowed = security
        .validate_execution(&id, "read_file", &ExecutionContext::path("/tmp/data.txt"))
        .await;
    assert!(allowed.allowed);
    assert!(allowed.violations.is_empty());
}

#[tokio::test]
async fn isolated_sandbox_only_reaches_loopback() {
    let h = harness(4.0, 4096);
    let id = h
        .engine
        .provision(
            ProvisionRequest::new(sandbox("sb-1", 1.0, 512)).with_network(NetworkRequest {
                access: NetworkAccess::Allow(vec![Destination::new("github.com", Some(443), Protocol::Tcp)]),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
    let network = h.engine.network();

    let github = TrafficRequest::outbound("github.com", Some(443), Protocol::Tcp);
    assert!(network.evaluate_traffic(&id, &github).unwrap().allowed);

    network.isolate_sandbox(&id).await.unwrap();

    assert!(!network.evaluate_traffic(&id, &github).unwrap().allowed);
    let dns = TrafficRequest::outbound("8.8.8.8", Some(53), Protocol::Udp);
    assert!(!network.evaluate_traffic(&id, &dns).unwrap().allowed);
    let local = TrafficRequest::inbound("127.0.0.1", Some(8080), Protocol::Tcp);
    assert!(network.evaluate_traffic(&id, &local).unwrap().allowed);
}

#[tokio::test]
async fn process_limit_is_a_resource_violation() {
    let h = harness(4.0, 4096);
    let security = h.engine.security();

    let base = security.get_profile("medium-risk").unwrap();
    let mut template = ProfileTemplate::derived_from(&base, "five processes");
    template.resources = Some(ResourceSecurityPolicy {
        max_cpu_cores: 1.0,
        max_memory_mb: 1024,
        max_execution_time_sec: 600,
        max_processes: 5,
        max_open_files: 256,
    });
    let profile = security.create_custom_profile(template).await.unwrap();

    let id = h
        .engine
        .provision(ProvisionRequest::new(sandbox("sb-1", 1.0, 512)).with_profile(profile.id.clone()))
        .await
        .unwrap();

    let context = ExecutionContext {
        process_count: Some(6),
        ..Default::default()
    };
    let result = security.validate_execution(&id, "spawn", &context).await;
    assert!(!result.allowed);
    assert!(result
        .violations
        .iter()
        .any(|v| v.category == ViolationCategory::Resource && v.rule == "max_processes"));
}

#[tokio::test]
async fn two_violations_in_ten_events_score_eighty() {
    let h = harness(4.0, 4096);
    let id = h
        .engine
        .provision(ProvisionRequest::new(sandbox("sb-1", 1.0, 512)))
        .await
        .unwrap();
    let security = h.engine.security();

    for i in 0..10 {
        let path = if i < 2 { "/etc/shadow" } else { "/tmp/ok" };
        security
            .validate_execution(&id, "read", &ExecutionContext::path(path))
            .await;
    }

    let report = security.get_compliance_report(&id).unwrap();
    assert_eq!(report.total_events, 10);
    assert_eq!(report.violations, 2);
    assert!((report.score - 80.0).abs() < 1e-9);
    assert!(report.compliant);
}

#[tokio::test]
async fn csv_report_has_one_row_per_event() {
    let h = harness(4.0, 4096);
    let id = h
        .engine
        .provision(ProvisionRequest::new(sandbox("sb-1", 1.0, 512)))
        .await
        .unwrap();
    let security = h.engine.security();
    for path in ["/tmp/a", "/etc/hosts", "/workspace/b"] {
        security
            .validate_execution(&id, "read", &ExecutionContext::path(path))
            .await;
    }

    let csv = security
        .export_audit_report(Some(&id), ReportFormat::Csv)
        .unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines[0], CSV_HEADER);
    assert_eq!(lines.len(), 4);
}

#[tokio::test]
async fn concurrent_create_and_cleanup_balance_the_ledger() {
    let h = harness(64.0, 65536);
    let ids: Vec<String> = (0..16).map(|i| format!("sb-{}", i)).collect();

    let created = join_all(
        ids.iter()
            .map(|id| h.engine.provision(ProvisionRequest::new(sandbox(id, 0.5, 256)))),
    )
    .await;
    assert!(created.iter().all(|r| r.is_ok()));
    let utilization = h.engine.ledger().utilization();
    assert_eq!(utilization.active_allocations, 16);
    assert_eq!(utilization.allocated_memory_mb, 16 * 256);

    // Every id torn down twice, concurrently.
    join_all(ids.iter().chain(ids.iter()).map(|id| h.engine.teardown(id))).await;

    let utilization = h.engine.ledger().utilization();
    assert_eq!(utilization.active_allocations, 0);
    assert_eq!(utilization.allocated_memory_mb, 0);
    assert!(utilization.allocated_cpu.abs() < 1e-9);
    assert_eq!(h.runtime.container_count(), 0);
}

#[tokio::test]
async fn interleaved_provision_and_teardown_stay_independent() {
    let h = harness(8.0, 8192);
    for i in 0..8 {
        h.engine
            .provision(ProvisionRequest::new(sandbox(&format!("old-{}", i), 0.5, 256)))
            .await
            .unwrap();
    }

    for i in 0..8 {
        let old = format!("old-{}", i);
        let new = format!("new-{}", i);
        let (created, ()) = tokio::join!(
            h.engine
                .provision(ProvisionRequest::new(sandbox(&new, 0.5, 256)).with_network(NetworkRequest {
                    access: NetworkAccess::Isolated,
                    ..Default::default()
                })),
            h.engine.teardown(&old),
        );
        assert_eq!(created.unwrap(), new);
        assert!(h.engine.sandboxes().get_sandbox(&old).is_none());
    }

    let utilization = h.engine.ledger().utilization();
    assert_eq!(utilization.active_allocations, 8);
    assert_eq!(utilization.allocated_memory_mb, 8 * 256);
    assert_eq!(h.runtime.container_count(), 8);
    assert_eq!(h.runtime.network_count(), 8);
    assert!(h
        .engine
        .sandboxes()
        .list_sandboxes()
        .iter()
        .all(|s| s.id.starts_with("new-") && s.status == SandboxStatus::Running));

    h.engine.shutdown().await;
    assert_eq!(h.engine.ledger().utilization().active_allocations, 0);
    assert_eq!(h.runtime.network_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn compliance_monitor_isolates_without_being_asked() {
    let h = harness(4.0, 4096);
    h.engine.initialize().await.unwrap();
    let mut rx = h.engine.subscribe();

    let id = h
        .engine
        .provision(
            ProvisionRequest::new(sandbox("sb-1", 1.0, 512)).with_network(NetworkRequest {
                access: NetworkAccess::Allow(vec![Destination::new("github.com", Some(443), Protocol::Tcp)]),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
    let security = h.engine.security();
    for _ in 0..11 {
        security
            .validate_execution(&id, "read", &ExecutionContext::path("/etc/shadow"))
            .await;
    }

    // nothing has reacted before the first compliance tick
    let github = TrafficRequest::outbound("github.com", Some(443), Protocol::Tcp);
    assert!(h.engine.network().evaluate_traffic(&id, &github).unwrap().allowed);

    tokio::time::sleep(Duration::from_secs(31)).await;

    let mut triggered = false;
    let isolated = tokio::time::timeout(Duration::from_secs(60), async {
        while let Some(event) = rx.recv().await {
            match event {
                EngineEvent::SandboxIsolationTriggered { ref sandbox_id, violations, .. } => {
                    assert_eq!(sandbox_id, &id);
                    assert_eq!(violations, 11);
                    triggered = true;
                }
                EngineEvent::SecurityEvent(event) if event.action == EventAction::Isolated => return true,
                _ => {}
            }
        }
        false
    })
    .await
    .unwrap();

    assert!(triggered);
    assert!(isolated);
    assert!(!h.engine.network().evaluate_traffic(&id, &github).unwrap().allowed);
    assert_eq!(h.engine.network().get_policy(&id).unwrap().id, "isolate-sb-1");
    h.engine.shutdown().await;
}

#[tokio::test]
async fn ephemeral_sandbox_is_removed_after_success() {
    let h = harness(4.0, 4096);
    h.runtime.set_exec_output(0, "hello\n", "");

    let result = h
        .engine
        .sandboxes()
        .execute_in_sandbox("task-a", vec!["echo".into(), "hello".into()], ExecOptions::default())
        .await
        .unwrap();

    assert_eq!(result.stdout, "hello\n");
    assert!(result.success());
    assert!(h.engine.sandboxes().get_sandbox(&result.sandbox_id).is_none());
    assert!(h.engine.sandboxes().list_sandboxes().is_empty());
    assert_eq!(h.engine.ledger().utilization().active_allocations, 0);
}

#[tokio::test]
async fn ephemeral_sandbox_is_removed_after_failure() {
    let h = harness(4.0, 4096);
    h.runtime.fail_start("image not found");

    let result = h
        .engine
        .sandboxes()
        .execute_in_sandbox("task-b", vec!["true".into()], ExecOptions::default())
        .await;

    assert!(result.is_err());
    assert!(h.engine.sandboxes().list_sandboxes().is_empty());
    assert_eq!(h.engine.ledger().utilization().active_allocations, 0);
}

#[tokio::test(start_paused = true)]
async fn ephemeral_sandbox_is_removed_after_timeout() {
    let h = harness(4.0, 4096);
    h.runtime.set_exec_delay(Duration::from_secs(60));

    let result = h
        .engine
        .sandboxes()
        .execute_in_sandbox(
            "task-c",
            vec!["sleep".into(), "60".into()],
            ExecOptions {
                timeout: Some(Duration::from_secs(1)),
                ..Default::default()
            },
        )
        .await;

    assert!(matches!(result, Err(SandboxError::Timeout(1000))));
    assert!(h.engine.sandboxes().list_sandboxes().is_empty());
    assert_eq!(h.runtime.container_count(), 0);
}

#[tokio::test]
async fn kept_sandbox_survives_execution() {
    let h = harness(4.0, 4096);

    let result = h
        .engine
        .sandboxes()
        .execute_in_sandbox(
            "task-d",
            vec!["true".into()],
            ExecOptions {
                cleanup_on_exit: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let state = h.engine.sandboxes().get_sandbox(&result.sandbox_id).unwrap();
    assert_eq!(state.status, SandboxStatus::Running);

    h.engine.shutdown().await;
    assert!(h.engine.sandboxes().list_sandboxes().is_empty());
}

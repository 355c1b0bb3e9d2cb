//! Assign, lookup, heartbeat and stop against the in-memory runtime.

mod common;

use common::{test_config, Harness};
use futures::future::join_all;
use labpool::config::PortRange;
use labpool::runtime::RuntimeError;
use labpool::state::UpsertOutcome;
use labpool::{ContainerRecord, Error, LabStore, Owner, PortType, Provenance, StopOutcome};
use std::collections::HashSet;
use std::time::Duration;

#[tokio::test]
async fn test_assign_creates_fresh_container_with_connection_info() {
    let h = Harness::new().await;

    let info = h.manager.assign("alice", "web-101").await.unwrap();

    assert_eq!(info.provenance, Provenance::Fresh);
    assert_eq!(info.owner, Owner::user("alice"));
    assert_eq!(info.scenario_id.as_deref(), Some("web-101"));
    assert!((20000..=20004).contains(&info.display_port));
    assert!((20010..=20014).contains(&info.proxy_port));
    assert_eq!(info.display_url, format!("http://localhost:{}", info.display_port));
    assert_eq!(
        info.proxy_url,
        format!("http://localhost:{}/vnc.html?password=kali123", info.proxy_port)
    );
    assert!(info.name.starts_with("lab-user-alice-"));
    assert!(h.runtime.is_running(&info.runtime_id));

    assert_eq!(h.port_owner(info.display_port).await.as_deref(), Some("user:alice"));
    assert_eq!(h.port_owner(info.proxy_port).await.as_deref(), Some("user:alice"));
}

#[tokio::test]
async fn test_second_assign_reuses_the_same_container() {
    let h = Harness::new().await;

    let first = h.manager.assign("alice", "web-101").await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = h.manager.assign("alice", "web-101").await.unwrap();

    assert_eq!(second.provenance, Provenance::Reused);
    assert!(second.reused());
    assert_eq!(first.runtime_id, second.runtime_id);
    assert_eq!(first.display_port, second.display_port);
    assert_eq!(first.proxy_port, second.proxy_port);
    assert!(second.last_activity_at >= first.last_activity_at);
    assert_eq!(h.runtime.container_count(), 1);
    assert_eq!(h.taken_ports().await.len(), 2);
}

#[tokio::test]
async fn test_start_failure_releases_ports_and_removes_orphan() {
    let h = Harness::new().await;
    h.runtime.set_fail_start(true);

    let err = h.manager.assign("alice", "web-101").await.unwrap_err();

    assert!(matches!(
        err,
        Error::RuntimeOperationFailed(RuntimeError::CommandFailed { .. })
    ));
    assert!(h.taken_ports().await.is_empty(), "ports leaked after failed start");
    assert_eq!(h.runtime.container_count(), 0, "created container left behind");
    assert!(h
        .manager
        .store()
        .find_running(&Owner::user("alice"))
        .await
        .unwrap()
        .is_none());

    h.runtime.set_fail_start(false);
    let info = h.manager.assign("alice", "web-101").await.unwrap();
    assert_eq!(info.provenance, Provenance::Fresh);
}

#[tokio::test]
async fn test_create_failure_releases_ports() {
    let h = Harness::new().await;
    h.runtime.set_fail_create(true);

    assert!(h.manager.assign("bob", "net-201").await.is_err());
    assert!(h.taken_ports().await.is_empty());
    assert_eq!(h.free(PortType::Display).await, 5);
    assert_eq!(h.free(PortType::Proxy).await, 5);
}

#[tokio::test]
async fn test_create_timeout_goes_through_compensation() {
    let mut config = test_config();
    config.timeouts.create = Duration::from_millis(30);
    let h = Harness::with_config(config).await;
    h.runtime.set_create_delay(Some(Duration::from_millis(300)));

    let err = h.manager.assign("alice", "web-101").await.unwrap_err();

    assert!(matches!(
        err,
        Error::RuntimeOperationFailed(RuntimeError::Timeout { .. })
    ));
    assert!(err.is_retryable());
    assert!(h.taken_ports().await.is_empty());
    assert_eq!(h.runtime.container_count(), 0);
    assert!(h.manager.lookup("alice").await.unwrap().is_none());
}

#[tokio::test]
async fn test_capacity_gate_and_recovery_after_stop() {
    let mut config = test_config();
    config.max_containers = 2;
    let h = Harness::with_config(config).await;

    h.manager.assign("alice", "s").await.unwrap();
    h.manager.assign("bob", "s").await.unwrap();

    let err = h.manager.assign("carol", "s").await.unwrap_err();
    assert!(matches!(err, Error::CapacityExceeded { active: 2, max: 2 }));
    assert!(err.is_capacity());
    assert_eq!(h.taken_ports().await.len(), 4, "capacity refusal must not reserve ports");

    // An owner that already has a container is still served at capacity.
    let again = h.manager.assign("alice", "s").await.unwrap();
    assert!(again.reused());

    assert!(matches!(
        h.manager.stop("alice").await.unwrap(),
        StopOutcome::Stopped { .. }
    ));
    let carol = h.manager.assign("carol", "s").await.unwrap();
    assert_eq!(carol.provenance, Provenance::Fresh);
}

#[tokio::test]
async fn test_concurrent_assigns_respect_capacity() {
    let mut config = test_config();
    config.max_containers = 1;
    let h = Harness::with_config(config).await;

    let results = join_all((0..4).map(|i| {
        let manager = h.manager.clone();
        async move { manager.assign(&format!("u{i}"), "s").await }
    }))
    .await;

    let served = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(served, 1);
    for err in results.into_iter().filter_map(|r| r.err()) {
        assert!(matches!(err, Error::CapacityExceeded { max: 1, .. }), "{err}");
    }
    assert_eq!(h.runtime.running_count(), 1);
    assert_eq!(h.taken_ports().await.len(), 2);
    assert_eq!(h.manager.stats().await.unwrap().active, 1);
}

#[tokio::test]
async fn test_proxy_exhaustion_returns_display_port() {
    let mut config = test_config();
    config.ports.proxy = PortRange::new(20010, 20010);
    let h = Harness::with_config(config).await;
    let alice = h.manager.assign("alice", "s").await.unwrap();

    let err = h.manager.assign("bob", "s").await.unwrap_err();

    assert!(matches!(
        err,
        Error::ResourceExhausted {
            port_type: PortType::Proxy
        }
    ));
    assert_eq!(h.free(PortType::Display).await, 4);
    assert_eq!(
        h.taken_ports().await,
        [alice.display_port, alice.proxy_port].into_iter().collect()
    );
    assert_eq!(h.runtime.container_count(), 1);
}

#[tokio::test]
async fn test_record_write_failure_removes_started_container() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lab.db");
    let store = LabStore::open(&path).await.unwrap();
    let h = Harness::on_store(test_config(), store).await;

    let raw = rusqlite::Connection::open(&path).unwrap();
    raw.execute_batch(
        "CREATE TRIGGER refuse_records BEFORE INSERT ON containers
         BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
    )
    .unwrap();

    let err = h.manager.assign("alice", "web-101").await.unwrap_err();

    assert!(matches!(err, Error::Database(_)), "{err}");
    assert!(h.taken_ports().await.is_empty(), "ports leaked after failed write");
    assert_eq!(h.runtime.container_count(), 0, "started container left behind");

    raw.execute_batch("DROP TRIGGER refuse_records;").unwrap();
    let info = h.manager.assign("alice", "web-101").await.unwrap();
    assert_eq!(info.provenance, Provenance::Fresh);
}

#[tokio::test]
async fn test_lookup_heals_crashed_container() {
    let h = Harness::new().await;
    let info = h.manager.assign("alice", "web-101").await.unwrap();

    h.runtime.crash(&info.runtime_id);

    assert!(h.manager.lookup("alice").await.unwrap().is_none());
    assert!(h.taken_ports().await.is_empty());
    assert!(!h.manager.cleanup(&info.runtime_id).await.unwrap());

    let next = h.manager.assign("alice", "web-101").await.unwrap();
    assert_eq!(next.provenance, Provenance::Fresh);
    assert_ne!(next.runtime_id, info.runtime_id);
}

#[tokio::test]
async fn test_lookup_heals_container_removed_out_of_band() {
    let h = Harness::new().await;
    let info = h.manager.assign("alice", "web-101").await.unwrap();

    h.manager.store().upsert_running(ContainerRecord::running(
        Owner::user("bob"),
        "deadbeef".repeat(8),
        "lab-user-bob-gone".to_string(),
        info.display_port + 1,
        info.proxy_port + 1,
        None,
    ))
    .await
    .unwrap();

    assert!(h.manager.lookup("bob").await.unwrap().is_none());
    assert!(h.manager.lookup("alice").await.unwrap().is_some());
}

#[tokio::test]
async fn test_stop_releases_everything_and_repeats_as_not_found() {
    let h = Harness::new().await;
    let info = h.manager.assign("alice", "web-101").await.unwrap();

    let outcome = h.manager.stop("alice").await.unwrap();
    assert_eq!(
        outcome,
        StopOutcome::Stopped {
            runtime_id: info.runtime_id.clone()
        }
    );
    assert!(!h.runtime.exists(&info.runtime_id));
    assert!(h.taken_ports().await.is_empty());

    assert_eq!(h.manager.stop("alice").await.unwrap(), StopOutcome::NotFound);
    assert_eq!(h.manager.stop("nobody").await.unwrap(), StopOutcome::NotFound);
}

#[tokio::test]
async fn test_stop_failure_leaves_record_in_place() {
    let h = Harness::new().await;
    let info = h.manager.assign("alice", "web-101").await.unwrap();
    h.runtime.set_fail_stop(true);

    assert!(h.manager.stop("alice").await.is_err());
    assert_eq!(h.taken_ports().await.len(), 2);

    h.runtime.set_fail_stop(false);
    assert!(matches!(
        h.manager.stop("alice").await.unwrap(),
        StopOutcome::Stopped { .. }
    ));
    assert!(!h.runtime.exists(&info.runtime_id));
}

#[tokio::test]
async fn test_heartbeat_refreshes_activity() {
    let h = Harness::new().await;
    assert!(!h.manager.heartbeat("alice").await.unwrap());

    let info = h.manager.assign("alice", "web-101").await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(h.manager.heartbeat("alice").await.unwrap());

    let record = h.manager.lookup("alice").await.unwrap().unwrap();
    assert!(record.last_activity_at > info.last_activity_at);
    assert_eq!(record.runtime_id, info.runtime_id);
}

#[tokio::test]
async fn test_empty_owner_is_rejected() {
    let h = Harness::new().await;
    assert!(matches!(
        h.manager.assign("  ", "web-101").await,
        Err(Error::Validation(_))
    ));
    assert_eq!(h.runtime.container_count(), 0);
}

#[tokio::test]
async fn test_concurrent_assigns_for_distinct_users_get_distinct_ports() {
    let h = Harness::new().await;

    let results = join_all((0..5).map(|i| {
        let manager = h.manager.clone();
        async move { manager.assign(&format!("user{i}"), "s").await }
    }))
    .await;

    let infos: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();
    let ports: HashSet<u16> = infos
        .iter()
        .flat_map(|i| [i.display_port, i.proxy_port])
        .collect();
    assert_eq!(ports.len(), 10);
    assert_eq!(h.runtime.running_count(), 5);

    let stats = h.manager.stats().await.unwrap();
    assert_eq!(stats.active, 5);
    assert_eq!(stats.assigned(), 5);
    assert_eq!(stats.utilization_percent, 100.0);
}

/// Overwriting a RUNNING row leaves the replaced container's ports
/// allocated. Kept as observed behaviour; reclaiming them needs a
/// reconcile pass.
#[tokio::test]
async fn test_overwritten_record_keeps_its_ports_allocated() {
    let h = Harness::new().await;
    let first = h.manager.assign("alice", "web-101").await.unwrap();

    let display = h.manager.ledger().allocate(PortType::Display).await.unwrap();
    let proxy = h.manager.ledger().allocate(PortType::Proxy).await.unwrap();
    let outcome = h
        .manager
        .store()
        .upsert_running(ContainerRecord::running(
            Owner::user("alice"),
            "feedface".repeat(8),
            "lab-user-alice-replacement".to_string(),
            display,
            proxy,
            Some("web-101".to_string()),
        ))
        .await
        .unwrap();
    match outcome {
        UpsertOutcome::Overwrote { previous } => assert_eq!(previous.runtime_id, first.runtime_id),
        other => panic!("expected overwrite, got {:?}", other),
    }

    // The replacement is not in the runtime, so lookup cleans it up.
    assert!(h.manager.lookup("alice").await.unwrap().is_none());

    let taken = h.taken_ports().await;
    assert!(!taken.contains(&display) && !taken.contains(&proxy));
    assert!(taken.contains(&first.display_port), "first display port was reclaimed");
    assert!(taken.contains(&first.proxy_port), "first proxy port was reclaimed");
    assert!(h.runtime.is_running(&first.runtime_id));
}

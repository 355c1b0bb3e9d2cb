//! Startup reconciliation against the runtime.

mod common;

use common::{test_config, Harness, NETWORK};
use labpool::config::PortRange;
use labpool::state::EXTERNAL_OWNER;
use labpool::{ContainerRecord, Error, InMemoryRuntime, LabManager, LabStore, Owner, PortType};
use std::sync::Arc;

/// A second manager over the same store and runtime, as after a restart.
fn restarted(h: &Harness) -> LabManager {
    LabManager::new(test_config(), h.manager.store().clone(), h.runtime.clone())
}

#[tokio::test]
async fn test_missing_network_is_fatal() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let h = Harness::unprepared(test_config(), runtime).await;

    let err = h.manager.initialize().await.unwrap_err();

    assert!(matches!(err, Error::RuntimePreconditionMissing(_)));
    assert!(err.suggestion().is_some());
    assert_eq!(h.runtime.container_count(), 0);
}

#[tokio::test]
async fn test_network_removed_after_start_fails_next_reconcile() {
    let h = Harness::new().await;
    h.runtime.remove_network(NETWORK);

    assert!(matches!(
        h.manager.reconcile().await,
        Err(Error::RuntimePreconditionMissing(_))
    ));
}

#[tokio::test]
async fn test_externally_bound_port_is_skipped_by_allocation() {
    let runtime = Arc::new(InMemoryRuntime::with_network(NETWORK));
    runtime.add_external("someone-elses-vnc", vec![20010, 8080], true);
    let h = Harness::unprepared(test_config(), runtime).await;

    let report = h.manager.prepare().await.unwrap();

    assert_eq!(report.bound_ports, 1);
    assert_eq!(h.port_owner(20010).await.as_deref(), Some(EXTERNAL_OWNER));
    let info = h.manager.assign("alice", "s").await.unwrap();
    assert_eq!(info.display_port, 20000);
    assert_eq!(info.proxy_port, 20011);
}

#[tokio::test]
async fn test_stopped_external_container_does_not_hold_ports() {
    let runtime = Arc::new(InMemoryRuntime::with_network(NETWORK));
    runtime.add_external("exited", vec![20000], false);
    let h = Harness::unprepared(test_config(), runtime).await;

    let report = h.manager.prepare().await.unwrap();

    assert_eq!(report.bound_ports, 0);
    assert!(h.taken_ports().await.is_empty());
}

#[tokio::test]
async fn test_drifted_allocations_are_reset() {
    let runtime = Arc::new(InMemoryRuntime::with_network(NETWORK));
    let h = Harness::unprepared(test_config(), runtime).await;
    h.manager.attach().await.unwrap();

    // Reserved by a process that crashed before starting anything.
    h.manager.ledger().allocate(PortType::Display).await.unwrap();
    h.manager.ledger().allocate(PortType::Proxy).await.unwrap();
    assert_eq!(h.taken_ports().await.len(), 2);

    h.manager.prepare().await.unwrap();
    assert!(h.taken_ports().await.is_empty());
}

#[tokio::test]
async fn test_stale_running_record_is_cleaned_up() {
    let runtime = Arc::new(InMemoryRuntime::with_network(NETWORK));
    let h = Harness::unprepared(test_config(), runtime).await;
    h.manager.attach().await.unwrap();
    h.manager
        .store()
        .upsert_running(ContainerRecord::running(
            Owner::user("alice"),
            "0badc0de".repeat(8),
            "lab-user-alice-old".to_string(),
            20000,
            20010,
            None,
        ))
        .await
        .unwrap();

    let report = h.manager.prepare().await.unwrap();

    assert_eq!(report.stale_records, 1);
    assert!(h
        .manager
        .store()
        .find_running(&Owner::user("alice"))
        .await
        .unwrap()
        .is_none());
    assert!(h.taken_ports().await.is_empty());
}

#[tokio::test]
async fn test_live_user_container_survives_restart() {
    let h = Harness::new().await;
    let alice = h.manager.assign("alice", "s").await.unwrap();

    let manager = restarted(&h);
    let report = manager.prepare().await.unwrap();

    assert_eq!(report.stale_records, 0);
    assert_eq!(report.bound_ports, 2);
    assert_eq!(report.adopted_records, 1);
    assert_eq!(h.port_owner(alice.display_port).await.as_deref(), Some("user:alice"));
    assert_eq!(h.port_owner(alice.proxy_port).await.as_deref(), Some("user:alice"));

    let again = manager.assign("alice", "s").await.unwrap();
    assert!(again.reused());
    assert_eq!(again.runtime_id, alice.runtime_id);

    // The adopted ports are released normally on stop.
    manager.stop("alice").await.unwrap();
    assert!(h.taken_ports().await.is_empty());
}

#[tokio::test]
async fn test_leftover_pool_containers_are_removed_on_restart() {
    let h = Harness::new().await;
    assert_eq!(h.manager.initialize_pool(3).await, 3);
    let slots = h.manager.store().pool_records().await.unwrap();
    h.runtime.crash(&slots[0].runtime_id);
    let bob = h.manager.assign("bob", "s").await.unwrap();
    assert!(bob.from_pool());
    assert_ne!(bob.runtime_id, slots[0].runtime_id);

    let manager = restarted(&h);
    let report = manager.prepare().await.unwrap();

    // One exited slot and one idle running slot; bob's container keeps its
    // pool name but is no longer a pool container.
    assert_eq!(report.stale_records, 0);
    assert_eq!(report.leftover_pool_removed, 2);
    assert!(manager.store().pool_records().await.unwrap().is_empty());
    assert!(!h.runtime.exists(&slots[0].runtime_id));
    assert!(h.runtime.is_running(&bob.runtime_id));
    assert_eq!(h.runtime.container_count(), 1);
    assert_eq!(
        h.taken_ports().await,
        [bob.display_port, bob.proxy_port].into_iter().collect()
    );

    let again = manager.assign("bob", "s").await.unwrap();
    assert!(again.reused());
}

#[tokio::test]
async fn test_unmanaged_ports_are_ignored() {
    let runtime = Arc::new(InMemoryRuntime::with_network(NETWORK));
    runtime.add_external("web", vec![80, 443, 30000], true);
    let h = Harness::unprepared(test_config(), runtime).await;

    let report = h.manager.prepare().await.unwrap();

    assert_eq!(report.bound_ports, 0);
    assert_eq!(h.free(PortType::Display).await, 5);
    assert_eq!(h.free(PortType::Proxy).await, 5);
    assert_eq!(h.runtime.container_count(), 1);
}

#[tokio::test]
async fn test_restart_with_new_port_ranges_only_hands_out_new_ports() {
    let h = Harness::new().await;
    let alice = h.manager.assign("alice", "s").await.unwrap();
    h.runtime.add_external("squatter", vec![21000], true);

    let mut config = test_config();
    config.ports.display = PortRange::new(21000, 21004);
    config.ports.proxy = PortRange::new(21010, 21014);
    let manager = LabManager::new(config, h.manager.store().clone(), h.runtime.clone());
    let report = manager.prepare().await.unwrap();

    assert_eq!(report.bound_ports, 1);
    let ports = manager.ledger().snapshot().await.unwrap();
    assert_eq!(ports.len(), 10);
    assert!(ports.iter().all(|p| p.port >= 21000));

    let bob = manager.assign("bob", "s").await.unwrap();
    assert_eq!((bob.display_port, bob.proxy_port), (21001, 21010));

    // Alice keeps her container; stopping it touches no ledger row.
    assert!(h.runtime.is_running(&alice.runtime_id));
    manager.stop("alice").await.unwrap();
    assert_eq!(
        h.taken_ports().await,
        [21000, bob.display_port, bob.proxy_port].into_iter().collect()
    );
}

#[tokio::test]
async fn test_explicit_reconcile_refuses_a_shared_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lab.db");
    let serving = Harness::on_store(test_config(), LabStore::open(&path).await.unwrap()).await;
    serving.manager.initialize_pool(1).await;

    let operator = LabManager::new(
        test_config(),
        LabStore::open(&path).await.unwrap(),
        serving.runtime.clone(),
    );
    operator.attach().await.unwrap();

    let err = operator.reconcile_exclusive().await.unwrap_err();
    assert!(matches!(err, Error::StoreInUse(_)));
    assert!(err.suggestion().is_some());
    assert_eq!(serving.runtime.running_count(), 1);
    assert_eq!(serving.taken_ports().await.len(), 2);
}

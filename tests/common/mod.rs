//! Shared fixtures: a manager wired to the in-memory runtime and an
//! in-memory store with small port ranges.

#![allow(dead_code)]

use labpool::config::{ManagerConfig, PortRange};
use labpool::{InMemoryRuntime, LabManager, LabStore, PortType};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

pub const NETWORK: &str = "hack-lab-network";

pub fn test_config() -> ManagerConfig {
    let mut config = ManagerConfig::default();
    config.max_containers = 5;
    config.pool.size = 0;
    config.pool.spawn_delay = Duration::ZERO;
    config.ports.display = PortRange::new(20000, 20004);
    config.ports.proxy = PortRange::new(20010, 20014);
    config.timeouts.stop_grace = Duration::from_millis(10);
    config
}

pub struct Harness {
    pub manager: LabManager,
    pub runtime: Arc<InMemoryRuntime>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    /// Manager over a fresh store, prepared (schema, seed, reconcile) but
    /// with no pool fill.
    pub async fn with_config(config: ManagerConfig) -> Self {
        let runtime = Arc::new(InMemoryRuntime::with_network(NETWORK));
        let harness = Self::unprepared(config, runtime).await;
        harness.manager.prepare().await.expect("prepare");
        harness
    }

    /// Prepared manager over a store the test opened itself.
    pub async fn on_store(config: ManagerConfig, store: LabStore) -> Self {
        let runtime = Arc::new(InMemoryRuntime::with_network(NETWORK));
        let manager = LabManager::new(config, store, runtime.clone());
        manager.prepare().await.expect("prepare");
        Self { manager, runtime }
    }

    pub async fn unprepared(config: ManagerConfig, runtime: Arc<InMemoryRuntime>) -> Self {
        let store = LabStore::open_in_memory().await.expect("open store");
        let manager = LabManager::new(config, store, runtime.clone());
        Self { manager, runtime }
    }

    pub async fn taken_ports(&self) -> HashSet<u16> {
        self.manager
            .ledger()
            .snapshot()
            .await
            .expect("snapshot")
            .into_iter()
            .filter(|p| !p.is_available)
            .map(|p| p.port)
            .collect()
    }

    pub async fn port_owner(&self, port: u16) -> Option<String> {
        self.manager
            .store()
            .get_port(port)
            .await
            .expect("get port")
            .and_then(|p| p.allocated_to)
    }

    pub async fn free(&self, port_type: PortType) -> u32 {
        self.manager
            .ledger()
            .available(port_type)
            .await
            .expect("available")
    }
}

//! In-process container runtime.
//!
//! Keeps containers in a map instead of talking to a daemon. Useful for
//! exercising the manager without Docker; failure injection knobs let tests
//! drive the compensation and self-healing paths.

use super::{
    ContainerFilter, ContainerHandle, ContainerRuntime, ContainerSpec, ContainerState,
    ContainerSummary, RuntimeError,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    running: bool,
    host_ports: Vec<u16>,
}

#[derive(Debug, Default)]
pub struct InMemoryRuntime {
    networks: Mutex<HashSet<String>>,
    containers: Mutex<BTreeMap<String, Entry>>,
    next_id: AtomicU64,
    fail_create: AtomicBool,
    fail_start: AtomicBool,
    fail_stop: AtomicBool,
    create_delay: Mutex<Option<Duration>>,
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runtime with one pre-existing network.
    pub fn with_network(name: &str) -> Self {
        let runtime = Self::new();
        runtime.networks.lock().insert(name.to_string());
        runtime
    }

    pub fn remove_network(&self, name: &str) {
        self.networks.lock().remove(name);
    }

    /// Make every following `create` fail.
    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Make every following `start` fail (the created container stays behind).
    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_stop(&self, fail: bool) {
        self.fail_stop.store(fail, Ordering::SeqCst);
    }

    /// Delay every following `create`, to exercise caller timeouts.
    pub fn set_create_delay(&self, delay: Option<Duration>) {
        *self.create_delay.lock() = delay;
    }

    /// Register a container that the manager did not create.
    pub fn add_external(&self, name: &str, host_ports: Vec<u16>, running: bool) -> String {
        let id = self.allocate_id();
        self.containers.lock().insert(
            id.clone(),
            Entry {
                name: name.to_string(),
                running,
                host_ports,
            },
        );
        id
    }

    /// Simulate a container dying behind the manager's back.
    pub fn crash(&self, id: &str) {
        if let Some(entry) = self.containers.lock().get_mut(id) {
            entry.running = false;
        }
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.containers
            .lock()
            .get(id)
            .map(|e| e.running)
            .unwrap_or(false)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.containers.lock().contains_key(id)
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.containers.lock().values().any(|e| e.name == name)
    }

    pub fn container_count(&self) -> usize {
        self.containers.lock().len()
    }

    pub fn running_count(&self) -> usize {
        self.containers.lock().values().filter(|e| e.running).count()
    }

    fn allocate_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{:064x}", n)
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    async fn network_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        Ok(self.networks.lock().contains(name))
    }

    async fn list_containers(
        &self,
        filter: &ContainerFilter,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let containers = self.containers.lock();
        Ok(containers
            .iter()
            .map(|(id, entry)| ContainerSummary {
                id: id.clone(),
                names: vec![entry.name.clone()],
                running: entry.running,
                host_ports: if entry.running {
                    entry.host_ports.clone()
                } else {
                    Vec::new()
                },
            })
            .filter(|s| filter.matches(s))
            .collect())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        let delay = *self.create_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(RuntimeError::cmd_failed(
                format!("create {}", spec.name),
                "injected create failure",
                Some(125),
            ));
        }
        if !self.networks.lock().contains(&spec.network) {
            return Err(RuntimeError::cmd_failed(
                format!("create {}", spec.name),
                format!("network {} not found", spec.network),
                Some(125),
            ));
        }
        let mut containers = self.containers.lock();
        if containers.values().any(|e| e.name == spec.name) {
            return Err(RuntimeError::cmd_failed(
                format!("create {}", spec.name),
                format!("Conflict. The container name \"/{}\" is already in use", spec.name),
                Some(125),
            ));
        }

        let id = self.allocate_id();
        containers.insert(
            id.clone(),
            Entry {
                name: spec.name.clone(),
                running: false,
                host_ports: spec.host_ports(),
            },
        );
        Ok(ContainerHandle::new(id))
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(RuntimeError::cmd_failed(
                format!("start {}", handle),
                "injected start failure",
                Some(1),
            ));
        }
        let mut containers = self.containers.lock();
        let entry = containers
            .get_mut(handle.id())
            .ok_or_else(|| RuntimeError::not_found(handle.id()))?;
        entry.running = true;
        Ok(())
    }

    async fn stop(&self, handle: &ContainerHandle, _grace: Duration) -> Result<(), RuntimeError> {
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(RuntimeError::cmd_failed(
                format!("stop {}", handle),
                "injected stop failure",
                Some(1),
            ));
        }
        let mut containers = self.containers.lock();
        let entry = containers
            .get_mut(handle.id())
            .ok_or_else(|| RuntimeError::not_found(handle.id()))?;
        entry.running = false;
        Ok(())
    }

    async fn remove(&self, handle: &ContainerHandle, force: bool) -> Result<(), RuntimeError> {
        let mut containers = self.containers.lock();
        match containers.get(handle.id()) {
            None => Err(RuntimeError::not_found(handle.id())),
            Some(entry) if entry.running && !force => Err(RuntimeError::cmd_failed(
                format!("rm {}", handle),
                "You cannot remove a running container. Stop the container before attempting removal or force remove",
                Some(1),
            )),
            Some(_) => {
                containers.remove(handle.id());
                Ok(())
            }
        }
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerState, RuntimeError> {
        self.containers
            .lock()
            .get(handle.id())
            .map(|e| ContainerState { running: e.running })
            .ok_or_else(|| RuntimeError::not_found(handle.id()))
    }
}

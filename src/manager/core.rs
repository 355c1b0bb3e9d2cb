use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::ledger::PortLedger;
use crate::runtime::{ContainerRuntime, ContainerSpec, PortBinding, RuntimeError};
use crate::state::{LabStore, Owner};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::reconcile::{ReconcileReport, Reconciler};

/// Grace period given to pool containers when they are torn down.
pub(super) const POOL_STOP_GRACE: Duration = Duration::from_secs(5);

/// Occupancy snapshot for dashboards and the `stats` command.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CapacityStats {
    /// RUNNING containers, pool slots included.
    pub active: u32,
    /// Of which are unassigned pool slots.
    pub pool: u32,
    pub max: u32,
    pub utilization_percent: f64,
}

impl CapacityStats {
    pub fn assigned(&self) -> u32 {
        self.active.saturating_sub(self.pool)
    }
}

/// What `initialize` did before the manager started accepting requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StartupReport {
    pub reconcile: ReconcileReport,
    pub pool_created: u32,
}

/// Serializes capacity checks and counts creations that have passed the
/// check but are not yet persisted.
#[derive(Debug, Default)]
pub(super) struct CapacityGate {
    check: tokio::sync::Mutex<()>,
    in_flight: AtomicU32,
}

/// One reserved unit of capacity; released on drop.
pub(super) struct CapacityReservation(Arc<CapacityGate>);

impl Drop for CapacityReservation {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Owns the ledger, the container records and the pool for one sandbox host.
///
/// The manager is the only writer of port and container state. Request
/// handlers share it by cloning: every field is a handle onto shared state,
/// so a clone observes and mutates the same ledger, records and pool.
///
/// # Lifecycle
///
/// 1. [`LabManager::initialize`]: schema, port seeding, reconciliation, pool fill
/// 2. [`LabManager::spawn_reaper`]: periodic idle sweep
/// 3. request traffic: `assign`, `heartbeat`, `lookup`, `stop`
/// 4. [`LabManager::shutdown`]: stop the reaper, purge the pool
///
/// # Example
///
/// ```no_run
/// use labpool::config::ManagerConfig;
/// use labpool::runtime::DockerRuntime;
/// use labpool::state::LabStore;
/// use labpool::LabManager;
/// use std::sync::Arc;
///
/// # async fn example() -> labpool::Result<()> {
/// let config = ManagerConfig::default();
/// let store = LabStore::open(config.database.resolved_path()).await?;
/// let manager = LabManager::new(config, store, Arc::new(DockerRuntime::new()));
/// manager.initialize().await?;
///
/// let info = manager.assign("alice", "web-101").await?;
/// println!("connect to {}", info.proxy_url);
///
/// manager.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LabManager {
    pub(super) config: Arc<ManagerConfig>,
    pub(super) store: LabStore,
    pub(super) ledger: PortLedger,
    pub(super) runtime: Arc<dyn ContainerRuntime>,
    /// Set while a refill is in flight; a second refill request is skipped.
    pub(super) refill_running: Arc<AtomicBool>,
    capacity: Arc<CapacityGate>,
    slot_seq: Arc<AtomicU64>,
    pub(super) cancellation_token: CancellationToken,
    pub(super) reaper_task: Arc<parking_lot::Mutex<Option<JoinHandle<()>>>>,
    shutdown_started: Arc<AtomicBool>,
}

impl std::fmt::Debug for LabManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LabManager")
            .field("store", &self.store)
            .field("max_containers", &self.config.max_containers)
            .finish_non_exhaustive()
    }
}

impl LabManager {
    pub fn new(config: ManagerConfig, store: LabStore, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let ledger = PortLedger::new(store.clone(), config.ports);
        Self {
            config: Arc::new(config),
            store,
            ledger,
            runtime,
            refill_running: Arc::new(AtomicBool::new(false)),
            capacity: Arc::new(CapacityGate::default()),
            slot_seq: Arc::new(AtomicU64::new(0)),
            cancellation_token: CancellationToken::new(),
            reaper_task: Arc::new(parking_lot::Mutex::new(None)),
            shutdown_started: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn store(&self) -> &LabStore {
        &self.store
    }

    pub fn ledger(&self) -> &PortLedger {
        &self.ledger
    }

    /// Prepare storage and repair drift without creating any containers.
    ///
    /// Fails with [`Error::RuntimePreconditionMissing`] when the sandbox
    /// network is absent; the manager must not take traffic in that case.
    pub async fn prepare(&self) -> Result<ReconcileReport> {
        self.attach().await?;
        self.reconcile().await
    }

    /// Create the schema and seed the port ranges. Safe to repeat; used by
    /// one-shot operator commands against a store a running server owns.
    pub async fn attach(&self) -> Result<()> {
        self.store.initialize().await?;
        self.ledger.seed().await
    }

    /// Run one reconciliation pass against the runtime.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        Reconciler::new(self).run().await
    }

    /// [`reconcile`](Self::reconcile), refused while another process shares
    /// the store. A pass would reset that process's in-flight allocations
    /// and remove its pool.
    pub async fn reconcile_exclusive(&self) -> Result<ReconcileReport> {
        if !self.store.is_exclusive() {
            return Err(Error::StoreInUse(format!(
                "another labpool process holds {}",
                self.store.db_path().display()
            )));
        }
        self.reconcile().await
    }

    /// [`prepare`](Self::prepare), then fill the pool to its configured size.
    pub async fn initialize(&self) -> Result<StartupReport> {
        let reconcile = self.prepare().await?;
        let pool_created = self.initialize_pool(self.config.pool.size).await;
        info!(
            "Lab manager ready: {} pool container(s), capacity {}",
            pool_created, self.config.max_containers
        );
        Ok(StartupReport {
            reconcile,
            pool_created,
        })
    }

    pub async fn stats(&self) -> Result<CapacityStats> {
        let active = self.store.count_running().await?;
        let pool = self.store.count_running_pool().await?;
        let max = self.config.max_containers;
        let utilization_percent = if max == 0 {
            0.0
        } else {
            (active as f64 / max as f64 * 1000.0).round() / 10.0
        };
        Ok(CapacityStats {
            active,
            pool,
            max,
            utilization_percent,
        })
    }

    /// Stop background work and, if configured, tear down the pool.
    ///
    /// Runs at most once; later calls return immediately.
    pub async fn shutdown(&self) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancellation_token.cancel();

        let reaper = self.reaper_task.lock().take();
        if let Some(handle) = reaper {
            if let Err(e) = handle.await {
                warn!("Idle reaper task ended abnormally: {}", e);
            }
        }

        if self.config.purge_pool_on_shutdown {
            match self.purge_pool().await {
                Ok(purged) => info!("Purged {} pool container(s) on shutdown", purged),
                Err(e) => warn!("Failed to purge pool on shutdown: {}", e),
            }
        }
    }

    /// Claim room for one new container under `max_containers`.
    ///
    /// Creations already past this check count against the cap until their
    /// reservation is dropped, so concurrent callers cannot overshoot it.
    pub(super) async fn reserve_capacity(&self) -> Result<CapacityReservation> {
        let _check = self.capacity.check.lock().await;
        // Read in-flight first: a creation finishing in between is then
        // counted twice, never zero times.
        let in_flight = self.capacity.in_flight.load(Ordering::SeqCst);
        let active = self.store.count_running().await? + in_flight;
        let max = self.config.max_containers;
        if active >= max {
            return Err(Error::CapacityExceeded { active, max });
        }
        self.capacity.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(CapacityReservation(self.capacity.clone()))
    }

    /// Run a runtime call under a time limit.
    pub(super) async fn bounded<T, F>(
        &self,
        command: String,
        limit: Duration,
        call: F,
    ) -> std::result::Result<T, RuntimeError>
    where
        F: Future<Output = std::result::Result<T, RuntimeError>>,
    {
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::timeout(command, limit)),
        }
    }

    /// Fresh pool placeholder owner.
    pub(super) fn next_pool_slot(&self) -> Owner {
        Owner::pool(self.unique_suffix())
    }

    fn unique_suffix(&self) -> String {
        let seq = self.slot_seq.fetch_add(1, Ordering::SeqCst);
        format!("{}-{}", chrono::Utc::now().timestamp_millis(), seq)
    }

    /// Name prefix shared by every pool container of this deployment.
    pub(super) fn pool_name_prefix(&self) -> String {
        format!("{}-pool-", self.config.sandbox.name_prefix)
    }

    pub(super) fn container_name(&self, owner: &Owner) -> String {
        match owner {
            Owner::Pool(slot) => format!("{}{}", self.pool_name_prefix(), slot),
            Owner::User(id) => format!(
                "{}-user-{}-{}",
                self.config.sandbox.name_prefix,
                sanitize_name_component(id),
                self.unique_suffix()
            ),
        }
    }

    pub(super) fn container_spec(
        &self,
        owner: &Owner,
        scenario_id: Option<&str>,
        name: &str,
        display_port: u16,
        proxy_port: u16,
    ) -> ContainerSpec {
        let sandbox = &self.config.sandbox;
        let scenario = scenario_id.unwrap_or("pool");
        ContainerSpec {
            image: sandbox.image.clone(),
            name: name.to_string(),
            hostname: name.to_string(),
            env: vec![
                ("USER_ID".to_string(), owner.id().to_string()),
                ("SCENARIO_ID".to_string(), scenario.to_string()),
                ("DISPLAY".to_string(), ":1".to_string()),
                ("VNC_PASSWORD".to_string(), sandbox.display_password.clone()),
            ],
            labels: vec![
                ("labpool.managed".to_string(), "true".to_string()),
                ("labpool.owner".to_string(), owner.to_string()),
                ("labpool.scenario".to_string(), scenario.to_string()),
            ],
            port_bindings: vec![
                PortBinding {
                    host_ip: sandbox.bind_address.clone(),
                    host_port: display_port,
                    container_port: sandbox.display_internal_port,
                },
                PortBinding {
                    host_ip: sandbox.bind_address.clone(),
                    host_port: proxy_port,
                    container_port: sandbox.proxy_internal_port,
                },
            ],
            network: sandbox.network.clone(),
            memory_bytes: sandbox.memory_bytes,
            cpu_quota: sandbox.cpu_quota,
            cpu_period: sandbox.cpu_period,
            cap_add: sandbox.cap_add.clone(),
            no_new_privileges: sandbox.no_new_privileges,
        }
    }

    pub(super) fn validate_owner_id(owner_id: &str) -> Result<()> {
        if owner_id.trim().is_empty() {
            return Err(Error::Validation("owner id cannot be empty".to_string()));
        }
        Ok(())
    }
}

/// Make a user-supplied string safe to embed in a container name.
///
/// Docker container names must match `[a-zA-Z0-9][a-zA-Z0-9_.-]*`. Invalid
/// characters become `_`, the result is capped at 32 characters, and a
/// leading non-alphanumeric character is replaced with `x`.
pub(crate) fn sanitize_name_component(input: &str) -> String {
    const MAX_COMPONENT_LEN: usize = 32;

    if input.is_empty() {
        return "unnamed".to_string();
    }

    // Every char is ASCII after this map, so byte slicing below is safe.
    let sanitized: String = input
        .chars()
        .take(MAX_COMPONENT_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.starts_with(|c: char| !c.is_ascii_alphanumeric()) {
        format!("x{}", &sanitized[1..])
    } else {
        sanitized
    }
}

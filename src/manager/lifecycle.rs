//! Assigning, looking up, stopping and cleaning up user containers.

use super::LabManager;
use crate::error::Result;
use crate::runtime::{ContainerFilter, ContainerHandle, RuntimeError};
use crate::state::{ContainerRecord, Owner, PortType, UpsertOutcome};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How an `assign` call obtained its container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// The owner already had a live container.
    Reused,
    /// A warm pool container was handed over.
    FromPool,
    /// A new container was created for this request.
    Fresh,
}

/// Everything a caller needs to connect a user to their sandbox.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerInfo {
    pub owner: Owner,
    pub runtime_id: String,
    pub name: String,
    pub display_port: u16,
    pub proxy_port: u16,
    pub scenario_id: Option<String>,
    pub provenance: Provenance,
    pub display_url: String,
    pub proxy_url: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl ContainerInfo {
    pub fn reused(&self) -> bool {
        self.provenance == Provenance::Reused
    }

    pub fn from_pool(&self) -> bool {
        self.provenance == Provenance::FromPool
    }
}

/// Result of [`LabManager::stop`]. Having nothing to stop is not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped { runtime_id: String },
    NotFound,
}

impl LabManager {
    /// Give `owner_id` a running sandbox for `scenario_id`.
    ///
    /// Tries, in order: the owner's existing container, a pool handoff, a
    /// fresh container. Fails with
    /// [`CapacityExceeded`](crate::Error::CapacityExceeded) when a fresh
    /// container is needed and the cap is reached.
    #[tracing::instrument(skip(self), fields(owner = %owner_id))]
    pub async fn assign(&self, owner_id: &str, scenario_id: &str) -> Result<ContainerInfo> {
        Self::validate_owner_id(owner_id)?;
        let owner = Owner::user(owner_id);

        if let Some(mut record) = self.lookup_owner(&owner).await? {
            self.store.touch_activity(&owner).await?;
            record.last_activity_at = Utc::now();
            debug!("Reusing container {}", record.name);
            return Ok(self.container_info(record, Provenance::Reused));
        }

        if let Some(record) = self
            .requisition(&owner, Some(scenario_id.to_string()))
            .await?
        {
            return Ok(self.container_info(record, Provenance::FromPool));
        }

        let _reservation = match self.reserve_capacity().await {
            Ok(reservation) => reservation,
            Err(e) => {
                warn!("Refusing new container: {}", e);
                return Err(e);
            }
        };
        let record = self
            .create_container(owner, Some(scenario_id.to_string()))
            .await?;
        Ok(self.container_info(record, Provenance::Fresh))
    }

    /// Allocate ports, create and start a container, persist its record.
    ///
    /// Any failure after the ports are taken releases them again and
    /// force-removes a container left behind under the intended name before
    /// the error is returned.
    #[tracing::instrument(skip(self, owner, scenario_id), fields(owner = %owner))]
    pub(super) async fn create_container(
        &self,
        owner: Owner,
        scenario_id: Option<String>,
    ) -> Result<ContainerRecord> {
        let display_port = self.ledger.allocate(PortType::Display).await?;
        let proxy_port = match self.ledger.allocate(PortType::Proxy).await {
            Ok(port) => port,
            Err(e) => {
                self.release_quietly(&[display_port]).await;
                return Err(e);
            }
        };

        let name = self.container_name(&owner);
        match self
            .launch(&owner, scenario_id, &name, display_port, proxy_port)
            .await
        {
            Ok(record) => {
                info!(
                    "Started {} ({}) on ports {}/{}",
                    record.name,
                    short_id(&record.runtime_id),
                    display_port,
                    proxy_port
                );
                Ok(record)
            }
            Err(e) => {
                error!("Failed to start container {}: {}", name, e);
                self.compensate(&name, &[display_port, proxy_port]).await;
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        owner: &Owner,
        scenario_id: Option<String>,
        name: &str,
        display_port: u16,
        proxy_port: u16,
    ) -> Result<ContainerRecord> {
        let timeouts = &self.config.timeouts;
        let spec = self.container_spec(
            owner,
            scenario_id.as_deref(),
            name,
            display_port,
            proxy_port,
        );

        let handle = self
            .bounded(
                format!("create {}", name),
                timeouts.create,
                self.runtime.create(&spec),
            )
            .await?;
        self.bounded(
            format!("start {}", name),
            timeouts.start,
            self.runtime.start(&handle),
        )
        .await?;

        let record = ContainerRecord::running(
            owner.clone(),
            handle.id().to_string(),
            name.to_string(),
            display_port,
            proxy_port,
            scenario_id,
        );
        if let UpsertOutcome::Overwrote { previous } = self.store.upsert_running(record.clone()).await? {
            warn!(
                "Container {} replaced {} as the running container of {}; ports {}/{} remain allocated",
                record.name, previous.name, owner, previous.display_port, previous.proxy_port
            );
        }
        Ok(record)
    }

    /// Undo a half-finished creation: free the ports and remove any
    /// container that made it into the runtime under `name`.
    async fn compensate(&self, name: &str, ports: &[u16]) {
        self.release_quietly(ports).await;

        let listed = self
            .bounded(
                "ps".to_string(),
                self.config.timeouts.list,
                self.runtime.list_containers(&ContainerFilter::named(name)),
            )
            .await;
        let orphans = match listed {
            Ok(containers) => containers,
            Err(e) => {
                warn!("Could not search for orphaned container {}: {}", name, e);
                return;
            }
        };

        for orphan in orphans.into_iter().filter(|c| c.has_name(name)) {
            let removed = self
                .bounded(
                    format!("rm -f {}", name),
                    self.config.timeouts.stop,
                    self.runtime.remove(&orphan.handle(), true),
                )
                .await;
            match removed {
                Ok(()) => info!("Removed orphaned container {}", name),
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("Failed to remove orphaned container {}: {}", name, e),
            }
        }
    }

    async fn release_quietly(&self, ports: &[u16]) {
        if let Err(e) = self.ledger.release_all(ports).await {
            error!("Failed to release ports {:?}: {}", ports, e);
        }
    }

    /// The owner's RUNNING record, verified live against the runtime.
    pub async fn lookup(&self, owner_id: &str) -> Result<Option<ContainerRecord>> {
        self.lookup_owner(&Owner::user(owner_id)).await
    }

    /// Read the RUNNING record for `owner` and confirm the runtime agrees.
    ///
    /// A container the runtime no longer knows about, or reports stopped,
    /// is cleaned up and reported as absent.
    pub(super) async fn lookup_owner(&self, owner: &Owner) -> Result<Option<ContainerRecord>> {
        let Some(record) = self.store.find_running(owner).await? else {
            return Ok(None);
        };

        if self.is_alive(&record.runtime_id).await? {
            return Ok(Some(record));
        }

        info!(
            "Container {} of {} is gone; cleaning up its record",
            record.name, owner
        );
        self.cleanup(&record.runtime_id).await?;
        Ok(None)
    }

    /// Whether the runtime reports `runtime_id` running. A missing container
    /// counts as not running.
    pub(super) async fn is_alive(&self, runtime_id: &str) -> Result<bool> {
        let handle = ContainerHandle::new(runtime_id);
        let inspected = self
            .bounded(
                format!("inspect {}", short_id(runtime_id)),
                self.config.timeouts.inspect,
                self.runtime.inspect(&handle),
            )
            .await;
        match inspected {
            Ok(state) => Ok(state.running),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Stop and remove the owner's container and release its ports.
    pub async fn stop(&self, owner_id: &str) -> Result<StopOutcome> {
        let owner = Owner::user(owner_id);
        let Some(record) = self.lookup_owner(&owner).await? else {
            debug!("No running container for {}", owner);
            return Ok(StopOutcome::NotFound);
        };

        self.terminate(&record.runtime_id, self.config.timeouts.stop_grace)
            .await?;
        info!("Stopped container {} of {}", record.name, owner);
        Ok(StopOutcome::Stopped {
            runtime_id: record.runtime_id,
        })
    }

    /// Stop, remove, then [`cleanup`](Self::cleanup) a container.
    ///
    /// A container that is already gone is not an error. Any other runtime
    /// failure is returned and the record is left untouched.
    pub(super) async fn terminate(&self, runtime_id: &str, grace: Duration) -> Result<()> {
        let handle = ContainerHandle::new(runtime_id);
        let timeouts = &self.config.timeouts;

        let stopped = self
            .bounded(
                format!("stop {}", short_id(runtime_id)),
                timeouts.stop + grace,
                self.runtime.stop(&handle, grace),
            )
            .await;
        ignore_not_found(stopped)?;

        let removed = self
            .bounded(
                format!("rm {}", short_id(runtime_id)),
                timeouts.stop,
                self.runtime.remove(&handle, true),
            )
            .await;
        ignore_not_found(removed)?;

        self.cleanup(runtime_id).await?;
        Ok(())
    }

    /// Mark the container's record STOPPED and release both of its ports.
    ///
    /// Every termination path ends here. Returns false when no RUNNING
    /// record matched, which makes repeated calls harmless.
    pub async fn cleanup(&self, runtime_id: &str) -> Result<bool> {
        let stopped = self.store.mark_stopped(runtime_id).await?;
        for record in &stopped {
            debug!(
                "Record for {} stopped, released ports {}/{}",
                record.owner, record.display_port, record.proxy_port
            );
        }
        Ok(!stopped.is_empty())
    }

    /// Refresh the owner's activity timestamp. Returns false when the owner
    /// has no running container.
    pub async fn heartbeat(&self, owner_id: &str) -> Result<bool> {
        self.store.touch_activity(&Owner::user(owner_id)).await
    }

    pub(super) fn container_info(
        &self,
        record: ContainerRecord,
        provenance: Provenance,
    ) -> ContainerInfo {
        let sandbox = &self.config.sandbox;
        ContainerInfo {
            display_url: format!("http://{}:{}", sandbox.public_host, record.display_port),
            proxy_url: format!(
                "http://{}:{}/vnc.html?password={}",
                sandbox.public_host, record.proxy_port, sandbox.display_password
            ),
            owner: record.owner,
            runtime_id: record.runtime_id,
            name: record.name,
            display_port: record.display_port,
            proxy_port: record.proxy_port,
            scenario_id: record.scenario_id,
            provenance,
            created_at: record.created_at,
            last_activity_at: record.last_activity_at,
        }
    }
}

fn ignore_not_found(result: std::result::Result<(), RuntimeError>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// First 12 characters of a runtime id, as `docker ps` shows them.
pub(crate) fn short_id(runtime_id: &str) -> &str {
    runtime_id.get(..12).unwrap_or(runtime_id)
}

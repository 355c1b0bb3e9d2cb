//! Startup reconciliation of the ledger and records against the runtime.

use super::core::POOL_STOP_GRACE;
use super::lifecycle::short_id;
use super::LabManager;
use crate::error::{Error, Result};
use crate::runtime::{ContainerFilter, ContainerSummary};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// What a reconciliation pass repaired.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// RUNNING records whose container was no longer running.
    pub stale_records: u32,
    /// Managed ports found bound by live containers.
    pub bound_ports: u32,
    /// Live records whose ports were re-stamped with their owner.
    pub adopted_records: u32,
    /// Leftover pool containers stopped and removed.
    pub leftover_pool_removed: u32,
}

/// Short-lived helper that runs one reconciliation pass.
///
/// Must run before the manager accepts allocation traffic.
pub(super) struct Reconciler<'a> {
    manager: &'a LabManager,
}

impl<'a> Reconciler<'a> {
    pub fn new(manager: &'a LabManager) -> Self {
        Self { manager }
    }

    /// 1. require the sandbox network
    /// 2. list every container the runtime knows
    /// 3. clean up RUNNING records whose container is not running
    /// 4. rebuild the managed port range from the bound host ports
    /// 5. re-stamp the ports of records that are still live
    /// 6. stop and remove leftover pool containers that no user owns,
    ///    releasing their ports
    pub async fn run(&self) -> Result<ReconcileReport> {
        let manager = self.manager;
        let config = &manager.config;
        let mut report = ReconcileReport::default();

        let network = &config.sandbox.network;
        let exists = manager
            .bounded(
                format!("network ls {}", network),
                config.timeouts.list,
                manager.runtime.network_exists(network),
            )
            .await?;
        if !exists {
            return Err(Error::RuntimePreconditionMissing(format!(
                "network '{}' does not exist",
                network
            )));
        }
        debug!("Network {} found", network);

        let containers = manager
            .bounded(
                "ps -a".to_string(),
                config.timeouts.list,
                manager.runtime.list_containers(&ContainerFilter::all()),
            )
            .await?;

        let mut live_records = Vec::new();
        for record in manager.store.running_records().await? {
            let running = containers
                .iter()
                .any(|c| c.running && same_container(&c.id, &record.runtime_id));
            if running {
                live_records.push(record);
            } else {
                info!(
                    "Record for {} points at {} which is not running; cleaning up",
                    record.owner,
                    short_id(&record.runtime_id)
                );
                manager.cleanup(&record.runtime_id).await?;
                report.stale_records += 1;
            }
        }

        let bounds = config.ports.bounds();
        let bound: HashSet<u16> = containers
            .iter()
            .filter(|c| c.running)
            .flat_map(|c| c.host_ports.iter().copied())
            .filter(|p| config.ports.is_managed(*p))
            .collect();
        report.bound_ports = manager
            .ledger
            .reconcile(&bound, bounds.start, bounds.end)
            .await? as u32;

        for record in live_records.iter().filter(|r| !r.owner.is_pool()) {
            manager.ledger.adopt(&record.ports(), &record.owner).await?;
            report.adopted_records += 1;
        }

        // A handed-off pool container keeps its pool name but now serves a user.
        let assigned: Vec<&str> = live_records
            .iter()
            .filter(|r| !r.owner.is_pool())
            .map(|r| r.runtime_id.as_str())
            .collect();
        let prefix = manager.pool_name_prefix();
        let leftovers = containers.iter().filter(|c| {
            is_pool_container(c, &prefix) && !assigned.iter().any(|id| same_container(&c.id, id))
        });
        for leftover in leftovers {
            match self.remove_leftover(leftover).await {
                Ok(()) => report.leftover_pool_removed += 1,
                Err(e) => warn!("Error cleaning leftover pool container {}: {}", leftover.id, e),
            }
        }

        info!(
            "Reconciled: {} stale record(s), {} bound port(s), {} leftover pool container(s) removed",
            report.stale_records, report.bound_ports, report.leftover_pool_removed
        );
        Ok(report)
    }

    async fn remove_leftover(&self, leftover: &ContainerSummary) -> Result<()> {
        let manager = self.manager;
        let name = leftover.names.first().map(String::as_str).unwrap_or("?");
        debug!("Removing leftover pool container {}", name);

        if leftover.running {
            manager.terminate(&leftover.id, POOL_STOP_GRACE).await?;
        } else {
            let removed = manager
                .bounded(
                    format!("rm -f {}", short_id(&leftover.id)),
                    manager.config.timeouts.stop,
                    manager.runtime.remove(&leftover.handle(), true),
                )
                .await;
            match removed {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
            manager.cleanup(&leftover.id).await?;
        }

        // Reconcile marked these as externally held.
        let ports: Vec<u16> = leftover
            .host_ports
            .iter()
            .copied()
            .filter(|p| manager.config.ports.is_managed(*p))
            .collect();
        manager.ledger.release_all(&ports).await
    }
}

/// Runtime listings may use short or full ids.
fn same_container(listed: &str, recorded: &str) -> bool {
    !listed.is_empty()
        && !recorded.is_empty()
        && (listed.starts_with(recorded) || recorded.starts_with(listed))
}

fn is_pool_container(summary: &ContainerSummary, prefix: &str) -> bool {
    summary
        .names
        .iter()
        .any(|n| n.trim_start_matches('/').starts_with(prefix))
}

//! Port ledger.
//!
//! Authoritative record of which host ports are free and who holds the rest.
//! Each [`PortType`] draws from its own configured range. Allocation is one
//! atomic update-and-return against the store, so concurrent callers never
//! receive the same port and no in-process lock is held while the caller
//! goes on to talk to the runtime.

use crate::config::{PortRange, PortsConfig};
use crate::error::{Error, Result};
use crate::state::{LabStore, Owner, PortRecord, PortType, EXTERNAL_OWNER, PROVISIONAL_OWNER};
use std::collections::HashSet;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct PortLedger {
    store: LabStore,
    ports: PortsConfig,
}

impl PortLedger {
    pub fn new(store: LabStore, ports: PortsConfig) -> Self {
        Self { store, ports }
    }

    pub fn ranges(&self) -> &PortsConfig {
        &self.ports
    }

    /// Make the ledger rows match the configured ranges exactly.
    ///
    /// Rows left over from earlier ranges are dropped, rows whose port moved
    /// to the other range take its type, and every configured port gets a row.
    pub async fn seed(&self) -> Result<()> {
        let display_range = self.ports.display;
        let proxy = self.ports.proxy;
        let (removed, retyped) = self
            .store
            .retain_port_ranges((display_range.start, display_range.end), (proxy.start, proxy.end))
            .await?;
        if removed > 0 || retyped > 0 {
            info!(
                "Port ranges changed (display {}, proxy {}): dropped {} row(s), re-typed {}",
                display_range, proxy, removed, retyped
            );
        }

        for port_type in [PortType::Display, PortType::Proxy] {
            let range = self.ports.range(port_type);
            let inserted = self
                .store
                .seed_ports(port_type, range.start, range.end)
                .await?;
            if inserted > 0 {
                debug!("Seeded {} {} ports ({})", inserted, port_type, range);
            }
        }
        Ok(())
    }

    /// Take the lowest free port of `port_type`.
    ///
    /// The port is stamped with a provisional owner until the container
    /// record that uses it is persisted.
    pub async fn allocate(&self, port_type: PortType) -> Result<u16> {
        let range = self.ports.range(port_type);
        match self
            .store
            .allocate_port(port_type, range.start, range.end, PROVISIONAL_OWNER.to_string())
            .await?
        {
            Some(port) => {
                debug!("Allocated {} port {}", port_type, port);
                Ok(port)
            }
            None => Err(Error::ResourceExhausted { port_type }),
        }
    }

    /// Return a port to the free list. Releasing a free port is a no-op.
    pub async fn release(&self, port: u16) -> Result<()> {
        self.release_all(&[port]).await
    }

    pub async fn release_all(&self, ports: &[u16]) -> Result<()> {
        let released = self.store.release_ports(ports.to_vec()).await?;
        if released > 0 {
            debug!("Released ports {:?}", ports);
        }
        Ok(())
    }

    /// Rebuild `[low, high]` from what the runtime reports.
    ///
    /// Every port in the range becomes available, then each observed bound
    /// port inside it is marked held by [`EXTERNAL_OWNER`]. Returns how many
    /// ports were marked.
    pub async fn reconcile(&self, bound: &HashSet<u16>, low: u16, high: u16) -> Result<usize> {
        let mut observed: Vec<u16> = bound
            .iter()
            .copied()
            .filter(|p| (low..=high).contains(p))
            .collect();
        observed.sort_unstable();

        let marked = self
            .store
            .reset_port_range(low, high, observed, EXTERNAL_OWNER.to_string())
            .await?;
        info!(
            "Port ledger reconciled for {}: {} port(s) held externally",
            PortRange::new(low, high),
            marked
        );
        Ok(marked)
    }

    /// Record `ports` as held by `owner`, whatever their current state.
    pub async fn adopt(&self, ports: &[u16], owner: &Owner) -> Result<()> {
        self.store
            .adopt_ports(ports.to_vec(), owner.ledger_label())
            .await?;
        Ok(())
    }

    pub async fn snapshot(&self) -> Result<Vec<PortRecord>> {
        self.store.list_ports().await
    }

    pub async fn available(&self, port_type: PortType) -> Result<u32> {
        self.store.count_available_ports(port_type).await
    }
}

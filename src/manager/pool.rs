//! Warm pool of pre-started, unassigned containers.
//!
//! Pool slots are ordinary container records owned by [`Owner::Pool`]. A
//! handoff re-owns the record in one transaction, so two concurrent
//! requisitions can never both claim the same slot.

use super::core::POOL_STOP_GRACE;
use super::LabManager;
use crate::error::Result;
use crate::state::{ContainerRecord, Owner, UpsertOutcome};
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

/// Clears the refill flag when the refill finishes, however it finishes.
struct RefillGuard<'a>(&'a std::sync::atomic::AtomicBool);

impl Drop for RefillGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl LabManager {
    /// Create `target` pool containers one after another, pausing
    /// `pool.spawn_delay` between them. A failed slot is logged and skipped.
    /// Returns how many were created.
    pub async fn initialize_pool(&self, target: u32) -> u32 {
        if target == 0 {
            return 0;
        }
        info!("Initializing container pool ({} containers)", target);

        let mut created = 0;
        for i in 0..target {
            if i > 0 && !self.config.pool.spawn_delay.is_zero() {
                tokio::time::sleep(self.config.pool.spawn_delay).await;
            }
            match self.create_pool_container().await {
                Ok(record) => {
                    created += 1;
                    debug!("Pool container {}/{} ready: {}", i + 1, target, record.name);
                }
                Err(e) => warn!("Failed to create pool container {}/{}: {}", i + 1, target, e),
            }
        }
        info!("Container pool initialized: {}/{} ready", created, target);
        created
    }

    async fn create_pool_container(&self) -> Result<ContainerRecord> {
        let _reservation = self.reserve_capacity().await?;
        self.create_container(self.next_pool_slot(), None).await
    }

    /// Hand a live pool container to `owner`.
    ///
    /// Returns `None` when no slot is available, including when another
    /// caller claimed the chosen slot first. Dead slots found along the way
    /// are cleaned up. A successful handoff schedules a background refill.
    pub async fn requisition(
        &self,
        owner: &Owner,
        scenario_id: Option<String>,
    ) -> Result<Option<ContainerRecord>> {
        let mut healed = false;
        let mut claimed = None;

        for slot in self.store.pool_records().await? {
            match self.is_alive(&slot.runtime_id).await {
                Ok(true) => {}
                Ok(false) => {
                    info!("Pool container {} is gone; cleaning up", slot.name);
                    self.cleanup(&slot.runtime_id).await?;
                    healed = true;
                    continue;
                }
                Err(e) => {
                    warn!("Skipping pool container {}: {}", slot.name, e);
                    continue;
                }
            }

            match self
                .store
                .reown_pool_slot(&slot.runtime_id, owner.clone(), scenario_id.clone())
                .await?
            {
                Some((record, outcome)) => {
                    if let UpsertOutcome::Overwrote { previous } = outcome {
                        warn!(
                            "Pool handoff replaced {} as the running container of {}; ports {}/{} remain allocated",
                            previous.name, owner, previous.display_port, previous.proxy_port
                        );
                    }
                    info!("Handed pool container {} to {}", record.name, owner);
                    claimed = Some(record);
                }
                None => debug!("Pool container {} was claimed concurrently", slot.name),
            }
            break;
        }

        if claimed.is_some() || healed {
            self.spawn_refill();
        }
        Ok(claimed)
    }

    /// Top the pool back up to `pool.size` in the background.
    pub fn spawn_refill(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            match manager.refill().await {
                Ok(0) => {}
                Ok(created) => debug!("Pool refill created {} container(s)", created),
                Err(e) => warn!("Pool refill failed: {}", e),
            }
        });
    }

    /// Create pool containers until `pool.size` are running, never going
    /// past the global capacity. Only one refill runs at a time; a call made
    /// while another is in flight returns `Ok(0)` immediately.
    pub async fn refill(&self) -> Result<u32> {
        if self
            .refill_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Pool refill already in progress");
            return Ok(0);
        }
        let _guard = RefillGuard(&self.refill_running);

        let current = self.store.count_running_pool().await?;
        let deficit = self.config.pool.size.saturating_sub(current);
        if deficit == 0 {
            return Ok(0);
        }

        let mut created = 0;
        for _ in 0..deficit {
            match self.create_pool_container().await {
                Ok(_) => created += 1,
                Err(e) => warn!("Failed to refill pool: {}", e),
            }
        }
        Ok(created)
    }

    /// Stop and remove every pool container and release its ports.
    /// Returns how many were torn down.
    pub async fn purge_pool(&self) -> Result<u32> {
        let mut purged = 0;
        for slot in self.store.pool_records().await? {
            match self.terminate(&slot.runtime_id, POOL_STOP_GRACE).await {
                Ok(()) => purged += 1,
                Err(e) => warn!("Failed to purge pool container {}: {}", slot.name, e),
            }
        }
        Ok(purged)
    }
}

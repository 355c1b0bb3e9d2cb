//! Idle reaper: periodically reclaims user containers nobody has touched
//! for longer than `idle.timeout`.
//!
//! The background loop only calls the manager's public sweep, so a sweep
//! can also be run synchronously (tests, the `reap` command).

use super::LabManager;
use crate::error::{Error, Result};
use crate::state::Owner;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    pub reclaimed: Vec<Owner>,
    pub failed: u32,
    /// STOPPED records past `idle.record_retention` that were deleted.
    pub pruned_records: u32,
}

impl LabManager {
    /// Reclaim every user container idle for longer than `idle.timeout`,
    /// then delete STOPPED records older than `idle.record_retention`.
    pub async fn reap_idle(&self) -> Result<ReapReport> {
        let idle = &self.config.idle;
        let timeout = chrono::Duration::from_std(idle.timeout)
            .map_err(|e| Error::Config(format!("idle.timeout out of range: {}", e)))?;
        let retention = chrono::Duration::from_std(idle.record_retention)
            .map_err(|e| Error::Config(format!("idle.record_retention out of range: {}", e)))?;

        let now = Utc::now();
        let mut report = self.reap_idle_before(now - timeout).await?;
        report.pruned_records = self.store.prune_stopped(now - retention).await? as u32;
        if report.pruned_records > 0 {
            debug!("Pruned {} stopped record(s)", report.pruned_records);
        }
        Ok(report)
    }

    /// Reclaim every user container whose last activity is before `cutoff`.
    ///
    /// A failure on one container is logged and does not stop the sweep.
    pub async fn reap_idle_before(&self, cutoff: DateTime<Utc>) -> Result<ReapReport> {
        let mut report = ReapReport::default();
        let idle = self.store.idle_records(cutoff).await?;
        if idle.is_empty() {
            debug!("Idle sweep: nothing to reclaim");
            return Ok(report);
        }

        for record in idle {
            match self
                .terminate(&record.runtime_id, self.config.timeouts.stop_grace)
                .await
            {
                Ok(()) => {
                    info!(
                        "Cleaned up idle container {} (last active {})",
                        record.name, record.last_activity_at
                    );
                    report.reclaimed.push(record.owner);
                }
                Err(e) => {
                    warn!("Error cleaning idle container {}: {}", record.name, e);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Start the periodic sweep. The first sweep runs one interval after the
    /// call. The task stops on [`shutdown`](Self::shutdown).
    pub fn spawn_reaper(&self) {
        let mut slot = self.reaper_task.lock();
        if slot.is_some() {
            debug!("Idle reaper already running");
            return;
        }

        let manager = self.clone();
        let token = self.cancellation_token.clone();
        let period = self.config.idle.sweep_interval;
        *slot = Some(tokio::spawn(run_reaper_loop(manager, period, token)));
    }
}

/// Run the reaper loop with panic recovery.
async fn run_reaper_loop(manager: LabManager, period: Duration, cancel_token: CancellationToken) {
    use futures::FutureExt;
    use std::panic::AssertUnwindSafe;

    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Idle reaper shutting down");
                break;
            }
            _ = interval.tick() => {
                let sweep = AssertUnwindSafe(manager.reap_idle()).catch_unwind().await;
                match sweep {
                    Ok(Ok(report)) if !report.reclaimed.is_empty() || report.failed > 0 => info!(
                        "Idle sweep reclaimed {} container(s), {} failed",
                        report.reclaimed.len(),
                        report.failed
                    ),
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => error!("Idle sweep failed: {}", e),
                    Err(panic_info) => {
                        let panic_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                            s.to_string()
                        } else if let Some(s) = panic_info.downcast_ref::<String>() {
                            s.clone()
                        } else {
                            "Unknown panic".to_string()
                        };
                        error!("Idle sweep panicked: {}. Continuing...", panic_msg);
                    }
                }
            }
        }
    }
}

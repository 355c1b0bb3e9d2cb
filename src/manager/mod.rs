//! The lab container manager.
//!
//! - `core` - [`LabManager`] construction, startup, stats and shutdown
//! - `lifecycle` - assign, lookup, stop, cleanup, heartbeat
//! - `pool` - warm pool fill, handoff, refill and purge
//! - `reconcile` - startup repair against the runtime
//! - `reaper` - idle container reclamation

mod core;
mod lifecycle;
mod pool;
mod reaper;
mod reconcile;

pub use self::core::{CapacityStats, LabManager, StartupReport};
pub use lifecycle::{ContainerInfo, Provenance, StopOutcome};
pub use reaper::ReapReport;
pub use reconcile::ReconcileReport;

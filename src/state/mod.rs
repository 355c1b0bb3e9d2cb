//! Persistent state for the port ledger and container records.
//!
//! State lives in a SQLite database with WAL mode enabled, so a crash never
//! leaves half-applied allocations behind. Two tables matter:
//!
//! - `port_allocations`: one row per allocatable host port
//! - `containers`: one row per sandbox container started, with a partial
//!   unique index enforcing a single RUNNING row per owner. STOPPED rows are
//!   pruned once they age past the retention window.
//!
//! # Example
//!
//! ```ignore
//! use labpool::state::{LabStore, PortType};
//!
//! let store = LabStore::open_in_memory().await?;
//! store.initialize().await?;
//! store.seed_ports(PortType::Display, 15900, 15949).await?;
//! ```

mod sqlite;
mod types;

pub use sqlite::LabStore;
pub use types::{
    decode_ts, encode_ts, ContainerRecord, ContainerStatus, Owner, PortRecord, PortType,
    UpsertOutcome, EXTERNAL_OWNER, PROVISIONAL_OWNER,
};

#![allow(unused_assignments)]

//! # labpool
//!
//! Pool and lifecycle manager for short-lived, networked sandbox containers
//! handed out to users of a training lab.
//!
//! ## Features
//!
//! - **Port Ledger**: persistent allocation of host display/proxy ports with
//!   atomic take-lowest-free semantics
//! - **Warm Pool**: pre-started containers handed to users in one transaction
//! - **Lifecycle**: assign, heartbeat, lookup and stop with compensation on
//!   every failure path
//! - **Reconciliation**: startup repair of ledger and records against the
//!   container runtime
//! - **Idle Reaper**: periodic reclamation of abandoned containers
//!
//! ## Quick Start
//!
//! ```no_run
//! use labpool::{DockerRuntime, LabManager, LabStore, Parser};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), labpool::Error> {
//! let config = Parser::new().load(None)?;
//! let store = LabStore::open(config.database.resolved_path()).await?;
//! let manager = LabManager::new(config, store, Arc::new(DockerRuntime::new()));
//!
//! manager.initialize().await?;
//! manager.spawn_reaper();
//!
//! let info = manager.assign("alice", "web-101").await?;
//! println!("{} -> {}", info.owner, info.proxy_url);
//!
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency Model
//!
//! - Every [`LabManager`] method takes `&self`; clones share all state
//! - Port allocation and pool handoff are single SQLite statements or
//!   transactions, so concurrent callers never share a port or a slot
//! - Runtime calls never run while a database transaction is open

pub mod config;
pub mod error;
pub mod ledger;
pub mod manager;
pub mod runtime;
pub mod state;

pub use config::{ManagerConfig, Parser};
pub use error::{Error, Result};
pub use ledger::PortLedger;
pub use manager::{
    CapacityStats, ContainerInfo, LabManager, Provenance, ReapReport, ReconcileReport,
    StartupReport, StopOutcome,
};
pub use runtime::{ContainerRuntime, DockerRuntime, InMemoryRuntime, RuntimeError};
pub use state::{ContainerRecord, LabStore, Owner, PortRecord, PortType};

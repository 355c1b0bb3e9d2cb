//! Core configuration types.
//!
//! [`ManagerConfig`] is the root of `labpool.yaml`. Every field has a
//! default, so an empty file (or no file at all) yields a working setup.

use super::duration::human;
use super::SandboxConfig;
use crate::state::PortType;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Cap on RUNNING containers, pool slots included.
    #[serde(default = "default_max_containers")]
    pub max_containers: u32,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub idle: IdleConfig,

    #[serde(default)]
    pub ports: PortsConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    /// Stop and remove pool containers on graceful shutdown.
    #[serde(default = "default_true")]
    pub purge_pool_on_shutdown: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_containers: default_max_containers(),
            pool: PoolConfig::default(),
            idle: IdleConfig::default(),
            ports: PortsConfig::default(),
            sandbox: SandboxConfig::default(),
            timeouts: TimeoutConfig::default(),
            database: DatabaseConfig::default(),
            purge_pool_on_shutdown: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of warm, unassigned containers to keep running.
    #[serde(default = "default_pool_size")]
    pub size: u32,

    /// Pause between consecutive pool creations at startup.
    #[serde(default = "default_spawn_delay", with = "human")]
    pub spawn_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            spawn_delay: default_spawn_delay(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleConfig {
    /// Inactivity after which a user container is reclaimed.
    #[serde(default = "default_idle_timeout", with = "human")]
    pub timeout: Duration,

    #[serde(default = "default_sweep_interval", with = "human")]
    pub sweep_interval: Duration,

    /// How long STOPPED records are kept before a sweep deletes them.
    #[serde(default = "default_record_retention", with = "human")]
    pub record_retention: Duration,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            timeout: default_idle_timeout(),
            sweep_interval: default_sweep_interval(),
            record_retention: default_record_retention(),
        }
    }
}

/// Inclusive host port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            (self.end - self.start) as usize + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn overlaps(&self, other: &PortRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortsConfig {
    #[serde(default = "default_display_range")]
    pub display: PortRange,

    #[serde(default = "default_proxy_range")]
    pub proxy: PortRange,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            display: default_display_range(),
            proxy: default_proxy_range(),
        }
    }
}

impl PortsConfig {
    pub fn range(&self, port_type: PortType) -> PortRange {
        match port_type {
            PortType::Display => self.display,
            PortType::Proxy => self.proxy,
        }
    }

    /// Smallest range covering every managed port.
    pub fn bounds(&self) -> PortRange {
        PortRange::new(
            self.display.start.min(self.proxy.start),
            self.display.end.max(self.proxy.end),
        )
    }

    pub fn is_managed(&self, port: u16) -> bool {
        self.display.contains(port) || self.proxy.contains(port)
    }
}

/// Upper bounds on individual runtime calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_create_timeout", with = "human")]
    pub create: Duration,

    #[serde(default = "default_create_timeout", with = "human")]
    pub start: Duration,

    /// Bound on the stop call itself, on top of `stop_grace`.
    #[serde(default = "default_stop_timeout", with = "human")]
    pub stop: Duration,

    #[serde(default = "default_short_timeout", with = "human")]
    pub inspect: Duration,

    #[serde(default = "default_short_timeout", with = "human")]
    pub list: Duration,

    /// Time a container gets to exit before the runtime kills it.
    #[serde(default = "default_stop_grace", with = "human")]
    pub stop_grace: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            create: default_create_timeout(),
            start: default_create_timeout(),
            stop: default_stop_timeout(),
            inspect: default_short_timeout(),
            list: default_short_timeout(),
            stop_grace: default_stop_grace(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file. Defaults to `<data dir>/labpool/lab.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl DatabaseConfig {
    pub fn resolved_path(&self) -> PathBuf {
        match &self.path {
            Some(path) => path.clone(),
            None => dirs::data_dir()
                .map(|dir| dir.join("labpool"))
                .unwrap_or_else(|| PathBuf::from(".labpool"))
                .join("lab.db"),
        }
    }
}

fn default_max_containers() -> u32 {
    10
}

fn default_pool_size() -> u32 {
    3
}

fn default_spawn_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_record_retention() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_display_range() -> PortRange {
    PortRange::new(15900, 15949)
}

fn default_proxy_range() -> PortRange {
    PortRange::new(15950, 15999)
}

fn default_create_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_short_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_stop_grace() -> Duration {
    Duration::from_secs(10)
}

fn default_true() -> bool {
    true
}

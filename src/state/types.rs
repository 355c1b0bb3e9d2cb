use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ledger owner stamped on a port between allocation and record persistence.
pub const PROVISIONAL_OWNER: &str = "provisional";

/// Ledger owner for ports found bound by containers the ledger did not hand out.
pub const EXTERNAL_OWNER: &str = "external";

/// Purpose of an allocatable host port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortType {
    /// Published to the sandbox's remote display server.
    Display,
    /// Published to the sandbox's browser-facing display proxy.
    Proxy,
}

impl PortType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortType::Display => "display",
            PortType::Proxy => "proxy",
        }
    }
}

impl fmt::Display for PortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PortType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "display" => Ok(PortType::Display),
            "proxy" => Ok(PortType::Proxy),
            other => Err(format!("unknown port type '{}'", other)),
        }
    }
}

/// Who a container record belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Owner {
    /// A real end user.
    User(String),
    /// Unassigned, pool-owned placeholder slot.
    Pool(String),
}

impl Owner {
    pub fn user(id: impl Into<String>) -> Self {
        Owner::User(id.into())
    }

    pub fn pool(slot: impl Into<String>) -> Self {
        Owner::Pool(slot.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Owner::User(_) => "user",
            Owner::Pool(_) => "pool",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Owner::User(id) | Owner::Pool(id) => id,
        }
    }

    pub fn is_pool(&self) -> bool {
        matches!(self, Owner::Pool(_))
    }

    /// Rebuild from the `(owner_kind, owner_id)` column pair.
    pub fn from_parts(kind: &str, id: String) -> Option<Self> {
        match kind {
            "user" => Some(Owner::User(id)),
            "pool" => Some(Owner::Pool(id)),
            _ => None,
        }
    }

    /// Label written to `port_allocations.allocated_to`.
    pub fn ledger_label(&self) -> String {
        format!("{}:{}", self.kind(), self.id())
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    Stopped,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Running => "running",
            ContainerStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContainerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ContainerStatus::Running),
            "stopped" => Ok(ContainerStatus::Stopped),
            other => Err(format!("unknown container status '{}'", other)),
        }
    }
}

/// One row of the port ledger.
///
/// A port with `is_available == false` always carries an `allocated_to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRecord {
    pub port: u16,
    pub port_type: PortType,
    pub is_available: bool,
    pub allocated_to: Option<String>,
    pub allocated_at: Option<DateTime<Utc>>,
}

/// Persisted state of one sandbox container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub owner: Owner,
    pub runtime_id: String,
    pub name: String,
    pub display_port: u16,
    pub proxy_port: u16,
    pub status: ContainerStatus,
    /// Scenario the container was launched for; `None` for pool slots.
    pub scenario_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl ContainerRecord {
    /// A freshly started container.
    pub fn running(
        owner: Owner,
        runtime_id: String,
        name: String,
        display_port: u16,
        proxy_port: u16,
        scenario_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            owner,
            runtime_id,
            name,
            display_port,
            proxy_port,
            status: ContainerStatus::Running,
            scenario_id,
            created_at: now,
            last_activity_at: now,
            stopped_at: None,
        }
    }

    pub fn ports(&self) -> [u16; 2] {
        [self.display_port, self.proxy_port]
    }
}

/// Result of writing a RUNNING record for an owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// A RUNNING record for the same owner already existed and was
    /// overwritten in place. Its ports were not released.
    Overwrote { previous: ContainerRecord },
}

/// Timestamp encoding used in the database.
///
/// Fixed-width UTC with microseconds, so string comparison in SQL orders
/// chronologically.
pub fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

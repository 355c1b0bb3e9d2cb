//! Container runtime adapter.
//!
//! The manager only ever talks to a runtime through [`ContainerRuntime`]: a
//! narrow contract for listing, creating, starting, stopping, removing and
//! inspecting containers. The runtime is the sole source of truth for
//! whether a container is actually alive.
//!
//! - [`DockerRuntime`] drives the `docker` CLI.
//! - [`InMemoryRuntime`] keeps containers in process memory, with failure
//!   injection for tests.

pub mod docker;
pub mod error;
pub mod memory;

pub use docker::DockerRuntime;
pub use error::RuntimeError;
pub use memory::InMemoryRuntime;

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

/// Opaque reference to a runtime container (its id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ContainerHandle(pub String);

impl ContainerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What `list_containers` should return.
#[derive(Debug, Clone, Default)]
pub struct ContainerFilter {
    /// Include stopped containers.
    pub all: bool,
    /// Only containers whose name contains this substring.
    pub name_contains: Option<String>,
}

impl ContainerFilter {
    pub fn all() -> Self {
        Self {
            all: true,
            name_contains: None,
        }
    }

    pub fn named(fragment: impl Into<String>) -> Self {
        Self {
            all: true,
            name_contains: Some(fragment.into()),
        }
    }

    pub fn matches(&self, summary: &ContainerSummary) -> bool {
        if !self.all && !summary.running {
            return false;
        }
        match &self.name_contains {
            Some(fragment) => summary.names.iter().any(|n| n.contains(fragment.as_str())),
            None => true,
        }
    }
}

/// One row of a container listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub running: bool,
    /// Host ports this container currently publishes.
    pub host_ports: Vec<u16>,
}

impl ContainerSummary {
    pub fn handle(&self) -> ContainerHandle {
        ContainerHandle::new(self.id.clone())
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.names.iter().any(|n| n.trim_start_matches('/') == name)
    }
}

/// Liveness as reported by `inspect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerState {
    pub running: bool,
}

/// A host port published to a fixed internal container port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub host_ip: String,
    pub host_port: u16,
    pub container_port: u16,
}

/// Everything needed to create a sandbox container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub hostname: String,
    pub env: Vec<(String, String)>,
    pub labels: Vec<(String, String)>,
    pub port_bindings: Vec<PortBinding>,
    pub network: String,
    pub memory_bytes: u64,
    pub cpu_quota: u64,
    pub cpu_period: u64,
    pub cap_add: Vec<String>,
    pub no_new_privileges: bool,
}

impl ContainerSpec {
    pub fn host_ports(&self) -> Vec<u16> {
        self.port_bindings.iter().map(|b| b.host_port).collect()
    }
}

/// Narrow interface to a container runtime.
///
/// Implementations should return [`RuntimeError::ContainerNotFound`] when
/// the handle refers to a container that no longer exists; the manager
/// treats that as "already gone" on stop/remove paths.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Whether the named network exists.
    async fn network_exists(&self, name: &str) -> Result<bool, RuntimeError>;

    async fn list_containers(
        &self,
        filter: &ContainerFilter,
    ) -> Result<Vec<ContainerSummary>, RuntimeError>;

    /// Create (but do not start) a container.
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError>;

    async fn start(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;

    /// Stop a container, waiting up to `grace` before the runtime kills it.
    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<(), RuntimeError>;

    async fn remove(&self, handle: &ContainerHandle, force: bool) -> Result<(), RuntimeError>;

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerState, RuntimeError>;
}

//! Docker CLI runtime.
//!
//! All Docker CLI interactions go through `DockerRuntime`, which provides
//! consistent timeout handling, error mapping to [`RuntimeError`], and a single
//! point where `Command::new("docker")` is constructed.

use super::{
    ContainerFilter, ContainerHandle, ContainerRuntime, ContainerSpec, ContainerState,
    ContainerSummary, RuntimeError,
};
use async_trait::async_trait;
use std::process::Output;
use std::time::Duration;

/// Default upper bound for a single docker CLI invocation.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// `docker ps` row format: id, names, state, published ports.
const PS_FORMAT: &str = "{{.ID}}\t{{.Names}}\t{{.State}}\t{{.Ports}}";

/// Container runtime backed by the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    binary: String,
    command_timeout: Duration,
}

impl DockerRuntime {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Use a different CLI binary (e.g. `podman`).
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    // ========================================================================
    // Internal helpers
    // ========================================================================

    fn command_string(&self, args: &[&str]) -> String {
        format!("{} {}", self.binary, args.join(" "))
    }

    /// Run a docker command with a timeout, returning raw Output.
    async fn run(&self, args: &[&str], timeout: Duration) -> Result<Output, RuntimeError> {
        let result = tokio::time::timeout(
            timeout,
            tokio::process::Command::new(&self.binary)
                .args(args)
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(RuntimeError::exec_failed(self.command_string(args), e)),
            Err(_) => Err(RuntimeError::timeout(self.command_string(args), timeout)),
        }
    }

    /// Run a docker command, returning Output only if exit 0.
    async fn run_success(
        &self,
        args: &[&str],
        container: &str,
        timeout: Duration,
    ) -> Result<Output, RuntimeError> {
        let output = self.run(args, timeout).await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(RuntimeError::failed(
                self.command_string(args),
                container,
                &output,
            ))
        }
    }
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn network_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        let filter = format!("name={}", name);
        let output = self
            .run_success(
                &["network", "ls", "--filter", &filter, "--format", "{{.Name}}"],
                "",
                self.command_timeout,
            )
            .await?;
        // The name filter matches substrings; require an exact line
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .any(|line| line.trim() == name))
    }

    async fn list_containers(
        &self,
        filter: &ContainerFilter,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let mut args: Vec<String> = vec!["ps".into(), "--no-trunc".into()];
        if filter.all {
            args.push("-a".into());
        }
        if let Some(fragment) = &filter.name_contains {
            args.push("--filter".into());
            args.push(format!("name={}", fragment));
        }
        args.push("--format".into());
        args.push(PS_FORMAT.into());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self
            .run_success(&arg_refs, "", self.command_timeout)
            .await?;

        let summaries = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(parse_ps_line)
            // docker's name filter is looser than ours; re-apply it
            .filter(|s| filter.matches(s))
            .collect();
        Ok(summaries)
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        let args = create_args(spec);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self
            .run_success(&arg_refs, &spec.name, self.command_timeout)
            .await?;
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(RuntimeError::cmd_failed(
                self.command_string(&["create", &spec.name]),
                "no container id returned",
                output.status.code(),
            ));
        }
        Ok(ContainerHandle::new(id))
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.run_success(&["start", handle.id()], handle.id(), self.command_timeout)
            .await?;
        Ok(())
    }

    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<(), RuntimeError> {
        let grace_secs = grace.as_secs().to_string();
        // The CLI waits for the grace period before killing; budget for it.
        let timeout = self.command_timeout + grace;
        let output = self
            .run(&["stop", "-t", &grace_secs, handle.id()], timeout)
            .await?;
        if output.status.success() {
            return Ok(());
        }
        Err(RuntimeError::failed(
            self.command_string(&["stop", handle.id()]),
            handle.id(),
            &output,
        ))
    }

    async fn remove(&self, handle: &ContainerHandle, force: bool) -> Result<(), RuntimeError> {
        let args: Vec<&str> = if force {
            vec!["rm", "-f", handle.id()]
        } else {
            vec!["rm", handle.id()]
        };
        self.run_success(&args, handle.id(), self.command_timeout)
            .await?;
        Ok(())
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerState, RuntimeError> {
        let output = self
            .run_success(
                &[
                    "inspect",
                    "--type",
                    "container",
                    "-f",
                    "{{.State.Running}}",
                    handle.id(),
                ],
                handle.id(),
                self.command_timeout,
            )
            .await?;
        let running = String::from_utf8_lossy(&output.stdout).trim() == "true";
        Ok(ContainerState { running })
    }
}

/// Build the `docker create` argument list for a sandbox spec.
pub(crate) fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--hostname".to_string(),
        spec.hostname.clone(),
        "--network".to_string(),
        spec.network.clone(),
        "--memory".to_string(),
        spec.memory_bytes.to_string(),
        // Same value as --memory disables swap
        "--memory-swap".to_string(),
        spec.memory_bytes.to_string(),
        "--cpu-quota".to_string(),
        spec.cpu_quota.to_string(),
        "--cpu-period".to_string(),
        spec.cpu_period.to_string(),
    ];

    for cap in &spec.cap_add {
        args.push("--cap-add".to_string());
        args.push(cap.clone());
    }

    if spec.no_new_privileges {
        args.push("--security-opt".to_string());
        args.push("no-new-privileges:true".to_string());
    }

    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    for (key, value) in &spec.labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }

    for binding in &spec.port_bindings {
        args.push("-p".to_string());
        args.push(format!(
            "{}:{}:{}/tcp",
            binding.host_ip, binding.host_port, binding.container_port
        ));
    }

    args.push(spec.image.clone());
    args
}

/// Parse one `docker ps` row produced with [`PS_FORMAT`].
fn parse_ps_line(line: &str) -> Option<ContainerSummary> {
    let mut parts = line.splitn(4, '\t');
    let id = parts.next()?.trim();
    if id.is_empty() {
        return None;
    }
    let names = parts
        .next()
        .unwrap_or_default()
        .split(',')
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect();
    let state = parts.next().unwrap_or_default().trim();
    let ports = parts.next().unwrap_or_default();

    Some(ContainerSummary {
        id: id.to_string(),
        names,
        running: state == "running",
        host_ports: parse_host_ports(ports),
    })
}

/// Extract published host ports from a `docker ps` Ports column.
///
/// Handles `127.0.0.1:15900->5901/tcp`, IPv6 `:::15900->5901/tcp` and
/// `[::]:15900->5901/tcp`, ranges like `0.0.0.0:8000-8002->8000-8002/tcp`,
/// and skips exposed-but-unpublished entries like `5901/tcp`.
pub(crate) fn parse_host_ports(column: &str) -> Vec<u16> {
    let mut ports = Vec::new();
    for entry in column.split(',') {
        let Some((host_side, _)) = entry.trim().split_once("->") else {
            continue;
        };
        let Some((_, port_part)) = host_side.rsplit_once(':') else {
            continue;
        };
        match port_part.split_once('-') {
            Some((lo, hi)) => {
                if let (Ok(lo), Ok(hi)) = (lo.parse::<u16>(), hi.parse::<u16>()) {
                    ports.extend(lo..=hi);
                }
            }
            None => {
                if let Ok(port) = port_part.parse::<u16>() {
                    ports.push(port);
                }
            }
        }
    }
    ports.sort_unstable();
    ports.dedup();
    ports
}

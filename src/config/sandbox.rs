//! Sandbox container settings.
//!
//! Everything that ends up in a container create request: image, network,
//! fixed internal ports and the resource/privilege envelope every lab
//! container runs under.

use serde::{Deserialize, Serialize};

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_image")]
    pub image: String,

    /// Network every sandbox joins. Must exist before the manager starts.
    #[serde(default = "default_network")]
    pub network: String,

    /// Prefix for container names (`{prefix}-user-...`, `{prefix}-pool-...`).
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    /// Remote display server port inside the container.
    #[serde(default = "default_display_internal_port")]
    pub display_internal_port: u16,

    /// Browser display proxy port inside the container.
    #[serde(default = "default_proxy_internal_port")]
    pub proxy_internal_port: u16,

    /// Credential handed to the display server and embedded in proxy URLs.
    #[serde(default = "default_display_password")]
    pub display_password: String,

    /// Hard memory ceiling in bytes. Swap is capped at the same value.
    #[serde(default = "default_memory_bytes")]
    pub memory_bytes: u64,

    /// CFS quota in microseconds per `cpu_period`.
    #[serde(default = "default_cpu_quota")]
    pub cpu_quota: u64,

    #[serde(default = "default_cpu_period")]
    pub cpu_period: u64,

    /// Linux capabilities added on top of the runtime's default set.
    #[serde(default = "default_cap_add")]
    pub cap_add: Vec<String>,

    #[serde(default = "default_true")]
    pub no_new_privileges: bool,

    /// Host interface the published ports bind to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Hostname used when building connection URLs for callers.
    #[serde(default = "default_public_host")]
    pub public_host: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            network: default_network(),
            name_prefix: default_name_prefix(),
            display_internal_port: default_display_internal_port(),
            proxy_internal_port: default_proxy_internal_port(),
            display_password: default_display_password(),
            memory_bytes: default_memory_bytes(),
            cpu_quota: default_cpu_quota(),
            cpu_period: default_cpu_period(),
            cap_add: default_cap_add(),
            no_new_privileges: true,
            bind_address: default_bind_address(),
            public_host: default_public_host(),
        }
    }
}

impl SandboxConfig {
    /// Fraction of one CPU the quota allows (0.5 for the defaults).
    pub fn cpu_share(&self) -> f64 {
        if self.cpu_period == 0 {
            return 0.0;
        }
        self.cpu_quota as f64 / self.cpu_period as f64
    }
}

fn default_image() -> String {
    "kali-custom:latest".to_string()
}

fn default_network() -> String {
    "hack-lab-network".to_string()
}

fn default_name_prefix() -> String {
    "lab".to_string()
}

fn default_display_internal_port() -> u16 {
    5901
}

fn default_proxy_internal_port() -> u16 {
    6080
}

fn default_display_password() -> String {
    "kali123".to_string()
}

fn default_memory_bytes() -> u64 {
    2 * GIB
}

fn default_cpu_quota() -> u64 {
    50_000
}

fn default_cpu_period() -> u64 {
    100_000
}

fn default_cap_add() -> Vec<String> {
    vec!["NET_RAW".to_string(), "NET_ADMIN".to_string()]
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_public_host() -> String {
    "localhost".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_keeps_other_defaults() {
        let cfg: SandboxConfig = serde_yaml::from_str("image: lab/desktop:2\ncap_add: []").unwrap();
        assert_eq!(cfg.image, "lab/desktop:2");
        assert!(cfg.cap_add.is_empty());
        assert_eq!(cfg.memory_bytes, 2 * GIB);
        assert!(cfg.no_new_privileges);
        assert!((cfg.cpu_share() - 0.5).abs() < f64::EPSILON);
    }
}

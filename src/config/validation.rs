use super::{ManagerConfig, PortRange};
use crate::error::{Error, Result};

impl ManagerConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_containers == 0 {
            return Err(Error::Validation(
                "max_containers must be at least 1".to_string(),
            ));
        }

        if self.pool.size > self.max_containers {
            return Err(Error::Validation(format!(
                "pool.size ({}) cannot exceed max_containers ({})",
                self.pool.size, self.max_containers
            )));
        }

        validate_range("ports.display", &self.ports.display)?;
        validate_range("ports.proxy", &self.ports.proxy)?;
        if self.ports.display.overlaps(&self.ports.proxy) {
            return Err(Error::Validation(format!(
                "ports.display ({}) and ports.proxy ({}) overlap",
                self.ports.display, self.ports.proxy
            )));
        }

        if self.idle.sweep_interval.is_zero() {
            return Err(Error::Validation(
                "idle.sweep_interval must be greater than zero".to_string(),
            ));
        }
        if self.idle.timeout.is_zero() {
            return Err(Error::Validation(
                "idle.timeout must be greater than zero".to_string(),
            ));
        }

        let sandbox = &self.sandbox;
        if sandbox.image.trim().is_empty() {
            return Err(Error::Validation("sandbox.image cannot be empty".to_string()));
        }
        if sandbox.network.trim().is_empty() {
            return Err(Error::Validation(
                "sandbox.network cannot be empty".to_string(),
            ));
        }
        if sandbox.name_prefix.is_empty()
            || !sandbox
                .name_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::Validation(format!(
                "sandbox.name_prefix '{}' may only contain letters, digits, '-' and '_'",
                sandbox.name_prefix
            )));
        }
        if sandbox.display_internal_port == 0
            || sandbox.proxy_internal_port == 0
            || sandbox.display_internal_port == sandbox.proxy_internal_port
        {
            return Err(Error::Validation(
                "sandbox internal ports must be non-zero and distinct".to_string(),
            ));
        }
        if sandbox.cpu_period == 0 || sandbox.cpu_quota == 0 {
            return Err(Error::Validation(
                "sandbox.cpu_quota and sandbox.cpu_period must be greater than zero".to_string(),
            ));
        }
        // Docker refuses memory limits below 6 MiB.
        if sandbox.memory_bytes < 6 * 1024 * 1024 {
            return Err(Error::Validation(format!(
                "sandbox.memory_bytes ({}) is below the 6 MiB minimum",
                sandbox.memory_bytes
            )));
        }

        Ok(())
    }
}

fn validate_range(field: &str, range: &PortRange) -> Result<()> {
    if range.start == 0 {
        return Err(Error::Validation(format!(
            "{} cannot start at port 0",
            field
        )));
    }
    if range.is_empty() {
        return Err(Error::Validation(format!(
            "{} range {} is empty (start must be <= end)",
            field, range
        )));
    }
    Ok(())
}

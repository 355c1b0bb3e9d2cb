use super::ManagerConfig;
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const CONFIG_FILE_NAMES: [&str; 2] = ["labpool.yaml", "labpool.yml"];

pub struct Parser;

impl Parser {
    pub fn new() -> Self {
        Self
    }

    /// Find config file starting from current directory
    pub fn find_config_file(&self) -> Result<PathBuf> {
        let current_dir = std::env::current_dir()?;
        Self::find_config_in_dir(&current_dir)
    }

    pub fn find_config_in_dir(dir: &Path) -> Result<PathBuf> {
        for name in CONFIG_FILE_NAMES {
            let candidate = dir.join(name);
            if candidate.exists() {
                return Ok(candidate);
            }
        }

        if let Some(parent) = dir.parent() {
            return Self::find_config_in_dir(parent);
        }

        Err(Error::Config(
            "Could not find labpool.yaml in current directory or any parent".to_string(),
        ))
    }

    /// Load config from file path
    pub fn load_config<P: AsRef<Path>>(&self, path: P) -> Result<ManagerConfig> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        self.parse_config(&content)
    }

    /// Parse config from YAML string
    pub fn parse_config(&self, content: &str) -> Result<ManagerConfig> {
        if content.trim().is_empty() {
            return Ok(ManagerConfig::default());
        }
        serde_yaml::from_str(content)
            .map_err(|e| Error::Parse(format!("Failed to parse YAML config: {}", e)))
    }

    /// Resolve the effective configuration for the binary.
    ///
    /// An explicit path must exist. Without one, `labpool.yaml` is searched
    /// upwards from the working directory and defaults are used when none
    /// is found. Environment overrides and validation run last.
    pub fn load(&self, explicit: Option<&Path>) -> Result<ManagerConfig> {
        let mut config = match explicit {
            Some(path) => self.load_config(path)?,
            None => match self.find_config_file() {
                Ok(path) => {
                    debug!("Using config file {}", path.display());
                    self.load_config(path)?
                }
                Err(_) => {
                    debug!("No labpool.yaml found, using defaults");
                    ManagerConfig::default()
                }
            },
        };

        apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply the deployment environment variables on top of a parsed config.
///
/// | Variable | Field |
/// |---|---|
/// | `MAX_CONCURRENT_CONTAINERS` | `max_containers` |
/// | `POOL_SIZE` | `pool.size` |
/// | `CONTAINER_IDLE_TIMEOUT` | `idle.timeout`, in milliseconds |
/// | `LAB_IMAGE` | `sandbox.image` |
/// | `LAB_DATABASE` | `database.path` |
pub fn apply_env_overrides<F>(config: &mut ManagerConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup("MAX_CONCURRENT_CONTAINERS") {
        config.max_containers = parse_env_number("MAX_CONCURRENT_CONTAINERS", &raw)?;
    }
    if let Some(raw) = lookup("POOL_SIZE") {
        config.pool.size = parse_env_number("POOL_SIZE", &raw)?;
    }
    if let Some(raw) = lookup("CONTAINER_IDLE_TIMEOUT") {
        let ms: u64 = parse_env_number("CONTAINER_IDLE_TIMEOUT", &raw)?;
        config.idle.timeout = Duration::from_millis(ms);
    }
    if let Some(image) = lookup("LAB_IMAGE").filter(|v| !v.trim().is_empty()) {
        config.sandbox.image = image;
    }
    if let Some(path) = lookup("LAB_DATABASE").filter(|v| !v.trim().is_empty()) {
        config.database.path = Some(PathBuf::from(path));
    }
    Ok(())
}

fn parse_env_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim().parse().map_err(|_| {
        Error::Config(format!(
            "Environment variable {}='{}' is not a valid number",
            key, raw
        ))
    })
}

// Allow unused_assignments at module level because thiserror's generated code
// for struct variants triggers false positive warnings - the fields ARE used
// in the Display impl but rustc's lint pass doesn't see this.
#![allow(unused_assignments)]

use crate::runtime::RuntimeError;
use crate::state::PortType;
use miette::Diagnostic;
use std::io;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    #[diagnostic(
        code(labpool::config::validation),
        help("Check the port ranges and capacity settings in labpool.yaml")
    )]
    Validation(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Filesystem error: {0}")]
    #[diagnostic(code(labpool::filesystem::error))]
    Filesystem(String),

    #[error("Database error: {0}")]
    #[diagnostic(code(labpool::database::error))]
    Database(#[from] tokio_rusqlite::Error),

    /// No port of the requested type is free in the ledger.
    #[error("No {port_type} ports available")]
    #[diagnostic(
        code(labpool::ports::exhausted),
        help("Widen the port range in labpool.yaml or wait for idle containers to be reclaimed")
    )]
    ResourceExhausted { port_type: PortType },

    /// The global container cap is reached.
    #[error("Server at capacity ({active}/{max} containers)")]
    #[diagnostic(
        code(labpool::capacity::exceeded),
        help("Please try again in a few minutes")
    )]
    CapacityExceeded { active: u32, max: u32 },

    /// Startup precondition (e.g. the sandbox network) is missing. Fatal.
    #[error("Runtime precondition missing: {0}")]
    #[diagnostic(
        code(labpool::runtime::precondition),
        help("Create the sandbox network first (for example with docker compose up)")
    )]
    RuntimePreconditionMissing(String),

    #[error("Runtime operation failed: {0}")]
    #[diagnostic(
        code(labpool::runtime::failed),
        help("Check that Docker is running with `docker ps`")
    )]
    RuntimeOperationFailed(#[from] RuntimeError),

    /// Another process holds the store's advisory lock.
    #[error("Store is in use: {0}")]
    #[diagnostic(
        code(labpool::database::in_use),
        help("Stop the running labpool server first")
    )]
    StoreInUse(String),

    /// Nothing to act on. Soft: callers usually report it rather than fail.
    #[error("Record not found: {0}")]
    RecordNotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the caller may reasonably retry the same request later.
    ///
    /// Capacity and port exhaustion clear up as containers are reclaimed;
    /// runtime timeouts and an unresponsive daemon are transient. Everything
    /// else (bad config, missing network, database corruption) is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ResourceExhausted { .. } | Error::CapacityExceeded { .. } => true,
            Error::RuntimeOperationFailed(e) => matches!(
                e,
                RuntimeError::Timeout { .. } | RuntimeError::DaemonUnavailable
            ),
            _ => false,
        }
    }

    /// Whether this is the "server full" condition shown to end users.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            Error::CapacityExceeded { .. } | Error::ResourceExhausted { .. }
        )
    }

    /// Returns a helpful suggestion for resolving this error, if available.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Error::CapacityExceeded { .. } => {
                Some("Please try again in a few minutes".to_string())
            }
            Error::ResourceExhausted { port_type } => Some(format!(
                "All {} ports are in use. Run `labpool ports` to inspect the ledger or `labpool reap` to reclaim idle containers.",
                port_type
            )),
            Error::RuntimePreconditionMissing(_) => Some(
                "Start the sandbox network (docker compose up) before starting labpool".to_string(),
            ),
            Error::RuntimeOperationFailed(RuntimeError::DaemonUnavailable)
            | Error::RuntimeOperationFailed(RuntimeError::ExecFailed { .. }) => {
                Some("Check that Docker is running: docker ps".to_string())
            }
            Error::StoreInUse(_) => Some(
                "Stop `labpool serve` first; it reconciles on every start".to_string(),
            ),
            Error::RecordNotFound(_) => {
                Some("Assign a sandbox first: labpool assign <owner> <scenario>".to_string())
            }
            Error::Config(_) | Error::Validation(_) => {
                Some("Validate your config with: labpool check-config".to_string())
            }
            Error::Database(e) => {
                // tokio_rusqlite wraps the underlying error opaquely
                let err_str = e.to_string();
                if err_str.contains("database is locked") || err_str.contains("SQLITE_BUSY") {
                    Some("Another labpool instance may be writing to the same database.".to_string())
                } else {
                    Some(
                        "Database error encountered. If it persists, stop labpool, remove the database file and restart; startup reconciliation rebuilds the port ledger.".to_string(),
                    )
                }
            }
            _ => None,
        }
    }

    /// Formats the error with its suggestion (if any) for user-friendly display.
    pub fn with_suggestion(&self) -> String {
        match self.suggestion() {
            Some(suggestion) => format!("{}\n\nHint: {}", self, suggestion),
            None => self.to_string(),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Database(tokio_rusqlite::Error::Rusqlite(e))
    }
}

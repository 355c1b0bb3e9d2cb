use std::fmt;
use std::time::Duration;

/// Structured error type for container runtime operations.
///
/// Every adapter maps its failures onto these variants so the manager can
/// tell "the container is already gone" apart from a real failure.
#[derive(Debug)]
pub enum RuntimeError {
    /// Runtime call exceeded its time budget.
    Timeout { command: String, timeout: Duration },

    /// Runtime command ran but returned non-zero exit.
    CommandFailed {
        command: String,
        stderr: String,
        exit_code: Option<i32>,
    },

    /// Runtime binary couldn't be executed (not in PATH, permission denied).
    ExecFailed {
        command: String,
        source: std::io::Error,
    },

    /// Container doesn't exist (parsed from "No such container" stderr).
    ContainerNotFound { container: String },

    /// Runtime daemon not responding.
    DaemonUnavailable,
}

impl RuntimeError {
    pub fn timeout(cmd: impl Into<String>, dur: Duration) -> Self {
        RuntimeError::Timeout {
            command: cmd.into(),
            timeout: dur,
        }
    }

    /// Create a command-failed error from an `std::process::Output`.
    ///
    /// Recognises the daemon's "No such container"/"No such object" message
    /// and maps it to [`RuntimeError::ContainerNotFound`].
    pub fn failed(cmd: impl Into<String>, container: &str, output: &std::process::Output) -> Self {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("No such container") || stderr.contains("No such object") {
            return RuntimeError::ContainerNotFound {
                container: container.to_string(),
            };
        }
        if stderr.contains("Cannot connect to the Docker daemon") {
            return RuntimeError::DaemonUnavailable;
        }
        RuntimeError::CommandFailed {
            command: cmd.into(),
            stderr,
            exit_code: output.status.code(),
        }
    }

    pub fn cmd_failed(
        cmd: impl Into<String>,
        stderr: impl Into<String>,
        exit_code: Option<i32>,
    ) -> Self {
        RuntimeError::CommandFailed {
            command: cmd.into(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    pub fn exec_failed(cmd: impl Into<String>, err: std::io::Error) -> Self {
        RuntimeError::ExecFailed {
            command: cmd.into(),
            source: err,
        }
    }

    pub fn not_found(container: impl Into<String>) -> Self {
        RuntimeError::ContainerNotFound {
            container: container.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::ContainerNotFound { .. })
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::Timeout { command, timeout } => {
                write!(
                    f,
                    "Timed out running '{}' (exceeded {}ms)",
                    command,
                    timeout.as_millis()
                )
            }
            RuntimeError::CommandFailed {
                command,
                stderr,
                exit_code,
            } => {
                if let Some(code) = exit_code {
                    write!(f, "'{}' failed (exit code {}): {}", command, code, stderr)
                } else {
                    write!(f, "'{}' failed: {}", command, stderr)
                }
            }
            RuntimeError::ExecFailed { command, source } => {
                write!(f, "Failed to execute '{}': {}", command, source)
            }
            RuntimeError::ContainerNotFound { container } => {
                write!(f, "No such container: {}", container)
            }
            RuntimeError::DaemonUnavailable => {
                write!(f, "Container runtime daemon is not responding")
            }
        }
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RuntimeError::ExecFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn output_with_stderr(stderr: &str, code: i32) -> std::process::Output {
        use std::os::unix::process::ExitStatusExt;
        std::process::Output {
            status: std::process::ExitStatus::from_raw(code << 8),
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_recognises_missing_container() {
        let out = output_with_stderr("Error: No such container: abc123\n", 1);
        let err = RuntimeError::failed("docker inspect abc123", "abc123", &out);
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "No such container: abc123");
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_keeps_stderr_and_exit_code() {
        let out = output_with_stderr("port is already allocated", 125);
        let err = RuntimeError::failed("docker start abc", "abc", &out);
        match err {
            RuntimeError::CommandFailed {
                stderr, exit_code, ..
            } => {
                assert_eq!(stderr, "port is already allocated");
                assert_eq!(exit_code, Some(125));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_timeout_display() {
        let err = RuntimeError::timeout("docker stop x", Duration::from_millis(1500));
        assert_eq!(err.to_string(), "Timed out running 'docker stop x' (exceeded 1500ms)");
    }
}

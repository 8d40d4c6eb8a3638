//! Error types for spawn server operations

use std::io;
use thiserror::Error;

/// Result type for spawn server operations
pub type Result<T> = std::result::Result<T, SpawnError>;

/// Errors that can occur while spawning and supervising children
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Syscall error: {0}")]
    Syscall(String),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Namespace error: {0}")]
    Namespace(String),

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("Seccomp error: {0}")]
    Seccomp(String),

    #[error("Systemd error: {0}")]
    Systemd(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Credentials rejected: {0}")]
    Rejected(String),
}

impl From<nix::errno::Errno> for SpawnError {
    fn from(errno: nix::errno::Errno) -> Self {
        SpawnError::Io(io::Error::from_raw_os_error(errno as i32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SpawnError::Rejected("uid 0 is not allowed".to_string());
        assert_eq!(err.to_string(), "Credentials rejected: uid 0 is not allowed");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err = SpawnError::from(io_err);
        assert!(err.to_string().contains("IO error"));
    }

    #[test]
    fn test_error_from_errno() {
        let err = SpawnError::from(nix::errno::Errno::EPERM);
        assert!(matches!(err, SpawnError::Io(_)));
    }

    #[test]
    fn test_result_type() {
        fn returns_result() -> Result<i32> {
            Ok(42)
        }
        assert_eq!(returns_result().unwrap(), 42);
    }
}

//! Common error types for the Knode ecosystem.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`KnodeError`].
pub type KnodeResult<T> = Result<T, KnodeError>;

/// Common errors across the Knode ecosystem.
#[derive(Error, Diagnostic, Debug)]
pub enum KnodeError {
    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(knode::io))]
    Io(#[from] std::io::Error),

    /// The mount-expiry probe returned a response that should be impossible
    /// while an open descriptor to the target is held.
    #[error("Mount probe invariant violated for {}: {detail}", path.display())]
    #[diagnostic(
        code(knode::cleanup::mount_probe),
        help("Refusing to guess the mount status; this would risk deleting data outside the target tree")
    )]
    MountProbe {
        /// The path whose mount status could not be determined safely.
        path: PathBuf,
        /// What the kernel reported.
        detail: String,
    },

    /// Permission denied.
    #[error("Permission denied: {operation}")]
    #[diagnostic(
        code(knode::permission_denied),
        help("Try running with elevated privileges (sudo)")
    )]
    PermissionDenied {
        /// The operation that was denied.
        operation: String,
    },

    /// One or more cleanup operations failed.
    #[error("Cleanup failed: {message}")]
    #[diagnostic(
        code(knode::cleanup::failed),
        help("Re-run reset once the underlying errors are resolved")
    )]
    Cleanup {
        /// What failed, one clause per operation.
        message: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(knode::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(knode::internal),
        help("This is a bug, please report it at https://github.com/knode-dev/knode/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = KnodeError::MountProbe {
            path: PathBuf::from("/var/lib/knode/mnt"),
            detail: "unmount reported EAGAIN".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Mount probe invariant violated for /var/lib/knode/mnt: unmount reported EAGAIN"
        );
    }

    #[test]
    fn permission_denied_display() {
        let err = KnodeError::PermissionDenied {
            operation: "reset".to_string(),
        };
        assert_eq!(err.to_string(), "Permission denied: reset");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: KnodeError = io_err.into();
        assert!(matches!(err, KnodeError::Io(_)));
    }
}

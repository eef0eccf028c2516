//! Filesystem error types.

use std::io;
use thiserror::Error;

/// Error type shared by every filesystem implementation.
#[derive(Debug, Error)]
pub enum FsError {
    /// File or directory not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Path already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Operation denied by policy or a read-only mount.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Bad path or bad argument.
    #[error("invalid: {0}")]
    Invalid(String),

    /// Hard or symbolic link between two distinct filesystems.
    #[error("cannot link between filesystems")]
    CrossMount,

    /// Host or transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FsError {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    /// Create a Forbidden error.
    pub fn forbidden(path: impl Into<String>) -> Self {
        Self::Forbidden(path.into())
    }

    /// Create an Invalid error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    /// Classify a host I/O error against the virtual path that produced it.
    ///
    /// Not-found, already-exists and permission-denied map onto the
    /// corresponding variants so adapters can translate them to protocol
    /// statuses; everything else stays an I/O error.
    pub fn from_io(err: io::Error, path: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path.to_string()),
            io::ErrorKind::AlreadyExists => Self::AlreadyExists(path.to_string()),
            io::ErrorKind::PermissionDenied => Self::Forbidden(path.to_string()),
            _ => Self::Io(err),
        }
    }

    /// Returns true for the not-found variant.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true for the forbidden variant.
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Forbidden(_))
    }
}

/// Result alias used across the crate.
pub type FsResult<T> = Result<T, FsError>;

//! Error types shared across vmdisk crates.

use std::io;

use thiserror::Error;

/// Result alias used throughout vmdisk.
pub type VmDiskResult<T> = Result<T, VmDiskError>;

/// Errors raised while preparing or executing a disk image operation.
///
/// Operations never surface these across their public boundary: every
/// error is folded into a terminal status plus a failure reason. The
/// variant decides which status a caller eventually observes.
#[derive(Debug, Error)]
pub enum VmDiskError {
    /// Generic filesystem or descriptor failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// A source path or entry does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The target filesystem ran out of space (or quota).
    #[error("not enough space: {0}")]
    NotEnoughSpace(String),

    /// A destination (or its staging area) is already present.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The caller supplied an unusable input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation was used in a way its lifecycle does not allow.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Transferred data did not match what the container declared.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// ZIP container read/write failure.
    #[error("archive error: {0}")]
    Archive(String),

    /// Compression or decompression failure.
    #[error("codec error: {0}")]
    Codec(String),

    /// A collaborator (plugin VM host, resize callback) reported an error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl VmDiskError {
    /// Classify an I/O error, prefixing it with `context`.
    ///
    /// Out-of-space conditions get their own variant so callers can show
    /// actionable messaging; missing paths map to `NotFound`.
    pub fn from_io(context: impl AsRef<str>, err: io::Error) -> Self {
        let message = format!("{}: {}", context.as_ref(), err);
        if matches!(err.raw_os_error(), Some(libc::ENOSPC) | Some(libc::EDQUOT)) {
            return VmDiskError::NotEnoughSpace(message);
        }
        match err.kind() {
            io::ErrorKind::NotFound => VmDiskError::NotFound(message),
            io::ErrorKind::AlreadyExists => VmDiskError::AlreadyExists(message),
            _ => VmDiskError::Storage(message),
        }
    }

    /// Whether this error reports exhausted disk space.
    pub fn is_out_of_space(&self) -> bool {
        matches!(self, VmDiskError::NotEnoughSpace(_))
    }
}

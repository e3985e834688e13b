//! Error types for the Rtvm bridge

use rtvm_common::{LockStatus, WaitTimeout};
use thiserror::Error;

/// Alias for `Result<T, Error>`
pub type Result<T> = std::result::Result<T, Error>;

/// Rtvm bridge errors
#[derive(Error, Debug)]
pub enum Error {
    /// Null, uninitialized or destroyed handle
    #[error("invalid arguments: {0}")]
    InvalidArguments(&'static str),

    /// Bounded wait expired
    #[error("timed out waiting for lock ({0:?})")]
    Timeout(WaitTimeout),

    /// Unexpected native primitive failure
    #[error("native primitive failure: {0}")]
    Unknown(&'static str),

    /// Allocator exhausted, raised to the VM as an exception
    #[error("out of memory: requested {requested} bytes ({total} bytes allocated so far)")]
    OutOfMemory {
        /// Size of the failed request
        requested: usize,
        /// Cumulative bytes handed out before the failure
        total: usize,
    },

    /// The calling task already owns the interpreter lock
    #[error("deadlock detected: task re-entered the VM while holding the interpreter lock")]
    DeadlockDetected,

    /// The host could not create a native primitive
    #[error("host resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// Failed to map the fast region
    #[error("fast region mapping failed: {0}")]
    Mmap(#[from] std::io::Error),

    /// Task creation failed
    #[error("task creation failed: {0}")]
    TaskCreate(String),

    /// Operation not supported
    #[error("operation not supported: {0}")]
    NotSupported(String),
}

impl Error {
    /// Status code reported to the VM's lock table
    pub fn status(&self) -> LockStatus {
        match self {
            Error::InvalidArguments(_) | Error::ResourceExhausted(_) => {
                LockStatus::InvalidArguments
            }
            Error::Timeout(_) => LockStatus::Timeout,
            _ => LockStatus::Unknown,
        }
    }
}

/// Collapse a lock operation result into its status code
pub fn status_of<T>(result: &Result<T>) -> LockStatus {
    match result {
        Ok(_) => LockStatus::Ok,
        Err(e) => e.status(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            Error::InvalidArguments("null lock").status(),
            LockStatus::InvalidArguments
        );
        assert_eq!(
            Error::ResourceExhausted("mutex").status(),
            LockStatus::InvalidArguments
        );
        assert_eq!(
            Error::Timeout(WaitTimeout::NoWait).status(),
            LockStatus::Timeout
        );
        assert_eq!(Error::Unknown("give").status(), LockStatus::Unknown);
        assert_eq!(status_of(&Ok::<(), Error>(())), LockStatus::Ok);
    }
}

//! Error taxonomy for the runtime.
//!
//! Every failure a command can surface maps to exactly one variant here.
//! The CLI prints the message on stderr and exits non-zero; best-effort
//! cleanup paths log instead of returning these.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type BockerResult<T> = Result<T, BockerError>;

#[derive(Debug, Error)]
pub enum BockerError {
    /// Missing or invalid arguments, caught before any resource is touched.
    #[error("{0}")]
    Usage(String),

    /// Image or container id not present in the store.
    #[error("no image or container named '{0}' exists")]
    NoSuchEntity(String),

    /// Freshly generated ids kept landing on existing volumes.
    #[error("could not allocate a free id after {0} attempts")]
    IdCollision(usize),

    /// Volume or metadata operation failed in the store.
    #[error("store failure: {0}")]
    Store(String),

    /// Network or HTTP failure while fetching an image archive.
    #[error("image acquisition failed: {0}")]
    Acquisition(String),

    /// Archive fetched but its contents are not a usable image.
    #[error("malformed image: {0}")]
    MalformedImage(String),

    /// A veth/bridge/netns step failed during container setup.
    #[error("network setup failed: {0}")]
    NetworkSetup(String),

    /// Cgroup create/configure/exec failed.
    #[error("cgroup failure: {0}")]
    Cgroup(String),

    /// Exec target exists on disk but has no live process to join.
    #[error("container '{0}' exists but is not running")]
    NotRunning(String),

    /// Container exists but never produced a log file.
    #[error("container '{0}' has no log")]
    NoLog(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

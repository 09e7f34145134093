//! Error types for keyspan

use std::fmt;

/// Result type alias for keyspan operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for keyspan
#[derive(Debug)]
pub enum Error {
    /// Configuration errors
    Config(String),
    /// Locator/metadata lookup failure (RPC error, bad response)
    Lookup(String),
    /// Load balancer service failure
    LoadBalancer(String),
    /// A dispatched overflow task failed during either phase
    Task(String),
    /// Scale-out index not registered
    IndexNotFound(String),
    /// Partition not found in the catalog or store
    PartitionNotFound(String),
    /// Requested read time is newer than the store's committed state
    FutureReadTime { requested: u64, committed: u64 },
    /// Operation timed out
    Timeout,
    /// An overflow cycle is already in progress on this node
    OverflowInProgress,
    /// Shutdown was requested while the controller was blocked
    Shutdown,
    /// Internal error
    Internal(String),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Lookup(msg) => write!(f, "Locator lookup error: {}", msg),
            Error::LoadBalancer(msg) => write!(f, "Load balancer error: {}", msg),
            Error::Task(msg) => write!(f, "Task execution error: {}", msg),
            Error::IndexNotFound(name) => write!(f, "Scale-out index not found: {}", name),
            Error::PartitionNotFound(name) => write!(f, "Partition not found: {}", name),
            Error::FutureReadTime {
                requested,
                committed,
            } => write!(
                f,
                "Read time {} is ahead of committed time {}",
                requested, committed
            ),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::OverflowInProgress => {
                write!(f, "An overflow cycle is already in progress")
            }
            Error::Shutdown => write!(f, "Shutdown requested"),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl Error {
    /// True for failures of an optional collaborator (locator, load balancer)
    /// that the controller recovers from by skipping the step for one cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Lookup(_) | Error::LoadBalancer(_) | Error::Timeout
        )
    }
}

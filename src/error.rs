//! Error types shared by discovery, probing and reconciliation.

/// Errors produced while discovering, probing or persisting third components.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The component spec cannot be served (no or conflicting endpoint source).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The object addressed by a read or write does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// A write lost an optimistic-concurrency race.
    #[error("conflict writing {0}")]
    Conflict(String),

    /// A backing store or watch could not be reached.
    #[error("backing store unavailable: {0}")]
    Unavailable(String),

    /// The static endpoint registry failed.
    #[error("endpoint registry error: {0}")]
    Registry(String),

    /// A probe could not reach its target after retrying.
    #[error("probe transport error: {0}")]
    ProbeTransport(String),

    /// An operation exceeded its deadline.
    #[error("{0} timed out")]
    Timeout(String),

    /// Any other Kubernetes API failure.
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    /// A payload could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Returns `true` when the error means the target object is gone.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns `true` when the error is an optimistic-concurrency conflict.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

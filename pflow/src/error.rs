//! Error types shared across the reconstruction engine.

use thiserror::Error;

/// Catch-all error for this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// A value was read before it had been set, or a calculator was used before its
    /// configuration completed.
    #[error("not initialized: {0}")]
    NotInitialized(&'static str),
    /// A geometry, settings or runtime value is outside its allowed range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// A mutation was attempted in a phase that forbids it.
    #[error("operation not allowed: {0}")]
    NotAllowed(&'static str),
    /// A list or map key was absent.
    #[error("no entry for key: {0}")]
    OutOfRange(String),
    /// A calo hit would have become a member of two clusters at once.
    #[error("calo hit already belongs to another cluster")]
    ClusterHitOverlap,
    /// Internal consistency violation.
    #[error("internal failure: {0}")]
    Failure(String),
    /// Error that does not originate from this crate.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

//! Error types shared by every layer of the engine.
//!
//! All failures are surfaced as values; policy outcomes (`Forbidden`,
//! `NotFound`, ...) are ordinary variants, never panics. The variant set
//! mirrors the error codes exposed at the volume boundary.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type GeofsResult<T> = Result<T, GeofsError>;

/// Unified error type for the storage engine, VFS and governor.
#[derive(Debug, Error)]
pub enum GeofsError {
    /// The named path, view or record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The target already exists and the operation refuses to replace it.
    #[error("already exists: {0}")]
    Exists(String),

    /// The backing store failed; the operation committed nothing.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A byte budget would be crossed. Nothing is ever overwritten to
    /// make room.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The filesystem leaves this operation unset.
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    /// Contract failure on the caller's side; never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The per-operation deadline expired before the commit point.
    #[error("deadline exceeded during {0}")]
    DeadlineExceeded(&'static str),

    /// Attempt to mutate a view that has already been sealed.
    #[error("view {0} is sealed")]
    SealedView(u64),

    /// The request is architecturally impossible in this system
    /// (destructive operation, governor decline).
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// On-disk state violates an engine invariant. The volume halts
    /// rather than continue inconsistently.
    #[error("corrupt volume state: {0}")]
    Corrupt(String),
}

impl GeofsError {
    /// Stable short code for logs and audit records.
    pub fn code(&self) -> &'static str {
        match self {
            GeofsError::NotFound(_) => "not-found",
            GeofsError::Exists(_) => "exists",
            GeofsError::Io(_) => "io-error",
            GeofsError::QuotaExceeded(_) => "quota-exceeded",
            GeofsError::NotSupported(_) => "not-supported",
            GeofsError::InvalidArgument(_) => "invalid-argument",
            GeofsError::DeadlineExceeded(_) => "deadline-exceeded",
            GeofsError::SealedView(_) => "sealed-view",
            GeofsError::Forbidden(_) => "forbidden",
            GeofsError::Corrupt(_) => "corrupt",
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        GeofsError::NotFound(what.into())
    }

    pub fn invalid(what: impl Into<String>) -> Self {
        GeofsError::InvalidArgument(what.into())
    }

    /// True for transient environmental failures that a caller may retry
    /// with a fresh deadline.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GeofsError::Io(_) | GeofsError::QuotaExceeded(_) | GeofsError::DeadlineExceeded(_)
        )
    }
}

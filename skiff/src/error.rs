//! Error types for image-store operations.

/// Alias for `Result<T, skiff::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the image and content stores.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A malformed reference, digest, platform, or size was supplied.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The reference or content does not exist locally.
    #[error("not found: {0}")]
    NotFound(String),

    /// The reference or content already exists.
    #[error("already exists: {0}")]
    Exists(String),

    /// An operation was invoked on a session or store in an incompatible
    /// state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A media type or artifact kind this store does not handle.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The operation was cancelled cooperatively.
    #[error("operation cancelled")]
    Cancelled,

    /// The caller-supplied deadline expired.
    #[error("operation timed out")]
    Timeout,

    /// A blocking call was interrupted by a signal.
    #[error("operation interrupted")]
    Interrupted,

    /// A model or transport error from the OCI layer.
    #[error(transparent)]
    Oci(#[from] skiff_oci::Error),

    /// A failure while writing an ext4 image.
    #[error(transparent)]
    Ext4(#[from] skiff_ext4::Error),

    /// Filesystem I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Invariant violation or unclassified failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns `true` when the error means "content already present",
    /// which push flows treat as success.
    pub fn is_exists(&self) -> bool {
        matches!(self, Self::Exists(_)) || matches!(self, Self::Oci(skiff_oci::Error::Exists(_)))
    }

    /// Returns `true` for missing references or content.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
            || matches!(self, Self::Oci(skiff_oci::Error::NotFound(_)))
    }
}

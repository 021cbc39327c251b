//! OCI image model and content clients for the skiff micro-VM sandbox.
//!
//! Provides the data model (digests, descriptors, references, manifests)
//! and the two content transports the image store is built on:
//!
//! ```text
//! ContentClient (capability trait)
//!  ├── RegistryClient — OCI distribution spec over HTTP/1.1
//!  └── LayoutClient   — OCI image-layout directory on disk
//! ```
//!
//! The image store in the `skiff` crate never names a concrete backend;
//! everything it needs is expressed through [`ContentClient`].

mod client;
mod descriptor;
mod digest;
mod layout;
mod manifest;
mod progress;
mod reference;
mod registry;

pub use client::{ContentClient, PushSource};
pub use descriptor::{Descriptor, Platform};
pub use digest::{Digest, DigestWriter};
pub use layout::LayoutClient;
pub use manifest::{Index, ImageConfig, Manifest, RootFs, RuntimeConfig, media_types};
pub use progress::{ProgressEvent, ProgressHandler, emit};
pub use reference::Reference;
pub use registry::{BasicAuth, RegistryClient, RegistryConfig, RetryPolicy};

/// Result type for skiff-oci operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from OCI model and transport operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A malformed reference, digest, or media type was supplied.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The reference or content does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Content being created or pushed is already present.
    ///
    /// Push callers treat this as success once progress is accounted.
    #[error("already exists: {0}")]
    Exists(String),

    /// A media type or artifact kind this library does not handle.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The remote answered with an unexpected HTTP status.
    #[error("invalid status {status} for {url}")]
    InvalidStatus {
        /// HTTP status code returned by the server.
        status: u16,
        /// Request URL that produced the status.
        url: String,
    },

    /// Received or computed content does not match the expected digest.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// The digest the descriptor promised.
        expected: String,
        /// The digest computed from the received bytes.
        actual: String,
    },

    /// Token negotiation with the registry failed.
    #[error("registry authentication failed: {0}")]
    Auth(String),

    /// Transport-level HTTP failure.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Filesystem I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON serialization failure.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Invariant violation or unclassified failure.
    #[error("internal error: {0}")]
    Internal(String),
}

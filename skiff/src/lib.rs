//! Container image preparation for micro-VM hosts.
//!
//! `skiff` manages OCI images on a host that runs each container inside
//! a lightweight virtual machine: it pulls, pushes, imports, exports,
//! tags, and garbage-collects content-addressed images, and turns their
//! layers into mountable ext4 block images.
//!
//! # Quick start
//!
//! ```no_run
//! use skiff::{ImageStore, Platform, RegistryClient, RegistryConfig};
//!
//! # async fn demo() -> skiff::Result<()> {
//! let store = ImageStore::new("/var/lib/skiff")?;
//! let registry = RegistryClient::new("registry-1.docker.io", RegistryConfig::default())?;
//! let image = store
//!     .pull("alpine:3.20", &registry, Some(&Platform::linux_arm64()), None)
//!     .await?;
//! store
//!     .unpack(image.reference(), &Platform::linux_arm64(), "/tmp/alpine.ext4".as_ref(), None)
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod content;
mod error;
mod lock;
mod state;
mod store;

pub use content::{ContentHandle, ContentStore, IngestSession};
pub use error::{Error, Result};
pub use lock::{AsyncLock, LockGuard};
pub use store::{Image, ImageStore};

pub use skiff_oci::{
    ContentClient, Descriptor, Digest, ImageConfig, Index, LayoutClient, Manifest, Platform,
    ProgressEvent, ProgressHandler, PushSource, Reference, RegistryClient, RegistryConfig,
    RuntimeConfig, media_types,
};

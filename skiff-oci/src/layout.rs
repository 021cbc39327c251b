//! Content client backed by an OCI image-layout directory.
//!
//! ```text
//! <root>/oci-layout                JSON: {"imageLayoutVersion":"1.0.0"}
//! <root>/index.json                OCI Index of top-level manifests
//! <root>/blobs/sha256/<64-hex>     raw blob bytes
//! ```
//!
//! Implements the same [`ContentClient`] surface as the registry client,
//! so the image store can import from and export to a directory without
//! knowing it is one.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{
    ContentClient, Descriptor, Digest, Error, Index, ProgressEvent, ProgressHandler, PushSource,
    Result, emit,
};

/// Annotation keys that may carry the source image reference, in
/// descending preference.
pub const IMAGE_REFERENCE_KEYS: [&str; 3] = [
    "com.apple.containerization.image.name",
    "io.containerd.image.name",
    "org.opencontainers.image.ref.name",
];

const LAYOUT_FILE: &str = "oci-layout";
const INDEX_FILE: &str = "index.json";
const LAYOUT_VERSION: &str = "1.0.0";

/// The `oci-layout` marker document.
#[derive(Debug, Serialize, Deserialize)]
struct LayoutMarker {
    #[serde(rename = "imageLayoutVersion")]
    image_layout_version: String,
}

/// An OCI image-layout directory.
#[derive(Debug, Clone)]
pub struct LayoutClient {
    root: PathBuf,
}

impl LayoutClient {
    /// Creates (or completes) a layout directory at `root`.
    pub async fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join("blobs").join("sha256")).await?;
        let marker = serde_json::to_vec(&LayoutMarker {
            image_layout_version: LAYOUT_VERSION.to_owned(),
        })?;
        tokio::fs::write(root.join(LAYOUT_FILE), marker).await?;
        let client = Self { root };
        if tokio::fs::metadata(client.root.join(INDEX_FILE)).await.is_err() {
            client.write_index(&Index::new(Vec::new())).await?;
        }
        Ok(client)
    }

    /// Opens an existing layout directory, validating the marker file.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let raw = tokio::fs::read(root.join(LAYOUT_FILE))
            .await
            .map_err(|_| Error::NotFound(format!("{}: not an OCI layout", root.display())))?;
        let marker: LayoutMarker = serde_json::from_slice(&raw)?;
        if marker.image_layout_version != LAYOUT_VERSION {
            return Err(Error::Unsupported(format!(
                "image layout version {}",
                marker.image_layout_version
            )));
        }
        Ok(Self { root })
    }

    /// The layout's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reads `index.json`.
    pub async fn index(&self) -> Result<Index> {
        let raw = tokio::fs::read(self.root.join(INDEX_FILE)).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Writes `index.json`.
    pub async fn write_index(&self, index: &Index) -> Result<()> {
        let data = serde_json::to_vec_pretty(index)?;
        tokio::fs::write(self.root.join(INDEX_FILE), data).await?;
        Ok(())
    }

    /// The on-disk path for a blob.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("blobs").join("sha256").join(digest.hex())
    }

    /// Stamps `reference` onto a descriptor under every known key.
    pub fn set_image_reference_annotation(descriptor: &mut Descriptor, reference: &str) {
        for key in IMAGE_REFERENCE_KEYS {
            descriptor.set_annotation(key, reference);
        }
    }

    /// Reads the most-preferred reference annotation present.
    pub fn image_reference_from_descriptor(descriptor: &Descriptor) -> Option<&str> {
        IMAGE_REFERENCE_KEYS
            .iter()
            .find_map(|key| descriptor.annotation(key))
    }
}

impl ContentClient for LayoutClient {
    async fn resolve(&self, _name: &str, reference: &str) -> Result<Descriptor> {
        let index = self.index().await?;
        let found = index.manifests.iter().find(|descriptor| {
            Self::image_reference_from_descriptor(descriptor) == Some(reference)
                || descriptor.digest.to_string() == reference
        });
        found
            .cloned()
            .ok_or_else(|| Error::NotFound(reference.to_owned()))
    }

    async fn fetch_data(&self, _name: &str, descriptor: &Descriptor) -> Result<Vec<u8>> {
        let path = self.blob_path(&descriptor.digest);
        let data = tokio::fs::read(&path)
            .await
            .map_err(|_| Error::NotFound(descriptor.digest.to_string()))?;
        let actual = Digest::compute(&data);
        if actual != descriptor.digest {
            return Err(Error::DigestMismatch {
                expected: descriptor.digest.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(data)
    }

    async fn fetch_blob(
        &self,
        _name: &str,
        descriptor: &Descriptor,
        dest: &Path,
        progress: Option<&ProgressHandler>,
    ) -> Result<(u64, Digest)> {
        let path = self.blob_path(&descriptor.digest);
        let mut src = tokio::fs::File::open(&path)
            .await
            .map_err(|_| Error::NotFound(descriptor.digest.to_string()))?;
        let mut dst = tokio::fs::File::create(dest).await?;
        let mut hasher = Sha256::new();
        let mut size: u64 = 0;
        let mut buf = vec![0u8; 128 * 1024];
        loop {
            let n = src.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            dst.write_all(&buf[..n]).await?;
            size += n as u64;
            emit(progress, &[ProgressEvent::AddSize(n as u64)]);
        }
        dst.flush().await?;

        let actual = Digest::from_hex(&hex::encode(hasher.finalize()))?;
        if actual != descriptor.digest {
            let _ = tokio::fs::remove_file(dest).await;
            return Err(Error::DigestMismatch {
                expected: descriptor.digest.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok((size, actual))
    }

    async fn push(
        &self,
        _name: &str,
        _reference: &str,
        descriptor: &Descriptor,
        source: PushSource,
        progress: Option<&ProgressHandler>,
    ) -> Result<()> {
        let done = |progress| {
            emit(
                progress,
                &[
                    ProgressEvent::AddItems(1),
                    ProgressEvent::AddSize(descriptor.size.max(0) as u64),
                ],
            );
        };

        let final_path = self.blob_path(&descriptor.digest);
        if tokio::fs::metadata(&final_path).await.is_ok() {
            done(progress);
            return Err(Error::Exists(descriptor.digest.to_string()));
        }

        // Stage beside the target so the final rename is atomic.
        let staging = final_path.with_extension("tmp");
        let data = source.read_all().await?;
        let actual = Digest::compute(&data);
        if actual != descriptor.digest {
            return Err(Error::DigestMismatch {
                expected: descriptor.digest.to_string(),
                actual: actual.to_string(),
            });
        }
        tokio::fs::write(&staging, &data).await?;
        tokio::fs::rename(&staging, &final_path).await?;

        done(progress);
        Ok(())
    }
}

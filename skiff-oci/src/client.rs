//! The capability trait shared by every content backend.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio::io::AsyncReadExt;

use crate::{Descriptor, Digest, ProgressHandler, Result};

/// A replayable source for push bodies.
///
/// Retries must be able to produce a fresh stream for every attempt, so
/// callers hand over a source rather than a one-shot stream. Files are
/// reopened per attempt and never buffered.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum PushSource {
    /// Stream the contents of a file.
    File(PathBuf),
    /// Send an in-memory document (manifests, configs).
    Bytes(Vec<u8>),
}

impl PushSource {
    /// Opens a fresh request body for one upload attempt.
    pub async fn body(&self) -> Result<reqwest::Body> {
        match self {
            Self::Bytes(data) => Ok(reqwest::Body::from(data.clone())),
            Self::File(path) => {
                let file = tokio::fs::File::open(path).await?;
                let stream = futures_util::stream::try_unfold(file, |mut file| async move {
                    let mut buf = vec![0u8; 64 * 1024];
                    let n = file.read(&mut buf).await?;
                    if n == 0 {
                        Ok::<_, std::io::Error>(None)
                    } else {
                        buf.truncate(n);
                        Ok(Some((Bytes::from(buf), file)))
                    }
                });
                Ok(reqwest::Body::wrap_stream(stream))
            }
        }
    }

    /// Reads the full contents, for local (non-HTTP) backends.
    pub async fn read_all(&self) -> Result<Vec<u8>> {
        match self {
            Self::Bytes(data) => Ok(data.clone()),
            Self::File(path) => Ok(tokio::fs::read(path).await?),
        }
    }

    /// Byte length of the source.
    pub async fn len(&self) -> Result<u64> {
        match self {
            Self::Bytes(data) => Ok(data.len() as u64),
            Self::File(path) => Ok(tokio::fs::metadata(path).await?.len()),
        }
    }

    /// Returns `true` for an empty source.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

/// Capabilities every content backend provides: resolve a name to a root
/// descriptor, fetch content, and push content.
///
/// The image store is generic over this trait and never names a concrete
/// backend.
#[allow(async_fn_in_trait)]
pub trait ContentClient {
    /// Resolves `reference` (tag or digest) under repository `name` to a
    /// root descriptor.
    async fn resolve(&self, name: &str, reference: &str) -> Result<Descriptor>;

    /// Fetches the content a descriptor names into memory.
    ///
    /// Intended for manifests and configs; implementations enforce a
    /// buffer limit and verify the digest.
    async fn fetch_data(&self, name: &str, descriptor: &Descriptor) -> Result<Vec<u8>>;

    /// Fetches and decodes a JSON document.
    async fn fetch<T: DeserializeOwned>(&self, name: &str, descriptor: &Descriptor) -> Result<T> {
        let data = self.fetch_data(name, descriptor).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Streams a blob to `dest`, hashing incrementally, and returns the
    /// byte count and computed digest.
    ///
    /// Fails with a digest mismatch (and removes `dest`) if the stream
    /// does not hash to the descriptor's digest.
    async fn fetch_blob(
        &self,
        name: &str,
        descriptor: &Descriptor,
        dest: &Path,
        progress: Option<&ProgressHandler>,
    ) -> Result<(u64, Digest)>;

    /// Pushes content for a descriptor.
    ///
    /// `reference` carries the tag (or `name@digest`) for manifest-like
    /// content; blobs ignore it. Fails with [`crate::Error::Exists`] when
    /// the target already holds matching content — callers treat that as
    /// success once progress is accounted.
    async fn push(
        &self,
        name: &str,
        reference: &str,
        descriptor: &Descriptor,
        source: PushSource,
        progress: Option<&ProgressHandler>,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_source_bytes_len() {
        let source = PushSource::Bytes(b"hello".to_vec());
        assert_eq!(source.len().await.unwrap(), 5);
        assert!(!source.is_empty().await.unwrap());
        assert_eq!(source.read_all().await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn push_source_file_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        tokio::fs::write(&path, b"replayable").await.unwrap();
        let source = PushSource::File(path);
        // two bodies from the same source, as a retry would need
        let _first = source.body().await.unwrap();
        let _second = source.body().await.unwrap();
        assert_eq!(source.len().await.unwrap(), 10);
        assert_eq!(source.read_all().await.unwrap(), b"replayable");
    }
}

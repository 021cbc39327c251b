//! Content-addressed blob storage with staged ingest sessions.
//!
//! Blobs live at `blobs/sha256/<hex>` where the file name is the digest
//! of the file's bytes — that equality is the store's only invariant.
//! New content lands in per-session staging directories under `ingest/`
//! and is promoted atomically on commit, so readers never observe
//! partial blobs.

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use skiff_oci::Digest;

use crate::{Error, Result};

const BLOBS_DIR: &str = "blobs/sha256";
const INGEST_DIR: &str = "ingest";

/// Content-addressed blob store rooted at a directory.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

/// Lazy access to one committed blob.
#[derive(Debug, Clone)]
pub struct ContentHandle {
    digest: Digest,
    path: PathBuf,
    size: u64,
}

impl ContentHandle {
    /// The blob's digest.
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Absolute path of the blob file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the blob in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Reads the full blob into memory.
    pub async fn bytes(&self) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(&self.path).await?)
    }

    /// Reads and decodes the blob as JSON.
    pub async fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.bytes().await?)?)
    }
}

/// An open staging area for incoming content.
///
/// The staging directory exists exactly while the session is open.
/// Dropping an uncommitted session removes it, so a cancelled pull
/// cannot leave partial blobs behind.
#[derive(Debug)]
pub struct IngestSession {
    id: String,
    dir: PathBuf,
    committed: bool,
}

impl IngestSession {
    /// Session identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The staging directory; the caller may write arbitrary files here.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Drop for IngestSession {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }
}

impl ContentStore {
    /// Opens (or creates) a content store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join(BLOBS_DIR))?;
        std::fs::create_dir_all(root.join(INGEST_DIR))?;
        Ok(Self { root })
    }

    /// The path a blob with `digest` would live at.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join(BLOBS_DIR).join(digest.hex())
    }

    /// Looks up a blob; absent content yields `None`.
    pub async fn get(&self, digest: &Digest) -> Result<Option<ContentHandle>> {
        let path = self.blob_path(digest);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(Some(ContentHandle {
                digest: digest.clone(),
                path,
                size: meta.len(),
            })),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Opens a fresh, isolated ingest session.
    pub async fn new_ingest_session(&self) -> Result<IngestSession> {
        let id = session_id();
        let dir = self.root.join(INGEST_DIR).join(&id);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(IngestSession {
            id,
            dir,
            committed: false,
        })
    }

    /// Promotes every staged file whose name is a 64-hex digest into the
    /// blob tree, then removes the staging directory.
    ///
    /// A staged file whose target already exists is discarded — the
    /// content is already present. Returns the digests committed.
    pub async fn complete_ingest_session(
        &self,
        session: &mut IngestSession,
    ) -> Result<Vec<Digest>> {
        if session.committed {
            return Err(Error::InvalidState(format!(
                "ingest session {} already committed",
                session.id
            )));
        }

        let mut committed = Vec::new();
        let mut entries = tokio::fs::read_dir(&session.dir)
            .await
            .map_err(|e| Error::Internal(format!("reading staging dir: {e}")))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Internal(format!("reading staging dir: {e}")))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(digest) = Digest::from_hex(name) else {
                continue;
            };
            let target = self.blob_path(&digest);
            if tokio::fs::metadata(&target).await.is_ok() {
                tokio::fs::remove_file(entry.path())
                    .await
                    .map_err(|e| Error::Internal(format!("discarding duplicate blob: {e}")))?;
            } else {
                tokio::fs::rename(entry.path(), &target)
                    .await
                    .map_err(|e| Error::Internal(format!("promoting blob {name}: {e}")))?;
            }
            committed.push(digest);
        }

        tokio::fs::remove_dir_all(&session.dir)
            .await
            .map_err(|e| Error::Internal(format!("removing staging dir: {e}")))?;
        session.committed = true;
        tracing::debug!(session = %session.id, blobs = committed.len(), "ingest committed");
        Ok(committed)
    }

    /// Discards a session and its staged files.
    pub async fn cancel_ingest_session(&self, session: IngestSession) -> Result<()> {
        tokio::fs::remove_dir_all(&session.dir).await?;
        // the Drop impl would remove it again; mark done
        let mut session = session;
        session.committed = true;
        Ok(())
    }

    /// Runs `body` with a staging directory, committing on success and
    /// cancelling on error.
    pub async fn ingest<T, F, Fut>(&self, body: F) -> Result<T>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut session = self.new_ingest_session().await?;
        match body(session.dir.clone()).await {
            Ok(value) => {
                self.complete_ingest_session(&mut session).await?;
                Ok(value)
            }
            Err(err) => {
                self.cancel_ingest_session(session).await?;
                Err(err)
            }
        }
    }

    /// Removes every blob whose hex digest is not in `keeping`.
    ///
    /// Must be called while holding the image-store lock; concurrent
    /// pulls could otherwise commit content the caller never saw.
    pub async fn delete(&self, keeping: &HashSet<String>) -> Result<(Vec<String>, u64)> {
        let mut deleted = Vec::new();
        let mut freed: u64 = 0;
        let mut entries = tokio::fs::read_dir(self.root.join(BLOBS_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if keeping.contains(name) {
                continue;
            }
            let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            tokio::fs::remove_file(entry.path()).await?;
            freed += size;
            deleted.push(name.to_owned());
        }
        tracing::debug!(blobs = deleted.len(), bytes = freed, "content deleted");
        Ok((deleted, freed))
    }
}

/// Generates a 16-character hex session identifier.
fn session_id() -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    use std::time::{SystemTime, UNIX_EPOCH};

    let mut h = RandomState::new().build_hasher();
    h.write_u64(u64::from(std::process::id()));
    h.write_u128(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos(),
    );
    format!("{:016x}", h.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_HEX: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    fn store() -> (tempfile::TempDir, ContentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn ingest_commit_makes_content_visible() {
        let (_dir, store) = store();

        // stage under a placeholder name, rename to the digest, commit
        let mut session = store.new_ingest_session().await.unwrap();
        let placeholder = session.dir().join("a".repeat(64));
        tokio::fs::write(&placeholder, b"hello").await.unwrap();
        let digest = Digest::compute(b"hello");
        tokio::fs::rename(&placeholder, session.dir().join(digest.hex()))
            .await
            .unwrap();

        let digest = Digest::parse(&format!("sha256:{HELLO_HEX}")).unwrap();
        assert!(store.get(&digest).await.unwrap().is_none());
        let committed = store.complete_ingest_session(&mut session).await.unwrap();
        assert_eq!(committed, vec![digest.clone()]);

        let handle = store.get(&digest).await.unwrap().unwrap();
        assert_eq!(handle.bytes().await.unwrap(), b"hello");
        assert_eq!(handle.size(), 5);
        assert!(!session.dir().exists());
    }

    #[tokio::test]
    async fn commit_skips_non_hex_names_and_duplicates() {
        let (_dir, store) = store();

        let payload = b"dup";
        let digest = Digest::compute(payload);
        store
            .ingest(|staging| async move {
                tokio::fs::write(staging.join(digest.hex()), payload).await?;
                Ok(())
            })
            .await
            .unwrap();

        let mut session = store.new_ingest_session().await.unwrap();
        tokio::fs::write(session.dir().join("notes.txt"), b"scratch")
            .await
            .unwrap();
        let digest = Digest::compute(payload);
        tokio::fs::write(session.dir().join(digest.hex()), payload)
            .await
            .unwrap();
        let committed = store.complete_ingest_session(&mut session).await.unwrap();
        // the duplicate still reports as committed, the scratch file is gone
        assert_eq!(committed, vec![digest.clone()]);
        assert!(store.get(&digest).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cancel_removes_staging() {
        let (dir, store) = store();
        let session = store.new_ingest_session().await.unwrap();
        let staging = session.dir().to_path_buf();
        tokio::fs::write(staging.join("partial"), b"bytes")
            .await
            .unwrap();
        store.cancel_ingest_session(session).await.unwrap();
        assert!(!staging.exists());
        // blobs dir untouched
        assert!(dir.path().join(BLOBS_DIR).exists());
    }

    #[tokio::test]
    async fn drop_cancels_uncommitted_session() {
        let (_dir, store) = store();
        let staging = {
            let session = store.new_ingest_session().await.unwrap();
            tokio::fs::write(session.dir().join("partial"), b"bytes")
                .await
                .unwrap();
            session.dir().to_path_buf()
        };
        assert!(!staging.exists());
    }

    #[tokio::test]
    async fn ingest_combinator_cancels_on_error() {
        let (_dir, store) = store();
        let digest = Digest::compute(b"doomed");
        let result: Result<()> = store
            .ingest(|staging| async move {
                tokio::fs::write(staging.join(digest.hex()), b"doomed").await?;
                Err(Error::Internal("builder failed".into()))
            })
            .await;
        assert!(result.is_err());
        assert!(store.get(&Digest::compute(b"doomed")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn double_commit_is_invalid_state() {
        let (_dir, store) = store();
        let mut session = store.new_ingest_session().await.unwrap();
        store.complete_ingest_session(&mut session).await.unwrap();
        let err = store.complete_ingest_session(&mut session).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn delete_keeps_requested_blobs() {
        let (_dir, store) = store();
        for payload in [b"one".as_slice(), b"two", b"three"] {
            let digest = Digest::compute(payload);
            store
                .ingest(|staging| async move {
                    tokio::fs::write(staging.join(digest.hex()), payload).await?;
                    Ok(())
                })
                .await
                .unwrap();
        }

        let keep = Digest::compute(b"two");
        let keeping: HashSet<String> = [keep.hex().to_owned()].into();
        let (deleted, freed) = store.delete(&keeping).await.unwrap();
        assert_eq!(deleted.len(), 2);
        assert_eq!(freed, 8); // "one" + "three"
        assert!(store.get(&keep).await.unwrap().is_some());
        assert!(store.get(&Digest::compute(b"one")).await.unwrap().is_none());
    }
}

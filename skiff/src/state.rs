//! The reference→descriptor index persisted at `state.json`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use skiff_oci::Descriptor;

use crate::Result;

const STATE_FILE: &str = "state.json";

/// In-memory snapshot of the persisted reference index.
///
/// Mutations reload from disk, apply, and rewrite atomically (temp file
/// then rename); callers serialize mutations with the store lock.
#[derive(Debug)]
pub(crate) struct ReferenceIndex {
    path: PathBuf,
    entries: HashMap<String, Descriptor>,
}

impl ReferenceIndex {
    /// Loads the index from `root/state.json`; a missing file is empty.
    pub(crate) fn load(root: &Path) -> Result<Self> {
        let path = root.join(STATE_FILE);
        let entries = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self { path, entries })
    }

    /// Re-reads the file, discarding the in-memory snapshot.
    pub(crate) fn reload(&mut self) -> Result<()> {
        let fresh = Self::load(self.path.parent().unwrap_or(Path::new(".")))?;
        self.entries = fresh.entries;
        Ok(())
    }

    pub(crate) fn get(&self, reference: &str) -> Option<&Descriptor> {
        self.entries.get(reference)
    }

    pub(crate) fn list(&self) -> impl Iterator<Item = (&String, &Descriptor)> {
        self.entries.iter()
    }

    pub(crate) fn insert(&mut self, reference: String, descriptor: Descriptor) {
        self.entries.insert(reference, descriptor);
    }

    pub(crate) fn remove(&mut self, reference: &str) -> Option<Descriptor> {
        self.entries.remove(reference)
    }

    /// Writes the index atomically: temp file in the same directory,
    /// then rename over `state.json`.
    pub(crate) fn save(&self) -> Result<()> {
        let data = serde_json::to_vec_pretty(&self.entries)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_oci::{Digest, media_types};

    fn descriptor() -> Descriptor {
        Descriptor::new(media_types::INDEX, Digest::compute(b"{}"), 2)
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let index = ReferenceIndex::load(dir.path()).unwrap();
        assert_eq!(index.list().count(), 0);
    }

    #[test]
    fn save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = ReferenceIndex::load(dir.path()).unwrap();
        index.insert("ghcr.io/org/app:v1".into(), descriptor());
        index.save().unwrap();

        let reloaded = ReferenceIndex::load(dir.path()).unwrap();
        assert_eq!(
            reloaded.get("ghcr.io/org/app:v1").unwrap().digest,
            descriptor().digest
        );
        // no temp file left behind
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn remove_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = ReferenceIndex::load(dir.path()).unwrap();
        index.insert("a:latest".into(), descriptor());
        index.insert("b:latest".into(), descriptor());
        index.save().unwrap();

        index.remove("a:latest");
        index.save().unwrap();

        let mut reloaded = ReferenceIndex::load(dir.path()).unwrap();
        assert!(reloaded.get("a:latest").is_none());
        assert!(reloaded.get("b:latest").is_some());
        reloaded.reload().unwrap();
        assert!(reloaded.get("b:latest").is_some());
    }
}

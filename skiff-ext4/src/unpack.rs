//! Applying OCI tar layers to an [`Ext4Writer`].
//!
//! Layers are applied in order. Whiteout entries delete lower-layer
//! content instead of materializing:
//! - `.wh.<name>` removes the named sibling.
//! - `.wh..wh..opq` clears the parent directory before this layer's
//!   entries apply.

use std::io::Read;

use tar::{Archive, EntryType};

use crate::fs::{Attrs, Ext4Writer};
use crate::layout::file_mode;
use crate::{Error, Result};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_MARKER: &str = ".wh..wh..opq";

impl Ext4Writer {
    /// Applies one tar layer on top of the current tree.
    pub fn append_layer(&mut self, reader: impl Read) -> Result<()> {
        let mut archive = Archive::new(reader);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            let (parent, name) = split_path(&path);

            if name == OPAQUE_MARKER {
                self.clear_directory(parent)?;
                continue;
            }
            if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
                let target = if parent.is_empty() {
                    hidden.to_owned()
                } else {
                    format!("{parent}/{hidden}")
                };
                self.remove_entry(&target)?;
                continue;
            }

            let attrs = Attrs {
                mode: (entry.header().mode()? & 0o7777) as u16,
                uid: entry.header().uid()? as u32,
                gid: entry.header().gid()? as u32,
                mtime: entry.header().mtime()?.min(u64::from(u32::MAX)) as u32,
                xattrs: pax_xattrs(&mut entry)?,
            };

            match entry.header().entry_type() {
                EntryType::Directory => self.add_directory(&path, &attrs)?,
                EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
                    let size = entry.header().size()?;
                    self.add_file(&path, &attrs, &mut entry, size)?;
                }
                EntryType::Symlink => {
                    let target = entry
                        .link_name_bytes()
                        .ok_or_else(|| Error::Corrupt(format!("symlink {path} has no target")))?
                        .into_owned();
                    self.add_symlink(&path, &target, &attrs)?;
                }
                EntryType::Link => {
                    let target = entry
                        .link_name_bytes()
                        .ok_or_else(|| Error::Corrupt(format!("hardlink {path} has no target")))?;
                    let target = String::from_utf8_lossy(&target).into_owned();
                    self.add_hardlink(&path, &target)?;
                }
                EntryType::Char => {
                    let rdev = device_numbers(&entry)?;
                    self.add_special(&path, file_mode::S_IFCHR, rdev, &attrs)?;
                }
                EntryType::Block => {
                    let rdev = device_numbers(&entry)?;
                    self.add_special(&path, file_mode::S_IFBLK, rdev, &attrs)?;
                }
                EntryType::Fifo => {
                    self.add_special(&path, file_mode::S_IFIFO, None, &attrs)?;
                }
                // pax metadata is consumed through the entry API
                _ => {}
            }
        }
        Ok(())
    }
}

/// Splits a tar path into (parent, basename), both without trailing
/// slashes.
fn split_path(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    let trimmed = trimmed.strip_prefix("./").unwrap_or(trimmed);
    match trimmed.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", trimmed),
    }
}

/// Extracts `SCHILY.xattr.*` records from an entry's PAX extensions.
fn pax_xattrs<R: Read>(entry: &mut tar::Entry<'_, R>) -> Result<Vec<(String, Vec<u8>)>> {
    let mut xattrs = Vec::new();
    if let Some(extensions) = entry.pax_extensions()? {
        for extension in extensions {
            let extension = extension?;
            let Ok(key) = extension.key() else { continue };
            if let Some(name) = key.strip_prefix("SCHILY.xattr.") {
                xattrs.push((name.to_owned(), extension.value_bytes().to_vec()));
            }
        }
    }
    Ok(xattrs)
}

fn device_numbers<R: Read>(entry: &tar::Entry<'_, R>) -> Result<Option<(u32, u32)>> {
    let major = entry.header().device_major()?.unwrap_or(0);
    let minor = entry.header().device_minor()?.unwrap_or(0);
    Ok(Some((major, minor)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_path_forms() {
        assert_eq!(split_path("dir1/file1"), ("dir1", "file1"));
        assert_eq!(split_path("./dir1/sub/"), ("dir1", "sub"));
        assert_eq!(split_path("file"), ("", "file"));
        assert_eq!(split_path("a/b/.wh.c"), ("a/b", ".wh.c"));
    }
}

//! Ext4 block-image creation from OCI tar layers.
//!
//! [`Ext4Writer`] builds a mountable ext4 filesystem inside a sparse
//! file: layer tars are applied in order with OCI whiteout semantics,
//! then [`Ext4Writer::finish`] writes the metadata. [`Ext4Reader`]
//! walks a produced image back, primarily for verification.
//!
//! ```no_run
//! use skiff_ext4::Ext4Writer;
//!
//! # fn demo(layers: Vec<std::fs::File>) -> skiff_ext4::Result<()> {
//! let mut writer = Ext4Writer::create("rootfs.ext4".as_ref(), 1 << 30)?;
//! for layer in layers {
//!     writer.append_layer(layer)?;
//! }
//! writer.finish()?;
//! # Ok(())
//! # }
//! ```

mod bitmap;
mod fs;
pub mod layout;
mod reader;
mod unpack;

pub use fs::{Attrs, Ext4Writer};
pub use layout::Extent;
pub use reader::{Ext4Reader, InodeInfo};

/// Result type for ext4 operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from building or reading ext4 images.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A path, capacity, or link target the writer cannot honor.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The image ran out of blocks or inodes.
    #[error("filesystem full: {0}")]
    Full(String),

    /// Input archive or on-disk structure is malformed.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// A feature outside this writer's coverage.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Filesystem I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod layer_tests {
    use super::*;
    use std::io::Cursor;

    /// Builds an uncompressed tar from (path, kind) specs.
    struct LayerBuilder {
        builder: tar::Builder<Vec<u8>>,
    }

    impl LayerBuilder {
        fn new() -> Self {
            Self {
                builder: tar::Builder::new(Vec::new()),
            }
        }

        fn dir(mut self, path: &str) -> Self {
            let mut header = tar::Header::new_ustar();
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            header.set_mtime(1_700_000_000);
            header.set_uid(0);
            header.set_gid(0);
            self.builder.append_data(&mut header, path, &[][..]).unwrap();
            self
        }

        fn file(mut self, path: &str, data: &[u8]) -> Self {
            let mut header = tar::Header::new_ustar();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(0o644);
            header.set_size(data.len() as u64);
            header.set_mtime(1_700_000_000);
            header.set_uid(0);
            header.set_gid(0);
            self.builder.append_data(&mut header, path, data).unwrap();
            self
        }

        fn file_with_xattrs(mut self, path: &str, data: &[u8], xattrs: &[(&str, &[u8])]) -> Self {
            let pax: Vec<(String, &[u8])> = xattrs
                .iter()
                .map(|(name, value)| (format!("SCHILY.xattr.{name}"), *value))
                .collect();
            self.builder
                .append_pax_extensions(pax.iter().map(|(k, v)| (k.as_str(), *v)))
                .unwrap();
            self.file(path, data)
        }

        fn symlink(mut self, path: &str, target: &str) -> Self {
            let mut header = tar::Header::new_ustar();
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_mode(0o777);
            header.set_size(0);
            header.set_mtime(1_700_000_000);
            header.set_uid(0);
            header.set_gid(0);
            self.builder
                .append_link(&mut header, path, target)
                .unwrap();
            self
        }

        fn hardlink(mut self, path: &str, target: &str) -> Self {
            let mut header = tar::Header::new_ustar();
            header.set_entry_type(tar::EntryType::Link);
            header.set_mode(0o644);
            header.set_size(0);
            header.set_mtime(1_700_000_000);
            header.set_uid(0);
            header.set_gid(0);
            self.builder
                .append_link(&mut header, path, target)
                .unwrap();
            self
        }

        fn build(self) -> Cursor<Vec<u8>> {
            Cursor::new(self.builder.into_inner().unwrap())
        }
    }

    fn write_image(layers: Vec<Cursor<Vec<u8>>>) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.ext4");
        let mut writer = Ext4Writer::create(&path, 64 * 1024 * 1024).unwrap();
        for layer in layers {
            writer.append_layer(layer).unwrap();
        }
        writer.finish().unwrap();
        (dir, path)
    }

    #[test]
    fn whiteout_and_opaque_scenario() {
        // layer 1: dir1/file1 plus stale content under dir2
        let layer1 = LayerBuilder::new()
            .dir("dir1")
            .file("dir1/file1", b"lower")
            .dir("dir2")
            .file("dir2/stale", b"stale")
            .build();
        // layer 2: whiteout of file1, opaque dir2, fresh dir3 with xattrs
        let layer2 = LayerBuilder::new()
            .dir("dir1")
            .file("dir1/.wh.file1", b"")
            .dir("dir2")
            .file("dir2/.wh..wh..opq", b"")
            .dir("dir3")
            .file_with_xattrs(
                "dir3/file1",
                b"upper",
                &[("user.note", b"hi"), ("security.capability", b"\x01\x00")],
            )
            .build();

        let (_tmp, path) = write_image(vec![layer1, layer2]);
        let mut reader = Ext4Reader::open(&path).unwrap();

        // dir1 exists and is empty
        let dir1 = reader.lookup("dir1").unwrap().unwrap();
        let dir1 = reader.inode(dir1).unwrap();
        assert!(dir1.is_dir());
        assert!(reader.read_dir(&dir1).unwrap().is_empty());

        // dir2 exists and is empty
        let dir2 = reader.lookup("dir2").unwrap().unwrap();
        let dir2 = reader.inode(dir2).unwrap();
        assert!(reader.read_dir(&dir2).unwrap().is_empty());
        assert!(reader.lookup("dir2/stale").unwrap().is_none());

        // dir3/file1 carries its data and xattrs
        let file = reader.lookup("dir3/file1").unwrap().unwrap();
        let file = reader.inode(file).unwrap();
        assert_eq!(reader.read_file(&file).unwrap(), b"upper");
        let xattrs = reader.xattrs(&file).unwrap();
        assert!(xattrs.iter().any(|(k, v)| k == "user.note" && v == b"hi"));
        assert!(
            xattrs
                .iter()
                .any(|(k, v)| k == "security.capability" && v == b"\x01\x00")
        );

        // no whiteout sentinel leaked into the tree
        assert!(reader.lookup("dir1/.wh.file1").unwrap().is_none());
        assert!(reader.lookup("dir2/.wh..wh..opq").unwrap().is_none());
    }

    #[test]
    fn upper_layer_replaces_file() {
        let layer1 = LayerBuilder::new().file("etc/motd", b"old").build();
        let layer2 = LayerBuilder::new().file("etc/motd", b"new!").build();
        let (_tmp, path) = write_image(vec![layer1, layer2]);
        let mut reader = Ext4Reader::open(&path).unwrap();
        let ino = reader.lookup("etc/motd").unwrap().unwrap();
        let info = reader.inode(ino).unwrap();
        assert_eq!(reader.read_file(&info).unwrap(), b"new!");
        assert_eq!(info.links, 1);
    }

    #[test]
    fn hardlinks_share_an_inode() {
        let layer = LayerBuilder::new()
            .file("bin/busybox", b"#!binary")
            .hardlink("bin/sh", "bin/busybox")
            .build();
        let (_tmp, path) = write_image(vec![layer]);
        let mut reader = Ext4Reader::open(&path).unwrap();
        let a = reader.lookup("bin/busybox").unwrap().unwrap();
        let b = reader.lookup("bin/sh").unwrap().unwrap();
        assert_eq!(a, b);
        let info = reader.inode(a).unwrap();
        assert_eq!(info.links, 2);
        assert_eq!(reader.read_file(&info).unwrap(), b"#!binary");
    }

    #[test]
    fn symlink_targets_inline_and_block() {
        let short = "bin/busybox";
        let long = "a/".repeat(50) + "target"; // 106 bytes, past the inline limit
        let layer = LayerBuilder::new()
            .file("bin/busybox", b"x")
            .symlink("bin/sh", short)
            .symlink("bin/long", &long)
            .build();
        let (_tmp, path) = write_image(vec![layer]);
        let mut reader = Ext4Reader::open(&path).unwrap();

        let ino = reader.lookup("bin/sh").unwrap().unwrap();
        let info = reader.inode(ino).unwrap();
        assert!(info.is_symlink());
        assert_eq!(info.size as usize, short.len());
        assert_eq!(reader.read_symlink(&info).unwrap(), short.as_bytes());

        let ino = reader.lookup("bin/long").unwrap().unwrap();
        let info = reader.inode(ino).unwrap();
        assert_eq!(reader.read_symlink(&info).unwrap(), long.as_bytes());
    }

    #[test]
    fn file_bytes_round_trip_multiblock() {
        let payload: Vec<u8> = (0..100_000u32).flat_map(|i| i.to_le_bytes()).collect();
        let layer = LayerBuilder::new().file("data.bin", &payload).build();
        let (_tmp, path) = write_image(vec![layer]);
        let mut reader = Ext4Reader::open(&path).unwrap();
        let ino = reader.lookup("data.bin").unwrap().unwrap();
        let info = reader.inode(ino).unwrap();
        assert_eq!(info.size as usize, payload.len());
        assert_eq!(reader.read_file(&info).unwrap(), payload);
    }

    #[test]
    fn directory_attrs_and_nesting() {
        let layer = LayerBuilder::new()
            .dir("a")
            .dir("a/b")
            .file("a/b/c", b"deep")
            .build();
        let (_tmp, path) = write_image(vec![layer]);
        let mut reader = Ext4Reader::open(&path).unwrap();
        let a = reader.lookup("a").unwrap().unwrap();
        let info = reader.inode(a).unwrap();
        // "." + ".." + one subdirectory
        assert_eq!(info.links, 3);
        assert_eq!(info.mode & 0o777, 0o755);
        let entries = reader.read_dir(&info).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "b");
    }

    #[test]
    fn whiteout_of_hardlinked_name_keeps_other_link() {
        let layer1 = LayerBuilder::new()
            .file("f1", b"shared")
            .hardlink("f2", "f1")
            .build();
        let layer2 = LayerBuilder::new().file(".wh.f1", b"").build();
        let (_tmp, path) = write_image(vec![layer1, layer2]);
        let mut reader = Ext4Reader::open(&path).unwrap();
        assert!(reader.lookup("f1").unwrap().is_none());
        let ino = reader.lookup("f2").unwrap().unwrap();
        let info = reader.inode(ino).unwrap();
        assert_eq!(info.links, 1);
        assert_eq!(reader.read_file(&info).unwrap(), b"shared");
    }
}

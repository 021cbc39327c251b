//! The ext4 image writer.
//!
//! File data streams to disk as it arrives; directories, bitmaps, inode
//! tables, and the superblock are held in memory and written once by
//! [`Ext4Writer::finish`]. Directory state lives in index maps (inode
//! number → children), never in pointer graphs.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::bitmap::Bitmap;
use crate::layout::{
    self, BLOCK_SIZE, BLOCKS_PER_GROUP, EXTENTS_FL, Extent, FIRST_INO, GroupDesc, INODE_SIZE,
    INODES_PER_GROUP, ROOT_INO, Superblock, XATTR_MAGIC, dirent_type_for_mode, file_mode,
};
use crate::{Error, Result};

/// Longest run one extent can map.
const MAX_EXTENT_BLOCKS: u64 = 32768;
/// Extents that fit in the inode's 60-byte tree root.
const INLINE_EXTENTS: usize = 4;
/// Extents per 4 KiB leaf block.
const LEAF_EXTENTS: usize = (BLOCK_SIZE - 12) / 12;
/// Symlink targets up to this length are stored in the inode itself.
const INLINE_SYMLINK_MAX: usize = 60;
/// Bytes past the fixed inode fields available for inline xattrs.
const INLINE_XATTR_AREA: usize = INODE_SIZE - 160;

/// Metadata applied to created entries.
#[derive(Debug, Clone, Default)]
pub struct Attrs {
    /// Permission bits (the type bits come from the operation).
    pub mode: u16,
    /// Owner.
    pub uid: u32,
    /// Group.
    pub gid: u32,
    /// Modification time, seconds since the epoch; also used for the
    /// other timestamps.
    pub mtime: u32,
    /// Extended attributes.
    pub xattrs: Vec<(String, Vec<u8>)>,
}

#[derive(Debug)]
struct Node {
    mode: u16,
    uid: u32,
    gid: u32,
    size: u64,
    mtime: u32,
    /// Directory entries referencing this inode. Directories get theirs
    /// recomputed at finish; zero means deleted.
    links: u32,
    dtime: u32,
    extents: Vec<Extent>,
    /// Inline symlink target.
    inline: Option<Vec<u8>>,
    /// Device numbers for character and block nodes.
    rdev: Option<(u32, u32)>,
    xattrs: Vec<(String, Vec<u8>)>,
    /// Extra metadata blocks (extent tree leaves, xattr block) charged
    /// to `i_blocks`, filled in by finish.
    xattr_block: Option<u64>,
    tree_blocks: Vec<u64>,
}

impl Node {
    fn new(mode: u16, attrs: &Attrs) -> Self {
        Self {
            mode,
            uid: attrs.uid,
            gid: attrs.gid,
            size: 0,
            mtime: attrs.mtime,
            links: 1,
            dtime: 0,
            extents: Vec::new(),
            inline: None,
            rdev: None,
            xattrs: attrs.xattrs.clone(),
            xattr_block: None,
            tree_blocks: Vec::new(),
        }
    }

    fn is_dir(&self) -> bool {
        self.mode & file_mode::S_IFMT == file_mode::S_IFDIR
    }

    fn is_live(&self) -> bool {
        self.links > 0
    }

    fn apply_attrs(&mut self, attrs: &Attrs) {
        self.mode = (self.mode & file_mode::S_IFMT) | (attrs.mode & !file_mode::S_IFMT);
        self.uid = attrs.uid;
        self.gid = attrs.gid;
        self.mtime = attrs.mtime;
        if !attrs.xattrs.is_empty() {
            self.xattrs = attrs.xattrs.clone();
        }
    }
}

/// Disk geometry derived from the requested capacity.
#[derive(Debug, Clone)]
pub(crate) struct Geometry {
    pub total_blocks: u64,
    pub groups: u64,
    pub gdt_blocks: u64,
    pub itable_blocks: u64,
}

impl Geometry {
    fn new(capacity_bytes: u64) -> Result<Self> {
        let mut total_blocks = capacity_bytes / BLOCK_SIZE as u64;
        let mut groups = total_blocks.div_ceil(BLOCKS_PER_GROUP);
        if groups == 0 {
            return Err(Error::InvalidArgument(format!(
                "capacity {capacity_bytes} is below one block group"
            )));
        }
        let gdt_blocks = (groups * 32).div_ceil(BLOCK_SIZE as u64);
        let itable_blocks = u64::from(INODES_PER_GROUP) * INODE_SIZE as u64 / BLOCK_SIZE as u64;
        // a trailing sliver too small to hold its own metadata is dropped
        let min_group = 1 + gdt_blocks + 2 + itable_blocks + 16;
        let tail = total_blocks % BLOCKS_PER_GROUP;
        if tail != 0 && tail < min_group {
            total_blocks -= tail;
            groups -= 1;
        }
        if groups == 0 || total_blocks < min_group {
            return Err(Error::InvalidArgument(format!(
                "capacity {capacity_bytes} is too small for an ext4 image"
            )));
        }
        Ok(Self {
            total_blocks,
            groups,
            gdt_blocks,
            itable_blocks,
        })
    }

    /// Sparse-super backup placement: groups 0, 1, and powers of 3, 5, 7.
    pub(crate) fn has_super(group: u64) -> bool {
        fn power_of(mut n: u64, base: u64) -> bool {
            while n % base == 0 {
                n /= base;
            }
            n == 1
        }
        group == 0 || group == 1 || power_of(group, 3) || power_of(group, 5) || power_of(group, 7)
    }

    fn group_blocks(&self, group: u64) -> u64 {
        let base = group * BLOCKS_PER_GROUP;
        (self.total_blocks - base).min(BLOCKS_PER_GROUP)
    }

    /// (block bitmap, inode bitmap, inode table) blocks for a group.
    pub(crate) fn group_layout(&self, group: u64) -> (u64, u64, u64) {
        let mut at = group * BLOCKS_PER_GROUP;
        if Self::has_super(group) {
            at += 1 + self.gdt_blocks;
        }
        (at, at + 1, at + 2)
    }

    fn total_inodes(&self) -> u32 {
        (self.groups * u64::from(INODES_PER_GROUP)) as u32
    }

    /// Byte offset of an inode's table record.
    fn inode_offset(&self, ino: u32) -> u64 {
        let index = u64::from(ino - 1);
        let group = index / u64::from(INODES_PER_GROUP);
        let slot = index % u64::from(INODES_PER_GROUP);
        let (_, _, itable) = self.group_layout(group);
        itable * BLOCK_SIZE as u64 + slot * INODE_SIZE as u64
    }
}

/// Writes a mountable ext4 image from filesystem operations or tar
/// layers.
#[derive(Debug)]
pub struct Ext4Writer {
    file: File,
    geometry: Geometry,
    /// Working allocation state; the on-disk bitmaps are rebuilt from
    /// live inodes at finish so deleted content is reclaimed.
    allocated: Bitmap,
    cursor: u64,
    next_ino: u32,
    nodes: BTreeMap<u32, Node>,
    children: HashMap<u32, BTreeMap<Vec<u8>, u32>>,
    parents: HashMap<u32, u32>,
    uuid: [u8; 16],
}

impl Ext4Writer {
    /// Creates a sparse image file of `capacity_bytes` at `path`.
    pub fn create(path: &Path, capacity_bytes: u64) -> Result<Self> {
        let geometry = Geometry::new(capacity_bytes)?;
        let file = File::create(path)?;
        file.set_len(geometry.total_blocks * BLOCK_SIZE as u64)?;

        let mut allocated = Bitmap::new(geometry.total_blocks);
        for group in 0..geometry.groups {
            let base = group * BLOCKS_PER_GROUP;
            if Geometry::has_super(group) {
                for b in 0..=geometry.gdt_blocks {
                    allocated.set(base + b);
                }
            }
            let (block_bitmap, inode_bitmap, itable) = geometry.group_layout(group);
            allocated.set(block_bitmap);
            allocated.set(inode_bitmap);
            for b in 0..geometry.itable_blocks {
                allocated.set(itable + b);
            }
        }

        let mut nodes = BTreeMap::new();
        let mut root = Node::new(file_mode::S_IFDIR | 0o755, &Attrs::default());
        root.links = 2;
        nodes.insert(ROOT_INO, root);
        let mut children = HashMap::new();
        children.insert(ROOT_INO, BTreeMap::new());
        let mut parents = HashMap::new();
        parents.insert(ROOT_INO, ROOT_INO);

        Ok(Self {
            file,
            geometry,
            allocated,
            cursor: 0,
            next_ino: FIRST_INO,
            nodes,
            children,
            parents,
            uuid: random_uuid(),
        })
    }

    fn node(&self, ino: u32) -> &Node {
        &self.nodes[&ino]
    }

    fn node_mut(&mut self, ino: u32) -> &mut Node {
        self.nodes.get_mut(&ino).unwrap_or_else(|| unreachable!())
    }

    fn allocate_inode(&mut self) -> Result<u32> {
        if self.next_ino > self.geometry.total_inodes() {
            return Err(Error::Full("out of inodes".into()));
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        Ok(ino)
    }

    /// Allocates a contiguous run of up to `want` blocks, first fit
    /// after the cursor.
    fn allocate_run(&mut self, want: u64) -> Result<(u64, u64)> {
        let want = want.clamp(1, MAX_EXTENT_BLOCKS);
        let mut from = self.cursor;
        loop {
            let Some(start) = self.allocated.next_clear(from) else {
                if from == 0 {
                    return Err(Error::Full("out of blocks".into()));
                }
                // wrap once to reuse gaps before the cursor
                from = 0;
                continue;
            };
            let run = self.allocated.clear_run(start, want);
            for b in start..start + run {
                self.allocated.set(b);
            }
            self.cursor = start + run;
            return Ok((start, run));
        }
    }

    fn write_block(&mut self, block: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(block * BLOCK_SIZE as u64))?;
        self.file.write_all(data)?;
        Ok(())
    }

    /// Streams `size` bytes from `reader` into newly allocated blocks.
    fn write_stream(&mut self, mut reader: impl Read, size: u64) -> Result<Vec<Extent>> {
        let mut extents: Vec<Extent> = Vec::new();
        let mut logical: u64 = 0;
        let mut remaining = size;
        let mut buf = vec![0u8; 32 * BLOCK_SIZE];
        while remaining > 0 {
            let want = remaining.div_ceil(BLOCK_SIZE as u64);
            let (start, run) = self.allocate_run(want)?;
            let mut to_copy = (run * BLOCK_SIZE as u64).min(remaining);
            self.file.seek(SeekFrom::Start(start * BLOCK_SIZE as u64))?;
            while to_copy > 0 {
                let chunk = to_copy.min(buf.len() as u64) as usize;
                let n = reader.read(&mut buf[..chunk])?;
                if n == 0 {
                    return Err(Error::Corrupt("archive entry shorter than its header".into()));
                }
                self.file.write_all(&buf[..n])?;
                to_copy -= n as u64;
                remaining -= n as u64;
            }
            // merge with the previous extent when the runs are adjacent
            match extents.last_mut() {
                Some(last)
                    if last.start + u64::from(last.len) == start
                        && u64::from(last.len) + run <= MAX_EXTENT_BLOCKS =>
                {
                    last.len += run as u16;
                }
                _ => extents.push(Extent {
                    logical: logical as u32,
                    start,
                    len: run as u16,
                }),
            }
            logical += run;
        }
        Ok(extents)
    }

    // ---- tree manipulation ----

    /// Splits a path into components, ignoring `.`, empty segments, and
    /// anything trying to escape the root.
    fn components(path: &str) -> Vec<Vec<u8>> {
        path.split('/')
            .filter(|c| !c.is_empty() && *c != "." && *c != "..")
            .map(|c| c.as_bytes().to_vec())
            .collect()
    }

    fn lookup(&self, components: &[Vec<u8>]) -> Option<u32> {
        let mut ino = ROOT_INO;
        for name in components {
            ino = *self.children.get(&ino)?.get(name)?;
        }
        Some(ino)
    }

    /// Resolves the parent directory, creating missing intermediate
    /// directories with root 0755.
    fn resolve_parent(&mut self, components: &[Vec<u8>]) -> Result<u32> {
        let mut ino = ROOT_INO;
        let Some((_, dirs)) = components.split_last() else {
            return Err(Error::InvalidArgument("empty path".into()));
        };
        for name in dirs {
            if let Some(&next) = self.children.get(&ino).and_then(|c| c.get(name)) {
                if !self.node(next).is_dir() {
                    return Err(Error::InvalidArgument(format!(
                        "{} is not a directory",
                        String::from_utf8_lossy(name)
                    )));
                }
                ino = next;
                continue;
            }
            let created = self.allocate_inode()?;
            self.nodes.insert(
                created,
                Node::new(file_mode::S_IFDIR | 0o755, &Attrs::default()),
            );
            self.children.insert(created, BTreeMap::new());
            self.parents.insert(created, ino);
            self.children
                .get_mut(&ino)
                .unwrap_or_else(|| unreachable!())
                .insert(name.clone(), created);
            ino = created;
        }
        Ok(ino)
    }

    /// Detaches `name` from `parent`, recursively dropping directory
    /// subtrees and releasing link counts.
    fn unlink(&mut self, parent: u32, name: &[u8]) -> bool {
        let Some(&ino) = self.children.get(&parent).and_then(|c| c.get(name)) else {
            return false;
        };
        if self.node(ino).is_dir() {
            let names: Vec<Vec<u8>> = self
                .children
                .get(&ino)
                .map(|c| c.keys().cloned().collect())
                .unwrap_or_default();
            for child in names {
                self.unlink(ino, &child);
            }
            self.children.remove(&ino);
            self.parents.remove(&ino);
            let node = self.node_mut(ino);
            node.links = 0;
            node.dtime = node.mtime.max(1);
        } else {
            let node = self.node_mut(ino);
            node.links -= 1;
            if node.links == 0 {
                node.dtime = node.mtime.max(1);
            }
        }
        if let Some(children) = self.children.get_mut(&parent) {
            children.remove(name);
        }
        true
    }

    /// Makes room for a new entry at (`parent`, `name`), replacing any
    /// existing one. An existing directory survives only when the new
    /// entry is also a directory.
    fn prepare_slot(&mut self, parent: u32, name: &[u8], new_is_dir: bool) -> Option<u32> {
        if let Some(&existing) = self.children.get(&parent).and_then(|c| c.get(name)) {
            if new_is_dir && self.node(existing).is_dir() {
                return Some(existing);
            }
            self.unlink(parent, name);
        }
        None
    }

    fn insert_node(&mut self, parent: u32, name: &[u8], mode: u16, attrs: &Attrs) -> Result<u32> {
        let ino = self.allocate_inode()?;
        self.nodes.insert(ino, Node::new(mode, attrs));
        if mode & file_mode::S_IFMT == file_mode::S_IFDIR {
            self.children.insert(ino, BTreeMap::new());
            self.parents.insert(ino, parent);
        }
        self.children
            .get_mut(&parent)
            .unwrap_or_else(|| unreachable!())
            .insert(name.to_vec(), ino);
        Ok(ino)
    }

    // ---- public operations ----

    /// Creates a directory, or refreshes the attributes of an existing
    /// one.
    pub fn add_directory(&mut self, path: &str, attrs: &Attrs) -> Result<()> {
        let components = Self::components(path);
        if components.is_empty() {
            // the tar root entry addresses inode 2 itself
            self.node_mut(ROOT_INO).apply_attrs(attrs);
            return Ok(());
        }
        let parent = self.resolve_parent(&components)?;
        let name = components.last().unwrap_or_else(|| unreachable!());
        if let Some(existing) = self.prepare_slot(parent, name, true) {
            self.node_mut(existing).apply_attrs(attrs);
            return Ok(());
        }
        self.insert_node(parent, name, file_mode::S_IFDIR | attrs.mode, attrs)?;
        Ok(())
    }

    /// Creates a regular file from `size` bytes of `reader`.
    pub fn add_file(
        &mut self,
        path: &str,
        attrs: &Attrs,
        reader: impl Read,
        size: u64,
    ) -> Result<()> {
        let components = Self::components(path);
        let parent = self.resolve_parent(&components)?;
        let name = components
            .last()
            .ok_or_else(|| Error::InvalidArgument("empty file path".into()))?
            .clone();
        self.prepare_slot(parent, &name, false);
        let extents = self.write_stream(reader, size)?;
        let ino = self.insert_node(parent, &name, file_mode::S_IFREG | attrs.mode, attrs)?;
        let node = self.node_mut(ino);
        node.size = size;
        node.extents = extents;
        Ok(())
    }

    /// Creates a symlink. Targets of 60 bytes or less live inside the
    /// inode.
    pub fn add_symlink(&mut self, path: &str, target: &[u8], attrs: &Attrs) -> Result<()> {
        let components = Self::components(path);
        let parent = self.resolve_parent(&components)?;
        let name = components
            .last()
            .ok_or_else(|| Error::InvalidArgument("empty symlink path".into()))?
            .clone();
        self.prepare_slot(parent, &name, false);
        let extents = if target.len() > INLINE_SYMLINK_MAX {
            self.write_stream(target, target.len() as u64)?
        } else {
            Vec::new()
        };
        let ino = self.insert_node(parent, &name, file_mode::S_IFLNK | 0o777, attrs)?;
        let node = self.node_mut(ino);
        node.size = target.len() as u64;
        if extents.is_empty() {
            node.inline = Some(target.to_vec());
        } else {
            node.extents = extents;
        }
        Ok(())
    }

    /// Adds a directory entry for an existing file.
    pub fn add_hardlink(&mut self, path: &str, target: &str) -> Result<()> {
        let target_ino = self
            .lookup(&Self::components(target))
            .ok_or_else(|| Error::InvalidArgument(format!("hardlink target {target} missing")))?;
        if self.node(target_ino).is_dir() {
            return Err(Error::InvalidArgument(format!(
                "hardlink target {target} is a directory"
            )));
        }
        let components = Self::components(path);
        let parent = self.resolve_parent(&components)?;
        let name = components
            .last()
            .ok_or_else(|| Error::InvalidArgument("empty link path".into()))?
            .clone();
        self.prepare_slot(parent, &name, false);
        self.node_mut(target_ino).links += 1;
        self.children
            .get_mut(&parent)
            .unwrap_or_else(|| unreachable!())
            .insert(name, target_ino);
        Ok(())
    }

    /// Creates a FIFO, socket, or device node.
    pub fn add_special(
        &mut self,
        path: &str,
        type_bits: u16,
        rdev: Option<(u32, u32)>,
        attrs: &Attrs,
    ) -> Result<()> {
        let components = Self::components(path);
        let parent = self.resolve_parent(&components)?;
        let name = components
            .last()
            .ok_or_else(|| Error::InvalidArgument("empty path".into()))?
            .clone();
        self.prepare_slot(parent, &name, false);
        let ino = self.insert_node(parent, &name, type_bits | attrs.mode, attrs)?;
        self.node_mut(ino).rdev = rdev;
        Ok(())
    }

    /// Removes an entry (whiteout). Missing targets are tolerated.
    pub fn remove_entry(&mut self, path: &str) -> Result<bool> {
        let components = Self::components(path);
        let Some((name, dirs)) = components.split_last() else {
            return Err(Error::InvalidArgument("cannot remove the root".into()));
        };
        let Some(parent) = self.lookup(dirs) else {
            return Ok(false);
        };
        Ok(self.unlink(parent, name))
    }

    /// Removes every entry of a directory (opaque marker), keeping the
    /// directory itself.
    pub fn clear_directory(&mut self, path: &str) -> Result<()> {
        let Some(ino) = self.lookup(&Self::components(path)) else {
            return Ok(());
        };
        let names: Vec<Vec<u8>> = self
            .children
            .get(&ino)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default();
        for name in names {
            self.unlink(ino, &name);
        }
        Ok(())
    }

    /// Returns `true` if `path` currently resolves.
    pub fn contains(&self, path: &str) -> bool {
        self.lookup(&Self::components(path)).is_some()
    }

    // ---- finalize ----

    /// Writes directories, metadata, bitmaps, and superblocks, then
    /// flushes the file.
    pub fn finish(mut self) -> Result<()> {
        self.write_directories()?;
        self.place_xattrs()?;
        self.place_extent_trees()?;

        let (block_map, inode_map, used_dirs) = self.final_bitmaps();
        self.write_inode_tables()?;
        self.write_group_metadata(&block_map, &inode_map, &used_dirs)?;
        self.file.flush()?;
        tracing::debug!(
            blocks = self.geometry.total_blocks,
            inodes = self.next_ino - 1,
            "finalized ext4 image"
        );
        Ok(())
    }

    /// Serializes every live directory into dirent blocks and records
    /// the resulting extents and link counts.
    fn write_directories(&mut self) -> Result<()> {
        let dirs: Vec<u32> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.is_dir() && n.is_live())
            .map(|(&ino, _)| ino)
            .collect();

        for &ino in &dirs {
            let parent = *self.parents.get(&ino).unwrap_or(&ROOT_INO);
            let mut entries: Vec<(u32, u8, Vec<u8>)> = vec![
                (ino, layout::dirent_type::DIR, b".".to_vec()),
                (parent, layout::dirent_type::DIR, b"..".to_vec()),
            ];
            let mut subdirs = 0u32;
            if let Some(children) = self.children.get(&ino) {
                for (name, &child) in children {
                    let mode = self.node(child).mode;
                    if self.node(child).is_dir() {
                        subdirs += 1;
                    }
                    entries.push((child, dirent_type_for_mode(mode), name.clone()));
                }
            }

            let blocks = layout::encode_dirents(&entries);
            let mut extents: Vec<Extent> = Vec::new();
            let mut logical = 0u32;
            for data in &blocks {
                let (start, _) = self.allocate_run(1)?;
                self.write_block(start, data)?;
                match extents.last_mut() {
                    Some(last) if last.start + u64::from(last.len) == start => last.len += 1,
                    _ => extents.push(Extent {
                        logical,
                        start,
                        len: 1,
                    }),
                }
                logical += 1;
            }

            let node = self.node_mut(ino);
            node.size = blocks.len() as u64 * BLOCK_SIZE as u64;
            node.extents = extents;
            node.links = 2 + subdirs;
        }
        Ok(())
    }

    /// Spills oversized xattr sets into one block per inode.
    fn place_xattrs(&mut self) -> Result<()> {
        let candidates: Vec<u32> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.is_live() && !n.xattrs.is_empty())
            .map(|(&ino, _)| ino)
            .collect();
        for ino in candidates {
            let attrs = self.node(ino).xattrs.clone();
            // inline first: magic plus entries inside the inode tail
            let mut scratch = vec![0u8; INLINE_XATTR_AREA];
            if layout::encode_xattr_region(&mut scratch, 4, 4, false, &attrs).is_some() {
                continue;
            }
            let mut block = vec![0u8; BLOCK_SIZE];
            let Some(hash) = layout::encode_xattr_region(&mut block, 32, 0, true, &attrs) else {
                return Err(Error::Unsupported(format!(
                    "extended attributes exceed one {BLOCK_SIZE}-byte block"
                )));
            };
            layout::put_u32(&mut block, 0, XATTR_MAGIC);
            layout::put_u32(&mut block, 4, 1); // refcount
            layout::put_u32(&mut block, 8, 1); // blocks
            layout::put_u32(&mut block, 12, hash);
            let (start, _) = self.allocate_run(1)?;
            self.write_block(start, &block)?;
            self.node_mut(ino).xattr_block = Some(start);
        }
        Ok(())
    }

    /// Builds one-level extent trees for inodes with more than four
    /// extents.
    fn place_extent_trees(&mut self) -> Result<()> {
        let wide: Vec<u32> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.is_live() && n.extents.len() > INLINE_EXTENTS)
            .map(|(&ino, _)| ino)
            .collect();
        for ino in wide {
            let extents = self.node(ino).extents.clone();
            let mut leaves = Vec::new();
            for chunk in extents.chunks(LEAF_EXTENTS) {
                let mut block = vec![0u8; BLOCK_SIZE];
                let entries: Vec<(u32, u64, u16)> =
                    chunk.iter().map(|e| (e.logical, e.start, e.len)).collect();
                layout::encode_extent_node(&mut block, 0, LEAF_EXTENTS as u16, &entries);
                let (start, _) = self.allocate_run(1)?;
                self.write_block(start, &block)?;
                leaves.push((chunk[0].logical, start));
            }
            if leaves.len() > INLINE_EXTENTS {
                return Err(Error::Full(format!(
                    "file needs {} extent leaves, the root holds {INLINE_EXTENTS}",
                    leaves.len()
                )));
            }
            self.node_mut(ino).tree_blocks = leaves.iter().map(|&(_, b)| b).collect();
        }
        Ok(())
    }

    /// Rebuilds allocation state from live inodes only, so content
    /// deleted by whiteouts is reclaimed.
    fn final_bitmaps(&self) -> (Bitmap, Bitmap, Vec<u16>) {
        let mut blocks = Bitmap::new(self.geometry.total_blocks);
        for group in 0..self.geometry.groups {
            let base = group * BLOCKS_PER_GROUP;
            if Geometry::has_super(group) {
                for b in 0..=self.geometry.gdt_blocks {
                    blocks.set(base + b);
                }
            }
            let (block_bitmap, inode_bitmap, itable) = self.geometry.group_layout(group);
            blocks.set(block_bitmap);
            blocks.set(inode_bitmap);
            for b in 0..self.geometry.itable_blocks {
                blocks.set(itable + b);
            }
        }

        let mut inodes = Bitmap::new(u64::from(self.geometry.total_inodes()));
        for reserved in 1..FIRST_INO {
            if reserved != ROOT_INO {
                inodes.set(u64::from(reserved - 1));
            }
        }
        let mut used_dirs = vec![0u16; self.geometry.groups as usize];
        for (&ino, node) in &self.nodes {
            if !node.is_live() {
                continue;
            }
            inodes.set(u64::from(ino - 1));
            if node.is_dir() {
                used_dirs[((ino - 1) / INODES_PER_GROUP) as usize] += 1;
            }
            for extent in &node.extents {
                for b in extent.start..extent.start + u64::from(extent.len) {
                    blocks.set(b);
                }
            }
            for &b in &node.tree_blocks {
                blocks.set(b);
            }
            if let Some(b) = node.xattr_block {
                blocks.set(b);
            }
        }
        (blocks, inodes, used_dirs)
    }

    fn write_inode_tables(&mut self) -> Result<()> {
        let records: Vec<(u32, Vec<u8>)> = self
            .nodes
            .iter()
            .map(|(&ino, node)| (ino, encode_inode(node)))
            .collect();
        for (ino, record) in records {
            let offset = self.geometry.inode_offset(ino);
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.write_all(&record)?;
        }
        Ok(())
    }

    fn write_group_metadata(
        &mut self,
        block_map: &Bitmap,
        inode_map: &Bitmap,
        used_dirs: &[u16],
    ) -> Result<()> {
        let mut descriptors = Vec::with_capacity(self.geometry.groups as usize);
        let mut free_blocks_total = 0u64;
        for group in 0..self.geometry.groups {
            let base = group * BLOCKS_PER_GROUP;
            let count = self.geometry.group_blocks(group);
            let used = block_map.count_set(base, base + count);
            let free_blocks = (count - used) as u16;
            free_blocks_total += count - used;

            let inode_base = group * u64::from(INODES_PER_GROUP);
            let used_inodes =
                inode_map.count_set(inode_base, inode_base + u64::from(INODES_PER_GROUP));
            let (block_bitmap, inode_bitmap, itable) = self.geometry.group_layout(group);
            descriptors.push(GroupDesc {
                block_bitmap,
                inode_bitmap,
                inode_table: itable,
                free_blocks,
                free_inodes: (u64::from(INODES_PER_GROUP) - used_inodes) as u16,
                used_dirs: used_dirs[group as usize],
            });

            // per-group on-disk bitmaps; trailing bits padded with ones
            let block_bits = block_map.to_block(base, count, BLOCK_SIZE);
            self.write_block(block_bitmap, &block_bits)?;
            let inode_bits =
                inode_map.to_block(inode_base, u64::from(INODES_PER_GROUP), BLOCK_SIZE);
            self.write_block(inode_bitmap, &inode_bits)?;
        }

        let mut gdt = vec![0u8; (self.geometry.gdt_blocks * BLOCK_SIZE as u64) as usize];
        for (i, descriptor) in descriptors.iter().enumerate() {
            gdt[i * 32..i * 32 + 32].copy_from_slice(&descriptor.encode());
        }

        let free_inodes = inode_map.len() - inode_map.count_set(0, inode_map.len());
        let superblock = Superblock {
            inodes_count: self.geometry.total_inodes(),
            blocks_count: self.geometry.total_blocks,
            free_blocks: free_blocks_total,
            free_inodes: free_inodes as u32,
            uuid: self.uuid,
        };

        for group in 0..self.geometry.groups {
            if !Geometry::has_super(group) {
                continue;
            }
            let base = group * BLOCKS_PER_GROUP;
            let encoded = superblock.encode(group as u16);
            // the primary lives at byte 1024; backups sit at the start
            // of their group's first block
            let offset = if group == 0 {
                1024
            } else {
                base * BLOCK_SIZE as u64
            };
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.write_all(&encoded)?;
            self.file
                .seek(SeekFrom::Start((base + 1) * BLOCK_SIZE as u64))?;
            self.file.write_all(&gdt)?;
        }
        Ok(())
    }
}

/// Encodes one 256-byte inode record.
fn encode_inode(node: &Node) -> Vec<u8> {
    let mut b = vec![0u8; INODE_SIZE];
    if !node.is_live() {
        layout::put_u16(&mut b, 0, node.mode);
        layout::put_u32(&mut b, 20, node.dtime);
        layout::put_u16(&mut b, 128, 32);
        return b;
    }

    layout::put_u16(&mut b, 0, node.mode);
    layout::put_u16(&mut b, 2, node.uid as u16);
    layout::put_u32(&mut b, 4, node.size as u32);
    layout::put_u32(&mut b, 8, node.mtime); // atime
    layout::put_u32(&mut b, 12, node.mtime); // ctime
    layout::put_u32(&mut b, 16, node.mtime);
    layout::put_u16(&mut b, 24, node.gid as u16);
    layout::put_u16(&mut b, 26, node.links.min(65000) as u16);

    let data_blocks: u64 = node.extents.iter().map(|e| u64::from(e.len)).sum();
    let meta_blocks =
        node.tree_blocks.len() as u64 + u64::from(node.xattr_block.is_some());
    layout::put_u32(
        &mut b,
        28,
        ((data_blocks + meta_blocks) * (BLOCK_SIZE as u64 / 512)) as u32,
    );

    if let Some(ref target) = node.inline {
        // fast symlink: target bytes live in i_block
        b[40..40 + target.len()].copy_from_slice(target);
    } else if let Some((major, minor)) = node.rdev {
        if major < 256 && minor < 256 {
            layout::put_u32(&mut b, 40, (major << 8) | minor);
        } else {
            layout::put_u32(
                &mut b,
                44,
                (minor & 0xff) | (major << 8) | ((minor & !0xff) << 12),
            );
        }
    } else if !node.extents.is_empty() || node.is_dir() || node.mode & file_mode::S_IFMT == file_mode::S_IFREG {
        layout::put_u32(&mut b, 32, EXTENTS_FL);
        if node.tree_blocks.is_empty() {
            let entries: Vec<(u32, u64, u16)> = node
                .extents
                .iter()
                .map(|e| (e.logical, e.start, e.len))
                .collect();
            layout::encode_extent_node(&mut b[40..100], 0, INLINE_EXTENTS as u16, &entries);
        } else {
            // depth-1 root indexing the leaf blocks written earlier
            let mut entries = Vec::new();
            for (i, &leaf) in node.tree_blocks.iter().enumerate() {
                let logical = node.extents[i * LEAF_EXTENTS].logical;
                entries.push((logical, leaf, 0u16));
            }
            layout::encode_extent_node(&mut b[40..100], 1, INLINE_EXTENTS as u16, &entries);
        }
    }

    layout::put_u32(&mut b, 104, node.xattr_block.unwrap_or(0) as u32);
    layout::put_u32(&mut b, 108, (node.size >> 32) as u32);
    layout::put_u16(&mut b, 116 + 4, (node.uid >> 16) as u16); // l_i_uid_high
    layout::put_u16(&mut b, 116 + 6, (node.gid >> 16) as u16); // l_i_gid_high
    layout::put_u16(&mut b, 128, 32); // extra isize
    layout::put_u32(&mut b, 144, node.mtime); // crtime

    if !node.xattrs.is_empty() && node.xattr_block.is_none() {
        let tail = &mut b[160..];
        layout::put_u32(tail, 0, XATTR_MAGIC);
        let _ = layout::encode_xattr_region(tail, 4, 4, false, &node.xattrs);
    }
    b
}

/// Derives 16 pseudo-random bytes for the filesystem UUID.
fn random_uuid() -> [u8; 16] {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    use std::time::{SystemTime, UNIX_EPOCH};

    let mut out = [0u8; 16];
    for half in 0..2 {
        let mut h = RandomState::new().build_hasher();
        h.write_u64(u64::from(std::process::id()) + half);
        h.write_u128(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos(),
        );
        out[half as usize * 8..half as usize * 8 + 8].copy_from_slice(&h.finish().to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_single_group() {
        let geometry = Geometry::new(64 * 1024 * 1024).unwrap();
        assert_eq!(geometry.total_blocks, 16384);
        assert_eq!(geometry.groups, 1);
        assert_eq!(geometry.gdt_blocks, 1);
        assert_eq!(geometry.itable_blocks, 256);
        // bitmap blocks follow the superblock and gdt
        assert_eq!(geometry.group_layout(0), (2, 3, 4));
    }

    #[test]
    fn geometry_multi_group() {
        let geometry = Geometry::new(1024 * 1024 * 1024).unwrap();
        assert_eq!(geometry.groups, 8);
        assert_eq!(geometry.total_blocks, 262144);
        // group 1 carries a backup superblock
        assert_eq!(
            geometry.group_layout(1),
            (BLOCKS_PER_GROUP + 2, BLOCKS_PER_GROUP + 3, BLOCKS_PER_GROUP + 4)
        );
    }

    #[test]
    fn geometry_rejects_tiny_capacity() {
        assert!(Geometry::new(0).is_err());
        assert!(Geometry::new(512 * 1024).is_err());
    }

    #[test]
    fn sparse_super_groups() {
        let with: Vec<u64> = (0..60).filter(|&g| Geometry::has_super(g)).collect();
        assert_eq!(with, vec![0, 1, 3, 5, 7, 9, 25, 27, 49]);
    }

    #[test]
    fn inode_offsets_span_groups() {
        let geometry = Geometry::new(1024 * 1024 * 1024).unwrap();
        let (_, _, itable0) = geometry.group_layout(0);
        assert_eq!(
            geometry.inode_offset(1),
            itable0 * BLOCK_SIZE as u64
        );
        assert_eq!(
            geometry.inode_offset(2),
            itable0 * BLOCK_SIZE as u64 + INODE_SIZE as u64
        );
        let (_, _, itable1) = geometry.group_layout(1);
        assert_eq!(
            geometry.inode_offset(INODES_PER_GROUP + 1),
            itable1 * BLOCK_SIZE as u64
        );
    }

    #[test]
    fn path_components_normalize() {
        assert_eq!(
            Ext4Writer::components("./usr/bin/env"),
            vec![b"usr".to_vec(), b"bin".to_vec(), b"env".to_vec()]
        );
        assert_eq!(
            Ext4Writer::components("/etc/passwd"),
            vec![b"etc".to_vec(), b"passwd".to_vec()]
        );
        assert_eq!(
            Ext4Writer::components("dir/"),
            vec![b"dir".to_vec()]
        );
        assert!(Ext4Writer::components("./").is_empty());
        // traversal components are dropped, not honored
        assert_eq!(
            Ext4Writer::components("a/../b"),
            vec![b"a".to_vec(), b"b".to_vec()]
        );
    }

    #[test]
    fn tree_operations_track_links() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            Ext4Writer::create(&dir.path().join("img.ext4"), 64 * 1024 * 1024).unwrap();
        let attrs = Attrs {
            mode: 0o644,
            ..Attrs::default()
        };
        writer
            .add_file("data/a.txt", &attrs, &b"hello"[..], 5)
            .unwrap();
        writer.add_hardlink("data/b.txt", "data/a.txt").unwrap();
        assert!(writer.contains("data/a.txt"));
        assert!(writer.contains("data/b.txt"));

        let ino = writer.lookup(&Ext4Writer::components("data/a.txt")).unwrap();
        assert_eq!(writer.node(ino).links, 2);

        writer.remove_entry("data/b.txt").unwrap();
        assert_eq!(writer.node(ino).links, 1);
        writer.remove_entry("data/a.txt").unwrap();
        assert_eq!(writer.node(ino).links, 0);
        assert!(writer.node(ino).dtime > 0);
        assert!(!writer.contains("data/a.txt"));

        // whiteout of something never present is tolerated
        assert!(!writer.remove_entry("data/ghost").unwrap());
    }

    #[test]
    fn replace_file_with_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            Ext4Writer::create(&dir.path().join("img.ext4"), 64 * 1024 * 1024).unwrap();
        writer
            .add_file("x", &Attrs::default(), &b"f"[..], 1)
            .unwrap();
        writer.add_directory("x", &Attrs { mode: 0o755, ..Attrs::default() }).unwrap();
        writer
            .add_file("x/inner", &Attrs::default(), &b"g"[..], 1)
            .unwrap();
        assert!(writer.contains("x/inner"));
    }

    #[test]
    fn clear_directory_removes_children_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            Ext4Writer::create(&dir.path().join("img.ext4"), 64 * 1024 * 1024).unwrap();
        writer
            .add_file("d/one", &Attrs::default(), &b"1"[..], 1)
            .unwrap();
        writer
            .add_file("d/two", &Attrs::default(), &b"2"[..], 1)
            .unwrap();
        writer.clear_directory("d").unwrap();
        assert!(writer.contains("d"));
        assert!(!writer.contains("d/one"));
        assert!(!writer.contains("d/two"));
    }

    #[test]
    fn allocate_run_respects_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            Ext4Writer::create(&dir.path().join("img.ext4"), 64 * 1024 * 1024).unwrap();
        let (start, len) = writer.allocate_run(4).unwrap();
        // first data block sits after sb + gdt + bitmaps + inode table
        assert_eq!(start, 4 + 256);
        assert_eq!(len, 4);
        let (next, _) = writer.allocate_run(1).unwrap();
        assert_eq!(next, start + 4);
    }
}

//! Read-back support for produced images.
//!
//! Walks superblock → group descriptors → inodes → extents, enough to
//! verify a written tree without mounting. The writer's own tests are
//! the primary consumer.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::layout::{
    BLOCK_SIZE, EXTENT_MAGIC, EXTENTS_FL, GroupDesc, ROOT_INO, Superblock, XATTR_MAGIC,
    file_mode, get_u16, get_u32, xattr_join_name,
};
use crate::{Error, Result};

/// Decoded view of one inode.
#[derive(Debug, Clone)]
pub struct InodeInfo {
    /// Type and permission bits.
    pub mode: u16,
    /// Owner (32-bit, joined from the low and high halves).
    pub uid: u32,
    /// Group.
    pub gid: u32,
    /// Byte size.
    pub size: u64,
    /// Directory entry count.
    pub links: u16,
    /// Inode flags.
    pub flags: u32,
    /// Deletion time; non-zero only for freed inodes.
    pub dtime: u32,
    /// External xattr block, if any.
    pub xattr_block: u64,
    raw_block: [u8; 60],
    raw_tail: Vec<u8>,
}

impl InodeInfo {
    /// Returns `true` for directories.
    pub fn is_dir(&self) -> bool {
        self.mode & file_mode::S_IFMT == file_mode::S_IFDIR
    }

    /// Returns `true` for symlinks.
    pub fn is_symlink(&self) -> bool {
        self.mode & file_mode::S_IFMT == file_mode::S_IFLNK
    }
}

/// Minimal reader over an image produced by [`crate::Ext4Writer`].
#[derive(Debug)]
pub struct Ext4Reader {
    file: File,
    groups: Vec<GroupDesc>,
    inodes_per_group: u32,
    inode_size: u16,
}

impl Ext4Reader {
    /// Opens an image and loads its metadata.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut raw = vec![0u8; 1024];
        file.seek(SeekFrom::Start(1024))?;
        file.read_exact(&mut raw)?;
        let superblock = Superblock::decode(&raw)?;

        let blocks_per_group = u64::from(get_u32(&raw, 32));
        let inodes_per_group = get_u32(&raw, 40);
        let inode_size = get_u16(&raw, 88);
        let group_count = superblock.blocks_count.div_ceil(blocks_per_group) as usize;

        let mut gdt = vec![0u8; group_count * 32];
        file.seek(SeekFrom::Start(BLOCK_SIZE as u64))?;
        file.read_exact(&mut gdt)?;
        let groups = (0..group_count)
            .map(|i| GroupDesc::decode(&gdt[i * 32..i * 32 + 32]))
            .collect();

        Ok(Self {
            file,
            groups,
            inodes_per_group,
            inode_size,
        })
    }

    fn read_block(&mut self, block: u64) -> Result<Vec<u8>> {
        let mut data = vec![0u8; BLOCK_SIZE];
        self.file.seek(SeekFrom::Start(block * BLOCK_SIZE as u64))?;
        self.file.read_exact(&mut data)?;
        Ok(data)
    }

    /// Reads and decodes an inode record.
    pub fn inode(&mut self, ino: u32) -> Result<InodeInfo> {
        let index = u64::from(ino - 1);
        let group = (index / u64::from(self.inodes_per_group)) as usize;
        let slot = index % u64::from(self.inodes_per_group);
        let descriptor = self
            .groups
            .get(group)
            .ok_or_else(|| Error::Corrupt(format!("inode {ino} beyond last group")))?;
        let offset =
            descriptor.inode_table * BLOCK_SIZE as u64 + slot * u64::from(self.inode_size);
        let mut raw = vec![0u8; usize::from(self.inode_size)];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut raw)?;

        let mut raw_block = [0u8; 60];
        raw_block.copy_from_slice(&raw[40..100]);
        Ok(InodeInfo {
            mode: get_u16(&raw, 0),
            uid: u32::from(get_u16(&raw, 2)) | u32::from(get_u16(&raw, 120)) << 16,
            gid: u32::from(get_u16(&raw, 24)) | u32::from(get_u16(&raw, 122)) << 16,
            size: u64::from(get_u32(&raw, 4)) | u64::from(get_u32(&raw, 108)) << 32,
            links: get_u16(&raw, 26),
            flags: get_u32(&raw, 32),
            dtime: get_u32(&raw, 20),
            xattr_block: u64::from(get_u32(&raw, 104)),
            raw_block,
            raw_tail: raw.get(160..).map(<[u8]>::to_vec).unwrap_or_default(),
        })
    }

    /// The extents mapping an inode's data, walking one level of
    /// indirection when present.
    pub fn extents(&mut self, info: &InodeInfo) -> Result<Vec<(u32, u64, u16)>> {
        if info.flags & EXTENTS_FL == 0 {
            return Ok(Vec::new());
        }
        self.extent_node(&info.raw_block.to_vec())
    }

    fn extent_node(&mut self, node: &[u8]) -> Result<Vec<(u32, u64, u16)>> {
        if get_u16(node, 0) != EXTENT_MAGIC {
            return Err(Error::Corrupt("bad extent magic".into()));
        }
        let entries = usize::from(get_u16(node, 2));
        let depth = get_u16(node, 6);
        let mut extents = Vec::new();
        for i in 0..entries {
            let at = 12 + i * 12;
            if depth == 0 {
                let logical = get_u32(node, at);
                let len = get_u16(node, at + 4);
                let start =
                    u64::from(get_u32(node, at + 8)) | u64::from(get_u16(node, at + 6)) << 32;
                extents.push((logical, start, len));
            } else {
                let leaf = u64::from(get_u32(node, at + 4))
                    | u64::from(get_u16(node, at + 8)) << 32;
                let block = self.read_block(leaf)?;
                extents.extend(self.extent_node(&block)?);
            }
        }
        Ok(extents)
    }

    /// Reads a file's full contents.
    pub fn read_file(&mut self, info: &InodeInfo) -> Result<Vec<u8>> {
        let mut data = vec![0u8; info.size as usize];
        for (logical, start, len) in self.extents(info)? {
            for i in 0..u64::from(len) {
                let block = self.read_block(start + i)?;
                let from = (u64::from(logical) + i) * BLOCK_SIZE as u64;
                if from >= info.size {
                    break;
                }
                let take = ((info.size - from) as usize).min(BLOCK_SIZE);
                data[from as usize..from as usize + take].copy_from_slice(&block[..take]);
            }
        }
        Ok(data)
    }

    /// Reads a symlink target, inline or block-backed.
    pub fn read_symlink(&mut self, info: &InodeInfo) -> Result<Vec<u8>> {
        if info.flags & EXTENTS_FL == 0 {
            Ok(info.raw_block[..info.size as usize].to_vec())
        } else {
            self.read_file(info)
        }
    }

    /// Directory entries as (name, inode, file type), excluding `.` and
    /// `..`.
    pub fn read_dir(&mut self, info: &InodeInfo) -> Result<Vec<(String, u32, u8)>> {
        let mut entries = Vec::new();
        let raw = self.read_file(info)?;
        for block in raw.chunks(BLOCK_SIZE) {
            let mut at = 0usize;
            while at + 8 <= block.len() {
                let ino = get_u32(block, at);
                let rec_len = usize::from(get_u16(block, at + 4));
                if rec_len < 8 {
                    return Err(Error::Corrupt("directory entry shorter than header".into()));
                }
                let name_len = usize::from(block[at + 6]);
                let name = String::from_utf8_lossy(&block[at + 8..at + 8 + name_len]);
                if ino != 0 && name != "." && name != ".." {
                    entries.push((name.into_owned(), ino, block[at + 7]));
                }
                at += rec_len;
            }
        }
        Ok(entries)
    }

    /// Resolves a path from the root, returning the inode number.
    pub fn lookup(&mut self, path: &str) -> Result<Option<u32>> {
        let mut ino = ROOT_INO;
        for component in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            let info = self.inode(ino)?;
            if !info.is_dir() {
                return Ok(None);
            }
            let Some((_, child, _)) = self
                .read_dir(&info)?
                .into_iter()
                .find(|(name, _, _)| name == component)
            else {
                return Ok(None);
            };
            ino = child;
        }
        Ok(Some(ino))
    }

    /// All extended attributes of an inode, inline entries first.
    pub fn xattrs(&mut self, info: &InodeInfo) -> Result<Vec<(String, Vec<u8>)>> {
        let mut attrs = Vec::new();
        if info.raw_tail.len() >= 4 && get_u32(&info.raw_tail, 0) == XATTR_MAGIC {
            parse_xattr_entries(&info.raw_tail, 4, 4, &mut attrs);
        }
        if info.xattr_block != 0 {
            let block = self.read_block(info.xattr_block)?;
            if get_u32(&block, 0) != XATTR_MAGIC {
                return Err(Error::Corrupt("bad xattr block magic".into()));
            }
            parse_xattr_entries(&block, 32, 0, &mut attrs);
        }
        Ok(attrs)
    }
}

/// Walks serialized xattr entries until the null terminator.
fn parse_xattr_entries(
    region: &[u8],
    first_entry: usize,
    value_base: usize,
    out: &mut Vec<(String, Vec<u8>)>,
) {
    let mut at = first_entry;
    while at + 16 <= region.len() {
        let name_len = usize::from(region[at]);
        let index = region[at + 1];
        if name_len == 0 && index == 0 {
            break;
        }
        let value_offset = usize::from(get_u16(region, at + 2)) + value_base;
        let value_len = get_u32(region, at + 8) as usize;
        if at + 16 + name_len > region.len() || value_offset + value_len > region.len() {
            break;
        }
        let suffix = String::from_utf8_lossy(&region[at + 16..at + 16 + name_len]);
        out.push((
            xattr_join_name(index, &suffix),
            region[value_offset..value_offset + value_len].to_vec(),
        ));
        at += 16 + name_len.div_ceil(4) * 4;
    }
}

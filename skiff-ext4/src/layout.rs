//! On-disk ext4 structures with explicit little-endian serialization.
//!
//! Every structure is encoded into fixed-size byte buffers field by
//! field; nothing relies on host struct packing. Decoding support exists
//! for the handful of structures the in-crate reader needs.

use crate::{Error, Result};

/// Filesystem block size. All geometry below assumes 4 KiB blocks.
pub const BLOCK_SIZE: usize = 4096;
/// `log2(BLOCK_SIZE) - 10`.
pub const LOG_BLOCK_SIZE: u32 = 2;
/// Blocks tracked by one block group (one bitmap block's worth of bits).
pub const BLOCKS_PER_GROUP: u64 = 8 * BLOCK_SIZE as u64;
/// Inodes per block group.
pub const INODES_PER_GROUP: u32 = 4096;
/// On-disk inode record size.
pub const INODE_SIZE: usize = 256;
/// First inode number available for allocation.
pub const FIRST_INO: u32 = 11;
/// The root directory inode.
pub const ROOT_INO: u32 = 2;

/// Superblock magic.
pub const SUPER_MAGIC: u16 = 0xEF53;
/// Extent tree node magic.
pub const EXTENT_MAGIC: u16 = 0xF30A;
/// Extended attribute region magic.
pub const XATTR_MAGIC: u32 = 0xEA02_0000;

/// `s_feature_compat`: extended attributes.
pub const COMPAT_EXT_ATTR: u32 = 0x0008;
/// `s_feature_incompat`: directory entries carry a file type.
pub const INCOMPAT_FILETYPE: u32 = 0x0002;
/// `s_feature_incompat`: inodes use extent trees.
pub const INCOMPAT_EXTENTS: u32 = 0x0040;
/// `s_feature_ro_compat`: superblock backups only in sparse groups.
pub const RO_COMPAT_SPARSE_SUPER: u32 = 0x0001;
/// `s_feature_ro_compat`: files may exceed 2 GiB.
pub const RO_COMPAT_LARGE_FILE: u32 = 0x0002;
/// `s_feature_ro_compat`: inodes reserve extra space past 128 bytes.
pub const RO_COMPAT_EXTRA_ISIZE: u32 = 0x0040;

/// `i_flags`: inode uses an extent tree.
pub const EXTENTS_FL: u32 = 0x0008_0000;

/// File type bits in `i_mode`.
pub mod file_mode {
    /// FIFO.
    pub const S_IFIFO: u16 = 0x1000;
    /// Character device.
    pub const S_IFCHR: u16 = 0x2000;
    /// Directory.
    pub const S_IFDIR: u16 = 0x4000;
    /// Block device.
    pub const S_IFBLK: u16 = 0x6000;
    /// Regular file.
    pub const S_IFREG: u16 = 0x8000;
    /// Symbolic link.
    pub const S_IFLNK: u16 = 0xA000;
    /// Socket.
    pub const S_IFSOCK: u16 = 0xC000;
    /// Mask selecting the type bits.
    pub const S_IFMT: u16 = 0xF000;
}

/// Directory entry `file_type` values.
pub mod dirent_type {
    /// Regular file.
    pub const REG: u8 = 1;
    /// Directory.
    pub const DIR: u8 = 2;
    /// Character device.
    pub const CHR: u8 = 3;
    /// Block device.
    pub const BLK: u8 = 4;
    /// FIFO.
    pub const FIFO: u8 = 5;
    /// Socket.
    pub const SOCK: u8 = 6;
    /// Symbolic link.
    pub const SYM: u8 = 7;
}

/// Maps `i_mode` type bits onto the dirent file type.
pub fn dirent_type_for_mode(mode: u16) -> u8 {
    match mode & file_mode::S_IFMT {
        file_mode::S_IFREG => dirent_type::REG,
        file_mode::S_IFDIR => dirent_type::DIR,
        file_mode::S_IFCHR => dirent_type::CHR,
        file_mode::S_IFBLK => dirent_type::BLK,
        file_mode::S_IFIFO => dirent_type::FIFO,
        file_mode::S_IFSOCK => dirent_type::SOCK,
        file_mode::S_IFLNK => dirent_type::SYM,
        _ => 0,
    }
}

pub(crate) fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn get_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

pub(crate) fn get_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

/// Everything needed to render the 1024-byte superblock.
#[derive(Debug, Clone)]
pub(crate) struct Superblock {
    pub inodes_count: u32,
    pub blocks_count: u64,
    pub free_blocks: u64,
    pub free_inodes: u32,
    pub uuid: [u8; 16],
}

impl Superblock {
    /// Encodes the superblock; `group_nr` distinguishes the primary
    /// copy from backups.
    pub(crate) fn encode(&self, group_nr: u16) -> Vec<u8> {
        let mut b = vec![0u8; 1024];
        put_u32(&mut b, 0, self.inodes_count);
        put_u32(&mut b, 4, self.blocks_count as u32);
        put_u32(&mut b, 12, self.free_blocks as u32);
        put_u32(&mut b, 16, self.free_inodes);
        put_u32(&mut b, 20, 0); // first data block, 0 for 4K blocks
        put_u32(&mut b, 24, LOG_BLOCK_SIZE);
        put_u32(&mut b, 28, LOG_BLOCK_SIZE); // cluster size, no bigalloc
        put_u32(&mut b, 32, BLOCKS_PER_GROUP as u32);
        put_u32(&mut b, 36, BLOCKS_PER_GROUP as u32);
        put_u32(&mut b, 40, INODES_PER_GROUP);
        put_u16(&mut b, 52, 0); // mount count
        put_u16(&mut b, 54, 0xFFFF); // max mount count: never check
        put_u16(&mut b, 56, SUPER_MAGIC);
        put_u16(&mut b, 58, 1); // state: clean
        put_u16(&mut b, 60, 1); // errors: continue
        put_u32(&mut b, 76, 1); // revision: dynamic
        put_u32(&mut b, 84, FIRST_INO);
        put_u16(&mut b, 88, INODE_SIZE as u16);
        put_u16(&mut b, 90, group_nr);
        put_u32(&mut b, 92, COMPAT_EXT_ATTR);
        put_u32(&mut b, 96, INCOMPAT_FILETYPE | INCOMPAT_EXTENTS);
        put_u32(
            &mut b,
            100,
            RO_COMPAT_SPARSE_SUPER | RO_COMPAT_LARGE_FILE | RO_COMPAT_EXTRA_ISIZE,
        );
        b[104..120].copy_from_slice(&self.uuid);
        // desc_size stays 0 (32-byte descriptors, no 64bit feature)
        put_u16(&mut b, 348, 32); // min extra isize
        put_u16(&mut b, 350, 32); // want extra isize
        b
    }

    /// Decodes the fields the reader cares about.
    pub(crate) fn decode(b: &[u8]) -> Result<Self> {
        if get_u16(b, 56) != SUPER_MAGIC {
            return Err(Error::Corrupt("bad superblock magic".into()));
        }
        if get_u32(b, 24) != LOG_BLOCK_SIZE {
            return Err(Error::Corrupt("unexpected block size".into()));
        }
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&b[104..120]);
        Ok(Self {
            inodes_count: get_u32(b, 0),
            blocks_count: get_u32(b, 4) as u64,
            free_blocks: get_u32(b, 12) as u64,
            free_inodes: get_u32(b, 16),
            uuid,
        })
    }
}

/// One 32-byte block group descriptor.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GroupDesc {
    pub block_bitmap: u64,
    pub inode_bitmap: u64,
    pub inode_table: u64,
    pub free_blocks: u16,
    pub free_inodes: u16,
    pub used_dirs: u16,
}

impl GroupDesc {
    pub(crate) fn encode(&self) -> [u8; 32] {
        let mut b = [0u8; 32];
        put_u32(&mut b, 0, self.block_bitmap as u32);
        put_u32(&mut b, 4, self.inode_bitmap as u32);
        put_u32(&mut b, 8, self.inode_table as u32);
        put_u16(&mut b, 12, self.free_blocks);
        put_u16(&mut b, 14, self.free_inodes);
        put_u16(&mut b, 16, self.used_dirs);
        b
    }

    pub(crate) fn decode(b: &[u8]) -> Self {
        Self {
            block_bitmap: get_u32(b, 0) as u64,
            inode_bitmap: get_u32(b, 4) as u64,
            inode_table: get_u32(b, 8) as u64,
            free_blocks: get_u16(b, 12),
            free_inodes: get_u16(b, 14),
            used_dirs: get_u16(b, 16),
        }
    }
}

/// One mapped run of blocks: `len` blocks of file data starting at
/// logical block `logical`, stored at physical block `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// First logical block this extent covers.
    pub logical: u32,
    /// First physical block of the run.
    pub start: u64,
    /// Number of blocks (at most 32768).
    pub len: u16,
}

/// Encodes an extent tree node (root in `i_block` or a full leaf block).
///
/// `max_entries` is 4 for the 60-byte root, 340 for a 4 KiB leaf.
pub(crate) fn encode_extent_node(
    buf: &mut [u8],
    depth: u16,
    max_entries: u16,
    entries: &[(u32, u64, u16)],
) {
    put_u16(buf, 0, EXTENT_MAGIC);
    put_u16(buf, 2, entries.len() as u16);
    put_u16(buf, 4, max_entries);
    put_u16(buf, 6, depth);
    put_u32(buf, 8, 0); // generation
    for (i, &(logical, start, len)) in entries.iter().enumerate() {
        let at = 12 + i * 12;
        put_u32(buf, at, logical);
        if depth == 0 {
            put_u16(buf, at + 4, len);
            put_u16(buf, at + 6, (start >> 32) as u16);
            put_u32(buf, at + 8, start as u32);
        } else {
            // index node: entry points at a child block
            put_u32(buf, at + 4, start as u32);
            put_u16(buf, at + 8, (start >> 32) as u16);
            put_u16(buf, at + 10, 0);
        }
    }
}

/// Serializes directory entries into whole blocks.
///
/// Each entry is 8 bytes of header plus the name padded to 4 bytes; the
/// final entry in every block absorbs the remaining space.
pub(crate) fn encode_dirents(entries: &[(u32, u8, Vec<u8>)]) -> Vec<Vec<u8>> {
    let mut blocks = Vec::new();
    let mut block = vec![0u8; BLOCK_SIZE];
    let mut at = 0usize;
    let mut last_header = 0usize;

    for (ino, file_type, name) in entries {
        let need = 8 + name.len().div_ceil(4) * 4;
        if at + need > BLOCK_SIZE {
            // stretch the previous entry to the end of the block
            let rec_len = BLOCK_SIZE - last_header;
            put_u16(&mut block, last_header + 4, rec_len as u16);
            blocks.push(std::mem::replace(&mut block, vec![0u8; BLOCK_SIZE]));
            at = 0;
        }
        put_u32(&mut block, at, *ino);
        put_u16(&mut block, at + 4, need as u16);
        block[at + 6] = name.len() as u8;
        block[at + 7] = *file_type;
        block[at + 8..at + 8 + name.len()].copy_from_slice(name);
        last_header = at;
        at += need;
    }
    if at > 0 || blocks.is_empty() {
        let rec_len = BLOCK_SIZE - last_header;
        put_u16(&mut block, last_header + 4, rec_len as u16);
        blocks.push(block);
    }
    blocks
}

/// Known xattr name-index prefixes, per the kernel's registry.
const XATTR_PREFIXES: [(u8, &str); 7] = [
    (1, "user."),
    (2, "system.posix_acl_access"),
    (3, "system.posix_acl_default"),
    (4, "trusted."),
    (6, "security."),
    (7, "system."),
    (8, "system.richacl"),
];

/// Splits an xattr name into its on-disk (index, suffix) form.
pub(crate) fn xattr_split_name(name: &str) -> (u8, &str) {
    for (index, prefix) in XATTR_PREFIXES {
        if index == 2 || index == 3 || index == 8 {
            if name == prefix {
                return (index, "");
            }
            continue;
        }
        if let Some(suffix) = name.strip_prefix(prefix) {
            return (index, suffix);
        }
    }
    (0, name)
}

/// Rejoins an on-disk (index, suffix) pair into the full xattr name.
pub(crate) fn xattr_join_name(index: u8, suffix: &str) -> String {
    for (known, prefix) in XATTR_PREFIXES {
        if known == index {
            return if suffix.is_empty() {
                prefix.to_owned()
            } else {
                format!("{prefix}{suffix}")
            };
        }
    }
    suffix.to_owned()
}

/// The kernel's xattr entry hash, kept so shared-block tooling accepts
/// our blocks.
pub(crate) fn xattr_entry_hash(suffix: &str, value: &[u8]) -> u32 {
    const NAME_SHIFT: u32 = 5;
    const VALUE_SHIFT: u32 = 16;
    let mut hash: u32 = 0;
    for &byte in suffix.as_bytes() {
        hash = (hash << NAME_SHIFT) ^ (hash >> (32 - NAME_SHIFT)) ^ u32::from(byte);
    }
    let mut padded = value.to_vec();
    padded.resize(value.len().div_ceil(4) * 4, 0);
    for word in padded.chunks_exact(4) {
        let word = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        hash = (hash << VALUE_SHIFT) ^ (hash >> (32 - VALUE_SHIFT)) ^ word;
    }
    hash
}

/// Serializes xattr entries into a region.
///
/// `header_len` bytes are reserved at the start (4 for the inline
/// region's magic, 32 for a block header); values grow down from the
/// end. Value offsets are written relative to `value_base` — the entry
/// area for inline storage, the block start for xattr blocks. Returns
/// `None` when the attributes do not fit.
pub(crate) fn encode_xattr_region(
    region: &mut [u8],
    header_len: usize,
    value_base: usize,
    with_hashes: bool,
    attrs: &[(String, Vec<u8>)],
) -> Option<u32> {
    let mut entry_at = header_len;
    let mut value_end = region.len();
    let mut block_hash: u32 = 0;

    for (name, value) in attrs {
        let (index, suffix) = xattr_split_name(name);
        let entry_len = 16 + suffix.len().div_ceil(4) * 4;
        let value_len = value.len().div_ceil(4) * 4;
        // entries and values must not meet; keep 4 bytes for the
        // terminating null entry
        if entry_at + entry_len + 4 > value_end.checked_sub(value_len)? {
            return None;
        }
        value_end -= value_len;
        region[value_end..value_end + value.len()].copy_from_slice(value);

        region[entry_at] = suffix.len() as u8;
        region[entry_at + 1] = index;
        put_u16(region, entry_at + 2, (value_end - value_base) as u16);
        put_u32(region, entry_at + 4, 0); // value block, always inline
        put_u32(region, entry_at + 8, value.len() as u32);
        let hash = if with_hashes {
            xattr_entry_hash(suffix, value)
        } else {
            0
        };
        put_u32(region, entry_at + 12, hash);
        region[entry_at + 16..entry_at + 16 + suffix.len()]
            .copy_from_slice(suffix.as_bytes());
        entry_at += entry_len;

        const BLOCK_SHIFT: u32 = 16;
        block_hash = (block_hash << BLOCK_SHIFT) ^ (block_hash >> (32 - BLOCK_SHIFT)) ^ hash;
    }
    Some(block_hash)
}

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Container superblock magic, `NXSB` on disk.
pub const NX_MAGIC: u32 = 0x4253_584E;
/// Volume superblock magic, `APSB` on disk.
pub const APFS_MAGIC: u32 = 0x4253_5041;

pub const NX_MINIMUM_BLOCK_SIZE: u32 = 4096;
pub const NX_DEFAULT_BLOCK_SIZE: u32 = 4096;
pub const NX_MAXIMUM_BLOCK_SIZE: u32 = 65536;
pub const NX_MINIMUM_CONTAINER_SIZE: u64 = 1_048_576;
pub const NX_MAX_FILE_SYSTEMS: usize = 100;
pub const NX_NUM_COUNTERS: usize = 32;
pub const NX_EPH_INFO_COUNT: usize = 4;

/// Size of the common object envelope prefixing every persisted block.
pub const OBJECT_HEADER_SIZE: usize = 32;
/// Width of the stored Fletcher-64 digest.
pub const MAX_CKSUM_SIZE: usize = 8;

// ── Object type encoding ────────────────────────────────────────────────────

pub const OBJECT_TYPE_MASK: u32 = 0x0000_ffff;
pub const OBJECT_TYPE_FLAGS_MASK: u32 = 0xffff_0000;
pub const OBJ_STORAGETYPE_MASK: u32 = 0xc000_0000;
pub const OBJECT_TYPE_FLAGS_DEFINED_MASK: u32 = 0xf800_0000;

pub const OBJ_VIRTUAL: u32 = 0x0000_0000;
pub const OBJ_EPHEMERAL: u32 = 0x8000_0000;
pub const OBJ_PHYSICAL: u32 = 0x4000_0000;
pub const OBJ_NOHEADER: u32 = 0x2000_0000;
pub const OBJ_ENCRYPTED: u32 = 0x1000_0000;
pub const OBJ_NONPERSISTENT: u32 = 0x0800_0000;

pub const OBJECT_TYPE_INVALID: u32 = 0x0000_0000;
pub const OBJECT_TYPE_NX_SUPERBLOCK: u32 = 0x0000_0001;
pub const OBJECT_TYPE_BTREE: u32 = 0x0000_0002;
pub const OBJECT_TYPE_BTREE_NODE: u32 = 0x0000_0003;
pub const OBJECT_TYPE_SPACEMAN: u32 = 0x0000_0005;
pub const OBJECT_TYPE_SPACEMAN_CAB: u32 = 0x0000_0006;
pub const OBJECT_TYPE_SPACEMAN_CIB: u32 = 0x0000_0007;
pub const OBJECT_TYPE_SPACEMAN_BITMAP: u32 = 0x0000_0008;
pub const OBJECT_TYPE_SPACEMAN_FREE_QUEUE: u32 = 0x0000_0009;
pub const OBJECT_TYPE_EXTENT_LIST_TREE: u32 = 0x0000_000a;
pub const OBJECT_TYPE_OMAP: u32 = 0x0000_000b;
pub const OBJECT_TYPE_CHECKPOINT_MAP: u32 = 0x0000_000c;
pub const OBJECT_TYPE_FS: u32 = 0x0000_000d;
pub const OBJECT_TYPE_FSTREE: u32 = 0x0000_000e;
pub const OBJECT_TYPE_BLOCKREFTREE: u32 = 0x0000_000f;
pub const OBJECT_TYPE_SNAPMETATREE: u32 = 0x0000_0010;
pub const OBJECT_TYPE_NX_REAPER: u32 = 0x0000_0011;
pub const OBJECT_TYPE_NX_REAP_LIST: u32 = 0x0000_0012;
pub const OBJECT_TYPE_OMAP_SNAPSHOT: u32 = 0x0000_0013;
pub const OBJECT_TYPE_EFI_JUMPSTART: u32 = 0x0000_0014;
pub const OBJECT_TYPE_ER_STATE: u32 = 0x0000_0018;
pub const OBJECT_TYPE_NX_FUSION_WBC: u32 = 0x0000_0016;
pub const OBJECT_TYPE_NX_FUSION_WBC_LIST: u32 = 0x0000_0017;
pub const OBJECT_TYPE_FEXT_TREE: u32 = 0x0000_001f;

// ── Container feature masks ─────────────────────────────────────────────────

pub const NX_FEATURE_DEFRAG: u64 = 0x0000_0000_0000_0001;
pub const NX_FEATURE_LCFD: u64 = 0x0000_0000_0000_0002;
pub const NX_SUPPORTED_FEATURES_MASK: u64 = NX_FEATURE_DEFRAG | NX_FEATURE_LCFD;

pub const NX_SUPPORTED_ROCOMPAT_MASK: u64 = 0x0;

pub const NX_INCOMPAT_VERSION1: u64 = 0x0000_0000_0000_0001;
pub const NX_INCOMPAT_VERSION2: u64 = 0x0000_0000_0000_0002;
pub const NX_INCOMPAT_FUSION: u64 = 0x0000_0000_0000_0100;
pub const NX_SUPPORTED_INCOMPAT_MASK: u64 = NX_INCOMPAT_VERSION2 | NX_INCOMPAT_FUSION;

// ── Checkpoint map flags ────────────────────────────────────────────────────

pub const CHECKPOINT_MAP_LAST: u32 = 0x0000_0001;

// ── Object map flags ────────────────────────────────────────────────────────

pub const OMAP_MANUALLY_MANAGED: u32 = 0x0000_0001;
pub const OMAP_ENCRYPTING: u32 = 0x0000_0002;
pub const OMAP_DECRYPTING: u32 = 0x0000_0004;
pub const OMAP_KEYROLLING: u32 = 0x0000_0008;
pub const OMAP_CRYPTO_GENERATION: u32 = 0x0000_0010;
pub const OMAP_VALID_FLAGS: u32 = 0x0000_001f;

pub const OMAP_VAL_DELETED: u32 = 0x0000_0001;
pub const OMAP_VAL_SAVED: u32 = 0x0000_0002;
pub const OMAP_VAL_ENCRYPTED: u32 = 0x0000_0004;
pub const OMAP_VAL_NOHEADER: u32 = 0x0000_0008;
pub const OMAP_VAL_CRYPTO_GENERATION: u32 = 0x0000_0010;

// ── B-tree node / info flags ────────────────────────────────────────────────

pub const BTNODE_ROOT: u16 = 0x0001;
pub const BTNODE_LEAF: u16 = 0x0002;
pub const BTNODE_FIXED_KV_SIZE: u16 = 0x0004;
pub const BTNODE_HASHED: u16 = 0x0008;
pub const BTNODE_NOHEADER: u16 = 0x0010;
pub const BTNODE_CHECK_KOFF_INVAL: u16 = 0x8000;

pub const BTREE_UINT64_KEYS: u32 = 0x0000_0001;
pub const BTREE_SEQUENTIAL_INSERT: u32 = 0x0000_0002;
pub const BTREE_ALLOW_GHOSTS: u32 = 0x0000_0004;
pub const BTREE_EPHEMERAL: u32 = 0x0000_0008;
pub const BTREE_PHYSICAL: u32 = 0x0000_0010;
pub const BTREE_NONPERSISTENT: u32 = 0x0000_0020;
pub const BTREE_KV_NONALIGNED: u32 = 0x0000_0040;
pub const BTREE_HASHED: u32 = 0x0000_0080;
pub const BTREE_NOHEADER: u32 = 0x0000_0100;

/// Sentinel offset marking an absent (ghost) key or value slot.
pub const BTOFF_INVALID: u16 = 0xffff;
/// Size of the `btree_info` tail stored in every root node.
pub const BTREE_INFO_SIZE: usize = 40;
pub const BTREE_NODE_SIZE_DEFAULT: u32 = 4096;
pub const BTREE_NODE_MIN_ENTRY_COUNT: u32 = 4;
/// Maximum sensible tree depth; anything deeper is treated as corrupt.
pub const BTREE_MAX_LEVEL: u16 = 16;

// ── Volume superblock constants ─────────────────────────────────────────────

pub const APFS_MAX_HIST: usize = 8;
pub const APFS_VOLNAME_LEN: usize = 256;

/// Physical block address within the container.
///
/// The format declares this signed; negative addresses never refer to a
/// readable block and are rejected at the I/O boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Paddr(pub i64);

impl Paddr {
    /// Convert to an unsigned block address, rejecting negative values.
    pub fn to_block(self) -> Result<u64, ParseError> {
        u64::try_from(self.0).map_err(|_| ParseError::InvalidField {
            field: "paddr",
            reason: "negative physical address",
        })
    }
}

/// Object identifier. Doubles as a physical address for physically-stored
/// objects; the storage-class bits of the owning reference decide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Oid(pub u64);

impl Oid {
    pub const INVALID: Self = Self(0);
    pub const NX_SUPERBLOCK: Self = Self(1);
    pub const RESERVED_COUNT: u64 = 1024;

    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

/// Transaction identifier. Monotonic, container-wide; the unit of
/// point-in-time resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Xid(pub u64);

impl Xid {
    pub const INVALID: Self = Self(0);
    pub const MAX: Self = Self(u64::MAX);
}

/// Validated container block size (power of two in 4096..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two()
            || !(NX_MINIMUM_BLOCK_SIZE..=NX_MAXIMUM_BLOCK_SIZE).contains(&value)
        {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 4096..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Byte offset of a block, or `None` on overflow.
    #[must_use]
    pub fn block_to_byte(self, block: u64) -> Option<u64> {
        block.checked_mul(u64::from(self.0))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_le_i64(data: &[u8], offset: usize) -> Result<i64, ParseError> {
    read_le_u64(data, offset).map(|v| v as i64)
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Decode a NUL-padded fixed-width name field (volume names).
#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).to_string()
}

impl fmt::Display for Paddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

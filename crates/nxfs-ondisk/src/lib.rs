#![forbid(unsafe_code)]
//! On-disk structure parsing for the NXFS container format.
//!
//! Every persisted block begins with a 32-byte object envelope whose
//! first 8 bytes are a Fletcher-64 digest of the rest of the block. This
//! crate decodes the envelope and the structures behind it: container and
//! volume superblocks, checkpoint maps, object maps, and B-tree nodes.
//! Parsing is pure (`&[u8]` in, structs out) and bit-exact; anything that
//! violates the fixed layout is a `ParseError`, never a guess.

mod container;
mod fletcher;
mod node;
mod object;
mod omap;
mod volume;

pub use container::{CheckpointMapPhys, CheckpointMapping, NxSuperblock};
pub use fletcher::{fletcher64, seal_block, verify_block};
pub use node::{BtreeInfo, BtreeRawNode, Nloc, NodeEntry};
pub use object::{ObjectHeader, StorageClass};
pub use omap::{OmapKey, OmapPhys, OmapVal, OMAP_KEY_SIZE, OMAP_VAL_SIZE};
pub use volume::{
    ApfsSuperblock, APFS_VOL_ROLE_DATA, APFS_VOL_ROLE_INSTALLER, APFS_VOL_ROLE_NONE,
    APFS_VOL_ROLE_PREBOOT, APFS_VOL_ROLE_RECOVERY, APFS_VOL_ROLE_SYSTEM, APFS_VOL_ROLE_USER,
    APFS_VOL_ROLE_VM,
};

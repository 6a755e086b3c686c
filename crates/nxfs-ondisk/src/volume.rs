use nxfs_types::{
    read_fixed, read_le_u16, read_le_u32, read_le_u64, trim_nul_padded, Oid, ParseError, Xid,
    APFS_MAGIC, APFS_VOLNAME_LEN,
};
use serde::{Deserialize, Serialize};

/// Volume roles, stored as a bitfield in the superblock.
pub const APFS_VOL_ROLE_NONE: u16 = 0x0000;
pub const APFS_VOL_ROLE_SYSTEM: u16 = 0x0001;
pub const APFS_VOL_ROLE_USER: u16 = 0x0002;
pub const APFS_VOL_ROLE_RECOVERY: u16 = 0x0004;
pub const APFS_VOL_ROLE_VM: u16 = 0x0008;
pub const APFS_VOL_ROLE_PREBOOT: u16 = 0x0010;
pub const APFS_VOL_ROLE_INSTALLER: u16 = 0x0020;
pub const APFS_VOL_ROLE_DATA: u16 = 0x0040;

/// A volume superblock (`apfs_superblock`), reached through the
/// container's object map. Carries the roots of the volume's own object
/// map and filesystem tree plus identity and accounting fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApfsSuperblock {
    pub fs_index: u32,
    pub features: u64,
    pub readonly_compatible_features: u64,
    pub incompatible_features: u64,
    pub unmount_time: u64,
    pub reserve_block_count: u64,
    pub quota_block_count: u64,
    pub fs_alloc_count: u64,
    pub root_tree_type: u32,
    pub omap_oid: Oid,
    pub root_tree_oid: Oid,
    pub extentref_tree_oid: Oid,
    pub snap_meta_tree_oid: Oid,
    pub revert_to_xid: Xid,
    pub next_obj_id: u64,
    pub num_files: u64,
    pub num_directories: u64,
    pub num_symlinks: u64,
    pub num_other_fsobjects: u64,
    pub num_snapshots: u64,
    pub vol_uuid: [u8; 16],
    pub last_mod_time: u64,
    pub fs_flags: u64,
    pub volname: String,
    pub role: u16,
}

impl ApfsSuperblock {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(block, 32)?;
        if magic != APFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(APFS_MAGIC),
                actual: u64::from(magic),
            });
        }

        let volname_bytes: [u8; APFS_VOLNAME_LEN] = read_fixed(block, 704)?;

        Ok(Self {
            fs_index: read_le_u32(block, 36)?,
            features: read_le_u64(block, 40)?,
            readonly_compatible_features: read_le_u64(block, 48)?,
            incompatible_features: read_le_u64(block, 56)?,
            unmount_time: read_le_u64(block, 64)?,
            reserve_block_count: read_le_u64(block, 72)?,
            quota_block_count: read_le_u64(block, 80)?,
            fs_alloc_count: read_le_u64(block, 88)?,
            root_tree_type: read_le_u32(block, 116)?,
            omap_oid: Oid(read_le_u64(block, 128)?),
            root_tree_oid: Oid(read_le_u64(block, 136)?),
            extentref_tree_oid: Oid(read_le_u64(block, 144)?),
            snap_meta_tree_oid: Oid(read_le_u64(block, 152)?),
            revert_to_xid: Xid(read_le_u64(block, 160)?),
            next_obj_id: read_le_u64(block, 176)?,
            num_files: read_le_u64(block, 184)?,
            num_directories: read_le_u64(block, 192)?,
            num_symlinks: read_le_u64(block, 200)?,
            num_other_fsobjects: read_le_u64(block, 208)?,
            num_snapshots: read_le_u64(block, 216)?,
            vol_uuid: read_fixed(block, 240)?,
            last_mod_time: read_le_u64(block, 256)?,
            fs_flags: read_le_u64(block, 264)?,
            volname: trim_nul_padded(&volname_bytes),
            role: read_le_u16(block, 964)?,
        })
    }

    #[must_use]
    pub fn has_role(&self, role: u16) -> bool {
        self.role & role != 0
    }

    /// Whether the volume's own object map is present. A volume without
    /// one cannot resolve any virtual object it owns.
    #[must_use]
    pub fn has_omap(&self) -> bool {
        self.omap_oid.is_valid()
    }
}

use nxfs_types::{
    read_le_i64, read_le_u32, read_le_u64, Oid, Paddr, ParseError, Xid, OBJECT_HEADER_SIZE,
    OMAP_VALID_FLAGS, OMAP_VAL_DELETED, OMAP_VAL_NOHEADER, OMAP_VAL_SAVED,
};
use serde::{Deserialize, Serialize};

/// On-disk size of an `omap_key`.
pub const OMAP_KEY_SIZE: usize = 16;
/// On-disk size of an `omap_val`.
pub const OMAP_VAL_SIZE: usize = 16;

/// Object map header (`omap_phys`): the self-describing structure owning
/// one B-tree of (oid, xid) → location records, plus snapshot metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmapPhys {
    pub flags: u32,
    pub snap_count: u32,
    pub tree_type: u32,
    pub snapshot_tree_type: u32,
    pub tree_oid: Oid,
    pub snapshot_tree_oid: Oid,
    pub most_recent_snap: Xid,
    pub pending_revert_min: Xid,
    pub pending_revert_max: Xid,
}

impl OmapPhys {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let base = OBJECT_HEADER_SIZE;
        let flags = read_le_u32(block, base)?;
        if flags & !OMAP_VALID_FLAGS != 0 {
            return Err(ParseError::InvalidField {
                field: "om_flags",
                reason: "unknown object-map flag bits",
            });
        }

        let omap = Self {
            flags,
            snap_count: read_le_u32(block, base + 4)?,
            tree_type: read_le_u32(block, base + 8)?,
            snapshot_tree_type: read_le_u32(block, base + 12)?,
            tree_oid: Oid(read_le_u64(block, base + 16)?),
            snapshot_tree_oid: Oid(read_le_u64(block, base + 24)?),
            most_recent_snap: Xid(read_le_u64(block, base + 32)?),
            pending_revert_min: Xid(read_le_u64(block, base + 40)?),
            pending_revert_max: Xid(read_le_u64(block, base + 48)?),
        };

        if !omap.tree_oid.is_valid() {
            return Err(ParseError::InvalidField {
                field: "om_tree_oid",
                reason: "object map has no backing tree",
            });
        }

        Ok(omap)
    }
}

/// Object-map B-tree key: (object id, transaction id), ordered by oid
/// then xid, both ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OmapKey {
    pub oid: Oid,
    pub xid: Xid,
}

impl OmapKey {
    #[must_use]
    pub fn new(oid: Oid, xid: Xid) -> Self {
        Self { oid, xid }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            oid: Oid(read_le_u64(bytes, 0)?),
            xid: Xid(read_le_u64(bytes, 8)?),
        })
    }

    /// Encode for use as a B-tree search key.
    #[must_use]
    pub fn to_bytes(self) -> [u8; OMAP_KEY_SIZE] {
        let mut out = [0_u8; OMAP_KEY_SIZE];
        out[..8].copy_from_slice(&self.oid.0.to_le_bytes());
        out[8..].copy_from_slice(&self.xid.0.to_le_bytes());
        out
    }
}

/// Object-map B-tree value: a physical location, or a tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmapVal {
    pub flags: u32,
    pub size: u32,
    pub paddr: Paddr,
}

impl OmapVal {
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            flags: read_le_u32(bytes, 0)?,
            size: read_le_u32(bytes, 4)?,
            paddr: Paddr(read_le_i64(bytes, 8)?),
        })
    }

    /// A deleted entry: the object existed and was explicitly removed at
    /// this transaction. Distinct from absence.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.flags & OMAP_VAL_DELETED != 0
    }

    #[must_use]
    pub fn is_saved(&self) -> bool {
        self.flags & OMAP_VAL_SAVED != 0
    }

    #[must_use]
    pub fn has_header(&self) -> bool {
        self.flags & OMAP_VAL_NOHEADER == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nxfs_types::OMAP_MANUALLY_MANAGED;

    fn omap_block(flags: u32, tree_oid: u64) -> Vec<u8> {
        let mut block = vec![0_u8; 4096];
        block[32..36].copy_from_slice(&flags.to_le_bytes());
        block[40..44].copy_from_slice(&2_u32.to_le_bytes()); // tree_type: physical btree
        block[48..56].copy_from_slice(&tree_oid.to_le_bytes());
        block[64..72].copy_from_slice(&7_u64.to_le_bytes()); // most_recent_snap
        block
    }

    #[test]
    fn parse_omap_smoke() {
        let omap = OmapPhys::parse(&omap_block(OMAP_MANUALLY_MANAGED, 42)).expect("parse");
        assert_eq!(omap.flags, OMAP_MANUALLY_MANAGED);
        assert_eq!(omap.tree_oid, Oid(42));
        assert_eq!(omap.most_recent_snap, Xid(7));
    }

    #[test]
    fn rejects_unknown_flags() {
        let err = OmapPhys::parse(&omap_block(0x8000_0000, 42)).unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidField {
                field: "om_flags",
                ..
            }
        ));
    }

    #[test]
    fn rejects_missing_tree() {
        let err = OmapPhys::parse(&omap_block(0, 0)).unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidField {
                field: "om_tree_oid",
                ..
            }
        ));
    }

    #[test]
    fn key_round_trip_and_ordering() {
        let key = OmapKey::new(Oid(23), Xid(17));
        let parsed = OmapKey::parse(&key.to_bytes()).expect("parse");
        assert_eq!(parsed, key);

        // Ordered by oid first, then xid.
        assert!(OmapKey::new(Oid(21), Xid(18)) < key);
        assert!(OmapKey::new(Oid(23), Xid(16)) < key);
        assert!(OmapKey::new(Oid(23), Xid(18)) > key);
        assert!(OmapKey::new(Oid(25), Xid(16)) > key);
    }

    #[test]
    fn val_tombstone_flag() {
        let mut bytes = [0_u8; OMAP_VAL_SIZE];
        bytes[..4].copy_from_slice(&OMAP_VAL_DELETED.to_le_bytes());
        let val = OmapVal::parse(&bytes).expect("parse");
        assert!(val.is_deleted());
        assert!(val.has_header());

        let live = OmapVal::parse(&[0_u8; OMAP_VAL_SIZE]).expect("parse");
        assert!(!live.is_deleted());
    }

    #[test]
    fn val_parse_fields() {
        let mut bytes = [0_u8; OMAP_VAL_SIZE];
        bytes[4..8].copy_from_slice(&4096_u32.to_le_bytes());
        bytes[8..16].copy_from_slice(&(1234_i64).to_le_bytes());
        let val = OmapVal::parse(&bytes).expect("parse");
        assert_eq!(val.size, 4096);
        assert_eq!(val.paddr, Paddr(1234));
    }
}

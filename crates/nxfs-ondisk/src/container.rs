use nxfs_types::{
    read_fixed, read_le_i64, read_le_u32, read_le_u64, BlockSize, Oid, Paddr, ParseError, Xid,
    CHECKPOINT_MAP_LAST, NX_MAGIC, NX_MAX_FILE_SYSTEMS, NX_SUPPORTED_INCOMPAT_MASK,
    OBJECT_HEADER_SIZE, OBJECT_TYPE_BTREE, OBJECT_TYPE_BTREE_NODE, OBJECT_TYPE_ER_STATE,
    OBJECT_TYPE_MASK, OBJECT_TYPE_NX_FUSION_WBC, OBJECT_TYPE_NX_FUSION_WBC_LIST,
    OBJECT_TYPE_NX_REAPER, OBJECT_TYPE_NX_REAP_LIST, OBJECT_TYPE_SPACEMAN,
    OBJECT_TYPE_SPACEMAN_FREE_QUEUE,
};
use serde::{Deserialize, Serialize};

/// Byte size of one `checkpoint_mapping` entry on disk.
const CHECKPOINT_MAPPING_SIZE: usize = 40;
/// First mapping entry follows flags + count.
const CHECKPOINT_MAP_ENTRIES_OFFSET: usize = OBJECT_HEADER_SIZE + 8;

/// Container superblock (`nx_superblock`).
///
/// Found via the checkpoint descriptor ring, not the object map. Owns the
/// container-level object map and the volume object-id table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NxSuperblock {
    pub magic: u32,
    pub block_size: BlockSize,
    pub block_count: u64,
    pub features: u64,
    pub readonly_compatible_features: u64,
    pub incompatible_features: u64,
    pub uuid: [u8; 16],
    pub next_oid: Oid,
    pub next_xid: Xid,
    pub xp_desc_blocks: u32,
    pub xp_data_blocks: u32,
    pub xp_desc_base: Paddr,
    pub xp_data_base: Paddr,
    pub xp_desc_next: u32,
    pub xp_data_next: u32,
    pub xp_desc_index: u32,
    pub xp_desc_len: u32,
    pub xp_data_index: u32,
    pub xp_data_len: u32,
    pub spaceman_oid: Oid,
    pub omap_oid: Oid,
    pub reaper_oid: Oid,
    pub max_file_systems: u32,
    pub fs_oids: Vec<Oid>,
}

impl NxSuperblock {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(block, 32)?;
        if magic != NX_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(NX_MAGIC),
                actual: u64::from(magic),
            });
        }

        let block_size = BlockSize::new(read_le_u32(block, 36)?)?;
        let block_count = read_le_u64(block, 40)?;
        if block_count == 0 {
            return Err(ParseError::InvalidField {
                field: "nx_block_count",
                reason: "container has zero blocks",
            });
        }

        let xp_desc_blocks = read_le_u32(block, 104)?;
        // The high bit would mark a tree-backed descriptor area; plain
        // contiguous rings only here.
        if xp_desc_blocks & 0x8000_0000 != 0 {
            return Err(ParseError::InvalidField {
                field: "nx_xp_desc_blocks",
                reason: "tree-backed checkpoint descriptor areas are not supported",
            });
        }

        let max_file_systems = read_le_u32(block, 180)?;
        let fs_slots = usize::try_from(max_file_systems)
            .map_err(|_| ParseError::IntegerConversion {
                field: "nx_max_file_systems",
            })?
            .min(NX_MAX_FILE_SYSTEMS);
        let mut fs_oids = Vec::with_capacity(fs_slots);
        for idx in 0..fs_slots {
            fs_oids.push(Oid(read_le_u64(block, 184 + idx * 8)?));
        }

        Ok(Self {
            magic,
            block_size,
            block_count,
            features: read_le_u64(block, 48)?,
            readonly_compatible_features: read_le_u64(block, 56)?,
            incompatible_features: read_le_u64(block, 64)?,
            uuid: read_fixed::<16>(block, 72)?,
            next_oid: Oid(read_le_u64(block, 88)?),
            next_xid: Xid(read_le_u64(block, 96)?),
            xp_desc_blocks,
            xp_data_blocks: read_le_u32(block, 108)?,
            xp_desc_base: Paddr(read_le_i64(block, 112)?),
            xp_data_base: Paddr(read_le_i64(block, 120)?),
            xp_desc_next: read_le_u32(block, 128)?,
            xp_data_next: read_le_u32(block, 132)?,
            xp_desc_index: read_le_u32(block, 136)?,
            xp_desc_len: read_le_u32(block, 140)?,
            xp_data_index: read_le_u32(block, 144)?,
            xp_data_len: read_le_u32(block, 148)?,
            spaceman_oid: Oid(read_le_u64(block, 152)?),
            omap_oid: Oid(read_le_u64(block, 160)?),
            reaper_oid: Oid(read_le_u64(block, 168)?),
            max_file_systems,
            fs_oids,
        })
    }

    /// Incompatible-feature bits this engine does not honor. Non-zero
    /// means mounting must fail with `IncompatibleFeature`.
    #[must_use]
    pub fn unsupported_incompat_bits(&self) -> u64 {
        self.incompatible_features & !NX_SUPPORTED_INCOMPAT_MASK
    }

    /// The volume object id at `index`, or `None` for a sparse slot.
    #[must_use]
    pub fn fs_oid(&self, index: usize) -> Option<Oid> {
        self.fs_oids
            .get(index)
            .copied()
            .filter(|oid| oid.is_valid())
    }
}

/// One entry of a checkpoint-mapping block: an ephemeral object's
/// location within the checkpoint data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMapping {
    pub object_type: u32,
    pub subtype: u32,
    pub size: u32,
    pub fs_oid: Oid,
    pub oid: Oid,
    pub paddr: Paddr,
}

impl CheckpointMapping {
    /// Whether this mapping references an object kind the engine
    /// recognizes as checkpoint-bound ephemeral state.
    #[must_use]
    pub fn is_recognized_ephemeral(&self) -> bool {
        matches!(
            self.object_type & OBJECT_TYPE_MASK,
            OBJECT_TYPE_SPACEMAN
                | OBJECT_TYPE_SPACEMAN_FREE_QUEUE
                | OBJECT_TYPE_BTREE
                | OBJECT_TYPE_BTREE_NODE
                | OBJECT_TYPE_NX_REAPER
                | OBJECT_TYPE_NX_REAP_LIST
                | OBJECT_TYPE_ER_STATE
                | OBJECT_TYPE_NX_FUSION_WBC
                | OBJECT_TYPE_NX_FUSION_WBC_LIST
        )
    }
}

/// Checkpoint-mapping block (`checkpoint_map_phys`).
///
/// A checkpoint's mapping blocks are contiguous in the descriptor ring
/// and the final one carries the LAST flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMapPhys {
    pub flags: u32,
    pub mappings: Vec<CheckpointMapping>,
}

impl CheckpointMapPhys {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let flags = read_le_u32(block, OBJECT_HEADER_SIZE)?;
        let count = read_le_u32(block, OBJECT_HEADER_SIZE + 4)?;

        let count = usize::try_from(count)
            .map_err(|_| ParseError::IntegerConversion { field: "cpm_count" })?;
        let table_bytes = count
            .checked_mul(CHECKPOINT_MAPPING_SIZE)
            .ok_or(ParseError::InvalidField {
                field: "cpm_count",
                reason: "mapping table size overflow",
            })?;
        let table_end = CHECKPOINT_MAP_ENTRIES_OFFSET
            .checked_add(table_bytes)
            .ok_or(ParseError::InvalidField {
                field: "cpm_count",
                reason: "mapping table size overflow",
            })?;
        if table_end > block.len() {
            return Err(ParseError::InsufficientData {
                needed: table_bytes,
                offset: CHECKPOINT_MAP_ENTRIES_OFFSET,
                actual: block.len().saturating_sub(CHECKPOINT_MAP_ENTRIES_OFFSET),
            });
        }

        let mut mappings = Vec::with_capacity(count);
        for idx in 0..count {
            let base = CHECKPOINT_MAP_ENTRIES_OFFSET + idx * CHECKPOINT_MAPPING_SIZE;
            mappings.push(CheckpointMapping {
                object_type: read_le_u32(block, base)?,
                subtype: read_le_u32(block, base + 4)?,
                size: read_le_u32(block, base + 8)?,
                // 4 pad bytes at base + 12
                fs_oid: Oid(read_le_u64(block, base + 16)?),
                oid: Oid(read_le_u64(block, base + 24)?),
                paddr: Paddr(read_le_i64(block, base + 32)?),
            });
        }

        Ok(Self { flags, mappings })
    }

    /// Whether this is the final mapping block of its checkpoint.
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.flags & CHECKPOINT_MAP_LAST != 0
    }

    /// Find the mapping for an ephemeral object id.
    #[must_use]
    pub fn lookup(&self, oid: Oid) -> Option<&CheckpointMapping> {
        self.mappings.iter().find(|mapping| mapping.oid == oid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nxfs_types::{NX_INCOMPAT_VERSION2, OBJECT_TYPE_EFI_JUMPSTART};

    fn minimal_superblock_block() -> Vec<u8> {
        let mut block = vec![0_u8; 4096];
        block[32..36].copy_from_slice(&NX_MAGIC.to_le_bytes());
        block[36..40].copy_from_slice(&4096_u32.to_le_bytes());
        block[40..48].copy_from_slice(&2048_u64.to_le_bytes());
        block[104..108].copy_from_slice(&8_u32.to_le_bytes()); // xp_desc_blocks
        block[112..120].copy_from_slice(&1_i64.to_le_bytes()); // xp_desc_base
        block[160..168].copy_from_slice(&900_u64.to_le_bytes()); // omap_oid
        block[180..184].copy_from_slice(&100_u32.to_le_bytes()); // max_file_systems
        block[184..192].copy_from_slice(&1027_u64.to_le_bytes()); // fs_oid[0]
        block
    }

    #[test]
    fn parse_superblock_smoke() {
        let sb = NxSuperblock::parse(&minimal_superblock_block()).expect("parse");
        assert_eq!(sb.block_size.get(), 4096);
        assert_eq!(sb.block_count, 2048);
        assert_eq!(sb.xp_desc_blocks, 8);
        assert_eq!(sb.xp_desc_base, Paddr(1));
        assert_eq!(sb.omap_oid, Oid(900));
        assert_eq!(sb.fs_oids.len(), 100);
        assert_eq!(sb.fs_oid(0), Some(Oid(1027)));
        assert_eq!(sb.fs_oid(1), None, "zero slot is sparse");
        assert_eq!(sb.fs_oid(100), None, "past the table");
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut block = minimal_superblock_block();
        block[32..36].copy_from_slice(b"EXT4");
        let err = NxSuperblock::parse(&block).unwrap_err();
        assert!(matches!(err, ParseError::InvalidMagic { .. }));
    }

    #[test]
    fn rejects_bad_block_size() {
        let mut block = minimal_superblock_block();
        block[36..40].copy_from_slice(&1024_u32.to_le_bytes());
        assert!(NxSuperblock::parse(&block).is_err());
    }

    #[test]
    fn rejects_tree_backed_descriptor_area() {
        let mut block = minimal_superblock_block();
        block[104..108].copy_from_slice(&0x8000_0008_u32.to_le_bytes());
        let err = NxSuperblock::parse(&block).unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidField {
                field: "nx_xp_desc_blocks",
                ..
            }
        ));
    }

    #[test]
    fn incompat_mask_split() {
        let mut block = minimal_superblock_block();
        block[64..72].copy_from_slice(&(NX_INCOMPAT_VERSION2 | 0x400).to_le_bytes());
        let sb = NxSuperblock::parse(&block).expect("parse");
        assert_eq!(sb.unsupported_incompat_bits(), 0x400);

        let mut supported = minimal_superblock_block();
        supported[64..72].copy_from_slice(&NX_INCOMPAT_VERSION2.to_le_bytes());
        let sb = NxSuperblock::parse(&supported).expect("parse");
        assert_eq!(sb.unsupported_incompat_bits(), 0);
    }

    fn map_block(flags: u32, entries: &[(u32, u64, i64)]) -> Vec<u8> {
        let mut block = vec![0_u8; 4096];
        block[32..36].copy_from_slice(&flags.to_le_bytes());
        block[36..40].copy_from_slice(
            &u32::try_from(entries.len()).expect("count").to_le_bytes(),
        );
        for (idx, (object_type, oid, paddr)) in entries.iter().enumerate() {
            let base = 40 + idx * CHECKPOINT_MAPPING_SIZE;
            block[base..base + 4].copy_from_slice(&object_type.to_le_bytes());
            block[base + 24..base + 32].copy_from_slice(&oid.to_le_bytes());
            block[base + 32..base + 40].copy_from_slice(&paddr.to_le_bytes());
        }
        block
    }

    #[test]
    fn parse_checkpoint_map_smoke() {
        let block = map_block(
            CHECKPOINT_MAP_LAST,
            &[
                (OBJECT_TYPE_SPACEMAN | 0x8000_0000, 0x400, 20),
                (OBJECT_TYPE_NX_REAPER | 0x8000_0000, 0x401, 21),
            ],
        );
        let map = CheckpointMapPhys::parse(&block).expect("parse");
        assert!(map.is_last());
        assert_eq!(map.mappings.len(), 2);
        assert!(map.mappings.iter().all(CheckpointMapping::is_recognized_ephemeral));

        let hit = map.lookup(Oid(0x401)).expect("mapping present");
        assert_eq!(hit.paddr, Paddr(21));
        assert!(map.lookup(Oid(0x999)).is_none());
    }

    #[test]
    fn unrecognized_mapping_kind_flagged() {
        let block = map_block(0, &[(OBJECT_TYPE_EFI_JUMPSTART, 0x500, 30)]);
        let map = CheckpointMapPhys::parse(&block).expect("parse");
        assert!(!map.is_last());
        assert!(!map.mappings[0].is_recognized_ephemeral());
    }

    #[test]
    fn mapping_count_beyond_block_rejected() {
        let mut block = map_block(CHECKPOINT_MAP_LAST, &[]);
        block[36..40].copy_from_slice(&200_u32.to_le_bytes());
        let err = CheckpointMapPhys::parse(&block).unwrap_err();
        assert!(matches!(err, ParseError::InsufficientData { .. }));
    }
}

#![forbid(unsafe_code)]
//! Synthetic container images for tests.
//!
//! Builders here assemble bit-exact container images in memory: sealed
//! blocks with object envelopes, a checkpoint descriptor ring, object
//! maps backed by real tree nodes, and volume superblocks. Tests mount
//! the result through the normal read path, so nothing in here bypasses
//! checksum or structure validation.

use nxfs_block::{ByteBlockDevice, MemoryByteDevice};
use nxfs_ondisk::seal_block;
use nxfs_types::{
    Oid, Xid, APFS_MAGIC, BTNODE_FIXED_KV_SIZE, BTNODE_LEAF, BTNODE_ROOT, BTOFF_INVALID,
    BTREE_INFO_SIZE, BTREE_PHYSICAL, CHECKPOINT_MAP_LAST, NX_MAGIC, OBJECT_TYPE_BTREE,
    OBJECT_TYPE_BTREE_NODE, OBJECT_TYPE_CHECKPOINT_MAP, OBJECT_TYPE_FS,
    OBJECT_TYPE_NX_SUPERBLOCK, OBJECT_TYPE_OMAP, OBJ_EPHEMERAL, OBJ_PHYSICAL, OMAP_VAL_DELETED,
};

/// All builder images use the minimum block size.
pub const BLOCK_SIZE: usize = 4096;

const NODE_DATA_START: usize = 56;
const NODE_TABLE_LEN: usize = 256;

/// A container image under construction: a fixed number of blocks, each
/// placed explicitly and sealed on insertion.
pub struct ImageBuilder {
    blocks: Vec<Vec<u8>>,
}

impl ImageBuilder {
    #[must_use]
    pub fn new(block_count: u64) -> Self {
        Self {
            blocks: vec![vec![0_u8; BLOCK_SIZE]; block_count as usize],
        }
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.blocks.len() as u64
    }

    /// Seal `bytes` and place them at `addr`.
    pub fn put(&mut self, addr: u64, mut bytes: Vec<u8>) {
        assert_eq!(bytes.len(), BLOCK_SIZE, "builder blocks are {BLOCK_SIZE} bytes");
        seal_block(&mut bytes).expect("seal");
        self.blocks[addr as usize] = bytes;
    }

    /// Place `bytes` at `addr` without sealing, for torn-write scenarios.
    pub fn put_unsealed(&mut self, addr: u64, bytes: Vec<u8>) {
        assert_eq!(bytes.len(), BLOCK_SIZE);
        self.blocks[addr as usize] = bytes;
    }

    /// Flip one bit of the already-placed block at `addr`.
    pub fn corrupt_bit(&mut self, addr: u64, byte: usize, bit: u8) {
        self.blocks[addr as usize][byte] ^= 1 << bit;
    }

    #[must_use]
    pub fn build(self) -> Vec<u8> {
        self.blocks.into_iter().flatten().collect()
    }

    #[must_use]
    pub fn into_device(self) -> ByteBlockDevice<MemoryByteDevice> {
        ByteBlockDevice::new(MemoryByteDevice::new(self.build()), BLOCK_SIZE as u32)
            .expect("device")
    }
}

/// Stamp the 32-byte object envelope. The checksum field is left for
/// [`ImageBuilder::put`] to fill.
pub fn stamp_header(block: &mut [u8], oid: Oid, xid: Xid, object_type: u32, subtype: u32) {
    block[8..16].copy_from_slice(&oid.0.to_le_bytes());
    block[16..24].copy_from_slice(&xid.0.to_le_bytes());
    block[24..28].copy_from_slice(&object_type.to_le_bytes());
    block[28..32].copy_from_slice(&subtype.to_le_bytes());
}

// ── container superblock ─────────────────────────────────────────────────

/// Fields of a container superblock the builders care about.
#[derive(Debug, Clone)]
pub struct SuperblockSpec {
    pub xid: Xid,
    pub block_count: u64,
    pub incompatible_features: u64,
    pub xp_desc_base: u64,
    pub xp_desc_blocks: u32,
    /// Start slot and length of this checkpoint's span in the ring.
    pub xp_desc_index: u32,
    pub xp_desc_len: u32,
    /// Physical address of the container object map.
    pub omap_addr: u64,
    /// (slot, volume oid) pairs for the volume table.
    pub volumes: Vec<(usize, Oid)>,
}

#[must_use]
pub fn superblock_block(spec: &SuperblockSpec) -> Vec<u8> {
    let mut block = vec![0_u8; BLOCK_SIZE];
    stamp_header(
        &mut block,
        Oid::NX_SUPERBLOCK,
        spec.xid,
        OBJECT_TYPE_NX_SUPERBLOCK | OBJ_EPHEMERAL,
        0,
    );
    block[32..36].copy_from_slice(&NX_MAGIC.to_le_bytes());
    block[36..40].copy_from_slice(&(BLOCK_SIZE as u32).to_le_bytes());
    block[40..48].copy_from_slice(&spec.block_count.to_le_bytes());
    block[64..72].copy_from_slice(&spec.incompatible_features.to_le_bytes());
    block[96..104].copy_from_slice(&(spec.xid.0 + 1).to_le_bytes()); // next_xid
    block[104..108].copy_from_slice(&spec.xp_desc_blocks.to_le_bytes());
    block[112..120].copy_from_slice(&(spec.xp_desc_base as i64).to_le_bytes());
    block[136..140].copy_from_slice(&spec.xp_desc_index.to_le_bytes());
    block[140..144].copy_from_slice(&spec.xp_desc_len.to_le_bytes());
    block[160..168].copy_from_slice(&spec.omap_addr.to_le_bytes());
    block[180..184].copy_from_slice(&100_u32.to_le_bytes()); // max_file_systems
    for (slot, oid) in &spec.volumes {
        let at = 184 + slot * 8;
        block[at..at + 8].copy_from_slice(&oid.0.to_le_bytes());
    }
    block
}

// ── checkpoint map block ─────────────────────────────────────────────────

/// One ephemeral mapping for a checkpoint map block.
#[derive(Debug, Clone, Copy)]
pub struct MappingSpec {
    pub object_type: u32,
    pub oid: Oid,
    pub paddr: u64,
}

#[must_use]
pub fn checkpoint_map_block(xid: Xid, last: bool, mappings: &[MappingSpec]) -> Vec<u8> {
    let mut block = vec![0_u8; BLOCK_SIZE];
    stamp_header(
        &mut block,
        Oid(u64::MAX), // checkpoint maps are addressed by position, not oid
        xid,
        OBJECT_TYPE_CHECKPOINT_MAP | OBJ_PHYSICAL,
        0,
    );
    let flags = if last { CHECKPOINT_MAP_LAST } else { 0 };
    block[32..36].copy_from_slice(&flags.to_le_bytes());
    block[36..40].copy_from_slice(&(mappings.len() as u32).to_le_bytes());
    for (idx, mapping) in mappings.iter().enumerate() {
        let base = 40 + idx * 40;
        block[base..base + 4].copy_from_slice(&mapping.object_type.to_le_bytes());
        block[base + 8..base + 12].copy_from_slice(&(BLOCK_SIZE as u32).to_le_bytes());
        block[base + 24..base + 32].copy_from_slice(&mapping.oid.0.to_le_bytes());
        block[base + 32..base + 40].copy_from_slice(&(mapping.paddr as i64).to_le_bytes());
    }
    block
}

// ── object maps ──────────────────────────────────────────────────────────

/// One record of an object-map tree.
#[derive(Debug, Clone, Copy)]
pub struct OmapRecord {
    pub oid: Oid,
    pub xid: Xid,
    pub paddr: u64,
    pub deleted: bool,
}

impl OmapRecord {
    #[must_use]
    pub fn live(oid: Oid, xid: Xid, paddr: u64) -> Self {
        Self {
            oid,
            xid,
            paddr,
            deleted: false,
        }
    }

    #[must_use]
    pub fn tombstone(oid: Oid, xid: Xid) -> Self {
        Self {
            oid,
            xid,
            paddr: 0,
            deleted: true,
        }
    }
}

/// The `omap_phys` header block pointing at a tree root.
#[must_use]
pub fn omap_phys_block(addr: u64, xid: Xid, tree_root: u64) -> Vec<u8> {
    let mut block = vec![0_u8; BLOCK_SIZE];
    stamp_header(
        &mut block,
        Oid(addr),
        xid,
        OBJECT_TYPE_OMAP | OBJ_PHYSICAL,
        0,
    );
    block[40..44].copy_from_slice(&(OBJECT_TYPE_BTREE | OBJ_PHYSICAL).to_le_bytes()); // tree_type
    block[48..56].copy_from_slice(&tree_root.to_le_bytes());
    block
}

fn omap_slot(record: &OmapRecord) -> (Vec<u8>, Vec<u8>) {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&record.oid.0.to_le_bytes());
    key.extend_from_slice(&record.xid.0.to_le_bytes());
    let mut val = Vec::with_capacity(16);
    let flags = if record.deleted { OMAP_VAL_DELETED } else { 0 };
    val.extend_from_slice(&flags.to_le_bytes());
    val.extend_from_slice(&(BLOCK_SIZE as u32).to_le_bytes());
    val.extend_from_slice(&(record.paddr as i64).to_le_bytes());
    (key, val)
}

/// A single-node object-map tree: root leaf, fixed 16-byte keys and
/// values. Records must be supplied in (oid, xid) order.
#[must_use]
pub fn omap_tree_root_block(addr: u64, xid: Xid, records: &[OmapRecord]) -> Vec<u8> {
    assert!(
        records.len() <= OMAP_NODE_CAPACITY,
        "records overflow a single node"
    );
    btree_node_block(&NodeSpec {
        addr,
        xid,
        object_type: OBJECT_TYPE_BTREE | OBJ_PHYSICAL,
        subtype: OBJECT_TYPE_OMAP,
        flags: BTNODE_ROOT | BTNODE_LEAF | BTNODE_FIXED_KV_SIZE,
        level: 0,
        slots: records.iter().map(omap_slot).collect(),
        info: Some(InfoSpec {
            flags: BTREE_PHYSICAL,
            key_size: 16,
            val_size: 16,
        }),
    })
}

/// Records one fixed-layout node can hold; bounded by the 4-byte ToC
/// slots fitting the table space.
pub const OMAP_NODE_CAPACITY: usize = NODE_TABLE_LEN / 4;

/// An object-map tree split into real nodes at node capacity. Returns
/// `(address, block)` pairs: the root at `root_addr` and, when the
/// records overflow a single node, leaves at the addresses directly
/// after it, referenced by physical child pointers. Records must be
/// supplied in (oid, xid) order.
#[must_use]
pub fn omap_tree_blocks(root_addr: u64, xid: Xid, records: &[OmapRecord]) -> Vec<(u64, Vec<u8>)> {
    if records.len() <= OMAP_NODE_CAPACITY {
        return vec![(root_addr, omap_tree_root_block(root_addr, xid, records))];
    }
    assert!(
        records.len() <= OMAP_NODE_CAPACITY * OMAP_NODE_CAPACITY,
        "builder trees are at most two levels"
    );

    let mut out = Vec::new();
    let mut index_slots = Vec::new();
    for (i, chunk) in records.chunks(OMAP_NODE_CAPACITY).enumerate() {
        let addr = root_addr + 1 + i as u64;
        out.push((
            addr,
            btree_node_block(&NodeSpec {
                addr,
                xid,
                object_type: OBJECT_TYPE_BTREE_NODE | OBJ_PHYSICAL,
                subtype: OBJECT_TYPE_OMAP,
                flags: BTNODE_LEAF | BTNODE_FIXED_KV_SIZE,
                level: 0,
                slots: chunk.iter().map(omap_slot).collect(),
                info: None,
            }),
        ));
        let (first_key, _) = omap_slot(&chunk[0]);
        index_slots.push((first_key, addr.to_le_bytes().to_vec()));
    }

    out.insert(
        0,
        (
            root_addr,
            btree_node_block(&NodeSpec {
                addr: root_addr,
                xid,
                object_type: OBJECT_TYPE_BTREE | OBJ_PHYSICAL,
                subtype: OBJECT_TYPE_OMAP,
                flags: BTNODE_ROOT | BTNODE_FIXED_KV_SIZE,
                level: 1,
                slots: index_slots,
                info: Some(InfoSpec {
                    flags: BTREE_PHYSICAL,
                    key_size: 16,
                    val_size: 16,
                }),
            }),
        ),
    );
    out
}

// ── generic tree nodes ───────────────────────────────────────────────────

/// Tree-descriptor fields for a root node's tail.
#[derive(Debug, Clone, Copy)]
pub struct InfoSpec {
    pub flags: u32,
    pub key_size: u32,
    pub val_size: u32,
}

/// Layout of one tree node block.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub addr: u64,
    pub xid: Xid,
    pub object_type: u32,
    pub subtype: u32,
    pub flags: u16,
    pub level: u16,
    /// (key, value) pairs; an empty value marks a ghost slot.
    pub slots: Vec<(Vec<u8>, Vec<u8>)>,
    /// Present on root nodes only.
    pub info: Option<InfoSpec>,
}

#[must_use]
pub fn btree_node_block(spec: &NodeSpec) -> Vec<u8> {
    let mut block = vec![0_u8; BLOCK_SIZE];
    stamp_header(
        &mut block,
        Oid(spec.addr),
        spec.xid,
        spec.object_type,
        spec.subtype,
    );
    block[32..34].copy_from_slice(&spec.flags.to_le_bytes());
    block[34..36].copy_from_slice(&spec.level.to_le_bytes());
    block[36..40].copy_from_slice(&(spec.slots.len() as u32).to_le_bytes());
    block[42..44].copy_from_slice(&(NODE_TABLE_LEN as u16).to_le_bytes());

    let fixed = spec.flags & BTNODE_FIXED_KV_SIZE != 0;
    let key_area = NODE_DATA_START + NODE_TABLE_LEN;
    let value_end = if spec.flags & BTNODE_ROOT != 0 {
        BLOCK_SIZE - BTREE_INFO_SIZE
    } else {
        BLOCK_SIZE
    };

    let mut key_off = 0_usize;
    let mut val_off = 0_usize;
    for (i, (key, value)) in spec.slots.iter().enumerate() {
        let k_start = key_area + key_off;
        block[k_start..k_start + key.len()].copy_from_slice(key);

        let ghost = value.is_empty();
        let v_off = if ghost {
            BTOFF_INVALID as usize
        } else {
            val_off += value.len();
            let v_start = value_end - val_off;
            block[v_start..v_start + value.len()].copy_from_slice(value);
            val_off
        };

        if fixed {
            let slot = NODE_DATA_START + i * 4;
            block[slot..slot + 2].copy_from_slice(&(key_off as u16).to_le_bytes());
            block[slot + 2..slot + 4].copy_from_slice(&(v_off as u16).to_le_bytes());
        } else {
            let slot = NODE_DATA_START + i * 8;
            block[slot..slot + 2].copy_from_slice(&(key_off as u16).to_le_bytes());
            block[slot + 2..slot + 4].copy_from_slice(&(key.len() as u16).to_le_bytes());
            block[slot + 4..slot + 6].copy_from_slice(&(v_off as u16).to_le_bytes());
            block[slot + 6..slot + 8]
                .copy_from_slice(&(if ghost { 0 } else { value.len() as u16 }).to_le_bytes());
        }
        key_off += key.len();
    }

    if let Some(info) = spec.info {
        let at = BLOCK_SIZE - BTREE_INFO_SIZE;
        block[at..at + 4].copy_from_slice(&info.flags.to_le_bytes());
        block[at + 4..at + 8].copy_from_slice(&(BLOCK_SIZE as u32).to_le_bytes());
        block[at + 8..at + 12].copy_from_slice(&info.key_size.to_le_bytes());
        block[at + 12..at + 16].copy_from_slice(&info.val_size.to_le_bytes());
    }

    block
}

// ── volume superblock ────────────────────────────────────────────────────

/// Fields of a volume superblock the builders care about.
#[derive(Debug, Clone)]
pub struct VolumeSpec {
    pub oid: Oid,
    pub xid: Xid,
    pub index: u32,
    pub name: String,
    /// Physical address of the volume's object map, zero for none.
    pub omap_addr: u64,
    pub root_tree_oid: Oid,
    pub num_files: u64,
    pub num_directories: u64,
    pub num_snapshots: u64,
    pub role: u16,
}

#[must_use]
pub fn volume_block(spec: &VolumeSpec) -> Vec<u8> {
    let mut block = vec![0_u8; BLOCK_SIZE];
    stamp_header(&mut block, spec.oid, spec.xid, OBJECT_TYPE_FS, 0);
    block[32..36].copy_from_slice(&APFS_MAGIC.to_le_bytes());
    block[36..40].copy_from_slice(&spec.index.to_le_bytes());
    block[128..136].copy_from_slice(&spec.omap_addr.to_le_bytes());
    block[136..144].copy_from_slice(&spec.root_tree_oid.0.to_le_bytes());
    block[184..192].copy_from_slice(&spec.num_files.to_le_bytes());
    block[192..200].copy_from_slice(&spec.num_directories.to_le_bytes());
    block[216..224].copy_from_slice(&spec.num_snapshots.to_le_bytes());
    let name = spec.name.as_bytes();
    assert!(name.len() < 256, "volume names are NUL-terminated 256-byte fields");
    block[704..704 + name.len()].copy_from_slice(name);
    block[964..966].copy_from_slice(&spec.role.to_le_bytes());
    block
}

// ── ready-made scenario ──────────────────────────────────────────────────

/// Block addresses used by [`basic_container`].
pub mod layout {
    pub const BOOTSTRAP: u64 = 0;
    pub const RING_BASE: u64 = 1;
    pub const RING_BLOCKS: u32 = 8;
    pub const OMAP_PHYS: u64 = 9;
    pub const OMAP_ROOT: u64 = 10;
    pub const VOLUME_SB: u64 = 11;
    pub const VOL_OMAP_PHYS: u64 = 12;
    pub const VOL_OMAP_ROOT: u64 = 13;
    pub const FS_ROOT: u64 = 14;
    pub const SPACEMAN: u64 = 15;
    pub const BLOCK_COUNT: u64 = 16;
}

pub const BASIC_XID: Xid = Xid(5);
pub const BASIC_VOLUME_OID: Oid = Oid(1027);
pub const BASIC_FS_ROOT_OID: Oid = Oid(2049);
pub const BASIC_SPACEMAN_OID: Oid = Oid(0x400);

/// A complete minimal container: one checkpoint at xid 5 (one mapping
/// block and its superblock in ring slots 0 and 1), a container object
/// map resolving one volume, and a volume with its own object map and a
/// three-record filesystem tree.
#[must_use]
pub fn basic_container() -> ImageBuilder {
    use layout::*;

    let mut image = ImageBuilder::new(BLOCK_COUNT);

    let sb = SuperblockSpec {
        xid: BASIC_XID,
        block_count: BLOCK_COUNT,
        incompatible_features: 0,
        xp_desc_base: RING_BASE,
        xp_desc_blocks: RING_BLOCKS,
        xp_desc_index: 0,
        xp_desc_len: 2,
        omap_addr: OMAP_PHYS,
        volumes: vec![(0, BASIC_VOLUME_OID)],
    };
    image.put(BOOTSTRAP, superblock_block(&sb));
    image.put(
        RING_BASE,
        checkpoint_map_block(
            BASIC_XID,
            true,
            &[MappingSpec {
                object_type: nxfs_types::OBJECT_TYPE_SPACEMAN | OBJ_EPHEMERAL,
                oid: BASIC_SPACEMAN_OID,
                paddr: SPACEMAN,
            }],
        ),
    );
    image.put(RING_BASE + 1, superblock_block(&sb));

    image.put(
        OMAP_PHYS,
        omap_phys_block(OMAP_PHYS, BASIC_XID, OMAP_ROOT),
    );
    image.put(
        OMAP_ROOT,
        omap_tree_root_block(
            OMAP_ROOT,
            BASIC_XID,
            &[OmapRecord::live(BASIC_VOLUME_OID, Xid(3), VOLUME_SB)],
        ),
    );

    image.put(
        VOLUME_SB,
        volume_block(&VolumeSpec {
            oid: BASIC_VOLUME_OID,
            xid: BASIC_XID,
            index: 0,
            name: "Macintosh HD".to_owned(),
            omap_addr: VOL_OMAP_PHYS,
            root_tree_oid: BASIC_FS_ROOT_OID,
            num_files: 12,
            num_directories: 4,
            num_snapshots: 0,
            role: 0x0040,
        }),
    );
    image.put(
        VOL_OMAP_PHYS,
        omap_phys_block(VOL_OMAP_PHYS, BASIC_XID, VOL_OMAP_ROOT),
    );
    image.put(
        VOL_OMAP_ROOT,
        omap_tree_root_block(
            VOL_OMAP_ROOT,
            BASIC_XID,
            &[OmapRecord::live(BASIC_FS_ROOT_OID, Xid(4), FS_ROOT)],
        ),
    );
    image.put(
        FS_ROOT,
        btree_node_block(&NodeSpec {
            addr: BASIC_FS_ROOT_OID.0,
            xid: BASIC_XID,
            object_type: OBJECT_TYPE_BTREE,
            subtype: nxfs_types::OBJECT_TYPE_FSTREE,
            flags: BTNODE_ROOT | BTNODE_LEAF,
            level: 0,
            slots: vec![
                (b"dir/".to_vec(), b"directory".to_vec()),
                (b"dir/file-a".to_vec(), b"contents-a".to_vec()),
                (b"dir/file-b".to_vec(), b"contents-b".to_vec()),
            ],
            info: Some(InfoSpec {
                flags: 0,
                key_size: 0,
                val_size: 0,
            }),
        }),
    );

    let mut spaceman = vec![0_u8; BLOCK_SIZE];
    stamp_header(
        &mut spaceman,
        BASIC_SPACEMAN_OID,
        BASIC_XID,
        nxfs_types::OBJECT_TYPE_SPACEMAN | OBJ_EPHEMERAL,
        0,
    );
    image.put(SPACEMAN, spaceman);

    image
}

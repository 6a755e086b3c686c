use crate::object::ObjectHeader;
use nxfs_types::{
    ensure_slice, read_le_u16, read_le_u32, read_le_u64, Oid, ParseError, BTNODE_FIXED_KV_SIZE,
    BTNODE_HASHED, BTNODE_LEAF, BTNODE_ROOT, BTOFF_INVALID, BTREE_ALLOW_GHOSTS, BTREE_EPHEMERAL,
    BTREE_INFO_SIZE, BTREE_MAX_LEVEL, BTREE_PHYSICAL, BTREE_UINT64_KEYS,
};
use serde::{Deserialize, Serialize};

/// Start of the node's data area, immediately after the node header.
const DATA_START: usize = 56;

/// Table-of-contents entry size per layout.
const KVOFF_SIZE: usize = 4;
const KVLOC_SIZE: usize = 8;

/// An (offset, length) pair locating a region inside a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nloc {
    pub off: u16,
    pub len: u16,
}

impl Nloc {
    fn parse(block: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            off: read_le_u16(block, offset)?,
            len: read_le_u16(block, offset + 2)?,
        })
    }
}

/// The fixed-size descriptor stored in the last 40 bytes of every root
/// node. It travels with the root, so a tree is self-describing once its
/// root block is in hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtreeInfo {
    pub flags: u32,
    pub node_size: u32,
    pub key_size: u32,
    pub val_size: u32,
    pub longest_key: u32,
    pub longest_val: u32,
    pub key_count: u64,
    pub node_count: u64,
}

impl BtreeInfo {
    /// Parse from a root node's block; the descriptor occupies the final
    /// `BTREE_INFO_SIZE` bytes.
    pub fn parse_from_root(block: &[u8]) -> Result<Self, ParseError> {
        if block.len() < DATA_START + BTREE_INFO_SIZE {
            return Err(ParseError::InsufficientData {
                needed: DATA_START + BTREE_INFO_SIZE,
                offset: 0,
                actual: block.len(),
            });
        }
        let base = block.len() - BTREE_INFO_SIZE;
        Ok(Self {
            flags: read_le_u32(block, base)?,
            node_size: read_le_u32(block, base + 4)?,
            key_size: read_le_u32(block, base + 8)?,
            val_size: read_le_u32(block, base + 12)?,
            longest_key: read_le_u32(block, base + 16)?,
            longest_val: read_le_u32(block, base + 20)?,
            key_count: read_le_u64(block, base + 24)?,
            node_count: read_le_u64(block, base + 32)?,
        })
    }

    #[must_use]
    pub fn allows_ghosts(&self) -> bool {
        self.flags & BTREE_ALLOW_GHOSTS != 0
    }

    #[must_use]
    pub fn uses_u64_keys(&self) -> bool {
        self.flags & BTREE_UINT64_KEYS != 0
    }

    /// Child pointers are physical block addresses rather than virtual oids.
    #[must_use]
    pub fn is_physical(&self) -> bool {
        self.flags & BTREE_PHYSICAL != 0
    }

    #[must_use]
    pub fn is_ephemeral(&self) -> bool {
        self.flags & BTREE_EPHEMERAL != 0
    }
}

/// One record slot in a node: the key bytes and, unless the slot is a
/// ghost, the value bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeEntry<'a> {
    pub key: &'a [u8],
    pub value: Option<&'a [u8]>,
}

impl NodeEntry<'_> {
    /// Decode an index node's value as the child object id.
    pub fn child_oid(&self) -> Result<Oid, ParseError> {
        let value = self.value.ok_or(ParseError::InvalidField {
            field: "btn_child",
            reason: "index slot has no value",
        })?;
        Ok(Oid(read_le_u64(value, 0)?))
    }
}

/// A B-tree node view borrowing the raw block.
///
/// The table of contents comes in two encodings: 4-byte `kvoff` pairs
/// when `BTNODE_FIXED_KV_SIZE` is set (record sizes come from the tree
/// descriptor), and 8-byte `kvloc` quads otherwise (each slot carries its
/// own lengths). Key offsets are relative to the start of the key area;
/// value offsets count backward from the end of the block, skipping the
/// 40-byte tree descriptor on root nodes.
#[derive(Debug, Clone, Copy)]
pub struct BtreeRawNode<'a> {
    block: &'a [u8],
    pub header: ObjectHeader,
    pub flags: u16,
    pub level: u16,
    pub nkeys: u32,
    pub table_space: Nloc,
    pub free_space: Nloc,
}

impl<'a> BtreeRawNode<'a> {
    pub fn parse(block: &'a [u8]) -> Result<Self, ParseError> {
        let header = ObjectHeader::parse(block)?;
        let flags = read_le_u16(block, 32)?;
        let level = read_le_u16(block, 34)?;
        let nkeys = read_le_u32(block, 36)?;
        let table_space = Nloc::parse(block, 40)?;
        let free_space = Nloc::parse(block, 44)?;

        if level > BTREE_MAX_LEVEL {
            return Err(ParseError::InvalidField {
                field: "btn_level",
                reason: "node level exceeds the maximum tree height",
            });
        }
        let is_leaf = flags & BTNODE_LEAF != 0;
        if is_leaf != (level == 0) {
            return Err(ParseError::InvalidField {
                field: "btn_flags",
                reason: "leaf flag disagrees with node level",
            });
        }

        let node = Self {
            block,
            header,
            flags,
            level,
            nkeys,
            table_space,
            free_space,
        };

        // The ToC must fit inside its declared region and the region
        // inside the block.
        let entry_size = node.toc_entry_size();
        let toc_bytes = (nkeys as usize)
            .checked_mul(entry_size)
            .ok_or(ParseError::IntegerConversion {
                field: "btn_nkeys",
            })?;
        if toc_bytes > table_space.len as usize {
            return Err(ParseError::InvalidField {
                field: "btn_nkeys",
                reason: "table of contents overflows its region",
            });
        }
        ensure_slice(block, node.toc_start(), table_space.len as usize)?;

        Ok(node)
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.flags & BTNODE_ROOT != 0
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.flags & BTNODE_LEAF != 0
    }

    #[must_use]
    pub fn has_fixed_kv_size(&self) -> bool {
        self.flags & BTNODE_FIXED_KV_SIZE != 0
    }

    #[must_use]
    pub fn is_hashed(&self) -> bool {
        self.flags & BTNODE_HASHED != 0
    }

    fn toc_entry_size(&self) -> usize {
        if self.has_fixed_kv_size() {
            KVOFF_SIZE
        } else {
            KVLOC_SIZE
        }
    }

    fn toc_start(&self) -> usize {
        DATA_START + self.table_space.off as usize
    }

    /// Start of the key storage area, directly after the ToC region.
    fn key_area(&self) -> usize {
        self.toc_start() + self.table_space.len as usize
    }

    /// Exclusive upper bound of the value storage area.
    fn value_end(&self) -> usize {
        if self.is_root() {
            self.block.len().saturating_sub(BTREE_INFO_SIZE)
        } else {
            self.block.len()
        }
    }

    fn key_slice(&self, rel_off: u16, len: usize) -> Result<&'a [u8], ParseError> {
        let start = self.key_area() + rel_off as usize;
        ensure_slice(self.block, start, len)?;
        Ok(&self.block[start..start + len])
    }

    fn value_slice(&self, back_off: u16, len: usize) -> Result<&'a [u8], ParseError> {
        let start = self
            .value_end()
            .checked_sub(back_off as usize)
            .ok_or(ParseError::InvalidField {
                field: "btn_val_off",
                reason: "value offset reaches past the start of the block",
            })?;
        ensure_slice(self.block, start, len)?;
        Ok(&self.block[start..start + len])
    }

    /// Value length for fixed-layout slots: index nodes store a child oid,
    /// leaves store the tree's declared value size.
    fn fixed_val_len(&self, info: &BtreeInfo) -> usize {
        if self.is_leaf() {
            info.val_size as usize
        } else {
            8
        }
    }

    /// Fetch the entry at `index`. A slot whose value offset is the
    /// invalid marker is a ghost and comes back with `value: None`.
    pub fn entry(&self, index: usize, info: &BtreeInfo) -> Result<NodeEntry<'a>, ParseError> {
        if index >= self.nkeys as usize {
            return Err(ParseError::InvalidField {
                field: "btn_index",
                reason: "entry index out of range",
            });
        }
        let slot = self.toc_start() + index * self.toc_entry_size();

        if self.has_fixed_kv_size() {
            let k_off = read_le_u16(self.block, slot)?;
            let v_off = read_le_u16(self.block, slot + 2)?;
            let key = self.key_slice(k_off, info.key_size as usize)?;
            let value = if v_off == BTOFF_INVALID {
                None
            } else {
                Some(self.value_slice(v_off, self.fixed_val_len(info))?)
            };
            Ok(NodeEntry { key, value })
        } else {
            let k_off = read_le_u16(self.block, slot)?;
            let k_len = read_le_u16(self.block, slot + 2)?;
            let v_off = read_le_u16(self.block, slot + 4)?;
            let v_len = read_le_u16(self.block, slot + 6)?;
            let key = self.key_slice(k_off, k_len as usize)?;
            let value = if v_off == BTOFF_INVALID {
                None
            } else {
                Some(self.value_slice(v_off, v_len as usize)?)
            };
            Ok(NodeEntry { key, value })
        }
    }

    /// Iterate every entry in slot order.
    pub fn entries<'i>(
        &'i self,
        info: &'i BtreeInfo,
    ) -> impl Iterator<Item = Result<NodeEntry<'a>, ParseError>> + 'i {
        (0..self.nkeys as usize).map(move |i| self.entry(i, info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nxfs_types::OBJECT_TYPE_BTREE_NODE;

    const BLOCK: usize = 4096;

    fn info_with(flags: u32, key_size: u32, val_size: u32) -> BtreeInfo {
        BtreeInfo {
            flags,
            node_size: BLOCK as u32,
            key_size,
            val_size,
            longest_key: key_size,
            longest_val: val_size,
            key_count: 0,
            node_count: 1,
        }
    }

    fn stamp_node_header(block: &mut [u8], flags: u16, level: u16, nkeys: u32, table_len: u16) {
        block[24..28].copy_from_slice(&OBJECT_TYPE_BTREE_NODE.to_le_bytes());
        block[32..34].copy_from_slice(&flags.to_le_bytes());
        block[34..36].copy_from_slice(&level.to_le_bytes());
        block[36..40].copy_from_slice(&nkeys.to_le_bytes());
        // table_space: off 0, len as given
        block[40..42].copy_from_slice(&0_u16.to_le_bytes());
        block[42..44].copy_from_slice(&table_len.to_le_bytes());
    }

    /// A root leaf with two fixed-size records (16-byte keys, 16-byte
    /// values) and the descriptor tail in place.
    fn fixed_root_leaf() -> Vec<u8> {
        let mut block = vec![0_u8; BLOCK];
        let flags = BTNODE_ROOT | BTNODE_LEAF | BTNODE_FIXED_KV_SIZE;
        let table_len: u16 = 64;
        stamp_node_header(&mut block, flags, 0, 2, table_len);

        let key_area = DATA_START + table_len as usize;
        let value_end = BLOCK - BTREE_INFO_SIZE;

        for (i, (key_byte, val_byte)) in [(0xAA_u8, 0x11_u8), (0xBB, 0x22)].iter().enumerate() {
            let slot = DATA_START + i * 4;
            let k_off = (i * 16) as u16;
            let v_off = ((i + 1) * 16) as u16;
            block[slot..slot + 2].copy_from_slice(&k_off.to_le_bytes());
            block[slot + 2..slot + 4].copy_from_slice(&v_off.to_le_bytes());

            let k_start = key_area + k_off as usize;
            block[k_start..k_start + 16].fill(*key_byte);
            let v_start = value_end - v_off as usize;
            block[v_start..v_start + 16].fill(*val_byte);
        }

        // Descriptor tail.
        let info = BLOCK - BTREE_INFO_SIZE;
        block[info + 8..info + 12].copy_from_slice(&16_u32.to_le_bytes());
        block[info + 12..info + 16].copy_from_slice(&16_u32.to_le_bytes());
        block
    }

    #[test]
    fn fixed_layout_entries_decode() {
        let block = fixed_root_leaf();
        let node = BtreeRawNode::parse(&block).expect("parse");
        assert!(node.is_root());
        assert!(node.is_leaf());
        assert!(node.has_fixed_kv_size());
        assert_eq!(node.nkeys, 2);

        let info = BtreeInfo::parse_from_root(&block).expect("info");
        assert_eq!(info.key_size, 16);

        let first = node.entry(0, &info).expect("entry 0");
        assert_eq!(first.key, &[0xAA; 16]);
        assert_eq!(first.value.expect("value"), &[0x11; 16]);

        let second = node.entry(1, &info).expect("entry 1");
        assert_eq!(second.key, &[0xBB; 16]);
        assert_eq!(second.value.expect("value"), &[0x22; 16]);

        assert!(node.entry(2, &info).is_err());
    }

    /// A non-root variable-layout leaf with one live record and one ghost.
    fn variable_leaf() -> Vec<u8> {
        let mut block = vec![0_u8; BLOCK];
        let table_len: u16 = 64;
        stamp_node_header(&mut block, BTNODE_LEAF, 0, 2, table_len);

        let key_area = DATA_START + table_len as usize;

        // slot 0: key at 0 len 5, value at back-offset 12 len 12
        let slot0 = DATA_START;
        block[slot0..slot0 + 2].copy_from_slice(&0_u16.to_le_bytes());
        block[slot0 + 2..slot0 + 4].copy_from_slice(&5_u16.to_le_bytes());
        block[slot0 + 4..slot0 + 6].copy_from_slice(&12_u16.to_le_bytes());
        block[slot0 + 6..slot0 + 8].copy_from_slice(&12_u16.to_le_bytes());
        block[key_area..key_area + 5].copy_from_slice(b"alpha");
        block[BLOCK - 12..].fill(0x5A);

        // slot 1: key at 5 len 4, ghost value
        let slot1 = DATA_START + 8;
        block[slot1..slot1 + 2].copy_from_slice(&5_u16.to_le_bytes());
        block[slot1 + 2..slot1 + 4].copy_from_slice(&4_u16.to_le_bytes());
        block[slot1 + 4..slot1 + 6].copy_from_slice(&BTOFF_INVALID.to_le_bytes());
        block[slot1 + 6..slot1 + 8].copy_from_slice(&0_u16.to_le_bytes());
        block[key_area + 5..key_area + 9].copy_from_slice(b"beta");

        block
    }

    #[test]
    fn variable_layout_and_ghosts_decode() {
        let block = variable_leaf();
        let node = BtreeRawNode::parse(&block).expect("parse");
        assert!(!node.has_fixed_kv_size());
        let info = info_with(BTREE_ALLOW_GHOSTS, 0, 0);

        let live = node.entry(0, &info).expect("entry 0");
        assert_eq!(live.key, b"alpha");
        assert_eq!(live.value.expect("value"), &[0x5A; 12]);

        let ghost = node.entry(1, &info).expect("entry 1");
        assert_eq!(ghost.key, b"beta");
        assert!(ghost.value.is_none());
    }

    #[test]
    fn index_node_child_oid() {
        let mut block = vec![0_u8; BLOCK];
        let table_len: u16 = 64;
        stamp_node_header(&mut block, BTNODE_FIXED_KV_SIZE, 1, 1, table_len);

        let key_area = DATA_START + table_len as usize;
        let slot = DATA_START;
        block[slot..slot + 2].copy_from_slice(&0_u16.to_le_bytes());
        block[slot + 2..slot + 4].copy_from_slice(&8_u16.to_le_bytes());
        block[key_area..key_area + 16].fill(0xCC);
        block[BLOCK - 8..].copy_from_slice(&9001_u64.to_le_bytes());

        let node = BtreeRawNode::parse(&block).expect("parse");
        assert!(!node.is_leaf());
        let info = info_with(0, 16, 16);
        let entry = node.entry(0, &info).expect("entry");
        // Index values are child oids, not tree values.
        assert_eq!(entry.value.expect("value").len(), 8);
        assert_eq!(entry.child_oid().expect("oid"), Oid(9001));
    }

    #[test]
    fn rejects_level_leaf_mismatch() {
        let mut block = vec![0_u8; BLOCK];
        stamp_node_header(&mut block, BTNODE_LEAF, 3, 0, 0);
        let err = BtreeRawNode::parse(&block).unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidField {
                field: "btn_flags",
                ..
            }
        ));
    }

    #[test]
    fn rejects_excessive_level() {
        let mut block = vec![0_u8; BLOCK];
        stamp_node_header(&mut block, 0, BTREE_MAX_LEVEL + 1, 0, 0);
        let err = BtreeRawNode::parse(&block).unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidField {
                field: "btn_level",
                ..
            }
        ));
    }

    #[test]
    fn rejects_toc_overflowing_its_region() {
        let mut block = vec![0_u8; BLOCK];
        // 100 fixed slots need 400 bytes but the region declares 64.
        stamp_node_header(
            &mut block,
            BTNODE_LEAF | BTNODE_FIXED_KV_SIZE,
            0,
            100,
            64,
        );
        let err = BtreeRawNode::parse(&block).unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidField {
                field: "btn_nkeys",
                ..
            }
        ));
    }

    #[test]
    fn value_offset_past_block_start_rejected() {
        let mut block = vec![0_u8; 128];
        stamp_node_header(&mut block, BTNODE_LEAF | BTNODE_FIXED_KV_SIZE, 0, 1, 4);
        let slot = DATA_START;
        block[slot..slot + 2].copy_from_slice(&0_u16.to_le_bytes());
        // Back-offset larger than the block itself.
        block[slot + 2..slot + 4].copy_from_slice(&500_u16.to_le_bytes());

        let node = BtreeRawNode::parse(&block).expect("parse");
        let info = info_with(0, 2, 2);
        assert!(node.entry(0, &info).is_err());
    }
}

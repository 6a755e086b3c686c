use nxfs_types::{
    read_le_u32, read_le_u64, Oid, ParseError, Xid, OBJECT_HEADER_SIZE, OBJECT_TYPE_MASK,
    OBJ_EPHEMERAL, OBJ_ENCRYPTED, OBJ_NOHEADER, OBJ_NONPERSISTENT, OBJ_PHYSICAL,
    OBJ_STORAGETYPE_MASK,
};
use serde::{Deserialize, Serialize};

/// How an object reference is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageClass {
    /// Referenced by object id, resolved through an object map.
    Virtual,
    /// The object id is a physical block address.
    Physical,
    /// Resolved through the active checkpoint's mapping table.
    Ephemeral,
}

/// The common object envelope prefixing every persisted block.
///
/// Decoding never fails on a well-formed 32-byte prefix; type and subtype
/// values outside the known set are preserved as opaque integers so
/// unknown object kinds surface to the caller instead of being rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectHeader {
    pub cksum: u64,
    pub oid: Oid,
    pub xid: Xid,
    pub object_type: u32,
    pub subtype: u32,
}

impl ObjectHeader {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        if block.len() < OBJECT_HEADER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: OBJECT_HEADER_SIZE,
                offset: 0,
                actual: block.len(),
            });
        }

        Ok(Self {
            cksum: read_le_u64(block, 0)?,
            oid: Oid(read_le_u64(block, 8)?),
            xid: Xid(read_le_u64(block, 16)?),
            object_type: read_le_u32(block, 24)?,
            subtype: read_le_u32(block, 28)?,
        })
    }

    /// The object kind: the type field with flag bits masked off.
    #[must_use]
    pub fn kind(&self) -> u32 {
        self.object_type & OBJECT_TYPE_MASK
    }

    #[must_use]
    pub fn storage_class(&self) -> StorageClass {
        match self.object_type & OBJ_STORAGETYPE_MASK {
            OBJ_PHYSICAL => StorageClass::Physical,
            OBJ_EPHEMERAL => StorageClass::Ephemeral,
            _ => StorageClass::Virtual,
        }
    }

    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.object_type & OBJ_ENCRYPTED != 0
    }

    #[must_use]
    pub fn has_header(&self) -> bool {
        self.object_type & OBJ_NOHEADER == 0
    }

    #[must_use]
    pub fn is_persistent(&self) -> bool {
        self.object_type & OBJ_NONPERSISTENT == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nxfs_types::{OBJECT_TYPE_BTREE_NODE, OBJECT_TYPE_NX_SUPERBLOCK, OBJ_EPHEMERAL};

    fn header_block(oid: u64, xid: u64, object_type: u32, subtype: u32) -> Vec<u8> {
        let mut block = vec![0_u8; 64];
        block[8..16].copy_from_slice(&oid.to_le_bytes());
        block[16..24].copy_from_slice(&xid.to_le_bytes());
        block[24..28].copy_from_slice(&object_type.to_le_bytes());
        block[28..32].copy_from_slice(&subtype.to_le_bytes());
        block
    }

    #[test]
    fn parse_smoke() {
        let block = header_block(1, 9, OBJECT_TYPE_NX_SUPERBLOCK | OBJ_EPHEMERAL, 0);
        let header = ObjectHeader::parse(&block).expect("parse");
        assert_eq!(header.oid, Oid(1));
        assert_eq!(header.xid, Xid(9));
        assert_eq!(header.kind(), OBJECT_TYPE_NX_SUPERBLOCK);
        assert_eq!(header.storage_class(), StorageClass::Ephemeral);
        assert!(header.has_header());
        assert!(!header.is_encrypted());
    }

    #[test]
    fn storage_class_decodes_all_three() {
        for (bits, expected) in [
            (0, StorageClass::Virtual),
            (OBJ_PHYSICAL, StorageClass::Physical),
            (OBJ_EPHEMERAL, StorageClass::Ephemeral),
        ] {
            let block = header_block(5, 1, OBJECT_TYPE_BTREE_NODE | bits, 0);
            let header = ObjectHeader::parse(&block).expect("parse");
            assert_eq!(header.storage_class(), expected);
        }
    }

    #[test]
    fn unknown_kind_is_preserved() {
        let block = header_block(7, 2, 0x00ab | OBJ_PHYSICAL, 0x7777);
        let header = ObjectHeader::parse(&block).expect("parse");
        assert_eq!(header.kind(), 0x00ab);
        assert_eq!(header.subtype, 0x7777);
    }

    #[test]
    fn truncated_header_rejected() {
        let err = ObjectHeader::parse(&[0_u8; 31]).unwrap_err();
        assert!(matches!(err, ParseError::InsufficientData { .. }));
    }
}

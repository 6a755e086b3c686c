//! Volume access.
//!
//! Volume superblocks are virtual objects: the container superblock's
//! oid table names them and the container object map locates them. Each
//! volume then carries its own object map for the virtual objects of
//! its filesystem tree.

use nxfs_block::BlockDevice;
use nxfs_btree::{BtreeHandle, KeyOrdering};
use nxfs_error::{NxError, Result};
use nxfs_ondisk::{verify_block, ApfsSuperblock, ObjectHeader};
use nxfs_types::{Oid, Paddr, Xid, OBJECT_TYPE_FS};

use crate::checkpoint::corrupt;
use crate::omap::ObjectMap;

/// A volume resolved at the mount transaction.
pub struct Volume<'a> {
    device: &'a dyn BlockDevice,
    pub superblock: ApfsSuperblock,
    /// Slot in the container's volume table.
    pub index: usize,
    /// Physical block holding the volume superblock.
    pub block: u64,
    xid: Xid,
}

impl<'a> Volume<'a> {
    /// Load the volume superblock resolved to `addr` by the container
    /// object map.
    pub(crate) fn load(
        device: &'a dyn BlockDevice,
        addr: Paddr,
        oid: Oid,
        index: usize,
        xid: Xid,
    ) -> Result<Self> {
        let block = addr
            .to_block()
            .map_err(|e| NxError::Parse(format!("volume {oid} superblock: {e}")))?;
        let buf = device.read_block(block)?;
        if !verify_block(buf.as_slice()) {
            return Err(NxError::Corruption {
                block,
                detail: "volume superblock failed checksum verification".to_owned(),
            });
        }
        let header = ObjectHeader::parse(buf.as_slice()).map_err(|e| corrupt(block, e))?;
        if header.kind() != OBJECT_TYPE_FS {
            return Err(NxError::Corruption {
                block,
                detail: format!(
                    "expected a volume superblock, found kind {:#x}",
                    header.kind()
                ),
            });
        }
        if header.oid != oid {
            return Err(NxError::Corruption {
                block,
                detail: format!("expected volume {oid}, block claims {}", header.oid),
            });
        }
        let superblock = ApfsSuperblock::parse(buf.as_slice()).map_err(|e| corrupt(block, e))?;

        Ok(Self {
            device,
            superblock,
            index,
            block,
            xid,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.superblock.volname
    }

    #[must_use]
    pub fn xid(&self) -> Xid {
        self.xid
    }

    /// Open the volume's own object map.
    pub fn object_map(&self) -> Result<ObjectMap<'a>> {
        if !self.superblock.has_omap() {
            return Err(NxError::Format(format!(
                "volume {} has no object map",
                self.index
            )));
        }
        // Volume object maps are physical; the oid field is an address.
        let addr = Paddr(i64::try_from(self.superblock.omap_oid.0).map_err(|_| {
            NxError::Format(format!(
                "volume object map address {} out of range",
                self.superblock.omap_oid
            ))
        })?);
        ObjectMap::open(self.device, addr, self.xid)
    }

    /// Open the volume's filesystem tree. Its child pointers are virtual
    /// and resolve through the supplied (volume) object map.
    pub fn open_root_tree<'r>(&self, omap: &'r ObjectMap<'r>) -> Result<BtreeHandle<'r>>
    where
        'a: 'r,
    {
        if !self.superblock.root_tree_oid.is_valid() {
            return Err(NxError::Format(format!(
                "volume {} has no root tree",
                self.index
            )));
        }
        BtreeHandle::open(
            self.device,
            omap,
            self.superblock.root_tree_oid,
            KeyOrdering::Bytes,
        )
    }
}

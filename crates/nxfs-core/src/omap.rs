//! Object-map resolution.
//!
//! An object map translates a virtual (oid, xid) pair to the physical
//! block holding that object version. Lookups are point-in-time: asking
//! at transaction X selects the newest record for the oid whose xid is
//! at or below X, which is exactly a lower-bound search on the map's
//! (oid, xid) tree. A deleted record at that position means the object
//! does not exist at X, regardless of older versions.

use nxfs_block::BlockDevice;
use nxfs_btree::{BtreeHandle, ChildResolver, DirectResolver, KeyOrdering, SearchMode};
use nxfs_error::{NxError, Result};
use nxfs_ondisk::{verify_block, ObjectHeader, OmapKey, OmapPhys, OmapVal};
use nxfs_types::{Oid, Paddr, Xid, OBJECT_TYPE_OMAP};

use crate::checkpoint::corrupt;

const DIRECT: DirectResolver = DirectResolver;

/// A resolved object version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OmapEntry {
    /// Transaction that wrote this version.
    pub xid: Xid,
    pub flags: u32,
    pub size: u32,
    pub paddr: Paddr,
}

/// An open object map, pinned to the transaction id it was mounted at.
pub struct ObjectMap<'a> {
    device: &'a dyn BlockDevice,
    phys: OmapPhys,
    tree: BtreeHandle<'a>,
    xid: Xid,
}

impl std::fmt::Debug for ObjectMap<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectMap")
            .field("xid", &self.xid)
            .field("tree_oid", &self.phys.tree_oid)
            .finish_non_exhaustive()
    }
}

impl<'a> ObjectMap<'a> {
    /// Open the object map whose header lives at `addr`. Object maps are
    /// physical objects, so `addr` comes straight from a superblock
    /// field rather than another map.
    pub fn open(device: &'a dyn BlockDevice, addr: Paddr, xid: Xid) -> Result<Self> {
        let block = addr
            .to_block()
            .map_err(|e| NxError::Parse(format!("object map header: {e}")))?;
        let buf = device.read_block(block)?;
        if !verify_block(buf.as_slice()) {
            return Err(NxError::Corruption {
                block,
                detail: "object map header failed checksum verification".to_owned(),
            });
        }
        let header = ObjectHeader::parse(buf.as_slice()).map_err(|e| corrupt(block, e))?;
        if header.kind() != OBJECT_TYPE_OMAP {
            return Err(NxError::Corruption {
                block,
                detail: format!("expected an object map, found kind {:#x}", header.kind()),
            });
        }
        let phys = OmapPhys::parse(buf.as_slice()).map_err(|e| corrupt(block, e))?;

        // The map's own tree is physical: child pointers are block
        // addresses, so the identity resolver applies.
        let tree = BtreeHandle::open(device, &DIRECT, phys.tree_oid, KeyOrdering::OidXid)?;

        Ok(Self {
            device,
            phys,
            tree,
            xid,
        })
    }

    #[must_use]
    pub fn phys(&self) -> &OmapPhys {
        &self.phys
    }

    #[must_use]
    pub fn xid(&self) -> Xid {
        self.xid
    }

    /// Resolve `oid` at the map's pinned transaction id.
    pub fn lookup(&self, oid: Oid) -> Result<Option<OmapEntry>> {
        self.lookup_at(oid, self.xid)
    }

    /// Resolve `oid` as of `max_xid`: the newest version at or below it.
    /// `Ok(None)` covers both an absent oid and one deleted by then.
    pub fn lookup_at(&self, oid: Oid, max_xid: Xid) -> Result<Option<OmapEntry>> {
        let key = OmapKey::new(oid, max_xid).to_bytes();
        let Some(hit) = self.tree.search(&key, SearchMode::LowerBound)? else {
            return Ok(None);
        };

        let found = OmapKey::parse(&hit.key).map_err(|e| corrupt(self.tree.root_block(), e))?;
        if found.oid != oid {
            // Floor landed on a different object's record.
            return Ok(None);
        }

        let val = OmapVal::parse(&hit.value).map_err(|e| corrupt(self.tree.root_block(), e))?;
        if val.is_deleted() {
            return Ok(None);
        }
        if val.paddr.0 < 0 {
            return Err(NxError::Corruption {
                block: self.tree.root_block(),
                detail: format!("object {oid} maps to negative address {}", val.paddr.0),
            });
        }

        Ok(Some(OmapEntry {
            xid: found.xid,
            flags: val.flags,
            size: val.size,
            paddr: val.paddr,
        }))
    }

    /// Resolve `oid` and read the block it maps to, verifying the
    /// checksum and that the block really holds that oid.
    pub fn read_object(&self, oid: Oid) -> Result<nxfs_block::BlockBuf> {
        let entry = self
            .lookup(oid)?
            .ok_or_else(|| NxError::NotFound(format!("object {oid} at xid {}", self.xid)))?;
        let block = entry
            .paddr
            .to_block()
            .map_err(|e| NxError::Parse(format!("object {oid}: {e}")))?;
        let buf = self.device.read_block(block)?;
        if !verify_block(buf.as_slice()) {
            return Err(NxError::Corruption {
                block,
                detail: format!("object {oid} failed checksum verification"),
            });
        }
        let header = ObjectHeader::parse(buf.as_slice()).map_err(|e| corrupt(block, e))?;
        if header.oid != oid {
            return Err(NxError::Corruption {
                block,
                detail: format!("expected object {oid}, block claims {}", header.oid),
            });
        }
        Ok(buf)
    }

    /// Every live (key, value) record in the map, in (oid, xid) order.
    pub fn entries(&self) -> Result<Vec<(OmapKey, OmapVal)>> {
        let mut out = Vec::new();
        for item in self.tree.iter_leaf_entries() {
            let (key, value) = item?;
            let key = OmapKey::parse(&key).map_err(|e| corrupt(self.tree.root_block(), e))?;
            let val = OmapVal::parse(&value).map_err(|e| corrupt(self.tree.root_block(), e))?;
            out.push((key, val));
        }
        Ok(out)
    }
}

/// Virtual child pointers in a filesystem tree resolve through the
/// volume's object map at the mount transaction.
impl ChildResolver for ObjectMap<'_> {
    fn resolve(&self, oid: Oid) -> Result<Paddr> {
        let entry = self
            .lookup(oid)?
            .ok_or_else(|| NxError::NotFound(format!("tree node {oid} at xid {}", self.xid)))?;
        Ok(entry.paddr)
    }
}

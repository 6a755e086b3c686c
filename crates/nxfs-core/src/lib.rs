#![forbid(unsafe_code)]
//! Container mount path.
//!
//! A [`Container`] is a read-only session against one container image,
//! pinned to the newest valid checkpoint found at open time. All object
//! resolution inside the session happens at that transaction id, so
//! concurrent or later writes to the image never tear a traversal.
//!
//! Opening performs, in order: bootstrap superblock read at block zero,
//! checkpoint selection from the descriptor ring, and the
//! incompatible-feature gate on the winning superblock. Only then are
//! object maps and volumes reachable.

mod checkpoint;
mod omap;
mod volume;

pub use checkpoint::{
    enumerate_descriptor_ring, find_latest_checkpoint, load_bootstrap, Checkpoint, RingSlot,
    RingSlotKind,
};
pub use omap::{ObjectMap, OmapEntry};
pub use volume::Volume;

use nxfs_block::{
    ArcCache, BlockBuf, BlockDevice, ByteBlockDevice, ByteDevice, FileByteDevice,
};
use nxfs_btree::ChildResolver;
use nxfs_error::{NxError, Result};
use nxfs_ondisk::{verify_block, NxSuperblock, ObjectHeader};
use nxfs_types::{BlockSize, Oid, Paddr, Xid};
use tracing::info;

use crate::checkpoint::corrupt;

/// Block-cache capacity for file-backed sessions.
const DEFAULT_CACHE_BLOCKS: usize = 4096;

/// A read-only session against a container, pinned to one checkpoint.
pub struct Container<D: BlockDevice> {
    device: D,
    checkpoint: Checkpoint,
}

impl<D: BlockDevice> std::fmt::Debug for Container<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("xid", &self.checkpoint.xid)
            .field("block", &self.checkpoint.block)
            .finish_non_exhaustive()
    }
}

impl<D: BlockDevice> Container<D> {
    /// Mount the container on an already-constructed block device. The
    /// device's block size must match the on-disk geometry.
    pub fn open(device: D) -> Result<Self> {
        let bootstrap = checkpoint::load_bootstrap(&device)?;
        if bootstrap.block_size.get() != device.block_size() {
            return Err(NxError::InvalidGeometry(format!(
                "device reads {}-byte blocks but the container uses {}",
                device.block_size(),
                bootstrap.block_size.get()
            )));
        }

        let checkpoint = checkpoint::find_latest_checkpoint(&device, &bootstrap)?;

        // Feature gate before any tree traversal.
        let unsupported = checkpoint.superblock.unsupported_incompat_bits();
        if unsupported != 0 {
            return Err(NxError::IncompatibleFeature(format!(
                "incompatible feature bits {unsupported:#x}"
            )));
        }

        info!(
            xid = checkpoint.xid.0,
            block = checkpoint.block,
            volumes = checkpoint
                .superblock
                .fs_oids
                .iter()
                .filter(|oid| oid.is_valid())
                .count(),
            "container mounted"
        );

        Ok(Self { device, checkpoint })
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.device
    }

    /// The superblock of the mounted checkpoint (not the bootstrap copy).
    #[must_use]
    pub fn superblock(&self) -> &NxSuperblock {
        &self.checkpoint.superblock
    }

    /// The transaction id this session is pinned to.
    #[must_use]
    pub fn xid(&self) -> Xid {
        self.checkpoint.xid
    }

    #[must_use]
    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// Open the container-level object map.
    pub fn object_map(&self) -> Result<ObjectMap<'_>> {
        let oid = self.checkpoint.superblock.omap_oid;
        if !oid.is_valid() {
            return Err(NxError::Format(
                "container has no object map".to_owned(),
            ));
        }
        // The container object map is physical; its oid is an address.
        let addr = Paddr(i64::try_from(oid.0).map_err(|_| {
            NxError::Format(format!("container object map address {oid} out of range"))
        })?);
        ObjectMap::open(&self.device, addr, self.xid())
    }

    /// Read an ephemeral object through the checkpoint mapping table.
    pub fn ephemeral(&self, oid: Oid) -> Result<BlockBuf> {
        let mapping = self
            .checkpoint
            .ephemeral_mapping(oid)
            .ok_or_else(|| NxError::NotFound(format!("ephemeral object {oid}")))?;
        let block = mapping
            .paddr
            .to_block()
            .map_err(|e| NxError::Parse(format!("ephemeral object {oid}: {e}")))?;
        let buf = self.device.read_block(block)?;
        if !verify_block(buf.as_slice()) {
            return Err(NxError::Corruption {
                block,
                detail: format!("ephemeral object {oid} failed checksum verification"),
            });
        }
        let header = ObjectHeader::parse(buf.as_slice()).map_err(|e| corrupt(block, e))?;
        if header.oid != oid {
            return Err(NxError::Corruption {
                block,
                detail: format!("expected ephemeral object {oid}, block claims {}", header.oid),
            });
        }
        Ok(buf)
    }

    /// Occupied slots in the volume table.
    #[must_use]
    pub fn volume_indices(&self) -> Vec<usize> {
        self.checkpoint
            .superblock
            .fs_oids
            .iter()
            .enumerate()
            .filter(|(_, oid)| oid.is_valid())
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Load the volume at a table slot. `Ok(None)` for a sparse slot.
    pub fn volume(&self, index: usize) -> Result<Option<Volume<'_>>> {
        let Some(oid) = self.checkpoint.superblock.fs_oid(index) else {
            return Ok(None);
        };
        let omap = self.object_map()?;
        let entry = omap.lookup(oid)?.ok_or_else(|| {
            NxError::NotFound(format!("volume {oid} is absent from the container object map"))
        })?;
        Volume::load(&self.device, entry.paddr, oid, index, self.xid()).map(Some)
    }

    /// Describe the descriptor ring, slot by slot.
    pub fn descriptor_ring(&self) -> Result<Vec<RingSlot>> {
        enumerate_descriptor_ring(&self.device, &self.checkpoint.superblock)
    }

    /// Resolver for ephemeral trees, whose child pointers go through the
    /// checkpoint mapping table the way virtual ones go through an
    /// object map.
    #[must_use]
    pub fn ephemeral_resolver(&self) -> EphemeralResolver<'_> {
        EphemeralResolver {
            checkpoint: &self.checkpoint,
        }
    }
}

/// [`ChildResolver`] backed by the active checkpoint's mapping table.
pub struct EphemeralResolver<'a> {
    checkpoint: &'a Checkpoint,
}

impl ChildResolver for EphemeralResolver<'_> {
    fn resolve(&self, oid: Oid) -> Result<Paddr> {
        self.checkpoint
            .ephemeral_mapping(oid)
            .map(|mapping| mapping.paddr)
            .ok_or_else(|| NxError::NotFound(format!("ephemeral object {oid}")))
    }
}

/// File-backed session type produced by [`open_path`].
pub type FileContainer = Container<ArcCache<ByteBlockDevice<FileByteDevice>>>;

/// Mount a container image from a file, probing the block size from the
/// bootstrap superblock and wrapping the device in a block cache.
pub fn open_path(path: impl AsRef<std::path::Path>) -> Result<FileContainer> {
    let raw = FileByteDevice::open(path)?;

    // The geometry field lives at a fixed offset; full validation of the
    // bootstrap block happens once the sized device exists.
    let mut probe = [0_u8; 40];
    raw.read_exact_at(0, &mut probe)?;
    let block_size = BlockSize::new(u32::from_le_bytes([
        probe[36], probe[37], probe[38], probe[39],
    ]))
    .map_err(|e| NxError::Format(e.to_string()))?;

    let device = ByteBlockDevice::new(raw, block_size.get())?;
    let cached = ArcCache::new(device, DEFAULT_CACHE_BLOCKS)?;
    Container::open(cached)
}

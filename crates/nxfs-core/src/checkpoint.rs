//! Checkpoint discovery.
//!
//! The block-zero superblock is only a bootstrap copy; the authoritative
//! container state lives in the checkpoint descriptor ring, a circular
//! region holding superblocks and their checkpoint-mapping blocks. Mount
//! picks the superblock with the highest transaction id whose mapping
//! blocks all verify, falling back to older generations when the newest
//! write was torn or damaged.

use nxfs_block::BlockDevice;
use nxfs_error::{NxError, Result};
use nxfs_ondisk::{verify_block, CheckpointMapPhys, CheckpointMapping, NxSuperblock, ObjectHeader};
use nxfs_types::{Oid, ParseError, Xid, OBJECT_TYPE_CHECKPOINT_MAP, OBJECT_TYPE_NX_SUPERBLOCK};
use serde::Serialize;
use tracing::{debug, warn};

/// A mounted checkpoint: the winning superblock plus the ephemeral
/// object mappings recorded alongside it.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub superblock: NxSuperblock,
    /// Transaction id of the winning superblock.
    pub xid: Xid,
    /// Ring block holding the winning superblock.
    pub block: u64,
    /// Ephemeral mappings gathered from the checkpoint's map blocks.
    pub mappings: Vec<CheckpointMapping>,
}

impl Checkpoint {
    /// Find the mapping for an ephemeral object id.
    #[must_use]
    pub fn ephemeral_mapping(&self, oid: Oid) -> Option<&CheckpointMapping> {
        self.mappings.iter().find(|mapping| mapping.oid == oid)
    }
}

/// Read and validate the bootstrap superblock at block zero.
pub fn load_bootstrap(device: &dyn BlockDevice) -> Result<NxSuperblock> {
    let buf = device.read_block(0)?;
    if !verify_block(buf.as_slice()) {
        return Err(NxError::Corruption {
            block: 0,
            detail: "bootstrap superblock failed checksum verification".to_owned(),
        });
    }
    let header = ObjectHeader::parse(buf.as_slice()).map_err(|e| corrupt(0, e))?;
    if header.kind() != OBJECT_TYPE_NX_SUPERBLOCK {
        return Err(NxError::Format(format!(
            "block zero is not a container superblock (kind {:#x})",
            header.kind()
        )));
    }
    NxSuperblock::parse(buf.as_slice()).map_err(|e| corrupt(0, e))
}

struct Candidate {
    superblock: NxSuperblock,
    xid: Xid,
    /// Slot within the ring.
    slot: u32,
    block: u64,
}

struct RingGeometry {
    base: u64,
    blocks: u32,
}

impl RingGeometry {
    fn from_superblock(sb: &NxSuperblock) -> Result<Self> {
        let base = sb
            .xp_desc_base
            .to_block()
            .map_err(|e| NxError::InvalidGeometry(format!("descriptor ring base: {e}")))?;
        if sb.xp_desc_blocks == 0 {
            return Err(NxError::InvalidGeometry(
                "checkpoint descriptor ring is empty".to_owned(),
            ));
        }
        base.checked_add(u64::from(sb.xp_desc_blocks))
            .filter(|end| *end <= sb.block_count)
            .ok_or_else(|| {
                NxError::InvalidGeometry(format!(
                    "descriptor ring [{base}, +{}) exceeds container of {} blocks",
                    sb.xp_desc_blocks, sb.block_count
                ))
            })?;
        Ok(Self {
            base,
            blocks: sb.xp_desc_blocks,
        })
    }

    // Slot arithmetic happens in u64 so on-disk indices near u32::MAX
    // cannot overflow before the wrap.
    fn block_at(&self, slot: u64) -> u64 {
        self.base + slot % u64::from(self.blocks)
    }
}

/// Select the newest fully-valid checkpoint from the descriptor ring.
///
/// Candidates are superblocks found anywhere in the ring, tried in
/// descending xid order. A candidate wins only when every mapping block
/// in its recorded span verifies; otherwise the next older candidate is
/// tried. `NoValidCheckpoint` means the ring held superblocks but none
/// could be validated end to end.
pub fn find_latest_checkpoint(
    device: &dyn BlockDevice,
    bootstrap: &NxSuperblock,
) -> Result<Checkpoint> {
    let ring = RingGeometry::from_superblock(bootstrap)?;

    let mut candidates = Vec::new();
    for slot in 0..ring.blocks {
        let block = ring.block_at(u64::from(slot));
        let buf = device.read_block(block)?;
        if !verify_block(buf.as_slice()) {
            continue;
        }
        let Ok(header) = ObjectHeader::parse(buf.as_slice()) else {
            continue;
        };
        if header.kind() != OBJECT_TYPE_NX_SUPERBLOCK {
            continue;
        }
        match NxSuperblock::parse(buf.as_slice()) {
            Ok(superblock) => candidates.push(Candidate {
                superblock,
                xid: header.xid,
                slot,
                block,
            }),
            Err(error) => {
                warn!(block, %error, "descriptor ring superblock failed to parse");
            }
        }
    }

    let total = candidates.len();
    candidates.sort_by(|a, b| b.xid.cmp(&a.xid));

    for candidate in candidates {
        match collect_mappings(device, &ring, &candidate) {
            Ok(mappings) => {
                debug!(
                    xid = candidate.xid.0,
                    block = candidate.block,
                    mappings = mappings.len(),
                    "selected checkpoint"
                );
                return Ok(Checkpoint {
                    superblock: candidate.superblock,
                    xid: candidate.xid,
                    block: candidate.block,
                    mappings,
                });
            }
            Err(error) => {
                warn!(
                    xid = candidate.xid.0,
                    block = candidate.block,
                    %error,
                    "checkpoint rejected, falling back to an older generation"
                );
            }
        }
    }

    Err(NxError::NoValidCheckpoint { candidates: total })
}

/// Gather and validate the mapping blocks of one candidate.
///
/// The candidate's own `xp_desc_index`/`xp_desc_len` record the span it
/// occupies in the ring: `len - 1` mapping blocks followed by the
/// superblock itself, wrapping at the ring edge. Every mapping block
/// must checksum, carry the candidate's xid, and the final one must set
/// the last-block flag.
fn collect_mappings(
    device: &dyn BlockDevice,
    ring: &RingGeometry,
    candidate: &Candidate,
) -> Result<Vec<CheckpointMapping>> {
    let index = u64::from(candidate.superblock.xp_desc_index);
    let len = candidate.superblock.xp_desc_len;
    if len == 0 || len > ring.blocks {
        return Err(NxError::Corruption {
            block: candidate.block,
            detail: format!("checkpoint span of {len} blocks does not fit the ring"),
        });
    }

    // The superblock must sit in the span's final slot.
    let last_slot = (index + u64::from(len - 1)) % u64::from(ring.blocks);
    if last_slot != u64::from(candidate.slot % ring.blocks) {
        return Err(NxError::Corruption {
            block: candidate.block,
            detail: "checkpoint span does not end at its superblock".to_owned(),
        });
    }

    let mut mappings = Vec::new();
    for i in 0..u64::from(len - 1) {
        let block = ring.block_at(index + i);
        let buf = device.read_block(block)?;
        if !verify_block(buf.as_slice()) {
            return Err(NxError::Corruption {
                block,
                detail: "checkpoint mapping block failed checksum verification".to_owned(),
            });
        }
        let header = ObjectHeader::parse(buf.as_slice()).map_err(|e| corrupt(block, e))?;
        if header.kind() != OBJECT_TYPE_CHECKPOINT_MAP {
            return Err(NxError::Corruption {
                block,
                detail: format!(
                    "expected a checkpoint map in the span, found kind {:#x}",
                    header.kind()
                ),
            });
        }
        if header.xid != candidate.xid {
            return Err(NxError::Corruption {
                block,
                detail: format!(
                    "mapping block xid {} does not match checkpoint xid {}",
                    header.xid, candidate.xid
                ),
            });
        }

        let map = CheckpointMapPhys::parse(buf.as_slice()).map_err(|e| corrupt(block, e))?;
        let is_final = i + 2 == u64::from(len);
        if is_final != map.is_last() {
            return Err(NxError::Corruption {
                block,
                detail: "last-block flag disagrees with the span layout".to_owned(),
            });
        }
        if let Some(bad) = map
            .mappings
            .iter()
            .find(|mapping| !mapping.is_recognized_ephemeral())
        {
            return Err(NxError::Corruption {
                block,
                detail: format!(
                    "checkpoint maps unrecognized ephemeral kind {:#x} for {}",
                    bad.object_type, bad.oid
                ),
            });
        }
        mappings.extend(map.mappings);
    }

    Ok(mappings)
}

// ── ring enumeration ─────────────────────────────────────────────────────

/// What one descriptor-ring slot holds.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RingSlotKind {
    Superblock { xid: u64 },
    CheckpointMap { xid: u64, entries: usize, last: bool },
    Other { object_kind: u32 },
    Invalid,
}

/// One slot of the descriptor ring, for inspection tooling.
#[derive(Debug, Clone, Serialize)]
pub struct RingSlot {
    pub slot: u32,
    pub block: u64,
    #[serde(flatten)]
    pub contents: RingSlotKind,
}

/// Describe every slot of the descriptor ring without judging which
/// checkpoint is current.
pub fn enumerate_descriptor_ring(
    device: &dyn BlockDevice,
    bootstrap: &NxSuperblock,
) -> Result<Vec<RingSlot>> {
    let ring = RingGeometry::from_superblock(bootstrap)?;
    let mut slots = Vec::with_capacity(ring.blocks as usize);
    for slot in 0..ring.blocks {
        let block = ring.block_at(u64::from(slot));
        let buf = device.read_block(block)?;
        let contents = describe_slot(buf.as_slice());
        slots.push(RingSlot {
            slot,
            block,
            contents,
        });
    }
    Ok(slots)
}

fn describe_slot(block: &[u8]) -> RingSlotKind {
    if !verify_block(block) {
        return RingSlotKind::Invalid;
    }
    let Ok(header) = ObjectHeader::parse(block) else {
        return RingSlotKind::Invalid;
    };
    match header.kind() {
        OBJECT_TYPE_NX_SUPERBLOCK => RingSlotKind::Superblock { xid: header.xid.0 },
        OBJECT_TYPE_CHECKPOINT_MAP => match CheckpointMapPhys::parse(block) {
            Ok(map) => RingSlotKind::CheckpointMap {
                xid: header.xid.0,
                entries: map.mappings.len(),
                last: map.is_last(),
            },
            Err(_) => RingSlotKind::Invalid,
        },
        other => RingSlotKind::Other { object_kind: other },
    }
}

pub(crate) fn corrupt(block: u64, err: ParseError) -> NxError {
    NxError::Corruption {
        block,
        detail: err.to_string(),
    }
}

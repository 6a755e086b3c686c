//! End-to-end properties of checkpoint selection and object-map
//! resolution, exercised through the normal mount path.

use nxfs_core::{Container, ObjectMap};
use nxfs_error::NxError;
use nxfs_harness::{
    basic_container, checkpoint_map_block, layout, omap_phys_block, omap_tree_blocks,
    omap_tree_root_block, superblock_block, ImageBuilder, MappingSpec, OmapRecord,
    SuperblockSpec, BASIC_VOLUME_OID, BASIC_XID, OMAP_NODE_CAPACITY,
};
use nxfs_types::{Oid, Paddr, Xid, OBJECT_TYPE_SPACEMAN, OBJ_EPHEMERAL};

fn superblock_for(xid: Xid, index: u32, len: u32) -> Vec<u8> {
    superblock_block(&SuperblockSpec {
        xid,
        block_count: layout::BLOCK_COUNT,
        incompatible_features: 0,
        xp_desc_base: layout::RING_BASE,
        xp_desc_blocks: layout::RING_BLOCKS,
        xp_desc_index: index,
        xp_desc_len: len,
        omap_addr: layout::OMAP_PHYS,
        volumes: vec![(0, BASIC_VOLUME_OID)],
    })
}

/// The basic image plus an older checkpoint (xid 4) in ring slots 2-3.
fn image_with_two_checkpoints() -> ImageBuilder {
    let mut image = basic_container();
    image.put(
        layout::RING_BASE + 2,
        checkpoint_map_block(
            Xid(4),
            true,
            &[MappingSpec {
                object_type: OBJECT_TYPE_SPACEMAN | OBJ_EPHEMERAL,
                oid: Oid(0x400),
                paddr: layout::SPACEMAN,
            }],
        ),
    );
    image.put(layout::RING_BASE + 3, superblock_for(Xid(4), 2, 2));
    image
}

#[test]
fn the_newest_checkpoint_wins() {
    let container = Container::open(image_with_two_checkpoints().into_device()).expect("mount");
    assert_eq!(container.xid(), BASIC_XID);
}

#[test]
fn damaged_mapping_block_falls_back_to_the_older_generation() {
    let mut image = image_with_two_checkpoints();
    // Break the xid-5 checkpoint's mapping block; its superblock still
    // verifies, but the checkpoint as a whole must be rejected.
    image.corrupt_bit(layout::RING_BASE, 100, 3);

    let container = Container::open(image.into_device()).expect("mount");
    assert_eq!(container.xid(), Xid(4));
}

#[test]
fn torn_superblock_write_falls_back() {
    let mut image = image_with_two_checkpoints();
    // Simulate a torn write of the newest superblock: content present
    // but never sealed.
    let torn = superblock_for(Xid(6), 4, 1);
    image.put_unsealed(layout::RING_BASE + 4, torn);

    let container = Container::open(image.into_device()).expect("mount");
    assert_eq!(container.xid(), BASIC_XID, "unsealed candidate must be invisible");
}

#[test]
fn no_valid_checkpoint_is_a_distinct_error() {
    let mut image = basic_container();
    // Invalidate both ring blocks of the only checkpoint.
    image.corrupt_bit(layout::RING_BASE, 50, 0);
    image.corrupt_bit(layout::RING_BASE + 1, 50, 0);

    let err = Container::open(image.into_device()).unwrap_err();
    assert!(matches!(err, NxError::NoValidCheckpoint { candidates: 0 }));
}

#[test]
fn unrecognized_ephemeral_kind_rejects_the_candidate() {
    let mut image = image_with_two_checkpoints();
    // Replace the xid-5 mapping block with one naming an object kind
    // that is not checkpoint-bound ephemeral state.
    image.put(
        layout::RING_BASE,
        checkpoint_map_block(
            BASIC_XID,
            true,
            &[MappingSpec {
                object_type: nxfs_types::OBJECT_TYPE_EFI_JUMPSTART | OBJ_EPHEMERAL,
                oid: Oid(0x400),
                paddr: layout::SPACEMAN,
            }],
        ),
    );

    let container = Container::open(image.into_device()).expect("mount");
    assert_eq!(container.xid(), Xid(4));
}

#[test]
fn span_mismatch_rejects_the_candidate() {
    let mut image = image_with_two_checkpoints();
    // The xid-5 superblock sits in slot 1 but now claims a span that
    // ends elsewhere.
    image.put(layout::RING_BASE + 1, superblock_for(BASIC_XID, 0, 3));

    let container = Container::open(image.into_device()).expect("mount");
    assert_eq!(container.xid(), Xid(4));
}

// ── point-in-time object-map semantics ───────────────────────────────────

const VERSIONED_OID: Oid = Oid(600);

/// An object map holding three versions of one object: written at xid 1,
/// rewritten at xid 3, deleted at xid 5.
fn versioned_omap_image() -> ImageBuilder {
    let mut image = basic_container();
    image.put(
        layout::OMAP_ROOT,
        omap_tree_root_block(
            layout::OMAP_ROOT,
            BASIC_XID,
            &[
                OmapRecord::live(VERSIONED_OID, Xid(1), layout::SPACEMAN),
                OmapRecord::live(VERSIONED_OID, Xid(3), layout::VOLUME_SB),
                OmapRecord::tombstone(VERSIONED_OID, Xid(5)),
                OmapRecord::live(BASIC_VOLUME_OID, Xid(3), layout::VOLUME_SB),
            ],
        ),
    );
    image
}

fn paddr_of(omap: &ObjectMap<'_>, oid: Oid, max_xid: Xid) -> Option<Paddr> {
    omap.lookup_at(oid, max_xid)
        .expect("lookup")
        .map(|entry| entry.paddr)
}

#[test]
fn omap_lookups_are_point_in_time() {
    let container = Container::open(versioned_omap_image().into_device()).expect("mount");
    let omap = container.object_map().expect("omap");

    // Before the first write: absent.
    assert_eq!(paddr_of(&omap, VERSIONED_OID, Xid(0)), None);
    // At and after xid 1 the first version is visible.
    assert_eq!(
        paddr_of(&omap, VERSIONED_OID, Xid(1)),
        Some(Paddr(layout::SPACEMAN as i64))
    );
    assert_eq!(
        paddr_of(&omap, VERSIONED_OID, Xid(2)),
        Some(Paddr(layout::SPACEMAN as i64))
    );
    // The xid-3 rewrite shadows it.
    assert_eq!(
        paddr_of(&omap, VERSIONED_OID, Xid(3)),
        Some(Paddr(layout::VOLUME_SB as i64))
    );
    assert_eq!(
        paddr_of(&omap, VERSIONED_OID, Xid(4)),
        Some(Paddr(layout::VOLUME_SB as i64))
    );
    // The xid-5 tombstone hides every older version.
    assert_eq!(paddr_of(&omap, VERSIONED_OID, Xid(5)), None);
    assert_eq!(paddr_of(&omap, VERSIONED_OID, Xid(100)), None);
}

#[test]
fn tombstones_do_not_leak_into_neighboring_oids() {
    let container = Container::open(versioned_omap_image().into_device()).expect("mount");
    let omap = container.object_map().expect("omap");

    // An oid just above the tombstoned one must not inherit its records.
    assert_eq!(paddr_of(&omap, Oid(601), Xid(100)), None);
    // The volume record after it in key order is still resolvable.
    assert_eq!(
        paddr_of(&omap, BASIC_VOLUME_OID, BASIC_XID),
        Some(Paddr(layout::VOLUME_SB as i64))
    );
}

#[test]
fn omap_entries_walk_every_record() {
    let container = Container::open(versioned_omap_image().into_device()).expect("mount");
    let omap = container.object_map().expect("omap");

    let entries = omap.entries().expect("entries");
    assert_eq!(entries.len(), 4);
    assert_eq!(entries[0].0.oid, VERSIONED_OID);
    assert_eq!(entries[0].0.xid, Xid(1));
    assert!(entries[2].1.is_deleted());
    assert_eq!(entries[3].0.oid, BASIC_VOLUME_OID);
}

#[test]
fn omap_lookups_span_leaf_boundaries() {
    const BASE: u64 = 0x1000;
    let count = OMAP_NODE_CAPACITY as u64 * 2 + 22; // three leaves
    let records: Vec<OmapRecord> = (0..count)
        .map(|i| OmapRecord::live(Oid(BASE + i), Xid(2), 0x2000 + i))
        .collect();

    let nodes = omap_tree_blocks(2, Xid(2), &records);
    assert_eq!(nodes.len(), 4, "root plus three leaves");

    let mut image = ImageBuilder::new(8);
    image.put(1, omap_phys_block(1, Xid(2), 2));
    for (addr, block) in nodes {
        image.put(addr, block);
    }
    let device = image.into_device();
    let omap = ObjectMap::open(&device, Paddr(1), Xid(2)).expect("omap");

    // First and last records of each leaf, including the boundaries
    // between leaves, resolve to their own addresses.
    let edge = OMAP_NODE_CAPACITY as u64;
    for i in [0, edge - 1, edge, edge + 1, 2 * edge - 1, 2 * edge, count - 1] {
        let entry = omap
            .lookup(Oid(BASE + i))
            .expect("lookup")
            .expect("present");
        assert_eq!(entry.paddr, Paddr((0x2000 + i) as i64));
    }

    // Outside the populated range: a miss, not a neighbor.
    assert!(omap.lookup(Oid(BASE - 1)).expect("lookup").is_none());
    assert!(omap
        .lookup_at(Oid(BASE), Xid(1))
        .expect("lookup")
        .is_none());

    assert_eq!(omap.entries().expect("entries").len(), count as usize);
}

#[test]
fn single_bit_corruption_in_the_omap_surfaces_as_corruption() {
    let mut image = versioned_omap_image();
    image.corrupt_bit(layout::OMAP_ROOT, 400, 5);

    let container = Container::open(image.into_device()).expect("mount");
    let err = container.object_map().unwrap_err();
    assert!(err.is_corruption());
}

//! Mount-path tests against synthetic container images.

use std::io::Write;

use nxfs_core::{Container, RingSlotKind};
use nxfs_error::NxError;
use nxfs_harness::{
    basic_container, layout, superblock_block, SuperblockSpec, BASIC_FS_ROOT_OID,
    BASIC_SPACEMAN_OID, BASIC_VOLUME_OID, BASIC_XID, BLOCK_SIZE,
};
use nxfs_types::{Oid, Xid};

#[test]
fn mounts_the_basic_container() {
    let container = Container::open(basic_container().into_device()).expect("mount");
    assert_eq!(container.xid(), BASIC_XID);
    assert_eq!(container.superblock().block_count, layout::BLOCK_COUNT);
    assert_eq!(container.volume_indices(), vec![0]);
}

#[test]
fn resolves_the_volume_and_its_tree() {
    let container = Container::open(basic_container().into_device()).expect("mount");
    let volume = container.volume(0).expect("lookup").expect("present");
    assert_eq!(volume.name(), "Macintosh HD");
    assert_eq!(volume.superblock.num_files, 12);
    assert_eq!(volume.superblock.num_directories, 4);

    let omap = volume.object_map().expect("volume omap");
    let entry = omap
        .lookup(BASIC_FS_ROOT_OID)
        .expect("lookup")
        .expect("root tree mapped");
    assert_eq!(entry.paddr.0 as u64, layout::FS_ROOT);

    let tree = volume.open_root_tree(&omap).expect("root tree");
    let hit = tree
        .search(b"dir/file-a", nxfs_btree::SearchMode::Exact)
        .expect("search")
        .expect("hit");
    assert_eq!(hit.value, b"contents-a");
}

#[test]
fn sparse_volume_slots_are_none() {
    let container = Container::open(basic_container().into_device()).expect("mount");
    assert!(container.volume(1).expect("lookup").is_none());
    assert!(container.volume(99).expect("lookup").is_none());
}

#[test]
fn ephemeral_objects_resolve_through_the_checkpoint() {
    let container = Container::open(basic_container().into_device()).expect("mount");
    let buf = container.ephemeral(BASIC_SPACEMAN_OID).expect("spaceman");
    assert_eq!(buf.len(), BLOCK_SIZE);

    let missing = container.ephemeral(Oid(0x999)).unwrap_err();
    assert!(missing.is_not_found());
}

#[test]
fn ephemeral_resolver_follows_the_mapping_table() {
    use nxfs_btree::ChildResolver;

    let container = Container::open(basic_container().into_device()).expect("mount");
    let resolver = container.ephemeral_resolver();
    let paddr = resolver.resolve(BASIC_SPACEMAN_OID).expect("resolve");
    assert_eq!(paddr.to_block().expect("block"), layout::SPACEMAN);
    assert!(resolver.resolve(Oid(0x999)).unwrap_err().is_not_found());
}

#[test]
fn container_object_map_resolves_volumes() {
    let container = Container::open(basic_container().into_device()).expect("mount");
    let omap = container.object_map().expect("omap");
    let entry = omap
        .lookup(BASIC_VOLUME_OID)
        .expect("lookup")
        .expect("present");
    assert_eq!(entry.paddr.0 as u64, layout::VOLUME_SB);
    assert_eq!(entry.xid, Xid(3));

    assert!(omap.lookup(Oid(0xdead)).expect("lookup").is_none());
}

#[test]
fn incompatible_features_refuse_to_mount() {
    use layout::*;

    let mut image = basic_container();
    let sb = SuperblockSpec {
        xid: BASIC_XID,
        block_count: BLOCK_COUNT,
        incompatible_features: 0x8000, // a bit this engine does not know
        xp_desc_base: RING_BASE,
        xp_desc_blocks: RING_BLOCKS,
        xp_desc_index: 0,
        xp_desc_len: 2,
        omap_addr: OMAP_PHYS,
        volumes: vec![(0, BASIC_VOLUME_OID)],
    };
    image.put(BOOTSTRAP, superblock_block(&sb));
    image.put(RING_BASE + 1, superblock_block(&sb));

    let err = Container::open(image.into_device()).unwrap_err();
    assert!(matches!(err, NxError::IncompatibleFeature(_)));
}

#[test]
fn negative_ring_base_is_rejected() {
    use layout::*;

    let mut image = basic_container();
    let sb = SuperblockSpec {
        xid: BASIC_XID,
        block_count: BLOCK_COUNT,
        incompatible_features: 0,
        xp_desc_base: u64::MAX, // -1 once read back as a signed address
        xp_desc_blocks: RING_BLOCKS,
        xp_desc_index: 0,
        xp_desc_len: 2,
        omap_addr: OMAP_PHYS,
        volumes: vec![(0, BASIC_VOLUME_OID)],
    };
    image.put(BOOTSTRAP, superblock_block(&sb));

    let err = Container::open(image.into_device()).unwrap_err();
    assert!(matches!(err, NxError::InvalidGeometry(_)));
}

#[test]
fn corrupt_bootstrap_is_rejected() {
    let mut image = basic_container();
    image.corrupt_bit(layout::BOOTSTRAP, 40, 0);
    let err = Container::open(image.into_device()).unwrap_err();
    assert!(err.is_corruption());
}

#[test]
fn descriptor_ring_enumeration_names_every_slot() {
    let container = Container::open(basic_container().into_device()).expect("mount");
    let slots = container.descriptor_ring().expect("ring");
    assert_eq!(slots.len(), layout::RING_BLOCKS as usize);

    assert!(matches!(
        slots[0].contents,
        RingSlotKind::CheckpointMap {
            xid: 5,
            entries: 1,
            last: true,
        }
    ));
    assert!(matches!(
        slots[1].contents,
        RingSlotKind::Superblock { xid: 5 }
    ));
    // Untouched ring slots are all-zero blocks that fail verification.
    assert!(matches!(slots[2].contents, RingSlotKind::Invalid));
}

#[test]
fn open_path_probes_geometry_from_the_file() {
    let image = basic_container().build();
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    file.write_all(&image).expect("write image");
    file.flush().expect("flush");

    let container = nxfs_core::open_path(file.path()).expect("mount from file");
    assert_eq!(container.xid(), BASIC_XID);
    let volume = container.volume(0).expect("lookup").expect("present");
    assert_eq!(volume.name(), "Macintosh HD");
}

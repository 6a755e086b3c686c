#![forbid(unsafe_code)]
//! Read-only traversal of copy-on-write B-trees.
//!
//! Trees are generic containers here: keys and values are byte slices,
//! and the caller supplies the key ordering and a [`ChildResolver`] that
//! turns child object ids into physical block addresses. The object map
//! uses a direct resolver (its trees are physical), filesystem trees
//! resolve children through a volume's object map, and ephemeral trees
//! resolve through the checkpoint mapping table. Defining the resolver
//! seam here keeps the object-map crate from depending on itself.
//!
//! Every node read is checksum-verified before any field is trusted; a
//! mismatch surfaces as [`NxError::Corruption`] naming the block.

use std::cmp::Ordering;

use nxfs_block::{BlockBuf, BlockDevice};
use nxfs_error::{NxError, Result};
use nxfs_ondisk::{verify_block, BtreeInfo, BtreeRawNode, ObjectHeader};
use nxfs_types::{
    read_le_u64, Oid, Paddr, ParseError, OBJECT_TYPE_BTREE, OBJECT_TYPE_BTREE_NODE,
};
use tracing::debug;

// ── child resolution ─────────────────────────────────────────────────────

/// Maps a child object id to the physical block holding it.
pub trait ChildResolver {
    fn resolve(&self, oid: Oid) -> Result<Paddr>;
}

/// Identity resolver for trees whose child pointers are already physical
/// block addresses.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectResolver;

impl ChildResolver for DirectResolver {
    fn resolve(&self, oid: Oid) -> Result<Paddr> {
        let addr = i64::try_from(oid.0)
            .map_err(|_| NxError::Format(format!("physical child address too large: {oid}")))?;
        Ok(Paddr(addr))
    }
}

// ── search parameters ────────────────────────────────────────────────────

/// How a search key relates to the entry it selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// The entry whose key equals the search key.
    Exact,
    /// The entry with the greatest key less than or equal to the search
    /// key. This is how point-in-time object-map lookups work.
    LowerBound,
    /// The first entry whose key starts with the search bytes. Only
    /// meaningful under [`KeyOrdering::Bytes`].
    Prefix,
}

/// Key comparison rule for a tree. The on-disk format does not encode
/// this; each tree kind defines its own ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrdering {
    /// Lexicographic comparison of the raw key bytes.
    Bytes,
    /// Keys are single little-endian u64 values.
    U64,
    /// Object-map keys: u64 oid then u64 xid, both ascending.
    OidXid,
}

impl KeyOrdering {
    fn compare(self, a: &[u8], b: &[u8]) -> std::result::Result<Ordering, ParseError> {
        match self {
            Self::Bytes => Ok(a.cmp(b)),
            Self::U64 => Ok(read_le_u64(a, 0)?.cmp(&read_le_u64(b, 0)?)),
            Self::OidXid => {
                let oid = read_le_u64(a, 0)?.cmp(&read_le_u64(b, 0)?);
                if oid != Ordering::Equal {
                    return Ok(oid);
                }
                Ok(read_le_u64(a, 8)?.cmp(&read_le_u64(b, 8)?))
            }
        }
    }
}

/// A record found by [`BtreeHandle::search`]. The key comes back along
/// with the value because lower-bound hits may land on a smaller key than
/// the one asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

// ── tree handle ──────────────────────────────────────────────────────────

/// An open B-tree, pinned to its root block.
pub struct BtreeHandle<'a> {
    device: &'a dyn BlockDevice,
    resolver: &'a dyn ChildResolver,
    ordering: KeyOrdering,
    root: BlockBuf,
    root_paddr: u64,
    info: BtreeInfo,
}

impl std::fmt::Debug for BtreeHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtreeHandle")
            .field("ordering", &self.ordering)
            .field("root_block", &self.root_paddr)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl<'a> BtreeHandle<'a> {
    /// Open the tree rooted at `root_oid`. The root is read, verified,
    /// and its embedded descriptor parsed; the root must carry the root
    /// flag and an in-range level.
    pub fn open(
        device: &'a dyn BlockDevice,
        resolver: &'a dyn ChildResolver,
        root_oid: Oid,
        ordering: KeyOrdering,
    ) -> Result<Self> {
        let paddr = resolver.resolve(root_oid)?;
        let block = paddr
            .to_block()
            .map_err(|e| NxError::Parse(format!("tree root {root_oid}: {e}")))?;
        let buf = device.read_block(block)?;
        if !verify_block(buf.as_slice()) {
            return Err(NxError::Corruption {
                block,
                detail: "tree root failed checksum verification".to_owned(),
            });
        }

        let node = BtreeRawNode::parse(buf.as_slice()).map_err(|e| corrupt(block, e))?;
        if !node.is_root() {
            return Err(NxError::Corruption {
                block,
                detail: "tree root is missing the root flag".to_owned(),
            });
        }
        if node.is_hashed() {
            return Err(NxError::UnsupportedFeature(
                "hashed B-tree nodes".to_owned(),
            ));
        }
        check_node_kind(&node.header, block)?;

        let info = BtreeInfo::parse_from_root(buf.as_slice()).map_err(|e| corrupt(block, e))?;
        debug!(
            root_oid = root_oid.0,
            block,
            level = node.level,
            key_count = info.key_count,
            "opened btree"
        );

        Ok(Self {
            device,
            resolver,
            ordering,
            root: buf,
            root_paddr: block,
            info,
        })
    }

    #[must_use]
    pub fn info(&self) -> &BtreeInfo {
        &self.info
    }

    #[must_use]
    pub fn root_block(&self) -> u64 {
        self.root_paddr
    }

    /// Search for `key` under the given mode. `Ok(None)` means no entry
    /// matches; a checksum or structure failure along the path is an
    /// error, never a silent miss.
    pub fn search(&self, key: &[u8], mode: SearchMode) -> Result<Option<LookupEntry>> {
        match mode {
            SearchMode::Exact | SearchMode::LowerBound => self.search_floor(key, mode),
            SearchMode::Prefix => self.search_prefix(key),
        }
    }

    /// Iterate all leaf records in key order.
    pub fn iter_leaf_entries(&self) -> LeafEntries<'_> {
        LeafEntries {
            tree: self,
            stack: vec![Frame {
                buf: self.root.clone(),
                block: self.root_paddr,
                next: 0,
            }],
        }
    }

    // ── descent ──────────────────────────────────────────────────────────

    fn search_floor(&self, key: &[u8], mode: SearchMode) -> Result<Option<LookupEntry>> {
        let mut buf = self.root.clone();
        let mut block = self.root_paddr;
        let mut expect_level: Option<u16> = None;

        loop {
            let node = BtreeRawNode::parse(buf.as_slice()).map_err(|e| corrupt(block, e))?;
            check_level(&node, expect_level, block)?;

            let Some(pos) = self.floor_position(&node, key, block)? else {
                // Every key in the tree is greater than the target.
                return Ok(None);
            };

            if node.is_leaf() {
                return self.floor_in_leaf(&node, pos, key, mode, block);
            }

            let entry = node.entry(pos, &self.info).map_err(|e| corrupt(block, e))?;
            let child = entry.child_oid().map_err(|e| corrupt(block, e))?;
            expect_level = Some(node.level - 1);
            (block, buf) = self.load_node(child)?;
        }
    }

    /// Greatest slot whose key is <= `key`, or `None` if the first slot
    /// is already greater.
    fn floor_position(
        &self,
        node: &BtreeRawNode<'_>,
        key: &[u8],
        block: u64,
    ) -> Result<Option<usize>> {
        let mut lo = 0_usize;
        let mut hi = node.nkeys as usize;
        // Invariant: slots below `lo` are <= key, slots at or above `hi`
        // are > key.
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let entry = node.entry(mid, &self.info).map_err(|e| corrupt(block, e))?;
            let cmp = self
                .ordering
                .compare(entry.key, key)
                .map_err(|e| corrupt(block, e))?;
            if cmp == Ordering::Greater {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(lo.checked_sub(1))
    }

    fn floor_in_leaf(
        &self,
        node: &BtreeRawNode<'_>,
        pos: usize,
        key: &[u8],
        mode: SearchMode,
        block: u64,
    ) -> Result<Option<LookupEntry>> {
        let entry = node.entry(pos, &self.info).map_err(|e| corrupt(block, e))?;
        let Some(value) = entry.value else {
            // A ghost is a logically absent record: the search ends
            // with no match rather than being redirected to an older
            // neighbor, which would differ depending on which leaf the
            // ghost landed in.
            self.check_ghost_allowed(block)?;
            return Ok(None);
        };
        if mode == SearchMode::Exact {
            let cmp = self
                .ordering
                .compare(entry.key, key)
                .map_err(|e| corrupt(block, e))?;
            if cmp != Ordering::Equal {
                return Ok(None);
            }
        }
        Ok(Some(LookupEntry {
            key: entry.key.to_vec(),
            value: value.to_vec(),
        }))
    }

    fn search_prefix(&self, prefix: &[u8]) -> Result<Option<LookupEntry>> {
        // Position a cursor at the first entry >= prefix, then check the
        // prefix there. Entries sharing the prefix sort contiguously from
        // that point, so one probe decides.
        let mut cursor = self.cursor_at_lower_bound(prefix)?;
        for item in &mut cursor {
            let (key, value) = item?;
            return Ok(if key.starts_with(prefix) {
                Some(LookupEntry { key, value })
            } else {
                None
            });
        }
        Ok(None)
    }

    /// Build a leaf cursor whose first yielded entry is the first record
    /// with key >= `key`.
    fn cursor_at_lower_bound(&self, key: &[u8]) -> Result<LeafEntries<'_>> {
        let mut stack = Vec::new();
        let mut buf = self.root.clone();
        let mut block = self.root_paddr;
        let mut expect_level: Option<u16> = None;

        loop {
            let node = BtreeRawNode::parse(buf.as_slice()).map_err(|e| corrupt(block, e))?;
            check_level(&node, expect_level, block)?;
            let floor = self.floor_position(&node, key, block)?;

            if node.is_leaf() {
                // First slot > floor is the lower bound; slots at the
                // floor position may still equal the key.
                let start = match floor {
                    Some(pos) => {
                        let entry =
                            node.entry(pos, &self.info).map_err(|e| corrupt(block, e))?;
                        let cmp = self
                            .ordering
                            .compare(entry.key, key)
                            .map_err(|e| corrupt(block, e))?;
                        if cmp == Ordering::Less {
                            pos + 1
                        } else {
                            pos
                        }
                    }
                    None => 0,
                };
                stack.push(Frame {
                    buf,
                    block,
                    next: start,
                });
                return Ok(LeafEntries { tree: self, stack });
            }

            let pos = floor.unwrap_or(0);
            let entry = node.entry(pos, &self.info).map_err(|e| corrupt(block, e))?;
            let child = entry.child_oid().map_err(|e| corrupt(block, e))?;
            let level = node.level;
            stack.push(Frame {
                buf,
                block,
                next: pos + 1,
            });
            expect_level = Some(level - 1);
            (block, buf) = self.load_node(child)?;
        }
    }

    fn load_node(&self, oid: Oid) -> Result<(u64, BlockBuf)> {
        let paddr = self.resolver.resolve(oid)?;
        let block = paddr
            .to_block()
            .map_err(|e| NxError::Parse(format!("tree node {oid}: {e}")))?;
        let buf = self.device.read_block(block)?;
        if !verify_block(buf.as_slice()) {
            return Err(NxError::Corruption {
                block,
                detail: "tree node failed checksum verification".to_owned(),
            });
        }
        let header = ObjectHeader::parse(buf.as_slice()).map_err(|e| corrupt(block, e))?;
        check_node_kind(&header, block)?;
        Ok((block, buf))
    }

    fn check_ghost_allowed(&self, block: u64) -> Result<()> {
        if self.info.allows_ghosts() {
            Ok(())
        } else {
            Err(NxError::Corruption {
                block,
                detail: "ghost record in a tree that forbids ghosts".to_owned(),
            })
        }
    }
}

fn corrupt(block: u64, err: ParseError) -> NxError {
    NxError::Corruption {
        block,
        detail: err.to_string(),
    }
}

fn check_node_kind(header: &ObjectHeader, block: u64) -> Result<()> {
    match header.kind() {
        OBJECT_TYPE_BTREE | OBJECT_TYPE_BTREE_NODE => Ok(()),
        other => Err(NxError::Corruption {
            block,
            detail: format!("expected a tree node, found object kind {other:#x}"),
        }),
    }
}

fn check_level(node: &BtreeRawNode<'_>, expect: Option<u16>, block: u64) -> Result<()> {
    match expect {
        Some(level) if node.level != level => Err(NxError::Corruption {
            block,
            detail: format!("child level {} does not continue level {level}", node.level),
        }),
        _ => Ok(()),
    }
}

// ── leaf iteration ───────────────────────────────────────────────────────

struct Frame {
    buf: BlockBuf,
    block: u64,
    next: usize,
}

/// In-order walk over a tree's leaf records. Ghost slots are skipped when
/// the tree allows them and reported as corruption otherwise.
pub struct LeafEntries<'t> {
    tree: &'t BtreeHandle<'t>,
    stack: Vec<Frame>,
}

impl LeafEntries<'_> {
    fn step(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            let (buf, block, index) = {
                let Some(top) = self.stack.last_mut() else {
                    return Ok(None);
                };
                let taken = top.next;
                top.next += 1;
                (top.buf.clone(), top.block, taken)
            };

            let node = BtreeRawNode::parse(buf.as_slice()).map_err(|e| corrupt(block, e))?;
            if index >= node.nkeys as usize {
                self.stack.pop();
                continue;
            }

            let entry = node
                .entry(index, self.tree.info())
                .map_err(|e| corrupt(block, e))?;
            if node.is_leaf() {
                match entry.value {
                    Some(value) => return Ok(Some((entry.key.to_vec(), value.to_vec()))),
                    None => {
                        self.tree.check_ghost_allowed(block)?;
                        continue;
                    }
                }
            }

            let child = entry.child_oid().map_err(|e| corrupt(block, e))?;
            let (child_block, child_buf) = self.tree.load_node(child)?;
            let child_node =
                BtreeRawNode::parse(child_buf.as_slice()).map_err(|e| corrupt(child_block, e))?;
            check_level(&child_node, Some(node.level - 1), child_block)?;
            self.stack.push(Frame {
                buf: child_buf,
                block: child_block,
                next: 0,
            });
        }
    }
}

impl Iterator for LeafEntries<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.step().transpose()
    }
}

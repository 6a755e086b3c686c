#![forbid(unsafe_code)]
//! Read-only block I/O layer with ARC (Adaptive Replacement Cache).
//!
//! Provides the `ByteDevice`/`BlockDevice` traits and a read-through
//! cache. The engine above never mutates a block, so the cache has no
//! dirty state and no writeback path; every cached buffer is immutable
//! for the lifetime of the session that read it.

use nxfs_error::{NxError, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Owned block buffer.
///
/// Invariant: length == block size of the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Arc<Vec<u8>>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(bytes),
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Byte-addressed read-only device (pread semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

/// File-backed byte device using `pread`-style positioned I/O.
///
/// `std::os::unix::fs::FileExt` reads are thread-safe and do not share a
/// seek position, so concurrent reader sessions need no locking here.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(
                u64::try_from(buf.len())
                    .map_err(|_| NxError::Format("read length overflows u64".to_owned()))?,
            )
            .ok_or_else(|| NxError::Format("read range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(NxError::Format(format!(
                "read out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }

        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }
}

/// In-memory byte device over an owned image.
///
/// Used by tests and the synthetic-image harness; also convenient for
/// holding multiple independent sessions over the same image.
#[derive(Debug, Clone)]
pub struct MemoryByteDevice {
    bytes: Arc<Vec<u8>>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(bytes),
        }
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let offset =
            usize::try_from(offset).map_err(|_| NxError::Format("offset overflow".into()))?;
        let end = offset
            .checked_add(buf.len())
            .ok_or_else(|| NxError::Format("range overflow".into()))?;
        if end > self.bytes.len() {
            return Err(NxError::Format(format!(
                "read out of bounds: offset={offset} len={} image_len={}",
                buf.len(),
                self.bytes.len()
            )));
        }
        buf.copy_from_slice(&self.bytes[offset..end]);
        Ok(())
    }
}

/// Block-addressed read interface.
///
/// All engine components depend only on this trait, never on a specific
/// storage medium.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: u64) -> Result<BlockBuf>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;
}

/// Adapter exposing a `ByteDevice` as fixed-size blocks.
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(NxError::Format(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }

        let len = inner.len_bytes();
        let block_size_u64 = u64::from(block_size);
        // A trailing partial block is unreadable; exclude it rather than
        // reject the image, since container length is measured in blocks.
        let block_count = len / block_size_u64;
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: u64) -> Result<BlockBuf> {
        if block >= self.block_count {
            return Err(NxError::Format(format!(
                "block out of range: block={block} block_count={}",
                self.block_count
            )));
        }

        let offset = block
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| NxError::Format("block offset overflow".to_owned()))?;
        let mut buf = vec![
            0_u8;
            usize::try_from(self.block_size)
                .map_err(|_| NxError::Format("block_size does not fit usize".to_owned()))?
        ];
        self.inner.read_exact_at(offset, &mut buf)?;
        Ok(BlockBuf::new(buf))
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }
}

impl<T: BlockDevice + ?Sized> BlockDevice for Arc<T> {
    fn read_block(&self, block: u64) -> Result<BlockBuf> {
        (**self).read_block(block)
    }

    fn block_size(&self) -> u32 {
        (**self).block_size()
    }

    fn block_count(&self) -> u64 {
        (**self).block_count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArcList {
    T1,
    T2,
    B1,
    B2,
}

#[derive(Debug)]
struct ArcState {
    capacity: usize,
    /// Target size for the T1 list.
    p: usize,
    t1: VecDeque<u64>,
    t2: VecDeque<u64>,
    b1: VecDeque<u64>,
    b2: VecDeque<u64>,
    loc: HashMap<u64, ArcList>,
    resident: HashMap<u64, BlockBuf>,
}

impl ArcState {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            p: 0,
            t1: VecDeque::new(),
            t2: VecDeque::new(),
            b1: VecDeque::new(),
            b2: VecDeque::new(),
            loc: HashMap::new(),
            resident: HashMap::new(),
        }
    }

    fn remove_from_list(list: &mut VecDeque<u64>, key: u64) -> bool {
        if let Some(pos) = list.iter().position(|k| *k == key) {
            let _ = list.remove(pos);
            return true;
        }
        false
    }

    fn touch_mru(&mut self, key: u64) {
        let Some(list) = self.loc.get(&key).copied() else {
            return;
        };

        match list {
            ArcList::T1 => {
                let _ = Self::remove_from_list(&mut self.t1, key);
                self.t2.push_back(key);
                self.loc.insert(key, ArcList::T2);
            }
            ArcList::T2 => {
                let _ = Self::remove_from_list(&mut self.t2, key);
                self.t2.push_back(key);
            }
            ArcList::B1 | ArcList::B2 => {}
        }
    }

    fn replace(&mut self, incoming: u64) {
        let t1_len = self.t1.len();
        if t1_len >= 1
            && (t1_len > self.p
                || (matches!(self.loc.get(&incoming), Some(ArcList::B2)) && t1_len == self.p))
        {
            if let Some(victim) = self.t1.pop_front() {
                self.loc.insert(victim, ArcList::B1);
                let _ = self.resident.remove(&victim);
                self.b1.push_back(victim);
            }
        } else if let Some(victim) = self.t2.pop_front() {
            self.loc.insert(victim, ArcList::B2);
            let _ = self.resident.remove(&victim);
            self.b2.push_back(victim);
        }

        while self.b1.len() > self.capacity {
            if let Some(victim) = self.b1.pop_front() {
                let _ = self.loc.remove(&victim);
            }
        }
        while self.b2.len() > self.capacity {
            if let Some(victim) = self.b2.pop_front() {
                let _ = self.loc.remove(&victim);
            }
        }
    }

    fn on_hit(&mut self, key: u64) {
        self.touch_mru(key);
    }

    fn on_miss_or_ghost_hit(&mut self, key: u64) {
        if matches!(self.loc.get(&key), Some(ArcList::B1)) {
            let b1_len = self.b1.len().max(1);
            let b2_len = self.b2.len().max(1);
            let delta = (b2_len / b1_len).max(1);
            self.p = (self.p + delta).min(self.capacity);
            let _ = Self::remove_from_list(&mut self.b1, key);
            self.replace(key);
            self.t2.push_back(key);
            self.loc.insert(key, ArcList::T2);
            return;
        }

        if matches!(self.loc.get(&key), Some(ArcList::B2)) {
            let b1_len = self.b1.len().max(1);
            let b2_len = self.b2.len().max(1);
            let delta = (b1_len / b2_len).max(1);
            self.p = self.p.saturating_sub(delta);
            let _ = Self::remove_from_list(&mut self.b2, key);
            self.replace(key);
            self.t2.push_back(key);
            self.loc.insert(key, ArcList::T2);
            return;
        }

        // Not present in any list.
        if self.t1.len() + self.b1.len() == self.capacity {
            if self.t1.len() < self.capacity {
                let _ = self.b1.pop_front().and_then(|v| self.loc.remove(&v));
                self.replace(key);
            } else if let Some(victim) = self.t1.pop_front() {
                let _ = self.loc.remove(&victim);
                let _ = self.resident.remove(&victim);
            }
        } else if (self.t1.len() + self.b1.len()) < self.capacity
            && (self.t1.len() + self.t2.len() + self.b1.len() + self.b2.len())
                >= self.capacity.saturating_mul(2)
        {
            let _ = self.b2.pop_front().and_then(|v| self.loc.remove(&v));
        }

        self.replace(key);
        self.t1.push_back(key);
        self.loc.insert(key, ArcList::T1);
    }
}

/// ARC-cached wrapper around a [`BlockDevice`].
///
/// Read-through caching of whole blocks; the only shared mutable state in
/// the engine, guarded by a single mutex around the recency lists.
#[derive(Debug)]
pub struct ArcCache<D: BlockDevice> {
    inner: D,
    state: Mutex<ArcState>,
}

impl<D: BlockDevice> ArcCache<D> {
    pub fn new(inner: D, capacity_blocks: usize) -> Result<Self> {
        if capacity_blocks == 0 {
            return Err(NxError::Format(
                "ArcCache capacity_blocks must be > 0".to_owned(),
            ));
        }
        Ok(Self {
            inner,
            state: Mutex::new(ArcState::new(capacity_blocks)),
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: BlockDevice> BlockDevice for ArcCache<D> {
    fn read_block(&self, block: u64) -> Result<BlockBuf> {
        {
            let mut guard = self.state.lock();
            if let Some(buf) = guard.resident.get(&block).cloned() {
                guard.on_hit(block);
                drop(guard);
                return Ok(buf);
            }
        }

        let buf = self.inner.read_block(block)?;

        let mut guard = self.state.lock();
        guard.on_miss_or_ghost_hit(block);
        guard.resident.insert(block, buf.clone());
        drop(guard);
        Ok(buf)
    }

    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }
}

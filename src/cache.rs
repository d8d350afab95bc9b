//! Cached sector buffers.
//!
//! Every metadata access of the engine (boot sector, FAT, directory
//! entries, FSInfo) and every data-cluster access goes through one of
//! these buffers. A buffer holds exactly one sector, remembers whether it
//! was modified, and is written back before it is reused, evicted or
//! dropped.
//!
//! Stores that hit the first FAT are reflected into every other FAT copy.
//! The copies are advisory backups: a failed mirror write is reported in
//! the log and otherwise ignored, the primary write alone decides the
//! outcome.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use lru::LruCache;
use spin::RwLock;

use crate::device::BlockDevice;
use crate::{Error, Result};

/// Buffers kept per volume before eviction starts.
pub const SECTOR_CACHE_LIMIT: usize = 64;

/// Placement of the FAT copies, needed to mirror stores.
#[derive(Debug, Clone, Copy)]
pub struct FatMirror {
    pub fat_base: u64,
    pub fat_size: u32,
    pub fat_count: u8,
}

impl FatMirror {
    fn covers(&self, lba: u64) -> bool {
        lba >= self.fat_base && lba < self.fat_base + self.fat_size as u64
    }
}

/// The read-only / mutable closure-mapped view onto a cached sector.
pub trait Cache {
    /// The read-only mapper to the sector buffer
    ///
    /// - `offset`: offset in the sector
    /// - `f`: a closure to read
    fn read<T, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V;
    /// The mutable mapper to the sector buffer
    ///
    /// - `offset`: offset in the sector
    /// - `f`: a closure to write
    fn modify<T, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V;
    /// Write the buffer back if it was modified.
    fn sync(&mut self) -> Result<()>;
}

pub struct SectorBuf {
    data: Vec<u8>,
    // the absolute LBA this buffer mirrors
    lba: u64,
    device: Arc<dyn BlockDevice>,
    mirror: Option<FatMirror>,
    modified: bool,
}

impl SectorBuf {
    /// Load one sector from the device. On failure nothing is retained, so
    /// the next access simply retries the read.
    pub fn load(
        device: Arc<dyn BlockDevice>,
        lba: u64,
        sector_size: usize,
        mirror: Option<FatMirror>,
    ) -> Result<Self> {
        let mut data = vec![0u8; sector_size];
        device.read_blocks(&mut data, lba, 1)?;
        Ok(Self { data, lba, device, mirror, modified: false })
    }

    pub fn lba(&self) -> u64 {
        self.lba
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.modified = true;
        &mut self.data
    }

    fn addr_of_offset(&self, offset: usize) -> usize {
        &self.data[offset] as *const _ as usize
    }

    fn get_ref<T>(&self, offset: usize) -> &T
    where
        T: Sized,
    {
        let type_size = core::mem::size_of::<T>();
        assert!(offset + type_size <= self.data.len());
        let addr = self.addr_of_offset(offset);
        unsafe { &*(addr as *const T) }
    }

    fn get_mut<T>(&mut self, offset: usize) -> &mut T
    where
        T: Sized,
    {
        let type_size = core::mem::size_of::<T>();
        assert!(offset + type_size <= self.data.len());
        self.modified = true;
        let addr = self.addr_of_offset(offset);
        unsafe { &mut *(addr as *mut T) }
    }
}

impl Cache for SectorBuf {
    fn read<T, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        f(self.get_ref(offset))
    }

    fn modify<T, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        f(self.get_mut(offset))
    }

    // write the content back to disk, reflecting FAT stores into the copies
    fn sync(&mut self) -> Result<()> {
        if !self.modified {
            return Ok(());
        }
        self.device
            .write_blocks(&self.data, self.lba, 1)
            .map_err(|_| Error::DiskErr)?;
        self.modified = false;

        if let Some(mirror) = self.mirror {
            if mirror.covers(self.lba) {
                for copy in 1..mirror.fat_count {
                    let copy_lba = self.lba + copy as u64 * mirror.fat_size as u64;
                    if self.device.write_blocks(&self.data, copy_lba, 1).is_err() {
                        log::warn!(
                            "mirror FAT write failed at sector {}, backup copy {} is stale",
                            copy_lba,
                            copy
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

impl Drop for SectorBuf {
    fn drop(&mut self) {
        if self.sync().is_err() {
            log::warn!("sector {} lost on drop, device write failed", self.lba);
        }
    }
}

/// Per-volume cache of [`SectorBuf`]s in LRU order.
pub struct SectorCache {
    device: Arc<dyn BlockDevice>,
    sector_size: usize,
    mirror: Option<FatMirror>,
    lru: LruCache<u64, Arc<RwLock<SectorBuf>>>,
}

impl SectorCache {
    pub fn new(device: Arc<dyn BlockDevice>, sector_size: usize) -> Self {
        Self {
            device,
            sector_size,
            mirror: None,
            // eviction is driven manually so buffers in use are never lost
            lru: LruCache::unbounded(),
        }
    }

    /// Install the FAT placement once the BPB has been parsed. Buffers
    /// loaded before this point (boot sector, partition tables) never cover
    /// a FAT.
    pub fn set_fat_mirror(&mut self, mirror: FatMirror) {
        self.mirror = Some(mirror);
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    /// Get the buffer for `lba`, loading it on a miss.
    pub fn get(&mut self, lba: u64) -> Result<Arc<RwLock<SectorBuf>>> {
        if let Some(buf) = self.lru.get(&lba) {
            return Ok(Arc::clone(buf));
        }

        // Write back and drop the oldest unreferenced buffers first.
        while self.lru.len() >= SECTOR_CACHE_LIMIT {
            let evictable = self
                .lru
                .iter()
                .rev()
                .find(|(_, buf)| Arc::strong_count(buf) == 1)
                .map(|(&lba, _)| lba);
            match evictable {
                Some(old) => {
                    if let Some(buf) = self.lru.pop(&old) {
                        buf.write().sync()?;
                    }
                }
                None => break,
            }
        }

        let buf = Arc::new(RwLock::new(SectorBuf::load(
            Arc::clone(&self.device),
            lba,
            self.sector_size,
            self.mirror,
        )?));
        self.lru.put(lba, Arc::clone(&buf));
        Ok(buf)
    }

    /// Write every modified buffer back.
    pub fn sync_all(&mut self) -> Result<()> {
        for (_, buf) in self.lru.iter() {
            buf.write().sync()?;
        }
        Ok(())
    }

    /// Forget every buffer without writing back. Only valid after
    /// `sync_all`, or when the volume is being abandoned.
    pub fn clear(&mut self) {
        while let Some((_, buf)) = self.lru.pop_lru() {
            // Suppress the write-back in Drop.
            buf.write().modified = false;
        }
    }
}

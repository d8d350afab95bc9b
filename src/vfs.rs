//! The open-object layer.
//!
//! A [`VirFile`] is the in-memory face of one directory entry: the root
//! directory, a subdirectory or a file. It knows where its short entry (and
//! any long entries) live on disk, and moves bytes between caller buffers
//! and the data clusters of the object.
//!
//! The root directory has no directory entry of its own; it is represented
//! by a virtual short entry owned by the volume. On FAT32 the root is an
//! ordinary cluster chain; on FAT12/16 it is the fixed run of sectors
//! between the FATs and the data region, and growing it fails with
//! `Denied` rather than `FatFull`.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::bpb::RootBase;
use crate::cache::Cache;
use crate::entry::{LongDirEntry, ShortDirEntry};
use crate::fs::FileSystem;
use crate::time::DateTime;
use crate::{
    Error, Result, ATTR_ARCHIVE, ATTR_DIRECTORY, DIRENT_SIZE, MAX_FILE_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VirFileType {
    Dir = ATTR_DIRECTORY,
    File = ATTR_ARCHIVE,
}

/// Where a directory entry lives on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPos {
    /// The virtual entry of the root directory; nowhere on disk.
    Root,
    /// Inside the FAT12/16 fixed root region.
    Fixed { sector: u64, offset: usize },
    /// Inside a data cluster of the parent directory.
    Chained { cluster: u32, offset: usize },
}

/// An open file or directory.
#[derive(Clone)]
pub struct VirFile {
    pub(crate) name: String,
    pub(crate) fs: Arc<FileSystem>,
    /// Short entry position.
    pub(crate) sde_pos: EntryPos,
    /// Long entry positions, first fragment on disk first.
    pub(crate) lde_pos: Vec<EntryPos>,
    pub(crate) attr: u8,
    /// Start cluster of the containing directory (0 for the root itself),
    /// identifying this object in the sharing table.
    pub(crate) parent_cluster: u32,
    /// Byte offset of the short entry inside the containing directory.
    pub(crate) dir_offset: usize,
    /// Mount generation this handle was created under.
    pub(crate) mount_id: usize,
}

/// The root directory object of a mounted volume.
pub fn root(fs: Arc<FileSystem>) -> VirFile {
    let mount_id = fs.mount_id;
    VirFile {
        name: String::from("/"),
        fs,
        sde_pos: EntryPos::Root,
        lde_pos: Vec::new(),
        attr: ATTR_DIRECTORY,
        parent_cluster: 0,
        dir_offset: 0,
        mount_id,
    }
}

impl VirFile {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        fs: Arc<FileSystem>,
        sde_pos: EntryPos,
        lde_pos: Vec<EntryPos>,
        attr: u8,
        parent_cluster: u32,
        dir_offset: usize,
    ) -> Self {
        let mount_id = fs.mount_id;
        Self { name, fs, sde_pos, lde_pos, attr, parent_cluster, dir_offset, mount_id }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The volume this object lives on.
    pub fn fs_handle(&self) -> &Arc<FileSystem> {
        &self.fs
    }

    pub fn attr(&self) -> u8 {
        self.attr
    }

    pub fn is_dir(&self) -> bool {
        self.attr & ATTR_DIRECTORY != 0
    }

    pub fn is_file(&self) -> bool {
        !self.is_dir()
    }

    pub fn is_root(&self) -> bool {
        self.sde_pos == EntryPos::Root
    }

    pub fn file_type(&self) -> VirFileType {
        if self.is_dir() {
            VirFileType::Dir
        } else {
            VirFileType::File
        }
    }

    /// Fail with `InvalidObject` when the volume was remounted or unmounted
    /// after this handle was created.
    pub fn check_valid(&self) -> Result<()> {
        if self.fs.is_alive() && self.fs.mount_id == self.mount_id {
            Ok(())
        } else {
            Err(Error::InvalidObject)
        }
    }

    /// Whether this object is the FAT12/16 fixed root region.
    fn is_fixed_root(&self) -> bool {
        self.is_root() && self.fs.layout.is_fixed_root()
    }

    // Short / long entry access ------------------------------------------

    fn entry_sector(&self, pos: EntryPos) -> Result<(u64, usize)> {
        let layout = &self.fs.layout;
        match pos {
            EntryPos::Root => Err(Error::IntErr),
            EntryPos::Fixed { sector, offset } => Ok((sector, offset)),
            EntryPos::Chained { cluster, offset } => {
                let ss = layout.bytes_per_sector;
                let lba = layout.first_sector_of_cluster(cluster) + (offset / ss) as u64;
                Ok((lba, offset % ss))
            }
        }
    }

    pub(crate) fn read_sde<V>(&self, f: impl FnOnce(&ShortDirEntry) -> V) -> Result<V> {
        if self.is_root() {
            let guard = self.fs.root_entry.read();
            return Ok(f(&guard));
        }
        let (lba, offset) = self.entry_sector(self.sde_pos)?;
        let buf = self.fs.cache.lock().get(lba)?;
        let guard = buf.read();
        Ok(guard.read(offset, f))
    }

    pub(crate) fn modify_sde<V>(&self, f: impl FnOnce(&mut ShortDirEntry) -> V) -> Result<V> {
        if self.is_root() {
            let mut guard = self.fs.root_entry.write();
            return Ok(f(&mut guard));
        }
        let (lba, offset) = self.entry_sector(self.sde_pos)?;
        let buf = self.fs.cache.lock().get(lba)?;
        let mut guard = buf.write();
        Ok(guard.modify(offset, f))
    }

    pub(crate) fn modify_lde<V>(
        &self,
        index: usize,
        f: impl FnOnce(&mut LongDirEntry) -> V,
    ) -> Result<V> {
        let pos = *self.lde_pos.get(index).ok_or(Error::IntErr)?;
        let (lba, offset) = self.entry_sector(pos)?;
        let buf = self.fs.cache.lock().get(lba)?;
        let mut guard = buf.write();
        Ok(guard.modify(offset, f))
    }

    // Geometry ------------------------------------------------------------

    pub fn first_cluster(&self) -> Result<u32> {
        if self.is_root() {
            return Ok(self.fs.layout.root_cluster());
        }
        self.read_sde(|sde| sde.first_cluster())
    }

    pub(crate) fn set_first_cluster(&self, cluster: u32) -> Result<()> {
        self.modify_sde(|sde| sde.set_first_cluster(cluster))
    }

    /// Size of the object in bytes. Directories are sized by their cluster
    /// chain (their directory entry always records 0), the fixed root by
    /// its entry capacity.
    pub fn file_size(&self) -> Result<usize> {
        if self.is_fixed_root() {
            if let RootBase::Fixed { entries, .. } = self.fs.layout.root {
                return Ok(entries * DIRENT_SIZE);
            }
        }
        if self.is_dir() {
            let start = self.first_cluster()?;
            if start == 0 {
                return Ok(0);
            }
            let len = self.fs.fat.read().chain_len(start)?;
            return Ok(len as usize * self.fs.layout.cluster_size());
        }
        self.read_sde(|sde| sde.file_size() as usize)
    }

    pub(crate) fn set_file_size(&self, size: usize) -> Result<()> {
        self.modify_sde(|sde| sde.set_file_size(size as u32))
    }

    /// Clusters allocated to this object.
    pub fn cluster_count(&self) -> Result<u32> {
        let start = self.first_cluster()?;
        if start == 0 {
            return Ok(0);
        }
        self.fs.fat.read().chain_len(start)
    }

    // Data transfer -------------------------------------------------------

    /// Absolute sector holding byte `pos` of this object, walking the
    /// chain from `cluster` (the cluster containing `pos`).
    fn data_sector(&self, cluster: u32, pos: usize) -> u64 {
        let layout = &self.fs.layout;
        let in_cluster = pos % layout.cluster_size();
        layout.first_sector_of_cluster(cluster) + (in_cluster / layout.bytes_per_sector) as u64
    }

    /// Read up to `buf.len()` bytes starting at byte `offset`. Returns the
    /// number of bytes read; 0 at or past end of data.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let file_size = self.file_size()?;
        let end = (offset + buf.len()).min(file_size);
        if offset >= end {
            return Ok(0);
        }

        let layout = self.fs.layout;
        let ss = layout.bytes_per_sector;
        let cluster_size = layout.cluster_size();

        // Fixed root: a flat run of sectors, no chain to walk.
        if self.is_fixed_root() {
            let first_sector = match layout.root {
                RootBase::Fixed { first_sector, .. } => first_sector,
                RootBase::Cluster(_) => return Err(Error::IntErr),
            };
            let mut pos = offset;
            let mut done = 0usize;
            while pos < end {
                let lba = first_sector + (pos / ss) as u64;
                let in_sector = pos % ss;
                let len = (ss - in_sector).min(end - pos);
                let sector = self.fs.cache.lock().get(lba)?;
                let guard = sector.read();
                buf[done..done + len]
                    .copy_from_slice(&guard.bytes()[in_sector..in_sector + len]);
                pos += len;
                done += len;
            }
            return Ok(done);
        }

        let start = self.first_cluster()?;
        if start == 0 {
            return Ok(0);
        }
        let mut cluster = self
            .fs
            .fat
            .read()
            .get_cluster_at(start, (offset / cluster_size) as u32)?;

        let mut pos = offset;
        let mut done = 0usize;
        while pos < end {
            let lba = self.data_sector(cluster, pos);
            let in_sector = pos % ss;
            let len = (ss - in_sector).min(end - pos);
            {
                let sector = self.fs.cache.lock().get(lba)?;
                let guard = sector.read();
                buf[done..done + len]
                    .copy_from_slice(&guard.bytes()[in_sector..in_sector + len]);
            }
            pos += len;
            done += len;
            if pos < end && pos % cluster_size == 0 {
                cluster = self.fs.fat.read().next(cluster)?.ok_or(Error::IntErr)?;
            }
        }
        Ok(done)
    }

    /// Write `buf` at byte `offset`, extending the object as needed.
    /// Returns the number of bytes written.
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut end = offset
            .checked_add(buf.len())
            .filter(|&e| e <= MAX_FILE_SIZE as usize)
            .ok_or(Error::Denied)?;

        // A full volume turns the request into a partial write: clamp to
        // the clusters that can still be had and report the short count.
        if let Err(Error::FatFull) = self.increase_size(end) {
            let cluster_size = self.fs.layout.cluster_size();
            let start = self.first_cluster()?;
            let have = if start == 0 {
                0
            } else {
                self.fs.fat.read().chain_len(start)? as usize
            };
            let free = self.fs.fat.write().free_count()? as usize;
            let max_bytes = (have + free) * cluster_size;
            if max_bytes <= offset {
                return Err(Error::FatFull);
            }
            end = end.min(max_bytes);
            self.increase_size(end)?;
        }

        let layout = self.fs.layout;
        let ss = layout.bytes_per_sector;
        let cluster_size = layout.cluster_size();

        if self.is_fixed_root() {
            let first_sector = match layout.root {
                RootBase::Fixed { first_sector, .. } => first_sector,
                RootBase::Cluster(_) => return Err(Error::IntErr),
            };
            let mut pos = offset;
            let mut done = 0usize;
            while pos < end {
                let lba = first_sector + (pos / ss) as u64;
                let in_sector = pos % ss;
                let len = (ss - in_sector).min(end - pos);
                let sector = self.fs.cache.lock().get(lba)?;
                let mut guard = sector.write();
                guard.bytes_mut()[in_sector..in_sector + len]
                    .copy_from_slice(&buf[done..done + len]);
                pos += len;
                done += len;
            }
            return Ok(done);
        }

        let start = self.first_cluster()?;
        if start == 0 {
            return Err(Error::IntErr);
        }
        let mut cluster = self
            .fs
            .fat
            .read()
            .get_cluster_at(start, (offset / cluster_size) as u32)?;

        let mut pos = offset;
        let mut done = 0usize;
        while pos < end {
            let lba = self.data_sector(cluster, pos);
            let in_sector = pos % ss;
            let len = (ss - in_sector).min(end - pos);
            {
                let sector = self.fs.cache.lock().get(lba)?;
                let mut guard = sector.write();
                guard.bytes_mut()[in_sector..in_sector + len]
                    .copy_from_slice(&buf[done..done + len]);
            }
            pos += len;
            done += len;
            if pos < end && pos % cluster_size == 0 {
                cluster = self.fs.fat.read().next(cluster)?.ok_or(Error::IntErr)?;
            }
        }
        Ok(done)
    }

    // Size management -----------------------------------------------------

    /// Grow the object so `new_size` bytes are addressable. Newly
    /// allocated clusters are zero filled. Files record the new size in
    /// their entry; directories are sized by their chain alone.
    pub(crate) fn increase_size(&self, new_size: usize) -> Result<()> {
        if self.is_fixed_root() {
            // The fixed root cannot grow.
            return if new_size <= self.file_size()? {
                Ok(())
            } else {
                Err(Error::Denied)
            };
        }

        let cluster_size = self.fs.layout.cluster_size();
        let first_cluster = self.first_cluster()?;
        let have = if first_cluster == 0 {
            0
        } else {
            self.fs.fat.read().chain_len(first_cluster)? as usize
        };
        let need = (new_size + cluster_size - 1) / cluster_size;

        if need > have {
            let link_after = if first_cluster == 0 {
                None
            } else {
                Some(self.fs.fat.read().chain_tail(first_cluster)?)
            };
            let grown = self.fs.alloc_cluster(need - have, link_after)?;
            if first_cluster == 0 {
                self.set_first_cluster(grown)?;
            }
        }

        if self.is_file() && new_size > self.file_size()? {
            self.set_file_size(new_size)?;
        }
        Ok(())
    }

    /// Shrink the object to `new_size` bytes, freeing the cluster tail and
    /// terminating the chain at the last surviving cluster.
    pub(crate) fn truncate_to(&self, new_size: usize) -> Result<()> {
        if self.is_fixed_root() {
            return Err(Error::Denied);
        }
        let old_size = self.file_size()?;
        if new_size >= old_size {
            return Ok(());
        }

        let cluster_size = self.fs.layout.cluster_size();
        let first_cluster = self.first_cluster()?;
        let keep = (new_size + cluster_size - 1) / cluster_size;

        if first_cluster != 0 {
            let have = self.fs.fat.read().chain_len(first_cluster)? as usize;
            if keep == 0 {
                self.fs.dealloc_chain(first_cluster, 0)?;
                self.set_first_cluster(0)?;
            } else if keep < have {
                let (last_kept, first_freed) = {
                    let fat = self.fs.fat.read();
                    let last_kept = fat.get_cluster_at(first_cluster, keep as u32 - 1)?;
                    let first_freed = fat.next(last_kept)?.ok_or(Error::IntErr)?;
                    (last_kept, first_freed)
                };
                self.fs.dealloc_chain(first_freed, last_kept)?;
            }
        }

        if self.is_file() {
            self.set_file_size(new_size)?;
        }
        Ok(())
    }

    /// Delete this object: mark its entries free and release its chain.
    /// Returns the number of clusters freed.
    pub(crate) fn clear(&self) -> Result<u32> {
        if self.is_root() {
            return Err(Error::Denied);
        }
        for index in 0..self.lde_pos.len() {
            self.modify_lde(index, |lde| lde.delete())?;
        }
        let first_cluster = self.read_sde(|sde| sde.first_cluster())?;
        self.modify_sde(|sde| sde.delete())?;
        if first_cluster == 0 {
            return Ok(0);
        }
        self.fs.dealloc_chain(first_cluster, 0)
    }

    // Metadata ------------------------------------------------------------

    /// Refresh the modify stamp from the volume clock and set the archive
    /// bit, as every completed write does.
    pub(crate) fn touch_modified(&self) -> Result<()> {
        if self.is_root() {
            return Ok(());
        }
        let now = self.fs.clock.now();
        self.modify_sde(|sde| {
            sde.set_modify_datetime(now);
            if sde.attr() & ATTR_DIRECTORY == 0 {
                sde.set_attr(sde.attr() | ATTR_ARCHIVE);
            }
        })
    }

    pub fn modify_datetime(&self) -> Result<DateTime> {
        self.read_sde(|sde| sde.modify_datetime())
    }

    pub fn create_datetime(&self) -> Result<DateTime> {
        self.read_sde(|sde| sde.create_datetime())
    }

    /// (size, sector size, sectors allocated, is_dir, modify stamp)
    pub fn stat(&self) -> Result<(usize, usize, usize, bool, DateTime)> {
        let size = self.file_size()?;
        let blocks = self.cluster_count()? as usize * self.fs.layout.sectors_per_cluster;
        let modified = if self.is_root() {
            crate::time::FROZEN_TIMESTAMP
        } else {
            self.modify_datetime()?
        };
        Ok((size, self.fs.layout.bytes_per_sector, blocks, self.is_dir(), modified))
    }
}

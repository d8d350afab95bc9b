//! The mounted volume.
//!
//! Mounting walks `Unmounted -> Checking -> Mounted`: bring the device up,
//! classify sector 0 (a FAT VBR means super floppy, a generic boot sector
//! means MBR, a protective MBR means GPT), locate the volume base, parse
//! the BPB into a [`FatLayout`], and on FAT32 seed the free-cluster
//! counters from FSInfo when its signatures check out.
//!
//! A `FileSystem` owns the sector cache and the FAT manager of its volume
//! and hands out the root directory object. Every public entry point of
//! the engine serializes on [`FileSystem::lock`], the per-volume sync
//! object.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use spin::{Mutex, MutexGuard, RwLock};

use crate::bpb::{check_vbr, FatLayout, FsInfo, VbrKind};
use crate::cache::{Cache, FatMirror, SectorCache};
use crate::codepage::{Cp437, OemCodepage};
use crate::device::{BlockDevice, DeviceError, IoctlCmd, IoctlResp};
use crate::entry::ShortDirEntry;
use crate::fat::{FatKind, FatManager};
use crate::flock;
use crate::time::{Clock, FrozenClock};
use crate::vfs::{self, VirFile};
use crate::{
    partition, store_le_u32, Error, Result, ATTR_DIRECTORY, DIRENT_SIZE, LEAD_SIGNATURE,
    SHORT_NAME_LEN_CAP, SPACE, STRUCT_SIGNATURE, TRAIL_SIGNATURE,
};

/// Monotonic mount generation, shared by all volumes so a stale handle can
/// never collide with a new mount.
static MOUNT_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Which partition of the drive to mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionSelect {
    /// Accept a super-floppy volume, else the first mountable partition of
    /// whatever table is present.
    Auto,
    /// The drive has no partition table; the volume starts at LBA 0.
    Sfd,
    /// A 1-based slot: 1..=4 in an MBR, 1..=128 in a GPT.
    Index(u8),
}

#[derive(Clone)]
pub struct MountOptions {
    pub partition: PartitionSelect,
    pub read_only: bool,
    /// Emit `CtrlTrim` for removed cluster chains.
    pub trim: bool,
    pub clock: Option<Arc<dyn Clock>>,
    pub codepage: Option<Arc<dyn OemCodepage>>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            partition: PartitionSelect::Auto,
            read_only: false,
            trim: false,
            clock: None,
            codepage: None,
        }
    }
}

pub struct FileSystem {
    pub(crate) device: Arc<dyn BlockDevice>,
    pub(crate) layout: FatLayout,
    pub(crate) cache: Arc<Mutex<SectorCache>>,
    pub(crate) fat: Arc<RwLock<FatManager>>,
    /// Virtual entry standing in for the root directory, which has none on
    /// disk.
    pub(crate) root_entry: Arc<RwLock<ShortDirEntry>>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) codepage: Arc<dyn OemCodepage>,
    pub(crate) read_only: bool,
    pub(crate) mount_id: usize,
    alive: AtomicBool,
    /// The per-volume sync object. Public operations hold it for their
    /// whole critical section.
    vol_lock: Mutex<()>,
}

impl FileSystem {
    /// Mount a volume of `device` according to `options`.
    pub fn mount(device: Arc<dyn BlockDevice>, options: MountOptions) -> Result<Arc<Self>> {
        device.init()?;
        device.status()?;

        let sector_size = match device.ioctl(IoctlCmd::GetSectorSize) {
            Ok(IoctlResp::SectorSize(size)) => size as usize,
            Ok(_) | Err(DeviceError::Unsupported) => 512,
            Err(err) => return Err(err.into()),
        };
        if !(512..=4096).contains(&sector_size) || !sector_size.is_power_of_two() {
            return Err(Error::InvalidParameter);
        }

        let mut sector0 = vec![0u8; sector_size];
        device.read_blocks(&mut sector0, 0, 1)?;

        let vol_base = Self::find_volume(&device, &sector0, sector_size, options.partition)?;

        let vbr = if vol_base == 0 {
            sector0
        } else {
            let mut buf = vec![0u8; sector_size];
            device.read_blocks(&mut buf, vol_base, 1)?;
            buf
        };
        let layout = FatLayout::derive(&vbr, vol_base)?;
        if layout.bytes_per_sector != sector_size {
            return Err(Error::NoFilesystem);
        }
        log::debug!(
            "mounting {:?} volume at LBA {}: {} clusters of {} bytes, {} FATs",
            layout.kind,
            layout.vol_base,
            layout.cluster_count(),
            layout.cluster_size(),
            layout.fat_count,
        );

        let cache = Arc::new(Mutex::new(SectorCache::new(Arc::clone(&device), sector_size)));
        cache.lock().set_fat_mirror(FatMirror {
            fat_base: layout.fat_base,
            fat_size: layout.fat_size,
            fat_count: layout.fat_count,
        });

        let mut fat =
            FatManager::new(layout, Arc::clone(&cache), Arc::clone(&device), options.trim);

        if layout.kind == FatKind::Fat32 {
            if let Some(fsinfo_lba) = layout.fsinfo_sector {
                let (free, last) = Self::read_fsinfo(&cache, fsinfo_lba, &layout)?;
                fat.seed(free, last);
            }
        }

        let root_entry = {
            let mut entry = ShortDirEntry::new(
                &[SPACE; SHORT_NAME_LEN_CAP],
                ATTR_DIRECTORY,
                layout.root_cluster(),
            );
            entry.set_modify_datetime(crate::time::FROZEN_TIMESTAMP);
            Arc::new(RwLock::new(entry))
        };

        let mount_id = MOUNT_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;

        Ok(Arc::new(Self {
            device,
            layout,
            cache,
            fat: Arc::new(RwLock::new(fat)),
            root_entry,
            clock: options.clock.unwrap_or_else(|| Arc::new(FrozenClock::default())),
            codepage: options.codepage.unwrap_or_else(|| Arc::new(Cp437)),
            read_only: options.read_only,
            mount_id,
            alive: AtomicBool::new(true),
            vol_lock: Mutex::new(()),
        }))
    }

    /// Resolve the partition selector to the volume base LBA.
    fn find_volume(
        device: &Arc<dyn BlockDevice>,
        sector0: &[u8],
        sector_size: usize,
        select: PartitionSelect,
    ) -> Result<u64> {
        let vbr0 = check_vbr(sector0);

        match select {
            PartitionSelect::Sfd => {
                return if vbr0 == VbrKind::Fat { Ok(0) } else { Err(Error::NoFilesystem) };
            }
            PartitionSelect::Auto if vbr0 == VbrKind::Fat => return Ok(0),
            _ => {}
        }

        let entries = partition::parse_mbr(sector0).ok_or(Error::NoFilesystem)?;

        if partition::is_protective_mbr(&entries) {
            return Self::find_gpt_volume(device, sector_size, select);
        }

        let candidates: Vec<u64> = match select {
            PartitionSelect::Index(slot) => {
                if !(1..=4).contains(&slot) {
                    return Err(Error::InvalidParameter);
                }
                let entry = &entries[slot as usize - 1];
                if !entry.is_used() {
                    return Err(Error::NoFilesystem);
                }
                vec![entry.lba_start as u64]
            }
            _ => entries.iter().filter(|e| e.is_used()).map(|e| e.lba_start as u64).collect(),
        };

        let mut buf = vec![0u8; sector_size];
        for base in candidates {
            if device.read_blocks(&mut buf, base, 1).is_err() {
                continue;
            }
            if check_vbr(&buf) == VbrKind::Fat {
                log::debug!("MBR partition found at LBA {}", base);
                return Ok(base);
            }
        }
        Err(Error::NoFilesystem)
    }

    /// Locate a FAT volume inside a GPT: verify the header, then scan the
    /// Basic Data partitions.
    fn find_gpt_volume(
        device: &Arc<dyn BlockDevice>,
        sector_size: usize,
        select: PartitionSelect,
    ) -> Result<u64> {
        let mut buf = vec![0u8; sector_size];
        device.read_blocks(&mut buf, 1, 1)?;
        let header = partition::GptHeader::parse(&buf)?;

        let table_bytes = header.entries_count as usize * header.entry_size as usize;
        let table_sectors = crate::get_needed_sector(table_bytes, sector_size);
        let mut table = vec![0u8; table_sectors * sector_size];
        device.read_blocks(&mut table, header.entries_lba, table_sectors)?;

        if partition::crc32(&table[..table_bytes]) != header.entries_crc32 {
            // The header already passed its own CRC; a stale array checksum
            // is reported but the table is still scanned.
            log::warn!("GPT partition entry array CRC mismatch");
        }

        let forced_slot = match select {
            PartitionSelect::Index(slot) => {
                if !(1..=128).contains(&slot) || slot as u32 > header.entries_count {
                    return Err(Error::InvalidParameter);
                }
                Some(slot as usize - 1)
            }
            _ => None,
        };

        let mut vbr = vec![0u8; sector_size];
        for index in 0..header.entries_count as usize {
            if let Some(slot) = forced_slot {
                if index != slot {
                    continue;
                }
            }
            let raw = &table[index * 128..(index + 1) * 128];
            let entry = partition::GptPartition::parse(raw);
            if !entry.is_used() || !entry.is_basic_data() {
                continue;
            }
            if device.read_blocks(&mut vbr, entry.first_lba, 1).is_err() {
                continue;
            }
            if check_vbr(&vbr) == VbrKind::Fat {
                log::debug!("GPT partition {} found at LBA {}", index + 1, entry.first_lba);
                return Ok(entry.first_lba);
            }
        }
        Err(Error::NoFilesystem)
    }

    /// Read FSInfo and decide how far to trust it. An unknown marker or a
    /// count beyond the cluster count is discarded; a count exactly equal
    /// to the cluster count is suspicious but accepted, to be validated by
    /// the first allocation scan.
    fn read_fsinfo(
        cache: &Arc<Mutex<SectorCache>>,
        fsinfo_lba: u64,
        layout: &FatLayout,
    ) -> Result<(Option<u32>, Option<u32>)> {
        let buf = cache.lock().get(fsinfo_lba)?;
        let guard = buf.read();
        let (valid, free, next) = guard.read(0, |fsinfo: &FsInfo| {
            (fsinfo.check_signature(), fsinfo.free_cluster_cnt(), fsinfo.next_free_cluster())
        });
        if !valid {
            log::warn!("FSInfo signatures invalid, free count unknown");
            return Ok((None, None));
        }
        let clusters = layout.cluster_count();
        let free = match free {
            0xFFFF_FFFF => None,
            n if n > clusters => None,
            n => Some(n),
        };
        let next = match next {
            0xFFFF_FFFF => None,
            n => Some(n),
        };
        Ok((free, next))
    }

    // ---------------------------------------------------------------------

    /// The per-volume sync object. Held by every public operation for its
    /// whole critical section, on every exit path.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.vol_lock.lock()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn kind(&self) -> FatKind {
        self.layout.kind
    }

    /// The geometry derived from the BPB at mount.
    pub fn layout(&self) -> &FatLayout {
        &self.layout
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Volume serial number from the extended BPB.
    pub fn serial(&self) -> u32 {
        self.layout.serial
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.read_only {
            Err(Error::WriteProtected)
        } else {
            Ok(())
        }
    }

    /// The root directory object.
    pub fn root_dir(self: &Arc<Self>) -> VirFile {
        vfs::root(Arc::clone(self))
    }

    // Cluster bookkeeping -------------------------------------------------

    /// Zero one cluster through the cache.
    pub(crate) fn clear_cluster(&self, cluster: u32) -> Result<()> {
        let first = self.layout.first_sector_of_cluster(cluster);
        for i in 0..self.layout.sectors_per_cluster as u64 {
            let buf = self.cache.lock().get(first + i)?;
            buf.write().bytes_mut().fill(0);
        }
        Ok(())
    }

    /// Allocate `count` zeroed clusters as one chain and return the first.
    /// With `link_after` the new chain is appended to that cluster.
    /// A partial allocation is rolled back before the error escapes.
    pub(crate) fn alloc_cluster(&self, count: usize, link_after: Option<u32>) -> Result<u32> {
        self.check_writable()?;
        if count == 0 {
            return Err(Error::InvalidParameter);
        }

        let first = self.fat.write().chain_create()?;
        let mut tail = first;
        for _ in 1..count {
            match self.fat.write().chain_stretch(tail) {
                Ok(next) => tail = next,
                Err(err) => {
                    let _ = self.fat.write().chain_remove(first, 0);
                    return Err(err);
                }
            }
        }
        let mut cluster = Some(first);
        while let Some(c) = cluster {
            self.clear_cluster(c)?;
            cluster = self.fat.read().next(c)?;
        }
        if let Some(prev) = link_after {
            self.fat.read().set_entry(prev, first)?;
        }
        Ok(first)
    }

    /// Free the chain starting at `start`; `prev` (when nonzero) becomes
    /// the new end of the surviving head. Returns the clusters freed.
    pub(crate) fn dealloc_chain(&self, start: u32, prev: u32) -> Result<u32> {
        self.check_writable()?;
        self.fat.write().chain_remove(start, prev)
    }

    /// Free-cluster count and total data clusters. The first call after a
    /// mount without trustworthy FSInfo walks the whole FAT; later calls
    /// return the cached count.
    pub fn get_free(&self) -> Result<(u32, u32)> {
        let free = self.fat.write().free_count()?;
        Ok((free, self.layout.cluster_count()))
    }

    // Volume label --------------------------------------------------------

    /// Read the volume label from the root directory, translated through
    /// the volume code page. Empty when no label entry exists.
    pub fn label_get(self: &Arc<Self>) -> Result<String> {
        let root = self.root_dir();
        let mut raw = [0u8; DIRENT_SIZE];
        let mut offset = 0usize;
        loop {
            let read = root.read_at(offset, &mut raw)?;
            if read != DIRENT_SIZE {
                return Ok(String::new());
            }
            let entry = ShortDirEntry::new_from_bytes(&raw);
            if entry.is_empty() {
                return Ok(String::new());
            }
            if !entry.is_deleted() && entry.is_volume_label() {
                let bytes = entry.name_bytes();
                let mut label = String::new();
                for &byte in bytes.iter() {
                    match self.codepage.oem_to_unicode(byte) {
                        Some(ch) => label.push(ch),
                        None => label.push('_'),
                    }
                }
                return Ok(String::from(label.trim_end()));
            }
            offset += DIRENT_SIZE;
        }
    }

    /// Write the volume label, replacing an existing label entry in place
    /// or allocating a new root entry. An empty name removes the label.
    pub fn label_set(self: &Arc<Self>, label: &str) -> Result<()> {
        self.check_writable()?;

        let mut name11 = [SPACE; SHORT_NAME_LEN_CAP];
        if !label.is_empty() {
            let mut pos = 0usize;
            for ch in label.chars() {
                if crate::is_illegal_in_any_name(ch) || pos >= SHORT_NAME_LEN_CAP {
                    return Err(Error::InvalidName);
                }
                let byte =
                    self.codepage.unicode_to_oem(ch).ok_or(Error::InvalidName)?;
                name11[pos] = self.codepage.oem_upper(byte);
                pos += 1;
            }
        }

        let root = self.root_dir();
        let mut raw = [0u8; DIRENT_SIZE];
        let mut offset = 0usize;
        let mut slot = None;
        loop {
            let read = root.read_at(offset, &mut raw)?;
            if read != DIRENT_SIZE {
                break;
            }
            let entry = ShortDirEntry::new_from_bytes(&raw);
            if entry.is_empty() {
                if slot.is_none() {
                    slot = Some(offset);
                }
                break;
            }
            if entry.is_deleted() {
                if slot.is_none() {
                    slot = Some(offset);
                }
            } else if entry.is_volume_label() {
                // Modify (or remove) the existing entry in place.
                let mut updated = entry;
                if label.is_empty() {
                    updated.delete();
                } else {
                    updated = ShortDirEntry::volume_label(&name11);
                    updated.set_modify_datetime(self.clock.now());
                }
                root.write_at(offset, updated.as_bytes())?;
                return Ok(());
            }
            offset += DIRENT_SIZE;
        }

        if label.is_empty() {
            return Ok(());
        }
        let slot = slot.unwrap_or(offset);
        let mut entry = ShortDirEntry::volume_label(&name11);
        entry.set_create_datetime(self.clock.now());
        entry.set_modify_datetime(self.clock.now());
        root.write_at(slot, entry.as_bytes())?;
        Ok(())
    }

    // Sync / unmount ------------------------------------------------------

    /// Flush everything: dirty sectors, then FSInfo when it went stale,
    /// then the device's own cache. A failed FSInfo rewrite is logged and
    /// swallowed; the volume state stays valid, only the hint is stale.
    pub fn sync(&self) -> Result<()> {
        self.cache.lock().sync_all()?;

        if self.layout.kind == FatKind::Fat32 && self.fat.read().fsinfo_dirty() {
            if let Some(fsinfo_lba) = self.layout.fsinfo_sector {
                match self.write_fsinfo(fsinfo_lba) {
                    Ok(()) => self.fat.write().clear_fsinfo_dirty(),
                    Err(_) => log::warn!("FSInfo rewrite failed, on-disk hint is stale"),
                }
            }
        }

        match self.device.ioctl(IoctlCmd::CtrlSync) {
            Ok(_) | Err(DeviceError::Unsupported) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn write_fsinfo(&self, fsinfo_lba: u64) -> Result<()> {
        let fat = self.fat.read();
        let free = fat.known_free_clusters().unwrap_or(0xFFFF_FFFF);
        let last = match fat.last_alloc() {
            0 => 0xFFFF_FFFF,
            n => n,
        };
        drop(fat);

        let buf = self.cache.lock().get(fsinfo_lba)?;
        {
            let mut guard = buf.write();
            let bytes = guard.bytes_mut();
            bytes.fill(0);
            store_le_u32(&mut bytes[0..], LEAD_SIGNATURE);
            store_le_u32(&mut bytes[484..], STRUCT_SIGNATURE);
            store_le_u32(&mut bytes[488..], free);
            store_le_u32(&mut bytes[492..], last);
            store_le_u32(&mut bytes[508..], TRAIL_SIGNATURE);
        }
        let result = buf.write().sync();
        result
    }

    /// Flush and take the volume down. Outstanding handles turn stale and
    /// report `InvalidObject`; their sharing-table slots are released.
    pub fn unmount(&self) -> Result<()> {
        let _guard = self.lock();
        self.sync()?;
        flock::purge_volume(self.mount_id);
        self.alive.store(false, Ordering::Release);
        self.cache.lock().clear();
        Ok(())
    }
}

impl Drop for FileSystem {
    fn drop(&mut self) {
        if self.is_alive() {
            if self.sync().is_err() {
                log::warn!("volume dropped with unflushed state, sync failed");
            }
            flock::purge_volume(self.mount_id);
        }
    }
}

/// Quick structural sanity check used by tests and callers that want to
/// probe a device without a full mount.
pub fn probe(device: &Arc<dyn BlockDevice>) -> Result<FatKind> {
    let mut sector0 = [0u8; 512];
    device.read_blocks(&mut sector0[..], 0, 1)?;
    if check_vbr(&sector0) == VbrKind::Fat {
        return FatLayout::derive(&sector0, 0).map(|layout| layout.kind);
    }
    Err(Error::NoFilesystem)
}

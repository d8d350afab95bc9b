//! Shared test fixtures: an in-memory block device and minimal volume
//! builders for all three FAT variants, optionally wrapped in an MBR or a
//! GPT. The builders lay down only what mounting needs: a valid VBR, the
//! reserved FAT entries, an empty root and (for FAT32) an FSInfo sector.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use fat_rs::device::{BlockDevice, DeviceError, IoctlCmd, IoctlResp};
use fat_rs::partition::{crc32, Guid};

pub const SS: usize = 512;

/// Sparse RAM disk; sectors spring into existence zeroed when touched.
pub struct RamDisk {
    sectors: Mutex<HashMap<u64, [u8; SS]>>,
    total_sectors: u64,
}

impl RamDisk {
    pub fn new(total_sectors: u64) -> Self {
        Self { sectors: Mutex::new(HashMap::new()), total_sectors }
    }

    pub fn sector(&self, lba: u64) -> [u8; SS] {
        self.sectors.lock().unwrap().get(&lba).copied().unwrap_or([0u8; SS])
    }

    pub fn fill(&self, lba: u64, data: &[u8]) {
        let mut sectors = self.sectors.lock().unwrap();
        for (i, chunk) in data.chunks(SS).enumerate() {
            let mut sector = [0u8; SS];
            sector[..chunk.len()].copy_from_slice(chunk);
            sectors.insert(lba + i as u64, sector);
        }
    }

    pub fn patch(&self, lba: u64, offset: usize, bytes: &[u8]) {
        let mut sectors = self.sectors.lock().unwrap();
        let sector = sectors.entry(lba).or_insert([0u8; SS]);
        sector[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Raw FAT32 entry from the first FAT.
    pub fn fat32_entry(&self, fat_base: u64, cluster: u32) -> u32 {
        let byte = cluster as u64 * 4;
        let sector = self.sector(fat_base + byte / SS as u64);
        let off = (byte % SS as u64) as usize;
        u32::from_le_bytes(sector[off..off + 4].try_into().unwrap()) & 0x0FFF_FFFF
    }

    pub fn fat16_entry(&self, fat_base: u64, cluster: u32) -> u16 {
        let byte = cluster as u64 * 2;
        let sector = self.sector(fat_base + byte / SS as u64);
        let off = (byte % SS as u64) as usize;
        u16::from_le_bytes(sector[off..off + 2].try_into().unwrap())
    }

    pub fn fat12_entry(&self, fat_base: u64, cluster: u32) -> u16 {
        let byte = cluster as u64 + cluster as u64 / 2;
        let lo_sector = self.sector(fat_base + byte / SS as u64);
        let lo = lo_sector[(byte % SS as u64) as usize];
        let hi_pos = byte + 1;
        let hi_sector = self.sector(fat_base + hi_pos / SS as u64);
        let hi = hi_sector[(hi_pos % SS as u64) as usize];
        let word = u16::from_le_bytes([lo, hi]);
        if cluster & 1 == 1 {
            word >> 4
        } else {
            word & 0x0FFF
        }
    }
}

impl BlockDevice for RamDisk {
    fn init(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn status(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn read_blocks(&self, buf: &mut [u8], lba: u64, cnt: usize) -> Result<(), DeviceError> {
        if lba + cnt as u64 > self.total_sectors {
            return Err(DeviceError::ReadError);
        }
        let sectors = self.sectors.lock().unwrap();
        for i in 0..cnt {
            let sector = sectors.get(&(lba + i as u64)).copied().unwrap_or([0u8; SS]);
            buf[i * SS..(i + 1) * SS].copy_from_slice(&sector);
        }
        Ok(())
    }

    fn write_blocks(&self, buf: &[u8], lba: u64, cnt: usize) -> Result<(), DeviceError> {
        if lba + cnt as u64 > self.total_sectors {
            return Err(DeviceError::WriteError);
        }
        let mut sectors = self.sectors.lock().unwrap();
        for i in 0..cnt {
            let mut sector = [0u8; SS];
            sector.copy_from_slice(&buf[i * SS..(i + 1) * SS]);
            sectors.insert(lba + i as u64, sector);
        }
        Ok(())
    }

    fn ioctl(&self, cmd: IoctlCmd) -> Result<IoctlResp, DeviceError> {
        match cmd {
            IoctlCmd::CtrlSync => Ok(IoctlResp::Ok),
            IoctlCmd::GetSectorSize => Ok(IoctlResp::SectorSize(SS as u16)),
            IoctlCmd::GetSectorCount => Ok(IoctlResp::SectorCount(self.total_sectors)),
            IoctlCmd::GetBlockSize => Ok(IoctlResp::BlockSize(1)),
            IoctlCmd::CtrlTrim { .. } => Ok(IoctlResp::Ok),
        }
    }
}

// Volume builders ----------------------------------------------------------

pub struct Fat32Params {
    pub total_sectors: u32,
    pub reserved: u16,
    pub spc: u8,
    pub fat_size: u32,
    /// Free count planted in FSInfo; 0xFFFFFFFF = unknown.
    pub fsinfo_free: u32,
}

impl Default for Fat32Params {
    fn default() -> Self {
        // 68868 data clusters with spc=1: comfortably FAT32.
        Self { total_sectors: 70000, reserved: 32, spc: 1, fat_size: 550, fsinfo_free: 0xFFFF_FFFF }
    }
}

fn fat32_vbr(p: &Fat32Params) -> [u8; SS] {
    let mut buf = [0u8; SS];
    buf[0] = 0xEB;
    buf[1] = 0x58;
    buf[2] = 0x90;
    buf[3..11].copy_from_slice(b"MSDOS5.0");
    buf[11..13].copy_from_slice(&(SS as u16).to_le_bytes());
    buf[13] = p.spc;
    buf[14..16].copy_from_slice(&p.reserved.to_le_bytes());
    buf[16] = 2; // FATs
    buf[21] = 0xF8;
    buf[32..36].copy_from_slice(&p.total_sectors.to_le_bytes());
    buf[36..40].copy_from_slice(&p.fat_size.to_le_bytes());
    buf[44..48].copy_from_slice(&2u32.to_le_bytes()); // root cluster
    buf[48..50].copy_from_slice(&1u16.to_le_bytes()); // FSInfo sector
    buf[50..52].copy_from_slice(&6u16.to_le_bytes()); // backup boot
    buf[64] = 0x80;
    buf[66] = 0x29;
    buf[67..71].copy_from_slice(&0x1234_5678u32.to_le_bytes());
    buf[71..82].copy_from_slice(b"NO NAME    ");
    buf[82..90].copy_from_slice(b"FAT32   ");
    buf[510] = 0x55;
    buf[511] = 0xAA;
    buf
}

fn fsinfo_sector(free: u32, next: u32) -> [u8; SS] {
    let mut buf = [0u8; SS];
    buf[0..4].copy_from_slice(&0x41615252u32.to_le_bytes());
    buf[484..488].copy_from_slice(&0x61417272u32.to_le_bytes());
    buf[488..492].copy_from_slice(&free.to_le_bytes());
    buf[492..496].copy_from_slice(&next.to_le_bytes());
    buf[508..512].copy_from_slice(&0xAA550000u32.to_le_bytes());
    buf
}

/// Write a FAT32 volume at `base` of `disk`.
pub fn format_fat32_at(disk: &RamDisk, base: u64, p: &Fat32Params) {
    disk.fill(base, &fat32_vbr(p));
    disk.fill(base + 1, &fsinfo_sector(p.fsinfo_free, 0xFFFF_FFFF));
    disk.fill(base + 6, &fat32_vbr(p));

    // Both FATs: media entry, reserved entry, root-directory chain end.
    for fat in 0..2u64 {
        let fat_lba = base + p.reserved as u64 + fat * p.fat_size as u64;
        let mut first = [0u8; 12];
        first[0..4].copy_from_slice(&0x0FFF_FFF8u32.to_le_bytes());
        first[4..8].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
        first[8..12].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
        disk.patch(fat_lba, 0, &first);
    }
    // Root cluster (cluster 2 = first data sector) stays zeroed; the
    // sparse disk already reads it as such.
}

pub fn fat32_disk() -> Arc<RamDisk> {
    let p = Fat32Params::default();
    let disk = Arc::new(RamDisk::new(p.total_sectors as u64));
    format_fat32_at(&disk, 0, &p);
    disk
}

pub fn fat32_disk_with(p: Fat32Params) -> Arc<RamDisk> {
    let disk = Arc::new(RamDisk::new(p.total_sectors as u64));
    format_fat32_at(&disk, 0, &p);
    disk
}

/// FAT32 volume behind an MBR, partition 1 at LBA `part_base`.
pub fn fat32_mbr_disk(part_base: u32) -> Arc<RamDisk> {
    let p = Fat32Params::default();
    let disk = Arc::new(RamDisk::new(part_base as u64 + p.total_sectors as u64));

    let mut mbr = [0u8; SS];
    mbr[446] = 0x00; // boot flag
    mbr[446 + 4] = 0x0C; // FAT32 LBA
    mbr[446 + 8..446 + 12].copy_from_slice(&part_base.to_le_bytes());
    mbr[446 + 12..446 + 16].copy_from_slice(&p.total_sectors.to_le_bytes());
    mbr[510] = 0x55;
    mbr[511] = 0xAA;
    disk.fill(0, &mbr);

    format_fat32_at(&disk, part_base as u64, &p);
    disk
}

/// FAT32 volume behind a GPT, first partition at LBA `part_base`.
pub fn fat32_gpt_disk(part_base: u64) -> Arc<RamDisk> {
    let p = Fat32Params::default();
    let total = part_base + p.total_sectors as u64 + 64;
    let disk = Arc::new(RamDisk::new(total));

    // Protective MBR.
    let mut mbr = [0u8; SS];
    mbr[446 + 4] = 0xEE;
    mbr[446 + 8..446 + 12].copy_from_slice(&1u32.to_le_bytes());
    mbr[446 + 12..446 + 16].copy_from_slice(&(total as u32).to_le_bytes());
    mbr[510] = 0x55;
    mbr[511] = 0xAA;
    disk.fill(0, &mbr);

    // Partition entry array: one Basic Data entry, seven blank.
    let count = 8u32;
    let mut table = vec![0u8; count as usize * 128];
    table[0..16].copy_from_slice(&Guid::microsoft_basic_data().to_bytes());
    table[16..32].copy_from_slice(&Guid::new(1, 2, 3, 4, 5).to_bytes());
    table[32..40].copy_from_slice(&part_base.to_le_bytes());
    table[40..48].copy_from_slice(&(part_base + p.total_sectors as u64 - 1).to_le_bytes());
    let table_crc = crc32(&table);

    let mut header = [0u8; SS];
    header[0..8].copy_from_slice(b"EFI PART");
    header[8..12].copy_from_slice(&0x0001_0000u32.to_le_bytes());
    header[12..16].copy_from_slice(&92u32.to_le_bytes());
    header[24..32].copy_from_slice(&1u64.to_le_bytes());
    header[32..40].copy_from_slice(&(total - 1).to_le_bytes());
    header[40..48].copy_from_slice(&34u64.to_le_bytes());
    header[48..56].copy_from_slice(&(total - 34).to_le_bytes());
    header[72..80].copy_from_slice(&2u64.to_le_bytes());
    header[80..84].copy_from_slice(&count.to_le_bytes());
    header[84..88].copy_from_slice(&128u32.to_le_bytes());
    header[88..92].copy_from_slice(&table_crc.to_le_bytes());
    let header_crc = crc32(&header[..92]);
    header[16..20].copy_from_slice(&header_crc.to_le_bytes());

    disk.fill(1, &header);
    disk.fill(2, &table);
    format_fat32_at(&disk, part_base, &p);
    disk
}

pub struct Fat16Params {
    pub total_sectors: u16,
    pub fat_size: u16,
    pub root_entries: u16,
}

impl Default for Fat16Params {
    fn default() -> Self {
        // 9887 data clusters with spc=1: FAT16 territory.
        Self { total_sectors: 10000, fat_size: 40, root_entries: 512 }
    }
}

pub fn fat16_disk() -> Arc<RamDisk> {
    let p = Fat16Params::default();
    let disk = Arc::new(RamDisk::new(p.total_sectors as u64));

    let mut buf = [0u8; SS];
    buf[0] = 0xEB;
    buf[1] = 0x3C;
    buf[2] = 0x90;
    buf[3..11].copy_from_slice(b"MSDOS5.0");
    buf[11..13].copy_from_slice(&(SS as u16).to_le_bytes());
    buf[13] = 1; // sectors per cluster
    buf[14..16].copy_from_slice(&1u16.to_le_bytes()); // reserved
    buf[16] = 2;
    buf[17..19].copy_from_slice(&p.root_entries.to_le_bytes());
    buf[19..21].copy_from_slice(&p.total_sectors.to_le_bytes());
    buf[21] = 0xF8;
    buf[22..24].copy_from_slice(&p.fat_size.to_le_bytes());
    buf[36] = 0x80;
    buf[38] = 0x29;
    buf[39..43].copy_from_slice(&0xF16F_16F1u32.to_le_bytes());
    buf[43..54].copy_from_slice(b"NO NAME    ");
    buf[54..62].copy_from_slice(b"FAT16   ");
    buf[510] = 0x55;
    buf[511] = 0xAA;
    disk.fill(0, &buf);

    for fat in 0..2u64 {
        let fat_lba = 1 + fat * p.fat_size as u64;
        disk.patch(fat_lba, 0, &[0xF8, 0xFF, 0xFF, 0xFF]);
    }
    disk
}

pub fn fat12_disk() -> Arc<RamDisk> {
    // A classic 1.44M floppy layout.
    let disk = Arc::new(RamDisk::new(2880));

    let mut buf = [0u8; SS];
    buf[0] = 0xEB;
    buf[1] = 0x3C;
    buf[2] = 0x90;
    buf[3..11].copy_from_slice(b"MSDOS5.0");
    buf[11..13].copy_from_slice(&(SS as u16).to_le_bytes());
    buf[13] = 1;
    buf[14..16].copy_from_slice(&1u16.to_le_bytes());
    buf[16] = 2;
    buf[17..19].copy_from_slice(&224u16.to_le_bytes());
    buf[19..21].copy_from_slice(&2880u16.to_le_bytes());
    buf[21] = 0xF0;
    buf[22..24].copy_from_slice(&9u16.to_le_bytes());
    buf[38] = 0x29;
    buf[39..43].copy_from_slice(&0xF12F_12F1u32.to_le_bytes());
    buf[43..54].copy_from_slice(b"NO NAME    ");
    buf[54..62].copy_from_slice(b"FAT12   ");
    buf[510] = 0x55;
    buf[511] = 0xAA;
    disk.fill(0, &buf);

    for fat in 0..2u64 {
        disk.patch(1 + fat * 9, 0, &[0xF0, 0xFF, 0xFF]);
    }
    disk
}

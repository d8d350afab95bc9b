//! BIOS Parameter Block (BPB) and Boot Sector
//!
//! The first important data structure on a FAT volume is the BPB, located in
//! the first sector of the volume in the reserved region. This sector is
//! sometimes called the "boot sector" or the "0th sector"; the important
//! fact is simply that it is the first sector of the volume.
//!
//! The BPB common part is identical for all three FAT variants. At offset 36
//! the variants diverge: FAT12/16 carry a small extended block (drive
//! number, serial, label), FAT32 first inserts its own fields (32-bit FAT
//! size, root cluster, FSInfo sector, backup boot sector) and then the same
//! extended block at offset 64.
//!
//! FAT type determination does not look at the "FAT12/16/32" type string.
//! The count of data clusters is exactly what decides it:
//! fewer than 4085 clusters is FAT12, fewer than 65525 is FAT16, everything
//! else is FAT32. The maximum valid cluster number is CountOfClusters + 1,
//! and the FAT has CountOfClusters + 2 entries.
//!
//! Given any valid data cluster number N, the first sector of that cluster:
//!     FirstSectorOfCluster = ((N - 2) * BPB_SecPerClus) + FirstDataSector

use crate::fat::FatKind;
use crate::{
    read_le_u16, read_le_u32, Error, Result, BOOT_SIGNATURE, DIRENT_SIZE, LEAD_SIGNATURE,
    MAX_CLUSTER_FAT12, MAX_CLUSTER_FAT16, STRUCT_SIGNATURE, TRAIL_SIGNATURE,
};

/// Boot Sector and BPB structure common to FAT12/16/32, offsets 0..36.
#[derive(Debug, Clone, Copy)]
#[repr(packed)]
pub struct BasicBpb {
    /// x86 jump to the boot code.
    ///
    /// Jump and NOP instructions    Size: 3 bytes    Value: 0xEB ?? 0x90    Offset: 0x00
    pub(crate) bs_jmp_boot: [u8; 3],
    /// OEM name, only a name string.    Size: 8 bytes    Offset: 0x03
    pub(crate) bs_oem_name: [u8; 8],
    /// Bytes per sector. May only be 512, 1024, 2048 or 4096.
    ///
    /// Size: 2 bytes    Offset: 0x0B
    pub(crate) byts_per_sec: u16,
    /// Sectors per allocation unit. A power of 2 greater than 0; legal
    /// values are 1, 2, 4, 8, 16, 32, 64 and 128.
    ///
    /// Size: 1 byte    Offset: 0x0D
    pub(crate) sec_per_clus: u8,
    /// Sectors in the reserved region, starting at the first sector of the
    /// volume. Typically 32 for FAT32, 1 for FAT12/16.
    ///
    /// Size: 2 bytes    Offset: 0x0E
    pub(crate) rsvd_sec_cnt: u16,
    /// Number of FATs. Should always be 2 for any FAT volume of any type.
    ///
    /// Size: 1 byte    Offset: 0x10
    pub(crate) num_fats: u8,
    /// Count of 32-byte entries in the FAT12/16 root directory. For FAT32
    /// volumes this field must be 0.
    ///
    /// Size: 2 bytes    Offset: 0x11
    pub(crate) root_ent_cnt: u16,
    /// Total sectors, 16-bit form. 0 when the 32-bit form is used.
    ///
    /// Size: 2 bytes    Offset: 0x13
    pub(crate) tot_sec16: u16,
    /// Media type. 0xF8 standard for fixed media, 0xF0 for removable. The
    /// same value must be in the low byte of FAT[0].
    ///
    /// Size: 1 byte    Offset: 0x15
    pub(crate) media: u8,
    /// Sectors per FAT, 16-bit form. 0 on FAT32 (fat_sz32 is used).
    ///
    /// Size: 2 bytes    Offset: 0x16
    pub(crate) fat_sz16: u16,
    /// Sectors per track for interrupt 0x13. Irrelevant to this engine.
    ///
    /// Size: 2 bytes    Offset: 0x18
    pub(crate) sec_per_trk: u16,
    /// Head count for interrupt 0x13. Irrelevant to this engine.
    ///
    /// Size: 2 bytes    Offset: 0x1A
    pub(crate) num_heads: u16,
    /// Sectors preceding the partition holding this volume.
    ///
    /// Size: 4 bytes    Offset: 0x1C
    pub(crate) hidd_sec: u32,
    /// Total sectors, 32-bit form. Must be non-zero when tot_sec16 is 0.
    ///
    /// Size: 4 bytes    Offset: 0x20
    pub(crate) tot_sec32: u32,
}

/// FAT32 extension, offsets 36..90.
#[derive(Debug, Clone, Copy)]
#[repr(packed)]
pub struct Ebpb32 {
    /// Sectors occupied by ONE FAT, 32-bit count.    Offset: 0x24
    pub(crate) fat_sz32: u32,
    /// Bits 0-3: active FAT when mirroring is disabled. Bit 7: 0 means the
    /// FAT is mirrored at runtime into all FATs.    Offset: 0x28
    pub(crate) ext_flags: u16,
    /// Filesystem version, must be 0.0 for this engine.    Offset: 0x2A
    pub(crate) fs_ver: u16,
    /// First cluster of the root directory, usually 2.    Offset: 0x2C
    pub(crate) root_clus: u32,
    /// Sector number of the FSInfo structure inside the reserved area,
    /// usually 1.    Offset: 0x30
    pub(crate) fs_info: u16,
    /// Sector of the boot-record copy in the reserved area, usually 6.
    ///
    /// Offset: 0x32
    pub(crate) bk_boot_sec: u16,
    /// Reserved, zero.    Offset: 0x34
    pub(crate) reserved: [u8; 12],
    /// Physical drive number for INT 13h.    Offset: 0x40
    pub(crate) bs_drv_num: u8,
    /// Reserved (used by Windows NT).    Offset: 0x41
    pub(crate) bs_reserved1: u8,
    /// Extended boot signature, 0x29 (or 0x28) when the following three
    /// fields are present.    Offset: 0x42
    pub(crate) bs_boot_sig: u8,
    /// Volume serial number.    Offset: 0x43
    pub(crate) bs_vol_id: u32,
    /// Volume label, matching the label entry in the root directory.
    ///
    /// Offset: 0x47
    pub(crate) bs_vol_lab: [u8; 11],
    /// "FAT32   ", informational only.    Offset: 0x52
    pub(crate) bs_fil_sys_type: [u8; 8],
}

/// FAT12/16 extension, offsets 36..62.
#[derive(Debug, Clone, Copy)]
#[repr(packed)]
pub struct Ebpb16 {
    pub(crate) bs_drv_num: u8,
    pub(crate) bs_reserved1: u8,
    pub(crate) bs_boot_sig: u8,
    pub(crate) bs_vol_id: u32,
    pub(crate) bs_vol_lab: [u8; 11],
    pub(crate) bs_fil_sys_type: [u8; 8],
}

impl BasicBpb {
    pub fn new_from_bytes(buf: &[u8]) -> Self {
        unsafe { core::ptr::read_unaligned(buf.as_ptr() as *const Self) }
    }
}

impl Ebpb32 {
    pub fn new_from_bytes(buf: &[u8]) -> Self {
        unsafe { core::ptr::read_unaligned(buf.as_ptr().add(36) as *const Self) }
    }
}

impl Ebpb16 {
    pub fn new_from_bytes(buf: &[u8]) -> Self {
        unsafe { core::ptr::read_unaligned(buf.as_ptr().add(36) as *const Self) }
    }
}

/// What sector 0 of a candidate volume turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VbrKind {
    /// A FAT volume boot record.
    Fat,
    /// A boot sector (valid signature) that is not a FAT VBR; possibly an
    /// MBR.
    BootSectorOnly,
    /// Not a boot sector at all.
    Unknown,
}

/// Classify a 512-byte (or larger) sector as a FAT VBR / generic boot
/// sector / garbage.
pub fn check_vbr(buf: &[u8]) -> VbrKind {
    if buf.len() < 512 || read_le_u16(&buf[510..]) != BOOT_SIGNATURE {
        return VbrKind::Unknown;
    }
    // A FAT VBR starts with a short or near jump.
    if buf[0] != 0xEB && buf[0] != 0xE9 {
        return VbrKind::BootSectorOnly;
    }
    let byts_per_sec = read_le_u16(&buf[11..]);
    let sec_per_clus = buf[13];
    if !byts_per_sec.is_power_of_two()
        || !(512..=4096).contains(&byts_per_sec)
        || sec_per_clus == 0
        || !sec_per_clus.is_power_of_two()
        || buf[16] == 0
    {
        return VbrKind::BootSectorOnly;
    }
    VbrKind::Fat
}

/// Where the root directory of a volume lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootBase {
    /// FAT12/16: a fixed run of sectors between the FATs and the data area.
    Fixed { first_sector: u64, entries: usize },
    /// FAT32: an ordinary cluster chain.
    Cluster(u32),
}

/// Everything the engine needs to know about a mounted volume's geometry,
/// derived once from the BPB.
#[derive(Debug, Clone, Copy)]
pub struct FatLayout {
    pub kind: FatKind,
    pub bytes_per_sector: usize,
    pub sectors_per_cluster: usize,
    pub fat_count: u8,
    /// Sectors occupied by one FAT.
    pub fat_size: u32,
    /// Absolute LBA of the volume (partition start; 0 for super floppy).
    pub vol_base: u64,
    /// Absolute LBA of the first FAT.
    pub fat_base: u64,
    pub root: RootBase,
    /// Absolute LBA of cluster 2.
    pub data_base: u64,
    /// Total FAT entries: data clusters + the two reserved entries.
    pub fat_entries: u32,
    pub total_sectors: u64,
    /// Absolute LBA of the FSInfo sector (FAT32 only).
    pub fsinfo_sector: Option<u64>,
    pub serial: u32,
}

impl FatLayout {
    /// Parse and validate the BPB found at `vol_base` and derive the
    /// volume geometry from it.
    pub fn derive(buf: &[u8], vol_base: u64) -> Result<Self> {
        if check_vbr(buf) != VbrKind::Fat {
            return Err(Error::NoFilesystem);
        }
        let bpb = BasicBpb::new_from_bytes(buf);

        let bytes_per_sector = bpb.byts_per_sec as usize;
        let sectors_per_cluster = bpb.sec_per_clus as usize;
        if sectors_per_cluster > 128 || bpb.num_fats == 0 || bpb.num_fats > 2 {
            return Err(Error::NoFilesystem);
        }
        if bpb.rsvd_sec_cnt == 0 {
            return Err(Error::NoFilesystem);
        }

        let fat_size = if bpb.fat_sz16 != 0 {
            bpb.fat_sz16 as u32
        } else {
            read_le_u32(&buf[36..]) // BPB_FATSz32
        };
        if fat_size == 0 {
            return Err(Error::NoFilesystem);
        }

        let total_sectors = if bpb.tot_sec16 != 0 {
            bpb.tot_sec16 as u64
        } else {
            bpb.tot_sec32 as u64
        };
        if total_sectors == 0 {
            return Err(Error::NoFilesystem);
        }

        let root_dir_sectors = ((bpb.root_ent_cnt as usize * DIRENT_SIZE)
            + (bytes_per_sector - 1))
            / bytes_per_sector;

        let fat_base = vol_base + bpb.rsvd_sec_cnt as u64;
        let root_first_sector = fat_base + bpb.num_fats as u64 * fat_size as u64;
        let data_base = root_first_sector + root_dir_sectors as u64;

        let data_sectors = total_sectors
            .checked_sub(
                bpb.rsvd_sec_cnt as u64
                    + bpb.num_fats as u64 * fat_size as u64
                    + root_dir_sectors as u64,
            )
            .ok_or(Error::NoFilesystem)?;
        let clusters = (data_sectors / sectors_per_cluster as u64) as u32;
        let fat_entries = clusters + 2;

        let kind = if clusters < MAX_CLUSTER_FAT12 {
            FatKind::Fat12
        } else if clusters < MAX_CLUSTER_FAT16 {
            FatKind::Fat16
        } else {
            FatKind::Fat32
        };

        // The FAT must be large enough to map every cluster.
        let fat_capacity = match kind {
            FatKind::Fat12 => (fat_size as u64 * bytes_per_sector as u64) * 2 / 3,
            FatKind::Fat16 => fat_size as u64 * bytes_per_sector as u64 / 2,
            FatKind::Fat32 => fat_size as u64 * bytes_per_sector as u64 / 4,
        };
        if fat_capacity < fat_entries as u64 {
            return Err(Error::NoFilesystem);
        }

        let (root, fsinfo_sector, serial) = match kind {
            FatKind::Fat32 => {
                let ext = Ebpb32::new_from_bytes(buf);
                if bpb.root_ent_cnt != 0 || bpb.fat_sz16 != 0 || ext.fs_ver != 0 {
                    return Err(Error::NoFilesystem);
                }
                let root_clus = ext.root_clus;
                if root_clus < 2 || root_clus >= fat_entries {
                    return Err(Error::NoFilesystem);
                }
                let fsinfo = if ext.fs_info != 0 && (ext.fs_info as u64) < bpb.rsvd_sec_cnt as u64
                {
                    Some(vol_base + ext.fs_info as u64)
                } else {
                    None
                };
                (RootBase::Cluster(root_clus), fsinfo, ext.bs_vol_id)
            }
            FatKind::Fat12 | FatKind::Fat16 => {
                if bpb.root_ent_cnt == 0 {
                    return Err(Error::NoFilesystem);
                }
                let ext = Ebpb16::new_from_bytes(buf);
                let serial = if ext.bs_boot_sig == 0x29 || ext.bs_boot_sig == 0x28 {
                    ext.bs_vol_id
                } else {
                    0
                };
                (
                    RootBase::Fixed {
                        first_sector: root_first_sector,
                        entries: bpb.root_ent_cnt as usize,
                    },
                    None,
                    serial,
                )
            }
        };

        Ok(Self {
            kind,
            bytes_per_sector,
            sectors_per_cluster,
            fat_count: bpb.num_fats,
            fat_size,
            vol_base,
            fat_base,
            root,
            data_base,
            fat_entries,
            total_sectors,
            fsinfo_sector,
            serial,
        })
    }

    #[inline(always)]
    pub fn cluster_size(&self) -> usize {
        self.bytes_per_sector * self.sectors_per_cluster
    }

    /// Given any valid data cluster number N, the first sector of that
    /// cluster relative to sector 0 of the device.
    #[inline(always)]
    pub fn first_sector_of_cluster(&self, cluster: u32) -> u64 {
        debug_assert!(cluster >= 2);
        self.data_base + (cluster as u64 - 2) * self.sectors_per_cluster as u64
    }

    /// Number of usable data clusters.
    pub fn cluster_count(&self) -> u32 {
        self.fat_entries - 2
    }

    pub fn root_cluster(&self) -> u32 {
        match self.root {
            RootBase::Cluster(c) => c,
            RootBase::Fixed { .. } => 0,
        }
    }

    pub fn is_fixed_root(&self) -> bool {
        matches!(self.root, RootBase::Fixed { .. })
    }
}

/// FAT32 FSInfo sector structure.
#[derive(Clone, Copy)]
#[repr(packed)]
pub struct FsInfo {
    /// Value 0x41615252, validating that this is an FSInfo sector.
    ///
    /// Size: 4 bytes    Offset: 0
    pub(crate) lead_sig: u32,
    /// Reserved, zero.    Size: 480 bytes    Offset: 4
    pub(crate) reserved1: [u8; 480],
    /// Value 0x61417272.    Size: 4 bytes    Offset: 484
    pub(crate) struc_sig: u32,
    /// Last known free cluster count. 0xFFFFFFFF means unknown and must be
    /// computed. Any other value is a hint, range checked against the
    /// volume cluster count.
    ///
    /// Size: 4 bytes    Offset: 488
    pub(crate) free_count: u32,
    /// Cluster number at which the driver should start looking for free
    /// clusters, typically the last allocated one. 0xFFFFFFFF means no
    /// hint.
    ///
    /// Size: 4 bytes    Offset: 492
    pub(crate) nxt_free: u32,
    /// Reserved, zero.    Size: 12 bytes    Offset: 496
    pub(crate) reserved2: [u8; 12],
    /// Value 0xAA550000.    Size: 4 bytes    Offset: 508
    pub(crate) trail_sig: u32,
}

impl FsInfo {
    pub fn check_signature(&self) -> bool {
        self.lead_sig == LEAD_SIGNATURE
            && self.struc_sig == STRUCT_SIGNATURE
            && self.trail_sig == TRAIL_SIGNATURE
    }

    pub fn free_cluster_cnt(&self) -> u32 {
        self.free_count
    }

    pub fn next_free_cluster(&self) -> u32 {
        self.nxt_free
    }
}

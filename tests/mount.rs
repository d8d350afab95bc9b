//! Volume discovery: super floppy, MBR, GPT, and geometry derivation.

mod common;

use std::sync::Arc;

use common::{fat12_disk, fat16_disk, fat32_disk, fat32_gpt_disk, fat32_mbr_disk, Fat32Params, RamDisk};
use fat_rs::bpb::RootBase;
use fat_rs::device::BlockDevice;
use fat_rs::{Error, FatKind, FileSystem, MountOptions, PartitionSelect};

fn dev(disk: &Arc<RamDisk>) -> Arc<dyn BlockDevice> {
    disk.clone()
}

#[test]
fn super_floppy_fat32() {
    let disk = fat32_disk();
    let fs = FileSystem::mount(dev(&disk), MountOptions::default()).unwrap();
    assert_eq!(fs.kind(), FatKind::Fat32);
    let layout = fs.layout();
    assert_eq!(layout.vol_base, 0);
    assert_eq!(layout.fat_base, 32);
    assert_eq!(layout.data_base, 32 + 2 * 550);
    assert_eq!(layout.root, RootBase::Cluster(2));
    assert_eq!(fs.serial(), 0x1234_5678);
}

#[test]
fn mbr_partition_geometry_is_derived_from_the_partition_base() {
    // MBR PTE #1 of type 0x0C at LBA 2048, BPB with SecPerClus=8,
    // RsvdSecCnt=32, NumFATs=2, FATSz32=1024, RootClus=2.
    let disk = {
        let p = Fat32Params {
            total_sectors: 600_000,
            reserved: 32,
            spc: 8,
            fat_size: 1024,
            fsinfo_free: 0xFFFF_FFFF,
        };
        let disk = Arc::new(RamDisk::new(2048 + p.total_sectors as u64));
        let mut mbr = [0u8; 512];
        mbr[446 + 4] = 0x0C;
        mbr[446 + 8..446 + 12].copy_from_slice(&2048u32.to_le_bytes());
        mbr[446 + 12..446 + 16].copy_from_slice(&p.total_sectors.to_le_bytes());
        mbr[510] = 0x55;
        mbr[511] = 0xAA;
        disk.fill(0, &mbr);
        common::format_fat32_at(&disk, 2048, &p);
        disk
    };

    let fs = FileSystem::mount(dev(&disk), MountOptions::default()).unwrap();
    assert_eq!(fs.kind(), FatKind::Fat32);
    let layout = fs.layout();
    assert_eq!(layout.fat_base, 2080);
    assert_eq!(layout.data_base, 2080 + 2 * 1024);
    assert_eq!(layout.root, RootBase::Cluster(2));
}

#[test]
fn mbr_forced_slot() {
    let disk = fat32_mbr_disk(2048);
    let options =
        MountOptions { partition: PartitionSelect::Index(1), ..MountOptions::default() };
    let fs = FileSystem::mount(dev(&disk), options).unwrap();
    assert_eq!(fs.layout().vol_base, 2048);

    let options =
        MountOptions { partition: PartitionSelect::Index(2), ..MountOptions::default() };
    assert!(matches!(
        FileSystem::mount(dev(&disk), options),
        Err(Error::NoFilesystem)
    ));
}

#[test]
fn gpt_basic_data_partition_is_found() {
    let disk = fat32_gpt_disk(2048);
    let fs = FileSystem::mount(dev(&disk), MountOptions::default()).unwrap();
    assert_eq!(fs.kind(), FatKind::Fat32);
    assert_eq!(fs.layout().vol_base, 2048);
}

#[test]
fn corrupt_gpt_header_fails_the_mount() {
    let disk = fat32_gpt_disk(2048);
    // Flip one byte inside the protected header region.
    let mut header = disk.sector(1);
    header[40] ^= 0x01;
    disk.fill(1, &header);
    assert!(matches!(
        FileSystem::mount(dev(&disk), MountOptions::default()),
        Err(Error::NoFilesystem)
    ));
}

#[test]
fn sfd_selector_rejects_partitioned_media() {
    let disk = fat32_mbr_disk(2048);
    let options = MountOptions { partition: PartitionSelect::Sfd, ..MountOptions::default() };
    assert!(matches!(
        FileSystem::mount(dev(&disk), options),
        Err(Error::NoFilesystem)
    ));
}

#[test]
fn blank_media_is_not_a_filesystem() {
    let disk = Arc::new(RamDisk::new(128));
    assert!(matches!(
        FileSystem::mount(dev(&disk), MountOptions::default()),
        Err(Error::NoFilesystem)
    ));
}

#[test]
fn variants_classify_by_cluster_count() {
    let fs16 = FileSystem::mount(dev(&fat16_disk()), MountOptions::default()).unwrap();
    assert_eq!(fs16.kind(), FatKind::Fat16);
    assert!(fs16.layout().is_fixed_root());

    let fs12 = FileSystem::mount(dev(&fat12_disk()), MountOptions::default()).unwrap();
    assert_eq!(fs12.kind(), FatKind::Fat12);
    assert_eq!(
        fs12.layout().root,
        RootBase::Fixed { first_sector: 19, entries: 224 }
    );

    // The lightweight probe agrees without mounting.
    let floppy = dev(&fat12_disk());
    assert_eq!(fat_rs::fs::probe(&floppy).unwrap(), FatKind::Fat12);
}

#[test]
fn stale_handles_die_at_unmount() {
    use fat_rs::dir::Dir;

    let disk = fat32_disk();
    let fs = FileSystem::mount(dev(&disk), MountOptions::default()).unwrap();
    let root = fs.root_dir();
    fs.unmount().unwrap();
    assert!(matches!(root.ls(), Err(Error::InvalidObject)));
}

#[test]
fn read_only_mount_rejects_writes() {
    use fat_rs::dir::Dir;
    use fat_rs::vfs::VirFileType;

    let disk = fat32_disk();
    let options = MountOptions { read_only: true, ..MountOptions::default() };
    let fs = FileSystem::mount(dev(&disk), options).unwrap();
    let root = fs.root_dir();
    assert!(matches!(
        root.create("nope.txt", VirFileType::File),
        Err(Error::WriteProtected)
    ));
}

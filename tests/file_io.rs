//! File I/O: open modes, read/write round trips, seek, truncate, expand,
//! free-count bookkeeping.

mod common;

use std::sync::Arc;

use common::{fat32_disk, RamDisk};
use fat_rs::device::BlockDevice;
use fat_rs::{Error, File, MountOptions, OpenFlags, SeekFrom, VolumeManager};

fn manager(disk: &Arc<RamDisk>) -> VolumeManager {
    let mut vm = VolumeManager::new(2);
    let dev: Arc<dyn BlockDevice> = disk.clone();
    vm.mount(0, dev, MountOptions::default()).unwrap();
    vm
}

#[test]
fn write_then_read_round_trips() {
    let disk = fat32_disk();
    let vm = manager(&disk);

    let mut file = vm
        .open("0:/hello.txt", OpenFlags::WRITE | OpenFlags::CREATE_NEW)
        .unwrap();
    assert_eq!(file.write(b"world!").unwrap(), 6);
    file.close().unwrap();

    let mut file = vm.open("0:/hello.txt", OpenFlags::READ).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(file.read(&mut buf).unwrap(), 6);
    assert_eq!(&buf[..6], b"world!");
    assert_eq!(file.read(&mut buf).unwrap(), 0);

    assert_eq!(vm.stat("0:/hello.txt").unwrap().size, 6);
}

#[test]
fn create_new_refuses_an_existing_file() {
    let disk = fat32_disk();
    let vm = manager(&disk);
    vm.open("0:/a.txt", OpenFlags::WRITE | OpenFlags::CREATE_NEW)
        .unwrap()
        .close()
        .unwrap();
    assert!(matches!(
        vm.open("0:/a.txt", OpenFlags::WRITE | OpenFlags::CREATE_NEW),
        Err(Error::Exist)
    ));
    // OPEN_ANYWAY opens it instead.
    vm.open("0:/a.txt", OpenFlags::WRITE | OpenFlags::OPEN_ANYWAY)
        .unwrap()
        .close()
        .unwrap();
}

#[test]
fn empty_file_owns_no_cluster_until_first_write() {
    let disk = fat32_disk();
    let vm = manager(&disk);

    vm.open("0:/empty.bin", OpenFlags::WRITE | OpenFlags::CREATE_NEW)
        .unwrap()
        .close()
        .unwrap();
    let info = vm.stat("0:/empty.bin").unwrap();
    assert_eq!(info.size, 0);
    assert_eq!(info.first_cluster, 0);

    let (free_before, _) = vm.getfree(0).unwrap();
    let mut file = vm
        .open("0:/empty.bin", OpenFlags::WRITE | OpenFlags::READ)
        .unwrap();
    file.write(b"x").unwrap();
    file.close().unwrap();

    let info = vm.stat("0:/empty.bin").unwrap();
    assert_ne!(info.first_cluster, 0);
    let (free_after, _) = vm.getfree(0).unwrap();
    assert_eq!(free_after, free_before - 1);
}

#[test]
fn append_mode_writes_at_the_end() {
    let disk = fat32_disk();
    let vm = manager(&disk);

    let mut file = vm
        .open("0:/log.txt", OpenFlags::WRITE | OpenFlags::CREATE_NEW)
        .unwrap();
    file.write(b"one").unwrap();
    file.close().unwrap();

    let mut file = vm
        .open("0:/log.txt", OpenFlags::WRITE | OpenFlags::APPEND)
        .unwrap();
    assert_eq!(file.tell(), 3);
    file.write(b"two").unwrap();
    file.close().unwrap();

    let mut file = vm.open("0:/log.txt", OpenFlags::READ).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(file.read(&mut buf).unwrap(), 6);
    assert_eq!(&buf[..6], b"onetwo");
}

#[test]
fn data_survives_a_remount() {
    let disk = fat32_disk();
    {
        let vm = manager(&disk);
        let mut file = vm
            .open("0:/persist.bin", OpenFlags::WRITE | OpenFlags::CREATE_NEW)
            .unwrap();
        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(file.write(&payload).unwrap(), payload.len());
        file.close().unwrap();
        // vm drops here; the FileSystem flushes on drop.
    }

    let vm = manager(&disk);
    let mut file = vm.open("0:/persist.bin", OpenFlags::READ).unwrap();
    let mut back = vec![0u8; 4096];
    assert_eq!(file.read(&mut back).unwrap(), 4096);
    assert!(back.iter().enumerate().all(|(i, &b)| b == (i % 251) as u8));
}

#[test]
fn seek_past_the_end_extends_a_writable_file() {
    let disk = fat32_disk();
    let vm = manager(&disk);

    let mut file = vm
        .open("0:/sparse.bin", OpenFlags::WRITE | OpenFlags::READ | OpenFlags::CREATE_NEW)
        .unwrap();
    let cluster_size = 512; // default image: 1 sector per cluster
    file.seek(SeekFrom::Start(2 * cluster_size + 10)).unwrap();
    file.write(b"!").unwrap();
    assert_eq!(file.size().unwrap(), 2 * cluster_size + 11);

    file.seek(SeekFrom::Start(0)).unwrap();
    let mut buf = vec![0u8; 2 * cluster_size + 11];
    assert_eq!(file.read(&mut buf).unwrap(), buf.len());
    assert_eq!(buf[2 * cluster_size + 10], b'!');
    file.close().unwrap();
}

#[test]
fn seek_on_a_read_handle_clamps_to_the_size() {
    let disk = fat32_disk();
    let vm = manager(&disk);
    let mut file = vm
        .open("0:/c.txt", OpenFlags::WRITE | OpenFlags::CREATE_NEW)
        .unwrap();
    file.write(b"abc").unwrap();
    file.close().unwrap();

    let mut file = vm.open("0:/c.txt", OpenFlags::READ).unwrap();
    assert_eq!(file.seek(SeekFrom::Start(1000)).unwrap(), 3);
    assert_eq!(file.seek(SeekFrom::End(-2)).unwrap(), 1);
    assert!(file.seek(SeekFrom::Current(-5)).is_err());
}

#[test]
fn truncate_frees_the_tail_and_terminates_the_chain() {
    let disk = fat32_disk();
    let vm = manager(&disk);
    let cluster_size = 512usize;

    let mut file = vm
        .open("0:/two.bin", OpenFlags::WRITE | OpenFlags::READ | OpenFlags::CREATE_NEW)
        .unwrap();
    let payload = vec![0xA5u8; 2 * cluster_size];
    file.write(&payload).unwrap();
    file.sync().unwrap();

    let info = vm.stat("0:/two.bin").unwrap();
    let first = info.first_cluster;
    let fat_base = { vm.volume(0).unwrap().layout().fat_base };
    let second = disk.fat32_entry(fat_base, first);
    assert!(second >= 2 && second < 0x0FFF_FFF8, "two-cluster chain");

    let (free_before, _) = vm.getfree(0).unwrap();
    file.seek(SeekFrom::Start(cluster_size)).unwrap();
    file.truncate().unwrap();
    file.close().unwrap();

    let reopened = vm.stat("0:/two.bin").unwrap();
    assert_eq!(reopened.size, cluster_size);
    assert!(disk.fat32_entry(fat_base, first) >= 0x0FFF_FFF8, "first cluster ends the chain");
    assert_eq!(disk.fat32_entry(fat_base, second), 0, "second cluster is free");
    let (free_after, _) = vm.getfree(0).unwrap();
    assert_eq!(free_after, free_before + 1);
}

#[test]
fn expand_allocates_a_contiguous_run() {
    let disk = fat32_disk();
    let vm = manager(&disk);

    let mut file = vm
        .open("0:/contig.bin", OpenFlags::WRITE | OpenFlags::CREATE_NEW)
        .unwrap();
    file.expand(4 * 512, true).unwrap();
    assert_eq!(file.size().unwrap(), 4 * 512);
    file.close().unwrap();

    let info = vm.stat("0:/contig.bin").unwrap();
    let fat_base = { vm.volume(0).unwrap().layout().fat_base };
    let first = info.first_cluster;
    for i in 0..3 {
        assert_eq!(disk.fat32_entry(fat_base, first + i), first + i + 1);
    }
    assert!(disk.fat32_entry(fat_base, first + 3) >= 0x0FFF_FFF8);

    // A second expand on a non-empty file is refused.
    let mut file = vm
        .open("0:/contig.bin", OpenFlags::WRITE | OpenFlags::READ)
        .unwrap();
    assert!(matches!(file.expand(1024, true), Err(Error::Denied)));
}

#[test]
fn deferred_expand_commits_on_first_write_and_dies_with_the_handle() {
    let disk = fat32_disk();
    let vm = manager(&disk);

    // Prepared but never written: nothing may remain allocated.
    let (free0, _) = vm.getfree(0).unwrap();
    {
        let mut file = vm
            .open("0:/ghost.bin", OpenFlags::WRITE | OpenFlags::CREATE_NEW)
            .unwrap();
        file.expand(8 * 512, false).unwrap();
        file.close().unwrap();
    }
    assert_eq!(vm.getfree(0).unwrap().0, free0);
    assert_eq!(vm.stat("0:/ghost.bin").unwrap().first_cluster, 0);

    // Prepared and written: the run is claimed at the first write.
    let mut file = vm
        .open("0:/real.bin", OpenFlags::WRITE | OpenFlags::CREATE_NEW)
        .unwrap();
    file.expand(3 * 512, false).unwrap();
    file.write(b"data").unwrap();
    file.close().unwrap();
    let info = vm.stat("0:/real.bin").unwrap();
    assert_ne!(info.first_cluster, 0);
    assert_eq!(info.size, 4);
}

#[test]
fn free_count_recount_scenario() {
    // FSInfo says "unknown": the first getfree walks the FAT. After that
    // the cached count tracks allocations exactly.
    let disk = fat32_disk(); // builder plants 0xFFFFFFFF
    let vm = manager(&disk);

    let (free, total) = vm.getfree(0).unwrap();
    assert_eq!(total, 68868); // data clusters of the default image
    assert_eq!(free, total - 1); // root directory owns one cluster

    let mut file = vm
        .open("0:/three.bin", OpenFlags::WRITE | OpenFlags::CREATE_NEW)
        .unwrap();
    file.write(&vec![0u8; 3 * 512]).unwrap();
    file.close().unwrap();
    assert_eq!(vm.getfree(0).unwrap().0, free - 3);

    vm.unlink("0:/three.bin").unwrap();
    assert_eq!(vm.getfree(0).unwrap().0, free);
}

#[test]
fn sync_rewrites_fsinfo() {
    let disk = fat32_disk();
    let vm = manager(&disk);

    let mut file = vm
        .open("0:/f.bin", OpenFlags::WRITE | OpenFlags::CREATE_NEW)
        .unwrap();
    file.write(&[0u8; 512]).unwrap();
    file.close().unwrap();
    let (free, _) = vm.getfree(0).unwrap();
    vm.sync(0).unwrap();

    let fsinfo = disk.sector(1);
    assert_eq!(&fsinfo[0..4], &0x41615252u32.to_le_bytes());
    assert_eq!(&fsinfo[484..488], &0x61417272u32.to_le_bytes());
    let on_disk = u32::from_le_bytes(fsinfo[488..492].try_into().unwrap());
    assert_eq!(on_disk, free);
    assert_eq!(&fsinfo[508..512], &0xAA550000u32.to_le_bytes());
}

#[test]
fn write_without_the_write_flag_is_denied() {
    let disk = fat32_disk();
    let vm = manager(&disk);
    vm.open("0:/ro.txt", OpenFlags::WRITE | OpenFlags::CREATE_NEW)
        .unwrap()
        .close()
        .unwrap();
    let mut file = vm.open("0:/ro.txt", OpenFlags::READ).unwrap();
    assert!(matches!(file.write(b"no"), Err(Error::Denied)));
}

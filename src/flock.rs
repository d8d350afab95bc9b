//! File sharing control.
//!
//! A fixed-size, process-wide table of open objects, keyed by volume mount
//! generation, containing-directory start cluster and entry offset. Read
//! opens share a slot up to 0xFF holders; a write open takes the slot
//! exclusively (count 0x100). Remove and rename require the slot to be
//! completely free.
//!
//! A successful open yields a [`LockSlot`] lease owned by the handle;
//! dropping the lease releases the slot, so a closed or leaked handle can
//! never pin a file forever. Slots are stamped per occupancy, so a lease
//! that outlives `purge_volume` cannot release a slot that was reassigned
//! in the meantime.

use lazy_static::lazy_static;
use spin::Mutex;

use crate::{Error, Result};

/// Size of the sharing table; the number of distinct objects that can be
/// open at once.
pub const FILE_LOCK_SLOTS: usize = 64;

/// Slot counter value marking an exclusive (write) holder.
const WRITER: u16 = 0x100;
/// Most readers one slot can carry.
const READERS_MAX: u16 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    /// Mount generation of the owning volume.
    vol_id: usize,
    /// Start cluster of the containing directory (0 for the root).
    parent_cluster: u32,
    /// Byte offset of the short entry inside the containing directory.
    offset: u32,
    /// 0 none, 1..=0xFF read holders, 0x100 write holder.
    count: u16,
    /// Occupancy stamp; leases from an older occupancy are ignored.
    stamp: u64,
}

const BLANK: Slot = Slot { vol_id: 0, parent_cluster: 0, offset: 0, count: 0, stamp: 0 };

struct Table {
    slots: [Slot; FILE_LOCK_SLOTS],
    next_stamp: u64,
}

lazy_static! {
    static ref FILE_LOCKS: Mutex<Table> =
        Mutex::new(Table { slots: [BLANK; FILE_LOCK_SLOTS], next_stamp: 1 });
}

/// A held sharing-table slot. Releases itself when dropped.
#[derive(Debug)]
pub struct LockSlot {
    index: usize,
    stamp: u64,
}

impl Drop for LockSlot {
    fn drop(&mut self) {
        let mut table = FILE_LOCKS.lock();
        let slot = &mut table.slots[self.index];
        if slot.count == 0 || slot.stamp != self.stamp {
            return;
        }
        if slot.count == WRITER || slot.count == 1 {
            *slot = BLANK;
        } else {
            slot.count -= 1;
        }
    }
}

fn find(slots: &[Slot; FILE_LOCK_SLOTS], vol_id: usize, parent: u32, offset: u32) -> Option<usize> {
    slots.iter().position(|slot| {
        slot.count != 0
            && slot.vol_id == vol_id
            && slot.parent_cluster == parent
            && slot.offset == offset
    })
}

/// Whether the object may be opened in `mode` right now, without taking a
/// slot. Also used with `LockMode::Write` by remove and rename, which must
/// not race any holder.
pub fn check(vol_id: usize, parent: u32, offset: u32, mode: LockMode) -> Result<()> {
    let table = FILE_LOCKS.lock();
    match find(&table.slots, vol_id, parent, offset) {
        None => Ok(()),
        Some(index) => {
            let slot = &table.slots[index];
            if slot.count == WRITER || mode == LockMode::Write {
                Err(Error::Locked)
            } else {
                Ok(())
            }
        }
    }
}

/// Take (or share) the slot for the object. Fails with `Locked` on a
/// sharing violation and `TooManyOpenFiles` when the table is full.
pub fn enter(vol_id: usize, parent: u32, offset: u32, mode: LockMode) -> Result<LockSlot> {
    let mut table = FILE_LOCKS.lock();
    if let Some(index) = find(&table.slots, vol_id, parent, offset) {
        let slot = &mut table.slots[index];
        return match mode {
            LockMode::Write => Err(Error::Locked),
            LockMode::Read => {
                if slot.count == WRITER || slot.count >= READERS_MAX {
                    Err(Error::Locked)
                } else {
                    slot.count += 1;
                    Ok(LockSlot { index, stamp: slot.stamp })
                }
            }
        };
    }

    let index = table
        .slots
        .iter()
        .position(|slot| slot.count == 0)
        .ok_or(Error::TooManyOpenFiles)?;
    let stamp = table.next_stamp;
    table.next_stamp += 1;
    table.slots[index] = Slot {
        vol_id,
        parent_cluster: parent,
        offset,
        count: match mode {
            LockMode::Read => 1,
            LockMode::Write => WRITER,
        },
        stamp,
    };
    Ok(LockSlot { index, stamp })
}

/// Drop every slot belonging to a volume. Called at unmount, after which
/// the volume's handles are stale anyway.
pub fn purge_volume(vol_id: usize) {
    let mut table = FILE_LOCKS.lock();
    for slot in table.slots.iter_mut() {
        if slot.count != 0 && slot.vol_id == vol_id {
            *slot = BLANK;
        }
    }
}

//! Block device interface

use core::any::Any;
use core::result::Result;

/// Faults reported by the device layer. Timeouts are kept apart from hard
/// read/write errors so callers can tell transient faults from permanent
/// ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    ReadError,
    WriteError,
    NotReady,
    Timeout,
    WriteProtected,
    /// The ioctl command is not implemented by this device.
    Unsupported,
}

/// Control commands used by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlCmd {
    /// Flush any write-back cache inside the device.
    CtrlSync,
    /// Number of addressable sectors.
    GetSectorCount,
    /// Sector size in bytes (512..4096, power of two).
    GetSectorSize,
    /// Erase block size in sectors; best effort, used by formatters.
    GetBlockSize,
    /// Inform the device that the sector range (inclusive) holds no live
    /// data anymore.
    CtrlTrim { start_lba: u64, end_lba: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlResp {
    Ok,
    SectorCount(u64),
    SectorSize(u16),
    BlockSize(u32),
}

/// A sector-addressable storage medium (SD/MMC, flash translation layer,
/// RAM disk, image file).
///
/// All addressing is in whole sectors by LBA. `buf.len()` must equal
/// `block_cnt` sectors.
pub trait BlockDevice: Send + Sync + Any {
    /// Bring the medium up. Called once at mount.
    fn init(&self) -> Result<(), DeviceError>;

    /// Current medium status.
    fn status(&self) -> Result<(), DeviceError>;

    /// Read `block_cnt` sectors starting at `lba`.
    fn read_blocks(&self, buf: &mut [u8], lba: u64, block_cnt: usize) -> Result<(), DeviceError>;

    /// Write `block_cnt` sectors starting at `lba`.
    fn write_blocks(&self, buf: &[u8], lba: u64, block_cnt: usize) -> Result<(), DeviceError>;

    /// Miscellaneous control. Devices may answer `Unsupported` for any
    /// command except `CtrlSync`.
    fn ioctl(&self, cmd: IoctlCmd) -> Result<IoctlResp, DeviceError>;
}

//! The file I/O path.
//!
//! A [`FileHandle`] is an open file: an object reference, the open-mode
//! flags, a byte cursor and (while one is prepared) a contiguous-area
//! hint from [`FileHandle::expand`]. Reads and writes move whole ranges
//! through the sector cache; writes extend the cluster chain on demand and
//! mark the handle modified so `sync`/`close` rewrite the directory entry
//! (size, start cluster, timestamp, archive bit).
//!
//! Handle methods serialize on the volume's sync object; the handle is a
//! public entry point of the engine.

use alloc::sync::Arc;

use crate::dir::Dir;
use crate::flock::{self, LockMode, LockSlot};
use crate::vfs::{VirFile, VirFileType};
use crate::{Error, Result, MAX_FILE_SIZE};

/// Open-mode flags, composed with `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(u8);

impl OpenFlags {
    /// Open for reading.
    pub const READ: OpenFlags = OpenFlags(0x01);
    /// Open for writing.
    pub const WRITE: OpenFlags = OpenFlags(0x02);
    /// Fail with `Exist` when the file is already there.
    pub const CREATE_NEW: OpenFlags = OpenFlags(0x04);
    /// Drop any existing content at open.
    pub const TRUNCATE: OpenFlags = OpenFlags(0x08);
    /// Create the file when it is missing, open it otherwise.
    pub const OPEN_ANYWAY: OpenFlags = OpenFlags(0x10);
    /// Position the cursor at end of file and keep it there on write.
    pub const APPEND: OpenFlags = OpenFlags(0x20);
    /// Plain open of an existing file.
    pub const OPEN_EXISTING: OpenFlags = OpenFlags(0x00);

    pub const fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }

    fn wants_create(self) -> bool {
        self.contains(Self::CREATE_NEW) || self.contains(Self::OPEN_ANYWAY)
    }
}

impl core::ops::BitOr for OpenFlags {
    type Output = OpenFlags;
    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    Start(usize),
    Current(i64),
    End(i64),
}

/// Byte-stream operations of an open file.
pub trait File {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn write(&mut self, buf: &[u8]) -> Result<usize>;
    fn seek(&mut self, pos: SeekFrom) -> Result<usize>;
}

pub struct FileHandle {
    file: VirFile,
    flags: OpenFlags,
    offset: usize,
    /// Contiguous run prepared by `expand` without commit, private to this
    /// handle and discarded on close.
    expand_hint: Option<(u32, u32)>,
    /// Sharing-table lease; released by drop.
    _lock: Option<LockSlot>,
    modified: bool,
}

impl FileHandle {
    /// Open `path` (segments relative to `dir`) according to `flags`.
    ///
    /// The open state machine: resolve the parent, look the name up, check
    /// the sharing table, then create/truncate/position as the flags ask.
    /// A created file owns no cluster until its first write.
    pub fn open(dir: &VirFile, path: &[&str], flags: OpenFlags) -> Result<FileHandle> {
        dir.check_valid()?;
        let _guard = dir.fs_handle().lock();
        Self::open_locked(dir, path, flags)
    }

    fn open_locked(dir: &VirFile, path: &[&str], flags: OpenFlags) -> Result<FileHandle> {
        let writes = flags.contains(OpenFlags::WRITE);
        if !writes && !flags.contains(OpenFlags::READ) {
            return Err(Error::InvalidParameter);
        }
        if !writes
            && (flags.wants_create()
                || flags.contains(OpenFlags::TRUNCATE)
                || flags.contains(OpenFlags::APPEND))
        {
            return Err(Error::InvalidParameter);
        }
        if writes {
            dir.fs_handle().check_writable()?;
        }

        let (parent_path, name) = match path.split_last() {
            Some((name, parent)) => (parent, *name),
            None => return Err(Error::InvalidName),
        };
        let parent = dir.find(parent_path)?;
        if !parent.is_dir() {
            return Err(Error::NoPath);
        }
        let name = name.trim();

        let mode = if writes { LockMode::Write } else { LockMode::Read };
        let file = match parent.find_by_name(name)? {
            Some(found) => {
                if flags.contains(OpenFlags::CREATE_NEW) {
                    return Err(Error::Exist);
                }
                if found.is_dir() {
                    return Err(Error::Denied);
                }
                let lock = flock::enter(
                    found.fs_handle().mount_id,
                    found.parent_cluster,
                    found.dir_offset as u32,
                    mode,
                )?;
                if flags.contains(OpenFlags::TRUNCATE) {
                    found.truncate_to(0)?;
                    found.touch_modified()?;
                }
                (found, lock)
            }
            None => {
                if !flags.wants_create() {
                    return Err(Error::NoFile);
                }
                let created = parent.create(name, VirFileType::File)?;
                let lock = flock::enter(
                    created.fs_handle().mount_id,
                    created.parent_cluster,
                    created.dir_offset as u32,
                    mode,
                )?;
                (created, lock)
            }
        };

        let (file, lock) = file;
        let offset = if flags.contains(OpenFlags::APPEND) { file.file_size()? } else { 0 };
        Ok(FileHandle {
            file,
            flags,
            offset,
            expand_hint: None,
            _lock: Some(lock),
            modified: false,
        })
    }

    pub fn size(&self) -> Result<usize> {
        self.file.file_size()
    }

    pub fn tell(&self) -> usize {
        self.offset
    }

    pub fn is_eof(&self) -> Result<bool> {
        Ok(self.offset >= self.file.file_size()?)
    }

    pub fn name(&self) -> &str {
        self.file.name()
    }

    /// Claim the prepared contiguous run, if any. Runs on the first write
    /// through this handle.
    fn commit_expand_hint(&mut self) -> Result<()> {
        let (first, count) = match self.expand_hint.take() {
            Some(hint) => hint,
            None => return Ok(()),
        };
        // The run was only reserved in this handle; it is still free on
        // disk unless someone else took it meanwhile.
        self.file.fs_handle().fat.write().claim_contiguous(first, count)?;
        self.file.set_first_cluster(first)?;
        Ok(())
    }

    /// Pre-allocate a contiguous area of at least `size` bytes. The file
    /// must still be empty. With `commit` the clusters are claimed and the
    /// size recorded at once; without, the run is only remembered in this
    /// handle and claimed by the first write (or forgotten at close).
    pub fn expand(&mut self, size: usize, commit: bool) -> Result<()> {
        self.file.check_valid()?;
        let fs = Arc::clone(self.file.fs_handle());
        let _guard = fs.lock();
        if !self.flags.contains(OpenFlags::WRITE) {
            return Err(Error::Denied);
        }
        if size == 0 || size > MAX_FILE_SIZE as usize {
            return Err(Error::InvalidParameter);
        }
        if self.file.first_cluster()? != 0 || self.expand_hint.is_some() {
            return Err(Error::Denied);
        }

        let cluster_size = self.file.fs_handle().layout.cluster_size();
        let count = ((size + cluster_size - 1) / cluster_size) as u32;
        let first = match self.file.fs_handle().fat.read().find_contiguous(count) {
            Ok(first) => first,
            // No hole that large: the area cannot be provided.
            Err(Error::FatFull) => return Err(Error::Denied),
            Err(err) => return Err(err),
        };

        if commit {
            self.file.fs_handle().fat.write().claim_contiguous(first, count)?;
            self.file.set_first_cluster(first)?;
            self.file.set_file_size(size)?;
            self.modified = true;
        } else {
            self.expand_hint = Some((first, count));
        }
        Ok(())
    }

    /// Cut the file at the current cursor: the tail clusters are freed and
    /// the chain is terminated at the last surviving cluster.
    pub fn truncate(&mut self) -> Result<()> {
        self.file.check_valid()?;
        let fs = Arc::clone(self.file.fs_handle());
        let _guard = fs.lock();
        if !self.flags.contains(OpenFlags::WRITE) {
            return Err(Error::Denied);
        }
        self.file.truncate_to(self.offset)?;
        self.modified = true;
        Ok(())
    }

    /// Flush this file: directory entry (size, start cluster, modify time,
    /// archive bit) and then the volume.
    pub fn sync(&mut self) -> Result<()> {
        self.file.check_valid()?;
        let fs = Arc::clone(self.file.fs_handle());
        let _guard = fs.lock();
        self.sync_locked()
    }

    fn sync_locked(&mut self) -> Result<()> {
        if self.modified {
            self.file.touch_modified()?;
            self.modified = false;
        }
        self.file.fs_handle().sync()
    }

    /// Flush and release the handle. Dropping the handle without `close`
    /// flushes best-effort.
    pub fn close(mut self) -> Result<()> {
        self.file.check_valid()?;
        let fs = Arc::clone(self.file.fs_handle());
        let _guard = fs.lock();
        self.sync_locked()
    }
}

impl File for FileHandle {
    /// Read from the cursor, advancing it. Short counts happen only at end
    /// of file.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.file.check_valid()?;
        let fs = Arc::clone(self.file.fs_handle());
        let _guard = fs.lock();
        if !self.flags.contains(OpenFlags::READ) {
            return Err(Error::Denied);
        }
        let read = self.file.read_at(self.offset, buf)?;
        self.offset += read;
        Ok(read)
    }

    /// Write at the cursor, extending the file as needed. In append mode
    /// the cursor snaps to end of file first. A full volume yields a
    /// short count with the cursor after the last written byte.
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.file.check_valid()?;
        let fs = Arc::clone(self.file.fs_handle());
        let _guard = fs.lock();
        if !self.flags.contains(OpenFlags::WRITE) {
            return Err(Error::Denied);
        }
        if self.flags.contains(OpenFlags::APPEND) {
            self.offset = self.file.file_size()?;
        }
        if buf.is_empty() {
            return Ok(0);
        }
        self.commit_expand_hint()?;

        match self.file.write_at(self.offset, buf) {
            Ok(written) => {
                self.offset += written;
                self.modified = true;
                Ok(written)
            }
            // Disk completely full: a zero-byte write, not a failure.
            Err(Error::FatFull) => Ok(0),
            Err(err) => Err(err),
        }
    }

    /// Move the cursor. Seeking past end of file extends a writable file
    /// (the extension's contents are unspecified); on a read-only handle
    /// the cursor is clamped to the file size.
    fn seek(&mut self, pos: SeekFrom) -> Result<usize> {
        self.file.check_valid()?;
        let fs = Arc::clone(self.file.fs_handle());
        let _guard = fs.lock();
        let size = self.file.file_size()?;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(delta) => self.offset as i64 + delta,
            SeekFrom::End(delta) => size as i64 + delta,
        };
        if target < 0 || target > MAX_FILE_SIZE as i64 {
            return Err(Error::InvalidParameter);
        }
        let mut target = target as usize;
        if target > size {
            if self.flags.contains(OpenFlags::WRITE) {
                self.file.increase_size(target)?;
                self.modified = true;
            } else {
                target = size;
            }
        }
        self.offset = target;
        Ok(self.offset)
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if self.modified && self.file.check_valid().is_ok() {
            let fs = Arc::clone(self.file.fs_handle());
            let _guard = fs.lock();
            if self.sync_locked().is_err() {
                log::warn!("file {} dropped with unflushed state", self.file.name());
            }
        }
    }
}

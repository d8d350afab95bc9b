//! Path resolution and the logical-drive registry.
//!
//! A path is either absolute (`"3:/dir/file"`: drive number, colon, body)
//! or relative to the current directory of its drive. Separators are `/`
//! and `\`; leading and trailing whitespace of each segment is ignored.
//! The registry replaces the classic global drive table: callers own a
//! [`VolumeManager`], mount devices into its numbered slots and address
//! them by the drive prefix.

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::device::BlockDevice;
use crate::dir::{Dir, DirHandle, FileInfo};
use crate::file::{FileHandle, OpenFlags};
use crate::fs::{FileSystem, MountOptions};
use crate::time::DateTime;
use crate::vfs::{VirFile, VirFileType};
use crate::{Error, Result, ATTR_CHANGEABLE};

/// Most drive slots a manager can carry ('0:' .. '25:').
pub const DRIVES_MAX: usize = 26;

struct Volume {
    fs: Arc<FileSystem>,
    /// Current directory; `None` means the root.
    cwd: Option<VirFile>,
}

/// The logical-drive registry and entry point of the POSIX-style API.
pub struct VolumeManager {
    volumes: Vec<Option<Volume>>,
    current_drive: usize,
}

/// A parsed path: the addressed drive, whether it was anchored at the
/// root, and its segments.
struct ParsedPath<'a> {
    drive: usize,
    absolute: bool,
    segments: Vec<&'a str>,
}

impl VolumeManager {
    /// A registry with `slots` logical drives, all empty.
    pub fn new(slots: usize) -> Self {
        let slots = slots.clamp(1, DRIVES_MAX);
        let mut volumes = Vec::with_capacity(slots);
        volumes.resize_with(slots, || None);
        Self { volumes, current_drive: 0 }
    }

    /// Mount `device` into drive slot `drive`.
    pub fn mount(
        &mut self,
        drive: usize,
        device: Arc<dyn BlockDevice>,
        options: MountOptions,
    ) -> Result<()> {
        let slot = self.volumes.get_mut(drive).ok_or(Error::InvalidDrive)?;
        if slot.is_some() {
            return Err(Error::Exist);
        }
        let fs = FileSystem::mount(device, options)?;
        *slot = Some(Volume { fs, cwd: None });
        Ok(())
    }

    /// Flush and remove the volume in slot `drive`. Outstanding handles
    /// turn stale.
    pub fn unmount(&mut self, drive: usize) -> Result<()> {
        let slot = self.volumes.get_mut(drive).ok_or(Error::InvalidDrive)?;
        let volume = slot.take().ok_or(Error::NotEnabled)?;
        volume.fs.unmount()
    }

    /// The mounted volume in slot `drive`.
    pub fn volume(&self, drive: usize) -> Result<&Arc<FileSystem>> {
        match self.volumes.get(drive) {
            Some(Some(volume)) => Ok(&volume.fs),
            Some(None) => Err(Error::NotEnabled),
            None => Err(Error::InvalidDrive),
        }
    }

    /// Make `drive` the default for paths without a drive prefix.
    pub fn chdrive(&mut self, drive: usize) -> Result<()> {
        if drive >= self.volumes.len() {
            return Err(Error::InvalidDrive);
        }
        self.current_drive = drive;
        Ok(())
    }

    // Parsing -------------------------------------------------------------

    fn parse<'a>(&self, path: &'a str) -> Result<ParsedPath<'a>> {
        let (drive, body) = match path.find(':') {
            Some(colon) => {
                let prefix = &path[..colon];
                if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(Error::InvalidDrive);
                }
                let drive: usize =
                    prefix.parse().map_err(|_| Error::InvalidDrive)?;
                (drive, &path[colon + 1..])
            }
            None => (self.current_drive, path),
        };
        if drive >= self.volumes.len() {
            return Err(Error::InvalidDrive);
        }
        let absolute = body.starts_with('/') || body.starts_with('\\');
        let segments = body
            .split(|ch| ch == '/' || ch == '\\')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        Ok(ParsedPath { drive, absolute, segments })
    }

    /// Directory a parsed path starts from: the drive's root, or its
    /// current directory for relative paths.
    fn start_dir(&self, parsed: &ParsedPath<'_>) -> Result<VirFile> {
        let volume = match self.volumes.get(parsed.drive) {
            Some(Some(volume)) => volume,
            Some(None) => return Err(Error::NotEnabled),
            None => return Err(Error::InvalidDrive),
        };
        if parsed.absolute {
            return Ok(volume.fs.root_dir());
        }
        match &volume.cwd {
            Some(cwd) => {
                cwd.check_valid()?;
                Ok(cwd.clone())
            }
            None => Ok(volume.fs.root_dir()),
        }
    }

    fn resolve(&self, path: &str) -> Result<VirFile> {
        let parsed = self.parse(path)?;
        let start = self.start_dir(&parsed)?;
        start.find(&parsed.segments)
    }

    /// Split a path into its parent directory object and the final
    /// segment.
    fn resolve_parent<'a>(&self, path: &'a str) -> Result<(VirFile, &'a str)> {
        let parsed = self.parse(path)?;
        let (name, parents) = parsed.segments.split_last().ok_or(Error::InvalidName)?;
        let start = self.start_dir(&parsed)?;
        let parent = start.find(parents)?;
        if !parent.is_dir() {
            return Err(Error::NoPath);
        }
        Ok((parent, *name))
    }

    // File API ------------------------------------------------------------

    /// Open a file.
    pub fn open(&self, path: &str, flags: OpenFlags) -> Result<FileHandle> {
        let parsed = self.parse(path)?;
        if parsed.segments.is_empty() {
            return Err(Error::InvalidName);
        }
        let start = self.start_dir(&parsed)?;
        FileHandle::open(&start, &parsed.segments, flags)
    }

    /// Open a directory for iteration.
    pub fn opendir(&self, path: &str) -> Result<DirHandle> {
        let dir = self.resolve(path)?;
        if !dir.is_dir() {
            return Err(Error::NoPath);
        }
        let fs = Arc::clone(dir.fs_handle());
        let _guard = fs.lock();
        DirHandle::open(dir)
    }

    /// Create a directory.
    pub fn mkdir(&self, path: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent(path)?;
        let _guard = parent.fs_handle().lock();
        parent.create(name, VirFileType::Dir)?;
        Ok(())
    }

    /// Remove a file or an empty directory.
    pub fn unlink(&self, path: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent(path)?;
        let _guard = parent.fs_handle().lock();
        parent.remove(name)
    }

    /// Rename or move within one volume.
    pub fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        let (old_parent, old_name) = self.resolve_parent(old_path)?;
        let (new_parent, new_name) = self.resolve_parent(new_path)?;
        let _guard = old_parent.fs_handle().lock();
        old_parent.rename(old_name, &new_parent, new_name)
    }

    /// Metadata of a file or directory. The root itself has no entry to
    /// report on.
    pub fn stat(&self, path: &str) -> Result<FileInfo> {
        let file = self.resolve(path)?;
        if file.is_root() {
            return Err(Error::InvalidName);
        }
        let _guard = file.fs_handle().lock();
        let alt_name = file.read_sde(|sde| {
            crate::dir::short_name_display(
                &sde.name_bytes(),
                sde.nt_res(),
                &*file.fs_handle().codepage,
            )
        })?;
        let (size, attr, first_cluster, modified, created) = file.read_sde(|sde| {
            (
                sde.file_size() as usize,
                sde.attr(),
                sde.first_cluster(),
                sde.modify_datetime(),
                sde.create_datetime(),
            )
        })?;
        Ok(FileInfo {
            name: String::from(file.name()),
            alt_name,
            size,
            attr,
            is_dir: file.is_dir(),
            first_cluster,
            modified,
            created,
            entry_offset: file.dir_offset,
        })
    }

    /// Change attribute bits: `attr` gives the new values, `mask` selects
    /// which of the changeable bits (RO, HID, SYS, ARC) to touch.
    pub fn chmod(&self, path: &str, attr: u8, mask: u8) -> Result<()> {
        let file = self.resolve(path)?;
        if file.is_root() {
            return Err(Error::InvalidName);
        }
        let _guard = file.fs_handle().lock();
        file.fs_handle().check_writable()?;
        let mask = mask & ATTR_CHANGEABLE;
        file.modify_sde(|sde| {
            let merged = (sde.attr() & !mask) | (attr & mask);
            sde.set_attr(merged);
        })
    }

    /// Set the modification timestamp.
    pub fn utime(&self, path: &str, stamp: DateTime) -> Result<()> {
        let file = self.resolve(path)?;
        if file.is_root() {
            return Err(Error::InvalidName);
        }
        let _guard = file.fs_handle().lock();
        file.fs_handle().check_writable()?;
        file.modify_sde(|sde| sde.set_modify_datetime(stamp))
    }

    // Current directory ---------------------------------------------------

    /// Change the current directory of the addressed drive.
    pub fn chdir(&mut self, path: &str) -> Result<()> {
        let parsed = self.parse(path)?;
        let drive = parsed.drive;
        let dir = {
            let start = self.start_dir(&parsed)?;
            start.find(&parsed.segments)?
        };
        if !dir.is_dir() {
            return Err(Error::NoPath);
        }
        let slot = self.volumes[drive].as_mut().ok_or(Error::NotEnabled)?;
        slot.cwd = if dir.is_root() { None } else { Some(dir) };
        Ok(())
    }

    /// Reassemble the current directory of the default drive by following
    /// `..` entries up to the root.
    pub fn getcwd(&self) -> Result<String> {
        let volume = match self.volumes.get(self.current_drive) {
            Some(Some(volume)) => volume,
            Some(None) => return Err(Error::NotEnabled),
            None => return Err(Error::InvalidDrive),
        };
        let mut segments: Vec<String> = Vec::new();
        let mut dir = match &volume.cwd {
            None => return Ok(format!("{}:/", self.current_drive)),
            Some(cwd) => {
                cwd.check_valid()?;
                cwd.clone()
            }
        };
        let fs = Arc::clone(dir.fs_handle());
        let _guard = fs.lock();

        while !dir.is_root() {
            let parent = dir.parent()?;
            let cluster = dir.first_cluster()?;
            let mut offset = 0usize;
            let mut found = None;
            while let Some((info, next)) = parent.dir_info(offset)? {
                offset = next;
                if !info.is_dir || info.name == "." || info.name == ".." {
                    continue;
                }
                if info.first_cluster == cluster {
                    found = Some(info.name);
                    break;
                }
            }
            segments.push(found.ok_or(Error::IntErr)?);
            dir = parent;
        }

        let mut out = format!("{}:", self.current_drive);
        for segment in segments.iter().rev() {
            out.push('/');
            out.push_str(segment);
        }
        if segments.is_empty() {
            out.push('/');
        }
        Ok(out)
    }

    // Volume level --------------------------------------------------------

    /// Free clusters and total data clusters of a drive.
    pub fn getfree(&self, drive: usize) -> Result<(u32, u32)> {
        let fs = self.volume(drive)?;
        let _guard = fs.lock();
        fs.get_free()
    }

    /// Flush a drive.
    pub fn sync(&self, drive: usize) -> Result<()> {
        let fs = self.volume(drive)?;
        let _guard = fs.lock();
        fs.sync()
    }

    pub fn label_get(&self, drive: usize) -> Result<String> {
        let fs = self.volume(drive)?;
        let _guard = fs.lock();
        fs.label_get()
    }

    pub fn label_set(&self, drive: usize, label: &str) -> Result<()> {
        let fs = self.volume(drive)?;
        let _guard = fs.lock();
        fs.label_set(label)
    }

    pub fn serial(&self, drive: usize) -> Result<u32> {
        Ok(self.volume(drive)?.serial())
    }
}

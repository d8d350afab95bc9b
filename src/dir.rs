//! The directory engine.
//!
//! On disk a directory is a stream of 32-byte records (low address to high):
//!
//! fileA_lde_n
//! fileA_lde_n-1
//! ...
//! fileA_lde_1
//! fileA_sde
//! fileB_lde_n
//! ...
//! fileB_sde
//! ...
//!
//! Long entries precede their short entry in reverse fragment order. While
//! scanning, fragments are accumulated and validated: the first fragment of
//! a set must carry the last-entry flag, orders must decrease by one, every
//! fragment must repeat the same checksum, and that checksum must match the
//! short entry that follows. Any violation orphans the set: the long name
//! is discarded and only the short name is exposed.
//!
//! Short names are formed from the long name by code-page translation and
//! upper-casing. When the translation is lossy (unmappable characters,
//! mixed case, over-long body or extension, characters only long names may
//! carry) the short name gets a `~n` numeric tail that is bumped until it
//! collides with nothing in the directory.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::codepage::{ucs2_upper, OemCodepage};
use crate::entry::{unmask_name0, LongDirEntry, ShortDirEntry};
use crate::time::DateTime;
use crate::vfs::{EntryPos, VirFile, VirFileType};
use crate::{
    contains_non_bmp, is_illegal_in_any_name, is_illegal_in_short_name, long_name_split,
    split_name_ext, Error, Result, DIRENT_SIZE, DIR_ENTRY_E5_SUBSTITUTE, DIR_ENTRY_UNUSED,
    LAST_LONG_ENTRY, LONG_NAME_LEN_CAP, LONG_NAME_MAX, NT_BODY_LOWER, NT_EXT_LOWER,
    NUMERIC_TAIL_MAX, SHORT_NAME_LEN_CAP, SPACE,
};

/// What a caller learns about one directory entry.
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Long name when one is stored, otherwise the short name.
    pub name: String,
    /// The 8.3 name, always present.
    pub alt_name: String,
    pub size: usize,
    pub attr: u8,
    pub is_dir: bool,
    pub first_cluster: u32,
    pub modified: DateTime,
    pub created: DateTime,
    /// Stream offset of the short entry; feed it back to `find_next`.
    pub entry_offset: usize,
}

/// Directory operations of an open directory object.
pub trait Dir {
    /// Walk `path` segment by segment from this directory.
    fn find(&self, path: &[&str]) -> Result<VirFile>;

    /// Create a file or subdirectory in this directory.
    fn create(&self, name: &str, file_type: VirFileType) -> Result<VirFile>;

    /// Names of the entries in this directory.
    fn ls(&self) -> Result<Vec<String>>;

    /// Remove a child by name. Directories must be empty.
    fn remove(&self, name: &str) -> Result<()>;

    /// Move/rename a child of this directory into `new_parent` under
    /// `new_name`.
    fn rename(&self, old_name: &str, new_parent: &VirFile, new_name: &str) -> Result<()>;
}

// Short name formation ----------------------------------------------------

/// Outcome of forming an 8.3 name from a path segment.
pub(crate) struct ShortNameBuild {
    pub name11: [u8; SHORT_NAME_LEN_CAP],
    /// The 8.3 form lost information; a long-name set is required and the
    /// short name needs a numeric tail.
    pub lossy: bool,
    /// NT case hints, meaningful only when not lossy.
    pub nt_hints: u8,
}

fn fold_part(
    part: &str,
    out: &mut [u8],
    cp: &dyn OemCodepage,
    lossy: &mut bool,
) -> (bool, bool) {
    let mut has_lower = false;
    let mut has_upper = false;
    let mut pos = 0usize;
    for ch in part.chars() {
        if is_illegal_in_short_name(ch) {
            *lossy = true;
            continue;
        }
        if ch.is_lowercase() {
            has_lower = true;
        }
        if ch.is_uppercase() {
            has_upper = true;
        }
        if pos >= out.len() {
            *lossy = true;
            break;
        }
        let byte = match cp.unicode_to_oem(ch) {
            Some(byte) => cp.oem_upper(byte),
            None => {
                *lossy = true;
                b'_'
            }
        };
        out[pos] = byte;
        pos += 1;
    }
    (has_lower, has_upper)
}

/// Form the 11-byte OEM short name for `name` (an already validated path
/// segment).
pub(crate) fn short_name_from(name: &str, cp: &dyn OemCodepage) -> Result<ShortNameBuild> {
    let (body, ext) = split_name_ext(name);
    let body = body.trim_end_matches('.');
    if body.is_empty() {
        return Err(Error::InvalidName);
    }

    let mut name11 = [SPACE; SHORT_NAME_LEN_CAP];
    let mut lossy = false;

    let (body_lower, body_upper) = fold_part(body, &mut name11[..8], cp, &mut lossy);
    let (ext_lower, ext_upper) = fold_part(ext, &mut name11[8..], cp, &mut lossy);

    let mut nt_hints = 0u8;
    if body_lower && body_upper {
        lossy = true;
    } else if body_lower {
        nt_hints |= NT_BODY_LOWER;
    }
    if ext_lower && ext_upper {
        lossy = true;
    } else if ext_lower {
        nt_hints |= NT_EXT_LOWER;
    }

    if name11[0] == DIR_ENTRY_UNUSED {
        name11[0] = DIR_ENTRY_E5_SUBSTITUTE;
    }
    // A basis stripped down to nothing is fine for a lossy name (the
    // numeric tail carries it, as in "~1.TXT"); otherwise it is no name.
    if name11[0] == SPACE && !lossy {
        return Err(Error::InvalidName);
    }

    Ok(ShortNameBuild { name11, lossy, nt_hints })
}

/// Squeeze the numeric tail `~n` into the last positions of the 8-byte
/// body.
pub(crate) fn numeric_tail(basis: &[u8; SHORT_NAME_LEN_CAP], n: u32) -> [u8; SHORT_NAME_LEN_CAP] {
    let mut digits = [0u8; 6];
    let mut len = 0usize;
    let mut rest = n;
    while rest > 0 {
        digits[len] = b'0' + (rest % 10) as u8;
        rest /= 10;
        len += 1;
    }
    digits[..len].reverse();

    let mut out = *basis;
    let mut keep = 8 - 1 - len;
    // Do not carry trailing pad spaces into the tail position.
    while keep > 0 && out[keep - 1] == SPACE {
        keep -= 1;
    }
    out[keep] = b'~';
    out[keep + 1..keep + 1 + len].copy_from_slice(&digits[..len]);
    for slot in out.iter_mut().take(8).skip(keep + 1 + len) {
        *slot = SPACE;
    }
    out
}

/// Decode a stored 11-byte short name for display: unmask the leading
/// 0x05, apply the NT lower-case hints, translate through the code page.
pub(crate) fn short_name_display(
    name11: &[u8; SHORT_NAME_LEN_CAP],
    nt_hints: u8,
    cp: &dyn OemCodepage,
) -> String {
    let mut out = String::new();
    let push = |out: &mut String, byte: u8, lower: bool| {
        let ch = cp.oem_to_unicode(byte).unwrap_or('_');
        if lower {
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    };

    let body_len = name11[..8].iter().rposition(|&b| b != SPACE).map_or(0, |i| i + 1);
    for (i, &byte) in name11[..body_len].iter().enumerate() {
        let byte = if i == 0 { unmask_name0(byte) } else { byte };
        push(&mut out, byte, nt_hints & NT_BODY_LOWER != 0);
    }
    let ext_len = name11[8..].iter().rposition(|&b| b != SPACE).map_or(0, |i| i + 1);
    if ext_len > 0 {
        out.push('.');
        for &byte in &name11[8..8 + ext_len] {
            push(&mut out, byte, nt_hints & NT_EXT_LOWER != 0);
        }
    }
    out
}

/// Validate one path segment. Control characters and the characters FAT
/// forbids everywhere are rejected; `.` and `..` are not names.
pub(crate) fn validate_segment(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(Error::InvalidName);
    }
    if name.encode_utf16().count() > LONG_NAME_MAX {
        return Err(Error::InvalidName);
    }
    if name.chars().any(is_illegal_in_any_name) {
        return Err(Error::InvalidName);
    }
    // UCS-2 long entries cannot hold anything beyond the BMP.
    if contains_non_bmp(name) {
        return Err(Error::InvalidName);
    }
    Ok(())
}

// LFN accumulation ---------------------------------------------------------

/// State machine gathering a long-name set while scanning a directory.
struct LfnCollector {
    units: [u16; LONG_NAME_MAX],
    /// Fragment count of the set being collected; 0 when idle.
    total: usize,
    /// Next expected (descending) fragment order.
    expected: usize,
    checksum: u8,
    /// Stream offset of the first fragment on disk.
    start_offset: usize,
}

impl LfnCollector {
    fn new() -> Self {
        Self { units: [0u16; LONG_NAME_MAX], total: 0, expected: 0, checksum: 0, start_offset: 0 }
    }

    fn reset(&mut self) {
        self.total = 0;
        self.expected = 0;
    }

    fn feed(&mut self, lde: &LongDirEntry, offset: usize) {
        if !lde.is_wellformed() {
            self.reset();
            return;
        }
        let order = lde.order_index();
        if lde.is_last_in_set() {
            if order == 0 || order > LONG_NAME_MAX / LONG_NAME_LEN_CAP + 1 {
                self.reset();
                return;
            }
            self.total = order;
            self.expected = order;
            self.checksum = lde.checksum();
            self.start_offset = offset;
        } else if self.total == 0 || order != self.expected || lde.checksum() != self.checksum {
            // Fragment without its set, out of order, or from another set.
            self.reset();
            return;
        }
        let base = (order - 1) * LONG_NAME_LEN_CAP;
        for (i, unit) in lde.name_units().iter().enumerate() {
            if base + i < LONG_NAME_MAX {
                self.units[base + i] = *unit;
            }
        }
        self.expected = order - 1;
    }

    /// The assembled name, if the set is complete and binds to `sde`.
    fn take(&mut self, sde: &ShortDirEntry) -> Option<(String, usize, usize)> {
        if self.total == 0 || self.expected != 0 {
            self.reset();
            return None;
        }
        if self.checksum != sde.checksum() {
            log::warn!("orphaned long-name set (checksum mismatch), exposing 8.3 name");
            self.reset();
            return None;
        }
        let span = self.total * LONG_NAME_LEN_CAP;
        let len = self.units[..span.min(LONG_NAME_MAX)]
            .iter()
            .position(|&u| u == 0x0000)
            .unwrap_or(span.min(LONG_NAME_MAX));
        let name = char::decode_utf16(self.units[..len].iter().copied())
            .map(|r| r.unwrap_or('_'))
            .collect();
        let result = (name, self.total, self.start_offset);
        self.reset();
        Some(result)
    }

    /// Case-folded comparison of the collected units against a target.
    fn matches(&self, target: &[u16]) -> bool {
        let span = (self.total * LONG_NAME_LEN_CAP).min(LONG_NAME_MAX);
        let len = self.units[..span].iter().position(|&u| u == 0x0000).unwrap_or(span);
        if len != target.len() {
            return false;
        }
        self.units[..len]
            .iter()
            .zip(target.iter())
            .all(|(&a, &b)| ucs2_upper(a) == ucs2_upper(b))
    }
}

// Directory scanning -------------------------------------------------------

/// One record pulled out of the entry stream.
enum RawEntry {
    End,
    Deleted,
    Long(LongDirEntry),
    Short(ShortDirEntry),
}

impl VirFile {
    fn read_raw_entry(&self, offset: usize) -> Result<Option<RawEntry>> {
        let mut raw = [0u8; DIRENT_SIZE];
        let read = self.read_at(offset, &mut raw)?;
        if read != DIRENT_SIZE {
            return Ok(None);
        }
        let entry = if raw[0] == 0 {
            RawEntry::End
        } else if raw[0] == DIR_ENTRY_UNUSED {
            RawEntry::Deleted
        } else {
            let sde = ShortDirEntry::new_from_bytes(&raw);
            if sde.is_long_fragment() {
                RawEntry::Long(LongDirEntry::new_from_bytes(&raw))
            } else {
                RawEntry::Short(sde)
            }
        };
        Ok(Some(entry))
    }

    /// On-disk position of the entry at stream `offset`.
    fn entry_pos(&self, offset: usize) -> Result<EntryPos> {
        let layout = &self.fs.layout;
        if self.is_root() && layout.is_fixed_root() {
            if let crate::bpb::RootBase::Fixed { first_sector, .. } = layout.root {
                let ss = layout.bytes_per_sector;
                return Ok(EntryPos::Fixed {
                    sector: first_sector + (offset / ss) as u64,
                    offset: offset % ss,
                });
            }
        }
        let cluster_size = layout.cluster_size();
        let start = self.first_cluster()?;
        let cluster = self.fs.fat.read().get_cluster_at(start, (offset / cluster_size) as u32)?;
        Ok(EntryPos::Chained { cluster, offset: offset % cluster_size })
    }

    /// Identity of this directory for the sharing table: its start
    /// cluster (0 for the fixed root).
    fn dir_ident(&self) -> Result<u32> {
        self.first_cluster()
    }

    fn build_child(
        &self,
        sde: &ShortDirEntry,
        sde_offset: usize,
        long_name: Option<(String, usize, usize)>,
    ) -> Result<VirFile> {
        let cp = &*self.fs.codepage;
        let (name, lde_pos) = match long_name {
            Some((name, fragments, start_offset)) => {
                let mut positions = Vec::with_capacity(fragments);
                for i in 0..fragments {
                    positions.push(self.entry_pos(start_offset + i * DIRENT_SIZE)?);
                }
                (name, positions)
            }
            None => {
                (short_name_display(&sde.name_bytes(), sde.nt_res(), cp), Vec::new())
            }
        };
        Ok(VirFile::new(
            name,
            Arc::clone(&self.fs),
            self.entry_pos(sde_offset)?,
            lde_pos,
            sde.attr(),
            self.dir_ident()?,
            sde_offset,
        ))
    }

    /// Find a child by name. `Ok(None)` when the directory has no such
    /// entry.
    pub fn find_by_name(&self, name: &str) -> Result<Option<VirFile>> {
        if !self.is_dir() {
            return Err(Error::NoPath);
        }
        validate_segment(name)?;
        let cp = &*self.fs.codepage;

        // The two comparison keys: the folded UCS-2 long form, and (when
        // the segment fits 8.3 losslessly) the OEM short form.
        let target_units: Vec<u16> = name.encode_utf16().collect();
        let target_sfn = short_name_from(name, cp).ok().filter(|b| !b.lossy).map(|b| b.name11);

        let mut collector = LfnCollector::new();
        let mut offset = 0usize;
        loop {
            match self.read_raw_entry(offset)? {
                None | Some(RawEntry::End) => return Ok(None),
                Some(RawEntry::Deleted) => collector.reset(),
                Some(RawEntry::Long(lde)) => collector.feed(&lde, offset),
                Some(RawEntry::Short(sde)) => {
                    if sde.is_volume_label() {
                        collector.reset();
                    } else {
                        let complete =
                            collector.total != 0 && collector.expected == 0;
                        let lfn_match = complete
                            && collector.checksum == sde.checksum()
                            && collector.matches(&target_units);
                        let sfn_match = target_sfn
                            .map(|t| t == sde.name_bytes())
                            .unwrap_or(false);
                        if lfn_match || sfn_match {
                            let long = collector.take(&sde);
                            return Ok(Some(self.build_child(&sde, offset, long)?));
                        }
                        collector.reset();
                    }
                }
            }
            offset += DIRENT_SIZE;
        }
    }

    /// Read the entry at or after stream `offset`; the readdir primitive.
    /// Returns the info and the offset to continue from.
    pub fn dir_info(&self, offset: usize) -> Result<Option<(FileInfo, usize)>> {
        if !self.is_dir() {
            return Err(Error::NoPath);
        }
        let cp = &*self.fs.codepage;
        let mut collector = LfnCollector::new();
        let mut offset = offset;
        loop {
            match self.read_raw_entry(offset)? {
                None | Some(RawEntry::End) => return Ok(None),
                Some(RawEntry::Deleted) => collector.reset(),
                Some(RawEntry::Long(lde)) => collector.feed(&lde, offset),
                Some(RawEntry::Short(sde)) => {
                    if sde.is_volume_label() {
                        collector.reset();
                    } else {
                        let alt_name =
                            short_name_display(&sde.name_bytes(), sde.nt_res(), cp);
                        let name = match collector.take(&sde) {
                            Some((long, _, _)) => long,
                            None => alt_name.clone(),
                        };
                        let info = FileInfo {
                            name,
                            alt_name,
                            size: sde.file_size() as usize,
                            attr: sde.attr(),
                            is_dir: sde.is_dir(),
                            first_cluster: sde.first_cluster(),
                            modified: sde.modify_datetime(),
                            created: sde.create_datetime(),
                            entry_offset: offset,
                        };
                        return Ok(Some((info, offset + DIRENT_SIZE)));
                    }
                }
            }
            offset += DIRENT_SIZE;
        }
    }

    /// Iterator over the live entries of this directory.
    pub fn iter(&self) -> DirIter<'_> {
        DirIter { dir: self, offset: 0, done: false }
    }

    // Entry allocation -----------------------------------------------------

    /// Find (or make) `count` consecutive free entry slots and return the
    /// stream offset of the first. Extending past the end of the chain is
    /// handled by the caller's writes; extending the fixed root is
    /// impossible and fails with `Denied`.
    fn alloc_entries(&self, count: usize) -> Result<usize> {
        let mut run_start = 0usize;
        let mut run = 0usize;
        let mut offset = 0usize;
        loop {
            match self.read_raw_entry(offset)? {
                None | Some(RawEntry::End) => {
                    // Everything from here on is free. The fixed root ends
                    // for good; a chained directory grows on write.
                    if run == 0 {
                        run_start = offset;
                    }
                    let end = run_start + count * DIRENT_SIZE;
                    if self.is_root()
                        && self.fs.layout.is_fixed_root()
                        && end > self.file_size()?
                    {
                        return Err(Error::Denied);
                    }
                    return Ok(run_start);
                }
                Some(RawEntry::Deleted) => {
                    if run == 0 {
                        run_start = offset;
                    }
                    run += 1;
                    if run == count {
                        return Ok(run_start);
                    }
                }
                Some(_) => run = 0,
            }
            offset += DIRENT_SIZE;
        }
    }

    /// Whether any live entry stores exactly this short name.
    fn sfn_exists(&self, name11: &[u8; SHORT_NAME_LEN_CAP]) -> Result<bool> {
        let mut offset = 0usize;
        loop {
            match self.read_raw_entry(offset)? {
                None | Some(RawEntry::End) => return Ok(false),
                Some(RawEntry::Short(sde)) if !sde.is_volume_label() => {
                    if sde.name_bytes() == *name11 {
                        return Ok(true);
                    }
                }
                _ => {}
            }
            offset += DIRENT_SIZE;
        }
    }

    /// Pick a short name for a new entry: the exact 8.3 form when it fits,
    /// otherwise the basis with the first free `~n` tail.
    fn unique_short_name(&self, build: &ShortNameBuild) -> Result<([u8; 11], bool)> {
        if !build.lossy {
            return Ok((build.name11, false));
        }
        for n in 1..=NUMERIC_TAIL_MAX {
            let candidate = numeric_tail(&build.name11, n);
            if !self.sfn_exists(&candidate)? {
                return Ok((candidate, true));
            }
        }
        Err(Error::Denied)
    }

    fn is_empty_dir(&self) -> Result<bool> {
        let mut offset = 0usize;
        loop {
            match self.read_raw_entry(offset)? {
                None | Some(RawEntry::End) => return Ok(true),
                Some(RawEntry::Short(sde)) => {
                    let name = sde.name_bytes();
                    let dots = name[0] == b'.';
                    if !dots && !sde.is_volume_label() {
                        return Ok(false);
                    }
                }
                Some(RawEntry::Long(_)) => return Ok(false),
                Some(RawEntry::Deleted) => {}
            }
            offset += DIRENT_SIZE;
        }
    }
}

/// An open directory: the find-first / find-next surface.
///
/// Holds a read lease in the sharing table (except for the root, which has
/// no entry to lease), so the directory cannot be removed or renamed while
/// it is being iterated.
pub struct DirHandle {
    dir: VirFile,
    offset: usize,
    _lock: Option<crate::flock::LockSlot>,
}

impl DirHandle {
    pub(crate) fn open(dir: VirFile) -> Result<Self> {
        dir.check_valid()?;
        if !dir.is_dir() {
            return Err(Error::NoPath);
        }
        let lock = if dir.is_root() {
            None
        } else {
            Some(crate::flock::enter(
                dir.fs_handle().mount_id,
                dir.parent_cluster,
                dir.dir_offset as u32,
                crate::flock::LockMode::Read,
            )?)
        };
        Ok(Self { dir, offset: 0, _lock: lock })
    }

    /// The next live entry, `None` at the end of the directory.
    pub fn read_next(&mut self) -> Result<Option<FileInfo>> {
        self.dir.check_valid()?;
        match self.dir.dir_info(self.offset)? {
            Some((info, next)) => {
                self.offset = next;
                Ok(Some(info))
            }
            None => Ok(None),
        }
    }

    /// Restart iteration at the first entry.
    pub fn rewind(&mut self) {
        self.offset = 0;
    }

    /// The underlying directory object.
    pub fn as_dir(&self) -> &VirFile {
        &self.dir
    }
}

/// Iterator over directory entries, yielding [`FileInfo`].
pub struct DirIter<'a> {
    dir: &'a VirFile,
    offset: usize,
    done: bool,
}

impl Iterator for DirIter<'_> {
    type Item = Result<FileInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.dir.dir_info(self.offset) {
            Ok(Some((info, next))) => {
                self.offset = next;
                Some(Ok(info))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

impl Dir for VirFile {
    fn find(&self, path: &[&str]) -> Result<VirFile> {
        self.check_valid()?;
        let mut current = self.clone();
        for (i, segment) in path.iter().enumerate() {
            let segment = segment.trim();
            if segment.is_empty() || segment == "." {
                continue;
            }
            if !current.is_dir() {
                return Err(Error::NoPath);
            }
            let next = match segment {
                ".." => current.parent()?,
                _ => match current.find_by_name(segment)? {
                    Some(next) => next,
                    None => {
                        // A missing interior segment is a missing path; a
                        // missing final segment is a missing file.
                        return if i + 1 == path.len() {
                            Err(Error::NoFile)
                        } else {
                            Err(Error::NoPath)
                        };
                    }
                },
            };
            current = next;
        }
        Ok(current)
    }

    fn create(&self, name: &str, file_type: VirFileType) -> Result<VirFile> {
        self.check_valid()?;
        self.fs.check_writable()?;
        if !self.is_dir() {
            return Err(Error::NoPath);
        }
        let name = name.trim();
        validate_segment(name)?;
        if self.find_by_name(name)?.is_some() {
            return Err(Error::Exist);
        }

        let cp = &*self.fs.codepage;
        let build = short_name_from(name, cp)?;
        let (name11, with_lfn) = self.unique_short_name(&build)?;

        let now = self.fs.clock.now();
        let attr = file_type as u8;
        let mut sde = ShortDirEntry::new(&name11, attr, 0);
        if !with_lfn {
            sde.set_nt_res(build.nt_hints);
        }
        sde.set_create_datetime(now);
        sde.set_modify_datetime(now);

        let slots = if with_lfn {
            crate::long_entry_count(name) + 1
        } else {
            1
        };
        let mut offset = self.alloc_entries(slots)?;

        if with_lfn {
            let checksum = sde.checksum();
            let mut fragments = long_name_split(name);
            let total = fragments.len();
            // Highest fragment first on disk, flagged as last in set.
            for index in 0..total {
                let order = (total - index) as u8;
                let order = if index == 0 { order | LAST_LONG_ENTRY } else { order };
                let lde = LongDirEntry::new(
                    order,
                    fragments.pop().expect("fragment count"),
                    checksum,
                );
                let written = self.write_at(offset, lde.as_bytes())?;
                if written != DIRENT_SIZE {
                    return Err(Error::Denied);
                }
                offset += DIRENT_SIZE;
            }
        }
        let written = self.write_at(offset, sde.as_bytes())?;
        if written != DIRENT_SIZE {
            return Err(Error::Denied);
        }

        let file = self
            .find_by_name(name)?
            .ok_or(Error::IntErr)?;

        if file_type == VirFileType::Dir {
            // Allocate the first cluster, then drop in `.` and `..`.
            file.increase_size(2 * DIRENT_SIZE)?;
            let own = file.first_cluster()?;
            // `..` points at the parent, 0 when the parent is the root
            // (even on FAT32).
            let parent_cluster = if self.is_root() { 0 } else { self.first_cluster()? };

            let mut dot = ShortDirEntry::dot_entry(1, own);
            dot.set_create_datetime(now);
            dot.set_modify_datetime(now);
            let mut dotdot = ShortDirEntry::dot_entry(2, parent_cluster);
            dotdot.set_create_datetime(now);
            dotdot.set_modify_datetime(now);

            file.write_at(0, dot.as_bytes())?;
            file.write_at(DIRENT_SIZE, dotdot.as_bytes())?;
        }

        Ok(file)
    }

    fn ls(&self) -> Result<Vec<String>> {
        self.check_valid()?;
        let mut names = Vec::new();
        for info in self.iter() {
            names.push(info?.name);
        }
        Ok(names)
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.check_valid()?;
        self.fs.check_writable()?;
        let file = self.find_by_name(name.trim())?.ok_or(Error::NoFile)?;
        if file.is_dir() && !file.is_empty_dir()? {
            return Err(Error::Denied);
        }
        crate::flock::check(
            self.fs.mount_id,
            file.parent_cluster,
            file.dir_offset as u32,
            crate::flock::LockMode::Write,
        )?;
        file.clear()?;
        Ok(())
    }

    fn rename(&self, old_name: &str, new_parent: &VirFile, new_name: &str) -> Result<()> {
        self.check_valid()?;
        new_parent.check_valid()?;
        self.fs.check_writable()?;
        if !core::ptr::eq(Arc::as_ptr(&self.fs), Arc::as_ptr(&new_parent.fs)) {
            return Err(Error::InvalidParameter);
        }

        let old = self.find_by_name(old_name.trim())?.ok_or(Error::NoFile)?;
        crate::flock::check(
            self.fs.mount_id,
            old.parent_cluster,
            old.dir_offset as u32,
            crate::flock::LockMode::Write,
        )?;
        let new_name = new_name.trim();
        if new_parent.find_by_name(new_name)?.is_some() {
            return Err(Error::Exist);
        }

        // Snapshot the payload of the old entry.
        let snapshot = old.read_sde(|sde| *sde)?;

        let created = new_parent.create(
            new_name,
            if old.is_dir() { VirFileType::Dir } else { VirFileType::File },
        )?;
        // A fresh directory got a dot/dotdot cluster it must not keep.
        if old.is_dir() {
            let bootstrap = created.first_cluster()?;
            if bootstrap != 0 {
                self.fs.dealloc_chain(bootstrap, 0)?;
            }
        }
        created.modify_sde(|sde| {
            sde.set_first_cluster(snapshot.first_cluster());
            sde.set_file_size(snapshot.file_size());
            sde.set_attr(snapshot.attr());
        })?;

        // Re-point `..` when a directory changed parents.
        if old.is_dir() {
            let parent_cluster =
                if new_parent.is_root() { 0 } else { new_parent.first_cluster()? };
            let moved = new_parent.find_by_name(new_name)?.ok_or(Error::IntErr)?;
            let mut dotdot = ShortDirEntry::dot_entry(2, parent_cluster);
            dotdot.set_modify_datetime(self.fs.clock.now());
            moved.write_at(DIRENT_SIZE, dotdot.as_bytes())?;
        }

        // Drop the old entries without touching the (re-homed) chain.
        for index in 0..old.lde_pos.len() {
            old.modify_lde(index, |lde| lde.delete())?;
        }
        old.modify_sde(|sde| sde.delete())?;
        Ok(())
    }
}

impl VirFile {
    /// The parent directory of this object, via the `..` entry.
    pub fn parent(&self) -> Result<VirFile> {
        if self.is_root() {
            return Ok(self.clone());
        }
        let root = crate::vfs::root(Arc::clone(&self.fs));
        if self.parent_cluster == 0 || self.parent_cluster == self.fs.layout.root_cluster() {
            return Ok(root);
        }
        // Walk down from the root looking for the directory whose start
        // cluster is our recorded parent.
        root.find_dir_by_cluster(self.parent_cluster)
    }

    fn find_dir_by_cluster(&self, cluster: u32) -> Result<VirFile> {
        let mut stack = alloc::vec![self.clone()];
        while let Some(dir) = stack.pop() {
            let mut offset = 0usize;
            while let Some((info, next)) = dir.dir_info(offset)? {
                offset = next;
                if !info.is_dir || info.name == "." || info.name == ".." {
                    continue;
                }
                let child = dir.find_by_name(&info.name)?.ok_or(Error::IntErr)?;
                if info.first_cluster == cluster {
                    return Ok(child);
                }
                stack.push(child);
            }
        }
        Err(Error::NoPath)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codepage::Cp437;

    #[test]
    fn exact_fit_names_are_not_lossy() {
        let build = short_name_from("README.TXT", &Cp437).unwrap();
        assert!(!build.lossy);
        assert_eq!(&build.name11, b"README  TXT");
        assert_eq!(build.nt_hints, 0);
    }

    #[test]
    fn lower_case_fits_via_nt_hints() {
        let build = short_name_from("hello.txt", &Cp437).unwrap();
        assert!(!build.lossy);
        assert_eq!(&build.name11, b"HELLO   TXT");
        assert_eq!(build.nt_hints, NT_BODY_LOWER | NT_EXT_LOWER);
    }

    #[test]
    fn mixed_case_and_length_force_lossy() {
        assert!(short_name_from("MixedCase.txt", &Cp437).unwrap().lossy);
        assert!(short_name_from("longerthan8.txt", &Cp437).unwrap().lossy);
        assert!(short_name_from("two.dots.txt", &Cp437).unwrap().lossy);
        assert!(short_name_from("spaced out", &Cp437).unwrap().lossy);
    }

    #[test]
    fn numeric_tail_lands_at_the_end_of_the_body() {
        let build = short_name_from("Greetings-from-ChaN.txt", &Cp437).unwrap();
        assert!(build.lossy);
        assert_eq!(&numeric_tail(&build.name11, 1), b"GREETI~1TXT");
        assert_eq!(&numeric_tail(&build.name11, 12), b"GREET~12TXT");
        assert_eq!(&numeric_tail(&build.name11, 999_999), b"G~999999TXT");
    }

    #[test]
    fn tail_respects_short_bases() {
        let build = short_name_from("ab cd.x", &Cp437).unwrap();
        assert!(build.lossy);
        // Basis "ABCD" (space stripped), tail directly after it.
        assert_eq!(&numeric_tail(&build.name11, 3), b"ABCD~3  X  ");
    }

    #[test]
    fn display_round_trips_hints() {
        let build = short_name_from("hello.txt", &Cp437).unwrap();
        assert_eq!(
            short_name_display(&build.name11, build.nt_hints, &Cp437),
            "hello.txt"
        );
        assert_eq!(short_name_display(&build.name11, 0, &Cp437), "HELLO.TXT");
    }

    #[test]
    fn segments_are_validated() {
        assert!(validate_segment("ok name.txt").is_ok());
        assert!(validate_segment("").is_err());
        assert!(validate_segment("..").is_err());
        assert!(validate_segment("what?").is_err());
        assert!(validate_segment("pipe|pipe").is_err());
        assert!(validate_segment("emoji\u{1F980}").is_err());
    }
}

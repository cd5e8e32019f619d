//! Drive trait - the operation set every DOS drive serves.

use std::io::SeekFrom;
use std::time::SystemTime;

use bitflags::bitflags;
use chrono::{DateTime, Datelike, Local, Timelike};

use super::dir_cache::SearchId;
use crate::error::{DosError, DosResult};

bitflags! {
    /// FAT directory entry attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FatAttributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;
        const DEVICE = 0x40;
    }
}

impl FatAttributes {
    /// Whether a search with `search` attributes may report an entry
    /// carrying `found`. Directories, hidden and system entries need to
    /// be asked for explicitly.
    pub fn admits(self, found: FatAttributes) -> bool {
        let special = FatAttributes::DIRECTORY | FatAttributes::HIDDEN | FatAttributes::SYSTEM;
        (!self & found & special).is_empty()
    }
}

/// Access mode of an open file, taken from the low nibble of the DOS
/// open mode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read = 0,
    Write = 1,
    ReadWrite = 2,
    /// Read access that must never modify the file.
    ReadNoModify = 4,
}

impl OpenMode {
    pub fn can_read(self) -> bool {
        !matches!(self, OpenMode::Write)
    }

    pub fn can_write(self) -> bool {
        matches!(self, OpenMode::Write | OpenMode::ReadWrite)
    }
}

impl TryFrom<u8> for OpenMode {
    type Error = DosError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value & 0x0f {
            0 => Ok(OpenMode::Read),
            1 => Ok(OpenMode::Write),
            2 => Ok(OpenMode::ReadWrite),
            4 => Ok(OpenMode::ReadNoModify),
            _ => Err(DosError::InvalidAccessMode(value)),
        }
    }
}

/// Packed FAT date and time.
pub fn pack_dos_datetime(time: SystemTime) -> (u16, u16) {
    let local: DateTime<Local> = time.into();
    let year = local.year().clamp(1980, 2107) as u16;
    let date = ((year - 1980) << 9) | ((local.month() as u16) << 5) | local.day() as u16;
    let time = ((local.hour() as u16) << 11) | ((local.minute() as u16) << 5) | (local.second() as u16 / 2);
    (date, time)
}

/// One entry reported by a directory search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindEntry {
    pub name: String,
    pub size: u32,
    pub date: u16,
    pub time: u16,
    pub attributes: FatAttributes,
}

/// Size, timestamp and attributes of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub date: u16,
    pub time: u16,
    pub attributes: FatAttributes,
}

/// Free-space geometry a drive reports to DOS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationInfo {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub total_clusters: u16,
    pub free_clusters: u16,
}

impl AllocationInfo {
    pub fn free_bytes(&self) -> u64 {
        self.free_clusters as u64 * self.sectors_per_cluster as u64 * self.bytes_per_sector as u64
    }
}

#[derive(Debug)]
pub(crate) enum SearchState {
    /// Walking a directory cache session.
    Cached(SearchId),
    /// Entries computed up front.
    Listing(std::collections::VecDeque<FindEntry>),
    Done,
}

/// State of a find-first/find-next sequence.
#[derive(Debug)]
pub struct SearchHandle {
    pub(crate) dir: String,
    pub(crate) pattern: String,
    pub(crate) attributes: FatAttributes,
    pub(crate) state: SearchState,
    /// Volume label reported before any directory entry.
    pub(crate) label: Option<FindEntry>,
}

impl SearchHandle {
    pub(crate) fn new(dir: &str, pattern: &str, attributes: FatAttributes, state: SearchState) -> Self {
        Self {
            dir: dir.to_string(),
            pattern: pattern.to_string(),
            attributes,
            state,
            label: None,
        }
    }

    /// Directory being searched, drive-relative.
    pub fn dir(&self) -> &str {
        &self.dir
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

/// Volume label search result.
pub(crate) fn label_entry(label: &str) -> FindEntry {
    let (date, time) = pack_dos_datetime(SystemTime::now());
    FindEntry {
        name: label.to_string(),
        size: 0,
        date,
        time,
        attributes: FatAttributes::VOLUME,
    }
}

/// An open file on a drive.
pub trait DosFile: Send {
    /// Drive-relative DOS name the file was opened under.
    fn name(&self) -> &str;

    fn mode(&self) -> OpenMode;

    /// Read up to `buf.len()` bytes; fewer only at end of file.
    fn read(&mut self, buf: &mut [u8]) -> DosResult<usize>;

    /// Write `data` at the current position. An empty write truncates
    /// the file there.
    fn write(&mut self, data: &[u8]) -> DosResult<usize>;

    fn seek(&mut self, pos: SeekFrom) -> DosResult<u64>;

    fn size(&mut self) -> DosResult<u64>;

    fn flush(&mut self) -> DosResult<()> {
        Ok(())
    }
}

/// Operations every mounted DOS drive serves.
///
/// All paths are drive-relative DOS paths (`DIR\FILE.EXT`); drives accept
/// either separator and any case.
pub trait Drive: Send + Sync {
    /// Human-readable description of the backing store.
    fn info(&self) -> String;

    fn open(&mut self, name: &str, mode: OpenMode) -> DosResult<Box<dyn DosFile>>;

    /// Create or truncate a file for writing.
    fn create(&mut self, name: &str, attributes: FatAttributes) -> DosResult<Box<dyn DosFile>>;

    fn unlink(&mut self, name: &str) -> DosResult<()>;

    fn make_directory(&mut self, dir: &str) -> DosResult<()>;

    fn remove_directory(&mut self, dir: &str) -> DosResult<()>;

    fn test_directory(&mut self, dir: &str) -> bool;

    /// Start a search. `pattern` is a path whose last component may hold
    /// wildcards.
    fn find_first(&mut self, pattern: &str, attributes: FatAttributes) -> DosResult<SearchHandle>;

    /// Next match, `None` once the search is exhausted.
    fn find_next(&mut self, handle: &mut SearchHandle) -> Option<FindEntry>;

    fn get_attributes(&mut self, name: &str) -> DosResult<FatAttributes>;

    fn set_attributes(&mut self, name: &str, attributes: FatAttributes) -> DosResult<()>;

    fn rename(&mut self, old: &str, new: &str) -> DosResult<()>;

    fn file_exists(&mut self, name: &str) -> bool;

    fn file_stat(&mut self, name: &str) -> DosResult<FileStat>;

    fn allocation_info(&self) -> AllocationInfo;

    fn media_id(&self) -> u8;

    fn label(&self) -> String;

    /// Drop cached host state.
    fn empty_cache(&mut self) {}

    fn is_removable(&self) -> bool {
        false
    }

    /// Read a whole file.
    fn read_file(&mut self, name: &str) -> DosResult<Vec<u8>> {
        let mut file = self.open(name, OpenMode::Read)?;
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
        }
        Ok(data)
    }

    /// Create a file holding `data`.
    fn write_file(&mut self, name: &str, data: &[u8]) -> DosResult<()> {
        let mut file = self.create(name, FatAttributes::ARCHIVE)?;
        file.write(data)?;
        file.flush()
    }

    /// Run a search to completion.
    fn list(&mut self, pattern: &str, attributes: FatAttributes) -> DosResult<Vec<FindEntry>> {
        let mut handle = self.find_first(pattern, attributes)?;
        let mut entries = Vec::new();
        while let Some(entry) = self.find_next(&mut handle) {
            entries.push(entry);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_open_mode_from_byte() {
        assert_eq!(OpenMode::try_from(0x00).unwrap(), OpenMode::Read);
        assert_eq!(OpenMode::try_from(0x42).unwrap(), OpenMode::ReadWrite);
        assert_eq!(OpenMode::try_from(0x04).unwrap(), OpenMode::ReadNoModify);
        assert!(matches!(OpenMode::try_from(0x03), Err(DosError::InvalidAccessMode(3))));
        assert!(OpenMode::Write.can_write());
        assert!(!OpenMode::Write.can_read());
        assert!(!OpenMode::ReadNoModify.can_write());
    }

    #[test]
    fn test_attribute_filter() {
        let plain = FatAttributes::ARCHIVE;
        assert!(plain.admits(FatAttributes::ARCHIVE));
        assert!(!plain.admits(FatAttributes::DIRECTORY));
        assert!((plain | FatAttributes::DIRECTORY).admits(FatAttributes::DIRECTORY));
        assert!(!plain.admits(FatAttributes::HIDDEN | FatAttributes::ARCHIVE));
    }

    #[test]
    fn test_pack_dos_datetime() {
        let when = Local.with_ymd_and_hms(1995, 8, 24, 13, 45, 30).unwrap();
        let (date, time) = pack_dos_datetime(when.into());
        assert_eq!(date, (15 << 9) | (8 << 5) | 24);
        assert_eq!(time, (13 << 11) | (45 << 5) | 15);
    }
}

//! Drive backed by a host directory.

use std::fs::{self, Metadata, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::dir_cache::{DirectoryCache, SortOrder};
use super::drive::{
    label_entry, pack_dos_datetime, AllocationInfo, DosFile, Drive, FatAttributes, FileStat, FindEntry,
    OpenMode, SearchHandle, SearchState,
};
use super::file::HostFile;
use super::names::{format_label, join_dos, normalize_dos_path, split_parent, wild_file_cmp};
use crate::error::{DosError, DosResult};

/// Kind of medium a local drive presents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    HardDisk,
    Floppy,
    CdRom,
}

impl MediaKind {
    pub fn media_id(self) -> u8 {
        match self {
            MediaKind::Floppy => 0xF0,
            MediaKind::HardDisk | MediaKind::CdRom => 0xF8,
        }
    }

    /// Geometry reported when the mount does not override it.
    pub fn default_allocation(self) -> AllocationInfo {
        match self {
            MediaKind::HardDisk => hard_disk_allocation(250),
            MediaKind::Floppy => AllocationInfo {
                bytes_per_sector: 512,
                sectors_per_cluster: 1,
                total_clusters: 2880,
                free_clusters: 2880,
            },
            MediaKind::CdRom => AllocationInfo {
                bytes_per_sector: 2048,
                sectors_per_cluster: 1,
                total_clusters: 65535,
                free_clusters: 0,
            },
        }
    }
}

/// Hard disk geometry with roughly `free_mb` megabytes free.
pub fn hard_disk_allocation(free_mb: u32) -> AllocationInfo {
    let cluster_bytes = 512u64 * 32;
    let free = (free_mb as u64 * 1024 * 1024 / cluster_bytes).min(32765) as u16;
    AllocationInfo {
        bytes_per_sector: 512,
        sectors_per_cluster: 32,
        total_clusters: 32765,
        free_clusters: free,
    }
}

/// Map a host error for a path whose parent may be missing.
pub(crate) fn path_error(err: io::Error, name: &str) -> DosError {
    if err.kind() == io::ErrorKind::NotFound {
        DosError::PathNotFound(name.to_string())
    } else {
        DosError::from_host(err, name)
    }
}

pub(crate) fn stat_from_metadata(meta: &Metadata) -> FileStat {
    let mut attributes = if meta.is_dir() {
        FatAttributes::DIRECTORY
    } else {
        FatAttributes::ARCHIVE
    };
    if !meta.is_dir() && meta.permissions().readonly() {
        attributes |= FatAttributes::READ_ONLY;
    }
    let (date, time) = meta.modified().map(pack_dos_datetime).unwrap_or((0, 0));
    FileStat {
        size: if meta.is_dir() { 0 } else { meta.len() },
        date,
        time,
        attributes,
    }
}

fn find_entry(name: &str, stat: &FileStat) -> FindEntry {
    FindEntry {
        name: name.to_string(),
        size: stat.size.min(u32::MAX as u64) as u32,
        date: stat.date,
        time: stat.time,
        attributes: stat.attributes,
    }
}

/// A host directory presented as a DOS drive.
pub struct LocalDrive {
    cache: DirectoryCache,
    media: MediaKind,
    allocation: AllocationInfo,
    label: String,
    label_locked: bool,
}

impl LocalDrive {
    /// Create a drive over an existing host directory.
    pub fn new(base_dir: impl Into<PathBuf>, media: MediaKind) -> Self {
        Self {
            cache: DirectoryCache::new(base_dir),
            media,
            allocation: media.default_allocation(),
            label: String::new(),
            label_locked: false,
        }
    }

    pub fn with_allocation(mut self, allocation: AllocationInfo) -> Self {
        self.allocation = allocation;
        self
    }

    /// Set the label given at mount time and lock it.
    pub fn with_label(mut self, label: &str) -> Self {
        self.set_label(label);
        self.label_locked = true;
        self
    }

    pub fn with_session_limit(mut self, limit: usize) -> Self {
        self.cache = self.cache.with_session_limit(limit);
        self
    }

    /// Change the volume label; returns false if it is locked.
    pub fn set_label(&mut self, label: &str) -> bool {
        if self.label_locked {
            debug!(label, "volume label is locked");
            return false;
        }
        self.label = format_label(label, self.media == MediaKind::CdRom);
        debug!(label = %self.label, "set volume label");
        true
    }

    pub fn set_sort_order(&mut self, order: SortOrder) {
        self.cache.set_sort_order(order);
    }

    pub fn base_dir(&self) -> &Path {
        self.cache.base_dir()
    }

    pub fn media(&self) -> MediaKind {
        self.media
    }

    pub(crate) fn cache_mut(&mut self) -> &mut DirectoryCache {
        &mut self.cache
    }

    /// Host path a DOS path resolves to.
    pub fn host_path(&mut self, name: &str) -> DosResult<PathBuf> {
        let path = normalize_dos_path(name)?;
        self.cache.expand_name(&path)
    }

    fn check_writable(&self, name: &str) -> DosResult<()> {
        if self.media == MediaKind::CdRom {
            return Err(DosError::AccessDenied(name.to_string()));
        }
        Ok(())
    }

    /// Start a cache-backed search over `dir`.
    pub(crate) fn begin_search(
        &mut self,
        dir: &str,
        pattern: &str,
        attributes: FatAttributes,
    ) -> DosResult<SearchHandle> {
        let cdrom = self.media == MediaKind::CdRom;
        if attributes == FatAttributes::VOLUME {
            let mut handle = SearchHandle::new(dir, pattern, attributes, SearchState::Done);
            if !self.label.is_empty() || cdrom {
                handle.label = Some(label_entry(&self.label));
            }
            return Ok(handle);
        }

        let id = self.cache.open_directory(dir)?;
        let mut handle = SearchHandle::new(dir, pattern, attributes, SearchState::Cached(id));
        if attributes.contains(FatAttributes::VOLUME)
            && dir.is_empty()
            && !self.label.is_empty()
            && wild_file_cmp(&self.label, pattern)
        {
            handle.label = Some(label_entry(&self.label));
        }
        Ok(handle)
    }

    /// Next search match, with `stat` deciding what each entry looks like.
    ///
    /// `stat` gets the entry's DOS path and its host path under this
    /// drive; returning `None` skips the entry.
    pub(crate) fn next_match<F>(&mut self, handle: &mut SearchHandle, mut stat: F) -> Option<FindEntry>
    where
        F: FnMut(&str, &Path) -> Option<FileStat>,
    {
        if let Some(label) = handle.label.take() {
            return Some(label);
        }
        let SearchState::Cached(id) = &handle.state else {
            return None;
        };
        let id = *id;
        let host_dir = self.cache.expand_name(&handle.dir).ok()?;
        loop {
            let Some(item) = self.cache.read_next(id) else {
                handle.state = SearchState::Done;
                return None;
            };
            if !wild_file_cmp(&item.short_name, &handle.pattern) {
                continue;
            }
            let dos_path = join_dos(&handle.dir, &item.short_name);
            let Some(found) = stat(&dos_path, &host_dir.join(&item.long_name)) else {
                continue;
            };
            if !handle.attributes.admits(found.attributes) {
                continue;
            }
            return Some(find_entry(&item.short_name, &found));
        }
    }
}

fn stat_host(media: MediaKind, path: &Path) -> Option<FileStat> {
    let mut stat = stat_from_metadata(&fs::metadata(path).ok()?);
    if media == MediaKind::CdRom && !stat.attributes.contains(FatAttributes::DIRECTORY) {
        stat.attributes |= FatAttributes::READ_ONLY;
    }
    Some(stat)
}

impl Drive for LocalDrive {
    fn info(&self) -> String {
        let kind = match self.media {
            MediaKind::HardDisk => "local directory",
            MediaKind::Floppy => "floppy directory",
            MediaKind::CdRom => "CD-ROM directory",
        };
        format!("{} {}", kind, self.base_dir().display())
    }

    fn open(&mut self, name: &str, mode: OpenMode) -> DosResult<Box<dyn DosFile>> {
        let path = normalize_dos_path(name)?;
        if mode.can_write() {
            self.check_writable(&path)?;
        }
        let host = self.cache.expand_name(&path)?;
        if host.is_dir() {
            return Err(DosError::NotFound(path));
        }
        let file = OpenOptions::new()
            .read(mode.can_read())
            .write(mode.can_write())
            .open(&host)
            .map_err(|e| DosError::from_host(e, &path))?;
        debug!(file = %path, host = %host.display(), ?mode, "opened file");
        Ok(Box::new(HostFile::new(&path, file, mode)))
    }

    fn create(&mut self, name: &str, attributes: FatAttributes) -> DosResult<Box<dyn DosFile>> {
        let path = normalize_dos_path(name)?;
        self.check_writable(&path)?;
        let host = self.cache.expand_name(&path)?;
        let existed = host.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&host)
            .map_err(|e| path_error(e, &path))?;
        if !existed {
            self.cache.add_entry(&path, true)?;
        }
        debug!(file = %path, ?attributes, "created file");
        Ok(Box::new(HostFile::new(&path, file, OpenMode::ReadWrite)))
    }

    fn unlink(&mut self, name: &str) -> DosResult<()> {
        let path = normalize_dos_path(name)?;
        self.check_writable(&path)?;
        let host = self.cache.expand_name(&path)?;
        if host.is_dir() {
            return Err(DosError::AccessDenied(path));
        }
        fs::remove_file(&host).map_err(|e| DosError::from_host(e, &path))?;
        self.cache.delete_entry(&path, true)?;
        debug!(file = %path, "deleted file");
        Ok(())
    }

    fn make_directory(&mut self, dir: &str) -> DosResult<()> {
        let path = normalize_dos_path(dir)?;
        self.check_writable(&path)?;
        let host = self.cache.expand_name(&path)?;
        fs::create_dir(&host).map_err(|e| path_error(e, &path))?;
        self.cache.delete_entry(&path, true)?;
        debug!(dir = %path, "created directory");
        Ok(())
    }

    fn remove_directory(&mut self, dir: &str) -> DosResult<()> {
        let path = normalize_dos_path(dir)?;
        self.check_writable(&path)?;
        if path.is_empty() {
            return Err(DosError::AccessDenied(path));
        }
        let host = self.cache.expand_name(&path)?;
        if !host.is_dir() {
            return Err(DosError::PathNotFound(path));
        }
        // Not empty, or in use
        fs::remove_dir(&host).map_err(|_| DosError::AccessDenied(path.clone()))?;
        self.cache.delete_entry(&path, true)?;
        debug!(dir = %path, "removed directory");
        Ok(())
    }

    fn test_directory(&mut self, dir: &str) -> bool {
        match normalize_dos_path(dir) {
            Ok(path) => self.cache.is_directory(&path).unwrap_or(false),
            Err(_) => false,
        }
    }

    fn find_first(&mut self, pattern: &str, attributes: FatAttributes) -> DosResult<SearchHandle> {
        let path = normalize_dos_path(pattern)?;
        let (dir, wild) = split_parent(&path);
        let wild = if wild.is_empty() { "*.*" } else { wild };
        if self.media == MediaKind::Floppy {
            // Disks may have been swapped behind our back
            self.cache.empty_cache();
        }
        self.begin_search(dir, wild, attributes)
    }

    fn find_next(&mut self, handle: &mut SearchHandle) -> Option<FindEntry> {
        let media = self.media;
        self.next_match(handle, |_, host| stat_host(media, host))
    }

    fn get_attributes(&mut self, name: &str) -> DosResult<FatAttributes> {
        Ok(self.file_stat(name)?.attributes)
    }

    fn set_attributes(&mut self, name: &str, attributes: FatAttributes) -> DosResult<()> {
        let path = normalize_dos_path(name)?;
        self.check_writable(&path)?;
        let host = self.cache.expand_name(&path)?;
        let meta = fs::metadata(&host).map_err(|e| DosError::from_host(e, &path))?;
        if meta.is_dir() {
            return Ok(());
        }
        let mut permissions = meta.permissions();
        permissions.set_readonly(attributes.contains(FatAttributes::READ_ONLY));
        fs::set_permissions(&host, permissions).map_err(|e| DosError::from_host(e, &path))?;
        Ok(())
    }

    fn rename(&mut self, old: &str, new: &str) -> DosResult<()> {
        let old_path = normalize_dos_path(old)?;
        let new_path = normalize_dos_path(new)?;
        self.check_writable(&old_path)?;
        let from = self.cache.expand_name(&old_path)?;
        let to = self.cache.expand_name(&new_path)?;
        if from != to && to.exists() {
            return Err(DosError::AlreadyExists(new_path));
        }
        fs::rename(&from, &to).map_err(|e| DosError::from_host(e, &old_path))?;
        self.cache.delete_entry(&old_path, true)?;
        self.cache.delete_entry(&new_path, true)?;
        info!(from = %old_path, to = %new_path, "renamed");
        Ok(())
    }

    fn file_exists(&mut self, name: &str) -> bool {
        self.host_path(name).map(|host| host.is_file()).unwrap_or(false)
    }

    fn file_stat(&mut self, name: &str) -> DosResult<FileStat> {
        let path = normalize_dos_path(name)?;
        let host = self.cache.expand_name(&path)?;
        stat_host(self.media, &host).ok_or(DosError::NotFound(path))
    }

    fn allocation_info(&self) -> AllocationInfo {
        self.allocation
    }

    fn media_id(&self) -> u8 {
        self.media.media_id()
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    fn empty_cache(&mut self) {
        self.cache.empty_cache();
    }

    fn is_removable(&self) -> bool {
        self.media != MediaKind::HardDisk
    }
}

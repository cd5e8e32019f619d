//! Copy-on-write overlay over a local drive.
//!
//! - Reads come from the overlay directory first, then fall back to the base
//! - Writes go to the overlay only (the base is never modified)
//! - Deletes of base files are recorded as tombstones
//!
//! Tombstones are persisted as marker files inside the overlay directory,
//! next to where the deleted entry would live:
//! `DIR\DBOVERLAY_DEL_FILE.EXT` for a file, `DBOVERLAY_RMD_DIR` for a
//! directory. Mounting the same overlay again rebuilds them from a scan.

use std::collections::{BTreeSet, HashSet};
use std::fs::{self, File, OpenOptions};
use std::path::{Component, Path, PathBuf};

use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use super::drive::{AllocationInfo, DosFile, Drive, FatAttributes, FileStat, FindEntry, OpenMode, SearchHandle};
use super::file::HostFile;
use super::local_drive::{path_error, stat_from_metadata, LocalDrive, MediaKind};
use super::names::{join_dos, normalize_dos_path, split_parent};
use crate::error::{DosError, DosResult};

/// Marker file prefix.
pub const OVERLAY_PREFIX: &str = "DBOVERLAY";

const MARKER_CONTENTS: &[u8] = b"empty";

/// Tombstone kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tombstone {
    File,
    Directory,
}

impl Tombstone {
    fn tag(self) -> &'static str {
        match self {
            Tombstone::File => "DEL",
            Tombstone::Directory => "RMD",
        }
    }
}

fn is_marker_name(name: &str) -> bool {
    name.len() > OVERLAY_PREFIX.len() + 5 && name.starts_with(OVERLAY_PREFIX)
}

/// Tombstone for a marker at `rel` (DOS path inside the overlay).
fn parse_marker(rel: &str) -> Option<(Tombstone, String)> {
    let (dir, name) = split_parent(rel);
    let rest = name.strip_prefix(OVERLAY_PREFIX)?.strip_prefix('_')?;
    let kind = match rest.get(..3)? {
        "DEL" => Tombstone::File,
        "RMD" => Tombstone::Directory,
        _ => return None,
    };
    let target = rest.get(3..)?.strip_prefix('_')?;
    if target.is_empty() {
        return None;
    }
    Some((kind, join_dos(dir, target)))
}

/// Host path under `root` for a DOS path.
fn host_join(root: &Path, dos: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for component in dos.split('\\').filter(|c| !c.is_empty()) {
        path.push(component);
    }
    path
}

/// Host-relative path as a DOS path; `None` if not valid UTF-8.
fn dos_relative(rel: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in rel.components() {
        if let Component::Normal(part) = component {
            parts.push(part.to_str()?.to_ascii_uppercase());
        }
    }
    Some(parts.join("\\"))
}

/// Union bookkeeping of one overlay drive.
#[derive(Debug, Default, Clone)]
pub struct OverlayState {
    deleted_files: BTreeSet<String>,
    deleted_dirs: BTreeSet<String>,
    overlay_only_files: HashSet<String>,
    overlay_only_dirs: BTreeSet<String>,
}

impl OverlayState {
    /// Whether a base file is tombstoned.
    pub fn is_deleted_file(&self, path: &str) -> bool {
        self.deleted_files.contains(path)
    }

    /// Whether `path` is a tombstoned directory or lies below one.
    pub fn is_deleted_path(&self, path: &str) -> bool {
        self.deleted_dirs.iter().any(|dir| {
            path == dir || (path.len() > dir.len() && path.starts_with(dir.as_str()) && path.as_bytes()[dir.len()] == b'\\')
        })
    }

    /// Whether base-layer content at `path` must not be shown.
    pub fn is_hidden(&self, path: &str) -> bool {
        self.is_deleted_file(path) || self.is_deleted_path(path)
    }

    pub fn deleted_files(&self) -> impl Iterator<Item = &str> {
        self.deleted_files.iter().map(String::as_str)
    }

    pub fn deleted_directories(&self) -> impl Iterator<Item = &str> {
        self.deleted_dirs.iter().map(String::as_str)
    }

    /// Directories that exist only in the overlay.
    pub fn overlay_only_directories(&self) -> impl Iterator<Item = &str> {
        self.overlay_only_dirs.iter().map(String::as_str)
    }

    /// Whether a file exists in the overlay with no base counterpart.
    pub fn is_overlay_only(&self, path: &str) -> bool {
        self.overlay_only_files.contains(path)
    }
}

/// A local drive with a writable overlay directory on top.
pub struct OverlayDrive {
    base: LocalDrive,
    overlay_dir: PathBuf,
    state: OverlayState,
    /// DOS path of the overlay directory when it lives inside the base.
    overlap_folder: Option<String>,
}

impl OverlayDrive {
    /// Put `overlay_dir` on top of `base`.
    pub fn new(base: LocalDrive, overlay_dir: impl Into<PathBuf>) -> DosResult<Self> {
        let overlay_dir = overlay_dir.into();
        Self::check_paths(base.base_dir(), &overlay_dir)?;
        Ok(Self::attach(base, overlay_dir))
    }

    /// Reject overlay/base combinations that would alias each other.
    pub fn check_paths(base_dir: &Path, overlay_dir: &Path) -> DosResult<()> {
        if base_dir.is_absolute() != overlay_dir.is_absolute() {
            return Err(DosError::PathNotSupported(
                "overlay and base must both be absolute or both relative".to_string(),
            ));
        }
        if !overlay_dir.is_dir() {
            return Err(DosError::InvalidMount(format!(
                "overlay directory {} does not exist",
                overlay_dir.display()
            )));
        }
        let base = fs::canonicalize(base_dir)?;
        let overlay = fs::canonicalize(overlay_dir)?;
        if base == overlay {
            return Err(DosError::PathNotSupported(
                "overlay and base are the same directory".to_string(),
            ));
        }
        if base.starts_with(&overlay) {
            return Err(DosError::PathNotSupported(
                "base directory lies inside the overlay".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the drive once the paths are known to be usable.
    pub(crate) fn attach(mut base: LocalDrive, overlay_dir: PathBuf) -> Self {
        let overlap_folder = Self::find_overlap(&mut base, &overlay_dir);
        if let Some(folder) = &overlap_folder {
            info!(folder = %folder, "overlay lives inside its base, hiding it");
        }
        let mut drive = Self {
            base,
            overlay_dir,
            state: OverlayState::default(),
            overlap_folder,
        };
        drive.update_cache(true);
        drive
    }

    fn find_overlap(base: &mut LocalDrive, overlay_dir: &Path) -> Option<String> {
        let base_dir = fs::canonicalize(base.base_dir()).ok()?;
        let overlay = fs::canonicalize(overlay_dir).ok()?;
        let rel = overlay.strip_prefix(&base_dir).ok()?;

        let mut dos = String::new();
        for component in rel.components() {
            let Component::Normal(part) = component else { continue };
            let long = part.to_str()?;
            let short = base
                .cache_mut()
                .get_short_name(&dos, long)
                .ok()
                .flatten()
                .unwrap_or_else(|| long.to_ascii_uppercase());
            dos = join_dos(&dos, &short);
        }
        (!dos.is_empty()).then_some(dos)
    }

    pub fn base(&self) -> &LocalDrive {
        &self.base
    }

    pub fn overlay_dir(&self) -> &Path {
        &self.overlay_dir
    }

    pub fn state(&self) -> &OverlayState {
        &self.state
    }

    fn overlay_path(&self, dos: &str) -> PathBuf {
        host_join(&self.overlay_dir, dos)
    }

    fn marker_path(&self, dos: &str, kind: Tombstone) -> PathBuf {
        let (dir, name) = split_parent(dos);
        self.overlay_path(dir)
            .join(format!("{}_{}_{}", OVERLAY_PREFIX, kind.tag(), name))
    }

    fn base_has_file(&mut self, dos: &str) -> bool {
        self.base
            .cache_mut()
            .expand_name(dos)
            .map(|host| host.is_file())
            .unwrap_or(false)
    }

    fn base_has_dir(&mut self, dos: &str) -> bool {
        self.base
            .cache_mut()
            .expand_name(dos)
            .map(|host| host.is_dir())
            .unwrap_or(false)
    }

    /// Mirror the leading directories of `dos` into the overlay.
    fn sync_leading_dirs(&self, dos: &str) -> DosResult<()> {
        let (dir, _) = split_parent(dos);
        if !dir.is_empty() {
            fs::create_dir_all(self.overlay_path(dir))?;
        }
        Ok(())
    }

    fn write_marker(&self, dos: &str, kind: Tombstone) -> DosResult<()> {
        self.sync_leading_dirs(dos)?;
        fs::write(self.marker_path(dos, kind), MARKER_CONTENTS)?;
        Ok(())
    }

    fn remove_marker(&self, dos: &str, kind: Tombstone) {
        let marker = self.marker_path(dos, kind);
        if let Err(err) = fs::remove_file(&marker) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(marker = %marker.display(), %err, "cannot remove tombstone marker");
            }
        }
    }

    fn add_deleted_file(&mut self, dos: &str, persist: bool) -> DosResult<()> {
        if persist {
            self.write_marker(dos, Tombstone::File)?;
        }
        if self.state.deleted_files.insert(dos.to_string()) {
            debug!(path = dos, "tombstoned file");
        }
        Ok(())
    }

    fn remove_deleted_file(&mut self, dos: &str) {
        if self.state.deleted_files.remove(dos) {
            self.remove_marker(dos, Tombstone::File);
            debug!(path = dos, "lifted file tombstone");
        }
    }

    fn add_deleted_path(&mut self, dos: &str, persist: bool) -> DosResult<()> {
        if persist {
            self.write_marker(dos, Tombstone::Directory)?;
        }
        if self.state.deleted_dirs.insert(dos.to_string()) {
            debug!(path = dos, "tombstoned directory");
        }
        Ok(())
    }

    fn remove_deleted_path(&mut self, dos: &str) {
        if self.state.deleted_dirs.remove(dos) {
            self.remove_marker(dos, Tombstone::Directory);
            debug!(path = dos, "lifted directory tombstone");
        }
    }

    /// Rescan the overlay directory.
    ///
    /// With `reread` the overlay bookkeeping is rebuilt from scratch;
    /// otherwise entries are only added. Overlay files and overlay-only
    /// directories are registered in the base drive's directory cache.
    fn update_cache(&mut self, reread: bool) {
        if reread {
            self.state = OverlayState::default();
            if let Some(folder) = self.overlap_folder.clone() {
                self.state.deleted_dirs.insert(folder);
            }
        }

        let mut markers = Vec::new();
        let mut dirs = Vec::new();
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.overlay_dir).min_depth(1).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(%err, "skipping unreadable overlay entry");
                    continue;
                }
            };
            let Some(rel) = entry
                .path()
                .strip_prefix(&self.overlay_dir)
                .ok()
                .and_then(dos_relative)
            else {
                debug!(path = %entry.path().display(), "skipping overlay entry without a DOS name");
                continue;
            };
            if is_marker_name(&entry.file_name().to_string_lossy()) {
                markers.push(rel);
            } else if entry.file_type().is_dir() {
                dirs.push(rel);
            } else {
                files.push(rel);
            }
        }

        for dir in &dirs {
            if !self.base_has_dir(dir) {
                self.state.overlay_only_dirs.insert(dir.clone());
            }
        }
        for file in &files {
            if !self.base_has_file(file) {
                self.state.overlay_only_files.insert(file.clone());
            }
        }

        let only_dirs: Vec<String> = self.state.overlay_only_dirs.iter().cloned().collect();
        for dir in &only_dirs {
            if let Err(err) = self.base.cache_mut().add_directory_entry(dir, true) {
                warn!(dir = %dir, %err, "cannot register overlay directory");
            }
        }
        for file in &files {
            if let Err(err) = self.base.cache_mut().add_entry(file, true) {
                warn!(file = %file, %err, "cannot register overlay file");
            }
        }

        for marker in &markers {
            match parse_marker(marker) {
                Some((Tombstone::File, target)) => {
                    self.state.deleted_files.insert(target);
                }
                Some((Tombstone::Directory, target)) => {
                    self.state.deleted_dirs.insert(target);
                }
                None => warn!(marker = %marker, "ignoring malformed tombstone marker"),
            }
        }
        debug!(
            files = files.len(),
            overlay_only_dirs = self.state.overlay_only_dirs.len(),
            deleted_files = self.state.deleted_files.len(),
            deleted_dirs = self.state.deleted_dirs.len(),
            "scanned overlay"
        );
    }

    /// Re-read the base listing of `dos`'s parent and re-register overlay
    /// entries in it.
    fn refresh_parent(&mut self, dos: &str) -> DosResult<()> {
        self.base.cache_mut().delete_entry(dos, true)?;
        self.update_cache(false);
        Ok(())
    }

    /// Stat with overlay precedence; `None` when not visible.
    fn stat_union(&mut self, dos: &str) -> Option<FileStat> {
        if let Ok(meta) = fs::metadata(self.overlay_path(dos)) {
            if !(meta.is_dir() && self.state.is_hidden(dos)) {
                return Some(stat_from_metadata(&meta));
            }
        }
        if self.state.is_hidden(dos) || self.state.is_overlay_only(dos) {
            return None;
        }
        self.base.file_stat(dos).ok()
    }

    /// Whether a directory has no visible entries besides `.` and `..`.
    fn is_union_empty(&mut self, dir: &str) -> DosResult<bool> {
        let all = FatAttributes::DIRECTORY | FatAttributes::HIDDEN | FatAttributes::SYSTEM;
        let entries = self.list(&join_dos(dir, "*.*"), all)?;
        Ok(entries.iter().all(|e| e.name == "." || e.name == ".."))
    }
}

impl Drive for OverlayDrive {
    fn info(&self) -> String {
        format!(
            "overlay {} over {}",
            self.overlay_dir.display(),
            self.base.base_dir().display()
        )
    }

    fn open(&mut self, name: &str, mode: OpenMode) -> DosResult<Box<dyn DosFile>> {
        let path = normalize_dos_path(name)?;
        let upper = self.overlay_path(&path);
        if upper.is_file() {
            let file = OpenOptions::new()
                .read(mode.can_read())
                .write(mode.can_write())
                .open(&upper)
                .map_err(|e| DosError::from_host(e, &path))?;
            return Ok(Box::new(HostFile::new(&path, file, mode)));
        }
        if self.state.is_hidden(&path) {
            return Err(DosError::NotFound(path));
        }

        let lower = self.base.host_path(&path)?;
        if !lower.is_file() {
            return Err(DosError::NotFound(path));
        }
        let file = File::open(&lower).map_err(|e| DosError::from_host(e, &path))?;
        if mode.can_write() {
            Ok(Box::new(HostFile::copy_on_write(&path, file, mode, upper)))
        } else {
            Ok(Box::new(HostFile::new(&path, file, mode)))
        }
    }

    fn create(&mut self, name: &str, attributes: FatAttributes) -> DosResult<Box<dyn DosFile>> {
        let path = normalize_dos_path(name)?;
        let (dir, _) = split_parent(&path);
        if !dir.is_empty() && !self.test_directory(dir) {
            return Err(DosError::PathNotFound(path));
        }
        if self.test_directory(&path) {
            return Err(DosError::AccessDenied(path));
        }

        self.sync_leading_dirs(&path)?;
        let upper = self.overlay_path(&path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&upper)
            .map_err(|e| path_error(e, &path))?;

        if !self.base_has_file(&path) {
            self.state.overlay_only_files.insert(path.clone());
        }
        self.base.cache_mut().add_entry(&path, true)?;
        self.remove_deleted_file(&path);
        debug!(file = %path, ?attributes, "created file in overlay");
        Ok(Box::new(HostFile::new(&path, file, OpenMode::ReadWrite)))
    }

    fn unlink(&mut self, name: &str) -> DosResult<()> {
        let path = normalize_dos_path(name)?;
        let upper = self.overlay_path(&path);
        let in_overlay = upper.is_file();
        let in_base = self.base_has_file(&path);
        let tombstoned = self.state.is_hidden(&path);

        if !in_overlay && (!in_base || tombstoned) {
            return Err(DosError::NotFound(path));
        }
        if in_overlay {
            fs::remove_file(&upper).map_err(|e| DosError::from_host(e, &path))?;
            self.state.overlay_only_files.remove(&path);
        }
        if in_base {
            self.add_deleted_file(&path, true)?;
        } else {
            self.refresh_parent(&path)?;
        }
        debug!(file = %path, in_overlay, in_base, "unlinked");
        Ok(())
    }

    fn make_directory(&mut self, dir: &str) -> DosResult<()> {
        let path = normalize_dos_path(dir)?;
        if path.is_empty() {
            return Err(DosError::AccessDenied(path));
        }
        let (parent, _) = split_parent(&path);
        if !parent.is_empty() && !self.test_directory(parent) {
            return Err(DosError::PathNotFound(path));
        }
        if self.state.deleted_dirs.contains(&path) && self.base_has_dir(&path) {
            // Contents deleted along with it stay tombstoned
            self.remove_deleted_path(&path);
            return Ok(());
        }
        if self.test_directory(&path) || self.file_exists(&path) {
            return Err(DosError::AlreadyExists(path));
        }

        self.sync_leading_dirs(&path)?;
        fs::create_dir_all(self.overlay_path(&path)).map_err(|e| path_error(e, &path))?;
        self.remove_deleted_path(&path);
        self.state.deleted_files.remove(&path);
        if !self.base_has_dir(&path) {
            self.base.cache_mut().add_directory_entry(&path, true)?;
            self.state.overlay_only_dirs.insert(path.clone());
        }
        debug!(dir = %path, "created directory in overlay");
        Ok(())
    }

    fn remove_directory(&mut self, dir: &str) -> DosResult<()> {
        let path = normalize_dos_path(dir)?;
        if path.is_empty() {
            return Err(DosError::AccessDenied(path));
        }
        if !self.test_directory(&path) {
            return Err(DosError::PathNotFound(path));
        }
        if !self.is_union_empty(&path)? {
            return Err(DosError::AccessDenied(path));
        }

        let upper = self.overlay_path(&path);
        if self.state.overlay_only_dirs.contains(&path) {
            fs::remove_dir_all(&upper).map_err(|e| DosError::from_host(e, &path))?;
            self.state.overlay_only_dirs.remove(&path);
            let below = format!("{}\\", path);
            self.state.deleted_files.retain(|p| !p.starts_with(&below));
            self.state.overlay_only_files.retain(|p| !p.starts_with(&below));
            self.refresh_parent(&path)?;
            debug!(dir = %path, "removed overlay-only directory");
        } else {
            self.add_deleted_path(&path, true)?;
            // Only succeeds when the overlay copy holds no markers
            if upper.is_dir() && fs::remove_dir(&upper).is_ok() {
                debug!(dir = %path, "removed empty overlay copy");
            }
        }
        Ok(())
    }

    fn test_directory(&mut self, dir: &str) -> bool {
        let Ok(path) = normalize_dos_path(dir) else {
            return false;
        };
        if path.is_empty() {
            return true;
        }
        if self.state.is_hidden(&path) {
            return false;
        }
        self.overlay_path(&path).is_dir() || self.base.test_directory(&path)
    }

    fn find_first(&mut self, pattern: &str, attributes: FatAttributes) -> DosResult<SearchHandle> {
        let path = normalize_dos_path(pattern)?;
        let (dir, wild) = split_parent(&path);
        let wild = if wild.is_empty() { "*.*" } else { wild };
        if !dir.is_empty() && !self.test_directory(dir) {
            return Err(DosError::PathNotFound(dir.to_string()));
        }
        self.base.begin_search(dir, wild, attributes)
    }

    fn find_next(&mut self, handle: &mut SearchHandle) -> Option<FindEntry> {
        let overlay_dir = &self.overlay_dir;
        let state = &self.state;
        self.base.next_match(handle, |dos, lower| {
            if let Ok(meta) = fs::metadata(host_join(overlay_dir, dos)) {
                if !(meta.is_dir() && state.is_hidden(dos)) {
                    return Some(stat_from_metadata(&meta));
                }
            }
            if state.is_hidden(dos) || state.is_overlay_only(dos) {
                return None;
            }
            fs::metadata(lower).ok().map(|meta| stat_from_metadata(&meta))
        })
    }

    fn get_attributes(&mut self, name: &str) -> DosResult<FatAttributes> {
        Ok(self.file_stat(name)?.attributes)
    }

    fn set_attributes(&mut self, name: &str, attributes: FatAttributes) -> DosResult<()> {
        let path = normalize_dos_path(name)?;
        let upper = self.overlay_path(&path);
        if !upper.exists() {
            if self.state.is_hidden(&path) {
                return Err(DosError::NotFound(path));
            }
            let lower = self.base.host_path(&path)?;
            if lower.is_dir() {
                return Ok(());
            }
            if !lower.is_file() {
                return Err(DosError::NotFound(path));
            }
            self.sync_leading_dirs(&path)?;
            fs::copy(&lower, &upper).map_err(|e| DosError::from_host(e, &path))?;
            debug!(file = %path, "copied file up to change attributes");
        }
        if upper.is_dir() {
            return Ok(());
        }
        let mut permissions = fs::metadata(&upper)?.permissions();
        permissions.set_readonly(attributes.contains(FatAttributes::READ_ONLY));
        fs::set_permissions(&upper, permissions).map_err(|e| DosError::from_host(e, &path))?;
        Ok(())
    }

    fn rename(&mut self, old: &str, new: &str) -> DosResult<()> {
        let old_path = normalize_dos_path(old)?;
        let new_path = normalize_dos_path(new)?;
        if self.test_directory(&old_path) {
            error!(dir = %old_path, "renaming directories is not supported on overlay drives");
            return Err(DosError::PathNotSupported(old_path));
        }
        if !self.file_exists(&old_path) {
            return Err(DosError::NotFound(old_path));
        }
        if old_path != new_path && (self.file_exists(&new_path) || self.test_directory(&new_path)) {
            return Err(DosError::AlreadyExists(new_path));
        }
        let (new_dir, _) = split_parent(&new_path);
        if !new_dir.is_empty() && !self.test_directory(new_dir) {
            return Err(DosError::PathNotFound(new_path));
        }

        self.sync_leading_dirs(&new_path)?;
        let source = self.overlay_path(&old_path);
        let target = self.overlay_path(&new_path);
        let base_visible = !self.state.is_hidden(&old_path) && self.base_has_file(&old_path);
        if source.is_file() {
            fs::rename(&source, &target).map_err(|e| DosError::from_host(e, &old_path))?;
        } else {
            let lower = self.base.host_path(&old_path)?;
            fs::copy(&lower, &target).map_err(|e| DosError::from_host(e, &old_path))?;
        }
        if base_visible {
            self.add_deleted_file(&old_path, true)?;
        }
        self.remove_deleted_file(&new_path);

        self.base.empty_cache();
        self.update_cache(true);
        info!(from = %old_path, to = %new_path, "renamed in overlay");
        Ok(())
    }

    fn file_exists(&mut self, name: &str) -> bool {
        let Ok(path) = normalize_dos_path(name) else {
            return false;
        };
        if self.overlay_path(&path).is_file() {
            return true;
        }
        !self.state.is_hidden(&path) && !self.state.is_overlay_only(&path) && self.base_has_file(&path)
    }

    fn file_stat(&mut self, name: &str) -> DosResult<FileStat> {
        let path = normalize_dos_path(name)?;
        self.stat_union(&path).ok_or(DosError::NotFound(path))
    }

    fn allocation_info(&self) -> AllocationInfo {
        self.base.allocation_info()
    }

    fn media_id(&self) -> u8 {
        self.base.media_id()
    }

    fn label(&self) -> String {
        self.base.label()
    }

    fn empty_cache(&mut self) {
        self.base.empty_cache();
        self.update_cache(true);
    }

    fn is_removable(&self) -> bool {
        self.base.media() != MediaKind::HardDisk
    }
}

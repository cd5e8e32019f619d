//! Drive Manager - the table of mounted DOS drives.
//!
//! A DriveManager provides:
//! - Drive slots (A-Z), each holding one or more swappable disks
//! - Mounting of directory, floppy, CD-ROM, overlay and virtual drives
//! - Disk swapping with the current directory carried over
//!
//! Clone is cheap and every clone sees the same drives.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tracing::{debug, info};

use crate::bundle::{load_bundle_from_path, register_host_directory};
use crate::config::{DriveType, MountEntry, MountTable};
use crate::error::{DosError, DosResult};
use crate::fs::{
    hard_disk_allocation, normalize_dos_path, Drive, FatAttributes, FindEntry, LocalDrive, MediaKind,
    OverlayDrive, VirtualDrive, VirtualRegistry,
};

/// Number of drive letters.
pub const DRIVE_COUNT: usize = 26;

/// A drive in one of the supported variants.
pub enum MountedDrive {
    Local(LocalDrive),
    Overlay(OverlayDrive),
    Virtual(VirtualDrive),
}

impl MountedDrive {
    pub fn drive(&self) -> &dyn Drive {
        match self {
            MountedDrive::Local(d) => d,
            MountedDrive::Overlay(d) => d,
            MountedDrive::Virtual(d) => d,
        }
    }

    pub fn drive_mut(&mut self) -> &mut dyn Drive {
        match self {
            MountedDrive::Local(d) => d,
            MountedDrive::Overlay(d) => d,
            MountedDrive::Virtual(d) => d,
        }
    }

    pub fn drive_type(&self) -> DriveType {
        match self {
            MountedDrive::Local(d) => match d.media() {
                MediaKind::HardDisk => DriveType::Directory,
                MediaKind::Floppy => DriveType::Floppy,
                MediaKind::CdRom => DriveType::CdRom,
            },
            MountedDrive::Overlay(_) => DriveType::Overlay,
            MountedDrive::Virtual(_) => DriveType::Virtual,
        }
    }

    /// Whether an overlay may be put on top of this drive.
    fn accepts_overlay(&self) -> bool {
        matches!(self, MountedDrive::Local(d) if d.media() == MediaKind::HardDisk)
    }
}

/// One row of the drive table listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveListing {
    pub letter: char,
    pub drive_type: DriveType,
    pub label: String,
    pub backing: String,
    /// 1-based position of the active disk.
    pub disk_position: usize,
    pub disk_count: usize,
}

struct DriveSlot {
    disks: Vec<MountedDrive>,
    current: usize,
    /// Current DOS directory, drive-relative.
    current_dir: String,
}

impl DriveSlot {
    fn new(drive: MountedDrive) -> Self {
        Self {
            disks: vec![drive],
            current: 0,
            current_dir: String::new(),
        }
    }

    fn active(&self) -> &MountedDrive {
        &self.disks[self.current]
    }

    fn active_mut(&mut self) -> &mut MountedDrive {
        &mut self.disks[self.current]
    }

    fn cycle(&mut self, letter: char) -> usize {
        if self.disks.len() > 1 {
            self.current = (self.current + 1) % self.disks.len();
            let dir = self.current_dir.clone();
            let drive = self.active_mut().drive_mut();
            drive.empty_cache();
            if !drive.test_directory(&dir) {
                self.current_dir.clear();
            }
            info!(
                drive = %letter,
                disk = self.current + 1,
                of = self.disks.len(),
                "swapped disk"
            );
        }
        self.current + 1
    }
}

#[derive(Default)]
struct ManagerInner {
    slots: [Option<DriveSlot>; DRIVE_COUNT],
}

/// Table of mounted drives.
#[derive(Clone, Default)]
pub struct DriveManager {
    inner: Arc<RwLock<ManagerInner>>,
}

impl DriveManager {
    /// Create a manager with no drives mounted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a drive to a free letter.
    pub fn mount(&self, letter: char, drive: MountedDrive) -> DosResult<()> {
        let idx = drive_index(letter)?;
        let mut inner = self.inner.write().map_err(|_| DosError::LockPoisoned)?;
        if inner.slots[idx].is_some() {
            return Err(DosError::InvalidMount(format!("drive {} is already mounted", drive_letter(idx))));
        }
        info!(drive = %drive_letter(idx), backing = %drive.drive().info(), "mounted drive");
        inner.slots[idx] = Some(DriveSlot::new(drive));
        Ok(())
    }

    /// Add a swappable disk behind an already mounted drive.
    pub fn append_disk(&self, letter: char, drive: MountedDrive) -> DosResult<()> {
        let idx = drive_index(letter)?;
        let mut inner = self.inner.write().map_err(|_| DosError::LockPoisoned)?;
        let slot = inner.slots[idx].as_mut().ok_or(DosError::DriveNotMounted(letter))?;
        debug!(drive = %drive_letter(idx), backing = %drive.drive().info(), "added disk");
        slot.disks.push(drive);
        Ok(())
    }

    /// Mount a host directory.
    pub fn mount_directory(&self, letter: char, path: impl Into<PathBuf>, media: MediaKind) -> DosResult<()> {
        let drive = local_drive(path.into(), media)?;
        self.mount(letter, MountedDrive::Local(drive))
    }

    /// Put a writable overlay on top of a mounted plain directory drive.
    pub fn mount_overlay(&self, letter: char, overlay_dir: impl AsRef<Path>) -> DosResult<()> {
        let idx = drive_index(letter)?;
        let overlay_dir = overlay_dir.as_ref().to_path_buf();
        let mut inner = self.inner.write().map_err(|_| DosError::LockPoisoned)?;
        let slot = inner.slots[idx].as_mut().ok_or(DosError::DriveNotMounted(letter))?;

        let current = slot.current;
        match &slot.disks[current] {
            MountedDrive::Local(base) if slot.disks[current].accepts_overlay() => {
                OverlayDrive::check_paths(base.base_dir(), &overlay_dir)?;
            }
            other => {
                return Err(DosError::InvalidMount(format!(
                    "drive {} is a {} drive, overlays need a plain directory drive",
                    drive_letter(idx),
                    other.drive_type().as_str()
                )));
            }
        }

        match slot.disks.remove(current) {
            MountedDrive::Local(base) => {
                let overlay = OverlayDrive::attach(base, overlay_dir);
                info!(drive = %drive_letter(idx), backing = %overlay.info(), "mounted overlay");
                slot.disks.insert(current, MountedDrive::Overlay(overlay));
                Ok(())
            }
            other => {
                slot.disks.insert(current, other);
                Err(DosError::InvalidMount(format!("drive {} cannot take an overlay", drive_letter(idx))))
            }
        }
    }

    /// Detach a drive with all its disks.
    pub fn unmount(&self, letter: char) -> DosResult<()> {
        let idx = drive_index(letter)?;
        let mut inner = self.inner.write().map_err(|_| DosError::LockPoisoned)?;
        if inner.slots[idx].take().is_none() {
            return Err(DosError::DriveNotMounted(letter));
        }
        info!(drive = %drive_letter(idx), "unmounted drive");
        Ok(())
    }

    /// Make the next disk of a drive active; returns its 1-based position.
    pub fn cycle(&self, letter: char) -> DosResult<usize> {
        let idx = drive_index(letter)?;
        let mut inner = self.inner.write().map_err(|_| DosError::LockPoisoned)?;
        let slot = inner.slots[idx].as_mut().ok_or(DosError::DriveNotMounted(letter))?;
        Ok(slot.cycle(drive_letter(idx)))
    }

    /// Swap disks on A: and B:.
    pub fn cycle_all_disks(&self) -> DosResult<()> {
        let mut inner = self.inner.write().map_err(|_| DosError::LockPoisoned)?;
        for idx in 0..2 {
            if let Some(slot) = inner.slots[idx].as_mut() {
                slot.cycle(drive_letter(idx));
            }
        }
        Ok(())
    }

    /// Swap disks on every CD-ROM drive from C: on.
    pub fn cycle_all_cds(&self) -> DosResult<()> {
        let mut inner = self.inner.write().map_err(|_| DosError::LockPoisoned)?;
        for idx in 2..DRIVE_COUNT {
            if let Some(slot) = inner.slots[idx].as_mut() {
                if slot.active().drive_type() == DriveType::CdRom {
                    slot.cycle(drive_letter(idx));
                }
            }
        }
        Ok(())
    }

    /// Describe every mounted drive.
    pub fn list(&self) -> Vec<DriveListing> {
        let Ok(inner) = self.inner.read() else {
            return vec![];
        };
        inner
            .slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| {
                let slot = slot.as_ref()?;
                let active = slot.active();
                Some(DriveListing {
                    letter: drive_letter(idx),
                    drive_type: active.drive_type(),
                    label: active.drive().label(),
                    backing: active.drive().info(),
                    disk_position: slot.current + 1,
                    disk_count: slot.disks.len(),
                })
            })
            .collect()
    }

    /// Check if a drive is mounted.
    pub fn is_mounted(&self, letter: char) -> bool {
        let Ok(idx) = drive_index(letter) else {
            return false;
        };
        self.inner
            .read()
            .map(|inner| inner.slots[idx].is_some())
            .unwrap_or(false)
    }

    /// Get list of mounted drives.
    pub fn mounted_drives(&self) -> Vec<char> {
        self.list().into_iter().map(|l| l.letter).collect()
    }

    /// Run `op` against the active disk of a drive.
    pub fn with_drive<T>(&self, letter: char, op: impl FnOnce(&mut dyn Drive) -> DosResult<T>) -> DosResult<T> {
        let idx = drive_index(letter)?;
        let mut inner = self.inner.write().map_err(|_| DosError::LockPoisoned)?;
        let slot = inner.slots[idx].as_mut().ok_or(DosError::DriveNotMounted(letter))?;
        op(slot.active_mut().drive_mut())
    }

    /// Read a file from a drive.
    pub fn read_file(&self, letter: char, name: &str) -> DosResult<Vec<u8>> {
        self.with_drive(letter, |drive| drive.read_file(name))
    }

    /// Write a file to a drive.
    pub fn write_file(&self, letter: char, name: &str, data: &[u8]) -> DosResult<()> {
        self.with_drive(letter, |drive| drive.write_file(name, data))
    }

    /// Run a directory search to completion.
    pub fn find(&self, letter: char, pattern: &str, attributes: FatAttributes) -> DosResult<Vec<FindEntry>> {
        self.with_drive(letter, |drive| drive.list(pattern, attributes))
    }

    pub fn current_dir(&self, letter: char) -> DosResult<String> {
        let idx = drive_index(letter)?;
        let inner = self.inner.read().map_err(|_| DosError::LockPoisoned)?;
        let slot = inner.slots[idx].as_ref().ok_or(DosError::DriveNotMounted(letter))?;
        Ok(slot.current_dir.clone())
    }

    /// Change the current directory of a drive.
    pub fn set_current_dir(&self, letter: char, dir: &str) -> DosResult<()> {
        let idx = drive_index(letter)?;
        let dir = normalize_dos_path(dir)?;
        let mut inner = self.inner.write().map_err(|_| DosError::LockPoisoned)?;
        let slot = inner.slots[idx].as_mut().ok_or(DosError::DriveNotMounted(letter))?;
        if !slot.active_mut().drive_mut().test_directory(&dir) {
            return Err(DosError::PathNotFound(dir));
        }
        slot.current_dir = dir;
        Ok(())
    }

    /// Mount every drive of a table, in order.
    ///
    /// Virtual drives share `registry`; their bundles and host directories
    /// are registered before mounting.
    pub fn apply_mount_table(&self, table: &MountTable, registry: &VirtualRegistry) -> DosResult<()> {
        for entry in &table.drives {
            self.apply_entry(entry, registry)?;
        }
        Ok(())
    }

    /// Mount one table entry.
    pub fn apply_entry(&self, entry: &MountEntry, registry: &VirtualRegistry) -> DosResult<()> {
        let letter = entry.letter;
        match entry.drive_type {
            DriveType::Virtual => {
                if let Some(bundle) = &entry.bundle {
                    load_bundle_from_path(bundle, registry)?;
                }
                if let Some(path) = &entry.path {
                    register_host_directory(path, registry)?;
                }
                let mut drive = VirtualDrive::new(registry.clone());
                if let Some(label) = &entry.label {
                    drive = drive.with_label(label);
                }
                self.mount(letter, MountedDrive::Virtual(drive))
            }
            DriveType::Overlay => {
                if let Some(base) = &entry.path {
                    let drive = configured_local(base.clone(), MediaKind::HardDisk, entry)?;
                    self.mount(letter, MountedDrive::Local(drive))?;
                }
                let overlay = entry.overlay.as_ref().ok_or_else(|| {
                    DosError::InvalidMount(format!("overlay on {} has no overlay directory", letter))
                })?;
                self.mount_overlay(letter, overlay)
            }
            DriveType::Directory | DriveType::Floppy | DriveType::CdRom => {
                let media = entry.drive_type.media().unwrap_or(MediaKind::HardDisk);
                let paths = entry.backing_paths();
                if paths.is_empty() {
                    return Err(DosError::InvalidMount(format!("drive {} has no host directory", letter)));
                }
                for (i, path) in paths.into_iter().enumerate() {
                    let drive = MountedDrive::Local(configured_local(path, media, entry)?);
                    if i == 0 {
                        self.mount(letter, drive)?;
                    } else {
                        self.append_disk(letter, drive)?;
                    }
                }
                Ok(())
            }
        }
    }
}

fn local_drive(path: PathBuf, media: MediaKind) -> DosResult<LocalDrive> {
    if !path.is_dir() {
        return Err(DosError::InvalidMount(format!("{} is not a directory", path.display())));
    }
    Ok(LocalDrive::new(path, media))
}

fn configured_local(path: PathBuf, media: MediaKind, entry: &MountEntry) -> DosResult<LocalDrive> {
    let mut drive = local_drive(path, media)?;
    if let (MediaKind::HardDisk, Some(free_mb)) = (media, entry.free_size_mb) {
        drive = drive.with_allocation(hard_disk_allocation(free_mb));
    }
    if let Some(label) = &entry.label {
        drive = drive.with_label(label);
    }
    Ok(drive)
}

/// Convert drive letter to index (A=0, B=1, ..., Z=25).
fn drive_index(letter: char) -> DosResult<usize> {
    let upper = letter.to_ascii_uppercase();
    if upper.is_ascii_uppercase() {
        Ok((upper as u8 - b'A') as usize)
    } else {
        Err(DosError::InvalidDrive(letter))
    }
}

fn drive_letter(idx: usize) -> char {
    (b'A' + idx as u8) as char
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_drive_index() {
        assert_eq!(drive_index('A').unwrap(), 0);
        assert_eq!(drive_index('c').unwrap(), 2);
        assert_eq!(drive_index('Z').unwrap(), 25);
        assert!(drive_index('1').is_err());
        assert!(drive_index('é').is_err());
    }

    #[test]
    fn test_mount_unmount() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DriveManager::new();

        manager.mount_directory('c', dir.path(), MediaKind::HardDisk).unwrap();
        assert!(manager.is_mounted('C'));
        assert!(!manager.is_mounted('D'));
        assert!(matches!(
            manager.mount_directory('C', dir.path(), MediaKind::HardDisk),
            Err(DosError::InvalidMount(_))
        ));

        manager.write_file('C', "HELLO.TXT", b"hi").unwrap();
        assert_eq!(manager.read_file('C', "HELLO.TXT").unwrap(), b"hi");

        manager.unmount('C').unwrap();
        assert!(!manager.is_mounted('C'));
        assert!(matches!(manager.unmount('C'), Err(DosError::DriveNotMounted('C'))));
    }

    #[test]
    fn test_shared_between_clones() {
        let dir = tempfile::tempdir().unwrap();
        let m1 = DriveManager::new();
        let m2 = m1.clone();

        m1.mount_directory('D', dir.path(), MediaKind::HardDisk).unwrap();
        m2.write_file('D', "A.TXT", b"from m2").unwrap();
        assert_eq!(m1.read_file('D', "A.TXT").unwrap(), b"from m2");
        assert_eq!(m1.mounted_drives(), vec!['D']);
    }

    #[test]
    fn test_mount_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DriveManager::new();
        let result = manager.mount_directory('C', dir.path().join("missing"), MediaKind::HardDisk);
        assert!(matches!(result, Err(DosError::InvalidMount(_))));
    }

    #[test]
    fn test_overlay_requires_plain_directory() {
        let base = tempfile::tempdir().unwrap();
        let upper = tempfile::tempdir().unwrap();
        let manager = DriveManager::new();

        assert!(matches!(manager.mount_overlay('C', upper.path()), Err(DosError::DriveNotMounted('C'))));

        manager.mount_directory('D', base.path(), MediaKind::CdRom).unwrap();
        assert!(matches!(manager.mount_overlay('D', upper.path()), Err(DosError::InvalidMount(_))));

        manager.mount_directory('C', base.path(), MediaKind::HardDisk).unwrap();
        manager.mount_overlay('C', upper.path()).unwrap();
        assert_eq!(manager.list()[0].drive_type, DriveType::Overlay);

        // Overlay on an overlay
        assert!(matches!(manager.mount_overlay('C', upper.path()), Err(DosError::InvalidMount(_))));
    }

    #[test]
    fn test_overlay_path_errors_leave_drive_intact() {
        let base = tempfile::tempdir().unwrap();
        let manager = DriveManager::new();
        manager.mount_directory('C', base.path(), MediaKind::HardDisk).unwrap();

        assert!(matches!(manager.mount_overlay('C', base.path()), Err(DosError::PathNotSupported(_))));
        assert_eq!(manager.list()[0].drive_type, DriveType::Directory);
    }

    #[test]
    fn test_cycle_carries_current_dir() {
        let d1 = tempfile::tempdir().unwrap();
        let d2 = tempfile::tempdir().unwrap();
        let d3 = tempfile::tempdir().unwrap();
        fs::create_dir(d1.path().join("games")).unwrap();
        fs::create_dir(d2.path().join("games")).unwrap();

        let mut entry = MountEntry::new('A', DriveType::Floppy);
        entry.path = Some(d1.path().to_path_buf());
        entry.paths = vec![d2.path().to_path_buf(), d3.path().to_path_buf()];
        let manager = DriveManager::new();
        manager.apply_entry(&entry, &VirtualRegistry::new()).unwrap();

        manager.set_current_dir('A', "games").unwrap();
        assert!(matches!(manager.set_current_dir('A', "nope"), Err(DosError::PathNotFound(_))));

        assert_eq!(manager.cycle('A').unwrap(), 2);
        assert_eq!(manager.current_dir('A').unwrap(), "GAMES");
        assert_eq!(manager.cycle('A').unwrap(), 3);
        assert_eq!(manager.current_dir('A').unwrap(), "");
        assert_eq!(manager.cycle('A').unwrap(), 1);

        let listing = &manager.list()[0];
        assert_eq!((listing.disk_position, listing.disk_count), (1, 3));
        assert_eq!(listing.drive_type, DriveType::Floppy);
    }

    #[test]
    fn test_cycle_all() {
        let a1 = tempfile::tempdir().unwrap();
        let a2 = tempfile::tempdir().unwrap();
        let manager = DriveManager::new();
        manager.mount_directory('A', a1.path(), MediaKind::Floppy).unwrap();
        manager
            .append_disk('A', MountedDrive::Local(LocalDrive::new(a2.path(), MediaKind::Floppy)))
            .unwrap();
        manager.mount_directory('D', a1.path(), MediaKind::CdRom).unwrap();
        manager
            .append_disk('D', MountedDrive::Local(LocalDrive::new(a2.path(), MediaKind::CdRom)))
            .unwrap();
        manager.mount_directory('E', a1.path(), MediaKind::HardDisk).unwrap();
        manager
            .append_disk('E', MountedDrive::Local(LocalDrive::new(a2.path(), MediaKind::HardDisk)))
            .unwrap();

        manager.cycle_all_disks().unwrap();
        manager.cycle_all_cds().unwrap();
        let positions: Vec<(char, usize)> = manager.list().iter().map(|l| (l.letter, l.disk_position)).collect();
        assert_eq!(positions, vec![('A', 2), ('D', 2), ('E', 1)]);
    }

    #[test]
    fn test_virtual_drive_in_table() {
        let host = tempfile::tempdir().unwrap();
        fs::write(host.path().join("tool.com"), b"\xCD\x20").unwrap();

        let mut entry = MountEntry::new('Z', DriveType::Virtual);
        entry.path = Some(host.path().to_path_buf());
        let table = MountTable { drives: vec![entry] };
        let registry = VirtualRegistry::new();
        let manager = DriveManager::new();
        manager.apply_mount_table(&table, &registry).unwrap();

        assert_eq!(manager.read_file('Z', "TOOL.COM").unwrap(), b"\xCD\x20");
        assert!(matches!(manager.write_file('Z', "X.TXT", b"x"), Err(DosError::AccessDenied(_))));

        registry.register_file("LATE.TXT", &b"late"[..], "").unwrap();
        assert_eq!(manager.read_file('Z', "LATE.TXT").unwrap(), b"late");
    }
}

//! Mount table configuration.
//!
//! A mount table is a JSON document listing the drives to attach:
//!
//! ```json
//! { "drives": [
//!     { "letter": "C", "type": "overlay", "path": "game", "overlay": "saves" },
//!     { "letter": "A", "type": "floppy", "paths": ["disk1", "disk2"] },
//!     { "letter": "Z", "type": "virtual", "bundle": "tools.zip" }
//! ] }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DosError, DosResult};
use crate::fs::MediaKind;

/// Kind of drive a mount entry creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveType {
    #[default]
    #[serde(alias = "dir")]
    Directory,
    Overlay,
    Floppy,
    CdRom,
    Virtual,
}

impl DriveType {
    /// Medium of the host directory behind a local drive type.
    pub fn media(self) -> Option<MediaKind> {
        match self {
            DriveType::Directory | DriveType::Overlay => Some(MediaKind::HardDisk),
            DriveType::Floppy => Some(MediaKind::Floppy),
            DriveType::CdRom => Some(MediaKind::CdRom),
            DriveType::Virtual => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DriveType::Directory => "dir",
            DriveType::Overlay => "overlay",
            DriveType::Floppy => "floppy",
            DriveType::CdRom => "cdrom",
            DriveType::Virtual => "virtual",
        }
    }
}

impl FromStr for DriveType {
    type Err = DosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dir" | "directory" => Ok(DriveType::Directory),
            "overlay" => Ok(DriveType::Overlay),
            "floppy" => Ok(DriveType::Floppy),
            "cdrom" | "iso" => Ok(DriveType::CdRom),
            "virtual" => Ok(DriveType::Virtual),
            other => Err(DosError::InvalidMount(format!("unknown drive type '{}'", other))),
        }
    }
}

/// One drive of a mount table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountEntry {
    pub letter: char,
    #[serde(rename = "type", default)]
    pub drive_type: DriveType,
    /// Host directory. For overlays, the base directory to mount first.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Further directories to swap in with `cycle`.
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    /// Overlay directory for `overlay` entries.
    #[serde(default)]
    pub overlay: Option<PathBuf>,
    #[serde(default)]
    pub label: Option<String>,
    /// ZIP bundle registered before mounting a virtual drive.
    #[serde(default)]
    pub bundle: Option<PathBuf>,
    /// Free space a hard disk reports, in megabytes.
    #[serde(default)]
    pub free_size_mb: Option<u32>,
}

impl MountEntry {
    pub fn new(letter: char, drive_type: DriveType) -> Self {
        Self {
            letter,
            drive_type,
            path: None,
            paths: Vec::new(),
            overlay: None,
            label: None,
            bundle: None,
            free_size_mb: None,
        }
    }

    /// All host directories, in swap order.
    pub fn backing_paths(&self) -> Vec<PathBuf> {
        self.path.iter().chain(self.paths.iter()).cloned().collect()
    }
}

/// Parse a command line mount: `LETTER:TYPE[:PATH[;PATH...]]`.
///
/// An `overlay` mount names only the overlay directory; it goes on top of
/// a directory mounted at the same letter earlier. A `virtual` mount takes
/// a bundle path.
impl FromStr for MountEntry {
    type Err = DosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let letter = parts
            .next()
            .filter(|l| l.len() == 1)
            .and_then(|l| l.chars().next())
            .filter(char::is_ascii_alphabetic)
            .ok_or_else(|| DosError::InvalidMount(format!("missing drive letter in '{}'", s)))?
            .to_ascii_uppercase();
        let drive_type: DriveType = parts
            .next()
            .ok_or_else(|| DosError::InvalidMount(format!("missing drive type in '{}'", s)))?
            .parse()?;
        let mut paths = parts
            .next()
            .unwrap_or("")
            .split(';')
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        let mut entry = MountEntry::new(letter, drive_type);
        match drive_type {
            DriveType::Overlay => entry.overlay = paths.next(),
            DriveType::Virtual => entry.bundle = paths.next(),
            _ => {
                entry.path = paths.next();
                entry.paths = paths.collect();
            }
        }
        Ok(entry)
    }
}

/// Drives to mount at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountTable {
    #[serde(default)]
    pub drives: Vec<MountEntry>,
}

impl MountTable {
    pub fn from_json(json: &str) -> DosResult<Self> {
        let mut table: MountTable = serde_json::from_str(json)?;
        for entry in &mut table.drives {
            if !entry.letter.is_ascii_alphabetic() {
                return Err(DosError::InvalidDrive(entry.letter));
            }
            entry.letter = entry.letter.to_ascii_uppercase();
        }
        Ok(table)
    }

    /// Load a mount table; relative paths are taken from the file's
    /// directory.
    pub fn load_from_path(path: impl AsRef<Path>) -> DosResult<Self> {
        let path = path.as_ref();
        let mut table = Self::from_json(&fs::read_to_string(path)?)?;
        if let Some(dir) = path.parent() {
            table.resolve_relative(dir);
        }
        Ok(table)
    }

    fn resolve_relative(&mut self, dir: &Path) {
        let fix = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = dir.join(&*p);
            }
        };
        for entry in &mut self.drives {
            entry.path.iter_mut().for_each(fix);
            entry.paths.iter_mut().for_each(fix);
            entry.overlay.iter_mut().for_each(fix);
            entry.bundle.iter_mut().for_each(fix);
        }
    }
}

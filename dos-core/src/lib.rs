//! DOS Drive Emulation Core
//!
//! This crate provides the drive layer a DOS emulator serves its guest
//! from:
//! - Long-to-8.3 short name mapping over host directories
//! - Host directory, floppy and CD-ROM drives
//! - Copy-on-write overlay drives with persistent tombstones
//! - A read-only virtual drive over a shared in-memory registry
//! - A drive manager with swappable disks and JSON mount tables
//!
//! # Architecture
//!
//! The crate uses a layered design:
//! - `DirectoryCache`: lazily cached host listings with stable short names
//! - `Drive` trait: the operation set every drive variant serves
//! - `DriveManager`: drive letters A-Z backed by `MountedDrive` variants

pub mod bundle;
pub mod config;
pub mod error;
pub mod fs;
pub mod manager;

pub use bundle::{load_bundle, load_bundle_from_path, register_host_directory};
pub use config::{DriveType, MountEntry, MountTable};
pub use error::{DosError, DosResult};
pub use fs::{
    DirectoryCache, Drive, FatAttributes, FindEntry, LocalDrive, MediaKind, OpenMode, OverlayDrive, VirtualDrive,
    VirtualRegistry,
};
pub use manager::{DriveListing, DriveManager, MountedDrive, DRIVE_COUNT};

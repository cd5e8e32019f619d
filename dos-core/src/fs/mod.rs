//! DOS drive filesystem layer.
//!
//! This module provides the layered drive architecture:
//! - `DirectoryCache`: long/short name mapping over a host directory tree
//! - `Drive`: the operation set every mounted drive serves
//! - `LocalDrive`: host directory drive (hard disk, floppy, CD-ROM)
//! - `OverlayDrive`: copy-on-write overlay with persistent tombstones
//! - `VirtualDrive`: read-only drive over a shared in-memory registry

pub mod dir_cache;
mod drive;
mod file;
mod host;
mod local_drive;
mod names;
mod overlay_drive;
pub mod short_name;
mod virtual_drive;

pub use dir_cache::{DirItem, DirectoryCache, EntryId, SearchId, SortOrder, MAX_OPEN_DIRS};
pub use drive::{
    pack_dos_datetime, AllocationInfo, DosFile, Drive, FatAttributes, FileStat, FindEntry, OpenMode, SearchHandle,
};
pub use file::{HostFile, VirtualFile};
pub use host::{HostDirEntry, HostIo, StdHostIo};
pub use local_drive::{hard_disk_allocation, LocalDrive, MediaKind};
pub use names::{format_label, join_dos, normalize_dos_path, split_drive_path, split_parent, wild_file_cmp, MAX_PATH_LEN};
pub use overlay_drive::{OverlayDrive, OverlayState, OVERLAY_PREFIX};
pub use virtual_drive::{VirtualDrive, VirtualNode, VirtualRegistry, ROOT_DIR};

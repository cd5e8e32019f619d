//! Resource bundles for the virtual drive.
//!
//! A bundle is a ZIP archive whose files (and directories) are registered
//! into a [`VirtualRegistry`] under their archive paths. A host directory
//! can be snapshotted into the registry the same way.

use std::fs::{self, File};
use std::io::{BufReader, Read, Seek};
use std::path::{Component, Path};

use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::ZipArchive;

use crate::error::{DosError, DosResult};
use crate::fs::{split_parent, VirtualRegistry};

/// Registry path for an archive or host-relative path.
fn registry_path(path: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(parts.join("\\"))
}

fn register_path(registry: &VirtualRegistry, path: &str, data: Vec<u8>) -> DosResult<()> {
    let (dir, name) = split_parent(path);
    registry.ensure_dir(dir)?;
    registry.register_file(name, data, dir)
}

/// Register every entry of a ZIP archive. Returns the number of files.
pub fn load_bundle<R: Read + Seek>(reader: R, registry: &VirtualRegistry) -> DosResult<usize> {
    let mut archive = ZipArchive::new(reader).map_err(DosError::Zip)?;
    let mut files = 0;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i).map_err(DosError::Zip)?;
        let Some(path) = file.enclosed_name().as_deref().and_then(registry_path) else {
            warn!(name = file.name(), "skipping bundle entry with an unsafe path");
            continue;
        };
        if path.is_empty() {
            continue;
        }

        if file.is_dir() {
            registry.ensure_dir(&path)?;
            continue;
        }

        let mut content = Vec::new();
        file.read_to_end(&mut content)?;
        register_path(registry, &path, content)?;
        files += 1;
    }

    debug!(files, "loaded bundle");
    Ok(files)
}

/// Load a bundle from a ZIP file on the host.
pub fn load_bundle_from_path(path: impl AsRef<Path>, registry: &VirtualRegistry) -> DosResult<usize> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let files = load_bundle(BufReader::new(file), registry)?;
    info!(bundle = %path.display(), files, "registered bundle");
    Ok(files)
}

/// Snapshot a host directory tree into the registry.
pub fn register_host_directory(root: impl AsRef<Path>, registry: &VirtualRegistry) -> DosResult<usize> {
    let root = root.as_ref();
    let mut files = 0;

    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| DosError::Io(e.into()))?;
        let Some(path) = entry.path().strip_prefix(root).ok().and_then(registry_path) else {
            debug!(path = %entry.path().display(), "skipping host entry without a UTF-8 name");
            continue;
        };
        if entry.file_type().is_dir() {
            registry.ensure_dir(&path)?;
        } else {
            register_path(registry, &path, fs::read(entry.path())?)?;
            files += 1;
        }
    }

    info!(root = %root.display(), files, "registered host directory");
    Ok(files)
}

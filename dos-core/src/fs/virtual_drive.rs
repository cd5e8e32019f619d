//! Read-only in-memory drive over a shared registry of blobs.
//!
//! The registry is shared between every handle that clones it (cheap, it
//! is an `Arc`), so resources registered after mounting show up on the
//! drive immediately. Guest-level writes always fail with access denied.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use tracing::debug;

use super::drive::{
    label_entry, pack_dos_datetime, AllocationInfo, DosFile, Drive, FatAttributes, FileStat, FindEntry,
    OpenMode, SearchHandle, SearchState,
};
use super::file::VirtualFile;
use super::names::{format_label, normalize_dos_path, split_parent, wild_file_cmp};
use super::short_name::{self, Candidate};
use crate::error::{DosError, DosResult};

/// Directory index of the registry root.
pub const ROOT_DIR: usize = 0;

/// One registered file or directory.
#[derive(Debug, Clone)]
pub struct VirtualNode {
    name: String,
    short_name: String,
    parent: usize,
    /// Own directory index, `ROOT_DIR` for files.
    index: usize,
    data: Arc<[u8]>,
    modified: SystemTime,
}

impl VirtualNode {
    /// Name as registered.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    pub fn is_dir(&self) -> bool {
        self.index != ROOT_DIR
    }

    /// Directory index of the containing directory.
    pub fn parent(&self) -> usize {
        self.parent
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn data(&self) -> Arc<[u8]> {
        Arc::clone(&self.data)
    }

    pub fn modified(&self) -> SystemTime {
        self.modified
    }

    fn matches(&self, component: &str) -> bool {
        self.name.eq_ignore_ascii_case(component) || self.short_name.eq_ignore_ascii_case(component)
    }

    fn stat(&self) -> FileStat {
        let (date, time) = pack_dos_datetime(self.modified);
        FileStat {
            size: self.size(),
            date,
            time,
            attributes: if self.is_dir() {
                FatAttributes::DIRECTORY
            } else {
                FatAttributes::ARCHIVE
            },
        }
    }
}

struct RegistryInner {
    /// Registration order; listings walk it backwards.
    nodes: Vec<VirtualNode>,
    next_dir: usize,
    /// Short names handed out, by (uppercased long name, parent).
    short_names: HashMap<(String, usize), String>,
}

impl Default for RegistryInner {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            next_dir: ROOT_DIR + 1,
            short_names: HashMap::new(),
        }
    }
}

impl RegistryInner {
    fn child(&self, parent: usize, component: &str) -> Option<&VirtualNode> {
        self.nodes
            .iter()
            .rev()
            .find(|n| n.parent == parent && n.matches(component))
    }

    fn resolve_dir(&self, path: &str) -> Option<usize> {
        let mut dir = ROOT_DIR;
        for component in path.split(['\\', '/']).filter(|c| !c.is_empty()) {
            let node = self.child(dir, component)?;
            if !node.is_dir() {
                return None;
            }
            dir = node.index;
        }
        Some(dir)
    }

    fn find(&self, path: &str) -> Option<&VirtualNode> {
        let path = path.trim_matches(['\\', '/']);
        let (dir, name) = split_parent(path);
        let parent = self.resolve_dir(dir)?;
        self.child(parent, name)
    }

    fn short_name_for(&mut self, long_name: &str, parent: usize) -> DosResult<String> {
        let key = (long_name.to_ascii_uppercase(), parent);
        let taken = |nodes: &[VirtualNode], short: &str| {
            nodes.iter().any(|n| n.parent == parent && n.short_name == short)
        };
        if let Some(short) = self.short_names.get(&key) {
            // Another name may have claimed it while this one was removed
            if !taken(&self.nodes, short) {
                return Ok(short.clone());
            }
        }

        let candidate = Candidate::new(long_name);
        let mut short = candidate.verbatim();
        if candidate.force_tail || taken(&self.nodes, &short) {
            let mut nr = 1;
            loop {
                short = candidate.with_tail(nr)?;
                short_name::remove_trailing_dot(&mut short);
                if !taken(&self.nodes, &short) {
                    break;
                }
                nr += 1;
            }
        }
        self.short_names.insert(key, short.clone());
        Ok(short)
    }

    fn insert(&mut self, name: &str, parent: usize, data: Arc<[u8]>, is_dir: bool) -> DosResult<usize> {
        if let Some(existing) = self
            .nodes
            .iter()
            .find(|n| n.parent == parent && n.name.eq_ignore_ascii_case(name))
        {
            debug!(name, "already registered");
            return Ok(existing.index);
        }
        let short_name = self.short_name_for(name, parent)?;
        let index = if is_dir {
            self.next_dir += 1;
            self.next_dir - 1
        } else {
            ROOT_DIR
        };
        debug!(name, short = %short_name, parent, is_dir, "registered virtual entry");
        self.nodes.push(VirtualNode {
            name: name.to_string(),
            short_name,
            parent,
            index,
            data,
            modified: SystemTime::now(),
        });
        Ok(index)
    }

    fn remove_tree(&mut self, parent: usize, name: &str) -> bool {
        let Some(pos) = self
            .nodes
            .iter()
            .position(|n| n.parent == parent && n.name.eq_ignore_ascii_case(name))
        else {
            return false;
        };
        let node = self.nodes.remove(pos);
        if node.is_dir() {
            let children: Vec<String> = self
                .nodes
                .iter()
                .filter(|n| n.parent == node.index)
                .map(|n| n.name.clone())
                .collect();
            for child in children {
                self.remove_tree(node.index, &child);
            }
        }
        true
    }
}

/// Shared registry of in-memory resources.
///
/// Clone is cheap (just clones the Arc).
#[derive(Clone, Default)]
pub struct VirtualRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl VirtualRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn parent_index(inner: &RegistryInner, dir: &str) -> DosResult<usize> {
        inner
            .resolve_dir(dir)
            .ok_or_else(|| DosError::PathNotFound(dir.to_string()))
    }

    /// Register a file under the directory `dir` ("" for the root).
    ///
    /// Registering a name twice in one directory keeps the first entry.
    pub fn register_file(&self, name: &str, data: impl Into<Arc<[u8]>>, dir: &str) -> DosResult<()> {
        let mut inner = self.inner.write().map_err(|_| DosError::LockPoisoned)?;
        let parent = Self::parent_index(&inner, dir)?;
        inner.insert(name, parent, data.into(), false)?;
        Ok(())
    }

    /// Register a directory and return its directory index.
    pub fn register_dir(&self, name: &str, parent_dir: &str) -> DosResult<usize> {
        let mut inner = self.inner.write().map_err(|_| DosError::LockPoisoned)?;
        let parent = Self::parent_index(&inner, parent_dir)?;
        inner.insert(name, parent, Arc::from(Vec::new()), true)
    }

    /// Register every missing directory along `path`.
    pub fn ensure_dir(&self, path: &str) -> DosResult<usize> {
        let mut inner = self.inner.write().map_err(|_| DosError::LockPoisoned)?;
        let mut dir = ROOT_DIR;
        for component in path.split(['\\', '/']).filter(|c| !c.is_empty()) {
            let existing = inner.child(dir, component).map(|n| (n.is_dir(), n.index));
            dir = match existing {
                Some((true, index)) => index,
                Some(_) => return Err(DosError::AlreadyExists(component.to_string())),
                None => inner.insert(component, dir, Arc::from(Vec::new()), true)?,
            };
        }
        Ok(dir)
    }

    /// Replace the contents of a registered file.
    ///
    /// Handles opened earlier keep reading the old contents.
    pub fn update(&self, name: &str, dir: &str, data: impl Into<Arc<[u8]>>) -> DosResult<()> {
        let mut inner = self.inner.write().map_err(|_| DosError::LockPoisoned)?;
        let parent = Self::parent_index(&inner, dir)?;
        let node = inner
            .nodes
            .iter_mut()
            .find(|n| n.parent == parent && !n.is_dir() && n.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| DosError::NotFound(name.to_string()))?;
        node.data = data.into();
        node.modified = SystemTime::now();
        debug!(name, "updated virtual file");
        Ok(())
    }

    /// Detach an entry (and a directory's contents); false if unknown.
    pub fn remove(&self, name: &str, dir: &str) -> DosResult<bool> {
        let mut inner = self.inner.write().map_err(|_| DosError::LockPoisoned)?;
        let Some(parent) = inner.resolve_dir(dir) else {
            return Ok(false);
        };
        let removed = inner.remove_tree(parent, name);
        if removed {
            debug!(name, dir, "removed virtual entry");
        }
        Ok(removed)
    }

    /// Look up a path, matching long or short names in any case.
    pub fn find(&self, path: &str) -> Option<VirtualNode> {
        let inner = self.inner.read().ok()?;
        if path.trim_matches(['\\', '/']).is_empty() {
            return None;
        }
        inner.find(path).cloned()
    }

    /// Entries of a directory, most recently registered first.
    pub fn list(&self, dir: &str) -> DosResult<Vec<VirtualNode>> {
        let inner = self.inner.read().map_err(|_| DosError::LockPoisoned)?;
        let index = Self::parent_index(&inner, dir)?;
        Ok(inner
            .nodes
            .iter()
            .rev()
            .filter(|n| n.parent == index)
            .cloned()
            .collect())
    }

    pub fn is_directory(&self, path: &str) -> bool {
        self.inner
            .read()
            .map(|inner| inner.resolve_dir(path).is_some())
            .unwrap_or(false)
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.inner.read().map(|inner| inner.nodes.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A drive serving a [`VirtualRegistry`].
pub struct VirtualDrive {
    registry: VirtualRegistry,
    sorted: bool,
    label: String,
}

impl VirtualDrive {
    pub fn new(registry: VirtualRegistry) -> Self {
        Self {
            registry,
            sorted: false,
            label: String::new(),
        }
    }

    /// List entries by short name instead of newest first.
    pub fn with_sorted(mut self, sorted: bool) -> Self {
        self.sorted = sorted;
        self
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = format_label(label, false);
        self
    }

    pub fn registry(&self) -> &VirtualRegistry {
        &self.registry
    }

    fn denied(name: &str) -> DosError {
        DosError::AccessDenied(name.to_string())
    }

    fn dot_entry(name: &str) -> FindEntry {
        let (date, time) = pack_dos_datetime(SystemTime::now());
        FindEntry {
            name: name.to_string(),
            size: 0,
            date,
            time,
            attributes: FatAttributes::DIRECTORY,
        }
    }
}

impl Drive for VirtualDrive {
    fn info(&self) -> String {
        format!("virtual drive ({} entries)", self.registry.len())
    }

    fn open(&mut self, name: &str, mode: OpenMode) -> DosResult<Box<dyn DosFile>> {
        let path = normalize_dos_path(name)?;
        if mode.can_write() {
            return Err(Self::denied(&path));
        }
        match self.registry.find(&path) {
            Some(node) if !node.is_dir() => Ok(Box::new(VirtualFile::new(&path, node.data()))),
            _ => Err(DosError::NotFound(path)),
        }
    }

    fn create(&mut self, name: &str, _attributes: FatAttributes) -> DosResult<Box<dyn DosFile>> {
        Err(Self::denied(name))
    }

    fn unlink(&mut self, name: &str) -> DosResult<()> {
        Err(Self::denied(name))
    }

    fn make_directory(&mut self, dir: &str) -> DosResult<()> {
        Err(Self::denied(dir))
    }

    fn remove_directory(&mut self, dir: &str) -> DosResult<()> {
        Err(Self::denied(dir))
    }

    fn test_directory(&mut self, dir: &str) -> bool {
        match normalize_dos_path(dir) {
            Ok(path) => self.registry.is_directory(&path),
            Err(_) => false,
        }
    }

    fn find_first(&mut self, pattern: &str, attributes: FatAttributes) -> DosResult<SearchHandle> {
        let path = normalize_dos_path(pattern)?;
        let (dir, wild) = split_parent(&path);
        let wild = if wild.is_empty() { "*.*" } else { wild };

        if attributes == FatAttributes::VOLUME {
            let mut handle = SearchHandle::new(dir, wild, attributes, SearchState::Done);
            if !self.label.is_empty() {
                handle.label = Some(label_entry(&self.label));
            }
            return Ok(handle);
        }

        let mut nodes = self.registry.list(dir)?;
        if self.sorted {
            nodes.sort_by(|a, b| (!a.is_dir(), a.short_name()).cmp(&(!b.is_dir(), b.short_name())));
        }

        let mut entries = VecDeque::new();
        if !dir.is_empty() {
            entries.push_back(Self::dot_entry("."));
            entries.push_back(Self::dot_entry(".."));
        }
        for node in &nodes {
            let stat = node.stat();
            entries.push_back(FindEntry {
                name: node.short_name().to_string(),
                size: stat.size.min(u32::MAX as u64) as u32,
                date: stat.date,
                time: stat.time,
                attributes: stat.attributes,
            });
        }
        entries.retain(|e| wild_file_cmp(&e.name, wild) && attributes.admits(e.attributes));

        let mut handle = SearchHandle::new(dir, wild, attributes, SearchState::Listing(entries));
        if attributes.contains(FatAttributes::VOLUME)
            && dir.is_empty()
            && !self.label.is_empty()
            && wild_file_cmp(&self.label, wild)
        {
            handle.label = Some(label_entry(&self.label));
        }
        Ok(handle)
    }

    fn find_next(&mut self, handle: &mut SearchHandle) -> Option<FindEntry> {
        if let Some(label) = handle.label.take() {
            return Some(label);
        }
        match &mut handle.state {
            SearchState::Listing(entries) => entries.pop_front(),
            _ => None,
        }
    }

    fn get_attributes(&mut self, name: &str) -> DosResult<FatAttributes> {
        Ok(self.file_stat(name)?.attributes)
    }

    fn set_attributes(&mut self, name: &str, _attributes: FatAttributes) -> DosResult<()> {
        Err(Self::denied(name))
    }

    fn rename(&mut self, old: &str, _new: &str) -> DosResult<()> {
        Err(Self::denied(old))
    }

    fn file_exists(&mut self, name: &str) -> bool {
        normalize_dos_path(name)
            .ok()
            .and_then(|path| self.registry.find(&path))
            .is_some_and(|node| !node.is_dir())
    }

    fn file_stat(&mut self, name: &str) -> DosResult<FileStat> {
        let path = normalize_dos_path(name)?;
        if path.is_empty() {
            let (date, time) = pack_dos_datetime(SystemTime::now());
            return Ok(FileStat {
                size: 0,
                date,
                time,
                attributes: FatAttributes::DIRECTORY,
            });
        }
        self.registry
            .find(&path)
            .map(|node| node.stat())
            .ok_or(DosError::NotFound(path))
    }

    fn allocation_info(&self) -> AllocationInfo {
        AllocationInfo {
            bytes_per_sector: 2048,
            sectors_per_cluster: 32,
            total_clusters: 32765,
            free_clusters: 0,
        }
    }

    fn media_id(&self) -> u8 {
        0xF8
    }

    fn label(&self) -> String {
        self.label.clone()
    }
}

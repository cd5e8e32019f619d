//! Per-drive cache of host directory listings.
//!
//! Directories are read from the host lazily, the first time a path
//! walks through them. Each cached entry carries its host long name and
//! a stable 8.3 short name; lookups from DOS go short-to-long.
//!
//! Directory searches run against a snapshot taken when the search is
//! opened, held in a bounded pool of sessions. When the pool is full the
//! oldest session is recycled and its id stops producing results.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::host::{HostIo, StdHostIo};
use super::names::split_parent;
use super::short_name::{self, Candidate, NumberedNames};
use crate::error::{DosError, DosResult};

/// Default number of concurrently open directory searches.
pub const MAX_OPEN_DIRS: usize = 2048;

/// Handle to a cached directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(usize);

/// Handle to an open directory search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SearchId(u32);

/// Order in which directory searches report entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Host listing order, later additions last.
    Unsorted,
    Alphabetical,
    #[default]
    DirectoriesFirst,
    AlphabeticalReverse,
    DirectoriesFirstReverse,
}

impl SortOrder {
    fn compare(self, a: &DirItem, b: &DirItem) -> Ordering {
        // `.` and `..` always lead
        let rank = |item: &DirItem| match item.short_name.as_str() {
            "." => 0,
            ".." => 1,
            _ => 2,
        };
        let by_rank = rank(a).cmp(&rank(b));
        match self {
            SortOrder::Unsorted => by_rank,
            SortOrder::Alphabetical => by_rank.then_with(|| a.short_name.cmp(&b.short_name)),
            SortOrder::DirectoriesFirst => by_rank
                .then_with(|| b.is_dir.cmp(&a.is_dir))
                .then_with(|| a.short_name.cmp(&b.short_name)),
            SortOrder::AlphabeticalReverse => by_rank.then_with(|| b.short_name.cmp(&a.short_name)),
            SortOrder::DirectoriesFirstReverse => by_rank
                .then_with(|| b.is_dir.cmp(&a.is_dir))
                .then_with(|| b.short_name.cmp(&a.short_name)),
        }
    }
}

/// A directory entry as reported to searches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirItem {
    pub short_name: String,
    pub long_name: String,
    pub is_dir: bool,
}

#[derive(Debug, Default)]
struct CacheEntry {
    long_name: String,
    short_name: String,
    short_nr: u32,
    legacy_alias: String,
    is_dir: bool,
    cached: bool,
    overlay_dir: bool,
    /// Sorted by short name.
    children: Vec<EntryId>,
    /// Insertion order of `children`.
    listed: Vec<EntryId>,
    /// Children with a generated `~N` name, sorted by short name.
    numbered: Vec<EntryId>,
    by_long: HashMap<String, EntryId>,
}

impl CacheEntry {
    fn new(long_name: &str, short_name: String, short_nr: u32, is_dir: bool) -> Self {
        let legacy_alias = if long_name == "." || long_name == ".." {
            String::new()
        } else {
            short_name::legacy_short_name(long_name)
        };
        Self {
            long_name: long_name.to_string(),
            short_name,
            short_nr,
            legacy_alias,
            is_dir,
            ..Default::default()
        }
    }

    fn root() -> Self {
        Self {
            is_dir: true,
            ..Default::default()
        }
    }
}

struct NumberedView<'a> {
    entries: &'a [CacheEntry],
    ids: &'a [EntryId],
}

impl NumberedNames for NumberedView<'_> {
    fn count(&self) -> usize {
        self.ids.len()
    }

    fn short_name_at(&self, index: usize) -> &str {
        &self.entries[self.ids[index].0].short_name
    }

    fn short_number_at(&self, index: usize) -> u32 {
        self.entries[self.ids[index].0].short_nr
    }
}

struct SearchSession {
    id: SearchId,
    /// Directory still receiving insertions; `None` once it left the cache.
    dir: Option<EntryId>,
    order: SortOrder,
    items: Vec<DirItem>,
    next: usize,
    opened: u64,
}

#[derive(Clone)]
struct Resolved {
    dir: EntryId,
    host_path: PathBuf,
    /// Every component resolved and the last one is a directory.
    complete: bool,
}

/// Cache of one drive's host directory tree.
pub struct DirectoryCache {
    host: Arc<dyn HostIo>,
    base_dir: PathBuf,
    entries: Vec<CacheEntry>,
    free: Vec<usize>,
    root: EntryId,
    last_lookup: Option<(String, Resolved)>,
    sessions: Vec<Option<SearchSession>>,
    session_limit: usize,
    next_search_id: u32,
    open_counter: u64,
    sort_order: SortOrder,
}

impl DirectoryCache {
    /// Create a cache over a host directory.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self::with_host(base_dir, Arc::new(StdHostIo))
    }

    /// Create a cache with a custom host listing source.
    pub fn with_host(base_dir: impl Into<PathBuf>, host: Arc<dyn HostIo>) -> Self {
        let mut cache = Self {
            host,
            base_dir: base_dir.into(),
            entries: Vec::new(),
            free: Vec::new(),
            root: EntryId(0),
            last_lookup: None,
            sessions: Vec::new(),
            session_limit: MAX_OPEN_DIRS,
            next_search_id: 1,
            open_counter: 0,
            sort_order: SortOrder::default(),
        };
        cache.root = cache.alloc(CacheEntry::root());
        cache
    }

    /// Limit the number of concurrently open searches.
    pub fn with_session_limit(mut self, limit: usize) -> Self {
        self.session_limit = limit.max(1);
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn sort_order(&self) -> SortOrder {
        self.sort_order
    }

    pub fn set_sort_order(&mut self, order: SortOrder) {
        self.sort_order = order;
    }

    fn alloc(&mut self, entry: CacheEntry) -> EntryId {
        match self.free.pop() {
            Some(index) => {
                self.entries[index] = entry;
                EntryId(index)
            }
            None => {
                self.entries.push(entry);
                EntryId(self.entries.len() - 1)
            }
        }
    }

    fn release(&mut self, id: EntryId) {
        self.release_children(id);
        self.entries[id.0] = CacheEntry::default();
        self.free.push(id.0);
        for session in self.sessions.iter_mut().flatten() {
            if session.dir == Some(id) {
                session.dir = None;
            }
        }
    }

    fn release_children(&mut self, dir: EntryId) {
        let children = std::mem::take(&mut self.entries[dir.0].children);
        let entry = &mut self.entries[dir.0];
        entry.listed.clear();
        entry.numbered.clear();
        entry.by_long.clear();
        for child in children {
            self.release(child);
        }
    }

    fn clear_directory(&mut self, dir: EntryId) {
        self.release_children(dir);
        let entry = &mut self.entries[dir.0];
        entry.cached = entry.overlay_dir;
        if entry.overlay_dir {
            self.push_dot_entries(dir);
        }
        self.last_lookup = None;
    }

    fn insert_child(&mut self, dir: EntryId, id: EntryId) {
        let entries = &self.entries;
        let child = &entries[id.0];
        let by_short = |ids: &[EntryId]| {
            ids.partition_point(|c| entries[c.0].short_name.as_str() <= child.short_name.as_str())
        };
        let pos = by_short(&entries[dir.0].children);
        let numbered_pos = (child.short_nr > 0).then(|| by_short(&entries[dir.0].numbered));
        let long_name = child.long_name.clone();

        let parent = &mut self.entries[dir.0];
        parent.children.insert(pos, id);
        parent.listed.push(id);
        if let Some(pos) = numbered_pos {
            parent.numbered.insert(pos, id);
        }
        parent.by_long.insert(long_name, id);
    }

    fn push_dot_entries(&mut self, dir: EntryId) {
        for name in [".", ".."] {
            let id = self.alloc(CacheEntry::new(name, name.to_string(), 0, true));
            self.insert_child(dir, id);
        }
    }

    fn find_child(&self, dir: EntryId, short: &str) -> Option<EntryId> {
        let children = &self.entries[dir.0].children;
        children
            .binary_search_by(|c| self.entries[c.0].short_name.as_str().cmp(short))
            .ok()
            .map(|index| children[index])
    }

    /// Short-to-long lookup within one directory, with the legacy alias
    /// as a fallback.
    fn lookup(&self, dir: EntryId, name: &str) -> Option<EntryId> {
        let mut short = name.to_ascii_uppercase();
        short_name::remove_trailing_dot(&mut short);
        if let Some(id) = self.find_child(dir, &short) {
            return Some(id);
        }
        if !short_name::is_legacy_shape(&short) {
            return None;
        }
        self.entries[dir.0]
            .children
            .iter()
            .copied()
            .find(|c| self.entries[c.0].legacy_alias == short)
    }

    fn make_short_name(&self, dir: EntryId, long_name: &str) -> DosResult<(String, u32)> {
        if long_name == "." || long_name == ".." {
            return Ok((long_name.to_string(), 0));
        }
        let candidate = Candidate::new(long_name);
        let verbatim = candidate.verbatim();
        if !candidate.force_tail && self.find_child(dir, &verbatim).is_none() {
            return Ok((verbatim, 0));
        }

        let mut nr = short_name::next_short_number(
            &NumberedView {
                entries: &self.entries,
                ids: &self.entries[dir.0].numbered,
            },
            &candidate.name,
        );
        loop {
            let mut short = candidate.with_tail(nr)?;
            short_name::remove_trailing_dot(&mut short);
            // A host file may literally be called `NAME~1.TXT`
            if self.find_child(dir, &short).is_none() {
                return Ok((short, nr));
            }
            nr += 1;
        }
    }

    fn create_entry(&mut self, dir: EntryId, long_name: &str, is_dir: bool) -> DosResult<EntryId> {
        let (short, nr) = self.make_short_name(dir, long_name)?;
        trace!(long = long_name, short = %short, "assigned short name");
        let id = self.alloc(CacheEntry::new(long_name, short, nr, is_dir));
        self.insert_child(dir, id);
        Ok(id)
    }

    /// Read a directory from the host if it is not cached yet.
    ///
    /// Returns false when the host directory cannot be listed.
    fn cache_in(&mut self, dir: EntryId, host_path: &Path) -> DosResult<bool> {
        if self.entries[dir.0].cached {
            return Ok(true);
        }
        let mut listing = match self.host.read_dir(host_path) {
            Ok(listing) => listing,
            Err(err) => {
                debug!(path = %host_path.display(), %err, "cannot list host directory");
                return Ok(false);
            }
        };
        listing.sort_by(|a, b| a.name.cmp(&b.name));

        if dir != self.root {
            self.push_dot_entries(dir);
        }
        for item in &listing {
            if let Err(err) = self.create_entry(dir, &item.name, item.is_dir) {
                self.release_children(dir);
                return Err(err);
            }
        }
        self.entries[dir.0].cached = true;
        debug!(path = %host_path.display(), entries = listing.len(), "cached host directory");
        Ok(true)
    }

    fn resolve(&mut self, path: &str) -> DosResult<Resolved> {
        let path = path.trim_matches('\\').to_ascii_uppercase();
        if let Some((last, resolved)) = &self.last_lookup {
            if *last == path {
                return Ok(resolved.clone());
            }
        }

        let mut dir = self.root;
        let mut host_path = self.base_dir.clone();
        let mut complete = self.cache_in(dir, &host_path)?;

        for component in path.split('\\').filter(|c| !c.is_empty()) {
            match self.lookup(dir, component) {
                Some(child) => {
                    host_path.push(&self.entries[child.0].long_name);
                    if self.entries[child.0].is_dir {
                        dir = child;
                        if !self.cache_in(dir, &host_path)? {
                            complete = false;
                        }
                    } else {
                        complete = false;
                    }
                }
                None => {
                    host_path.push(component);
                    complete = false;
                }
            }
        }

        let resolved = Resolved {
            dir,
            host_path,
            complete,
        };
        self.last_lookup = Some((path, resolved.clone()));
        Ok(resolved)
    }

    /// Walk a DOS path, caching directories on the way.
    ///
    /// Returns the deepest directory reached and the host path built from
    /// the long names of every resolved component. Unresolved components
    /// are appended as given.
    pub fn find_directory(&mut self, path: &str) -> DosResult<(EntryId, PathBuf)> {
        let resolved = self.resolve(path)?;
        Ok((resolved.dir, resolved.host_path))
    }

    /// Host path for a DOS path.
    pub fn expand_name(&mut self, path: &str) -> DosResult<PathBuf> {
        Ok(self.resolve(path)?.host_path)
    }

    /// Whether a DOS path names a directory known to the cache.
    pub fn is_directory(&mut self, path: &str) -> DosResult<bool> {
        Ok(self.resolve(path)?.complete)
    }

    /// Short name of a host entry inside a DOS directory.
    pub fn get_short_name(&mut self, dir_path: &str, long_name: &str) -> DosResult<Option<String>> {
        let resolved = self.resolve(dir_path)?;
        if !resolved.complete {
            return Ok(None);
        }
        Ok(self.entries[resolved.dir.0]
            .by_long
            .get(long_name)
            .map(|id| self.entries[id.0].short_name.clone()))
    }

    /// Long name behind a short name inside a DOS directory.
    pub fn get_long_name(&mut self, dir_path: &str, short: &str) -> DosResult<Option<String>> {
        let resolved = self.resolve(dir_path)?;
        if !resolved.complete {
            return Ok(None);
        }
        Ok(self
            .lookup(resolved.dir, short)
            .map(|id| self.entries[id.0].long_name.clone()))
    }

    /// Look up the entry a DOS path names.
    pub fn lookup_path(&mut self, path: &str) -> DosResult<Option<DirItem>> {
        let path = path.trim_matches('\\');
        let (parent, name) = split_parent(path);
        if name.is_empty() {
            return Ok(None);
        }
        let resolved = self.resolve(parent)?;
        if !resolved.complete {
            return Ok(None);
        }
        Ok(self.lookup(resolved.dir, name).map(|id| self.item(id)))
    }

    /// Register a file created through DOS.
    ///
    /// With `check_exists`, an entry already resolvable under that name
    /// is left alone.
    pub fn add_entry(&mut self, path: &str, check_exists: bool) -> DosResult<()> {
        self.add(path, check_exists, false)
    }

    /// Register a directory that exists only outside the host tree.
    ///
    /// The entry is marked cached so it is never read from the host.
    pub fn add_directory_entry(&mut self, path: &str, check_exists: bool) -> DosResult<()> {
        self.add(path, check_exists, true)
    }

    fn add(&mut self, path: &str, check_exists: bool, overlay_dir: bool) -> DosResult<()> {
        let path = path.trim_matches('\\');
        let (parent, name) = split_parent(path);
        if name.is_empty() {
            return Ok(());
        }
        let resolved = self.resolve(parent)?;
        if !resolved.complete {
            debug!(path, "parent not cached, entry left for the next listing");
            return Ok(());
        }
        let dir = resolved.dir;
        if check_exists && self.lookup(dir, name).is_some() {
            return Ok(());
        }
        if self.entries[dir.0].by_long.contains_key(name) {
            debug!(path, "long name already cached");
            return Ok(());
        }

        let id = self.create_entry(dir, name, overlay_dir)?;
        if overlay_dir {
            let entry = &mut self.entries[id.0];
            entry.overlay_dir = true;
            entry.cached = true;
            self.push_dot_entries(id);
        }
        self.last_lookup = None;
        self.note_insertion(dir, id);
        Ok(())
    }

    /// Keep open searches on `dir` consistent with a new entry.
    ///
    /// Entries landing before the cursor are counted as already reported.
    fn note_insertion(&mut self, dir: EntryId, id: EntryId) {
        let item = self.item(id);
        for session in self.sessions.iter_mut().flatten() {
            if session.dir != Some(dir) {
                continue;
            }
            let order = session.order;
            let pos = session
                .items
                .partition_point(|other| order.compare(other, &item) != Ordering::Greater);
            session.items.insert(pos, item.clone());
            if pos < session.next {
                session.next += 1;
            }
        }
    }

    /// Drop a cached directory so the next access re-reads the host.
    ///
    /// With `ignore_last_component` the parent of `path` is dropped.
    pub fn delete_entry(&mut self, path: &str, ignore_last_component: bool) -> DosResult<()> {
        let path = path.trim_matches('\\');
        let target = if ignore_last_component {
            split_parent(path).0
        } else {
            path
        };
        let resolved = self.resolve(target)?;
        self.clear_directory(resolved.dir);
        debug!(path = target, "dropped cached directory");
        Ok(())
    }

    /// Forget everything; open searches keep their snapshots.
    pub fn empty_cache(&mut self) {
        self.entries.clear();
        self.free.clear();
        self.root = self.alloc(CacheEntry::root());
        self.last_lookup = None;
        for session in self.sessions.iter_mut().flatten() {
            session.dir = None;
        }
        debug!(base = %self.base_dir.display(), "emptied directory cache");
    }

    fn item(&self, id: EntryId) -> DirItem {
        let entry = &self.entries[id.0];
        DirItem {
            short_name: entry.short_name.clone(),
            long_name: entry.long_name.clone(),
            is_dir: entry.is_dir,
        }
    }

    fn snapshot(&self, dir: EntryId) -> Vec<DirItem> {
        let entry = &self.entries[dir.0];
        let mut items: Vec<DirItem> = match self.sort_order {
            SortOrder::Unsorted => entry.listed.iter().map(|&id| self.item(id)).collect(),
            _ => entry.children.iter().map(|&id| self.item(id)).collect(),
        };
        let order = self.sort_order;
        items.sort_by(|a, b| order.compare(a, b));
        items
    }

    /// All entries of a directory in the current sort order.
    pub fn list_directory(&mut self, path: &str) -> DosResult<Vec<DirItem>> {
        let resolved = self.resolve(path)?;
        if !resolved.complete {
            return Err(DosError::PathNotFound(path.to_string()));
        }
        Ok(self.snapshot(resolved.dir))
    }

    fn claim_slot(&mut self) -> usize {
        if let Some(free) = self.sessions.iter().position(Option::is_none) {
            return free;
        }
        if self.sessions.len() < self.session_limit {
            self.sessions.push(None);
            return self.sessions.len() - 1;
        }
        let oldest = self
            .sessions
            .iter()
            .enumerate()
            .filter_map(|(slot, s)| s.as_ref().map(|s| (slot, s.opened, s.id)))
            .min_by_key(|&(_, opened, _)| opened);
        match oldest {
            Some((slot, _, id)) => {
                warn!(
                    limit = self.session_limit,
                    recycled = ?id,
                    "all directory search slots in use, recycling the oldest"
                );
                slot
            }
            None => 0,
        }
    }

    /// Start a search over a directory.
    pub fn open_directory(&mut self, path: &str) -> DosResult<SearchId> {
        let resolved = self.resolve(path)?;
        if !resolved.complete {
            return Err(DosError::PathNotFound(path.to_string()));
        }
        let items = self.snapshot(resolved.dir);
        let slot = self.claim_slot();

        let id = SearchId(self.next_search_id);
        self.next_search_id = self.next_search_id.wrapping_add(1).max(1);
        self.open_counter += 1;
        trace!(?id, path, entries = items.len(), "opened directory search");
        self.sessions[slot] = Some(SearchSession {
            id,
            dir: Some(resolved.dir),
            order: self.sort_order,
            items,
            next: 0,
            opened: self.open_counter,
        });
        Ok(id)
    }

    /// Next entry of a search; `None` ends the search.
    ///
    /// Ids of recycled or finished searches always return `None`.
    pub fn read_next(&mut self, id: SearchId) -> Option<DirItem> {
        let slot = self
            .sessions
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.id == id))?;
        let session = self.sessions[slot].as_mut()?;
        if let Some(item) = session.items.get(session.next).cloned() {
            session.next += 1;
            return Some(item);
        }
        self.sessions[slot] = None;
        None
    }

    /// Release a search before it ran out.
    pub fn close_directory(&mut self, id: SearchId) {
        for slot in self.sessions.iter_mut() {
            if slot.as_ref().is_some_and(|s| s.id == id) {
                *slot = None;
            }
        }
    }

    /// Number of searches currently holding a slot.
    pub fn open_sessions(&self) -> usize {
        self.sessions.iter().flatten().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::HostDirEntry;
    use std::fs;

    fn host_tree(files: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in files {
            let path = dir.path().join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(path, name.as_bytes()).unwrap();
        }
        dir
    }

    /// Host that lists the same names for every directory, in the given order.
    struct FixedListing(Vec<&'static str>);

    impl HostIo for FixedListing {
        fn read_dir(&self, _path: &Path) -> std::io::Result<Vec<HostDirEntry>> {
            Ok(self
                .0
                .iter()
                .map(|name| HostDirEntry {
                    name: name.to_string(),
                    is_dir: false,
                })
                .collect())
        }
    }

    fn short_names(cache: &mut DirectoryCache, path: &str) -> Vec<String> {
        cache
            .list_directory(path)
            .unwrap()
            .into_iter()
            .map(|item| item.short_name)
            .collect()
    }

    #[test]
    fn test_short_names_for_host_listing() {
        let host = host_tree(&["readme.txt", "longfilename1.txt", "longfilename2.txt", "longfilename3.txt"]);
        let mut cache = DirectoryCache::new(host.path());

        assert_eq!(cache.get_short_name("", "readme.txt").unwrap().as_deref(), Some("README.TXT"));
        assert_eq!(cache.get_short_name("", "longfilename1.txt").unwrap().as_deref(), Some("LONGFI~1.TXT"));
        assert_eq!(cache.get_short_name("", "longfilename2.txt").unwrap().as_deref(), Some("LONGFI~2.TXT"));
        assert_eq!(cache.get_short_name("", "longfilename3.txt").unwrap().as_deref(), Some("LONGFI~3.TXT"));
        assert_eq!(cache.get_long_name("", "LONGFI~2.TXT").unwrap().as_deref(), Some("longfilename2.txt"));
    }

    #[test]
    fn test_colliding_names_get_distinct_tails() {
        let host = host_tree(&["My Document.Text", "MYDOCUMENT.TEX"]);
        let mut cache = DirectoryCache::new(host.path());

        let a = cache.get_short_name("", "MYDOCUMENT.TEX").unwrap().unwrap();
        let b = cache.get_short_name("", "My Document.Text").unwrap().unwrap();
        assert_eq!(a, "MYDOCU~1.TEX");
        assert_eq!(b, "MYDOCU~2.TEX");
        assert_eq!(cache.get_long_name("", &b).unwrap().as_deref(), Some("My Document.Text"));
    }

    #[test]
    fn test_case_collision_on_host() {
        let host = tempfile::tempdir().unwrap();
        fs::write(host.path().join("README.TXT"), b"upper").unwrap();
        fs::write(host.path().join("readme.txt"), b"lower").unwrap();
        // Case-insensitive host filesystems keep a single file
        if fs::read_dir(host.path()).unwrap().count() < 2 {
            return;
        }
        let mut cache = DirectoryCache::new(host.path());
        assert_eq!(cache.get_short_name("", "README.TXT").unwrap().as_deref(), Some("README.TXT"));
        assert_eq!(cache.get_short_name("", "readme.txt").unwrap().as_deref(), Some("README~1.TXT"));
    }

    #[test]
    fn test_expand_name_uses_long_names() {
        let host = host_tree(&["Program Files/Some Tool/config.ini"]);
        let mut cache = DirectoryCache::new(host.path());

        let expanded = cache.expand_name("PROGRA~1\\SOMETO~1\\CONFIG.INI").unwrap();
        assert_eq!(expanded, host.path().join("Program Files").join("Some Tool").join("config.ini"));
        assert!(cache.is_directory("PROGRA~1\\SOMETO~1").unwrap());
        assert!(!cache.is_directory("PROGRA~1\\MISSING").unwrap());

        // Unresolved components are passed through
        let expanded = cache.expand_name("PROGRA~1\\NEWFILE.TXT").unwrap();
        assert_eq!(expanded, host.path().join("Program Files").join("NEWFILE.TXT"));
    }

    #[test]
    fn test_legacy_alias_lookup() {
        let host = host_tree(&["Program Files/x.txt"]);
        let mut cache = DirectoryCache::new(host.path());

        let alias = short_name::legacy_short_name("Program Files");
        assert_eq!(cache.get_long_name("", &alias).unwrap().as_deref(), Some("Program Files"));
        assert!(cache.is_directory(&alias).unwrap());
    }

    #[test]
    fn test_dot_entries_in_subdirectories() {
        let host = host_tree(&["sub/a.txt"]);
        let mut cache = DirectoryCache::new(host.path());

        assert_eq!(short_names(&mut cache, ""), vec!["SUB"]);
        assert_eq!(short_names(&mut cache, "SUB"), vec![".", "..", "A.TXT"]);
    }

    #[test]
    fn test_directories_first_ordering() {
        let host = host_tree(&["b.txt", "zdir/x", "a.txt"]);
        let mut cache = DirectoryCache::new(host.path());
        assert_eq!(short_names(&mut cache, ""), vec!["ZDIR", "A.TXT", "B.TXT"]);

        cache.set_sort_order(SortOrder::Alphabetical);
        assert_eq!(short_names(&mut cache, ""), vec!["A.TXT", "B.TXT", "ZDIR"]);

        cache.set_sort_order(SortOrder::AlphabeticalReverse);
        assert_eq!(short_names(&mut cache, ""), vec!["ZDIR", "B.TXT", "A.TXT"]);
    }

    #[test]
    fn test_add_entry_is_idempotent() {
        let host = host_tree(&["a.txt"]);
        let mut cache = DirectoryCache::new(host.path());
        cache.list_directory("").unwrap();

        fs::write(host.path().join("NEW.TXT"), b"n").unwrap();
        cache.add_entry("NEW.TXT", true).unwrap();
        cache.add_entry("NEW.TXT", true).unwrap();
        assert_eq!(short_names(&mut cache, ""), vec!["A.TXT", "NEW.TXT"]);
    }

    #[test]
    fn test_rebuild_order_does_not_change_mapping() {
        let names = vec![
            "longfilename_c.txt",
            "My Document.Text",
            "longfilename_a.txt",
            "MYDOCUMENT.TEX",
            "longfilename_b.txt",
        ];
        let reversed: Vec<&'static str> = names.iter().rev().copied().collect();
        let mut forward = DirectoryCache::with_host("/fixed", Arc::new(FixedListing(names.clone())));
        let mut backward = DirectoryCache::with_host("/fixed", Arc::new(FixedListing(reversed)));

        for name in &names {
            let a = forward.get_short_name("", name).unwrap();
            let b = backward.get_short_name("", name).unwrap();
            assert_eq!(a, b, "{} mapped differently", name);
        }
        assert_eq!(forward.get_short_name("", "longfilename_a.txt").unwrap().as_deref(), Some("LONGFI~1.TXT"));
        assert_eq!(forward.get_short_name("", "longfilename_c.txt").unwrap().as_deref(), Some("LONGFI~3.TXT"));
        assert_eq!(forward.get_short_name("", "MYDOCUMENT.TEX").unwrap().as_deref(), Some("MYDOCU~1.TEX"));
        assert_eq!(backward.get_long_name("", "MYDOCU~2.TEX").unwrap().as_deref(), Some("My Document.Text"));
    }

    #[test]
    fn test_add_entry_without_check_keeps_one_child() {
        let host = host_tree(&["a.txt"]);
        let mut cache = DirectoryCache::new(host.path());
        cache.list_directory("").unwrap();

        fs::write(host.path().join("Long Name.txt"), b"n").unwrap();
        cache.add_entry("Long Name.txt", false).unwrap();
        cache.add_entry("Long Name.txt", false).unwrap();
        assert_eq!(short_names(&mut cache, ""), vec!["A.TXT", "LONGNA~1.TXT"]);
        assert_eq!(cache.get_long_name("", "LONGNA~1.TXT").unwrap().as_deref(), Some("Long Name.txt"));
    }

    #[test]
    fn test_add_directory_entry_is_cached() {
        let host = host_tree(&["a.txt"]);
        let mut cache = DirectoryCache::new(host.path());

        cache.add_directory_entry("ONLYUP", true).unwrap();
        assert!(cache.is_directory("ONLYUP").unwrap());
        assert_eq!(short_names(&mut cache, "ONLYUP"), vec![".", ".."]);

        cache.add_entry("ONLYUP\\NOTE.TXT", true).unwrap();
        assert_eq!(short_names(&mut cache, "ONLYUP"), vec![".", "..", "NOTE.TXT"]);
    }

    #[test]
    fn test_delete_entry_rereads_host() {
        let host = host_tree(&["a.txt", "b.txt"]);
        let mut cache = DirectoryCache::new(host.path());
        assert_eq!(short_names(&mut cache, ""), vec!["A.TXT", "B.TXT"]);

        fs::remove_file(host.path().join("b.txt")).unwrap();
        assert_eq!(short_names(&mut cache, ""), vec!["A.TXT", "B.TXT"]);

        cache.delete_entry("B.TXT", true).unwrap();
        assert_eq!(short_names(&mut cache, ""), vec!["A.TXT"]);
    }

    #[test]
    fn test_search_sessions() {
        let host = host_tree(&["a.txt", "b.txt"]);
        let mut cache = DirectoryCache::new(host.path());

        let id = cache.open_directory("").unwrap();
        assert_eq!(cache.read_next(id).unwrap().short_name, "A.TXT");
        assert_eq!(cache.read_next(id).unwrap().short_name, "B.TXT");
        assert!(cache.read_next(id).is_none());
        assert!(cache.read_next(id).is_none());
        assert_eq!(cache.open_sessions(), 0);
    }

    #[test]
    fn test_open_missing_directory() {
        let host = host_tree(&["a.txt"]);
        let mut cache = DirectoryCache::new(host.path());
        assert!(matches!(cache.open_directory("NOPE"), Err(DosError::PathNotFound(_))));
        assert!(matches!(cache.open_directory("A.TXT"), Err(DosError::PathNotFound(_))));
        assert_eq!(short_names(&mut cache, ""), vec!["A.TXT"]);
    }

    #[test]
    fn test_session_pool_recycles_oldest() {
        let host = host_tree(&["a.txt"]);
        let mut cache = DirectoryCache::new(host.path()).with_session_limit(4);

        let ids: Vec<SearchId> = (0..4).map(|_| cache.open_directory("").unwrap()).collect();
        let fifth = cache.open_directory("").unwrap();
        assert_eq!(cache.open_sessions(), 4);

        assert!(cache.read_next(ids[0]).is_none());
        for id in &ids[1..] {
            assert_eq!(cache.read_next(*id).unwrap().short_name, "A.TXT");
        }
        assert_eq!(cache.read_next(fifth).unwrap().short_name, "A.TXT");
    }

    #[test]
    fn test_add_entry_during_search() {
        let host = host_tree(&["b.txt", "d.txt"]);
        let mut cache = DirectoryCache::new(host.path());

        let id = cache.open_directory("").unwrap();
        assert_eq!(cache.read_next(id).unwrap().short_name, "B.TXT");

        // Sorts before the cursor: treated as seen
        cache.add_entry("A.TXT", true).unwrap();
        // Sorts after the cursor: reported
        cache.add_entry("C.TXT", true).unwrap();

        assert_eq!(cache.read_next(id).unwrap().short_name, "C.TXT");
        assert_eq!(cache.read_next(id).unwrap().short_name, "D.TXT");
        assert!(cache.read_next(id).is_none());
    }

    #[test]
    fn test_unsorted_keeps_insertion_order() {
        let host = host_tree(&["b.txt", "a.txt"]);
        let mut cache = DirectoryCache::new(host.path());
        cache.set_sort_order(SortOrder::Unsorted);
        cache.list_directory("").unwrap();
        cache.add_entry("0.TXT", true).unwrap();
        assert_eq!(short_names(&mut cache, ""), vec!["A.TXT", "B.TXT", "0.TXT"]);
    }

    #[test]
    fn test_empty_cache_keeps_snapshots() {
        let host = host_tree(&["a.txt", "b.txt"]);
        let mut cache = DirectoryCache::new(host.path());
        let id = cache.open_directory("").unwrap();
        cache.empty_cache();
        assert_eq!(cache.read_next(id).unwrap().short_name, "A.TXT");
        assert_eq!(cache.get_short_name("", "b.txt").unwrap().as_deref(), Some("B.TXT"));
    }
}

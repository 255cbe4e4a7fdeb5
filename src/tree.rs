//! In-memory model of one storage: folders and files keyed by absolute POSIX
//! path, with a bounded LRU of recently resolved paths and a lazy per-folder
//! refresh policy.
//!
//! The tree never holds owning pointers in both directions: nodes live in an
//! id-keyed arena, parents own the child id list and children carry a plain
//! parent id back. Node ids are never reused, so a stale cache entry simply
//! misses and resolution falls back to walking the tree.

use derivative::Derivative;
use log::{debug, warn};
use lru::LruCache;
use std::borrow::Cow;
use std::collections::HashMap;
use std::num::NonZeroUsize;

use crate::device::{ObjectInfo, StorageInfo};
use crate::error::Error;
use crate::filetypes::Filetype;
use crate::Result;

/// Fixed capacity of the per-storage path cache.
pub const PATH_CACHE_SIZE: usize = 10_000;

/// Item id used for files created locally but not yet uploaded.
pub const PLACEHOLDER_ITEM_ID: i64 = -9999;

/// Characters most devices refuse in object names.
const BAD_PATH_CHARS: &[char] = &[':', '*', '?', '"', '<', '>', '|'];

/// Replace characters the device would reject with `-`. This is the only
/// source of path aliasing, so every replacement is logged.
pub fn sanitize_path(path: &str) -> Cow<'_, str> {
    if path.contains(BAD_PATH_CHARS) {
        let fixed: String = path
            .chars()
            .map(|ch| if BAD_PATH_CHARS.contains(&ch) { '-' } else { ch })
            .collect();
        warn!("transformed path {} to {}", path, fixed);
        Cow::Owned(fixed)
    } else {
        Cow::Borrowed(path)
    }
}

/// Split an absolute path into its parent path and final component.
pub fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(pos) => (&path[..pos], &path[pos + 1..]),
        None => ("/", path),
    }
}

pub type NodeId = u64;

/// Callback used to list a folder's contents from the device. Takes the
/// storage id and the folder's item id (0 for the storage root).
pub type Lister<'a> = dyn FnMut(u32, i64) -> Result<Vec<ObjectInfo>> + 'a;

#[derive(Debug)]
pub enum NodeKind {
    Folder {
        children: Vec<NodeId>,
        needs_refresh: bool,
    },
    File {
        size: u64,
        filetype: Filetype,
    },
}

#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    /// MTP object id; 0 for the storage root, negative for local placeholders.
    pub item_id: i64,
    pub parent: Option<NodeId>,
    pub path: String,
    pub mtime: i64,
    pub kind: NodeKind,
}

impl Node {
    pub fn is_folder(&self) -> bool {
        matches!(self.kind, NodeKind::Folder { .. })
    }

    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or("")
    }

    pub fn size(&self) -> u64 {
        match self.kind {
            NodeKind::Folder { .. } => 0,
            NodeKind::File { size, .. } => size,
        }
    }

    pub fn filetype(&self) -> Filetype {
        match self.kind {
            NodeKind::Folder { .. } => Filetype::Folder,
            NodeKind::File { filetype, .. } => filetype,
        }
    }

    pub fn child_count(&self) -> usize {
        match &self.kind {
            NodeKind::Folder { children, .. } => children.len(),
            NodeKind::File { .. } => 0,
        }
    }
}

/// The lazily refreshed tree of one storage, with its path cache.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct StorageTree {
    storage_id: u32,
    description: String,
    root_path: String,
    max_capacity: u64,
    free_space_bytes: u64,
    root: NodeId,
    next_id: NodeId,
    #[derivative(Debug = "ignore")]
    nodes: HashMap<NodeId, Node>,
    #[derivative(Debug = "ignore")]
    cache: LruCache<String, NodeId>,
}

impl StorageTree {
    pub fn new(info: &StorageInfo) -> Self {
        Self::with_cache_size(info, PATH_CACHE_SIZE)
    }

    pub fn with_cache_size(info: &StorageInfo, cache_size: usize) -> Self {
        let root_path = format!("/{}", info.description);
        let mut nodes = HashMap::new();
        let root = 1;
        nodes.insert(
            root,
            Node {
                id: root,
                item_id: 0,
                parent: None,
                path: root_path.clone(),
                mtime: 0,
                kind: NodeKind::Folder {
                    children: Vec::new(),
                    needs_refresh: true,
                },
            },
        );

        StorageTree {
            storage_id: info.id,
            description: info.description.clone(),
            root_path,
            max_capacity: info.max_capacity,
            free_space_bytes: info.free_space_bytes,
            root,
            next_id: root + 1,
            nodes,
            cache: LruCache::new(NonZeroUsize::new(cache_size).expect("nonzero cache size")),
        }
    }

    pub fn storage_id(&self) -> u32 {
        self.storage_id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn max_capacity(&self) -> u64 {
        self.max_capacity
    }

    pub fn free_space_bytes(&self) -> u64 {
        self.free_space_bytes
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Resolve an absolute path (starting with this storage's description) to a
    /// node, listing folders from the device as needed. Folders are returned
    /// fresh: a hit on a folder flagged `needs_refresh` re-lists it first.
    pub fn resolve(&mut self, path: &str, list: &mut Lister<'_>) -> Result<Option<NodeId>> {
        if path == self.root_path {
            self.ensure_fresh(self.root, list)?;
            return Ok(Some(self.root));
        }

        if let Some(&id) = self.cache.get(path) {
            if self.nodes.contains_key(&id) {
                if self.node_needs_refresh(id) {
                    self.refresh(id, list)?;
                }
                return Ok(Some(id));
            }
            // Node evaporated in a parent refresh; drop the stale entry.
            self.cache.pop(path);
        }

        let rel = match path.strip_prefix(&self.root_path) {
            Some(rel) => rel.trim_start_matches('/'),
            None => return Ok(None),
        };
        if rel.is_empty() {
            return Ok(Some(self.root));
        }

        let components: Vec<&str> = rel.split('/').filter(|c| !c.is_empty()).collect();
        let mut current = self.root;

        for (depth, component) in components.iter().enumerate() {
            let last = depth + 1 == components.len();
            self.ensure_fresh(current, list)?;

            let child = self.find_child(current, component);
            match child {
                Some(id) => {
                    let path_of_child = self.nodes[&id].path.clone();
                    self.cache.put(path_of_child, id);
                    if self.nodes[&id].is_folder() {
                        if last {
                            self.ensure_fresh(id, list)?;
                            return Ok(Some(id));
                        }
                        current = id;
                    } else if last {
                        return Ok(Some(id));
                    } else {
                        // A file in the middle of the path.
                        return Ok(None);
                    }
                }
                None => return Ok(None),
            }
        }

        Ok(Some(current))
    }

    /// Look a path up using only in-memory state; never touches the device.
    pub fn lookup_cached(&mut self, path: &str) -> Option<NodeId> {
        if path == self.root_path {
            return Some(self.root);
        }
        if let Some(&id) = self.cache.get(path) {
            if self.nodes.contains_key(&id) {
                return Some(id);
            }
            self.cache.pop(path);
        }

        let rel = path.strip_prefix(&self.root_path)?.trim_start_matches('/');
        let mut current = self.root;
        for component in rel.split('/').filter(|c| !c.is_empty()) {
            current = self.find_child(current, component)?;
        }
        Some(current)
    }

    /// Children of a folder as `(name, is_directory)` pairs, re-listing from
    /// the device first when the folder is flagged.
    pub fn children(&mut self, id: NodeId, list: &mut Lister<'_>) -> Result<Vec<(String, bool)>> {
        if !self.nodes.get(&id).map_or(false, Node::is_folder) {
            return Err(Error::NotADirectory(
                self.nodes.get(&id).map(|n| n.path.clone()).unwrap_or_default(),
            ));
        }
        self.ensure_fresh(id, list)?;

        let children = match &self.nodes[&id].kind {
            NodeKind::Folder { children, .. } => children.clone(),
            NodeKind::File { .. } => unreachable!(),
        };

        Ok(children
            .iter()
            .filter_map(|cid| self.nodes.get(cid))
            .map(|node| (node.name().to_string(), node.is_folder()))
            .collect())
    }

    /// Replace a folder's children with a fresh device listing. Old child
    /// subtrees are discarded; their ids are never reused.
    pub fn apply_listing(&mut self, folder: NodeId, entries: Vec<ObjectInfo>) {
        let old_children = match self.nodes.get_mut(&folder) {
            Some(node) => match &mut node.kind {
                NodeKind::Folder { children, .. } => std::mem::take(children),
                NodeKind::File { .. } => return,
            },
            None => return,
        };

        for child in old_children {
            self.remove_subtree(child);
        }

        let parent_path = self.nodes[&folder].path.clone();
        let mut new_children = Vec::with_capacity(entries.len());

        for entry in entries {
            let id = self.next_id;
            self.next_id += 1;

            let path = format!("{}/{}", parent_path, entry.name);
            let kind = if entry.is_folder() {
                NodeKind::Folder {
                    children: Vec::new(),
                    needs_refresh: true,
                }
            } else {
                NodeKind::File {
                    size: entry.size,
                    filetype: entry.filetype,
                }
            };

            self.nodes.insert(
                id,
                Node {
                    id,
                    item_id: entry.item_id as i64,
                    parent: Some(folder),
                    path,
                    mtime: entry.mtime,
                    kind,
                },
            );
            new_children.push(id);
        }

        if let Some(node) = self.nodes.get_mut(&folder) {
            node.kind = NodeKind::Folder {
                children: new_children,
                needs_refresh: false,
            };
        }
    }

    /// Flag a folder so its next enumeration re-lists from the device.
    pub fn mark_refresh(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            if let NodeKind::Folder { needs_refresh, .. } = &mut node.kind {
                *needs_refresh = true;
            }
        }
    }

    /// Flag the folder containing `path`, if it is known in memory.
    pub fn mark_parent_refresh(&mut self, path: &str) {
        let (parent_path, _) = split_path(path);
        if let Some(id) = self.lookup_cached(parent_path) {
            self.mark_refresh(id);
        }
    }

    /// Drop a path from the cache and the tree (used by delete and rename).
    pub fn remove_path(&mut self, path: &str) {
        self.cache.pop(path);
        if let Some(id) = self.lookup_cached(path) {
            if id == self.root {
                return;
            }
            if let Some(parent) = self.nodes.get(&id).and_then(|n| n.parent) {
                if let Some(NodeKind::Folder { children, .. }) =
                    self.nodes.get_mut(&parent).map(|n| &mut n.kind)
                {
                    children.retain(|&c| c != id);
                }
            }
            self.remove_subtree(id);
        }
    }

    /// Insert a zero-length placeholder file for a `create()` that has not been
    /// flushed to the device yet.
    pub fn insert_placeholder(&mut self, parent: NodeId, name: &str, mtime: i64) -> Option<NodeId> {
        if !self.nodes.get(&parent).map_or(false, Node::is_folder) {
            return None;
        }

        let id = self.next_id;
        self.next_id += 1;

        let path = format!("{}/{}", self.nodes[&parent].path, name);
        self.nodes.insert(
            id,
            Node {
                id,
                item_id: PLACEHOLDER_ITEM_ID,
                parent: Some(parent),
                path: path.clone(),
                mtime,
                kind: NodeKind::File {
                    size: 0,
                    filetype: Filetype::from_path(name),
                },
            },
        );

        if let Some(NodeKind::Folder { children, .. }) =
            self.nodes.get_mut(&parent).map(|n| &mut n.kind)
        {
            children.push(id);
        }
        self.cache.put(path, id);
        Some(id)
    }

    fn node_needs_refresh(&self, id: NodeId) -> bool {
        matches!(
            self.nodes.get(&id).map(|n| &n.kind),
            Some(NodeKind::Folder {
                needs_refresh: true,
                ..
            })
        )
    }

    fn ensure_fresh(&mut self, id: NodeId, list: &mut Lister<'_>) -> Result<()> {
        if self.node_needs_refresh(id) {
            self.refresh(id, list)?;
        }
        Ok(())
    }

    fn refresh(&mut self, id: NodeId, list: &mut Lister<'_>) -> Result<()> {
        let (storage_id, item_id, path) = {
            let node = self.nodes.get(&id).ok_or_else(|| Error::NotFound(String::new()))?;
            (self.storage_id, node.item_id, node.path.clone())
        };

        debug!("refresh({}, {}, {})", path, storage_id, item_id);
        let entries = list(storage_id, item_id)?;
        self.apply_listing(id, entries);
        Ok(())
    }

    fn find_child(&self, folder: NodeId, name: &str) -> Option<NodeId> {
        let children = match self.nodes.get(&folder).map(|n| &n.kind) {
            Some(NodeKind::Folder { children, .. }) => children,
            _ => return None,
        };

        children
            .iter()
            .find(|&&id| self.nodes.get(&id).map_or(false, |n| n.name() == name))
            .copied()
    }

    fn remove_subtree(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.remove(&id) {
            if let NodeKind::Folder { children, .. } = node.kind {
                for child in children {
                    self.remove_subtree(child);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    fn storage_info() -> StorageInfo {
        StorageInfo {
            id: 65537,
            description: "Internal".to_string(),
            max_capacity: 1 << 30,
            free_space_bytes: 1 << 29,
            free_space_objects: 1000,
        }
    }

    fn obj(item_id: u32, parent_id: u32, name: &str, filetype: Filetype, size: u64) -> ObjectInfo {
        ObjectInfo {
            item_id,
            parent_id,
            storage_id: 65537,
            name: name.to_string(),
            size,
            mtime: 1_600_000_000,
            filetype,
        }
    }

    /// A fake device: folder item id -> listing, plus a call counter.
    struct FakeDevice {
        listings: RefCell<HashMap<i64, Vec<ObjectInfo>>>,
        calls: RefCell<u32>,
    }

    impl FakeDevice {
        fn new() -> Self {
            let mut listings = HashMap::new();
            listings.insert(
                0,
                vec![
                    obj(10, 0, "Music", Filetype::Folder, 0),
                    obj(11, 0, "readme.txt", Filetype::Text, 64),
                ],
            );
            listings.insert(10, vec![obj(20, 10, "song.mp3", Filetype::Mp3, 4096)]);
            FakeDevice {
                listings: RefCell::new(listings),
                calls: RefCell::new(0),
            }
        }

        fn lister(&self) -> impl FnMut(u32, i64) -> Result<Vec<ObjectInfo>> + '_ {
            move |_storage, folder| {
                *self.calls.borrow_mut() += 1;
                Ok(self
                    .listings
                    .borrow()
                    .get(&folder)
                    .cloned()
                    .unwrap_or_default())
            }
        }
    }

    #[test]
    fn sanitize_replaces_every_forbidden_character() {
        assert_eq!(sanitize_path("/Internal/a:b*c?d\"e<f>g|h"), "/Internal/a-b-c-d-e-f-g-h");
        assert_eq!(sanitize_path("/Internal/clean.txt"), "/Internal/clean.txt");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let once = sanitize_path("/x/a:b|c").into_owned();
        assert_eq!(sanitize_path(&once), once);
    }

    #[test]
    fn split_path_handles_root_children() {
        assert_eq!(split_path("/Internal"), ("/", "Internal"));
        assert_eq!(split_path("/Internal/Music/a.mp3"), ("/Internal/Music", "a.mp3"));
    }

    #[test]
    fn resolves_nested_paths_lazily() {
        let device = FakeDevice::new();
        let mut tree = StorageTree::new(&storage_info());

        let id = {
            let mut lister = device.lister();
            tree.resolve("/Internal/Music/song.mp3", &mut lister)
                .unwrap()
                .unwrap()
        };
        let node = tree.node(id).unwrap();
        assert_eq!(node.name(), "song.mp3");
        assert_eq!(node.size(), 4096);
        assert_eq!(node.item_id, 20);
        assert!(!node.is_folder());
    }

    #[test]
    fn missing_paths_resolve_to_none() {
        let device = FakeDevice::new();
        let mut tree = StorageTree::new(&storage_info());
        let mut lister = device.lister();

        assert!(tree.resolve("/Internal/Nope", &mut lister).unwrap().is_none());
        assert!(tree
            .resolve("/Internal/readme.txt/child", &mut lister)
            .unwrap()
            .is_none());
    }

    #[test]
    fn cache_hits_skip_the_device_until_marked() {
        let device = FakeDevice::new();
        let mut tree = StorageTree::new(&storage_info());

        {
            let mut lister = device.lister();
            tree.resolve("/Internal/readme.txt", &mut lister).unwrap().unwrap();
        }
        let calls_after_first = *device.calls.borrow();

        {
            let mut lister = device.lister();
            tree.resolve("/Internal/readme.txt", &mut lister).unwrap().unwrap();
        }
        assert_eq!(*device.calls.borrow(), calls_after_first);
    }

    #[test]
    fn marked_folders_are_relisted_before_enumeration() {
        let device = FakeDevice::new();
        let mut tree = StorageTree::new(&storage_info());

        let root = tree.root();
        {
            let mut lister = device.lister();
            tree.children(root, &mut lister).unwrap();
        }

        // Simulate a deletion on the device followed by a mutation mark.
        device.listings.borrow_mut().insert(0, vec![obj(10, 0, "Music", Filetype::Folder, 0)]);
        tree.mark_refresh(root);

        let names: Vec<String> = {
            let mut lister = device.lister();
            tree.children(root, &mut lister)
                .unwrap()
                .into_iter()
                .map(|(name, _)| name)
                .collect()
        };
        assert_eq!(names, vec!["Music".to_string()]);
    }

    #[test]
    fn removed_directories_leave_no_stale_children() {
        let device = FakeDevice::new();
        let mut tree = StorageTree::new(&storage_info());

        {
            let mut lister = device.lister();
            tree.resolve("/Internal/Music/song.mp3", &mut lister).unwrap().unwrap();
        }

        tree.remove_path("/Internal/Music");
        assert!(tree.lookup_cached("/Internal/Music").is_none());
        assert!(tree.lookup_cached("/Internal/Music/song.mp3").is_none());

        let root = tree.root();
        assert_eq!(tree.node(root).unwrap().child_count(), 1);
    }

    #[test]
    fn placeholders_are_visible_until_refreshed_away() {
        let device = FakeDevice::new();
        let mut tree = StorageTree::new(&storage_info());

        let root = tree.root();
        {
            let mut lister = device.lister();
            tree.children(root, &mut lister).unwrap();
        }

        let id = tree.insert_placeholder(root, "new.txt", 123).unwrap();
        let node = tree.node(id).unwrap();
        assert_eq!(node.item_id, PLACEHOLDER_ITEM_ID);
        assert_eq!(node.size(), 0);
        assert_eq!(node.path, "/Internal/new.txt");
        assert_eq!(tree.lookup_cached("/Internal/new.txt"), Some(id));
    }

    #[test]
    fn tiny_cache_still_resolves_after_eviction() {
        let device = FakeDevice::new();
        let mut tree = StorageTree::with_cache_size(&storage_info(), 1);

        let first = {
            let mut lister = device.lister();
            tree.resolve("/Internal/Music/song.mp3", &mut lister).unwrap().unwrap()
        };
        // This push evicts the earlier entries out of the one-slot cache.
        {
            let mut lister = device.lister();
            tree.resolve("/Internal/readme.txt", &mut lister).unwrap().unwrap();
        }
        let again = {
            let mut lister = device.lister();
            tree.resolve("/Internal/Music/song.mp3", &mut lister).unwrap().unwrap()
        };
        assert_eq!(tree.node(again).unwrap().name(), "song.mp3");
        let _ = first;
    }

    #[test]
    fn refresh_failures_propagate() {
        let mut tree = StorageTree::new(&storage_info());
        let mut lister = |_: u32, _: i64| -> Result<Vec<ObjectInfo>> {
            Err(Error::Timeout { seconds: 10 })
        };
        assert!(tree.resolve("/Internal/Music", &mut lister).is_err());
    }
}

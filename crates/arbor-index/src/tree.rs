//! The builder-configured B-tree index.

use parking_lot::{Mutex, RwLock};
use std::marker::PhantomData;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use arbor_cache::NodeCache;
use arbor_common::{ArborError, Datum, IndexConfig, Result};

use crate::iter::IndexIter;
use crate::meta::Metadata;
use crate::node::{median_index, Key, Node};
use crate::noderef::{NodeRef, TreeContext};
use crate::storage::Storage;

/// An ordered, optionally disk-persistent B-tree index.
///
/// Values are kept sorted across nodes of at most `degree - 1` keys.
/// Insertion splits full nodes bottom-up, promoting the lower median.
/// Writes are serialized; a new root is published only after every dirty
/// node has been flushed, so readers always traverse a consistent snapshot.
/// Deletion is tombstone-only: matching keys are marked and skipped by
/// lookups and traversal, with no rebalancing.
pub struct BTreeIndex<T: Datum> {
    ctx: Arc<TreeContext<T>>,
    /// The current root. Replaced wholesale by each write.
    root: RwLock<NodeRef<T>>,
    /// Dirty nodes awaiting flush, bottom-up. The guard doubles as the
    /// write monitor: at most one add/delete runs tree-wide.
    save_queue: Mutex<Vec<NodeRef<T>>>,
    /// Serializes metadata rewrites.
    metadata_monitor: Mutex<()>,
    metadata_path: Option<PathBuf>,
    degree: usize,
}

impl<T: Datum> std::fmt::Debug for BTreeIndex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTreeIndex")
            .field("metadata_path", &self.metadata_path)
            .field("degree", &self.degree)
            .finish()
    }
}

/// Result of inserting into a subtree.
enum AddOutcome<T: Datum> {
    /// The subtree's top node was rewritten; the parent must re-point.
    Replaced(NodeRef<T>),
    /// The subtree's top node split; the promoted key carries the two new
    /// siblings as its children and must be inserted into the parent.
    Split { promoted: Key<T> },
}

impl<T: Datum> BTreeIndex<T> {
    /// Creates a builder with default configuration.
    pub fn builder() -> BTreeIndexBuilder<T> {
        BTreeIndexBuilder::new()
    }

    /// Returns the degree of the tree.
    pub fn degree(&self) -> usize {
        self.degree
    }

    /// Inserts one or more values.
    pub fn add<I>(&self, values: I) -> Result<&Self>
    where
        I: IntoIterator<Item = T>,
    {
        for value in values {
            self.add_one(value)?;
        }
        Ok(self)
    }

    /// Returns some live value equal to `value`, if one exists.
    pub fn find(&self, value: &T) -> Result<Option<T>> {
        let root = self.root.read().clone();
        self.find_in(&root, value)
    }

    /// Returns every live value equal to `value`, in traversal order.
    pub fn find_all(&self, value: &T) -> Result<Vec<T>> {
        let root = self.root.read().clone();
        let mut found = Vec::new();
        self.collect_equal(&root, value, &mut found)?;
        Ok(found)
    }

    /// Range queries are not yet implemented; calling this always fails.
    pub fn find_range(&self, _lower: Bound<&T>, _upper: Bound<&T>) -> Result<IndexIter<T>> {
        Err(ArborError::Unsupported("range queries".to_string()))
    }

    /// Marks every key equal to one of `values` as deleted.
    ///
    /// Tombstoned keys stay in their nodes and on disk; lookups and
    /// traversal skip them. Returns the number of keys newly marked.
    pub fn delete<I>(&self, values: I) -> Result<u64>
    where
        I: IntoIterator<Item = T>,
    {
        let mut count = 0;
        for value in values {
            count += self.delete_one(&value)?;
        }
        Ok(count)
    }

    /// Returns a lazy in-order iterator over live values.
    pub fn iter(&self) -> IndexIter<T> {
        IndexIter::new(Arc::clone(&self.ctx), self.root.read().clone())
    }

    /// Returns the root node's key list, for structure inspection.
    pub fn keys(&self) -> Result<Vec<Key<T>>> {
        let root = self.root.read().clone();
        root.keys()
    }

    /// Rewrites the metadata file so a re-open sees the current root.
    ///
    /// No-op for an index built without a metadata path.
    pub fn flush(&self) -> Result<&Self> {
        self.write_metadata()?;
        Ok(self)
    }

    fn add_one(&self, value: T) -> Result<()> {
        let mut queue = self.save_queue.lock();
        let root = self.root.read().clone();

        let new_root = match self.add_into(&root, value, &mut queue)? {
            AddOutcome::Replaced(node_ref) => node_ref,
            AddOutcome::Split { promoted } => {
                // The old root split; a fresh single-key root takes over.
                let node_ref = NodeRef::fresh(&self.ctx, Node::new(vec![promoted]));
                queue.push(node_ref.clone());
                node_ref
            }
        };

        self.flush_saves(&mut queue)?;
        *self.root.write() = new_root;
        Ok(())
    }

    /// Inserts `value` under `node_ref`, rewriting the touched path.
    ///
    /// Every node copied or created is appended to `queue` bottom-up, so
    /// flushing assigns child positions before any parent serializes.
    fn add_into(
        &self,
        node_ref: &NodeRef<T>,
        value: T,
        queue: &mut Vec<NodeRef<T>>,
    ) -> Result<AddOutcome<T>> {
        let node = node_ref.materialize()?;
        let mut keys = node.keys().to_vec();

        if node.is_leaf() {
            // New keys land after existing equal keys.
            let at = keys.partition_point(|k| k.value() <= &value);
            keys.insert(at, Key::new(value));
        } else {
            // Descend into the left child of the first key at or above the
            // value, or the last key's right child when every key is below.
            let at = keys.partition_point(|k| k.value() < &value);
            let (child, descended_last) = if at < keys.len() {
                let child = keys[at].left().cloned().ok_or_else(|| {
                    ArborError::Corrupted("interior key missing left child".to_string())
                })?;
                (child, false)
            } else {
                let child = keys[at - 1].right().cloned().ok_or_else(|| {
                    ArborError::Corrupted("interior key missing right child".to_string())
                })?;
                (child, true)
            };

            match self.add_into(&child, value, queue)? {
                AddOutcome::Replaced(new_child) => {
                    // Both keys flanking the child slot share the new copy.
                    if descended_last {
                        let last = keys.len() - 1;
                        keys[last].set_right(Some(new_child));
                    } else {
                        keys[at].set_left(Some(new_child.clone()));
                        if at > 0 {
                            keys[at - 1].set_right(Some(new_child));
                        }
                    }
                }
                AddOutcome::Split { promoted } => {
                    // The promoted key takes over the child slot it rose
                    // from; its new siblings become the neighbours' shared
                    // children.
                    if at > 0 {
                        keys[at - 1].set_right(promoted.left().cloned());
                    }
                    if at < keys.len() {
                        keys[at].set_left(promoted.right().cloned());
                    }
                    keys.insert(at, promoted);
                }
            }
        }

        if keys.len() == self.degree {
            Ok(AddOutcome::Split {
                promoted: self.split(keys, queue),
            })
        } else {
            let node_ref = NodeRef::fresh(&self.ctx, Node::new(keys));
            queue.push(node_ref.clone());
            Ok(AddOutcome::Replaced(node_ref))
        }
    }

    /// Splits a full key list around its median.
    ///
    /// Keys strictly left of the median form a new left sibling, keys
    /// strictly right a new right sibling; the median is returned with the
    /// siblings attached as its children.
    fn split(&self, mut keys: Vec<Key<T>>, queue: &mut Vec<NodeRef<T>>) -> Key<T> {
        let median = median_index(keys.len());
        let right_keys = keys.split_off(median + 1);
        let mut promoted = keys.pop().expect("split of an empty key list");

        let left = NodeRef::fresh(&self.ctx, Node::new(keys));
        let right = NodeRef::fresh(&self.ctx, Node::new(right_keys));
        queue.push(left.clone());
        queue.push(right.clone());

        promoted.set_left(Some(left));
        promoted.set_right(Some(right));
        promoted
    }

    fn find_in(&self, node_ref: &NodeRef<T>, value: &T) -> Result<Option<T>> {
        let node = node_ref.materialize()?;
        for key in node.keys() {
            match value.cmp(key.value()) {
                std::cmp::Ordering::Less => {
                    return match key.left() {
                        Some(child) => self.find_in(child, value),
                        None => Ok(None),
                    };
                }
                std::cmp::Ordering::Equal => {
                    if !key.is_deleted() {
                        return Ok(Some(key.value().clone()));
                    }
                    // A tombstone may still shadow live duplicates below.
                    if let Some(child) = key.left() {
                        if let Some(found) = self.find_in(child, value)? {
                            return Ok(Some(found));
                        }
                    }
                }
                std::cmp::Ordering::Greater => {}
            }
        }
        match node.keys().last().and_then(|k| k.right()) {
            Some(child) => self.find_in(child, value),
            None => Ok(None),
        }
    }

    fn collect_equal(&self, node_ref: &NodeRef<T>, value: &T, found: &mut Vec<T>) -> Result<()> {
        let node = node_ref.materialize()?;
        let keys = node.keys();
        let len = keys.len();
        let is_leaf = node.is_leaf();

        for slot in 0..=len {
            // Child `slot` sits between keys[slot - 1] and keys[slot]; visit
            // it only when the value can fall inside.
            if !is_leaf {
                let lower_ok = slot == 0 || keys[slot - 1].value() <= value;
                let upper_ok = slot == len || value <= keys[slot].value();
                if lower_ok && upper_ok {
                    let child = if slot < len {
                        keys[slot].left()
                    } else {
                        keys[len - 1].right()
                    };
                    if let Some(child) = child {
                        self.collect_equal(child, value, found)?;
                    }
                }
            }
            if slot < len {
                let key = &keys[slot];
                if key.value() == value && !key.is_deleted() {
                    found.push(key.value().clone());
                }
            }
        }
        Ok(())
    }

    fn delete_one(&self, value: &T) -> Result<u64> {
        let mut queue = self.save_queue.lock();
        let root = self.root.read().clone();

        let (count, replacement) = self.delete_in(&root, value, &mut queue)?;
        if let Some(new_root) = replacement {
            self.flush_saves(&mut queue)?;
            *self.root.write() = new_root;
        }
        Ok(count)
    }

    /// Tombstones every key equal to `value` under `node_ref`.
    ///
    /// Returns the number of keys newly marked and, when anything beneath
    /// changed, the rewritten copy of this node.
    fn delete_in(
        &self,
        node_ref: &NodeRef<T>,
        value: &T,
        queue: &mut Vec<NodeRef<T>>,
    ) -> Result<(u64, Option<NodeRef<T>>)> {
        let node = node_ref.materialize()?;
        let mut keys = node.keys().to_vec();
        let len = keys.len();
        let mut count = 0u64;
        let mut changed = false;

        if !node.is_leaf() {
            for slot in 0..=len {
                let lower_ok = slot == 0 || keys[slot - 1].value() <= value;
                let upper_ok = slot == len || value <= keys[slot].value();
                if !(lower_ok && upper_ok) {
                    continue;
                }
                let child = if slot < len {
                    keys[slot].left().cloned()
                } else {
                    keys[len - 1].right().cloned()
                };
                let Some(child) = child else {
                    continue;
                };
                let (marked, replacement) = self.delete_in(&child, value, queue)?;
                count += marked;
                if let Some(new_child) = replacement {
                    if slot < len {
                        keys[slot].set_left(Some(new_child.clone()));
                    }
                    if slot > 0 {
                        keys[slot - 1].set_right(Some(new_child));
                    }
                    changed = true;
                }
            }
        }

        for key in keys.iter_mut() {
            if key.value() == value && !key.is_deleted() {
                key.mark_deleted();
                count += 1;
                changed = true;
            }
        }

        if changed {
            let replacement = NodeRef::fresh(&self.ctx, Node::new(keys));
            queue.push(replacement.clone());
            Ok((count, Some(replacement)))
        } else {
            Ok((count, None))
        }
    }

    /// Flushes queued saves to storage, if storage is configured, and
    /// announces each flushed node to the cache.
    fn flush_saves(&self, queue: &mut Vec<NodeRef<T>>) -> Result<()> {
        if let Some(storage) = &self.ctx.storage {
            storage.save(queue)?;
            for node_ref in queue.iter() {
                if let Some(position) = node_ref.position() {
                    self.ctx.announce(position, node_ref.clone());
                }
            }
        }
        queue.clear();
        Ok(())
    }

    fn write_metadata(&self) -> Result<()> {
        let Some(path) = &self.metadata_path else {
            return Ok(());
        };
        let storage = self.ctx.storage.as_ref().ok_or_else(|| {
            ArborError::Internal("persistent index without storage".to_string())
        })?;
        let root_position = self.root.read().position().ok_or_else(|| {
            ArborError::Internal("root node has no storage position".to_string())
        })?;
        let directory = std::path::absolute(storage.directory())?;

        let metadata = Metadata {
            storage_directory: directory.to_string_lossy().into_owned(),
            storage_name: storage.name().to_string(),
            root: root_position,
            degree: self.degree as u32,
        };

        let _guard = self.metadata_monitor.lock();
        metadata.write_to(path)
    }
}

impl<'a, T: Datum> IntoIterator for &'a BTreeIndex<T> {
    type Item = Result<T>;
    type IntoIter = IndexIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Builder for a [`BTreeIndex`].
pub struct BTreeIndexBuilder<T: Datum> {
    config: IndexConfig,
    storage: Option<Storage>,
    _marker: PhantomData<T>,
}

impl<T: Datum> Default for BTreeIndexBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Datum> BTreeIndexBuilder<T> {
    pub fn new() -> Self {
        Self {
            config: IndexConfig::default(),
            storage: None,
            _marker: PhantomData,
        }
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: IndexConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the degree: the key count at which a node splits.
    ///
    /// Overridden by the recorded degree when opening an existing metadata
    /// file.
    pub fn degree(mut self, degree: usize) -> Self {
        self.config.degree = degree;
        self
    }

    /// Sets the metadata file path, enabling persistence.
    pub fn metadata(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.metadata = Some(path.into());
        self
    }

    /// Bounds the number of nodes kept resident in memory.
    pub fn cache_size(mut self, cache_size: usize) -> Self {
        self.config.cache_size = Some(cache_size);
        self
    }

    /// Injects a pre-constructed storage handle instead of deriving one
    /// from the metadata path.
    pub fn storage(mut self, storage: Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Builds the index, creating or opening its files as configured.
    pub fn build(self) -> Result<BTreeIndex<T>> {
        self.config.validate()?;
        let cache = self.config.cache_size.map(NodeCache::new);
        let metadata_path = self.config.metadata.clone();

        match metadata_path.clone().filter(|p| p.exists()) {
            Some(path) => {
                let metadata = Metadata::read_from(&path)?;
                let degree = metadata.degree as usize;
                if degree < 2 {
                    return Err(ArborError::InvalidDegree { degree });
                }
                let storage = match self.storage {
                    Some(storage) => storage,
                    None => {
                        Storage::new(&metadata.storage_directory, metadata.storage_name.clone())?
                    }
                };
                let ctx = Arc::new(TreeContext {
                    storage: Some(storage),
                    cache,
                });
                let root = NodeRef::persistent(&ctx, metadata.root);
                debug!(degree, root = %metadata.root, "opened index from metadata");
                Ok(BTreeIndex {
                    ctx,
                    root: RwLock::new(root),
                    save_queue: Mutex::new(Vec::new()),
                    metadata_monitor: Mutex::new(()),
                    metadata_path: Some(path),
                    degree,
                })
            }
            None => {
                let degree = self.config.degree;
                let storage = match (self.storage, &metadata_path) {
                    (Some(storage), _) => Some(storage),
                    (None, Some(path)) => Some(default_storage(path)?),
                    (None, None) => None,
                };
                let ctx = Arc::new(TreeContext { storage, cache });
                let root = NodeRef::fresh(&ctx, Node::empty());
                let index = BTreeIndex {
                    ctx,
                    root: RwLock::new(root),
                    save_queue: Mutex::new(Vec::new()),
                    metadata_monitor: Mutex::new(()),
                    metadata_path,
                    degree,
                };
                // Flush the empty root so the index can be reopened before
                // the first insert, then pin it in the metadata file.
                {
                    let mut queue = index.save_queue.lock();
                    let root = index.root.read().clone();
                    queue.push(root);
                    index.flush_saves(&mut queue)?;
                }
                index.write_metadata()?;
                debug!(
                    degree,
                    persistent = index.ctx.storage.is_some(),
                    "created index"
                );
                Ok(index)
            }
        }
    }
}

/// Derives the default storage layout from a metadata path: a
/// `<file name>.storage` file in the same directory.
fn default_storage(metadata_path: &Path) -> Result<Storage> {
    let name = metadata_path.file_name().ok_or_else(|| {
        ArborError::Config(format!(
            "metadata path {} has no file name",
            metadata_path.display()
        ))
    })?;
    let directory = match metadata_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Storage::new(directory, format!("{}.storage", name.to_string_lossy()))
}

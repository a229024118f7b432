//! Lazy node handles and the loader context they call back into.

use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};

use arbor_cache::{NodeCache, Resident};
use arbor_common::{ArborError, Datum, Position, Result};

use crate::node::{Key, Node};
use crate::storage::Storage;

/// Shared loader state for one index: the storage handle and the node cache.
pub(crate) struct TreeContext<T: Datum> {
    pub(crate) storage: Option<Storage>,
    pub(crate) cache: Option<NodeCache<NodeRef<T>>>,
}

impl<T: Datum> TreeContext<T> {
    /// Records a node as loaded (or saved for the first time) with the
    /// cache, which may release another handle's resident node.
    pub(crate) fn announce(&self, position: Position, node_ref: NodeRef<T>) {
        if let Some(cache) = &self.cache {
            cache.put(position, node_ref);
        }
    }
}

/// Handle addressing a node by its storage position.
///
/// The reference type used throughout the tree; nodes never hold direct
/// links to other nodes. A fresh handle has no position yet and always
/// carries a resident node; a persistent handle knows its position and
/// materializes the node on first access. Cache eviction drops the resident
/// node only, leaving the handle addressable.
pub struct NodeRef<T: Datum> {
    inner: Arc<RefInner<T>>,
}

struct RefInner<T: Datum> {
    loader: Weak<TreeContext<T>>,
    /// Assigned exactly once, at flush time for fresh handles.
    position: Mutex<Option<Position>>,
    resident: RwLock<Option<Arc<Node<T>>>>,
}

impl<T: Datum> Clone for NodeRef<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Datum> std::fmt::Debug for NodeRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.position() {
            Some(position) => write!(f, "NodeRef({})", position),
            None => write!(f, "NodeRef(fresh)"),
        }
    }
}

impl<T: Datum> NodeRef<T> {
    /// Creates a handle for a node that exists only in memory so far.
    pub(crate) fn fresh(ctx: &Arc<TreeContext<T>>, node: Node<T>) -> Self {
        Self {
            inner: Arc::new(RefInner {
                loader: Arc::downgrade(ctx),
                position: Mutex::new(None),
                resident: RwLock::new(Some(Arc::new(node))),
            }),
        }
    }

    /// Creates a handle for a node stored at `position`.
    pub(crate) fn persistent(ctx: &Arc<TreeContext<T>>, position: Position) -> Self {
        Self {
            inner: Arc::new(RefInner {
                loader: Arc::downgrade(ctx),
                position: Mutex::new(Some(position)),
                resident: RwLock::new(None),
            }),
        }
    }

    /// The storage position, if one has been assigned.
    pub fn position(&self) -> Option<Position> {
        *self.inner.position.lock()
    }

    pub(crate) fn set_position(&self, position: Position) {
        let mut slot = self.inner.position.lock();
        debug_assert!(slot.is_none(), "node position assigned twice");
        *slot = Some(position);
    }

    /// True if both handles address the same node object.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// This node's key list, loading the node if necessary.
    pub fn keys(&self) -> Result<Vec<Key<T>>> {
        Ok(self.materialize()?.keys().to_vec())
    }

    /// Returns the resident node without loading.
    pub(crate) fn resident(&self) -> Option<Arc<Node<T>>> {
        self.inner.resident.read().clone()
    }

    /// Returns the resident node, reading it from storage if absent.
    ///
    /// Idempotent; locks only this handle. Once resident, subsequent calls
    /// take the read lock only.
    pub(crate) fn materialize(&self) -> Result<Arc<Node<T>>> {
        if let Some(node) = self.inner.resident.read().as_ref() {
            return Ok(Arc::clone(node));
        }

        let ctx = self
            .inner
            .loader
            .upgrade()
            .ok_or_else(|| ArborError::Internal("index context dropped".to_string()))?;

        let (position, node) = {
            let mut slot = self.inner.resident.write();
            if let Some(node) = slot.as_ref() {
                return Ok(Arc::clone(node));
            }
            let position = self.position().ok_or_else(|| {
                ArborError::Corrupted("node has neither position nor resident data".to_string())
            })?;
            let storage = ctx.storage.as_ref().ok_or_else(|| {
                ArborError::Corrupted("positioned node but no storage configured".to_string())
            })?;
            let node = Arc::new(storage.load_node(position, &ctx)?);
            *slot = Some(Arc::clone(&node));
            (position, node)
        };

        // Announce after the residency lock is released; the cache may evict
        // other handles while holding its own lock.
        ctx.announce(position, self.clone());
        Ok(node)
    }
}

impl<T: Datum> Resident for NodeRef<T> {
    fn release(&self) {
        *self.inner.resident.write() = None;
    }
}

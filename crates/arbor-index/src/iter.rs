//! Lazy in-order traversal.

use std::sync::Arc;

use arbor_common::{Datum, Result};

use crate::noderef::{NodeRef, TreeContext};

/// In-order iterator over the live values of an index.
///
/// The iterator captures the root handle at creation, so a traversal started
/// before a write observes a consistent snapshot; values it yields are
/// always non-decreasing even while inserts run concurrently. Frames hold
/// node handles plus key indexes rather than pointers into node storage, so
/// resident nodes may be evicted and re-loaded between steps. The ascent
/// stack never grows beyond the tree height.
pub struct IndexIter<T: Datum> {
    /// Keeps the loader alive for handles that must re-load after eviction,
    /// even if the index itself is dropped mid-traversal.
    #[allow(dead_code)]
    ctx: Arc<TreeContext<T>>,
    /// Subtree to walk down before the next frame is popped.
    descend: Option<NodeRef<T>>,
    /// Ascent stack: (node, index of the next key to yield there).
    stack: Vec<(NodeRef<T>, usize)>,
    failed: bool,
}

impl<T: Datum> std::fmt::Debug for IndexIter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexIter")
            .field("stack_len", &self.stack.len())
            .field("failed", &self.failed)
            .finish()
    }
}

impl<T: Datum> IndexIter<T> {
    pub(crate) fn new(ctx: Arc<TreeContext<T>>, root: NodeRef<T>) -> Self {
        Self {
            ctx,
            descend: Some(root),
            stack: Vec::new(),
            failed: false,
        }
    }

    /// Walks to the bottom-left key of `node_ref`, recording the path.
    fn descend_left(&mut self, mut node_ref: NodeRef<T>) -> Result<()> {
        loop {
            let node = node_ref.materialize()?;
            let left = node.first().and_then(|k| k.left().cloned());
            self.stack.push((node_ref, 0));
            match left {
                Some(child) => node_ref = child,
                None => return Ok(()),
            }
        }
    }

    fn advance(&mut self) -> Result<Option<T>> {
        loop {
            if let Some(node_ref) = self.descend.take() {
                self.descend_left(node_ref)?;
            }

            let Some((node_ref, index)) = self.stack.pop() else {
                return Ok(None);
            };
            let node = node_ref.materialize()?;
            let Some(key) = node.key(index) else {
                // An empty root, or a frame walked past its last key.
                continue;
            };

            // The in-node successor resumes once this key's right subtree is
            // exhausted.
            if index + 1 < node.len() {
                self.stack.push((node_ref.clone(), index + 1));
            }
            self.descend = key.right().cloned();

            if !key.is_deleted() {
                return Ok(Some(key.value().clone()));
            }
        }
    }
}

impl<T: Datum> Iterator for IndexIter<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.advance() {
            Ok(Some(value)) => Some(Ok(value)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

//! Ordered, disk-persistent B-tree index for ArborDB.
//!
//! This crate provides:
//! - The node and key data model with per-node successor chains
//! - Lazy node handles that materialize from storage on demand
//! - The insert/split engine with bottom-up median promotion
//! - A lazy in-order iterator that can run concurrently with writes
//! - Append-only node storage with a save queue flushed per insertion
//! - A metadata file that pins the root position, degree, and storage identity
//!
//! Writes are serialized; readers traverse snapshots reachable from the root
//! they captured, so traversal never observes out-of-order values.

mod iter;
mod meta;
mod node;
mod noderef;
mod storage;
mod tree;

pub use iter::IndexIter;
pub use node::Key;
pub use noderef::NodeRef;
pub use storage::Storage;
pub use tree::{BTreeIndex, BTreeIndexBuilder};

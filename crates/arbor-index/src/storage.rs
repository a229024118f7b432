//! Append-only node storage.

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::trace;

use arbor_common::{ArborError, Datum, Position, Result};

use crate::node::{Key, Node};
use crate::noderef::{NodeRef, TreeContext};

/// Append-only storage for serialized nodes.
///
/// Updating a node always writes a new copy at a new offset; stale copies
/// are never reclaimed. Readers holding older positions therefore keep a
/// consistent view of the tree they captured. Appends serialize on their own
/// handle; loads use a separate read handle and never contend with the
/// appender.
pub struct Storage {
    directory: PathBuf,
    name: String,
    append: Mutex<AppendHandle>,
    reader: Mutex<File>,
}

struct AppendHandle {
    file: File,
    len: u64,
}

impl Storage {
    /// Opens or creates the storage file `name` inside `directory`.
    pub fn new(directory: impl AsRef<Path>, name: impl Into<String>) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        let name = name.into();
        std::fs::create_dir_all(&directory)?;

        let path = directory.join(&name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let len = file.metadata()?.len();
        let reader = OpenOptions::new().read(true).open(&path)?;

        Ok(Self {
            directory,
            name,
            append: Mutex::new(AppendHandle { file, len }),
            reader: Mutex::new(reader),
        })
    }

    /// Returns the storage directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Returns the storage file name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the full path of the storage file.
    pub fn path(&self) -> PathBuf {
        self.directory.join(&self.name)
    }

    /// Appends every queued node, assigning each handle its final position.
    ///
    /// Queued nodes arrive bottom-up (children strictly before parents), so
    /// every child position is already assigned when its parent serializes.
    pub(crate) fn save<T: Datum>(&self, queue: &[NodeRef<T>]) -> Result<()> {
        let mut guard = self.append.lock();
        let handle = &mut *guard;
        handle.file.seek(SeekFrom::Start(handle.len))?;

        for node_ref in queue {
            let node = node_ref
                .resident()
                .ok_or_else(|| ArborError::Internal("queued node is not resident".to_string()))?;
            let position = Position::new(0, handle.len as i64);
            node_ref.set_position(position);

            let bytes = encode_node(&node)?;
            handle.file.write_all(&bytes)?;
            handle.len += bytes.len() as u64;
            trace!(position = %position, keys = node.len(), bytes = bytes.len(), "appended node");
        }

        handle.file.flush()?;
        Ok(())
    }

    /// Reads and decodes the node stored at `position`.
    pub(crate) fn load_node<T: Datum>(
        &self,
        position: Position,
        ctx: &Arc<TreeContext<T>>,
    ) -> Result<Node<T>> {
        if position.offset < 0 {
            return Err(ArborError::Corrupted(format!(
                "invalid node position {}",
                position
            )));
        }

        let file = self.reader.lock();
        let mut reader = BufReader::new(&*file);
        reader.seek(SeekFrom::Start(position.offset as u64))?;
        let node = decode_node(&mut reader, ctx)?;
        trace!(position = %position, keys = node.len(), "loaded node");
        Ok(node)
    }
}

/// Serializes a node record: key count, then per key the length-prefixed
/// value bytes, both child positions (absent as the `(-1, -1)` sentinel),
/// and the deleted flag. All integers big-endian, no alignment, no checksum.
fn encode_node<T: Datum>(node: &Node<T>) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    buf.put_u32(node.len() as u32);
    for key in node.keys() {
        let mut value = BytesMut::new();
        key.value().write_to(&mut value);
        buf.put_u32(value.len() as u32);
        buf.put_slice(&value);
        put_child(&mut buf, key.left())?;
        put_child(&mut buf, key.right())?;
        buf.put_u8(key.is_deleted() as u8);
    }
    Ok(buf.freeze())
}

fn put_child<T: Datum>(buf: &mut BytesMut, child: Option<&NodeRef<T>>) -> Result<()> {
    match child {
        Some(node_ref) => {
            let position = node_ref.position().ok_or_else(|| {
                ArborError::Internal("child node flushed out of order".to_string())
            })?;
            position.put(buf);
        }
        None => Position::put_absent(buf),
    }
    Ok(())
}

fn decode_node<T: Datum, R: Read>(reader: &mut R, ctx: &Arc<TreeContext<T>>) -> Result<Node<T>> {
    let count = read_u32(reader)? as usize;
    let mut keys = Vec::with_capacity(count);
    let mut previous_right: Option<NodeRef<T>> = None;

    for _ in 0..count {
        let len = read_u32(reader)? as usize;
        let mut value = vec![0u8; len];
        reader.read_exact(&mut value)?;
        let value = T::read_from(&value)?;

        let left_position = read_position(reader)?;
        let right_position = read_position(reader)?;
        let deleted = read_u8(reader)? != 0;

        // Adjacent keys share a child; reuse the previous key's right handle
        // when the positions match so the in-memory tree keeps the shared
        // edge.
        let left = match (left_position, &previous_right) {
            (Some(position), Some(prev)) if prev.position() == Some(position) => {
                Some(prev.clone())
            }
            (Some(position), _) => Some(NodeRef::persistent(ctx, position)),
            (None, _) => None,
        };
        let right = right_position.map(|position| NodeRef::persistent(ctx, position));
        previous_right = right.clone();

        keys.push(Key::with_links(value, left, right, deleted));
    }

    Ok(Node::new(keys))
}

fn read_u8(reader: &mut impl Read) -> Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32(reader: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_i64(reader: &mut impl Read) -> Result<i64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(i64::from_be_bytes(buf))
}

fn read_position(reader: &mut impl Read) -> Result<Option<Position>> {
    let file_number = read_i64(reader)?;
    let offset = read_i64(reader)?;
    Ok(Position::from_pair(file_number, offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_context() -> Arc<TreeContext<i64>> {
        Arc::new(TreeContext {
            storage: None,
            cache: None,
        })
    }

    fn leaf(ctx: &Arc<TreeContext<i64>>, values: &[i64]) -> NodeRef<i64> {
        let keys = values.iter().map(|v| Key::new(*v)).collect();
        NodeRef::fresh(ctx, Node::new(keys))
    }

    #[test]
    fn test_storage_new_creates_file() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path(), "test.storage").unwrap();
        assert!(storage.path().exists());
        assert_eq!(storage.name(), "test.storage");
        assert_eq!(storage.directory(), dir.path());
    }

    #[test]
    fn test_save_assigns_sequential_positions() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path(), "seq.storage").unwrap();
        let ctx = test_context();

        let a = leaf(&ctx, &[1, 2]);
        let b = leaf(&ctx, &[3]);
        storage.save(&[a.clone(), b.clone()]).unwrap();

        // A leaf record is 4 bytes of header plus 45 bytes per key
        // (4 + 8 value, 16 + 16 child positions, 1 flag).
        assert_eq!(a.position(), Some(Position::new(0, 0)));
        assert_eq!(b.position(), Some(Position::new(0, 94)));
    }

    #[test]
    fn test_save_load_leaf_roundtrip() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path(), "leaf.storage").unwrap();
        let ctx = test_context();

        let mut keys = vec![Key::new(10i64), Key::new(20), Key::new(30)];
        keys[1].mark_deleted();
        let node_ref = NodeRef::fresh(&ctx, Node::new(keys));
        storage.save(&[node_ref.clone()]).unwrap();

        let loaded = storage.load_node(node_ref.position().unwrap(), &ctx).unwrap();
        let keys = loaded.keys();
        assert_eq!(keys.len(), 3);
        assert_eq!(*keys[0].value(), 10);
        assert_eq!(*keys[1].value(), 20);
        assert!(keys[1].is_deleted());
        assert!(!keys[2].is_deleted());
        assert!(keys.iter().all(|k| k.left().is_none() && k.right().is_none()));
    }

    #[test]
    fn test_save_load_interior_shares_children() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path(), "interior.storage").unwrap();
        let ctx = test_context();

        let a = leaf(&ctx, &[1]);
        let b = leaf(&ctx, &[3]);
        let c = leaf(&ctx, &[5]);
        let keys = vec![
            Key::with_links(2i64, Some(a.clone()), Some(b.clone()), false),
            Key::with_links(4i64, Some(b.clone()), Some(c.clone()), false),
        ];
        let parent = NodeRef::fresh(&ctx, Node::new(keys));
        storage
            .save(&[a.clone(), b.clone(), c.clone(), parent.clone()])
            .unwrap();

        let loaded = storage.load_node(parent.position().unwrap(), &ctx).unwrap();
        let keys = loaded.keys();
        assert_eq!(keys[0].left().unwrap().position(), a.position());
        assert_eq!(keys[0].right().unwrap().position(), b.position());
        assert_eq!(keys[1].right().unwrap().position(), c.position());
        // The decoded middle child is one shared handle, not two.
        assert!(keys[0].right().unwrap().ptr_eq(keys[1].left().unwrap()));
    }

    #[test]
    fn test_updated_node_appends_new_copy() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path(), "append.storage").unwrap();
        let ctx = test_context();

        let first = leaf(&ctx, &[1]);
        storage.save(&[first.clone()]).unwrap();
        let before = std::fs::metadata(storage.path()).unwrap().len();

        let second = leaf(&ctx, &[1, 2]);
        storage.save(&[second.clone()]).unwrap();
        let after = std::fs::metadata(storage.path()).unwrap().len();

        assert!(after > before);
        assert_ne!(first.position(), second.position());
        // The stale copy stays readable.
        let old = storage.load_node(first.position().unwrap(), &ctx).unwrap();
        assert_eq!(old.len(), 1);
    }

    #[test]
    fn test_load_from_truncated_file_fails() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path(), "trunc.storage").unwrap();
        let ctx = test_context();

        let err = storage.load_node(Position::new(0, 9999), &ctx).unwrap_err();
        assert!(matches!(err, ArborError::Io(_)));
    }
}

//! # LSM-Tree
//!
//! A persistent ordered map layered over the store:
//! - In-memory nodes form a crit-bit trie, canonical for any key set
//! - Insertions are buffered in node-local update buffers and never
//!   load stowed subtrees (amortized O(1) in memory)
//! - Removal is eager, loading and merging remotes on the path
//! - Compaction flushes oversized buffers into freshly stowed
//!   subtrees under a size-estimated threshold, yielding
//!   larger-than-memory ordered structures
//!
//! Values live behind the [`TreeValue`] trait (write, read, size
//! estimate), implemented here for raw byte strings and hashes. Trees
//! are plain values: serialize one into a key's value and the store's
//! conservative scanner keeps every stowed subtree alive; drop the
//! root and the garbage collector reclaims the lot.

use crate::codec::{
    read_bytes, read_hash, read_varnat, varnat_len, write_bytes, write_hash, write_varnat,
    CodecError,
};
use crate::hash::{Hash, HASH_LEN};
use crate::store::{Database, Result, StoreError, Transaction};

pub(crate) mod codec;
pub(crate) mod compact;
pub(crate) mod node;

use compact::{compact_node, estimate_node};
use node::{critbit, node_find, node_insert, node_remove, node_set_least, Node, Removed};

/// Default compaction threshold in estimated bytes.
pub const DEFAULT_COMPACTION_THRESHOLD: usize = 4096;

/// Minimum sensible threshold: a clean remote must estimate below it
/// or compaction could never terminate.
const MIN_COMPACTION_THRESHOLD: usize = 256;

/// A value that can live in a [`Tree`].
pub trait TreeValue: Clone {
    /// Appends the self-delimiting encoding of this value.
    fn write(&self, out: &mut Vec<u8>);

    /// Reads a value back, advancing `input` past it.
    fn read(input: &mut &[u8]) -> std::result::Result<Self, CodecError>
    where
        Self: Sized;

    /// Estimated encoded size, used by the compaction driver.
    fn estimate(&self) -> usize;
}

impl TreeValue for Vec<u8> {
    fn write(&self, out: &mut Vec<u8>) {
        write_bytes(out, self);
    }

    fn read(input: &mut &[u8]) -> std::result::Result<Self, CodecError> {
        read_bytes(input)
    }

    fn estimate(&self) -> usize {
        varnat_len(self.len() as u64) + self.len() + 1
    }
}

impl TreeValue for Hash {
    fn write(&self, out: &mut Vec<u8>) {
        write_hash(out, self);
    }

    fn read(input: &mut &[u8]) -> std::result::Result<Self, CodecError> {
        read_hash(input)
    }

    fn estimate(&self) -> usize {
        HASH_LEN + 2
    }
}

struct RootEntry<V> {
    least: Vec<u8>,
    node: Node<V>,
}

/// A persistent ordered map from byte keys to `V`.
pub struct Tree<V: TreeValue> {
    root: Option<RootEntry<V>>,
    threshold: usize,
}

impl<V: TreeValue> Clone for Tree<V> {
    fn clone(&self) -> Self {
        Tree {
            root: self.root.as_ref().map(|r| RootEntry {
                least: r.least.clone(),
                node: r.node.clone(),
            }),
            threshold: self.threshold,
        }
    }
}

impl<V: TreeValue> Default for Tree<V> {
    fn default() -> Self {
        Tree::new()
    }
}

impl<V: TreeValue> Tree<V> {
    /// The empty tree.
    pub fn new() -> Tree<V> {
        Tree {
            root: None,
            threshold: DEFAULT_COMPACTION_THRESHOLD,
        }
    }

    /// A tree holding exactly one pair.
    pub fn singleton(key: &[u8], value: V) -> Tree<V> {
        let mut tree = Tree::new();
        tree.insert(key, value);
        tree
    }

    /// Overrides the compaction threshold, clamped to a workable
    /// minimum.
    pub fn with_threshold(mut self, threshold: usize) -> Tree<V> {
        self.threshold = threshold.max(MIN_COMPACTION_THRESHOLD);
        self
    }

    /// Returns true if the tree holds no pairs.
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// The smallest key in the tree, if any.
    pub fn least_key(&self) -> Option<&[u8]> {
        self.root.as_ref().map(|r| r.least.as_slice())
    }

    /// Inserts a pair. Buffered: stowed subtrees on the path are
    /// annotated, never loaded.
    pub fn insert(&mut self, key: &[u8], value: V) {
        match self.root.take() {
            None => {
                self.root = Some(RootEntry {
                    least: key.to_vec(),
                    node: Node::Leaf(value),
                });
            }
            Some(RootEntry { least, node }) => {
                let (node, least) = match critbit(key, &least) {
                    None => (node_set_least(node, key, value), least),
                    Some(c) => {
                        let (node, promoted) = node_insert(node, &least, c, key, value);
                        (node, if promoted { key.to_vec() } else { least })
                    }
                };
                self.root = Some(RootEntry { least, node });
            }
        }
    }

    /// Looks up `key`, loading stowed subtrees only when the key could
    /// plausibly be inside them.
    pub fn try_find(&self, db: &Database, key: &[u8]) -> Result<Option<&V>> {
        match &self.root {
            None => Ok(None),
            Some(r) => node_find(&r.node, &r.least, key, db),
        }
    }

    /// Returns true if `key` is present.
    pub fn contains_key(&self, db: &Database, key: &[u8]) -> Result<bool> {
        Ok(self.try_find(db, key)?.is_some())
    }

    /// Looks up `key`, failing with [`StoreError::MissingKey`] when it
    /// is absent.
    pub fn find(&self, db: &Database, key: &[u8]) -> Result<&V> {
        self.try_find(db, key)?.ok_or(StoreError::MissingKey)
    }

    /// Removes `key`, returning its value. Eager: stowed subtrees on
    /// the path are loaded and merged.
    pub fn remove(&mut self, db: &Database, key: &[u8]) -> Result<Option<V>> {
        match self.root.take() {
            None => Ok(None),
            Some(RootEntry { least, node }) => match node_remove(node, &least, key, db)? {
                Removed::Absent(node) => {
                    self.root = Some(RootEntry { least, node });
                    Ok(None)
                }
                Removed::Emptied(value) => Ok(Some(value)),
                Removed::Kept(value, node, new_least) => {
                    let least = new_least.unwrap_or(least);
                    self.root = Some(RootEntry { least, node });
                    Ok(Some(value))
                }
            },
        }
    }

    /// Flushes oversized update buffers into stowed subtrees through
    /// `tx`, so this tree's in-memory representation fits the
    /// threshold. Idempotent at a fixed threshold. The stowed nodes'
    /// ephemeral roots are charged to `tx`; committing a write that
    /// embeds this tree's serialized form roots them on disk.
    pub fn compact(&mut self, tx: &mut Transaction) -> Result<()> {
        if let Some(RootEntry { least, node }) = self.root.take() {
            let node = compact_node(node, &least, self.threshold, tx)?;
            self.root = Some(RootEntry { least, node });
        }
        Ok(())
    }

    /// Estimated serialized size of the in-memory representation.
    pub fn estimate(&self) -> usize {
        match &self.root {
            None => 1,
            Some(r) => {
                1 + varnat_len(r.least.len() as u64) + r.least.len() + 1 + estimate_node(&r.node)
            }
        }
    }

    /// Appends the self-delimiting encoding of this tree.
    pub fn serialize(&self, out: &mut Vec<u8>) {
        match &self.root {
            None => write_varnat(out, 0),
            Some(r) => {
                write_varnat(out, 1);
                write_bytes(out, &r.least);
                codec::write_node(out, &r.node);
            }
        }
    }

    /// The encoded tree as a fresh buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.serialize(&mut out);
        out
    }

    /// Decodes a tree previously produced by [`Tree::serialize`].
    /// Fails if trailing bytes remain.
    pub fn deserialize(bytes: &[u8]) -> Result<Tree<V>> {
        let mut input = bytes;
        let tree = Self::read(&mut input)?;
        if !input.is_empty() {
            return Err(StoreError::Codec(CodecError::TrailingBytes));
        }
        Ok(tree)
    }

    /// Reads a tree, advancing `input` past it.
    pub fn read(input: &mut &[u8]) -> Result<Tree<V>> {
        match read_varnat(input)? {
            0 => Ok(Tree::new()),
            1 => {
                let least = read_bytes(input)?;
                let node = codec::read_node(input)?;
                Ok(Tree {
                    root: Some(RootEntry { least, node }),
                    threshold: DEFAULT_COMPACTION_THRESHOLD,
                })
            }
            other => Err(StoreError::Codec(CodecError::UnknownTag(other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Config;
    use std::collections::BTreeMap;

    fn open_test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::new(dir.path().join("db"));
        config.gc_enabled = false;
        let db = Database::open(config).unwrap();
        (dir, db)
    }

    fn value(text: &str) -> Vec<u8> {
        text.as_bytes().to_vec()
    }

    #[test]
    fn test_empty_and_singleton() {
        let (_dir, db) = open_test_db();
        let empty: Tree<Vec<u8>> = Tree::new();
        assert!(empty.is_empty());
        assert_eq!(empty.try_find(&db, b"anything").unwrap(), None);

        let one = Tree::singleton(b"key", value("v"));
        assert!(!one.is_empty());
        assert_eq!(one.try_find(&db, b"key").unwrap(), Some(&value("v")));
        assert_eq!(one.try_find(&db, b"other").unwrap(), None);
        assert_eq!(one.least_key(), Some(&b"key"[..]));
    }

    #[test]
    fn test_insert_find_small() {
        let (_dir, db) = open_test_db();
        let mut tree = Tree::new();
        for (k, v) in [("b", "2"), ("a", "1"), ("c", "3"), ("ab", "12")] {
            tree.insert(k.as_bytes(), value(v));
        }
        for (k, v) in [("a", "1"), ("ab", "12"), ("b", "2"), ("c", "3")] {
            assert_eq!(tree.try_find(&db, k.as_bytes()).unwrap(), Some(&value(v)));
        }
        assert_eq!(tree.try_find(&db, b"missing").unwrap(), None);
        assert_eq!(tree.least_key(), Some(&b"a"[..]));
    }

    #[test]
    fn test_insert_overwrites() {
        let (_dir, db) = open_test_db();
        let mut tree = Tree::new();
        tree.insert(b"k", value("old"));
        tree.insert(b"k", value("new"));
        assert_eq!(tree.try_find(&db, b"k").unwrap(), Some(&value("new")));
    }

    #[test]
    fn test_find_errors_on_absent_key() {
        let (_dir, db) = open_test_db();
        let tree = Tree::singleton(b"k", value("v"));
        assert!(matches!(
            tree.find(&db, b"absent"),
            Err(StoreError::MissingKey)
        ));
    }

    #[test]
    fn test_remove_small() {
        let (_dir, db) = open_test_db();
        let mut tree = Tree::new();
        for k in ["a", "b", "c"] {
            tree.insert(k.as_bytes(), value(k));
        }
        assert_eq!(tree.remove(&db, b"b").unwrap(), Some(value("b")));
        assert_eq!(tree.try_find(&db, b"b").unwrap(), None);
        assert_eq!(tree.try_find(&db, b"a").unwrap(), Some(&value("a")));
        assert_eq!(tree.try_find(&db, b"c").unwrap(), Some(&value("c")));
        assert_eq!(tree.remove(&db, b"b").unwrap(), None);
    }

    #[test]
    fn test_remove_least_updates_root() {
        let (_dir, db) = open_test_db();
        let mut tree = Tree::new();
        tree.insert(b"a", value("1"));
        tree.insert(b"b", value("2"));
        assert_eq!(tree.remove(&db, b"a").unwrap(), Some(value("1")));
        assert_eq!(tree.least_key(), Some(&b"b"[..]));
        assert_eq!(tree.try_find(&db, b"b").unwrap(), Some(&value("2")));
        assert_eq!(tree.remove(&db, b"b").unwrap(), Some(value("2")));
        assert!(tree.is_empty());
    }

    #[test]
    fn test_serialize_round_trip_in_memory() {
        let (_dir, db) = open_test_db();
        let mut tree = Tree::new();
        for i in 0..50u32 {
            tree.insert(format!("key-{:03}", i).as_bytes(), value(&i.to_string()));
        }
        let bytes = tree.to_bytes();
        let back: Tree<Vec<u8>> = Tree::deserialize(&bytes).unwrap();
        assert_eq!(back.to_bytes(), bytes);
        for i in 0..50u32 {
            assert_eq!(
                back.try_find(&db, format!("key-{:03}", i).as_bytes())
                    .unwrap(),
                Some(&value(&i.to_string()))
            );
        }
    }

    #[test]
    fn test_compact_then_find() {
        let (_dir, db) = open_test_db();
        let mut tree = Tree::new().with_threshold(MIN_COMPACTION_THRESHOLD);
        let mut model = BTreeMap::new();
        for i in 0..200u32 {
            let k = format!("k{:04}", i);
            let v = value(&format!("payload {}", i));
            model.insert(k.clone(), v.clone());
            tree.insert(k.as_bytes(), v);
        }

        let mut tx = db.begin();
        tree.compact(&mut tx).unwrap();
        assert!(tree.estimate() <= MIN_COMPACTION_THRESHOLD * 2);

        for (k, v) in &model {
            assert_eq!(tree.try_find(&db, k.as_bytes()).unwrap(), Some(v));
        }

        // Compaction is idempotent at a fixed threshold.
        let before = tree.to_bytes();
        tree.compact(&mut tx).unwrap();
        assert_eq!(tree.to_bytes(), before);
    }

    #[test]
    fn test_insert_after_compact_buffers() {
        let (_dir, db) = open_test_db();
        let mut tree = Tree::new().with_threshold(MIN_COMPACTION_THRESHOLD);
        for i in 0..100u32 {
            tree.insert(format!("k{:04}", i).as_bytes(), value("x"));
        }
        let mut tx = db.begin();
        tree.compact(&mut tx).unwrap();

        // New inserts land in update buffers without loading.
        tree.insert(b"k0050x", value("buffered"));
        tree.insert(b"a-before-everything", value("promoted"));
        assert_eq!(
            tree.try_find(&db, b"k0050x").unwrap(),
            Some(&value("buffered"))
        );
        assert_eq!(
            tree.try_find(&db, b"a-before-everything").unwrap(),
            Some(&value("promoted"))
        );
        assert_eq!(tree.least_key(), Some(&b"a-before-everything"[..]));
        assert_eq!(tree.try_find(&db, b"k0050").unwrap(), Some(&value("x")));
    }

    #[test]
    fn test_remove_through_compacted_tree() {
        let (_dir, db) = open_test_db();
        let mut tree = Tree::new().with_threshold(MIN_COMPACTION_THRESHOLD);
        for i in 0..100u32 {
            tree.insert(format!("k{:04}", i).as_bytes(), value(&i.to_string()));
        }
        let mut tx = db.begin();
        tree.compact(&mut tx).unwrap();

        assert_eq!(tree.remove(&db, b"k0042").unwrap(), Some(value("42")));
        assert_eq!(tree.try_find(&db, b"k0042").unwrap(), None);
        assert_eq!(tree.try_find(&db, b"k0041").unwrap(), Some(&value("41")));
        assert_eq!(tree.try_find(&db, b"k0043").unwrap(), Some(&value("43")));
    }

    #[test]
    fn test_serialized_compacted_tree_reloads_from_store() {
        let (_dir, db) = open_test_db();
        let mut tree = Tree::new().with_threshold(MIN_COMPACTION_THRESHOLD);
        for i in 0..150u32 {
            tree.insert(format!("k{:04}", i).as_bytes(), value(&i.to_string()));
        }
        let mut tx = db.begin();
        tree.compact(&mut tx).unwrap();
        let bytes = tree.to_bytes();
        tx.write_key(b"index", &bytes).unwrap();
        assert!(tx.commit().unwrap().wait().unwrap());

        // A fresh handle deserializes the root and pages subtrees in
        // from the resource store on demand.
        let stored = db.read_key(b"index").unwrap();
        let reloaded: Tree<Vec<u8>> = Tree::deserialize(&stored).unwrap();
        for i in 0..150u32 {
            assert_eq!(
                reloaded
                    .try_find(&db, format!("k{:04}", i).as_bytes())
                    .unwrap(),
                Some(&value(&i.to_string()))
            );
        }
    }

    #[test]
    fn test_hash_values() {
        let (_dir, db) = open_test_db();
        let mut tree: Tree<Hash> = Tree::new();
        let h = crate::hash::hash(b"payload");
        tree.insert(b"ref", h);
        assert_eq!(tree.try_find(&db, b"ref").unwrap(), Some(&h));
        let back: Tree<Hash> = Tree::deserialize(&tree.to_bytes()).unwrap();
        assert_eq!(back.try_find(&db, b"ref").unwrap(), Some(&h));
    }
}

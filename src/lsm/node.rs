//! Crit-bit trie nodes with stowed subtrees.
//!
//! Keys are addressed nine bits per byte: a presence bit (1 while the
//! byte exists, 0 past the end) followed by the eight data bits, most
//! significant first. The padding is injective over variable-length
//! keys and keeps trie order equal to lexicographic byte order.
//!
//! A node is one of:
//! - `Leaf(value)` — holds the value of the enclosing least key
//! - `Inner(critbit, left, right_key, right)` — keys in `right` agree
//!   with `right_key` on every bit below `critbit` and carry a 1 at
//!   it; keys in `left` carry a 0 there
//! - `Remote(critbit, updates, link)` — a stowed subtree behind a
//!   resource hash, with an in-memory buffer of pending insertions
//!   merged on load
//!
//! Least keys are threaded through every operation rather than stored
//! in leaves, following the enclosing structure's bookkeeping.

use super::codec::read_node;
use super::TreeValue;
use crate::hash::Hash;
use crate::store::{Database, Result};
use once_cell::sync::OnceCell;
use std::collections::BTreeMap;

/// Returns the addressed bit of `key`, zero past the end.
pub(crate) fn bit_at(key: &[u8], bit: u64) -> bool {
    let byte = (bit / 9) as usize;
    let off = (bit % 9) as u8;
    if byte >= key.len() {
        return false;
    }
    if off == 0 {
        return true;
    }
    (key[byte] >> (8 - off)) & 1 == 1
}

/// The most significant bit at which two keys differ, or `None` for
/// equal keys.
pub(crate) fn critbit(a: &[u8], b: &[u8]) -> Option<u64> {
    let min = a.len().min(b.len());
    for i in 0..min {
        let x = a[i] ^ b[i];
        if x != 0 {
            return Some(i as u64 * 9 + 1 + x.leading_zeros() as u64);
        }
    }
    if a.len() != b.len() {
        Some(min as u64 * 9)
    } else {
        None
    }
}

#[derive(Clone)]
pub(crate) enum Node<V> {
    Leaf(V),
    Inner(Box<InnerNode<V>>),
    Remote(Box<RemoteNode<V>>),
}

#[derive(Clone)]
pub(crate) struct InnerNode<V> {
    pub critbit: u64,
    pub left: Node<V>,
    pub right_key: Vec<u8>,
    pub right: Node<V>,
}

#[derive(Clone)]
pub(crate) struct RemoteNode<V> {
    /// The bit at which the stowed subtree's keys begin to
    /// discriminate; `u64::MAX` for a single-key subtree. Lets a
    /// lookup rule the subtree out without loading it.
    pub critbit: u64,
    pub updates: Option<Updates<V>>,
    pub link: Link<V>,
}

/// Pending insertions into a stowed subtree, plus the least key the
/// subtree had when it was stowed (the enclosing structure's recorded
/// least may since have moved onto a buffered key).
#[derive(Clone)]
pub(crate) struct Updates<V> {
    pub buffer: BTreeMap<Vec<u8>, V>,
    pub original_least: Vec<u8>,
}

/// A reference to a stowed node, loaded on demand and cached.
#[derive(Clone)]
pub(crate) struct Link<V> {
    pub hash: Hash,
    cache: OnceCell<Box<Node<V>>>,
}

impl<V: TreeValue> Link<V> {
    pub fn new(hash: Hash) -> Link<V> {
        Link {
            hash,
            cache: OnceCell::new(),
        }
    }

    /// A link whose cache is prefilled with the node just stowed.
    pub fn with_cached(hash: Hash, node: Node<V>) -> Link<V> {
        Link {
            hash,
            cache: OnceCell::with_value(Box::new(node)),
        }
    }

    pub fn load(&self, db: &Database) -> Result<&Node<V>> {
        let boxed = self.cache.get_or_try_init(|| {
            let bytes = db.load_resource(&self.hash)?;
            let mut input = bytes.as_slice();
            let node: Node<V> = read_node(&mut input)?;
            Ok::<_, crate::store::StoreError>(Box::new(node))
        })?;
        Ok(&**boxed)
    }
}

impl<V> Node<V> {
    /// The bit at which this node's keys begin to discriminate.
    pub(crate) fn discriminant(&self) -> u64 {
        match self {
            Node::Leaf(_) => u64::MAX,
            Node::Inner(n) => n.critbit,
            Node::Remote(r) => r.critbit,
        }
    }
}

/// Replaces the value of the subtree's least key (which equals `key`).
pub(crate) fn node_set_least<V: TreeValue>(node: Node<V>, key: &[u8], value: V) -> Node<V> {
    match node {
        Node::Leaf(_) => Node::Leaf(value),
        Node::Inner(n) => {
            let InnerNode {
                critbit,
                left,
                right_key,
                right,
            } = *n;
            let left = node_set_least(left, key, value);
            Node::Inner(Box::new(InnerNode {
                critbit,
                left,
                right_key,
                right,
            }))
        }
        Node::Remote(mut r) => {
            let updates = r.updates.get_or_insert_with(|| Updates {
                buffer: BTreeMap::new(),
                original_least: key.to_vec(),
            });
            updates.buffer.insert(key.to_vec(), value);
            Node::Remote(r)
        }
    }
}

/// Inserts `key` into the subtree whose least key is `least`, given
/// `c = critbit(key, least)`. Returns the new subtree and whether
/// `key` became its least key. Never loads a `Remote`: divergence
/// above a remote's discriminant splits the spine, anything else
/// lands in its update buffer.
pub(crate) fn node_insert<V: TreeValue>(
    node: Node<V>,
    least: &[u8],
    c: u64,
    key: &[u8],
    value: V,
) -> (Node<V>, bool) {
    if c < node.discriminant() {
        // The key parts company above everything this node orders.
        return if bit_at(key, c) {
            (
                Node::Inner(Box::new(InnerNode {
                    critbit: c,
                    left: node,
                    right_key: key.to_vec(),
                    right: Node::Leaf(value),
                })),
                false,
            )
        } else {
            (
                Node::Inner(Box::new(InnerNode {
                    critbit: c,
                    left: Node::Leaf(value),
                    right_key: least.to_vec(),
                    right: node,
                })),
                true,
            )
        };
    }
    match node {
        // A leaf discriminates nowhere, so it always splits above.
        Node::Leaf(_) => unreachable!("leaf insert handled by the split"),
        Node::Inner(n) => {
            let InnerNode {
                critbit: cb,
                left,
                right_key,
                right,
            } = *n;
            if !bit_at(key, cb) {
                let (left, promoted) = node_insert(left, least, c, key, value);
                (
                    Node::Inner(Box::new(InnerNode {
                        critbit: cb,
                        left,
                        right_key,
                        right,
                    })),
                    promoted,
                )
            } else {
                match critbit(key, &right_key) {
                    None => {
                        let right = node_set_least(right, key, value);
                        (
                            Node::Inner(Box::new(InnerNode {
                                critbit: cb,
                                left,
                                right_key,
                                right,
                            })),
                            false,
                        )
                    }
                    Some(cr) => {
                        let (right, promoted) = node_insert(right, &right_key, cr, key, value);
                        let right_key = if promoted { key.to_vec() } else { right_key };
                        (
                            Node::Inner(Box::new(InnerNode {
                                critbit: cb,
                                left,
                                right_key,
                                right,
                            })),
                            false,
                        )
                    }
                }
            }
        }
        Node::Remote(mut r) => {
            let promoted = !bit_at(key, c);
            let updates = r.updates.get_or_insert_with(|| Updates {
                buffer: BTreeMap::new(),
                original_least: least.to_vec(),
            });
            updates.buffer.insert(key.to_vec(), value);
            (Node::Remote(r), promoted)
        }
    }
}

/// Finds `key` in the subtree whose least key is `least`. Remote
/// children are loaded only when the key could plausibly be inside.
pub(crate) fn node_find<'a, V: TreeValue>(
    node: &'a Node<V>,
    least: &[u8],
    key: &[u8],
    db: &Database,
) -> Result<Option<&'a V>> {
    match node {
        Node::Leaf(v) => Ok(if key == least { Some(v) } else { None }),
        Node::Inner(n) => {
            if bit_at(key, n.critbit) {
                node_find(&n.right, &n.right_key, key, db)
            } else {
                node_find(&n.left, least, key, db)
            }
        }
        Node::Remote(r) => {
            if let Some(u) = &r.updates {
                if let Some(v) = u.buffer.get(key) {
                    return Ok(Some(v));
                }
            }
            let orig: &[u8] = r
                .updates
                .as_ref()
                .map(|u| u.original_least.as_slice())
                .unwrap_or(least);
            if let Some(c) = critbit(key, orig) {
                if c < r.critbit {
                    return Ok(None);
                }
            }
            let child = r.link.load(db)?;
            node_find(child, orig, key, db)
        }
    }
}

/// Loads a remote subtree and folds its buffered insertions in,
/// producing the plain node the remote stands for.
pub(crate) fn merge_remote<V: TreeValue>(
    remote: RemoteNode<V>,
    least: &[u8],
    db: &Database,
) -> Result<Node<V>> {
    let mut node = remote.link.load(db)?.clone();
    let mut cur_least: Vec<u8> = match &remote.updates {
        Some(u) => u.original_least.clone(),
        None => least.to_vec(),
    };
    if let Some(updates) = remote.updates {
        for (k, v) in updates.buffer {
            match critbit(&k, &cur_least) {
                None => node = node_set_least(node, &k, v),
                Some(c) => {
                    let (merged, promoted) = node_insert(node, &cur_least, c, &k, v);
                    node = merged;
                    if promoted {
                        cur_least = k;
                    }
                }
            }
        }
    }
    debug_assert_eq!(cur_least.as_slice(), least, "merge preserves the least key");
    Ok(node)
}

/// The outcome of removing a key from a subtree.
pub(crate) enum Removed<V> {
    /// Key absent; the subtree is returned unchanged.
    Absent(Node<V>),
    /// The value was removed and the subtree is now empty.
    Emptied(V),
    /// The value was removed; the subtree remains, with a new least
    /// key if one is carried.
    Kept(V, Node<V>, Option<Vec<u8>>),
}

/// Removes `key` from the subtree whose least key is `least`.
/// Eager: a remote on the path is loaded and merged first.
pub(crate) fn node_remove<V: TreeValue>(
    node: Node<V>,
    least: &[u8],
    key: &[u8],
    db: &Database,
) -> Result<Removed<V>> {
    match node {
        Node::Leaf(v) => {
            if key == least {
                Ok(Removed::Emptied(v))
            } else {
                Ok(Removed::Absent(Node::Leaf(v)))
            }
        }
        Node::Inner(n) => {
            let InnerNode {
                critbit: cb,
                left,
                right_key,
                right,
            } = *n;
            if bit_at(key, cb) {
                match node_remove(right, &right_key, key, db)? {
                    Removed::Absent(right) => Ok(Removed::Absent(Node::Inner(Box::new(
                        InnerNode {
                            critbit: cb,
                            left,
                            right_key,
                            right,
                        },
                    )))),
                    Removed::Emptied(v) => Ok(Removed::Kept(v, left, None)),
                    Removed::Kept(v, right, new_least) => {
                        let right_key = new_least.unwrap_or(right_key);
                        Ok(Removed::Kept(
                            v,
                            Node::Inner(Box::new(InnerNode {
                                critbit: cb,
                                left,
                                right_key,
                                right,
                            })),
                            None,
                        ))
                    }
                }
            } else {
                match node_remove(left, least, key, db)? {
                    Removed::Absent(left) => Ok(Removed::Absent(Node::Inner(Box::new(
                        InnerNode {
                            critbit: cb,
                            left,
                            right_key,
                            right,
                        },
                    )))),
                    Removed::Emptied(v) => Ok(Removed::Kept(v, right, Some(right_key))),
                    Removed::Kept(v, left, new_least) => Ok(Removed::Kept(
                        v,
                        Node::Inner(Box::new(InnerNode {
                            critbit: cb,
                            left,
                            right_key,
                            right,
                        })),
                        new_least,
                    )),
                }
            }
        }
        Node::Remote(r) => {
            let in_buffer = r
                .updates
                .as_ref()
                .map_or(false, |u| u.buffer.contains_key(key));
            if !in_buffer {
                let orig: &[u8] = r
                    .updates
                    .as_ref()
                    .map(|u| u.original_least.as_slice())
                    .unwrap_or(least);
                if let Some(c) = critbit(key, orig) {
                    if c < r.critbit {
                        return Ok(Removed::Absent(Node::Remote(r)));
                    }
                }
            }
            let merged = merge_remote(*r, least, db)?;
            node_remove(merged, least, key, db)
        }
    }
}

//! Size-estimated compaction.
//!
//! Every node type reports an estimated serialized size. Compaction is
//! a post-order pass: children are compacted first, then any node
//! whose estimate still exceeds the threshold is serialized, stowed as
//! a resource through the caller's transaction, and replaced by a
//! clean `Remote`. A remote whose update buffer has outgrown the
//! threshold is merged into its loaded child first, and the merge is
//! compacted recursively before being stowed again. At a fixed
//! threshold the pass is idempotent: a clean remote estimates far
//! below any sane threshold and is left alone.

use super::codec::write_node;
use super::node::{merge_remote, InnerNode, Link, Node, RemoteNode};
use super::TreeValue;
use crate::codec::varnat_len;
use crate::hash::HASH_LEN;
use crate::store::{Result, Transaction};

/// Estimated serialized size of a byte string.
fn bytestring_len(bytes: &[u8]) -> usize {
    // One byte of slack for the conditional separator.
    varnat_len(bytes.len() as u64) + bytes.len() + 1
}

/// Estimated serialized size of a node.
pub(crate) fn estimate_node<V: TreeValue>(node: &Node<V>) -> usize {
    match node {
        Node::Leaf(value) => 1 + value.estimate(),
        Node::Inner(n) => {
            1 + varnat_len(n.critbit)
                + estimate_node(&n.left)
                + bytestring_len(&n.right_key)
                + estimate_node(&n.right)
        }
        Node::Remote(r) => estimate_remote(r),
    }
}

/// Estimated serialized size of a remote node and its buffer.
pub(crate) fn estimate_remote<V: TreeValue>(r: &RemoteNode<V>) -> usize {
    let mut est = 1 + varnat_len(r.critbit) + 1 + HASH_LEN + 2;
    if let Some(u) = &r.updates {
        est += bytestring_len(&u.original_least) + varnat_len(u.buffer.len() as u64);
        for (key, value) in &u.buffer {
            est += bytestring_len(key) + value.estimate();
        }
    }
    est
}

/// Serializes and stows `node`, returning a clean remote whose cache
/// is prefilled with the node just written.
fn stow_node<V: TreeValue>(node: Node<V>, tx: &mut Transaction) -> Result<Node<V>> {
    let mut out = Vec::new();
    write_node(&mut out, &node);
    let hash = tx.stow_resource(&out)?;
    let critbit = node.discriminant();
    Ok(Node::Remote(Box::new(RemoteNode {
        critbit,
        updates: None,
        link: Link::with_cached(hash, node),
    })))
}

/// Compacts the subtree whose least key is `least` down to the
/// threshold.
pub(crate) fn compact_node<V: TreeValue>(
    node: Node<V>,
    least: &[u8],
    threshold: usize,
    tx: &mut Transaction,
) -> Result<Node<V>> {
    match node {
        Node::Leaf(value) => {
            let node = Node::Leaf(value);
            if estimate_node(&node) > threshold {
                stow_node(node, tx)
            } else {
                Ok(node)
            }
        }
        Node::Inner(n) => {
            let InnerNode {
                critbit,
                left,
                right_key,
                right,
            } = *n;
            let left = compact_node(left, least, threshold, tx)?;
            let right = compact_node(right, &right_key, threshold, tx)?;
            let node = Node::Inner(Box::new(InnerNode {
                critbit,
                left,
                right_key,
                right,
            }));
            if estimate_node(&node) > threshold {
                stow_node(node, tx)
            } else {
                Ok(node)
            }
        }
        Node::Remote(r) => {
            if estimate_remote(&r) <= threshold {
                return Ok(Node::Remote(r));
            }
            // The buffer outgrew the threshold: fold it into the
            // loaded child, then compact the merge.
            let merged = merge_remote(*r, least, tx.database())?;
            compact_node(merged, least, threshold, tx)
        }
    }
}

//! Node serialization.
//!
//! Nodes use the crate's self-delimiting primitives: a tag natural,
//! then the tag's fields in order. The format is concatenative, so a
//! node is read without any outer length framing, and embedded hash
//! references stay visible to the conservative scanner through the
//! byte-string separator rule and the bracketed hash literal.

use super::node::{InnerNode, Link, Node, RemoteNode, Updates};
use super::TreeValue;
use crate::codec::{
    read_bytes, read_hash, read_varnat, write_bytes, write_hash, write_varnat, CodecError,
};
use std::collections::BTreeMap;

const TAG_LEAF: u64 = 0;
const TAG_INNER: u64 = 1;
const TAG_REMOTE: u64 = 2;

pub(crate) fn write_node<V: TreeValue>(out: &mut Vec<u8>, node: &Node<V>) {
    match node {
        Node::Leaf(value) => {
            write_varnat(out, TAG_LEAF);
            value.write(out);
        }
        Node::Inner(n) => {
            write_varnat(out, TAG_INNER);
            write_varnat(out, n.critbit);
            write_node(out, &n.left);
            write_bytes(out, &n.right_key);
            write_node(out, &n.right);
        }
        Node::Remote(r) => {
            write_varnat(out, TAG_REMOTE);
            write_varnat(out, r.critbit);
            match &r.updates {
                None => write_varnat(out, 0),
                Some(u) => {
                    write_varnat(out, 1);
                    write_bytes(out, &u.original_least);
                    write_varnat(out, u.buffer.len() as u64);
                    for (key, value) in &u.buffer {
                        write_bytes(out, key);
                        value.write(out);
                    }
                }
            }
            write_hash(out, &r.link.hash);
        }
    }
}

pub(crate) fn read_node<V: TreeValue>(input: &mut &[u8]) -> Result<Node<V>, CodecError> {
    match read_varnat(input)? {
        TAG_LEAF => Ok(Node::Leaf(V::read(input)?)),
        TAG_INNER => {
            let critbit = read_varnat(input)?;
            let left = read_node(input)?;
            let right_key = read_bytes(input)?;
            let right = read_node(input)?;
            Ok(Node::Inner(Box::new(InnerNode {
                critbit,
                left,
                right_key,
                right,
            })))
        }
        TAG_REMOTE => {
            let critbit = read_varnat(input)?;
            let updates = match read_varnat(input)? {
                0 => None,
                1 => {
                    let original_least = read_bytes(input)?;
                    let count = read_varnat(input)?;
                    let mut buffer = BTreeMap::new();
                    for _ in 0..count {
                        let key = read_bytes(input)?;
                        let value = V::read(input)?;
                        buffer.insert(key, value);
                    }
                    Some(Updates {
                        buffer,
                        original_least,
                    })
                }
                other => return Err(CodecError::UnknownTag(other)),
            };
            let hash = read_hash(input)?;
            Ok(Node::Remote(Box::new(RemoteNode {
                critbit,
                updates,
                link: Link::new(hash),
            })))
        }
        other => Err(CodecError::UnknownTag(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash;

    fn round_trip(node: &Node<Vec<u8>>) -> Node<Vec<u8>> {
        let mut buf = Vec::new();
        write_node(&mut buf, node);
        let mut input = buf.as_slice();
        let back = read_node(&mut input).unwrap();
        assert!(input.is_empty());
        // The serialized form is the structural identity.
        let mut reserialized = Vec::new();
        write_node(&mut reserialized, &back);
        assert_eq!(buf, reserialized);
        back
    }

    #[test]
    fn test_leaf_round_trip() {
        round_trip(&Node::Leaf(b"value".to_vec()));
    }

    #[test]
    fn test_inner_round_trip() {
        let node = Node::Inner(Box::new(InnerNode {
            critbit: 10,
            left: Node::Leaf(b"left value".to_vec()),
            right_key: b"beta".to_vec(),
            right: Node::Leaf(b"right value".to_vec()),
        }));
        round_trip(&node);
    }

    #[test]
    fn test_remote_round_trip_with_updates() {
        let mut buffer = BTreeMap::new();
        buffer.insert(b"aa".to_vec(), b"1".to_vec());
        buffer.insert(b"zz".to_vec(), b"2".to_vec());
        let node: Node<Vec<u8>> = Node::Remote(Box::new(RemoteNode {
            critbit: 3,
            updates: Some(Updates {
                buffer,
                original_least: b"mm".to_vec(),
            }),
            link: Link::new(hash(b"pretend stowed node")),
        }));
        round_trip(&node);
    }

    #[test]
    fn test_remote_round_trip_clean() {
        let node: Node<Vec<u8>> = Node::Remote(Box::new(RemoteNode {
            critbit: u64::MAX,
            updates: None,
            link: Link::new(hash(b"leaf subtree")),
        }));
        round_trip(&node);
    }

    #[test]
    fn test_bad_tag_is_rejected() {
        let mut buf = Vec::new();
        write_varnat(&mut buf, 9);
        let mut input = buf.as_slice();
        assert!(matches!(
            read_node::<Vec<u8>>(&mut input),
            Err(CodecError::UnknownTag(9))
        ));
    }
}

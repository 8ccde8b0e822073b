use std::cmp::Ordering;

use prost::Message;

use qkv_proto::v1::{TreeEntry, TreeNode};
use qkv_types::KvError;

/// Tree key with its value as seen by the caller.
pub(crate) type Item = (Vec<u8>, Option<Vec<u8>>);

/// Continuation token anchored at `key`. Traversal resumes strictly after
/// (or before) the anchor whether or not the anchor key still exists.
pub(crate) fn encode_node(key: &[u8]) -> Vec<u8> {
    TreeNode { anchor: key.to_vec() }.encode_to_vec()
}

/// Empty token means "not positioned"; fall back to the request key.
pub(crate) fn anchor(node: &[u8], key: &[u8]) -> Result<Vec<u8>, KvError> {
    if node.is_empty() {
        return Ok(key.to_vec());
    }
    TreeNode::decode(node)
        .map(|n| n.anchor)
        .map_err(|e| KvError::InvalidArgument(format!("malformed tree node: {e}")))
}

/// Of a committed and a staged candidate, returns the one closest to the
/// anchor in the direction of travel. The staged one shadows an equal key.
pub(crate) fn nearest(committed: Option<Item>, staged: Option<Item>, forward: bool) -> Option<Item> {
    match (committed, staged) {
        (Some(c), Some(s)) => {
            let committed_first = match c.0.cmp(&s.0) {
                Ordering::Less => forward,
                Ordering::Greater => !forward,
                Ordering::Equal => false,
            };
            Some(if committed_first { c } else { s })
        }
        (c, s) => s.or(c),
    }
}

/// Merges two ascending streams of one tree into at most `limit` entries.
/// Staged items shadow committed ones with the same key.
pub(crate) fn merge(
    committed: impl Iterator<Item = Item>,
    staged: impl Iterator<Item = Item>,
    limit: usize,
) -> Vec<TreeEntry> {
    let mut committed = committed.peekable();
    let mut staged = staged.peekable();
    let mut entries = Vec::new();
    while entries.len() < limit {
        let order = match (committed.peek(), staged.peek()) {
            (None, None) => break,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(c), Some(s)) => c.0.cmp(&s.0),
        };
        let item = match order {
            Ordering::Less => committed.next(),
            Ordering::Greater => staged.next(),
            Ordering::Equal => {
                committed.next();
                staged.next()
            }
        };
        if let Some((key, value)) = item {
            entries.push(TreeEntry { key, value });
        }
    }
    entries
}

//! Call-stack aggregation tree.
//!
//! A trie from stack frames to sample counts: each node carries the
//! samples attributed to exactly that frame (`self_value`) and the sum
//! over its subtree (`total`). One tree aggregates one time bucket of
//! one segment. Children stay sorted by frame name so merges are a
//! linear zip.

use crate::core::{EmberError, Result};
use crate::storage::dict::Dictionary;
use bytes::{Buf, BufMut};
use num_rational::Ratio;
use std::fmt;

const TREE_FORMAT_V1: u8 = 1;

/// Frame name the truncated tail of a large tree collapses into.
const OTHER_FRAME: &str = "other";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct TreeNode {
    name: String,
    self_value: u64,
    total: u64,
    children: Vec<TreeNode>,
}

impl TreeNode {
    fn child_index(&self, name: &str) -> std::result::Result<usize, usize> {
        self.children
            .binary_search_by(|c| c.name.as_str().cmp(name))
    }

    fn insert(&mut self, stack: &[&str], value: u64) {
        self.total += value;
        match stack.split_first() {
            None => self.self_value += value,
            Some((head, rest)) => {
                let i = match self.child_index(head) {
                    Ok(i) => i,
                    Err(i) => {
                        self.children.insert(
                            i,
                            TreeNode {
                                name: head.to_string(),
                                ..TreeNode::default()
                            },
                        );
                        i
                    },
                };
                self.children[i].insert(rest, value);
            },
        }
    }

    fn merge(&mut self, other: &TreeNode) {
        self.self_value += other.self_value;
        self.total += other.total;
        for child in &other.children {
            match self.child_index(&child.name) {
                Ok(i) => self.children[i].merge(child),
                Err(i) => self.children.insert(i, child.clone()),
            }
        }
    }

    fn scale(&mut self, num: u64, den: u64) {
        self.self_value = scale_value(self.self_value, num, den);
        self.total = scale_value(self.total, num, den);
        for child in &mut self.children {
            child.scale(num, den);
        }
    }

    fn node_count(&self) -> usize {
        1 + self.children.iter().map(TreeNode::node_count).sum::<usize>()
    }

    fn collect_totals(&self, totals: &mut Vec<u64>) {
        totals.push(self.total);
        for child in &self.children {
            child.collect_totals(totals);
        }
    }
}

fn scale_value(v: u64, num: u64, den: u64) -> u64 {
    ((v as u128 * num as u128) / den as u128) as u64
}

/// The profile tree for one `(segment, depth, bucket)` triple.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    root: TreeNode,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one `frame;frame;...` stack with the given sample count.
    pub fn insert(&mut self, stack: &[u8], value: u64) {
        let stack = String::from_utf8_lossy(stack);
        let frames: Vec<&str> =
            stack.split(';').filter(|f| !f.is_empty()).collect();
        self.root.insert(&frames, value);
    }

    /// Insert a pre-split stack.
    pub fn insert_stack(&mut self, frames: &[&str], value: u64) {
        self.root.insert(frames, value);
    }

    /// Merge another tree into this one.
    pub fn merge(&mut self, other: &Tree) {
        self.root.merge(&other.root);
    }

    /// Deep copy with every value scaled by the exact ratio. Integer
    /// numerator/denominator arithmetic, no floats.
    pub fn clone_with_ratio(&self, ratio: Ratio<u64>) -> Tree {
        let mut out = self.clone();
        if ratio != Ratio::new(1, 1) {
            out.root.scale(*ratio.numer(), *ratio.denom());
        }
        out
    }

    /// Multiply every value in place.
    pub fn scale(&mut self, factor: u64) {
        self.root.scale(factor, 1);
    }

    /// Total number of samples held by the tree.
    pub fn samples(&self) -> u64 {
        self.root.total
    }

    pub fn is_empty(&self) -> bool {
        self.root.total == 0 && self.root.children.is_empty()
    }

    pub fn node_count(&self) -> usize {
        // The synthetic root is not a frame.
        self.root.node_count() - 1
    }

    /// The smallest subtree total that survives truncation to
    /// `max_nodes` nodes; anything strictly below collapses into
    /// [`OTHER_FRAME`].
    fn min_total(&self, max_nodes: usize) -> u64 {
        if max_nodes == 0 || self.node_count() <= max_nodes {
            return 0;
        }
        let mut totals = Vec::with_capacity(self.node_count());
        for child in &self.root.children {
            child.collect_totals(&mut totals);
        }
        totals.sort_unstable_by(|a, b| b.cmp(a));
        totals[max_nodes - 1]
    }

    /// Serialize with frame names interned through the application
    /// dictionary. Trees larger than `max_nodes` are truncated, the
    /// dropped subtrees folded into an `other` frame so totals stay
    /// intact. `max_nodes == 0` disables truncation.
    pub fn serialize(&self, dict: &mut Dictionary, max_nodes: usize) -> Vec<u8> {
        let min_total = self.min_total(max_nodes);
        let mut out = Vec::with_capacity(1 + self.node_count() * 16);
        out.put_u8(TREE_FORMAT_V1);
        serialize_node(&self.root, dict, min_total, &mut out);
        out
    }

    /// Decode a serialized tree. An unknown version byte or short input
    /// is a hard [`EmberError::Decode`].
    pub fn deserialize(dict: &Dictionary, bytes: &[u8]) -> Result<Tree> {
        let mut buf = bytes;
        Self::deserialize_consume(dict, &mut buf)
    }

    /// Decode a tree from the front of a buffer, advancing it past the
    /// consumed bytes. Lets callers append their own trailer.
    pub(crate) fn deserialize_consume(dict: &Dictionary, buf: &mut &[u8]) -> Result<Tree> {
        if buf.remaining() < 1 {
            return Err(EmberError::decode("tree: empty input"));
        }
        let version = buf.get_u8();
        if version != TREE_FORMAT_V1 {
            return Err(EmberError::Decode {
                message: format!("tree: unknown format version {}", version),
            });
        }
        let root = deserialize_node(dict, buf, true)?;
        Ok(Tree { root })
    }
}

fn serialize_node(node: &TreeNode, dict: &mut Dictionary, min_total: u64, out: &mut Vec<u8>) {
    out.put_u32_le(dict.put(&node.name));
    out.put_u64_le(node.self_value);

    let mut kept: Vec<&TreeNode> = Vec::with_capacity(node.children.len());
    let mut other: u64 = 0;
    for child in &node.children {
        if min_total > 0 && child.total < min_total {
            other += child.total;
        } else {
            kept.push(child);
        }
    }

    out.put_u32_le((kept.len() + usize::from(other > 0)) as u32);
    for child in kept {
        serialize_node(child, dict, min_total, out);
    }
    if other > 0 {
        // Collapsed subtrees become a leaf carrying their whole weight.
        out.put_u32_le(dict.put(OTHER_FRAME));
        out.put_u64_le(other);
        out.put_u32_le(0);
    }
}

fn deserialize_node(dict: &Dictionary, buf: &mut &[u8], is_root: bool) -> Result<TreeNode> {
    if buf.remaining() < 4 + 8 + 4 {
        return Err(EmberError::decode("tree: truncated node"));
    }
    let name_id = buf.get_u32_le();
    let name = if is_root {
        String::new()
    } else {
        dict.get(name_id)
            .ok_or_else(|| EmberError::Decode {
                message: format!("tree: unknown dictionary id {}", name_id),
            })?
            .to_string()
    };
    let self_value = buf.get_u64_le();
    let child_count = buf.get_u32_le() as usize;
    if child_count > buf.remaining() {
        return Err(EmberError::decode("tree: child count exceeds input"));
    }

    let mut children = Vec::with_capacity(child_count);
    let mut total = self_value;
    for _ in 0..child_count {
        let child = deserialize_node(dict, buf, false)?;
        total += child.total;
        children.push(child);
    }
    children.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(TreeNode {
        name,
        self_value,
        total,
        children,
    })
}

impl fmt::Display for Tree {
    /// Collapsed format: one `frame;frame value` line per node with
    /// self samples, depth-first in frame-name order.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn walk(node: &TreeNode, prefix: &str, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let path = if prefix.is_empty() {
                node.name.clone()
            } else {
                format!("{};{}", prefix, node.name)
            };
            if node.self_value > 0 {
                writeln!(f, "{} {}", path, node.self_value)?;
            }
            for child in &node.children {
                walk(child, &path, f)?;
            }
            Ok(())
        }
        for child in &self.root.children {
            walk(child, "", f)?;
        }
        Ok(())
    }
}

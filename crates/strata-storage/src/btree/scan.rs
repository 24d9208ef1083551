//! Key-ordered scans over the leaf chain.

use super::node::LeafNode;
use super::tree::BPlusTree;
use crate::record::RecordId;
use strata_common::{DataBox, Result};

/// Iterator over `(key, rid)` pairs in key order.
///
/// Loads one leaf at a time and follows next-leaf pointers. Not safe to use
/// while the tree is being modified.
pub struct BTreeScan<'a> {
    tree: &'a BPlusTree,
    leaf: Option<LeafNode>,
    pos: usize,
    /// Entries below this key are skipped; cleared once passed.
    lower: Option<DataBox>,
}

impl<'a> BTreeScan<'a> {
    pub(crate) fn new(tree: &'a BPlusTree, leaf: LeafNode, lower: Option<DataBox>) -> Self {
        Self {
            tree,
            leaf: Some(leaf),
            pos: 0,
            lower,
        }
    }
}

impl Iterator for BTreeScan<'_> {
    type Item = Result<(DataBox, RecordId)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let leaf = self.leaf.as_ref()?;
            if let Some(entry) = leaf.entries.get(self.pos) {
                self.pos += 1;
                if let Some(lower) = &self.lower {
                    if entry.key < *lower {
                        continue;
                    }
                    self.lower = None;
                }
                return Some(Ok((entry.key.clone(), entry.rid)));
            }

            let next = leaf.next_leaf;
            self.leaf = None;
            self.pos = 0;
            if let Some(page_num) = next {
                match self.tree.read_leaf(page_num) {
                    Ok(leaf) => self.leaf = Some(leaf),
                    Err(e) => return Some(Err(e)),
                }
            }
        }
    }
}

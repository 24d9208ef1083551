//! B+ tree node pages.
//!
//! Every node occupies one page. The first byte says which kind it is.
//!
//! Leaf page layout:
//! ```text
//! +-------------------------+ 0
//! | flag: u8 = 1            |
//! | next_leaf: i32 (-1)     |
//! | num_entries: i32        |
//! +-------------------------+ 9 (NODE_HEADER_SIZE)
//! | key | page: i32 | slot: i32 |
//! | ...                     |
//! +-------------------------+
//! ```
//!
//! Inner page layout:
//! ```text
//! +-------------------------+ 0
//! | flag: u8 = 0            |
//! | first_child: i32        |
//! | num_entries: i32        |
//! +-------------------------+ 9 (NODE_HEADER_SIZE)
//! | key | child: i32        |
//! | ...                     |
//! +-------------------------+
//! ```
//!
//! Keys are fixed width, encoded like a record column of the tree's key type.

use super::constants::{INNER_FLAG, LEAF_FLAG, NODE_HEADER_SIZE, NO_PAGE};
use crate::record::RecordId;
use crate::schema::{get_value, put_value};
use bytes::{Buf, BufMut, BytesMut};
use strata_common::page::{Page, PageId, PAGE_SIZE};
use strata_common::{DataBox, DataType, Result, StrataError};

/// Key and record location stored in a leaf.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct LeafEntry {
    pub key: DataBox,
    pub rid: RecordId,
}

impl LeafEntry {
    pub fn new(key: DataBox, rid: RecordId) -> Self {
        Self { key, rid }
    }
}

/// Separator key and the child holding keys at or above it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerEntry {
    pub key: DataBox,
    pub child: u32,
}

impl InnerEntry {
    pub fn new(key: DataBox, child: u32) -> Self {
        Self { key, child }
    }
}

/// Decoded leaf node.
#[derive(Debug, Clone, PartialEq)]
pub struct LeafNode {
    pub page_num: u32,
    pub next_leaf: Option<u32>,
    /// Entries sorted by (key, rid).
    pub entries: Vec<LeafEntry>,
}

/// Decoded inner node.
#[derive(Debug, Clone, PartialEq)]
pub struct InnerNode {
    pub page_num: u32,
    pub first_child: u32,
    /// Entries sorted by key; child `i + 1` is `entries[i].child`.
    pub entries: Vec<InnerEntry>,
}

/// A node of either kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Leaf(LeafNode),
    Inner(InnerNode),
}

impl Node {
    /// Decodes whichever node kind the page's flag names.
    pub fn from_page(page: &Page, key_type: &DataType) -> Result<Self> {
        match page.read_u8(0) {
            LEAF_FLAG => LeafNode::from_page(page, key_type).map(Node::Leaf),
            INNER_FLAG => InnerNode::from_page(page, key_type).map(Node::Inner),
            other => Err(StrataError::BTreeCorrupted(format!(
                "page {} has unknown node flag {}",
                page.page_num(),
                other
            ))),
        }
    }
}

/// Largest order d for which 2d entries of either node kind fit in a page.
///
/// Leaf entries are the wider of the two (a record id against a child page
/// number), so they bound the order.
pub fn max_order(key_type: &DataType) -> usize {
    let leaf_entry = key_type.size() + 8;
    (PAGE_SIZE - NODE_HEADER_SIZE) / leaf_entry / 2
}

fn read_header(page: &Page, expected_flag: u8, expected: &'static str) -> Result<(i32, usize)> {
    if page.read_u8(0) != expected_flag {
        return Err(StrataError::CorruptNodeType {
            page_num: page.page_num(),
            expected,
        });
    }
    let link = page.read_i32(1);
    let count = page.read_i32(5);
    usize::try_from(count)
        .map(|count| (link, count))
        .map_err(|_| {
            StrataError::BTreeCorrupted(format!(
                "page {} has negative entry count {}",
                page.page_num(),
                count
            ))
        })
}

fn check_fits(page_num: u32, count: usize, entry_size: usize) -> Result<()> {
    if NODE_HEADER_SIZE + count * entry_size > PAGE_SIZE {
        return Err(StrataError::BTreeCorrupted(format!(
            "node on page {} with {} entries overflows a page",
            page_num, count
        )));
    }
    Ok(())
}

fn page_num_from(value: i32, page_num: u32) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        StrataError::BTreeCorrupted(format!(
            "page {} holds invalid page pointer {}",
            page_num, value
        ))
    })
}

impl LeafNode {
    /// Creates an empty leaf.
    pub fn new(page_num: u32) -> Self {
        Self {
            page_num,
            next_leaf: None,
            entries: Vec::new(),
        }
    }

    /// Decodes a leaf, failing with `CorruptNodeType` if the page is not one.
    pub fn from_page(page: &Page, key_type: &DataType) -> Result<Self> {
        let (next, count) = read_header(page, LEAF_FLAG, "leaf")?;
        let entry_size = key_type.size() + 8;
        check_fits(page.page_num(), count, entry_size)?;

        let mut buf = page.read_bytes(NODE_HEADER_SIZE, count * entry_size);
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let key = get_value(&mut buf, key_type)?;
            let rid_page = page_num_from(buf.get_i32_le(), page.page_num())?;
            let slot = page_num_from(buf.get_i32_le(), page.page_num())?;
            entries.push(LeafEntry::new(key, RecordId::new(rid_page, slot)));
        }

        let next_leaf = if next == NO_PAGE {
            None
        } else {
            Some(page_num_from(next, page.page_num())?)
        };
        Ok(Self {
            page_num: page.page_num(),
            next_leaf,
            entries,
        })
    }

    /// Encodes the leaf into a page of file `file_id`.
    pub fn to_page(&self, file_id: u32, key_type: &DataType) -> Result<Page> {
        let entry_size = key_type.size() + 8;
        check_fits(self.page_num, self.entries.len(), entry_size)?;

        let mut buf = BytesMut::with_capacity(NODE_HEADER_SIZE + self.entries.len() * entry_size);
        buf.put_u8(LEAF_FLAG);
        buf.put_i32_le(self.next_leaf.map_or(NO_PAGE, |p| p as i32));
        buf.put_i32_le(self.entries.len() as i32);
        for entry in &self.entries {
            put_value(&mut buf, &entry.key, key_type)?;
            buf.put_i32_le(entry.rid.page_num as i32);
            buf.put_i32_le(entry.rid.slot as i32);
        }

        let mut page = Page::new(PageId::new(file_id, self.page_num));
        page.write_bytes(0, &buf);
        Ok(page)
    }

    /// Inserts an entry at its (key, rid) position.
    pub fn insert(&mut self, entry: LeafEntry) {
        let pos = self.entries.partition_point(|e| *e < entry);
        self.entries.insert(pos, entry);
    }

    /// Keeps the first half of the entries and returns the rest.
    pub fn split_off_right(&mut self) -> Vec<LeafEntry> {
        let mid = self.entries.len() / 2;
        self.entries.split_off(mid)
    }
}

impl InnerNode {
    /// Creates an inner node with a single child.
    pub fn new(page_num: u32, first_child: u32) -> Self {
        Self {
            page_num,
            first_child,
            entries: Vec::new(),
        }
    }

    /// Decodes an inner node, failing with `CorruptNodeType` if the page is not one.
    pub fn from_page(page: &Page, key_type: &DataType) -> Result<Self> {
        let (first, count) = read_header(page, INNER_FLAG, "inner")?;
        let entry_size = key_type.size() + 4;
        check_fits(page.page_num(), count, entry_size)?;

        let mut buf = page.read_bytes(NODE_HEADER_SIZE, count * entry_size);
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let key = get_value(&mut buf, key_type)?;
            let child = page_num_from(buf.get_i32_le(), page.page_num())?;
            entries.push(InnerEntry::new(key, child));
        }

        Ok(Self {
            page_num: page.page_num(),
            first_child: page_num_from(first, page.page_num())?,
            entries,
        })
    }

    /// Encodes the node into a page of file `file_id`.
    pub fn to_page(&self, file_id: u32, key_type: &DataType) -> Result<Page> {
        let entry_size = key_type.size() + 4;
        check_fits(self.page_num, self.entries.len(), entry_size)?;

        let mut buf = BytesMut::with_capacity(NODE_HEADER_SIZE + self.entries.len() * entry_size);
        buf.put_u8(INNER_FLAG);
        buf.put_i32_le(self.first_child as i32);
        buf.put_i32_le(self.entries.len() as i32);
        for entry in &self.entries {
            put_value(&mut buf, &entry.key, key_type)?;
            buf.put_i32_le(entry.child as i32);
        }

        let mut page = Page::new(PageId::new(file_id, self.page_num));
        page.write_bytes(0, &buf);
        Ok(page)
    }

    /// Returns the number of children.
    pub fn num_children(&self) -> usize {
        self.entries.len() + 1
    }

    /// Returns child number `index` (0 is the first child).
    pub fn child(&self, index: usize) -> u32 {
        if index == 0 {
            self.first_child
        } else {
            self.entries[index - 1].child
        }
    }

    /// Index of the child to descend into when inserting `key`: the child of
    /// the greatest separator `<= key`, or the first child. Equal keys go
    /// right.
    pub fn child_index_for_insert(&self, key: &DataBox) -> usize {
        self.entries.partition_point(|e| e.key <= *key)
    }

    /// Index of the leftmost child that can hold `key`: the child of the
    /// greatest separator `< key`, or the first child.
    pub fn child_index_for_search(&self, key: &DataBox) -> usize {
        self.entries.partition_point(|e| e.key < *key)
    }

    /// Returns the child page to follow for `key` on insertion.
    pub fn find_child_from_key(&self, key: &DataBox) -> u32 {
        self.child(self.child_index_for_insert(key))
    }

    /// Records that child `index` split, with `entry` pointing at the new
    /// right sibling.
    pub fn insert_after_child(&mut self, index: usize, entry: InnerEntry) {
        self.entries.insert(index, entry);
    }

    /// Splits around the middle entry, keeping the left half.
    ///
    /// Returns the middle entry (its key moves up, its child becomes the new
    /// sibling's first child) and the right half.
    pub fn split_off_right(&mut self) -> (InnerEntry, Vec<InnerEntry>) {
        let mid = self.entries.len() / 2;
        let mut right = self.entries.split_off(mid);
        let middle = right.remove(0);
        (middle, right)
    }
}

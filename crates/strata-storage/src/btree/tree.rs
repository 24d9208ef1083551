//! Page-based B+ tree over one page-store file.
//!
//! Page 0 is the tree header:
//! ```text
//! [i32 root page][i32 order][i32 key type ordinal][i32 string length]
//! ```
//! Every other page is a node. Nodes hold between d and 2d entries except
//! the root. The tree is insert-only; node pages are never freed.

use super::constants::TREE_HEADER_PAGE;
use super::node::{max_order, InnerEntry, InnerNode, LeafEntry, LeafNode, Node};
use super::scan::BTreeScan;
use crate::disk::PageStore;
use crate::record::RecordId;
use log::debug;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use strata_common::page::{Page, PageId};
use strata_common::{DataBox, DataType, Result, StrataError};

/// A B+ tree mapping keys of one type to record ids.
pub struct BPlusTree {
    /// File holding the header page and node pages.
    file_id: u32,
    /// Backing page store.
    store: Arc<dyn PageStore>,
    /// Type of every key in the tree.
    key_type: DataType,
    /// Order d: non-root nodes hold d..=2d entries.
    order: usize,
    /// Root page number.
    root_page_num: AtomicU32,
    /// Tree height (1 = root is a leaf).
    height: AtomicU32,
    /// Serializes inserts against lookups.
    latch: RwLock<()>,
}

impl BPlusTree {
    /// Creates an empty tree in an empty file.
    ///
    /// `order` overrides the largest order that fits a page; it must be
    /// between 1 and that maximum.
    pub fn create(
        store: Arc<dyn PageStore>,
        file_id: u32,
        key_type: DataType,
        order: Option<usize>,
    ) -> Result<Self> {
        let max = max_order(&key_type);
        let order = order.unwrap_or(max);
        if order == 0 || order > max {
            return Err(StrataError::ConfigError(format!(
                "B+ tree order {} is outside 1..={} for {} keys",
                order, max, key_type
            )));
        }
        if store.num_pages(file_id)? != 0 {
            return Err(StrataError::IndexAlreadyExists(format!("file {}", file_id)));
        }

        store.create_file(file_id)?;
        store.allocate_page(file_id)?;
        let root = store.allocate_page(file_id)?;
        let tree = Self {
            file_id,
            store,
            key_type,
            order,
            root_page_num: AtomicU32::new(root.page_num),
            height: AtomicU32::new(1),
            latch: RwLock::new(()),
        };
        tree.write_leaf(&LeafNode::new(root.page_num))?;
        tree.write_header()?;

        debug!(
            "created B+ tree in file {} with {} keys, order {}",
            file_id, key_type, order
        );
        Ok(tree)
    }

    /// Opens an existing tree from its header page.
    pub fn open(store: Arc<dyn PageStore>, file_id: u32) -> Result<Self> {
        if store.num_pages(file_id)? == 0 {
            return Err(StrataError::IndexNotFound(format!("file {}", file_id)));
        }
        let header = store.read_page(PageId::new(file_id, TREE_HEADER_PAGE))?;
        let corrupt = |what: &str| StrataError::BTreeCorrupted(format!("header page: {}", what));

        let root = u32::try_from(header.read_i32(0)).map_err(|_| corrupt("bad root page"))?;
        let order = usize::try_from(header.read_i32(4)).map_err(|_| corrupt("bad order"))?;
        let len = usize::try_from(header.read_i32(12)).map_err(|_| corrupt("bad key length"))?;
        let key_type = DataType::from_ordinal(header.read_i32(8), len)
            .ok_or_else(|| corrupt("unknown key type"))?;
        if order == 0 || order > max_order(&key_type) {
            return Err(corrupt("order does not fit a page"));
        }

        let tree = Self {
            file_id,
            store,
            key_type,
            order,
            root_page_num: AtomicU32::new(root),
            height: AtomicU32::new(1),
            latch: RwLock::new(()),
        };

        // Height is the length of the leftmost root-to-leaf path.
        let mut height = 1;
        let mut page_num = root;
        while let Node::Inner(inner) = tree.read_node(page_num)? {
            page_num = inner.first_child;
            height += 1;
        }
        tree.height.store(height, Ordering::Release);

        debug!("opened B+ tree in file {}: height {}", file_id, height);
        Ok(tree)
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    pub fn key_type(&self) -> DataType {
        self.key_type
    }

    /// Returns the order d.
    pub fn order(&self) -> usize {
        self.order
    }

    /// Returns the root page number.
    #[inline]
    pub fn root_page_num(&self) -> u32 {
        self.root_page_num.load(Ordering::Acquire)
    }

    /// Returns the tree height (1 = just a root leaf).
    #[inline]
    pub fn height(&self) -> u32 {
        self.height.load(Ordering::Acquire)
    }

    /// Returns the number of node pages.
    pub fn num_nodes(&self) -> Result<u32> {
        Ok(self.store.num_pages(self.file_id)? - 1)
    }

    // =========================================================================
    // Page I/O
    // =========================================================================

    fn write_header(&self) -> Result<()> {
        let mut page = Page::new(PageId::new(self.file_id, TREE_HEADER_PAGE));
        page.write_i32(0, self.root_page_num() as i32);
        page.write_i32(4, self.order as i32);
        page.write_i32(8, self.key_type.ordinal());
        let len = match self.key_type {
            DataType::String(len) => len as i32,
            _ => 0,
        };
        page.write_i32(12, len);
        self.store.write_page(&page)
    }

    fn read_page(&self, page_num: u32) -> Result<Page> {
        self.store.read_page(PageId::new(self.file_id, page_num))
    }

    pub(crate) fn read_node(&self, page_num: u32) -> Result<Node> {
        Node::from_page(&self.read_page(page_num)?, &self.key_type)
    }

    pub(crate) fn read_leaf(&self, page_num: u32) -> Result<LeafNode> {
        LeafNode::from_page(&self.read_page(page_num)?, &self.key_type)
    }

    fn write_leaf(&self, leaf: &LeafNode) -> Result<()> {
        self.store
            .write_page(&leaf.to_page(self.file_id, &self.key_type)?)
    }

    fn write_inner(&self, inner: &InnerNode) -> Result<()> {
        self.store
            .write_page(&inner.to_page(self.file_id, &self.key_type)?)
    }

    fn allocate_node(&self) -> Result<u32> {
        Ok(self.store.allocate_page(self.file_id)?.page_num)
    }

    /// Rejects keys whose type cannot be compared with the tree's keys.
    fn check_key(&self, key: &DataBox) -> Result<()> {
        if !key.data_type().is_comparable_with(&self.key_type) {
            return Err(StrataError::TypeMismatch {
                expected: self.key_type.to_string(),
                actual: key.data_type().to_string(),
            });
        }
        Ok(())
    }

    /// Checks a key for insertion and fits strings to the key width.
    fn normalize_key(&self, key: &DataBox) -> Result<DataBox> {
        self.check_key(key)?;
        Ok(match (key, self.key_type) {
            (DataBox::String { value, .. }, DataType::String(len)) => {
                DataBox::string(value.as_str(), len)
            }
            _ => key.clone(),
        })
    }

    // =========================================================================
    // Insert
    // =========================================================================

    /// Inserts `key -> rid`, splitting nodes on the way back up as needed.
    pub fn insert(&self, key: DataBox, rid: RecordId) -> Result<()> {
        let key = self.normalize_key(&key)?;
        let _guard = self.latch.write();

        // Descend, remembering each inner node and the child index taken.
        let mut path: Vec<(InnerNode, usize)> = Vec::with_capacity(self.height() as usize);
        let mut page_num = self.root_page_num();
        let mut leaf = loop {
            match self.read_node(page_num)? {
                Node::Inner(inner) => {
                    let index = inner.child_index_for_insert(&key);
                    page_num = inner.child(index);
                    path.push((inner, index));
                }
                Node::Leaf(leaf) => break leaf,
            }
        };

        leaf.insert(LeafEntry::new(key, rid));
        if leaf.entries.len() <= 2 * self.order {
            return self.write_leaf(&leaf);
        }

        // Leaf split: the right half moves to a new sibling and its first key
        // is copied up.
        let right_page = self.allocate_node()?;
        let right = LeafNode {
            page_num: right_page,
            next_leaf: leaf.next_leaf,
            entries: leaf.split_off_right(),
        };
        leaf.next_leaf = Some(right_page);
        self.write_leaf(&leaf)?;
        self.write_leaf(&right)?;
        let mut pushed = InnerEntry::new(right.entries[0].key.clone(), right_page);

        while let Some((mut inner, index)) = path.pop() {
            inner.insert_after_child(index, pushed);
            if inner.entries.len() <= 2 * self.order {
                return self.write_inner(&inner);
            }

            // Inner split: the middle key moves up and its child becomes the
            // new sibling's first child.
            let (middle, right_entries) = inner.split_off_right();
            let sibling_page = self.allocate_node()?;
            let sibling = InnerNode {
                page_num: sibling_page,
                first_child: middle.child,
                entries: right_entries,
            };
            self.write_inner(&inner)?;
            self.write_inner(&sibling)?;
            pushed = InnerEntry::new(middle.key, sibling_page);
        }

        // The root split.
        let old_root = self.root_page_num();
        let new_root_page = self.allocate_node()?;
        let mut new_root = InnerNode::new(new_root_page, old_root);
        new_root.entries.push(pushed);
        self.write_inner(&new_root)?;

        self.root_page_num.store(new_root_page, Ordering::Release);
        let height = self.height.fetch_add(1, Ordering::AcqRel) + 1;
        self.write_header()?;

        debug!(
            "B+ tree in file {} split its root: new root page {}, height {}",
            self.file_id, new_root_page, height
        );
        Ok(())
    }

    // =========================================================================
    // Lookup and scans
    // =========================================================================

    /// Returns the leftmost leaf that can hold `key`.
    fn find_leaf_for_search(&self, key: &DataBox) -> Result<LeafNode> {
        let mut page_num = self.root_page_num();
        loop {
            match self.read_node(page_num)? {
                Node::Inner(inner) => page_num = inner.child(inner.child_index_for_search(key)),
                Node::Leaf(leaf) => return Ok(leaf),
            }
        }
    }

    /// Returns the leftmost leaf of the tree.
    pub(crate) fn leftmost_leaf(&self) -> Result<LeafNode> {
        let mut page_num = self.root_page_num();
        loop {
            match self.read_node(page_num)? {
                Node::Inner(inner) => page_num = inner.first_child,
                Node::Leaf(leaf) => return Ok(leaf),
            }
        }
    }

    /// Returns every record id stored under `key`, in leaf order.
    ///
    /// Duplicates may span several leaves; the sibling chain is followed
    /// until a larger key appears.
    pub fn lookup_key(&self, key: &DataBox) -> Result<Vec<RecordId>> {
        self.check_key(key)?;
        let _guard = self.latch.read();

        let mut rids = Vec::new();
        let mut leaf = self.find_leaf_for_search(key)?;
        loop {
            for entry in &leaf.entries {
                if entry.key == *key {
                    rids.push(entry.rid);
                } else if entry.key > *key {
                    return Ok(rids);
                }
            }
            match leaf.next_leaf {
                Some(next) => leaf = self.read_leaf(next)?,
                None => return Ok(rids),
            }
        }
    }

    /// Returns true if at least one entry has `key`.
    pub fn contains_key(&self, key: &DataBox) -> Result<bool> {
        Ok(!self.lookup_key(key)?.is_empty())
    }

    /// Scans all entries in key order.
    pub fn sorted_scan(&self) -> Result<BTreeScan<'_>> {
        let _guard = self.latch.read();
        Ok(BTreeScan::new(self, self.leftmost_leaf()?, None))
    }

    /// Scans entries with keys `>= key` in key order.
    pub fn sorted_scan_from(&self, key: &DataBox) -> Result<BTreeScan<'_>> {
        self.check_key(key)?;
        let _guard = self.latch.read();
        let leaf = self.find_leaf_for_search(key)?;
        Ok(BTreeScan::new(self, leaf, Some(key.clone())))
    }

    // =========================================================================
    // Structure checks
    // =========================================================================

    /// Walks the whole tree and checks ordering, separator bounds, fill
    /// factors, and that all leaves sit at the same depth.
    pub fn check_invariants(&self) -> Result<()> {
        let _guard = self.latch.read();
        let depth = self.check_node(self.root_page_num(), None, None, true)?;
        if depth != self.height() {
            return Err(StrataError::BTreeCorrupted(format!(
                "leaves at depth {} but height is {}",
                depth,
                self.height()
            )));
        }
        Ok(())
    }

    fn check_node(
        &self,
        page_num: u32,
        lower: Option<&DataBox>,
        upper: Option<&DataBox>,
        is_root: bool,
    ) -> Result<u32> {
        let corrupt = |what: String| Err(StrataError::BTreeCorrupted(format!("page {}: {}", page_num, what)));
        let in_bounds = |key: &DataBox| {
            lower.map_or(true, |l| key >= l) && upper.map_or(true, |u| key <= u)
        };

        match self.read_node(page_num)? {
            Node::Leaf(leaf) => {
                let n = leaf.entries.len();
                if n > 2 * self.order || (!is_root && n < self.order) {
                    return corrupt(format!("leaf holds {} entries", n));
                }
                if leaf.entries.windows(2).any(|w| w[0] > w[1]) {
                    return corrupt("leaf entries out of order".to_string());
                }
                if !leaf.entries.iter().all(|e| in_bounds(&e.key)) {
                    return corrupt("leaf key outside parent separators".to_string());
                }
                Ok(1)
            }
            Node::Inner(inner) => {
                let children = inner.num_children();
                if children > 2 * self.order + 1
                    || (!is_root && children < self.order + 1)
                    || (is_root && children < 2)
                {
                    return corrupt(format!("inner node has {} children", children));
                }
                if inner.entries.windows(2).any(|w| w[0].key > w[1].key) {
                    return corrupt("separators out of order".to_string());
                }
                if !inner.entries.iter().all(|e| in_bounds(&e.key)) {
                    return corrupt("separator outside parent separators".to_string());
                }

                let mut depth = None;
                for index in 0..children {
                    let child_lower = if index == 0 {
                        lower
                    } else {
                        Some(&inner.entries[index - 1].key)
                    };
                    let child_upper = inner.entries.get(index).map(|e| &e.key).or(upper);
                    let child_depth =
                        self.check_node(inner.child(index), child_lower, child_upper, false)?;
                    match depth {
                        None => depth = Some(child_depth),
                        Some(d) if d != child_depth => {
                            return corrupt("children at different depths".to_string())
                        }
                        _ => {}
                    }
                }
                Ok(depth.unwrap_or(0) + 1)
            }
        }
    }
}

impl std::fmt::Debug for BPlusTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BPlusTree")
            .field("file_id", &self.file_id)
            .field("key_type", &self.key_type)
            .field("order", &self.order)
            .field("root_page_num", &self.root_page_num())
            .field("height", &self.height())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryPageStore;

    fn new_tree(order: usize) -> BPlusTree {
        let store = Arc::new(MemoryPageStore::new());
        BPlusTree::create(store, 1, DataType::Int, Some(order)).unwrap()
    }

    fn rid(n: i32) -> RecordId {
        RecordId::new(1 + (n as u32) / 100, (n as u32) % 100)
    }

    fn scanned_keys(tree: &BPlusTree) -> Vec<i32> {
        tree.sorted_scan()
            .unwrap()
            .map(|item| item.unwrap().0.as_int().unwrap())
            .collect()
    }

    #[test]
    fn test_create_rejects_bad_order() {
        let store: Arc<dyn PageStore> = Arc::new(MemoryPageStore::new());
        assert!(matches!(
            BPlusTree::create(store.clone(), 1, DataType::Int, Some(0)),
            Err(StrataError::ConfigError(_))
        ));
        assert!(BPlusTree::create(store.clone(), 1, DataType::Int, Some(171)).is_err());
        let tree = BPlusTree::create(store, 1, DataType::Int, None).unwrap();
        assert_eq!(tree.order(), 170);
    }

    #[test]
    fn test_empty_tree() {
        let tree = new_tree(2);
        assert_eq!(tree.height(), 1);
        assert_eq!(tree.num_nodes().unwrap(), 1);
        assert!(tree.lookup_key(&DataBox::Int(1)).unwrap().is_empty());
        assert_eq!(tree.sorted_scan().unwrap().count(), 0);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_insert_without_split() {
        let tree = new_tree(2);
        for k in [3, 1, 4, 2] {
            tree.insert(DataBox::Int(k), rid(k)).unwrap();
        }
        assert_eq!(tree.height(), 1);
        assert_eq!(scanned_keys(&tree), vec![1, 2, 3, 4]);
        assert_eq!(tree.lookup_key(&DataBox::Int(3)).unwrap(), vec![rid(3)]);
    }

    #[test]
    fn test_first_leaf_split() {
        let tree = new_tree(2);
        for k in 1..=5 {
            tree.insert(DataBox::Int(k), rid(k)).unwrap();
        }
        assert_eq!(tree.height(), 2);
        assert_eq!(tree.num_nodes().unwrap(), 3);

        let root = match tree.read_node(tree.root_page_num()).unwrap() {
            Node::Inner(inner) => inner,
            Node::Leaf(_) => panic!("root should be inner after a split"),
        };
        assert_eq!(root.entries.len(), 1);
        assert_eq!(root.entries[0].key, DataBox::Int(3));

        let left = tree.read_leaf(root.first_child).unwrap();
        assert_eq!(left.entries.len(), 2);
        assert_eq!(left.next_leaf, Some(root.entries[0].child));
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_many_inserts_keep_invariants() {
        let tree = new_tree(2);
        // A fixed permutation of 0..500
        let keys: Vec<i32> = (0..500).map(|i| (i * 37) % 500).collect();
        for k in &keys {
            tree.insert(DataBox::Int(*k), rid(*k)).unwrap();
        }
        tree.check_invariants().unwrap();
        assert!(tree.height() >= 4);
        assert_eq!(scanned_keys(&tree), (0..500).collect::<Vec<_>>());
        for k in [0, 1, 250, 499] {
            assert_eq!(tree.lookup_key(&DataBox::Int(k)).unwrap(), vec![rid(k)]);
        }
        assert!(!tree.contains_key(&DataBox::Int(500)).unwrap());
    }

    #[test]
    fn test_duplicates_spanning_leaves() {
        let tree = new_tree(1);
        for i in 0..10 {
            tree.insert(DataBox::Int(7), RecordId::new(1, i)).unwrap();
        }
        tree.insert(DataBox::Int(3), RecordId::new(2, 0)).unwrap();
        tree.insert(DataBox::Int(9), RecordId::new(2, 1)).unwrap();
        tree.check_invariants().unwrap();

        let mut found = tree.lookup_key(&DataBox::Int(7)).unwrap();
        found.sort();
        assert_eq!(found, (0..10).map(|i| RecordId::new(1, i)).collect::<Vec<_>>());
        assert_eq!(tree.lookup_key(&DataBox::Int(9)).unwrap(), vec![RecordId::new(2, 1)]);
    }

    #[test]
    fn test_sorted_scan_from() {
        let tree = new_tree(2);
        for k in (0..100).step_by(2) {
            tree.insert(DataBox::Int(k), rid(k)).unwrap();
        }
        let from: Vec<i32> = tree
            .sorted_scan_from(&DataBox::Int(41))
            .unwrap()
            .map(|item| item.unwrap().0.as_int().unwrap())
            .collect();
        assert_eq!(from, (42..100).step_by(2).collect::<Vec<_>>());

        let all_from: Vec<i32> = tree
            .sorted_scan_from(&DataBox::Int(-5))
            .unwrap()
            .map(|item| item.unwrap().0.as_int().unwrap())
            .collect();
        assert_eq!(all_from.len(), 50);
        assert_eq!(tree.sorted_scan_from(&DataBox::Int(1000)).unwrap().count(), 0);
    }

    #[test]
    fn test_key_type_checked() {
        let tree = new_tree(2);
        assert!(matches!(
            tree.insert(DataBox::Bool(true), rid(1)),
            Err(StrataError::TypeMismatch { .. })
        ));
        assert!(tree.lookup_key(&DataBox::Float(1.0)).is_err());
    }

    #[test]
    fn test_string_keys() {
        let store = Arc::new(MemoryPageStore::new());
        let tree = BPlusTree::create(store, 1, DataType::String(4), Some(2)).unwrap();
        for (i, name) in ["dave", "anna", "carl", "bob", "eve", "fay"].iter().enumerate() {
            tree.insert(DataBox::string(*name, 4), RecordId::new(1, i as u32))
                .unwrap();
        }
        tree.check_invariants().unwrap();
        assert_eq!(
            tree.lookup_key(&DataBox::string("bob", 10)).unwrap(),
            vec![RecordId::new(1, 3)]
        );
        let names: Vec<String> = tree
            .sorted_scan()
            .unwrap()
            .map(|item| item.unwrap().0.as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["anna", "bob", "carl", "dave", "eve", "fay"]);
    }

    #[test]
    fn test_reopen() {
        let store: Arc<dyn PageStore> = Arc::new(MemoryPageStore::new());
        {
            let tree = BPlusTree::create(store.clone(), 5, DataType::Int, Some(3)).unwrap();
            for k in 0..200 {
                tree.insert(DataBox::Int(k), rid(k)).unwrap();
            }
        }
        let tree = BPlusTree::open(store, 5).unwrap();
        assert_eq!(tree.order(), 3);
        assert_eq!(tree.key_type(), DataType::Int);
        assert!(tree.height() > 1);
        tree.check_invariants().unwrap();
        assert_eq!(tree.lookup_key(&DataBox::Int(123)).unwrap(), vec![rid(123)]);
        tree.insert(DataBox::Int(200), rid(200)).unwrap();
        assert_eq!(scanned_keys(&tree).len(), 201);
    }

    #[test]
    fn test_open_missing() {
        let store = Arc::new(MemoryPageStore::new());
        assert!(matches!(
            BPlusTree::open(store, 3),
            Err(StrataError::IndexNotFound(_))
        ));
    }
}

//! B+ tree page layout constants.

/// Page number of the tree header page.
pub const TREE_HEADER_PAGE: u32 = 0;

/// Node flag byte of an inner page.
pub const INNER_FLAG: u8 = 0;

/// Node flag byte of a leaf page.
pub const LEAF_FLAG: u8 = 1;

/// Flag byte, link pointer (next leaf or first child), and entry count.
pub const NODE_HEADER_SIZE: usize = 1 + 4 + 4;

/// Encoded "no page" value of a leaf's next pointer.
pub const NO_PAGE: i32 = -1;

//! B+ tree secondary index.
//!
//! Maps fixed-width keys to record ids. The tree lives in its own page-store
//! file: page 0 is a header naming the root, every other page is one node.
//!
//! ```text
//!                 [inner: first | k1 c1 | k2 c2]
//!                 /            |              \
//!          [leaf] -------> [leaf] -------> [leaf] -> none
//! ```
//!
//! Inserts descend right-biased (a key equal to a separator goes right) and
//! split full nodes on the way back up: leaves copy their right half's first
//! key into the parent, inner nodes push their middle key up. Lookups descend
//! to the leftmost leaf that can hold the key and walk the sibling chain so
//! duplicates spread over several leaves are all found.

pub mod constants;
mod node;
mod scan;
mod tree;

pub use node::{max_order, InnerEntry, InnerNode, LeafEntry, LeafNode, Node};
pub use scan::BTreeScan;
pub use tree::BPlusTree;

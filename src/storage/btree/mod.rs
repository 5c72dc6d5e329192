#![forbid(unsafe_code)]

//! Disk-resident B-tree mapping node ids to payload locations.

/// Fixed-size page format shared by leaf and internal pages.
pub mod page;
mod tree;

pub use page::{LeafRecord, Page, PageKind, PAGE_SIZE};
pub use tree::{NodeBTree, TreeWalk};

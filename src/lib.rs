//! Node directory and property codec for personal mail archive containers.
//!
//! [`storage::NodeDirectory`] maps node ids to payload ranges through an
//! on-disk B-tree and keeps folder, message and attachment tables in step
//! with it. [`storage::PropertyContext`] decodes a node's property block,
//! recovering what it can from damaged payloads.

#![warn(missing_docs)]

pub mod logging;
pub mod primitives;
pub mod storage;
pub mod types;

pub use storage::{NodeDirectory, NodeEntry, PropertyContext};
pub use types::{PstError, Result};

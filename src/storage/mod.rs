//! Node storage engine.
//!
//! A B-tree keyed by node id maps every node to its payload range in the
//! container file. The directory layers caching, parent/child tables and a
//! bump allocator on top; the property codec reads and writes the typed
//! property blocks stored in those payloads.

/// On-disk B-tree of node records.
///
/// Fixed-size checksummed pages with split, borrow and merge maintenance.
pub mod btree;

/// Typed property access bound to one node.
pub mod codec;

/// Node directory: lookup, mutation and companion tables.
pub mod directory;

/// Bump allocator over the container's free space.
pub mod heap;

/// Counters for directory and codec activity.
pub mod metrics;

/// Directory entry type.
pub mod node;

/// Open options and their TOML form.
pub mod options;

/// Property tags, values and the block wire format.
pub mod props;

/// Optional JSON-lines cache of entry summaries.
pub mod side_index;

pub use codec::PropertyContext;
pub use directory::{NodeDirectory, ROOT_FOLDER_NAME};
pub use heap::{HeapAllocator, HeapStats};
pub use metrics::{default_metrics, CounterMetrics, DirectoryMetrics, NoopMetrics};
pub use node::NodeEntry;
pub use options::{DirectoryConfig, DirectoryOptions, FormatKind, HeapOptions};
pub use props::{PropertySet, PropertyTag, PropertyType, PropertyValue};

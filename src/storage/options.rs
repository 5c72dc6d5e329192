use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::primitives::bytes::StringEncoding;
use crate::types::{PstError, Result};

use super::btree::PAGE_SIZE;
use super::metrics::DirectoryMetrics;

/// Offset of the root B-tree page in a container created from scratch.
pub const DEFAULT_ROOT_PAGE_OFFSET: u64 = 512;
/// First heap offset, directly after the default root page.
pub const DEFAULT_HEAP_START: u64 = 1024;
/// Allocation block size.
pub const DEFAULT_BLOCK_SIZE: u64 = 512;
/// File growth granularity.
pub const DEFAULT_GROWTH_INCREMENT: u64 = 64 * 1024;
/// Decoded B-tree pages kept in memory.
pub const DEFAULT_PAGE_CACHE_CAPACITY: usize = 256;
/// Cache size above which `get_all` assumes the tree was already walked.
pub const DEFAULT_FULLY_LOADED_THRESHOLD: usize = 10_000;

/// Header shape of the container.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatKind {
    /// Narrow (windows-1252) strings, direct property count header.
    Ansi,
    /// Wide (UTF-16LE) strings, magic + count property header.
    #[default]
    Unicode,
}

impl FormatKind {
    /// Node id of the root folder.
    pub fn root_folder_id(self) -> u32 {
        match self {
            FormatKind::Unicode => 0x42,
            FormatKind::Ansi => 0x41,
        }
    }

    /// Encoding used for string properties written by this format.
    pub fn string_encoding(self) -> StringEncoding {
        match self {
            FormatKind::Unicode => StringEncoding::Utf16Le,
            FormatKind::Ansi => StringEncoding::Ansi,
        }
    }
}

/// Heap allocator tuning.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapOptions {
    /// Allocation alignment in bytes.
    pub block_size: u64,
    /// The file is extended to a multiple of this size.
    pub growth_increment: u64,
    /// Lowest offset the heap hands out; also the zero-length offset.
    pub heap_start: u64,
}

impl Default for HeapOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            growth_increment: DEFAULT_GROWTH_INCREMENT,
            heap_start: DEFAULT_HEAP_START,
        }
    }
}

/// Configuration supplied when opening a [`super::NodeDirectory`].
#[derive(Clone)]
pub struct DirectoryOptions {
    /// Container header shape.
    pub format: FormatKind,
    /// Location of the root B-tree page, as recorded by the container header.
    pub root_page_offset: u64,
    /// Optional JSON-lines side index for faster reopen.
    pub side_index: Option<PathBuf>,
    /// Decoded pages kept in the LRU page cache.
    pub page_cache_capacity: usize,
    /// Cache size above which `get_all` skips the full traversal.
    pub fully_loaded_threshold: usize,
    /// Heap allocator tuning.
    pub heap: HeapOptions,
    /// Optional metrics collection implementation.
    pub metrics: Option<Arc<dyn DirectoryMetrics>>,
}

impl Default for DirectoryOptions {
    fn default() -> Self {
        Self {
            format: FormatKind::default(),
            root_page_offset: DEFAULT_ROOT_PAGE_OFFSET,
            side_index: None,
            page_cache_capacity: DEFAULT_PAGE_CACHE_CAPACITY,
            fully_loaded_threshold: DEFAULT_FULLY_LOADED_THRESHOLD,
            heap: HeapOptions::default(),
            metrics: None,
        }
    }
}

impl fmt::Debug for DirectoryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryOptions")
            .field("format", &self.format)
            .field("root_page_offset", &self.root_page_offset)
            .field("side_index", &self.side_index)
            .field("page_cache_capacity", &self.page_cache_capacity)
            .field("fully_loaded_threshold", &self.fully_loaded_threshold)
            .field("heap", &self.heap)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

impl DirectoryOptions {
    /// Options for a container of the given format with default tuning.
    pub fn new(format: FormatKind) -> Self {
        Self {
            format,
            ..Self::default()
        }
    }

    /// Sets the root page offset.
    pub fn root_page_offset(mut self, offset: u64) -> Self {
        self.root_page_offset = offset;
        self
    }

    /// Enables the side index at `path`.
    pub fn side_index(mut self, path: impl Into<PathBuf>) -> Self {
        self.side_index = Some(path.into());
        self
    }

    /// Sets the page cache capacity.
    pub fn page_cache_capacity(mut self, pages: usize) -> Self {
        self.page_cache_capacity = pages;
        self
    }

    /// Sets the fully-loaded threshold used by `get_all`.
    pub fn fully_loaded_threshold(mut self, entries: usize) -> Self {
        self.fully_loaded_threshold = entries;
        self
    }

    /// Replaces the heap tuning.
    pub fn heap(mut self, heap: HeapOptions) -> Self {
        self.heap = heap;
        self
    }

    /// Sets the metrics collection implementation.
    pub fn metrics(mut self, metrics: Arc<dyn DirectoryMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Builds options from a deserialized configuration.
    pub fn from_config(cfg: DirectoryConfig) -> Self {
        Self {
            format: cfg.format,
            root_page_offset: cfg.root_page_offset,
            side_index: cfg.side_index,
            page_cache_capacity: cfg.page_cache_capacity,
            fully_loaded_threshold: cfg.fully_loaded_threshold,
            heap: cfg.heap,
            metrics: None,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.heap.block_size == 0 || self.heap.growth_increment == 0 {
            return Err(PstError::Invalid("heap block and growth sizes must be non-zero"));
        }
        if self.root_page_offset.checked_add(PAGE_SIZE as u64).is_none() {
            return Err(PstError::Invalid("root page offset out of range"));
        }
        if self.page_cache_capacity == 0 {
            return Err(PstError::Invalid("page cache capacity must be non-zero"));
        }
        Ok(())
    }
}

/// Serializable form of [`DirectoryOptions`], loadable from TOML.
///
/// ```toml
/// format = "ansi"
/// root_page_offset = 17408
/// side_index = "archive.idx"
///
/// [heap]
/// growth_increment = 262144
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Container header shape.
    pub format: FormatKind,
    /// Root page location.
    pub root_page_offset: u64,
    /// Side index path.
    pub side_index: Option<PathBuf>,
    /// Page cache capacity.
    pub page_cache_capacity: usize,
    /// Fully-loaded threshold.
    pub fully_loaded_threshold: usize,
    /// Heap tuning.
    pub heap: HeapOptions,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            format: FormatKind::default(),
            root_page_offset: DEFAULT_ROOT_PAGE_OFFSET,
            side_index: None,
            page_cache_capacity: DEFAULT_PAGE_CACHE_CAPACITY,
            fully_loaded_threshold: DEFAULT_FULLY_LOADED_THRESHOLD,
            heap: HeapOptions::default(),
        }
    }
}

impl DirectoryConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|err| PstError::Config(err.to_string()))
    }

    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|err| PstError::Config(format!("read {}: {err}", path.display())))?;
        Self::from_toml_str(&text)
    }
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Trait for tracking node directory activity.
///
/// Implementations collect statistics about node mutations, heap usage,
/// page cache behaviour and degraded reads. This information can be used
/// for monitoring how often damaged containers are served from fallbacks.
pub trait DirectoryMetrics: Send + Sync {
    /// Records a node added to the directory.
    fn node_added(&self);

    /// Records a node removed from the directory, cascades included.
    fn node_removed(&self);

    /// Records a heap allocation of `bytes` bytes.
    fn allocation(&self, bytes: u32);

    /// Records a page cache lookup.
    ///
    /// # Parameters
    /// * `hit` - Whether the page was served from cache.
    fn page_cache(&self, hit: bool);

    /// Records a B-tree page split.
    fn page_split(&self);

    /// Records a B-tree merge or root collapse.
    fn page_merge(&self);

    /// Records a read served from a fallback.
    ///
    /// # Parameters
    /// * `kind` - "synthesized" for substituted system folders, "recovered"
    ///   for property blocks parsed by the recovery scanner, "defaults" for
    ///   property blocks replaced by type defaults.
    fn degraded_read(&self, kind: &'static str);
}

/// A no-op implementation of [`DirectoryMetrics`] that discards everything.
#[derive(Default)]
pub struct NoopMetrics;

impl DirectoryMetrics for NoopMetrics {
    fn node_added(&self) {}
    fn node_removed(&self) {}
    fn allocation(&self, _bytes: u32) {}
    fn page_cache(&self, _hit: bool) {}
    fn page_split(&self) {}
    fn page_merge(&self) {}
    fn degraded_read(&self, _kind: &'static str) {}
}

/// A thread-safe counter-based implementation of [`DirectoryMetrics`].
#[derive(Default)]
pub struct CounterMetrics {
    /// Nodes added.
    pub nodes_added: AtomicU64,
    /// Nodes removed.
    pub nodes_removed: AtomicU64,
    /// Heap allocations performed.
    pub allocations: AtomicU64,
    /// Bytes handed out by the heap.
    pub bytes_allocated: AtomicU64,
    /// Page cache hits.
    pub page_cache_hits: AtomicU64,
    /// Page cache misses.
    pub page_cache_misses: AtomicU64,
    /// Page splits.
    pub page_splits: AtomicU64,
    /// Page merges and root collapses.
    pub page_merges: AtomicU64,
    /// System folders synthesised in place of unreadable records.
    pub synthesized_reads: AtomicU64,
    /// Property blocks read through the recovery scanner.
    pub recovered_reads: AtomicU64,
    /// Property blocks replaced by defaults.
    pub default_reads: AtomicU64,
}

impl CounterMetrics {
    /// Convenience accessor for a counter value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

impl DirectoryMetrics for CounterMetrics {
    fn node_added(&self) {
        self.nodes_added.fetch_add(1, Ordering::Relaxed);
    }

    fn node_removed(&self) {
        self.nodes_removed.fetch_add(1, Ordering::Relaxed);
    }

    fn allocation(&self, bytes: u32) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn page_cache(&self, hit: bool) {
        if hit {
            self.page_cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.page_cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn page_split(&self) {
        self.page_splits.fetch_add(1, Ordering::Relaxed);
    }

    fn page_merge(&self) {
        self.page_merges.fetch_add(1, Ordering::Relaxed);
    }

    fn degraded_read(&self, kind: &'static str) {
        match kind {
            "synthesized" => {
                self.synthesized_reads.fetch_add(1, Ordering::Relaxed);
            }
            "recovered" => {
                self.recovered_reads.fetch_add(1, Ordering::Relaxed);
            }
            "defaults" => {
                self.default_reads.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

/// Returns the default metrics implementation, a [`NoopMetrics`].
pub fn default_metrics() -> Arc<dyn DirectoryMetrics> {
    Arc::new(NoopMetrics)
}

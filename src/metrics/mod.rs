use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Prometheus metrics for the phrase index
#[derive(Clone)]
pub struct IndexMetrics {
    // Counters
    pub batches_committed: Counter,
    pub batch_errors: Counter,
    pub sentences_appended: Counter,
    pub posting_fragments_merged: Counter,
    pub domains_deleted: Counter,
    pub count_queries: CounterVec,
    pub gc_keys_swept: Counter,

    // Gauges
    pub index_size_bytes: Gauge,
    pub storage_size_bytes: Gauge,

    // Histograms
    pub commit_latency: Histogram,
    pub batch_size: Histogram,

    // Registry
    registry: Arc<Registry>,
}

impl IndexMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Counters
        let batches_committed = Counter::with_opts(Opts::new(
            "sapt_batches_committed_total",
            "Total number of update batches committed",
        ))?;
        registry.register(Box::new(batches_committed.clone()))?;

        let batch_errors = Counter::with_opts(Opts::new(
            "sapt_batch_errors_total",
            "Total number of update batches that failed to commit",
        ))?;
        registry.register(Box::new(batch_errors.clone()))?;

        let sentences_appended = Counter::with_opts(Opts::new(
            "sapt_sentences_appended_total",
            "Total number of sentence pairs appended to corpus storage",
        ))?;
        registry.register(Box::new(sentences_appended.clone()))?;

        let posting_fragments_merged = Counter::with_opts(Opts::new(
            "sapt_posting_fragments_merged_total",
            "Total number of posting list fragments merged into the index",
        ))?;
        registry.register(Box::new(posting_fragments_merged.clone()))?;

        let domains_deleted = Counter::with_opts(Opts::new(
            "sapt_domains_deleted_total",
            "Total number of domains marked for deletion",
        ))?;
        registry.register(Box::new(domains_deleted.clone()))?;

        let count_queries = CounterVec::new(
            Opts::new("sapt_count_queries_total", "Total number of count queries by side"),
            &["side"],
        )?;
        registry.register(Box::new(count_queries.clone()))?;

        let gc_keys_swept = Counter::with_opts(Opts::new(
            "sapt_gc_keys_swept_total",
            "Total number of index keys removed by garbage collection",
        ))?;
        registry.register(Box::new(gc_keys_swept.clone()))?;

        // Gauges
        let index_size_bytes = Gauge::with_opts(Opts::new(
            "sapt_index_size_bytes",
            "On-disk size of the index keyspace",
        ))?;
        registry.register(Box::new(index_size_bytes.clone()))?;

        let storage_size_bytes = Gauge::with_opts(Opts::new(
            "sapt_storage_size_bytes",
            "Bytes appended to corpus storage",
        ))?;
        registry.register(Box::new(storage_size_bytes.clone()))?;

        // Histograms
        let commit_latency = Histogram::with_opts(
            HistogramOpts::new("sapt_commit_latency_seconds", "Update batch commit latency")
                .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(commit_latency.clone()))?;

        let batch_size = Histogram::with_opts(
            HistogramOpts::new("sapt_batch_size", "Number of sentence pairs per update batch")
                .buckets(vec![1.0, 10.0, 100.0, 1000.0, 10000.0, 100000.0]),
        )?;
        registry.register(Box::new(batch_size.clone()))?;

        Ok(Self {
            batches_committed,
            batch_errors,
            sentences_appended,
            posting_fragments_merged,
            domains_deleted,
            count_queries,
            gc_keys_swept,
            index_size_bytes,
            storage_size_bytes,
            commit_latency,
            batch_size,
            registry: Arc::new(registry),
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Record a committed update batch
    pub fn record_batch(&self, sentences: usize, fragments: usize, deletions: usize, duration_secs: f64) {
        self.batches_committed.inc();
        self.sentences_appended.inc_by(sentences as f64);
        self.posting_fragments_merged.inc_by(fragments as f64);
        self.domains_deleted.inc_by(deletions as f64);
        self.batch_size.observe(sentences as f64);
        self.commit_latency.observe(duration_secs);
    }

    pub fn record_batch_error(&self) {
        self.batch_errors.inc();
    }

    /// Record a count query on the given side
    pub fn record_count(&self, is_source: bool) {
        let side = if is_source { "source" } else { "target" };
        self.count_queries.with_label_values(&[side]).inc();
    }

    pub fn record_gc_sweep(&self, keys_removed: usize) {
        self.gc_keys_swept.inc_by(keys_removed as f64);
    }

    pub fn set_sizes(&self, index_bytes: u64, storage_bytes: u64) {
        self.index_size_bytes.set(index_bytes as f64);
        self.storage_size_bytes.set(storage_bytes as f64);
    }

    /// Render every metric in the Prometheus text exposition format
    pub fn gather_text(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for IndexMetrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_batch() {
        let metrics = IndexMetrics::new().unwrap();
        metrics.record_batch(3, 12, 1, 0.002);
        metrics.record_batch(2, 8, 0, 0.001);

        assert_eq!(metrics.batches_committed.get(), 2.0);
        assert_eq!(metrics.sentences_appended.get(), 5.0);
        assert_eq!(metrics.posting_fragments_merged.get(), 20.0);
        assert_eq!(metrics.domains_deleted.get(), 1.0);
        assert_eq!(metrics.commit_latency.get_sample_count(), 2);
    }

    #[test]
    fn test_count_queries_by_side() {
        let metrics = IndexMetrics::new().unwrap();
        metrics.record_count(true);
        metrics.record_count(true);
        metrics.record_count(false);

        assert_eq!(metrics.count_queries.with_label_values(&["source"]).get(), 2.0);
        assert_eq!(metrics.count_queries.with_label_values(&["target"]).get(), 1.0);
    }

    #[test]
    fn test_gather_text() {
        let metrics = IndexMetrics::new().unwrap();
        metrics.record_gc_sweep(7);
        metrics.set_sizes(1024, 2048);

        let text = metrics.gather_text();
        assert!(text.contains("sapt_gc_keys_swept_total 7"));
        assert!(text.contains("sapt_storage_size_bytes 2048"));
    }
}

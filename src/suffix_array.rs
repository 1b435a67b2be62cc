//! Suffix array over a growing parallel corpus
//!
//! Owns the index store, the corpus storage and the garbage collector.
//! Writers (`put_batch`, `force_compaction`) must be serialized by the
//! caller; readers may run concurrently with each other and with the writer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use tracing::{debug, info, warn};

use crate::batch::{StreamState, UpdateBatch};
use crate::collector::Collector;
use crate::config::SuffixArrayConfig;
use crate::cursor::PrefixCursor;
use crate::error::{Result, SaptError};
use crate::gc::GarbageCollector;
use crate::iterator::IndexIterator;
use crate::key::{self, KeyType};
use crate::metrics::IndexMetrics;
use crate::posting::PostingList;
use crate::storage::{CorporaStorage, StorageManifest};
use crate::store::{IndexBatch, IndexStore};
use crate::types::{Context, Length, Sample, WordId};

const INDEX_DIR: &str = "index";
const STORAGE_DIR: &str = "storage";

/// Point-in-time sizes of an open index
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexStats {
    pub prefix_length: u8,
    pub index_disk_bytes: u64,
    pub index_approximate_keys: usize,
    pub storage_bytes: u64,
    pub storage_files: usize,
    pub streams: usize,
    pub pending_deletions: usize,
}

pub struct SuffixArray {
    // Field order is drop order: the collector stops before the stores close
    gc: GarbageCollector,
    store: Arc<IndexStore>,
    storage: Arc<CorporaStorage>,
    streams: ArcSwap<StreamState>,
    config: SuffixArrayConfig,
    metrics: Arc<IndexMetrics>,
    model_path: PathBuf,
}

impl SuffixArray {
    /// Opens or creates the index under `model_path`, which must exist
    pub fn open(model_path: &Path, config: SuffixArrayConfig) -> Result<Self> {
        config.validate()?;
        if !model_path.is_dir() {
            return Err(SaptError::InvalidArgument(format!(
                "Invalid model path: {}",
                model_path.display()
            )));
        }

        let store = IndexStore::open(&model_path.join(INDEX_DIR), config.tuning())?;
        store.check_prefix_length(config.prefix_length)?;

        let streams = match store.get(&key::make_empty_key(KeyType::Streams))? {
            Some(value) => StreamState::deserialize(&value)?,
            None => StreamState::default(),
        };
        let manifest = match store.get(&key::make_empty_key(KeyType::StorageManifest))? {
            Some(value) => StorageManifest::deserialize(&value)?,
            None => StorageManifest::default(),
        };

        let storage = CorporaStorage::open(
            &model_path.join(STORAGE_DIR),
            &manifest,
            config.storage_max_file_size,
        )?;

        let metrics = Arc::new(
            IndexMetrics::new()
                .map_err(|e| SaptError::Index(format!("failed to register metrics: {}", e)))?,
        );
        let store = Arc::new(store);
        let storage = Arc::new(storage);
        let gc = GarbageCollector::with_metrics(
            storage.clone(),
            store.clone(),
            config.prefix_length,
            config.gc_batch_size,
            config.gc_timeout(),
            Some(metrics.clone()),
        )?;

        info!(
            path = %model_path.display(),
            prefix_length = config.prefix_length,
            bulk_load = config.bulk_load,
            streams = streams.len(),
            storage_bytes = manifest.total_size(),
            "opened suffix array"
        );

        Ok(Self {
            gc,
            store,
            storage,
            streams: ArcSwap::from_pointee(streams),
            config,
            metrics,
            model_path: model_path.to_path_buf(),
        })
    }

    /// Empty batch starting from the committed stream state.
    ///
    /// `max_size` bounds the number of additions, 0 means unbounded.
    pub fn new_batch(&self, max_size: usize) -> UpdateBatch {
        UpdateBatch::new(max_size, (*self.streams.load_full()).clone())
    }

    /// Indexes a batch and commits it atomically with its stream state.
    ///
    /// Sentence pairs are appended to the corpus before the index commit; if
    /// the commit fails they stay as orphans beyond the committed manifest.
    pub fn put_batch(&self, batch: &UpdateBatch) -> Result<()> {
        let start = Instant::now();
        match self.write_batch(batch) {
            Ok(fragments) => {
                self.metrics.record_batch(
                    batch.len(),
                    fragments,
                    batch.deletions().len(),
                    start.elapsed().as_secs_f64(),
                );
                Ok(())
            }
            Err(e) => {
                self.metrics.record_batch_error();
                Err(e)
            }
        }
    }

    fn write_batch(&self, batch: &UpdateBatch) -> Result<usize> {
        let prefix_length = self.config.prefix_length as usize;

        for entry in batch.entries() {
            if entry.source.len() > Length::MAX as usize {
                return Err(SaptError::InvalidArgument(format!(
                    "source sentence of {} words is too long",
                    entry.source.len()
                )));
            }
        }

        let mut prefixes: HashMap<Vec<u8>, PostingList> = HashMap::new();
        let mut counts: HashMap<Vec<u8>, i64> = HashMap::new();

        for entry in batch.entries() {
            let offset = self.storage.append(
                entry.domain,
                &entry.source,
                &entry.target,
                &entry.alignment,
            )?;

            let source = &entry.source;
            for start in 0..source.len() {
                for length in 1..=prefix_length.min(source.len() - start) {
                    let key = key::make_prefix_key(
                        self.config.prefix_length,
                        entry.domain,
                        source,
                        start,
                        length,
                    );
                    prefixes
                        .entry(key)
                        .or_default()
                        .append(entry.domain, offset, start as Length);
                }
            }

            let target = &entry.target;
            for start in 0..target.len() {
                for length in 1..=prefix_length.min(target.len() - start) {
                    let key = key::make_count_key(self.config.prefix_length, target, start, length);
                    *counts.entry(key).or_insert(0) += 1;
                }
            }
        }

        let fragments = prefixes.len();
        let mut writes = IndexBatch::new();
        for (key, postings) in prefixes {
            writes.merge(key, postings.into_bytes());
        }
        for (key, count) in counts {
            writes.merge(key, key::serialize_count(count).to_vec());
        }
        for domain in batch.deletions() {
            writes.put(key::make_domain_deletion_key(*domain), Vec::new());
        }
        // Positions never move back, whatever state the batch started from
        let mut streams = (*self.streams.load_full()).clone();
        streams.merge(batch.streams());
        writes.put(key::make_empty_key(KeyType::Streams), streams.serialize()?);
        if !self.config.bulk_load {
            self.storage.flush()?;
            writes.put(
                key::make_empty_key(KeyType::StorageManifest),
                self.storage.manifest().serialize()?,
            );
        }

        self.store.write(writes)?;

        self.streams.store(Arc::new(streams));
        self.gc.mark_for_deletion(batch.deletions());

        debug!(
            sentences = batch.len(),
            fragments,
            deletions = batch.deletions().len(),
            "indexed batch"
        );
        Ok(fragments)
    }

    /// Persists deferred bulk-load state, then compacts the whole index.
    /// Compaction failures are logged and not returned.
    pub fn force_compaction(&self) -> Result<()> {
        if self.config.bulk_load {
            self.storage.flush()?;
            let mut writes = IndexBatch::new();
            writes.put(
                key::make_empty_key(KeyType::Streams),
                self.streams.load().serialize()?,
            );
            writes.put(
                key::make_empty_key(KeyType::StorageManifest),
                self.storage.manifest().serialize()?,
            );
            self.store.write(writes)?;
            self.store.persist()?;
        }

        let start = Instant::now();
        match self.store.compact() {
            Ok(()) => info!(
                elapsed_ms = start.elapsed().as_millis() as u64,
                "index compaction complete"
            ),
            Err(e) => warn!(error = %e, "index compaction failed"),
        }

        self.metrics
            .set_sizes(self.store.disk_space(), self.storage.size());
        Ok(())
    }

    /// Occurrences of `phrase` on the source or target side.
    ///
    /// Never returns 0: absent phrases count as 1, and so does every phrase
    /// longer than the prefix length.
    pub fn count_occurrences(&self, is_source: bool, phrase: &[WordId]) -> Result<u64> {
        self.metrics.record_count(is_source);

        let prefix_length = self.config.prefix_length;
        if phrase.is_empty() || phrase.len() > prefix_length as usize {
            return Ok(1);
        }

        let count = if is_source {
            let mut cursor = PrefixCursor::global(self.store.clone(), prefix_length);
            cursor.seek(phrase)?;
            cursor.count_remaining()?
        } else {
            let key = key::make_count_key(prefix_length, phrase, 0, phrase.len());
            match self.store.get(&key)? {
                Some(value) => key::deserialize_count(&value)?.max(0) as u64,
                None => 0,
            }
        };

        Ok(count.max(1))
    }

    /// Collector bound to this index and the given translation context
    pub fn new_collector(&self, context: Option<&Context>, search_in_background: bool) -> Result<Collector> {
        Collector::new(
            self.storage.clone(),
            self.store.clone(),
            self.config.prefix_length,
            context,
            search_in_background,
        )
    }

    /// Up to `limit` random sentence pairs containing `phrase` (0 = no limit)
    pub fn get_random_samples(
        &self,
        context: Option<&Context>,
        phrase: &[WordId],
        limit: usize,
        search_in_background: bool,
    ) -> Result<Vec<Sample>> {
        let mut collector = self.new_collector(context, search_in_background)?;
        let mut samples = Vec::new();
        collector.extend(phrase, limit, &mut samples)?;
        Ok(samples)
    }

    /// Scan over every phrase record of the index
    pub fn iter(&self) -> IndexIterator {
        IndexIterator::new(self.store.clone(), self.config.prefix_length)
    }

    /// Stream state of the last committed batch
    pub fn streams(&self) -> Arc<StreamState> {
        self.streams.load_full()
    }

    pub fn stats(&self) -> IndexStats {
        let stats = IndexStats {
            prefix_length: self.config.prefix_length,
            index_disk_bytes: self.store.disk_space(),
            index_approximate_keys: self.store.approximate_len(),
            storage_bytes: self.storage.size(),
            storage_files: self.storage.file_count(),
            streams: self.streams.load().len(),
            pending_deletions: self.gc.pending_domains().len(),
        };
        self.metrics
            .set_sizes(stats.index_disk_bytes, stats.storage_bytes);
        stats
    }

    pub fn prefix_length(&self) -> u8 {
        self.config.prefix_length
    }

    pub fn config(&self) -> &SuffixArrayConfig {
        &self.config
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn store(&self) -> &Arc<IndexStore> {
        &self.store
    }

    pub fn storage(&self) -> &Arc<CorporaStorage> {
        &self.storage
    }

    pub fn garbage_collector(&self) -> &GarbageCollector {
        &self.gc
    }

    pub fn metrics(&self) -> &Arc<IndexMetrics> {
        &self.metrics
    }
}

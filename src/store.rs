//! Fjall-backed index keyspace with merge semantics.
//!
//! Fjall has no native merge operator, so merges are resolved at commit time:
//! the committer reads the current value of every merged key, folds the
//! queued operands in with [`MergeOperator`], and writes the results together
//! with the batch's plain puts and removes in a single atomic fjall batch.
//! Commits are serialized by an internal lock so a read-merge-write never
//! interleaves with another commit (the writer and the garbage collector).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use fjall::compaction::Leveled;
use fjall::{Database, Keyspace, KeyspaceCreateOptions, PersistMode, Slice};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::IndexTuning;
use crate::error::{Result, SaptError};
use crate::merge::MergeOperator;

const INDEX_KEYSPACE: &str = "index";
const META_KEYSPACE: &str = "index_meta";
const PREFIX_LENGTH_KEY: &[u8] = b"prefix_length";

/// Pending writes against the index keyspace
#[derive(Debug, Default)]
pub struct IndexBatch {
    puts: Vec<(Vec<u8>, Vec<u8>)>,
    merges: Vec<(Vec<u8>, Vec<u8>)>,
    removes: Vec<Vec<u8>>,
}

impl IndexBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the value of `key`
    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.puts.push((key.into(), value.into()));
    }

    /// Merge `operand` into the value of `key`
    pub fn merge(&mut self, key: impl Into<Vec<u8>>, operand: impl Into<Vec<u8>>) {
        self.merges.push((key.into(), operand.into()));
    }

    pub fn remove(&mut self, key: impl Into<Vec<u8>>) {
        self.removes.push(key.into());
    }

    pub fn len(&self) -> usize {
        self.puts.len() + self.merges.len() + self.removes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of a committed batch
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommitStats {
    pub puts: usize,
    pub merged_keys: usize,
    pub removes: usize,
}

/// Ordered key-value handle owned by the suffix array
pub struct IndexStore {
    db: Database,
    index: Keyspace,
    meta: Keyspace,
    merge_operator: MergeOperator,
    commit_lock: Mutex<()>,
}

impl IndexStore {
    pub fn open(path: &Path, tuning: IndexTuning) -> Result<Self> {
        std::fs::create_dir_all(path)?;

        let db = Database::builder(path)
            .worker_threads(tuning.worker_threads())
            .manual_journal_persist(tuning.manual_journal_persist())
            .open()
            .map_err(|e| {
                SaptError::Index(format!("failed to open index at {}: {}", path.display(), e))
            })?;

        let index = db
            .keyspace(INDEX_KEYSPACE, || {
                KeyspaceCreateOptions::default()
                    .max_memtable_size(tuning.max_memtable_size())
                    .compaction_strategy(Arc::new(
                        Leveled::default()
                            .with_l0_threshold(tuning.l0_threshold())
                            .with_table_target_size(tuning.table_target_size())
                            .with_level_ratio_policy(vec![tuning.level_ratio()]),
                    ))
            })
            .map_err(|e| SaptError::Index(format!("failed to open index keyspace: {}", e)))?;
        let meta = db
            .keyspace(META_KEYSPACE, KeyspaceCreateOptions::default)
            .map_err(|e| SaptError::Index(format!("failed to open index meta keyspace: {}", e)))?;

        info!(path = %path.display(), ?tuning, "opened index store");

        Ok(Self {
            db,
            index,
            meta,
            merge_operator: MergeOperator,
            commit_lock: Mutex::new(()),
        })
    }

    /// Record the prefix length on first open and reject a different one later
    pub fn check_prefix_length(&self, prefix_length: u8) -> Result<()> {
        match self.meta.get(PREFIX_LENGTH_KEY)? {
            Some(value) => {
                let stored = value.first().copied().unwrap_or(0);
                if stored != prefix_length {
                    return Err(SaptError::InvalidArgument(format!(
                        "index was built with prefix length {}, opened with {}",
                        stored, prefix_length
                    )));
                }
                Ok(())
            }
            None => {
                self.meta.insert(PREFIX_LENGTH_KEY, vec![prefix_length])?;
                Ok(())
            }
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Slice>> {
        Ok(self.index.get(key)?)
    }

    /// Forward scan over every key starting with `prefix`
    pub fn prefix(&self, prefix: &[u8]) -> fjall::Iter {
        self.index.prefix(prefix)
    }

    /// Forward scan over the whole index keyspace
    pub fn iter(&self) -> fjall::Iter {
        self.index.iter()
    }

    pub fn merge_operator(&self) -> &MergeOperator {
        &self.merge_operator
    }

    /// Atomically apply a batch, resolving merges against the stored values.
    ///
    /// Either every write of the batch becomes visible or none does; a merge
    /// failure aborts the whole batch before anything is written.
    pub fn write(&self, batch: IndexBatch) -> Result<CommitStats> {
        let _guard = self.commit_lock.lock();
        self.commit(batch)
    }

    /// Like [`IndexStore::write`], but builds the batch while holding the
    /// commit lock. No other commit lands between what `build` reads and
    /// what it writes.
    pub fn write_with<F>(&self, build: F) -> Result<CommitStats>
    where
        F: FnOnce(&Self) -> Result<IndexBatch>,
    {
        let _guard = self.commit_lock.lock();
        let batch = build(self)?;
        self.commit(batch)
    }

    fn commit(&self, batch: IndexBatch) -> Result<CommitStats> {
        let mut operands: HashMap<Vec<u8>, Vec<Vec<u8>>> = HashMap::new();
        for (key, operand) in batch.merges {
            operands.entry(key).or_default().push(operand);
        }

        let mut writes = self.db.batch();
        let stats = CommitStats {
            puts: batch.puts.len(),
            merged_keys: operands.len(),
            removes: batch.removes.len(),
        };

        for (key, ops) in operands {
            let existing = self.index.get(&key)?;
            let merged = self
                .merge_operator
                .full_merge(&key, existing.as_deref(), ops.iter().map(|o| o.as_slice()))?
                .ok_or_else(|| {
                    SaptError::Index(format!(
                        "{} does not apply to key with tag {:?}",
                        self.merge_operator.name(),
                        key.first()
                    ))
                })?;
            writes.insert(&self.index, key, merged);
        }
        for (key, value) in batch.puts {
            writes.insert(&self.index, key, value);
        }
        for key in batch.removes {
            writes.remove(&self.index, key);
        }

        writes
            .commit()
            .map_err(|e| SaptError::Index(format!("unable to write to index: {}", e)))?;

        debug!(
            puts = stats.puts,
            merged_keys = stats.merged_keys,
            removes = stats.removes,
            "committed index batch"
        );
        Ok(stats)
    }

    /// Flush journals to disk
    pub fn persist(&self) -> Result<()> {
        self.db
            .persist(PersistMode::SyncAll)
            .map_err(|e| SaptError::Index(format!("unable to persist index: {}", e)))
    }

    /// Full-keyspace major compaction, blocking until done
    pub fn compact(&self) -> Result<()> {
        self.index
            .major_compact()
            .map_err(|e| SaptError::Index(format!("compaction failed: {}", e)))
    }

    /// On-disk footprint of the index in bytes
    pub fn disk_space(&self) -> u64 {
        self.index.disk_space()
    }

    pub fn approximate_len(&self) -> usize {
        self.index.approximate_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{self, make_count_key, make_empty_key, KeyType};
    use tempfile::TempDir;

    fn open() -> (TempDir, IndexStore) {
        let tmp = TempDir::new().unwrap();
        let store = IndexStore::open(&tmp.path().join("index"), IndexTuning::SteadyState).unwrap();
        (tmp, store)
    }

    fn count_of(store: &IndexStore, key: &[u8]) -> i64 {
        let value = store.get(key).unwrap().unwrap();
        key::deserialize_count(&value).unwrap()
    }

    #[test]
    fn test_merges_accumulate_across_batches() {
        let (_tmp, store) = open();
        let key = make_count_key(2, &[7, 8], 0, 2);

        let mut batch = IndexBatch::new();
        batch.merge(key.clone(), key::serialize_count(1).to_vec());
        batch.merge(key.clone(), key::serialize_count(2).to_vec());
        let stats = store.write(batch).unwrap();
        assert_eq!(stats.merged_keys, 1);
        assert_eq!(count_of(&store, &key), 3);

        let mut batch = IndexBatch::new();
        batch.merge(key.clone(), key::serialize_count(4).to_vec());
        store.write(batch).unwrap();
        assert_eq!(count_of(&store, &key), 7);
    }

    #[test]
    fn test_failed_merge_writes_nothing() {
        let (_tmp, store) = open();
        let key = make_count_key(2, &[1], 0, 1);
        let streams = make_empty_key(KeyType::Streams);

        let mut batch = IndexBatch::new();
        batch.put(key.clone(), vec![1u8, 2, 3]);
        store.write(batch).unwrap();

        let mut batch = IndexBatch::new();
        batch.put(streams.clone(), b"new".to_vec());
        batch.merge(key, key::serialize_count(1).to_vec());
        let err = store.write(batch).unwrap_err();

        assert!(err.is_fatal());
        assert!(store.get(&streams).unwrap().is_none());
    }

    #[test]
    fn test_merge_on_plain_key_is_rejected() {
        let (_tmp, store) = open();
        let mut batch = IndexBatch::new();
        batch.merge(make_empty_key(KeyType::Streams), b"x".to_vec());
        assert!(matches!(store.write(batch), Err(SaptError::Index(_))));
    }

    #[test]
    fn test_prefix_length_is_pinned() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("index");
        {
            let store = IndexStore::open(&path, IndexTuning::SteadyState).unwrap();
            store.check_prefix_length(4).unwrap();
            store.check_prefix_length(4).unwrap();
        }
        let store = IndexStore::open(&path, IndexTuning::SteadyState).unwrap();
        assert!(matches!(
            store.check_prefix_length(5),
            Err(SaptError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_prefix_scan_and_removes() {
        let (_tmp, store) = open();
        let mut batch = IndexBatch::new();
        batch.put(vec![2u8, 1], vec![]);
        batch.put(vec![2u8, 2], vec![]);
        batch.put(vec![3u8, 1], vec![]);
        store.write(batch).unwrap();
        assert_eq!(store.prefix(&[2]).count(), 2);

        let mut batch = IndexBatch::new();
        batch.remove(vec![2u8, 1]);
        store.write(batch).unwrap();
        assert_eq!(store.prefix(&[2]).count(), 1);
        assert_eq!(store.iter().count(), 2);
    }

    #[test]
    fn test_write_with_builds_under_commit_lock() {
        let (_tmp, store) = open();
        let mut batch = IndexBatch::new();
        batch.put(vec![4u8, 1], vec![]);
        batch.put(vec![4u8, 2], vec![]);
        store.write(batch).unwrap();

        let stats = store
            .write_with(|store| {
                let mut batch = IndexBatch::new();
                for guard in store.prefix(&[4]) {
                    batch.remove(guard.key()?.to_vec());
                }
                Ok(batch)
            })
            .unwrap();
        assert_eq!(stats.removes, 2);
        assert_eq!(store.prefix(&[4]).count(), 0);

        let err = store
            .write_with(|_| Err(SaptError::Index("nothing to write".to_string())))
            .unwrap_err();
        assert!(err.is_index_error());
    }
}

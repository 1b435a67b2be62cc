//! Background purge of deleted domains
//!
//! Deleting a domain only writes a marker into the index. The collector
//! thread wakes up every `timeout`, removes the source prefix keys of the
//! marked domains in batches of at most `batch_size` keys and finally drops
//! the markers. Every prefix key belongs to a single domain, so whole keys
//! are removed and no posting list has to be rewritten.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::key::{self, KeyType};
use crate::metrics::IndexMetrics;
use crate::storage::CorporaStorage;
use crate::store::{IndexBatch, IndexStore};
use crate::types::Domain;

/// Outcome of one sweep
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub domains: usize,
    pub keys_removed: usize,
    pub batches: usize,
}

struct Sweeper {
    store: Arc<IndexStore>,
    storage: Arc<CorporaStorage>,
    prefix_length: u8,
    batch_size: usize,
    pending: Mutex<HashSet<Domain>>,
    sweep_lock: Mutex<()>,
    stopped: AtomicBool,
    metrics: Option<Arc<IndexMetrics>>,
}

impl Sweeper {
    /// Domains whose deletion markers survived a restart
    fn load_pending(&self) -> Result<HashSet<Domain>> {
        let mut domains = HashSet::new();
        for guard in self.store.prefix(&KeyType::DomainDeletion.prefix()) {
            let key = guard.key()?;
            domains.insert(key::domain_from_key(&key, self.prefix_length)?);
        }
        Ok(domains)
    }

    fn sweep(&self) -> Result<SweepStats> {
        let _guard = self.sweep_lock.lock();

        let domains: HashSet<Domain> = self.pending.lock().clone();
        if domains.is_empty() {
            return Ok(SweepStats::default());
        }

        let start = Instant::now();
        let mut stats = SweepStats {
            domains: domains.len(),
            ..Default::default()
        };

        self.remove_postings(&domains, &mut stats)?;
        // Markers go last so an interrupted sweep resumes after a restart
        self.remove_markers(&domains, &mut stats)?;
        self.release(&domains)?;

        if let Some(metrics) = &self.metrics {
            metrics.record_gc_sweep(stats.keys_removed);
        }
        info!(
            domains = stats.domains,
            keys_removed = stats.keys_removed,
            batches = stats.batches,
            storage_bytes = self.storage.size(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "garbage collection sweep complete"
        );
        Ok(stats)
    }
    /// Removes the prefix keys of `domains` in batches of `batch_size`
    fn remove_postings(&self, domains: &HashSet<Domain>, stats: &mut SweepStats) -> Result<()> {
        let mut batch = IndexBatch::new();
        for guard in self.store.prefix(&KeyType::SourcePrefix.prefix()) {
            let key = guard.key()?;
            if domains.contains(&key::domain_from_key(&key, self.prefix_length)?) {
                batch.remove(key.to_vec());
                if batch.len() >= self.batch_size {
                    stats.keys_removed += batch.len();
                    stats.batches += 1;
                    self.store.write(std::mem::take(&mut batch))?;
                }
            }
        }
        if !batch.is_empty() {
            stats.keys_removed += batch.len();
            stats.batches += 1;
            self.store.write(batch)?;
        }
        Ok(())
    }

    /// Drops the markers, together with any posting committed to the
    /// domains since [`Sweeper::remove_postings`], in one commit
    fn remove_markers(&self, domains: &HashSet<Domain>, stats: &mut SweepStats) -> Result<()> {
        let prefix_length = self.prefix_length;
        let commit = self.store.write_with(|store| {
            let mut batch = IndexBatch::new();
            for guard in store.prefix(&KeyType::SourcePrefix.prefix()) {
                let key = guard.key()?;
                if domains.contains(&key::domain_from_key(&key, prefix_length)?) {
                    batch.remove(key.to_vec());
                }
            }
            for domain in domains {
                batch.remove(key::make_domain_deletion_key(*domain));
            }
            Ok(batch)
        })?;
        stats.keys_removed += commit.removes - domains.len();
        stats.batches += 1;
        Ok(())
    }

    /// Forgets swept domains, except those marked again since
    fn release(&self, domains: &HashSet<Domain>) -> Result<()> {
        let mut remarked = HashSet::new();
        for domain in domains {
            if self.store.get(&key::make_domain_deletion_key(*domain))?.is_some() {
                remarked.insert(*domain);
            }
        }
        self.pending
            .lock()
            .retain(|d| !domains.contains(d) || remarked.contains(d));
        Ok(())
    }
}

/// Owner of the background sweep thread; dropping it stops the thread
pub struct GarbageCollector {
    sweeper: Arc<Sweeper>,
    shutdown: Option<Sender<()>>,
    join: Option<thread::JoinHandle<()>>,
}

impl GarbageCollector {
    pub fn new(
        storage: Arc<CorporaStorage>,
        store: Arc<IndexStore>,
        prefix_length: u8,
        batch_size: usize,
        timeout: Duration,
    ) -> Result<Self> {
        Self::with_metrics(storage, store, prefix_length, batch_size, timeout, None)
    }

    pub fn with_metrics(
        storage: Arc<CorporaStorage>,
        store: Arc<IndexStore>,
        prefix_length: u8,
        batch_size: usize,
        timeout: Duration,
        metrics: Option<Arc<IndexMetrics>>,
    ) -> Result<Self> {
        let sweeper = Arc::new(Sweeper {
            store,
            storage,
            prefix_length,
            batch_size: batch_size.max(1),
            pending: Mutex::new(HashSet::new()),
            sweep_lock: Mutex::new(()),
            stopped: AtomicBool::new(false),
            metrics,
        });

        let resumed = sweeper.load_pending()?;
        if !resumed.is_empty() {
            info!(domains = resumed.len(), "resuming pending domain deletions");
        }
        sweeper.pending.lock().extend(resumed);

        let (tx, rx) = channel::bounded::<()>(1);
        let worker = sweeper.clone();
        let join = thread::Builder::new()
            .name("sapt-gc".to_string())
            .spawn(move || loop {
                match rx.recv_timeout(timeout) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                if worker.pending.lock().is_empty() {
                    continue;
                }
                if let Err(e) = worker.sweep() {
                    if e.is_fatal() {
                        error!(error = %e, "garbage collector stopped on index corruption");
                        worker.stopped.store(true, Ordering::SeqCst);
                        break;
                    }
                    warn!(error = %e, "garbage collection sweep failed");
                }
            })?;

        debug!(batch_size, ?timeout, "started garbage collector");

        Ok(Self {
            sweeper,
            shutdown: Some(tx),
            join: Some(join),
        })
    }

    /// Queue domains for purge on the next sweep
    pub fn mark_for_deletion(&self, domains: &HashSet<Domain>) {
        if domains.is_empty() {
            return;
        }
        self.sweeper.pending.lock().extend(domains.iter().copied());
    }

    /// Domains marked for deletion and not yet swept
    pub fn pending_domains(&self) -> HashSet<Domain> {
        self.sweeper.pending.lock().clone()
    }

    /// Run a sweep on the calling thread
    pub fn sweep_now(&self) -> Result<SweepStats> {
        self.sweeper.sweep()
    }

    /// Whether the background thread gave up after detecting corruption
    pub fn is_stopped(&self) -> bool {
        self.sweeper.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for GarbageCollector {
    fn drop(&mut self) {
        drop(self.shutdown.take());
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!("garbage collector thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexTuning;
    use crate::posting::PostingList;
    use crate::storage::StorageManifest;
    use tempfile::TempDir;

    const L: u8 = 2;

    struct Fixture {
        _tmp: TempDir,
        storage: Arc<CorporaStorage>,
        store: Arc<IndexStore>,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let store = IndexStore::open(&tmp.path().join("index"), IndexTuning::SteadyState).unwrap();
        let storage =
            CorporaStorage::open(&tmp.path().join("storage"), &StorageManifest::new(), 1 << 20)
                .unwrap();
        Fixture {
            _tmp: tmp,
            storage: Arc::new(storage),
            store: Arc::new(store),
        }
    }

    fn index_sentence(store: &IndexStore, domain: Domain, sentence: &[u32]) {
        let mut batch = IndexBatch::new();
        for start in 0..sentence.len() {
            for len in 1..=(sentence.len() - start).min(L as usize) {
                let mut list = PostingList::new();
                list.append(domain, 0, start as u16);
                batch.merge(
                    key::make_prefix_key(L, domain, sentence, start, len),
                    list.into_bytes(),
                );
            }
        }
        store.write(batch).unwrap();
    }

    fn mark(store: &IndexStore, domain: Domain) {
        let mut batch = IndexBatch::new();
        batch.put(key::make_domain_deletion_key(domain), Vec::new());
        store.write(batch).unwrap();
    }

    fn domains_in_index(store: &IndexStore) -> HashSet<Domain> {
        store
            .prefix(&KeyType::SourcePrefix.prefix())
            .map(|g| key::domain_from_key(&g.key().unwrap(), L).unwrap())
            .collect()
    }

    #[test]
    fn test_sweep_removes_marked_domains() {
        let f = fixture();
        index_sentence(&f.store, 1, &[1, 2, 3]);
        index_sentence(&f.store, 2, &[1, 2, 3]);
        mark(&f.store, 1);

        let gc = GarbageCollector::new(
            f.storage.clone(),
            f.store.clone(),
            L,
            2,
            Duration::from_secs(3600),
        )
        .unwrap();
        // Picked up from the persisted marker
        assert_eq!(gc.pending_domains(), HashSet::from([1]));

        let stats = gc.sweep_now().unwrap();
        assert_eq!(stats.domains, 1);
        // [1] [2] [3] [1,2] [2,3]
        assert_eq!(stats.keys_removed, 5);
        assert!(stats.batches >= 3);

        assert_eq!(domains_in_index(&f.store), HashSet::from([2]));
        assert!(gc.pending_domains().is_empty());
        assert_eq!(
            f.store.prefix(&KeyType::DomainDeletion.prefix()).count(),
            0
        );
    }

    #[test]
    fn test_mark_for_deletion_and_idle_sweep() {
        let f = fixture();
        index_sentence(&f.store, 7, &[4, 5]);

        let gc = GarbageCollector::new(
            f.storage.clone(),
            f.store.clone(),
            L,
            100,
            Duration::from_secs(3600),
        )
        .unwrap();
        assert_eq!(gc.sweep_now().unwrap(), SweepStats::default());

        gc.mark_for_deletion(&HashSet::from([7]));
        assert_eq!(gc.sweep_now().unwrap().keys_removed, 3);
        assert!(domains_in_index(&f.store).is_empty());
    }

    #[test]
    fn test_postings_committed_during_sweep_are_removed() {
        let f = fixture();
        index_sentence(&f.store, 1, &[1, 2]);
        mark(&f.store, 1);
        let gc = GarbageCollector::new(
            f.storage.clone(),
            f.store.clone(),
            L,
            100,
            Duration::from_secs(3600),
        )
        .unwrap();

        let domains = gc.pending_domains();
        let mut stats = SweepStats::default();
        gc.sweeper.remove_postings(&domains, &mut stats).unwrap();
        assert_eq!(stats.keys_removed, 3);

        // Domain written to and marked again between the scan and the markers
        index_sentence(&f.store, 1, &[5, 6]);
        mark(&f.store, 1);
        gc.sweeper.remove_markers(&domains, &mut stats).unwrap();
        gc.sweeper.release(&domains).unwrap();

        assert_eq!(stats.keys_removed, 6);
        assert!(domains_in_index(&f.store).is_empty());
        assert_eq!(f.store.prefix(&KeyType::DomainDeletion.prefix()).count(), 0);
        assert!(gc.pending_domains().is_empty());
    }

    #[test]
    fn test_domain_marked_after_sweep_stays_pending() {
        let f = fixture();
        index_sentence(&f.store, 2, &[3]);
        mark(&f.store, 2);
        let gc = GarbageCollector::new(
            f.storage.clone(),
            f.store.clone(),
            L,
            100,
            Duration::from_secs(3600),
        )
        .unwrap();

        let domains = gc.pending_domains();
        let mut stats = SweepStats::default();
        gc.sweeper.remove_postings(&domains, &mut stats).unwrap();
        gc.sweeper.remove_markers(&domains, &mut stats).unwrap();

        index_sentence(&f.store, 2, &[4]);
        mark(&f.store, 2);
        gc.sweeper.release(&domains).unwrap();
        assert_eq!(gc.pending_domains(), HashSet::from([2]));

        assert_eq!(gc.sweep_now().unwrap().keys_removed, 1);
        assert!(domains_in_index(&f.store).is_empty());
        assert!(gc.pending_domains().is_empty());
    }

    #[test]
    fn test_background_thread_sweeps() {
        let f = fixture();
        index_sentence(&f.store, 3, &[9, 9, 9]);

        let gc = GarbageCollector::new(
            f.storage.clone(),
            f.store.clone(),
            L,
            100,
            Duration::from_millis(20),
        )
        .unwrap();
        gc.mark_for_deletion(&HashSet::from([3]));

        let deadline = Instant::now() + Duration::from_secs(10);
        while !gc.pending_domains().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(gc.pending_domains().is_empty());
        assert!(domains_in_index(&f.store).is_empty());
        assert!(!gc.is_stopped());
    }
}

use std::collections::{BTreeSet, BinaryHeap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use crate::firestore::async_queue::{AsyncQueue, DelayedOperation, TimerId};
use crate::firestore::core::listen_sequence::{ListenSequence, ListenSequenceNumber};
use crate::firestore::core::types::TargetId;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::local_store::LocalStore;
use crate::firestore::local::mutation_queue::any_queue_contains_key;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::local::target_cache::TargetCache;
use crate::firestore::settings::{SyncSettings, CACHE_SIZE_UNLIMITED};

/// Outcome of one collection pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: usize,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

impl LruResults {
    pub fn did_not_run() -> Self {
        Self::default()
    }
}

/// Thresholds for a collection pass.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LruParams {
    pub cache_size_collection_threshold: i64,
    pub percentile_to_collect: u8,
    pub maximum_sequence_numbers_to_collect: usize,
}

impl LruParams {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            cache_size_collection_threshold: settings.cache_size_bytes,
            percentile_to_collect: settings.lru_percentile_to_collect,
            maximum_sequence_numbers_to_collect: settings.lru_max_sequence_numbers_to_collect,
        }
    }

    pub fn disabled() -> Self {
        Self {
            cache_size_collection_threshold: CACHE_SIZE_UNLIMITED,
            percentile_to_collect: 0,
            maximum_sequence_numbers_to_collect: 0,
        }
    }
}

/// Removes the least recently used targets and the documents no target
/// references any more.
///
/// Every target and every orphaned document carries the sequence number of
/// its last use. A pass picks the sequence number below which the oldest
/// `percentile_to_collect` percent of them fall and removes everything at or
/// below it, except active targets and documents with pending writes or
/// local view pins.
#[derive(Clone)]
pub struct LruGarbageCollector {
    params: LruParams,
    target_cache: TargetCache,
    remote_document_cache: RemoteDocumentCache,
}

impl LruGarbageCollector {
    pub fn new(
        params: LruParams,
        target_cache: TargetCache,
        remote_document_cache: RemoteDocumentCache,
    ) -> Self {
        Self {
            params,
            target_cache,
            remote_document_cache,
        }
    }

    pub fn params(&self) -> &LruParams {
        &self.params
    }

    /// Runs a pass if the cache outgrew its threshold.
    pub fn collect(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        active_target_ids: &BTreeSet<TargetId>,
        pins: &ReferenceSet,
    ) -> FirestoreResult<LruResults> {
        if self.params.cache_size_collection_threshold == CACHE_SIZE_UNLIMITED {
            log::debug!("Garbage collection skipped; disabled");
            return Ok(LruResults::did_not_run());
        }
        let cache_size = self.get_cache_size(txn)?;
        if cache_size < self.params.cache_size_collection_threshold {
            log::debug!(
                "Garbage collection skipped; cache size {cache_size} is lower than threshold {}",
                self.params.cache_size_collection_threshold
            );
            return Ok(LruResults::did_not_run());
        }
        self.run_garbage_collection(txn, active_target_ids, pins)
    }

    pub fn get_cache_size(&self, txn: &PersistenceTransaction<'_, '_>) -> FirestoreResult<i64> {
        self.remote_document_cache.get_size(txn)
    }

    /// How many sequence numbers the given percentile of the cache spans.
    pub fn calculate_target_count(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        percentile: u8,
    ) -> FirestoreResult<usize> {
        let target_count = self.target_cache.get_target_count(txn)?.max(0) as usize;
        let orphaned_count = self.target_cache.get_orphaned_documents(txn)?.len();
        let total = target_count + orphaned_count;
        Ok(total * usize::from(percentile) / 100)
    }

    /// The `n`th lowest sequence number among targets and orphaned
    /// documents, or [`ListenSequence::INVALID`] for `n == 0`.
    pub fn nth_sequence_number(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        n: usize,
    ) -> FirestoreResult<ListenSequenceNumber> {
        if n == 0 {
            return Ok(ListenSequence::INVALID);
        }
        // Max-heap of the n smallest values seen so far.
        let mut lowest: BinaryHeap<ListenSequenceNumber> = BinaryHeap::with_capacity(n + 1);
        let mut observe = |sequence_number: ListenSequenceNumber| {
            if lowest.len() < n {
                lowest.push(sequence_number);
            } else if lowest.peek().is_some_and(|max| sequence_number < *max) {
                lowest.pop();
                lowest.push(sequence_number);
            }
        };
        for target_data in self.target_cache.get_all_targets(txn)? {
            observe(target_data.sequence_number);
        }
        for (_, sequence_number) in self.target_cache.get_orphaned_documents(txn)? {
            observe(sequence_number);
        }
        Ok(lowest.peek().copied().unwrap_or(ListenSequence::INVALID))
    }

    pub fn remove_targets(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> FirestoreResult<usize> {
        self.target_cache
            .remove_targets(txn, upper_bound, active_target_ids)
    }

    /// Removes orphaned documents last used at or before `upper_bound`.
    pub fn remove_orphaned_documents(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        upper_bound: ListenSequenceNumber,
        pins: &ReferenceSet,
    ) -> FirestoreResult<usize> {
        let mut removed = 0;
        for (key, sequence_number) in self.target_cache.get_orphaned_documents(txn)? {
            if sequence_number > upper_bound {
                continue;
            }
            if pins.contains_key(&key) || any_queue_contains_key(txn, &key)? {
                continue;
            }
            self.remote_document_cache.remove_entry(txn, &key)?;
            self.target_cache.remove_sentinel(txn, &key)?;
            removed += 1;
        }
        Ok(removed)
    }

    fn run_garbage_collection(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        active_target_ids: &BTreeSet<TargetId>,
        pins: &ReferenceSet,
    ) -> FirestoreResult<LruResults> {
        let mut sequence_numbers_to_collect =
            self.calculate_target_count(txn, self.params.percentile_to_collect)?;
        if sequence_numbers_to_collect > self.params.maximum_sequence_numbers_to_collect {
            log::debug!(
                "Capping garbage collection to {} from {sequence_numbers_to_collect}",
                self.params.maximum_sequence_numbers_to_collect
            );
            sequence_numbers_to_collect = self.params.maximum_sequence_numbers_to_collect;
        }
        let upper_bound = self.nth_sequence_number(txn, sequence_numbers_to_collect)?;
        let targets_removed = self.remove_targets(txn, upper_bound, active_target_ids)?;
        let documents_removed = self.remove_orphaned_documents(txn, upper_bound, pins)?;
        log::debug!(
            "LRU garbage collection: counted {sequence_numbers_to_collect} sequence numbers, \
             upper bound {upper_bound}, removed {targets_removed} targets and \
             {documents_removed} documents"
        );
        Ok(LruResults {
            did_run: true,
            sequence_numbers_collected: sequence_numbers_to_collect,
            targets_removed,
            documents_removed,
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs garbage collection periodically on the async queue while this
/// client is primary.
pub struct LruScheduler {
    queue: AsyncQueue,
    local_store: Weak<LocalStore>,
    initial_delay: Duration,
    regular_delay: Duration,
    task: Mutex<Option<DelayedOperation>>,
    this: Weak<LruScheduler>,
}

impl LruScheduler {
    pub fn new(queue: AsyncQueue, local_store: &Arc<LocalStore>, settings: &SyncSettings) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            queue,
            local_store: Arc::downgrade(local_store),
            initial_delay: Duration::from_millis(settings.lru_initial_collection_delay_millis),
            regular_delay: Duration::from_millis(settings.lru_regular_collection_delay_millis),
            task: Mutex::new(None),
            this: this.clone(),
        })
    }

    pub fn start(&self) {
        let enabled = self
            .local_store
            .upgrade()
            .is_some_and(|store| store.garbage_collection_enabled());
        if enabled && lock(&self.task).is_none() {
            self.schedule(self.initial_delay);
        }
    }

    pub fn stop(&self) {
        if let Some(task) = lock(&self.task).take() {
            task.cancel();
        }
    }

    pub fn is_started(&self) -> bool {
        lock(&self.task).is_some()
    }

    fn schedule(&self, delay: Duration) {
        log::debug!("Garbage collection scheduled in {}ms", delay.as_millis());
        let this = self.this.clone();
        let task = self
            .queue
            .enqueue_after_delay(TimerId::LruGarbageCollection, delay, move || async move {
                let Some(scheduler) = this.upgrade() else {
                    return;
                };
                lock(&scheduler.task).take();
                let Some(local_store) = scheduler.local_store.upgrade() else {
                    return;
                };
                match local_store.collect_garbage().await {
                    Ok(_) => {}
                    Err(err) if err.is_storage_transaction_failure() => {
                        log::debug!("Ignoring storage error during garbage collection: {err}");
                    }
                    Err(err) if err.is_primary_lease_lost() => {
                        log::debug!("Skipping garbage collection after losing the primary lease");
                    }
                    Err(err) => log::warn!("Garbage collection failed: {err}"),
                }
                scheduler.schedule(scheduler.regular_delay);
            });
        *lock(&self.task) = Some(task);
    }
}

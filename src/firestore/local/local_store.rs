use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::firestore::core::query::Query;
use crate::firestore::core::target::Target;
use crate::firestore::core::types::{BatchId, TargetId};
use crate::firestore::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::kv_store::TransactionMode;
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::lru_garbage_collector::{LruGarbageCollector, LruParams, LruResults};
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::persistence::Persistence;
use crate::firestore::local::query_engine::QueryEngine;
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{
    Document, DocumentKey, MaybeDocument, Mutation, MutationBatch, MutationBatchResult,
    SnapshotVersion, Timestamp, User, BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};

/// Result of [`LocalStore::write_locally`].
#[derive(Clone, Debug, PartialEq)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    pub changes: BTreeMap<DocumentKey, MaybeDocument>,
}

/// Result of [`LocalStore::handle_user_change`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UserChangeResult {
    /// Local views of every document touched by either user's writes.
    pub affected_documents: BTreeMap<DocumentKey, MaybeDocument>,
    pub removed_batch_ids: Vec<BatchId>,
    pub added_batch_ids: Vec<BatchId>,
}

/// Result of [`LocalStore::execute_query`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryResult {
    pub documents: BTreeMap<DocumentKey, Document>,
    pub remote_keys: BTreeSet<DocumentKey>,
}

/// Documents that entered or left a view, reported back to pin them
/// against garbage collection.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: BTreeSet<DocumentKey>,
    pub removed_keys: BTreeSet<DocumentKey>,
}

impl LocalViewChanges {
    pub fn from_snapshot(target_id: TargetId, snapshot: &ViewSnapshot) -> Self {
        let mut added_keys = BTreeSet::new();
        let mut removed_keys = BTreeSet::new();
        for change in &snapshot.doc_changes {
            match change.change_type {
                ChangeType::Added => {
                    added_keys.insert(change.doc.key().clone());
                }
                ChangeType::Removed => {
                    removed_keys.insert(change.doc.key().clone());
                }
                ChangeType::Modified | ChangeType::Metadata => {}
            }
        }
        Self {
            target_id,
            from_cache: snapshot.from_cache,
            added_keys,
            removed_keys,
        }
    }
}

struct LocalStoreState {
    current_user: User,
    mutation_queue: MutationQueue,
    local_documents: LocalDocumentsView,
    /// Targets this client actively listens to.
    target_data_by_target: BTreeMap<TargetId, TargetData>,
    /// Pins documents visible in views so GC keeps them.
    local_view_references: ReferenceSet,
    /// Read time of the newest remote document this client has seen.
    last_document_change_read_time: SnapshotVersion,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reconciles the mutation queue, the remote document cache and the target
/// cache into the client's local view of the database.
///
/// Every operation runs in one persistence transaction. Operations that
/// change what the backend told us run in primary-only transactions; the
/// in-memory target map is only updated once a transaction committed.
pub struct LocalStore {
    persistence: Arc<Persistence>,
    query_engine: QueryEngine,
    garbage_collector: LruGarbageCollector,
    state: Mutex<LocalStoreState>,
}

impl LocalStore {
    pub fn new(persistence: Arc<Persistence>, initial_user: User) -> Arc<Self> {
        let mutation_queue = persistence.mutation_queue(&initial_user);
        let local_documents = Self::local_documents_for(&persistence, mutation_queue.clone());
        let garbage_collector = LruGarbageCollector::new(
            LruParams::from_settings(persistence.settings()),
            persistence.target_cache().clone(),
            persistence.remote_document_cache().clone(),
        );
        Arc::new(Self {
            query_engine: QueryEngine::new(),
            garbage_collector,
            state: Mutex::new(LocalStoreState {
                current_user: initial_user,
                mutation_queue,
                local_documents,
                target_data_by_target: BTreeMap::new(),
                local_view_references: ReferenceSet::new(),
                last_document_change_read_time: SnapshotVersion::min(),
            }),
            persistence,
        })
    }

    fn local_documents_for(persistence: &Persistence, queue: MutationQueue) -> LocalDocumentsView {
        LocalDocumentsView::new(
            persistence.remote_document_cache().clone(),
            queue,
            persistence.index_manager().clone(),
        )
    }

    /// Reads the newest remote read time so that later
    /// [`get_new_document_changes`](Self::get_new_document_changes) calls
    /// only report what other clients write from now on.
    pub async fn start(&self) -> FirestoreResult<()> {
        let cache = self.persistence.remote_document_cache().clone();
        let read_time = self
            .persistence
            .run_transaction(
                "Synchronize last document change read time",
                TransactionMode::ReadOnly,
                |txn| cache.get_latest_read_time(txn),
            )
            .await?;
        lock(&self.state).last_document_change_read_time = read_time;
        Ok(())
    }

    pub fn persistence(&self) -> &Arc<Persistence> {
        &self.persistence
    }

    pub fn current_user(&self) -> User {
        lock(&self.state).current_user.clone()
    }

    pub fn garbage_collection_enabled(&self) -> bool {
        self.persistence.settings().gc_enabled()
    }

    fn local_documents(&self) -> LocalDocumentsView {
        lock(&self.state).local_documents.clone()
    }

    fn mutation_queue(&self) -> MutationQueue {
        lock(&self.state).mutation_queue.clone()
    }

    /// Switches to the mutation queue of `user`.
    pub async fn handle_user_change(&self, user: User) -> FirestoreResult<UserChangeResult> {
        let old_queue = self.mutation_queue();
        let new_queue = self.persistence.mutation_queue(&user);
        let new_local_documents = Self::local_documents_for(&self.persistence, new_queue.clone());

        let result = self
            .persistence
            .run_transaction("Handle user change", TransactionMode::ReadOnly, |txn| {
                let old_batches = old_queue.get_all_mutation_batches(txn)?;
                let new_batches = new_queue.get_all_mutation_batches(txn)?;
                let mut changed_keys = BTreeSet::new();
                for batch in old_batches.iter().chain(new_batches.iter()) {
                    changed_keys.extend(batch.keys());
                }
                Ok(UserChangeResult {
                    affected_documents: new_local_documents.get_documents(txn, &changed_keys)?,
                    removed_batch_ids: old_batches.iter().map(|batch| batch.batch_id).collect(),
                    added_batch_ids: new_batches.iter().map(|batch| batch.batch_id).collect(),
                })
            })
            .await?;

        let mut state = lock(&self.state);
        state.current_user = user;
        state.mutation_queue = new_queue;
        state.local_documents = new_local_documents;
        Ok(result)
    }

    /// Persists `mutations` as a new batch and returns the resulting local
    /// views. Non-idempotent transforms record the value they start from as
    /// base mutations first.
    pub async fn write_locally(&self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        let local_write_time = Timestamp::now();
        let keys: BTreeSet<DocumentKey> = mutations.iter().map(|m| m.key().clone()).collect();
        let queue = self.mutation_queue();
        let local_documents = self.local_documents();

        self.persistence
            .run_transaction("Locally write mutations", TransactionMode::ReadWrite, |txn| {
                let existing_docs = local_documents.get_documents(txn, &keys)?;
                let base_mutations: Vec<Mutation> = mutations
                    .iter()
                    .filter_map(|mutation| {
                        let base_value =
                            mutation.extract_base_value(existing_docs.get(mutation.key()))?;
                        // Patches only apply if the document exists, which
                        // is what the transform requires too.
                        Some(Mutation::patch(mutation.key().clone(), base_value))
                    })
                    .collect();

                let batch =
                    queue.add_mutation_batch(txn, local_write_time, base_mutations, mutations)?;
                let mut docs: BTreeMap<DocumentKey, Option<MaybeDocument>> = existing_docs
                    .into_iter()
                    .map(|(key, doc)| (key, Some(doc)))
                    .collect();
                batch.apply_to_local_document_set(&mut docs);
                Ok(LocalWriteResult {
                    batch_id: batch.batch_id,
                    changes: docs
                        .into_iter()
                        .filter_map(|(key, doc)| doc.map(|doc| (key, doc)))
                        .collect(),
                })
            })
            .await
    }

    /// Removes an acknowledged batch and folds its writes into the remote
    /// document cache. Returns the new local views of the written documents.
    pub async fn acknowledge_batch(
        &self,
        batch_result: MutationBatchResult,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MaybeDocument>> {
        let queue = self.mutation_queue();
        let local_documents = self.local_documents();
        let remote_documents = self.persistence.remote_document_cache().clone();
        let target_cache = self.persistence.target_cache().clone();

        self.persistence
            .run_transaction("Acknowledge batch", TransactionMode::ReadWritePrimary, |txn| {
                let batch = &batch_result.batch;
                queue.acknowledge_batch(txn, batch.batch_id, &batch_result.stream_token)?;

                for key in batch.keys() {
                    let remote_doc = remote_documents.get_entry(txn, &key)?;
                    let ack_version = batch_result
                        .doc_versions
                        .get(&key)
                        .copied()
                        .ok_or_else(|| internal_error("docVersions should contain every doc in the write"))?;
                    let is_newer = remote_doc
                        .as_ref()
                        .map_or(true, |doc| doc.version() < ack_version);
                    if !is_newer {
                        continue;
                    }
                    if let Some(doc) =
                        batch.apply_to_remote_document(&key, remote_doc, &batch_result)?
                    {
                        remote_documents.add_entry(txn, &doc, batch_result.commit_version)?;
                    }
                }

                queue.remove_mutation_batch(txn, batch)?;
                for key in batch.keys() {
                    target_cache.update_sentinel(txn, &key)?;
                }
                local_documents.get_documents(txn, &batch.keys())
            })
            .await
    }

    /// Removes a batch the backend rejected. Returns the local views of the
    /// documents it touched, now without its writes.
    pub async fn reject_batch(
        &self,
        batch_id: BatchId,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MaybeDocument>> {
        let queue = self.mutation_queue();
        let local_documents = self.local_documents();
        let target_cache = self.persistence.target_cache().clone();

        self.persistence
            .run_transaction("Reject batch", TransactionMode::ReadWritePrimary, |txn| {
                let batch = queue
                    .lookup_mutation_batch(txn, batch_id)?
                    .ok_or_else(|| internal_error(format!("Attempt to reject nonexistent batch {batch_id}")))?;
                queue.remove_mutation_batch(txn, &batch)?;
                for key in batch.keys() {
                    target_cache.update_sentinel(txn, &key)?;
                }
                local_documents.get_documents(txn, &batch.keys())
            })
            .await
    }

    /// Highest batch id still waiting for an acknowledgement, or
    /// [`BATCH_ID_UNKNOWN`].
    pub async fn get_highest_unacknowledged_batch_id(&self) -> FirestoreResult<BatchId> {
        let queue = self.mutation_queue();
        self.persistence
            .run_transaction(
                "Get highest unacknowledged batch id",
                TransactionMode::ReadOnly,
                |txn| queue.get_highest_unacknowledged_batch_id(txn),
            )
            .await
    }

    pub async fn get_last_stream_token(&self) -> FirestoreResult<Vec<u8>> {
        let queue = self.mutation_queue();
        self.persistence
            .run_transaction("Get last stream token", TransactionMode::ReadOnly, |txn| {
                queue.get_last_stream_token(txn)
            })
            .await
    }

    pub async fn set_last_stream_token(&self, stream_token: Vec<u8>) -> FirestoreResult<()> {
        let queue = self.mutation_queue();
        self.persistence
            .run_transaction("Set last stream token", TransactionMode::ReadWritePrimary, |txn| {
                queue.set_last_stream_token(txn, &stream_token)
            })
            .await
    }

    pub async fn get_last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
        let target_cache = self.persistence.target_cache().clone();
        self.persistence
            .run_transaction("Get last remote snapshot version", TransactionMode::ReadOnly, |txn| {
                target_cache.get_last_remote_snapshot_version(txn)
            })
            .await
    }

    /// Applies a remote event to the caches and returns the local views of
    /// the documents it changed.
    pub async fn apply_remote_event(
        &self,
        remote_event: RemoteEvent,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MaybeDocument>> {
        let remote_version = remote_event.snapshot_version;
        let mut new_target_data_by_target = lock(&self.state).target_data_by_target.clone();
        let local_documents = self.local_documents();
        let target_cache = self.persistence.target_cache().clone();
        let remote_documents = self.persistence.remote_document_cache().clone();
        let max_resume_token_age = self.persistence.settings().resume_token_max_age_micros;

        let changed = self
            .persistence
            .run_transaction("Apply remote event", TransactionMode::ReadWritePrimary, |txn| {
                for (target_id, change) in &remote_event.target_changes {
                    let Some(old_target_data) = new_target_data_by_target.get(target_id).cloned()
                    else {
                        continue;
                    };
                    target_cache.remove_matching_keys(txn, &change.removed_documents, *target_id)?;
                    target_cache.add_matching_keys(txn, &change.added_documents, *target_id)?;

                    if change.resume_token.is_empty() {
                        continue;
                    }
                    let new_target_data = old_target_data
                        .with_resume_token(change.resume_token.clone(), remote_version)
                        .with_sequence_number(txn.current_sequence_number());
                    if should_persist_target_data(
                        &old_target_data,
                        &new_target_data,
                        change,
                        max_resume_token_age,
                    ) {
                        target_cache.update_target_data(txn, &new_target_data)?;
                    }
                    new_target_data_by_target.insert(*target_id, new_target_data);
                }

                let updated_keys: BTreeSet<DocumentKey> =
                    remote_event.document_updates.keys().cloned().collect();
                for key in &updated_keys {
                    if remote_event.resolved_limbo_documents.contains(key) {
                        target_cache.update_sentinel(txn, key)?;
                    }
                }

                let existing_docs = remote_documents.get_entries(txn, &updated_keys)?;
                let mut changed_docs: BTreeMap<DocumentKey, Option<MaybeDocument>> = BTreeMap::new();
                for (key, doc) in &remote_event.document_updates {
                    let existing = existing_docs.get(key).and_then(Option::as_ref);
                    // Synthesized deletes at version zero mean access to
                    // the document was lost; drop it from the cache.
                    if doc.is_no_document() && doc.version().is_min() {
                        remote_documents.remove_entry(txn, key)?;
                        changed_docs.insert(key.clone(), Some(doc.clone()));
                    } else if should_overwrite(existing, doc) {
                        remote_documents.add_entry(txn, doc, remote_version)?;
                        changed_docs.insert(key.clone(), Some(doc.clone()));
                    } else {
                        log::debug!(
                            "Ignoring outdated watch update for {key}. Current version: {:?} Watch version: {}",
                            existing.map(MaybeDocument::version),
                            doc.version()
                        );
                    }
                }

                if !remote_version.is_min() {
                    let last_remote_version = target_cache.get_last_remote_snapshot_version(txn)?;
                    if remote_version < last_remote_version {
                        return Err(internal_error(format!(
                            "Watch stream reverted to previous snapshot? {remote_version} < {last_remote_version}"
                        )));
                    }
                    let sequence_number = txn.current_sequence_number();
                    target_cache.set_target_metadata(txn, sequence_number, Some(remote_version))?;
                }

                local_documents.get_local_view_of_documents(txn, changed_docs)
            })
            .await?;

        lock(&self.state).target_data_by_target = new_target_data_by_target;
        Ok(changed)
    }

    /// Records which documents entered or left views, refreshing their
    /// sequence numbers and pinning them for garbage collection. Targets
    /// whose view is in sync become limbo-free at their snapshot version.
    pub async fn notify_local_view_changes(&self, view_changes: Vec<LocalViewChanges>) -> FirestoreResult<()> {
        let target_cache = self.persistence.target_cache().clone();
        let result = self
            .persistence
            .run_transaction("notifyLocalViewChanges", TransactionMode::ReadWrite, |txn| {
                for view_change in &view_changes {
                    for key in view_change.added_keys.iter().chain(&view_change.removed_keys) {
                        target_cache.update_sentinel(txn, key)?;
                    }
                }
                Ok(())
            })
            .await;
        match result {
            Ok(()) => {}
            Err(err) if err.is_storage_transaction_failure() => {
                // Sequence numbers are only advisory; GC may collect these
                // documents a little early.
                log::debug!("Failed to update sequence numbers: {err}");
            }
            Err(err) => return Err(err),
        }

        let mut state = lock(&self.state);
        for view_change in view_changes {
            let target_id = view_change.target_id;
            state
                .local_view_references
                .add_references(&view_change.added_keys, target_id);
            state
                .local_view_references
                .remove_references(&view_change.removed_keys, target_id);
            if !view_change.from_cache {
                if let Some(target_data) = state.target_data_by_target.get(&target_id) {
                    let updated = target_data
                        .with_last_limbo_free_snapshot_version(target_data.snapshot_version);
                    state.target_data_by_target.insert(target_id, updated);
                }
            }
        }
        Ok(())
    }

    /// The first queued batch after `after_batch_id` (or the first batch
    /// overall for `None`).
    pub async fn next_mutation_batch(
        &self,
        after_batch_id: Option<BatchId>,
    ) -> FirestoreResult<Option<MutationBatch>> {
        let queue = self.mutation_queue();
        let after = after_batch_id.unwrap_or(BATCH_ID_UNKNOWN);
        self.persistence
            .run_transaction("Get next mutation batch", TransactionMode::ReadOnly, |txn| {
                queue.get_next_mutation_batch_after_batch_id(txn, after)
            })
            .await
    }

    /// The local view of `key`.
    pub async fn read_document(&self, key: &DocumentKey) -> FirestoreResult<Option<MaybeDocument>> {
        let local_documents = self.local_documents();
        self.persistence
            .run_transaction("read document", TransactionMode::ReadOnly, |txn| {
                local_documents.get_document(txn, key)
            })
            .await
    }

    /// Assigns a target id to `target`, reusing the persisted one if the
    /// target was listened to before.
    pub async fn allocate_target(&self, target: Target) -> FirestoreResult<TargetData> {
        let target_cache = self.persistence.target_cache().clone();
        let target_data = self
            .persistence
            .run_transaction("Allocate target", TransactionMode::ReadWrite, |txn| {
                if let Some(cached) = target_cache.get_target_data(txn, &target)? {
                    return Ok(cached);
                }
                let target_id = target_cache.allocate_target_id(txn)?;
                let target_data = TargetData::new(
                    target.clone(),
                    target_id,
                    TargetPurpose::Listen,
                    txn.current_sequence_number(),
                );
                target_cache.add_target_data(txn, &target_data)?;
                Ok(target_data)
            })
            .await?;

        let mut state = lock(&self.state);
        let replace = state
            .target_data_by_target
            .get(&target_data.target_id)
            .map_or(true, |cached| target_data.snapshot_version > cached.snapshot_version);
        if replace {
            state
                .target_data_by_target
                .insert(target_data.target_id, target_data.clone());
        }
        Ok(target_data)
    }

    /// Target data of an active or persisted `target`.
    pub async fn get_target_data(&self, target: &Target) -> FirestoreResult<Option<TargetData>> {
        let active = lock(&self.state)
            .target_data_by_target
            .values()
            .find(|target_data| &target_data.target == target)
            .cloned();
        if active.is_some() {
            return Ok(active);
        }
        let target_cache = self.persistence.target_cache().clone();
        self.persistence
            .run_transaction("Get target data", TransactionMode::ReadOnly, |txn| {
                target_cache.get_target_data(txn, target)
            })
            .await
    }

    /// Stops tracking `target_id` in memory. Unless the caller keeps the
    /// persisted data (secondary clients do), the target's sequence number
    /// is refreshed so GC removes it once it ages out.
    pub async fn release_target(
        &self,
        target_id: TargetId,
        keep_persisted_target_data: bool,
    ) -> FirestoreResult<()> {
        let target_data = lock(&self.state)
            .target_data_by_target
            .get(&target_id)
            .cloned()
            .ok_or_else(|| internal_error(format!("Tried to release nonexistent target: {target_id}")))?;

        let result = if keep_persisted_target_data {
            Ok(())
        } else {
            let target_cache = self.persistence.target_cache().clone();
            self.persistence
                .run_transaction("Release target", TransactionMode::ReadWritePrimary, |txn| {
                    let updated = target_data.with_sequence_number(txn.current_sequence_number());
                    target_cache.update_target_data(txn, &updated)
                })
                .await
        };

        {
            let mut state = lock(&self.state);
            state.target_data_by_target.remove(&target_id);
            state.local_view_references.remove_references_for_id(target_id);
        }

        match result {
            Err(err) if err.is_storage_transaction_failure() => {
                log::debug!("Failed to update sequence numbers for target {target_id}: {err}");
                Ok(())
            }
            other => other,
        }
    }

    /// Runs `query` against the local cache. With `use_previous_results`,
    /// the target's remote keys at its last limbo-free version seed the
    /// result.
    pub async fn execute_query(&self, query: &Query, use_previous_results: bool) -> FirestoreResult<QueryResult> {
        let target = query.to_target();
        let active = lock(&self.state)
            .target_data_by_target
            .values()
            .find(|target_data| target_data.target == target)
            .cloned();
        let local_documents = self.local_documents();
        let target_cache = self.persistence.target_cache().clone();
        let query_engine = self.query_engine.clone();

        self.persistence
            .run_transaction("Execute query", TransactionMode::ReadOnly, |txn| {
                let target_data = match active {
                    Some(target_data) => Some(target_data),
                    None => target_cache.get_target_data(txn, &target)?,
                };
                let (last_limbo_free, remote_keys) = match &target_data {
                    Some(target_data) => (
                        target_data.last_limbo_free_snapshot_version,
                        target_cache.get_matching_keys_for_target_id(txn, target_data.target_id)?,
                    ),
                    None => (SnapshotVersion::min(), BTreeSet::new()),
                };
                let documents = if use_previous_results {
                    query_engine.get_documents_matching_query(
                        txn,
                        &local_documents,
                        query,
                        last_limbo_free,
                        &remote_keys,
                    )?
                } else {
                    query_engine.get_documents_matching_query(
                        txn,
                        &local_documents,
                        query,
                        SnapshotVersion::min(),
                        &BTreeSet::new(),
                    )?
                };
                Ok(QueryResult {
                    documents,
                    remote_keys: if use_previous_results { remote_keys } else { BTreeSet::new() },
                })
            })
            .await
    }

    /// Keys the backend reported for `target_id`.
    pub async fn get_remote_document_keys(&self, target_id: TargetId) -> FirestoreResult<BTreeSet<DocumentKey>> {
        let target_cache = self.persistence.target_cache().clone();
        self.persistence
            .run_transaction("Remote document keys", TransactionMode::ReadOnly, |txn| {
                target_cache.get_matching_keys_for_target_id(txn, target_id)
            })
            .await
    }

    /// Remote documents written by any client since the last call. Lets a
    /// secondary client pick up the primary's watch updates.
    pub async fn get_new_document_changes(&self) -> FirestoreResult<BTreeMap<DocumentKey, MaybeDocument>> {
        let since = lock(&self.state).last_document_change_read_time;
        let remote_documents = self.persistence.remote_document_cache().clone();
        let (changes, read_time) = self
            .persistence
            .run_transaction("Get new document changes", TransactionMode::ReadOnly, |txn| {
                remote_documents.get_new_document_changes(txn, since)
            })
            .await?;
        let mut state = lock(&self.state);
        state.last_document_change_read_time = state.last_document_change_read_time.max(read_time);
        Ok(changes)
    }

    /// Local views of the documents a batch written by another client
    /// touched, or `None` if the batch is already gone.
    pub async fn lookup_mutation_documents(
        &self,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<BTreeMap<DocumentKey, MaybeDocument>>> {
        let queue = self.mutation_queue();
        let local_documents = self.local_documents();
        self.persistence
            .run_transaction("Lookup mutation documents", TransactionMode::ReadOnly, |txn| {
                match queue.lookup_mutation_batch(txn, batch_id)? {
                    Some(batch) => Ok(Some(local_documents.get_documents(txn, &batch.keys())?)),
                    None => Ok(None),
                }
            })
            .await
    }

    /// The target behind `target_id`, for targets another client allocated.
    pub async fn get_cached_target(&self, target_id: TargetId) -> FirestoreResult<Option<Target>> {
        let active = lock(&self.state)
            .target_data_by_target
            .get(&target_id)
            .map(|target_data| target_data.target.clone());
        if active.is_some() {
            return Ok(active);
        }
        let target_cache = self.persistence.target_cache().clone();
        self.persistence
            .run_transaction("Get cached target", TransactionMode::ReadOnly, |txn| {
                Ok(target_cache
                    .get_target_data_for_target_id(txn, target_id)?
                    .map(|target_data| target_data.target))
            })
            .await
    }

    /// Runs a garbage collection pass over targets no view listens to.
    pub async fn collect_garbage(&self) -> FirestoreResult<LruResults> {
        let (active_target_ids, pins) = {
            let state = lock(&self.state);
            let active: BTreeSet<TargetId> = state.target_data_by_target.keys().copied().collect();
            (active, state.local_view_references.clone())
        };
        let garbage_collector = self.garbage_collector.clone();
        let results = self
            .persistence
            .run_transaction("Collect garbage", TransactionMode::ReadWritePrimary, |txn| {
                garbage_collector.collect(txn, &active_target_ids, &pins)
            })
            .await?;
        if results.did_run {
            log::debug!(
                "Garbage collection removed {} targets and {} documents",
                results.targets_removed,
                results.documents_removed
            );
        }
        Ok(results)
    }

    /// Active target ids, for tests and shared client state.
    pub fn active_target_ids(&self) -> BTreeSet<TargetId> {
        lock(&self.state).target_data_by_target.keys().copied().collect()
    }

    #[cfg(test)]
    fn active_target_data(&self, target_id: TargetId) -> Option<TargetData> {
        lock(&self.state).target_data_by_target.get(&target_id).cloned()
    }
}

/// Newer versions win. An equal version may replace a document with
/// pending writes: that is the backend catching up with a write this client
/// committed.
fn should_overwrite(existing: Option<&MaybeDocument>, incoming: &MaybeDocument) -> bool {
    match existing {
        None => true,
        Some(existing) => {
            incoming.version() > existing.version()
                || (incoming.version() == existing.version() && existing.has_pending_writes())
        }
    }
}

/// Resume tokens are persisted when a target had none, when the stored one
/// is older than `max_age_micros`, or when documents changed. Otherwise the
/// in-memory copy suffices.
fn should_persist_target_data(
    old_target_data: &TargetData,
    new_target_data: &TargetData,
    change: &TargetChange,
    max_age_micros: i64,
) -> bool {
    if new_target_data.resume_token.is_empty() {
        return false;
    }
    if old_target_data.resume_token.is_empty() {
        return true;
    }
    let time_delta = new_target_data.snapshot_version.to_micros()
        - old_target_data.snapshot_version.to_micros();
    if time_delta >= max_age_micros {
        log::debug!(
            "Persisting resume token for target {} after {time_delta}us",
            new_target_data.target_id
        );
        return true;
    }
    change.change_count() > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::async_queue::AsyncQueue;
    use crate::firestore::core::target::OrderBy;
    use crate::firestore::model::{DatabaseId, MutationResult};
    use crate::firestore::settings::ClientConfig;
    use crate::firestore::test_support::{deleted, doc, field, filter, key, map, query, version};
    use crate::firestore::value::FirestoreValue;

    async fn local_store(name: &str) -> Arc<LocalStore> {
        let config = ClientConfig::new(DatabaseId::new("p", "(default)"), name);
        let persistence = Persistence::new(&config, AsyncQueue::new());
        persistence.start().await.unwrap();
        let store = LocalStore::new(persistence, User::new("alice"));
        store.start().await.unwrap();
        store
    }

    fn event(
        snapshot: i64,
        target_id: TargetId,
        resume_token: &[u8],
        added: &[MaybeDocument],
        removed: &[&str],
    ) -> RemoteEvent {
        let mut change = TargetChange {
            resume_token: resume_token.to_vec(),
            current: true,
            ..TargetChange::default()
        };
        let mut document_updates = BTreeMap::new();
        for doc in added {
            change.added_documents.insert(doc.key().clone());
            document_updates.insert(doc.key().clone(), doc.clone());
        }
        for path in removed {
            change.removed_documents.insert(key(path));
        }
        RemoteEvent {
            snapshot_version: version(snapshot),
            target_changes: [(target_id, change)].into_iter().collect(),
            target_mismatches: BTreeSet::new(),
            document_updates,
            resolved_limbo_documents: BTreeSet::new(),
        }
    }

    fn ack(batch: MutationBatch, commit: i64) -> MutationBatchResult {
        let results = batch
            .mutations
            .iter()
            .map(|_| MutationResult::new(version(commit), None))
            .collect();
        MutationBatchResult::from(batch, version(commit), results, b"token".to_vec()).unwrap()
    }

    #[tokio::test]
    async fn optimistic_writes_are_visible_before_ack() {
        let store = local_store("local-store-optimistic").await;
        let result = store
            .write_locally(vec![Mutation::set(key("rooms/a"), map(&[("n", 1i64.into())]))])
            .await
            .unwrap();
        assert_eq!(result.batch_id, 1);
        assert!(result.changes[&key("rooms/a")].has_pending_writes());

        let read = store.read_document(&key("rooms/a")).await.unwrap().unwrap();
        assert!(read.has_pending_writes());
        assert_eq!(
            read.as_document().unwrap().field(&field("n")),
            Some(&FirestoreValue::from(1i64))
        );
        assert_eq!(store.get_highest_unacknowledged_batch_id().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn acknowledged_writes_reach_the_remote_cache() {
        let store = local_store("local-store-ack").await;
        store
            .write_locally(vec![Mutation::set(key("rooms/a"), map(&[("n", 1i64.into())]))])
            .await
            .unwrap();
        let batch = store.next_mutation_batch(None).await.unwrap().unwrap();

        let changes = store.acknowledge_batch(ack(batch, 5)).await.unwrap();
        let doc = &changes[&key("rooms/a")];
        assert_eq!(doc.version(), version(5));
        assert!(doc.has_committed_mutations());
        assert_eq!(store.next_mutation_batch(None).await.unwrap(), None);
        assert_eq!(store.get_last_stream_token().await.unwrap(), b"token".to_vec());
        assert_eq!(
            store.get_highest_unacknowledged_batch_id().await.unwrap(),
            BATCH_ID_UNKNOWN
        );
    }

    #[tokio::test]
    async fn rejected_writes_are_rolled_back() {
        let store = local_store("local-store-reject").await;
        let result = store
            .write_locally(vec![Mutation::set(key("rooms/a"), map(&[("n", 1i64.into())]))])
            .await
            .unwrap();
        let changes = store.reject_batch(result.batch_id).await.unwrap();
        assert!(changes[&key("rooms/a")].is_no_document());
        assert!(store.reject_batch(result.batch_id).await.is_err());
    }

    #[tokio::test]
    async fn remote_events_never_regress_versions() {
        let store = local_store("local-store-versions").await;
        let target_data = store.allocate_target(query("rooms").to_target()).await.unwrap();
        let id = target_data.target_id;

        store
            .apply_remote_event(event(10, id, b"t1", &[doc("rooms/a", 10, &[("n", 2i64.into())]).into()], &[]))
            .await
            .unwrap();
        let changes = store
            .apply_remote_event(event(11, id, b"t2", &[doc("rooms/a", 5, &[("n", 1i64.into())]).into()], &[]))
            .await
            .unwrap();
        assert!(changes.is_empty());
        let read = store.read_document(&key("rooms/a")).await.unwrap().unwrap();
        assert_eq!(read.version(), version(10));
        assert_eq!(store.get_last_remote_snapshot_version().await.unwrap(), version(11));
        assert_eq!(
            store.get_remote_document_keys(id).await.unwrap(),
            [key("rooms/a")].into_iter().collect()
        );
    }

    #[tokio::test]
    async fn equal_versions_replace_documents_with_pending_writes() {
        assert!(should_overwrite(
            Some(&doc("rooms/a", 5, &[]).with_local_mutations().into()),
            &doc("rooms/a", 5, &[]).into()
        ));
        assert!(!should_overwrite(
            Some(&doc("rooms/a", 5, &[]).into()),
            &doc("rooms/a", 5, &[]).into()
        ));
        assert!(should_overwrite(None, &deleted("rooms/a", 1)));
    }

    #[tokio::test]
    async fn resume_tokens_persist_on_changes_or_age() {
        let store = local_store("local-store-resume").await;
        let target = query("rooms").to_target();
        let id = store.allocate_target(target.clone()).await.unwrap().target_id;

        // First token is always persisted.
        store.apply_remote_event(event(10, id, b"t1", &[], &[])).await.unwrap();
        // No changes and young: memory only.
        store.apply_remote_event(event(20, id, b"t2", &[], &[])).await.unwrap();

        let persisted = store
            .persistence()
            .run_transaction("read", TransactionMode::ReadOnly, |txn| {
                store.persistence().target_cache().get_target_data_for_target_id(txn, id)
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(persisted.resume_token, b"t1".to_vec());
        assert_eq!(store.active_target_data(id).unwrap().resume_token, b"t2".to_vec());

        let old = TargetData::new(target.clone(), id, TargetPurpose::Listen, 1)
            .with_resume_token(b"a".to_vec(), version(0));
        let aged = old.with_resume_token(b"b".to_vec(), version(5 * 60 * 1_000_000));
        assert!(should_persist_target_data(&old, &aged, &TargetChange::default(), 5 * 60 * 1_000_000));
    }

    #[tokio::test]
    async fn allocate_target_reuses_persisted_targets() {
        let store = local_store("local-store-allocate").await;
        let first = store.allocate_target(query("rooms").to_target()).await.unwrap();
        let other = store.allocate_target(query("users").to_target()).await.unwrap();
        assert_eq!(first.target_id, 2);
        assert_eq!(other.target_id, 4);

        store.release_target(first.target_id, false).await.unwrap();
        assert!(!store.active_target_ids().contains(&first.target_id));
        let again = store.allocate_target(query("rooms").to_target()).await.unwrap();
        assert_eq!(again.target_id, first.target_id);
        assert_eq!(
            store.get_cached_target(other.target_id).await.unwrap(),
            Some(query("users").to_target())
        );
    }

    #[tokio::test]
    async fn queries_combine_remote_documents_and_local_writes() {
        let store = local_store("local-store-query").await;
        let q = query("rooms")
            .with_filter(filter("n", ">", 0i64.into()))
            .with_order_by(OrderBy::ascending(field("n")));
        let id = store.allocate_target(q.to_target()).await.unwrap().target_id;
        store
            .apply_remote_event(event(10, id, b"t", &[doc("rooms/a", 10, &[("n", 1i64.into())]).into()], &[]))
            .await
            .unwrap();
        store
            .write_locally(vec![Mutation::set(key("rooms/b"), map(&[("n", 2i64.into())]))])
            .await
            .unwrap();

        let result = store.execute_query(&q, true).await.unwrap();
        assert_eq!(
            result.documents.keys().cloned().collect::<Vec<_>>(),
            vec![key("rooms/a"), key("rooms/b")]
        );
        assert_eq!(result.remote_keys, [key("rooms/a")].into_iter().collect());
    }

    #[tokio::test]
    async fn in_sync_views_mark_targets_limbo_free() {
        let store = local_store("local-store-limbo-free").await;
        let id = store.allocate_target(query("rooms").to_target()).await.unwrap().target_id;
        store.apply_remote_event(event(10, id, b"t", &[], &[])).await.unwrap();
        store
            .notify_local_view_changes(vec![LocalViewChanges {
                target_id: id,
                from_cache: false,
                added_keys: [key("rooms/a")].into_iter().collect(),
                removed_keys: BTreeSet::new(),
            }])
            .await
            .unwrap();
        assert_eq!(
            store.active_target_data(id).unwrap().last_limbo_free_snapshot_version,
            version(10)
        );
    }

    #[tokio::test]
    async fn user_change_switches_mutation_queues() {
        let store = local_store("local-store-user").await;
        store
            .write_locally(vec![Mutation::set(key("rooms/a"), map(&[]))])
            .await
            .unwrap();
        let result = store.handle_user_change(User::new("bob")).await.unwrap();
        assert_eq!(result.removed_batch_ids, vec![1]);
        assert!(result.added_batch_ids.is_empty());
        assert!(result.affected_documents[&key("rooms/a")].is_no_document());
        assert_eq!(store.current_user(), User::new("bob"));

        let back = store.handle_user_change(User::new("alice")).await.unwrap();
        assert_eq!(back.added_batch_ids, vec![1]);
        assert!(back.affected_documents[&key("rooms/a")].has_pending_writes());
    }

    #[tokio::test]
    async fn secondary_helpers_read_shared_state() {
        let store = local_store("local-store-secondary").await;
        let write = store
            .write_locally(vec![Mutation::set(key("rooms/a"), map(&[]))])
            .await
            .unwrap();
        let docs = store.lookup_mutation_documents(write.batch_id).await.unwrap().unwrap();
        assert!(docs.contains_key(&key("rooms/a")));
        assert_eq!(store.lookup_mutation_documents(99).await.unwrap(), None);

        let id = store.allocate_target(query("rooms").to_target()).await.unwrap().target_id;
        store
            .apply_remote_event(event(10, id, b"t", &[doc("rooms/b", 10, &[]).into()], &[]))
            .await
            .unwrap();
        let changes = store.get_new_document_changes().await.unwrap();
        assert!(changes.contains_key(&key("rooms/b")));
        assert!(store.get_new_document_changes().await.unwrap().is_empty());
    }
}

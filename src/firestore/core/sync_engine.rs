use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use futures::channel::oneshot;

use crate::firestore::core::event_manager::QueryTargetHandler;
use crate::firestore::core::listen_sequence::ListenSequence;
use crate::firestore::core::query::Query;
use crate::firestore::core::target::Target;
use crate::firestore::core::target_id_generator::TargetIdGenerator;
use crate::firestore::core::types::{BatchId, OnlineState, OnlineStateSource, TargetId};
use crate::firestore::core::view::{LimboChangeType, LimboDocumentChange, View, ViewChange};
use crate::firestore::core::view_snapshot::ViewSnapshot;
use crate::firestore::error::{
    cancelled, internal_error, FirestoreError, FirestoreErrorCode, FirestoreResult,
};
use crate::firestore::local::local_store::{LocalStore, LocalViewChanges};
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::shared_client_state::{
    MutationBatchState, QueryTargetState, SharedClientState, SharedClientStateSyncer,
};
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{
    DocumentKey, MaybeDocument, Mutation, MutationBatch, MutationBatchResult, NoDocument,
    SnapshotVersion, User, BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::remote_store::RemoteStore;
use crate::firestore::remote::remote_syncer::{
    box_remote_store_future, RemoteStoreFuture, RemoteSyncer,
};
use crate::firestore::settings::SyncSettings;

/// Receives what the sync engine raises for user-facing listeners.
pub trait SyncEngineListener: Send + Sync {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>);

    /// The query failed permanently and is no longer tracked.
    fn on_watch_error(&self, query: &Query, error: FirestoreError);

    fn on_online_state_change(&self, online_state: OnlineState);
}

/// Resolves once the backend accepted or rejected a write.
pub type WriteReceiver = oneshot::Receiver<FirestoreResult<()>>;
type WriteSender = oneshot::Sender<FirestoreResult<()>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Storage failures caused by another client taking the primary lease are
/// expected; the lease change notification repairs state on its own.
fn ignore_if_primary_lease_loss(error: FirestoreError) -> FirestoreResult<()> {
    if error.is_primary_lease_lost() {
        log::debug!("Unexpectedly lost primary lease");
        Ok(())
    } else {
        Err(error)
    }
}

/// Transient storage failures reach the user as `Unavailable`.
fn wrap_in_user_error_if_recoverable(error: FirestoreError, message: &str) -> FirestoreError {
    if error.is_storage_transaction_failure() {
        FirestoreError::new(FirestoreErrorCode::Unavailable, format!("{message}: {error}"))
    } else {
        error
    }
}

struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

struct LimboResolution {
    key: DocumentKey,
    /// Whether the limbo target already reported the document. Decides what
    /// the watch aggregator treats as an existing document.
    received_document: bool,
}

/// Remote store calls decided while the state lock was held.
#[derive(Default)]
struct RemoteActions {
    listens: Vec<TargetData>,
    unlistens: Vec<TargetId>,
}

struct SyncEngineState {
    current_user: User,
    /// `None` until the first primary state notification.
    is_primary: Option<bool>,
    online_state: OnlineState,
    /// Keyed by canonical query id.
    query_views: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<Query>>,
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    /// Which views keep each limbo document alive.
    limbo_document_refs: ReferenceSet,
    limbo_target_id_generator: TargetIdGenerator,
    max_concurrent_limbo_resolutions: usize,
    mutation_user_callbacks: BTreeMap<String, BTreeMap<BatchId, WriteSender>>,
    pending_writes_callbacks: BTreeMap<BatchId, Vec<WriteSender>>,
}

impl SyncEngineState {
    fn is_primary(&self) -> bool {
        self.is_primary == Some(true)
    }

    fn update_tracked_limbos(
        &mut self,
        target_id: TargetId,
        limbo_changes: Vec<LimboDocumentChange>,
        actions: &mut RemoteActions,
    ) {
        for change in limbo_changes {
            match change.change_type {
                LimboChangeType::Added => {
                    self.limbo_document_refs.add_reference(&change.key, target_id);
                    self.track_limbo_change(change.key, actions);
                }
                LimboChangeType::Removed => {
                    log::debug!("Document no longer in limbo: {}", change.key);
                    self.limbo_document_refs.remove_reference(&change.key, target_id);
                    if !self.limbo_document_refs.contains_key(&change.key) {
                        self.remove_limbo_target(&change.key, actions);
                    }
                }
            }
        }
    }

    fn track_limbo_change(&mut self, key: DocumentKey, actions: &mut RemoteActions) {
        if self.active_limbo_targets_by_key.contains_key(&key)
            || self.enqueued_limbo_resolutions.contains(&key)
        {
            return;
        }
        log::debug!("New document in limbo: {key}");
        self.enqueued_limbo_resolutions.push_back(key);
        self.pump_enqueued_limbo_resolutions(actions);
    }

    /// Starts listens for enqueued limbo documents while fewer than the
    /// configured number of resolutions are in flight.
    fn pump_enqueued_limbo_resolutions(&mut self, actions: &mut RemoteActions) {
        while self.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = self.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let limbo_target_id = self.limbo_target_id_generator.next();
            log::debug!("Resolving limbo document {key} with target {limbo_target_id}");
            self.active_limbo_resolutions_by_target.insert(
                limbo_target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            actions.listens.push(TargetData::new(
                Target::for_document(&key),
                limbo_target_id,
                TargetPurpose::LimboResolution,
                ListenSequence::INVALID,
            ));
            self.active_limbo_targets_by_key.insert(key, limbo_target_id);
        }
    }

    fn remove_limbo_target(&mut self, key: &DocumentKey, actions: &mut RemoteActions) {
        self.enqueued_limbo_resolutions.retain(|enqueued| enqueued != key);
        // The target is already gone if its listen was rejected.
        let Some(limbo_target_id) = self.active_limbo_targets_by_key.remove(key) else {
            return;
        };
        actions.unlistens.push(limbo_target_id);
        self.active_limbo_resolutions_by_target.remove(&limbo_target_id);
        self.pump_enqueued_limbo_resolutions(actions);
    }

    /// Drops every limbo resolution and returns the targets to unlisten.
    fn reset_limbo_documents(&mut self) -> Vec<TargetId> {
        let target_ids = self
            .active_limbo_resolutions_by_target
            .keys()
            .copied()
            .collect();
        self.limbo_document_refs.remove_all_references();
        self.active_limbo_resolutions_by_target.clear();
        self.active_limbo_targets_by_key.clear();
        target_ids
    }

    fn add_mutation_callback(&mut self, batch_id: BatchId, sender: WriteSender) {
        self.mutation_user_callbacks
            .entry(self.current_user.to_key())
            .or_default()
            .insert(batch_id, sender);
    }

    fn take_mutation_callback(&mut self, batch_id: BatchId) -> Option<WriteSender> {
        // Batches restored from persistence have no callback.
        self.mutation_user_callbacks
            .get_mut(&self.current_user.to_key())
            .and_then(|callbacks| callbacks.remove(&batch_id))
    }
}

/// Coordinates the local store, the remote store and the views of active
/// queries.
///
/// Every method runs on the client's async queue. The state lock is only
/// held between suspension points, never across an `.await`.
pub struct SyncEngine {
    local_store: Arc<LocalStore>,
    remote_store: RemoteStore,
    shared_client_state: Arc<dyn SharedClientState>,
    state: Mutex<SyncEngineState>,
    listener: Mutex<Option<Weak<dyn SyncEngineListener>>>,
}

impl SyncEngine {
    pub fn new(
        local_store: Arc<LocalStore>,
        remote_store: RemoteStore,
        shared_client_state: Arc<dyn SharedClientState>,
        settings: &SyncSettings,
    ) -> Arc<Self> {
        let current_user = local_store.current_user();
        Arc::new(Self {
            local_store,
            remote_store,
            shared_client_state,
            state: Mutex::new(SyncEngineState {
                current_user,
                is_primary: None,
                online_state: OnlineState::Unknown,
                query_views: BTreeMap::new(),
                queries_by_target: BTreeMap::new(),
                enqueued_limbo_resolutions: VecDeque::new(),
                active_limbo_targets_by_key: BTreeMap::new(),
                active_limbo_resolutions_by_target: BTreeMap::new(),
                limbo_document_refs: ReferenceSet::new(),
                limbo_target_id_generator: TargetIdGenerator::for_sync_engine(),
                max_concurrent_limbo_resolutions: settings.max_concurrent_limbo_resolutions,
                mutation_user_callbacks: BTreeMap::new(),
                pending_writes_callbacks: BTreeMap::new(),
            }),
            listener: Mutex::new(None),
        })
    }

    pub fn set_listener(&self, listener: Weak<dyn SyncEngineListener>) {
        *lock(&self.listener) = Some(listener);
    }

    pub fn is_primary_client(&self) -> bool {
        lock(&self.state).is_primary()
    }

    pub fn current_user(&self) -> User {
        lock(&self.state).current_user.clone()
    }

    pub fn online_state(&self) -> OnlineState {
        lock(&self.state).online_state
    }

    /// Limbo documents with a listen in flight, and the target resolving
    /// each.
    pub fn active_limbo_document_resolutions(&self) -> BTreeMap<DocumentKey, TargetId> {
        lock(&self.state).active_limbo_targets_by_key.clone()
    }

    /// Limbo documents waiting for a free resolution slot, in order.
    pub fn enqueued_limbo_document_resolutions(&self) -> Vec<DocumentKey> {
        lock(&self.state)
            .enqueued_limbo_resolutions
            .iter()
            .cloned()
            .collect()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SyncEngineState) -> R) -> R {
        f(&mut lock(&self.state))
    }

    fn listener(&self) -> Option<Arc<dyn SyncEngineListener>> {
        lock(&self.listener).as_ref().and_then(Weak::upgrade)
    }

    fn raise_snapshots(&self, snapshots: Vec<ViewSnapshot>) {
        if snapshots.is_empty() {
            return;
        }
        if let Some(listener) = self.listener() {
            listener.on_watch_change(snapshots);
        }
    }

    async fn run_remote_actions(&self, actions: RemoteActions) {
        for target_id in actions.unlistens {
            self.remote_store.unlisten(target_id).await;
        }
        for target_data in actions.listens {
            self.remote_store.listen(target_data).await;
        }
    }

    /// Starts tracking `query` and returns its first snapshot. The primary
    /// client also starts watching the target.
    pub async fn listen(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        let canonical_id = query.canonical_id();
        let existing = self.with_state(|state| {
            state
                .query_views
                .get(&canonical_id)
                .map(|query_view| (query_view.target_id, query_view.view.compute_initial_snapshot()))
        });
        if let Some((target_id, snapshot)) = existing {
            // A primary that already listens for another client's query.
            self.shared_client_state.add_local_query_target(target_id);
            return Ok(snapshot);
        }

        let target_data = self.local_store.allocate_target(query.to_target()).await?;
        let status = self
            .shared_client_state
            .add_local_query_target(target_data.target_id);
        let snapshot = self
            .initialize_view_and_compute_snapshot(
                query,
                target_data.target_id,
                status == QueryTargetState::Current,
            )
            .await?;
        if self.is_primary_client() {
            self.remote_store.listen(target_data).await;
        }
        Ok(snapshot)
    }

    async fn initialize_view_and_compute_snapshot(
        &self,
        query: Query,
        target_id: TargetId,
        current: bool,
    ) -> FirestoreResult<ViewSnapshot> {
        let query_result = self.local_store.execute_query(&query, true).await?;
        let (snapshot, actions) = self.with_state(|state| {
            let mut view = View::new(query.clone(), query_result.remote_keys);
            let documents = query_result
                .documents
                .into_iter()
                .map(|(key, doc)| (key, MaybeDocument::from(doc)))
                .collect();
            let doc_changes = view.compute_doc_changes(&documents, None);
            let synthesized_change = TargetChange::synthesized_for_current_change(
                current && state.online_state != OnlineState::Offline,
            );
            let view_change =
                view.apply_changes(doc_changes, state.is_primary(), Some(&synthesized_change));
            let mut actions = RemoteActions::default();
            state.update_tracked_limbos(target_id, view_change.limbo_changes, &mut actions);

            state.query_views.insert(
                query.canonical_id(),
                QueryView {
                    query: query.clone(),
                    target_id,
                    view,
                },
            );
            state.queries_by_target.entry(target_id).or_default().push(query);
            (view_change.snapshot, actions)
        });
        self.run_remote_actions(actions).await;
        snapshot.ok_or_else(|| internal_error("a new view must raise a snapshot"))
    }

    /// Stops tracking `query`. The target is released once no query of any
    /// client needs it.
    pub async fn unlisten(&self, query: Query) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let released = self.with_state(|state| {
            let target_id = state.query_views.get(&canonical_id)?.target_id;
            let queries = state.queries_by_target.entry(target_id).or_default();
            if queries.len() > 1 {
                queries.retain(|existing| existing.canonical_id() != canonical_id);
                state.query_views.remove(&canonical_id);
                return None;
            }
            Some((target_id, state.is_primary()))
        });
        let Some((target_id, is_primary)) = released else {
            return Ok(());
        };

        if is_primary {
            // Drop our interest first so the check sees only other clients.
            self.shared_client_state.remove_local_query_target(target_id);
            if self.shared_client_state.is_active_query_target(target_id) {
                return Ok(());
            }
            match self.local_store.release_target(target_id, false).await {
                Ok(()) => {
                    self.shared_client_state.clear_query_state(target_id);
                    self.remote_store.unlisten(target_id).await;
                    self.remove_and_cleanup_target(target_id, None).await;
                    Ok(())
                }
                Err(err) => ignore_if_primary_lease_loss(err),
            }
        } else {
            self.remove_and_cleanup_target(target_id, None).await;
            self.local_store.release_target(target_id, true).await
        }
    }

    async fn remove_and_cleanup_target(&self, target_id: TargetId, error: Option<FirestoreError>) {
        self.shared_client_state.remove_local_query_target(target_id);
        let (queries, actions) = self.with_state(|state| {
            let queries = state.queries_by_target.remove(&target_id).unwrap_or_default();
            for query in &queries {
                state.query_views.remove(&query.canonical_id());
            }
            let mut actions = RemoteActions::default();
            if state.is_primary() {
                for key in state.limbo_document_refs.remove_references_for_id(target_id) {
                    if !state.limbo_document_refs.contains_key(&key) {
                        state.remove_limbo_target(&key, &mut actions);
                    }
                }
            }
            (queries, actions)
        });

        if let (Some(error), Some(listener)) = (error, self.listener()) {
            for query in &queries {
                listener.on_watch_error(query, error.clone());
            }
        }
        self.run_remote_actions(actions).await;
    }

    /// Persists `mutations` as a batch, raises the latency compensated
    /// snapshots and hands the batch to the write pipeline. The returned
    /// receiver resolves when the backend acknowledges or rejects it.
    pub async fn write(&self, mutations: Vec<Mutation>) -> WriteReceiver {
        let (sender, receiver) = oneshot::channel();
        let result = match self.local_store.write_locally(mutations).await {
            Ok(result) => result,
            Err(err) => {
                let _ = sender.send(Err(wrap_in_user_error_if_recoverable(
                    err,
                    "Failed to persist write",
                )));
                return receiver;
            }
        };

        self.shared_client_state.add_pending_mutation(result.batch_id);
        self.with_state(|state| state.add_mutation_callback(result.batch_id, sender));
        if let Err(err) = self.emit_new_snaps_and_notify_local_store(result.changes, None).await {
            log::warn!("Failed to raise snapshots for batch {}: {err}", result.batch_id);
        }
        self.remote_store.fill_write_pipeline().await;
        receiver
    }

    /// Resolves once every write pending right now was acknowledged or
    /// rejected.
    pub async fn register_pending_writes_callback(&self) -> WriteReceiver {
        let (sender, receiver) = oneshot::channel();
        if !self.remote_store.can_use_network() {
            log::debug!(
                "The network is disabled. The task returned by 'waitForPendingWrites()' will not complete until the network is enabled."
            );
        }
        match self.local_store.get_highest_unacknowledged_batch_id().await {
            Ok(BATCH_ID_UNKNOWN) => {
                let _ = sender.send(Ok(()));
            }
            Ok(highest_batch_id) => self.with_state(|state| {
                state
                    .pending_writes_callbacks
                    .entry(highest_batch_id)
                    .or_default()
                    .push(sender)
            }),
            Err(err) => {
                let _ = sender.send(Err(wrap_in_user_error_if_recoverable(
                    err,
                    "Initialization of waitForPendingWrites() operation failed",
                )));
            }
        }
        receiver
    }

    fn process_user_callback(&self, batch_id: BatchId, error: Option<FirestoreError>) {
        if let Some(sender) = self.with_state(|state| state.take_mutation_callback(batch_id)) {
            let _ = sender.send(error.map_or(Ok(()), Err));
        }
    }

    fn trigger_pending_writes_callbacks(&self, batch_id: BatchId) {
        let senders = self.with_state(|state| state.pending_writes_callbacks.remove(&batch_id));
        for sender in senders.into_iter().flatten() {
            let _ = sender.send(Ok(()));
        }
    }

    fn reject_outstanding_pending_writes_callbacks(&self, message: &str) {
        let callbacks = self.with_state(|state| std::mem::take(&mut state.pending_writes_callbacks));
        for sender in callbacks.into_values().flatten() {
            let _ = sender.send(Err(cancelled(message)));
        }
    }

    /// Runs `changes` through every view, raises the resulting snapshots
    /// and records which documents entered or left views.
    async fn emit_new_snaps_and_notify_local_store(
        &self,
        changes: BTreeMap<DocumentKey, MaybeDocument>,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<()> {
        let canonical_ids: Vec<String> =
            self.with_state(|state| state.query_views.keys().cloned().collect());
        if canonical_ids.is_empty() {
            return Ok(());
        }

        let mut new_snapshots = Vec::new();
        let mut view_changes = Vec::new();
        for canonical_id in canonical_ids {
            let computed = self.with_state(|state| {
                state.query_views.get(&canonical_id).map(|query_view| {
                    (
                        query_view.query.clone(),
                        query_view.target_id,
                        query_view.view.compute_doc_changes(&changes, None),
                    )
                })
            });
            let Some((query, target_id, mut doc_changes)) = computed else {
                continue;
            };

            if doc_changes.needs_refill {
                // A limit query lost documents; rerun it so documents past
                // the old limit can move in.
                let documents: BTreeMap<DocumentKey, MaybeDocument> = self
                    .local_store
                    .execute_query(&query, false)
                    .await?
                    .documents
                    .into_iter()
                    .map(|(key, doc)| (key, MaybeDocument::from(doc)))
                    .collect();
                let refilled = self.with_state(|state| {
                    state.query_views.get(&canonical_id).map(|query_view| {
                        query_view
                            .view
                            .compute_doc_changes(&documents, Some(&doc_changes))
                    })
                });
                match refilled {
                    Some(refilled) => doc_changes = refilled,
                    None => continue,
                }
            }

            let target_change =
                remote_event.and_then(|event| event.target_changes.get(&target_id));
            let applied = self.with_state(|state| {
                let is_primary = state.is_primary();
                let query_view = state.query_views.get_mut(&canonical_id)?;
                let view_change = query_view
                    .view
                    .apply_changes(doc_changes, is_primary, target_change);
                let mut actions = RemoteActions::default();
                state.update_tracked_limbos(target_id, view_change.limbo_changes, &mut actions);
                Some((view_change.snapshot, is_primary, actions))
            });
            let Some((snapshot, is_primary, actions)) = applied else {
                continue;
            };
            self.run_remote_actions(actions).await;

            if (snapshot.is_some() || remote_event.is_some()) && is_primary {
                let query_state = if snapshot.as_ref().is_some_and(|snapshot| snapshot.from_cache) {
                    QueryTargetState::NotCurrent
                } else {
                    QueryTargetState::Current
                };
                self.shared_client_state
                    .update_query_state(target_id, query_state, None);
            }
            if let Some(snapshot) = snapshot {
                view_changes.push(LocalViewChanges::from_snapshot(target_id, &snapshot));
                new_snapshots.push(snapshot);
            }
        }

        self.raise_snapshots(new_snapshots);
        self.local_store.notify_local_view_changes(view_changes).await
    }

    async fn apply_remote_event_internal(&self, remote_event: RemoteEvent) -> FirestoreResult<()> {
        let result = async {
            let changes = self.local_store.apply_remote_event(remote_event.clone()).await?;
            self.with_state(|state| {
                for (target_id, change) in &remote_event.target_changes {
                    let Some(resolution) = state.active_limbo_resolutions_by_target.get_mut(target_id)
                    else {
                        continue;
                    };
                    // A limbo target reports a single document.
                    if !change.added_documents.is_empty() {
                        resolution.received_document = true;
                    } else if !change.removed_documents.is_empty() {
                        resolution.received_document = false;
                    }
                }
            });
            self.emit_new_snaps_and_notify_local_store(changes, Some(&remote_event))
                .await
        }
        .await;
        result.or_else(ignore_if_primary_lease_loss)
    }

    async fn reject_listen_internal(
        &self,
        target_id: TargetId,
        error: FirestoreError,
    ) -> FirestoreResult<()> {
        self.shared_client_state
            .update_query_state(target_id, QueryTargetState::Rejected, Some(&error));

        let limbo_key = self.with_state(|state| {
            state
                .active_limbo_resolutions_by_target
                .get(&target_id)
                .map(|resolution| resolution.key.clone())
        });
        let Some(limbo_key) = limbo_key else {
            return match self.local_store.release_target(target_id, false).await {
                Ok(()) => {
                    self.remove_and_cleanup_target(target_id, Some(error)).await;
                    Ok(())
                }
                Err(err) => ignore_if_primary_lease_loss(err),
            };
        };

        // The limbo document is unreadable; treat it as deleted at version
        // zero so the local store drops it.
        let event = RemoteEvent {
            snapshot_version: SnapshotVersion::min(),
            target_changes: BTreeMap::new(),
            target_mismatches: BTreeSet::new(),
            document_updates: [(
                limbo_key.clone(),
                MaybeDocument::from(NoDocument::new(limbo_key.clone(), SnapshotVersion::min())),
            )]
            .into_iter()
            .collect(),
            resolved_limbo_documents: [limbo_key.clone()].into_iter().collect(),
        };
        self.apply_remote_event_internal(event).await?;

        // Bookkeeping goes only after the event applied, so a failure
        // re-triggers the rejection on the next watch stream.
        let actions = self.with_state(|state| {
            state.active_limbo_targets_by_key.remove(&limbo_key);
            state.active_limbo_resolutions_by_target.remove(&target_id);
            let mut actions = RemoteActions::default();
            state.pump_enqueued_limbo_resolutions(&mut actions);
            actions
        });
        self.run_remote_actions(actions).await;
        Ok(())
    }

    async fn apply_successful_write_internal(
        &self,
        batch_result: MutationBatchResult,
    ) -> FirestoreResult<()> {
        let batch_id = batch_result.batch.batch_id;
        let result = async {
            let changes = self.local_store.acknowledge_batch(batch_result).await?;
            // User callbacks go before listen events.
            self.process_user_callback(batch_id, None);
            self.trigger_pending_writes_callbacks(batch_id);
            self.shared_client_state
                .update_mutation_state(batch_id, MutationBatchState::Acknowledged, None);
            self.emit_new_snaps_and_notify_local_store(changes, None).await
        }
        .await;
        result.or_else(ignore_if_primary_lease_loss)
    }

    async fn reject_failed_write_internal(
        &self,
        batch_id: BatchId,
        error: FirestoreError,
    ) -> FirestoreResult<()> {
        let result = async {
            let changes = self.local_store.reject_batch(batch_id).await?;
            self.process_user_callback(batch_id, Some(error.clone()));
            self.trigger_pending_writes_callbacks(batch_id);
            self.shared_client_state.update_mutation_state(
                batch_id,
                MutationBatchState::Rejected,
                Some(&error),
            );
            self.emit_new_snaps_and_notify_local_store(changes, None).await
        }
        .await;
        result.or_else(ignore_if_primary_lease_loss)
    }

    async fn handle_credential_change_internal(&self, user: User) -> FirestoreResult<()> {
        if self.current_user() == user {
            return Ok(());
        }
        log::debug!("User change. New user: {}", user.to_key());

        let result = self.local_store.handle_user_change(user.clone()).await?;
        self.with_state(|state| state.current_user = user.clone());
        self.reject_outstanding_pending_writes_callbacks(
            "'waitForPendingWrites' promise is rejected due to a user change.",
        );
        self.shared_client_state.handle_user_change(
            &user,
            &result.removed_batch_ids,
            &result.added_batch_ids,
        );
        self.emit_new_snaps_and_notify_local_store(result.affected_documents, None)
            .await
    }

    /// Applies an online state change to every view. The primary follows
    /// its own remote store; secondaries follow the primary.
    pub fn apply_online_state_change(&self, online_state: OnlineState, source: OnlineStateSource) {
        let applied = self.with_state(|state| {
            let applies = match source {
                OnlineStateSource::RemoteStore => state.is_primary(),
                OnlineStateSource::SharedClientState => !state.is_primary(),
            };
            if !applies {
                return None;
            }
            let snapshots: Vec<ViewSnapshot> = state
                .query_views
                .values_mut()
                .filter_map(|query_view| query_view.view.apply_online_state_change(online_state).snapshot)
                .collect();
            state.online_state = online_state;
            Some((snapshots, state.is_primary()))
        });
        let Some((snapshots, is_primary)) = applied else {
            return;
        };

        if let Some(listener) = self.listener() {
            listener.on_online_state_change(online_state);
        }
        self.raise_snapshots(snapshots);
        if is_primary {
            self.shared_client_state.set_online_state(online_state);
        }
    }

    /// Switches between primary and secondary. A new primary reconciles
    /// every active target with storage and starts watching it; a former
    /// primary drops the targets only other clients used.
    pub async fn apply_primary_state(&self, is_primary: bool) -> FirestoreResult<()> {
        let was_primary = self.with_state(|state| state.is_primary);
        if is_primary && was_primary != Some(true) {
            log::debug!("Becoming primary client");
            let active_targets: Vec<TargetId> = self
                .shared_client_state
                .get_all_active_query_targets()
                .into_iter()
                .collect();
            let active_queries = self
                .synchronize_query_views_and_raise_snapshots(active_targets, true)
                .await?;
            self.with_state(|state| state.is_primary = Some(true));
            self.remote_store.apply_primary_state(true).await;
            for target_data in active_queries {
                self.remote_store.listen(target_data).await;
            }
        } else if !is_primary && was_primary != Some(false) {
            log::debug!("Becoming secondary client");
            let target_ids: Vec<TargetId> =
                self.with_state(|state| state.queries_by_target.keys().copied().collect());
            let mut active_targets = Vec::new();
            for target_id in target_ids {
                if self.shared_client_state.is_local_query_target(target_id) {
                    active_targets.push(target_id);
                } else {
                    self.remove_and_cleanup_target(target_id, None).await;
                    self.local_store.release_target(target_id, true).await?;
                }
                self.remote_store.unlisten(target_id).await;
            }

            self.synchronize_query_views_and_raise_snapshots(active_targets, false)
                .await?;
            let limbo_target_ids = self.with_state(SyncEngineState::reset_limbo_documents);
            for target_id in limbo_target_ids {
                self.remote_store.unlisten(target_id).await;
            }
            self.with_state(|state| state.is_primary = Some(false));
            self.remote_store.apply_primary_state(false).await;
        }
        Ok(())
    }

    /// Reconciles the views of `targets` with storage, raising snapshots
    /// for local listeners. Targets without a local view get one when
    /// becoming primary. Returns the up to date target data.
    async fn synchronize_query_views_and_raise_snapshots(
        &self,
        targets: Vec<TargetId>,
        transition_to_primary: bool,
    ) -> FirestoreResult<Vec<TargetData>> {
        let mut active_queries = Vec::new();
        let mut new_snapshots = Vec::new();
        for target_id in targets {
            let queries =
                self.with_state(|state| state.queries_by_target.get(&target_id).cloned().unwrap_or_default());
            let target_data = match queries.first() {
                Some(first_query) => {
                    // Resume token and snapshot version may have moved on
                    // in another client.
                    let target_data = self.local_store.allocate_target(first_query.to_target()).await?;
                    for query in &queries {
                        let view_change = self.synchronize_view_and_compute_snapshot(query).await?;
                        new_snapshots.extend(view_change.snapshot);
                    }
                    target_data
                }
                None => {
                    if !transition_to_primary {
                        log::warn!("Secondary client has no view for active target {target_id}");
                        continue;
                    }
                    let Some(target) = self.local_store.get_cached_target(target_id).await? else {
                        log::warn!("Target for id {target_id} not found");
                        continue;
                    };
                    let target_data = self.local_store.allocate_target(target.clone()).await?;
                    self.initialize_view_and_compute_snapshot(
                        Query::from_target(&target),
                        target_id,
                        false,
                    )
                    .await?;
                    target_data
                }
            };
            active_queries.push(target_data);
        }
        self.raise_snapshots(new_snapshots);
        Ok(active_queries)
    }

    async fn synchronize_view_and_compute_snapshot(&self, query: &Query) -> FirestoreResult<ViewChange> {
        let query_result = self.local_store.execute_query(query, true).await?;
        let canonical_id = query.canonical_id();
        let (view_change, actions) = self.with_state(|state| {
            let is_primary = state.is_primary();
            let Some(query_view) = state.query_views.get_mut(&canonical_id) else {
                return (ViewChange::default(), RemoteActions::default());
            };
            let target_id = query_view.target_id;
            let view_change = query_view.view.synchronize_with_persisted_state(query_result);
            let mut actions = RemoteActions::default();
            if is_primary {
                state.update_tracked_limbos(target_id, view_change.limbo_changes.clone(), &mut actions);
            }
            (view_change, actions)
        });
        self.run_remote_actions(actions).await;
        Ok(view_change)
    }
}

impl RemoteSyncer for SyncEngine {
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.apply_remote_event_internal(event))
    }

    fn reject_listen(
        &self,
        target_id: TargetId,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.reject_listen_internal(target_id, error))
    }

    fn apply_successful_write(
        &self,
        result: MutationBatchResult,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.apply_successful_write_internal(result))
    }

    fn reject_failed_write(
        &self,
        batch_id: BatchId,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.reject_failed_write_internal(batch_id, error))
    }

    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        let state = lock(&self.state);
        if let Some(resolution) = state.active_limbo_resolutions_by_target.get(&target_id) {
            if resolution.received_document {
                return [resolution.key.clone()].into_iter().collect();
            }
            return BTreeSet::new();
        }
        let mut keys = BTreeSet::new();
        for query in state.queries_by_target.get(&target_id).into_iter().flatten() {
            if let Some(query_view) = state.query_views.get(&query.canonical_id()) {
                keys.extend(query_view.view.synced_documents().iter().cloned());
            }
        }
        keys
    }

    fn next_mutation_batch(
        &self,
        after_batch_id: BatchId,
    ) -> RemoteStoreFuture<'_, FirestoreResult<Option<MutationBatch>>> {
        box_remote_store_future(self.local_store.next_mutation_batch(Some(after_batch_id)))
    }

    fn get_last_stream_token(&self) -> RemoteStoreFuture<'_, FirestoreResult<Vec<u8>>> {
        box_remote_store_future(self.local_store.get_last_stream_token())
    }

    fn set_last_stream_token(&self, token: Vec<u8>) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.local_store.set_last_stream_token(token))
    }

    fn get_last_remote_snapshot_version(
        &self,
    ) -> RemoteStoreFuture<'_, FirestoreResult<SnapshotVersion>> {
        box_remote_store_future(self.local_store.get_last_remote_snapshot_version())
    }

    fn handle_credential_change(&self, user: User) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.handle_credential_change_internal(user))
    }

    fn apply_online_state_change(&self, online_state: OnlineState) {
        SyncEngine::apply_online_state_change(self, online_state, OnlineStateSource::RemoteStore);
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl SharedClientStateSyncer for SyncEngine {
    async fn apply_batch_state(
        &self,
        batch_id: BatchId,
        state: MutationBatchState,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        let Some(documents) = self.local_store.lookup_mutation_documents(batch_id).await? else {
            // The batch finished before this client saw it, so it never
            // touched the local views.
            log::debug!("Cannot apply mutation batch with id: {batch_id}");
            return Ok(());
        };
        match state {
            MutationBatchState::Pending => self.remote_store.fill_write_pipeline().await,
            MutationBatchState::Acknowledged | MutationBatchState::Rejected => {
                // Both are no-ops for batches written by other clients.
                self.process_user_callback(batch_id, error);
                self.trigger_pending_writes_callbacks(batch_id);
            }
        }
        self.emit_new_snaps_and_notify_local_store(documents, None).await
    }

    async fn apply_target_state(
        &self,
        target_id: TargetId,
        state: QueryTargetState,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        if self.is_primary_client() {
            log::debug!("Ignoring unexpected query state notification.");
            return Ok(());
        }
        let has_queries = self.with_state(|sync_state| {
            sync_state
                .queries_by_target
                .get(&target_id)
                .is_some_and(|queries| !queries.is_empty())
        });
        if !has_queries {
            return Ok(());
        }
        match state {
            QueryTargetState::Current | QueryTargetState::NotCurrent => {
                let changes = self.local_store.get_new_document_changes().await?;
                let event = RemoteEvent::synthesized_for_current_change(
                    target_id,
                    state == QueryTargetState::Current,
                );
                self.emit_new_snaps_and_notify_local_store(changes, Some(&event))
                    .await
            }
            QueryTargetState::Rejected => {
                self.local_store.release_target(target_id, true).await?;
                self.remove_and_cleanup_target(target_id, error).await;
                Ok(())
            }
        }
    }

    async fn apply_active_targets_change(
        &self,
        added: Vec<TargetId>,
        removed: Vec<TargetId>,
    ) -> FirestoreResult<()> {
        if !self.is_primary_client() {
            return Ok(());
        }

        for target_id in added {
            let has_view =
                self.with_state(|state| state.queries_by_target.contains_key(&target_id));
            if has_view && self.shared_client_state.is_active_query_target(target_id) {
                log::debug!("Adding an already active target {target_id}");
                continue;
            }
            let Some(target) = self.local_store.get_cached_target(target_id).await? else {
                log::warn!("Query data for active target {target_id} not found");
                continue;
            };
            let target_data = self.local_store.allocate_target(target.clone()).await?;
            self.initialize_view_and_compute_snapshot(
                Query::from_target(&target),
                target_data.target_id,
                false,
            )
            .await?;
            self.remote_store.listen(target_data).await;
        }

        for target_id in removed {
            // Rejected targets are already gone.
            if !self.with_state(|state| state.queries_by_target.contains_key(&target_id)) {
                continue;
            }
            match self.local_store.release_target(target_id, false).await {
                Ok(()) => {
                    self.remote_store.unlisten(target_id).await;
                    self.remove_and_cleanup_target(target_id, None).await;
                }
                Err(err) => ignore_if_primary_lease_loss(err)?,
            }
        }
        Ok(())
    }

    fn apply_online_state_change(&self, online_state: OnlineState, source: OnlineStateSource) {
        SyncEngine::apply_online_state_change(self, online_state, source);
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl QueryTargetHandler for SyncEngine {
    async fn listen(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        SyncEngine::listen(self, query).await
    }

    async fn unlisten(&self, query: Query) -> FirestoreResult<()> {
        SyncEngine::unlisten(self, query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::async_queue::AsyncQueue;
    use crate::firestore::core::view_snapshot::ChangeType;
    use crate::firestore::error::permission_denied;
    use crate::firestore::local::persistence::Persistence;
    use crate::firestore::local::shared_client_state::MemorySharedClientState;
    use crate::firestore::model::{DatabaseId, MutationResult};
    use crate::firestore::remote::datastore::NoopTokenProvider;
    use crate::firestore::remote::network::NetworkLayer;
    use crate::firestore::remote::serializer::JsonProtoSerializer;
    use crate::firestore::remote::stream::MultiplexedConnection;
    use crate::firestore::settings::ClientConfig;
    use crate::firestore::test_support::{connected_datastore, doc, key, map, query, version};

    #[derive(Default)]
    struct RecordingListener {
        snapshots: Mutex<Vec<ViewSnapshot>>,
        errors: Mutex<Vec<(String, FirestoreErrorCode)>>,
        online_states: Mutex<Vec<OnlineState>>,
    }

    impl SyncEngineListener for RecordingListener {
        fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
            self.snapshots.lock().unwrap().extend(snapshots);
        }

        fn on_watch_error(&self, query: &Query, error: FirestoreError) {
            self.errors
                .lock()
                .unwrap()
                .push((query.canonical_id(), error.code));
        }

        fn on_online_state_change(&self, online_state: OnlineState) {
            self.online_states.lock().unwrap().push(online_state);
        }
    }

    impl RecordingListener {
        fn last(&self) -> ViewSnapshot {
            self.snapshots.lock().unwrap().last().cloned().unwrap()
        }
    }

    struct Harness {
        engine: Arc<SyncEngine>,
        local_store: Arc<LocalStore>,
        remote_store: RemoteStore,
        listener: Arc<RecordingListener>,
        queue: AsyncQueue,
        _server: Arc<MultiplexedConnection>,
        _listener_handle: Arc<dyn SyncEngineListener>,
        _syncer_handle: Arc<dyn RemoteSyncer>,
    }

    impl Harness {
        async fn new(name: &str, settings: SyncSettings) -> Self {
            let queue = AsyncQueue::new();
            let config = ClientConfig::new(DatabaseId::new("p", "(default)"), name)
                .with_settings(settings.clone());
            let persistence = Persistence::new(&config, queue.clone());
            persistence.start().await.unwrap();
            let local_store = LocalStore::new(persistence, User::new("alice"));
            local_store.start().await.unwrap();

            let (datastore, server, database_id) = connected_datastore();
            let network = NetworkLayer::builder(
                datastore,
                Arc::new(NoopTokenProvider),
                queue.clone(),
                JsonProtoSerializer::new(database_id),
            )
            .build();
            let remote_store = RemoteStore::new(queue.clone(), &network, &settings);
            let engine = SyncEngine::new(
                Arc::clone(&local_store),
                remote_store.clone(),
                Arc::new(MemorySharedClientState::new()),
                &settings,
            );
            let syncer_handle: Arc<dyn RemoteSyncer> = engine.clone();
            remote_store.set_syncer(&syncer_handle);
            let listener = Arc::new(RecordingListener::default());
            let listener_handle: Arc<dyn SyncEngineListener> = listener.clone();
            engine.set_listener(Arc::downgrade(&listener_handle));

            let harness = Self {
                engine,
                local_store,
                remote_store,
                listener,
                queue,
                _server: server,
                _listener_handle: listener_handle,
                _syncer_handle: syncer_handle,
            };
            harness
                .run(|engine| async move { engine.apply_primary_state(true).await })
                .await
                .unwrap();
            harness
        }

        async fn run<T, F, Fut>(&self, op: F) -> FirestoreResult<T>
        where
            T: Send + 'static,
            F: FnOnce(Arc<SyncEngine>) -> Fut + Send + 'static,
            Fut: std::future::Future<Output = FirestoreResult<T>> + Send + 'static,
        {
            let engine = Arc::clone(&self.engine);
            self.queue.enqueue(move || op(engine)).await
        }

        async fn apply(&self, event: RemoteEvent) {
            self.run(move |engine| async move { engine.apply_remote_event_internal(event).await })
                .await
                .unwrap();
        }

        async fn listen(&self, path: &str) -> ViewSnapshot {
            let q = query(path);
            self.run(move |engine| async move { engine.listen(q).await })
                .await
                .unwrap()
        }
    }

    fn event(
        snapshot: i64,
        target_id: TargetId,
        docs: &[MaybeDocument],
        removed: &[&str],
    ) -> RemoteEvent {
        let mut change = TargetChange {
            resume_token: format!("token-{snapshot}").into_bytes(),
            current: true,
            ..TargetChange::default()
        };
        let mut document_updates = BTreeMap::new();
        for doc in docs {
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

    fn keys_of(snapshot: &ViewSnapshot) -> Vec<DocumentKey> {
        snapshot.docs.keys().cloned().collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn listen_raises_cached_results_and_watches_the_target() {
        let harness = Harness::new("sync-engine-listen", SyncSettings::default()).await;
        let initial = harness.listen("rooms").await;
        assert!(initial.from_cache);
        assert!(initial.docs.is_empty());
        assert_eq!(harness.remote_store.listen_target_ids(), vec![2]);

        harness
            .apply(event(10, 2, &[doc("rooms/a", 10, &[]).into()], &[]))
            .await;
        let synced = harness.listener.last();
        assert!(!synced.from_cache);
        assert_eq!(keys_of(&synced), vec![key("rooms/a")]);
        assert_eq!(
            harness.engine.get_remote_keys_for_target(2),
            [key("rooms/a")].into_iter().collect()
        );

        harness
            .run(|engine| async move { engine.unlisten(query("rooms")).await })
            .await
            .unwrap();
        assert!(harness.remote_store.listen_target_ids().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn writes_resolve_on_acknowledgement() {
        let harness = Harness::new("sync-engine-write", SyncSettings::default()).await;
        harness.listen("rooms").await;

        let receiver = harness
            .run(|engine| async move {
                Ok(engine
                    .write(vec![Mutation::set(key("rooms/a"), map(&[("n", 1i64.into())]))])
                    .await)
            })
            .await
            .unwrap();
        let pending = harness.listener.last();
        assert!(pending.has_pending_writes());
        assert_eq!(pending.doc_changes[0].change_type, ChangeType::Added);

        let pending_writes = harness
            .run(|engine| async move { Ok(engine.register_pending_writes_callback().await) })
            .await
            .unwrap();

        let batch = harness
            .local_store
            .next_mutation_batch(None)
            .await
            .unwrap()
            .unwrap();
        let result = MutationBatchResult::from(
            batch,
            version(5),
            vec![MutationResult::new(version(5), None)],
            b"stream".to_vec(),
        )
        .unwrap();
        harness
            .run(move |engine| async move { engine.apply_successful_write_internal(result).await })
            .await
            .unwrap();

        assert!(receiver.await.unwrap().is_ok());
        assert!(pending_writes.await.unwrap().is_ok());

        // The acknowledged write stays pending until watch reports it.
        harness
            .apply(event(6, 2, &[doc("rooms/a", 6, &[("n", 1i64.into())]).into()], &[]))
            .await;
        let confirmed = harness.listener.last();
        assert!(!confirmed.has_pending_writes());
        assert!(!confirmed.from_cache);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejected_writes_fail_and_roll_back() {
        let harness = Harness::new("sync-engine-reject-write", SyncSettings::default()).await;
        harness.listen("rooms").await;
        let receiver = harness
            .run(|engine| async move {
                Ok(engine
                    .write(vec![Mutation::set(key("rooms/a"), map(&[("n", 1i64.into())]))])
                    .await)
            })
            .await
            .unwrap();

        harness
            .run(|engine| async move {
                engine
                    .reject_failed_write_internal(1, permission_denied("nope"))
                    .await
            })
            .await
            .unwrap();
        assert_eq!(
            receiver.await.unwrap().unwrap_err().code,
            FirestoreErrorCode::PermissionDenied
        );
        let rolled_back = harness.listener.last();
        assert!(rolled_back.docs.is_empty());
        assert_eq!(rolled_back.doc_changes[0].change_type, ChangeType::Removed);

        let no_pending = harness
            .run(|engine| async move { Ok(engine.register_pending_writes_callback().await) })
            .await
            .unwrap();
        assert!(no_pending.await.unwrap().is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn documents_dropped_by_the_server_are_resolved_as_limbo() {
        let harness = Harness::new("sync-engine-limbo", SyncSettings::default()).await;
        harness.listen("rooms").await;
        harness
            .apply(event(
                10,
                2,
                &[doc("rooms/a", 10, &[]).into(), doc("rooms/b", 10, &[]).into()],
                &[],
            ))
            .await;

        // The target stops reporting rooms/b without saying why.
        harness.apply(event(20, 2, &[], &["rooms/b"])).await;
        assert_eq!(
            harness.engine.active_limbo_document_resolutions(),
            [(key("rooms/b"), 1)].into_iter().collect()
        );
        assert!(harness.remote_store.listen_target_ids().contains(&1));
        assert!(harness.listener.last().from_cache);

        // Losing access to the limbo document deletes it locally.
        harness
            .run(|engine| async move {
                engine
                    .reject_listen_internal(1, permission_denied("gone"))
                    .await
            })
            .await
            .unwrap();
        let resolved = harness.listener.last();
        assert_eq!(keys_of(&resolved), vec![key("rooms/a")]);
        assert!(!resolved.from_cache);
        assert!(harness.engine.active_limbo_document_resolutions().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn limbo_resolutions_are_bounded() {
        let settings = SyncSettings {
            max_concurrent_limbo_resolutions: 1,
            ..SyncSettings::default()
        };
        let harness = Harness::new("sync-engine-limbo-bound", settings).await;
        harness.listen("rooms").await;
        harness
            .apply(event(
                10,
                2,
                &[doc("rooms/a", 10, &[]).into(), doc("rooms/b", 10, &[]).into()],
                &[],
            ))
            .await;
        harness.apply(event(20, 2, &[], &["rooms/a", "rooms/b"])).await;

        assert_eq!(
            harness.engine.active_limbo_document_resolutions(),
            [(key("rooms/a"), 1)].into_iter().collect()
        );
        assert_eq!(
            harness.engine.enqueued_limbo_document_resolutions(),
            vec![key("rooms/b")]
        );

        // Resolving rooms/a frees the slot for rooms/b.
        harness
            .run(|engine| async move { engine.reject_listen_internal(1, permission_denied("x")).await })
            .await
            .unwrap();
        assert_eq!(
            harness.engine.active_limbo_document_resolutions(),
            [(key("rooms/b"), 3)].into_iter().collect()
        );
        assert!(harness.engine.enqueued_limbo_document_resolutions().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejected_listens_report_errors() {
        let harness = Harness::new("sync-engine-reject-listen", SyncSettings::default()).await;
        harness.listen("rooms").await;
        harness
            .run(|engine| async move {
                engine
                    .reject_listen_internal(2, permission_denied("denied"))
                    .await
            })
            .await
            .unwrap();
        assert_eq!(
            harness.listener.errors.lock().unwrap()[0].1,
            FirestoreErrorCode::PermissionDenied
        );
        assert!(harness.engine.get_remote_keys_for_target(2).is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn going_offline_raises_cached_snapshots() {
        let harness = Harness::new("sync-engine-offline", SyncSettings::default()).await;
        harness.listen("rooms").await;
        harness
            .apply(event(10, 2, &[doc("rooms/a", 10, &[]).into()], &[]))
            .await;
        assert!(!harness.listener.last().from_cache);

        harness
            .engine
            .apply_online_state_change(OnlineState::Offline, OnlineStateSource::RemoteStore);
        assert!(harness.listener.last().from_cache);
        assert_eq!(harness.engine.online_state(), OnlineState::Offline);
        assert!(harness
            .listener
            .online_states
            .lock()
            .unwrap()
            .contains(&OnlineState::Offline));

        // A primary ignores online state published by other clients.
        harness
            .engine
            .apply_online_state_change(OnlineState::Online, OnlineStateSource::SharedClientState);
        assert_eq!(harness.engine.online_state(), OnlineState::Offline);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn user_changes_swap_pending_writes() {
        let harness = Harness::new("sync-engine-user", SyncSettings::default()).await;
        harness.listen("rooms").await;
        harness
            .run(|engine| async move {
                Ok(engine
                    .write(vec![Mutation::set(key("rooms/a"), map(&[("n", 1i64.into())]))])
                    .await)
            })
            .await
            .unwrap();
        let pending_writes = harness
            .run(|engine| async move { Ok(engine.register_pending_writes_callback().await) })
            .await
            .unwrap();
        assert_eq!(keys_of(&harness.listener.last()), vec![key("rooms/a")]);

        harness
            .run(|engine| async move {
                engine.handle_credential_change_internal(User::new("bob")).await
            })
            .await
            .unwrap();
        assert_eq!(harness.engine.current_user(), User::new("bob"));
        assert!(harness.listener.last().docs.is_empty());
        assert_eq!(
            pending_writes.await.unwrap().unwrap_err().code,
            FirestoreErrorCode::Cancelled
        );
    }
}

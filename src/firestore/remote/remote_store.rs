use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;

use crate::firestore::async_queue::AsyncQueue;
use crate::firestore::core::types::{OnlineState, TargetId};
use crate::firestore::error::{is_permanent_error, is_permanent_write_error, FirestoreError, FirestoreResult};
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{
    DocumentKey, MutationBatch, MutationBatchResult, MutationResult, SnapshotVersion, User,
    BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::network::NetworkLayer;
use crate::firestore::remote::online_state_tracker::OnlineStateTracker;
use crate::firestore::remote::remote_syncer::{
    box_remote_store_future, RemoteStoreFuture, RemoteSyncer,
};
use crate::firestore::remote::streams::{
    ListenStream, WatchStreamListener, WriteStream, WriteStreamListener,
};
use crate::firestore::remote::watch_change::{TargetChangeState, WatchChange, WatchTargetChange};
use crate::firestore::remote::watch_change_aggregator::{
    TargetMetadataProvider, WatchChangeAggregator,
};
use crate::firestore::settings::SyncSettings;

/// Reasons the remote store keeps its streams down. The network is used
/// only while the set is empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    /// Local persistence failed; cleared once a retried operation succeeds.
    StorageFailed,
    /// Another client holds the primary lease.
    IsSecondary,
    CredentialChange,
    Shutdown,
}

/// The operation retried after a storage failure before the network comes
/// back.
#[derive(Clone, Debug)]
enum RecoveryOp {
    LastRemoteSnapshotVersion,
    RaiseWatchSnapshot(SnapshotVersion),
    HandleTargetError(WatchTargetChange),
}

type ListenTargets = Arc<Mutex<BTreeMap<TargetId, TargetData>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct RemoteStoreState {
    /// Batches sent (or about to be sent) to the write stream, in order.
    write_pipeline: VecDeque<MutationBatch>,
    offline_causes: BTreeSet<OfflineCause>,
    /// Present while the watch stream is started.
    aggregator: Option<WatchChangeAggregator>,
}

/// Owns the watch and write streams and keeps them in line with what the
/// sync engine needs: listens on every active target and drains the
/// mutation queue, while tracking whether the client is online.
#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteStoreInner>,
}

impl RemoteStore {
    pub fn new(queue: AsyncQueue, network: &NetworkLayer, settings: &SyncSettings) -> Self {
        let inner = Arc::new_cyclic(|this: &Weak<RemoteStoreInner>| {
            let watch_listener: Weak<dyn WatchStreamListener> = this.clone();
            let write_listener: Weak<dyn WriteStreamListener> = this.clone();
            let handler_store = this.clone();
            let online_state_tracker = OnlineStateTracker::new(
                queue.clone(),
                Arc::new(move |online_state: OnlineState| {
                    if let Some(syncer) = handler_store.upgrade().and_then(|store| store.syncer()) {
                        syncer.apply_online_state_change(online_state);
                    }
                }),
                settings.online_state_timeout(),
                settings.max_watch_stream_failures as usize,
            );
            RemoteStoreInner {
                queue,
                listen_targets: ListenTargets::default(),
                state: Mutex::new(RemoteStoreState {
                    write_pipeline: VecDeque::new(),
                    offline_causes: BTreeSet::new(),
                    aggregator: None,
                }),
                syncer: Mutex::new(None),
                watch_stream: network.listen_stream(watch_listener),
                write_stream: network.write_stream(write_listener),
                online_state_tracker,
                max_pending_writes: settings.max_pending_writes,
                this: this.clone(),
            }
        });
        Self { inner }
    }

    /// Connects the store to the layer it reports to. Held weakly; the
    /// owner keeps the syncer alive.
    pub fn set_syncer(&self, syncer: &Arc<dyn RemoteSyncer>) {
        *lock(&self.inner.syncer) = Some(Arc::downgrade(syncer));
    }

    pub async fn start(&self) {
        self.enable_network().await;
    }

    /// Re-enables the network after [`disable_network`](Self::disable_network).
    pub async fn enable_network(&self) {
        lock(&self.inner.state)
            .offline_causes
            .remove(&OfflineCause::UserDisabled);
        self.inner.enable_network_internal().await;
    }

    /// Stops both streams and reports the client offline until
    /// [`enable_network`](Self::enable_network) is called.
    pub async fn disable_network(&self) {
        lock(&self.inner.state)
            .offline_causes
            .insert(OfflineCause::UserDisabled);
        self.inner.disable_network_internal().await;
        self.inner.online_state_tracker.set(OnlineState::Offline);
    }

    pub async fn shutdown(&self) {
        log::debug!("RemoteStore shutting down.");
        lock(&self.inner.state)
            .offline_causes
            .insert(OfflineCause::Shutdown);
        self.inner.disable_network_internal().await;
        self.inner.online_state_tracker.shutdown();
        self.inner.online_state_tracker.set(OnlineState::Unknown);
    }

    /// Starts watching `target_data`. A no-op if the target is already
    /// watched.
    pub async fn listen(&self, target_data: TargetData) {
        let target_id = target_data.target_id;
        {
            let mut targets = lock(&self.inner.listen_targets);
            if targets.contains_key(&target_id) {
                return;
            }
            targets.insert(target_id, target_data.clone());
        }

        if self.inner.should_start_watch_stream() {
            self.inner.start_watch_stream();
        } else if self.inner.watch_stream.is_open() {
            self.inner.send_watch_request(target_data).await;
        }
    }

    pub async fn unlisten(&self, target_id: TargetId) {
        let remaining = {
            let mut targets = lock(&self.inner.listen_targets);
            targets.remove(&target_id);
            targets.len()
        };
        if self.inner.watch_stream.is_open() {
            self.inner.send_unwatch_request(target_id).await;
        }

        if remaining == 0 {
            if self.inner.watch_stream.is_open() {
                self.inner.watch_stream.mark_idle();
            } else if self.inner.can_use_network() {
                // No targets and no stream means nobody is waiting on the
                // backend; go back to not knowing rather than stay offline.
                self.inner.online_state_tracker.set(OnlineState::Unknown);
            }
        }
    }

    /// Pulls queued batches into the write pipeline and starts the write
    /// stream if there is anything to send.
    pub async fn fill_write_pipeline(&self) {
        self.inner.fill_write_pipeline().await;
    }

    pub async fn apply_primary_state(&self, is_primary: bool) {
        if is_primary {
            lock(&self.inner.state)
                .offline_causes
                .remove(&OfflineCause::IsSecondary);
            self.inner.enable_network_internal().await;
        } else {
            lock(&self.inner.state)
                .offline_causes
                .insert(OfflineCause::IsSecondary);
            self.inner.disable_network_internal().await;
            self.inner.online_state_tracker.set(OnlineState::Unknown);
        }
    }

    /// Restarts both streams under the credentials of `user`.
    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        log::debug!("RemoteStore received new credentials");
        let uses_network = self.inner.can_use_network();
        lock(&self.inner.state)
            .offline_causes
            .insert(OfflineCause::CredentialChange);
        self.inner.disable_network_internal().await;
        if uses_network {
            self.inner.online_state_tracker.set(OnlineState::Unknown);
        }
        let result = match self.inner.syncer() {
            Some(syncer) => syncer.handle_credential_change(user).await,
            None => Ok(()),
        };
        lock(&self.inner.state)
            .offline_causes
            .remove(&OfflineCause::CredentialChange);
        self.inner.enable_network_internal().await;
        result
    }

    pub fn can_use_network(&self) -> bool {
        self.inner.can_use_network()
    }

    pub fn online_state(&self) -> OnlineState {
        self.inner.online_state_tracker.state()
    }

    pub fn is_watch_stream_started(&self) -> bool {
        self.inner.watch_stream.is_started()
    }

    pub fn is_write_stream_started(&self) -> bool {
        self.inner.write_stream.is_started()
    }

    pub fn write_pipeline_len(&self) -> usize {
        lock(&self.inner.state).write_pipeline.len()
    }

    pub fn listen_target_ids(&self) -> Vec<TargetId> {
        lock(&self.inner.listen_targets).keys().copied().collect()
    }

    pub fn queue(&self) -> &AsyncQueue {
        &self.inner.queue
    }
}

struct RemoteStoreInner {
    queue: AsyncQueue,
    listen_targets: ListenTargets,
    state: Mutex<RemoteStoreState>,
    syncer: Mutex<Option<Weak<dyn RemoteSyncer>>>,
    watch_stream: ListenStream,
    write_stream: WriteStream,
    online_state_tracker: OnlineStateTracker,
    max_pending_writes: usize,
    this: Weak<RemoteStoreInner>,
}

/// Answers the aggregator's questions from the listen targets and the
/// syncer.
struct ListenTargetMetadata {
    store: Weak<RemoteStoreInner>,
}

impl TargetMetadataProvider for ListenTargetMetadata {
    fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.store
            .upgrade()
            .and_then(|store| store.syncer())
            .map(|syncer| syncer.get_remote_keys_for_target(target_id))
            .unwrap_or_default()
    }

    fn target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        let store = self.store.upgrade()?;
        let targets = lock(&store.listen_targets);
        targets.get(&target_id).cloned()
    }
}

impl RemoteStoreInner {
    fn syncer(&self) -> Option<Arc<dyn RemoteSyncer>> {
        lock(&self.syncer).as_ref().and_then(Weak::upgrade)
    }

    fn can_use_network(&self) -> bool {
        lock(&self.state).offline_causes.is_empty()
    }

    fn should_start_watch_stream(&self) -> bool {
        self.can_use_network()
            && !self.watch_stream.is_started()
            && !lock(&self.listen_targets).is_empty()
    }

    fn should_start_write_stream(&self) -> bool {
        let state = lock(&self.state);
        state.offline_causes.is_empty()
            && !self.write_stream.is_started()
            && !state.write_pipeline.is_empty()
    }

    fn can_add_to_write_pipeline(&self) -> bool {
        let state = lock(&self.state);
        state.offline_causes.is_empty() && state.write_pipeline.len() < self.max_pending_writes
    }

    async fn enable_network_internal(&self) {
        if !self.can_use_network() {
            return;
        }
        if let Some(syncer) = self.syncer() {
            match syncer.get_last_stream_token().await {
                Ok(token) => self.write_stream.set_last_stream_token(token),
                Err(err) => log::debug!("Failed to load the last stream token: {err}"),
            }
        }

        if self.should_start_watch_stream() {
            self.start_watch_stream();
        } else {
            self.online_state_tracker.set(OnlineState::Unknown);
        }
        self.fill_write_pipeline().await;
    }

    async fn disable_network_internal(&self) {
        self.write_stream.stop().await;
        self.watch_stream.stop().await;

        let dropped = {
            let mut state = lock(&self.state);
            let dropped = state.write_pipeline.len();
            state.write_pipeline.clear();
            dropped
        };
        if dropped > 0 {
            log::debug!("Stopping write stream with {dropped} pending writes");
        }
        self.clean_up_watch_stream_state();
    }

    fn clean_up_watch_stream_state(&self) {
        lock(&self.state).aggregator = None;
    }

    fn start_watch_stream(&self) {
        let provider = Arc::new(ListenTargetMetadata {
            store: self.this.clone(),
        });
        lock(&self.state).aggregator = Some(WatchChangeAggregator::new(provider));
        self.watch_stream.start();
        self.online_state_tracker.handle_watch_stream_start();
    }

    async fn send_watch_request(&self, target_data: TargetData) {
        let target_id = target_data.target_id;
        if let Some(aggregator) = lock(&self.state).aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }

        let resuming = !target_data.resume_token.is_empty()
            || target_data.snapshot_version > SnapshotVersion::min();
        let target_data = match self.syncer() {
            Some(syncer) if resuming => {
                let expected = syncer.get_remote_keys_for_target(target_id).len();
                target_data.with_expected_count(expected)
            }
            _ => target_data,
        };
        self.watch_stream.watch(&target_data).await;
    }

    async fn send_unwatch_request(&self, target_id: TargetId) {
        if let Some(aggregator) = lock(&self.state).aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        self.watch_stream.unwatch(target_id).await;
    }

    async fn handle_watch_change(&self, change: WatchChange, snapshot_version: SnapshotVersion) {
        // Any message proves the backend is reachable.
        self.online_state_tracker.set(OnlineState::Online);

        if let WatchChange::TargetChange(target_change) = &change {
            if target_change.state == TargetChangeState::Removed && target_change.cause.is_some() {
                if let Err(err) = self.handle_target_error(target_change).await {
                    self.disable_network_until_recovery(
                        err,
                        RecoveryOp::HandleTargetError(target_change.clone()),
                    )
                    .await;
                }
                return;
            }
        }

        {
            let mut state = lock(&self.state);
            let Some(aggregator) = state.aggregator.as_mut() else {
                return;
            };
            match change {
                WatchChange::DocumentChange(document_change) => {
                    aggregator.handle_document_change(document_change)
                }
                WatchChange::ExistenceFilter(filter) => aggregator.handle_existence_filter(filter),
                WatchChange::TargetChange(target_change) => {
                    aggregator.handle_target_change(&target_change)
                }
            }
        }

        if snapshot_version.is_min() {
            return;
        }
        if let Err(err) = self.raise_if_newer(snapshot_version).await {
            self.disable_network_until_recovery(err, RecoveryOp::RaiseWatchSnapshot(snapshot_version))
                .await;
        }
    }

    async fn raise_if_newer(&self, snapshot_version: SnapshotVersion) -> FirestoreResult<()> {
        let Some(syncer) = self.syncer() else {
            return Ok(());
        };
        let last_remote_version = syncer.get_last_remote_snapshot_version().await?;
        if snapshot_version >= last_remote_version {
            // Older versions come from a stream replaying changes the local
            // store has already seen.
            self.raise_watch_snapshot(snapshot_version).await?;
        }
        Ok(())
    }

    /// Turns everything aggregated so far into a remote event and hands it
    /// to the syncer.
    async fn raise_watch_snapshot(&self, snapshot_version: SnapshotVersion) -> FirestoreResult<()> {
        debug_assert!(!snapshot_version.is_min(), "cannot raise a snapshot at version 0");
        let event = {
            let mut state = lock(&self.state);
            let Some(aggregator) = state.aggregator.as_mut() else {
                return Ok(());
            };
            aggregator.create_remote_event(snapshot_version)
        };

        let relisten = {
            let mut targets = lock(&self.listen_targets);
            for (target_id, change) in &event.target_changes {
                if change.resume_token.is_empty() {
                    continue;
                }
                if let Some(target_data) = targets.get_mut(target_id) {
                    *target_data =
                        target_data.with_resume_token(change.resume_token.clone(), snapshot_version);
                }
            }

            let mut relisten = Vec::new();
            for target_id in &event.target_mismatches {
                let Some(target_data) = targets.get_mut(target_id) else {
                    continue;
                };
                // Clear the token so the re-listen returns the full result
                // set instead of a delta.
                *target_data =
                    target_data.with_resume_token(Vec::new(), target_data.snapshot_version);
                relisten.push(TargetData::new(
                    target_data.target.clone(),
                    *target_id,
                    TargetPurpose::ExistenceFilterMismatch,
                    target_data.sequence_number,
                ));
            }
            relisten
        };
        for request in relisten {
            self.send_unwatch_request(request.target_id).await;
            self.send_watch_request(request).await;
        }

        match self.syncer() {
            Some(syncer) => syncer.apply_remote_event(event).await,
            None => Ok(()),
        }
    }

    async fn handle_target_error(&self, change: &WatchTargetChange) -> FirestoreResult<()> {
        let Some(error) = change.cause.clone() else {
            return Ok(());
        };
        for target_id in &change.target_ids {
            if !lock(&self.listen_targets).contains_key(target_id) {
                continue;
            }
            if let Some(syncer) = self.syncer() {
                syncer.reject_listen(*target_id, error.clone()).await?;
            }
            lock(&self.listen_targets).remove(target_id);
            if let Some(aggregator) = lock(&self.state).aggregator.as_mut() {
                aggregator.remove_target(*target_id);
            }
        }
        Ok(())
    }

    /// Takes the network down after a local storage failure and retries
    /// `op` with backoff until storage works again.
    async fn disable_network_until_recovery(&self, error: FirestoreError, op: RecoveryOp) {
        if !error.is_storage_transaction_failure() {
            log::error!("Unexpected error in the remote store: {error}");
            return;
        }
        log::debug!("Disabling network until storage recovers: {error}");
        lock(&self.state)
            .offline_causes
            .insert(OfflineCause::StorageFailed);
        self.disable_network_internal().await;
        self.online_state_tracker.set(OnlineState::Offline);

        let this = self.this.clone();
        self.queue.enqueue_retryable(move || {
            let this = this.clone();
            let op = op.clone();
            box_remote_store_future(async move {
                match this.upgrade() {
                    Some(store) => store.recover(op).await,
                    None => Ok(()),
                }
            })
        });
    }

    fn recover(self: Arc<Self>, op: RecoveryOp) -> RemoteStoreFuture<'static, FirestoreResult<()>> {
        box_remote_store_future(async move {
            match op {
                RecoveryOp::LastRemoteSnapshotVersion => {
                    if let Some(syncer) = self.syncer() {
                        syncer.get_last_remote_snapshot_version().await?;
                    }
                }
                RecoveryOp::RaiseWatchSnapshot(version) => self.raise_watch_snapshot(version).await?,
                RecoveryOp::HandleTargetError(change) => self.handle_target_error(&change).await?,
            }
            lock(&self.state)
                .offline_causes
                .remove(&OfflineCause::StorageFailed);
            self.enable_network_internal().await;
            Ok(())
        })
    }

    async fn fill_write_pipeline(&self) {
        let mut last_batch_id = lock(&self.state)
            .write_pipeline
            .back()
            .map_or(BATCH_ID_UNKNOWN, |batch| batch.batch_id);

        while self.can_add_to_write_pipeline() {
            let Some(syncer) = self.syncer() else {
                break;
            };
            match syncer.next_mutation_batch(last_batch_id).await {
                Ok(Some(batch)) => {
                    last_batch_id = batch.batch_id;
                    self.add_to_write_pipeline(batch).await;
                }
                Ok(None) => {
                    if lock(&self.state).write_pipeline.is_empty() {
                        self.write_stream.mark_idle();
                    }
                    break;
                }
                Err(err) => {
                    self.disable_network_until_recovery(err, RecoveryOp::LastRemoteSnapshotVersion)
                        .await;
                    break;
                }
            }
        }

        if self.should_start_write_stream() {
            self.write_stream.start();
        }
    }

    async fn add_to_write_pipeline(&self, batch: MutationBatch) {
        let mutations = batch.mutations.clone();
        lock(&self.state).write_pipeline.push_back(batch);
        if self.write_stream.is_open() && self.write_stream.handshake_complete() {
            self.write_stream.write_mutations(&mutations).await;
        }
    }

    async fn handle_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) {
        let Some(batch) = lock(&self.state).write_pipeline.pop_front() else {
            log::warn!("Got a write acknowledgement with an empty write pipeline");
            return;
        };
        let batch_id = batch.batch_id;
        let result = match MutationBatchResult::from(
            batch,
            commit_version,
            results,
            self.write_stream.last_stream_token(),
        ) {
            Ok(result) => result,
            Err(err) => {
                log::error!("Rejecting batch {batch_id} after a malformed write acknowledgement: {err}");
                if let Some(syncer) = self.syncer() {
                    if let Err(err) = syncer.reject_failed_write(batch_id, err).await {
                        self.disable_network_until_recovery(err, RecoveryOp::LastRemoteSnapshotVersion)
                            .await;
                    }
                }
                self.fill_write_pipeline().await;
                return;
            }
        };
        if let Some(syncer) = self.syncer() {
            if let Err(err) = syncer.apply_successful_write(result).await {
                self.disable_network_until_recovery(err, RecoveryOp::LastRemoteSnapshotVersion)
                    .await;
            }
        }
        self.fill_write_pipeline().await;
    }

    async fn handle_handshake_error(&self, error: FirestoreError) {
        // Only permanent failures mean the token itself is bad; anything
        // else is retried with the same token.
        if !is_permanent_error(error.code) {
            return;
        }
        log::debug!("RemoteStore error before completed handshake; resetting stream token: {error}");
        self.write_stream.set_last_stream_token(Vec::new());
        let Some(syncer) = self.syncer() else {
            return;
        };
        if let Err(err) = syncer.set_last_stream_token(Vec::new()).await {
            if err.is_primary_lease_lost() {
                log::debug!("Unexpectedly lost primary lease");
            } else {
                self.disable_network_until_recovery(err, RecoveryOp::LastRemoteSnapshotVersion)
                    .await;
            }
        }
    }

    async fn handle_write_error(&self, error: FirestoreError) {
        if !is_permanent_write_error(error.code) {
            return;
        }
        // The write at the head of the pipeline is the one the backend
        // rejected; drop it and carry on with the rest.
        let Some(batch) = lock(&self.state).write_pipeline.pop_front() else {
            return;
        };
        self.write_stream.inhibit_backoff();
        if let Some(syncer) = self.syncer() {
            if let Err(err) = syncer.reject_failed_write(batch.batch_id, error).await {
                self.disable_network_until_recovery(err, RecoveryOp::LastRemoteSnapshotVersion)
                    .await;
            }
        }
        self.fill_write_pipeline().await;
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl WatchStreamListener for RemoteStoreInner {
    async fn on_watch_stream_open(&self) {
        let targets: Vec<TargetData> = lock(&self.listen_targets).values().cloned().collect();
        for target_data in targets {
            self.send_watch_request(target_data).await;
        }
    }

    async fn on_watch_stream_change(&self, change: WatchChange, snapshot_version: SnapshotVersion) {
        self.handle_watch_change(change, snapshot_version).await;
    }

    async fn on_watch_stream_close(&self, error: Option<FirestoreError>) {
        self.clean_up_watch_stream_state();
        if self.should_start_watch_stream() {
            self.online_state_tracker
                .handle_watch_stream_failure(error.as_ref());
            self.start_watch_stream();
        } else {
            // Closed on purpose: no targets left or the network is off.
            self.online_state_tracker.set(OnlineState::Unknown);
        }
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl WriteStreamListener for RemoteStoreInner {
    async fn on_write_stream_open(&self) {
        self.write_stream.write_handshake().await;
    }

    async fn on_write_handshake_complete(&self) {
        if let Some(syncer) = self.syncer() {
            let token = self.write_stream.last_stream_token();
            if let Err(err) = syncer.set_last_stream_token(token).await {
                self.disable_network_until_recovery(err, RecoveryOp::LastRemoteSnapshotVersion)
                    .await;
                return;
            }
        }
        let pending: Vec<MutationBatch> = lock(&self.state).write_pipeline.iter().cloned().collect();
        for batch in pending {
            self.write_stream.write_mutations(&batch.mutations).await;
        }
    }

    async fn on_mutation_result(&self, commit_version: SnapshotVersion, results: Vec<MutationResult>) {
        self.handle_mutation_result(commit_version, results).await;
    }

    async fn on_write_stream_close(&self, error: Option<FirestoreError>) {
        let Some(error) = error else {
            return;
        };
        if lock(&self.state).write_pipeline.is_empty() {
            return;
        }
        if self.write_stream.handshake_complete() {
            self.handle_write_error(error).await;
        } else {
            self.handle_handshake_error(error).await;
        }
        if self.should_start_write_stream() {
            self.write_stream.start();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::types::BatchId;
    use crate::firestore::error::{failed_precondition, FirestoreErrorCode};
    use crate::firestore::model::{Mutation, Timestamp};
    use crate::firestore::remote::datastore::NoopTokenProvider;
    use crate::firestore::remote::remote_event::RemoteEvent;
    use crate::firestore::remote::serializer::JsonProtoSerializer;
    use crate::firestore::remote::stream::{MultiplexedConnection, MultiplexedStream};
    use crate::firestore::remote::streams::listen::{decode_message, encode_message};
    use crate::firestore::test_support::{connected_datastore, key, map, query, wait_until};
    use serde_json::{json, Value as JsonValue};

    #[derive(Default)]
    struct FakeSyncer {
        events: Mutex<Vec<RemoteEvent>>,
        remote_keys: Mutex<BTreeMap<TargetId, BTreeSet<DocumentKey>>>,
        batches: Mutex<Vec<MutationBatch>>,
        acknowledged: Mutex<Vec<BatchId>>,
        rejected_writes: Mutex<Vec<(BatchId, FirestoreErrorCode)>>,
        rejected_listens: Mutex<Vec<TargetId>>,
        online_states: Mutex<Vec<OnlineState>>,
        stream_token: Mutex<Vec<u8>>,
    }

    impl RemoteSyncer for FakeSyncer {
        fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            {
                let mut keys = self.remote_keys.lock().unwrap();
                for (target_id, change) in &event.target_changes {
                    let entry = keys.entry(*target_id).or_default();
                    entry.extend(change.added_documents.iter().cloned());
                    for removed in &change.removed_documents {
                        entry.remove(removed);
                    }
                }
            }
            self.events.lock().unwrap().push(event);
            box_remote_store_future(async { Ok(()) })
        }

        fn reject_listen(
            &self,
            target_id: TargetId,
            _error: FirestoreError,
        ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            self.rejected_listens.lock().unwrap().push(target_id);
            box_remote_store_future(async { Ok(()) })
        }

        fn apply_successful_write(
            &self,
            result: MutationBatchResult,
        ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            let batch_id = result.batch.batch_id;
            self.batches.lock().unwrap().retain(|batch| batch.batch_id != batch_id);
            self.acknowledged.lock().unwrap().push(batch_id);
            box_remote_store_future(async { Ok(()) })
        }

        fn reject_failed_write(
            &self,
            batch_id: BatchId,
            error: FirestoreError,
        ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            self.batches.lock().unwrap().retain(|batch| batch.batch_id != batch_id);
            self.rejected_writes.lock().unwrap().push((batch_id, error.code));
            box_remote_store_future(async { Ok(()) })
        }

        fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
            self.remote_keys
                .lock()
                .unwrap()
                .get(&target_id)
                .cloned()
                .unwrap_or_default()
        }

        fn next_mutation_batch(
            &self,
            after_batch_id: BatchId,
        ) -> RemoteStoreFuture<'_, FirestoreResult<Option<MutationBatch>>> {
            let next = self
                .batches
                .lock()
                .unwrap()
                .iter()
                .find(|batch| batch.batch_id > after_batch_id)
                .cloned();
            box_remote_store_future(async move { Ok(next) })
        }

        fn get_last_stream_token(&self) -> RemoteStoreFuture<'_, FirestoreResult<Vec<u8>>> {
            let token = self.stream_token.lock().unwrap().clone();
            box_remote_store_future(async move { Ok(token) })
        }

        fn set_last_stream_token(&self, token: Vec<u8>) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            *self.stream_token.lock().unwrap() = token;
            box_remote_store_future(async { Ok(()) })
        }

        fn get_last_remote_snapshot_version(
            &self,
        ) -> RemoteStoreFuture<'_, FirestoreResult<SnapshotVersion>> {
            box_remote_store_future(async { Ok(SnapshotVersion::min()) })
        }

        fn handle_credential_change(&self, _user: User) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            box_remote_store_future(async { Ok(()) })
        }

        fn apply_online_state_change(&self, online_state: OnlineState) {
            self.online_states.lock().unwrap().push(online_state);
        }
    }

    struct Harness {
        store: RemoteStore,
        syncer: Arc<FakeSyncer>,
        server: Arc<MultiplexedConnection>,
        queue: AsyncQueue,
        _syncer_handle: Arc<dyn RemoteSyncer>,
    }

    impl Harness {
        fn new() -> Self {
            let (datastore, server, database_id) = connected_datastore();
            let queue = AsyncQueue::new();
            let network = NetworkLayer::builder(
                datastore,
                Arc::new(NoopTokenProvider),
                queue.clone(),
                JsonProtoSerializer::new(database_id),
            )
            .build();
            let store = RemoteStore::new(queue.clone(), &network, &SyncSettings::default());
            let syncer = Arc::new(FakeSyncer::default());
            let handle: Arc<dyn RemoteSyncer> = syncer.clone();
            store.set_syncer(&handle);
            Self {
                store,
                syncer,
                server,
                queue,
                _syncer_handle: handle,
            }
        }

        async fn run<F, Fut>(&self, op: F)
        where
            F: FnOnce(RemoteStore) -> Fut + Send + 'static,
            Fut: std::future::Future<Output = ()> + Send + 'static,
        {
            let store = self.store.clone();
            self.queue
                .enqueue(move || async move {
                    op(store).await;
                    Ok(())
                })
                .await
                .unwrap();
        }
    }

    async fn next_json(peer: &MultiplexedStream) -> JsonValue {
        decode_message(&peer.next().await.unwrap().unwrap()).unwrap()
    }

    fn doc_json(path: &str) -> JsonValue {
        json!({
            "name": format!("projects/project/databases/(default)/documents/{path}"),
            "fields": { "n": { "integerValue": "1" } },
            "updateTime": "1970-01-01T00:00:01Z"
        })
    }

    fn target(target_id: TargetId) -> TargetData {
        TargetData::new(query("rooms").to_target(), target_id, TargetPurpose::Listen, 1)
    }

    async fn listen_and_sync_one_doc(harness: &Harness) -> MultiplexedStream {
        harness.run(|store| async move { store.start().await }).await;
        harness
            .run(|store| async move { store.listen(target(2)).await })
            .await;

        let peer = harness.server.accept().await.unwrap();
        let request = next_json(&peer).await;
        assert_eq!(request["addTarget"]["targetId"], json!(2));

        for response in [
            json!({ "targetChange": { "targetChangeType": "ADD", "targetIds": [2] } }),
            json!({ "documentChange": { "document": doc_json("rooms/a"), "targetIds": [2] } }),
            json!({ "targetChange": { "targetChangeType": "CURRENT", "targetIds": [2], "resumeToken": "AQ==" } }),
            json!({ "targetChange": { "targetIds": [], "readTime": "1970-01-01T00:00:02Z" } }),
        ] {
            peer.send(encode_message(&response)).await.unwrap();
        }
        wait_until(|| harness.syncer.events.lock().unwrap().len() == 1).await;
        peer
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn watch_changes_raise_remote_event() {
        let harness = Harness::new();
        let _peer = listen_and_sync_one_doc(&harness).await;

        let events = harness.syncer.events.lock().unwrap();
        let event = &events[0];
        assert_eq!(event.snapshot_version.to_micros(), 2_000_000);
        let change = &event.target_changes[&2];
        assert!(change.current);
        assert_eq!(change.resume_token, vec![1]);
        assert!(change.added_documents.contains(&key("rooms/a")));
        assert!(event.document_updates.contains_key(&key("rooms/a")));
        assert_eq!(harness.store.online_state(), OnlineState::Online);
        assert_eq!(
            *harness.syncer.online_states.lock().unwrap(),
            vec![OnlineState::Online]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn existence_filter_mismatch_relistens_without_token() {
        let harness = Harness::new();
        let peer = listen_and_sync_one_doc(&harness).await;

        for response in [
            json!({ "filter": { "targetId": 2, "count": 0 } }),
            json!({ "targetChange": { "targetIds": [], "readTime": "1970-01-01T00:00:03Z" } }),
        ] {
            peer.send(encode_message(&response)).await.unwrap();
        }

        let unwatch = next_json(&peer).await;
        assert_eq!(unwatch["removeTarget"], json!(2));
        let rewatch = next_json(&peer).await;
        assert_eq!(rewatch["addTarget"]["targetId"], json!(2));
        assert!(rewatch["addTarget"].get("resumeToken").is_none());
        assert_eq!(
            rewatch["labels"]["goog-listen-tags"],
            json!("existence-filter-mismatch")
        );

        wait_until(|| harness.syncer.events.lock().unwrap().len() == 2).await;
        let events = harness.syncer.events.lock().unwrap();
        assert!(events[1].target_mismatches.contains(&2));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn target_error_rejects_listen() {
        let harness = Harness::new();
        let peer = listen_and_sync_one_doc(&harness).await;

        let response = json!({
            "targetChange": {
                "targetChangeType": "REMOVE",
                "targetIds": [2],
                "cause": { "code": 7, "message": "denied" }
            }
        });
        peer.send(encode_message(&response)).await.unwrap();
        wait_until(|| !harness.syncer.rejected_listens.lock().unwrap().is_empty()).await;
        assert_eq!(*harness.syncer.rejected_listens.lock().unwrap(), vec![2]);
        assert!(harness.store.listen_target_ids().is_empty());
    }

    fn batch(batch_id: BatchId, path: &str) -> MutationBatch {
        MutationBatch::new(
            batch_id,
            Timestamp::now(),
            Vec::new(),
            vec![Mutation::set(key(path), map(&[("n", 1i64.into())]))],
        )
    }

    async fn open_write_stream(harness: &Harness) -> MultiplexedStream {
        harness.syncer.batches.lock().unwrap().push(batch(1, "rooms/a"));
        harness.run(|store| async move { store.start().await }).await;

        let peer = harness.server.accept().await.unwrap();
        let handshake = next_json(&peer).await;
        assert!(handshake.get("writes").is_none());
        peer.send(encode_message(&json!({ "streamToken": "AQ==" })))
            .await
            .unwrap();

        let request = next_json(&peer).await;
        assert_eq!(request["streamToken"], json!("AQ=="));
        assert_eq!(request["writes"].as_array().map(Vec::len), Some(1));
        peer
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn write_pipeline_sends_and_acknowledges_batches() {
        let harness = Harness::new();
        let peer = open_write_stream(&harness).await;
        assert_eq!(*harness.syncer.stream_token.lock().unwrap(), vec![1]);

        peer.send(encode_message(&json!({
            "streamToken": "Ag==",
            "commitTime": "1970-01-01T00:00:05Z",
            "writeResults": [{ "updateTime": "1970-01-01T00:00:05Z" }]
        })))
        .await
        .unwrap();
        wait_until(|| !harness.syncer.acknowledged.lock().unwrap().is_empty()).await;
        assert_eq!(*harness.syncer.acknowledged.lock().unwrap(), vec![1]);
        assert_eq!(harness.store.write_pipeline_len(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mismatched_write_results_reject_the_batch() {
        let harness = Harness::new();
        let peer = open_write_stream(&harness).await;

        peer.send(encode_message(&json!({
            "streamToken": "Ag==",
            "commitTime": "1970-01-01T00:00:05Z",
            "writeResults": [
                { "updateTime": "1970-01-01T00:00:05Z" },
                { "updateTime": "1970-01-01T00:00:05Z" }
            ]
        })))
        .await
        .unwrap();
        wait_until(|| !harness.syncer.rejected_writes.lock().unwrap().is_empty()).await;
        assert_eq!(
            *harness.syncer.rejected_writes.lock().unwrap(),
            vec![(1, FirestoreErrorCode::Internal)]
        );
        assert!(harness.syncer.acknowledged.lock().unwrap().is_empty());
        assert_eq!(harness.store.write_pipeline_len(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn permanent_write_error_rejects_head_batch() {
        let harness = Harness::new();
        let peer = open_write_stream(&harness).await;

        peer.fail(failed_precondition("precondition failed"))
            .await
            .unwrap();
        wait_until(|| !harness.syncer.rejected_writes.lock().unwrap().is_empty()).await;
        assert_eq!(
            *harness.syncer.rejected_writes.lock().unwrap(),
            vec![(1, FirestoreErrorCode::FailedPrecondition)]
        );
        assert_eq!(harness.store.write_pipeline_len(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disable_network_goes_offline_and_stops_streams() {
        let harness = Harness::new();
        harness.run(|store| async move { store.start().await }).await;
        harness
            .run(|store| async move { store.listen(target(2)).await })
            .await;
        assert!(harness.store.is_watch_stream_started());

        harness
            .run(|store| async move { store.disable_network().await })
            .await;
        assert!(!harness.store.is_watch_stream_started());
        assert!(!harness.store.can_use_network());
        assert_eq!(harness.store.online_state(), OnlineState::Offline);

        harness
            .run(|store| async move { store.enable_network().await })
            .await;
        assert!(harness.store.is_watch_stream_started());
        assert_eq!(harness.store.online_state(), OnlineState::Unknown);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn secondary_clients_stay_offline() {
        let harness = Harness::new();
        harness
            .run(|store| async move { store.apply_primary_state(false).await })
            .await;
        harness
            .run(|store| async move { store.listen(target(2)).await })
            .await;
        assert!(!harness.store.is_watch_stream_started());

        harness
            .run(|store| async move { store.apply_primary_state(true).await })
            .await;
        assert!(harness.store.is_watch_stream_started());
    }
}

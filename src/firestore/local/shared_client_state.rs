use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::firestore::async_queue::AsyncQueue;
use crate::firestore::core::listen_sequence::ListenSequenceNumber;
use crate::firestore::core::types::{BatchId, OnlineState, OnlineStateSource, TargetId};
use crate::firestore::error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::model::User;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationBatchState {
    Pending,
    Acknowledged,
    Rejected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryTargetState {
    NotCurrent,
    Current,
    Rejected,
}

/// What the sync engine does with state other clients published.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait SharedClientStateSyncer: Send + Sync + 'static {
    async fn apply_batch_state(
        &self,
        batch_id: BatchId,
        state: MutationBatchState,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()>;

    async fn apply_target_state(
        &self,
        target_id: TargetId,
        state: QueryTargetState,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()>;

    /// Targets that became active in some client, or are no longer active in
    /// any. Only the primary acts on these.
    async fn apply_active_targets_change(
        &self,
        added: Vec<TargetId>,
        removed: Vec<TargetId>,
    ) -> FirestoreResult<()>;

    fn apply_online_state_change(&self, online_state: OnlineState, source: OnlineStateSource);
}

pub type SequenceNumberHandler = Arc<dyn Fn(ListenSequenceNumber) + Send + Sync>;

/// State this client shares with the other clients of the same persistence
/// key: pending writes, listened targets, online state and the highest
/// sequence number.
pub trait SharedClientState: Send + Sync {
    fn set_syncer(&self, syncer: Weak<dyn SharedClientStateSyncer>);

    fn set_sequence_number_handler(&self, handler: SequenceNumberHandler);

    fn start(&self) -> FirestoreResult<()>;

    fn shutdown(&self);

    fn add_pending_mutation(&self, batch_id: BatchId);

    fn update_mutation_state(
        &self,
        batch_id: BatchId,
        state: MutationBatchState,
        error: Option<&FirestoreError>,
    );

    /// Marks `target_id` as listened to by this client and returns the last
    /// state some client published for it.
    fn add_local_query_target(&self, target_id: TargetId) -> QueryTargetState;

    fn remove_local_query_target(&self, target_id: TargetId);

    fn is_local_query_target(&self, target_id: TargetId) -> bool;

    /// Whether any client listens to `target_id`.
    fn is_active_query_target(&self, target_id: TargetId) -> bool;

    fn get_all_active_query_targets(&self) -> BTreeSet<TargetId>;

    fn clear_query_state(&self, target_id: TargetId);

    fn update_query_state(
        &self,
        target_id: TargetId,
        state: QueryTargetState,
        error: Option<&FirestoreError>,
    );

    fn handle_user_change(&self, user: &User, removed_batch_ids: &[BatchId], added_batch_ids: &[BatchId]);

    fn set_online_state(&self, online_state: OnlineState);

    fn write_sequence_number(&self, sequence_number: ListenSequenceNumber);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct MemoryState {
    active_target_ids: BTreeSet<TargetId>,
    query_state: BTreeMap<TargetId, QueryTargetState>,
}

/// Shared state for a client that shares nothing: targets are tracked for
/// this client alone.
#[derive(Default)]
pub struct MemorySharedClientState {
    state: Mutex<MemoryState>,
}

impl MemorySharedClientState {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SharedClientState for MemorySharedClientState {
    fn set_syncer(&self, _syncer: Weak<dyn SharedClientStateSyncer>) {}

    fn set_sequence_number_handler(&self, _handler: SequenceNumberHandler) {}

    fn start(&self) -> FirestoreResult<()> {
        Ok(())
    }

    fn shutdown(&self) {}

    fn add_pending_mutation(&self, _batch_id: BatchId) {}

    fn update_mutation_state(
        &self,
        _batch_id: BatchId,
        _state: MutationBatchState,
        _error: Option<&FirestoreError>,
    ) {
    }

    fn add_local_query_target(&self, target_id: TargetId) -> QueryTargetState {
        let mut state = lock(&self.state);
        state.active_target_ids.insert(target_id);
        state
            .query_state
            .get(&target_id)
            .copied()
            .unwrap_or(QueryTargetState::NotCurrent)
    }

    fn remove_local_query_target(&self, target_id: TargetId) {
        lock(&self.state).active_target_ids.remove(&target_id);
    }

    fn is_local_query_target(&self, target_id: TargetId) -> bool {
        lock(&self.state).active_target_ids.contains(&target_id)
    }

    fn is_active_query_target(&self, target_id: TargetId) -> bool {
        self.is_local_query_target(target_id)
    }

    fn get_all_active_query_targets(&self) -> BTreeSet<TargetId> {
        lock(&self.state).active_target_ids.clone()
    }

    fn clear_query_state(&self, target_id: TargetId) {
        lock(&self.state).query_state.remove(&target_id);
    }

    fn update_query_state(
        &self,
        target_id: TargetId,
        state: QueryTargetState,
        _error: Option<&FirestoreError>,
    ) {
        lock(&self.state).query_state.insert(target_id, state);
    }

    fn handle_user_change(&self, _user: &User, _removed: &[BatchId], _added: &[BatchId]) {}

    fn set_online_state(&self, _online_state: OnlineState) {}

    fn write_sequence_number(&self, _sequence_number: ListenSequenceNumber) {}
}

/// A change made to [`SharedStorage`] through another handle.
#[derive(Clone, Debug, PartialEq)]
pub struct StorageEvent {
    pub key: String,
    /// `None` when the item was removed.
    pub new_value: Option<String>,
}

pub type StorageListener = Arc<dyn Fn(StorageEvent) + Send + Sync>;

/// String key-value storage visible to every client of a persistence key.
/// Listeners hear about changes made by other handles only, never their own.
pub trait SharedStorage: Send + Sync {
    fn get_item(&self, key: &str) -> Option<String>;

    fn set_item(&self, key: &str, value: String);

    fn remove_item(&self, key: &str);

    fn keys(&self) -> Vec<String>;

    fn subscribe(&self, listener: StorageListener) -> u64;

    fn unsubscribe(&self, subscription: u64);
}

struct StorageArea {
    items: Mutex<BTreeMap<String, String>>,
    /// (handle, subscription, listener)
    listeners: Mutex<Vec<(u64, u64, StorageListener)>>,
}

static STORAGE_AREAS: Lazy<Mutex<HashMap<String, Weak<StorageArea>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));
static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide [`SharedStorage`]. Handles opened with the same name share
/// items, the way tabs of one origin share local storage.
pub struct InMemorySharedStorage {
    area: Arc<StorageArea>,
    handle_id: u64,
}

impl InMemorySharedStorage {
    pub fn open(name: &str) -> Arc<Self> {
        let area = {
            let mut areas = lock(&STORAGE_AREAS);
            match areas.get(name).and_then(Weak::upgrade) {
                Some(area) => area,
                None => {
                    let area = Arc::new(StorageArea {
                        items: Mutex::new(BTreeMap::new()),
                        listeners: Mutex::new(Vec::new()),
                    });
                    areas.insert(name.to_string(), Arc::downgrade(&area));
                    area
                }
            }
        };
        Arc::new(Self {
            area,
            handle_id: NEXT_HANDLE_ID.fetch_add(1, Ordering::SeqCst),
        })
    }

    fn broadcast(&self, event: StorageEvent) {
        let listeners: Vec<StorageListener> = lock(&self.area.listeners)
            .iter()
            .filter(|(handle, _, _)| *handle != self.handle_id)
            .map(|(_, _, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(event.clone());
        }
    }
}

impl SharedStorage for InMemorySharedStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        lock(&self.area.items).get(key).cloned()
    }

    fn set_item(&self, key: &str, value: String) {
        lock(&self.area.items).insert(key.to_string(), value.clone());
        self.broadcast(StorageEvent {
            key: key.to_string(),
            new_value: Some(value),
        });
    }

    fn remove_item(&self, key: &str) {
        if lock(&self.area.items).remove(key).is_none() {
            return;
        }
        self.broadcast(StorageEvent {
            key: key.to_string(),
            new_value: None,
        });
    }

    fn keys(&self) -> Vec<String> {
        lock(&self.area.items).keys().cloned().collect()
    }

    fn subscribe(&self, listener: StorageListener) -> u64 {
        let subscription = NEXT_HANDLE_ID.fetch_add(1, Ordering::SeqCst);
        lock(&self.area.listeners).push((self.handle_id, subscription, listener));
        subscription
    }

    fn unsubscribe(&self, subscription: u64) {
        lock(&self.area.listeners).retain(|(_, id, _)| *id != subscription);
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredError {
    code: i32,
    message: String,
}

impl StoredError {
    fn from_error(error: &FirestoreError) -> Self {
        Self {
            code: error.code.rpc_code(),
            message: error.message().to_string(),
        }
    }

    fn into_error(self) -> FirestoreError {
        FirestoreError::new(FirestoreErrorCode::from_rpc_code(self.code), self.message)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MutationMetadata {
    state: MutationBatchState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<StoredError>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryTargetMetadata {
    state: QueryTargetState,
    update_time_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<StoredError>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientStateRecord {
    active_target_ids: BTreeSet<TargetId>,
    update_time_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SharedOnlineState {
    client_id: String,
    online_state: OnlineState,
}

/// Parsed form of a storage key this client cares about.
enum StorageKey {
    Client(String),
    Mutation { batch_id: BatchId, uid: Option<String> },
    Target(TargetId),
    OnlineState,
    SequenceNumber,
}

struct StorageKeys {
    clients_prefix: String,
    mutations_prefix: String,
    targets_prefix: String,
    online_state: String,
    sequence_number: String,
}

impl StorageKeys {
    fn new(persistence_key: &str) -> Self {
        Self {
            clients_prefix: format!("firestore_clients_{persistence_key}_"),
            mutations_prefix: format!("firestore_mutations_{persistence_key}_"),
            targets_prefix: format!("firestore_targets_{persistence_key}_"),
            online_state: format!("firestore_online_state_{persistence_key}"),
            sequence_number: format!("firestore_sequence_number_{persistence_key}"),
        }
    }

    fn client(&self, client_id: &str) -> String {
        format!("{}{client_id}", self.clients_prefix)
    }

    fn mutation(&self, batch_id: BatchId, user: &User) -> String {
        match user.uid() {
            Some(uid) => format!("{}{batch_id}_{uid}", self.mutations_prefix),
            None => format!("{}{batch_id}", self.mutations_prefix),
        }
    }

    fn target(&self, target_id: TargetId) -> String {
        format!("{}{target_id}", self.targets_prefix)
    }

    fn parse(&self, key: &str) -> Option<StorageKey> {
        if key == self.online_state {
            return Some(StorageKey::OnlineState);
        }
        if key == self.sequence_number {
            return Some(StorageKey::SequenceNumber);
        }
        if let Some(client_id) = key.strip_prefix(&self.clients_prefix) {
            return Some(StorageKey::Client(client_id.to_string()));
        }
        if let Some(rest) = key.strip_prefix(&self.mutations_prefix) {
            let (batch_id, uid) = match rest.split_once('_') {
                Some((batch_id, uid)) => (batch_id, Some(uid.to_string())),
                None => (rest, None),
            };
            return Some(StorageKey::Mutation {
                batch_id: batch_id.parse().ok()?,
                uid,
            });
        }
        if let Some(target_id) = key.strip_prefix(&self.targets_prefix) {
            return target_id.parse().ok().map(StorageKey::Target);
        }
        None
    }
}

struct StorageClientStateInner {
    started: bool,
    current_user: User,
    local_targets: BTreeSet<TargetId>,
    remote_clients: BTreeMap<String, BTreeSet<TargetId>>,
    syncer: Option<Weak<dyn SharedClientStateSyncer>>,
    sequence_number_handler: Option<SequenceNumberHandler>,
    subscription: Option<u64>,
}

/// [`SharedClientState`] over a [`SharedStorage`]. Each change is written
/// as one JSON item; other clients replay it through their storage
/// listener on their own async queue.
pub struct StorageSharedClientState {
    storage: Arc<dyn SharedStorage>,
    queue: AsyncQueue,
    client_id: String,
    keys: StorageKeys,
    state: Mutex<StorageClientStateInner>,
    this: Weak<StorageSharedClientState>,
}

impl StorageSharedClientState {
    pub fn new(
        storage: Arc<dyn SharedStorage>,
        queue: AsyncQueue,
        persistence_key: &str,
        client_id: impl Into<String>,
        initial_user: User,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            storage,
            queue,
            client_id: client_id.into(),
            keys: StorageKeys::new(persistence_key),
            state: Mutex::new(StorageClientStateInner {
                started: false,
                current_user: initial_user,
                local_targets: BTreeSet::new(),
                remote_clients: BTreeMap::new(),
                syncer: None,
                sequence_number_handler: None,
                subscription: None,
            }),
            this: this.clone(),
        })
    }

    fn persist_client_state(&self) {
        let record = ClientStateRecord {
            active_target_ids: lock(&self.state).local_targets.clone(),
            update_time_ms: chrono::Utc::now().timestamp_millis(),
        };
        self.set_json(&self.keys.client(&self.client_id), &record);
    }

    fn persist_mutation_state(
        &self,
        batch_id: BatchId,
        state: MutationBatchState,
        error: Option<&FirestoreError>,
    ) {
        let user = lock(&self.state).current_user.clone();
        let record = MutationMetadata {
            state,
            error: error.map(StoredError::from_error),
        };
        self.set_json(&self.keys.mutation(batch_id, &user), &record);
    }

    fn set_json<T: Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_string(value) {
            Ok(json) => self.storage.set_item(key, json),
            Err(err) => log::warn!("Failed to encode shared client state for {key}: {err}"),
        }
    }

    fn syncer(&self) -> Option<Arc<dyn SharedClientStateSyncer>> {
        lock(&self.state).syncer.as_ref().and_then(Weak::upgrade)
    }

    fn handle_storage_event(&self, event: StorageEvent) {
        if !lock(&self.state).started {
            return;
        }
        let Some(key) = self.keys.parse(&event.key) else {
            return;
        };
        match key {
            StorageKey::Client(client_id) => {
                if client_id == self.client_id {
                    return;
                }
                let targets = match &event.new_value {
                    Some(value) => match serde_json::from_str::<ClientStateRecord>(value) {
                        Ok(record) => Some(record.active_target_ids),
                        Err(err) => {
                            log::warn!("Failed to parse client state for {client_id}: {err}");
                            return;
                        }
                    },
                    None => None,
                };
                self.handle_client_state_change(client_id, targets);
            }
            StorageKey::Mutation { batch_id, uid } => {
                let Some(value) = event.new_value else {
                    return;
                };
                if lock(&self.state).current_user.uid() != uid.as_deref() {
                    return;
                }
                let Ok(metadata) = serde_json::from_str::<MutationMetadata>(&value) else {
                    log::warn!("Failed to parse mutation state for batch {batch_id}");
                    return;
                };
                self.dispatch(move |syncer| async move {
                    let error = metadata.error.map(StoredError::into_error);
                    syncer.apply_batch_state(batch_id, metadata.state, error).await
                });
            }
            StorageKey::Target(target_id) => {
                let Some(value) = event.new_value else {
                    return;
                };
                let Ok(metadata) = serde_json::from_str::<QueryTargetMetadata>(&value) else {
                    log::warn!("Failed to parse query target state for target {target_id}");
                    return;
                };
                self.dispatch(move |syncer| async move {
                    let error = metadata.error.map(StoredError::into_error);
                    syncer.apply_target_state(target_id, metadata.state, error).await
                });
            }
            StorageKey::OnlineState => {
                let Some(value) = event.new_value else {
                    return;
                };
                let Ok(shared) = serde_json::from_str::<SharedOnlineState>(&value) else {
                    return;
                };
                // Only the primary publishes online state; ignore leftovers of
                // clients that are gone.
                if !lock(&self.state).remote_clients.contains_key(&shared.client_id) {
                    return;
                }
                if let Some(syncer) = self.syncer() {
                    syncer.apply_online_state_change(
                        shared.online_state,
                        OnlineStateSource::SharedClientState,
                    );
                }
            }
            StorageKey::SequenceNumber => {
                let Some(sequence_number) = event
                    .new_value
                    .and_then(|value| value.parse::<ListenSequenceNumber>().ok())
                else {
                    return;
                };
                let handler = lock(&self.state).sequence_number_handler.clone();
                if let Some(handler) = handler {
                    handler(sequence_number);
                }
            }
        }
    }

    /// Records another client's active targets and reports targets that
    /// became active or went inactive across all clients.
    fn handle_client_state_change(&self, client_id: String, targets: Option<BTreeSet<TargetId>>) {
        let (added, removed) = {
            let mut state = lock(&self.state);
            let before = Self::all_active_targets(&state);
            match targets {
                Some(targets) => {
                    state.remote_clients.insert(client_id, targets);
                }
                None => {
                    state.remote_clients.remove(&client_id);
                }
            }
            let after = Self::all_active_targets(&state);
            let added: Vec<TargetId> = after.difference(&before).copied().collect();
            let removed: Vec<TargetId> = before.difference(&after).copied().collect();
            (added, removed)
        };
        if added.is_empty() && removed.is_empty() {
            return;
        }
        self.dispatch(move |syncer| async move {
            syncer.apply_active_targets_change(added, removed).await
        });
    }

    fn all_active_targets(state: &StorageClientStateInner) -> BTreeSet<TargetId> {
        let mut targets = state.local_targets.clone();
        for client_targets in state.remote_clients.values() {
            targets.extend(client_targets.iter().copied());
        }
        targets
    }

    fn dispatch<F, Fut>(&self, op: F)
    where
        F: FnOnce(Arc<dyn SharedClientStateSyncer>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        let Some(syncer) = self.syncer() else {
            return;
        };
        self.queue.enqueue_and_forget(move || async move {
            if let Err(err) = op(syncer).await {
                log::warn!("Failed to apply shared client state: {err}");
            }
        });
    }
}

impl SharedClientState for StorageSharedClientState {
    fn set_syncer(&self, syncer: Weak<dyn SharedClientStateSyncer>) {
        lock(&self.state).syncer = Some(syncer);
    }

    fn set_sequence_number_handler(&self, handler: SequenceNumberHandler) {
        lock(&self.state).sequence_number_handler = Some(handler);
    }

    fn start(&self) -> FirestoreResult<()> {
        let mut remote_clients = BTreeMap::new();
        for key in self.storage.keys() {
            let Some(StorageKey::Client(client_id)) = self.keys.parse(&key) else {
                continue;
            };
            if client_id == self.client_id {
                continue;
            }
            let Some(value) = self.storage.get_item(&key) else {
                continue;
            };
            match serde_json::from_str::<ClientStateRecord>(&value) {
                Ok(record) => {
                    remote_clients.insert(client_id, record.active_target_ids);
                }
                Err(err) => log::warn!("Ignoring unreadable client state {key}: {err}"),
            }
        }

        let this = self.this.clone();
        let subscription = self.storage.subscribe(Arc::new(move |event| {
            if let Some(state) = this.upgrade() {
                state.handle_storage_event(event);
            }
        }));
        {
            let mut state = lock(&self.state);
            state.remote_clients = remote_clients;
            state.subscription = Some(subscription);
            state.started = true;
        }
        self.persist_client_state();

        if let Some(value) = self.storage.get_item(&self.keys.online_state) {
            self.handle_storage_event(StorageEvent {
                key: self.keys.online_state.clone(),
                new_value: Some(value),
            });
        }
        Ok(())
    }

    fn shutdown(&self) {
        let subscription = {
            let mut state = lock(&self.state);
            state.started = false;
            state.subscription.take()
        };
        if let Some(subscription) = subscription {
            self.storage.unsubscribe(subscription);
        }
        self.storage.remove_item(&self.keys.client(&self.client_id));
    }

    fn add_pending_mutation(&self, batch_id: BatchId) {
        self.persist_mutation_state(batch_id, MutationBatchState::Pending, None);
    }

    fn update_mutation_state(
        &self,
        batch_id: BatchId,
        state: MutationBatchState,
        error: Option<&FirestoreError>,
    ) {
        self.persist_mutation_state(batch_id, state, error);
        // Storage events are delivered in order, so other clients have seen
        // the final state by the time the removal reaches them.
        let user = lock(&self.state).current_user.clone();
        self.storage.remove_item(&self.keys.mutation(batch_id, &user));
    }

    fn add_local_query_target(&self, target_id: TargetId) -> QueryTargetState {
        let mut query_state = QueryTargetState::NotCurrent;
        if self.is_active_query_target(target_id) {
            if let Some(metadata) = self
                .storage
                .get_item(&self.keys.target(target_id))
                .and_then(|value| serde_json::from_str::<QueryTargetMetadata>(&value).ok())
            {
                query_state = metadata.state;
            }
        }
        lock(&self.state).local_targets.insert(target_id);
        self.persist_client_state();
        query_state
    }

    fn remove_local_query_target(&self, target_id: TargetId) {
        lock(&self.state).local_targets.remove(&target_id);
        self.persist_client_state();
    }

    fn is_local_query_target(&self, target_id: TargetId) -> bool {
        lock(&self.state).local_targets.contains(&target_id)
    }

    fn is_active_query_target(&self, target_id: TargetId) -> bool {
        Self::all_active_targets(&lock(&self.state)).contains(&target_id)
    }

    fn get_all_active_query_targets(&self) -> BTreeSet<TargetId> {
        Self::all_active_targets(&lock(&self.state))
    }

    fn clear_query_state(&self, target_id: TargetId) {
        self.storage.remove_item(&self.keys.target(target_id));
    }

    fn update_query_state(
        &self,
        target_id: TargetId,
        state: QueryTargetState,
        error: Option<&FirestoreError>,
    ) {
        let record = QueryTargetMetadata {
            state,
            update_time_ms: chrono::Utc::now().timestamp_millis(),
            error: error.map(StoredError::from_error),
        };
        self.set_json(&self.keys.target(target_id), &record);
    }

    fn handle_user_change(&self, user: &User, removed_batch_ids: &[BatchId], added_batch_ids: &[BatchId]) {
        let previous_user = lock(&self.state).current_user.clone();
        for batch_id in removed_batch_ids {
            self.storage.remove_item(&self.keys.mutation(*batch_id, &previous_user));
        }
        lock(&self.state).current_user = user.clone();
        for batch_id in added_batch_ids {
            self.add_pending_mutation(*batch_id);
        }
    }

    fn set_online_state(&self, online_state: OnlineState) {
        let shared = SharedOnlineState {
            client_id: self.client_id.clone(),
            online_state,
        };
        self.set_json(&self.keys.online_state, &shared);
    }

    fn write_sequence_number(&self, sequence_number: ListenSequenceNumber) {
        self.storage
            .set_item(&self.keys.sequence_number, sequence_number.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::permission_denied;
    use crate::firestore::test_support::wait_until;

    #[derive(Default)]
    struct RecordingSyncer {
        batches: Mutex<Vec<(BatchId, MutationBatchState, Option<FirestoreErrorCode>)>>,
        targets: Mutex<Vec<(TargetId, QueryTargetState)>>,
        active_changes: Mutex<Vec<(Vec<TargetId>, Vec<TargetId>)>>,
        online_states: Mutex<Vec<OnlineState>>,
    }

    #[async_trait]
    impl SharedClientStateSyncer for RecordingSyncer {
        async fn apply_batch_state(
            &self,
            batch_id: BatchId,
            state: MutationBatchState,
            error: Option<FirestoreError>,
        ) -> FirestoreResult<()> {
            self.batches
                .lock()
                .unwrap()
                .push((batch_id, state, error.map(|err| err.code)));
            Ok(())
        }

        async fn apply_target_state(
            &self,
            target_id: TargetId,
            state: QueryTargetState,
            _error: Option<FirestoreError>,
        ) -> FirestoreResult<()> {
            self.targets.lock().unwrap().push((target_id, state));
            Ok(())
        }

        async fn apply_active_targets_change(
            &self,
            added: Vec<TargetId>,
            removed: Vec<TargetId>,
        ) -> FirestoreResult<()> {
            self.active_changes.lock().unwrap().push((added, removed));
            Ok(())
        }

        fn apply_online_state_change(&self, online_state: OnlineState, _source: OnlineStateSource) {
            self.online_states.lock().unwrap().push(online_state);
        }
    }

    struct Client {
        state: Arc<StorageSharedClientState>,
        syncer: Arc<RecordingSyncer>,
        _syncer_handle: Arc<dyn SharedClientStateSyncer>,
    }

    fn client(storage_name: &str, client_id: &str) -> Client {
        let state = StorageSharedClientState::new(
            InMemorySharedStorage::open(storage_name),
            AsyncQueue::new(),
            "app",
            client_id,
            User::new("alice"),
        );
        let syncer = Arc::new(RecordingSyncer::default());
        let handle: Arc<dyn SharedClientStateSyncer> = syncer.clone();
        state.set_syncer(Arc::downgrade(&handle));
        state.start().unwrap();
        Client {
            state,
            syncer,
            _syncer_handle: handle,
        }
    }

    #[test]
    fn memory_state_remembers_query_state() {
        let state = MemorySharedClientState::new();
        assert_eq!(state.add_local_query_target(2), QueryTargetState::NotCurrent);
        state.update_query_state(2, QueryTargetState::Current, None);
        assert_eq!(state.add_local_query_target(2), QueryTargetState::Current);
        assert!(state.is_active_query_target(2));

        state.remove_local_query_target(2);
        state.clear_query_state(2);
        assert!(!state.is_local_query_target(2));
        assert!(state.get_all_active_query_targets().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn active_targets_are_shared_between_clients() {
        let primary = client("shared-state-targets", "primary");
        let secondary = client("shared-state-targets", "secondary");

        assert_eq!(
            secondary.state.add_local_query_target(4),
            QueryTargetState::NotCurrent
        );
        wait_until(|| primary.syncer.active_changes.lock().unwrap().len() == 1).await;
        assert_eq!(
            primary.syncer.active_changes.lock().unwrap()[0],
            (vec![4], vec![])
        );
        assert!(primary.state.is_active_query_target(4));
        assert!(!primary.state.is_local_query_target(4));

        primary.state.update_query_state(4, QueryTargetState::Current, None);
        wait_until(|| secondary.syncer.targets.lock().unwrap().len() == 1).await;
        assert_eq!(
            secondary.syncer.targets.lock().unwrap()[0],
            (4, QueryTargetState::Current)
        );

        secondary.state.shutdown();
        wait_until(|| primary.syncer.active_changes.lock().unwrap().len() == 2).await;
        assert_eq!(
            primary.syncer.active_changes.lock().unwrap()[1],
            (vec![], vec![4])
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mutation_results_reach_other_clients_of_the_same_user() {
        let primary = client("shared-state-mutations", "primary");
        let secondary = client("shared-state-mutations", "secondary");

        secondary.state.add_pending_mutation(1);
        primary.state.update_mutation_state(
            1,
            MutationBatchState::Rejected,
            Some(&permission_denied("denied")),
        );
        wait_until(|| !secondary.syncer.batches.lock().unwrap().is_empty()).await;
        assert_eq!(
            secondary.syncer.batches.lock().unwrap()[0],
            (1, MutationBatchState::Rejected, Some(FirestoreErrorCode::PermissionDenied))
        );
        assert!(primary
            .syncer
            .batches
            .lock()
            .unwrap()
            .iter()
            .all(|(_, state, _)| *state == MutationBatchState::Pending));

        secondary.state.handle_user_change(&User::new("bob"), &[], &[]);
        primary
            .state
            .update_mutation_state(2, MutationBatchState::Acknowledged, None);
        primary.state.set_online_state(OnlineState::Online);
        wait_until(|| !secondary.syncer.online_states.lock().unwrap().is_empty()).await;
        assert_eq!(secondary.syncer.batches.lock().unwrap().len(), 1);
    }

    #[test]
    fn storage_handles_only_hear_other_handles() {
        let first = InMemorySharedStorage::open("storage-handles");
        let second = InMemorySharedStorage::open("storage-handles");
        let heard = Arc::new(Mutex::new(Vec::new()));
        for (name, handle) in [("first", &first), ("second", &second)] {
            let heard = Arc::clone(&heard);
            handle.subscribe(Arc::new(move |event: StorageEvent| {
                heard.lock().unwrap().push((name, event.key));
            }));
        }

        first.set_item("k", "v".to_string());
        assert_eq!(*heard.lock().unwrap(), vec![("second", "k".to_string())]);
        assert_eq!(second.get_item("k").as_deref(), Some("v"));
    }

    #[test]
    fn storage_keys_round_trip() {
        let keys = StorageKeys::new("app");
        assert!(matches!(
            keys.parse(&keys.mutation(7, &User::new("alice"))),
            Some(StorageKey::Mutation { batch_id: 7, uid: Some(uid) }) if uid == "alice"
        ));
        assert!(matches!(
            keys.parse(&keys.mutation(7, &User::unauthenticated())),
            Some(StorageKey::Mutation { batch_id: 7, uid: None })
        ));
        assert!(matches!(keys.parse(&keys.target(3)), Some(StorageKey::Target(3))));
        assert!(keys.parse("firestore_clients_other_x").is_none());
    }
}

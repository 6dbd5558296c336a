use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::firestore::async_queue::{AsyncQueue, DelayedOperation, QueueFuture, TimerId};
use crate::firestore::core::listen_sequence::{ListenSequence, ListenSequenceNumber};
use crate::firestore::error::{failed_precondition, primary_lease_lost, FirestoreResult};
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::kv_store::{
    KvStore, KvTransaction, TransactionMode, CLIENT_METADATA, PRIMARY_CLIENT,
};
use crate::firestore::local::local_serializer::{DbClientMetadata, DbPrimaryClient, LocalSerializer};
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::local::target_cache::TargetCache;
use crate::firestore::model::{Timestamp, User};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::settings::{ClientConfig, SyncSettings};

const PRIMARY_CLIENT_KEY: &str = "owner";

const PRIMARY_LEASE_EXCLUSIVE_MESSAGE: &str =
    "There is another client with exclusive access to the persisted cache. \
     Enable tab synchronization on every client sharing the cache.";

/// Called on the async queue whenever this client gains or loses the
/// primary lease.
pub type PrimaryStateListener = Arc<dyn Fn(bool) -> QueueFuture<FirestoreResult<()>> + Send + Sync>;

/// Receives every sequence number handed out, so other clients can catch up.
pub type SequenceNumberSyncer = Arc<dyn Fn(ListenSequenceNumber) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now_millis() -> i64 {
    Timestamp::now().to_millis()
}

fn is_within_age(update_time_ms: i64, max_age_ms: i64, now: i64) -> bool {
    if update_time_ms < now - max_age_ms {
        return false;
    }
    if update_time_ms > now {
        log::warn!("Detected an update time in the future: {update_time_ms} > {now}");
        return false;
    }
    true
}

/// A storage transaction together with the sequence number of the
/// accesses it records.
pub struct PersistenceTransaction<'t, 's> {
    kv: &'t mut KvTransaction<'s>,
    current_sequence_number: ListenSequenceNumber,
}

impl<'t, 's> PersistenceTransaction<'t, 's> {
    pub fn current_sequence_number(&self) -> ListenSequenceNumber {
        self.current_sequence_number
    }
}

impl<'t, 's> Deref for PersistenceTransaction<'t, 's> {
    type Target = KvTransaction<'s>;

    fn deref(&self) -> &KvTransaction<'s> {
        self.kv
    }
}

impl<'t, 's> DerefMut for PersistenceTransaction<'t, 's> {
    fn deref_mut(&mut self) -> &mut KvTransaction<'s> {
        self.kv
    }
}

struct PersistenceState {
    started: bool,
    terminated: bool,
    is_primary: bool,
    network_enabled: bool,
    in_foreground: bool,
    sequence: ListenSequence,
    sequence_number_syncer: Option<SequenceNumberSyncer>,
    primary_state_listener: Option<PrimaryStateListener>,
    refresh_timer: Option<DelayedOperation>,
    last_garbage_collection_ms: i64,
}

/// Durable client state: the key-value store, the caches laid out in it and
/// the primary lease that decides which of the clients sharing the store
/// talks to the backend.
///
/// Each client refreshes its metadata row every few seconds and re-evaluates
/// the lease at the same time. A client holding a valid lease keeps it while
/// its network is enabled; otherwise a foreground, network-enabled client is
/// preferred.
pub struct Persistence {
    kv: Arc<KvStore>,
    client_id: String,
    allow_tab_synchronization: bool,
    settings: SyncSettings,
    serializer: LocalSerializer,
    target_cache: TargetCache,
    remote_document_cache: RemoteDocumentCache,
    index_manager: IndexManager,
    queue: AsyncQueue,
    state: Mutex<PersistenceState>,
    this: Weak<Persistence>,
}

impl Persistence {
    pub fn new(config: &ClientConfig, queue: AsyncQueue) -> Arc<Self> {
        let serializer =
            LocalSerializer::new(JsonProtoSerializer::new(config.database_id.clone()));
        let kv = KvStore::open(&Self::storage_name(config));
        Arc::new_cyclic(|this| Persistence {
            kv,
            client_id: config.client_id.clone(),
            allow_tab_synchronization: config.settings.allow_tab_synchronization,
            settings: config.settings.clone(),
            target_cache: TargetCache::new(serializer.clone()),
            remote_document_cache: RemoteDocumentCache::new(serializer.clone(), IndexManager::new()),
            index_manager: IndexManager::new(),
            serializer,
            queue,
            state: Mutex::new(PersistenceState {
                started: false,
                terminated: false,
                is_primary: false,
                network_enabled: true,
                in_foreground: config.in_foreground,
                sequence: ListenSequence::new(0),
                sequence_number_syncer: None,
                primary_state_listener: None,
                refresh_timer: None,
                last_garbage_collection_ms: 0,
            }),
            this: this.clone(),
        })
    }

    /// Name of the store shared by every client of the same persistence key
    /// and database.
    pub fn storage_name(config: &ClientConfig) -> String {
        let database_id = &config.database_id;
        let mut name = format!(
            "firestore/{}/{}/",
            config.persistence_key,
            database_id.project_id()
        );
        if !database_id.is_default_database() {
            name.push_str(database_id.database());
            name.push('/');
        }
        name
    }

    /// Joins the set of clients and tries to take the primary lease. Fails
    /// if another client holds the lease exclusively.
    pub async fn start(&self) -> FirestoreResult<()> {
        self.update_client_metadata_and_try_become_primary().await?;
        if !self.is_primary() && !self.allow_tab_synchronization {
            return Err(failed_precondition(PRIMARY_LEASE_EXCLUSIVE_MESSAGE));
        }
        let highest = self
            .run_transaction("getHighestListenSequenceNumber", TransactionMode::ReadOnly, |txn| {
                self.target_cache.get_highest_sequence_number(txn)
            })
            .await?;
        {
            let mut state = lock(&self.state);
            state.sequence = ListenSequence::new(highest);
            state.started = true;
        }
        self.schedule_client_metadata_and_primary_lease_refreshes();
        Ok(())
    }

    /// Releases the lease and forgets this client. The client is marked
    /// zombied while that runs so no other client trusts a stale lease.
    pub async fn shutdown(&self) {
        let timer = {
            let mut state = lock(&self.state);
            state.started = false;
            state.refresh_timer.take()
        };
        self.kv.set_zombied(&self.client_id, true);
        if let Some(timer) = timer {
            timer.cancel();
        }
        let result = self
            .kv
            .run(TransactionMode::ReadWrite, |txn| {
                self.release_primary_lease_if_held(txn)?;
                txn.delete(CLIENT_METADATA, self.client_id.clone())
            })
            .await;
        if let Err(err) = result {
            log::warn!("Failed to release the primary lease during shutdown: {err}");
        }
        self.kv.set_zombied(&self.client_id, false);
        let mut state = lock(&self.state);
        state.terminated = true;
        state.is_primary = false;
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_started(&self) -> bool {
        lock(&self.state).started
    }

    pub fn is_primary(&self) -> bool {
        lock(&self.state).is_primary
    }

    pub fn serializer(&self) -> &LocalSerializer {
        &self.serializer
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<KvStore> {
        &self.kv
    }

    pub fn target_cache(&self) -> &TargetCache {
        &self.target_cache
    }

    pub fn remote_document_cache(&self) -> &RemoteDocumentCache {
        &self.remote_document_cache
    }

    pub fn index_manager(&self) -> &IndexManager {
        &self.index_manager
    }

    pub fn mutation_queue(&self, user: &User) -> MutationQueue {
        MutationQueue::new(user, self.serializer.clone())
    }

    /// Registers the callback for lease changes and reports the current
    /// state to it right away.
    pub async fn set_primary_state_listener(&self, listener: PrimaryStateListener) -> FirestoreResult<()> {
        let is_primary = {
            let mut state = lock(&self.state);
            state.primary_state_listener = Some(Arc::clone(&listener));
            state.is_primary
        };
        listener(is_primary).await
    }

    pub fn set_sequence_number_syncer(&self, syncer: SequenceNumberSyncer) {
        lock(&self.state).sequence_number_syncer = Some(syncer);
    }

    /// Catches the local sequence up with one published by another client.
    pub fn observe_sequence_number(&self, sequence_number: ListenSequenceNumber) {
        lock(&self.state).sequence.observe(sequence_number);
    }

    /// A client whose network is disabled gives up the lease at its next
    /// refresh if another client can take it.
    pub fn set_network_enabled(&self, enabled: bool) {
        self.update_eligibility(|state| {
            let changed = state.network_enabled != enabled;
            state.network_enabled = enabled;
            changed
        });
    }

    pub fn set_in_foreground(&self, in_foreground: bool) {
        self.update_eligibility(|state| {
            let changed = state.in_foreground != in_foreground;
            state.in_foreground = in_foreground;
            changed
        });
    }

    fn update_eligibility(&self, update: impl FnOnce(&mut PersistenceState) -> bool) {
        if !update(&mut lock(&self.state)) {
            return;
        }
        let this = self.this.clone();
        self.queue.enqueue_and_forget(move || async move {
            let Some(persistence) = this.upgrade() else {
                return;
            };
            if !persistence.is_started() {
                return;
            }
            if let Err(err) = persistence.update_client_metadata_and_try_become_primary().await {
                log::warn!("Failed to update client metadata: {err}");
            }
        });
    }

    /// Runs `body` in a storage transaction of `mode`.
    ///
    /// `ReadWritePrimary` transactions first check that this client still
    /// holds the primary lease, failing with a lease-lost error otherwise,
    /// and extend the lease when they commit.
    pub async fn run_transaction<T, F>(
        &self,
        action: &str,
        mode: TransactionMode,
        body: F,
    ) -> FirestoreResult<T>
    where
        F: FnOnce(&mut PersistenceTransaction<'_, '_>) -> FirestoreResult<T>,
    {
        let (sequence_number, syncer) = {
            let mut state = lock(&self.state);
            if state.terminated {
                return Err(failed_precondition("The client has already been terminated."));
            }
            if mode.is_read_only() {
                (state.sequence.current(), None)
            } else {
                (state.sequence.next(), state.sequence_number_syncer.clone())
            }
        };
        if let Some(syncer) = syncer {
            syncer(sequence_number);
        }

        let result = self
            .kv
            .run(mode, |kv| {
                if mode == TransactionMode::ReadWritePrimary && !self.holds_primary_lease(kv)? {
                    return Err(primary_lease_lost(format!(
                        "Failed to obtain primary lease for action '{action}'."
                    )));
                }
                let mut txn = PersistenceTransaction {
                    kv,
                    current_sequence_number: sequence_number,
                };
                let value = body(&mut txn)?;
                if mode == TransactionMode::ReadWritePrimary {
                    self.acquire_or_extend_primary_lease(txn.kv)?;
                }
                Ok(value)
            })
            .await;

        if let Err(err) = &result {
            if err.is_primary_lease_lost() {
                log::debug!("Lost the primary lease during '{action}'");
                self.set_primary(false);
            } else if err.is_storage_transaction_failure() {
                log::debug!("Transaction '{action}' failed: {err}");
            }
        }
        result
    }

    /// Ids of clients that refreshed their metadata recently.
    pub async fn get_active_clients(&self) -> FirestoreResult<Vec<String>> {
        let max_age = self.settings.max_client_age_millis;
        self.kv
            .run(TransactionMode::ReadOnly, |txn| {
                let now = now_millis();
                Ok(txn
                    .scan_all::<DbClientMetadata>(CLIENT_METADATA)?
                    .into_iter()
                    .map(|(_, client)| client)
                    .filter(|client| {
                        is_within_age(client.update_time_ms, max_age, now)
                            && !self.kv.is_zombied(&client.client_id)
                    })
                    .map(|client| client.client_id)
                    .collect())
            })
            .await
    }

    async fn update_client_metadata_and_try_become_primary(&self) -> FirestoreResult<()> {
        let (was_primary, network_enabled, in_foreground) = {
            let state = lock(&self.state);
            (state.is_primary, state.network_enabled, state.in_foreground)
        };
        let outcome = self
            .kv
            .run(TransactionMode::ReadWrite, |txn| {
                let now = now_millis();
                txn.put(
                    CLIENT_METADATA,
                    self.client_id.clone(),
                    &DbClientMetadata {
                        client_id: self.client_id.clone(),
                        update_time_ms: now,
                        network_enabled,
                        in_foreground,
                    },
                )?;
                let lost_lease = was_primary && !self.holds_primary_lease(txn)?;
                let still_primary = was_primary && !lost_lease;
                let can_act_as_primary =
                    self.can_act_as_primary(txn, network_enabled, in_foreground, now)?;
                let is_primary = if can_act_as_primary {
                    self.acquire_or_extend_primary_lease(txn)?;
                    true
                } else {
                    if still_primary {
                        self.release_primary_lease_if_held(txn)?;
                    }
                    false
                };
                Ok((lost_lease, is_primary))
            })
            .await;

        let (lost_lease, is_primary) = match outcome {
            Ok(outcome) => outcome,
            Err(err) if err.is_storage_transaction_failure() => {
                log::debug!("Failed to extend the primary lease: {err}");
                (false, was_primary)
            }
            Err(err) if !self.allow_tab_synchronization => return Err(err),
            Err(err) => {
                log::debug!("Releasing the primary lease after an error during refresh: {err}");
                (false, false)
            }
        };
        if lost_lease {
            self.set_primary(false);
        }
        self.set_primary(is_primary);
        Ok(())
    }

    fn set_primary(&self, is_primary: bool) {
        let listener = {
            let mut state = lock(&self.state);
            if state.is_primary == is_primary {
                return;
            }
            state.is_primary = is_primary;
            state.primary_state_listener.clone()
        };
        log::debug!(
            "Client {} is now {}",
            self.client_id,
            if is_primary { "primary" } else { "secondary" }
        );
        let Some(listener) = listener else {
            return;
        };
        let this = self.this.clone();
        self.queue.enqueue_retryable(move || {
            let listener = Arc::clone(&listener);
            let this = this.clone();
            async move {
                let started = this
                    .upgrade()
                    .is_some_and(|persistence| persistence.is_started());
                if started {
                    listener(is_primary).await
                } else {
                    Ok(())
                }
            }
        });
    }

    fn holds_primary_lease(&self, txn: &KvTransaction<'_>) -> FirestoreResult<bool> {
        let owner: Option<DbPrimaryClient> = txn.get(PRIMARY_CLIENT, PRIMARY_CLIENT_KEY)?;
        Ok(owner.is_some_and(|owner| owner.owner_id == self.client_id))
    }

    fn can_act_as_primary(
        &self,
        txn: &KvTransaction<'_>,
        network_enabled: bool,
        in_foreground: bool,
        now: i64,
    ) -> FirestoreResult<bool> {
        let lease_age = self.settings.primary_lease_millis;
        let owner: Option<DbPrimaryClient> = txn.get(PRIMARY_CLIENT, PRIMARY_CLIENT_KEY)?;
        if let Some(owner) = owner {
            let lease_is_valid = is_within_age(owner.lease_timestamp_ms, lease_age, now)
                && !self.kv.is_zombied(&owner.owner_id);
            if lease_is_valid {
                if owner.owner_id != self.client_id {
                    if !owner.allow_tab_synchronization {
                        return Err(failed_precondition(PRIMARY_LEASE_EXCLUSIVE_MESSAGE));
                    }
                    return Ok(false);
                }
                if network_enabled {
                    return Ok(true);
                }
            }
        }

        if network_enabled && in_foreground {
            return Ok(true);
        }

        let preferred_client_exists = txn
            .scan_all::<DbClientMetadata>(CLIENT_METADATA)?
            .into_iter()
            .map(|(_, client)| client)
            .filter(|client| {
                is_within_age(client.update_time_ms, lease_age, now)
                    && !self.kv.is_zombied(&client.client_id)
            })
            .any(|other| {
                if other.client_id == self.client_id {
                    return false;
                }
                let better_network = !network_enabled && other.network_enabled;
                let better_visibility = !in_foreground && other.in_foreground;
                let same_network = network_enabled == other.network_enabled;
                better_network || (better_visibility && same_network)
            });
        Ok(!preferred_client_exists)
    }

    fn acquire_or_extend_primary_lease(&self, txn: &mut KvTransaction<'_>) -> FirestoreResult<()> {
        txn.put(
            PRIMARY_CLIENT,
            PRIMARY_CLIENT_KEY,
            &DbPrimaryClient {
                owner_id: self.client_id.clone(),
                allow_tab_synchronization: self.allow_tab_synchronization,
                lease_timestamp_ms: now_millis(),
            },
        )
    }

    fn release_primary_lease_if_held(&self, txn: &mut KvTransaction<'_>) -> FirestoreResult<()> {
        if self.holds_primary_lease(txn)? {
            log::debug!("Releasing primary lease of client {}", self.client_id);
            txn.delete(PRIMARY_CLIENT, PRIMARY_CLIENT_KEY)?;
        }
        Ok(())
    }

    fn schedule_client_metadata_and_primary_lease_refreshes(&self) {
        let this = self.this.clone();
        let timer = self.queue.enqueue_after_delay(
            TimerId::ClientMetadataRefresh,
            self.settings.client_metadata_refresh_interval(),
            move || async move {
                let Some(persistence) = this.upgrade() else {
                    return;
                };
                if !persistence.is_started() {
                    return;
                }
                if let Err(err) = persistence.update_client_metadata_and_try_become_primary().await {
                    log::warn!("Failed to refresh client metadata: {err}");
                }
                persistence.maybe_garbage_collect_client_metadata().await;
                persistence.schedule_client_metadata_and_primary_lease_refreshes();
            },
        );
        let mut state = lock(&self.state);
        if state.started {
            state.refresh_timer = Some(timer);
        } else {
            timer.cancel();
        }
    }

    /// The primary drops metadata rows of clients that stopped refreshing.
    async fn maybe_garbage_collect_client_metadata(&self) {
        let max_age = self.settings.max_client_age_millis;
        let now = now_millis();
        {
            let mut state = lock(&self.state);
            if !state.is_primary || is_within_age(state.last_garbage_collection_ms, max_age, now) {
                return;
            }
            state.last_garbage_collection_ms = now;
        }
        let removed = self
            .run_transaction(
                "maybeGarbageCollectClientMetadata",
                TransactionMode::ReadWritePrimary,
                |txn| {
                    let inactive: Vec<String> = txn
                        .scan_all::<DbClientMetadata>(CLIENT_METADATA)?
                        .into_iter()
                        .map(|(_, client)| client)
                        .filter(|client| !is_within_age(client.update_time_ms, max_age, now))
                        .map(|client| client.client_id)
                        .collect();
                    for client_id in &inactive {
                        txn.delete(CLIENT_METADATA, client_id.clone())?;
                    }
                    Ok(inactive)
                },
            )
            .await;
        match removed {
            Ok(removed) => {
                for client_id in removed {
                    self.kv.set_zombied(&client_id, false);
                }
            }
            Err(err) => log::debug!("Failed to collect inactive client metadata: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::kv_store::TARGETS;
    use crate::firestore::model::DatabaseId;
    use crate::firestore::test_support::wait_until;

    fn config(key: &str, client_id: &str, allow_tab_synchronization: bool) -> ClientConfig {
        let settings = SyncSettings {
            allow_tab_synchronization,
            ..SyncSettings::default()
        };
        ClientConfig::new(DatabaseId::new("p", "(default)"), key)
            .with_client_id(client_id)
            .with_settings(settings)
    }

    fn recorder() -> (PrimaryStateListener, Arc<Mutex<Vec<bool>>>) {
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&states);
        let listener: PrimaryStateListener = Arc::new(move |is_primary| {
            sink.lock().unwrap().push(is_primary);
            crate::firestore::async_queue::box_queue_future(async { Ok(()) })
        });
        (listener, states)
    }

    #[tokio::test]
    async fn first_client_becomes_primary() {
        let persistence = Persistence::new(&config("first-primary", "a", false), AsyncQueue::new());
        persistence.start().await.unwrap();
        assert!(persistence.is_primary());
        persistence
            .run_transaction("write", TransactionMode::ReadWritePrimary, |txn| {
                txn.put(TARGETS, "x", &1)
            })
            .await
            .unwrap();
        assert_eq!(persistence.get_active_clients().await.unwrap(), vec!["a".to_string()]);
        persistence.shutdown().await;
    }

    #[tokio::test]
    async fn exclusive_owner_blocks_other_clients() {
        let first = Persistence::new(&config("exclusive", "a", false), AsyncQueue::new());
        first.start().await.unwrap();
        let second = Persistence::new(&config("exclusive", "b", false), AsyncQueue::new());
        let err = second.start().await.unwrap_err();
        assert_eq!(err.code, crate::firestore::error::FirestoreErrorCode::FailedPrecondition);
        first.shutdown().await;
    }

    #[tokio::test]
    async fn secondary_cannot_run_primary_transactions() {
        let first = Persistence::new(&config("shared", "a", true), AsyncQueue::new());
        first.start().await.unwrap();
        let second = Persistence::new(&config("shared", "b", true), AsyncQueue::new());
        second.start().await.unwrap();
        assert!(first.is_primary());
        assert!(!second.is_primary());

        let err = second
            .run_transaction("write", TransactionMode::ReadWritePrimary, |txn| {
                txn.put(TARGETS, "x", &1)
            })
            .await
            .unwrap_err();
        assert!(err.is_primary_lease_lost());
        second
            .run_transaction("write", TransactionMode::ReadWrite, |txn| txn.put(TARGETS, "y", &2))
            .await
            .unwrap();
        first.shutdown().await;
        second.shutdown().await;
    }

    #[tokio::test]
    async fn lease_passes_on_after_shutdown() {
        let queue = AsyncQueue::new();
        let first = Persistence::new(&config("handover", "a", true), AsyncQueue::new());
        first.start().await.unwrap();
        let second = Persistence::new(&config("handover", "b", true), queue.clone());
        second.start().await.unwrap();
        let (listener, states) = recorder();
        second.set_primary_state_listener(listener).await.unwrap();
        assert_eq!(*states.lock().unwrap(), vec![false]);

        first.shutdown().await;
        queue
            .run_delayed_operations_until(TimerId::ClientMetadataRefresh)
            .await
            .unwrap();
        assert!(second.is_primary());
        wait_until(|| states.lock().unwrap().as_slice() == [false, true]).await;
        second.shutdown().await;
    }

    #[tokio::test]
    async fn zombied_owner_loses_the_lease() {
        let first = Persistence::new(&config("zombie", "a", true), AsyncQueue::new());
        first.start().await.unwrap();
        first.store().set_zombied("a", true);
        let second = Persistence::new(&config("zombie", "b", true), AsyncQueue::new());
        second.start().await.unwrap();
        assert!(second.is_primary());
        first.store().set_zombied("a", false);
        second.shutdown().await;
    }

    #[tokio::test]
    async fn background_client_defers_to_foreground_client() {
        let foreground = Persistence::new(&config("visibility", "a", true), AsyncQueue::new());
        foreground.start().await.unwrap();
        // Let the foreground client's lease lapse while its metadata stays fresh.
        foreground
            .store()
            .run(TransactionMode::ReadWrite, |txn| txn.delete(PRIMARY_CLIENT, PRIMARY_CLIENT_KEY))
            .await
            .unwrap();
        let background = Persistence::new(
            &config("visibility", "b", true).with_foreground(false),
            AsyncQueue::new(),
        );
        background.start().await.unwrap();
        assert!(!background.is_primary());
        foreground.shutdown().await;
        background.shutdown().await;
    }

    #[tokio::test]
    async fn storage_failures_surface_as_transient() {
        let persistence = Persistence::new(&config("flaky", "a", false), AsyncQueue::new());
        persistence.start().await.unwrap();
        persistence.store().inject_failures(1);
        let err = persistence
            .run_transaction("read", TransactionMode::ReadOnly, |_| Ok(()))
            .await
            .unwrap_err();
        assert!(err.is_storage_transaction_failure());
        persistence
            .run_transaction("read", TransactionMode::ReadOnly, |_| Ok(()))
            .await
            .unwrap();
        persistence.shutdown().await;
    }

    #[tokio::test]
    async fn terminated_persistence_rejects_transactions() {
        let persistence = Persistence::new(&config("terminated", "a", false), AsyncQueue::new());
        persistence.start().await.unwrap();
        persistence.shutdown().await;
        assert!(persistence
            .run_transaction("read", TransactionMode::ReadOnly, |_| Ok(()))
            .await
            .is_err());
    }
}

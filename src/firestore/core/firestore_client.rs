use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::channel::oneshot;

use crate::firestore::async_queue::{box_queue_future, AsyncQueue};
use crate::firestore::core::event_manager::{
    EventManager, ListenOptions, QueryListener, QueryTargetHandler, SnapshotCallback,
    SnapshotsInSyncCallback,
};
use crate::firestore::core::query::Query;
use crate::firestore::core::sync_engine::{SyncEngine, SyncEngineListener};
use crate::firestore::core::transaction::{run_transaction, Transaction};
use crate::firestore::core::view::View;
use crate::firestore::core::view_snapshot::ViewSnapshot;
use crate::firestore::error::{cancelled, internal_error, unavailable, FirestoreResult};
use crate::firestore::local::local_store::LocalStore;
use crate::firestore::local::lru_garbage_collector::LruScheduler;
use crate::firestore::local::persistence::Persistence;
use crate::firestore::local::shared_client_state::{
    MemorySharedClientState, SharedClientState, SharedClientStateSyncer, SharedStorage,
    StorageSharedClientState,
};
use crate::firestore::model::{Document, DocumentKey, MaybeDocument, Mutation, User};
use crate::firestore::remote::datastore::{Datastore, StreamingDatastore, TokenProviderArc};
use crate::firestore::remote::network::NetworkLayer;
use crate::firestore::remote::remote_store::RemoteStore;
use crate::firestore::remote::remote_syncer::RemoteSyncer;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::settings::ClientConfig;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Backend and environment collaborators of a client.
#[derive(Clone)]
pub struct ClientComponents {
    pub streaming: Arc<dyn StreamingDatastore>,
    /// Unary RPCs for transactions.
    pub datastore: Arc<dyn Datastore>,
    pub token_provider: TokenProviderArc,
    /// Cross-client channel. Used when tab synchronization is allowed.
    /// Each client needs a handle of its own, since a handle does not
    /// hear its own writes.
    pub shared_storage: Option<Arc<dyn SharedStorage>>,
}

/// Routes user changes from the token provider. Users reported before the
/// client is seeded pick the initial user; later ones restart the remote
/// store under the new credentials.
struct CredentialRouter {
    queue: AsyncQueue,
    state: Mutex<CredentialRouterState>,
}

#[derive(Default)]
struct CredentialRouterState {
    seeded: bool,
    initial_user: Option<User>,
    remote_store: Option<RemoteStore>,
    /// A change seen before the remote store was attached.
    pending_user: Option<User>,
    terminated: bool,
}

impl CredentialRouter {
    fn new(queue: AsyncQueue) -> Arc<Self> {
        Arc::new(Self {
            queue,
            state: Mutex::new(CredentialRouterState::default()),
        })
    }

    /// Providers without a notion of users never report one.
    fn seed(&self) -> User {
        let mut state = lock(&self.state);
        state.seeded = true;
        state
            .initial_user
            .take()
            .unwrap_or_else(User::unauthenticated)
    }

    fn on_user(&self, user: User) {
        let mut state = lock(&self.state);
        if state.terminated {
            return;
        }
        if !state.seeded {
            state.initial_user = Some(user);
            return;
        }
        match state.remote_store.clone() {
            Some(remote_store) => self.schedule_credential_change(remote_store, user),
            None => state.pending_user = Some(user),
        }
    }

    fn attach(&self, remote_store: RemoteStore) {
        let mut state = lock(&self.state);
        if let Some(user) = state.pending_user.take() {
            self.schedule_credential_change(remote_store.clone(), user);
        }
        state.remote_store = Some(remote_store);
    }

    fn detach(&self) {
        let mut state = lock(&self.state);
        state.terminated = true;
        state.remote_store = None;
    }

    fn schedule_credential_change(&self, remote_store: RemoteStore, user: User) {
        log::debug!("Credential changed. Current user: {}", user.to_key());
        self.queue.enqueue_retryable(move || {
            let remote_store = remote_store.clone();
            let user = user.clone();
            async move { remote_store.handle_credential_change(user).await }
        });
    }
}

/// Handle for an active query listener. Dropping it stops the listener.
pub struct ListenerRegistration {
    queue: AsyncQueue,
    event_manager: Arc<EventManager>,
    listener: Option<Arc<QueryListener>>,
}

impl ListenerRegistration {
    pub fn remove(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        let event_manager = Arc::clone(&self.event_manager);
        self.queue.enqueue_and_forget(move || async move {
            if let Err(err) = event_manager.unlisten(&listener).await {
                log::warn!("Failed to stop listening to {}: {err}", listener.query());
            }
        });
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Ties persistence, the remote store, the sync engine and the event
/// manager together behind one async queue. Every public method schedules
/// its work on that queue.
pub struct FirestoreClient {
    config: ClientConfig,
    queue: AsyncQueue,
    persistence: Arc<Persistence>,
    local_store: Arc<LocalStore>,
    remote_store: RemoteStore,
    shared_client_state: Arc<dyn SharedClientState>,
    sync_engine: Arc<SyncEngine>,
    event_manager: Arc<EventManager>,
    lru_scheduler: Arc<LruScheduler>,
    datastore: Arc<dyn Datastore>,
    credentials: Arc<CredentialRouter>,
}

impl FirestoreClient {
    /// Opens the cache for the token provider's current user and starts the
    /// network.
    pub async fn start(config: ClientConfig, components: ClientComponents) -> FirestoreResult<Arc<Self>> {
        let settings = config.settings.clone();
        let queue = AsyncQueue::with_retry_backoff(settings.backoff_config());

        let credentials = CredentialRouter::new(queue.clone());
        let router = Arc::downgrade(&credentials);
        components
            .token_provider
            .set_user_change_listener(Arc::new(move |user| {
                if let Some(router) = router.upgrade() {
                    router.on_user(user);
                }
            }));
        let initial_user = credentials.seed();
        log::debug!("Initializing client for user {}", initial_user.to_key());

        let persistence = Persistence::new(&config, queue.clone());
        persistence.start().await?;
        let local_store = LocalStore::new(Arc::clone(&persistence), initial_user.clone());
        local_store.start().await?;

        let network = NetworkLayer::builder(
            components.streaming,
            Arc::clone(&components.token_provider),
            queue.clone(),
            JsonProtoSerializer::new(config.database_id.clone()),
        )
        .with_settings(&settings)
        .build();
        let remote_store = RemoteStore::new(queue.clone(), &network, &settings);

        let shared_client_state: Arc<dyn SharedClientState> =
            match (&components.shared_storage, settings.allow_tab_synchronization) {
                (Some(storage), true) => StorageSharedClientState::new(
                    Arc::clone(storage),
                    queue.clone(),
                    &config.persistence_key,
                    config.client_id.clone(),
                    initial_user,
                ),
                _ => Arc::new(MemorySharedClientState::new()),
            };

        let sync_engine = SyncEngine::new(
            Arc::clone(&local_store),
            remote_store.clone(),
            Arc::clone(&shared_client_state),
            &settings,
        );
        let remote_syncer: Arc<dyn RemoteSyncer> = sync_engine.clone();
        remote_store.set_syncer(&remote_syncer);
        let client_state_syncer: Arc<dyn SharedClientStateSyncer> = sync_engine.clone();
        shared_client_state.set_syncer(Arc::downgrade(&client_state_syncer));

        let observer = Arc::downgrade(&persistence);
        shared_client_state.set_sequence_number_handler(Arc::new(move |sequence_number| {
            if let Some(persistence) = observer.upgrade() {
                persistence.observe_sequence_number(sequence_number);
            }
        }));
        let publisher = Arc::downgrade(&shared_client_state);
        persistence.set_sequence_number_syncer(Arc::new(move |sequence_number| {
            if let Some(shared_client_state) = publisher.upgrade() {
                shared_client_state.write_sequence_number(sequence_number);
            }
        }));
        shared_client_state.start()?;

        let handler: Arc<dyn QueryTargetHandler> = sync_engine.clone();
        let event_manager = EventManager::new(handler);
        let engine_listener: Arc<dyn SyncEngineListener> = event_manager.clone();
        sync_engine.set_listener(Arc::downgrade(&engine_listener));

        let lru_scheduler = LruScheduler::new(queue.clone(), &local_store, &settings);

        remote_store.start().await;
        let engine = Arc::downgrade(&sync_engine);
        let scheduler = Arc::downgrade(&lru_scheduler);
        persistence
            .set_primary_state_listener(Arc::new(move |is_primary| {
                let engine = engine.clone();
                let scheduler = scheduler.clone();
                box_queue_future(async move {
                    let Some(engine) = engine.upgrade() else {
                        return Ok(());
                    };
                    engine.apply_primary_state(is_primary).await?;
                    if let Some(scheduler) = scheduler.upgrade() {
                        if is_primary {
                            scheduler.start();
                        } else {
                            scheduler.stop();
                        }
                    }
                    Ok(())
                })
            }))
            .await?;
        credentials.attach(remote_store.clone());

        Ok(Arc::new(Self {
            config,
            queue,
            persistence,
            local_store,
            remote_store,
            shared_client_state,
            sync_engine,
            event_manager,
            lru_scheduler,
            datastore: components.datastore,
            credentials,
        }))
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    pub fn is_primary(&self) -> bool {
        self.sync_engine.is_primary_client()
    }

    pub fn current_user(&self) -> User {
        self.sync_engine.current_user()
    }

    pub fn is_terminated(&self) -> bool {
        self.queue.is_shutting_down()
    }

    pub fn sync_engine(&self) -> &Arc<SyncEngine> {
        &self.sync_engine
    }

    pub fn remote_store(&self) -> &RemoteStore {
        &self.remote_store
    }

    pub fn queue(&self) -> &AsyncQueue {
        &self.queue
    }

    /// Starts delivering snapshots of `query` to `callback` until the
    /// returned registration is removed or dropped.
    pub async fn listen(
        &self,
        query: Query,
        options: ListenOptions,
        callback: SnapshotCallback,
    ) -> FirestoreResult<ListenerRegistration> {
        let listener = QueryListener::new(query, options, callback);
        let event_manager = Arc::clone(&self.event_manager);
        let registered = Arc::clone(&listener);
        self.queue
            .enqueue(move || async move { event_manager.listen(registered).await })
            .await?;
        Ok(ListenerRegistration {
            queue: self.queue.clone(),
            event_manager: Arc::clone(&self.event_manager),
            listener: Some(listener),
        })
    }

    /// Applies `mutations` locally and resolves once the backend accepted
    /// them.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        let sync_engine = Arc::clone(&self.sync_engine);
        let receiver = self
            .queue
            .enqueue(move || async move { Ok(sync_engine.write(mutations).await) })
            .await?;
        receiver
            .await
            .map_err(|_| cancelled("The client was terminated before the write completed."))?
    }

    /// Resolves once every write issued so far was acknowledged or rejected
    /// by the backend.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        let sync_engine = Arc::clone(&self.sync_engine);
        let receiver = self
            .queue
            .enqueue(move || async move { Ok(sync_engine.register_pending_writes_callback().await) })
            .await?;
        receiver
            .await
            .map_err(|_| cancelled("The client was terminated before pending writes completed."))?
    }

    /// Reads `key` from the cache, including pending local writes. Returns
    /// `None` for documents known not to exist.
    pub async fn get_document_from_cache(&self, key: DocumentKey) -> FirestoreResult<Option<Document>> {
        let local_store = Arc::clone(&self.local_store);
        let cached = self
            .queue
            .enqueue(move || async move { local_store.read_document(&key).await.map(|doc| (key, doc)) })
            .await?;
        match cached {
            (_, Some(MaybeDocument::Document(doc))) => Ok(Some(doc)),
            (_, Some(MaybeDocument::NoDocument(_))) => Ok(None),
            (key, _) => Err(unavailable(format!(
                "Failed to get document '{key}' from cache. (However, this document may exist on the server. Run again without setting 'source' to 'cache' to attempt to retrieve the document from the server.)"
            ))),
        }
    }

    /// Runs `query` against the cache only.
    pub async fn get_documents_from_cache(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        let local_store = Arc::clone(&self.local_store);
        self.queue
            .enqueue(move || async move {
                let query_result = local_store.execute_query(&query, true).await?;
                let mut view = View::new(query, query_result.remote_keys);
                let documents = query_result
                    .documents
                    .into_iter()
                    .map(|(key, doc)| (key, MaybeDocument::from(doc)))
                    .collect();
                let changes = view.compute_doc_changes(&documents, None);
                view.apply_changes(changes, false, None)
                    .snapshot
                    .ok_or_else(|| internal_error("a new view must raise a snapshot"))
            })
            .await
    }

    /// Reads `key` from the backend. Fails while the client is offline.
    pub async fn get_document_from_server(&self, key: DocumentKey) -> FirestoreResult<Option<Document>> {
        let query = Query::new(key.path().clone());
        let snapshot = self.first_server_snapshot(query).await?;
        Ok(snapshot.docs.get(&key).cloned())
    }

    /// Runs `query` against the backend. Fails while the client is offline.
    pub async fn get_documents_from_server(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        self.first_server_snapshot(query).await
    }

    async fn first_server_snapshot(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        let (sender, receiver) = oneshot::channel();
        let sender = Mutex::new(Some(sender));
        let callback: SnapshotCallback = Arc::new(move |result: FirestoreResult<ViewSnapshot>| {
            let result = match result {
                Ok(snapshot) if snapshot.from_cache => Err(unavailable(
                    "Failed to get documents from server. (However, these documents may exist in the local cache. Run again without setting source to 'server' to retrieve the cached documents.)",
                )),
                other => other,
            };
            if let Some(sender) = lock(&sender).take() {
                let _ = sender.send(result);
            }
        });
        let options = ListenOptions {
            include_metadata_changes: true,
            wait_for_sync_when_online: true,
        };
        let registration = self.listen(query, options, callback).await?;
        let result = receiver
            .await
            .map_err(|_| cancelled("The client was terminated before the query completed."))?;
        registration.remove();
        result
    }

    /// Runs `update_fn` in a transaction against the backend, retrying on
    /// contention.
    pub async fn transaction<T, F, Fut>(&self, update_fn: F) -> FirestoreResult<T>
    where
        F: FnMut(Arc<Transaction>) -> Fut,
        Fut: Future<Output = FirestoreResult<T>>,
    {
        if self.is_terminated() {
            return Err(cancelled("The client has already been terminated."));
        }
        run_transaction(
            &self.queue,
            Arc::clone(&self.datastore),
            &self.config.settings,
            update_fn,
        )
        .await
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        let persistence = Arc::clone(&self.persistence);
        let remote_store = self.remote_store.clone();
        self.queue
            .enqueue(move || async move {
                persistence.set_network_enabled(true);
                remote_store.enable_network().await;
                Ok(())
            })
            .await
    }

    pub async fn disable_network(&self) -> FirestoreResult<()> {
        let persistence = Arc::clone(&self.persistence);
        let remote_store = self.remote_store.clone();
        self.queue
            .enqueue(move || async move {
                persistence.set_network_enabled(false);
                remote_store.disable_network().await;
                Ok(())
            })
            .await
    }

    /// Foreground clients are preferred for the primary lease.
    pub fn set_in_foreground(&self, in_foreground: bool) {
        self.persistence.set_in_foreground(in_foreground);
    }

    pub fn add_snapshots_in_sync_listener(&self, callback: SnapshotsInSyncCallback) -> u64 {
        self.event_manager.add_snapshots_in_sync_listener(callback)
    }

    pub fn remove_snapshots_in_sync_listener(&self, id: u64) {
        self.event_manager.remove_snapshots_in_sync_listener(id);
    }

    /// Stops the network, releases the primary lease and rejects everything
    /// enqueued afterwards.
    pub async fn terminate(&self) -> FirestoreResult<()> {
        self.credentials.detach();
        let remote_store = self.remote_store.clone();
        let shared_client_state = Arc::clone(&self.shared_client_state);
        let lru_scheduler = Arc::clone(&self.lru_scheduler);
        let persistence = Arc::clone(&self.persistence);
        let result = self
            .queue
            .enqueue_and_initiate_shutdown(move || async move {
                remote_store.shutdown().await;
                shared_client_state.shutdown();
                lru_scheduler.stop();
                persistence.shutdown().await;
                Ok(())
            })
            .await;
        log::debug!("Client {} terminated", self.config.client_id);
        result
    }
}

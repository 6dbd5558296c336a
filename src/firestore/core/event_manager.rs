use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::firestore::core::query::Query;
use crate::firestore::core::sync_engine::SyncEngineListener;
use crate::firestore::core::types::OnlineState;
use crate::firestore::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::firestore::error::{FirestoreError, FirestoreResult};

pub type SnapshotCallback = Arc<dyn Fn(FirestoreResult<ViewSnapshot>) + Send + Sync>;
pub type SnapshotsInSyncCallback = Arc<dyn Fn() + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Raise snapshots that only change `from_cache` or pending writes.
    pub include_metadata_changes: bool,
    /// Hold back the first snapshot until the backend answered, unless the
    /// client is known to be offline.
    pub wait_for_sync_when_online: bool,
}

/// Where the event manager gets query results from.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait QueryTargetHandler: Send + Sync + 'static {
    /// Starts tracking `query` and returns its first snapshot.
    async fn listen(&self, query: Query) -> FirestoreResult<ViewSnapshot>;

    async fn unlisten(&self, query: Query) -> FirestoreResult<()>;
}

struct ListenerState {
    raised_initial_event: bool,
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

/// One user listener on a query. Filters the raw view snapshots down to the
/// events the listener asked for.
pub struct QueryListener {
    query: Query,
    options: ListenOptions,
    callback: SnapshotCallback,
    state: Mutex<ListenerState>,
}

impl QueryListener {
    pub fn new(query: Query, options: ListenOptions, callback: SnapshotCallback) -> Arc<Self> {
        Arc::new(Self {
            query,
            options,
            callback,
            state: Mutex::new(ListenerState {
                raised_initial_event: false,
                snapshot: None,
                online_state: OnlineState::Unknown,
            }),
        })
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Returns whether an event was raised.
    pub fn on_view_snapshot(&self, snapshot: ViewSnapshot) -> bool {
        let snapshot = if self.options.include_metadata_changes {
            snapshot
        } else {
            let doc_changes = snapshot
                .doc_changes
                .into_iter()
                .filter(|change| change.change_type != ChangeType::Metadata)
                .collect();
            ViewSnapshot {
                doc_changes,
                excludes_metadata_changes: true,
                ..snapshot
            }
        };

        let event = {
            let mut state = lock(&self.state);
            let event = if !state.raised_initial_event {
                if self.should_raise_initial_event(&snapshot, state.online_state) {
                    state.raised_initial_event = true;
                    Some(Self::initial_event(&snapshot))
                } else {
                    None
                }
            } else if self.should_raise_event(&snapshot, state.snapshot.as_ref()) {
                Some(snapshot.clone())
            } else {
                None
            };
            state.snapshot = Some(snapshot);
            event
        };

        match event {
            Some(event) => {
                (self.callback)(Ok(event));
                true
            }
            None => false,
        }
    }

    pub fn on_error(&self, error: FirestoreError) {
        (self.callback)(Err(error));
    }

    /// Returns whether the change released the held-back first snapshot.
    pub fn apply_online_state_change(&self, online_state: OnlineState) -> bool {
        let event = {
            let mut state = lock(&self.state);
            state.online_state = online_state;
            match &state.snapshot {
                Some(snapshot)
                    if !state.raised_initial_event
                        && self.should_raise_initial_event(snapshot, online_state) =>
                {
                    let event = Self::initial_event(snapshot);
                    state.raised_initial_event = true;
                    Some(event)
                }
                _ => None,
            }
        };
        match event {
            Some(event) => {
                (self.callback)(Ok(event));
                true
            }
            None => false,
        }
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        // Raise cached data right away, but an empty cache only once the
        // client is known to be offline.
        !snapshot.docs.is_empty() || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot, previous: Option<&ViewSnapshot>) -> bool {
        if !snapshot.doc_changes.is_empty() {
            return true;
        }
        let pending_writes_changed = previous
            .is_some_and(|previous| previous.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn initial_event(snapshot: &ViewSnapshot) -> ViewSnapshot {
        ViewSnapshot::from_initial_documents(
            snapshot.query.clone(),
            snapshot.docs.clone(),
            snapshot.mutated_keys.clone(),
            snapshot.from_cache,
        )
    }
}

struct QueryListenersInfo {
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<Arc<QueryListener>>,
}

struct EventManagerState {
    /// Keyed by canonical query id.
    queries: BTreeMap<String, QueryListenersInfo>,
    online_state: OnlineState,
    snapshots_in_sync_listeners: Vec<(u64, SnapshotsInSyncCallback)>,
    next_listener_id: u64,
}

/// Fans view snapshots out to the user listeners of each query and tells
/// the query handler when a query gains its first or loses its last
/// listener.
pub struct EventManager {
    handler: Arc<dyn QueryTargetHandler>,
    state: Mutex<EventManagerState>,
}

impl EventManager {
    pub fn new(handler: Arc<dyn QueryTargetHandler>) -> Arc<Self> {
        Arc::new(Self {
            handler,
            state: Mutex::new(EventManagerState {
                queries: BTreeMap::new(),
                online_state: OnlineState::Unknown,
                snapshots_in_sync_listeners: Vec::new(),
                next_listener_id: 1,
            }),
        })
    }

    /// Registers `listener`. A failure to start the query is delivered to
    /// the listener and the listener is not registered.
    pub async fn listen(&self, listener: Arc<QueryListener>) -> FirestoreResult<()> {
        let canonical_id = listener.query().canonical_id();
        let first_listen = !lock(&self.state).queries.contains_key(&canonical_id);

        let initial_snapshot = if first_listen {
            match self.handler.listen(listener.query().clone()).await {
                Ok(snapshot) => Some(snapshot),
                Err(err) => {
                    log::warn!("Initialization of query '{}' failed: {err}", listener.query());
                    listener.on_error(err);
                    return Ok(());
                }
            }
        } else {
            None
        };

        let (online_state, view_snapshot) = {
            let mut state = lock(&self.state);
            let online_state = state.online_state;
            let info = state
                .queries
                .entry(canonical_id)
                .or_insert_with(|| QueryListenersInfo {
                    view_snapshot: None,
                    listeners: Vec::new(),
                });
            if initial_snapshot.is_some() {
                info.view_snapshot = initial_snapshot;
            }
            info.listeners.push(Arc::clone(&listener));
            (online_state, info.view_snapshot.clone())
        };

        listener.apply_online_state_change(online_state);
        if let Some(snapshot) = view_snapshot {
            if listener.on_view_snapshot(snapshot) {
                self.raise_snapshots_in_sync_event();
            }
        }
        Ok(())
    }

    pub async fn unlisten(&self, listener: &Arc<QueryListener>) -> FirestoreResult<()> {
        let canonical_id = listener.query().canonical_id();
        let last_listen = {
            let mut state = lock(&self.state);
            let Some(info) = state.queries.get_mut(&canonical_id) else {
                return Ok(());
            };
            info.listeners.retain(|existing| !Arc::ptr_eq(existing, listener));
            if info.listeners.is_empty() {
                state.queries.remove(&canonical_id);
                true
            } else {
                false
            }
        };
        if last_listen {
            self.handler.unlisten(listener.query().clone()).await?;
        }
        Ok(())
    }

    /// Calls `callback` now and after every event that brought all
    /// listeners in line with each other.
    pub fn add_snapshots_in_sync_listener(&self, callback: SnapshotsInSyncCallback) -> u64 {
        let id = {
            let mut state = lock(&self.state);
            let id = state.next_listener_id;
            state.next_listener_id += 1;
            state.snapshots_in_sync_listeners.push((id, Arc::clone(&callback)));
            id
        };
        callback();
        id
    }

    pub fn remove_snapshots_in_sync_listener(&self, id: u64) {
        lock(&self.state)
            .snapshots_in_sync_listeners
            .retain(|(existing, _)| *existing != id);
    }

    pub fn has_listeners(&self) -> bool {
        !lock(&self.state).queries.is_empty()
    }

    fn raise_snapshots_in_sync_event(&self) {
        let callbacks: Vec<SnapshotsInSyncCallback> = lock(&self.state)
            .snapshots_in_sync_listeners
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback();
        }
    }

    fn listeners_for(&self, query: &Query) -> Vec<Arc<QueryListener>> {
        lock(&self.state)
            .queries
            .get(&query.canonical_id())
            .map(|info| info.listeners.clone())
            .unwrap_or_default()
    }
}

impl SyncEngineListener for EventManager {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
        let mut raised_event = false;
        for snapshot in snapshots {
            let canonical_id = snapshot.query.canonical_id();
            let listeners = {
                let mut state = lock(&self.state);
                match state.queries.get_mut(&canonical_id) {
                    Some(info) => {
                        info.view_snapshot = Some(snapshot.clone());
                        info.listeners.clone()
                    }
                    None => continue,
                }
            };
            for listener in listeners {
                if listener.on_view_snapshot(snapshot.clone()) {
                    raised_event = true;
                }
            }
        }
        if raised_event {
            self.raise_snapshots_in_sync_event();
        }
    }

    fn on_watch_error(&self, query: &Query, error: FirestoreError) {
        let listeners = self.listeners_for(query);
        lock(&self.state).queries.remove(&query.canonical_id());
        for listener in listeners {
            listener.on_error(error.clone());
        }
    }

    fn on_online_state_change(&self, online_state: OnlineState) {
        let listeners: Vec<Arc<QueryListener>> = {
            let mut state = lock(&self.state);
            state.online_state = online_state;
            state
                .queries
                .values()
                .flat_map(|info| info.listeners.iter().cloned())
                .collect()
        };
        let mut raised_event = false;
        for listener in listeners {
            if listener.apply_online_state_change(online_state) {
                raised_event = true;
            }
        }
        if raised_event {
            self.raise_snapshots_in_sync_event();
        }
    }
}

#![cfg(not(target_arch = "wasm32"))]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use firestore_sync::firestore::core::{Query, ViewSnapshot};
use firestore_sync::firestore::local::{InMemorySharedStorage, SharedStorage};
use firestore_sync::firestore::model::{DatabaseId, DocumentKey, Mutation, ResourcePath};
use firestore_sync::firestore::remote::{
    Datastore, InMemoryDatastore, InMemoryTransport, MultiplexedConnection, NoopTokenProvider,
    StreamingDatastore, StreamingDatastoreImpl,
};
use firestore_sync::firestore::value::{FirestoreValue, MapValue};
use firestore_sync::firestore::{
    ClientComponents, ClientConfig, FirestoreClient, FirestoreResult, ListenOptions, SyncSettings,
};

struct Backend {
    streaming: Arc<dyn StreamingDatastore>,
    _server: Arc<MultiplexedConnection>,
}

fn backend() -> Backend {
    let (client_transport, server_transport) = InMemoryTransport::pair();
    let client = Arc::new(MultiplexedConnection::new(client_transport));
    let server = Arc::new(MultiplexedConnection::new(server_transport));
    let streaming: Arc<dyn StreamingDatastore> = Arc::new(StreamingDatastoreImpl::new(
        client,
        DatabaseId::new("multi-client", "(default)"),
    ));
    Backend {
        streaming,
        _server: server,
    }
}

/// Every client opens its own storage handle, the way each tab gets its own
/// view of local storage. A handle never hears about its own writes.
async fn start_client(persistence_key: &str, backend: &Backend) -> Arc<FirestoreClient> {
    let settings = SyncSettings {
        allow_tab_synchronization: true,
        client_metadata_refresh_millis: 50,
        // The test backend never answers, so the primary declares itself
        // offline after this delay. Empty cached results are only raised
        // once a client knows it is offline.
        online_state_timeout_millis: 100,
        ..SyncSettings::default()
    };
    let config = ClientConfig::new(DatabaseId::new("multi-client", "(default)"), persistence_key)
        .with_settings(settings);
    let shared_storage: Arc<dyn SharedStorage> = InMemorySharedStorage::open(persistence_key);
    let datastore: Arc<dyn Datastore> = Arc::new(InMemoryDatastore::new());
    let components = ClientComponents {
        streaming: Arc::clone(&backend.streaming),
        datastore,
        token_provider: Arc::new(NoopTokenProvider),
        shared_storage: Some(shared_storage),
    };
    FirestoreClient::start(config, components)
        .await
        .expect("start client")
}

fn rooms() -> Query {
    Query::new(ResourcePath::from_segments(["rooms"]))
}

fn room(id: &str) -> DocumentKey {
    DocumentKey::from_segments(["rooms", id]).unwrap()
}

type Recorded = Arc<Mutex<Vec<FirestoreResult<ViewSnapshot>>>>;

fn recorder() -> (Recorded, Arc<dyn Fn(FirestoreResult<ViewSnapshot>) + Send + Sync>) {
    let recorded: Recorded = Arc::default();
    let sink = Arc::clone(&recorded);
    (
        recorded,
        Arc::new(move |result| sink.lock().unwrap().push(result)),
    )
}

async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

#[tokio::test(flavor = "multi_thread")]
async fn secondary_queries_are_watched_by_the_primary() {
    let backend = backend();
    let primary = start_client("multi-client-watch", &backend).await;
    let secondary = start_client("multi-client-watch", &backend).await;
    assert!(primary.is_primary());
    assert!(!secondary.is_primary());

    let (snapshots, callback) = recorder();
    let _registration = secondary
        .listen(rooms(), ListenOptions::default(), callback)
        .await
        .unwrap();
    wait_until(|| !snapshots.lock().unwrap().is_empty()).await;

    wait_until(|| !primary.remote_store().listen_target_ids().is_empty()).await;
    assert!(secondary.remote_store().listen_target_ids().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn secondary_writes_show_up_on_the_primary() {
    let backend = backend();
    let primary = start_client("multi-client-write", &backend).await;
    let secondary = start_client("multi-client-write", &backend).await;

    let (snapshots, callback) = recorder();
    let _registration = primary
        .listen(rooms(), ListenOptions::default(), callback)
        .await
        .unwrap();
    wait_until(|| snapshots.lock().unwrap().len() == 1).await;

    let writer = Arc::clone(&secondary);
    tokio::spawn(async move {
        let data = MapValue::new([("n".to_string(), FirestoreValue::from_integer(1))].into());
        let _ = writer.write(vec![Mutation::set(room("a"), data)]).await;
    });

    wait_until(|| {
        snapshots.lock().unwrap().iter().any(|snapshot| {
            snapshot
                .as_ref()
                .is_ok_and(|snapshot| snapshot.docs.has(&room("a")) && snapshot.has_pending_writes())
        })
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn secondary_takes_over_when_the_primary_terminates() {
    let backend = backend();
    let primary = start_client("multi-client-failover", &backend).await;
    let secondary = start_client("multi-client-failover", &backend).await;
    assert!(!secondary.is_primary());

    primary.terminate().await.unwrap();
    wait_until(|| secondary.is_primary()).await;
}

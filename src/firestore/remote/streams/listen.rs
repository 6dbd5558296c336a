use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::firestore::async_queue::AsyncQueue;
use crate::firestore::core::types::TargetId;
use crate::firestore::error::{data_loss, FirestoreError, FirestoreResult};
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::SnapshotVersion;
use crate::firestore::remote::datastore::StreamingDatastore;
use crate::firestore::remote::network::StreamCredentialProvider;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::stream::persistent::{
    PersistentStream, PersistentStreamDelegate, StreamKind,
};
use crate::firestore::remote::watch_change::{
    decode_watch_change, snapshot_version_from_response, WatchChange,
};
use crate::util::backoff::BackoffConfig;

/// Receives the events of a [`ListenStream`] on the async queue.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait WatchStreamListener: Send + Sync + 'static {
    async fn on_watch_stream_open(&self);

    async fn on_watch_stream_change(&self, change: WatchChange, snapshot_version: SnapshotVersion);

    async fn on_watch_stream_close(&self, error: Option<FirestoreError>);
}

/// The `Listen` RPC: adds and removes targets and streams back their
/// changes.
pub struct ListenStream {
    stream: Arc<PersistentStream>,
    serializer: JsonProtoSerializer,
}

impl ListenStream {
    pub fn new(
        queue: AsyncQueue,
        datastore: Arc<dyn StreamingDatastore>,
        credentials: StreamCredentialProvider,
        serializer: JsonProtoSerializer,
        backoff: BackoffConfig,
        idle_timeout: Duration,
        listener: Weak<dyn WatchStreamListener>,
    ) -> Self {
        let delegate = Arc::new(ListenDelegate {
            serializer: serializer.clone(),
            listener,
        });
        let stream = PersistentStream::new(
            StreamKind::Listen,
            queue,
            datastore,
            credentials,
            backoff,
            idle_timeout,
            delegate,
        );
        Self { stream, serializer }
    }

    pub fn start(&self) {
        self.stream.start();
    }

    pub async fn stop(&self) {
        self.stream.stop().await;
    }

    pub fn is_started(&self) -> bool {
        self.stream.is_started()
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_open()
    }

    pub fn mark_idle(&self) {
        self.stream.mark_idle();
    }

    pub fn inhibit_backoff(&self) {
        self.stream.inhibit_backoff();
    }

    /// Registers a target with the backend.
    pub async fn watch(&self, target_data: &TargetData) {
        let request = self.serializer.encode_listen_request(target_data);
        self.stream.send(encode_message(&request)).await;
    }

    pub async fn unwatch(&self, target_id: TargetId) {
        let request = self.serializer.encode_unlisten_request(target_id);
        self.stream.send(encode_message(&request)).await;
    }
}

pub(crate) fn encode_message(value: &JsonValue) -> Vec<u8> {
    value.to_string().into_bytes()
}

pub(crate) fn decode_message(payload: &[u8]) -> FirestoreResult<JsonValue> {
    serde_json::from_slice(payload)
        .map_err(|err| data_loss(format!("Malformed stream message: {err}")))
}

struct ListenDelegate {
    serializer: JsonProtoSerializer,
    listener: Weak<dyn WatchStreamListener>,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl PersistentStreamDelegate for ListenDelegate {
    async fn on_open(&self, _stream: &PersistentStream) {
        if let Some(listener) = self.listener.upgrade() {
            listener.on_watch_stream_open().await;
        }
    }

    async fn on_message(&self, stream: &PersistentStream, payload: Vec<u8>) -> FirestoreResult<()> {
        let response = decode_message(&payload)?;
        stream.reset_backoff();
        let snapshot_version = snapshot_version_from_response(&self.serializer, &response)?;
        let Some(change) = decode_watch_change(&self.serializer, &response)? else {
            log::debug!("ignoring unknown listen response: {response}");
            return Ok(());
        };
        if let Some(listener) = self.listener.upgrade() {
            listener.on_watch_stream_change(change, snapshot_version).await;
        }
        Ok(())
    }

    async fn on_close(&self, _stream: &PersistentStream, error: Option<FirestoreError>) {
        if let Some(listener) = self.listener.upgrade() {
            listener.on_watch_stream_close(error).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::target_data::TargetPurpose;
    use crate::firestore::remote::watch_change::TargetChangeState;
    use crate::firestore::test_support::{connected_datastore, query, wait_until};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        opened: Mutex<usize>,
        changes: Mutex<Vec<(WatchChange, SnapshotVersion)>>,
        closes: Mutex<Vec<Option<FirestoreError>>>,
    }

    #[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
    #[cfg_attr(not(target_arch = "wasm32"), async_trait)]
    impl WatchStreamListener for Recorder {
        async fn on_watch_stream_open(&self) {
            *self.opened.lock().unwrap() += 1;
        }

        async fn on_watch_stream_change(&self, change: WatchChange, snapshot_version: SnapshotVersion) {
            self.changes.lock().unwrap().push((change, snapshot_version));
        }

        async fn on_watch_stream_close(&self, error: Option<FirestoreError>) {
            self.closes.lock().unwrap().push(error);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sends_targets_and_decodes_changes() {
        let (datastore, server, database_id) = connected_datastore();
        let queue = AsyncQueue::new();
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn WatchStreamListener> = recorder.clone();
        let stream = Arc::new(ListenStream::new(
            queue.clone(),
            datastore,
            StreamCredentialProvider::new(
                Arc::new(crate::firestore::remote::datastore::NoopTokenProvider),
                Arc::new(crate::firestore::remote::datastore::NoopTokenProvider),
                None,
            ),
            JsonProtoSerializer::new(database_id),
            BackoffConfig::default(),
            Duration::from_secs(60),
            Arc::downgrade(&listener),
        ));

        let starter = Arc::clone(&stream);
        queue.enqueue(move || async move { starter.start(); Ok(()) }).await.unwrap();
        let peer = server.accept().await.unwrap();
        wait_until(|| *recorder.opened.lock().unwrap() == 1).await;

        let target = TargetData::new(query("rooms").to_target(), 2, TargetPurpose::Listen, 1);
        let watcher = Arc::clone(&stream);
        queue
            .enqueue(move || async move {
                watcher.watch(&target).await;
                Ok(())
            })
            .await
            .unwrap();
        let request = decode_message(&peer.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(request["addTarget"]["targetId"], json!(2));

        let response = json!({
            "targetChange": {
                "targetChangeType": "CURRENT",
                "targetIds": [],
                "resumeToken": "AQI=",
                "readTime": "1970-01-01T00:00:01Z"
            }
        });
        peer.send(encode_message(&response)).await.unwrap();
        wait_until(|| recorder.changes.lock().unwrap().len() == 1).await;

        let (change, version) = recorder.changes.lock().unwrap()[0].clone();
        assert_eq!(version.to_micros(), 1_000_000);
        match change {
            WatchChange::TargetChange(change) => {
                assert_eq!(change.state, TargetChangeState::Current);
                assert_eq!(change.resume_token, vec![1, 2]);
            }
            other => panic!("unexpected change {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn malformed_message_closes_with_error() {
        let (datastore, server, database_id) = connected_datastore();
        let queue = AsyncQueue::new();
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn WatchStreamListener> = recorder.clone();
        let stream = Arc::new(ListenStream::new(
            queue.clone(),
            datastore,
            StreamCredentialProvider::new(
                Arc::new(crate::firestore::remote::datastore::NoopTokenProvider),
                Arc::new(crate::firestore::remote::datastore::NoopTokenProvider),
                None,
            ),
            JsonProtoSerializer::new(database_id),
            BackoffConfig::default(),
            Duration::from_secs(60),
            Arc::downgrade(&listener),
        ));
        let starter = Arc::clone(&stream);
        queue.enqueue(move || async move { starter.start(); Ok(()) }).await.unwrap();
        let peer = server.accept().await.unwrap();
        wait_until(|| *recorder.opened.lock().unwrap() == 1).await;

        peer.send(b"not json".to_vec()).await.unwrap();
        wait_until(|| recorder.closes.lock().unwrap().len() == 1).await;
        assert!(recorder.closes.lock().unwrap()[0].is_some());
        assert!(!stream.is_started());
    }
}

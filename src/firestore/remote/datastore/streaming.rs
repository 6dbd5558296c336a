use std::sync::Arc;

use super::{StreamHandle, StreamingDatastore, StreamingFuture};
use crate::firestore::error::FirestoreResult;
use crate::firestore::model::DatabaseId;
use crate::firestore::remote::network::StreamCredentials;
use crate::firestore::remote::stream::{MultiplexedConnection, MultiplexedStream, StreamHeaders};

use futures::FutureExt;

pub const PATH_HEADER: &str = ":path";
pub const LISTEN_RPC_PATH: &str = "/google.firestore.v1.Firestore/Listen";
pub const WRITE_RPC_PATH: &str = "/google.firestore.v1.Firestore/Write";
pub const RESOURCE_PREFIX_HEADER: &str = "google-cloud-resource-prefix";
pub const AUTHORIZATION_HEADER: &str = "authorization";
pub const APP_CHECK_HEADER: &str = "x-firebase-appcheck";
pub const HEARTBEAT_HEADER: &str = "x-firebase-client";

#[cfg(target_arch = "wasm32")]
pub(crate) fn box_stream_future<'a, F, T>(future: F) -> StreamingFuture<'a, T>
where
    F: std::future::Future<Output = T> + 'a,
{
    future.boxed_local()
}

#[cfg(not(target_arch = "wasm32"))]
pub(crate) fn box_stream_future<'a, F, T>(future: F) -> StreamingFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    future.boxed()
}

/// Opens listen and write RPCs as logical streams of one multiplexed
/// connection. The RPC and its credentials travel in the open frame headers.
pub struct StreamingDatastoreImpl {
    connection: Arc<MultiplexedConnection>,
    database_id: DatabaseId,
}

impl StreamingDatastoreImpl {
    pub fn new(connection: Arc<MultiplexedConnection>, database_id: DatabaseId) -> Self {
        Self {
            connection,
            database_id,
        }
    }

    fn headers(&self, rpc_path: &str, credentials: &StreamCredentials) -> StreamHeaders {
        let mut headers = StreamHeaders::new();
        headers.insert(PATH_HEADER.to_string(), rpc_path.to_string());
        headers.insert(
            RESOURCE_PREFIX_HEADER.to_string(),
            format!(
                "projects/{}/databases/{}",
                self.database_id.project_id(),
                self.database_id.database()
            ),
        );
        if let Some(token) = &credentials.auth_token {
            headers.insert(AUTHORIZATION_HEADER.to_string(), format!("Bearer {token}"));
        }
        if let Some(token) = &credentials.app_check_token {
            headers.insert(APP_CHECK_HEADER.to_string(), token.clone());
        }
        if let Some(heartbeat) = &credentials.heartbeat_header {
            headers.insert(HEARTBEAT_HEADER.to_string(), heartbeat.clone());
        }
        headers
    }

    fn open(&self, headers: StreamHeaders) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>> {
        let connection = Arc::clone(&self.connection);
        box_stream_future(async move {
            let stream = connection.open_stream(headers).await?;
            Ok(Arc::new(StreamingHandleImpl::new(stream)) as Arc<dyn StreamHandle>)
        })
    }
}

impl StreamingDatastore for StreamingDatastoreImpl {
    fn open_listen_stream(
        &self,
        credentials: &StreamCredentials,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>> {
        self.open(self.headers(LISTEN_RPC_PATH, credentials))
    }

    fn open_write_stream(
        &self,
        credentials: &StreamCredentials,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>> {
        self.open(self.headers(WRITE_RPC_PATH, credentials))
    }
}

pub struct StreamingHandleImpl {
    stream: MultiplexedStream,
}

impl StreamingHandleImpl {
    pub fn new(stream: MultiplexedStream) -> Self {
        Self { stream }
    }
}

impl StreamHandle for StreamingHandleImpl {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>> {
        let stream = &self.stream;
        box_stream_future(async move { stream.send(payload).await })
    }

    fn next(&self) -> StreamingFuture<'_, Option<FirestoreResult<Vec<u8>>>> {
        let stream = &self.stream;
        box_stream_future(async move { stream.next().await })
    }

    fn close(&self) -> StreamingFuture<'_, FirestoreResult<()>> {
        let stream = &self.stream;
        box_stream_future(async move { stream.close().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::remote::stream::InMemoryTransport;

    #[tokio::test]
    async fn listen_stream_carries_rpc_and_credentials() {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        let left_connection = Arc::new(MultiplexedConnection::new(left_transport));
        let right_connection = Arc::new(MultiplexedConnection::new(right_transport));

        let datastore = StreamingDatastoreImpl::new(
            Arc::clone(&left_connection),
            DatabaseId::new("project", "(default)"),
        );
        let credentials = StreamCredentials {
            auth_token: Some("owner".into()),
            app_check_token: None,
            heartbeat_header: Some("hb".into()),
        };
        let handle = datastore
            .open_listen_stream(&credentials)
            .await
            .expect("open listen stream");
        handle.send(b"hello".to_vec()).await.expect("send");

        let peer_stream = right_connection.accept().await.expect("accept");
        let headers = peer_stream.headers();
        assert_eq!(headers[PATH_HEADER], LISTEN_RPC_PATH);
        assert_eq!(headers[AUTHORIZATION_HEADER], "Bearer owner");
        assert_eq!(headers[HEARTBEAT_HEADER], "hb");
        assert_eq!(
            headers[RESOURCE_PREFIX_HEADER],
            "projects/project/databases/(default)"
        );
        assert!(!headers.contains_key(APP_CHECK_HEADER));

        let payload = peer_stream.next().await.expect("frame").expect("payload");
        assert_eq!(payload, b"hello");

        peer_stream.send(b"world".to_vec()).await.expect("reply");
        let reply = handle.next().await.expect("frame").expect("payload");
        assert_eq!(reply, b"world");
        handle.close().await.expect("close stream");
    }
}

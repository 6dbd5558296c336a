use std::sync::Arc;

use async_trait::async_trait;
#[cfg(not(target_arch = "wasm32"))]
use futures::future::BoxFuture;
#[cfg(target_arch = "wasm32")]
use futures::future::LocalBoxFuture;

use crate::firestore::error::FirestoreResult;
use crate::firestore::model::{DocumentKey, MaybeDocument, Mutation, MutationResult, User};
use crate::firestore::remote::network::StreamCredentials;

pub mod in_memory;
pub mod streaming;

#[cfg(not(target_arch = "wasm32"))]
pub type StreamingFuture<'a, T> = BoxFuture<'a, T>;
#[cfg(target_arch = "wasm32")]
pub type StreamingFuture<'a, T> = LocalBoxFuture<'a, T>;

/// One open bidirectional RPC.
pub trait StreamHandle: Send + Sync + 'static {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>>;

    /// Next message; `None` once the server closed the stream cleanly.
    fn next(&self) -> StreamingFuture<'_, Option<FirestoreResult<Vec<u8>>>>;

    fn close(&self) -> StreamingFuture<'_, FirestoreResult<()>>;
}

/// Opens the two long-lived RPCs the client keeps with the backend.
pub trait StreamingDatastore: Send + Sync + 'static {
    fn open_listen_stream(
        &self,
        credentials: &StreamCredentials,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>>;

    fn open_write_stream(
        &self,
        credentials: &StreamCredentials,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>>;
}

/// Unary RPCs used by transactions.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait Datastore: Send + Sync + 'static {
    /// Reads `keys`; missing documents come back as `NoDocument` at the
    /// read time.
    async fn lookup(&self, keys: Vec<DocumentKey>) -> FirestoreResult<Vec<MaybeDocument>>;

    /// Applies `mutations` atomically.
    async fn commit(&self, mutations: Vec<Mutation>) -> FirestoreResult<Vec<MutationResult>>;
}

pub type UserChangeListener = Arc<dyn Fn(User) + Send + Sync>;

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait TokenProvider: Send + Sync + 'static {
    async fn get_token(&self) -> FirestoreResult<Option<String>>;
    fn invalidate_token(&self);
    async fn heartbeat_header(&self) -> FirestoreResult<Option<String>> {
        Ok(None)
    }

    /// Registers the callback told about the signed-in user. Providers that
    /// know about users call it once right away and again on every change.
    fn set_user_change_listener(&self, _listener: UserChangeListener) {}
}

#[derive(Default, Clone)]
pub struct NoopTokenProvider;

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl TokenProvider for NoopTokenProvider {
    async fn get_token(&self) -> FirestoreResult<Option<String>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}
}

pub type TokenProviderArc = Arc<dyn TokenProvider>;

pub use in_memory::InMemoryDatastore;
pub use streaming::{StreamingDatastoreImpl, StreamingHandleImpl};

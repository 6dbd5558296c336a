use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;

use crate::firestore::async_queue::AsyncQueue;
use crate::firestore::error::{internal_error, FirestoreError, FirestoreResult};
use crate::firestore::model::{Mutation, MutationResult, SnapshotVersion};
use crate::firestore::remote::datastore::StreamingDatastore;
use crate::firestore::remote::network::StreamCredentialProvider;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::stream::persistent::{
    PersistentStream, PersistentStreamDelegate, StreamKind,
};
use crate::util::backoff::BackoffConfig;

use super::listen::{decode_message, encode_message};

/// Receives the events of a [`WriteStream`] on the async queue.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait WriteStreamListener: Send + Sync + 'static {
    async fn on_write_stream_open(&self);

    async fn on_write_handshake_complete(&self);

    async fn on_mutation_result(&self, commit_version: SnapshotVersion, results: Vec<MutationResult>);

    async fn on_write_stream_close(&self, error: Option<FirestoreError>);
}

#[derive(Default)]
struct WriteState {
    handshake_complete: bool,
    /// Token the backend handed out with its last response. Sent back with
    /// every write so the backend can tell which writes were acknowledged.
    last_stream_token: Vec<u8>,
}

type SharedWriteState = Arc<Mutex<WriteState>>;

fn lock(state: &SharedWriteState) -> MutexGuard<'_, WriteState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The `Write` RPC. After opening, the client sends a handshake and waits
/// for the stream token before sending mutations.
pub struct WriteStream {
    stream: Arc<PersistentStream>,
    serializer: JsonProtoSerializer,
    state: SharedWriteState,
}

impl WriteStream {
    pub fn new(
        queue: AsyncQueue,
        datastore: Arc<dyn StreamingDatastore>,
        credentials: StreamCredentialProvider,
        serializer: JsonProtoSerializer,
        backoff: BackoffConfig,
        idle_timeout: Duration,
        listener: Weak<dyn WriteStreamListener>,
    ) -> Self {
        let state = SharedWriteState::default();
        let delegate = Arc::new(WriteDelegate {
            serializer: serializer.clone(),
            state: Arc::clone(&state),
            listener,
        });
        let stream = PersistentStream::new(
            StreamKind::Write,
            queue,
            datastore,
            credentials,
            backoff,
            idle_timeout,
            delegate,
        );
        Self {
            stream,
            serializer,
            state,
        }
    }

    pub fn start(&self) {
        lock(&self.state).handshake_complete = false;
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

    pub fn handshake_complete(&self) -> bool {
        lock(&self.state).handshake_complete
    }

    pub fn last_stream_token(&self) -> Vec<u8> {
        lock(&self.state).last_stream_token.clone()
    }

    pub fn set_last_stream_token(&self, token: Vec<u8>) {
        lock(&self.state).last_stream_token = token;
    }

    /// First message of every write stream; the reply carries the token to
    /// use for subsequent writes.
    pub async fn write_handshake(&self) {
        debug_assert!(self.is_open(), "handshake on a closed write stream");
        debug_assert!(!self.handshake_complete(), "handshake already completed");
        let request = self.serializer.encode_write_handshake();
        self.stream.send(encode_message(&request)).await;
    }

    pub async fn write_mutations(&self, mutations: &[Mutation]) {
        debug_assert!(self.handshake_complete(), "writes before the handshake");
        let token = self.last_stream_token();
        let request = self.serializer.encode_write_request(&token, mutations);
        self.stream.send(encode_message(&request)).await;
    }
}

struct WriteDelegate {
    serializer: JsonProtoSerializer,
    state: SharedWriteState,
    listener: Weak<dyn WriteStreamListener>,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl PersistentStreamDelegate for WriteDelegate {
    async fn on_open(&self, _stream: &PersistentStream) {
        if let Some(listener) = self.listener.upgrade() {
            listener.on_write_stream_open().await;
        }
    }

    async fn on_message(&self, stream: &PersistentStream, payload: Vec<u8>) -> FirestoreResult<()> {
        let response = self
            .serializer
            .decode_write_response(&decode_message(&payload)?)?;
        let was_handshake = {
            let mut state = lock(&self.state);
            state.last_stream_token = response.stream_token;
            let was_handshake = !state.handshake_complete;
            state.handshake_complete = true;
            was_handshake
        };
        let Some(listener) = self.listener.upgrade() else {
            return Ok(());
        };

        if was_handshake {
            if !response.write_results.is_empty() {
                return Err(internal_error("Got mutation results for the handshake"));
            }
            listener.on_write_handshake_complete().await;
        } else {
            // Only a real write acknowledgement proves the stream is healthy.
            stream.reset_backoff();
            listener
                .on_mutation_result(response.commit_version, response.write_results)
                .await;
        }
        Ok(())
    }

    async fn on_close(&self, _stream: &PersistentStream, error: Option<FirestoreError>) {
        if let Some(listener) = self.listener.upgrade() {
            listener.on_write_stream_close(error).await;
        }
    }
}

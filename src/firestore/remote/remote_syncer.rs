use std::collections::BTreeSet;

use futures::FutureExt;

use crate::firestore::core::types::{BatchId, OnlineState, TargetId};
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::model::{
    DocumentKey, MutationBatch, MutationBatchResult, SnapshotVersion, User,
};
use crate::firestore::remote::remote_event::RemoteEvent;

#[cfg(target_arch = "wasm32")]
pub type RemoteStoreFuture<'a, T> = futures::future::LocalBoxFuture<'a, T>;
#[cfg(not(target_arch = "wasm32"))]
pub type RemoteStoreFuture<'a, T> = futures::future::BoxFuture<'a, T>;

#[cfg(target_arch = "wasm32")]
pub fn box_remote_store_future<'a, F, T>(future: F) -> RemoteStoreFuture<'a, T>
where
    F: std::future::Future<Output = T> + 'a,
{
    future.boxed_local()
}

#[cfg(not(target_arch = "wasm32"))]
pub fn box_remote_store_future<'a, F, T>(future: F) -> RemoteStoreFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    future.boxed()
}

/// What the remote store needs from the layer above it: somewhere to
/// deliver watch events and write acknowledgements, and access to the
/// queued mutations.
pub trait RemoteSyncer: Send + Sync + 'static {
    /// Applies a consistent snapshot of watch changes.
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The backend removed `target_id` because of `error`.
    fn reject_listen(
        &self,
        target_id: TargetId,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    fn apply_successful_write(
        &self,
        result: MutationBatchResult,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The backend rejected `batch_id` permanently.
    fn reject_failed_write(
        &self,
        batch_id: BatchId,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// Documents the client considers part of `target_id` as of the last
    /// remote event, including limbo documents for limbo targets.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// The queued batch with the lowest id greater than `after_batch_id`.
    fn next_mutation_batch(
        &self,
        after_batch_id: BatchId,
    ) -> RemoteStoreFuture<'_, FirestoreResult<Option<MutationBatch>>>;

    fn get_last_stream_token(&self) -> RemoteStoreFuture<'_, FirestoreResult<Vec<u8>>>;

    fn set_last_stream_token(&self, token: Vec<u8>) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// Version of the last remote event persisted locally. Older snapshots
    /// from a reconnecting stream are not raised again.
    fn get_last_remote_snapshot_version(
        &self,
    ) -> RemoteStoreFuture<'_, FirestoreResult<SnapshotVersion>>;

    /// Switches local state to `user` while the streams are down.
    fn handle_credential_change(&self, user: User) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// Raised whenever the remote store's view of connectivity changes.
    fn apply_online_state_change(&self, online_state: OnlineState);
}

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::firestore::async_queue::{AsyncQueue, TimerId};
use crate::firestore::error::{
    aborted, failed_precondition, invalid_argument, is_permanent_error, FirestoreError,
    FirestoreErrorCode, FirestoreResult,
};
use crate::firestore::model::{
    DocumentKey, MaybeDocument, Mutation, Precondition, SnapshotVersion,
};
use crate::firestore::remote::datastore::Datastore;
use crate::firestore::settings::SyncSettings;
use crate::firestore::value::MapValue;
use crate::util::backoff::ExponentialBackoff;

#[derive(Default)]
struct TransactionState {
    /// Version of every document read; `min` for documents that did not
    /// exist.
    read_versions: BTreeMap<DocumentKey, SnapshotVersion>,
    mutations: Vec<Mutation>,
    written_docs: BTreeSet<DocumentKey>,
    /// Writes are buffered, so a bad write surfaces at commit.
    last_write_error: Option<FirestoreError>,
    committed: bool,
}

/// Reads and buffered writes of one transaction attempt.
///
/// Every write is guarded by the version its document had when read, and
/// documents read but not written are verified at commit. Any concurrent
/// change makes the commit fail with a retryable error.
pub struct Transaction {
    datastore: Arc<dyn Datastore>,
    state: Mutex<TransactionState>,
}

impl Transaction {
    pub fn new(datastore: Arc<dyn Datastore>) -> Self {
        Self {
            datastore,
            state: Mutex::new(TransactionState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, TransactionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_commit_not_called(state: &TransactionState) -> FirestoreResult<()> {
        if state.committed {
            return Err(failed_precondition(
                "A transaction object cannot be used after its update callback has been invoked.",
            ));
        }
        Ok(())
    }

    /// Reads `keys` from the backend. All reads must happen before the
    /// first write.
    pub async fn lookup(&self, keys: Vec<DocumentKey>) -> FirestoreResult<Vec<MaybeDocument>> {
        {
            let state = self.state();
            Self::ensure_commit_not_called(&state)?;
            if !state.mutations.is_empty() {
                return Err(invalid_argument(
                    "Firestore transactions require all reads to be executed before all writes.",
                ));
            }
        }
        let documents = self.datastore.lookup(keys).await?;
        let mut state = self.state();
        for document in &documents {
            Self::record_version(&mut state, document)?;
        }
        Ok(documents)
    }

    fn record_version(state: &mut TransactionState, document: &MaybeDocument) -> FirestoreResult<()> {
        let version = if document.is_document() {
            document.version()
        } else {
            SnapshotVersion::min()
        };
        match state.read_versions.get(document.key()) {
            Some(existing) if *existing != version => {
                // Both reads ran in this transaction yet saw different data.
                Err(aborted("Document version changed between two reads."))
            }
            Some(_) => Ok(()),
            None => {
                state.read_versions.insert(document.key().clone(), version);
                Ok(())
            }
        }
    }

    /// Guard for a write that replaces or deletes `key`.
    fn precondition(state: &TransactionState, key: &DocumentKey) -> Precondition {
        // The first write already carries the read guard.
        if state.written_docs.contains(key) {
            return Precondition::None;
        }
        match state.read_versions.get(key) {
            Some(version) if version.is_min() => Precondition::Exists(false),
            Some(version) => Precondition::UpdateTime(*version),
            None => Precondition::None,
        }
    }

    fn precondition_for_update(
        state: &TransactionState,
        key: &DocumentKey,
    ) -> FirestoreResult<Precondition> {
        if state.written_docs.contains(key) {
            return Ok(Precondition::Exists(true));
        }
        match state.read_versions.get(key) {
            // A document read as missing may not be created by an update.
            Some(version) if version.is_min() => Err(invalid_argument(
                "Can't update a document that doesn't exist.",
            )),
            Some(version) => Ok(Precondition::UpdateTime(*version)),
            None => Ok(Precondition::Exists(true)),
        }
    }

    fn write(&self, key: DocumentKey, build: impl FnOnce(&TransactionState) -> FirestoreResult<Mutation>) {
        let mut state = self.state();
        match build(&state) {
            Ok(mutation) => state.mutations.push(mutation),
            Err(err) => state.last_write_error = Some(err),
        }
        state.written_docs.insert(key);
    }

    pub fn set(&self, key: DocumentKey, data: MapValue) {
        self.write(key.clone(), |state| {
            let precondition = Self::precondition(state, &key);
            Ok(Mutation::set(key, data).with_precondition(precondition))
        });
    }

    pub fn update(&self, key: DocumentKey, data: MapValue) {
        self.write(key.clone(), |state| {
            let precondition = Self::precondition_for_update(state, &key)?;
            Ok(Mutation::patch(key, data).with_precondition(precondition))
        });
    }

    pub fn delete(&self, key: DocumentKey) {
        self.write(key.clone(), |state| {
            let precondition = Self::precondition(state, &key);
            Ok(Mutation::delete(key).with_precondition(precondition))
        });
    }

    /// Sends the buffered writes plus a verify for every document that was
    /// read but not written.
    pub async fn commit(&self) -> FirestoreResult<()> {
        let mutations = {
            let mut state = self.state();
            Self::ensure_commit_not_called(&state)?;
            if let Some(err) = state.last_write_error.take() {
                return Err(err);
            }
            let mut mutations = std::mem::take(&mut state.mutations);
            let unwritten: Vec<DocumentKey> = state
                .read_versions
                .keys()
                .filter(|key| !state.written_docs.contains(*key))
                .cloned()
                .collect();
            for key in unwritten {
                let precondition = Self::precondition(&state, &key);
                mutations.push(Mutation::verify(key, precondition));
            }
            state.committed = true;
            mutations
        };
        self.datastore.commit(mutations).await.map(|_| ())
    }
}

/// Errors that may clear up when the transaction is run again.
fn is_retryable_transaction_error(error: &FirestoreError) -> bool {
    matches!(
        error.code,
        FirestoreErrorCode::Aborted
            | FirestoreErrorCode::FailedPrecondition
            | FirestoreErrorCode::AlreadyExists
    ) || !is_permanent_error(error.code)
}

/// Runs `update_fn` in a fresh [`Transaction`] and commits it, retrying
/// with backoff on contention until the configured number of attempts is
/// used up. The last error is returned once no attempts remain.
pub async fn run_transaction<T, F, Fut>(
    queue: &AsyncQueue,
    datastore: Arc<dyn Datastore>,
    settings: &SyncSettings,
    mut update_fn: F,
) -> FirestoreResult<T>
where
    F: FnMut(Arc<Transaction>) -> Fut,
    Fut: Future<Output = FirestoreResult<T>>,
{
    let mut backoff = ExponentialBackoff::new(settings.backoff_config());
    let mut attempts_remaining = settings.max_transaction_attempts.max(1);
    loop {
        attempts_remaining -= 1;
        let transaction = Arc::new(Transaction::new(Arc::clone(&datastore)));
        let result = match update_fn(Arc::clone(&transaction)).await {
            Ok(value) => transaction.commit().await.map(|()| value),
            Err(err) => Err(err),
        };
        match result {
            Ok(value) => return Ok(value),
            Err(err) if attempts_remaining > 0 && is_retryable_transaction_error(&err) => {
                log::debug!("Retrying transaction ({attempts_remaining} attempts left): {err}");
                let delay = backoff.next_delay();
                backoff.mark_attempt();
                queue.sleep(TimerId::TransactionRetry, delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

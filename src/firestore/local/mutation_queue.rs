use std::collections::BTreeSet;

use crate::firestore::core::query::Query;
use crate::firestore::core::types::BatchId;
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::kv_store::{
    composite_key, id_key, KvTransaction, DOCUMENT_MUTATIONS, KEY_SEPARATOR, MUTATIONS,
    MUTATION_QUEUES,
};
use crate::firestore::local::local_serializer::{
    encode_child_prefix, encode_path, DbMutationBatch, DbMutationQueue, LocalSerializer,
};
use crate::firestore::model::{DocumentKey, Mutation, MutationBatch, Timestamp, User, BATCH_ID_UNKNOWN};

fn batch_key(user_id: &str, batch_id: BatchId) -> String {
    composite_key([user_id, id_key(batch_id as i64).as_str()])
}

fn document_mutation_key(user_id: &str, key: &DocumentKey, batch_id: BatchId) -> String {
    composite_key([
        user_id,
        encode_path(key.path()).as_str(),
        id_key(batch_id as i64).as_str(),
    ])
}

fn document_mutation_prefix(user_id: &str, key: &DocumentKey) -> String {
    let mut prefix = composite_key([user_id, encode_path(key.path()).as_str()]);
    prefix.push(KEY_SEPARATOR);
    prefix
}

fn user_prefix(user_id: &str) -> String {
    let mut prefix = user_id.to_string();
    prefix.push(KEY_SEPARATOR);
    prefix
}

/// Whether any user's queue holds a mutation for `key`.
pub fn any_queue_contains_key(txn: &KvTransaction<'_>, key: &DocumentKey) -> FirestoreResult<bool> {
    for (user_id, _) in txn.scan_all::<DbMutationQueue>(MUTATION_QUEUES)? {
        if !txn
            .keys_with_prefix(DOCUMENT_MUTATIONS, &document_mutation_prefix(&user_id, key))?
            .is_empty()
        {
            return Ok(true);
        }
    }
    Ok(false)
}

/// One user's queue of locally written batches that the backend has not
/// acknowledged yet, plus the write stream token and the id of the last
/// acknowledged batch.
///
/// Batches are indexed by document so the local view can find the batches
/// touching a document or a collection.
#[derive(Clone)]
pub struct MutationQueue {
    user_id: String,
    serializer: LocalSerializer,
    index_manager: IndexManager,
}

impl MutationQueue {
    pub fn new(user: &User, serializer: LocalSerializer) -> Self {
        Self {
            user_id: user.to_key(),
            serializer,
            index_manager: IndexManager::new(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn metadata(&self, txn: &KvTransaction<'_>) -> FirestoreResult<DbMutationQueue> {
        Ok(txn
            .get::<DbMutationQueue>(MUTATION_QUEUES, &self.user_id)?
            .unwrap_or_else(|| DbMutationQueue {
                user_id: self.user_id.clone(),
                last_acknowledged_batch_id: BATCH_ID_UNKNOWN,
                last_stream_token: String::new(),
            }))
    }

    pub fn check_empty(&self, txn: &KvTransaction<'_>) -> FirestoreResult<bool> {
        Ok(txn
            .keys_with_prefix(MUTATIONS, &user_prefix(&self.user_id))?
            .is_empty())
    }

    /// Persists a new batch. Ids increase across every user sharing the
    /// store and are never reused.
    pub fn add_mutation_batch(
        &self,
        txn: &mut KvTransaction<'_>,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch> {
        let batch_id = self.next_batch_id(txn)?;
        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        let record = self.serializer.to_db_mutation_batch(&self.user_id, &batch);
        txn.put(MUTATIONS, batch_key(&self.user_id, batch_id), &record)?;
        // The queue row doubles as the registry of users with queues.
        let metadata = self.metadata(txn)?;
        txn.put(MUTATION_QUEUES, self.user_id.clone(), &metadata)?;
        for mutation in &batch.mutations {
            let key = mutation.key();
            txn.put(
                DOCUMENT_MUTATIONS,
                document_mutation_key(&self.user_id, key, batch_id),
                &batch_id,
            )?;
            self.index_manager
                .add_to_collection_parent_index(txn, &key.collection_path())?;
        }
        Ok(batch)
    }

    pub fn lookup_mutation_batch(
        &self,
        txn: &KvTransaction<'_>,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<MutationBatch>> {
        txn.get::<DbMutationBatch>(MUTATIONS, &batch_key(&self.user_id, batch_id))?
            .map(|record| self.serializer.from_db_mutation_batch(&record))
            .transpose()
    }

    /// First queued batch with an id greater than `batch_id`.
    pub fn get_next_mutation_batch_after_batch_id(
        &self,
        txn: &KvTransaction<'_>,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<MutationBatch>> {
        Ok(self
            .get_all_mutation_batches(txn)?
            .into_iter()
            .find(|batch| batch.batch_id > batch_id))
    }

    pub fn get_highest_unacknowledged_batch_id(&self, txn: &KvTransaction<'_>) -> FirestoreResult<BatchId> {
        Ok(txn
            .scan_prefix::<DbMutationBatch>(MUTATIONS, &user_prefix(&self.user_id))?
            .last()
            .map(|(_, record)| record.batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN))
    }

    pub fn get_all_mutation_batches(&self, txn: &KvTransaction<'_>) -> FirestoreResult<Vec<MutationBatch>> {
        txn.scan_prefix::<DbMutationBatch>(MUTATIONS, &user_prefix(&self.user_id))?
            .iter()
            .map(|(_, record)| self.serializer.from_db_mutation_batch(record))
            .collect()
    }

    pub fn get_all_mutation_batches_affecting_document_key(
        &self,
        txn: &KvTransaction<'_>,
        key: &DocumentKey,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let keys = BTreeSet::from([key.clone()]);
        self.get_all_mutation_batches_affecting_document_keys(txn, &keys)
    }

    /// Batches touching any of `keys`, in batch id order.
    pub fn get_all_mutation_batches_affecting_document_keys(
        &self,
        txn: &KvTransaction<'_>,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let mut batch_ids = BTreeSet::new();
        for key in keys {
            let prefix = document_mutation_prefix(&self.user_id, key);
            for (_, batch_id) in txn.scan_prefix::<BatchId>(DOCUMENT_MUTATIONS, &prefix)? {
                batch_ids.insert(batch_id);
            }
        }
        self.lookup_batches(txn, batch_ids)
    }

    /// Batches touching documents directly inside the query's collection.
    pub fn get_all_mutation_batches_affecting_query(
        &self,
        txn: &KvTransaction<'_>,
        query: &Query,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let collection = query.path();
        let mut prefix = user_prefix(&self.user_id);
        prefix.push_str(&encode_child_prefix(collection));
        let child_separators = collection.len();

        let mut batch_ids = BTreeSet::new();
        for (row_key, batch_id) in txn.scan_prefix::<BatchId>(DOCUMENT_MUTATIONS, &prefix)? {
            // Skip documents in nested collections.
            let encoded_path = row_key
                .split(KEY_SEPARATOR)
                .nth(1)
                .unwrap_or_default();
            if encoded_path.matches('\u{1}').count() == child_separators {
                batch_ids.insert(batch_id);
            }
        }
        self.lookup_batches(txn, batch_ids)
    }

    /// Deletes the batch and its document index rows.
    pub fn remove_mutation_batch(&self, txn: &mut KvTransaction<'_>, batch: &MutationBatch) -> FirestoreResult<()> {
        let row_key = batch_key(&self.user_id, batch.batch_id);
        if !txn.contains(MUTATIONS, &row_key) {
            return Err(internal_error(format!(
                "Dangling mutation batch {} for user '{}'",
                batch.batch_id, self.user_id
            )));
        }
        txn.delete(MUTATIONS, row_key)?;
        for mutation in &batch.mutations {
            txn.delete(
                DOCUMENT_MUTATIONS,
                document_mutation_key(&self.user_id, mutation.key(), batch.batch_id),
            )?;
        }
        Ok(())
    }

    /// Records `batch_id` as acknowledged along with the stream token of
    /// the response.
    pub fn acknowledge_batch(
        &self,
        txn: &mut KvTransaction<'_>,
        batch_id: BatchId,
        stream_token: &[u8],
    ) -> FirestoreResult<()> {
        let mut metadata = self.metadata(txn)?;
        metadata.last_acknowledged_batch_id = batch_id;
        metadata.last_stream_token = self.serializer.remote().encode_bytes(stream_token);
        txn.put(MUTATION_QUEUES, self.user_id.clone(), &metadata)
    }

    pub fn get_last_stream_token(&self, txn: &KvTransaction<'_>) -> FirestoreResult<Vec<u8>> {
        let metadata = self.metadata(txn)?;
        self.serializer
            .remote()
            .decode_bytes(&serde_json::Value::String(metadata.last_stream_token))
    }

    pub fn set_last_stream_token(&self, txn: &mut KvTransaction<'_>, stream_token: &[u8]) -> FirestoreResult<()> {
        let mut metadata = self.metadata(txn)?;
        metadata.last_stream_token = self.serializer.remote().encode_bytes(stream_token);
        txn.put(MUTATION_QUEUES, self.user_id.clone(), &metadata)
    }

    /// Whether this user's queue holds a mutation for `key`.
    pub fn contains_key(&self, txn: &KvTransaction<'_>, key: &DocumentKey) -> FirestoreResult<bool> {
        Ok(!txn
            .keys_with_prefix(DOCUMENT_MUTATIONS, &document_mutation_prefix(&self.user_id, key))?
            .is_empty())
    }

    fn lookup_batches(
        &self,
        txn: &KvTransaction<'_>,
        batch_ids: BTreeSet<BatchId>,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let mut batches = Vec::with_capacity(batch_ids.len());
        for batch_id in batch_ids {
            match self.lookup_mutation_batch(txn, batch_id)? {
                Some(batch) => batches.push(batch),
                None => {
                    return Err(internal_error(format!(
                        "Dangling document-mutation reference to batch {batch_id}"
                    )))
                }
            }
        }
        Ok(batches)
    }

    fn next_batch_id(&self, txn: &KvTransaction<'_>) -> FirestoreResult<BatchId> {
        let mut highest = BATCH_ID_UNKNOWN;
        let mut users = BTreeSet::new();
        for (user_id, queue) in txn.scan_all::<DbMutationQueue>(MUTATION_QUEUES)? {
            highest = highest.max(queue.last_acknowledged_batch_id);
            users.insert(user_id);
        }
        users.insert(self.user_id.clone());
        for user_id in &users {
            if let Some((_, record)) = txn
                .scan_prefix::<DbMutationBatch>(MUTATIONS, &user_prefix(user_id))?
                .last()
            {
                highest = highest.max(record.batch_id);
            }
        }
        Ok(highest.max(0) + 1)
    }
}

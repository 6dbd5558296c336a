use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::kv_store::KvTransaction;
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::model::{
    Document, DocumentKey, MaybeDocument, Mutation, MutationBatch, NoDocument, SnapshotVersion,
};

/// Local view of documents: the remote document cache with the pending
/// mutation batches of the current user applied on top.
#[derive(Clone)]
pub struct LocalDocumentsView {
    remote_document_cache: RemoteDocumentCache,
    mutation_queue: MutationQueue,
    index_manager: IndexManager,
}

impl LocalDocumentsView {
    pub fn new(
        remote_document_cache: RemoteDocumentCache,
        mutation_queue: MutationQueue,
        index_manager: IndexManager,
    ) -> Self {
        Self {
            remote_document_cache,
            mutation_queue,
            index_manager,
        }
    }

    /// The local view of `key`, or `None` if nothing is known about it.
    pub fn get_document(
        &self,
        txn: &KvTransaction<'_>,
        key: &DocumentKey,
    ) -> FirestoreResult<Option<MaybeDocument>> {
        let batches = self
            .mutation_queue
            .get_all_mutation_batches_affecting_document_key(txn, key)?;
        let mut document = self.remote_document_cache.get_entry(txn, key)?;
        for batch in &batches {
            document = batch.apply_to_local_view(key, document);
        }
        Ok(document)
    }

    /// Local views of `keys`. Keys nothing is known about map to a
    /// `NoDocument` at version zero.
    pub fn get_documents(
        &self,
        txn: &KvTransaction<'_>,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MaybeDocument>> {
        let base_docs = self.remote_document_cache.get_entries(txn, keys)?;
        self.get_local_view_of_documents(txn, base_docs)
    }

    /// Applies pending batches to `base_docs`, which must hold an entry
    /// (possibly `None`) for every key of interest.
    pub fn get_local_view_of_documents(
        &self,
        txn: &KvTransaction<'_>,
        base_docs: BTreeMap<DocumentKey, Option<MaybeDocument>>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MaybeDocument>> {
        let keys: BTreeSet<DocumentKey> = base_docs.keys().cloned().collect();
        let batches = self
            .mutation_queue
            .get_all_mutation_batches_affecting_document_keys(txn, &keys)?;
        Ok(Self::apply_local_mutations_to_documents(base_docs, &batches)
            .into_iter()
            .map(|(key, maybe_doc)| {
                let maybe_doc = maybe_doc
                    .unwrap_or_else(|| NoDocument::new(key.clone(), SnapshotVersion::min()).into());
                (key, maybe_doc)
            })
            .collect())
    }

    fn apply_local_mutations_to_documents(
        docs: BTreeMap<DocumentKey, Option<MaybeDocument>>,
        batches: &[MutationBatch],
    ) -> BTreeMap<DocumentKey, Option<MaybeDocument>> {
        docs.into_iter()
            .map(|(key, mut local_view)| {
                for batch in batches {
                    local_view = batch.apply_to_local_view(&key, local_view);
                }
                (key, local_view)
            })
            .collect()
    }

    /// Documents matching `query` in the local view. With a non-zero
    /// `since_read_time` only remote entries read after it are considered;
    /// documents with pending writes are always included.
    pub fn get_documents_matching_query(
        &self,
        txn: &KvTransaction<'_>,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        if query.is_document_query() {
            self.get_documents_matching_document_query(txn, query)
        } else if query.is_collection_group_query() {
            self.get_documents_matching_collection_group_query(txn, query, since_read_time)
        } else {
            self.get_documents_matching_collection_query(txn, query, since_read_time)
        }
    }

    fn get_documents_matching_document_query(
        &self,
        txn: &KvTransaction<'_>,
        query: &Query,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let key = DocumentKey::from_path(query.path().clone())?;
        let mut results = BTreeMap::new();
        if let Some(MaybeDocument::Document(doc)) = self.get_document(txn, &key)? {
            results.insert(key, doc);
        }
        Ok(results)
    }

    fn get_documents_matching_collection_group_query(
        &self,
        txn: &KvTransaction<'_>,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let collection_id = query.collection_group_id().unwrap_or_default();
        let mut results = BTreeMap::new();
        for parent in self.index_manager.get_collection_parents(txn, collection_id)? {
            let collection_query =
                query.as_collection_query_at_path(parent.child([collection_id]));
            results.extend(self.get_documents_matching_collection_query(
                txn,
                &collection_query,
                since_read_time,
            )?);
        }
        Ok(results)
    }

    fn get_documents_matching_collection_query(
        &self,
        txn: &KvTransaction<'_>,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let mut results = self
            .remote_document_cache
            .get_documents_matching_query(txn, query, since_read_time)?;
        let batches = self
            .mutation_queue
            .get_all_mutation_batches_affecting_query(txn, query)?;

        // Patches and transforms only apply to existing documents, so fetch
        // the remote version of documents the scan left out.
        let missing_patch_bases: BTreeSet<DocumentKey> = batches
            .iter()
            .flat_map(|batch| batch.mutations.iter())
            .filter(|mutation| matches!(mutation, Mutation::Patch { .. } | Mutation::Transform { .. }))
            .map(|mutation| mutation.key().clone())
            .filter(|key| !results.contains_key(key))
            .collect();
        for (key, maybe_doc) in self
            .remote_document_cache
            .get_entries(txn, &missing_patch_bases)?
        {
            if let Some(MaybeDocument::Document(doc)) = maybe_doc {
                results.insert(key, doc);
            }
        }

        for batch in &batches {
            for mutation in &batch.mutations {
                let key = mutation.key();
                let base_doc: Option<MaybeDocument> = results.get(key).cloned().map(Into::into);
                let mutated = mutation.apply_to_local_view(
                    base_doc.clone(),
                    base_doc.as_ref(),
                    batch.local_write_time,
                );
                match mutated {
                    Some(MaybeDocument::Document(doc)) => {
                        results.insert(key.clone(), doc);
                    }
                    _ => {
                        results.remove(key);
                    }
                }
            }
        }

        results.retain(|_, doc| query.matches(doc));
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::kv_store::{KvStore, TransactionMode};
    use crate::firestore::local::local_serializer::LocalSerializer;
    use crate::firestore::model::{DatabaseId, ResourcePath, Timestamp, User};
    use crate::firestore::remote::serializer::JsonProtoSerializer;
    use crate::firestore::test_support::{doc, field, filter, key, map, query, version};
    use crate::firestore::value::FirestoreValue;

    fn view() -> LocalDocumentsView {
        let serializer =
            LocalSerializer::new(JsonProtoSerializer::new(DatabaseId::new("p", "(default)")));
        LocalDocumentsView::new(
            RemoteDocumentCache::new(serializer.clone(), IndexManager::new()),
            MutationQueue::new(&User::new("alice"), serializer),
            IndexManager::new(),
        )
    }

    #[tokio::test]
    async fn pending_writes_overlay_remote_documents() {
        let store = KvStore::open("local-documents-overlay");
        let view = view();
        store
            .run(TransactionMode::ReadWrite, |txn| {
                view.remote_document_cache
                    .add_entry(txn, &doc("rooms/a", 1, &[("n", 1i64.into())]).into(), version(1))?;
                view.mutation_queue.add_mutation_batch(
                    txn,
                    Timestamp::now(),
                    vec![],
                    vec![
                        Mutation::patch(key("rooms/a"), map(&[("m", 2i64.into())])),
                        Mutation::set(key("rooms/b"), map(&[("n", 5i64.into())])),
                        Mutation::patch(key("rooms/c"), map(&[("n", 5i64.into())])),
                    ],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let (a, docs) = store
            .run(TransactionMode::ReadOnly, |txn| {
                let keys = [key("rooms/a"), key("rooms/c"), key("rooms/z")].into_iter().collect();
                Ok((
                    view.get_document(txn, &key("rooms/a"))?,
                    view.get_documents(txn, &keys)?,
                ))
            })
            .await
            .unwrap();
        let a = a.unwrap();
        assert!(a.has_pending_writes());
        assert_eq!(
            a.as_document().unwrap().field(&field("m")),
            Some(&FirestoreValue::from(2i64))
        );
        // A patch on a missing document does not create it.
        assert!(docs[&key("rooms/c")].is_no_document());
        assert_eq!(docs[&key("rooms/z")].version(), SnapshotVersion::min());
    }

    #[tokio::test]
    async fn collection_queries_include_local_writes() {
        let store = KvStore::open("local-documents-query");
        let view = view();
        store
            .run(TransactionMode::ReadWrite, |txn| {
                view.remote_document_cache
                    .add_entry(txn, &doc("rooms/a", 1, &[("n", 1i64.into())]).into(), version(1))?;
                view.remote_document_cache
                    .add_entry(txn, &doc("rooms/b", 1, &[("n", 9i64.into())]).into(), version(1))?;
                view.mutation_queue.add_mutation_batch(
                    txn,
                    Timestamp::now(),
                    vec![],
                    vec![
                        Mutation::set(key("rooms/c"), map(&[("n", 3i64.into())])),
                        Mutation::delete(key("rooms/b")),
                    ],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let results = store
            .run(TransactionMode::ReadOnly, |txn| {
                view.get_documents_matching_query(
                    txn,
                    &query("rooms").with_filter(filter("n", ">", 0i64.into())),
                    SnapshotVersion::min(),
                )
            })
            .await
            .unwrap();
        assert_eq!(
            results.keys().cloned().collect::<Vec<_>>(),
            vec![key("rooms/a"), key("rooms/c")]
        );
    }

    #[tokio::test]
    async fn collection_group_queries_span_parents() {
        let store = KvStore::open("local-documents-group");
        let view = view();
        store
            .run(TransactionMode::ReadWrite, |txn| {
                view.remote_document_cache
                    .add_entry(txn, &doc("rooms/a/messages/1", 1, &[]).into(), version(1))?;
                view.remote_document_cache
                    .add_entry(txn, &doc("users/u/messages/2", 1, &[]).into(), version(1))?;
                view.remote_document_cache
                    .add_entry(txn, &doc("rooms/a/other/3", 1, &[]).into(), version(1))
            })
            .await
            .unwrap();
        let results = store
            .run(TransactionMode::ReadOnly, |txn| {
                view.get_documents_matching_query(
                    txn,
                    &Query::collection_group(ResourcePath::root(), "messages"),
                    SnapshotVersion::min(),
                )
            })
            .await
            .unwrap();
        assert_eq!(
            results.keys().cloned().collect::<Vec<_>>(),
            vec![key("rooms/a/messages/1"), key("users/u/messages/2")]
        );
    }
}

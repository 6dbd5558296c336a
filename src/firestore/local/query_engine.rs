use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::{LimitType, Query};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::kv_store::KvTransaction;
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::model::{Document, DocumentKey, DocumentSet, MaybeDocument, SnapshotVersion};

/// Runs queries against the local cache without a query index.
///
/// When a target was last limbo-free at a known snapshot version, its
/// remote keys are trusted as the result set at that version. Only
/// documents written since then are scanned and merged in, unless a limit
/// query's boundary may have moved, which falls back to a full scan.
#[derive(Clone, Debug, Default)]
pub struct QueryEngine;

impl QueryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn get_documents_matching_query(
        &self,
        txn: &KvTransaction<'_>,
        local_documents: &LocalDocumentsView,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        // Queries that match every document gain nothing from the
        // incremental path.
        if query.matches_all_documents() || last_limbo_free_snapshot_version.is_min() {
            return self.execute_full_collection_scan(txn, local_documents, query);
        }

        let previous_results = self.apply_query(
            query,
            local_documents.get_documents(txn, remote_keys)?.into_values(),
        );

        if (query.has_limit_to_first() || query.has_limit_to_last())
            && self.needs_refill(
                query.limit_type(),
                &previous_results,
                remote_keys,
                last_limbo_free_snapshot_version,
            )
        {
            return self.execute_full_collection_scan(txn, local_documents, query);
        }

        log::debug!(
            "Re-using previous result from {last_limbo_free_snapshot_version} to execute query: {query}"
        );

        let mut updated_results = local_documents.get_documents_matching_query(
            txn,
            query,
            last_limbo_free_snapshot_version,
        )?;
        // Previous results already reflect pending writes; they win over
        // the changed-document scan.
        for doc in previous_results.iter() {
            updated_results.insert(doc.key().clone(), doc.clone());
        }
        Ok(updated_results)
    }

    /// The matching documents of `documents` in query order.
    fn apply_query(
        &self,
        query: &Query,
        documents: impl IntoIterator<Item = MaybeDocument>,
    ) -> DocumentSet {
        let mut results = DocumentSet::new(query.comparator());
        for doc in documents.into_iter().filter_map(MaybeDocument::into_document) {
            if query.matches(&doc) {
                results.add(doc);
            }
        }
        results
    }

    /// A limit query needs a full scan when a previously matching document
    /// dropped out of the result set or the document at the limit edge may
    /// have been displaced by an update after the limbo-free version.
    fn needs_refill(
        &self,
        limit_type: LimitType,
        sorted_previous_results: &DocumentSet,
        remote_keys: &BTreeSet<DocumentKey>,
        limbo_free_snapshot_version: SnapshotVersion,
    ) -> bool {
        if remote_keys.len() != sorted_previous_results.len() {
            return true;
        }
        let doc_at_limit_edge = match limit_type {
            LimitType::First => sorted_previous_results.last(),
            LimitType::Last => sorted_previous_results.first(),
        };
        match doc_at_limit_edge {
            None => false,
            Some(doc) => doc.has_pending_writes() || doc.version() > limbo_free_snapshot_version,
        }
    }

    fn execute_full_collection_scan(
        &self,
        txn: &KvTransaction<'_>,
        local_documents: &LocalDocumentsView,
        query: &Query,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        log::debug!("Using full collection scan to execute query: {query}");
        local_documents.get_documents_matching_query(txn, query, SnapshotVersion::min())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::target::OrderBy;
    use crate::firestore::local::index_manager::IndexManager;
    use crate::firestore::local::kv_store::{KvStore, TransactionMode};
    use crate::firestore::local::local_serializer::LocalSerializer;
    use crate::firestore::local::mutation_queue::MutationQueue;
    use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
    use crate::firestore::model::{DatabaseId, User};
    use crate::firestore::remote::serializer::JsonProtoSerializer;
    use crate::firestore::test_support::{doc, field, filter, key, query, version};
    use std::sync::Arc;

    struct Fixture {
        store: Arc<KvStore>,
        cache: RemoteDocumentCache,
        view: LocalDocumentsView,
    }

    fn fixture(name: &str) -> Fixture {
        let serializer =
            LocalSerializer::new(JsonProtoSerializer::new(DatabaseId::new("p", "(default)")));
        let cache = RemoteDocumentCache::new(serializer.clone(), IndexManager::new());
        Fixture {
            store: KvStore::open(name),
            view: LocalDocumentsView::new(
                cache.clone(),
                MutationQueue::new(&User::unauthenticated(), serializer),
                IndexManager::new(),
            ),
            cache,
        }
    }

    impl Fixture {
        async fn add(&self, docs: Vec<(Document, i64)>) {
            self.store
                .run(TransactionMode::ReadWrite, |txn| {
                    for (doc, read_time) in &docs {
                        self.cache
                            .add_entry(txn, &doc.clone().into(), version(*read_time))?;
                    }
                    Ok(())
                })
                .await
                .unwrap();
        }

        async fn run(
            &self,
            query: &Query,
            last_limbo_free: SnapshotVersion,
            remote_keys: &[&str],
        ) -> Vec<DocumentKey> {
            let remote_keys: BTreeSet<DocumentKey> = remote_keys.iter().map(|p| key(p)).collect();
            self.store
                .run(TransactionMode::ReadOnly, |txn| {
                    QueryEngine::new().get_documents_matching_query(
                        txn,
                        &self.view,
                        query,
                        last_limbo_free,
                        &remote_keys,
                    )
                })
                .await
                .unwrap()
                .into_keys()
                .collect()
        }
    }

    #[tokio::test]
    async fn uses_previous_results_and_recent_changes() {
        let fixture = fixture("query-engine-incremental");
        fixture
            .add(vec![
                (doc("rooms/a", 1, &[("n", 1i64.into())]), 10),
                (doc("rooms/b", 1, &[("n", 2i64.into())]), 10),
                (doc("rooms/c", 20, &[("n", 3i64.into())]), 20),
            ])
            .await;
        let matching = query("rooms").with_filter(filter("n", ">", 0i64.into()));

        // rooms/b was read before the limbo-free version but is not part
        // of the target's remote keys, so it is skipped.
        let results = fixture.run(&matching, version(10), &["rooms/a"]).await;
        assert_eq!(results, vec![key("rooms/a"), key("rooms/c")]);

        let full = fixture
            .run(&matching, SnapshotVersion::min(), &["rooms/a"])
            .await;
        assert_eq!(full, vec![key("rooms/a"), key("rooms/b"), key("rooms/c")]);
    }

    #[tokio::test]
    async fn limit_queries_refill_when_the_edge_changed() {
        let fixture = fixture("query-engine-refill");
        fixture
            .add(vec![
                (doc("rooms/a", 1, &[("n", 1i64.into())]), 10),
                (doc("rooms/b", 1, &[("n", 2i64.into())]), 10),
                (doc("rooms/c", 1, &[("n", 3i64.into())]), 10),
            ])
            .await;
        let limited = query("rooms")
            .with_filter(filter("n", ">", 0i64.into()))
            .with_order_by(OrderBy::ascending(field("n")))
            .with_limit_to_first(2);

        // Edge document unchanged: only documents read after version 10
        // are scanned, so rooms/c stays out.
        let reused = fixture
            .run(&limited, version(10), &["rooms/a", "rooms/b"])
            .await;
        assert_eq!(reused, vec![key("rooms/a"), key("rooms/b")]);

        // A remote key that no longer matches forces a full scan.
        fixture
            .add(vec![(doc("rooms/b", 30, &[("n", (-1i64).into())]), 30)])
            .await;
        let refilled = fixture
            .run(&limited, version(10), &["rooms/a", "rooms/b"])
            .await;
        assert_eq!(refilled, vec![key("rooms/a"), key("rooms/c")]);
    }

    #[test]
    fn refill_depends_on_the_limit_edge() {
        let engine = QueryEngine::new();
        let q = query("rooms").with_order_by(OrderBy::ascending(field("n")));
        let mut previous = DocumentSet::new(q.comparator());
        previous.add(doc("rooms/a", 1, &[("n", 1i64.into())]));
        previous.add(doc("rooms/b", 50, &[("n", 2i64.into())]));
        let keys: BTreeSet<DocumentKey> = [key("rooms/a"), key("rooms/b")].into_iter().collect();

        assert!(engine.needs_refill(LimitType::First, &previous, &keys, version(10)));
        assert!(!engine.needs_refill(LimitType::Last, &previous, &keys, version(10)));
        assert!(engine.needs_refill(
            LimitType::Last,
            &previous,
            &[key("rooms/a")].into_iter().collect(),
            version(10)
        ));
    }
}

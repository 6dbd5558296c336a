use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::Query;
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::kv_store::{KvTransaction, REMOTE_DOCUMENTS, REMOTE_DOCUMENT_GLOBAL};
use crate::firestore::local::local_serializer::{
    encode_child_prefix, encode_path, DbRemoteDocument, DbRemoteDocumentGlobal, LocalSerializer,
};
use crate::firestore::model::{Document, DocumentKey, MaybeDocument, SnapshotVersion};

const REMOTE_DOCUMENT_GLOBAL_KEY: &str = "remoteDocumentGlobalKey";

/// Documents as last seen from the backend (or as committed by an
/// acknowledged write), stamped with the read time of the change that
/// stored them. Tracks the total byte size of its entries for GC.
#[derive(Clone)]
pub struct RemoteDocumentCache {
    serializer: LocalSerializer,
    index_manager: IndexManager,
}

impl RemoteDocumentCache {
    pub fn new(serializer: LocalSerializer, index_manager: IndexManager) -> Self {
        Self {
            serializer,
            index_manager,
        }
    }

    /// Stores `maybe_doc`, replacing any previous entry for its key.
    pub fn add_entry(
        &self,
        txn: &mut KvTransaction<'_>,
        maybe_doc: &MaybeDocument,
        read_time: SnapshotVersion,
    ) -> FirestoreResult<()> {
        if read_time.is_min() {
            return Err(internal_error("Cannot add a document with a read time of zero"));
        }
        let key = maybe_doc.key();
        let row_key = encode_path(key.path());
        let previous_size = self.entry_size(txn, &row_key)?;
        let record = self.serializer.to_db_remote_document(maybe_doc, read_time);
        let size = record_size(&record)?;
        txn.put(REMOTE_DOCUMENTS, row_key, &record)?;
        self.index_manager
            .add_to_collection_parent_index(txn, &key.collection_path())?;
        self.adjust_size(txn, size - previous_size)
    }

    pub fn remove_entry(&self, txn: &mut KvTransaction<'_>, key: &DocumentKey) -> FirestoreResult<()> {
        let row_key = encode_path(key.path());
        let previous_size = self.entry_size(txn, &row_key)?;
        if previous_size == 0 {
            return Ok(());
        }
        txn.delete(REMOTE_DOCUMENTS, row_key)?;
        self.adjust_size(txn, -previous_size)
    }

    pub fn get_entry(
        &self,
        txn: &KvTransaction<'_>,
        key: &DocumentKey,
    ) -> FirestoreResult<Option<MaybeDocument>> {
        txn.get::<DbRemoteDocument>(REMOTE_DOCUMENTS, &encode_path(key.path()))?
            .map(|record| self.serializer.from_db_remote_document(&record))
            .transpose()
    }

    /// Entries for `keys`; keys without an entry map to `None`.
    pub fn get_entries(
        &self,
        txn: &KvTransaction<'_>,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Option<MaybeDocument>>> {
        keys.iter()
            .map(|key| Ok((key.clone(), self.get_entry(txn, key)?)))
            .collect()
    }

    /// Existing documents directly inside the query's collection that were
    /// read after `since_read_time` and match the query.
    pub fn get_documents_matching_query(
        &self,
        txn: &KvTransaction<'_>,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let collection = query.path();
        let child_depth = collection.len() + 1;
        let mut results = BTreeMap::new();
        let rows = txn.scan_prefix::<DbRemoteDocument>(REMOTE_DOCUMENTS, &encode_child_prefix(collection))?;
        for (_, record) in rows {
            if record.read_time_micros <= since_read_time.to_micros() {
                continue;
            }
            let Some(doc) = self
                .serializer
                .from_db_remote_document(&record)?
                .into_document()
            else {
                continue;
            };
            if doc.key().path().len() != child_depth || !query.matches(&doc) {
                continue;
            }
            results.insert(doc.key().clone(), doc);
        }
        Ok(results)
    }

    /// Every entry written after `since_read_time`, and the newest read time
    /// among them. Lets secondary clients catch up with the primary's writes.
    pub fn get_new_document_changes(
        &self,
        txn: &KvTransaction<'_>,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<(BTreeMap<DocumentKey, MaybeDocument>, SnapshotVersion)> {
        let mut changes = BTreeMap::new();
        let mut latest = since_read_time;
        for (_, record) in txn.scan_all::<DbRemoteDocument>(REMOTE_DOCUMENTS)? {
            let read_time = SnapshotVersion::from_micros(record.read_time_micros);
            if read_time <= since_read_time {
                continue;
            }
            let maybe_doc = self.serializer.from_db_remote_document(&record)?;
            changes.insert(maybe_doc.key().clone(), maybe_doc);
            latest = latest.max(read_time);
        }
        Ok((changes, latest))
    }

    /// Newest read time of any entry.
    pub fn get_latest_read_time(&self, txn: &KvTransaction<'_>) -> FirestoreResult<SnapshotVersion> {
        Ok(txn
            .scan_all::<DbRemoteDocument>(REMOTE_DOCUMENTS)?
            .into_iter()
            .map(|(_, record)| SnapshotVersion::from_micros(record.read_time_micros))
            .max()
            .unwrap_or_else(SnapshotVersion::min))
    }

    /// Approximate byte size of all entries.
    pub fn get_size(&self, txn: &KvTransaction<'_>) -> FirestoreResult<i64> {
        Ok(txn
            .get::<DbRemoteDocumentGlobal>(REMOTE_DOCUMENT_GLOBAL, REMOTE_DOCUMENT_GLOBAL_KEY)?
            .unwrap_or_default()
            .byte_size)
    }

    fn entry_size(&self, txn: &KvTransaction<'_>, row_key: &str) -> FirestoreResult<i64> {
        match txn.get::<DbRemoteDocument>(REMOTE_DOCUMENTS, row_key)? {
            Some(record) => record_size(&record),
            None => Ok(0),
        }
    }

    fn adjust_size(&self, txn: &mut KvTransaction<'_>, delta: i64) -> FirestoreResult<()> {
        if delta == 0 {
            return Ok(());
        }
        let mut global = txn
            .get::<DbRemoteDocumentGlobal>(REMOTE_DOCUMENT_GLOBAL, REMOTE_DOCUMENT_GLOBAL_KEY)?
            .unwrap_or_default();
        global.byte_size = (global.byte_size + delta).max(0);
        txn.put(REMOTE_DOCUMENT_GLOBAL, REMOTE_DOCUMENT_GLOBAL_KEY, &global)
    }
}

fn record_size(record: &DbRemoteDocument) -> FirestoreResult<i64> {
    serde_json::to_vec(record)
        .map(|bytes| bytes.len() as i64)
        .map_err(|err| internal_error(format!("Failed to size remote document: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::kv_store::{KvStore, TransactionMode};
    use crate::firestore::model::DatabaseId;
    use crate::firestore::remote::serializer::JsonProtoSerializer;
    use crate::firestore::test_support::{deleted, doc, filter, key, query, version};

    fn cache() -> RemoteDocumentCache {
        RemoteDocumentCache::new(
            LocalSerializer::new(JsonProtoSerializer::new(DatabaseId::new("p", "(default)"))),
            IndexManager::new(),
        )
    }

    #[tokio::test]
    async fn entries_round_trip_and_track_size() {
        let store = KvStore::open("remote-document-cache-size");
        let cache = cache();
        let a: MaybeDocument = doc("rooms/a", 1, &[("n", 1i64.into())]).into();
        let (entry, missing, size) = store
            .run(TransactionMode::ReadWrite, |txn| {
                cache.add_entry(txn, &a, version(1))?;
                Ok((
                    cache.get_entry(txn, &key("rooms/a"))?,
                    cache.get_entry(txn, &key("rooms/b"))?,
                    cache.get_size(txn)?,
                ))
            })
            .await
            .unwrap();
        assert_eq!(entry, Some(a));
        assert_eq!(missing, None);
        assert!(size > 0);

        let size_after_remove = store
            .run(TransactionMode::ReadWrite, |txn| {
                cache.remove_entry(txn, &key("rooms/a"))?;
                cache.get_size(txn)
            })
            .await
            .unwrap();
        assert_eq!(size_after_remove, 0);
    }

    #[tokio::test]
    async fn collection_scans_skip_nested_and_deleted_documents() {
        let store = KvStore::open("remote-document-cache-scan");
        let cache = cache();
        let entries: Vec<MaybeDocument> = vec![
            doc("rooms/a", 1, &[("n", 1i64.into())]).into(),
            doc("rooms/b", 1, &[("n", 2i64.into())]).into(),
            doc("rooms/a/messages/m", 1, &[("n", 1i64.into())]).into(),
            deleted("rooms/c", 1),
            doc("roomsx/d", 1, &[("n", 1i64.into())]).into(),
        ];
        store
            .run(TransactionMode::ReadWrite, |txn| {
                for (index, entry) in entries.iter().enumerate() {
                    cache.add_entry(txn, entry, version(10 + index as i64))?;
                }
                Ok(())
            })
            .await
            .unwrap();

        let (all, filtered, recent) = store
            .run(TransactionMode::ReadOnly, |txn| {
                Ok((
                    cache.get_documents_matching_query(txn, &query("rooms"), SnapshotVersion::min())?,
                    cache.get_documents_matching_query(
                        txn,
                        &query("rooms").with_filter(filter("n", "==", 2i64.into())),
                        SnapshotVersion::min(),
                    )?,
                    cache.get_documents_matching_query(txn, &query("rooms"), version(10))?,
                ))
            })
            .await
            .unwrap();
        assert_eq!(all.keys().cloned().collect::<Vec<_>>(), vec![key("rooms/a"), key("rooms/b")]);
        assert_eq!(filtered.keys().cloned().collect::<Vec<_>>(), vec![key("rooms/b")]);
        assert_eq!(recent.keys().cloned().collect::<Vec<_>>(), vec![key("rooms/b")]);
    }

    #[tokio::test]
    async fn new_document_changes_follow_read_time() {
        let store = KvStore::open("remote-document-cache-changes");
        let cache = cache();
        store
            .run(TransactionMode::ReadWrite, |txn| {
                cache.add_entry(txn, &doc("rooms/a", 1, &[]).into(), version(5))?;
                cache.add_entry(txn, &deleted("rooms/b", 2), version(7))
            })
            .await
            .unwrap();
        let ((changes, latest), newest) = store
            .run(TransactionMode::ReadOnly, |txn| {
                Ok((
                    cache.get_new_document_changes(txn, version(5))?,
                    cache.get_latest_read_time(txn)?,
                ))
            })
            .await
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert!(changes.contains_key(&key("rooms/b")));
        assert_eq!(latest, version(7));
        assert_eq!(newest, version(7));
    }
}

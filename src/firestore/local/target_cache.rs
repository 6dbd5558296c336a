use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::listen_sequence::ListenSequenceNumber;
use crate::firestore::core::target::Target;
use crate::firestore::core::target_id_generator::TargetIdGenerator;
use crate::firestore::core::types::TargetId;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::kv_store::{
    composite_key, id_key, DOCUMENT_TARGETS, KEY_SEPARATOR, TARGETS, TARGETS_BY_CANONICAL_ID,
    TARGET_DOCUMENTS, TARGET_GLOBAL,
};
use crate::firestore::local::local_serializer::{
    decode_key, encode_path, DbTarget, DbTargetDocument, DbTargetGlobal, LocalSerializer,
};
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{DocumentKey, SnapshotVersion};

const TARGET_GLOBAL_KEY: &str = "targetGlobalKey";

/// Target id of the rows that record a document's last access sequence
/// number rather than a target membership.
pub const SENTINEL_TARGET_ID: TargetId = 0;

fn target_key(target_id: TargetId) -> String {
    id_key(target_id as i64)
}

fn target_document_key(target_id: TargetId, key: &DocumentKey) -> String {
    composite_key([target_key(target_id), encode_path(key.path())])
}

fn document_target_key(key: &DocumentKey, target_id: TargetId) -> String {
    composite_key([encode_path(key.path()), target_key(target_id)])
}

fn document_prefix(key: &DocumentKey) -> String {
    let mut prefix = encode_path(key.path());
    prefix.push(KEY_SEPARATOR);
    prefix
}

fn target_prefix(target_id: TargetId) -> String {
    let mut prefix = target_key(target_id);
    prefix.push(KEY_SEPARATOR);
    prefix
}

/// Persisted targets, the documents each target matched as of its last
/// remote event, and the global target metadata.
///
/// Document membership is stored twice: by target (to read a target's
/// documents) and by document (to find documents no target references).
/// Rows under [`SENTINEL_TARGET_ID`] carry the sequence number of a
/// document's last use for LRU garbage collection.
#[derive(Clone)]
pub struct TargetCache {
    serializer: LocalSerializer,
}

impl TargetCache {
    pub fn new(serializer: LocalSerializer) -> Self {
        Self { serializer }
    }

    pub fn get_metadata(&self, txn: &PersistenceTransaction<'_, '_>) -> FirestoreResult<DbTargetGlobal> {
        Ok(txn
            .get::<DbTargetGlobal>(TARGET_GLOBAL, TARGET_GLOBAL_KEY)?
            .unwrap_or_default())
    }

    fn save_metadata(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        metadata: &DbTargetGlobal,
    ) -> FirestoreResult<()> {
        txn.put(TARGET_GLOBAL, TARGET_GLOBAL_KEY, metadata)
    }

    pub fn get_highest_sequence_number(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
    ) -> FirestoreResult<ListenSequenceNumber> {
        Ok(self.get_metadata(txn)?.highest_listen_sequence_number)
    }

    pub fn get_last_remote_snapshot_version(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
    ) -> FirestoreResult<SnapshotVersion> {
        Ok(SnapshotVersion::from_micros(
            self.get_metadata(txn)?.last_remote_snapshot_version_micros,
        ))
    }

    /// Records the version of the last applied remote event. Also bumps the
    /// highest sequence number.
    pub fn set_target_metadata(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        highest_sequence_number: ListenSequenceNumber,
        last_remote_snapshot_version: Option<SnapshotVersion>,
    ) -> FirestoreResult<()> {
        let mut metadata = self.get_metadata(txn)?;
        metadata.highest_listen_sequence_number = highest_sequence_number;
        if let Some(version) = last_remote_snapshot_version {
            metadata.last_remote_snapshot_version_micros = version.to_micros();
        }
        self.save_metadata(txn, &metadata)
    }

    /// Next even target id after the highest one handed out.
    pub fn allocate_target_id(&self, txn: &mut PersistenceTransaction<'_, '_>) -> FirestoreResult<TargetId> {
        let mut metadata = self.get_metadata(txn)?;
        let target_id = TargetIdGenerator::for_target_cache(metadata.highest_target_id).next();
        metadata.highest_target_id = target_id;
        self.save_metadata(txn, &metadata)?;
        Ok(target_id)
    }

    pub fn get_target_count(&self, txn: &PersistenceTransaction<'_, '_>) -> FirestoreResult<i64> {
        Ok(self.get_metadata(txn)?.target_count)
    }

    pub fn add_target_data(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        target_data: &TargetData,
    ) -> FirestoreResult<()> {
        self.save_target_data(txn, target_data)?;
        let mut metadata = self.get_metadata(txn)?;
        metadata.target_count += 1;
        Self::update_metadata_from_target_data(&mut metadata, target_data);
        self.save_metadata(txn, &metadata)
    }

    pub fn update_target_data(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        target_data: &TargetData,
    ) -> FirestoreResult<()> {
        self.save_target_data(txn, target_data)?;
        let mut metadata = self.get_metadata(txn)?;
        if Self::update_metadata_from_target_data(&mut metadata, target_data) {
            self.save_metadata(txn, &metadata)?;
        }
        Ok(())
    }

    /// Removes the target and its document associations.
    pub fn remove_target_data(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        target_data: &TargetData,
    ) -> FirestoreResult<()> {
        self.remove_matching_keys_for_target_id(txn, target_data.target_id)?;
        self.delete_target_row(txn, target_data.target_id, &target_data.target.canonical_id())?;
        let mut metadata = self.get_metadata(txn)?;
        metadata.target_count = (metadata.target_count - 1).max(0);
        self.save_metadata(txn, &metadata)
    }

    /// Removes every target with a sequence number at or below
    /// `upper_bound` that is not in `active_target_ids`, along with its
    /// document associations. Returns how many were removed.
    pub fn remove_targets(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> FirestoreResult<usize> {
        let doomed: Vec<DbTarget> = txn
            .scan_all::<DbTarget>(TARGETS)?
            .into_iter()
            .map(|(_, record)| record)
            .filter(|record| {
                record.last_listen_sequence_number <= upper_bound
                    && !active_target_ids.contains(&record.target_id)
            })
            .collect();
        for record in &doomed {
            self.remove_matching_keys_for_target_id(txn, record.target_id)?;
            self.delete_target_row(txn, record.target_id, &record.canonical_id)?;
        }
        if !doomed.is_empty() {
            let mut metadata = self.get_metadata(txn)?;
            metadata.target_count = (metadata.target_count - doomed.len() as i64).max(0);
            self.save_metadata(txn, &metadata)?;
        }
        Ok(doomed.len())
    }

    pub fn get_all_targets(&self, txn: &PersistenceTransaction<'_, '_>) -> FirestoreResult<Vec<TargetData>> {
        txn.scan_all::<DbTarget>(TARGETS)?
            .iter()
            .map(|(_, record)| self.serializer.from_db_target(record))
            .collect()
    }

    /// The cached data for `target`, if it was ever listened to.
    pub fn get_target_data(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        target: &Target,
    ) -> FirestoreResult<Option<TargetData>> {
        let mut prefix = target.canonical_id();
        prefix.push(KEY_SEPARATOR);
        for (_, target_id) in txn.scan_prefix::<TargetId>(TARGETS_BY_CANONICAL_ID, &prefix)? {
            if let Some(target_data) = self.get_target_data_for_target_id(txn, target_id)? {
                // Canonical ids can collide; compare the full target.
                if &target_data.target == target {
                    return Ok(Some(target_data));
                }
            }
        }
        Ok(None)
    }

    pub fn get_target_data_for_target_id(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        target_id: TargetId,
    ) -> FirestoreResult<Option<TargetData>> {
        txn.get::<DbTarget>(TARGETS, &target_key(target_id))?
            .map(|record| self.serializer.from_db_target(&record))
            .transpose()
    }

    pub fn add_matching_keys(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        keys: &BTreeSet<DocumentKey>,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        for key in keys {
            let row = DbTargetDocument {
                target_id,
                path: encode_path(key.path()),
                sequence_number: None,
            };
            txn.put(TARGET_DOCUMENTS, target_document_key(target_id, key), &row)?;
            txn.put(DOCUMENT_TARGETS, document_target_key(key, target_id), &row)?;
            self.update_sentinel(txn, key)?;
        }
        Ok(())
    }

    pub fn remove_matching_keys(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        keys: &BTreeSet<DocumentKey>,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        for key in keys {
            txn.delete(TARGET_DOCUMENTS, target_document_key(target_id, key))?;
            txn.delete(DOCUMENT_TARGETS, document_target_key(key, target_id))?;
            self.update_sentinel(txn, key)?;
        }
        Ok(())
    }

    pub fn remove_matching_keys_for_target_id(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        let rows = txn.scan_prefix::<DbTargetDocument>(TARGET_DOCUMENTS, &target_prefix(target_id))?;
        for (row_key, row) in rows {
            txn.delete(TARGET_DOCUMENTS, row_key)?;
            txn.delete(
                DOCUMENT_TARGETS,
                composite_key([row.path.as_str(), target_key(target_id).as_str()]),
            )?;
        }
        Ok(())
    }

    pub fn get_matching_keys_for_target_id(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        target_id: TargetId,
    ) -> FirestoreResult<BTreeSet<DocumentKey>> {
        txn.scan_prefix::<DbTargetDocument>(TARGET_DOCUMENTS, &target_prefix(target_id))?
            .into_iter()
            .map(|(_, row)| decode_key(&row.path))
            .collect()
    }

    /// Whether any target (sentinel rows aside) references `key`.
    pub fn contains_key(&self, txn: &PersistenceTransaction<'_, '_>, key: &DocumentKey) -> FirestoreResult<bool> {
        Ok(txn
            .scan_prefix::<DbTargetDocument>(DOCUMENT_TARGETS, &document_prefix(key))?
            .into_iter()
            .any(|(_, row)| row.target_id != SENTINEL_TARGET_ID))
    }

    /// Marks `key` as used at the transaction's sequence number.
    pub fn update_sentinel(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        let row = DbTargetDocument {
            target_id: SENTINEL_TARGET_ID,
            path: encode_path(key.path()),
            sequence_number: Some(txn.current_sequence_number()),
        };
        txn.put(TARGET_DOCUMENTS, target_document_key(SENTINEL_TARGET_ID, key), &row)?;
        txn.put(DOCUMENT_TARGETS, document_target_key(key, SENTINEL_TARGET_ID), &row)
    }

    pub fn remove_sentinel(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        txn.delete(TARGET_DOCUMENTS, target_document_key(SENTINEL_TARGET_ID, key))?;
        txn.delete(DOCUMENT_TARGETS, document_target_key(key, SENTINEL_TARGET_ID))
    }

    /// Documents with a sentinel row but no target membership, with the
    /// sequence number of their last use.
    pub fn get_orphaned_documents(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
    ) -> FirestoreResult<Vec<(DocumentKey, ListenSequenceNumber)>> {
        let mut by_path: BTreeMap<String, (Option<ListenSequenceNumber>, bool)> = BTreeMap::new();
        for (_, row) in txn.scan_all::<DbTargetDocument>(DOCUMENT_TARGETS)? {
            let entry = by_path.entry(row.path).or_insert((None, false));
            if row.target_id == SENTINEL_TARGET_ID {
                entry.0 = row.sequence_number;
            } else {
                entry.1 = true;
            }
        }
        by_path
            .into_iter()
            .filter_map(|(path, (sequence_number, referenced))| match (sequence_number, referenced) {
                (Some(sequence_number), false) => Some((path, sequence_number)),
                _ => None,
            })
            .map(|(path, sequence_number)| Ok((decode_key(&path)?, sequence_number)))
            .collect()
    }

    fn save_target_data(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        target_data: &TargetData,
    ) -> FirestoreResult<()> {
        let record = self.serializer.to_db_target(target_data);
        txn.put(
            TARGETS_BY_CANONICAL_ID,
            composite_key([record.canonical_id.as_str(), target_key(record.target_id).as_str()]),
            &record.target_id,
        )?;
        txn.put(TARGETS, target_key(record.target_id), &record)
    }

    fn delete_target_row(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        target_id: TargetId,
        canonical_id: &str,
    ) -> FirestoreResult<()> {
        txn.delete(TARGETS, target_key(target_id))?;
        txn.delete(
            TARGETS_BY_CANONICAL_ID,
            composite_key([canonical_id, target_key(target_id).as_str()]),
        )
    }

    fn update_metadata_from_target_data(metadata: &mut DbTargetGlobal, target_data: &TargetData) -> bool {
        let mut updated = false;
        if target_data.target_id > metadata.highest_target_id {
            metadata.highest_target_id = target_data.target_id;
            updated = true;
        }
        if target_data.sequence_number > metadata.highest_listen_sequence_number {
            metadata.highest_listen_sequence_number = target_data.sequence_number;
            updated = true;
        }
        updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::async_queue::AsyncQueue;
    use crate::firestore::local::kv_store::TransactionMode;
    use crate::firestore::local::persistence::Persistence;
    use crate::firestore::model::DatabaseId;
    use crate::firestore::settings::ClientConfig;
    use crate::firestore::test_support::{key, query, target_data, version};
    use std::sync::Arc;

    async fn persistence(name: &str) -> Arc<Persistence> {
        let config = ClientConfig::new(DatabaseId::new("p", "(default)"), name);
        let persistence = Persistence::new(&config, AsyncQueue::new());
        persistence.start().await.unwrap();
        persistence
    }

    fn keys(paths: &[&str]) -> BTreeSet<DocumentKey> {
        paths.iter().map(|path| key(path)).collect()
    }

    #[tokio::test]
    async fn targets_are_found_by_query() {
        let persistence = persistence("target-cache-lookup").await;
        let cache = persistence.target_cache().clone();
        let rooms = query("rooms");
        let data = target_data(2, &rooms, 10).with_resume_token(vec![7], version(100));
        let found = persistence
            .run_transaction("test", TransactionMode::ReadWrite, |txn| {
                cache.add_target_data(txn, &data)?;
                cache.get_target_data(txn, &rooms.to_target())
            })
            .await
            .unwrap();
        assert_eq!(found, Some(data.clone()));

        let (missing, count, highest) = persistence
            .run_transaction("test", TransactionMode::ReadOnly, |txn| {
                Ok((
                    cache.get_target_data(txn, &query("users").to_target())?,
                    cache.get_target_count(txn)?,
                    cache.get_highest_sequence_number(txn)?,
                ))
            })
            .await
            .unwrap();
        assert_eq!(missing, None);
        assert_eq!(count, 1);
        assert_eq!(highest, 10);
        persistence.shutdown().await;
    }

    #[tokio::test]
    async fn allocated_ids_stay_even_and_increase() {
        let persistence = persistence("target-cache-ids").await;
        let cache = persistence.target_cache().clone();
        let ids = persistence
            .run_transaction("test", TransactionMode::ReadWrite, |txn| {
                Ok((cache.allocate_target_id(txn)?, cache.allocate_target_id(txn)?))
            })
            .await
            .unwrap();
        assert_eq!(ids, (2, 4));
        persistence.shutdown().await;
    }

    #[tokio::test]
    async fn matching_keys_and_orphans() {
        let persistence = persistence("target-cache-keys").await;
        let cache = persistence.target_cache().clone();
        let data = target_data(2, &query("rooms"), 1);
        persistence
            .run_transaction("test", TransactionMode::ReadWrite, |txn| {
                cache.add_target_data(txn, &data)?;
                cache.add_matching_keys(txn, &keys(&["rooms/a", "rooms/b"]), 2)?;
                cache.remove_matching_keys(txn, &keys(&["rooms/b"]), 2)
            })
            .await
            .unwrap();

        let (matching, contains_a, contains_b, orphans) = persistence
            .run_transaction("test", TransactionMode::ReadOnly, |txn| {
                Ok((
                    cache.get_matching_keys_for_target_id(txn, 2)?,
                    cache.contains_key(txn, &key("rooms/a"))?,
                    cache.contains_key(txn, &key("rooms/b"))?,
                    cache.get_orphaned_documents(txn)?,
                ))
            })
            .await
            .unwrap();
        assert_eq!(matching, keys(&["rooms/a"]));
        assert!(contains_a);
        assert!(!contains_b);
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].0, key("rooms/b"));
        persistence.shutdown().await;
    }

    #[tokio::test]
    async fn remove_targets_spares_active_ones() {
        let persistence = persistence("target-cache-remove").await;
        let cache = persistence.target_cache().clone();
        persistence
            .run_transaction("test", TransactionMode::ReadWrite, |txn| {
                cache.add_target_data(txn, &target_data(2, &query("a"), 1))?;
                cache.add_target_data(txn, &target_data(4, &query("b"), 2))?;
                cache.add_target_data(txn, &target_data(6, &query("c"), 9))?;
                cache.add_matching_keys(txn, &keys(&["a/1"]), 2)
            })
            .await
            .unwrap();
        let active: BTreeSet<TargetId> = [4].into_iter().collect();
        let removed = persistence
            .run_transaction("test", TransactionMode::ReadWrite, |txn| {
                cache.remove_targets(txn, 5, &active)
            })
            .await
            .unwrap();
        assert_eq!(removed, 1);
        let (remaining, count, matching) = persistence
            .run_transaction("test", TransactionMode::ReadOnly, |txn| {
                Ok((
                    cache.get_all_targets(txn)?,
                    cache.get_target_count(txn)?,
                    cache.get_matching_keys_for_target_id(txn, 2)?,
                ))
            })
            .await
            .unwrap();
        let ids: Vec<TargetId> = remaining.iter().map(|data| data.target_id).collect();
        assert_eq!(ids, vec![4, 6]);
        assert_eq!(count, 2);
        assert!(matching.is_empty());
        persistence.shutdown().await;
    }
}
